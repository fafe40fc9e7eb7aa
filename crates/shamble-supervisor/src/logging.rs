use std::str::FromStr;
use tracing_subscriber::EnvFilter;

/// Variable selecting the log output format (`pretty` or `json`)
pub const ENV_LOG_FORMAT: &str = "SHAMBLE_LOG_FORMAT";

/// Output format of the tracing subscriber
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl LogFormat {
    /// Read the format from `SHAMBLE_LOG_FORMAT`, falling back to pretty output
    pub fn from_env() -> Self {
        std::env::var(ENV_LOG_FORMAT)
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or_default()
    }
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(anyhow::anyhow!("unknown log format {other:?}")),
        }
    }
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` controls filtering and defaults to `info`. Backend output lines
/// are logged at debug under the `shamble_backend` target, so
/// `RUST_LOG=info,shamble_backend=debug` shows them.
pub fn init_tracing(format: LogFormat) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_line_number(true);

    match format {
        LogFormat::Pretty => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    }
    .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))
}
