use crate::error::SupervisorError;
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 33445;
pub const DEFAULT_PORT_ENV_VAR: &str = "PORT";
pub const DEFAULT_BACKEND_EXECUTABLE: &str = "./shamble-grpc.AppImage";

pub const ENV_BACKEND_EXECUTABLE: &str = "SHAMBLE_BACKEND_EXECUTABLE";
pub const ENV_BACKEND_HOST: &str = "SHAMBLE_BACKEND_HOST";
pub const ENV_BACKEND_PORT: &str = "SHAMBLE_BACKEND_PORT";
pub const ENV_READINESS_MODE: &str = "SHAMBLE_READINESS_MODE";

/// Address of the backend service
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new(DEFAULT_HOST, DEFAULT_PORT)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// What counts as "ready" once the backend process has been spawned
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReadinessMode {
    /// The process is still alive after its first output line (or line timeout)
    #[default]
    Liveness,
    /// The process is alive and the endpoint accepts TCP connections
    PortBound,
}

impl std::str::FromStr for ReadinessMode {
    type Err = SupervisorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "liveness" => Ok(ReadinessMode::Liveness),
            "portbound" | "port-bound" | "port_bound" => Ok(ReadinessMode::PortBound),
            other => Err(SupervisorError::Configuration(format!(
                "unknown readiness mode {other:?} (expected liveness or port-bound)"
            ))),
        }
    }
}

/// Attempt budget for waiting on a freshly spawned backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessConfig {
    /// Total number of liveness checks before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay between attempts (in milliseconds)
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Upper bound on waiting for the next output line (in milliseconds)
    #[serde(default = "default_line_timeout_ms")]
    pub line_timeout_ms: u64,

    #[serde(default)]
    pub mode: ReadinessMode,

    /// Number of trailing output lines kept for diagnostics
    #[serde(default = "default_recent_output_lines")]
    pub recent_output_lines: usize,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            interval_ms: default_interval_ms(),
            line_timeout_ms: default_line_timeout_ms(),
            mode: ReadinessMode::default(),
            recent_output_lines: default_recent_output_lines(),
        }
    }
}

impl ReadinessConfig {
    /// Budget for slow machines: 30 attempts, 1s apart, port must be bound
    pub fn patient() -> Self {
        Self {
            max_attempts: 30,
            interval_ms: 1_000,
            line_timeout_ms: 1_000,
            mode: ReadinessMode::PortBound,
            ..Default::default()
        }
    }

    /// Single check, no waiting between attempts
    pub fn fail_fast() -> Self {
        Self {
            max_attempts: 1,
            interval_ms: 0,
            line_timeout_ms: 100,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), SupervisorError> {
        if self.max_attempts == 0 {
            return Err(SupervisorError::Configuration(
                "max_attempts must be at least 1".to_string(),
            ));
        }

        if self.max_attempts > 100 {
            return Err(SupervisorError::Configuration(
                "max_attempts should not exceed 100".to_string(),
            ));
        }

        if self.interval_ms > 60_000 {
            return Err(SupervisorError::Configuration(
                "interval_ms should not exceed 60 seconds".to_string(),
            ));
        }

        if self.line_timeout_ms > 60_000 {
            return Err(SupervisorError::Configuration(
                "line_timeout_ms should not exceed 60 seconds".to_string(),
            ));
        }

        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn line_timeout(&self) -> Duration {
        Duration::from_millis(self.line_timeout_ms)
    }
}

/// Everything needed to spawn the backend once
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_directory: Option<PathBuf>,
}

impl LaunchSpec {
    /// Display name used in logs
    pub fn display_name(&self) -> String {
        self.executable.display().to_string()
    }
}

/// Supervisor configuration, immutable once the supervisor is built
#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
#[builder(setter(into, strip_option))]
#[serde(rename_all = "camelCase")]
pub struct SupervisorConfig {
    #[builder(default)]
    #[serde(default)]
    pub endpoint: Endpoint,

    #[builder(default = "PathBuf::from(DEFAULT_BACKEND_EXECUTABLE)")]
    #[serde(default = "default_executable")]
    pub executable: PathBuf,

    #[builder(default)]
    #[builder(setter(custom))]
    #[serde(default)]
    pub args: Vec<String>,

    #[builder(default)]
    #[builder(setter(custom))]
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Environment variable that tells the backend which port to bind
    #[builder(default = "DEFAULT_PORT_ENV_VAR.to_string()")]
    #[serde(default = "default_port_env_var")]
    pub port_env_var: String,

    #[builder(default)]
    #[serde(default)]
    pub working_directory: Option<PathBuf>,

    /// Upper bound on a single probe connection attempt (in milliseconds)
    #[builder(default = "default_probe_timeout_ms()")]
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Time a terminated backend gets to exit before it is force killed
    #[builder(default = "default_termination_grace_ms()")]
    #[serde(default = "default_termination_grace_ms")]
    pub termination_grace_ms: u64,

    #[builder(default)]
    #[serde(default)]
    pub readiness: ReadinessConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::default(),
            executable: default_executable(),
            args: Vec::new(),
            env: HashMap::new(),
            port_env_var: default_port_env_var(),
            working_directory: None,
            probe_timeout_ms: default_probe_timeout_ms(),
            termination_grace_ms: default_termination_grace_ms(),
            readiness: ReadinessConfig::default(),
        }
    }
}

impl SupervisorConfig {
    pub fn builder() -> SupervisorConfigBuilder {
        SupervisorConfigBuilder::default()
    }

    pub fn from_json_str(json: &str) -> Result<Self, SupervisorError> {
        let config: SupervisorConfig = serde_json::from_str(json)
            .map_err(|e| SupervisorError::Configuration(format!("invalid config JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SupervisorError> {
        if self.endpoint.host.trim().is_empty() {
            return Err(SupervisorError::Configuration(
                "endpoint host must not be empty".to_string(),
            ));
        }

        if self.endpoint.port == 0 {
            return Err(SupervisorError::Configuration(
                "endpoint port must be non-zero".to_string(),
            ));
        }

        if self.executable.as_os_str().is_empty() {
            return Err(SupervisorError::Configuration(
                "backend executable path must not be empty".to_string(),
            ));
        }

        if self.port_env_var.is_empty() || self.port_env_var.contains('=') {
            return Err(SupervisorError::Configuration(format!(
                "invalid port environment variable name {:?}",
                self.port_env_var
            )));
        }

        self.readiness.validate()
    }

    /// Apply `SHAMBLE_BACKEND_*` overrides from an arbitrary variable source
    pub fn apply_overrides<F>(mut self, lookup: F) -> Result<Self, SupervisorError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(executable) = lookup(ENV_BACKEND_EXECUTABLE) {
            self.executable = PathBuf::from(executable);
        }

        if let Some(host) = lookup(ENV_BACKEND_HOST) {
            self.endpoint.host = host;
        }

        if let Some(port) = lookup(ENV_BACKEND_PORT) {
            self.endpoint.port = port.trim().parse().map_err(|e| {
                SupervisorError::Configuration(format!("{ENV_BACKEND_PORT}={port:?}: {e}"))
            })?;
        }

        if let Some(mode) = lookup(ENV_READINESS_MODE) {
            self.readiness.mode = mode.parse()?;
        }

        self.validate()?;
        Ok(self)
    }

    /// Apply overrides from the current process environment
    pub fn with_process_env(self) -> Result<Self, SupervisorError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Build the spawn request, injecting the bind port for the backend
    pub fn launch_spec(&self) -> LaunchSpec {
        let mut env = self.env.clone();
        env.insert(self.port_env_var.clone(), self.endpoint.port.to_string());

        LaunchSpec {
            executable: self.executable.clone(),
            args: self.args.clone(),
            env,
            working_directory: self.working_directory.clone(),
        }
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn termination_grace(&self) -> Duration {
        Duration::from_millis(self.termination_grace_ms)
    }
}

impl SupervisorConfigBuilder {
    pub fn args<S: ToString, I: IntoIterator<Item = S>>(&mut self, iter: I) -> &mut Self {
        let args: Vec<String> = iter.into_iter().map(|s| s.to_string()).collect();
        self.args = Some(args);
        self
    }

    pub fn env<T: ToString>(&mut self, key: T, value: T) -> &mut Self {
        let map = self.env.get_or_insert_with(HashMap::new);
        map.insert(key.to_string(), value.to_string());

        self
    }

    pub fn env_multi<T: ToString, I: IntoIterator<Item = (T, T)>>(&mut self, iter: I) -> &mut Self {
        let env = self.env.get_or_insert_with(HashMap::new);
        for (key, value) in iter {
            env.insert(key.to_string(), value.to_string());
        }
        self
    }
}

// Default value functions for serde
fn default_max_attempts() -> u32 {
    10
}
fn default_interval_ms() -> u64 {
    500
}
fn default_line_timeout_ms() -> u64 {
    500
}
fn default_recent_output_lines() -> usize {
    50
}
fn default_executable() -> PathBuf {
    PathBuf::from(DEFAULT_BACKEND_EXECUTABLE)
}
fn default_port_env_var() -> String {
    DEFAULT_PORT_ENV_VAR.to_string()
}
fn default_probe_timeout_ms() -> u64 {
    250
}
fn default_termination_grace_ms() -> u64 {
    2_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SupervisorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.endpoint.to_string(), "127.0.0.1:33445");
        assert_eq!(config.readiness.max_attempts, 10);
        assert_eq!(config.readiness.interval(), Duration::from_millis(500));
        assert_eq!(config.readiness.mode, ReadinessMode::Liveness);
    }

    #[test]
    fn test_builder_matches_defaults() {
        let built = SupervisorConfig::builder().build().unwrap();
        assert_eq!(built, SupervisorConfig::default());
    }

    #[test]
    fn test_launch_spec_injects_port() {
        let config = SupervisorConfig::builder()
            .endpoint(Endpoint::new("127.0.0.1", 42147))
            .executable("/opt/shamble/backend")
            .args(["--quiet"])
            .env("RUST_LOG", "debug")
            .build()
            .unwrap();

        let spec = config.launch_spec();
        assert_eq!(spec.executable, PathBuf::from("/opt/shamble/backend"));
        assert_eq!(spec.args, vec!["--quiet".to_string()]);
        assert_eq!(spec.env.get("PORT").map(String::as_str), Some("42147"));
        assert_eq!(spec.env.get("RUST_LOG").map(String::as_str), Some("debug"));
    }

    #[test]
    fn test_port_env_var_wins_over_explicit_env() {
        let config = SupervisorConfig::builder()
            .env("PORT", "1")
            .port_env_var("PORT")
            .build()
            .unwrap();
        assert_eq!(
            config.launch_spec().env.get("PORT").map(String::as_str),
            Some("33445")
        );
    }

    #[test]
    fn test_invalid_config() {
        let mut config = SupervisorConfig {
            endpoint: Endpoint::new("127.0.0.1", 0),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config.endpoint.port = 33445;
        config.readiness.max_attempts = 0;
        assert!(config.validate().is_err());

        config.readiness.max_attempts = 10;
        config.port_env_var = "PO=RT".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_readiness_presets_are_valid() {
        assert!(ReadinessConfig::patient().validate().is_ok());
        assert!(ReadinessConfig::fail_fast().validate().is_ok());
        assert_eq!(ReadinessConfig::fail_fast().max_attempts, 1);
        assert_eq!(ReadinessConfig::patient().mode, ReadinessMode::PortBound);
    }

    #[test]
    fn test_overrides() {
        let config = SupervisorConfig::default()
            .apply_overrides(|key| match key {
                ENV_BACKEND_EXECUTABLE => Some("/usr/local/bin/shamble-grpc".to_string()),
                ENV_BACKEND_PORT => Some(" 42147 ".to_string()),
                ENV_READINESS_MODE => Some("port-bound".to_string()),
                _ => None,
            })
            .unwrap();

        assert_eq!(config.executable, PathBuf::from("/usr/local/bin/shamble-grpc"));
        assert_eq!(config.endpoint, Endpoint::new("127.0.0.1", 42147));
        assert_eq!(config.readiness.mode, ReadinessMode::PortBound);
    }

    #[test]
    fn test_bad_port_override() {
        let result = SupervisorConfig::default().apply_overrides(|key| {
            (key == ENV_BACKEND_PORT).then(|| "not-a-port".to_string())
        });
        assert!(matches!(result, Err(SupervisorError::Configuration(_))));
    }

    #[test]
    fn test_json_with_defaults() {
        let config = SupervisorConfig::from_json_str(
            r#"{"executable": "/opt/backend", "readiness": {"mode": "portBound"}}"#,
        )
        .unwrap();

        assert_eq!(config.executable, PathBuf::from("/opt/backend"));
        assert_eq!(config.endpoint, Endpoint::default());
        assert_eq!(config.readiness.mode, ReadinessMode::PortBound);
        assert_eq!(config.readiness.max_attempts, 10);
        assert_eq!(config.port_env_var, "PORT");

        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"portEnvVar\":\"PORT\""));
    }

    #[test]
    fn test_json_rejects_invalid() {
        assert!(SupervisorConfig::from_json_str(r#"{"endpoint": {"host": "", "port": 1}}"#).is_err());
        assert!(SupervisorConfig::from_json_str("not json").is_err());
    }
}
