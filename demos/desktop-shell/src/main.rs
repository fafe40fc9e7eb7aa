//! Minimal desktop-shell composition root.
//!
//! Starts backend supervision without blocking, follows the supervisor state
//! the way a UI status bar would, connects a client once the backend is
//! reachable and shuts the backend down on Ctrl+C.

use anyhow::Result;
use async_trait::async_trait;
use shamble_supervisor::{
    ClientConnector, Endpoint, LogFormat, PlatformSupervisor, ReadinessResult, init_tracing,
};
use tokio::net::TcpStream;
use tracing::{error, info, warn};

/// Stand-in for the generated RPC client: a plain TCP connection
struct TcpConnector;

#[async_trait]
impl ClientConnector for TcpConnector {
    type Client = TcpStream;

    async fn connect(&self, endpoint: &Endpoint) -> Result<TcpStream> {
        let stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing(LogFormat::from_env())?;

    let supervisor = PlatformSupervisor::from_env()?;
    info!(
        endpoint = %supervisor.config().endpoint,
        executable = %supervisor.config().executable.display(),
        "Desktop shell starting"
    );

    let mut states = supervisor.subscribe();
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = states.borrow_and_update().clone();
            info!(%state, "Backend status");
        }
    });

    let startup = supervisor.start();
    let result = tokio::select! {
        joined = startup => joined.unwrap_or_else(|e| Err(anyhow::anyhow!(e).into())),
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted during backend startup");
            supervisor.shutdown().await;
            return Ok(());
        }
    };

    match result {
        Ok(result @ (ReadinessResult::AlreadyRunning | ReadinessResult::Started)) => {
            match supervisor.connect(&TcpConnector, &result).await {
                Ok(client) => info!(endpoint = %client.endpoint(), "Connected to backend ({result})"),
                Err(e) => error!(error = %e, "Failed to connect to backend"),
            }
        }
        Ok(ReadinessResult::ProcessExited {
            reason,
            last_output,
        }) => {
            error!(%reason, "Backend exited during startup");
            for line in last_output {
                error!("  {line}");
            }
        }
        Ok(ReadinessResult::TimedOut) => {
            warn!("Couldn't reach the backend, it may still be starting");
        }
        Err(e) => error!(error = %e, "Backend supervision failed"),
    }

    info!("Press Ctrl+C to exit");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to wait for Ctrl+C");
    }

    if let Some(result) = supervisor.shutdown().await {
        info!(?result, "Backend terminated");
    }
    Ok(())
}
