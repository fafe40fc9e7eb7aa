use crate::factory::{PlatformLauncher, create_launcher};
use shamble_supervisor_core::{
    BackendSupervisor, ClientConnector, ClientHandle, ProcessId, ReadinessResult,
    SupervisorConfig, SupervisorError, SupervisorState, TerminationResult,
};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

type Inner = BackendSupervisor<PlatformLauncher>;

/// Backend supervisor wired to this platform's process manager and a TCP probe.
///
/// Cheap to clone; every clone drives the same supervisor.
#[derive(Clone)]
pub struct PlatformSupervisor {
    inner: Arc<Inner>,
}

impl PlatformSupervisor {
    /// Create a supervisor for the given configuration
    pub fn new(config: SupervisorConfig) -> Result<Self, SupervisorError> {
        let launcher = create_launcher(&config);
        let inner = BackendSupervisor::new(config, launcher)?;
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Default configuration with `SHAMBLE_*` environment overrides applied
    pub fn from_env() -> Result<Self, SupervisorError> {
        Self::new(SupervisorConfig::default().with_process_env()?)
    }

    pub fn config(&self) -> &SupervisorConfig {
        self.inner.config()
    }

    /// Make sure the backend is running, waiting for the outcome
    pub async fn ensure_running(&self) -> Result<ReadinessResult, SupervisorError> {
        self.inner.ensure_running().await
    }

    /// Start `ensure_running` in the background; the caller never blocks on it
    pub fn start(&self) -> JoinHandle<Result<ReadinessResult, SupervisorError>> {
        info!(endpoint = %self.inner.config().endpoint, "Starting backend supervision");
        self.inner.clone().spawn_ensure_running()
    }

    /// Connect a client once `result` confirmed the endpoint is reachable
    pub async fn connect<K: ClientConnector>(
        &self,
        connector: &K,
        result: &ReadinessResult,
    ) -> Result<ClientHandle<K::Client>, SupervisorError> {
        let reachable = self
            .inner
            .reachable_endpoint(result)
            .ok_or_else(|| SupervisorError::NotReachable(result.to_string()))?;
        ClientHandle::connect(connector, &reachable).await
    }

    /// Terminate the backend if this supervisor started it
    pub async fn shutdown(&self) -> Option<TerminationResult> {
        self.inner.shutdown().await
    }

    pub fn state(&self) -> SupervisorState {
        self.inner.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.inner.subscribe()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancellation_token()
    }

    pub async fn owned_pid(&self) -> Option<ProcessId> {
        self.inner.owned_pid().await
    }
}
