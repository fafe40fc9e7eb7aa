use crate::client::ReachableEndpoint;
use crate::config::SupervisorConfig;
use crate::error::SupervisorError;
use crate::launcher::{ProcessLauncher, SupervisedProcess};
use crate::probe::{PortProbe, TcpPortProbe};
use crate::process::{ProcessId, TerminationResult};
use crate::readiness::{ReadinessResult, ReadinessWatcher};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Observable lifecycle of the supervisor, published for UI consumers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Probing,
    /// The endpoint was served by something we did not start
    AlreadyUp,
    Launching,
    AwaitingReady {
        pid: Option<ProcessId>,
    },
    Up {
        pid: Option<ProcessId>,
    },
    Failed {
        reason: String,
    },
    Stopped,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SupervisorState::Idle => write!(f, "idle"),
            SupervisorState::Probing => write!(f, "probing"),
            SupervisorState::AlreadyUp => write!(f, "already up"),
            SupervisorState::Launching => write!(f, "launching"),
            SupervisorState::AwaitingReady { pid: Some(pid) } => {
                write!(f, "awaiting readiness of pid {pid}")
            }
            SupervisorState::AwaitingReady { pid: None } => write!(f, "awaiting readiness"),
            SupervisorState::Up { pid: Some(pid) } => write!(f, "up (pid {pid})"),
            SupervisorState::Up { pid: None } => write!(f, "up"),
            SupervisorState::Failed { reason } => write!(f, "failed: {reason}"),
            SupervisorState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Makes sure the backend service is running, starting it when needed.
///
/// At most one backend process is owned at a time. `ensure_running` calls are
/// serialised on the process slot, and only a process this supervisor spawned
/// is ever terminated.
pub struct BackendSupervisor<L: ProcessLauncher, P: PortProbe = TcpPortProbe> {
    config: SupervisorConfig,
    probe: Arc<P>,
    launcher: Arc<L>,
    process: Mutex<Option<SupervisedProcess<L::Handle>>>,
    state: watch::Sender<SupervisorState>,
    cancellation_token: CancellationToken,
}

impl<L: ProcessLauncher> BackendSupervisor<L, TcpPortProbe> {
    /// Supervisor probing the endpoint over TCP
    pub fn new(config: SupervisorConfig, launcher: L) -> Result<Self, SupervisorError> {
        let probe = TcpPortProbe::new(config.probe_timeout());
        Self::with_probe(config, launcher, probe)
    }
}

impl<L: ProcessLauncher, P: PortProbe> BackendSupervisor<L, P> {
    pub fn with_probe(
        config: SupervisorConfig,
        launcher: L,
        probe: P,
    ) -> Result<Self, SupervisorError> {
        config.validate()?;
        let (state, _) = watch::channel(SupervisorState::Idle);

        Ok(Self {
            config,
            probe: Arc::new(probe),
            launcher: Arc::new(launcher),
            process: Mutex::new(None),
            state,
            cancellation_token: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    /// Current state snapshot
    pub fn state(&self) -> SupervisorState {
        self.state.borrow().clone()
    }

    /// Receive every state change from now on
    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    /// Token that aborts an in-flight readiness wait when cancelled.
    ///
    /// Cancelling it has the same effect on `ensure_running` as `shutdown`, but
    /// leaves any owned process for `shutdown` to terminate.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Proof of reachability for handing the endpoint to a client
    pub fn reachable_endpoint(&self, result: &ReadinessResult) -> Option<ReachableEndpoint> {
        result
            .is_reachable()
            .then(|| ReachableEndpoint::new(self.config.endpoint.clone()))
    }

    /// PID of the backend we own, if any. Waits for an in-flight `ensure_running`.
    pub async fn owned_pid(&self) -> Option<ProcessId> {
        self.process.lock().await.as_ref().and_then(|p| p.pid())
    }

    /// Probe, launch if needed, and wait for readiness.
    ///
    /// Probe and launch failures are returned as errors; a backend that never
    /// became ready or died while starting is reported in the `ReadinessResult`.
    pub async fn ensure_running(&self) -> Result<ReadinessResult, SupervisorError> {
        let mut slot = self.process.lock().await;
        if self.cancellation_token.is_cancelled() {
            debug!("Supervisor is shut down, not starting backend");
            return Err(SupervisorError::Cancelled);
        }

        if let Some(process) = slot.as_mut() {
            if process.is_alive().await {
                let confirmed = matches!(*self.state.borrow(), SupervisorState::Up { .. });
                if confirmed {
                    debug!(pid = ?process.pid(), "Backend already owned and ready");
                    return Ok(ReadinessResult::AlreadyRunning);
                }

                info!(pid = ?process.pid(), "Owned backend not confirmed ready, waiting again");
                return self.await_ready(&mut slot).await;
            }

            warn!(pid = ?process.pid(), "Owned backend process is gone, releasing it");
            self.release(&mut slot).await;
        }

        self.set_state(SupervisorState::Probing);
        let reachable = match self.probe.is_reachable(&self.config.endpoint).await {
            Ok(reachable) => reachable,
            Err(e) => {
                error!(endpoint = %self.config.endpoint, error = %e, "Failed to probe backend endpoint");
                self.set_state(SupervisorState::Failed {
                    reason: e.to_string(),
                });
                return Err(e.into());
            }
        };

        if reachable {
            info!(endpoint = %self.config.endpoint, "Backend already running, not spawning");
            self.set_state(SupervisorState::AlreadyUp);
            return Ok(ReadinessResult::AlreadyRunning);
        }

        self.set_state(SupervisorState::Launching);
        let spec = self.config.launch_spec();
        info!(
            endpoint = %self.config.endpoint,
            command = %spec.display_name(),
            "Backend not reachable, launching"
        );

        let process = match self
            .launcher
            .launch(&spec, self.config.readiness.recent_output_lines)
            .await
        {
            Ok(process) => process,
            Err(e) => {
                error!(error = %e, "Failed to launch backend");
                self.set_state(SupervisorState::Failed {
                    reason: e.to_string(),
                });
                return Err(e.into());
            }
        };

        // Must be in the slot before waiting; shutdown terminates whatever is recorded.
        *slot = Some(process);
        self.await_ready(&mut slot).await
    }

    /// Run `ensure_running` on a tokio worker
    pub fn spawn_ensure_running(
        self: Arc<Self>,
    ) -> JoinHandle<Result<ReadinessResult, SupervisorError>>
    where
        L: 'static,
        P: 'static,
    {
        tokio::spawn(async move { self.ensure_running().await })
    }

    /// Cancel any readiness wait and terminate the backend if we own it.
    ///
    /// Idempotent. Returns `None` when there was nothing to terminate.
    pub async fn shutdown(&self) -> Option<TerminationResult> {
        self.cancellation_token.cancel();

        let mut slot = self.process.lock().await;
        let outcome = match slot.take() {
            Some(mut process) => {
                let pid = process.pid();
                info!(pid = ?pid, "Shutting down owned backend process");
                let result = self.launcher.terminate(&mut process).await;
                if !result.is_settled() {
                    error!(pid = ?pid, result = ?result, "Backend process could not be terminated");
                }
                Some(result)
            }
            None => {
                debug!("No owned backend process, nothing to terminate");
                None
            }
        };

        self.set_state(SupervisorState::Stopped);
        outcome
    }

    async fn await_ready(
        &self,
        slot: &mut Option<SupervisedProcess<L::Handle>>,
    ) -> Result<ReadinessResult, SupervisorError> {
        let Some(process) = slot.as_mut() else {
            return Err(anyhow::anyhow!("No backend process recorded").into());
        };

        let pid = process.pid();
        self.set_state(SupervisorState::AwaitingReady { pid });

        let watcher = ReadinessWatcher::new(
            self.config.readiness.clone(),
            self.config.endpoint.clone(),
            self.probe.clone(),
        );
        let result = watcher.await_ready(process, &self.cancellation_token).await;

        match &result {
            Ok(ReadinessResult::Started | ReadinessResult::AlreadyRunning) => {
                self.set_state(SupervisorState::Up { pid });
            }
            Ok(ReadinessResult::TimedOut) => {
                self.set_state(SupervisorState::Failed {
                    reason: format!(
                        "backend not ready after {} attempts",
                        self.config.readiness.max_attempts
                    ),
                });
            }
            Ok(ReadinessResult::ProcessExited { reason, .. }) => {
                self.set_state(SupervisorState::Failed {
                    reason: format!("backend exited during startup ({reason})"),
                });
                self.release(slot).await;
            }
            Err(SupervisorError::Cancelled) => {}
            Err(e) => {
                self.set_state(SupervisorState::Failed {
                    reason: e.to_string(),
                });
            }
        }

        result
    }

    /// Drop the record of a dead process, reaping anything it left behind
    async fn release(&self, slot: &mut Option<SupervisedProcess<L::Handle>>) {
        if let Some(mut process) = slot.take() {
            let result = self.launcher.terminate(&mut process).await;
            debug!(pid = ?process.pid(), result = ?result, "Released backend process");
        }
    }

    fn set_state(&self, state: SupervisorState) {
        debug!(%state, "Supervisor state changed");
        self.state.send_replace(state);
    }
}
