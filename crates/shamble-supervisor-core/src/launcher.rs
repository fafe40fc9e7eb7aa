use crate::config::LaunchSpec;
use crate::error::LaunchError;
use crate::output::OutputLines;
use crate::process::{ProcessHandle, ProcessId, ProcessManager, TerminationResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// A backend process together with its output and who is responsible for it
pub struct SupervisedProcess<H> {
    handle: H,
    pid: Option<ProcessId>,
    output: OutputLines,
    owned_by_supervisor: bool,
}

impl<H: ProcessHandle> SupervisedProcess<H> {
    pub fn new(handle: H, output: OutputLines, owned_by_supervisor: bool) -> Self {
        Self {
            pid: handle.get_pid(),
            handle,
            output,
            owned_by_supervisor,
        }
    }

    pub fn handle(&self) -> &H {
        &self.handle
    }

    pub fn handle_mut(&mut self) -> &mut H {
        &mut self.handle
    }

    pub fn output_mut(&mut self) -> &mut OutputLines {
        &mut self.output
    }

    /// Borrow handle and output at the same time
    pub fn parts_mut(&mut self) -> (&mut H, &mut OutputLines) {
        (&mut self.handle, &mut self.output)
    }

    /// Only an owned process may ever be terminated by the supervisor
    pub fn owned_by_supervisor(&self) -> bool {
        self.owned_by_supervisor
    }

    /// PID recorded at spawn; still known after the handle has reaped the process
    pub fn pid(&self) -> Option<ProcessId> {
        self.pid
    }

    /// Alive means not reaped and still answering the OS liveness check
    pub async fn is_alive(&mut self) -> bool {
        match self.handle.try_wait().await {
            Ok(Some(_)) => false,
            Ok(None) => self.handle.is_running().await,
            Err(e) => {
                warn!(error = %e, "Failed to query backend process status");
                self.handle.is_running().await
            }
        }
    }
}

/// Starts and stops backend processes
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// The type of process handle returned by this launcher
    type Handle: ProcessHandle + 'static;

    /// Spawn the backend described by `spec`; the result is owned by the caller
    async fn launch(
        &self,
        spec: &LaunchSpec,
        recent_output_lines: usize,
    ) -> Result<SupervisedProcess<Self::Handle>, LaunchError>;

    /// Terminate an owned process, refusing to touch anything else
    async fn terminate(&self, process: &mut SupervisedProcess<Self::Handle>) -> TerminationResult;
}

/// `ProcessLauncher` built on a platform `ProcessManager`.
///
/// Every spawned PID is tracked until it is terminated or observed dead, and
/// anything still tracked when the launcher drops gets an emergency kill.
pub struct ManagedLauncher<M: ProcessManager> {
    platform_manager: Arc<M>,
    active_processes: Mutex<HashMap<ProcessId, String>>,
    termination_grace: Duration,
}

impl<M: ProcessManager> ManagedLauncher<M> {
    pub fn new(platform_manager: M, termination_grace: Duration) -> Self {
        Self {
            platform_manager: Arc::new(platform_manager),
            active_processes: Mutex::new(HashMap::new()),
            termination_grace,
        }
    }

    /// PIDs spawned by this launcher that have not been terminated yet
    pub fn active_processes(&self) -> Vec<ProcessId> {
        match self.active_processes.lock() {
            Ok(active) => active.keys().copied().collect(),
            Err(poisoned) => poisoned.into_inner().keys().copied().collect(),
        }
    }

    fn track(&self, pid: ProcessId, command: String) {
        let mut active = match self.active_processes.lock() {
            Ok(active) => active,
            Err(poisoned) => poisoned.into_inner(),
        };
        active.insert(pid, command);
    }

    fn untrack(&self, pid: ProcessId) {
        let mut active = match self.active_processes.lock() {
            Ok(active) => active,
            Err(poisoned) => poisoned.into_inner(),
        };
        active.remove(&pid);
    }
}

#[async_trait]
impl<M: ProcessManager + 'static> ProcessLauncher for ManagedLauncher<M> {
    type Handle = M::Handle;

    async fn launch(
        &self,
        spec: &LaunchSpec,
        recent_output_lines: usize,
    ) -> Result<SupervisedProcess<Self::Handle>, LaunchError> {
        let (handle, output) = self
            .platform_manager
            .spawn_process(spec, recent_output_lines)
            .await?;

        let process = SupervisedProcess::new(handle, output, true);
        if let Some(pid) = process.pid() {
            info!(pid = %pid, command = %spec.display_name(), "Tracking backend process");
            self.track(pid, spec.display_name());
        }

        Ok(process)
    }

    async fn terminate(&self, process: &mut SupervisedProcess<Self::Handle>) -> TerminationResult {
        if !process.owned_by_supervisor() {
            warn!(
                command = process.handle().get_command(),
                "Refusing to terminate a process this supervisor did not start"
            );
            return TerminationResult::NotOwned;
        }

        let Some(pid) = process.pid() else {
            debug!("Backend process never had a PID");
            return TerminationResult::ProcessNotFound;
        };

        // A reaped child keeps reporting its exit status here
        if let Ok(Some(reason)) = process.handle_mut().try_wait().await {
            info!(pid = %pid, %reason, "Backend process had already exited");
            self.platform_manager.cleanup_descendants(pid).await;
            self.untrack(pid);
            return TerminationResult::ProcessNotFound;
        }

        let result = self
            .platform_manager
            .terminate_completely(process.handle_mut(), self.termination_grace)
            .await;

        match &result {
            TerminationResult::Success | TerminationResult::ProcessNotFound => {
                info!(pid = %pid, "Backend process terminated");
                self.untrack(pid);
            }
            other => {
                warn!(pid = %pid, result = ?other, "Failed to terminate backend process");
            }
        }

        result
    }
}

impl<M: ProcessManager> Drop for ManagedLauncher<M> {
    fn drop(&mut self) {
        let active_processes = self.active_processes();

        if !active_processes.is_empty() {
            warn!(
                "Emergency cleanup: terminating {} backend processes during drop",
                active_processes.len()
            );

            for pid in active_processes {
                self.platform_manager.emergency_kill(pid);
            }
        }
    }
}
