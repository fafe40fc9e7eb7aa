use anyhow::Result;
use async_trait::async_trait;
use std::sync::Mutex;
use sysinfo::System;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use shamble_supervisor_core::*;

/// Windows-specific process handle implementation
pub struct WindowsProcessHandle {
    child: Child,
    command: String,
}

impl WindowsProcessHandle {
    pub fn new(child: Child, command: String) -> Self {
        Self { child, command }
    }
}

#[async_trait]
impl ProcessHandle for WindowsProcessHandle {
    fn get_pid(&self) -> Option<ProcessId> {
        self.child.id().map(ProcessId::from)
    }

    fn get_command(&self) -> &str {
        &self.command
    }

    async fn is_running(&self) -> bool {
        if let Some(pid) = self.get_pid() {
            let mut system = System::new();
            system.refresh_processes_specifics(
                sysinfo::ProcessesToUpdate::Some(&[sysinfo::Pid::from_u32(pid.0)]),
                true,
                sysinfo::ProcessRefreshKind::default(),
            );
            let running = system.process(sysinfo::Pid::from_u32(pid.0)).is_some();
            if !running {
                debug!(pid = %pid, "Windows process is no longer running");
            }
            running
        } else {
            debug!("Windows process handle has no PID - process was reaped");
            false
        }
    }

    async fn try_wait(&mut self) -> Result<Option<ExitReason>> {
        Ok(self.child.try_wait()?.map(ExitReason::from))
    }

    async fn wait(&mut self) -> Result<ExitReason> {
        let status = self.child.wait().await?;
        Ok(status.into())
    }

    async fn kill(&mut self) -> Result<()> {
        self.child
            .kill()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to kill process: {}", e))
    }
}

/// Windows-specific process manager with process tree management
pub struct WindowsProcessManager {
    system: Mutex<System>,
}

impl Default for WindowsProcessManager {
    fn default() -> Self {
        <Self as ProcessManager>::new()
    }
}

#[async_trait]
impl ProcessLifecycle for WindowsProcessManager {
    type Handle = WindowsProcessHandle;

    async fn spawn_process(
        &self,
        spec: &LaunchSpec,
        recent_output_lines: usize,
    ) -> Result<(Self::Handle, OutputLines), LaunchError> {
        #[allow(unused_mut)]
        let mut cmd = backend_command(spec);

        // Background backend: no console window
        #[cfg(windows)]
        {
            cmd.creation_flags(0x08000000); // CREATE_NO_WINDOW
        }

        let (child, output) = spawn_with_output(cmd, spec, recent_output_lines)?;
        Ok((WindowsProcessHandle::new(child, spec.display_name()), output))
    }
}

#[async_trait]
impl ProcessTermination for WindowsProcessManager {
    async fn terminate_gracefully(&self, handle: &mut Self::Handle) -> TerminationResult {
        let Some(pid) = handle.get_pid() else {
            return TerminationResult::ProcessNotFound;
        };

        match taskkill(pid, false).await {
            Ok(true) => {
                info!(pid = %pid, "Sent graceful termination to process tree");
                TerminationResult::Success
            }
            Ok(false) if !handle.is_running().await => {
                info!(pid = %pid, "Process not found for graceful termination");
                TerminationResult::ProcessNotFound
            }
            Ok(false) => {
                warn!(pid = %pid, "taskkill refused graceful termination");
                TerminationResult::Failed("taskkill refused graceful termination".to_string())
            }
            Err(e) => {
                warn!(pid = %pid, error = %e, "Failed to gracefully terminate process");
                TerminationResult::Failed(format!("Graceful termination failed: {e}"))
            }
        }
    }

    async fn force_kill(&self, handle: &mut Self::Handle) -> TerminationResult {
        let Some(pid) = handle.get_pid() else {
            return TerminationResult::ProcessNotFound;
        };

        let result = match taskkill(pid, true).await {
            Ok(true) => {
                info!(pid = %pid, "Force killed process tree");
                TerminationResult::Success
            }
            Ok(false) => {
                info!(pid = %pid, "Process not found for force kill");
                TerminationResult::ProcessNotFound
            }
            Err(e) => {
                warn!(pid = %pid, error = %e, "Failed to force kill process tree");
                TerminationResult::Failed(format!("Force kill failed: {e}"))
            }
        };

        // Also kill and reap the direct child through its handle
        match handle.kill().await {
            Ok(()) => TerminationResult::Success,
            Err(e) => {
                warn!(error = %e, "Handle kill cleanup failed");
                result
            }
        }
    }

    async fn cleanup_descendants(&self, pid: ProcessId) {
        // Windows keeps the dead parent's PID on orphans, so they are still findable
        for child_pid in self.find_descendants(pid) {
            match taskkill(child_pid, true).await {
                Ok(true) => info!(pid = %child_pid, "Killed leftover descendant process"),
                Ok(false) => {}
                Err(e) => warn!(pid = %child_pid, error = %e, "Failed to kill descendant"),
            }
        }
    }

    fn emergency_kill(&self, pid: ProcessId) {
        let result = std::process::Command::new("taskkill")
            .args(taskkill_args(pid, true))
            .output();

        if let Err(e) = result {
            warn!(pid = %pid, error = %e, "Failed to run taskkill during drop");
        }
    }
}

impl WindowsProcessManager {
    fn find_descendants(&self, root: ProcessId) -> Vec<ProcessId> {
        let mut system = match self.system.lock() {
            Ok(system) => system,
            Err(poisoned) => poisoned.into_inner(),
        };
        system.refresh_processes_specifics(
            sysinfo::ProcessesToUpdate::All,
            true,
            sysinfo::ProcessRefreshKind::default(),
        );

        let mut children = Vec::new();
        Self::find_children_recursive(&system, root.0, &mut children);
        children.into_iter().map(ProcessId::from).collect()
    }

    /// Recursively find all child processes
    fn find_children_recursive(system: &System, parent_pid: u32, result: &mut Vec<u32>) {
        for (pid, process) in system.processes() {
            if process.parent().is_some_and(|ppid| ppid.as_u32() == parent_pid) {
                let child_pid = pid.as_u32();
                Self::find_children_recursive(system, child_pid, result);
                result.push(child_pid);
            }
        }
    }
}

impl ProcessManager for WindowsProcessManager {
    fn new() -> Self {
        info!("Initializing Windows process manager");
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

/// `taskkill` arguments for a whole process tree
fn taskkill_args(pid: ProcessId, force: bool) -> Vec<String> {
    let mut args = Vec::with_capacity(4);
    if force {
        args.push("/F".to_string());
    }
    args.push("/T".to_string());
    args.push("/PID".to_string());
    args.push(pid.to_string());
    args
}

/// Run taskkill; `Ok(false)` when it reports failure (usually: no such process)
async fn taskkill(pid: ProcessId, force: bool) -> Result<bool> {
    let output = Command::new("taskkill")
        .args(taskkill_args(pid, force))
        .output()
        .await?;

    Ok(output.status.success())
}
