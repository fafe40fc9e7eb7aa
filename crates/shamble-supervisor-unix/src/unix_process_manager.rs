#[cfg(unix)]
mod unix_impl {
    use anyhow::Result;
    use async_trait::async_trait;
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid as NixPid;
    use shamble_supervisor_core::{
        ExitReason, LaunchError, LaunchSpec, OutputLines, ProcessHandle, ProcessId,
        ProcessLifecycle, ProcessManager, ProcessTermination, TerminationResult, backend_command,
        spawn_with_output,
    };
    use std::sync::Mutex;
    use sysinfo::System;
    use tokio::process::Child;
    use tracing::{debug, info, warn};

    /// Unix-specific process handle implementation
    pub struct UnixProcessHandle {
        child: Child,
        command: String,
    }

    impl UnixProcessHandle {
        pub fn new(child: Child, command: String) -> Self {
            Self { child, command }
        }
    }

    #[async_trait]
    impl ProcessHandle for UnixProcessHandle {
        fn get_pid(&self) -> Option<ProcessId> {
            self.child.id().map(ProcessId::from)
        }

        fn get_command(&self) -> &str {
            &self.command
        }

        async fn is_running(&self) -> bool {
            if let Some(pid) = self.get_pid() {
                // Signal 0 only checks that the process exists
                if signal::kill(nix_pid(pid), None).is_ok() {
                    debug!("Unix process {} is still running", pid);
                    true
                } else {
                    debug!("Unix process {} is no longer running", pid);
                    false
                }
            } else {
                debug!("Unix process handle has no PID - process was reaped");
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

    /// Unix process manager: every backend gets its own process group so the
    /// whole tree can be signalled at once.
    pub struct UnixProcessManager {
        system: Mutex<System>,
    }

    impl Default for UnixProcessManager {
        fn default() -> Self {
            <Self as ProcessManager>::new()
        }
    }

    #[async_trait]
    impl ProcessLifecycle for UnixProcessManager {
        type Handle = UnixProcessHandle;

        async fn spawn_process(
            &self,
            spec: &LaunchSpec,
            recent_output_lines: usize,
        ) -> Result<(Self::Handle, OutputLines), LaunchError> {
            let mut cmd = backend_command(spec);

            // New process group for whole-tree termination
            cmd.process_group(0);

            let (child, output) = spawn_with_output(cmd, spec, recent_output_lines)?;
            Ok((UnixProcessHandle::new(child, spec.display_name()), output))
        }
    }

    #[async_trait]
    impl ProcessTermination for UnixProcessManager {
        async fn terminate_gracefully(&self, handle: &mut Self::Handle) -> TerminationResult {
            let Some(pid) = handle.get_pid() else {
                return TerminationResult::ProcessNotFound;
            };

            match signal::killpg(nix_pid(pid), Signal::SIGTERM) {
                Ok(()) => {
                    info!("Sent SIGTERM to process group {}", pid);
                    TerminationResult::Success
                }
                Err(Errno::ESRCH) => {
                    info!("Process group {} not found (already terminated)", pid);
                    TerminationResult::ProcessNotFound
                }
                Err(Errno::EPERM) => {
                    warn!("Permission denied to terminate process group {}", pid);
                    TerminationResult::AccessDenied
                }
                Err(e) => {
                    warn!("Failed to send SIGTERM to process group {}: {}", pid, e);
                    TerminationResult::Failed(format!("SIGTERM to process group failed: {e}"))
                }
            }
        }

        async fn force_kill(&self, handle: &mut Self::Handle) -> TerminationResult {
            let Some(pid) = handle.get_pid() else {
                return TerminationResult::ProcessNotFound;
            };

            // Collected first: once the root dies its children get reparented
            let descendants = self.find_descendants(pid);

            let result = match signal::killpg(nix_pid(pid), Signal::SIGKILL) {
                Ok(()) => {
                    info!("Sent SIGKILL to process group {}", pid);
                    TerminationResult::Success
                }
                Err(Errno::ESRCH) => TerminationResult::ProcessNotFound,
                Err(Errno::EPERM) => {
                    warn!("Permission denied to kill process group {}", pid);
                    TerminationResult::AccessDenied
                }
                Err(e) => {
                    warn!("Failed to send SIGKILL to process group {}: {}", pid, e);
                    TerminationResult::Failed(format!("SIGKILL to process group failed: {e}"))
                }
            };

            // Descendants that left the group (setsid) are killed one by one
            for child_pid in descendants {
                match signal::kill(nix_pid(child_pid), Signal::SIGKILL) {
                    Ok(()) | Err(Errno::ESRCH) => {}
                    Err(e) => warn!("Failed to kill descendant process {}: {}", child_pid, e),
                }
            }

            // Also kill and reap the direct child through its handle
            match handle.kill().await {
                Ok(()) => TerminationResult::Success,
                Err(e) => {
                    warn!("Handle kill cleanup failed: {}", e);
                    result
                }
            }
        }

        async fn cleanup_descendants(&self, pid: ProcessId) {
            match signal::killpg(nix_pid(pid), Signal::SIGKILL) {
                Ok(()) => info!("Killed leftover processes in group {}", pid),
                Err(Errno::ESRCH) => debug!("Process group {} is empty", pid),
                Err(e) => warn!("Failed to clean up process group {}: {}", pid, e),
            }
        }

        fn emergency_kill(&self, pid: ProcessId) {
            let pgid = nix_pid(pid);

            // Try SIGTERM first
            if let Err(e) = signal::killpg(pgid, Signal::SIGTERM) {
                warn!(
                    "Failed to send SIGTERM to process group {} during drop: {}",
                    pid, e
                );

                // If SIGTERM fails, try SIGKILL on the process itself
                if let Err(e) = signal::kill(pgid, Signal::SIGKILL) {
                    tracing::error!("Failed to send SIGKILL to process {} during drop: {}", pid, e);
                }
            }
        }
    }

    impl UnixProcessManager {
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

        /// Recursively find all child processes, deepest first
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

    impl ProcessManager for UnixProcessManager {
        fn new() -> Self {
            info!("Initializing Unix process manager with system monitoring");
            Self {
                system: Mutex::new(System::new()),
            }
        }
    }

    fn nix_pid(pid: ProcessId) -> NixPid {
        NixPid::from_raw(pid.0 as i32)
    }

}

// Re-export the Unix implementation when on Unix systems
#[cfg(unix)]
pub use unix_impl::{UnixProcessHandle, UnixProcessManager};

// Provide stub implementations for non-Unix systems
#[cfg(not(unix))]
pub struct UnixProcessHandle;

#[cfg(not(unix))]
pub struct UnixProcessManager;
