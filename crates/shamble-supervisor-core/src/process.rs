use crate::config::LaunchSpec;
use crate::error::LaunchError;
use crate::output::{OutputLines, OutputPipe};
use anyhow::Result;
use async_trait::async_trait;
use std::fmt;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{info, warn};

/// Unique identifier for a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(pub u32);

impl From<u32> for ProcessId {
    fn from(pid: u32) -> Self {
        ProcessId(pid)
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a process ended, as far as the OS tells us
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitReason {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl From<std::process::ExitStatus> for ExitReason {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

/// Result of a process termination operation
#[derive(Debug, Clone, PartialEq)]
pub enum TerminationResult {
    /// Process was successfully terminated
    Success,
    /// Process was not found (already exited)
    ProcessNotFound,
    /// The process was not spawned by us and was left alone
    NotOwned,
    /// Permission denied (insufficient privileges)
    AccessDenied,
    /// Operation failed with specific error message
    Failed(String),
}

impl TerminationResult {
    /// True when no process of ours is left running
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            TerminationResult::Success | TerminationResult::ProcessNotFound
        )
    }
}

/// Trait representing a handle to a running process
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    /// Get the process ID (None once the process has been reaped)
    fn get_pid(&self) -> Option<ProcessId>;

    /// Get the command that started this process
    fn get_command(&self) -> &str;

    /// Check if the process is still running (non-blocking)
    async fn is_running(&self) -> bool;

    /// Try to get exit status without blocking, reaping the process if it exited
    async fn try_wait(&mut self) -> Result<Option<ExitReason>>;

    /// Wait for the process to exit
    async fn wait(&mut self) -> Result<ExitReason>;

    /// Kill the process itself (not its descendants)
    async fn kill(&mut self) -> Result<()>;
}

/// Core trait for spawning processes and waiting on them
#[async_trait]
pub trait ProcessLifecycle: Send + Sync {
    /// The type of process handle this lifecycle manager produces
    type Handle: ProcessHandle + 'static;

    /// Spawn the process described by `spec`, capturing its combined output
    async fn spawn_process(
        &self,
        spec: &LaunchSpec,
        recent_output_lines: usize,
    ) -> Result<(Self::Handle, OutputLines), LaunchError>;

    /// Wait for a process to exit with optional timeout
    async fn wait_for_exit(
        &self,
        handle: &mut Self::Handle,
        timeout: Option<Duration>,
    ) -> Result<ExitReason> {
        match timeout {
            Some(duration) => tokio::time::timeout(duration, handle.wait())
                .await
                .map_err(|_| anyhow::anyhow!("Timeout waiting for process exit"))?,
            None => handle.wait().await,
        }
    }
}

/// Trait for terminating a spawned process together with its descendants
#[async_trait]
pub trait ProcessTermination: ProcessLifecycle {
    /// Ask the process (and its group or tree) to exit
    async fn terminate_gracefully(&self, handle: &mut Self::Handle) -> TerminationResult;

    /// Kill the process (and its group or tree) without negotiation
    async fn force_kill(&self, handle: &mut Self::Handle) -> TerminationResult;

    /// Complete termination strategy: graceful -> wait up to `grace` -> force kill
    async fn terminate_completely(
        &self,
        handle: &mut Self::Handle,
        grace: Duration,
    ) -> TerminationResult {
        let pid = handle.get_pid();

        match self.terminate_gracefully(handle).await {
            TerminationResult::Success => {
                if self.wait_for_exit(handle, Some(grace)).await.is_ok() {
                    if let Some(pid) = pid {
                        self.cleanup_descendants(pid).await;
                    }
                    return TerminationResult::Success;
                }
                warn!(
                    command = handle.get_command(),
                    "Process ignored graceful termination, force killing"
                );
                self.force_kill(handle).await
            }
            TerminationResult::ProcessNotFound => TerminationResult::ProcessNotFound,
            _ => self.force_kill(handle).await,
        }
    }

    /// Remove anything the process left behind after it exited on its own
    async fn cleanup_descendants(&self, _pid: ProcessId) {}

    /// Synchronous best-effort kill used when no async context is available
    fn emergency_kill(&self, pid: ProcessId);
}

/// High-level process manager trait that combines lifecycle and termination
pub trait ProcessManager: ProcessTermination {
    /// Create a new process manager instance
    fn new() -> Self
    where
        Self: Sized;
}

/// Factory trait for creating platform-specific process managers
pub trait ProcessManagerFactory {
    /// The type of process manager this factory creates
    type Manager: ProcessManager;

    /// Create a process manager for the current platform
    fn create_process_manager() -> Self::Manager;

    /// Get the platform name for logging and debugging
    fn platform_name() -> &'static str;
}

/// Prepare a `Command` for `spec`: inherited env plus overrides, null stdin,
/// both output pipes captured.
pub fn backend_command(spec: &LaunchSpec) -> Command {
    let mut cmd = Command::new(&spec.executable);
    cmd.args(&spec.args)
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    if let Some(dir) = &spec.working_directory {
        cmd.current_dir(dir);
    }

    cmd
}

/// Spawn `cmd` and merge its stdout and stderr into one line stream
pub fn spawn_with_output(
    mut cmd: Command,
    spec: &LaunchSpec,
    recent_output_lines: usize,
) -> Result<(Child, OutputLines), LaunchError> {
    let mut child = cmd
        .spawn()
        .map_err(|e| LaunchError::from_spawn_error(&spec.executable, e))?;

    let name = spec.display_name();
    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        return Err(LaunchError::MissingOutput(name));
    };

    if let Some(pid) = child.id() {
        info!(pid = %pid, command = %name, args = ?spec.args, "Spawned backend process");
    }

    let pipes: Vec<OutputPipe> = vec![Box::new(stdout), Box::new(stderr)];
    let output = OutputLines::merge(pipes, &name, recent_output_lines);
    Ok((child, output))
}
