use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Failure to even ask whether the backend endpoint is reachable.
///
/// A refused or timed out connection is not a `ProbeError`; it is the normal
/// "not running" answer of the probe.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Invalid endpoint address {endpoint}: {reason}")]
    InvalidAddress { endpoint: String, reason: String },

    #[error("Failed to resolve endpoint {endpoint}: {source}")]
    Resolve {
        endpoint: String,
        #[source]
        source: io::Error,
    },
}

/// Failure to start the backend executable
#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("Backend executable not found: {}", .0.display())]
    ExecutableNotFound(PathBuf),

    #[error("Backend executable is not executable: {}", .0.display())]
    PermissionDenied(PathBuf),

    #[error("Failed to spawn {}: {source}", .path.display())]
    SpawnFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Spawned process {0} has no captured output pipes")]
    MissingOutput(String),
}

impl LaunchError {
    /// Classify an `io::Error` returned by the OS spawn call
    pub fn from_spawn_error(path: &Path, error: io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::NotFound => LaunchError::ExecutableNotFound(path.to_path_buf()),
            io::ErrorKind::PermissionDenied => LaunchError::PermissionDenied(path.to_path_buf()),
            _ => LaunchError::SpawnFailed {
                path: path.to_path_buf(),
                source: error,
            },
        }
    }
}

/// Errors surfaced by the backend supervisor
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Endpoint probe failed: {0}")]
    Probe(#[from] ProbeError),

    #[error("Backend launch failed: {0}")]
    Launch(#[from] LaunchError),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Backend not reachable: {0}")]
    NotReachable(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl SupervisorError {
    /// Check if repeating the same call could succeed.
    ///
    /// Probe and launch failures repeat deterministically with identical
    /// inputs, so nothing here is retryable except unclassified errors.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SupervisorError::Other(_))
    }

    /// Check if this error indicates a permanent failure
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            SupervisorError::Configuration(_)
                | SupervisorError::Probe(ProbeError::InvalidAddress { .. })
                | SupervisorError::Launch(_)
                | SupervisorError::Cancelled
        )
    }
}
