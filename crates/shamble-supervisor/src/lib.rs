//! Shamble Supervisor - keeps the local backend service running
//!
//! Picks the process manager for the current platform at compile time and
//! wires it into the platform-independent supervisor from the core crate.

mod factory;
mod logging;
mod runner;

pub use factory::{
    PlatformLauncher, PlatformProcessManager, PlatformProcessManagerFactory, create_launcher,
};
pub use logging::{ENV_LOG_FORMAT, LogFormat, init_tracing};
pub use runner::PlatformSupervisor;

// Re-export core functionality
pub use shamble_supervisor_core::*;
