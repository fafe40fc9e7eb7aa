//! Shamble Supervisor Core - Platform-independent backend supervision
//!
//! This crate provides the traits, configuration, error types and the
//! supervisor state machine shared across platform-specific process managers.

mod client;
mod config;
mod error;
mod launcher;
mod output;
mod probe;
mod process;
mod readiness;
mod supervisor;

#[cfg(test)]
mod test_support;

pub use client::*;
pub use config::*;
pub use error::*;
pub use launcher::*;
pub use output::*;
pub use probe::*;
pub use process::*;
pub use readiness::*;
pub use supervisor::*;
