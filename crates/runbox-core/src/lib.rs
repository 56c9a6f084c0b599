//! runbox-core — sandbox lifecycle and interactive execution
//!
//! Sandboxes are containers with a persistent workspace directory, a private
//! network and a public hostname. This crate keeps them within capacity,
//! routes traffic to them through a reverse proxy, and runs commands in them
//! over long-lived pseudo-terminal sessions.

pub mod config;
pub mod control;
pub mod error;
pub mod files;
pub mod ids;
pub mod locks;
pub mod ports;
pub mod proxy;
pub mod registry;
pub mod runtime;
pub mod session;
pub mod storage;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use config::RunboxConfig;
pub use control::Runbox;
pub use error::{ResourceKind, Result, RunboxError};
pub use registry::{ExposedService, Sandbox, SandboxState};
pub use session::{ExecOutcome, SessionInfo, SessionState};
