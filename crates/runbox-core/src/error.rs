//! Error taxonomy for the control plane
//!
//! A timed-out command is not an error: it surfaces as
//! [`ExecOutcome::TimedOut`](crate::session::ExecOutcome::TimedOut).

use thiserror::Error;

/// What kind of object a [`RunboxError::NotFound`] refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Sandbox,
    Container,
    Network,
    Session,
    Route,
    File,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Sandbox => write!(f, "sandbox"),
            ResourceKind::Container => write!(f, "container"),
            ResourceKind::Network => write!(f, "network"),
            ResourceKind::Session => write!(f, "session"),
            ResourceKind::Route => write!(f, "route"),
            ResourceKind::File => write!(f, "file"),
        }
    }
}

#[derive(Debug, Error)]
pub enum RunboxError {
    #[error("{kind} '{id}' not found")]
    NotFound { kind: ResourceKind, id: String },

    #[error("no free port in range {floor}-{ceiling}")]
    Exhausted { floor: u16, ceiling: u16 },

    #[error("container runtime failed during {operation}: {message}")]
    RuntimeInvocation { operation: String, message: String },

    /// The route descriptor was written but the proxy did not reload
    #[error("reverse proxy reload failed: {0}")]
    ProxyReload(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("shell session failed to start: {0}")]
    SessionStart(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RunboxError>;

impl RunboxError {
    pub fn not_found(kind: ResourceKind, id: impl Into<String>) -> Self {
        RunboxError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn runtime(operation: impl Into<String>, message: impl Into<String>) -> Self {
        RunboxError::RuntimeInvocation {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RunboxError::NotFound { .. })
    }

    /// Client errors are caused by the request (bad input, unknown sandbox)
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            RunboxError::NotFound { .. } | RunboxError::InvalidInput(_)
        )
    }

    /// HTTP-equivalent status for this error
    pub fn status_code(&self) -> u16 {
        match self {
            RunboxError::NotFound { .. } => 404,
            RunboxError::InvalidInput(_) => 400,
            RunboxError::Exhausted { .. } => 503,
            RunboxError::ProxyReload(_) => 502,
            RunboxError::RuntimeInvocation { .. }
            | RunboxError::SessionStart(_)
            | RunboxError::Io(_) => 500,
        }
    }
}
