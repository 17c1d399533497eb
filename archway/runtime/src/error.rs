//! Error types for the archway runtime.

use archway_dagger::UnresolvedImport;
use thiserror::Error;

/// Errors that can occur while building or running handlers.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The guest module could not be compiled or instantiated.
    #[error("link failure: {0}")]
    LinkFailure(String),

    /// The guest imports something the host does not provide.
    #[error("link failure: {0}")]
    UnresolvedImport(#[from] UnresolvedImport),

    /// The guest does not export the configured entry point.
    #[error("link failure: missing entry point {0:?}")]
    MissingEntryPoint(String),

    /// The guest trapped or ran out of fuel.
    #[error("invocation of {entry_point} failed: {message}")]
    Invocation { entry_point: String, message: String },

    /// The blocking task running the guest panicked or was cancelled.
    #[error("guest for handler {0} was lost")]
    GuestLost(String),

    /// A handler with this id is already running.
    #[error("handler already exists: {0}")]
    DuplicateHandler(String),

    /// Configuration could not be parsed.
    #[error("invalid config: {0}")]
    Config(#[from] serde_json::Error),
}

impl RuntimeError {
    pub(crate) fn link(context: &str, error: impl std::fmt::Display) -> Self {
        RuntimeError::LinkFailure(format!("{}: {}", context, error))
    }

    /// Whether the error stopped a handler from being built.
    pub fn is_link_failure(&self) -> bool {
        matches!(
            self,
            RuntimeError::LinkFailure(_)
                | RuntimeError::UnresolvedImport(_)
                | RuntimeError::MissingEntryPoint(_)
        )
    }
}

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;
