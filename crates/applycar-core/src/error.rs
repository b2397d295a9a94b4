//! Core error types.

use crate::attribute::ListenerId;

/// Errors raised by attributes, notifiers and schedulers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    #[error("Listener not registered: {0}")]
    ListenerNotFound(ListenerId),

    #[error("Attribute {0} is unbound")]
    Unbound(String),

    #[error("No tokio runtime available: {0}")]
    NoRuntime(String),
}

/// Result alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
