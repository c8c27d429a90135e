use thiserror::Error;

use crate::telephony::OperationError;

/// Errors surfaced by the IVR engine and its collaborators.
///
/// Most protocol failures are handled inside the engine per the retry /
/// implicit-call-end / log-and-continue policy; this enum covers the
/// failures that do cross an API boundary (tree validation, store
/// access, configuration).
#[derive(Error, Debug)]
pub enum IvrError {
    /// The node tree violates a structural invariant (duplicate sibling
    /// digit, unknown parent, missing root).
    #[error("Tree error: {0}")]
    Tree(String),

    /// A media payload could not be resolved to a playable reference.
    #[error("Media error: {0}")]
    Media(String),

    /// Invalid engine configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Shared state store failure.
    #[error("Store error: {0}")]
    Store(#[from] callflow_infra::InfraError),

    /// A control-protocol operation failed terminally.
    #[error("Operation error: {0}")]
    Operation(#[from] OperationError),
}

impl IvrError {
    pub fn tree(msg: impl Into<String>) -> Self {
        IvrError::Tree(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        IvrError::Configuration(msg.into())
    }
}

/// Result alias for IVR operations.
pub type Result<T> = std::result::Result<T, IvrError>;
