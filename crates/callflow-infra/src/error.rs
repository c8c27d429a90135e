use thiserror::Error;

/// Errors produced by the shared infrastructure layer.
#[derive(Error, Debug)]
pub enum InfraError {
    /// The shared key-value store rejected or failed an operation.
    #[error("Store error: {0}")]
    Store(String),

    /// A value could not be serialized to or from its stored form.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Event bus publish or subscribe failure.
    #[error("Event bus error: {0}")]
    Bus(String),

    /// Invalid configuration value.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl InfraError {
    /// Create a store error from anything displayable.
    pub fn store(msg: impl Into<String>) -> Self {
        InfraError::Store(msg.into())
    }

    /// Create an event bus error from anything displayable.
    pub fn bus(msg: impl Into<String>) -> Self {
        InfraError::Bus(msg.into())
    }
}

/// Result alias used throughout the infrastructure crate.
pub type Result<T> = std::result::Result<T, InfraError>;
