//! Error types for status reconciliation and recording.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StatusError {
    /// Shared-store failure.
    #[error("Store error: {0}")]
    Store(#[from] callflow_infra::InfraError),

    /// Serialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A management event that cannot be reconciled as received.
    #[error("Malformed management event: {0}")]
    Malformed(String),

    /// Management session failure (action send or response collection).
    #[error("Management session error: {0}")]
    Session(String),
}

impl StatusError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        StatusError::Malformed(msg.into())
    }

    pub fn session(msg: impl Into<String>) -> Self {
        StatusError::Session(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, StatusError>;
