//! Delegation error types.

#[derive(Debug, thiserror::Error)]
pub enum DelegationError {
    /// The remote delegation service failed.
    #[error("delegation source error: {0}")]
    Source(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, DelegationError>;
