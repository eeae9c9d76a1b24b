//! SLA error types.

pub type Result<T> = std::result::Result<T, SlaError>;

#[derive(Debug, thiserror::Error)]
pub enum SlaError {
    #[error("unknown work hour type: {0}")]
    UnknownWorkType(String),

    #[error("invalid duration '{0}'")]
    InvalidDuration(String),

    #[error("calendar source failed: {0}")]
    Calendar(String),

    #[error("calendar request failed: {0}")]
    Http(#[from] reqwest::Error),
}
