use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Transport closed")]
    Closed,

    #[error("Handler error: {0}")]
    Handler(String),

    /// The message cannot be applied yet and should stay parked.
    #[error("Deferred: {0}")]
    Deferred(String),

    #[error("Storage error: {0}")]
    Store(#[from] pipewright_store::StoreError),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("{service} unavailable: {reason}")]
    Unavailable { service: String, reason: String },

    #[cfg(feature = "kafka")]
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
}

pub type Result<T> = std::result::Result<T, BusError>;
