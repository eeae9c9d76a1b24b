//! Engine errors.

use pipewright_types::ErrorKind;
use thiserror::Error;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors raised while advancing or inspecting a task.
///
/// [`EngineError::Rejected`] is a caller-level refusal: the transaction
/// rolls back and nothing changes. [`EngineError::BlockFailed`] is a runtime
/// failure inside a block; the orchestrator records it on the step and the
/// task lands in `error`.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The request was refused; state is untouched.
    #[error("{kind}: {detail}")]
    Rejected { kind: ErrorKind, detail: String },

    /// A block could not run.
    #[error("block failed: {0}")]
    BlockFailed(String),

    #[error("Storage error: {0}")]
    Store(#[from] pipewright_store::StoreError),

    #[error("SLA error: {0}")]
    Sla(#[from] pipewright_sla::SlaError),

    #[error("Delegation error: {0}")]
    Delegation(#[from] pipewright_delegation::DelegationError),

    #[error("Bus error: {0}")]
    Bus(#[from] pipewright_bus::BusError),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl EngineError {
    pub fn rejected(kind: ErrorKind, detail: impl Into<String>) -> Self {
        EngineError::Rejected {
            kind,
            detail: detail.into(),
        }
    }

    pub fn block(detail: impl Into<String>) -> Self {
        EngineError::BlockFailed(detail.into())
    }

    /// The closed error kind reported to callers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Rejected { kind, .. } => *kind,
            EngineError::BlockFailed(_) => ErrorKind::UpdateBlock,
            EngineError::Store(pipewright_store::StoreError::NotFound { kind, .. }) => match *kind {
                "task" => ErrorKind::TaskNotFound,
                "version" => ErrorKind::VersionNotFound,
                "pipeline" => ErrorKind::PipelineNotFound,
                "step" => ErrorKind::StepNotFound,
                _ => ErrorKind::Storage,
            },
            EngineError::Store(pipewright_store::StoreError::NameUsed(_)) => ErrorKind::PipelineNameUsed,
            EngineError::Store(pipewright_store::StoreError::Conflict(_)) => ErrorKind::VersionNotDraft,
            EngineError::Store(_) => ErrorKind::Storage,
            EngineError::Sla(_) | EngineError::Delegation(_) => ErrorKind::ExternalService,
            EngineError::Bus(_) => ErrorKind::Bus,
            EngineError::Serde(_) => ErrorKind::BodyParse,
        }
    }

    pub fn is_rejection(&self) -> bool {
        matches!(self, EngineError::Rejected { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipewright_store::StoreError;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            EngineError::Store(StoreError::not_found("task", 7)).kind(),
            ErrorKind::TaskNotFound
        );
        assert_eq!(
            EngineError::rejected(ErrorKind::DecisionAlreadySet, "x").kind().status(),
            400
        );
        assert_eq!(EngineError::block("boom").kind(), ErrorKind::UpdateBlock);
        assert!(!EngineError::block("boom").is_rejection());
    }
}
