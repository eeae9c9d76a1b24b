//! SQLite persistence for pipewright.
//!
//! One [`Store`] owns one connection. All table access goes through a
//! [`Tx`], so every engine operation either commits as a whole or leaves no
//! trace. Schema lives in `migrations/` and is applied on open.

mod error;
mod events;
mod outbox;
mod pipelines;
mod rows;
mod steps;
mod store;
mod tasks;

pub use error::{Result, StoreError};
pub use outbox::{InboxMessage, OutboxMessage};
pub use pipelines::PipelineSummary;
pub use steps::DueDeadline;
pub use store::{Store, Tx};
pub use tasks::{NewTask, TaskFilter};

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::BTreeMap;

    use chrono::{DateTime, Utc};
    use pipewright_types::{BlockDefinition, BlockKind, PipelineGraph, Step, StepStatus, DEFAULT_SOCKET};
    use uuid::Uuid;

    use crate::{NewTask, Result, Tx};

    pub fn graph() -> PipelineGraph {
        let mut blocks = BTreeMap::new();
        blocks.insert(
            "start_0".to_string(),
            BlockDefinition::new(BlockKind::Start).with_socket(DEFAULT_SOCKET, &["end_0"]),
        );
        blocks.insert("end_0".to_string(), BlockDefinition::new(BlockKind::End));
        PipelineGraph {
            entrypoint: "start_0".into(),
            blocks,
            inputs: vec![],
            outputs: vec![],
        }
    }

    pub fn seed_version(tx: &Tx<'_>) -> Result<Uuid> {
        let name = format!("pipeline-{}", Uuid::new_v4());
        let pipeline = tx.create_pipeline(&name, "author")?;
        Ok(tx.create_version(pipeline.id, "author", &graph(), "")?.id)
    }

    pub fn seed_task(tx: &Tx<'_>) -> Result<Uuid> {
        let version_id = seed_version(tx)?;
        let task = tx.create_task(NewTask {
            version_id,
            work_title: "t".into(),
            author: "u1".into(),
            initiator: "u1".into(),
            parameters: serde_json::Value::Null,
            is_test: false,
            parent_work_number: None,
        })?;
        Ok(task.id)
    }

    pub fn step(task_id: Uuid, name: &str, kind: BlockKind, time: DateTime<Utc>) -> Step {
        Step {
            id: Uuid::new_v4(),
            task_id,
            name: name.to_string(),
            kind,
            time,
            updated_at: time,
            status: StepStatus::Idle,
            has_error: false,
            is_paused: false,
            state: Default::default(),
            storage: Default::default(),
            steps: vec![],
            errors: vec![],
            stop_points: Default::default(),
        }
    }
}
