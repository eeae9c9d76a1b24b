//! Bus consumers that feed the engine.
//!
//! Storage failures are reported as [`BusError::Store`] so the message
//! stays parked in the inbox and is replayed on the next start. A reply for
//! a paused task is [`BusError::Deferred`] and is retried once the task
//! runs again. Any other failure is final for that message.

use std::sync::Arc;

use async_trait::async_trait;
use pipewright_bus::{BusError, Envelope, FunctionReply, MessageHandler, RunTaskMessage};
use pipewright_types::ErrorKind;
use serde_json::Value;
use tracing::{debug, info};

use crate::EngineError;
use crate::orchestrator::{Engine, RunRequest};

fn to_bus(err: EngineError) -> BusError {
    match err {
        EngineError::Store(e) => BusError::Store(e),
        EngineError::Rejected {
            kind: ErrorKind::TaskIsPaused,
            detail,
        } => BusError::Deferred(detail),
        other => BusError::Handler(other.to_string()),
    }
}

/// Delivers function runner replies.
pub struct FunctionReplyHandler {
    engine: Arc<Engine>,
}

impl FunctionReplyHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl MessageHandler for FunctionReplyHandler {
    async fn handle(&self, envelope: &Envelope) -> pipewright_bus::Result<()> {
        let reply: FunctionReply = serde_json::from_str(&envelope.payload)?;
        debug!(step_id = %reply.step_id, attempt = reply.attempt, "function reply");
        self.engine.handle_function_reply(reply).await.map_err(to_bus)
    }
}

/// Starts tasks requested by other systems.
pub struct RunTaskHandler {
    engine: Arc<Engine>,
}

impl RunTaskHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl MessageHandler for RunTaskHandler {
    async fn handle(&self, envelope: &Envelope) -> pipewright_bus::Result<()> {
        let msg: RunTaskMessage = serde_json::from_str(&envelope.payload)?;
        let initiator = (!msg.as_other.is_empty()).then(|| msg.as_other.clone());
        let work_title = (!msg.custom_title.is_empty()).then(|| msg.custom_title.clone());
        let task = self
            .engine
            .run_by_pipeline(
                msg.pipeline_id,
                RunRequest {
                    author: msg.username.clone(),
                    initiator,
                    work_title,
                    parameters: Value::Object(msg.application_body),
                    is_test: msg.is_test_application,
                    ..RunRequest::default()
                },
            )
            .await
            .map_err(to_bus)?;
        info!(
            work_number = task.work_number,
            pipeline_id = %msg.pipeline_id,
            client_id = %msg.client_id,
            "task started from bus"
        );
        Ok(())
    }
}
