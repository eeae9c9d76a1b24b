//! Per-advancement context: the task frame, the effect buffer and the
//! view a block gets while it runs.

use chrono::{DateTime, Utc};
use pipewright_bus::{FunctionRequest, SdEvent};
use pipewright_delegation::Delegations;
use pipewright_types::{
    BlockDefinition, ErrorKind, PipelineGraph, Task, UpdateAction, UpdateDescriptor, VersionRecord,
    VersionSettings,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use uuid::Uuid;

use crate::services::{Mail, Services};
use crate::variables::VariableStore;
use crate::{EngineError, Result};

/// What a block may know about the task it runs in.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskFrame {
    pub task_id: Uuid,
    pub work_number: i64,
    pub work_title: String,
    pub initiator: String,
    pub author: String,
    pub version_id: Uuid,
    pub pipeline_name: String,
    pub is_test: bool,
    pub parameters: Value,
}

impl TaskFrame {
    pub fn new(task: &Task, version: &VersionRecord) -> Self {
        Self {
            task_id: task.id,
            work_number: task.work_number,
            work_title: task.work_title.clone(),
            initiator: task.initiator.clone(),
            author: task.author.clone(),
            version_id: version.id,
            pipeline_name: version.pipeline_name.clone(),
            is_test: task.is_test,
            parameters: task.parameters.clone(),
        }
    }
}

/// A function call waiting to be written to the outbox.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRequest {
    pub request: FunctionRequest,
    pub not_before: DateTime<Utc>,
}

/// Side effects collected during an advancement.
///
/// Requests and service-desk events become outbox rows inside the
/// transaction; mails are sent only after it committed.
#[derive(Debug, Default)]
pub struct Effects {
    pub requests: Vec<PendingRequest>,
    pub events: Vec<SdEvent>,
    pub mails: Vec<Mail>,
}

impl Effects {
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty() && self.events.is_empty() && self.mails.is_empty()
    }
}

/// Everything one advancement carries from its trigger to its commit.
#[derive(Debug)]
pub struct RunContext {
    pub frame: TaskFrame,
    pub graph: PipelineGraph,
    pub settings: VersionSettings,
    pub delegations: Delegations,
    pub request_id: Option<String>,
    /// Advance exactly one block, then stop.
    pub once_productive: bool,
    pub effects: Effects,
}

/// The view a block gets while it runs.
pub struct BlockCtx<'a> {
    pub name: &'a str,
    pub def: &'a BlockDefinition,
    pub step_id: Uuid,
    pub step_time: DateTime<Utc>,
    pub frame: &'a TaskFrame,
    pub graph: &'a PipelineGraph,
    pub vars: &'a mut VariableStore,
    pub update: Option<&'a UpdateDescriptor>,
    pub delegations: &'a Delegations,
    pub services: &'a Services,
    pub effects: &'a mut Effects,
    pub now: DateTime<Utc>,
    /// Predecessors that have fired into this block (parallel barrier).
    pub arrivals: &'a [String],
}

impl BlockCtx<'_> {
    pub fn action(&self) -> Option<UpdateAction> {
        self.update.map(|u| u.action)
    }

    pub fn by_login(&self) -> &str {
        self.update.map(|u| u.by_login.as_str()).unwrap_or_default()
    }

    /// Decode the update parameters; a malformed body is a rejection.
    pub fn params<T: DeserializeOwned>(&self) -> Result<T> {
        let Some(update) = self.update else {
            return Err(EngineError::rejected(ErrorKind::Validation, "no update data"));
        };
        update
            .params()
            .map_err(|e| EngineError::rejected(ErrorKind::BodyParse, e.to_string()))
    }

    pub fn event(&mut self, event: &str, payload: Value) {
        self.effects.events.push(SdEvent {
            task_id: self.frame.task_id,
            work_number: self.frame.work_number,
            step_name: self.name.to_string(),
            event: event.to_string(),
            status: String::new(),
            human_status: String::new(),
            payload,
            created_at: self.now,
        });
    }
}
