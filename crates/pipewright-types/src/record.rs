//! Durable records shared by the store, the engine and the HTTP layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::block::{BlockKind, PipelineGraph, VersionStatus};
use crate::status::{HumanStatus, StepStatus, TaskStatus};

/// A named pipeline; its graphs live in versions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRecord {
    pub id: Uuid,
    pub name: String,
    pub author: String,
    pub created_at: DateTime<Utc>,
}

/// One immutable version of a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub id: Uuid,
    pub pipeline_id: Uuid,
    pub pipeline_name: String,
    pub status: VersionStatus,
    pub author: String,
    pub comment: String,
    pub graph: PipelineGraph,
    pub created_at: DateTime<Utc>,
}

/// Per-version process settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionSettings {
    pub version_id: Uuid,
    /// Whole-process SLA in working hours.
    #[serde(default)]
    pub sla: f32,
    #[serde(default = "default_work_type")]
    pub work_type: String,
    /// Approval lists, external systems and subscriptions, kept opaque.
    #[serde(default)]
    pub extra: Value,
}

fn default_work_type() -> String {
    "8/5".to_string()
}

/// A running or finished instance of a pipeline version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub work_number: i64,
    pub work_title: String,
    pub version_id: Uuid,
    pub author: String,
    pub initiator: String,
    pub parameters: Value,
    pub status: TaskStatus,
    pub human_status: HumanStatus,
    #[serde(default)]
    pub human_status_comment: String,
    pub started_at: DateTime<Utc>,
    pub last_changed_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub rate: Option<i32>,
    pub rate_comment: Option<String>,
    pub is_test: bool,
    pub is_paused: bool,
    pub parent_work_number: Option<i64>,
    pub child_work_number: Option<i64>,
}

impl Task {
    /// Whether an ordinary update may advance the task.
    pub fn is_runnable(&self) -> bool {
        matches!(self.status, TaskStatus::Created | TaskStatus::Running) && !self.is_paused
    }
}

/// One visit to a block within a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: Uuid,
    pub task_id: Uuid,
    pub name: String,
    pub kind: BlockKind,
    pub time: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: StepStatus,
    pub has_error: bool,
    pub is_paused: bool,
    /// Block name to kind-specific state.
    pub state: Map<String, Value>,
    /// Flat variable snapshot (`block.key` to value).
    pub storage: Map<String, Value>,
    /// Block names visited so far.
    pub steps: Vec<String>,
    pub errors: Vec<String>,
    #[serde(default)]
    pub stop_points: StopPoints,
}

impl Step {
    /// This step's own block state.
    pub fn block_state(&self) -> Option<&Value> {
        self.state.get(&self.name)
    }
}

/// Debugging breakpoints carried with a task's variables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StopPoints {
    pub break_points: Vec<String>,
    pub step_over: Vec<String>,
    /// Blocks traversed as no-op pass-throughs.
    pub excluded: Vec<String>,
    pub start_point: Option<String>,
}

impl StopPoints {
    pub fn is_excluded(&self, block: &str) -> bool {
        self.excluded.iter().any(|b| b == block)
    }

    pub fn is_break_point(&self, block: &str) -> bool {
        self.break_points.iter().any(|b| b == block)
    }

    pub fn is_empty(&self) -> bool {
        self.break_points.is_empty()
            && self.step_over.is_empty()
            && self.excluded.is_empty()
            && self.start_point.is_none()
    }
}

/// A person attached to a step (approver, executor, signer ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub login: String,
    #[serde(default)]
    pub is_acted: bool,
}

impl Member {
    pub fn new(login: impl Into<String>) -> Self {
        Self {
            login: login.into(),
            is_acted: false,
        }
    }
}

wire_enum! {
    /// Kinds of audit entries on a task's timeline.
    pub enum EventType {
        Start => "start",
        Pause => "pause",
        Edit => "edit",
    }
}

/// Append-only audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub id: Uuid,
    pub task_id: Uuid,
    pub author: String,
    pub event_type: EventType,
    pub params: Value,
    pub created_at: DateTime<Utc>,
}

wire_enum! {
    /// What a monitoring edit rewrites.
    pub enum EditChangeType {
        Context => "context",
        State => "state",
        Output => "output",
    }
}

/// One monitoring-driven edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditRecord {
    pub id: Uuid,
    pub event_id: Uuid,
    pub step_id: Uuid,
    pub step_name: String,
    pub author: String,
    pub change_type: EditChangeType,
    pub content: Value,
    pub created_at: DateTime<Utc>,
}

/// Snapshot of a step taken right before an edit touched it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviousContent {
    pub id: Uuid,
    pub step_id: Uuid,
    pub event_id: Uuid,
    pub state: Map<String, Value>,
    pub storage: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}
