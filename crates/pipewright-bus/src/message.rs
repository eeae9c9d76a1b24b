//! Wire messages exchanged with the function runner and the service desk.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Topic names the bus publishes to and consumes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    /// Outbound function calls.
    pub function_out: String,
    /// Replies from the function runner.
    pub function_in: String,
    /// Inbound task triggers.
    pub run_task: String,
    /// Outbound audit events for the service desk.
    pub sd_events: String,
}

impl Default for Topics {
    fn default() -> Self {
        Self {
            function_out: "function-out".to_string(),
            function_in: "function-in".to_string(),
            run_task: "run-task".to_string(),
            sd_events: "sd-events".to_string(),
        }
    }
}

/// A call to an external function, keyed by the step that awaits it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionRequest {
    pub step_id: Uuid,
    /// Incremented on every (re)publish; replies echo it back.
    pub attempt: u32,
    pub task_id: Uuid,
    pub work_number: i64,
    pub function_id: String,
    #[serde(default)]
    pub version: String,
    pub function_name: String,
    #[serde(default)]
    pub function_mapping: Map<String, Value>,
    #[serde(default)]
    pub retry_policy: String,
    #[serde(default)]
    pub system_stand: String,
}

impl FunctionRequest {
    pub fn key(&self) -> String {
        self.step_id.to_string()
    }
}

/// A result from the function runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionReply {
    pub step_id: Uuid,
    #[serde(default)]
    pub attempt: u32,
    #[serde(default)]
    pub function_mapping: Map<String, Value>,
    /// Ask the engine to publish the request again.
    #[serde(default)]
    pub do_retry: bool,
    /// Transport-level failure reported by the runner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

/// A request to start a task, received from another system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunTaskMessage {
    pub pipeline_id: Uuid,
    #[serde(default)]
    pub username: String,
    /// Act on behalf of this login.
    #[serde(default)]
    pub as_other: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub custom_title: String,
    #[serde(default)]
    pub application_body: Map<String, Value>,
    #[serde(default)]
    pub keys: BTreeMap<String, String>,
    #[serde(default)]
    pub attachment_fields: Vec<String>,
    #[serde(default)]
    pub is_test_application: bool,
    #[serde(default)]
    pub client_id: String,
}

/// A task state change reported to the service desk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SdEvent {
    pub task_id: Uuid,
    pub work_number: i64,
    pub step_name: String,
    pub event: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub human_status: String,
    #[serde(default)]
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

impl SdEvent {
    pub fn key(&self) -> String {
        self.work_number.to_string()
    }
}
