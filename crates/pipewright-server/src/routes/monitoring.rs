//! Monitoring endpoints: full task view, events, block reads, pause and
//! restart, block edits.

use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
};
use pipewright_engine::{BlockData, EventView, TaskAction, TaskView};
use pipewright_types::EditChangeType;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{ApiJson, parse_work_number};
use crate::error::ServerError;
use crate::identity::Caller;
use crate::state::AppState;

#[derive(Debug, Clone, Serialize)]
pub struct EventsResponse {
    pub events: Vec<EventView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorsResponse {
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskActionRequest {
    pub action: TaskAction,
    /// Blocks to pause or restart.
    #[serde(default)]
    pub steps: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateBlockRequest {
    pub change_type: EditChangeType,
    pub data: Value,
}

pub async fn monitoring_task_handler(
    State(state): State<AppState>,
    Path(work_number): Path<String>,
) -> Result<Json<TaskView>, ServerError> {
    Ok(Json(state.engine.monitoring_task(parse_work_number(&work_number)?)?))
}

pub async fn task_events_handler(
    State(state): State<AppState>,
    Path(work_number): Path<String>,
) -> Result<Json<EventsResponse>, ServerError> {
    let events = state.engine.task_events(parse_work_number(&work_number)?)?;
    Ok(Json(EventsResponse { events }))
}

pub async fn block_inputs_handler(
    State(state): State<AppState>,
    Path((work_number, block)): Path<(String, String)>,
) -> Result<Json<BlockData>, ServerError> {
    Ok(Json(state.engine.block_inputs(parse_work_number(&work_number)?, &block)?))
}

pub async fn block_outputs_handler(
    State(state): State<AppState>,
    Path((work_number, block)): Path<(String, String)>,
) -> Result<Json<BlockData>, ServerError> {
    Ok(Json(state.engine.block_outputs(parse_work_number(&work_number)?, &block)?))
}

pub async fn block_state_handler(
    State(state): State<AppState>,
    Path((work_number, block)): Path<(String, String)>,
) -> Result<Json<BlockData>, ServerError> {
    Ok(Json(state.engine.block_state(parse_work_number(&work_number)?, &block)?))
}

pub async fn block_context_handler(
    State(state): State<AppState>,
    Path((work_number, block)): Path<(String, String)>,
) -> Result<Json<Map<String, Value>>, ServerError> {
    Ok(Json(state.engine.block_context(parse_work_number(&work_number)?, &block)?))
}

pub async fn block_errors_handler(
    State(state): State<AppState>,
    Path((work_number, block)): Path<(String, String)>,
) -> Result<Json<ErrorsResponse>, ServerError> {
    let errors = state.engine.block_errors(parse_work_number(&work_number)?, &block)?;
    Ok(Json(ErrorsResponse { errors }))
}

pub async fn not_created_inputs_handler(
    State(state): State<AppState>,
    Path((work_number, block)): Path<(String, String)>,
) -> Result<Json<Map<String, Value>>, ServerError> {
    let inputs = state
        .engine
        .not_created_block_inputs(parse_work_number(&work_number)?, &block)?;
    Ok(Json(inputs))
}

pub async fn task_action_handler(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(work_number): Path<String>,
    ApiJson(req): ApiJson<TaskActionRequest>,
) -> Result<StatusCode, ServerError> {
    let work_number = parse_work_number(&work_number)?;
    match req.action {
        TaskAction::Pause => {
            let steps = (!req.steps.is_empty()).then_some(req.steps.as_slice());
            state.engine.pause(work_number, caller.login(), steps)?;
        }
        TaskAction::Start => {
            state
                .engine
                .start(work_number, caller.login(), &req.steps, false)
                .await?;
        }
        TaskAction::StartByOne => {
            if req.steps.is_empty() {
                return Err(ServerError::Validation("start_by_one needs a block".into()));
            }
            state
                .engine
                .start(work_number, caller.login(), &req.steps, true)
                .await?;
        }
    }
    Ok(StatusCode::NO_CONTENT)
}

pub async fn update_block_handler(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path((work_number, block)): Path<(String, String)>,
    ApiJson(req): ApiJson<UpdateBlockRequest>,
) -> Result<StatusCode, ServerError> {
    state.engine.edit_block(
        parse_work_number(&work_number)?,
        caller.login(),
        &block,
        req.change_type,
        req.data,
    )?;
    Ok(StatusCode::NO_CONTENT)
}
