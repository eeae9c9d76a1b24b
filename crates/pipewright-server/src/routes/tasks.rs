//! Task lifecycle endpoints: run, read, list, update, stop and rate.

use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use pipewright_engine::{RunRequest, TaskView};
use pipewright_store::TaskFilter;
use pipewright_types::{Task, TaskStatus, UpdateAction, UpdateDescriptor};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::{ApiJson, parse_work_number};
use crate::error::ServerError;
use crate::identity::Caller;
use crate::middleware::RequestId;
use crate::state::AppState;

const MAX_PAGE: u32 = 500;

// ─────────────────────────────────────────────────────────────────────────────
// Types
// ─────────────────────────────────────────────────────────────────────────────

/// Body for starting a task.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RunTaskRequest {
    pub version_id: Option<Uuid>,
    pub pipeline_id: Option<Uuid>,
    pub parameters: Value,
    pub work_title: Option<String>,
    /// Start on behalf of another login.
    pub as_other: Option<String>,
    pub is_test: bool,
}

/// Query params for listing tasks.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ListTasksQuery {
    /// Comma-separated statuses.
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub initiator: Option<String>,
    #[serde(default)]
    pub pipeline_id: Option<Uuid>,
    #[serde(default)]
    pub version_id: Option<Uuid>,
    #[serde(default)]
    pub is_test: Option<bool>,
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

fn default_limit() -> u32 {
    50
}

impl ListTasksQuery {
    fn filter(&self) -> Result<TaskFilter, ServerError> {
        let statuses = match self.status.as_deref().filter(|s| !s.is_empty()) {
            Some(raw) => Some(
                raw.split(',')
                    .map(|s| s.trim().parse::<TaskStatus>())
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| ServerError::Validation(e.to_string()))?,
            ),
            None => None,
        };
        Ok(TaskFilter {
            initiator: self.initiator.clone(),
            statuses,
            version_id: self.version_id,
            pipeline_id: self.pipeline_id,
            is_test: self.is_test,
            newest_first: true,
            limit: Some(self.limit.clamp(1, MAX_PAGE)),
            offset: Some(self.offset),
            ..TaskFilter::default()
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ListTasksResponse {
    pub tasks: Vec<Task>,
    pub total: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CountResponse {
    pub count: i64,
}

/// A user action on the task.
#[derive(Debug, Clone, Deserialize)]
pub struct UpdateTaskRequest {
    pub action: UpdateAction,
    #[serde(default)]
    pub step_name: Option<String>,
    #[serde(default)]
    pub parameters: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StopTasksRequest {
    pub work_numbers: Vec<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StopTasksResponse {
    pub stopped: Vec<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateTaskRequest {
    pub rate: i32,
    #[serde(default)]
    pub comment: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

fn run_request(caller: &Caller, request_id: &RequestId, req: RunTaskRequest) -> RunRequest {
    RunRequest {
        version_id: req.version_id.unwrap_or_default(),
        author: caller.login().to_string(),
        initiator: req.as_other.filter(|s| !s.is_empty()),
        work_title: req.work_title,
        parameters: req.parameters,
        is_test: req.is_test,
        parent_work_number: None,
        request_id: Some(request_id.0.clone()),
    }
}

pub async fn run_by_version_handler(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Extension(request_id): Extension<RequestId>,
    ApiJson(req): ApiJson<RunTaskRequest>,
) -> Result<(StatusCode, Json<Task>), ServerError> {
    if req.version_id.is_none() {
        return Err(ServerError::Validation("version_id is required".into()));
    }
    let task = state
        .engine
        .run_task(run_request(&caller, &request_id, req))
        .await?;
    Ok((StatusCode::CREATED, Json(task)))
}

pub async fn run_by_pipeline_handler(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Extension(request_id): Extension<RequestId>,
    ApiJson(req): ApiJson<RunTaskRequest>,
) -> Result<(StatusCode, Json<Task>), ServerError> {
    let Some(pipeline_id) = req.pipeline_id else {
        return Err(ServerError::Validation("pipeline_id is required".into()));
    };
    let task = state
        .engine
        .run_by_pipeline(pipeline_id, run_request(&caller, &request_id, req))
        .await?;
    Ok((StatusCode::CREATED, Json(task)))
}

pub async fn run_new_by_prev_handler(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(work_number): Path<String>,
) -> Result<(StatusCode, Json<Task>), ServerError> {
    let task = state
        .engine
        .run_new_by_prev(parse_work_number(&work_number)?, caller.login())
        .await?;
    Ok((StatusCode::CREATED, Json(task)))
}

pub async fn get_task_handler(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(work_number): Path<String>,
) -> Result<Json<TaskView>, ServerError> {
    let view = state
        .engine
        .task_for(parse_work_number(&work_number)?, caller.login())
        .await?;
    Ok(Json(view))
}

pub async fn list_tasks_handler(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Query(query): Query<ListTasksQuery>,
) -> Result<Json<ListTasksResponse>, ServerError> {
    let (tasks, total) = state.engine.list_tasks(caller.login(), query.filter()?).await?;
    Ok(Json(ListTasksResponse { tasks, total }))
}

pub async fn count_tasks_handler(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Query(query): Query<ListTasksQuery>,
) -> Result<Json<CountResponse>, ServerError> {
    let count = state.engine.count_tasks(caller.login(), query.filter()?).await?;
    Ok(Json(CountResponse { count }))
}

pub async fn update_task_handler(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Extension(request_id): Extension<RequestId>,
    Path(work_number): Path<String>,
    ApiJson(req): ApiJson<UpdateTaskRequest>,
) -> Result<StatusCode, ServerError> {
    let update = UpdateDescriptor::new(req.action, caller.login(), req.parameters);
    state
        .engine
        .update_task(
            parse_work_number(&work_number)?,
            req.step_name.as_deref(),
            update,
            Some(request_id.0),
        )
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn stop_tasks_handler(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    ApiJson(req): ApiJson<StopTasksRequest>,
) -> Result<Json<StopTasksResponse>, ServerError> {
    if req.work_numbers.is_empty() {
        return Err(ServerError::Validation("work_numbers is empty".into()));
    }
    let stopped = state
        .engine
        .stop_tasks(&req.work_numbers, caller.login())
        .await?;
    Ok(Json(StopTasksResponse { stopped }))
}

pub async fn rate_task_handler(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(work_number): Path<String>,
    ApiJson(req): ApiJson<RateTaskRequest>,
) -> Result<StatusCode, ServerError> {
    state.engine.rate_task(
        parse_work_number(&work_number)?,
        caller.login(),
        req.rate,
        req.comment.as_deref(),
    )?;
    Ok(StatusCode::NO_CONTENT)
}
