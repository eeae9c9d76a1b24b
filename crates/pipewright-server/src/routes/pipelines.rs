//! Pipeline, version and version-settings endpoints.

use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use chrono::{DateTime, Utc};
use pipewright_store::{PipelineSummary, TaskFilter};
use pipewright_types::{PipelineRecord, Task, VersionRecord, VersionSettings, VersionStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::{ApiJson, parse_uuid};
use crate::error::ServerError;
use crate::identity::Caller;
use crate::state::AppState;

// ─────────────────────────────────────────────────────────────────────────────
// Types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct CreatePipelineRequest {
    pub name: String,
    pub graph: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineWithVersion {
    pub pipeline: PipelineRecord,
    pub version: VersionRecord,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ListPipelinesQuery {
    #[serde(default)]
    pub search: Option<String>,
}

/// One row of the pipeline list.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineListItem {
    pub id: Uuid,
    pub name: String,
    pub author: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_version_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_version_status: Option<VersionStatus>,
}

impl From<PipelineSummary> for PipelineListItem {
    fn from(s: PipelineSummary) -> Self {
        Self {
            id: s.pipeline.id,
            name: s.pipeline.name,
            author: s.pipeline.author,
            created_at: s.pipeline.created_at,
            latest_version_id: s.latest_version.as_ref().map(|v| v.id),
            latest_version_status: s.latest_version.as_ref().map(|v| v.status),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ListPipelinesResponse {
    pub pipelines: Vec<PipelineListItem>,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineDetail {
    pub pipeline: PipelineRecord,
    pub versions: Vec<VersionRecord>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NameRequest {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NameQuery {
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct NameExistsResponse {
    pub exists: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VersionRequest {
    pub graph: Value,
    #[serde(default)]
    pub comment: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineTasksResponse {
    pub tasks: Vec<Task>,
    pub total: i64,
}

/// Settings body; the version comes from the path.
#[derive(Debug, Clone, Deserialize)]
pub struct SettingsRequest {
    #[serde(default)]
    pub sla: f32,
    #[serde(default = "default_work_type")]
    pub work_type: String,
    #[serde(default)]
    pub extra: Value,
}

fn default_work_type() -> String {
    "8/5".to_string()
}

// ─────────────────────────────────────────────────────────────────────────────
// Pipelines
// ─────────────────────────────────────────────────────────────────────────────

pub async fn create_pipeline_handler(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    ApiJson(req): ApiJson<CreatePipelineRequest>,
) -> Result<(StatusCode, Json<PipelineWithVersion>), ServerError> {
    let (pipeline, version) = state
        .engine
        .create_pipeline(&req.name, caller.login(), &req.graph)?;
    Ok((StatusCode::CREATED, Json(PipelineWithVersion { pipeline, version })))
}

pub async fn list_pipelines_handler(
    State(state): State<AppState>,
    Query(query): Query<ListPipelinesQuery>,
) -> Result<Json<ListPipelinesResponse>, ServerError> {
    let pipelines: Vec<PipelineListItem> = state
        .engine
        .list_pipelines(query.search.as_deref())?
        .into_iter()
        .map(PipelineListItem::from)
        .collect();
    let total = pipelines.len();
    Ok(Json(ListPipelinesResponse { pipelines, total }))
}

pub async fn get_pipeline_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PipelineDetail>, ServerError> {
    let (pipeline, versions) = state.engine.get_pipeline(parse_uuid(&id)?)?;
    Ok(Json(PipelineDetail { pipeline, versions }))
}

pub async fn rename_pipeline_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ApiJson(req): ApiJson<NameRequest>,
) -> Result<StatusCode, ServerError> {
    state.engine.rename_pipeline(parse_uuid(&id)?, &req.name)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_pipeline_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ServerError> {
    state.engine.delete_pipeline(parse_uuid(&id)?)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn copy_pipeline_handler(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
    ApiJson(req): ApiJson<NameRequest>,
) -> Result<(StatusCode, Json<PipelineWithVersion>), ServerError> {
    let (pipeline, version) = state
        .engine
        .copy_pipeline(parse_uuid(&id)?, &req.name, caller.login())?;
    Ok((StatusCode::CREATED, Json(PipelineWithVersion { pipeline, version })))
}

pub async fn name_exists_handler(
    State(state): State<AppState>,
    Query(query): Query<NameQuery>,
) -> Result<Json<NameExistsResponse>, ServerError> {
    let exists = state.engine.pipeline_name_exists(&query.name)?;
    Ok(Json(NameExistsResponse { exists }))
}

pub async fn pipeline_tasks_handler(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
) -> Result<Json<PipelineTasksResponse>, ServerError> {
    let filter = TaskFilter {
        pipeline_id: Some(parse_uuid(&id)?),
        newest_first: true,
        ..TaskFilter::default()
    };
    let (tasks, total) = state.engine.list_tasks(caller.login(), filter).await?;
    Ok(Json(PipelineTasksResponse { tasks, total }))
}

// ─────────────────────────────────────────────────────────────────────────────
// Versions
// ─────────────────────────────────────────────────────────────────────────────

pub async fn create_version_handler(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
    ApiJson(req): ApiJson<VersionRequest>,
) -> Result<(StatusCode, Json<VersionRecord>), ServerError> {
    let version = state.engine.create_version(
        parse_uuid(&id)?,
        caller.login(),
        &req.graph,
        &req.comment,
    )?;
    Ok((StatusCode::CREATED, Json(version)))
}

pub async fn get_version_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<VersionRecord>, ServerError> {
    Ok(Json(state.engine.get_version(parse_uuid(&id)?)?))
}

pub async fn update_version_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ApiJson(req): ApiJson<VersionRequest>,
) -> Result<Json<VersionRecord>, ServerError> {
    let version = state
        .engine
        .update_version(parse_uuid(&id)?, &req.graph, &req.comment)?;
    Ok(Json(version))
}

pub async fn approve_version_handler(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
) -> Result<Json<VersionRecord>, ServerError> {
    let version = state.engine.approve_version(parse_uuid(&id)?, caller.login())?;
    Ok(Json(version))
}

pub async fn reject_version_handler(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
) -> Result<Json<VersionRecord>, ServerError> {
    let version = state.engine.reject_version(parse_uuid(&id)?, caller.login())?;
    Ok(Json(version))
}

// ─────────────────────────────────────────────────────────────────────────────
// Settings
// ─────────────────────────────────────────────────────────────────────────────

pub async fn get_settings_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<VersionSettings>, ServerError> {
    Ok(Json(state.engine.version_settings(parse_uuid(&id)?)?))
}

pub async fn put_settings_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ApiJson(req): ApiJson<SettingsRequest>,
) -> Result<Json<VersionSettings>, ServerError> {
    let settings = VersionSettings {
        version_id: parse_uuid(&id)?,
        sla: req.sla,
        work_type: req.work_type,
        extra: req.extra,
    };
    state.engine.put_version_settings(&settings)?;
    Ok(Json(settings))
}
