//! Liveness and readiness probes.

use axum::{Json, Router, extract::State, routing::get};
use serde::{Deserialize, Serialize};

use crate::error::ServerError;
use crate::state::AppState;

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Service status.
    pub status: String,
    /// Service version.
    pub version: String,
}

fn ok() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// The process is up.
pub async fn liveness(State(state): State<AppState>) -> Result<Json<HealthResponse>, ServerError> {
    ping(&state)?;
    Ok(ok())
}

/// The process can serve: the store answers.
pub async fn readiness(State(state): State<AppState>) -> Result<Json<HealthResponse>, ServerError> {
    ping(&state)?;
    Ok(ok())
}

fn ping(state: &AppState) -> Result<(), ServerError> {
    state
        .engine
        .store()
        .ping()
        .map_err(|e| ServerError::ServiceUnavailable(e.to_string()))
}

/// Probe routes at the configured paths.
pub fn health_routes(state: &AppState) -> Router<AppState> {
    Router::new()
        .route(&state.config.liveness_path, get(liveness))
        .route(&state.config.readiness_path, get(readiness))
}
