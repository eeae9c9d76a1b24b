//! HTTP API for pipewright.
//!
//! Thin axum handlers over [`pipewright_engine::Engine`]: pipeline and
//! version management, running and advancing tasks, and the monitoring
//! surface used by administrators.
//!
//! # Features
//!
//! - Pipeline, version and settings management
//! - Task run, update, stop and rating
//! - Monitoring reads, pause/restart and block edits
//! - Liveness and readiness probes
//! - Request ids and request logging
//!
//! The caller is identified by the `x-user-login` header set by the
//! gateway in front of the service. Every error is answered with
//! `{status_code, error, description}`.
//!
//! # Example
//!
//! ```ignore
//! use pipewright_server::{Server, ServerConfig};
//!
//! let server = Server::new(engine, ServerConfig::from_http(&config.http)?);
//! server.run(shutdown).await?;
//! ```

pub mod config;
pub mod error;
pub mod identity;
pub mod middleware;
pub mod routes;
pub mod state;

pub use config::ServerConfig;
pub use error::{ErrorResponse, Result, ServerError};
pub use identity::{Caller, USER_LOGIN_HEADER, identity_middleware};
pub use middleware::{REQUEST_ID_HEADER, RequestId, request_id_middleware, request_logging_middleware};
pub use state::AppState;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{Router, middleware as axum_middleware};
use pipewright_engine::Engine;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::info;

use routes::{catalog, monitoring, pipelines, tasks};

/// The pipewright HTTP server.
pub struct Server {
    state: AppState,
}

impl Server {
    pub fn new(engine: Arc<Engine>, config: ServerConfig) -> Self {
        Self {
            state: AppState::new(engine, config),
        }
    }

    pub fn from_state(state: AppState) -> Self {
        Self { state }
    }

    /// Build the router with all routes and middleware.
    pub fn router(&self) -> Router {
        Router::new()
            // Probes carry no identity
            .merge(routes::health_routes(&self.state))
            .nest("/api/v1", self.api_routes())
            .layer(axum_middleware::from_fn_with_state(
                self.state.clone(),
                middleware::request_logging_middleware,
            ))
            // Outside request logging so the log line carries the id
            .layer(axum_middleware::from_fn(middleware::request_id_middleware))
            .layer(TimeoutLayer::new(self.state.config.request_timeout))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// API routes (v1). All of them require a caller login.
    fn api_routes(&self) -> Router<AppState> {
        use axum::routing::{get, post, put};

        Router::new()
            // Pipelines
            .route(
                "/pipelines",
                post(pipelines::create_pipeline_handler).get(pipelines::list_pipelines_handler),
            )
            .route("/pipelines/exists", get(pipelines::name_exists_handler))
            .route(
                "/pipelines/{id}",
                get(pipelines::get_pipeline_handler).delete(pipelines::delete_pipeline_handler),
            )
            .route("/pipelines/{id}/name", put(pipelines::rename_pipeline_handler))
            .route("/pipelines/{id}/copy", post(pipelines::copy_pipeline_handler))
            .route("/pipelines/{id}/versions", post(pipelines::create_version_handler))
            .route("/pipelines/{id}/tasks", get(pipelines::pipeline_tasks_handler))
            // Versions
            .route(
                "/versions/{id}",
                get(pipelines::get_version_handler).put(pipelines::update_version_handler),
            )
            .route("/versions/{id}/approve", post(pipelines::approve_version_handler))
            .route("/versions/{id}/reject", post(pipelines::reject_version_handler))
            .route(
                "/versions/{id}/settings",
                get(pipelines::get_settings_handler).put(pipelines::put_settings_handler),
            )
            // Tasks
            .route("/tasks", get(tasks::list_tasks_handler))
            .route("/tasks/count", get(tasks::count_tasks_handler))
            .route("/tasks/run-by-version", post(tasks::run_by_version_handler))
            .route("/tasks/run-by-pipeline", post(tasks::run_by_pipeline_handler))
            .route("/tasks/stop", post(tasks::stop_tasks_handler))
            .route("/tasks/{work_number}", get(tasks::get_task_handler))
            .route("/tasks/{work_number}/update", post(tasks::update_task_handler))
            .route("/tasks/{work_number}/rate", post(tasks::rate_task_handler))
            .route(
                "/tasks/{work_number}/run-new-by-prev",
                post(tasks::run_new_by_prev_handler),
            )
            // Monitoring
            .route(
                "/monitoring/tasks/{work_number}",
                get(monitoring::monitoring_task_handler),
            )
            .route(
                "/monitoring/tasks/{work_number}/events",
                get(monitoring::task_events_handler),
            )
            .route(
                "/monitoring/tasks/{work_number}/action",
                post(monitoring::task_action_handler),
            )
            .route(
                "/monitoring/tasks/{work_number}/blocks/{name}",
                put(monitoring::update_block_handler),
            )
            .route(
                "/monitoring/tasks/{work_number}/blocks/{name}/inputs",
                get(monitoring::block_inputs_handler),
            )
            .route(
                "/monitoring/tasks/{work_number}/blocks/{name}/outputs",
                get(monitoring::block_outputs_handler),
            )
            .route(
                "/monitoring/tasks/{work_number}/blocks/{name}/state",
                get(monitoring::block_state_handler),
            )
            .route(
                "/monitoring/tasks/{work_number}/blocks/{name}/context",
                get(monitoring::block_context_handler),
            )
            .route(
                "/monitoring/tasks/{work_number}/blocks/{name}/errors",
                get(monitoring::block_errors_handler),
            )
            .route(
                "/monitoring/tasks/{work_number}/blocks/{name}/not-created-inputs",
                get(monitoring::not_created_inputs_handler),
            )
            // Editor catalog
            .route("/blocks", get(catalog::catalog_handler))
            .layer(axum_middleware::from_fn(identity::identity_middleware))
    }

    /// Serve until `shutdown` is cancelled, then drain in-flight requests.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let addr = self.state.config.bind_address;
        let router = self.router();

        info!(%addr, "starting http server");

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Internal(format!("failed to bind {addr}: {e}")))?;

        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| ServerError::Internal(format!("server error: {e}")))?;

        info!("http server stopped");
        Ok(())
    }

    /// Health routes alone, for the metrics listener.
    pub fn health_router(&self) -> Router {
        routes::health_routes(&self.state)
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Serve [`Server::health_router`] on `addr` until `shutdown` is cancelled.
    pub async fn run_health(self, addr: SocketAddr, shutdown: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Internal(format!("failed to bind {addr}: {e}")))?;
        info!(%addr, "starting health listener");

        axum::serve(listener, self.health_router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| ServerError::Internal(format!("health listener error: {e}")))?;
        Ok(())
    }

    pub fn bind_address(&self) -> SocketAddr {
        self.state.config.bind_address
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use pipewright_engine::Services;
    use pipewright_store::Store;
    use tower::ServiceExt;

    fn server() -> Server {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let engine = Arc::new(Engine::new(store, Services::basic()));
        Server::new(engine, ServerConfig::new())
    }

    #[tokio::test]
    async fn test_liveness_needs_no_login() {
        let response = server()
            .router()
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key(REQUEST_ID_HEADER));
    }

    #[tokio::test]
    async fn test_unknown_route_is_not_found() {
        let response = server()
            .router()
            .oneshot(
                Request::builder()
                    .uri("/api/v2/pipelines")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_health_router_serves_only_health() {
        let router = server().health_router();
        let response = router
            .clone()
            .oneshot(Request::builder().uri("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/api/v1/blocks")
                    .header(USER_LOGIN_HEADER, "u1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_bind_address_from_config() {
        let config = ServerConfig::new().with_bind_address("127.0.0.1:9100".parse().unwrap());
        let store = Arc::new(Store::open_in_memory().unwrap());
        let server = Server::new(Arc::new(Engine::new(store, Services::basic())), config);
        assert_eq!(server.bind_address().port(), 9100);
    }
}
