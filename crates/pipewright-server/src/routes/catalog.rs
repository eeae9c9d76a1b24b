//! Block catalog for the pipeline editor.

use axum::{Json, extract::State};
use pipewright_engine::{BlockModel, catalog};
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Clone, Serialize)]
pub struct CatalogResponse {
    pub blocks: Vec<BlockModel>,
}

pub async fn catalog_handler(State(state): State<AppState>) -> Json<CatalogResponse> {
    let expose_placeholder = state.engine.options().expose_placeholder;
    Json(CatalogResponse {
        blocks: catalog(expose_placeholder),
    })
}
