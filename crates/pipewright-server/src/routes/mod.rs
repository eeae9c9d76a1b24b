//! API routes.

pub mod catalog;
pub mod health;
pub mod monitoring;
pub mod pipelines;
pub mod tasks;

use axum::{
    Json,
    extract::{FromRequest, Request, rejection::JsonRejection},
};
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::error::ServerError;

pub use health::health_routes;

/// JSON body whose parse failures use the API error format.
pub struct ApiJson<T>(pub T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ServerError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|e: JsonRejection| ServerError::BodyParse(e.body_text()))?;
        Ok(Self(value))
    }
}

pub(crate) fn parse_uuid(raw: &str) -> Result<Uuid, ServerError> {
    Uuid::parse_str(raw).map_err(|_| ServerError::BodyParse(format!("invalid id {raw:?}")))
}

pub(crate) fn parse_work_number(raw: &str) -> Result<i64, ServerError> {
    raw.parse()
        .map_err(|_| ServerError::BodyParse(format!("invalid work number {raw:?}")))
}
