//! Caller identity.
//!
//! Authentication happens in front of this service; the gateway forwards
//! the authenticated login in a header.

use axum::{body::Body, extract::Request, middleware::Next, response::Response};
use serde::{Deserialize, Serialize};

use crate::error::ServerError;

/// Header carrying the authenticated user login.
pub const USER_LOGIN_HEADER: &str = "x-user-login";

/// The login a request acts as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller(pub String);

impl Caller {
    pub fn login(&self) -> &str {
        &self.0
    }
}

/// Require `x-user-login` and put a [`Caller`] in the request extensions.
pub async fn identity_middleware(
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, ServerError> {
    let login = request
        .headers()
        .get(USER_LOGIN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(ServerError::MissingIdentity)?
        .to_string();

    request.extensions_mut().insert(Caller(login));
    Ok(next.run(request).await)
}
