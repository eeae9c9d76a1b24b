//! Server configuration.

use std::net::SocketAddr;
use std::time::Duration;

use pipewright_config::HttpConfig;

use crate::error::{Result, ServerError};

/// Default time a request may take before it is answered with 408.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the server to.
    pub bind_address: SocketAddr,

    /// Upper bound on the time spent on one request.
    pub request_timeout: Duration,

    /// Path of the liveness probe.
    pub liveness_path: String,

    /// Path of the readiness probe; it pings the store.
    pub readiness_path: String,

    /// Enable request logging.
    pub request_logging: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([0, 0, 0, 0], 8181)),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            liveness_path: "/healthz".to_string(),
            readiness_path: "/readyz".to_string(),
            request_logging: true,
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from the `http` section of the YAML configuration.
    pub fn from_http(http: &HttpConfig) -> Result<Self> {
        let bind_address = http
            .addr
            .parse()
            .map_err(|e| ServerError::Config(format!("invalid http.addr {:?}: {e}", http.addr)))?;
        Ok(Self {
            bind_address,
            request_timeout: Duration::from_secs(http.request_timeout_secs.max(1)),
            liveness_path: http.liveness_path.clone(),
            readiness_path: http.readiness_path.clone(),
            request_logging: true,
        })
    }

    pub fn with_bind_address(mut self, addr: SocketAddr) -> Self {
        self.bind_address = addr;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_request_logging(mut self, enabled: bool) -> Self {
        self.request_logging = enabled;
        self
    }
}
