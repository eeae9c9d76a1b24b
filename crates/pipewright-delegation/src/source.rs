//! Where delegations come from.

use std::time::Duration;

use async_trait::async_trait;
use pipewright_types::Delegation;
use serde::{Deserialize, Serialize};

use crate::delegations::Delegations;
use crate::error::{DelegationError, Result};

/// The shape of a delegation query; also the cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "filter", content = "value")]
pub enum DelegationRequest {
    ToLogin(String),
    FromLogin(String),
    ToLogins(Vec<String>),
    FromLogins(Vec<String>),
}

impl DelegationRequest {
    pub fn matches(&self, d: &Delegation) -> bool {
        match self {
            DelegationRequest::ToLogin(l) => &d.to_login == l,
            DelegationRequest::FromLogin(l) => &d.from_login == l,
            DelegationRequest::ToLogins(ls) => ls.contains(&d.to_login),
            DelegationRequest::FromLogins(ls) => ls.contains(&d.from_login),
        }
    }

    fn query(&self) -> (&'static str, String) {
        match self {
            DelegationRequest::ToLogin(l) => ("toLogin", l.clone()),
            DelegationRequest::FromLogin(l) => ("fromLogin", l.clone()),
            DelegationRequest::ToLogins(ls) => ("toLogins", ls.join(",")),
            DelegationRequest::FromLogins(ls) => ("fromLogins", ls.join(",")),
        }
    }
}

/// Remote human-tasks service.
#[async_trait]
pub trait DelegationSource: Send + Sync {
    async fn fetch(&self, request: &DelegationRequest) -> Result<Delegations>;
}

/// In-memory delegations, for configuration and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticDelegationSource {
    delegations: Vec<Delegation>,
}

impl StaticDelegationSource {
    pub fn new(delegations: Vec<Delegation>) -> Self {
        Self { delegations }
    }
}

#[async_trait]
impl DelegationSource for StaticDelegationSource {
    async fn fetch(&self, request: &DelegationRequest) -> Result<Delegations> {
        Ok(self
            .delegations
            .iter()
            .filter(|d| request.matches(d))
            .cloned()
            .collect())
    }
}

/// JSON-over-HTTP client for the delegation service.
///
/// `GET {base_url}/delegations?<filter>=<logins>` returning a JSON array.
#[derive(Debug, Clone)]
pub struct HttpDelegationSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDelegationSource {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl DelegationSource for HttpDelegationSource {
    async fn fetch(&self, request: &DelegationRequest) -> Result<Delegations> {
        let (key, value) = request.query();
        let response = self
            .client
            .get(format!("{}/delegations", self.base_url))
            .query(&[(key, value)])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(DelegationError::Source(format!(
                "delegation service returned {}",
                response.status()
            )));
        }
        let items: Vec<Delegation> = response.json().await?;
        Ok(Delegations::new(items))
    }
}
