//! Cached delegation resolver.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use lru::LruCache;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::delegations::Delegations;
use crate::error::Result;
use crate::source::{DelegationRequest, DelegationSource};

/// Tracks insertion times for TTL-based expiration.
#[derive(Debug)]
struct TtlTracker {
    inserted: HashMap<String, Instant>,
    ttl: Option<Duration>,
}

impl TtlTracker {
    fn new(ttl: Option<Duration>) -> Self {
        Self {
            inserted: HashMap::new(),
            ttl,
        }
    }

    fn touch(&mut self, key: &str) {
        self.inserted.insert(key.to_string(), Instant::now());
    }

    fn is_expired(&self, key: &str) -> bool {
        match self.ttl {
            None => false,
            Some(ttl) => match self.inserted.get(key) {
                None => true,
                Some(at) => at.elapsed() > ttl,
            },
        }
    }

    fn remove(&mut self, key: &str) {
        self.inserted.remove(key);
    }
}

struct CacheInner {
    lru: LruCache<String, Delegations>,
    ttl: TtlTracker,
}

/// Resolves delegations through a [`DelegationSource`], caching each
/// request shape for a TTL. Results are always narrowed to the delegations
/// active on the day asked about.
#[derive(Clone)]
pub struct DelegationResolver {
    source: Arc<dyn DelegationSource>,
    inner: Arc<RwLock<CacheInner>>,
}

impl DelegationResolver {
    pub fn new(source: Arc<dyn DelegationSource>, ttl: Option<Duration>, capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            source,
            inner: Arc::new(RwLock::new(CacheInner {
                lru: LruCache::new(cap),
                ttl: TtlTracker::new(ttl),
            })),
        }
    }

    fn cache_key(request: &DelegationRequest) -> Result<String> {
        Ok(format!("delegations:{}", serde_json::to_string(request)?))
    }

    /// Delegations matching `request` that are active on `today`.
    pub async fn resolve(&self, request: &DelegationRequest, today: NaiveDate) -> Result<Delegations> {
        let key = Self::cache_key(request)?;
        {
            let mut inner = self.inner.write().await;
            if inner.ttl.is_expired(&key) {
                if inner.lru.pop(&key).is_some() {
                    debug!(key = %key, "delegation cache entry expired");
                }
                inner.ttl.remove(&key);
            } else if let Some(hit) = inner.lru.get(&key) {
                trace!(key = %key, "delegation cache hit");
                return Ok(hit.active_on(today));
            }
        }

        let fetched = self.source.fetch(request).await?;
        debug!(key = %key, count = fetched.len(), "delegations fetched");
        let active = fetched.active_on(today);
        let mut inner = self.inner.write().await;
        inner.lru.put(key.clone(), fetched);
        inner.ttl.touch(&key);
        Ok(active)
    }

    pub async fn to_login(&self, login: &str, today: NaiveDate) -> Result<Delegations> {
        self.resolve(&DelegationRequest::ToLogin(login.to_string()), today)
            .await
    }

    pub async fn from_login(&self, login: &str, today: NaiveDate) -> Result<Delegations> {
        self.resolve(&DelegationRequest::FromLogin(login.to_string()), today)
            .await
    }

    pub async fn to_logins(&self, logins: &[String], today: NaiveDate) -> Result<Delegations> {
        self.resolve(&DelegationRequest::ToLogins(logins.to_vec()), today)
            .await
    }

    pub async fn from_logins(&self, logins: &[String], today: NaiveDate) -> Result<Delegations> {
        self.resolve(&DelegationRequest::FromLogins(logins.to_vec()), today)
            .await
    }

    /// Drop every cached entry.
    pub async fn invalidate(&self) {
        let mut inner = self.inner.write().await;
        inner.lru.clear();
        inner.ttl.inserted.clear();
    }

    pub async fn cached_len(&self) -> usize {
        self.inner.read().await.lru.len()
    }
}

impl std::fmt::Debug for DelegationResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelegationResolver").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::StaticDelegationSource;
    use async_trait::async_trait;
    use pipewright_types::{Delegation, DelegationType};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        inner: StaticDelegationSource,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DelegationSource for CountingSource {
        async fn fetch(&self, request: &DelegationRequest) -> Result<Delegations> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.fetch(request).await
        }
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    fn source() -> Arc<CountingSource> {
        Arc::new(CountingSource {
            inner: StaticDelegationSource::new(vec![Delegation {
                from_login: "boss".into(),
                to_login: "deputy".into(),
                from_date: day(1),
                to_date: day(10),
                types: vec![DelegationType::Approvement],
            }]),
            calls: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_cache_hit_skips_source() {
        let src = source();
        let resolver = DelegationResolver::new(src.clone(), Some(Duration::from_secs(60)), 10);
        let first = resolver.to_login("deputy", day(5)).await.unwrap();
        let second = resolver.to_login("deputy", day(5)).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 1);
        assert_eq!(src.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_inactive_filtered_even_from_cache() {
        let src = source();
        let resolver = DelegationResolver::new(src.clone(), None, 10);
        assert_eq!(resolver.to_login("deputy", day(5)).await.unwrap().len(), 1);
        assert!(resolver.to_login("deputy", day(15)).await.unwrap().is_empty());
        assert_eq!(src.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_expired_entry_refetches() {
        let src = source();
        let resolver = DelegationResolver::new(src.clone(), Some(Duration::from_millis(10)), 10);
        resolver.from_login("boss", day(5)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        resolver.from_login("boss", day(5)).await.unwrap();
        assert_eq!(src.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_distinct_shapes_cache_separately() {
        let src = source();
        let resolver = DelegationResolver::new(src.clone(), None, 10);
        resolver.to_logins(&["deputy".into()], day(5)).await.unwrap();
        resolver.from_logins(&["boss".into()], day(5)).await.unwrap();
        assert_eq!(resolver.cached_len().await, 2);
        resolver.invalidate().await;
        assert_eq!(resolver.cached_len().await, 0);
    }
}
