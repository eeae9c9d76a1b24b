//! Collaborator health probing and the consumer gate it drives.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pipewright_store::Store;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::{BusError, Result};

/// Open/closed switch shared by the consumers and the prober.
#[derive(Debug, Clone)]
pub struct ConsumerGate {
    tx: Arc<watch::Sender<bool>>,
}

impl ConsumerGate {
    /// A gate that starts open.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(true);
        Self { tx: Arc::new(tx) }
    }

    pub fn pause(&self) {
        self.tx.send_replace(false);
    }

    pub fn resume(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_open(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the gate is open.
    pub async fn wait_open(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|open| *open).await;
    }
}

impl Default for ConsumerGate {
    fn default() -> Self {
        Self::new()
    }
}

/// A collaborator whose availability gates consumption.
#[async_trait]
pub trait Pinger: Send + Sync {
    fn name(&self) -> &str;

    async fn ping(&self) -> Result<()>;
}

/// Pings the local store.
#[derive(Debug, Clone)]
pub struct StorePinger(pub Arc<Store>);

#[async_trait]
impl Pinger for StorePinger {
    fn name(&self) -> &str {
        "storage"
    }

    async fn ping(&self) -> Result<()> {
        self.0.ping().map_err(|e| BusError::Unavailable {
            service: "storage".into(),
            reason: e.to_string(),
        })
    }
}

/// Pings an HTTP collaborator by GET-ing a URL.
#[derive(Debug, Clone)]
pub struct HttpPinger {
    name: String,
    url: String,
    client: reqwest::Client,
}

impl HttpPinger {
    pub fn new(name: impl Into<String>, url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BusError::Transport(e.to_string()))?;
        Ok(Self {
            name: name.into(),
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl Pinger for HttpPinger {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ping(&self) -> Result<()> {
        let unavailable = |reason: String| BusError::Unavailable {
            service: self.name.clone(),
            reason,
        };
        let resp = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| unavailable(e.to_string()))?;
        if resp.status().is_server_error() {
            return Err(unavailable(format!("status {}", resp.status())));
        }
        Ok(())
    }
}

/// What the prober decided after one round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateChange {
    Pause,
    Resume,
}

/// Pauses consumption after `max_failed` consecutive failing rounds and
/// resumes it after `max_ok` consecutive healthy ones.
pub struct HealthProber {
    pingers: Vec<Arc<dyn Pinger>>,
    interval: Duration,
    max_failed: u32,
    max_ok: u32,
    gate: ConsumerGate,
    failed: u32,
    ok: u32,
    stopped: bool,
}

impl HealthProber {
    pub fn new(gate: ConsumerGate, interval: Duration, max_failed: u32, max_ok: u32) -> Self {
        Self {
            pingers: Vec::new(),
            interval,
            max_failed: max_failed.max(1),
            max_ok: max_ok.max(1),
            gate,
            failed: 0,
            ok: 0,
            stopped: false,
        }
    }

    pub fn with_pinger(mut self, pinger: Arc<dyn Pinger>) -> Self {
        self.pingers.push(pinger);
        self
    }

    /// Feed one round's outcome into the counters.
    pub fn observe(&mut self, healthy: bool) -> Option<GateChange> {
        if !healthy {
            self.ok = 0;
            if self.stopped {
                return None;
            }
            self.failed += 1;
            if self.failed < self.max_failed {
                return None;
            }
            self.failed = 0;
            self.stopped = true;
            return Some(GateChange::Pause);
        }

        self.failed = 0;
        if !self.stopped {
            return None;
        }
        self.ok += 1;
        if self.ok < self.max_ok {
            return None;
        }
        self.ok = 0;
        self.stopped = false;
        Some(GateChange::Resume)
    }

    /// Ping everything once; true when all collaborators answered.
    pub async fn probe(&self) -> bool {
        let mut healthy = true;
        for pinger in &self.pingers {
            if let Err(e) = pinger.ping().await {
                tracing::error!(service = pinger.name(), error = %e, "collaborator not accessible");
                healthy = false;
            }
        }
        healthy
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
            let healthy = self.probe().await;
            match self.observe(healthy) {
                Some(GateChange::Pause) => {
                    self.gate.pause();
                    tracing::error!("consumers paused");
                }
                Some(GateChange::Resume) => {
                    self.gate.resume();
                    tracing::info!("consumers resumed");
                }
                None => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thresholds() {
        let mut prober = HealthProber::new(ConsumerGate::new(), Duration::from_secs(1), 3, 2);
        assert_eq!(prober.observe(false), None);
        assert_eq!(prober.observe(false), None);
        assert_eq!(prober.observe(false), Some(GateChange::Pause));
        assert_eq!(prober.observe(false), None);
        assert_eq!(prober.observe(true), None);
        assert_eq!(prober.observe(false), None);
        assert_eq!(prober.observe(true), None);
        assert_eq!(prober.observe(true), Some(GateChange::Resume));
        assert_eq!(prober.observe(true), None);
    }

    #[test]
    fn test_healthy_round_resets_failures() {
        let mut prober = HealthProber::new(ConsumerGate::new(), Duration::from_secs(1), 2, 1);
        assert_eq!(prober.observe(false), None);
        assert_eq!(prober.observe(true), None);
        assert_eq!(prober.observe(false), None);
        assert_eq!(prober.observe(false), Some(GateChange::Pause));
    }

    #[tokio::test]
    async fn test_gate_wait_open() {
        let gate = ConsumerGate::new();
        gate.pause();
        assert!(!gate.is_open());
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait_open().await })
        };
        gate.resume();
        waiter.await.unwrap();
        assert!(gate.is_open());
    }

    #[tokio::test]
    async fn test_store_pinger() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let prober = HealthProber::new(ConsumerGate::new(), Duration::from_secs(1), 1, 1)
            .with_pinger(Arc::new(StorePinger(store)));
        assert!(prober.probe().await);
    }
}
