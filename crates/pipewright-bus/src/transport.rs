//! Message transports.
//!
//! A [`Transport`] publishes raw payloads to topics and hands out
//! [`Subscription`]s. Each [`Delivery`] must be acknowledged once the
//! consumer has durably parked it; transports that track offsets commit on
//! acknowledgement.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::{BusError, Result};

/// A message as it travels on a topic.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub topic: String,
    pub key: String,
    pub payload: String,
}

/// A received message awaiting acknowledgement.
#[derive(Debug)]
pub struct Delivery {
    pub envelope: Envelope,
    ack: Option<oneshot::Sender<()>>,
}

impl Delivery {
    pub fn new(envelope: Envelope) -> Self {
        Self {
            envelope,
            ack: None,
        }
    }

    pub fn with_ack(envelope: Envelope, ack: oneshot::Sender<()>) -> Self {
        Self {
            envelope,
            ack: Some(ack),
        }
    }

    /// Confirm the message is safe to forget on the transport side.
    pub fn ack(mut self) -> Envelope {
        if let Some(tx) = self.ack.take() {
            let _ = tx.send(());
        }
        self.envelope
    }
}

/// Stream of deliveries for the subscribed topics.
pub type Subscription = mpsc::Receiver<Delivery>;

#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, topic: &str, key: &str, payload: &str) -> Result<()>;

    async fn subscribe(&self, topics: &[String]) -> Result<Subscription>;
}

/// In-process transport backed by tokio channels.
///
/// Every published message is also kept in a log so tests can inspect
/// what went out and when.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    inner: Arc<Mutex<MemoryInner>>,
}

#[derive(Default)]
struct MemoryInner {
    subscribers: HashMap<String, Vec<mpsc::Sender<Delivery>>>,
    published: Vec<(DateTime<Utc>, Envelope)>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything published so far, oldest first.
    pub fn published(&self) -> Vec<(DateTime<Utc>, Envelope)> {
        self.inner.lock().published.clone()
    }

    /// Messages published to one topic.
    pub fn published_to(&self, topic: &str) -> Vec<Envelope> {
        self.inner
            .lock()
            .published
            .iter()
            .filter(|(_, e)| e.topic == topic)
            .map(|(_, e)| e.clone())
            .collect()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(&self, topic: &str, key: &str, payload: &str) -> Result<()> {
        let envelope = Envelope {
            topic: topic.to_string(),
            key: key.to_string(),
            payload: payload.to_string(),
        };
        let senders = {
            let mut inner = self.inner.lock();
            inner.published.push((Utc::now(), envelope.clone()));
            inner.subscribers.get(topic).cloned().unwrap_or_default()
        };
        for tx in senders {
            if tx.send(Delivery::new(envelope.clone())).await.is_err() {
                tracing::debug!(topic, "memory subscriber dropped");
            }
        }
        Ok(())
    }

    async fn subscribe(&self, topics: &[String]) -> Result<Subscription> {
        if topics.is_empty() {
            return Err(BusError::Transport("no topics to subscribe to".into()));
        }
        let (tx, rx) = mpsc::channel(64);
        let mut inner = self.inner.lock();
        for topic in topics {
            inner
                .subscribers
                .entry(topic.clone())
                .or_default()
                .push(tx.clone());
        }
        Ok(rx)
    }
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_round_trip() {
        let transport = MemoryTransport::new();
        let mut sub = transport.subscribe(&["a".to_string()]).await.unwrap();
        transport.publish("a", "k", "payload").await.unwrap();
        transport.publish("b", "k", "ignored").await.unwrap();

        let delivery = sub.recv().await.unwrap();
        let env = delivery.ack();
        assert_eq!(env.payload, "payload");
        assert_eq!(transport.published().len(), 2);
        assert_eq!(transport.published_to("b").len(), 1);
    }

    #[tokio::test]
    async fn test_ack_signals_waiter() {
        let (tx, rx) = oneshot::channel();
        let delivery = Delivery::with_ack(
            Envelope {
                topic: "t".into(),
                key: "k".into(),
                payload: "{}".into(),
            },
            tx,
        );
        delivery.ack();
        assert!(rx.await.is_ok());
    }

    #[tokio::test]
    async fn test_subscribe_requires_topics() {
        let transport = MemoryTransport::new();
        assert!(transport.subscribe(&[]).await.is_err());
    }
}
