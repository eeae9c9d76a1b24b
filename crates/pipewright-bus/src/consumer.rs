//! Inbound consumption: park, acknowledge, handle, forget.
//!
//! A handler may defer a message it cannot apply yet; the message stays
//! parked and is retried on the pool's retry interval or when woken.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex as SyncMutex;
use pipewright_store::{InboxMessage, Store};
use tokio::sync::{Mutex, Notify, mpsc};
use tokio_util::sync::CancellationToken;

use crate::health::ConsumerGate;
use crate::transport::{Envelope, Subscription};
use crate::{BusError, Result};

pub const FUNCTION_RESULT_PREFIX: &str = "function-result:";
pub const RUN_TASK_PREFIX: &str = "run-task:";

const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(30);
const PARK_BACKOFF_START: Duration = Duration::from_millis(50);
const PARK_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Handles one inbound message.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, envelope: &Envelope) -> Result<()>;
}

/// Durable parking for received messages, backed by the `inbox` table.
#[derive(Debug, Clone)]
pub struct Inbox {
    store: Arc<Store>,
}

impl Inbox {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Park a message under `<prefix><unix micros>` and return the key.
    pub fn park(&self, prefix: &str, topic: &str, payload: &str) -> Result<String> {
        let mut ts = Utc::now().timestamp_micros();
        loop {
            let key = format!("{prefix}{ts}");
            if self.store.transaction(|tx| tx.put_inbox(&key, topic, payload))? {
                return Ok(key);
            }
            ts += 1;
        }
    }

    pub fn get(&self, key: &str) -> Result<Option<InboxMessage>> {
        let all = self.store.read(|tx| tx.list_inbox())?;
        Ok(all.into_iter().find(|m| m.key == key))
    }

    pub fn done(&self, key: &str) -> Result<()> {
        self.store.transaction(|tx| tx.delete_inbox(key))?;
        Ok(())
    }

    /// Parked messages whose key starts with `prefix`.
    pub fn pending(&self, prefix: &str) -> Result<Vec<InboxMessage>> {
        let all = self.store.read(|tx| tx.list_inbox())?;
        Ok(all.into_iter().filter(|m| m.key.starts_with(prefix)).collect())
    }
}

/// Worker pool consuming one subscription.
pub struct ConsumerPool {
    name: &'static str,
    prefix: &'static str,
    inbox: Inbox,
    handler: Arc<dyn MessageHandler>,
    workers: usize,
    gate: ConsumerGate,
    deferred: Arc<SyncMutex<BTreeSet<String>>>,
    retry_interval: Duration,
    wake: Arc<Notify>,
}

impl ConsumerPool {
    pub fn new(
        name: &'static str,
        prefix: &'static str,
        inbox: Inbox,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        Self {
            name,
            prefix,
            inbox,
            handler,
            workers: 1,
            gate: ConsumerGate::new(),
            deferred: Arc::new(SyncMutex::new(BTreeSet::new())),
            retry_interval: DEFAULT_RETRY_INTERVAL,
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_gate(mut self, gate: ConsumerGate) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Share `wake` so code outside the pool can request a retry of
    /// deferred messages.
    pub fn with_waker(mut self, wake: Arc<Notify>) -> Self {
        self.wake = wake;
        self
    }

    /// Handle that makes the pool retry deferred messages immediately.
    pub fn waker(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    /// Keys of parked messages a handler deferred.
    pub fn deferred(&self) -> Vec<String> {
        self.deferred.lock().iter().cloned().collect()
    }

    /// Replay messages parked by a previous process. Returns how many were
    /// handled.
    pub async fn recover(&self) -> Result<usize> {
        let pending = self.inbox.pending(self.prefix)?;
        let mut handled = 0;
        for msg in pending {
            tracing::info!(consumer = self.name, key = %msg.key, "replaying parked message");
            let envelope = Envelope {
                topic: msg.topic,
                key: msg.key.clone(),
                payload: msg.payload,
            };
            if handle_one(self.name, &self.inbox, self.handler.as_ref(), &msg.key, &envelope).await
                == Disposition::Deferred
            {
                self.deferred.lock().insert(msg.key.clone());
            }
            handled += 1;
        }
        Ok(handled)
    }

    /// Hand every deferred message to the handler again. Returns how many
    /// left the inbox.
    pub async fn retry_deferred(&self) -> Result<usize> {
        let keys: Vec<String> = std::mem::take(&mut *self.deferred.lock()).into_iter().collect();
        let mut settled = 0;
        for key in keys {
            let Some(msg) = self.inbox.get(&key)? else {
                continue;
            };
            let envelope = Envelope {
                topic: msg.topic,
                key: key.clone(),
                payload: msg.payload,
            };
            match handle_one(self.name, &self.inbox, self.handler.as_ref(), &key, &envelope).await {
                Disposition::Done => settled += 1,
                Disposition::Deferred | Disposition::Kept => {
                    self.deferred.lock().insert(key);
                }
            }
        }
        if settled > 0 {
            tracing::info!(consumer = self.name, settled, "deferred messages handled");
        }
        Ok(settled)
    }

    /// Consume until cancelled or the subscription ends.
    pub async fn run(self, mut subscription: Subscription, cancel: CancellationToken) {
        let (work_tx, work_rx) = mpsc::channel::<(String, Envelope)>(self.workers * 2);
        let work_rx = Arc::new(Mutex::new(work_rx));

        let mut handles = Vec::with_capacity(self.workers);
        for worker in 0..self.workers {
            let rx = work_rx.clone();
            let inbox = self.inbox.clone();
            let handler = self.handler.clone();
            let deferred = self.deferred.clone();
            let name = self.name;
            handles.push(tokio::spawn(async move {
                loop {
                    let next = { rx.lock().await.recv().await };
                    let Some((key, envelope)) = next else { break };
                    if handle_one(name, &inbox, handler.as_ref(), &key, &envelope).await
                        == Disposition::Deferred
                    {
                        deferred.lock().insert(key);
                    }
                }
                tracing::debug!(consumer = name, worker, "consumer worker stopped");
            }));
        }

        tracing::info!(consumer = self.name, workers = self.workers, "consumer started");
        let mut retry = tokio::time::interval(self.retry_interval);
        retry.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.gate.wait_open() => {}
            }
            let delivery = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = retry.tick() => {
                    self.retry_logged().await;
                    continue;
                }
                _ = self.wake.notified() => {
                    self.retry_logged().await;
                    continue;
                }
                d = subscription.recv() => match d {
                    Some(d) => d,
                    None => break,
                },
            };
            // The gate may have closed while waiting for a message.
            if !self.gate.is_open() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = self.gate.wait_open() => {}
                }
            }
            // Unacknowledged until parked; dropping it on shutdown leaves
            // the message with the transport.
            let parked = park_until_stored(self.name, &cancel, || {
                self.inbox
                    .park(self.prefix, &delivery.envelope.topic, &delivery.envelope.payload)
            })
            .await;
            let Some(key) = parked else { break };
            let envelope = delivery.ack();
            if work_tx.send((key, envelope)).await.is_err() {
                break;
            }
        }

        drop(work_tx);
        for handle in handles {
            let _ = handle.await;
        }
        tracing::info!(consumer = self.name, "consumer stopped");
    }
}

impl ConsumerPool {
    async fn retry_logged(&self) {
        if self.deferred.lock().is_empty() {
            return;
        }
        if let Err(e) = self.retry_deferred().await {
            tracing::warn!(consumer = self.name, error = %e, "deferred retry failed");
        }
    }
}

/// What became of a handled message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    /// Handled or dropped; the inbox row is gone.
    Done,
    /// Left parked until the next recovery.
    Kept,
    /// Left parked and retried while the process runs.
    Deferred,
}

async fn handle_one(
    name: &str,
    inbox: &Inbox,
    handler: &dyn MessageHandler,
    key: &str,
    envelope: &Envelope,
) -> Disposition {
    match handler.handle(envelope).await {
        Ok(()) => {}
        // Storage trouble is transient; keep the message for the next recovery.
        Err(BusError::Store(e)) => {
            tracing::error!(consumer = name, key, error = %e, "message handling hit storage error, kept parked");
            return Disposition::Kept;
        }
        Err(BusError::Deferred(reason)) => {
            tracing::info!(consumer = name, key, %reason, "message deferred");
            return Disposition::Deferred;
        }
        Err(e) => {
            tracing::error!(consumer = name, key, error = %e, "message handling failed, dropped");
        }
    }
    if let Err(e) = inbox.done(key) {
        tracing::warn!(consumer = name, key, error = %e, "failed to clear parked message");
        return Disposition::Kept;
    }
    Disposition::Done
}

/// Park with capped exponential backoff until it succeeds. `None` when
/// cancelled first.
async fn park_until_stored<F>(name: &str, cancel: &CancellationToken, mut park: F) -> Option<String>
where
    F: FnMut() -> Result<String>,
{
    let mut backoff = PARK_BACKOFF_START;
    loop {
        match park() {
            Ok(key) => return Some(key),
            Err(e) => {
                tracing::error!(consumer = name, error = %e, retry_in_ms = backoff.as_millis() as u64, "failed to park message");
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(PARK_BACKOFF_MAX);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryTransport, Transport};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Defers everything until opened.
    #[derive(Default)]
    struct Latch {
        open: AtomicBool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MessageHandler for Latch {
        async fn handle(&self, _envelope: &Envelope) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.open.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(BusError::Deferred("work is paused".into()))
            }
        }
    }

    #[derive(Default)]
    struct Recorder {
        seen: SyncMutex<Vec<String>>,
    }

    #[async_trait]
    impl MessageHandler for Recorder {
        async fn handle(&self, envelope: &Envelope) -> Result<()> {
            self.seen.lock().push(envelope.payload.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_recover_replays_and_clears() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let inbox = Inbox::new(store.clone());
        inbox.park(FUNCTION_RESULT_PREFIX, "function-in", "a").unwrap();
        inbox.park(FUNCTION_RESULT_PREFIX, "function-in", "b").unwrap();
        inbox.park(RUN_TASK_PREFIX, "run-task", "other").unwrap();

        let recorder = Arc::new(Recorder::default());
        let pool = ConsumerPool::new("functions", FUNCTION_RESULT_PREFIX, inbox.clone(), recorder.clone());
        assert_eq!(pool.recover().await.unwrap(), 2);
        assert_eq!(*recorder.seen.lock(), vec!["a", "b"]);
        assert!(inbox.pending(FUNCTION_RESULT_PREFIX).unwrap().is_empty());
        assert_eq!(inbox.pending(RUN_TASK_PREFIX).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_park_keys_are_unique() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let inbox = Inbox::new(store);
        let a = inbox.park(RUN_TASK_PREFIX, "run-task", "x").unwrap();
        let b = inbox.park(RUN_TASK_PREFIX, "run-task", "x").unwrap();
        assert_ne!(a, b);
        assert!(a.starts_with(RUN_TASK_PREFIX));
    }

    #[tokio::test]
    async fn test_pool_handles_live_messages() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let transport = MemoryTransport::new();
        let sub = transport.subscribe(&["function-in".to_string()]).await.unwrap();
        let recorder = Arc::new(Recorder::default());
        let pool = ConsumerPool::new(
            "functions",
            FUNCTION_RESULT_PREFIX,
            Inbox::new(store.clone()),
            recorder.clone(),
        )
        .with_workers(2);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(pool.run(sub, cancel.clone()));

        transport.publish("function-in", "k", "reply").await.unwrap();
        for _ in 0..100 {
            if !recorder.seen.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(*recorder.seen.lock(), vec!["reply"]);
        assert!(store.read(|tx| tx.list_inbox()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_deferred_message_stays_parked() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let inbox = Inbox::new(store);
        let key = inbox.park(FUNCTION_RESULT_PREFIX, "function-in", "late").unwrap();

        let latch = Arc::new(Latch::default());
        let pool = ConsumerPool::new("functions", FUNCTION_RESULT_PREFIX, inbox.clone(), latch.clone());
        assert_eq!(pool.recover().await.unwrap(), 1);
        assert_eq!(inbox.pending(FUNCTION_RESULT_PREFIX).unwrap().len(), 1);
        assert_eq!(pool.deferred(), vec![key.clone()]);

        // Still closed: nothing settles and the key stays deferred.
        assert_eq!(pool.retry_deferred().await.unwrap(), 0);
        assert_eq!(pool.deferred(), vec![key]);

        latch.open.store(true, Ordering::SeqCst);
        assert_eq!(pool.retry_deferred().await.unwrap(), 1);
        assert!(inbox.pending(FUNCTION_RESULT_PREFIX).unwrap().is_empty());
        assert!(pool.deferred().is_empty());
        assert_eq!(latch.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_waker_retries_deferred_live_message() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let transport = MemoryTransport::new();
        let sub = transport.subscribe(&["function-in".to_string()]).await.unwrap();
        let latch = Arc::new(Latch::default());
        let pool = ConsumerPool::new(
            "functions",
            FUNCTION_RESULT_PREFIX,
            Inbox::new(store.clone()),
            latch.clone(),
        )
        .with_retry_interval(Duration::from_secs(3600));
        let waker = pool.waker();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(pool.run(sub, cancel.clone()));

        transport.publish("function-in", "k", "reply").await.unwrap();
        for _ in 0..100 {
            if latch.calls.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(store.read(|tx| tx.list_inbox()).unwrap().len(), 1);

        latch.open.store(true, Ordering::SeqCst);
        for _ in 0..100 {
            if store.read(|tx| tx.list_inbox()).unwrap().is_empty() {
                break;
            }
            waker.notify_one();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        handle.await.unwrap();
        assert!(store.read(|tx| tx.list_inbox()).unwrap().is_empty());
        assert_eq!(latch.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_park_retries_until_stored() {
        let cancel = CancellationToken::new();
        let mut attempts = 0;
        let key = park_until_stored("functions", &cancel, || {
            attempts += 1;
            if attempts < 4 {
                Err(BusError::Unavailable {
                    service: "store".into(),
                    reason: "disk full".into(),
                })
            } else {
                Ok("function-result:1".to_string())
            }
        })
        .await;
        assert_eq!(key.as_deref(), Some("function-result:1"));
        assert_eq!(attempts, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_park_gives_up_on_cancel() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let key = park_until_stored("functions", &cancel, || {
            Err(BusError::Unavailable {
                service: "store".into(),
                reason: "locked".into(),
            })
        })
        .await;
        assert!(key.is_none());
    }
}
