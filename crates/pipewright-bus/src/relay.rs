//! Outbox relay: publishes committed outbound messages.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use pipewright_store::Store;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::transport::Transport;

const DEFAULT_BATCH: u32 = 100;
const DEFAULT_INTERVAL: Duration = Duration::from_millis(500);

/// Moves due rows from the `outbox` table onto the transport.
///
/// A row is deleted only after the transport accepted it, so a crash in
/// between re-publishes it on the next pump. Consumers must tolerate
/// duplicates.
pub struct Relay {
    store: Arc<Store>,
    transport: Arc<dyn Transport>,
    batch_size: u32,
    interval: Duration,
    wake: Arc<Notify>,
}

impl Relay {
    pub fn new(store: Arc<Store>, transport: Arc<dyn Transport>) -> Self {
        Self {
            store,
            transport,
            batch_size: DEFAULT_BATCH,
            interval: DEFAULT_INTERVAL,
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Handle that makes the relay pump immediately.
    pub fn waker(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    /// Publish every due row once. Stops at the first transport failure so
    /// per-key order is kept.
    pub async fn pump_once(&self) -> Result<usize> {
        let batch = self.batch_size;
        let due = self.store.read(|tx| tx.due_outbox(Utc::now(), batch))?;
        let mut sent = 0;
        for msg in due {
            self.transport
                .publish(&msg.topic, &msg.key, &msg.payload)
                .await?;
            self.store.transaction(|tx| tx.delete_outbox(msg.id))?;
            tracing::debug!(topic = %msg.topic, key = %msg.key, "outbox message published");
            sent += 1;
        }
        Ok(sent)
    }

    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(interval_ms = self.interval.as_millis() as u64, "outbox relay started");
        loop {
            match self.pump_once().await {
                Ok(n) if n as u32 >= self.batch_size => continue,
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "outbox relay pump failed"),
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        tracing::info!("outbox relay stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryTransport;
    use chrono::Duration as ChronoDuration;

    #[tokio::test]
    async fn test_pump_publishes_due_rows_in_order() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let now = Utc::now();
        store
            .transaction(|tx| -> pipewright_store::Result<()> {
                tx.enqueue_outbox("function-out", "s1", "one", now)?;
                tx.enqueue_outbox("function-out", "s1", "two", now)?;
                tx.enqueue_outbox("function-out", "s2", "later", now + ChronoDuration::hours(1))?;
                Ok(())
            })
            .unwrap();

        let transport = MemoryTransport::new();
        let relay = Relay::new(store.clone(), Arc::new(transport.clone()));
        assert_eq!(relay.pump_once().await.unwrap(), 2);
        assert_eq!(relay.pump_once().await.unwrap(), 0);

        let payloads: Vec<String> = transport
            .published_to("function-out")
            .into_iter()
            .map(|e| e.payload)
            .collect();
        assert_eq!(payloads, vec!["one", "two"]);
        assert_eq!(store.read(|tx| tx.outbox_len()).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let relay = Relay::new(store, Arc::new(MemoryTransport::new()))
            .with_interval(Duration::from_millis(10));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(relay.run(cancel.clone()));
        cancel.cancel();
        handle.await.unwrap();
    }
}
