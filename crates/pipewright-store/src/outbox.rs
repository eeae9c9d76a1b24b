//! Durable message queues for the function bus.
//!
//! Outgoing messages are written to `outbox` in the same transaction as the
//! state change that caused them; a relay publishes and deletes them.
//! Incoming messages are parked in `inbox` until handled so a crash between
//! receipt and processing can be replayed.

use chrono::{DateTime, Utc};
use rusqlite::params;

use crate::rows::{col_dt, fmt_dt};
use crate::{Result, Tx};

/// A message waiting to be published.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxMessage {
    pub id: i64,
    pub topic: String,
    pub key: String,
    pub payload: String,
    pub not_before: DateTime<Utc>,
}

/// A received message not yet handled.
#[derive(Debug, Clone, PartialEq)]
pub struct InboxMessage {
    pub key: String,
    pub topic: String,
    pub payload: String,
    pub created_at: DateTime<Utc>,
}

impl Tx<'_> {
    // ── Outbox ──────────────────────────────────────────────────────

    pub fn enqueue_outbox(
        &self,
        topic: &str,
        key: &str,
        payload: &str,
        not_before: DateTime<Utc>,
    ) -> Result<i64> {
        self.conn().execute(
            "INSERT INTO outbox (topic, key, payload, not_before, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![topic, key, payload, fmt_dt(&not_before), fmt_dt(&Utc::now())],
        )?;
        Ok(self.conn().last_insert_rowid())
    }

    /// Messages whose `not_before` has passed, in insertion order.
    pub fn due_outbox(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<OutboxMessage>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, topic, key, payload, not_before FROM outbox
             WHERE not_before <= ?1 ORDER BY id LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![fmt_dt(&now), limit], |row| {
                Ok(OutboxMessage {
                    id: row.get(0)?,
                    topic: row.get(1)?,
                    key: row.get(2)?,
                    payload: row.get(3)?,
                    not_before: col_dt(row, 4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn delete_outbox(&self, id: i64) -> Result<()> {
        self.conn()
            .execute("DELETE FROM outbox WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub fn outbox_len(&self) -> Result<i64> {
        let n = self
            .conn()
            .query_row("SELECT COUNT(*) FROM outbox", [], |row| row.get(0))?;
        Ok(n)
    }

    // ── Inbox ───────────────────────────────────────────────────────

    /// Park a received message. Returns `false` if the key is already parked.
    pub fn put_inbox(&self, key: &str, topic: &str, payload: &str) -> Result<bool> {
        let n = self.conn().execute(
            "INSERT OR IGNORE INTO inbox (key, topic, payload, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![key, topic, payload, fmt_dt(&Utc::now())],
        )?;
        Ok(n > 0)
    }

    pub fn delete_inbox(&self, key: &str) -> Result<()> {
        self.conn()
            .execute("DELETE FROM inbox WHERE key = ?1", params![key])?;
        Ok(())
    }

    pub fn list_inbox(&self) -> Result<Vec<InboxMessage>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT key, topic, payload, created_at FROM inbox ORDER BY created_at, key")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(InboxMessage {
                    key: row.get(0)?,
                    topic: row.get(1)?,
                    payload: row.get(2)?,
                    created_at: col_dt(row, 3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Store;
    use chrono::Duration;

    #[test]
    fn test_outbox_respects_not_before() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        store
            .transaction(|tx| -> Result<()> {
                tx.enqueue_outbox("fn.out", "k1", "{}", now)?;
                tx.enqueue_outbox("fn.out", "k2", "{}", now + Duration::seconds(30))?;
                Ok(())
            })
            .unwrap();

        let due = store.read(|tx| tx.due_outbox(now, 10)).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].key, "k1");

        store.transaction(|tx| tx.delete_outbox(due[0].id)).unwrap();
        let later = store
            .read(|tx| tx.due_outbox(now + Duration::minutes(1), 10))
            .unwrap();
        assert_eq!(later.len(), 1);
        assert_eq!(later[0].key, "k2");
        assert_eq!(store.read(|tx| tx.outbox_len()).unwrap(), 1);
    }

    #[test]
    fn test_inbox_deduplicates_by_key() {
        let store = Store::open_in_memory().unwrap();
        store
            .transaction(|tx| -> Result<()> {
                assert!(tx.put_inbox("m1", "fn.in", "{}")?);
                assert!(!tx.put_inbox("m1", "fn.in", "{}")?);
                assert_eq!(tx.list_inbox()?.len(), 1);
                tx.delete_inbox("m1")?;
                assert!(tx.list_inbox()?.is_empty());
                Ok(())
            })
            .unwrap();
    }
}
