use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags, TransactionBehavior};

use crate::{Result, StoreError};

mod embedded {
    use refinery::embed_migrations;
    embed_migrations!("migrations");
}

/// SQLite-backed durable state for the engine.
///
/// Every read and write goes through [`Store::transaction`] or
/// [`Store::read`]. Writes are serialized on one connection. A store opened
/// with [`Store::open_pooled`] spreads reads over extra read-only
/// connections; otherwise reads share the writer.
pub struct Store {
    conn: Mutex<Connection>,
    readers: Vec<Mutex<Connection>>,
    next_reader: AtomicUsize,
}

/// An open transaction. All table operations are methods on `Tx`.
pub struct Tx<'c> {
    pub(crate) tx: rusqlite::Transaction<'c>,
}

impl Tx<'_> {
    pub(crate) fn conn(&self) -> &Connection {
        &self.tx
    }
}

impl Store {
    /// Open (or create) the database at `path` and run pending migrations.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_pooled(path, 1)
    }

    /// Like [`Store::open`], with `pool_size` connections in total: one
    /// writer plus `pool_size - 1` read-only connections.
    pub fn open_pooled(path: &Path, pool_size: u32) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Migration(format!("create {}: {e}", parent.display())))?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;")?;

        let mut store = Self::with_writer(conn);
        store.run_migrations()?;
        for _ in 1..pool_size.max(1) {
            let reader = Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;
            reader.execute_batch("PRAGMA busy_timeout=5000;")?;
            store.readers.push(Mutex::new(reader));
        }
        tracing::info!(path = %path.display(), readers = store.readers.len(), "store opened");
        Ok(store)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let mut store = Self::with_writer(conn);
        store.run_migrations()?;
        Ok(store)
    }

    fn with_writer(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
            readers: Vec::new(),
            next_reader: AtomicUsize::new(0),
        }
    }

    /// Read-only connections besides the writer.
    pub fn reader_count(&self) -> usize {
        self.readers.len()
    }

    fn run_migrations(&mut self) -> Result<()> {
        let conn = self.conn.get_mut();
        let report = embedded::migrations::runner()
            .run(conn)
            .map_err(|e| StoreError::Migration(e.to_string()))?;
        for applied in report.applied_migrations() {
            tracing::debug!(migration = %applied, "applied migration");
        }
        Ok(())
    }

    /// Run `f` in a write transaction: commit on `Ok`, roll back on `Err`.
    pub fn transaction<T, E, F>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&Tx<'_>) -> std::result::Result<T, E>,
        E: From<StoreError>,
    {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::from)?;
        let tx = Tx { tx };
        let out = f(&tx)?;
        tx.tx.commit().map_err(StoreError::from)?;
        Ok(out)
    }

    /// Run `f` against a snapshot that is always rolled back.
    pub fn read<T, E, F>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&Tx<'_>) -> std::result::Result<T, E>,
        E: From<StoreError>,
    {
        let mut conn = if self.readers.is_empty() {
            self.conn.lock()
        } else {
            let slot = self.next_reader.fetch_add(1, Ordering::Relaxed) % self.readers.len();
            self.readers[slot].lock()
        };
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Deferred)
            .map_err(StoreError::from)?;
        f(&Tx { tx })
    }

    /// Liveness probe.
    pub fn ping(&self) -> Result<()> {
        self.conn.lock().query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("readers", &self.readers.len())
            .finish_non_exhaustive()
    }
}
