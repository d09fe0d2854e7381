//! Connection handling shared by the SQLite-backed adapters.

use crate::error::{Engine, StorageError, StorageResult};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

/// How long SQLite waits on a locked database before reporting `SQLITE_BUSY`.
const BUSY_TIMEOUT: Duration = Duration::from_secs(2);

/// A single SQLite connection owned by one adapter.
pub(crate) struct SqliteConnection {
    engine: Engine,
    conn: Mutex<Connection>,
}

impl SqliteConnection {
    /// Open (creating if needed) the database file at `path` and apply `schema`.
    pub(crate) fn open(engine: Engine, path: impl AsRef<Path>, schema: &str) -> StorageResult<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(|e| StorageError::from_sqlite(engine, e))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .map_err(|e| StorageError::from_sqlite(engine, e))?;
        debug!(engine = %engine, path = %path.display(), "opened sqlite database");
        Self::init(engine, conn, schema)
    }

    /// Create an in-memory database (for testing).
    pub(crate) fn in_memory(engine: Engine, schema: &str) -> StorageResult<Self> {
        let conn = Connection::open_in_memory().map_err(|e| StorageError::from_sqlite(engine, e))?;
        Self::init(engine, conn, schema)
    }

    fn init(engine: Engine, conn: Connection, schema: &str) -> StorageResult<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| StorageError::from_sqlite(engine, e))?;
        conn.execute_batch(schema)
            .map_err(|e| StorageError::from_sqlite(engine, e))?;
        Ok(Self {
            engine,
            conn: Mutex::new(conn),
        })
    }

    /// Run `f` with exclusive access to the connection.
    pub(crate) fn with<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> StorageResult<T> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| StorageError::permanent(self.engine, "connection mutex poisoned"))?;
        f(&mut conn).map_err(|e| StorageError::from_sqlite(self.engine, e))
    }

    /// Map a (de)serialization failure of stored data.
    pub(crate) fn corrupt(&self, what: &str, err: impl std::fmt::Display) -> StorageError {
        StorageError::permanent(self.engine, format!("corrupt {what}: {err}"))
    }
}

/// Microseconds since the epoch, used for bookkeeping columns.
pub(crate) fn now_micros() -> i64 {
    chrono::Utc::now().timestamp_micros()
}
