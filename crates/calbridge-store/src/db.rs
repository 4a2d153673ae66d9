//! The shared SQLite handle.
//!
//! One `rusqlite::Connection` sits behind a mutex, so statements from every
//! store run one at a time. Calls hop onto the blocking pool with
//! `tokio::task::spawn_blocking`. Single-use guarantees (codes, refresh
//! tokens, login states) are conditional statements or
//! [`Database::transaction`] closures on top of this.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::{Connection, Transaction, TransactionBehavior};
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::migration;

/// How long a second process sharing the file waits on a lock.
const BUSY_TIMEOUT_MS: i32 = 5_000;

/// Cloneable handle to the broker database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the database file at `path` without migrating it.
    ///
    /// Blocks on file I/O; async callers want [`Database::open_and_migrate`].
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening database");
        Self::from_connection(Connection::open(path)?)
    }

    /// Open the file at `path` and bring its schema up to date.
    pub async fn open_and_migrate(path: impl AsRef<Path> + Send + 'static) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let db = tokio::task::spawn_blocking(move || Self::open(&path)).await??;
        db.run_migrations().await?;
        Ok(db)
    }

    /// A fresh, fully migrated in-memory database.
    pub async fn in_memory() -> StoreResult<Self> {
        debug!("opening in-memory database");
        let db = Self::from_connection(Connection::open_in_memory()?)?;
        db.run_migrations().await?;
        Ok(db)
    }

    /// Apply pending migrations, then import subjects from an older
    /// database layout if one was found.
    pub async fn run_migrations(&self) -> StoreResult<()> {
        self.execute(|conn| {
            migration::run_all(conn)?;
            let imported = migration::import_legacy_users(conn)?;
            if imported > 0 {
                info!(imported, "imported subjects from legacy users table");
            }
            Ok(())
        })
        .await
    }

    /// Highest applied schema version.
    pub async fn schema_version(&self) -> StoreResult<u32> {
        self.execute(migration::current_version).await
    }

    /// Run `f` against the connection on the blocking pool.
    pub async fn execute<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = lock(&conn)?;
            f(&guard)
        })
        .await?
    }

    /// Run `f` inside an `IMMEDIATE` transaction on the blocking pool.
    ///
    /// The write lock is taken up front, so a read-then-write inside `f`
    /// cannot race another process. The transaction commits when `f` returns
    /// `Ok` and rolls back otherwise.
    pub async fn transaction<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Transaction<'_>) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = lock(&conn)?;
            let tx = guard.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let value = f(&tx)?;
            tx.commit()?;
            Ok(value)
        })
        .await?
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        configure(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

fn lock(conn: &Mutex<Connection>) -> StoreResult<MutexGuard<'_, Connection>> {
    conn.lock().map_err(|_| StoreError::Poisoned)
}

/// WAL with NORMAL sync, foreign keys, and a busy timeout.
fn configure(conn: &Connection) -> StoreResult<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "busy_timeout", BUSY_TIMEOUT_MS)?;
    debug!("database configured");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn count(db: &Database) -> i64 {
        db.execute(|conn| {
            Ok(conn.query_row("SELECT count(*) FROM login_states", [], |row| row.get(0))?)
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn in_memory_is_migrated() {
        let db = Database::in_memory().await.unwrap();
        assert_eq!(db.schema_version().await.unwrap(), migration::LATEST_VERSION);
        assert_eq!(count(&db).await, 0);
    }

    #[tokio::test]
    async fn transaction_commits_on_ok() {
        let db = Database::in_memory().await.unwrap();
        db.transaction(|tx| {
            tx.execute(
                "INSERT INTO login_states (state, expires_at, created_at) VALUES ('ls.a', 1, 0)",
                [],
            )?;
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(count(&db).await, 1);
    }

    #[tokio::test]
    async fn transaction_rolls_back_on_err() {
        let db = Database::in_memory().await.unwrap();
        let result: StoreResult<()> = db
            .transaction(|tx| {
                tx.execute(
                    "INSERT INTO login_states (state, expires_at, created_at) VALUES ('ls.a', 1, 0)",
                    [],
                )?;
                Err(StoreError::InvalidArgument("abort".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(count(&db).await, 0);
    }

    #[tokio::test]
    async fn busy_timeout_is_set() {
        let db = Database::in_memory().await.unwrap();
        let timeout: i64 = db
            .execute(|conn| Ok(conn.query_row("PRAGMA busy_timeout", [], |row| row.get(0))?))
            .await
            .unwrap();
        assert_eq!(timeout, i64::from(BUSY_TIMEOUT_MS));
    }
}
