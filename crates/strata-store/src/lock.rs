//! Invocation-wide migration lock.
//!
//! Mutating runs commit one transaction per version, so a SQLite write lock
//! alone cannot keep two runners from picking the same pending version. The
//! lock is a single row in `<tracking table>_lock`, inserted before a run
//! starts and deleted when the [`LockGuard`] drops.

use chrono::Utc;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::applied::AppliedStore;
use crate::error::{MigrateError, StoreError};

/// The row describing who holds the lock.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockRecord {
    pub holder: String,
    pub pid: i64,
    /// RFC 3339.
    pub acquired_at: String,
}

/// Handle on the lock table that belongs to one tracking table.
#[derive(Debug, Clone)]
pub struct MigrationLock {
    table: String,
}

impl MigrationLock {
    pub fn for_store(store: &AppliedStore) -> Self {
        Self {
            table: format!("{}_lock", store.table()),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn ensure_table(&self, conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id          INTEGER PRIMARY KEY CHECK (id = 1),
                holder      TEXT NOT NULL,
                pid         INTEGER NOT NULL,
                acquired_at TEXT NOT NULL
            );",
            self.table
        ))?;
        Ok(())
    }

    /// Take the lock, or report who already has it.
    ///
    /// A database kept busy by another writer past the busy timeout counts
    /// as held too, so callers can retry either case the same way.
    pub fn acquire<'c>(&self, conn: &'c Connection) -> Result<LockGuard<'c>, MigrateError> {
        self.ensure_table(conn).map_err(lock_error)?;

        let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)
            .map_err(lock_error)?;
        if let Some(existing) = read_record(&tx, &self.table).map_err(lock_error)? {
            warn!(
                holder = %existing.holder,
                pid = existing.pid,
                since = %existing.acquired_at,
                "migration lock is held by another invocation"
            );
            return Err(MigrateError::LockHeld {
                holder: existing.holder,
                acquired_at: existing.acquired_at,
            });
        }

        let holder = Uuid::new_v4().to_string();
        tx.execute(
            &format!(
                "INSERT INTO {} (id, holder, pid, acquired_at) VALUES (1, ?1, ?2, ?3)",
                self.table
            ),
            params![holder, i64::from(std::process::id()), Utc::now().to_rfc3339()],
        )
        .map_err(lock_error)?;
        tx.commit().map_err(lock_error)?;

        debug!(holder = %holder, "migration lock acquired");

        Ok(LockGuard {
            conn,
            table: self.table.clone(),
            holder,
            released: false,
        })
    }

    /// The current holder, if any. Read-only; the table may not exist yet.
    pub fn current(&self, conn: &Connection) -> Result<Option<LockRecord>, StoreError> {
        let exists = conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![self.table],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if !exists {
            return Ok(None);
        }
        Ok(read_record(conn, &self.table)?)
    }

    /// Delete the lock row regardless of holder, returning what was removed.
    ///
    /// Only meant for clearing the lock of a runner that was killed.
    pub fn force_release(&self, conn: &Connection) -> Result<Option<LockRecord>, StoreError> {
        let previous = self.current(conn)?;
        if previous.is_some() {
            conn.execute(&format!("DELETE FROM {} WHERE id = 1", self.table), [])?;
        }
        Ok(previous)
    }
}

fn lock_error(e: rusqlite::Error) -> MigrateError {
    if e.sqlite_error_code() == Some(ErrorCode::DatabaseBusy) {
        warn!(error = %e, "database busy while taking the migration lock");
        return MigrateError::LockBusy(e);
    }
    e.into()
}

fn read_record(conn: &Connection, table: &str) -> rusqlite::Result<Option<LockRecord>> {
    conn.query_row(
            &format!("SELECT holder, pid, acquired_at FROM {table} WHERE id = 1"),
            [],
            |row| {
                Ok(LockRecord {
                    holder: row.get(0)?,
                    pid: row.get(1)?,
                    acquired_at: row.get(2)?,
                })
            },
        )
        .optional()
}

/// Proof that the lock is held. Releases it on drop.
pub struct LockGuard<'c> {
    conn: &'c Connection,
    table: String,
    holder: String,
    released: bool,
}

impl LockGuard<'_> {
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Release explicitly so a failure can be reported instead of logged.
    pub fn release(mut self) -> Result<(), StoreError> {
        self.released = true;
        self.delete_row()
    }

    fn delete_row(&self) -> Result<(), StoreError> {
        self.conn.execute(
            &format!("DELETE FROM {} WHERE id = 1 AND holder = ?1", self.table),
            params![self.holder],
        )?;
        debug!(holder = %self.holder, "migration lock released");
        Ok(())
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.delete_row() {
            warn!(holder = %self.holder, error = %e, "failed to release migration lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock() -> MigrationLock {
        MigrationLock::for_store(&AppliedStore::default())
    }

    #[test]
    fn lock_table_is_named_after_tracking_table() {
        let store = AppliedStore::new("versions").unwrap();
        assert_eq!(MigrationLock::for_store(&store).table(), "versions_lock");
    }

    #[test]
    fn second_acquire_fails_while_held() {
        let conn = Connection::open_in_memory().unwrap();
        let lock = lock();

        let guard = lock.acquire(&conn).unwrap();
        match lock.acquire(&conn) {
            Err(MigrateError::LockHeld { holder, .. }) => assert_eq!(holder, guard.holder()),
            Err(other) => panic!("expected LockHeld, got {other:?}"),
            Ok(_) => panic!("lock acquired twice"),
        };
    }

    #[test]
    fn drop_releases() {
        let conn = Connection::open_in_memory().unwrap();
        let lock = lock();

        drop(lock.acquire(&conn).unwrap());
        assert!(lock.current(&conn).unwrap().is_none());

        let guard = lock.acquire(&conn).unwrap();
        guard.release().unwrap();
        assert!(lock.current(&conn).unwrap().is_none());
    }

    #[test]
    fn force_release_clears_stale_lock() {
        let conn = Connection::open_in_memory().unwrap();
        let lock = lock();

        let guard = lock.acquire(&conn).unwrap();
        let holder = guard.holder().to_string();
        std::mem::forget(guard);

        let removed = lock.force_release(&conn).unwrap().unwrap();
        assert_eq!(removed.holder, holder);
        assert_eq!(removed.pid, i64::from(std::process::id()));
        assert!(lock.acquire(&conn).is_ok());
    }

    #[test]
    fn current_without_table_is_none() {
        let conn = Connection::open_in_memory().unwrap();
        assert!(lock().current(&conn).unwrap().is_none());
        assert!(lock().force_release(&conn).unwrap().is_none());
    }
}
