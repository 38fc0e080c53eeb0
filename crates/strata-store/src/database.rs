//! Database connection management.
//!
//! The [`Database`] struct owns the [`rusqlite::Connection`] every migration
//! runs against. Unlike an application store it never migrates itself on open;
//! the [`Migrator`](crate::Migrator) decides what runs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{Connection, OpenFlags};

use crate::error::{MigrateError, Result};

/// Wrapper around a [`rusqlite::Connection`].
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) the database file at `path`.
    ///
    /// `busy_timeout` bounds how long a statement waits on another writer
    /// before SQLite reports `SQLITE_BUSY`.
    pub fn open_at(path: &Path, busy_timeout: Duration) -> Result<Self> {
        tracing::info!(path = %path.display(), "opening database");

        let conn = Connection::open(path).map_err(MigrateError::Database)?;
        Self::configure(conn, busy_timeout)
    }

    /// Open the database file at `path` only if it already exists.
    ///
    /// Returns `Ok(None)` instead of creating an empty file, for commands
    /// that must leave a missing database missing.
    pub fn open_existing(path: &Path, busy_timeout: Duration) -> Result<Option<Self>> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "database does not exist");
            return Ok(None);
        }
        tracing::info!(path = %path.display(), "opening existing database");

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(path, flags).map_err(MigrateError::Database)?;
        Self::configure(conn, busy_timeout).map(Some)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(MigrateError::Database)?;
        Self::configure(conn, Duration::ZERO)
    }

    fn configure(conn: Connection, busy_timeout: Duration) -> Result<Self> {
        conn.busy_timeout(busy_timeout)
            .map_err(MigrateError::Database)?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(MigrateError::Database)?;

        Ok(Self { conn })
    }

    /// Return a reference to the underlying `rusqlite::Connection`.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Return the filesystem path of the open database (if any).
    pub fn path(&self) -> Option<PathBuf> {
        self.conn
            .path()
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
    }
}
