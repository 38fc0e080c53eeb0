//! Tracking table of applied versions.
//!
//! The store never opens or commits transactions itself. Writes go through
//! whatever [`Connection`] the caller hands in, which during a migration is
//! the [`rusqlite::Transaction`] that also runs the script body.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{MigrateError, StoreError};
use crate::models::AppliedRecord;

/// Default name of the tracking table.
pub const DEFAULT_TABLE: &str = "schema_migrations";

type StoreResult<T> = std::result::Result<T, StoreError>;

/// Handle on the tracking table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedStore {
    table: String,
}

impl Default for AppliedStore {
    fn default() -> Self {
        Self {
            table: DEFAULT_TABLE.to_string(),
        }
    }
}

impl AppliedStore {
    /// Build a store over `table`.
    ///
    /// The name is spliced into SQL, so only plain identifiers are accepted.
    pub fn new(table: impl Into<String>) -> Result<Self, MigrateError> {
        let table = table.into();
        if !is_identifier(&table) {
            return Err(MigrateError::InvalidArgument(format!(
                "invalid tracking table name: {table:?}"
            )));
        }
        Ok(Self { table })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Create the tracking table if it does not exist yet.
    pub fn ensure_initialized(&self, conn: &Connection) -> StoreResult<()> {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                version    TEXT PRIMARY KEY NOT NULL,
                applied_at TEXT NOT NULL          -- RFC-3339
            );",
            self.table
        ))?;
        Ok(())
    }

    /// Whether the tracking table exists.
    pub fn exists(&self, conn: &Connection) -> StoreResult<bool> {
        let found = conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![self.table],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// All applied records, ascending by version.
    pub fn list_applied(&self, conn: &Connection) -> StoreResult<Vec<AppliedRecord>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT version, applied_at FROM {} ORDER BY version",
            self.table
        ))?;

        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (version, applied_at) = row?;
            records.push(AppliedRecord {
                version,
                applied_at: parse_applied_at(&applied_at)?,
            });
        }
        Ok(records)
    }

    /// Insert the record for `version`. Fails if it is already present.
    pub fn record_applied(&self, conn: &Connection, version: &str) -> StoreResult<()> {
        conn.execute(
            &format!(
                "INSERT INTO {} (version, applied_at) VALUES (?1, ?2)",
                self.table
            ),
            params![version, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Delete the record for `version`. Fails if there was none.
    pub fn remove_applied(&self, conn: &Connection, version: &str) -> StoreResult<()> {
        let affected = conn.execute(
            &format!("DELETE FROM {} WHERE version = ?1", self.table),
            params![version],
        )?;
        if affected == 0 {
            return Err(StoreError::NotApplied(version.to_string()));
        }
        Ok(())
    }
}

/// Timestamps this crate writes are RFC 3339. Tables filled by other tools
/// often hold SQLite's `CURRENT_TIMESTAMP` text instead, which is UTC.
fn parse_applied_at(text: &str) -> StoreResult<DateTime<Utc>> {
    if let Ok(at) = DateTime::parse_from_rfc3339(text) {
        return Ok(at.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f"))?;
    Ok(naive.and_utc())
}

pub(crate) fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
