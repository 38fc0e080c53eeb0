use std::path::PathBuf;

use thiserror::Error;

use crate::models::Direction;

/// Errors produced while reading the migrations directory.
#[derive(Error, Debug)]
pub enum CatalogError {
    /// The directory or one of its files could not be read.
    #[error("Cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Two files claim the same version and direction.
    #[error(
        "Duplicate {direction} script for version {version}: {} and {}",
        first.display(),
        second.display()
    )]
    Duplicate {
        version: String,
        direction: Direction,
        first: PathBuf,
        second: PathBuf,
    },
}

/// Errors produced by the tracking table and lock table.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error.
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A stored timestamp is not valid RFC 3339.
    #[error("Timestamp parse error: {0}")]
    ChronoParse(#[from] chrono::ParseError),

    /// A delete found no row for the version.
    #[error("Version {0} is not recorded as applied")]
    NotApplied(String),
}

/// Errors produced by a migration run.
#[derive(Error, Debug)]
pub enum MigrateError {
    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The connection could not be opened or configured.
    #[error("Database error: {0}")]
    Database(#[source] rusqlite::Error),

    /// The datastore rejected a script body.
    #[error("Failed to execute {direction} script for version {version}: {source}")]
    ScriptExecution {
        version: String,
        direction: Direction,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Down migration not found for version {version}")]
    MissingRollbackScript { version: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Another invocation holds the migration lock.
    #[error("Another migration is in progress (holder {holder}, since {acquired_at})")]
    LockHeld { holder: String, acquired_at: String },

    /// Another connection kept the database write-locked past the busy
    /// timeout while the migration lock was being taken.
    #[error("Another migration is in progress (database busy: {0})")]
    LockBusy(#[source] rusqlite::Error),
}

impl MigrateError {
    /// Short machine-readable name of the error class.
    pub fn kind(&self) -> &'static str {
        match self {
            MigrateError::Catalog(_) => "catalog",
            MigrateError::Store(_) | MigrateError::Database(_) => "store",
            MigrateError::ScriptExecution { .. } => "script_execution",
            MigrateError::MissingRollbackScript { .. } => "missing_rollback_script",
            MigrateError::InvalidArgument(_) => "invalid_argument",
            MigrateError::LockHeld { .. } | MigrateError::LockBusy(_) => "lock_held",
        }
    }

    /// The version this error is about, when there is one.
    pub fn version(&self) -> Option<&str> {
        match self {
            MigrateError::ScriptExecution { version, .. }
            | MigrateError::MissingRollbackScript { version } => Some(version.as_str()),
            MigrateError::Catalog(CatalogError::Duplicate { version, .. }) => Some(version.as_str()),
            MigrateError::Store(StoreError::NotApplied(version)) => Some(version.as_str()),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for MigrateError {
    fn from(e: rusqlite::Error) -> Self {
        MigrateError::Store(StoreError::Sqlite(e))
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MigrateError>;
