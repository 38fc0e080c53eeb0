//! Runner configuration loaded from environment variables.
//!
//! All settings have defaults so `strata status` works in a directory that
//! holds a `migrations/` folder and nothing else. Command-line flags override
//! whatever the environment provides.

use std::path::PathBuf;
use std::time::Duration;

use strata_store::applied::DEFAULT_TABLE;
use strata_store::MigratorSettings;

/// Runner configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrateConfig {
    /// SQLite database file the migrations run against.
    /// Env: `STRATA_DATABASE_PATH`
    /// Default: `./strata.db`
    pub database_path: PathBuf,

    /// Directory holding `<version>.<name>.<up|down>.sql` scripts.
    /// Env: `STRATA_MIGRATIONS_PATH`
    /// Default: `./migrations`
    pub migrations_path: PathBuf,

    /// Tracking table name.
    /// Env: `STRATA_MIGRATIONS_TABLE`
    /// Default: `schema_migrations`
    pub table: String,

    /// How long a statement waits for another writer.
    /// Env: `STRATA_BUSY_TIMEOUT_MS`
    /// Default: 5000 ms
    pub busy_timeout: Duration,
}

impl Default for MigrateConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("./strata.db"),
            migrations_path: PathBuf::from("./migrations"),
            table: DEFAULT_TABLE.to_string(),
            busy_timeout: Duration::from_millis(5000),
        }
    }
}

impl MigrateConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(path) = var("STRATA_DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }

        if let Some(path) = var("STRATA_MIGRATIONS_PATH") {
            config.migrations_path = PathBuf::from(path);
        }

        if let Some(table) = var("STRATA_MIGRATIONS_TABLE") {
            if !table.is_empty() {
                config.table = table;
            }
        }

        if let Some(val) = var("STRATA_BUSY_TIMEOUT_MS") {
            match val.parse::<u64>() {
                Ok(ms) => config.busy_timeout = Duration::from_millis(ms),
                Err(e) => tracing::warn!(
                    value = %val,
                    error = %e,
                    "Invalid STRATA_BUSY_TIMEOUT_MS, using default"
                ),
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter.

        config
    }

    pub fn migrator_settings(&self) -> MigratorSettings {
        MigratorSettings {
            source: self.migrations_path.clone(),
            table: self.table.clone(),
        }
    }
}
