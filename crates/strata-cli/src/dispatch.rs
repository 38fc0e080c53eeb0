//! Command dispatch.
//!
//! Maps a command name and its parameters to exactly one [`Migrator`] call and
//! folds the outcome into a [`DispatchResponse`]. Unknown commands and bad
//! parameters are rejected before the database is opened.

use serde::{Deserialize, Serialize};
use strata_store::lock::LockRecord;
use strata_store::{CancelToken, Database, Direction, Migrator, RunOutcome};
use tracing::{debug, info, warn};

use crate::config::MigrateConfig;
use crate::error::DispatchError;

/// A command as received from the command line or as JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DispatchRequest {
    pub command: String,
    #[serde(default)]
    pub steps: Option<i64>,
    #[serde(default)]
    pub dry_run: bool,
}

impl DispatchRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Apply,
    Rollback,
    Status,
    Unlock,
}

impl Command {
    fn parse(name: &str) -> Result<Self, DispatchError> {
        match name.trim() {
            "apply" | "migrate" => Ok(Command::Apply),
            "rollback" => Ok(Command::Rollback),
            "status" => Ok(Command::Status),
            "unlock" => Ok(Command::Unlock),
            other => Err(DispatchError::UnknownCommand(other.to_string())),
        }
    }

    /// Commands that must not create the database file.
    fn is_read_only(self, dry_run: bool) -> bool {
        matches!(self, Command::Status | Command::Unlock) || dry_run
    }

    fn failure_message(self) -> &'static str {
        match self {
            Command::Apply => "Migration failed",
            Command::Rollback => "Rollback failed",
            Command::Status => "Failed to get migration status",
            Command::Unlock => "Failed to release migration lock",
        }
    }
}

/// Error details of a failed command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub message: String,
}

/// What a command reports back to the caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DispatchResponse {
    pub success: bool,
    pub message: String,
    /// Versions applied or reverted by this run, or planned in a dry run.
    #[serde(default)]
    pub applied_versions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining_applied_versions: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_versions: Option<Vec<String>>,
    /// Lock removed by `unlock`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub released_lock: Option<LockRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl DispatchResponse {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            ..Self::default()
        }
    }

    /// A failure that happened before or instead of running anything.
    pub fn failure(message: impl Into<String>, error: &DispatchError) -> Self {
        let message = match error {
            DispatchError::Migrate(
                strata_store::MigrateError::LockHeld { .. } | strata_store::MigrateError::LockBusy(_),
            ) => "Another migration is in progress".to_string(),
            _ => message.into(),
        };
        Self {
            success: false,
            message,
            error: Some(ErrorBody {
                kind: error.kind().to_string(),
                version: error.version().map(str::to_string),
                message: error.to_string(),
            }),
            ..Self::default()
        }
    }

    fn from_outcome(outcome: RunOutcome) -> Self {
        let forward = outcome.direction == Direction::Forward;
        let message = match (&outcome.failure, outcome.cancelled, forward) {
            (Some(_), _, true) => "Migration failed",
            (Some(_), _, false) => "Rollback failed",
            (None, true, true) => "Migration interrupted",
            (None, true, false) => "Rollback interrupted",
            (None, false, true) if outcome.completed.is_empty() => "No new migrations to apply",
            (None, false, false) if outcome.completed.is_empty() => "No migrations to rollback",
            (None, false, true) => "Migrations applied successfully",
            (None, false, false) => "Rollback completed successfully",
        };

        let error = match (&outcome.failure, outcome.cancelled) {
            (Some(failure), _) => Some(ErrorBody {
                kind: failure.error.kind().to_string(),
                version: Some(failure.version.clone()),
                message: failure.error.to_string(),
            }),
            (None, true) => Some(ErrorBody {
                kind: "cancelled".to_string(),
                version: None,
                message: "Cancelled before all versions ran; re-run to continue".to_string(),
            }),
            (None, false) => None,
        };

        Self {
            success: outcome.is_success(),
            message: message.to_string(),
            applied_versions: outcome.completed,
            error,
            ..Self::default()
        }
    }
}

/// Runs one request against the configured database.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    config: MigrateConfig,
}

impl Dispatcher {
    pub fn new(config: MigrateConfig) -> Self {
        Self { config }
    }

    pub fn dispatch(&self, request: &DispatchRequest, cancel: &CancelToken) -> DispatchResponse {
        info!(
            command = %request.command,
            steps = ?request.steps,
            dry_run = request.dry_run,
            "Received migration request"
        );

        let command = match Command::parse(&request.command) {
            Ok(command) => command,
            Err(e) => {
                warn!(command = %request.command, "unknown command");
                return DispatchResponse::failure("Unknown command", &e);
            }
        };

        match self.run(command, request, cancel) {
            Ok(response) => response,
            Err(e) => DispatchResponse::failure(command.failure_message(), &e),
        }
    }

    /// A missing database is treated as an empty one by read-only commands,
    /// without creating the file.
    fn open_database(&self, read_only: bool) -> Result<Database, DispatchError> {
        let path = &self.config.database_path;
        if !read_only {
            return Ok(Database::open_at(path, self.config.busy_timeout)?);
        }
        match Database::open_existing(path, self.config.busy_timeout)? {
            Some(db) => Ok(db),
            None => {
                info!(path = %path.display(), "database does not exist yet, nothing applied");
                Ok(Database::open_in_memory()?)
            }
        }
    }

    fn run(
        &self,
        command: Command,
        request: &DispatchRequest,
        cancel: &CancelToken,
    ) -> Result<DispatchResponse, DispatchError> {
        if let Some(steps) = request.steps {
            if command != Command::Rollback {
                debug!(steps, "steps only applies to rollback, ignoring");
            } else if steps <= 0 {
                return Err(strata_store::MigrateError::InvalidArgument(
                    "steps must be greater than 0".to_string(),
                )
                .into());
            }
        }

        let db = self.open_database(command.is_read_only(request.dry_run))?;
        let migrator =
            Migrator::new(&db, self.config.migrator_settings())?.with_cancel(cancel.clone());

        let mut response = match command {
            Command::Apply if request.dry_run => {
                let plan = migrator.plan_apply()?;
                let mut response = DispatchResponse::ok(format!(
                    "Dry run: {} migration(s) would be applied",
                    plan.len()
                ));
                response.applied_versions = plan.versions();
                response
            }
            Command::Rollback if request.dry_run => {
                let plan = migrator.plan_rollback(request.steps)?;
                let mut response = DispatchResponse::ok(format!(
                    "Dry run: {} migration(s) would be rolled back",
                    plan.len()
                ));
                response.applied_versions = plan.versions();
                response
            }
            Command::Apply => DispatchResponse::from_outcome(migrator.apply()?),
            Command::Rollback => DispatchResponse::from_outcome(migrator.rollback(request.steps)?),
            Command::Status => {
                let status = migrator.status()?;
                let mut response = DispatchResponse::ok("Migration status retrieved successfully");
                response.remaining_applied_versions = Some(status.applied_versions());
                response.pending_versions = status.pending;
                return Ok(response);
            }
            Command::Unlock => {
                let released = migrator.unlock()?;
                let mut response = DispatchResponse::ok(if released.is_some() {
                    "Migration lock released"
                } else {
                    "Migration lock was not held"
                });
                response.released_lock = released;
                return Ok(response);
            }
        };

        // Report where the database ended up, even after a partial failure.
        match migrator.applied() {
            Ok(applied) => {
                response.remaining_applied_versions =
                    Some(applied.into_iter().map(|r| r.version).collect());
            }
            Err(e) => warn!(error = %e, "could not read applied versions after run"),
        }

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use tempfile::TempDir;

    use super::*;

    fn setup() -> (TempDir, Dispatcher) {
        let dir = TempDir::new().unwrap();
        let migrations = dir.path().join("migrations");
        fs::create_dir(&migrations).unwrap();

        let config = MigrateConfig {
            database_path: dir.path().join("app.db"),
            migrations_path: migrations,
            ..MigrateConfig::default()
        };
        (dir, Dispatcher::new(config))
    }

    fn script(dir: &Path, name: &str, body: &str) {
        fs::write(dir.join("migrations").join(name), body).unwrap();
    }

    fn request(command: &str, steps: Option<i64>) -> DispatchRequest {
        DispatchRequest {
            command: command.to_string(),
            steps,
            dry_run: false,
        }
    }

    fn dispatch(dispatcher: &Dispatcher, request: DispatchRequest) -> DispatchResponse {
        dispatcher.dispatch(&request, &CancelToken::new())
    }

    #[test]
    fn unknown_command_never_opens_the_database() {
        let (dir, dispatcher) = setup();

        let response = dispatch(&dispatcher, DispatchRequest::new("explode"));
        assert!(!response.success);
        assert_eq!(response.message, "Unknown command");
        let error = response.error.unwrap();
        assert_eq!(error.kind, "unknown_command");
        assert_eq!(error.message, "Unknown command: explode");
        assert!(!dir.path().join("app.db").exists());
    }

    #[test]
    fn invalid_steps_never_open_the_database() {
        let (dir, dispatcher) = setup();

        let response = dispatch(&dispatcher, request("rollback", Some(0)));
        assert!(!response.success);
        assert_eq!(response.message, "Rollback failed");
        assert_eq!(response.error.unwrap().kind, "invalid_argument");
        assert!(!dir.path().join("app.db").exists());
    }

    #[test]
    fn apply_then_status() {
        let (dir, dispatcher) = setup();
        script(dir.path(), "001.a.up.sql", "CREATE TABLE a (id INTEGER);");
        script(dir.path(), "002.b.up.sql", "CREATE TABLE b (id INTEGER);");

        let response = dispatch(&dispatcher, DispatchRequest::new("apply"));
        assert!(response.success, "{response:?}");
        assert_eq!(response.message, "Migrations applied successfully");
        assert_eq!(response.applied_versions, ["001", "002"]);
        assert_eq!(
            response.remaining_applied_versions,
            Some(vec!["001".to_string(), "002".to_string()])
        );

        let again = dispatch(&dispatcher, DispatchRequest::new("migrate"));
        assert!(again.success);
        assert_eq!(again.message, "No new migrations to apply");
        assert!(again.applied_versions.is_empty());

        let status = dispatch(&dispatcher, DispatchRequest::new("status"));
        assert!(status.success);
        assert_eq!(status.message, "Migration status retrieved successfully");
        assert_eq!(
            status.remaining_applied_versions,
            Some(vec!["001".to_string(), "002".to_string()])
        );
        assert_eq!(status.pending_versions, Some(Vec::new()));
    }

    #[test]
    fn partial_failure_names_the_failing_version() {
        let (dir, dispatcher) = setup();
        script(dir.path(), "001.a.up.sql", "CREATE TABLE a (id INTEGER);");
        script(dir.path(), "002.b.up.sql", "CREATE TABLE a (id INTEGER);");
        script(dir.path(), "003.c.up.sql", "CREATE TABLE c (id INTEGER);");

        let response = dispatch(&dispatcher, DispatchRequest::new("apply"));
        assert!(!response.success);
        assert_eq!(response.message, "Migration failed");
        assert_eq!(response.applied_versions, ["001"]);
        assert_eq!(
            response.remaining_applied_versions,
            Some(vec!["001".to_string()])
        );
        let error = response.error.unwrap();
        assert_eq!(error.kind, "script_execution");
        assert_eq!(error.version.as_deref(), Some("002"));

        let status = dispatch(&dispatcher, DispatchRequest::new("status"));
        assert_eq!(
            status.pending_versions,
            Some(vec!["002".to_string(), "003".to_string()])
        );
    }

    #[test]
    fn rollback_reports_reverted_versions() {
        let (dir, dispatcher) = setup();
        script(dir.path(), "001.a.up.sql", "CREATE TABLE a (id INTEGER);");
        script(dir.path(), "001.a.down.sql", "DROP TABLE a;");
        script(dir.path(), "002.b.up.sql", "CREATE TABLE b (id INTEGER);");
        script(dir.path(), "002.b.down.sql", "DROP TABLE b;");
        dispatch(&dispatcher, DispatchRequest::new("apply"));

        let response = dispatch(&dispatcher, request("rollback", Some(5)));
        assert!(response.success);
        assert_eq!(response.message, "Rollback completed successfully");
        assert_eq!(response.applied_versions, ["002", "001"]);
        assert_eq!(response.remaining_applied_versions, Some(Vec::new()));

        let nothing = dispatch(&dispatcher, request("rollback", None));
        assert!(nothing.success);
        assert_eq!(nothing.message, "No migrations to rollback");
    }

    #[test]
    fn missing_down_script_is_reported() {
        let (dir, dispatcher) = setup();
        script(dir.path(), "001.a.up.sql", "CREATE TABLE a (id INTEGER);");
        dispatch(&dispatcher, DispatchRequest::new("apply"));

        let response = dispatch(&dispatcher, request("rollback", None));
        assert!(!response.success);
        let error = response.error.unwrap();
        assert_eq!(error.kind, "missing_rollback_script");
        assert_eq!(error.version.as_deref(), Some("001"));
        assert_eq!(
            response.remaining_applied_versions,
            Some(vec!["001".to_string()])
        );
    }

    #[test]
    fn duplicate_catalog_is_rejected() {
        let (dir, dispatcher) = setup();
        script(dir.path(), "20240101.a.up.sql", "CREATE TABLE a (id INTEGER);");
        script(dir.path(), "20240101.b.up.sql", "CREATE TABLE b (id INTEGER);");

        let response = dispatch(&dispatcher, DispatchRequest::new("apply"));
        assert!(!response.success);
        let error = response.error.unwrap();
        assert_eq!(error.kind, "catalog");
        assert_eq!(error.version.as_deref(), Some("20240101"));

        let status = dispatch(&dispatcher, DispatchRequest::new("status"));
        assert!(status.success);
        assert_eq!(status.remaining_applied_versions, Some(Vec::new()));
        assert_eq!(status.pending_versions, None);
    }

    #[test]
    fn dry_run_changes_nothing() {
        let (dir, dispatcher) = setup();
        script(dir.path(), "001.a.up.sql", "CREATE TABLE a (id INTEGER);");

        let mut req = DispatchRequest::new("apply");
        req.dry_run = true;
        let response = dispatch(&dispatcher, req);
        assert!(response.success);
        assert_eq!(response.applied_versions, ["001"]);
        assert_eq!(response.remaining_applied_versions, Some(Vec::new()));

        let status = dispatch(&dispatcher, DispatchRequest::new("status"));
        assert_eq!(status.pending_versions, Some(vec!["001".to_string()]));
    }

    #[test]
    fn cancelled_before_start_reports_interruption() {
        let (dir, dispatcher) = setup();
        script(dir.path(), "001.a.up.sql", "CREATE TABLE a (id INTEGER);");

        let cancel = CancelToken::new();
        cancel.cancel();
        let response = dispatcher.dispatch(&DispatchRequest::new("apply"), &cancel);
        assert!(!response.success);
        assert_eq!(response.message, "Migration interrupted");
        assert_eq!(response.error.unwrap().kind, "cancelled");
    }

    #[test]
    fn unlock_reports_released_holder() {
        let (dir, dispatcher) = setup();
        let response = dispatch(&dispatcher, DispatchRequest::new("unlock"));
        assert!(response.success);
        assert_eq!(response.message, "Migration lock was not held");
        assert!(response.released_lock.is_none());

        let db =
            Database::open_at(&dir.path().join("app.db"), std::time::Duration::ZERO).unwrap();
        let migrator = Migrator::new(&db, dispatcher.config.migrator_settings()).unwrap();
        std::mem::forget(migrator.lock().acquire(db.conn()).unwrap());

        let blocked = dispatch(&dispatcher, DispatchRequest::new("apply"));
        assert!(!blocked.success);
        assert_eq!(blocked.message, "Another migration is in progress");
        assert_eq!(blocked.error.unwrap().kind, "lock_held");

        let response = dispatch(&dispatcher, DispatchRequest::new("unlock"));
        assert!(response.success);
        assert_eq!(response.message, "Migration lock released");
        assert!(response.released_lock.is_some());
    }

    #[test]
    fn read_only_commands_leave_a_missing_database_missing() {
        let (dir, dispatcher) = setup();
        script(dir.path(), "001.a.up.sql", "CREATE TABLE a (id INTEGER);");
        let db_path = dir.path().join("app.db");

        let status = dispatch(&dispatcher, DispatchRequest::new("status"));
        assert!(status.success);
        assert_eq!(status.remaining_applied_versions, Some(Vec::new()));
        assert_eq!(status.pending_versions, Some(vec!["001".to_string()]));

        let unlock = dispatch(&dispatcher, DispatchRequest::new("unlock"));
        assert!(unlock.success);
        assert_eq!(unlock.message, "Migration lock was not held");

        let mut dry = DispatchRequest::new("apply");
        dry.dry_run = true;
        let plan = dispatch(&dispatcher, dry);
        assert!(plan.success);
        assert_eq!(plan.applied_versions, ["001"]);

        assert!(!db_path.exists());

        assert!(dispatch(&dispatcher, DispatchRequest::new("apply")).success);
        assert!(db_path.exists());
    }

    #[test]
    fn busy_database_is_reported_as_migration_in_progress() {
        let (dir, mut dispatcher) = setup();
        dispatcher.config.busy_timeout = std::time::Duration::from_millis(50);
        script(dir.path(), "001.a.up.sql", "CREATE TABLE a (id INTEGER);");

        let other = Database::open_at(&dir.path().join("app.db"), std::time::Duration::ZERO)
            .unwrap();
        let writing = rusqlite::Transaction::new_unchecked(
            other.conn(),
            rusqlite::TransactionBehavior::Immediate,
        )
        .unwrap();
        writing.execute_batch("CREATE TABLE other_work (id INTEGER);").unwrap();

        let blocked = dispatch(&dispatcher, DispatchRequest::new("apply"));
        assert!(!blocked.success);
        assert_eq!(blocked.message, "Another migration is in progress");
        assert_eq!(blocked.error.unwrap().kind, "lock_held");

        drop(writing);
        assert!(dispatch(&dispatcher, DispatchRequest::new("apply")).success);
    }

    #[test]
    fn response_json_shape() {
        let response = DispatchResponse {
            success: true,
            message: "Migrations applied successfully".to_string(),
            applied_versions: vec!["001".to_string()],
            ..DispatchResponse::default()
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "success": true,
                "message": "Migrations applied successfully",
                "applied_versions": ["001"],
            })
        );

        let parsed: DispatchRequest =
            serde_json::from_str(r#"{"command": "rollback", "steps": 2}"#).unwrap();
        assert_eq!(parsed, request("rollback", Some(2)));
    }
}
