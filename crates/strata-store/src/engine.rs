//! Migration engine.
//!
//! [`Migrator`] diffs the on-disk [`Catalog`] against the tracking table and
//! runs the difference one version per transaction:
//!
//! - `apply` runs every pending forward script in ascending version order.
//! - `rollback` runs the backward scripts of the most recently applied
//!   versions in descending order.
//! - `status` reports applied and pending versions without writing anything.
//!
//! A failing version is rolled back on its own and stops the run. Versions
//! committed before it stay committed, so re-running picks up where the
//! failure left off.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rusqlite::{Transaction, TransactionBehavior};
use tracing::{error, info, warn};

use crate::applied::{AppliedStore, DEFAULT_TABLE};
use crate::catalog::Catalog;
use crate::database::Database;
use crate::error::{MigrateError, Result};
use crate::lock::{LockRecord, MigrationLock};
use crate::models::{
    AppliedRecord, Direction, MigrationPlan, MigrationScript, PlannedStep, RunOutcome, Status,
    StepFailure,
};

/// Number of versions `rollback` reverts when no count is given.
pub const DEFAULT_ROLLBACK_STEPS: i64 = 1;

/// Where scripts come from and where versions are tracked.
#[derive(Debug, Clone)]
pub struct MigratorSettings {
    /// Directory scanned for `<version>.<name>.<up|down>.sql` files.
    pub source: PathBuf,
    /// Tracking table name.
    pub table: String,
}

impl MigratorSettings {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            table: DEFAULT_TABLE.to_string(),
        }
    }
}

/// Cooperative stop request, checked between versions.
///
/// The version in flight when the token fires always finishes, either
/// committed or rolled back.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct Migrator<'a> {
    db: &'a Database,
    source: PathBuf,
    store: AppliedStore,
    lock: MigrationLock,
    cancel: CancelToken,
}

impl<'a> Migrator<'a> {
    pub fn new(db: &'a Database, settings: MigratorSettings) -> Result<Self> {
        let store = AppliedStore::new(settings.table)?;
        let lock = MigrationLock::for_store(&store);

        Ok(Self {
            db,
            source: settings.source,
            store,
            lock,
            cancel: CancelToken::default(),
        })
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn store(&self) -> &AppliedStore {
        &self.store
    }

    pub fn lock(&self) -> &MigrationLock {
        &self.lock
    }

    // -----------------------------------------------------------------------
    // Read-only operations
    // -----------------------------------------------------------------------

    /// Applied records, ascending. Empty when the tracking table is absent.
    pub fn applied(&self) -> Result<Vec<AppliedRecord>> {
        let conn = self.db.conn();
        if !self.store.exists(conn)? {
            return Ok(Vec::new());
        }
        Ok(self.store.list_applied(conn)?)
    }

    /// Applied and pending versions.
    ///
    /// An unreadable catalog does not hide the applied versions: `pending`
    /// is `None` and the catalog error is logged.
    pub fn status(&self) -> Result<Status> {
        let applied = self.applied()?;

        let pending = match Catalog::load(&self.source) {
            Ok(catalog) => Some(pending_versions(&catalog, &applied)),
            Err(e) => {
                warn!(error = %e, "cannot read migration catalog, pending versions unknown");
                None
            }
        };

        Ok(Status { applied, pending })
    }

    /// What `apply` would run right now.
    pub fn plan_apply(&self) -> Result<MigrationPlan> {
        let catalog = Catalog::load(&self.source)?;
        let applied = self.applied()?;

        let steps = pending_versions(&catalog, &applied)
            .iter()
            .filter_map(|v| catalog.forward(v))
            .map(planned)
            .collect();
        Ok(MigrationPlan { steps })
    }

    /// What `rollback(steps)` would run right now.
    ///
    /// Unlike the real run, a missing backward script fails the whole plan.
    pub fn plan_rollback(&self, steps: Option<i64>) -> Result<MigrationPlan> {
        let steps = validate_steps(steps)?;
        let catalog = Catalog::load(&self.source)?;
        let applied = self.applied()?;

        let mut plan = MigrationPlan::default();
        for version in rollback_versions(&applied, steps) {
            let script = catalog
                .backward(&version)
                .ok_or_else(|| MigrateError::MissingRollbackScript {
                    version: version.clone(),
                })?;
            plan.steps.push(planned(script));
        }
        Ok(plan)
    }

    // -----------------------------------------------------------------------
    // Mutating operations
    // -----------------------------------------------------------------------

    /// Run every pending forward script, oldest first.
    pub fn apply(&self) -> Result<RunOutcome> {
        let conn = self.db.conn();
        let _guard = self.lock.acquire(conn)?;

        let catalog = Catalog::load(&self.source)?;
        self.store.ensure_initialized(conn)?;
        let applied = self.store.list_applied(conn)?;

        let pending = pending_versions(&catalog, &applied);
        if pending.is_empty() {
            info!("No new migrations to apply");
        } else {
            info!(count = pending.len(), "applying pending migrations");
        }

        Ok(self.run(Direction::Forward, pending, &catalog))
    }

    /// Revert the `steps` most recently applied versions, newest first.
    ///
    /// `steps` defaults to 1 and is clamped to the number of applied versions.
    pub fn rollback(&self, steps: Option<i64>) -> Result<RunOutcome> {
        let steps = validate_steps(steps)?;

        let conn = self.db.conn();
        let _guard = self.lock.acquire(conn)?;

        let catalog = Catalog::load(&self.source)?;
        self.store.ensure_initialized(conn)?;
        let applied = self.store.list_applied(conn)?;

        let selected = rollback_versions(&applied, steps);
        if selected.is_empty() {
            info!("No migrations to rollback");
        } else {
            info!(count = selected.len(), "rolling back migrations");
        }

        Ok(self.run(Direction::Backward, selected, &catalog))
    }

    /// Clear the migration lock left by a runner that died.
    pub fn unlock(&self) -> Result<Option<LockRecord>> {
        let removed = self.lock.force_release(self.db.conn())?;
        match &removed {
            Some(record) => warn!(
                holder = %record.holder,
                pid = record.pid,
                since = %record.acquired_at,
                "forcibly released migration lock"
            ),
            None => info!("migration lock was not held"),
        }
        Ok(removed)
    }

    fn run(&self, direction: Direction, versions: Vec<String>, catalog: &Catalog) -> RunOutcome {
        let mut outcome = RunOutcome::new(direction);

        for version in versions {
            if self.cancel.is_cancelled() {
                warn!(next = %version, "cancellation requested, stopping before next version");
                outcome.cancelled = true;
                break;
            }

            let result = match catalog.get(&version, direction) {
                Some(script) => self.run_script(script),
                None => Err(MigrateError::MissingRollbackScript {
                    version: version.clone(),
                }),
            };

            match result {
                Ok(()) => outcome.completed.push(version),
                Err(e) => {
                    error!(version = %version, %direction, error = %e, "migration failed");
                    outcome.failure = Some(StepFailure { version, error: e });
                    break;
                }
            }
        }

        outcome
    }

    /// Execute one script and its bookkeeping in a single transaction.
    ///
    /// Any error drops the transaction, which rolls it back.
    fn run_script(&self, script: &MigrationScript) -> Result<()> {
        match script.direction {
            Direction::Forward => {
                info!(version = %script.version, name = %script.name, "Applying migration")
            }
            Direction::Backward => {
                info!(version = %script.version, name = %script.name, "Rolling back migration")
            }
        }

        let tx = Transaction::new_unchecked(self.db.conn(), TransactionBehavior::Immediate)?;

        tx.execute_batch(&script.body)
            .map_err(|source| MigrateError::ScriptExecution {
                version: script.version.clone(),
                direction: script.direction,
                source,
            })?;

        match script.direction {
            Direction::Forward => self.store.record_applied(&tx, &script.version)?,
            Direction::Backward => self.store.remove_applied(&tx, &script.version)?,
        }

        tx.commit()?;

        info!(version = %script.version, direction = %script.direction, "migration committed");
        Ok(())
    }
}

fn validate_steps(steps: Option<i64>) -> Result<usize> {
    let steps = steps.unwrap_or(DEFAULT_ROLLBACK_STEPS);
    if steps <= 0 {
        return Err(MigrateError::InvalidArgument(
            "steps must be greater than 0".to_string(),
        ));
    }
    Ok(usize::try_from(steps).unwrap_or(usize::MAX))
}

/// Forward versions not in `applied`, ascending.
fn pending_versions(catalog: &Catalog, applied: &[AppliedRecord]) -> Vec<String> {
    catalog
        .forward_versions()
        .filter(|v| !applied.iter().any(|r| r.version == *v))
        .map(str::to_string)
        .collect()
}

/// The `steps` highest applied versions, descending.
fn rollback_versions(applied: &[AppliedRecord], steps: usize) -> Vec<String> {
    let mut versions: Vec<String> = applied.iter().map(|r| r.version.clone()).collect();
    versions.sort_unstable_by(|a, b| b.cmp(a));
    versions.truncate(steps);
    versions
}

fn planned(script: &MigrationScript) -> PlannedStep {
    PlannedStep {
        version: script.version.clone(),
        name: script.name.clone(),
        direction: script.direction,
    }
}
