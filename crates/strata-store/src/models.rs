//! Data model shared by the catalog, the tracking table and the engine.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MigrateError;

// ---------------------------------------------------------------------------
// Direction
// ---------------------------------------------------------------------------

/// Which way a script moves the schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// `up` scripts, run by `apply`.
    Forward,
    /// `down` scripts, run by `rollback`.
    Backward,
}

impl Direction {
    /// Parse the direction token used in script file names.
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "up" => Some(Direction::Forward),
            "down" => Some(Direction::Backward),
            _ => None,
        }
    }

    /// The file name token for this direction.
    pub fn token(self) -> &'static str {
        match self {
            Direction::Forward => "up",
            Direction::Backward => "down",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

// ---------------------------------------------------------------------------
// MigrationScript
// ---------------------------------------------------------------------------

/// One migration file discovered on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationScript {
    /// Sortable version identifier, the first segment of the file name.
    pub version: String,
    /// Descriptive name, possibly empty.
    pub name: String,
    pub direction: Direction,
    /// Script text, handed to SQLite verbatim.
    pub body: String,
    /// Where the script was read from.
    pub path: PathBuf,
}

// ---------------------------------------------------------------------------
// AppliedRecord
// ---------------------------------------------------------------------------

/// A row of the tracking table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppliedRecord {
    pub version: String,
    pub applied_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// A single step the engine intends to run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlannedStep {
    pub version: String,
    pub name: String,
    pub direction: Direction,
}

/// Ordered steps computed for one invocation. Never persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationPlan {
    pub steps: Vec<PlannedStep>,
}

impl MigrationPlan {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn versions(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.version.clone()).collect()
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// The version that stopped a run, and why.
#[derive(Debug)]
pub struct StepFailure {
    pub version: String,
    pub error: MigrateError,
}

/// Result of an `apply` or `rollback` that got past planning.
///
/// Versions in `completed` are committed even when `failure` is set.
#[derive(Debug)]
pub struct RunOutcome {
    pub direction: Direction,
    /// Versions committed during this run, in execution order.
    pub completed: Vec<String>,
    pub failure: Option<StepFailure>,
    /// Set when a cancellation request stopped the run between versions.
    pub cancelled: bool,
}

impl RunOutcome {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            completed: Vec::new(),
            failure: None,
            cancelled: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.failure.is_none() && !self.cancelled
    }
}

/// Snapshot returned by `status`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Status {
    /// Applied records, ascending by version.
    pub applied: Vec<AppliedRecord>,
    /// Forward versions not yet applied, ascending. `None` when the catalog
    /// could not be read.
    pub pending: Option<Vec<String>>,
}

impl Status {
    pub fn applied_versions(&self) -> Vec<String> {
        self.applied.iter().map(|r| r.version.clone()).collect()
    }
}
