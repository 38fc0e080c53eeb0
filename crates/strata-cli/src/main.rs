//! # strata
//!
//! Command-line runner for versioned SQLite schema migrations.
//!
//! Each invocation runs exactly one command and exits:
//! - **apply** (alias **migrate**) runs every pending `up` script
//! - **rollback** reverts the most recently applied versions (`--steps`)
//! - **status** lists applied and pending versions
//! - **unlock** clears the migration lock of a runner that was killed
//!
//! The result is printed to stdout as JSON. Logs go to stderr.

mod config;
mod dispatch;
mod error;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use strata_store::CancelToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::MigrateConfig;
use crate::dispatch::{DispatchRequest, DispatchResponse, Dispatcher};
use crate::error::DispatchError;

#[derive(Parser, Debug)]
#[command(
    name = "strata",
    version,
    about = "Apply and roll back versioned SQLite schema migrations",
    after_help = "Examples:\n  \
    strata apply\n  \
    strata rollback --steps 2\n  \
    strata status --database ./app.db --migrations ./migrations\n  \
    strata --request '{\"command\": \"rollback\", \"steps\": 1}'"
)]
struct Cli {
    /// Command to run: apply, migrate, rollback, status or unlock
    ///
    /// Defaults to status.
    #[arg(value_name = "COMMAND")]
    command: Option<String>,

    /// Number of versions to roll back
    #[arg(long, allow_negative_numbers = true)]
    steps: Option<i64>,

    /// Report what would run without changing the database
    #[arg(long)]
    dry_run: bool,

    /// Full request as JSON, e.g. '{"command": "rollback", "steps": 2}'
    #[arg(long, value_name = "JSON", conflicts_with_all = ["command", "steps", "dry_run"])]
    request: Option<String>,

    /// SQLite database file [env: STRATA_DATABASE_PATH]
    #[arg(long, value_name = "PATH")]
    database: Option<PathBuf>,

    /// Directory containing migration scripts [env: STRATA_MIGRATIONS_PATH]
    #[arg(long, value_name = "PATH")]
    migrations: Option<PathBuf>,

    /// Tracking table name [env: STRATA_MIGRATIONS_TABLE]
    #[arg(long, value_name = "NAME")]
    table: Option<String>,
}

impl Cli {
    fn apply_overrides(&self, config: &mut MigrateConfig) {
        if let Some(path) = &self.database {
            config.database_path = path.clone();
        }
        if let Some(path) = &self.migrations {
            config.migrations_path = path.clone();
        }
        if let Some(table) = &self.table {
            config.table = table.clone();
        }
    }

    fn to_request(&self) -> Result<DispatchRequest, DispatchError> {
        if let Some(json) = &self.request {
            return serde_json::from_str(json)
                .map_err(|e| DispatchError::InvalidRequest(e.to_string()));
        }

        let mut request = DispatchRequest::new(self.command.as_deref().unwrap_or("status"));
        request.steps = self.steps;
        request.dry_run = self.dry_run;
        Ok(request)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var), stdout is for JSON
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,strata_store=debug,strata_cli=debug")),
        )
        .init();

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let cli = Cli::parse();
    let mut config = MigrateConfig::from_env();
    cli.apply_overrides(&mut config);
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Run the command
    // -----------------------------------------------------------------------
    let response = match cli.to_request() {
        Ok(request) => run(config, request).await?,
        Err(e) => DispatchResponse::failure("Invalid request", &e),
    };

    println!("{}", serde_json::to_string_pretty(&response)?);

    Ok(if response.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Run the dispatcher off the async runtime so Ctrl+C can be observed while
/// a migration is executing.
async fn run(config: MigrateConfig, request: DispatchRequest) -> anyhow::Result<DispatchResponse> {
    let cancel = CancelToken::new();
    let dispatcher = Dispatcher::new(config);

    let mut worker = {
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || dispatcher.dispatch(&request, &cancel))
    };

    // The in-flight version always finishes; cancellation only prevents the
    // next one from starting.
    tokio::select! {
        result = &mut worker => Ok(result?),
        signal = tokio::signal::ctrl_c() => {
            on_ctrl_c(signal, &cancel);
            Ok(worker.await?)
        }
    }
}

fn on_ctrl_c(signal: std::io::Result<()>, cancel: &CancelToken) {
    match signal {
        Ok(()) => {
            warn!("Received Ctrl+C, stopping after the current migration");
            cancel.cancel();
        }
        Err(e) => warn!(error = %e, "Cannot listen for Ctrl+C, running to completion"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("strata").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn defaults_to_status() {
        let request = parse(&[]).to_request().unwrap();
        assert_eq!(request, DispatchRequest::new("status"));
    }

    #[test]
    fn positional_command_with_steps() {
        let request = parse(&["rollback", "--steps", "3"]).to_request().unwrap();
        assert_eq!(request.command, "rollback");
        assert_eq!(request.steps, Some(3));
        assert!(!request.dry_run);

        let negative = parse(&["rollback", "--steps", "-1"]).to_request().unwrap();
        assert_eq!(negative.steps, Some(-1));
    }

    #[test]
    fn json_request() {
        let request = parse(&["--request", r#"{"command": "apply", "dry_run": true}"#])
            .to_request()
            .unwrap();
        assert_eq!(request.command, "apply");
        assert!(request.dry_run);

        let bad = parse(&["--request", "not json"]).to_request();
        assert!(matches!(bad, Err(DispatchError::InvalidRequest(_))));
    }

    #[test]
    fn request_conflicts_with_positional_command() {
        let result = Cli::try_parse_from(["strata", "apply", "--request", "{}"]);
        assert!(result.is_err());
    }

    #[test]
    fn only_a_delivered_ctrl_c_cancels() {
        let cancel = CancelToken::new();
        on_ctrl_c(
            Err(std::io::Error::new(std::io::ErrorKind::Other, "no signal handler")),
            &cancel,
        );
        assert!(!cancel.is_cancelled());

        on_ctrl_c(Ok(()), &cancel);
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn run_completes_without_a_signal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("migrations")).unwrap();
        let config = MigrateConfig {
            database_path: dir.path().join("app.db"),
            migrations_path: dir.path().join("migrations"),
            ..MigrateConfig::default()
        };

        let response = run(config, DispatchRequest::new("status")).await.unwrap();
        assert!(response.success);
        assert_eq!(response.pending_versions, Some(Vec::new()));
    }

    #[test]
    fn flags_override_config() {
        let cli = parse(&[
            "status",
            "--database",
            "/tmp/x.db",
            "--migrations",
            "/tmp/m",
            "--table",
            "versions",
        ]);
        let mut config = MigrateConfig::default();
        cli.apply_overrides(&mut config);
        assert_eq!(config.database_path, PathBuf::from("/tmp/x.db"));
        assert_eq!(config.migrations_path, PathBuf::from("/tmp/m"));
        assert_eq!(config.table, "versions");
    }
}
