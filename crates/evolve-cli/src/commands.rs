//! Subcommand handling.

use std::sync::Arc;

use evolve_core::migration::{
    ExecutionConfig, HistoryRecord, MigrationEngine, MigrationError, MigrationRegistry,
};
use evolve_core::storage::StorageEngine;
use thiserror::Error;

use crate::demo;
use crate::formatter::Formatter;
use crate::{Args, Command};

/// CLI errors.
#[derive(Debug, Error)]
pub enum CliError {
    /// Engine error.
    #[error(transparent)]
    Migration(#[from] MigrationError),

    /// Store could not be opened.
    #[error("failed to open store: {0}")]
    Open(#[from] evolve_core::Error),
}

impl CliError {
    /// Terminal record carried by the error, if any.
    pub fn record(&self) -> Option<&HistoryRecord> {
        match self {
            CliError::Migration(e) => e.record(),
            CliError::Open(_) => None,
        }
    }

    /// Process exit code. Halted runs are resumable and exit with 2.
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Migration(MigrationError::Timeout { .. }) => 2,
            _ => 1,
        }
    }
}

/// Open the store, build the engine and run one subcommand.
pub fn run(args: &Args, formatter: &dyn Formatter) -> Result<String, CliError> {
    let storage = Arc::new(StorageEngine::open(args.storage_config())?);
    let registry = MigrationRegistry::from_manifest(demo::manifest(&storage)?)?;
    let engine = MigrationEngine::new(storage.clone(), registry);
    execute(&engine, &args.command, formatter)
}

/// Run one subcommand against an engine.
pub fn execute(
    engine: &MigrationEngine,
    command: &Command,
    formatter: &dyn Formatter,
) -> Result<String, CliError> {
    let output = match command {
        Command::Status => formatter.format_status(&engine.status()?),

        Command::Pending => {
            let pending: Vec<String> = engine
                .list_pending()?
                .into_iter()
                .map(|unit| format!("{} ({})", unit.id(), unit.kind()))
                .collect();
            if pending.is_empty() {
                formatter.format_message("Nothing pending")
            } else {
                formatter.format_message(&pending.join("\n"))
            }
        }

        Command::Run { id, kind, options } => {
            let config = options.clone().into_config();
            let records = match id {
                Some(id) => vec![engine.execute(id, &config)?],
                None => engine.execute_all(*kind, &config)?,
            };
            formatter.format_records(&records)
        }

        Command::Rollback {
            id,
            dry_run,
            batch_size,
        } => {
            let config = ExecutionConfig::default()
                .with_dry_run(*dry_run)
                .with_batch_size(*batch_size);
            formatter.format_rollback(&engine.rollback_with(id, &config)?)
        }

        Command::Progress { id } => {
            engine.registry().require(id)?;
            formatter.format_progress(&engine.progress(id)?)
        }

        Command::History { id } => {
            engine.registry().require(id)?;
            formatter.format_records(&engine.history(id)?)
        }

        Command::Failures { id, attempt } => {
            let attempt = match attempt {
                Some(attempt) => *attempt,
                None => match engine.latest_record(id)? {
                    Some(record) => record.attempt,
                    None => return Ok(formatter.format_message("Never run")),
                },
            };
            formatter.format_failures(&engine.failures(id, attempt)?)
        }

        Command::Validate { id } => formatter.format_issues(&engine.validate(id)?),

        Command::Purge { id, reason } => {
            let removed = engine.purge_history(id, reason)?;
            formatter.format_message(&format!("Purged {} attempt(s) of {}", removed, id))
        }

        Command::Purges => formatter.format_purges(&engine.history_store().purge_log()?),

        Command::Seed { count } => {
            let inserted = demo::seed(engine.storage(), *count)?;
            formatter.format_message(&format!("Inserted {} user(s)", inserted))
        }
    };
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formatter::{JsonFormatter, TableFormatter};
    use crate::RunArgs;
    use clap::Parser;
    use evolve_core::storage::StorageConfig;

    fn engine() -> (MigrationEngine, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(StorageEngine::open(StorageConfig::new(dir.path())).unwrap());
        let registry = MigrationRegistry::from_manifest(demo::manifest(&storage).unwrap()).unwrap();
        (MigrationEngine::new(storage, registry), dir)
    }

    fn command(argv: &[&str]) -> Command {
        let mut full = vec!["evolve"];
        full.extend_from_slice(argv);
        Args::parse_from(full).command
    }

    #[test]
    fn test_pending_shrinks_after_run() {
        let (engine, _dir) = engine();
        let before = execute(&engine, &Command::Pending, &TableFormatter).unwrap();
        assert_eq!(before.lines().count(), 3);

        execute(&engine, &command(&["run", "001_create_users"]), &TableFormatter).unwrap();
        let after = execute(&engine, &Command::Pending, &TableFormatter).unwrap();
        assert!(!after.contains("001_create_users"));
        assert!(after.contains("002_display_name"));
    }

    #[test]
    fn test_seed_run_and_history() {
        let (engine, _dir) = engine();
        execute(&engine, &command(&["run", "001_create_users"]), &TableFormatter).unwrap();
        execute(&engine, &command(&["seed", "--count", "25"]), &TableFormatter).unwrap();
        execute(&engine, &command(&["run", "--batch-size", "10"]), &TableFormatter).unwrap();

        let history = execute(&engine, &command(&["history", "002_display_name"]), &JsonFormatter)
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&history).unwrap();
        assert_eq!(parsed[0]["status"], "succeeded");
        assert_eq!(parsed[0]["items_processed"], 25);
        assert_eq!(parsed[0]["batches_committed"], 3);
    }

    #[test]
    fn test_unknown_migration_is_an_error() {
        let (engine, _dir) = engine();
        let err = execute(&engine, &command(&["history", "missing"]), &TableFormatter).unwrap_err();
        assert_eq!(err.exit_code(), 1);
        assert!(err.record().is_none());
    }

    #[test]
    fn test_run_args_default_to_sequential() {
        let Command::Run { options, .. } = command(&["run"]) else {
            panic!("expected run");
        };
        let options: RunArgs = options;
        assert!(!options.into_config().parallel_execution);
    }
}
