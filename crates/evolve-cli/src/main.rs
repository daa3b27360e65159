//! Evolve Command-Line Client
//!
//! Runs the built-in demo manifest against a local store: inspect status,
//! execute, resume, roll back and audit migrations.

mod commands;
mod demo;
mod formatter;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use evolve_core::migration::{ExecutionConfig, LockWait, MigrationKind};
use evolve_core::storage::StorageConfig;
use formatter::OutputFormat;
use tracing_subscriber::EnvFilter;

/// Evolve Command-Line Client
#[derive(Parser, Debug)]
#[command(name = "evolve")]
#[command(version, about = "Unified schema and data migrations")]
pub struct Args {
    /// Store directory
    #[arg(short = 'd', long, default_value = "./evolve_data")]
    pub data_dir: PathBuf,

    /// Output format
    #[arg(long, default_value = "table", value_enum)]
    pub format: OutputFormat,

    /// Page cache capacity in MB
    #[arg(long, default_value_t = 256)]
    pub cache_mb: u64,

    #[command(subcommand)]
    pub command: Command,
}

impl Args {
    /// Storage configuration for the store directory.
    pub fn storage_config(&self) -> StorageConfig {
        StorageConfig::new(&self.data_dir).with_cache_capacity(self.cache_mb * 1024 * 1024)
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show every registered migration and its latest attempt
    Status,
    /// List migrations that are not applied
    Pending,
    /// Execute one migration, or every pending one
    Run {
        /// Migration id; omit to run all
        id: Option<String>,
        /// Only run migrations of this kind (schema, data, hybrid)
        #[arg(long)]
        kind: Option<MigrationKind>,
        #[command(flatten)]
        options: RunArgs,
    },
    /// Revert an applied migration
    Rollback {
        /// Migration id
        id: String,
        /// Report what would be reverted
        #[arg(long)]
        dry_run: bool,
        /// Items reverted per batch
        #[arg(long, default_value_t = 1000)]
        batch_size: usize,
    },
    /// Show progress of a running or resumable migration
    Progress {
        /// Migration id
        id: String,
    },
    /// Show every attempt of a migration
    History {
        /// Migration id
        id: String,
    },
    /// Show tolerated item failures of an attempt
    Failures {
        /// Migration id
        id: String,
        /// Attempt number; defaults to the latest
        #[arg(long)]
        attempt: Option<u32>,
    },
    /// Run pre-validation only
    Validate {
        /// Migration id
        id: String,
    },
    /// Delete the history of a migration
    Purge {
        /// Migration id
        id: String,
        /// Why the history is being removed
        #[arg(long)]
        reason: String,
    },
    /// Show the purge audit log
    Purges,
    /// Insert demo users
    Seed {
        /// Number of users
        #[arg(long, default_value_t = 1000)]
        count: usize,
    },
}

/// Options for `run`.
#[derive(clap::Args, Debug, Clone)]
pub struct RunArgs {
    /// Simulate without committing anything
    #[arg(long)]
    pub dry_run: bool,

    /// Items per batch
    #[arg(long, default_value_t = 1000)]
    pub batch_size: usize,

    /// Run data batches on this many worker threads
    #[arg(long)]
    pub parallel: Option<usize>,

    /// Record failing items and keep going
    #[arg(long)]
    pub continue_on_error: bool,

    /// Re-execute migrations that already succeeded
    #[arg(long)]
    pub force: bool,

    /// Stop at the next batch boundary after this many seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Pause between batches in milliseconds
    #[arg(long, default_value_t = 0)]
    pub batch_delay_ms: u64,

    /// Do not roll back automatically when post-validation fails
    #[arg(long)]
    pub no_rollback: bool,

    /// Skip pre- and post-validation
    #[arg(long)]
    pub no_validate: bool,

    /// Wait up to this many seconds for a held lock
    #[arg(long)]
    pub lock_wait: Option<u64>,
}

impl RunArgs {
    /// Convert into an engine configuration.
    pub fn into_config(self) -> ExecutionConfig {
        let mut config = ExecutionConfig::default()
            .with_dry_run(self.dry_run)
            .with_batch_size(self.batch_size)
            .with_continue_on_error(self.continue_on_error)
            .with_force(self.force)
            .with_batch_delay_ms(self.batch_delay_ms)
            .with_rollback(!self.no_rollback)
            .with_validation(!self.no_validate, !self.no_validate);
        if let Some(workers) = self.parallel {
            config = config.with_parallel(workers);
        }
        if let Some(seconds) = self.timeout {
            config = config.with_timeout(seconds);
        }
        if let Some(seconds) = self.lock_wait {
            config = config.with_lock_wait(LockWait::Bounded {
                timeout: Duration::from_secs(seconds),
                poll_interval: Duration::from_millis(250),
            });
        }
        config
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("evolve=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let formatter = formatter::create_formatter(args.format);

    match commands::run(&args, &*formatter) {
        Ok(output) => {
            if !output.is_empty() {
                println!("{}", output);
            }
        }
        Err(e) => {
            if let Some(record) = e.record() {
                println!("{}", formatter.format_records(std::slice::from_ref(record)));
            }
            eprintln!("Error: {}", e);
            std::process::exit(e.exit_code());
        }
    }
}
