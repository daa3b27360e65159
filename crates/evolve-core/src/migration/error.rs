//! Migration-specific error types.

use super::state::{HistoryRecord, HistoryStatus};
use super::validation::{ValidationIssue, ValidationPhase};
use thiserror::Error;

/// Dependency graph errors. Always raised before any side effect.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DependencyError {
    /// The declared dependencies contain a cycle.
    #[error("dependency cycle detected: {}", .path.join(" -> "))]
    Cycle {
        /// Full cycle path; the first id is repeated at the end.
        path: Vec<String>,
    },

    /// A declared dependency is not registered.
    #[error("migration '{migration}' depends on unknown migration '{dependency}'")]
    Missing {
        /// The migration declaring the dependency.
        migration: String,
        /// The unknown dependency id.
        dependency: String,
    },

    /// Two units share an id.
    #[error("duplicate migration id '{id}'")]
    Duplicate {
        /// The duplicated id.
        id: String,
    },

    /// A dependency is registered but has not been applied.
    #[error("migration '{migration}' requires '{dependency}' to be applied first")]
    Unapplied {
        /// The migration that cannot run yet.
        migration: String,
        /// The dependency that is still pending.
        dependency: String,
    },
}

/// A statement or transform failure, carrying its position.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    /// A schema statement failed; the enclosing transaction was discarded.
    #[error("statement {index} ({statement}) failed: {message}")]
    Statement {
        /// Zero-based statement index.
        index: usize,
        /// Rendered statement.
        statement: String,
        /// Error message.
        message: String,
    },

    /// A data item failed to transform or apply.
    #[error("item '{key}' failed: {message}")]
    Item {
        /// Item key.
        key: String,
        /// Error message.
        message: String,
    },

    /// The item source could not be read.
    #[error("item source failed: {message}")]
    Source {
        /// Error message.
        message: String,
    },

    /// A worker thread panicked; its batch was not committed.
    #[error("worker panicked while processing the batch after {after:?}")]
    WorkerPanicked {
        /// Cursor the batch started after.
        after: Option<String>,
    },
}

/// Concurrent-run and definition conflicts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConflictError {
    /// Another run holds the advisory lock.
    #[error("migration '{migration_id}' is locked by another run (lease expires in {expires_in_ms} ms)")]
    Locked {
        /// Locked migration.
        migration_id: String,
        /// Remaining lease time.
        expires_in_ms: u64,
    },

    /// The lease was taken over while this run still held it.
    #[error("lost the lock on migration '{migration_id}'")]
    LockLost {
        /// Affected migration.
        migration_id: String,
    },

    /// The registered definition differs from the applied one.
    #[error("checksum mismatch for '{migration_id}': recorded {recorded}, registered {registered}")]
    ChecksumMismatch {
        /// Affected migration.
        migration_id: String,
        /// Checksum stored in history.
        recorded: String,
        /// Checksum of the registered unit.
        registered: String,
    },

    /// A rollback was started and has not completed.
    #[error("migration '{migration_id}' has a rollback in progress")]
    RollbackInProgress {
        /// Affected migration.
        migration_id: String,
    },

    /// History cannot be purged in the current state.
    #[error("cannot purge history of '{migration_id}': {reason}")]
    PurgeBlocked {
        /// Affected migration.
        migration_id: String,
        /// Why the purge was refused.
        reason: String,
    },
}

/// Rollback failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RollbackError {
    /// The unit does not declare rollback operations.
    #[error("migration '{migration_id}' is not reversible")]
    NotReversible {
        /// Affected migration.
        migration_id: String,
    },

    /// No applied work exists for the migration.
    #[error("migration '{migration_id}' has nothing to roll back (status: {status})")]
    NothingToRollBack {
        /// Affected migration.
        migration_id: String,
        /// Latest status, or "never run".
        status: String,
    },

    /// Applied migrations still depend on this one.
    #[error("cannot roll back '{migration_id}' while dependents are applied: {}", .dependents.join(", "))]
    DependentsApplied {
        /// Affected migration.
        migration_id: String,
        /// Applied dependents.
        dependents: Vec<String>,
    },

    /// The rollback stopped partway; calling rollback again resumes it.
    #[error(
        "rollback of '{migration_id}' stopped at {position}: {message} \
         ({items_reverted} items and {statements_reverted} statements reverted)"
    )]
    Partial {
        /// Affected migration.
        migration_id: String,
        /// Item key or statement index where it stopped.
        position: String,
        /// Error message.
        message: String,
        /// Items reverted so far, across resumed attempts.
        items_reverted: u64,
        /// Schema statements reverted.
        statements_reverted: usize,
    },
}

/// Migration engine errors.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// Dependency graph error.
    #[error(transparent)]
    Dependency(#[from] DependencyError),

    /// Blocking validation issues.
    #[error("{phase} validation failed for '{migration_id}': {}", ValidationIssue::summarize(.issues))]
    Validation {
        /// Affected migration.
        migration_id: String,
        /// Phase that produced the issues.
        phase: ValidationPhase,
        /// All issues reported in that phase.
        issues: Vec<ValidationIssue>,
        /// Terminal record, when the failure happened after work started.
        record: Option<Box<HistoryRecord>>,
    },

    /// Statement or transform failure. The record is already persisted as FAILED.
    #[error("migration '{}' failed: {source}", .record.migration_id)]
    Execution {
        /// Terminal record.
        record: Box<HistoryRecord>,
        /// Failure detail.
        #[source]
        source: ExecutionError,
    },

    /// Soft deadline or cancellation reached; the checkpoint is resumable.
    #[error(
        "migration '{}' halted after {} items; resumable from checkpoint",
        .record.migration_id,
        .record.items_processed
    )]
    Timeout {
        /// Terminal record with status TIMED_OUT.
        record: Box<HistoryRecord>,
    },

    /// Conflicting run or changed definition.
    #[error(transparent)]
    Conflict(#[from] ConflictError),

    /// Rollback failure.
    #[error(transparent)]
    Rollback(#[from] RollbackError),

    /// Migration not registered.
    #[error("migration not found: {migration_id}")]
    NotFound {
        /// Requested id.
        migration_id: String,
    },

    /// Registration rejected the unit.
    #[error("invalid migration definition '{migration_id}': {reason}")]
    InvalidDefinition {
        /// Affected migration.
        migration_id: String,
        /// What is wrong.
        reason: String,
    },

    /// A status transition violated the state machine.
    #[error("invalid status transition for '{migration_id}': {from} -> {to}")]
    InvalidTransition {
        /// Affected migration.
        migration_id: String,
        /// Current status.
        from: HistoryStatus,
        /// Requested status.
        to: HistoryStatus,
    },

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] crate::error::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),
}

impl MigrationError {
    /// The terminal history record attached to the error, if any.
    pub fn record(&self) -> Option<&HistoryRecord> {
        match self {
            MigrationError::Execution { record, .. } | MigrationError::Timeout { record } => {
                Some(record)
            }
            MigrationError::Validation { record, .. } => record.as_deref(),
            _ => None,
        }
    }

    /// Returns `true` if the error was raised before any side effect.
    pub fn is_side_effect_free(&self) -> bool {
        match self {
            MigrationError::Dependency(_)
            | MigrationError::Conflict(_)
            | MigrationError::NotFound { .. }
            | MigrationError::InvalidDefinition { .. } => true,
            MigrationError::Validation { phase, .. } => *phase == ValidationPhase::Pre,
            _ => false,
        }
    }
}
