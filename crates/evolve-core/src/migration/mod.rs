//! Migration engine.
//!
//! Schema, data and hybrid migrations are registered as [`MigrationUnit`]s,
//! ordered by their declared dependencies and executed by the
//! [`MigrationEngine`]:
//!
//! - Pre-validation, then the schema part in one transaction, then the data
//!   part in checkpointed batches, then post-validation
//! - Every data batch commits together with its checkpoint, so a crashed run
//!   resumes without re-applying committed items
//! - Per-attempt history, advisory leases against concurrent runs and
//!   checksums against edited definitions
//! - Rollback through declared schema statements, inverse transforms or
//!   before-image snapshots
//!
//! # Example
//!
//! ```ignore
//! use evolve_core::migration::{ExecutionConfig, MigrationBuilder, MigrationEngine, MigrationRegistry};
//!
//! let unit = MigrationBuilder::new("add_summary", "Add summary field")
//!     .schema(vec![add_summary], vec![drop_summary])
//!     .build()?;
//! let registry = MigrationRegistry::from_manifest(vec![unit])?;
//! let engine = MigrationEngine::new(storage, registry);
//!
//! let records = engine.execute_all(None, &ExecutionConfig::default())?;
//! ```

mod backfill;
pub mod config;
pub mod error;
mod executor;
pub mod history;
pub mod progress;
pub mod registry;
pub mod resolver;
mod rollback;
pub mod state;
pub mod transform;
pub mod unit;
pub mod validation;

pub use config::{ExecutionConfig, ExecutionContext, LockWait};
pub use error::{
    ConflictError, DependencyError, ExecutionError, MigrationError, RollbackError,
};
pub use executor::{MigrationEngine, StatusEntry};
pub use history::{BeforeImage, HistoryStore, LineageEntry, LockGuard, PurgeEntry, SnapshotMarker};
pub use progress::{ProgressHandle, ProgressPhase, ProgressSnapshot, ProgressTracker};
pub use registry::MigrationRegistry;
pub use resolver::DependencyResolver;
pub use rollback::RollbackResult;
pub use state::{
    Checkpoint, CheckpointPhase, FailureDetail, HaltReason, HistoryRecord, HistoryStatus,
    ItemFailure, SubRange,
};
pub use transform::{CollectionSource, ItemSource, Mutation, SourceItem, Transform, TransformOutcome};
pub use unit::{
    DataOperations, DataRollback, MigrationBuilder, MigrationKind, MigrationMetadata,
    MigrationOperations, MigrationUnit, MigrationVersion, SchemaOperations,
};
pub use validation::{
    Severity, ValidationContext, ValidationIssue, ValidationPhase, ValidationStage, Validator,
};
