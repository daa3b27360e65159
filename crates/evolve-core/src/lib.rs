//! Evolve Core - migration engine and its target store.
//!
//! This crate provides schema, data and hybrid migrations with
//! dependency ordering, checkpointed batch execution and rollback.

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod error;
pub mod migration;
pub mod storage;

pub use error::Error;
pub use migration::{
    DataOperations, DataRollback, ExecutionConfig, HistoryRecord, HistoryStatus, MigrationBuilder,
    MigrationEngine, MigrationError, MigrationKind, MigrationRegistry, MigrationUnit,
    RollbackResult,
};
pub use storage::{SchemaStatement, StorageConfig, StorageEngine, Transaction};
