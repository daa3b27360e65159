//! Target store for migrations.
//!
//! A sled-backed store holding a schema catalog and JSON record collections.
//! Every write goes through a [`Transaction`], the unit of work the migration
//! engine commits or discards.

mod config;
mod engine;
pub mod key;
pub mod schema;
mod transaction;

pub use config::StorageConfig;
pub use engine::StorageEngine;
pub use schema::{CollectionDef, FieldDef, FieldKind, SchemaStatement};
pub use transaction::{Transaction, TransactionOp};
