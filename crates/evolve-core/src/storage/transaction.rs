//! Units of work over the target store.
//!
//! Operations are staged in memory and applied in a single sled transaction
//! spanning the record, schema and migration metadata trees, so a batch of
//! record mutations and the checkpoint that describes it are never observed
//! separately.

use std::collections::HashMap;

use super::key::{current_timestamp, record_key};
use super::schema::{CollectionDef, SchemaStatement};
use super::StorageEngine;
use crate::error::Error;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::Transactional;

/// A pending operation in a transaction.
#[derive(Debug, Clone)]
pub enum TransactionOp {
    /// Write a collection definition.
    PutCollection {
        /// Collection name.
        name: String,
        /// Serialized definition.
        def: Vec<u8>,
    },
    /// Remove a collection definition.
    RemoveCollection {
        /// Collection name.
        name: String,
    },
    /// Write a record.
    PutRecord {
        /// Encoded record key.
        key: Vec<u8>,
        /// JSON payload.
        value: Vec<u8>,
    },
    /// Delete a record.
    DeleteRecord {
        /// Encoded record key.
        key: Vec<u8>,
    },
    /// Write a migration metadata entry (history, checkpoint, lineage).
    PutMeta {
        /// Metadata key.
        key: Vec<u8>,
        /// Encoded value.
        value: Vec<u8>,
    },
    /// Delete a migration metadata entry.
    DeleteMeta {
        /// Metadata key.
        key: Vec<u8>,
    },
}

/// A unit of work against the target store.
///
/// Nothing is visible to other readers until [`Transaction::commit`]. Dropping
/// the transaction or calling [`Transaction::rollback`] discards every staged
/// operation.
#[derive(Debug)]
pub struct Transaction<'a> {
    engine: &'a StorageEngine,
    ops: Vec<TransactionOp>,
    /// Staged catalog view: collection name -> definition after this tx.
    schema_cache: HashMap<String, Option<CollectionDef>>,
    statements_executed: usize,
    started_at: u64,
}

impl<'a> Transaction<'a> {
    /// Create a new transaction.
    pub(crate) fn new(engine: &'a StorageEngine) -> Self {
        Self {
            engine,
            ops: Vec::new(),
            schema_cache: HashMap::new(),
            statements_executed: 0,
            started_at: current_timestamp(),
        }
    }

    /// Read a collection definition, including changes staged in this transaction.
    pub fn collection(&mut self, name: &str) -> Result<Option<CollectionDef>, Error> {
        if let Some(cached) = self.schema_cache.get(name) {
            return Ok(cached.clone());
        }
        let current = self.engine.collection(name)?;
        self.schema_cache.insert(name.to_string(), current.clone());
        Ok(current)
    }

    /// Execute a schema statement against the staged catalog.
    ///
    /// The statement is checked immediately; an error leaves the transaction
    /// unchanged so the caller can report the failing statement and discard.
    pub fn execute(&mut self, statement: &SchemaStatement) -> Result<(), Error> {
        let name = statement.collection().to_string();
        let current = self.collection(&name)?;
        let next = statement.apply_to(current)?;

        match &next {
            Some(def) => {
                self.ops.push(TransactionOp::PutCollection {
                    name: name.clone(),
                    def: def.to_bytes()?,
                });
            }
            None => {
                self.ops.push(TransactionOp::RemoveCollection { name: name.clone() });
                for key in self.engine.record_keys(&name) {
                    self.ops.push(TransactionOp::DeleteRecord { key: key? });
                }
            }
        }

        self.schema_cache.insert(name, next);
        self.statements_executed += 1;
        Ok(())
    }

    /// Queue a record write. The collection must exist in the staged catalog.
    pub fn put_record(
        &mut self,
        collection: &str,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<&mut Self, Error> {
        self.require_collection(collection)?;
        if key.is_empty() {
            return Err(Error::InvalidData("record key must not be empty".to_string()));
        }
        self.ops.push(TransactionOp::PutRecord {
            key: record_key(collection, key),
            value: serde_json::to_vec(value)?,
        });
        Ok(self)
    }

    /// Queue a record deletion.
    pub fn delete_record(&mut self, collection: &str, key: &str) -> Result<&mut Self, Error> {
        self.require_collection(collection)?;
        self.ops.push(TransactionOp::DeleteRecord {
            key: record_key(collection, key),
        });
        Ok(self)
    }

    /// Queue a metadata write.
    pub fn put_meta(&mut self, key: Vec<u8>, value: Vec<u8>) -> &mut Self {
        self.ops.push(TransactionOp::PutMeta { key, value });
        self
    }

    /// Queue a metadata deletion.
    pub fn delete_meta(&mut self, key: Vec<u8>) -> &mut Self {
        self.ops.push(TransactionOp::DeleteMeta { key });
        self
    }

    /// Get the pending operations.
    pub fn operations(&self) -> &[TransactionOp] {
        &self.ops
    }

    /// Get the number of pending operations.
    pub fn operation_count(&self) -> usize {
        self.ops.len()
    }

    /// Number of schema statements executed so far.
    pub fn statements_executed(&self) -> usize {
        self.statements_executed
    }

    /// Commit the transaction atomically.
    ///
    /// All operations succeed or none do.
    pub fn commit(self) -> Result<(), Error> {
        if self.ops.is_empty() {
            return Ok(());
        }

        let records = self.engine.records_tree();
        let schema = self.engine.schema_tree();
        let meta = self.engine.meta_tree();

        let result: Result<(), TransactionError<Error>> =
            (records, schema, meta).transaction(|(records_tx, schema_tx, meta_tx)| {
                for op in &self.ops {
                    match op {
                        TransactionOp::PutCollection { name, def } => {
                            schema_tx.insert(name.as_bytes(), def.as_slice())?;
                        }
                        TransactionOp::RemoveCollection { name } => {
                            schema_tx.remove(name.as_bytes())?;
                        }
                        TransactionOp::PutRecord { key, value } => {
                            records_tx.insert(key.as_slice(), value.as_slice())?;
                        }
                        TransactionOp::DeleteRecord { key } => {
                            records_tx.remove(key.as_slice())?;
                        }
                        TransactionOp::PutMeta { key, value } => {
                            meta_tx.insert(key.as_slice(), value.as_slice())?;
                        }
                        TransactionOp::DeleteMeta { key } => {
                            meta_tx.remove(key.as_slice())?;
                        }
                    }
                }
                Ok::<(), ConflictableTransactionError<Error>>(())
            });

        match result {
            Ok(()) => {
                tracing::trace!(
                    ops = self.ops.len(),
                    elapsed_us = current_timestamp().saturating_sub(self.started_at),
                    "transaction committed"
                );
                Ok(())
            }
            Err(TransactionError::Abort(e)) => Err(e),
            Err(TransactionError::Storage(e)) => Err(Error::Storage(e)),
        }
    }

    /// Discard every staged operation.
    pub fn rollback(self) {
        tracing::trace!(ops = self.ops.len(), "transaction discarded");
    }

    fn require_collection(&mut self, collection: &str) -> Result<(), Error> {
        match self.collection(collection)? {
            Some(_) => Ok(()),
            None => Err(Error::Schema(format!(
                "collection '{}' does not exist",
                collection
            ))),
        }
    }
}
