//! Reverting applied migrations.
//!
//! The data part is reverted first, working through the lineage recorded by
//! the forward run. Each batch commits its reverted items together with the
//! removal of their lineage entries and the rollback checkpoint, so a rollback
//! that stops halfway resumes where it left off. The schema part and the
//! final status change commit last, in one transaction.

use std::time::Instant;

use super::config::ExecutionContext;
use super::error::{MigrationError, RollbackError};
use super::history::{generate_token, BeforeImage, HistoryStore, LineageEntry, LockGuard};
use super::progress::{ProgressHandle, ProgressPhase};
use super::registry::MigrationRegistry;
use super::state::{Checkpoint, CheckpointPhase, HistoryRecord, HistoryStatus};
use super::transform::{Mutation, SourceItem, TransformOutcome};
use super::unit::{DataOperations, DataRollback, MigrationUnit};
use crate::storage::{StorageEngine, Transaction};

/// Outcome of a completed rollback.
#[derive(Debug, Clone)]
pub struct RollbackResult {
    /// Migration id.
    pub migration_id: String,
    /// Attempt that was reverted.
    pub attempt: u32,
    /// Id stamped onto the reverted record.
    pub rollback_id: String,
    /// Data items reverted, including earlier interrupted rollback runs.
    pub items_reverted: u64,
    /// Schema statements reverted.
    pub statements_reverted: usize,
    /// Wall-clock duration of this call.
    pub duration_ms: u64,
    /// The record after the rollback.
    pub record: HistoryRecord,
    /// Non-fatal findings, such as a snapshot fingerprint mismatch.
    pub warnings: Vec<String>,
}

pub(crate) struct RollbackManager<'a> {
    pub storage: &'a StorageEngine,
    pub history: &'a HistoryStore,
    pub registry: &'a MigrationRegistry,
}

impl<'a> RollbackManager<'a> {
    /// Check that `unit` may be rolled back, returning its latest record.
    pub fn check(&self, unit: &MigrationUnit) -> Result<HistoryRecord, MigrationError> {
        let id = unit.id();
        if !unit.is_reversible() {
            return Err(RollbackError::NotReversible {
                migration_id: id.to_string(),
            }
            .into());
        }

        let record = match self.history.latest(id)? {
            Some(record) => record,
            None => {
                return Err(RollbackError::NothingToRollBack {
                    migration_id: id.to_string(),
                    status: "never run".to_string(),
                }
                .into())
            }
        };

        let revertible = record.rollback_in_progress
            || record.status.is_applied()
            || record.status == HistoryStatus::TimedOut
            || (record.status == HistoryStatus::Failed && record.work_committed);
        if !revertible {
            return Err(RollbackError::NothingToRollBack {
                migration_id: id.to_string(),
                status: record.status.to_string(),
            }
            .into());
        }

        let mut dependents = Vec::new();
        for dependent in self.registry.dependents_of(id) {
            if let Some(latest) = self.history.latest(dependent.id())? {
                if latest.status.is_applied() || latest.rollback_in_progress {
                    dependents.push(dependent.id().to_string());
                }
            }
        }
        if !dependents.is_empty() {
            return Err(RollbackError::DependentsApplied {
                migration_id: id.to_string(),
                dependents,
            }
            .into());
        }

        Ok(record)
    }

    /// Revert `record`. The caller holds the migration's lock.
    pub fn run(
        &self,
        unit: &MigrationUnit,
        mut record: HistoryRecord,
        ctx: &ExecutionContext,
        lock: &LockGuard,
        progress: &ProgressHandle,
    ) -> Result<RollbackResult, MigrationError> {
        let started = Instant::now();
        let id = unit.id();
        let mut warnings = Vec::new();

        if !record.rollback_in_progress {
            record.rollback_in_progress = true;
            self.history.save(&record)?;
        }
        progress.set_phase(ProgressPhase::RollingBack);
        tracing::info!(
            migration_id = id,
            attempt = record.attempt,
            status = %record.status,
            "rollback started"
        );

        let mut checkpoint = self
            .history
            .load_checkpoint(id, CheckpointPhase::Rollback)?
            .unwrap_or_else(|| Checkpoint::new(id, record.attempt, CheckpointPhase::Rollback));
        progress.resume_from(&checkpoint);

        if let Some(data) = unit.operations().data() {
            match &data.rollback {
                DataRollback::None => warnings.push(
                    "data part declares no rollback; data changes were left in place".to_string(),
                ),
                strategy => {
                    self.revert_data(id, data, strategy, &mut checkpoint, ctx, lock, progress, &record)?;
                    if let DataRollback::Snapshot { .. } = strategy {
                        warnings.extend(self.verify_snapshot(id)?);
                    }
                }
            }
        }

        let mut tx = self.storage.begin();
        let mut statements_reverted = 0;
        if let Some(schema) = unit.operations().schema() {
            if record.schema_committed {
                for (index, statement) in schema.rollback.iter().enumerate() {
                    if let Err(e) = tx.execute(statement) {
                        tx.rollback();
                        self.history.save(&record)?;
                        return Err(RollbackError::Partial {
                            migration_id: id.to_string(),
                            position: format!("statement {} ({})", index, statement),
                            message: e.to_string(),
                            items_reverted: checkpoint.items_processed,
                            statements_reverted: 0,
                        }
                        .into());
                    }
                    statements_reverted += 1;
                }
            }
        }

        let rollback_id = generate_token();
        record.rolled_back(rollback_id.as_str())?;
        record.schema_committed = false;
        record.rollback_in_progress = false;
        self.history.stage(&mut tx, &record)?;
        self.history
            .stage_clear_checkpoint(&mut tx, id, CheckpointPhase::Forward)?;
        self.history
            .stage_clear_checkpoint(&mut tx, id, CheckpointPhase::Rollback)?;
        self.history.stage_delete_snapshot_marker(&mut tx, id);
        tx.commit()?;
        progress.finish();

        for warning in &warnings {
            tracing::warn!(migration_id = id, "{}", warning);
        }
        let duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            migration_id = id,
            rollback_id = %rollback_id,
            items_reverted = checkpoint.items_processed,
            statements_reverted,
            duration_ms,
            "rollback completed"
        );

        Ok(RollbackResult {
            migration_id: id.to_string(),
            attempt: record.attempt,
            rollback_id,
            items_reverted: checkpoint.items_processed,
            statements_reverted,
            duration_ms,
            record,
            warnings,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn revert_data(
        &self,
        id: &str,
        data: &DataOperations,
        strategy: &DataRollback,
        checkpoint: &mut Checkpoint,
        ctx: &ExecutionContext,
        lock: &LockGuard,
        progress: &ProgressHandle,
        record: &HistoryRecord,
    ) -> Result<(), MigrationError> {
        let batch_size = ctx.config.effective_batch_size();
        let source = data.source.describe();

        loop {
            lock.renew()?;
            let entries = self.history.lineage_batch(id, batch_size)?;
            let Some(last) = entries.last() else {
                return Ok(());
            };
            let last_key = last.key.clone();

            let mut tx = self.storage.begin();
            for entry in &entries {
                if let Err(message) = self.revert_entry(&mut tx, strategy, entry) {
                    tx.rollback();
                    self.history.save(record)?;
                    tracing::error!(
                        migration_id = id,
                        collection = %entry.collection,
                        key = %entry.key,
                        error = %message,
                        "rollback stopped"
                    );
                    return Err(RollbackError::Partial {
                        migration_id: id.to_string(),
                        position: format!("{}/{}", entry.collection, entry.key),
                        message,
                        items_reverted: checkpoint.items_processed,
                        statements_reverted: 0,
                    }
                    .into());
                }
                self.history
                    .stage_delete_lineage(&mut tx, id, &entry.collection, &entry.key);
            }

            checkpoint.cursor = Some(last_key);
            checkpoint.batches_committed += 1;
            checkpoint.items_processed += entries.len() as u64;
            self.history.stage_checkpoint(&mut tx, checkpoint)?;
            tx.commit()?;

            progress.record_batch(entries.len() as u64, 0, 0);
            tracing::debug!(
                migration_id = id,
                source = %source,
                reverted = checkpoint.items_processed,
                "rollback batch committed"
            );
        }
    }

    /// Stage the revert of one touched item. Errors are per-item messages.
    fn revert_entry(
        &self,
        tx: &mut Transaction<'_>,
        strategy: &DataRollback,
        entry: &LineageEntry,
    ) -> Result<(), String> {
        let staged = match strategy {
            DataRollback::Snapshot { .. } => match &entry.before {
                BeforeImage::Present(value) => tx.put_record(&entry.collection, &entry.key, value),
                BeforeImage::Absent => tx.delete_record(&entry.collection, &entry.key),
                BeforeImage::NotCaptured => {
                    return Err("no before-image was captured for this item".to_string())
                }
            },
            DataRollback::InverseTransform(inverse) => {
                let current = self
                    .storage
                    .get_record(&entry.collection, &entry.key)
                    .map_err(|e| e.to_string())?
                    .unwrap_or(serde_json::Value::Null);
                match inverse.apply(&SourceItem::new(entry.key.clone(), current)) {
                    TransformOutcome::Apply(Mutation::Upsert {
                        collection,
                        key,
                        value,
                    }) => tx.put_record(&collection, &key, &value),
                    TransformOutcome::Apply(Mutation::Delete { collection, key }) => {
                        tx.delete_record(&collection, &key)
                    }
                    TransformOutcome::Skip => return Ok(()),
                    TransformOutcome::Fail(message) => return Err(message),
                }
            }
            DataRollback::None => return Ok(()),
        };
        staged.map(|_| ()).map_err(|e| e.to_string())
    }

    /// Compare restored collections against the fingerprints taken at start.
    fn verify_snapshot(&self, id: &str) -> Result<Vec<String>, MigrationError> {
        let Some(marker) = self.history.load_snapshot_marker(id)? else {
            return Ok(Vec::new());
        };
        let mut warnings = Vec::new();
        for (collection, expected) in marker.collections.iter().zip(&marker.fingerprints) {
            let actual = self.storage.collection_fingerprint(collection)?;
            if &actual != expected {
                warnings.push(format!(
                    "collection '{}' differs from its pre-migration snapshot; \
                     it was modified outside the migration",
                    collection
                ));
            }
        }
        Ok(warnings)
    }
}
