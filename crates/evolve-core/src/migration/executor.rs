//! Migration engine: orchestrates validation, schema and data phases,
//! history bookkeeping, locking and rollback.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use super::backfill::{BackfillExecutor, DataRunEnd, LineageCapture};
use super::config::{ExecutionConfig, ExecutionContext};
use super::error::{ConflictError, DependencyError, ExecutionError, MigrationError};
use super::history::{HistoryStore, LockGuard};
use super::progress::{ProgressHandle, ProgressPhase, ProgressSnapshot, ProgressTracker};
use super::registry::MigrationRegistry;
use super::rollback::{RollbackManager, RollbackResult};
use super::state::{
    Checkpoint, CheckpointPhase, FailureDetail, HistoryRecord, HistoryStatus, ItemFailure,
};
use super::unit::{DataOperations, DataRollback, MigrationKind, MigrationUnit};
use super::validation::{ValidationContext, ValidationIssue, ValidationPhase, ValidationStage};
use crate::storage::{SchemaStatement, StorageEngine};

/// Status line of one registered migration.
#[derive(Debug, Clone)]
pub struct StatusEntry<'a> {
    /// The registered unit.
    pub unit: &'a MigrationUnit,
    /// Latest attempt, if any.
    pub latest: Option<HistoryRecord>,
    /// Resumable forward checkpoint, if any.
    pub checkpoint: Option<Checkpoint>,
    /// The latest attempt ran a different definition than the registered one.
    pub checksum_drift: bool,
}

/// What earlier units of one dry-run call left behind.
#[derive(Default)]
struct Simulation {
    applied: HashSet<String>,
    statements: Vec<SchemaStatement>,
}

fn checksum_mismatch(unit: &MigrationUnit, record: &HistoryRecord) -> MigrationError {
    ConflictError::ChecksumMismatch {
        migration_id: unit.id().to_string(),
        recorded: record.checksum.clone(),
        registered: unit.checksum().to_string(),
    }
    .into()
}

/// Executes registered migrations against a store.
pub struct MigrationEngine {
    storage: Arc<StorageEngine>,
    registry: MigrationRegistry,
    history: HistoryStore,
    progress: ProgressTracker,
    cancels: DashMap<String, Arc<AtomicBool>>,
}

impl MigrationEngine {
    /// Create an engine for `registry` over `storage`.
    pub fn new(storage: Arc<StorageEngine>, registry: MigrationRegistry) -> Self {
        let history = HistoryStore::new(storage.clone());
        if storage.was_recovered() {
            tracing::info!("store was recovered; interrupted attempts will resume on the next run");
        }
        Self {
            storage,
            registry,
            history,
            progress: ProgressTracker::new(),
            cancels: DashMap::new(),
        }
    }

    /// The target store.
    pub fn storage(&self) -> &Arc<StorageEngine> {
        &self.storage
    }

    /// The registered migrations.
    pub fn registry(&self) -> &MigrationRegistry {
        &self.registry
    }

    /// Durable history.
    pub fn history_store(&self) -> &HistoryStore {
        &self.history
    }

    /// Migrations whose latest attempt is not applied, in dependency order.
    pub fn list_pending(&self) -> Result<Vec<&MigrationUnit>, MigrationError> {
        let mut pending = Vec::new();
        for unit in self.registry.ordered() {
            if !self.is_applied(unit.id())? {
                pending.push(unit);
            }
        }
        Ok(pending)
    }

    /// Status of every registered migration, in dependency order.
    pub fn status(&self) -> Result<Vec<StatusEntry<'_>>, MigrationError> {
        let mut entries = Vec::with_capacity(self.registry.len());
        for unit in self.registry.ordered() {
            let latest = self.history.latest(unit.id())?;
            let checksum_drift = latest
                .as_ref()
                .is_some_and(|r| r.status != HistoryStatus::RolledBack && r.checksum != unit.checksum());
            entries.push(StatusEntry {
                unit,
                latest,
                checkpoint: self.history.load_checkpoint(unit.id(), CheckpointPhase::Forward)?,
                checksum_drift,
            });
        }
        Ok(entries)
    }

    /// Execute one migration, running its pending dependencies first.
    ///
    /// An applied migration is a no-op returning its record unless
    /// `config.force` is set; force never re-runs applied dependencies. A
    /// failed or timed-out migration with a checkpoint resumes from it.
    pub fn execute(
        &self,
        migration_id: &str,
        config: &ExecutionConfig,
    ) -> Result<HistoryRecord, MigrationError> {
        let chain = self.registry.resolve_target(migration_id)?;
        let mut simulation = Simulation::default();
        let mut target = None;
        for unit in chain {
            let is_target = unit.id() == migration_id;
            if !is_target {
                if self.is_applied(unit.id())? {
                    continue;
                }
                tracing::info!(migration_id, dependency = unit.id(), "running pending dependency first");
            }
            let record = if config.dry_run {
                self.simulate(unit, config, &mut simulation)?
            } else {
                self.run_unit(unit, config)?
            };
            if is_target {
                target = Some(record);
            }
        }
        target.ok_or_else(|| MigrationError::NotFound {
            migration_id: migration_id.to_string(),
        })
    }

    /// Execute every registered migration of `kind` (all when `None`) in
    /// dependency order, stopping at the first failure.
    ///
    /// A selected migration whose dependency is neither applied nor selected
    /// fails the whole call before anything runs.
    pub fn execute_all(
        &self,
        kind: Option<MigrationKind>,
        config: &ExecutionConfig,
    ) -> Result<Vec<HistoryRecord>, MigrationError> {
        let selected: Vec<&MigrationUnit> = self
            .registry
            .ordered()
            .iter()
            .filter(|u| kind.map_or(true, |k| u.kind() == k))
            .collect();
        let selected_ids: HashSet<&str> = selected.iter().map(|u| u.id()).collect();

        for unit in &selected {
            for dependency in unit.dependencies() {
                if !selected_ids.contains(dependency.as_str()) && !self.is_applied(dependency)? {
                    return Err(DependencyError::Unapplied {
                        migration: unit.id().to_string(),
                        dependency: dependency.clone(),
                    }
                    .into());
                }
            }
        }

        tracing::info!(
            count = selected.len(),
            kind = kind.map(|k| k.to_string()).unwrap_or_else(|| "all".to_string()),
            dry_run = config.dry_run,
            "executing migrations"
        );

        let mut records = Vec::with_capacity(selected.len());
        let mut simulation = Simulation::default();
        for unit in selected {
            let record = if config.dry_run {
                self.simulate(unit, config, &mut simulation)?
            } else {
                self.run_unit(unit, config)?
            };
            records.push(record);
        }
        Ok(records)
    }

    /// Run pre-validation only.
    pub fn validate(&self, migration_id: &str) -> Result<Vec<ValidationIssue>, MigrationError> {
        let unit = self.registry.require(migration_id)?;
        let latest = self.history.latest(migration_id)?;
        let schema_committed = self
            .history
            .load_checkpoint(migration_id, CheckpointPhase::Forward)?
            .is_some_and(|cp| cp.schema_committed)
            || latest.as_ref().is_some_and(|r| r.schema_committed);
        Ok(ValidationStage::check(&ValidationContext {
            storage: &self.storage,
            unit,
            phase: ValidationPhase::Pre,
            attempt: latest.as_ref().map(|r| r.attempt + 1).unwrap_or(1),
            recorded_checksum: latest.as_ref().map(|r| r.checksum.as_str()),
            schema_committed,
            preamble: &[],
        }))
    }

    /// Roll back a migration with default options.
    pub fn rollback(&self, migration_id: &str) -> Result<RollbackResult, MigrationError> {
        self.rollback_with(migration_id, &ExecutionConfig::default())
    }

    /// Roll back a migration.
    ///
    /// The unit must be reversible, its latest attempt must have applied or
    /// committed work, and no applied migration may depend on it. A
    /// rollback that stopped partway resumes when called again.
    pub fn rollback_with(
        &self,
        migration_id: &str,
        config: &ExecutionConfig,
    ) -> Result<RollbackResult, MigrationError> {
        let unit = self.registry.require(migration_id)?;
        let manager = self.rollback_manager();

        if config.dry_run {
            let record = manager.check(unit)?;
            return Ok(RollbackResult {
                migration_id: migration_id.to_string(),
                attempt: record.attempt,
                rollback_id: "dry-run".to_string(),
                items_reverted: self.history.lineage_len(migration_id)?,
                statements_reverted: unit
                    .operations()
                    .schema()
                    .filter(|_| record.schema_committed)
                    .map_or(0, |s| s.rollback.len()),
                duration_ms: 0,
                record,
                warnings: vec!["dry run: nothing was reverted".to_string()],
            });
        }

        let lock = self
            .history
            .acquire_lock(migration_id, &config.lock_wait, config.lock_lease)?;
        if let Some(record) = self.history.latest(migration_id)? {
            if record.status == HistoryStatus::Running {
                self.recover_interrupted(record)?;
            }
        }
        let record = manager.check(unit)?;

        let ctx = ExecutionContext::new(
            migration_id,
            record.attempt,
            config.clone(),
            self.register_cancel(migration_id),
        );
        let progress = self.progress.begin(migration_id, record.attempt, None);
        let result = manager.run(unit, record, &ctx, &lock, &progress);
        progress.finish();
        self.cancels.remove(migration_id);
        result
    }

    /// Progress of a migration: live when it runs in this process, otherwise
    /// reconstructed from its checkpoint or latest record.
    pub fn progress(&self, migration_id: &str) -> Result<ProgressSnapshot, MigrationError> {
        if let Some(snapshot) = self.progress.snapshot(migration_id) {
            if snapshot.live {
                return Ok(snapshot);
            }
        }
        let latest = self.history.latest(migration_id)?;
        let applied = latest.as_ref().is_some_and(|r| r.status.is_applied());
        if !applied {
            if let Some(cp) = self
                .history
                .load_checkpoint(migration_id, CheckpointPhase::Forward)?
            {
                return Ok(ProgressSnapshot::from_checkpoint(&cp));
            }
        }
        Ok(match latest {
            Some(record) => ProgressSnapshot::from_record(&record),
            None => ProgressSnapshot::idle(migration_id),
        })
    }

    /// Every attempt of a migration, oldest first.
    pub fn history(&self, migration_id: &str) -> Result<Vec<HistoryRecord>, MigrationError> {
        self.history.attempts(migration_id)
    }

    /// Latest attempt of a migration.
    pub fn latest_record(&self, migration_id: &str) -> Result<Option<HistoryRecord>, MigrationError> {
        self.history.latest(migration_id)
    }

    /// Resumable forward checkpoint of a migration.
    pub fn checkpoint(&self, migration_id: &str) -> Result<Option<Checkpoint>, MigrationError> {
        self.history
            .load_checkpoint(migration_id, CheckpointPhase::Forward)
    }

    /// Every tolerated item failure of one attempt.
    pub fn failures(
        &self,
        migration_id: &str,
        attempt: u32,
    ) -> Result<Vec<ItemFailure>, MigrationError> {
        self.history.failures(migration_id, attempt)
    }

    /// Ask a migration running in this process to stop at its next batch
    /// boundary. Returns `false` if it is not running here.
    pub fn cancel(&self, migration_id: &str) -> bool {
        match self.cancels.get(migration_id) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                tracing::info!(migration_id, "cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Delete the history of a migration. Audited; refused while locked or
    /// resumable.
    pub fn purge_history(&self, migration_id: &str, reason: &str) -> Result<u32, MigrationError> {
        self.history.purge(migration_id, reason)
    }

    fn is_applied(&self, migration_id: &str) -> Result<bool, MigrationError> {
        Ok(self
            .history
            .latest(migration_id)?
            .is_some_and(|r| r.status.is_applied()))
    }

    fn rollback_manager(&self) -> RollbackManager<'_> {
        RollbackManager {
            storage: &self.storage,
            history: &self.history,
            registry: &self.registry,
        }
    }

    fn register_cancel(&self, migration_id: &str) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(false));
        self.cancels.insert(migration_id.to_string(), flag.clone());
        flag
    }

    /// A RUNNING record nobody holds the lock for belongs to a dead process.
    fn recover_interrupted(&self, mut record: HistoryRecord) -> Result<HistoryRecord, MigrationError> {
        tracing::warn!(
            migration_id = %record.migration_id,
            attempt = record.attempt,
            "previous attempt was interrupted"
        );
        if let Some(cp) = self
            .history
            .load_checkpoint(&record.migration_id, CheckpointPhase::Forward)?
        {
            record.apply_counts(&cp);
            record.schema_committed |= cp.schema_committed;
            record.work_committed |= cp.schema_committed || cp.batches_committed > 0;
        }
        record.work_committed |= record.schema_committed;
        record.fail("attempt interrupted before completion", FailureDetail::Interrupted)?;
        self.history.save(&record)?;
        Ok(record)
    }

    fn capture_for<'u>(&self, unit: &MigrationUnit, data: &'u DataOperations) -> LineageCapture<'u> {
        if !unit.is_reversible() {
            return LineageCapture::Off;
        }
        match &data.rollback {
            DataRollback::None => LineageCapture::Off,
            DataRollback::InverseTransform(_) => LineageCapture::Keys,
            DataRollback::Snapshot { collections } => LineageCapture::BeforeImages(collections),
        }
    }

    /// Lock, decide between no-op, resume and fresh attempt, then run.
    fn run_unit(
        &self,
        unit: &MigrationUnit,
        config: &ExecutionConfig,
    ) -> Result<HistoryRecord, MigrationError> {
        let id = unit.id();
        // An applied migration is a no-op even while another holder has the lease
        if let Some(record) = self.history.latest(id)? {
            if record.status.is_applied() && !record.rollback_in_progress && !config.force {
                if record.checksum != unit.checksum() {
                    return Err(checksum_mismatch(unit, &record));
                }
                tracing::info!(migration_id = id, status = %record.status, "already applied; skipping");
                return Ok(record);
            }
        }

        let lock = self
            .history
            .acquire_lock(id, &config.lock_wait, config.lock_lease)?;

        let latest = match self.history.latest(id)? {
            Some(record) if record.status == HistoryStatus::Running => {
                Some(self.recover_interrupted(record)?)
            }
            other => other,
        };

        let mut resumed = None;
        if let Some(record) = &latest {
            if record.rollback_in_progress {
                return Err(ConflictError::RollbackInProgress {
                    migration_id: id.to_string(),
                }
                .into());
            }
            if record.status.is_applied() {
                if record.checksum != unit.checksum() {
                    return Err(checksum_mismatch(unit, record));
                }
                if !config.force {
                    tracing::info!(migration_id = id, status = %record.status, "already applied; skipping");
                    return Ok(record.clone());
                }
            } else if matches!(record.status, HistoryStatus::Failed | HistoryStatus::TimedOut) {
                resumed = self.history.load_checkpoint(id, CheckpointPhase::Forward)?;
                // Statements already in the catalog are never re-run
                if resumed.is_none() && record.schema_committed {
                    let mut checkpoint =
                        Checkpoint::new(id, record.attempt, CheckpointPhase::Forward);
                    checkpoint.schema_committed = true;
                    resumed = Some(checkpoint);
                }
                if resumed.is_some() && record.checksum != unit.checksum() {
                    return Err(checksum_mismatch(unit, record));
                }
            }
        }

        let attempt = latest.as_ref().map_or(1, |r| r.attempt + 1);
        let ctx = ExecutionContext::new(id, attempt, config.clone(), self.register_cancel(id));
        let progress = self.progress.begin(id, attempt, resumed.as_ref());
        let result = self.run_attempt(unit, &ctx, &lock, &progress, resumed);
        progress.finish();
        self.cancels.remove(id);
        result
    }

    fn run_attempt(
        &self,
        unit: &MigrationUnit,
        ctx: &ExecutionContext,
        lock: &LockGuard,
        progress: &ProgressHandle,
        resumed: Option<Checkpoint>,
    ) -> Result<HistoryRecord, MigrationError> {
        let id = unit.id();
        let config = &ctx.config;
        let is_resume = resumed.is_some();
        let mut record = HistoryRecord::new(id, ctx.attempt, unit.kind(), unit.checksum());
        let mut checkpoint = resumed
            .unwrap_or_else(|| Checkpoint::new(id, ctx.attempt, CheckpointPhase::Forward));
        if is_resume {
            record.apply_counts(&checkpoint);
            record.schema_committed = checkpoint.schema_committed;
            record.work_committed = checkpoint.schema_committed || checkpoint.batches_committed > 0;
        }

        if config.validate_before {
            progress.set_phase(ProgressPhase::Validating);
            let issues = ValidationStage::check(&ValidationContext {
                storage: &self.storage,
                unit,
                phase: ValidationPhase::Pre,
                attempt: ctx.attempt,
                recorded_checksum: None,
                schema_committed: checkpoint.schema_committed,
                preamble: &[],
            });
            if ValidationStage::is_blocking(&issues) {
                tracing::warn!(
                    migration_id = id,
                    issues = %ValidationIssue::summarize(&issues),
                    "pre-validation failed"
                );
                return Err(MigrationError::Validation {
                    migration_id: id.to_string(),
                    phase: ValidationPhase::Pre,
                    issues,
                    record: None,
                });
            }
            record.issues = issues;
        }

        record.start()?;
        self.history.save(&record)?;
        tracing::info!(
            migration_id = id,
            attempt = ctx.attempt,
            kind = %unit.kind(),
            resumed = is_resume,
            "migration started"
        );

        // Schema part: all statements commit together with the record
        if let Some(schema) = unit.operations().schema() {
            if checkpoint.schema_committed {
                tracing::debug!(migration_id = id, "schema part already committed");
            } else {
                progress.set_phase(ProgressPhase::Schema);
                let mut tx = self.storage.begin();
                for (index, statement) in schema.forward.iter().enumerate() {
                    if let Err(e) = tx.execute(statement) {
                        tx.rollback();
                        return self.fail(
                            record,
                            ExecutionError::Statement {
                                index,
                                statement: statement.to_string(),
                                message: e.to_string(),
                            },
                        );
                    }
                }
                record.schema_committed = true;
                record.work_committed = true;
                record.statements_applied = schema.forward.len() as u32;
                checkpoint.schema_committed = true;
                self.history.stage_checkpoint(&mut tx, &checkpoint)?;
                self.history.stage(&mut tx, &record)?;
                tx.commit()?;
                tracing::info!(
                    migration_id = id,
                    statements = schema.forward.len(),
                    "schema applied"
                );
            }
            record.statements_applied = schema.forward.len() as u32;
        }

        if let Some(data) = unit.operations().data() {
            if let DataRollback::Snapshot { collections } = &data.rollback {
                if unit.is_reversible() && self.history.load_snapshot_marker(id)?.is_none() {
                    self.history
                        .save_snapshot_marker(id, ctx.attempt, collections)?;
                }
            }

            let executor = BackfillExecutor {
                storage: &self.storage,
                history: &self.history,
                ctx,
                data,
                lock: Some(lock),
                progress,
                capture: self.capture_for(unit, data),
                preamble: &[],
            };
            let outcome = match executor.run(checkpoint, &mut record) {
                Ok(outcome) => outcome,
                Err(e) => return Err(self.abandon(record, e)),
            };

            record.apply_counts(&outcome.checkpoint);
            record.item_failures = outcome.item_failures;
            record.work_committed |= outcome.checkpoint.batches_committed > 0;
            match outcome.end {
                DataRunEnd::Completed => {}
                DataRunEnd::Halted(reason) => {
                    record.time_out(reason)?;
                    self.history.save(&record)?;
                    return Err(MigrationError::Timeout {
                        record: Box::new(record),
                    });
                }
                DataRunEnd::Failed(err) => return self.fail(record, err),
            }
        }

        if config.validate_after {
            progress.set_phase(ProgressPhase::Verifying);
            let issues = ValidationStage::check(&ValidationContext {
                storage: &self.storage,
                unit,
                phase: ValidationPhase::Post,
                attempt: ctx.attempt,
                recorded_checksum: Some(record.checksum.as_str()),
                schema_committed: record.schema_committed,
                preamble: &[],
            });
            if ValidationStage::is_blocking(&issues) {
                return self.fail_post_validation(unit, record, issues, ctx, lock, progress);
            }
            record.issues.extend(issues);
        }

        record.succeed()?;
        let mut tx = self.storage.begin();
        self.history.stage(&mut tx, &record)?;
        self.history
            .stage_clear_checkpoint(&mut tx, id, CheckpointPhase::Forward)?;
        tx.commit()?;
        self.storage.flush()?;

        tracing::info!(
            migration_id = id,
            attempt = record.attempt,
            status = %record.status,
            processed = record.items_processed,
            skipped = record.items_skipped,
            failed = record.items_failed,
            statements = record.statements_applied,
            duration_ms = record.duration_ms().unwrap_or(0),
            "migration finished"
        );
        Ok(record)
    }

    /// Persist `record` as failed and build the error.
    fn fail(
        &self,
        mut record: HistoryRecord,
        err: ExecutionError,
    ) -> Result<HistoryRecord, MigrationError> {
        let detail = match &err {
            ExecutionError::Statement {
                index,
                statement,
                message,
            } => FailureDetail::Statement {
                index: *index as u32,
                statement: statement.clone(),
                message: message.clone(),
            },
            ExecutionError::Item { key, message } => FailureDetail::Item {
                key: key.clone(),
                message: message.clone(),
            },
            ExecutionError::Source { message } => FailureDetail::Source {
                message: message.clone(),
            },
            ExecutionError::WorkerPanicked { .. } => FailureDetail::Internal {
                message: err.to_string(),
            },
        };
        record.fail(err.to_string(), detail)?;
        self.history.save(&record)?;
        tracing::error!(
            migration_id = %record.migration_id,
            attempt = record.attempt,
            error = %err,
            "migration failed"
        );
        Err(MigrationError::Execution {
            record: Box::new(record),
            source: err,
        })
    }

    /// Best-effort bookkeeping for an infrastructure error mid-run.
    fn abandon(&self, mut record: HistoryRecord, err: MigrationError) -> MigrationError {
        // Someone else owns the migration now; their run decides its state
        if matches!(err, MigrationError::Conflict(ConflictError::LockLost { .. })) {
            return err;
        }
        if let Ok(Some(cp)) = self
            .history
            .load_checkpoint(&record.migration_id, CheckpointPhase::Forward)
        {
            record.apply_counts(&cp);
            record.work_committed |= cp.batches_committed > 0;
        }
        let saved = record
            .fail(
                err.to_string(),
                FailureDetail::Internal {
                    message: err.to_string(),
                },
            )
            .and_then(|_| self.history.save(&record));
        if let Err(e) = saved {
            tracing::error!(
                migration_id = %record.migration_id,
                error = %e,
                "failed to record migration failure"
            );
        }
        err
    }

    /// Post-validation failed: mark failed and roll back when allowed.
    fn fail_post_validation(
        &self,
        unit: &MigrationUnit,
        mut record: HistoryRecord,
        issues: Vec<ValidationIssue>,
        ctx: &ExecutionContext,
        lock: &LockGuard,
        progress: &ProgressHandle,
    ) -> Result<HistoryRecord, MigrationError> {
        let id = unit.id();
        let summary = format!("post-validation failed: {}", ValidationIssue::summarize(&issues));
        record.issues = issues.clone();
        record.fail(
            summary.as_str(),
            FailureDetail::Validation {
                issues: issues.clone(),
            },
        )?;
        // The forward checkpoint no longer describes resumable work
        let mut tx = self.storage.begin();
        self.history.stage(&mut tx, &record)?;
        self.history
            .stage_clear_checkpoint(&mut tx, id, CheckpointPhase::Forward)?;
        tx.commit()?;
        tracing::error!(migration_id = id, error = %summary, "migration failed");

        if ctx.config.enable_rollback && unit.is_reversible() && record.work_committed {
            match self.rollback_manager().run(unit, record.clone(), ctx, lock, progress) {
                Ok(result) => {
                    tracing::warn!(
                        migration_id = id,
                        rollback_id = %result.rollback_id,
                        "rolled back after failed post-validation"
                    );
                    record = result.record;
                }
                Err(e) => {
                    tracing::error!(migration_id = id, error = %e, "automatic rollback failed");
                    record = self.history.latest(id)?.unwrap_or(record);
                    record.error_summary = Some(format!("{}; automatic rollback failed: {}", summary, e));
                    self.history.save(&record)?;
                }
            }
        }

        Err(MigrationError::Validation {
            migration_id: id.to_string(),
            phase: ValidationPhase::Post,
            issues,
            record: Some(Box::new(record)),
        })
    }

    /// Dry run: every check and transform runs, nothing is committed and no
    /// history is written.
    fn simulate(
        &self,
        unit: &MigrationUnit,
        config: &ExecutionConfig,
        simulation: &mut Simulation,
    ) -> Result<HistoryRecord, MigrationError> {
        let id = unit.id();
        let latest = self.history.latest(id)?;
        let attempt = latest.as_ref().map_or(1, |r| r.attempt + 1);
        let mut record = HistoryRecord::new(id, attempt, unit.kind(), unit.checksum());
        record.simulated = true;

        if let Some(latest) = &latest {
            if latest.rollback_in_progress {
                return Err(ConflictError::RollbackInProgress {
                    migration_id: id.to_string(),
                }
                .into());
            }
            if latest.status.is_applied() && !config.force {
                return Ok(latest.clone());
            }
        }
        for dependency in unit.dependencies() {
            if !simulation.applied.contains(dependency) && !self.is_applied(dependency)? {
                tracing::info!(migration_id = id, dependency = %dependency, "dry run skipped");
                record.error_summary = Some(format!(
                    "simulation skipped: dependency {} is not applied",
                    dependency
                ));
                return Ok(record);
            }
        }

        let resumed = match &latest {
            Some(r) if matches!(r.status, HistoryStatus::Failed | HistoryStatus::TimedOut) => {
                self.history.load_checkpoint(id, CheckpointPhase::Forward)?
            }
            _ => None,
        };
        let mut checkpoint =
            resumed.unwrap_or_else(|| Checkpoint::new(id, attempt, CheckpointPhase::Forward));
        checkpoint.schema_committed |= latest.as_ref().is_some_and(|r| {
            r.schema_committed && matches!(r.status, HistoryStatus::Failed | HistoryStatus::TimedOut)
        });

        if config.validate_before {
            let issues = ValidationStage::check(&ValidationContext {
                storage: &self.storage,
                unit,
                phase: ValidationPhase::Pre,
                attempt,
                recorded_checksum: None,
                schema_committed: checkpoint.schema_committed,
                preamble: &simulation.statements,
            });
            if ValidationStage::is_blocking(&issues) {
                return Err(MigrationError::Validation {
                    migration_id: id.to_string(),
                    phase: ValidationPhase::Pre,
                    issues,
                    record: Some(Box::new(record)),
                });
            }
            record.issues = issues;
        }
        record.start()?;

        // Batches replay what earlier simulated units and this unit's schema
        // part would have committed
        let mut preamble = simulation.statements.clone();
        if let Some(schema) = unit.operations().schema() {
            if !checkpoint.schema_committed {
                let mut tx = self.storage.begin();
                for statement in &simulation.statements {
                    tx.execute(statement)?;
                }
                for (index, statement) in schema.forward.iter().enumerate() {
                    if let Err(e) = tx.execute(statement) {
                        tx.rollback();
                        return self.fail(
                            record,
                            ExecutionError::Statement {
                                index,
                                statement: statement.to_string(),
                                message: e.to_string(),
                            },
                        );
                    }
                }
                tx.rollback();
                preamble.extend(schema.forward.iter().cloned());
                checkpoint.schema_committed = true;
            }
            record.statements_applied = schema.forward.len() as u32;
        }

        if let Some(data) = unit.operations().data() {
            let ctx = ExecutionContext::new(id, attempt, config.clone(), self.register_cancel(id));
            let progress = self.progress.begin(id, attempt, None);
            let executor = BackfillExecutor {
                storage: &self.storage,
                history: &self.history,
                ctx: &ctx,
                data,
                lock: None,
                progress: &progress,
                capture: self.capture_for(unit, data),
                preamble: &preamble,
            };
            let outcome = executor.run(checkpoint, &mut record);
            progress.finish();
            self.cancels.remove(id);
            let outcome = outcome?;

            record.apply_counts(&outcome.checkpoint);
            record.item_failures = outcome.item_failures;
            match outcome.end {
                DataRunEnd::Completed => {}
                DataRunEnd::Halted(reason) => {
                    record.time_out(reason)?;
                    return Err(MigrationError::Timeout {
                        record: Box::new(record),
                    });
                }
                DataRunEnd::Failed(err) => return self.fail(record, err),
            }
        }

        record.succeed()?;
        simulation.applied.insert(id.to_string());
        simulation.statements = preamble;
        tracing::info!(
            migration_id = id,
            processed = record.items_processed,
            skipped = record.items_skipped,
            failed = record.items_failed,
            statements = record.statements_applied,
            "dry run finished"
        );
        Ok(record)
    }
}
