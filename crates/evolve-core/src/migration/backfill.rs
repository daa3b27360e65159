//! Batched, checkpointed execution of data migrations.
//!
//! Every batch commits its record mutations, lineage entries, tolerated
//! failures and the advanced checkpoint in one storage transaction. A crash
//! therefore loses at most the batch in flight, and resuming from the
//! checkpoint never re-applies a committed item.
//!
//! In parallel mode a generation of up to `max_workers` consecutive batches
//! runs on scoped threads. Each worker commits its batch together with a
//! sub-range entry describing the keys it covered. The coordinator then
//! advances the checkpoint over the contiguous committed prefix only; ranges
//! committed past a gap stay recorded and are skipped on resume.

use std::collections::HashSet;
use std::time::Duration;

use super::config::ExecutionContext;
use super::error::{ExecutionError, MigrationError};
use super::history::{BeforeImage, HistoryStore, LineageEntry, LockGuard};
use super::progress::{ProgressHandle, ProgressPhase};
use super::state::{Checkpoint, CheckpointPhase, HaltReason, HistoryRecord, ItemFailure, SubRange};
use super::transform::{Mutation, SourceItem, TransformOutcome};
use super::unit::DataOperations;
use crate::storage::{SchemaStatement, StorageEngine, Transaction};

/// What the forward run records about touched items.
#[derive(Debug, Clone, Copy)]
pub(crate) enum LineageCapture<'a> {
    /// Nothing; the unit cannot be rolled back.
    Off,
    /// Keys only, for inverse-transform rollback.
    Keys,
    /// Keys and before-images, limited to the snapshot collections.
    BeforeImages(&'a [String]),
}

/// How a data run ended.
#[derive(Debug)]
pub(crate) enum DataRunEnd {
    /// The source was exhausted.
    Completed,
    /// Stopped at a batch boundary.
    Halted(HaltReason),
    /// A fatal item or source failure.
    Failed(ExecutionError),
}

/// Result of a data run.
#[derive(Debug)]
pub(crate) struct DataRunOutcome {
    /// How the run ended.
    pub end: DataRunEnd,
    /// Checkpoint after the last merged batch.
    pub checkpoint: Checkpoint,
    /// Sample of tolerated failures from this attempt.
    pub item_failures: Vec<ItemFailure>,
}

/// Work produced by transforming one batch.
struct BatchWork {
    range: SubRange,
    failures: Vec<ItemFailure>,
    fatal: Option<ExecutionError>,
    /// Every item lies inside a range committed ahead of the checkpoint.
    covered: bool,
}

/// Outcome of one worker batch in a parallel generation.
enum WorkerResult {
    Committed {
        range: SubRange,
        failures: Vec<ItemFailure>,
        covered: bool,
    },
    Failed(ExecutionError),
}

/// Executor for the data part of a migration.
pub(crate) struct BackfillExecutor<'a> {
    pub storage: &'a StorageEngine,
    pub history: &'a HistoryStore,
    pub ctx: &'a ExecutionContext,
    pub data: &'a DataOperations,
    pub lock: Option<&'a LockGuard>,
    pub progress: &'a ProgressHandle,
    pub capture: LineageCapture<'a>,
    /// Statements replayed at the start of every batch transaction. Used by
    /// dry runs, where neither this unit's schema part nor that of earlier
    /// simulated units was committed.
    pub preamble: &'a [SchemaStatement],
}

impl<'a> BackfillExecutor<'a> {
    /// Run until the source is exhausted, a fatal failure, or a halt.
    ///
    /// `record` is refreshed with the checkpoint counters every
    /// `checkpoint_frequency` batches so history shows progress mid-run.
    pub fn run(
        &self,
        mut checkpoint: Checkpoint,
        record: &mut HistoryRecord,
    ) -> Result<DataRunOutcome, MigrationError> {
        checkpoint.attempt = self.ctx.attempt;
        self.progress.set_phase(ProgressPhase::Data);
        self.progress.set_total(self.data.source.estimate_total());

        let mut pending = self
            .history
            .load_sub_ranges(&self.ctx.migration_id, CheckpointPhase::Forward)?;
        if !pending.is_empty() {
            tracing::info!(
                migration_id = %self.ctx.migration_id,
                ranges = pending.len(),
                "resuming with ranges committed ahead of the checkpoint"
            );
        }

        let parallel = self.ctx.config.effective_workers() > 1 && self.data.parallel_safe;
        if self.ctx.config.parallel_execution && !self.data.parallel_safe {
            tracing::debug!(
                migration_id = %self.ctx.migration_id,
                "unit is not parallel-safe; running sequentially"
            );
        }

        let mut failures = Vec::new();
        let end = if parallel {
            self.run_parallel(&mut checkpoint, &mut pending, &mut failures, record)?
        } else {
            self.run_sequential(&mut checkpoint, &mut pending, &mut failures, record)?
        };

        tracing::info!(
            migration_id = %self.ctx.migration_id,
            attempt = self.ctx.attempt,
            processed = checkpoint.items_processed,
            skipped = checkpoint.items_skipped,
            failed = checkpoint.items_failed,
            batches = checkpoint.batches_committed,
            elapsed_ms = self.ctx.elapsed().as_millis() as u64,
            outcome = ?end,
            "data run finished"
        );

        Ok(DataRunOutcome {
            end,
            checkpoint,
            item_failures: failures,
        })
    }

    fn run_sequential(
        &self,
        cp: &mut Checkpoint,
        pending: &mut Vec<SubRange>,
        samples: &mut Vec<ItemFailure>,
        record: &mut HistoryRecord,
    ) -> Result<DataRunEnd, MigrationError> {
        let batch_size = self.ctx.config.effective_batch_size();
        let mut since_flush = 0u32;

        loop {
            if let Some(reason) = self.batch_boundary()? {
                return Ok(DataRunEnd::Halted(reason));
            }

            let items = match self.data.source.fetch(cp.cursor.as_deref(), batch_size) {
                Ok(items) => items,
                Err(e) => return Ok(source_failure(e)),
            };
            if items.is_empty() {
                return Ok(DataRunEnd::Completed);
            }

            let mut tx = self.begin()?;
            let work = self.process_batch(&mut tx, cp.cursor.clone(), &items, pending)?;
            if let Some(fatal) = work.fatal {
                tx.rollback();
                return Ok(DataRunEnd::Failed(fatal));
            }

            if work.covered {
                cp.cursor = Some(work.range.last_key.clone());
            } else {
                cp.absorb(&work.range);
            }
            self.absorb_pending(&mut tx, cp, pending);
            self.history.stage_checkpoint(&mut tx, cp)?;
            self.finish_tx(tx)?;

            self.progress.record_batch(
                work.range.processed,
                work.range.skipped,
                work.range.failed,
            );
            self.sample(samples, work.failures);
            tracing::debug!(
                migration_id = %self.ctx.migration_id,
                batch = cp.batches_committed,
                cursor = cp.cursor.as_deref().unwrap_or(""),
                "batch committed"
            );

            since_flush += 1;
            if since_flush >= self.ctx.config.checkpoint_frequency.max(1) {
                since_flush = 0;
                self.refresh(cp, record)?;
            }
            self.delay();
        }
    }

    fn run_parallel(
        &self,
        cp: &mut Checkpoint,
        pending: &mut Vec<SubRange>,
        samples: &mut Vec<ItemFailure>,
        record: &mut HistoryRecord,
    ) -> Result<DataRunEnd, MigrationError> {
        let batch_size = self.ctx.config.effective_batch_size();
        let workers = self.ctx.config.effective_workers();
        let mut since_flush = 0u32;

        loop {
            if let Some(reason) = self.batch_boundary()? {
                return Ok(DataRunEnd::Halted(reason));
            }

            // Fetch one generation of consecutive batches
            let mut generation: Vec<(Option<String>, Vec<SourceItem>)> = Vec::with_capacity(workers);
            let mut cursor = cp.cursor.clone();
            for _ in 0..workers {
                let items = match self.data.source.fetch(cursor.as_deref(), batch_size) {
                    Ok(items) => items,
                    Err(e) => return Ok(source_failure(e)),
                };
                let Some(last) = items.last() else { break };
                let next = Some(last.key.clone());
                let exhausted = items.len() < batch_size;
                generation.push((cursor, items));
                cursor = next;
                if exhausted {
                    break;
                }
            }
            if generation.is_empty() {
                return Ok(DataRunEnd::Completed);
            }

            let skip: &[SubRange] = pending.as_slice();
            let results: Vec<Result<WorkerResult, MigrationError>> = std::thread::scope(|scope| {
                let handles: Vec<_> = generation
                    .iter()
                    .map(|(after, items)| {
                        scope.spawn(move || self.run_worker_batch(after.clone(), items, skip))
                    })
                    .collect();
                handles
                    .into_iter()
                    .zip(generation.iter())
                    .map(|(handle, (after, _))| {
                        handle.join().unwrap_or_else(|_| {
                            Ok(WorkerResult::Failed(ExecutionError::WorkerPanicked {
                                after: after.clone(),
                            }))
                        })
                    })
                    .collect()
            });

            // Merge the contiguous committed prefix
            let mut tx = self.storage.begin();
            let mut contiguous = true;
            let mut fatal = None;
            let mut ahead = Vec::new();
            for result in results {
                match result? {
                    WorkerResult::Committed {
                        range,
                        failures,
                        covered,
                    } => {
                        self.progress
                            .record_batch(range.processed, range.skipped, range.failed);
                        self.sample(samples, failures);
                        if covered {
                            // Counted when the pending range is absorbed
                            if contiguous {
                                cp.cursor = Some(range.last_key.clone());
                            }
                        } else if contiguous {
                            cp.absorb(&range);
                            self.history.stage_delete_sub_range(
                                &mut tx,
                                &self.ctx.migration_id,
                                CheckpointPhase::Forward,
                                &range.last_key,
                            );
                        } else {
                            ahead.push(range);
                        }
                    }
                    WorkerResult::Failed(err) => {
                        contiguous = false;
                        fatal.get_or_insert(err);
                    }
                }
            }
            self.absorb_pending(&mut tx, cp, pending);
            pending.extend(ahead);
            self.history.stage_checkpoint(&mut tx, cp)?;
            self.finish_tx(tx)?;

            if let Some(err) = fatal {
                return Ok(DataRunEnd::Failed(err));
            }

            since_flush += 1;
            if since_flush >= self.ctx.config.checkpoint_frequency.max(1) {
                since_flush = 0;
                self.refresh(cp, record)?;
            }
            self.delay();
        }
    }

    fn run_worker_batch(
        &self,
        after: Option<String>,
        items: &[SourceItem],
        skip: &[SubRange],
    ) -> Result<WorkerResult, MigrationError> {
        let mut tx = self.begin()?;
        let work = self.process_batch(&mut tx, after, items, skip)?;
        if let Some(fatal) = work.fatal {
            tx.rollback();
            return Ok(WorkerResult::Failed(fatal));
        }
        if work.covered {
            tx.rollback();
            return Ok(WorkerResult::Committed {
                range: work.range,
                failures: work.failures,
                covered: true,
            });
        }
        self.history.stage_sub_range(
            &mut tx,
            &self.ctx.migration_id,
            CheckpointPhase::Forward,
            &work.range,
        )?;
        self.finish_tx(tx)?;
        Ok(WorkerResult::Committed {
            range: work.range,
            failures: work.failures,
            covered: false,
        })
    }

    /// Transform a batch and stage its writes into `tx`.
    ///
    /// Items inside `skip` were committed by an earlier generation and are
    /// neither transformed nor counted.
    fn process_batch(
        &self,
        tx: &mut Transaction<'_>,
        after: Option<String>,
        items: &[SourceItem],
        skip: &[SubRange],
    ) -> Result<BatchWork, MigrationError> {
        let mut work = BatchWork {
            range: SubRange {
                after,
                last_key: items.last().map(|i| i.key.clone()).unwrap_or_default(),
                processed: 0,
                skipped: 0,
                failed: 0,
            },
            failures: Vec::new(),
            fatal: None,
            covered: !items.is_empty()
                && items
                    .iter()
                    .all(|item| skip.iter().any(|r| r.contains(&item.key))),
        };
        let mut touched: HashSet<(String, String)> = HashSet::new();

        for item in items {
            if skip.iter().any(|r| r.contains(&item.key)) {
                continue;
            }

            let error = match self.data.transform.apply(item) {
                TransformOutcome::Apply(mutation) => match self.stage_mutation(tx, &mutation, &mut touched) {
                    Ok(()) => {
                        work.range.processed += 1;
                        continue;
                    }
                    Err(message) => message,
                },
                TransformOutcome::Skip => {
                    work.range.skipped += 1;
                    continue;
                }
                TransformOutcome::Fail(message) => message,
            };

            if !self.ctx.config.continue_on_error {
                work.fatal = Some(ExecutionError::Item {
                    key: item.key.clone(),
                    message: error,
                });
                return Ok(work);
            }

            tracing::debug!(
                migration_id = %self.ctx.migration_id,
                key = %item.key,
                error = %error,
                "item failed"
            );
            let failure = ItemFailure::new(item.key.clone(), error);
            self.history
                .stage_failure(tx, &self.ctx.migration_id, self.ctx.attempt, &failure)?;
            work.range.failed += 1;
            work.failures.push(failure);
        }
        Ok(work)
    }

    /// Stage one mutation plus its lineage. Errors are per-item messages.
    fn stage_mutation(
        &self,
        tx: &mut Transaction<'_>,
        mutation: &Mutation,
        touched: &mut HashSet<(String, String)>,
    ) -> Result<(), String> {
        let collection = mutation.collection();
        let key = mutation.key();

        if let LineageCapture::BeforeImages(covered) = self.capture {
            if !covered.iter().any(|c| c == collection) {
                return Err(format!(
                    "collection '{}' is not covered by the rollback snapshot",
                    collection
                ));
            }
        }

        // Before-image must be read before the mutation is staged
        let lineage = match self.capture {
            LineageCapture::Off => None,
            _ if touched.contains(&(collection.to_string(), key.to_string())) => None,
            capture => {
                let seen = self
                    .history
                    .lineage_contains(&self.ctx.migration_id, collection, key)
                    .map_err(|e| e.to_string())?;
                if seen {
                    None
                } else {
                    let before = match capture {
                        LineageCapture::BeforeImages(_) => {
                            match self.storage.get_record(collection, key) {
                                Ok(Some(value)) => BeforeImage::Present(value),
                                Ok(None) => BeforeImage::Absent,
                                Err(e) => return Err(e.to_string()),
                            }
                        }
                        _ => BeforeImage::NotCaptured,
                    };
                    Some(LineageEntry {
                        collection: collection.to_string(),
                        key: key.to_string(),
                        before,
                    })
                }
            }
        };

        let staged = match mutation {
            Mutation::Upsert {
                collection,
                key,
                value,
            } => tx.put_record(collection, key, value).map(|_| ()),
            Mutation::Delete { collection, key } => tx.delete_record(collection, key).map(|_| ()),
        };
        staged.map_err(|e| e.to_string())?;

        if let Some(entry) = lineage {
            self.history
                .stage_lineage(tx, &self.ctx.migration_id, &entry)
                .map_err(|e| e.to_string())?;
            touched.insert((entry.collection, entry.key));
        }
        Ok(())
    }

    /// Fold recorded ranges the cursor has caught up with into the checkpoint.
    fn absorb_pending(&self, tx: &mut Transaction<'_>, cp: &mut Checkpoint, pending: &mut Vec<SubRange>) {
        let Some(cursor) = cp.cursor.clone() else {
            return;
        };
        pending.retain(|range| {
            if range.last_key.as_str() > cursor.as_str() {
                return true;
            }
            cp.batches_committed += 1;
            cp.items_processed += range.processed;
            cp.items_skipped += range.skipped;
            cp.items_failed += range.failed;
            self.progress
                .record_batch(range.processed, range.skipped, range.failed);
            self.history.stage_delete_sub_range(
                tx,
                &self.ctx.migration_id,
                CheckpointPhase::Forward,
                &range.last_key,
            );
            false
        });
    }

    /// Checks done between batches: halt requests, then lease renewal.
    fn batch_boundary(&self) -> Result<Option<HaltReason>, MigrationError> {
        if let Some(reason) = self.ctx.halt_reason() {
            tracing::warn!(
                migration_id = %self.ctx.migration_id,
                reason = %reason,
                "halting at batch boundary"
            );
            return Ok(Some(reason));
        }
        if let Some(lock) = self.lock {
            lock.renew()?;
        }
        Ok(None)
    }

    fn begin(&self) -> Result<Transaction<'a>, MigrationError> {
        let mut tx = self.storage.begin();
        for statement in self.preamble {
            tx.execute(statement)?;
        }
        Ok(tx)
    }

    fn finish_tx(&self, tx: Transaction<'_>) -> Result<(), MigrationError> {
        if self.ctx.config.dry_run {
            tx.rollback();
            Ok(())
        } else {
            tx.commit()?;
            Ok(())
        }
    }

    fn refresh(&self, cp: &Checkpoint, record: &mut HistoryRecord) -> Result<(), MigrationError> {
        if self.ctx.config.dry_run {
            return Ok(());
        }
        self.storage.flush()?;
        record.apply_counts(cp);
        record.work_committed = true;
        self.history.save(record)
    }

    fn sample(&self, samples: &mut Vec<ItemFailure>, failures: Vec<ItemFailure>) {
        let room = self
            .ctx
            .config
            .failure_sample_limit
            .saturating_sub(samples.len());
        samples.extend(failures.into_iter().take(room));
    }

    fn delay(&self) {
        if self.ctx.config.batch_delay_ms > 0 {
            std::thread::sleep(Duration::from_millis(self.ctx.config.batch_delay_ms));
        }
    }
}

fn source_failure(e: crate::error::Error) -> DataRunEnd {
    DataRunEnd::Failed(ExecutionError::Source {
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::config::ExecutionConfig;
    use crate::migration::progress::ProgressTracker;
    use crate::migration::transform::CollectionSource;
    use crate::migration::unit::MigrationKind;
    use crate::storage::{FieldDef, FieldKind, SchemaStatement, StorageConfig};
    use serde_json::json;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn engine(n: usize) -> Arc<StorageEngine> {
        let engine = StorageEngine::open(StorageConfig::temporary()).unwrap();
        let mut tx = engine.begin();
        tx.execute(&SchemaStatement::CreateCollection {
            name: "documents".into(),
            fields: vec![FieldDef::new("n", FieldKind::Int)],
        })
        .unwrap();
        tx.commit().unwrap();
        for i in 0..n {
            engine
                .insert_record("documents", &format!("doc-{:04}", i), &json!({ "n": i }))
                .unwrap();
        }
        Arc::new(engine)
    }

    fn tag(item: &SourceItem) -> TransformOutcome {
        let n = item.value["n"].as_u64().unwrap_or(0);
        if n % 10 == 0 {
            return TransformOutcome::Skip;
        }
        if n % 7 == 0 {
            return TransformOutcome::Fail(format!("{} is divisible by 7", n));
        }
        TransformOutcome::Apply(Mutation::upsert(
            "documents",
            item.key.clone(),
            json!({ "n": n, "tagged": true }),
        ))
    }

    struct Harness {
        storage: Arc<StorageEngine>,
        history: HistoryStore,
        data: DataOperations,
        tracker: ProgressTracker,
    }

    impl Harness {
        fn new(n: usize, parallel_safe: bool) -> Self {
            let storage = engine(n);
            let data = DataOperations::new(CollectionSource::new(storage.clone(), "documents"), tag)
                .with_parallel_safe(parallel_safe);
            Self {
                history: HistoryStore::new(storage.clone()),
                storage,
                data,
                tracker: ProgressTracker::new(),
            }
        }

        fn run(&self, config: ExecutionConfig, checkpoint: Checkpoint) -> DataRunOutcome {
            let ctx = ExecutionContext::new("tag", 1, config, Arc::new(AtomicBool::new(false)));
            let progress = self.tracker.begin("tag", 1, None);
            let executor = BackfillExecutor {
                storage: &self.storage,
                history: &self.history,
                ctx: &ctx,
                data: &self.data,
                lock: None,
                progress: &progress,
                capture: LineageCapture::Keys,
                preamble: &[],
            };
            let mut record = HistoryRecord::new("tag", 1, MigrationKind::Data, "c");
            executor.run(checkpoint, &mut record).unwrap()
        }
    }

    fn fresh() -> Checkpoint {
        Checkpoint::new("tag", 1, CheckpointPhase::Forward)
    }

    #[test]
    fn test_counts_cover_every_item() {
        let harness = Harness::new(100, false);
        let outcome = harness.run(
            ExecutionConfig::new()
                .with_batch_size(16)
                .with_continue_on_error(true),
            fresh(),
        );
        assert!(matches!(outcome.end, DataRunEnd::Completed));

        // 10 multiples of 10, 14 multiples of 7 excluding 0 and 70
        let cp = outcome.checkpoint;
        assert_eq!(cp.items_skipped, 10);
        assert_eq!(cp.items_failed, 13);
        assert_eq!(cp.items_processed, 77);
        assert_eq!(cp.items_seen(), 100);
        assert_eq!(cp.batches_committed, 7);
        assert_eq!(outcome.item_failures.len(), 13);
        assert_eq!(harness.history.failures("tag", 1).unwrap().len(), 13);
        assert_eq!(harness.history.lineage_len("tag").unwrap(), 77);

        let tagged = harness.storage.get_record("documents", "doc-0001").unwrap().unwrap();
        assert_eq!(tagged["tagged"], json!(true));
    }

    #[test]
    fn test_fatal_failure_discards_batch() {
        let harness = Harness::new(30, false);
        let outcome = harness.run(ExecutionConfig::new().with_batch_size(5), fresh());
        match outcome.end {
            DataRunEnd::Failed(ExecutionError::Item { key, .. }) => assert_eq!(key, "doc-0007"),
            other => panic!("unexpected end {:?}", other),
        }
        // Batch doc-0005..doc-0009 was discarded entirely
        assert_eq!(outcome.checkpoint.cursor.as_deref(), Some("doc-0004"));
        assert!(harness.storage.get_record("documents", "doc-0006").unwrap().unwrap()["tagged"].is_null());

        let durable = harness.history.load_checkpoint("tag", CheckpointPhase::Forward).unwrap().unwrap();
        assert_eq!(durable, outcome.checkpoint);
    }

    #[test]
    fn test_resume_from_checkpoint() {
        let harness = Harness::new(40, false);
        let mut cp = fresh();
        cp.cursor = Some("doc-0019".into());
        cp.items_processed = 20;
        cp.batches_committed = 2;

        let outcome = harness.run(
            ExecutionConfig::new()
                .with_batch_size(10)
                .with_continue_on_error(true),
            cp,
        );
        // Items before the cursor were not touched again
        assert!(harness.storage.get_record("documents", "doc-0011").unwrap().unwrap()["tagged"].is_null());
        assert!(harness.storage.get_record("documents", "doc-0023").unwrap().unwrap()["tagged"].as_bool().unwrap());
        assert_eq!(outcome.checkpoint.items_seen(), 40);
        assert_eq!(outcome.checkpoint.batches_committed, 4);
    }

    #[test]
    fn test_dry_run_commits_nothing() {
        let harness = Harness::new(20, false);
        let outcome = harness.run(
            ExecutionConfig::new()
                .with_batch_size(8)
                .with_dry_run(true)
                .with_continue_on_error(true),
            fresh(),
        );
        assert_eq!(outcome.checkpoint.items_seen(), 20);
        assert!(harness.history.load_checkpoint("tag", CheckpointPhase::Forward).unwrap().is_none());
        assert_eq!(harness.history.lineage_len("tag").unwrap(), 0);
        assert!(harness.storage.get_record("documents", "doc-0001").unwrap().unwrap()["tagged"].is_null());
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let harness = Harness::new(250, true);
        let outcome = harness.run(
            ExecutionConfig::new()
                .with_batch_size(10)
                .with_parallel(4)
                .with_continue_on_error(true),
            fresh(),
        );
        assert!(matches!(outcome.end, DataRunEnd::Completed));
        let cp = outcome.checkpoint;
        assert_eq!(cp.items_seen(), 250);
        assert_eq!(cp.items_skipped, 25);
        assert_eq!(cp.cursor.as_deref(), Some("doc-0249"));
        assert!(harness.history.load_sub_ranges("tag", CheckpointPhase::Forward).unwrap().is_empty());
    }

    #[test]
    fn test_pending_ranges_are_skipped_and_absorbed() {
        let harness = Harness::new(30, false);

        // Simulate a worker that committed doc-0010..doc-0019 before a crash
        let ahead = SubRange {
            after: Some("doc-0009".into()),
            last_key: "doc-0019".into(),
            processed: 10,
            skipped: 0,
            failed: 0,
        };
        let mut tx = harness.storage.begin();
        harness
            .history
            .stage_sub_range(&mut tx, "tag", CheckpointPhase::Forward, &ahead)
            .unwrap();
        tx.commit().unwrap();

        let outcome = harness.run(
            ExecutionConfig::new()
                .with_batch_size(10)
                .with_continue_on_error(true),
            fresh(),
        );
        // The range's items are untouched by this run
        assert!(harness.storage.get_record("documents", "doc-0011").unwrap().unwrap()["tagged"].is_null());
        assert_eq!(outcome.checkpoint.items_seen(), 30);
        assert_eq!(outcome.checkpoint.batches_committed, 3);
        assert!(harness.history.load_sub_ranges("tag", CheckpointPhase::Forward).unwrap().is_empty());
    }

    #[test]
    fn test_halt_before_first_batch() {
        let harness = Harness::new(10, false);
        let outcome = harness.run(ExecutionConfig::new().with_timeout(0), fresh());
        assert!(matches!(outcome.end, DataRunEnd::Halted(HaltReason::Deadline)));
        assert_eq!(outcome.checkpoint.items_seen(), 0);
    }
}
