//! Live progress of running migrations.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use super::state::{Checkpoint, HistoryRecord};
use dashmap::DashMap;
use parking_lot::Mutex;

/// What a migration is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressPhase {
    /// Nothing recorded yet.
    Idle,
    /// Pre-validation.
    Validating,
    /// Applying schema statements.
    Schema,
    /// Processing data batches.
    Data,
    /// Post-validation.
    Verifying,
    /// Reverting.
    RollingBack,
    /// Attempt finished.
    Finished,
}

impl std::fmt::Display for ProgressPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProgressPhase::Idle => write!(f, "idle"),
            ProgressPhase::Validating => write!(f, "validating"),
            ProgressPhase::Schema => write!(f, "schema"),
            ProgressPhase::Data => write!(f, "data"),
            ProgressPhase::Verifying => write!(f, "verifying"),
            ProgressPhase::RollingBack => write!(f, "rolling_back"),
            ProgressPhase::Finished => write!(f, "finished"),
        }
    }
}

/// Point-in-time progress report.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    /// Migration id.
    pub migration_id: String,
    /// Current phase.
    pub phase: ProgressPhase,
    /// Attempt the numbers belong to.
    pub attempt: u32,
    /// Estimated total items, if known.
    pub total_items: Option<u64>,
    /// Items applied.
    pub items_processed: u64,
    /// Items skipped.
    pub items_skipped: u64,
    /// Items failed.
    pub items_failed: u64,
    /// Batches committed.
    pub current_batch: u64,
    /// Percentage complete, when the total is known.
    pub percent_complete: Option<f64>,
    /// Throughput of the current attempt.
    pub items_per_sec: f64,
    /// Estimated seconds remaining.
    pub eta_secs: Option<u64>,
    /// Milliseconds since the attempt started.
    pub elapsed_ms: u64,
    /// `true` when the numbers come from a live run.
    pub live: bool,
}

impl ProgressSnapshot {
    /// Empty report for a migration that never ran.
    pub fn idle(migration_id: impl Into<String>) -> Self {
        Self {
            migration_id: migration_id.into(),
            phase: ProgressPhase::Idle,
            attempt: 0,
            total_items: None,
            items_processed: 0,
            items_skipped: 0,
            items_failed: 0,
            current_batch: 0,
            percent_complete: None,
            items_per_sec: 0.0,
            eta_secs: None,
            elapsed_ms: 0,
            live: false,
        }
    }

    /// Report reconstructed from a durable checkpoint of an interrupted run.
    pub fn from_checkpoint(checkpoint: &Checkpoint) -> Self {
        Self {
            attempt: checkpoint.attempt,
            phase: ProgressPhase::Data,
            items_processed: checkpoint.items_processed,
            items_skipped: checkpoint.items_skipped,
            items_failed: checkpoint.items_failed,
            current_batch: checkpoint.batches_committed,
            ..Self::idle(checkpoint.migration_id.clone())
        }
    }

    /// Report of a finished attempt.
    pub fn from_record(record: &HistoryRecord) -> Self {
        Self {
            attempt: record.attempt,
            phase: ProgressPhase::Finished,
            items_processed: record.items_processed,
            items_skipped: record.items_skipped,
            items_failed: record.items_failed,
            current_batch: record.batches_committed,
            elapsed_ms: record.duration_ms().unwrap_or(0),
            ..Self::idle(record.migration_id.clone())
        }
    }

    /// Items accounted for.
    pub fn items_seen(&self) -> u64 {
        self.items_processed + self.items_skipped + self.items_failed
    }
}

/// Shared counters of one live run. Workers update them without locking.
#[derive(Debug)]
pub struct ProgressHandle {
    migration_id: String,
    attempt: u32,
    phase: Mutex<ProgressPhase>,
    total: Mutex<Option<u64>>,
    processed: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
    batches: AtomicU64,
    /// Items already done when this attempt started (resumed runs).
    baseline: u64,
    started: Instant,
    finished: AtomicBool,
}

impl ProgressHandle {
    fn new(migration_id: &str, attempt: u32) -> Self {
        Self {
            migration_id: migration_id.to_string(),
            attempt,
            phase: Mutex::new(ProgressPhase::Validating),
            total: Mutex::new(None),
            processed: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            batches: AtomicU64::new(0),
            baseline: 0,
            started: Instant::now(),
            finished: AtomicBool::new(false),
        }
    }

    /// Set the phase.
    pub fn set_phase(&self, phase: ProgressPhase) {
        *self.phase.lock() = phase;
    }

    /// Set the estimated total.
    pub fn set_total(&self, total: Option<u64>) {
        *self.total.lock() = total;
    }

    /// Seed counters from a checkpoint when resuming.
    pub fn resume_from(&self, checkpoint: &Checkpoint) {
        self.processed
            .store(checkpoint.items_processed, Ordering::Relaxed);
        self.skipped.store(checkpoint.items_skipped, Ordering::Relaxed);
        self.failed.store(checkpoint.items_failed, Ordering::Relaxed);
        self.batches
            .store(checkpoint.batches_committed, Ordering::Relaxed);
    }

    /// Record a committed batch.
    pub fn record_batch(&self, processed: u64, skipped: u64, failed: u64) {
        self.processed.fetch_add(processed, Ordering::Relaxed);
        self.skipped.fetch_add(skipped, Ordering::Relaxed);
        self.failed.fetch_add(failed, Ordering::Relaxed);
        self.batches.fetch_add(1, Ordering::Relaxed);
    }

    /// Mark the run as done.
    pub fn finish(&self) {
        self.set_phase(ProgressPhase::Finished);
        self.finished.store(true, Ordering::Relaxed);
    }

    /// Returns `true` once [`finish`](Self::finish) was called.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Relaxed)
    }

    /// Current report.
    pub fn snapshot(&self) -> ProgressSnapshot {
        let processed = self.processed.load(Ordering::Relaxed);
        let skipped = self.skipped.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let seen = processed + skipped + failed;
        let total = *self.total.lock();
        let elapsed = self.started.elapsed();

        let this_run = seen.saturating_sub(self.baseline);
        let secs = elapsed.as_secs_f64();
        let items_per_sec = if secs > 0.0 {
            this_run as f64 / secs
        } else {
            0.0
        };

        let percent_complete = total.map(|t| {
            if t == 0 {
                100.0
            } else {
                (seen as f64 / t as f64 * 100.0).min(100.0)
            }
        });
        let eta_secs = match total {
            Some(t) if items_per_sec > 0.0 => {
                Some((t.saturating_sub(seen) as f64 / items_per_sec).ceil() as u64)
            }
            _ => None,
        };

        ProgressSnapshot {
            migration_id: self.migration_id.clone(),
            phase: *self.phase.lock(),
            attempt: self.attempt,
            total_items: total,
            items_processed: processed,
            items_skipped: skipped,
            items_failed: failed,
            current_batch: self.batches.load(Ordering::Relaxed),
            percent_complete,
            items_per_sec,
            eta_secs,
            elapsed_ms: elapsed.as_millis() as u64,
            live: !self.is_finished(),
        }
    }
}

/// Registry of live runs, keyed by migration id.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    runs: DashMap<String, Arc<ProgressHandle>>,
}

impl ProgressTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a run, replacing any finished one for the same migration.
    pub fn begin(&self, migration_id: &str, attempt: u32, resumed: Option<&Checkpoint>) -> Arc<ProgressHandle> {
        let mut handle = ProgressHandle::new(migration_id, attempt);
        if let Some(cp) = resumed {
            handle.baseline = cp.items_seen();
        }
        let handle = Arc::new(handle);
        if let Some(cp) = resumed {
            handle.resume_from(cp);
        }
        self.runs.insert(migration_id.to_string(), handle.clone());
        handle
    }

    /// Current report of a run registered in this process.
    pub fn snapshot(&self, migration_id: &str) -> Option<ProgressSnapshot> {
        self.runs.get(migration_id).map(|h| h.snapshot())
    }

    /// Forget a run.
    pub fn remove(&self, migration_id: &str) {
        self.runs.remove(migration_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::state::CheckpointPhase;

    #[test]
    fn test_live_counters() {
        let tracker = ProgressTracker::new();
        let handle = tracker.begin("m", 1, None);
        handle.set_phase(ProgressPhase::Data);
        handle.set_total(Some(100));
        handle.record_batch(20, 3, 2);
        handle.record_batch(25, 0, 0);

        let snap = tracker.snapshot("m").unwrap();
        assert_eq!(snap.items_processed, 45);
        assert_eq!(snap.items_seen(), 50);
        assert_eq!(snap.current_batch, 2);
        assert_eq!(snap.percent_complete, Some(50.0));
        assert!(snap.live);

        handle.finish();
        let done = tracker.snapshot("m").unwrap();
        assert_eq!(done.phase, ProgressPhase::Finished);
        assert!(!done.live);
    }

    #[test]
    fn test_resume_seeds_counters() {
        let mut cp = Checkpoint::new("m", 1, CheckpointPhase::Forward);
        cp.items_processed = 3000;
        cp.batches_committed = 3;

        let tracker = ProgressTracker::new();
        let handle = tracker.begin("m", 2, Some(&cp));
        handle.record_batch(1000, 0, 0);

        let snap = handle.snapshot();
        assert_eq!(snap.items_processed, 4000);
        assert_eq!(snap.current_batch, 4);
        assert_eq!(snap.attempt, 2);
    }

    #[test]
    fn test_checkpoint_fallback() {
        let mut cp = Checkpoint::new("m", 4, CheckpointPhase::Forward);
        cp.items_processed = 10;
        let snap = ProgressSnapshot::from_checkpoint(&cp);
        assert_eq!(snap.attempt, 4);
        assert_eq!(snap.items_processed, 10);
        assert!(!snap.live);
        assert!(ProgressTracker::new().snapshot("m").is_none());
    }

    #[test]
    fn test_empty_total_is_complete() {
        let tracker = ProgressTracker::new();
        let handle = tracker.begin("m", 1, None);
        handle.set_total(Some(0));
        assert_eq!(handle.snapshot().percent_complete, Some(100.0));
    }
}
