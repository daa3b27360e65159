//! Execution configuration and per-run context.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::state::HaltReason;

/// How to behave when another run holds a migration's lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockWait {
    /// Fail immediately with a conflict.
    FailFast,
    /// Poll until the lock frees or `timeout` passes.
    Bounded {
        /// Maximum time to wait.
        timeout: Duration,
        /// Delay between attempts.
        poll_interval: Duration,
    },
}

/// Execution options for one call into the engine.
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// Simulate without committing or persisting history.
    pub dry_run: bool,
    /// Items per data batch.
    pub batch_size: usize,
    /// Roll back automatically when post-validation fails.
    pub enable_rollback: bool,
    /// Run pre-validation.
    pub validate_before: bool,
    /// Run post-validation.
    pub validate_after: bool,
    /// Process batches concurrently when the unit is parallel-safe.
    pub parallel_execution: bool,
    /// Batches between disk flushes and history refreshes. The checkpoint
    /// itself is always committed with its batch.
    pub checkpoint_frequency: u32,
    /// Soft deadline, checked at batch boundaries.
    pub timeout_seconds: Option<u64>,
    /// Record per-item failures and keep going.
    pub continue_on_error: bool,
    /// Re-execute a migration that already succeeded.
    pub force: bool,
    /// Worker threads for parallel execution.
    pub max_workers: usize,
    /// Delay between batches in milliseconds (for yielding to writes).
    pub batch_delay_ms: u64,
    /// Behaviour on lock contention.
    pub lock_wait: LockWait,
    /// Lease length; renewed at every batch boundary.
    pub lock_lease: Duration,
    /// Item failures copied into the history record; the rest stay queryable.
    pub failure_sample_limit: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            batch_size: 1000,
            enable_rollback: true,
            validate_before: true,
            validate_after: true,
            parallel_execution: false,
            checkpoint_frequency: 1,
            timeout_seconds: None,
            continue_on_error: false,
            force: false,
            max_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            batch_delay_ms: 0,
            lock_wait: LockWait::FailFast,
            lock_lease: Duration::from_secs(300),
            failure_sample_limit: 100,
        }
    }
}

impl ExecutionConfig {
    /// Create a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set dry-run mode.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Set the batch size. Zero is treated as one.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Enable or disable automatic rollback.
    pub fn with_rollback(mut self, enabled: bool) -> Self {
        self.enable_rollback = enabled;
        self
    }

    /// Enable or disable pre- and post-validation.
    pub fn with_validation(mut self, before: bool, after: bool) -> Self {
        self.validate_before = before;
        self.validate_after = after;
        self
    }

    /// Enable parallel execution with up to `max_workers` threads.
    pub fn with_parallel(mut self, max_workers: usize) -> Self {
        self.parallel_execution = true;
        self.max_workers = max_workers.max(1);
        self
    }

    /// Set the flush interval in batches.
    pub fn with_checkpoint_frequency(mut self, batches: u32) -> Self {
        self.checkpoint_frequency = batches.max(1);
        self
    }

    /// Set the soft deadline.
    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    /// Tolerate per-item failures.
    pub fn with_continue_on_error(mut self, enabled: bool) -> Self {
        self.continue_on_error = enabled;
        self
    }

    /// Re-execute already succeeded migrations.
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Set the delay between batches.
    pub fn with_batch_delay_ms(mut self, delay_ms: u64) -> Self {
        self.batch_delay_ms = delay_ms;
        self
    }

    /// Set lock contention behaviour.
    pub fn with_lock_wait(mut self, wait: LockWait) -> Self {
        self.lock_wait = wait;
        self
    }

    /// Set the lock lease.
    pub fn with_lock_lease(mut self, lease: Duration) -> Self {
        self.lock_lease = lease;
        self
    }

    pub(crate) fn effective_batch_size(&self) -> usize {
        self.batch_size.max(1)
    }

    pub(crate) fn effective_workers(&self) -> usize {
        if self.parallel_execution {
            self.max_workers.max(1)
        } else {
            1
        }
    }
}

/// State shared by everything working on one attempt.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Migration id.
    pub migration_id: String,
    /// Attempt number.
    pub attempt: u32,
    /// Options.
    pub config: ExecutionConfig,
    started: Instant,
    deadline: Option<Instant>,
    cancel: Arc<AtomicBool>,
}

impl ExecutionContext {
    /// Create a context; the deadline starts counting now.
    pub fn new(
        migration_id: impl Into<String>,
        attempt: u32,
        config: ExecutionConfig,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        let started = Instant::now();
        let deadline = config
            .timeout_seconds
            .map(|secs| started + Duration::from_secs(secs));
        Self {
            migration_id: migration_id.into(),
            attempt,
            config,
            started,
            deadline,
            cancel,
        }
    }

    /// Time since the attempt started.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Returns `true` once cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Why the run must stop at the next batch boundary, if at all.
    pub fn halt_reason(&self) -> Option<HaltReason> {
        if self.is_cancelled() {
            return Some(HaltReason::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(HaltReason::Deadline),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ExecutionConfig::default();
        assert_eq!(config.batch_size, 1000);
        assert!(config.validate_before);
        assert!(config.validate_after);
        assert!(!config.dry_run);
        assert!(!config.force);
        assert_eq!(config.checkpoint_frequency, 1);
        assert_eq!(config.lock_wait, LockWait::FailFast);
        assert_eq!(config.effective_workers(), 1);
    }

    #[test]
    fn test_config_builders() {
        let config = ExecutionConfig::new()
            .with_batch_size(0)
            .with_parallel(0)
            .with_timeout(30)
            .with_checkpoint_frequency(0)
            .with_continue_on_error(true);
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.effective_workers(), 1);
        assert!(config.parallel_execution);
        assert_eq!(config.timeout_seconds, Some(30));
        assert_eq!(config.checkpoint_frequency, 1);
        assert!(config.continue_on_error);
    }

    #[test]
    fn test_halt_reasons() {
        let cancel = Arc::new(AtomicBool::new(false));
        let ctx = ExecutionContext::new("m", 1, ExecutionConfig::default(), cancel.clone());
        assert_eq!(ctx.halt_reason(), None);
        cancel.store(true, Ordering::SeqCst);
        assert_eq!(ctx.halt_reason(), Some(HaltReason::Cancelled));

        let expired = ExecutionContext::new(
            "m",
            1,
            ExecutionConfig::default().with_timeout(0),
            Arc::new(AtomicBool::new(false)),
        );
        assert_eq!(expired.halt_reason(), Some(HaltReason::Deadline));
    }
}
