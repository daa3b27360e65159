//! Persisted migration state: history records, checkpoints and their parts.
//!
//! Everything here is stored in the migration metadata tree with rkyv.

use super::error::MigrationError;
use super::unit::MigrationKind;
use super::validation::ValidationIssue;
use crate::storage::key::current_timestamp;
use rkyv::{Archive, Deserialize, Serialize};

/// Status of one execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Archive, Serialize, Deserialize)]
pub enum HistoryStatus {
    /// Attempt created, not started.
    Pending,
    /// Attempt in progress.
    Running,
    /// Every operation applied.
    Succeeded,
    /// Applied, with per-item failures tolerated by `continue_on_error`.
    SucceededWithErrors,
    /// Attempt failed.
    Failed,
    /// Deadline or cancellation reached at a batch boundary.
    TimedOut,
    /// Applied work was reverted.
    RolledBack,
}

impl HistoryStatus {
    /// Returns `true` if the migration's effects are in place.
    pub fn is_applied(self) -> bool {
        matches!(
            self,
            HistoryStatus::Succeeded | HistoryStatus::SucceededWithErrors
        )
    }

    /// Returns `true` for statuses an attempt ends in.
    pub fn is_terminal(self) -> bool {
        !matches!(self, HistoryStatus::Pending | HistoryStatus::Running)
    }

    /// Whether the state machine allows `self -> next`.
    ///
    /// `Failed -> RolledBack` additionally requires committed work, which is
    /// checked by [`HistoryRecord::transition`].
    pub fn can_transition_to(self, next: HistoryStatus) -> bool {
        use HistoryStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Succeeded)
                | (Running, SucceededWithErrors)
                | (Running, Failed)
                | (Running, TimedOut)
                | (Succeeded, RolledBack)
                | (SucceededWithErrors, RolledBack)
                | (TimedOut, RolledBack)
                | (Failed, RolledBack)
        )
    }
}

impl std::fmt::Display for HistoryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HistoryStatus::Pending => write!(f, "pending"),
            HistoryStatus::Running => write!(f, "running"),
            HistoryStatus::Succeeded => write!(f, "succeeded"),
            HistoryStatus::SucceededWithErrors => write!(f, "succeeded_with_errors"),
            HistoryStatus::Failed => write!(f, "failed"),
            HistoryStatus::TimedOut => write!(f, "timed_out"),
            HistoryStatus::RolledBack => write!(f, "rolled_back"),
        }
    }
}

/// Why a run stopped at a batch boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub enum HaltReason {
    /// The soft deadline passed.
    Deadline,
    /// `cancel` was requested.
    Cancelled,
}

impl std::fmt::Display for HaltReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HaltReason::Deadline => write!(f, "deadline"),
            HaltReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Structured detail of a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub enum FailureDetail {
    /// A schema statement failed.
    Statement {
        /// Zero-based index.
        index: u32,
        /// Rendered statement.
        statement: String,
        /// Error message.
        message: String,
    },
    /// A data item failed.
    Item {
        /// Item key.
        key: String,
        /// Error message.
        message: String,
    },
    /// The item source failed.
    Source {
        /// Error message.
        message: String,
    },
    /// Blocking validation issues.
    Validation {
        /// Reported issues.
        issues: Vec<ValidationIssue>,
    },
    /// The process died while the attempt was running.
    Interrupted,
    /// Storage or encoding failure.
    Internal {
        /// Error message.
        message: String,
    },
}

/// A single tolerated item failure.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub struct ItemFailure {
    /// Item key.
    pub key: String,
    /// Error message.
    pub message: String,
    /// When it failed (microseconds since epoch).
    pub timestamp: u64,
}

impl ItemFailure {
    /// Create a failure record stamped now.
    pub fn new(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            message: message.into(),
            timestamp: current_timestamp(),
        }
    }

    /// Serialize to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, MigrationError> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|v| v.to_vec())
            .map_err(|e| MigrationError::Serialization(e.to_string()))
    }

    /// Deserialize from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MigrationError> {
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(bytes)
            .map_err(|e| MigrationError::Deserialization(e.to_string()))
    }
}

/// One execution attempt of a migration.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// Migration id.
    pub migration_id: String,
    /// Attempt number, starting at 1.
    pub attempt: u32,
    /// Current status.
    pub status: HistoryStatus,
    /// Kind of the unit.
    pub kind: MigrationKind,
    /// Checksum of the definition that ran.
    pub checksum: String,
    /// When the attempt started (microseconds since epoch).
    pub started_at: Option<u64>,
    /// When the attempt reached a terminal status.
    pub finished_at: Option<u64>,
    /// Last update.
    pub updated_at: u64,
    /// Human-readable error summary.
    pub error_summary: Option<String>,
    /// Structured failure detail.
    pub failure: Option<FailureDetail>,
    /// Items whose mutation was applied, across resumed attempts.
    pub items_processed: u64,
    /// Items the transform skipped.
    pub items_skipped: u64,
    /// Items that failed.
    pub items_failed: u64,
    /// Data batches committed.
    pub batches_committed: u64,
    /// Schema statements applied.
    pub statements_applied: u32,
    /// First item failures of this attempt; the full list is in the history store.
    pub item_failures: Vec<ItemFailure>,
    /// Non-blocking validation findings, or the blocking ones when validation failed.
    pub issues: Vec<ValidationIssue>,
    /// Set when the attempt timed out.
    pub halt_reason: Option<HaltReason>,
    /// Dry run; never persisted.
    pub simulated: bool,
    /// Some operations of the attempt (or a resumed predecessor) committed.
    pub work_committed: bool,
    /// Schema part committed.
    pub schema_committed: bool,
    /// A rollback was started and has not finished.
    pub rollback_in_progress: bool,
    /// Id of the rollback that reverted this attempt.
    pub rollback_id: Option<String>,
}

impl HistoryRecord {
    /// Create a pending record.
    pub fn new(
        migration_id: impl Into<String>,
        attempt: u32,
        kind: MigrationKind,
        checksum: impl Into<String>,
    ) -> Self {
        Self {
            migration_id: migration_id.into(),
            attempt,
            status: HistoryStatus::Pending,
            kind,
            checksum: checksum.into(),
            started_at: None,
            finished_at: None,
            updated_at: current_timestamp(),
            error_summary: None,
            failure: None,
            items_processed: 0,
            items_skipped: 0,
            items_failed: 0,
            batches_committed: 0,
            statements_applied: 0,
            item_failures: Vec::new(),
            issues: Vec::new(),
            halt_reason: None,
            simulated: false,
            work_committed: false,
            schema_committed: false,
            rollback_in_progress: false,
            rollback_id: None,
        }
    }

    /// Move to `next`, enforcing the state machine.
    pub fn transition(&mut self, next: HistoryStatus) -> Result<(), MigrationError> {
        let allowed = self.status.can_transition_to(next)
            && !(self.status == HistoryStatus::Failed
                && next == HistoryStatus::RolledBack
                && !self.work_committed);
        if !allowed {
            return Err(MigrationError::InvalidTransition {
                migration_id: self.migration_id.clone(),
                from: self.status,
                to: next,
            });
        }

        let now = current_timestamp();
        match next {
            HistoryStatus::Running => self.started_at = Some(now),
            HistoryStatus::RolledBack => self.rollback_in_progress = false,
            s if s.is_terminal() => self.finished_at = Some(now),
            _ => {}
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Start the attempt.
    pub fn start(&mut self) -> Result<(), MigrationError> {
        self.transition(HistoryStatus::Running)
    }

    /// Finish successfully; tolerated item failures yield `SucceededWithErrors`.
    pub fn succeed(&mut self) -> Result<(), MigrationError> {
        if self.items_failed > 0 {
            self.transition(HistoryStatus::SucceededWithErrors)
        } else {
            self.transition(HistoryStatus::Succeeded)
        }
    }

    /// Finish as failed.
    pub fn fail(
        &mut self,
        summary: impl Into<String>,
        detail: FailureDetail,
    ) -> Result<(), MigrationError> {
        self.transition(HistoryStatus::Failed)?;
        self.error_summary = Some(summary.into());
        self.failure = Some(detail);
        Ok(())
    }

    /// Finish at a batch boundary; the checkpoint stays resumable.
    pub fn time_out(&mut self, reason: HaltReason) -> Result<(), MigrationError> {
        self.transition(HistoryStatus::TimedOut)?;
        self.halt_reason = Some(reason);
        self.error_summary = Some(match reason {
            HaltReason::Deadline => "soft deadline reached; resume to continue".to_string(),
            HaltReason::Cancelled => "cancelled; resume to continue".to_string(),
        });
        Ok(())
    }

    /// Mark as reverted by `rollback_id`.
    pub fn rolled_back(&mut self, rollback_id: impl Into<String>) -> Result<(), MigrationError> {
        self.transition(HistoryStatus::RolledBack)?;
        self.rollback_id = Some(rollback_id.into());
        Ok(())
    }

    /// Copy counters from a checkpoint.
    pub fn apply_counts(&mut self, checkpoint: &Checkpoint) {
        self.items_processed = checkpoint.items_processed;
        self.items_skipped = checkpoint.items_skipped;
        self.items_failed = checkpoint.items_failed;
        self.batches_committed = checkpoint.batches_committed;
        self.updated_at = current_timestamp();
    }

    /// Wall-clock duration in milliseconds, if the attempt started.
    pub fn duration_ms(&self) -> Option<u64> {
        let start = self.started_at?;
        let end = self.finished_at.unwrap_or_else(current_timestamp);
        Some(end.saturating_sub(start) / 1000)
    }

    /// Serialize to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, MigrationError> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|v| v.to_vec())
            .map_err(|e| MigrationError::Serialization(e.to_string()))
    }

    /// Deserialize from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MigrationError> {
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(bytes)
            .map_err(|e| MigrationError::Deserialization(e.to_string()))
    }
}

/// Which direction a checkpoint tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Archive, Serialize, Deserialize)]
pub enum CheckpointPhase {
    /// Forward data run.
    Forward,
    /// Rollback of the data part.
    Rollback,
}

impl CheckpointPhase {
    pub(crate) fn as_segment(self) -> &'static [u8] {
        match self {
            CheckpointPhase::Forward => b"forward",
            CheckpointPhase::Rollback => b"rollback",
        }
    }
}

impl std::fmt::Display for CheckpointPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckpointPhase::Forward => write!(f, "forward"),
            CheckpointPhase::Rollback => write!(f, "rollback"),
        }
    }
}

/// Durable progress marker of a data run.
///
/// Written in the same transaction as the batch it describes, so after a
/// crash it never claims uncommitted work and never misses committed work.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Migration id.
    pub migration_id: String,
    /// Attempt that last wrote the checkpoint.
    pub attempt: u32,
    /// Direction.
    pub phase: CheckpointPhase,
    /// Key of the last item in the contiguous committed prefix.
    pub cursor: Option<String>,
    /// Batches committed.
    pub batches_committed: u64,
    /// Items applied.
    pub items_processed: u64,
    /// Items skipped.
    pub items_skipped: u64,
    /// Items failed.
    pub items_failed: u64,
    /// Schema part of a hybrid unit committed.
    pub schema_committed: bool,
    /// Last update (microseconds since epoch).
    pub updated_at: u64,
}

impl Checkpoint {
    /// Create an empty checkpoint.
    pub fn new(migration_id: impl Into<String>, attempt: u32, phase: CheckpointPhase) -> Self {
        Self {
            migration_id: migration_id.into(),
            attempt,
            phase,
            cursor: None,
            batches_committed: 0,
            items_processed: 0,
            items_skipped: 0,
            items_failed: 0,
            schema_committed: false,
            updated_at: current_timestamp(),
        }
    }

    /// Total items accounted for.
    pub fn items_seen(&self) -> u64 {
        self.items_processed + self.items_skipped + self.items_failed
    }

    /// Advance past a committed range.
    pub fn absorb(&mut self, range: &SubRange) {
        self.cursor = Some(range.last_key.clone());
        self.batches_committed += 1;
        self.items_processed += range.processed;
        self.items_skipped += range.skipped;
        self.items_failed += range.failed;
        self.updated_at = current_timestamp();
    }

    /// Serialize to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, MigrationError> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|v| v.to_vec())
            .map_err(|e| MigrationError::Serialization(e.to_string()))
    }

    /// Deserialize from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MigrationError> {
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(bytes)
            .map_err(|e| MigrationError::Deserialization(e.to_string()))
    }
}

/// A key range committed by a worker ahead of the checkpoint cursor.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub struct SubRange {
    /// Exclusive lower bound.
    pub after: Option<String>,
    /// Inclusive upper bound.
    pub last_key: String,
    /// Items applied in the range.
    pub processed: u64,
    /// Items skipped.
    pub skipped: u64,
    /// Items failed.
    pub failed: u64,
}

impl SubRange {
    /// Returns `true` if `key` falls inside the range.
    pub fn contains(&self, key: &str) -> bool {
        let above = match &self.after {
            Some(after) => key > after.as_str(),
            None => true,
        };
        above && key <= self.last_key.as_str()
    }

    /// Serialize to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, MigrationError> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|v| v.to_vec())
            .map_err(|e| MigrationError::Serialization(e.to_string()))
    }

    /// Deserialize from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MigrationError> {
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(bytes)
            .map_err(|e| MigrationError::Deserialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::validation::Severity;

    fn record() -> HistoryRecord {
        HistoryRecord::new("add_embeddings", 1, MigrationKind::Data, "abc123")
    }

    #[test]
    fn test_record_serialization() {
        let mut record = record();
        record.start().unwrap();
        record.items_processed = 42;
        record.item_failures.push(ItemFailure::new("doc-1", "bad payload"));
        record
            .issues
            .push(ValidationIssue::new(Severity::Warning, "w", "careful"));
        record.time_out(HaltReason::Cancelled).unwrap();

        let bytes = record.to_bytes().unwrap();
        let restored = HistoryRecord::from_bytes(&bytes).unwrap();
        assert_eq!(restored, record);
        assert_eq!(restored.halt_reason, Some(HaltReason::Cancelled));
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut record = record();
        assert!(record.started_at.is_none());
        record.start().unwrap();
        assert!(record.started_at.is_some());
        record.succeed().unwrap();
        assert_eq!(record.status, HistoryStatus::Succeeded);
        assert!(record.finished_at.is_some());
        record.rolled_back("rb-1").unwrap();
        assert_eq!(record.status, HistoryStatus::RolledBack);
        assert_eq!(record.rollback_id.as_deref(), Some("rb-1"));
    }

    #[test]
    fn test_tolerated_failures_mark_with_errors() {
        let mut record = record();
        record.start().unwrap();
        record.items_failed = 3;
        record.succeed().unwrap();
        assert_eq!(record.status, HistoryStatus::SucceededWithErrors);
        assert!(record.status.is_applied());
    }

    #[test]
    fn test_invalid_transitions() {
        let mut record = record();
        assert!(matches!(
            record.transition(HistoryStatus::Succeeded),
            Err(MigrationError::InvalidTransition { .. })
        ));

        record.start().unwrap();
        record
            .fail("statement 0 failed", FailureDetail::Interrupted)
            .unwrap();

        // Nothing committed: nothing to roll back
        assert!(record.rolled_back("rb").is_err());

        record.work_committed = true;
        record.rolled_back("rb").unwrap();

        // Terminal states never go back to running
        assert!(record.start().is_err());
    }

    #[test]
    fn test_checkpoint_absorb() {
        let mut cp = Checkpoint::new("m", 1, CheckpointPhase::Forward);
        let range = SubRange {
            after: None,
            last_key: "doc-0999".into(),
            processed: 990,
            skipped: 5,
            failed: 5,
        };
        cp.absorb(&range);
        assert_eq!(cp.cursor.as_deref(), Some("doc-0999"));
        assert_eq!(cp.items_seen(), 1000);
        assert_eq!(cp.batches_committed, 1);

        let bytes = cp.to_bytes().unwrap();
        assert_eq!(Checkpoint::from_bytes(&bytes).unwrap(), cp);
    }

    #[test]
    fn test_sub_range_contains() {
        let range = SubRange {
            after: Some("b".into()),
            last_key: "d".into(),
            processed: 0,
            skipped: 0,
            failed: 0,
        };
        assert!(!range.contains("b"));
        assert!(range.contains("c"));
        assert!(range.contains("d"));
        assert!(!range.contains("e"));
    }
}
