//! Durable migration history.
//!
//! All entries live in the metadata tree of the target store under a small
//! set of key namespaces:
//!
//! - `history:<id>\0<attempt>`: one [`HistoryRecord`] per attempt
//! - `checkpoint:<id>\0<phase>`: resumable [`Checkpoint`]
//! - `subrange:<id>\0<phase>\0<last key>`: ranges committed ahead of the cursor
//! - `lineage:<id>\0<collection>\0<key>`: items touched by a data run
//! - `failure:<id>\0<attempt>\0<key>`: tolerated item failures
//! - `snapshot:<id>`: snapshot marker taken when a data run starts
//! - `lock:<id>`: advisory lease
//! - `purge:<timestamp>\0<id>`: purge audit trail
//!
//! Writes that must be atomic with record mutations go through the
//! `stage_*` methods, which queue into a caller-owned [`Transaction`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::config::LockWait;
use super::error::{ConflictError, MigrationError};
use super::state::{Checkpoint, CheckpointPhase, HistoryRecord, ItemFailure, SubRange};
use crate::storage::key::{current_timestamp, decode_record_key, meta_key, meta_prefix, SEPARATOR};
use crate::storage::{StorageEngine, Transaction};
use parking_lot::Mutex;
use rkyv::{Archive, Deserialize, Serialize};

const HISTORY_NS: &[u8] = b"history:";
const CHECKPOINT_NS: &[u8] = b"checkpoint:";
const SUBRANGE_NS: &[u8] = b"subrange:";
const LINEAGE_NS: &[u8] = b"lineage:";
const FAILURE_NS: &[u8] = b"failure:";
const SNAPSHOT_NS: &[u8] = b"snapshot:";
const LOCK_NS: &[u8] = b"lock:";
const PURGE_NS: &[u8] = b"purge:";

static TOKEN_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a unique token for lock owners and rollback ids.
pub(crate) fn generate_token() -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&current_timestamp().to_be_bytes());
    hasher.update(&TOKEN_COUNTER.fetch_add(1, Ordering::Relaxed).to_be_bytes());
    hasher.update(&std::process::id().to_be_bytes());
    hex::encode(&hasher.finalize().as_bytes()[..8])
}

/// Value of an item before a data run first touched it.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum BeforeImage {
    /// Not recorded; the rollback strategy does not need it.
    NotCaptured,
    /// The item did not exist.
    Absent,
    /// The item's payload.
    Present(serde_json::Value),
}

/// An item touched by a data run.
#[derive(Debug, Clone, PartialEq)]
pub struct LineageEntry {
    /// Target collection.
    pub collection: String,
    /// Record key.
    pub key: String,
    /// Value before the first mutation.
    pub before: BeforeImage,
}

/// Marker recorded when a snapshot-backed data run starts.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub struct SnapshotMarker {
    /// Migration id.
    pub migration_id: String,
    /// Attempt that took the snapshot.
    pub attempt: u32,
    /// Covered collections.
    pub collections: Vec<String>,
    /// Content fingerprint of each collection, same order.
    pub fingerprints: Vec<String>,
    /// When it was taken (microseconds since epoch).
    pub created_at: u64,
}

/// Audit entry written by a purge.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub struct PurgeEntry {
    /// Purged migration.
    pub migration_id: String,
    /// Operator-supplied reason.
    pub reason: String,
    /// Attempts removed.
    pub attempts_removed: u32,
    /// When it happened (microseconds since epoch).
    pub purged_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
struct LockLease {
    owner: String,
    acquired_at: u64,
    expires_at: u64,
}

macro_rules! rkyv_codec {
    ($ty:ty) => {
        impl $ty {
            fn encode(&self) -> Result<Vec<u8>, MigrationError> {
                rkyv::to_bytes::<rkyv::rancor::Error>(self)
                    .map(|v| v.to_vec())
                    .map_err(|e| MigrationError::Serialization(e.to_string()))
            }

            fn decode(bytes: &[u8]) -> Result<Self, MigrationError> {
                rkyv::from_bytes::<Self, rkyv::rancor::Error>(bytes)
                    .map_err(|e| MigrationError::Deserialization(e.to_string()))
            }
        }
    };
}

rkyv_codec!(SnapshotMarker);
rkyv_codec!(PurgeEntry);
rkyv_codec!(LockLease);

/// Store for history records, checkpoints, lineage and locks.
#[derive(Clone)]
pub struct HistoryStore {
    engine: Arc<StorageEngine>,
}

impl HistoryStore {
    /// Create a store over the metadata tree of `engine`.
    pub fn new(engine: Arc<StorageEngine>) -> Self {
        Self { engine }
    }

    // ---- history records ----

    /// Persist a record immediately.
    pub fn save(&self, record: &HistoryRecord) -> Result<(), MigrationError> {
        if record.simulated {
            return Ok(());
        }
        self.engine
            .meta_insert(&record_key(&record.migration_id, record.attempt), record.to_bytes()?)?;
        Ok(())
    }

    /// Queue a record write into `tx`.
    pub fn stage(&self, tx: &mut Transaction<'_>, record: &HistoryRecord) -> Result<(), MigrationError> {
        tx.put_meta(record_key(&record.migration_id, record.attempt), record.to_bytes()?);
        Ok(())
    }

    /// Every attempt of a migration, oldest first.
    pub fn attempts(&self, migration_id: &str) -> Result<Vec<HistoryRecord>, MigrationError> {
        let prefix = meta_prefix(HISTORY_NS, migration_id.as_bytes());
        let mut records = Vec::new();
        for result in self.engine.meta_scan_prefix(&prefix) {
            let (_, value) = result?;
            records.push(HistoryRecord::from_bytes(&value)?);
        }
        Ok(records)
    }

    /// The most recent attempt.
    pub fn latest(&self, migration_id: &str) -> Result<Option<HistoryRecord>, MigrationError> {
        let prefix = meta_prefix(HISTORY_NS, migration_id.as_bytes());
        match self.engine.meta_tree().scan_prefix(&prefix).next_back() {
            Some(result) => {
                let (_, value) = result.map_err(crate::error::Error::from)?;
                Ok(Some(HistoryRecord::from_bytes(&value)?))
            }
            None => Ok(None),
        }
    }

    /// Latest record of every migration with history, ordered by id.
    pub fn list_latest(&self) -> Result<Vec<HistoryRecord>, MigrationError> {
        let mut latest: Vec<HistoryRecord> = Vec::new();
        for result in self.engine.meta_scan_prefix(HISTORY_NS) {
            let (_, value) = result?;
            let record = HistoryRecord::from_bytes(&value)?;
            match latest.last_mut() {
                Some(last) if last.migration_id == record.migration_id => *last = record,
                _ => latest.push(record),
            }
        }
        Ok(latest)
    }

    // ---- checkpoints ----

    /// Load the checkpoint of one phase.
    pub fn load_checkpoint(
        &self,
        migration_id: &str,
        phase: CheckpointPhase,
    ) -> Result<Option<Checkpoint>, MigrationError> {
        match self.engine.meta_get(&checkpoint_key(migration_id, phase))? {
            Some(bytes) => Ok(Some(Checkpoint::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Queue a checkpoint write.
    pub fn stage_checkpoint(
        &self,
        tx: &mut Transaction<'_>,
        checkpoint: &Checkpoint,
    ) -> Result<(), MigrationError> {
        tx.put_meta(
            checkpoint_key(&checkpoint.migration_id, checkpoint.phase),
            checkpoint.to_bytes()?,
        );
        Ok(())
    }

    /// Queue removal of a checkpoint and its pending sub-ranges.
    pub fn stage_clear_checkpoint(
        &self,
        tx: &mut Transaction<'_>,
        migration_id: &str,
        phase: CheckpointPhase,
    ) -> Result<(), MigrationError> {
        tx.delete_meta(checkpoint_key(migration_id, phase));
        for result in self.engine.meta_scan_prefix(&subrange_prefix(migration_id, phase)) {
            let (key, _) = result?;
            tx.delete_meta(key.to_vec());
        }
        Ok(())
    }

    /// Ranges committed ahead of the checkpoint cursor, in key order.
    pub fn load_sub_ranges(
        &self,
        migration_id: &str,
        phase: CheckpointPhase,
    ) -> Result<Vec<SubRange>, MigrationError> {
        let mut ranges = Vec::new();
        for result in self.engine.meta_scan_prefix(&subrange_prefix(migration_id, phase)) {
            let (_, value) = result?;
            ranges.push(SubRange::from_bytes(&value)?);
        }
        Ok(ranges)
    }

    /// Queue a sub-range write.
    pub fn stage_sub_range(
        &self,
        tx: &mut Transaction<'_>,
        migration_id: &str,
        phase: CheckpointPhase,
        range: &SubRange,
    ) -> Result<(), MigrationError> {
        tx.put_meta(subrange_key(migration_id, phase, &range.last_key), range.to_bytes()?);
        Ok(())
    }

    /// Queue a sub-range removal.
    pub fn stage_delete_sub_range(
        &self,
        tx: &mut Transaction<'_>,
        migration_id: &str,
        phase: CheckpointPhase,
        last_key: &str,
    ) {
        tx.delete_meta(subrange_key(migration_id, phase, last_key));
    }

    // ---- lineage ----

    /// Returns `true` if the item was already touched by the migration.
    pub fn lineage_contains(
        &self,
        migration_id: &str,
        collection: &str,
        key: &str,
    ) -> Result<bool, MigrationError> {
        Ok(self
            .engine
            .meta_get(&lineage_key(migration_id, collection, key))?
            .is_some())
    }

    /// Queue a lineage entry.
    pub fn stage_lineage(
        &self,
        tx: &mut Transaction<'_>,
        migration_id: &str,
        entry: &LineageEntry,
    ) -> Result<(), MigrationError> {
        let value = serde_json::to_vec(&entry.before)
            .map_err(|e| MigrationError::Serialization(e.to_string()))?;
        tx.put_meta(lineage_key(migration_id, &entry.collection, &entry.key), value);
        Ok(())
    }

    /// Queue removal of a lineage entry.
    pub fn stage_delete_lineage(
        &self,
        tx: &mut Transaction<'_>,
        migration_id: &str,
        collection: &str,
        key: &str,
    ) {
        tx.delete_meta(lineage_key(migration_id, collection, key));
    }

    /// Read up to `limit` lineage entries in key order.
    pub fn lineage_batch(
        &self,
        migration_id: &str,
        limit: usize,
    ) -> Result<Vec<LineageEntry>, MigrationError> {
        let prefix = meta_prefix(LINEAGE_NS, migration_id.as_bytes());
        let mut entries = Vec::new();
        for result in self.engine.meta_scan_prefix(&prefix).take(limit) {
            let (key, value) = result?;
            let (collection, item) = decode_record_key(&key[prefix.len()..]).ok_or_else(|| {
                MigrationError::Deserialization("malformed lineage key".to_string())
            })?;
            let before: BeforeImage = serde_json::from_slice(&value)
                .map_err(|e| MigrationError::Deserialization(e.to_string()))?;
            entries.push(LineageEntry {
                collection,
                key: item,
                before,
            });
        }
        Ok(entries)
    }

    /// Number of lineage entries.
    pub fn lineage_len(&self, migration_id: &str) -> Result<u64, MigrationError> {
        let prefix = meta_prefix(LINEAGE_NS, migration_id.as_bytes());
        let mut count = 0;
        for result in self.engine.meta_scan_prefix(&prefix) {
            result?;
            count += 1;
        }
        Ok(count)
    }

    // ---- item failures ----

    /// Queue an item failure.
    pub fn stage_failure(
        &self,
        tx: &mut Transaction<'_>,
        migration_id: &str,
        attempt: u32,
        failure: &ItemFailure,
    ) -> Result<(), MigrationError> {
        tx.put_meta(failure_key(migration_id, attempt, &failure.key), failure.to_bytes()?);
        Ok(())
    }

    /// Every recorded failure of one attempt, in key order.
    pub fn failures(
        &self,
        migration_id: &str,
        attempt: u32,
    ) -> Result<Vec<ItemFailure>, MigrationError> {
        let mut prefix = meta_key(FAILURE_NS, &[migration_id.as_bytes(), &attempt.to_be_bytes()]);
        prefix.push(SEPARATOR);
        let mut failures = Vec::new();
        for result in self.engine.meta_scan_prefix(&prefix) {
            let (_, value) = result?;
            failures.push(ItemFailure::from_bytes(&value)?);
        }
        Ok(failures)
    }

    // ---- snapshot markers ----

    /// Record a snapshot marker for `collections`.
    pub fn save_snapshot_marker(
        &self,
        migration_id: &str,
        attempt: u32,
        collections: &[String],
    ) -> Result<SnapshotMarker, MigrationError> {
        let mut fingerprints = Vec::with_capacity(collections.len());
        for collection in collections {
            fingerprints.push(self.engine.collection_fingerprint(collection)?);
        }
        let marker = SnapshotMarker {
            migration_id: migration_id.to_string(),
            attempt,
            collections: collections.to_vec(),
            fingerprints,
            created_at: current_timestamp(),
        };
        self.engine
            .meta_insert(&meta_key(SNAPSHOT_NS, &[migration_id.as_bytes()]), marker.encode()?)?;
        Ok(marker)
    }

    /// Load the snapshot marker.
    pub fn load_snapshot_marker(
        &self,
        migration_id: &str,
    ) -> Result<Option<SnapshotMarker>, MigrationError> {
        match self
            .engine
            .meta_get(&meta_key(SNAPSHOT_NS, &[migration_id.as_bytes()]))?
        {
            Some(bytes) => Ok(Some(SnapshotMarker::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Queue removal of the snapshot marker.
    pub fn stage_delete_snapshot_marker(&self, tx: &mut Transaction<'_>, migration_id: &str) {
        tx.delete_meta(meta_key(SNAPSHOT_NS, &[migration_id.as_bytes()]));
    }

    // ---- locks ----

    /// Acquire the advisory lease for a migration.
    ///
    /// A lease past its expiry is taken over, which is how a crashed holder
    /// stops blocking later runs.
    pub fn acquire_lock(
        &self,
        migration_id: &str,
        wait: &LockWait,
        lease: Duration,
    ) -> Result<LockGuard, MigrationError> {
        let key = meta_key(LOCK_NS, &[migration_id.as_bytes()]);
        let owner = generate_token();
        let lease_us = lease.as_micros() as u64;
        let started = Instant::now();

        loop {
            let now = current_timestamp();
            let mine = LockLease {
                owner: owner.clone(),
                acquired_at: now,
                expires_at: now.saturating_add(lease_us),
            }
            .encode()?;

            let expires_in_ms = match self.engine.meta_get(&key)? {
                None => {
                    if self.engine.meta_compare_and_swap(&key, None, Some(mine.clone()))? {
                        tracing::debug!(migration_id, owner = %owner, "lock acquired");
                        return Ok(LockGuard::new(self.engine.clone(), migration_id, key, owner, lease, mine));
                    }
                    continue;
                }
                Some(existing) => {
                    let held = LockLease::decode(&existing)?;
                    if held.expires_at <= now {
                        if self
                            .engine
                            .meta_compare_and_swap(&key, Some(&existing), Some(mine.clone()))?
                        {
                            tracing::warn!(
                                migration_id,
                                previous_owner = %held.owner,
                                expired_ms_ago = (now - held.expires_at) / 1000,
                                "took over expired lock"
                            );
                            return Ok(LockGuard::new(self.engine.clone(), migration_id, key, owner, lease, mine));
                        }
                        continue;
                    }
                    (held.expires_at - now) / 1000
                }
            };

            match wait {
                LockWait::Bounded {
                    timeout,
                    poll_interval,
                } if started.elapsed() < *timeout => {
                    let left = timeout.saturating_sub(started.elapsed());
                    std::thread::sleep((*poll_interval).min(left));
                }
                _ => {
                    return Err(ConflictError::Locked {
                        migration_id: migration_id.to_string(),
                        expires_in_ms,
                    }
                    .into());
                }
            }
        }
    }

    /// Returns `true` if a live (unexpired) lease exists.
    pub fn is_locked(&self, migration_id: &str) -> Result<bool, MigrationError> {
        match self
            .engine
            .meta_get(&meta_key(LOCK_NS, &[migration_id.as_bytes()]))?
        {
            Some(bytes) => Ok(LockLease::decode(&bytes)?.expires_at > current_timestamp()),
            None => Ok(false),
        }
    }

    // ---- purge ----

    /// Delete every history record and failure of a migration.
    ///
    /// Refused while the migration is locked or has a resumable checkpoint.
    /// Lineage and snapshot markers are removed too, which makes applied
    /// work permanent. An audit entry is always written.
    pub fn purge(&self, migration_id: &str, reason: &str) -> Result<u32, MigrationError> {
        let blocked = |reason: &str| -> MigrationError {
            ConflictError::PurgeBlocked {
                migration_id: migration_id.to_string(),
                reason: reason.to_string(),
            }
            .into()
        };
        if self.is_locked(migration_id)? {
            return Err(blocked("migration is locked by a running attempt"));
        }
        for phase in [CheckpointPhase::Forward, CheckpointPhase::Rollback] {
            if self.load_checkpoint(migration_id, phase)?.is_some() {
                return Err(blocked("a resumable checkpoint exists"));
            }
        }

        let mut tx = self.engine.begin();
        let mut attempts_removed = 0u32;
        let id = migration_id.as_bytes();
        for namespace in [HISTORY_NS, FAILURE_NS, LINEAGE_NS] {
            for result in self.engine.meta_scan_prefix(&meta_prefix(namespace, id)) {
                let (key, _) = result?;
                if namespace == HISTORY_NS {
                    attempts_removed += 1;
                }
                tx.delete_meta(key.to_vec());
            }
        }
        tx.delete_meta(meta_key(SNAPSHOT_NS, &[id]));

        let entry = PurgeEntry {
            migration_id: migration_id.to_string(),
            reason: reason.to_string(),
            attempts_removed,
            purged_at: current_timestamp(),
        };
        tx.put_meta(
            meta_key(PURGE_NS, &[&entry.purged_at.to_be_bytes(), id]),
            entry.encode()?,
        );
        tx.commit()?;

        tracing::warn!(migration_id, reason, attempts_removed, "history purged");
        Ok(attempts_removed)
    }

    /// Purge audit trail, oldest first.
    pub fn purge_log(&self) -> Result<Vec<PurgeEntry>, MigrationError> {
        let mut entries = Vec::new();
        for result in self.engine.meta_scan_prefix(PURGE_NS) {
            let (_, value) = result?;
            entries.push(PurgeEntry::decode(&value)?);
        }
        Ok(entries)
    }

    /// Flush pending writes to disk.
    pub fn flush(&self) -> Result<(), MigrationError> {
        self.engine.flush()?;
        Ok(())
    }
}

/// Held advisory lease. Released on drop.
pub struct LockGuard {
    engine: Arc<StorageEngine>,
    migration_id: String,
    key: Vec<u8>,
    owner: String,
    lease: Duration,
    current: Mutex<Vec<u8>>,
}

impl LockGuard {
    fn new(
        engine: Arc<StorageEngine>,
        migration_id: &str,
        key: Vec<u8>,
        owner: String,
        lease: Duration,
        current: Vec<u8>,
    ) -> Self {
        Self {
            engine,
            migration_id: migration_id.to_string(),
            key,
            owner,
            lease,
            current: Mutex::new(current),
        }
    }

    /// Owner token.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Migration the lease is held for.
    pub fn migration_id(&self) -> &str {
        &self.migration_id
    }

    /// Extend the lease. Fails if another run took it over.
    pub fn renew(&self) -> Result<(), MigrationError> {
        let mut current = self.current.lock();
        let now = current_timestamp();
        let next = LockLease {
            owner: self.owner.clone(),
            acquired_at: now,
            expires_at: now.saturating_add(self.lease.as_micros() as u64),
        }
        .encode()?;
        if !self
            .engine
            .meta_compare_and_swap(&self.key, Some(current.as_slice()), Some(next.clone()))?
        {
            return Err(ConflictError::LockLost {
                migration_id: self.migration_id.clone(),
            }
            .into());
        }
        *current = next;
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let current = self.current.lock();
        match self
            .engine
            .meta_compare_and_swap(&self.key, Some(current.as_slice()), None)
        {
            Ok(true) => tracing::debug!(migration_id = %self.migration_id, "lock released"),
            Ok(false) => tracing::warn!(
                migration_id = %self.migration_id,
                "lock was taken over before release"
            ),
            Err(e) => tracing::warn!(
                migration_id = %self.migration_id,
                error = %e,
                "failed to release lock"
            ),
        }
    }
}

fn record_key(migration_id: &str, attempt: u32) -> Vec<u8> {
    meta_key(HISTORY_NS, &[migration_id.as_bytes(), &attempt.to_be_bytes()])
}

fn checkpoint_key(migration_id: &str, phase: CheckpointPhase) -> Vec<u8> {
    meta_key(CHECKPOINT_NS, &[migration_id.as_bytes(), phase.as_segment()])
}

fn subrange_prefix(migration_id: &str, phase: CheckpointPhase) -> Vec<u8> {
    let mut key = meta_key(SUBRANGE_NS, &[migration_id.as_bytes(), phase.as_segment()]);
    key.push(SEPARATOR);
    key
}

fn subrange_key(migration_id: &str, phase: CheckpointPhase, last_key: &str) -> Vec<u8> {
    meta_key(
        SUBRANGE_NS,
        &[migration_id.as_bytes(), phase.as_segment(), last_key.as_bytes()],
    )
}

fn lineage_key(migration_id: &str, collection: &str, key: &str) -> Vec<u8> {
    meta_key(
        LINEAGE_NS,
        &[migration_id.as_bytes(), collection.as_bytes(), key.as_bytes()],
    )
}

fn failure_key(migration_id: &str, attempt: u32, key: &str) -> Vec<u8> {
    meta_key(
        FAILURE_NS,
        &[migration_id.as_bytes(), &attempt.to_be_bytes(), key.as_bytes()],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::unit::MigrationKind;
    use crate::storage::StorageConfig;

    fn store() -> HistoryStore {
        HistoryStore::new(Arc::new(
            StorageEngine::open(StorageConfig::temporary()).unwrap(),
        ))
    }

    fn record(id: &str, attempt: u32) -> HistoryRecord {
        HistoryRecord::new(id, attempt, MigrationKind::Schema, "sum")
    }

    #[test]
    fn test_attempts_and_latest() {
        let store = store();
        assert!(store.latest("m").unwrap().is_none());

        for attempt in 1..=3 {
            store.save(&record("m", attempt)).unwrap();
        }
        store.save(&record("m2", 1)).unwrap();

        assert_eq!(store.attempts("m").unwrap().len(), 3);
        assert_eq!(store.latest("m").unwrap().unwrap().attempt, 3);

        let latest = store.list_latest().unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].migration_id, "m");
        assert_eq!(latest[0].attempt, 3);
    }

    #[test]
    fn test_attempt_order_is_numeric() {
        let store = store();
        store.save(&record("m", 9)).unwrap();
        store.save(&record("m", 256)).unwrap();
        store.save(&record("m", 10)).unwrap();
        let attempts: Vec<u32> = store.attempts("m").unwrap().iter().map(|r| r.attempt).collect();
        assert_eq!(attempts, vec![9, 10, 256]);
    }

    #[test]
    fn test_simulated_records_are_not_saved() {
        let store = store();
        let mut rec = record("m", 1);
        rec.simulated = true;
        store.save(&rec).unwrap();
        assert!(store.latest("m").unwrap().is_none());
    }

    #[test]
    fn test_checkpoint_and_sub_ranges() {
        let store = store();
        let mut cp = Checkpoint::new("m", 1, CheckpointPhase::Forward);
        cp.cursor = Some("k-10".into());

        let mut tx = store.engine.begin();
        store.stage_checkpoint(&mut tx, &cp).unwrap();
        for last in ["k-20", "k-30"] {
            let range = SubRange {
                after: None,
                last_key: last.into(),
                processed: 10,
                skipped: 0,
                failed: 0,
            };
            store
                .stage_sub_range(&mut tx, "m", CheckpointPhase::Forward, &range)
                .unwrap();
        }
        tx.commit().unwrap();

        assert_eq!(store.load_checkpoint("m", CheckpointPhase::Forward).unwrap(), Some(cp));
        assert!(store.load_checkpoint("m", CheckpointPhase::Rollback).unwrap().is_none());
        assert_eq!(store.load_sub_ranges("m", CheckpointPhase::Forward).unwrap().len(), 2);

        let mut tx = store.engine.begin();
        store
            .stage_clear_checkpoint(&mut tx, "m", CheckpointPhase::Forward)
            .unwrap();
        tx.commit().unwrap();
        assert!(store.load_checkpoint("m", CheckpointPhase::Forward).unwrap().is_none());
        assert!(store.load_sub_ranges("m", CheckpointPhase::Forward).unwrap().is_empty());
    }

    #[test]
    fn test_lineage_round_trip() {
        let store = store();
        let mut tx = store.engine.begin();
        store
            .stage_lineage(
                &mut tx,
                "m",
                &LineageEntry {
                    collection: "documents".into(),
                    key: "doc-1".into(),
                    before: BeforeImage::Present(serde_json::json!({"title": "a"})),
                },
            )
            .unwrap();
        store
            .stage_lineage(
                &mut tx,
                "m",
                &LineageEntry {
                    collection: "documents".into(),
                    key: "doc-2".into(),
                    before: BeforeImage::Absent,
                },
            )
            .unwrap();
        tx.commit().unwrap();

        assert!(store.lineage_contains("m", "documents", "doc-1").unwrap());
        assert!(!store.lineage_contains("m2", "documents", "doc-1").unwrap());
        let batch = store.lineage_batch("m", 10).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[1].before, BeforeImage::Absent);
        assert_eq!(store.lineage_len("m").unwrap(), 2);
    }

    #[test]
    fn test_lock_fail_fast_and_release() {
        let store = store();
        let guard = store
            .acquire_lock("m", &LockWait::FailFast, Duration::from_secs(60))
            .unwrap();
        assert!(store.is_locked("m").unwrap());

        let err = store
            .acquire_lock("m", &LockWait::FailFast, Duration::from_secs(60))
            .err()
            .unwrap();
        assert!(matches!(err, MigrationError::Conflict(ConflictError::Locked { .. })));

        guard.renew().unwrap();
        drop(guard);
        assert!(!store.is_locked("m").unwrap());
        store
            .acquire_lock("m", &LockWait::FailFast, Duration::from_secs(60))
            .unwrap();
    }

    #[test]
    fn test_expired_lock_is_taken_over() {
        let store = store();
        let stale = store
            .acquire_lock("m", &LockWait::FailFast, Duration::from_millis(1))
            .unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert!(!store.is_locked("m").unwrap());

        let fresh = store
            .acquire_lock("m", &LockWait::FailFast, Duration::from_secs(60))
            .unwrap();
        assert!(matches!(
            stale.renew(),
            Err(MigrationError::Conflict(ConflictError::LockLost { .. }))
        ));

        // Dropping the stale guard must not release the new holder's lease
        drop(stale);
        assert!(store.is_locked("m").unwrap());
        drop(fresh);
    }

    #[test]
    fn test_bounded_wait_times_out() {
        let store = store();
        let _guard = store
            .acquire_lock("m", &LockWait::FailFast, Duration::from_secs(60))
            .unwrap();
        let wait = LockWait::Bounded {
            timeout: Duration::from_millis(30),
            poll_interval: Duration::from_millis(5),
        };
        let started = Instant::now();
        assert!(store.acquire_lock("m", &wait, Duration::from_secs(60)).is_err());
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_purge_is_audited() {
        let store = store();
        store.save(&record("m", 1)).unwrap();
        store.save(&record("m", 2)).unwrap();
        store.save(&record("other", 1)).unwrap();

        assert_eq!(store.purge("m", "reset test data").unwrap(), 2);
        assert!(store.attempts("m").unwrap().is_empty());
        assert_eq!(store.attempts("other").unwrap().len(), 1);

        let log = store.purge_log().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].reason, "reset test data");
        assert_eq!(log[0].attempts_removed, 2);
    }

    #[test]
    fn test_purge_blocked_by_checkpoint() {
        let store = store();
        store.save(&record("m", 1)).unwrap();
        let mut tx = store.engine.begin();
        store
            .stage_checkpoint(&mut tx, &Checkpoint::new("m", 1, CheckpointPhase::Forward))
            .unwrap();
        tx.commit().unwrap();

        assert!(matches!(
            store.purge("m", "x"),
            Err(MigrationError::Conflict(ConflictError::PurgeBlocked { .. }))
        ));
    }
}
