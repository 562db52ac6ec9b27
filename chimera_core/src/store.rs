//! The persisted store: targets, harvest logs and harvested records.
//!
//! The harvest worker only relies on per-operation atomicity. Each method
//! below is atomic on its own; nothing spans operations. A log line or
//! record is only ever written while its owning target exists, so
//! deleting a target never leaves orphans behind.

use crate::model::{
    HarvestedRecord, LogEntry, LogLevel, NewRecord, NewTarget, Target, TargetStatus,
};
use jiff::Timestamp;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::{abort, ConflictableTransactionResult, TransactionError};
use sled::Transactional;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

/// Persistence errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Target not found: {0}")]
    TargetNotFound(u64),

    #[error("Invalid status transition for target {id}: {from} -> {to}")]
    InvalidTransition {
        id: u64,
        from: TargetStatus,
        to: TargetStatus,
    },
}

/// Outcome of `update_target_status`.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    /// The target as stored after the update
    pub target: Target,
    /// Status before the update
    pub previous: TargetStatus,
}

impl StatusChange {
    /// False when the target already had the requested status.
    pub fn changed(&self) -> bool {
        self.previous != self.target.status
    }
}

/// Storage backend for the harvest simulation.
///
/// Implementations must be thread-safe: the harvest worker writes from its
/// background task while control and read operations arrive from callers.
pub trait HarvestStore: Send + Sync + 'static {
    /// Returns every target whose status is exactly `status`, in id order.
    fn list_targets_by_status(&self, status: TargetStatus) -> Result<Vec<Target>, StoreError>;

    /// Appends a line to a target's log trail.
    fn append_log(
        &self,
        target_id: u64,
        level: LogLevel,
        message: &str,
        at: Timestamp,
    ) -> Result<LogEntry, StoreError>;

    /// Persists a harvested record. The owning target must exist.
    fn insert_record(&self, record: NewRecord) -> Result<HarvestedRecord, StoreError>;

    /// Moves a target to `status`, stamping `last_run` when supplied.
    ///
    /// Fails with `InvalidTransition` if the current status may not move
    /// to `status`. Re-entering `stopped` or `processing` succeeds; check
    /// `StatusChange::changed` to tell that apart from a real move.
    fn update_target_status(
        &self,
        target_id: u64,
        status: TargetStatus,
        last_run: Option<Timestamp>,
    ) -> Result<StatusChange, StoreError>;

    /// Creates a new `pending` target.
    fn create_target(&self, target: NewTarget) -> Result<Target, StoreError>;

    fn get_target(&self, target_id: u64) -> Result<Target, StoreError>;

    /// Returns all targets in id order.
    fn list_targets(&self) -> Result<Vec<Target>, StoreError>;

    /// Removes a target together with its logs and records.
    ///
    /// Writes racing the delete either land before it and are swept, or
    /// fail with `TargetNotFound`.
    fn delete_target(&self, target_id: u64) -> Result<(), StoreError>;

    /// Returns a target's log trail, oldest first.
    fn logs_for_target(&self, target_id: u64) -> Result<Vec<LogEntry>, StoreError>;

    /// Returns the records attributed to one target, oldest first.
    fn records_for_target(&self, target_id: u64) -> Result<Vec<HarvestedRecord>, StoreError>;

    /// Returns all records, newest first.
    fn list_records(&self) -> Result<Vec<HarvestedRecord>, StoreError>;

    /// Flushes pending writes to durable storage.
    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }

    /// Inserts the demo targets if the store holds none.
    ///
    /// Returns the number of targets inserted.
    fn seed_defaults(&self) -> Result<usize, StoreError> {
        if !self.list_targets()?.is_empty() {
            return Ok(0);
        }
        debug!("Seeding default targets");
        self.create_target(NewTarget::targeted(
            "http://darkmarket.onion",
            "credit cards, dumps",
        ))?;
        let global = self.create_target(NewTarget::global("leaked credentials, database"))?;
        self.update_target_status(global.id, TargetStatus::Stopped, None)?;
        Ok(2)
    }
}

// ============================================================================
// SLED STORE
// ============================================================================

/// Sled-based persistent store.
///
/// Layout:
/// - `targets`: `id` → JSON `Target`
/// - `logs`: `(target_id, log_id)` → JSON `LogEntry`
/// - `records`: `(target_id, record_id)` → JSON `HarvestedRecord`
///
/// Keys are big-endian so a prefix scan on `target_id` walks one target's
/// trail in insertion order.
pub struct SledHarvestStore {
    db: sled::Db,
    targets: sled::Tree,
    logs: sled::Tree,
    records: sled::Tree,
}

impl SledHarvestStore {
    /// Open a persistent store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path).map_err(storage("Failed to open sled DB"))?;
        Self::with_db(db)
    }

    /// Create a temporary store (for tests and simulation runs)
    pub fn open_temp() -> Result<Self, StoreError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(storage("Failed to open temp DB"))?;
        Self::with_db(db)
    }

    fn with_db(db: sled::Db) -> Result<Self, StoreError> {
        let targets = db.open_tree("targets").map_err(storage("Open tree failed"))?;
        let logs = db.open_tree("harvest_logs").map_err(storage("Open tree failed"))?;
        let records = db.open_tree("harvested_data").map_err(storage("Open tree failed"))?;
        Ok(Self {
            db,
            targets,
            logs,
            records,
        })
    }

    fn next_id(&self) -> Result<u64, StoreError> {
        // sled ids start at 0; keep 0 free so ids read naturally
        self.db
            .generate_id()
            .map(|id| id + 1)
            .map_err(storage("Id generation failed"))
    }

    fn ensure_target(&self, target_id: u64) -> Result<(), StoreError> {
        let exists = self
            .targets
            .contains_key(id_key(target_id))
            .map_err(storage("Lookup failed"))?;
        if exists {
            Ok(())
        } else {
            Err(StoreError::TargetNotFound(target_id))
        }
    }

    /// Inserts into `children` in one transaction with the owner lookup.
    ///
    /// `delete_target` removes the owner transactionally too, so an insert
    /// either commits before the removal (and is swept) or sees no owner.
    fn insert_child<T: Serialize>(
        &self,
        children: &sled::Tree,
        target_id: u64,
        entry_id: u64,
        value: &T,
    ) -> Result<(), StoreError> {
        let owner = id_key(target_id);
        let key = entry_key(target_id, entry_id);
        let bytes = encode(value)?;
        (&self.targets, children)
            .transaction(|(targets, children)| -> ConflictableTransactionResult<(), StoreError> {
                if targets.get(owner)?.is_none() {
                    return abort(StoreError::TargetNotFound(target_id));
                }
                children.insert(&key[..], bytes.clone())?;
                Ok(())
            })
            .map_err(transaction_failed)
    }
}

impl HarvestStore for SledHarvestStore {
    fn list_targets_by_status(&self, status: TargetStatus) -> Result<Vec<Target>, StoreError> {
        Ok(self
            .list_targets()?
            .into_iter()
            .filter(|t| t.status == status)
            .collect())
    }

    fn append_log(
        &self,
        target_id: u64,
        level: LogLevel,
        message: &str,
        at: Timestamp,
    ) -> Result<LogEntry, StoreError> {
        let entry = LogEntry {
            id: self.next_id()?,
            target_id,
            timestamp: at,
            level,
            message: message.to_string(),
        };
        self.insert_child(&self.logs, target_id, entry.id, &entry)?;
        Ok(entry)
    }

    fn insert_record(&self, record: NewRecord) -> Result<HarvestedRecord, StoreError> {
        let record = record.into_record(self.next_id()?);
        self.insert_child(&self.records, record.target_id, record.id, &record)?;
        Ok(record)
    }

    fn update_target_status(
        &self,
        target_id: u64,
        status: TargetStatus,
        last_run: Option<Timestamp>,
    ) -> Result<StatusChange, StoreError> {
        let key = id_key(target_id);
        loop {
            let current = self
                .targets
                .get(key)
                .map_err(storage("Lookup failed"))?
                .ok_or(StoreError::TargetNotFound(target_id))?;
            let target: Target = decode(&current)?;
            let previous = target.status;

            if previous == status && last_run.is_none() && status.can_transition_to(status) {
                return Ok(StatusChange { target, previous });
            }
            if !previous.can_transition_to(status) {
                return Err(StoreError::InvalidTransition {
                    id: target_id,
                    from: target.status,
                    to: status,
                });
            }

            let updated = Target {
                status,
                last_run: last_run.or(target.last_run),
                ..target
            };
            let swapped = self
                .targets
                .compare_and_swap(key, Some(current), Some(encode(&updated)?))
                .map_err(storage("Compare-and-swap failed"))?;
            if swapped.is_ok() {
                return Ok(StatusChange {
                    target: updated,
                    previous,
                });
            }
            // Lost a race with another writer; re-read and re-check.
        }
    }

    fn create_target(&self, target: NewTarget) -> Result<Target, StoreError> {
        let target = Target {
            id: self.next_id()?,
            mode: target.mode,
            url: target.url,
            keywords: target.keywords,
            proxy_mode: target.proxy_mode,
            proxy_url: target.proxy_url,
            last_run: None,
            status: TargetStatus::Pending,
        };
        self.targets
            .insert(id_key(target.id), encode(&target)?)
            .map_err(storage("Insert failed"))?;
        Ok(target)
    }

    fn get_target(&self, target_id: u64) -> Result<Target, StoreError> {
        let raw = self
            .targets
            .get(id_key(target_id))
            .map_err(storage("Lookup failed"))?
            .ok_or(StoreError::TargetNotFound(target_id))?;
        decode(&raw)
    }

    fn list_targets(&self) -> Result<Vec<Target>, StoreError> {
        decode_all(self.targets.iter())
    }

    fn delete_target(&self, target_id: u64) -> Result<(), StoreError> {
        let owner = id_key(target_id);
        self.targets
            .transaction(|targets| -> ConflictableTransactionResult<(), StoreError> {
                match targets.remove(&owner[..])? {
                    Some(_) => Ok(()),
                    None => abort(StoreError::TargetNotFound(target_id)),
                }
            })
            .map_err(transaction_failed)?;
        // No new children can commit past this point.
        for tree in [&self.logs, &self.records] {
            for item in tree.scan_prefix(id_key(target_id)) {
                let (key, _) = item.map_err(storage("Iteration failed"))?;
                tree.remove(key).map_err(storage("Remove failed"))?;
            }
        }
        Ok(())
    }

    fn logs_for_target(&self, target_id: u64) -> Result<Vec<LogEntry>, StoreError> {
        self.ensure_target(target_id)?;
        decode_all(self.logs.scan_prefix(id_key(target_id)))
    }

    fn records_for_target(&self, target_id: u64) -> Result<Vec<HarvestedRecord>, StoreError> {
        self.ensure_target(target_id)?;
        decode_all(self.records.scan_prefix(id_key(target_id)))
    }

    fn list_records(&self) -> Result<Vec<HarvestedRecord>, StoreError> {
        let mut records: Vec<HarvestedRecord> = decode_all(self.records.iter())?;
        // Skip the trail of a target whose delete is still sweeping.
        records.retain(|r| self.ensure_target(r.target_id).is_ok());
        records.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(records)
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.db.flush().map_err(storage("Flush failed"))?;
        Ok(())
    }
}

fn id_key(id: u64) -> [u8; 8] {
    id.to_be_bytes()
}

fn entry_key(target_id: u64, entry_id: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&target_id.to_be_bytes());
    key[8..].copy_from_slice(&entry_id.to_be_bytes());
    key
}

fn storage(context: &'static str) -> impl Fn(sled::Error) -> StoreError {
    move |e| StoreError::Storage(format!("{}: {}", context, e))
}

fn transaction_failed(e: TransactionError<StoreError>) -> StoreError {
    match e {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => StoreError::Storage(format!("Transaction failed: {}", e)),
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode_all<T: DeserializeOwned>(iter: sled::Iter) -> Result<Vec<T>, StoreError> {
    iter.map(|item| {
        let (_, value) = item.map_err(storage("Iteration failed"))?;
        decode(&value)
    })
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn store() -> SledHarvestStore {
        SledHarvestStore::open_temp().unwrap()
    }

    fn record(target_id: u64, keyword: &str) -> NewRecord {
        NewRecord {
            target_id,
            url: "http://dark123.onion/post/7".into(),
            content_snippet: format!("Found sensitive data related to {keyword}."),
            matched_keywords: keyword.into(),
            timestamp: Timestamp::UNIX_EPOCH,
            video_url: None,
            video_title: None,
            tags: vec!["sensitive".into(), "leaked".into()],
        }
    }

    #[test]
    fn test_create_and_list_by_status() {
        let store = store();
        let a = store.create_target(NewTarget::targeted("http://a.onion", "x")).unwrap();
        let b = store.create_target(NewTarget::global("y")).unwrap();
        assert_eq!(a.status, TargetStatus::Pending);

        store
            .update_target_status(b.id, TargetStatus::Processing, None)
            .unwrap();

        let processing = store.list_targets_by_status(TargetStatus::Processing).unwrap();
        assert_eq!(processing.len(), 1);
        assert_eq!(processing[0].id, b.id);

        let pending = store.list_targets_by_status(TargetStatus::Pending).unwrap();
        assert_eq!(pending, vec![a]);
    }

    #[test]
    fn test_logs_are_scoped_and_ordered() {
        let store = store();
        let a = store.create_target(NewTarget::global("x")).unwrap();
        let b = store.create_target(NewTarget::global("y")).unwrap();

        store.append_log(a.id, LogLevel::Info, "first", Timestamp::UNIX_EPOCH).unwrap();
        store.append_log(b.id, LogLevel::Info, "other", Timestamp::UNIX_EPOCH).unwrap();
        store.append_log(a.id, LogLevel::Success, "second", Timestamp::UNIX_EPOCH).unwrap();

        let logs = store.logs_for_target(a.id).unwrap();
        let messages: Vec<_> = logs.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(messages, vec!["first", "second"]);
        assert_eq!(logs[1].level, LogLevel::Success);
    }

    #[test]
    fn test_writes_require_existing_target() {
        let store = store();
        let err = store
            .append_log(99, LogLevel::Info, "orphan", Timestamp::UNIX_EPOCH)
            .unwrap_err();
        assert!(matches!(err, StoreError::TargetNotFound(99)));

        let err = store.insert_record(record(99, "x")).unwrap_err();
        assert!(matches!(err, StoreError::TargetNotFound(99)));
        assert!(store.list_records().unwrap().is_empty());
    }

    #[test]
    fn test_records_newest_first() {
        let store = store();
        let t = store.create_target(NewTarget::global("a, b")).unwrap();
        let first = store.insert_record(record(t.id, "a")).unwrap();
        let second = store.insert_record(record(t.id, "b")).unwrap();

        let all = store.list_records().unwrap();
        assert_eq!(all, vec![second.clone(), first.clone()]);
        assert_eq!(store.records_for_target(t.id).unwrap(), vec![first, second]);
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let store = store();
        let t = store.create_target(NewTarget::global("x")).unwrap();
        store.update_target_status(t.id, TargetStatus::Stopped, None).unwrap();

        let err = store
            .update_target_status(t.id, TargetStatus::Completed, Some(Timestamp::UNIX_EPOCH))
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidTransition {
                from: TargetStatus::Stopped,
                to: TargetStatus::Completed,
                ..
            }
        ));
        let t = store.get_target(t.id).unwrap();
        assert_eq!(t.status, TargetStatus::Stopped);
        assert_eq!(t.last_run, None);
    }

    #[test]
    fn test_last_run_kept_when_not_supplied() {
        let store = store();
        let t = store.create_target(NewTarget::global("x")).unwrap();
        let stamp = Timestamp::from_second(1_700_000_000).unwrap();

        store
            .update_target_status(t.id, TargetStatus::Processing, Some(stamp))
            .unwrap();
        let change = store.update_target_status(t.id, TargetStatus::Stopped, None).unwrap();
        assert!(change.changed());
        assert_eq!(change.previous, TargetStatus::Processing);
        assert_eq!(change.target.last_run, Some(stamp));
    }

    #[test]
    fn test_reentering_status_is_idempotent() {
        let store = store();
        let t = store.create_target(NewTarget::global("x")).unwrap();
        store.update_target_status(t.id, TargetStatus::Stopped, None).unwrap();

        let again = store.update_target_status(t.id, TargetStatus::Stopped, None).unwrap();
        assert!(!again.changed());
        assert_eq!(again.target, store.get_target(t.id).unwrap());

        let first = Timestamp::from_second(1_700_000_000).unwrap();
        let second = Timestamp::from_second(1_700_000_060).unwrap();
        store
            .update_target_status(t.id, TargetStatus::Processing, Some(first))
            .unwrap();
        let rerun = store
            .update_target_status(t.id, TargetStatus::Processing, Some(second))
            .unwrap();
        assert!(!rerun.changed());
        assert_eq!(rerun.target.last_run, Some(second));
    }

    #[test]
    fn test_concurrent_stops_change_once() {
        let store = Arc::new(store());
        for _ in 0..50 {
            let t = store.create_target(NewTarget::global("x")).unwrap();
            store.update_target_status(t.id, TargetStatus::Processing, None).unwrap();

            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let store = Arc::clone(&store);
                    std::thread::spawn(move || {
                        store
                            .update_target_status(t.id, TargetStatus::Stopped, None)
                            .unwrap()
                            .changed()
                    })
                })
                .collect();
            let changed = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|c| *c)
                .count();
            assert_eq!(changed, 1);
        }
    }

    #[test]
    fn test_delete_cascades() {
        let store = store();
        let keep = store.create_target(NewTarget::global("k")).unwrap();
        let gone = store.create_target(NewTarget::global("g")).unwrap();
        store.append_log(gone.id, LogLevel::Info, "x", Timestamp::UNIX_EPOCH).unwrap();
        store.insert_record(record(gone.id, "g")).unwrap();
        store.insert_record(record(keep.id, "k")).unwrap();

        store.delete_target(gone.id).unwrap();

        assert!(matches!(store.get_target(gone.id), Err(StoreError::TargetNotFound(_))));
        assert!(matches!(store.delete_target(gone.id), Err(StoreError::TargetNotFound(_))));
        let remaining = store.list_records().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].target_id, keep.id);
    }

    #[test]
    fn test_delete_racing_writes_leaves_no_orphans() {
        let store = Arc::new(store());
        for _ in 0..100 {
            let target = store.create_target(NewTarget::global("race")).unwrap();
            let writer = {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    let at = Timestamp::UNIX_EPOCH;
                    while store.insert_record(record(target.id, "race")).is_ok()
                        && store.append_log(target.id, LogLevel::Info, "race", at).is_ok()
                    {}
                })
            };
            std::thread::yield_now();
            store.delete_target(target.id).unwrap();
            writer.join().unwrap();

            let prefix = id_key(target.id);
            assert_eq!(store.records.scan_prefix(prefix).count(), 0);
            assert_eq!(store.logs.scan_prefix(prefix).count(), 0);
        }
        assert!(store.list_records().unwrap().is_empty());
    }

    #[test]
    fn test_seed_defaults_only_once() {
        let store = store();
        assert_eq!(store.seed_defaults().unwrap(), 2);
        assert_eq!(store.seed_defaults().unwrap(), 0);

        let targets = store.list_targets().unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].keyword_list(), vec!["credit cards", "dumps"]);
        assert_eq!(targets[0].status, TargetStatus::Pending);
        assert_eq!(targets[1].url, None);
        assert_eq!(targets[1].status, TargetStatus::Stopped);
    }

    #[test]
    fn test_reopen_persists() {
        let dir = std::env::temp_dir().join(format!("chimera-store-{}", std::process::id()));
        let id = {
            let store = SledHarvestStore::open(&dir).unwrap();
            let t = store.create_target(NewTarget::global("durable")).unwrap();
            store.flush().unwrap();
            t.id
        };
        let store = SledHarvestStore::open(&dir).unwrap();
        assert_eq!(store.get_target(id).unwrap().keywords, "durable");
        drop(store);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
