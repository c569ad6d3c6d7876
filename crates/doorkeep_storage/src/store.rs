#![forbid(unsafe_code)]

//! Journal-backed local store shared by the ingestion server and the sync
//! worker.
//!
//! Every mutation is appended to a JSONL journal and flushed with
//! `sync_data` before it is applied to the in-memory tables, all under one
//! mutex. A mutation that fails to reach disk leaves memory untouched and the
//! journal truncated back to its previous length, so callers observe each
//! operation as all-or-nothing. On open the journal is replayed; only
//! newline-terminated records count as committed.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use doorkeep_contracts::access::{
    AccessLogEntry, AccessLogEntryInput, AccessLogId, AccessPermission, BuildingId, CardId,
    PermissionKey, RoomId, SyncCursor,
};
use doorkeep_contracts::identity::DeviceIdentity;
use doorkeep_contracts::{ContractViolation, UnixTimeNs, Validate};
use tracing::{debug, info, warn};

pub const JOURNAL_SCHEMA_VERSION: u8 = 1;

/// Compaction runs at open once the journal holds this many more records than
/// the live state needs.
const COMPACT_SLACK_RECORDS: u64 = 1_024;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("journal i/o failed for '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("journal record encode failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("journal '{path}' corrupt at line {line}: {reason}")]
    CorruptJournal {
        path: PathBuf,
        line: usize,
        reason: String,
    },
    #[error("unsupported journal schema_version={version} at line {line}")]
    UnsupportedSchema { version: u8, line: usize },
    #[error("local store lock poisoned")]
    LockPoisoned,
    #[error(transparent)]
    ContractViolation(#[from] ContractViolation),
}

impl StorageError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionUpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
    /// The cached row is newer than the incoming one; nothing was written.
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OutboxCounters {
    pub total: u64,
    pub unsynced: u64,
    pub synced: u64,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
enum JournalOp {
    AppendLog {
        entry: AccessLogEntry,
    },
    MarkSynced {
        ids: Vec<AccessLogId>,
        synced_at: UnixTimeNs,
    },
    UpsertPermission {
        permission: AccessPermission,
    },
    SetCursor {
        cursor: SyncCursor,
    },
    SetIdentity {
        identity: DeviceIdentity,
    },
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct JournalRecord {
    schema_version: u8,
    op: JournalOp,
}

impl JournalRecord {
    fn v1(op: JournalOp) -> Self {
        Self {
            schema_version: JOURNAL_SCHEMA_VERSION,
            op,
        }
    }
}

#[derive(Debug)]
struct Journal {
    path: PathBuf,
    file: File,
    len: u64,
    records: u64,
}

impl Journal {
    fn append(&mut self, record: &JournalRecord) -> Result<(), StorageError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let write_result = self
            .file
            .write_all(&line)
            .and_then(|_| self.file.sync_data());
        if let Err(err) = write_result {
            // Drop whatever part of the record reached the file so the next
            // append starts on a clean line.
            if let Err(truncate_err) = self.file.set_len(self.len) {
                warn!(
                    path = %self.path.display(),
                    error = %truncate_err,
                    "failed to roll back partial journal write"
                );
            }
            return Err(StorageError::io(&self.path, err));
        }
        self.len = self.len.saturating_add(line.len() as u64);
        self.records = self.records.saturating_add(1);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct StoreState {
    permissions: BTreeMap<PermissionKey, AccessPermission>,
    logs: BTreeMap<AccessLogId, AccessLogEntry>,
    unsynced: BTreeSet<AccessLogId>,
    next_log_id: u64,
    cursor: Option<SyncCursor>,
    identity: Option<DeviceIdentity>,
    journal: Option<Journal>,
}

impl StoreState {
    fn commit(&mut self, op: JournalOp) -> Result<(), StorageError> {
        if let Some(journal) = self.journal.as_mut() {
            journal.append(&JournalRecord::v1(op.clone()))?;
        }
        self.apply(op);
        Ok(())
    }

    fn apply(&mut self, op: JournalOp) {
        match op {
            JournalOp::AppendLog { entry } => {
                self.next_log_id = self.next_log_id.max(entry.id.0.saturating_add(1));
                if entry.synced {
                    self.unsynced.remove(&entry.id);
                } else {
                    self.unsynced.insert(entry.id);
                }
                self.logs.insert(entry.id, entry);
            }
            JournalOp::MarkSynced { ids, synced_at } => {
                for id in ids {
                    if let Some(entry) = self.logs.get_mut(&id) {
                        if !entry.synced {
                            entry.synced = true;
                            entry.synced_at = Some(synced_at);
                        }
                    }
                    self.unsynced.remove(&id);
                }
            }
            JournalOp::UpsertPermission { permission } => {
                self.permissions.insert(permission.key(), permission);
            }
            JournalOp::SetCursor { cursor } => self.cursor = Some(cursor),
            JournalOp::SetIdentity { identity } => self.identity = Some(identity),
        }
    }

    fn live_record_count(&self) -> u64 {
        let singletons = self.cursor.is_some() as u64 + self.identity.is_some() as u64;
        self.permissions.len() as u64 + self.logs.len() as u64 + singletons
    }

    fn snapshot_ops(&self) -> Vec<JournalOp> {
        let mut ops = Vec::with_capacity(self.live_record_count() as usize);
        if let Some(identity) = self.identity.clone() {
            ops.push(JournalOp::SetIdentity { identity });
        }
        if let Some(cursor) = self.cursor.clone() {
            ops.push(JournalOp::SetCursor { cursor });
        }
        for permission in self.permissions.values() {
            ops.push(JournalOp::UpsertPermission {
                permission: permission.clone(),
            });
        }
        for entry in self.logs.values() {
            ops.push(JournalOp::AppendLog {
                entry: entry.clone(),
            });
        }
        ops
    }
}

/// The edge node's local durable store.
#[derive(Debug)]
pub struct LocalStore {
    state: Mutex<StoreState>,
}

impl LocalStore {
    /// Memory-only store. Nothing survives the process; intended for tests and
    /// tooling.
    pub fn new_in_memory() -> Self {
        Self {
            state: Mutex::new(StoreState {
                next_log_id: 1,
                ..StoreState::default()
            }),
        }
    }

    /// Opens (or creates) the journal at `path` and replays it.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| StorageError::io(parent, err))?;
        }
        let mut state = StoreState {
            next_log_id: 1,
            ..StoreState::default()
        };
        let (committed_len, records) = replay_journal(&path, &mut state)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|err| StorageError::io(&path, err))?;
        let on_disk_len = file
            .metadata()
            .map_err(|err| StorageError::io(&path, err))?
            .len();
        if on_disk_len > committed_len {
            warn!(
                path = %path.display(),
                dropped_bytes = on_disk_len - committed_len,
                "dropping torn journal tail"
            );
            file.set_len(committed_len)
                .and_then(|_| file.sync_data())
                .map_err(|err| StorageError::io(&path, err))?;
        }
        state.journal = Some(Journal {
            path: path.clone(),
            file,
            len: committed_len,
            records,
        });

        let store = Self {
            state: Mutex::new(state),
        };
        {
            let state = store.lock()?;
            info!(
                path = %path.display(),
                journal_records = records,
                permissions = state.permissions.len(),
                log_entries = state.logs.len(),
                unsynced = state.unsynced.len(),
                "local store opened"
            );
        }
        let needs_compaction = {
            let state = store.lock()?;
            records > state.live_record_count().saturating_mul(2) + COMPACT_SLACK_RECORDS
        };
        if needs_compaction {
            store.compact()?;
        }
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreState>, StorageError> {
        self.state.lock().map_err(|_| StorageError::LockPoisoned)
    }

    /// Cached permission for the key, falling back to the building-agnostic
    /// row for the same card and room. Never blocks on I/O.
    pub fn get_permission(
        &self,
        card_id: &CardId,
        room: &RoomId,
        building: Option<&BuildingId>,
    ) -> Result<Option<AccessPermission>, StorageError> {
        let state = self.lock()?;
        let key = PermissionKey::new(card_id.clone(), room.clone(), building.cloned());
        if let Some(found) = state.permissions.get(&key) {
            return Ok(Some(found.clone()));
        }
        if key.building.is_some() {
            return Ok(state.permissions.get(&key.without_building()).cloned());
        }
        Ok(None)
    }

    pub fn upsert_permission(
        &self,
        permission: AccessPermission,
    ) -> Result<PermissionUpsertOutcome, StorageError> {
        permission.validate()?;
        let mut state = self.lock()?;
        let outcome = match state.permissions.get(&permission.key()) {
            None => PermissionUpsertOutcome::Inserted,
            Some(existing) if existing.updated_at > permission.updated_at => {
                return Ok(PermissionUpsertOutcome::Stale)
            }
            Some(existing) if *existing == permission => {
                return Ok(PermissionUpsertOutcome::Unchanged)
            }
            Some(_) => PermissionUpsertOutcome::Updated,
        };
        state.commit(JournalOp::UpsertPermission { permission })?;
        Ok(outcome)
    }

    /// Appends an access event to the outbox. Once this returns `Ok` the entry
    /// is on disk.
    pub fn append_log_entry(&self, input: AccessLogEntryInput) -> Result<AccessLogId, StorageError> {
        let mut state = self.lock()?;
        let id = AccessLogId(state.next_log_id);
        let entry = AccessLogEntry::from_input(id, input);
        state.commit(JournalOp::AppendLog { entry })?;
        debug!(log_id = id.0, "access log entry appended");
        Ok(id)
    }

    /// Oldest-first unsynced entries, at most `limit`.
    pub fn next_unsynced_batch(&self, limit: usize) -> Result<Vec<AccessLogEntry>, StorageError> {
        let state = self.lock()?;
        Ok(state
            .unsynced
            .iter()
            .take(limit)
            .filter_map(|id| state.logs.get(id).cloned())
            .collect())
    }

    /// Marks entries as acknowledged by the cloud. Ids that are unknown or
    /// already synced are ignored. Returns how many entries changed state.
    pub fn mark_synced(
        &self,
        ids: &[AccessLogId],
        synced_at: UnixTimeNs,
    ) -> Result<usize, StorageError> {
        let mut state = self.lock()?;
        let pending: Vec<AccessLogId> = ids
            .iter()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .filter(|id| state.unsynced.contains(id))
            .collect();
        if pending.is_empty() {
            return Ok(0);
        }
        let count = pending.len();
        state.commit(JournalOp::MarkSynced {
            ids: pending,
            synced_at,
        })?;
        Ok(count)
    }

    pub fn get_cursor(&self) -> Result<Option<SyncCursor>, StorageError> {
        Ok(self.lock()?.cursor.clone())
    }

    pub fn set_cursor(&self, cursor: SyncCursor) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        if state.cursor.as_ref() == Some(&cursor) {
            return Ok(());
        }
        state.commit(JournalOp::SetCursor { cursor })
    }

    pub fn get_identity(&self) -> Result<Option<DeviceIdentity>, StorageError> {
        Ok(self.lock()?.identity.clone())
    }

    pub fn set_identity(&self, identity: DeviceIdentity) -> Result<(), StorageError> {
        identity.validate()?;
        let mut state = self.lock()?;
        if state.identity.as_ref() == Some(&identity) {
            return Ok(());
        }
        state.commit(JournalOp::SetIdentity { identity })
    }

    pub fn log_entry(&self, id: AccessLogId) -> Result<Option<AccessLogEntry>, StorageError> {
        Ok(self.lock()?.logs.get(&id).cloned())
    }

    pub fn log_entries(&self) -> Result<Vec<AccessLogEntry>, StorageError> {
        Ok(self.lock()?.logs.values().cloned().collect())
    }

    pub fn permission_rows(&self) -> Result<Vec<AccessPermission>, StorageError> {
        Ok(self.lock()?.permissions.values().cloned().collect())
    }

    pub fn outbox_counters(&self) -> Result<OutboxCounters, StorageError> {
        let state = self.lock()?;
        let total = state.logs.len() as u64;
        let unsynced = state.unsynced.len() as u64;
        Ok(OutboxCounters {
            total,
            unsynced,
            synced: total.saturating_sub(unsynced),
        })
    }

    /// Rewrites the journal as one record per live row. No-op for in-memory
    /// stores.
    pub fn compact(&self) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        let Some(path) = state.journal.as_ref().map(|j| j.path.clone()) else {
            return Ok(());
        };
        let ops = state.snapshot_ops();
        let tmp_path = compaction_tmp_path(&path);
        let mut len = 0u64;
        {
            let mut tmp = File::create(&tmp_path).map_err(|err| StorageError::io(&tmp_path, err))?;
            for op in &ops {
                let mut line = serde_json::to_vec(&JournalRecord::v1(op.clone()))?;
                line.push(b'\n');
                tmp.write_all(&line)
                    .map_err(|err| StorageError::io(&tmp_path, err))?;
                len = len.saturating_add(line.len() as u64);
            }
            tmp.sync_all()
                .map_err(|err| StorageError::io(&tmp_path, err))?;
        }
        fs::rename(&tmp_path, &path).map_err(|err| StorageError::io(&path, err))?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(err) = File::open(parent).and_then(|dir| dir.sync_all()) {
                debug!(path = %parent.display(), error = %err, "directory sync after compaction skipped");
            }
        }
        let file = OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(|err| StorageError::io(&path, err))?;
        let before = state.journal.as_ref().map(|j| j.records).unwrap_or(0);
        state.journal = Some(Journal {
            path: path.clone(),
            file,
            len,
            records: ops.len() as u64,
        });
        info!(
            path = %path.display(),
            records_before = before,
            records_after = ops.len(),
            "local store journal compacted"
        );
        Ok(())
    }
}

fn compaction_tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".compact");
    path.with_file_name(name)
}

/// Replays committed records into `state`. Returns the byte length of the
/// committed prefix and the number of records in it.
fn replay_journal(path: &Path, state: &mut StoreState) -> Result<(u64, u64), StorageError> {
    let mut raw = Vec::new();
    match File::open(path) {
        Ok(mut file) => {
            file.read_to_end(&mut raw)
                .map_err(|err| StorageError::io(path, err))?;
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok((0, 0)),
        Err(err) => return Err(StorageError::io(path, err)),
    }

    let mut offset = 0usize;
    let mut records = 0u64;
    let mut line_no = 0usize;
    while offset < raw.len() {
        line_no += 1;
        let Some(newline_at) = raw[offset..].iter().position(|b| *b == b'\n') else {
            // Unterminated tail: the write that produced it never completed.
            break;
        };
        let line = &raw[offset..offset + newline_at];
        offset += newline_at + 1;
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let record: JournalRecord = match serde_json::from_slice(line) {
            Ok(record) => record,
            Err(err) if offset >= raw.len() => {
                warn!(
                    path = %path.display(),
                    line = line_no,
                    error = %err,
                    "ignoring unreadable final journal record"
                );
                return Ok(((offset - newline_at - 1) as u64, records));
            }
            Err(err) => {
                return Err(StorageError::CorruptJournal {
                    path: path.to_path_buf(),
                    line: line_no,
                    reason: err.to_string(),
                })
            }
        };
        if record.schema_version != JOURNAL_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchema {
                version: record.schema_version,
                line: line_no,
            });
        }
        state.apply(record.op);
        records += 1;
    }
    Ok((offset as u64, records))
}

#[cfg(test)]
mod tests {
    use super::*;
    use doorkeep_contracts::access::{AccessDecision, DeviceId};

    fn input(card: &str, at: u64) -> AccessLogEntryInput {
        AccessLogEntryInput::v1(
            CardId::new(card).unwrap(),
            DeviceId::new("edge-1").unwrap(),
            RoomId::new("101").unwrap(),
            Some(BuildingId::new("A").unwrap()),
            AccessDecision::Denied,
            "unknown card".to_string(),
            UnixTimeNs(at),
        )
        .unwrap()
    }

    #[test]
    fn at_store_01_log_ids_are_monotonic() {
        let store = LocalStore::new_in_memory();
        let a = store.append_log_entry(input("1-2", 10)).unwrap();
        let b = store.append_log_entry(input("1-2", 11)).unwrap();
        assert_eq!(a, AccessLogId(1));
        assert_eq!(b, AccessLogId(2));
    }

    #[test]
    fn at_store_02_unterminated_tail_is_not_committed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.jsonl");
        {
            let store = LocalStore::open(&path).unwrap();
            store.append_log_entry(input("1-2", 10)).unwrap();
        }
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"schema_version\":1,\"op\":{\"append_log\"")
            .unwrap();
        drop(file);

        let store = LocalStore::open(&path).unwrap();
        assert_eq!(store.outbox_counters().unwrap().total, 1);
        let id = store.append_log_entry(input("3-4", 20)).unwrap();
        assert_eq!(id, AccessLogId(2));
        drop(store);

        let reopened = LocalStore::open(&path).unwrap();
        assert_eq!(reopened.outbox_counters().unwrap().total, 2);
    }

    #[test]
    fn at_store_03_corrupt_middle_record_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.jsonl");
        {
            let store = LocalStore::open(&path).unwrap();
            store.append_log_entry(input("1-2", 10)).unwrap();
        }
        let original = fs::read_to_string(&path).unwrap();
        fs::write(&path, format!("not-json\n{original}")).unwrap();
        let err = LocalStore::open(&path).unwrap_err();
        assert!(matches!(err, StorageError::CorruptJournal { line: 1, .. }));
    }

    #[test]
    fn at_store_04_unknown_schema_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.jsonl");
        fs::write(
            &path,
            "{\"schema_version\":9,\"op\":{\"set_cursor\":{\"cursor\":\"c\"}}}\n",
        )
        .unwrap();
        let err = LocalStore::open(&path).unwrap_err();
        assert!(matches!(
            err,
            StorageError::UnsupportedSchema {
                version: 9,
                line: 1
            }
        ));
    }

    #[test]
    fn at_store_05_compaction_preserves_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.jsonl");
        let store = LocalStore::open(&path).unwrap();
        let a = store.append_log_entry(input("1-2", 10)).unwrap();
        store.append_log_entry(input("3-4", 11)).unwrap();
        store.mark_synced(&[a], UnixTimeNs(50)).unwrap();
        for i in 0..5u64 {
            store
                .set_cursor(SyncCursor::new(format!("cursor-{i}")).unwrap())
                .unwrap();
        }
        store.compact().unwrap();
        let lines = fs::read_to_string(&path).unwrap().lines().count();
        assert_eq!(lines, 3);
        drop(store);

        let reopened = LocalStore::open(&path).unwrap();
        let counters = reopened.outbox_counters().unwrap();
        assert_eq!(counters.total, 2);
        assert_eq!(counters.unsynced, 1);
        assert_eq!(
            reopened.get_cursor().unwrap().unwrap().as_str(),
            "cursor-4"
        );
        assert_eq!(
            reopened.log_entry(a).unwrap().unwrap().synced_at,
            Some(UnixTimeNs(50))
        );
        let next = reopened.append_log_entry(input("5-6", 12)).unwrap();
        assert_eq!(next, AccessLogId(3));
    }
}
