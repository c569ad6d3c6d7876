#![forbid(unsafe_code)]

use doorkeep_contracts::access::{
    AccessLogEntry, AccessLogEntryInput, AccessLogId, AccessPermission, BuildingId, CardId,
    RoomId, SyncCursor,
};
use doorkeep_contracts::identity::DeviceIdentity;
use doorkeep_contracts::UnixTimeNs;

use crate::store::{LocalStore, OutboxCounters, PermissionUpsertOutcome, StorageError};

/// Typed repository interface over the edge node's local durable store.
///
/// Every call is individually atomic and safe to issue concurrently from the
/// ingestion server and the sync worker.
pub trait EdgeStoreRepo: Send + Sync {
    fn get_permission_row(
        &self,
        card_id: &CardId,
        room: &RoomId,
        building: Option<&BuildingId>,
    ) -> Result<Option<AccessPermission>, StorageError>;
    fn upsert_permission_row(
        &self,
        permission: AccessPermission,
    ) -> Result<PermissionUpsertOutcome, StorageError>;

    fn append_log_row(&self, input: AccessLogEntryInput) -> Result<AccessLogId, StorageError>;
    fn next_unsynced_log_rows(&self, limit: usize) -> Result<Vec<AccessLogEntry>, StorageError>;
    fn mark_log_rows_synced(
        &self,
        ids: &[AccessLogId],
        synced_at: UnixTimeNs,
    ) -> Result<usize, StorageError>;
    fn outbox_counters(&self) -> Result<OutboxCounters, StorageError>;

    fn sync_cursor(&self) -> Result<Option<SyncCursor>, StorageError>;
    fn set_sync_cursor(&self, cursor: SyncCursor) -> Result<(), StorageError>;

    fn device_identity(&self) -> Result<Option<DeviceIdentity>, StorageError>;
    fn set_device_identity(&self, identity: DeviceIdentity) -> Result<(), StorageError>;
}

impl EdgeStoreRepo for LocalStore {
    fn get_permission_row(
        &self,
        card_id: &CardId,
        room: &RoomId,
        building: Option<&BuildingId>,
    ) -> Result<Option<AccessPermission>, StorageError> {
        self.get_permission(card_id, room, building)
    }

    fn upsert_permission_row(
        &self,
        permission: AccessPermission,
    ) -> Result<PermissionUpsertOutcome, StorageError> {
        self.upsert_permission(permission)
    }

    fn append_log_row(&self, input: AccessLogEntryInput) -> Result<AccessLogId, StorageError> {
        self.append_log_entry(input)
    }

    fn next_unsynced_log_rows(&self, limit: usize) -> Result<Vec<AccessLogEntry>, StorageError> {
        self.next_unsynced_batch(limit)
    }

    fn mark_log_rows_synced(
        &self,
        ids: &[AccessLogId],
        synced_at: UnixTimeNs,
    ) -> Result<usize, StorageError> {
        self.mark_synced(ids, synced_at)
    }

    fn outbox_counters(&self) -> Result<OutboxCounters, StorageError> {
        LocalStore::outbox_counters(self)
    }

    fn sync_cursor(&self) -> Result<Option<SyncCursor>, StorageError> {
        self.get_cursor()
    }

    fn set_sync_cursor(&self, cursor: SyncCursor) -> Result<(), StorageError> {
        self.set_cursor(cursor)
    }

    fn device_identity(&self) -> Result<Option<DeviceIdentity>, StorageError> {
        self.get_identity()
    }

    fn set_device_identity(&self, identity: DeviceIdentity) -> Result<(), StorageError> {
        self.set_identity(identity)
    }
}
