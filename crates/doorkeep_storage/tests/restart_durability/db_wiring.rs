#![forbid(unsafe_code)]

use doorkeep_contracts::access::{
    AccessDecision, AccessLogEntryInput, AccessPermission, CardId, DeviceId, RoomId, SyncCursor,
};
use doorkeep_contracts::identity::DeviceIdentity;
use doorkeep_contracts::UnixTimeNs;
use doorkeep_storage::repo::EdgeStoreRepo;
use doorkeep_storage::LocalStore;

fn scan(at: u64) -> AccessLogEntryInput {
    AccessLogEntryInput::v1(
        CardId::new("12-34-56-78").unwrap(),
        DeviceId::new("dbw_edge_1").unwrap(),
        RoomId::new("101").unwrap(),
        None,
        AccessDecision::Denied,
        "unknown card".to_string(),
        UnixTimeNs(at),
    )
    .unwrap()
}

#[test]
fn at_restart_db_01_unsynced_rows_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("edge/store.jsonl");

    let (a, b) = {
        let s = LocalStore::open(&path).unwrap();
        let a = s.append_log_row(scan(10)).unwrap();
        let b = s.append_log_row(scan(11)).unwrap();
        s.mark_log_rows_synced(&[a], UnixTimeNs(12)).unwrap();
        (a, b)
    };

    let s = LocalStore::open(&path).unwrap();
    let pending = s.next_unsynced_log_rows(10).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, b);
    assert!(s.log_entry(a).unwrap().unwrap().synced);
}

#[test]
fn at_restart_db_02_cursor_identity_and_permissions_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.jsonl");
    let identity = DeviceIdentity::from_raw("dbw_edge_1", "101", Some("A")).unwrap();
    let permission = AccessPermission::v1(
        CardId::new("12-34-56-78").unwrap(),
        RoomId::new("101").unwrap(),
        None,
        true,
        Some("lost".to_string()),
        UnixTimeNs(7),
    )
    .unwrap();

    {
        let s = LocalStore::open(&path).unwrap();
        s.set_device_identity(identity.clone()).unwrap();
        s.set_sync_cursor(SyncCursor::new("2026-01-01T00:00:00Z").unwrap())
            .unwrap();
        s.upsert_permission_row(permission.clone()).unwrap();
    }

    let s = LocalStore::open(&path).unwrap();
    assert_eq!(s.device_identity().unwrap(), Some(identity));
    assert_eq!(
        s.sync_cursor().unwrap().unwrap().as_str(),
        "2026-01-01T00:00:00Z"
    );
    assert_eq!(s.permission_rows().unwrap(), vec![permission]);
}

#[test]
fn at_restart_db_03_ids_continue_after_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.jsonl");
    {
        let s = LocalStore::open(&path).unwrap();
        s.append_log_row(scan(1)).unwrap();
        s.append_log_row(scan(2)).unwrap();
    }
    let s = LocalStore::open(&path).unwrap();
    let id = s.append_log_row(scan(3)).unwrap();
    assert_eq!(id.0, 3);
}
