#![forbid(unsafe_code)]

use doorkeep_contracts::access::{AccessPermission, BuildingId, CardId, RoomId};
use doorkeep_contracts::UnixTimeNs;
use doorkeep_storage::repo::EdgeStoreRepo;
use doorkeep_storage::{LocalStore, PermissionUpsertOutcome};

fn card() -> CardId {
    CardId::new("12-34-56-78").unwrap()
}

fn room() -> RoomId {
    RoomId::new("101").unwrap()
}

fn building() -> BuildingId {
    BuildingId::new("A").unwrap()
}

fn permission(building: Option<BuildingId>, blocked: bool, at: u64) -> AccessPermission {
    AccessPermission::v1(card(), room(), building, blocked, None, UnixTimeNs(at)).unwrap()
}

#[test]
fn at_perm_db_01_missing_key_reads_as_none() {
    let s = LocalStore::new_in_memory();
    let found = s
        .get_permission_row(&card(), &room(), Some(&building()))
        .unwrap();
    assert_eq!(found, None);
}

#[test]
fn at_perm_db_02_existing_key_updates_in_place() {
    let s = LocalStore::new_in_memory();
    assert_eq!(
        s.upsert_permission_row(permission(Some(building()), false, 10))
            .unwrap(),
        PermissionUpsertOutcome::Inserted
    );
    assert_eq!(
        s.upsert_permission_row(permission(Some(building()), true, 20))
            .unwrap(),
        PermissionUpsertOutcome::Updated
    );
    assert_eq!(s.permission_rows().unwrap().len(), 1);
    let row = s
        .get_permission_row(&card(), &room(), Some(&building()))
        .unwrap()
        .unwrap();
    assert!(row.blocked);
}

#[test]
fn at_perm_db_03_older_rows_do_not_overwrite_newer() {
    let s = LocalStore::new_in_memory();
    s.upsert_permission_row(permission(Some(building()), true, 20))
        .unwrap();
    assert_eq!(
        s.upsert_permission_row(permission(Some(building()), false, 10))
            .unwrap(),
        PermissionUpsertOutcome::Stale
    );
    assert_eq!(
        s.upsert_permission_row(permission(Some(building()), true, 20))
            .unwrap(),
        PermissionUpsertOutcome::Unchanged
    );
    let row = s
        .get_permission_row(&card(), &room(), Some(&building()))
        .unwrap()
        .unwrap();
    assert!(row.blocked);
}

#[test]
fn at_perm_db_04_building_agnostic_row_is_fallback() {
    let s = LocalStore::new_in_memory();
    s.upsert_permission_row(permission(None, true, 10)).unwrap();

    let row = s
        .get_permission_row(&card(), &room(), Some(&building()))
        .unwrap()
        .unwrap();
    assert!(row.blocked);
    assert_eq!(row.building, None);

    s.upsert_permission_row(permission(Some(building()), false, 11))
        .unwrap();
    let row = s
        .get_permission_row(&card(), &room(), Some(&building()))
        .unwrap()
        .unwrap();
    assert!(!row.blocked);
}

#[test]
fn at_perm_db_05_other_rooms_do_not_match() {
    let s = LocalStore::new_in_memory();
    s.upsert_permission_row(permission(None, false, 10)).unwrap();
    let other = RoomId::new("102").unwrap();
    assert_eq!(s.get_permission_row(&card(), &other, None).unwrap(), None);
}
