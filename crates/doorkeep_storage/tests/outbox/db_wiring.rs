#![forbid(unsafe_code)]

use std::sync::Arc;
use std::thread;

use doorkeep_contracts::access::{
    AccessDecision, AccessLogEntryInput, AccessLogId, BuildingId, CardId, DeviceId, RoomId,
};
use doorkeep_contracts::UnixTimeNs;
use doorkeep_storage::repo::EdgeStoreRepo;
use doorkeep_storage::LocalStore;

fn scan(card: &str, at: u64) -> AccessLogEntryInput {
    AccessLogEntryInput::v1(
        CardId::new(card).unwrap(),
        DeviceId::new("dbw_edge_1").unwrap(),
        RoomId::new("101").unwrap(),
        Some(BuildingId::new("A").unwrap()),
        AccessDecision::Admitted,
        "permission active".to_string(),
        UnixTimeNs(at),
    )
    .unwrap()
}

#[test]
fn at_outbox_db_01_append_creates_one_unsynced_row() {
    let s = LocalStore::new_in_memory();
    let id = s.append_log_row(scan("12-34-56-78", 10)).unwrap();

    let rows = s.next_unsynced_log_rows(10).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, id);
    assert!(!rows[0].synced);
    assert_eq!(rows[0].card_id.as_str(), "12-34-56-78");
    assert_eq!(s.outbox_counters().unwrap().total, 1);
}

#[test]
fn at_outbox_db_02_batches_are_oldest_first_and_bounded() {
    let s = LocalStore::new_in_memory();
    for i in 0..5u64 {
        s.append_log_row(scan("1-2", 100 + i)).unwrap();
    }
    let batch = s.next_unsynced_log_rows(3).unwrap();
    let ids: Vec<u64> = batch.iter().map(|e| e.id.0).collect();
    assert_eq!(ids, vec![1, 2, 3]);

    s.mark_log_rows_synced(&[AccessLogId(1), AccessLogId(2)], UnixTimeNs(500))
        .unwrap();
    let batch = s.next_unsynced_log_rows(3).unwrap();
    let ids: Vec<u64> = batch.iter().map(|e| e.id.0).collect();
    assert_eq!(ids, vec![3, 4, 5]);
}

#[test]
fn at_outbox_db_03_mark_synced_is_idempotent_and_permanent() {
    let s = LocalStore::new_in_memory();
    let id = s.append_log_row(scan("1-2", 10)).unwrap();

    assert_eq!(s.mark_log_rows_synced(&[id], UnixTimeNs(20)).unwrap(), 1);
    assert_eq!(s.mark_log_rows_synced(&[id], UnixTimeNs(30)).unwrap(), 0);
    assert_eq!(s.mark_log_rows_synced(&[id, id], UnixTimeNs(40)).unwrap(), 0);

    let row = s.log_entry(id).unwrap().unwrap();
    assert!(row.synced);
    assert_eq!(row.synced_at, Some(UnixTimeNs(20)));
    assert!(s.next_unsynced_log_rows(10).unwrap().is_empty());
}

#[test]
fn at_outbox_db_04_unknown_ids_are_ignored() {
    let s = LocalStore::new_in_memory();
    let id = s.append_log_row(scan("1-2", 10)).unwrap();
    let changed = s
        .mark_log_rows_synced(&[AccessLogId(999), id], UnixTimeNs(20))
        .unwrap();
    assert_eq!(changed, 1);
    assert_eq!(s.outbox_counters().unwrap().unsynced, 0);
}

#[test]
fn at_outbox_db_05_concurrent_writers_never_lose_or_duplicate_rows() {
    let s = Arc::new(LocalStore::new_in_memory());
    let appender = {
        let s = s.clone();
        thread::spawn(move || {
            for i in 0..200u64 {
                s.append_log_row(scan("1-2", i)).unwrap();
            }
        })
    };
    let syncer = {
        let s = s.clone();
        thread::spawn(move || {
            let mut acked = 0usize;
            for _ in 0..400 {
                let batch = s.next_unsynced_log_rows(16).unwrap();
                let ids: Vec<AccessLogId> = batch.iter().map(|e| e.id).collect();
                acked += s.mark_log_rows_synced(&ids, UnixTimeNs(1)).unwrap();
            }
            acked
        })
    };
    appender.join().unwrap();
    let acked = syncer.join().unwrap();
    let leftover = s.next_unsynced_log_rows(usize::MAX).unwrap();
    let ids: Vec<AccessLogId> = leftover.iter().map(|e| e.id).collect();
    let acked = acked + s.mark_log_rows_synced(&ids, UnixTimeNs(2)).unwrap();

    assert_eq!(acked, 200);
    let counters = s.outbox_counters().unwrap();
    assert_eq!(counters.total, 200);
    assert_eq!(counters.synced, 200);
    let all = s.log_entries().unwrap();
    let mut seen: Vec<u64> = all.iter().map(|e| e.id.0).collect();
    seen.dedup();
    assert_eq!(seen.len(), 200);
}
