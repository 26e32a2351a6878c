use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use super::*;
use crate::error::Error;
use crate::model::*;

const H: Ms = 3_600_000; // 1 hour in ms
const M: Ms = 60_000; // 1 minute in ms

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("cubicle_test_reservations");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn deadline() -> Instant {
    Instant::now() + Duration::from_secs(5)
}

fn booking(id: &str, resource: &str, start: Ms, end: Ms) -> ReservationRecord {
    ReservationRecord::confirmed(id, resource, "alice", Span::new(start, end))
}

#[tokio::test]
async fn create_and_list() {
    let store = ReservationStore::open(&test_wal_path("create_list.wal")).unwrap();
    let id = store
        .create_reservation(booking("b1", "R1", 10 * H, 11 * H), deadline())
        .await
        .unwrap();
    assert_eq!(id, "b1");

    let records = store.list_reservations("R1", deadline()).await.unwrap();
    assert_eq!(records, vec![booking("b1", "R1", 10 * H, 11 * H)]);
    assert!(store.list_reservations("R2", deadline()).await.unwrap().is_empty());
}

#[tokio::test]
async fn inverted_span_rejected_before_storage() {
    let store = ReservationStore::open(&test_wal_path("inverted.wal")).unwrap();
    let mut bad = booking("b1", "R1", 10 * H, 11 * H);
    bad.span = Span { start: 11 * H, end: 10 * H };
    assert!(matches!(
        store.create_reservation(bad, deadline()).await,
        Err(Error::Validation(_))
    ));
    assert_eq!(store.wal_appends_since_compact().await, 0);
    assert!(store.list_reservations("R1", deadline()).await.unwrap().is_empty());
}

#[tokio::test]
async fn overlap_rejected_back_to_back_allowed() {
    let store = ReservationStore::open(&test_wal_path("overlap.wal")).unwrap();
    store
        .create_reservation(booking("b1", "R1", 10 * H, 11 * H), deadline())
        .await
        .unwrap();

    let err = store
        .create_reservation(booking("b2", "R1", 10 * H + 30 * M, 12 * H), deadline())
        .await
        .unwrap_err();
    assert_eq!(err, Error::Conflict("b1".into()));

    store
        .create_reservation(booking("b3", "R1", 11 * H, 12 * H), deadline())
        .await
        .unwrap();
    // Other resources are independent.
    store
        .create_reservation(booking("b4", "R2", 10 * H, 11 * H), deadline())
        .await
        .unwrap();
}

#[tokio::test]
async fn duplicate_record_id_rejected_across_resources() {
    let store = ReservationStore::open(&test_wal_path("dup_id.wal")).unwrap();
    store
        .create_reservation(booking("b1", "R1", 10 * H, 11 * H), deadline())
        .await
        .unwrap();
    let err = store
        .create_reservation(booking("b1", "R2", 10 * H, 11 * H), deadline())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyExists(_)));
}

#[tokio::test]
async fn concurrent_overlapping_creates_one_wins() {
    let store = Arc::new(ReservationStore::open(&test_wal_path("race.wal")).unwrap());

    let mut handles = Vec::new();
    for i in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .create_reservation(
                    booking(&format!("b{i}"), "R1", 10 * H + i * M, 11 * H + i * M),
                    deadline(),
                )
                .await
        }));
    }

    let mut ok = 0;
    let mut conflicts = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(Error::Conflict(_)) => conflicts += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(conflicts, 7);
}

#[tokio::test]
async fn cancel_is_a_status_transition() {
    let store = ReservationStore::open(&test_wal_path("cancel.wal")).unwrap();
    store
        .create_reservation(booking("b1", "R1", 10 * H, 11 * H), deadline())
        .await
        .unwrap();

    assert!(store.cancel_reservation("b1", 5 * H, deadline()).await.unwrap());
    let record = store.get_reservation("b1", deadline()).await.unwrap();
    assert_eq!(record.status, ReservationStatus::Cancelled { at: 5 * H });

    // Second cancel has nothing to do.
    assert!(!store.cancel_reservation("b1", 6 * H, deadline()).await.unwrap());

    // The slot is free again.
    store
        .create_reservation(booking("b2", "R1", 10 * H, 11 * H), deadline())
        .await
        .unwrap();
}

#[tokio::test]
async fn cancel_unknown_is_not_an_error() {
    let store = ReservationStore::open(&test_wal_path("cancel_unknown.wal")).unwrap();
    assert!(!store.cancel_reservation("ghost", 0, deadline()).await.unwrap());
}

#[tokio::test]
async fn get_unknown_is_not_found() {
    let store = ReservationStore::open(&test_wal_path("get_unknown.wal")).unwrap();
    assert!(matches!(
        store.get_reservation("ghost", deadline()).await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn purge_only_touches_old_cancellations() {
    let store = ReservationStore::open(&test_wal_path("purge.wal")).unwrap();
    for (id, start) in [("old", 1), ("recent", 3), ("live", 5)] {
        store
            .create_reservation(booking(id, "R1", start * H, (start + 1) * H), deadline())
            .await
            .unwrap();
    }
    store.cancel_reservation("old", 100, deadline()).await.unwrap();
    store.cancel_reservation("recent", 900, deadline()).await.unwrap();

    let purgeable = store.collect_purgeable(500).await;
    assert_eq!(purgeable, vec!["old".to_string()]);
    assert!(store.purge("old", deadline()).await.unwrap());
    assert!(!store.purge("live", deadline()).await.unwrap());

    let ids: Vec<String> = store
        .list_reservations("R1", deadline())
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.record_id)
        .collect();
    assert_eq!(ids, vec!["recent", "live"]);
    assert!(matches!(
        store.get_reservation("old", deadline()).await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn replay_restores_records_and_statuses() {
    let path = test_wal_path("replay.wal");
    {
        let store = ReservationStore::open(&path).unwrap();
        store
            .create_reservation(booking("b1", "R1", 10 * H, 11 * H), deadline())
            .await
            .unwrap();
        store
            .create_reservation(booking("b2", "R1", 12 * H, 13 * H), deadline())
            .await
            .unwrap();
        store.cancel_reservation("b1", 7, deadline()).await.unwrap();
    }
    let store = ReservationStore::open(&path).unwrap();
    let records = store.list_reservations("R1", deadline()).await.unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].status, ReservationStatus::Cancelled { at: 7 });
    assert_eq!(records[1].status, ReservationStatus::Confirmed);
    // Overlap enforcement still sees the replayed state.
    assert!(matches!(
        store
            .create_reservation(booking("b3", "R1", 12 * H, 12 * H + M), deadline())
            .await,
        Err(Error::Conflict(_))
    ));
}

#[tokio::test]
async fn bookings_after_torn_tail_survive_next_restart() {
    use std::io::Write;

    let path = test_wal_path("torn_tail.wal");
    {
        let store = ReservationStore::open(&path).unwrap();
        store
            .create_reservation(booking("b1", "R1", 10 * H, 11 * H), deadline())
            .await
            .unwrap();
    }
    // Crash mid-frame: a length prefix with a short payload.
    {
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[40u8, 0, 0, 0, 1, 2]).unwrap();
    }
    {
        let store = ReservationStore::open(&path).unwrap();
        store
            .create_reservation(booking("b2", "R1", 12 * H, 13 * H), deadline())
            .await
            .unwrap();
    }
    let store = ReservationStore::open(&path).unwrap();
    let ids: Vec<String> = store
        .list_reservations("R1", deadline())
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.record_id)
        .collect();
    assert_eq!(ids, vec!["b1", "b2"]);
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compact.wal");
    {
        let store = ReservationStore::open(&path).unwrap();
        for i in 0..10 {
            let id = format!("b{i}");
            store
                .create_reservation(booking(&id, "R1", i * H, i * H + M), deadline())
                .await
                .unwrap();
            store.cancel_reservation(&id, 1, deadline()).await.unwrap();
            store.purge(&id, deadline()).await.unwrap();
        }
        store
            .create_reservation(booking("keep", "R1", 20 * H, 21 * H), deadline())
            .await
            .unwrap();
        assert_eq!(store.wal_appends_since_compact().await, 31);
        store.compact_wal().await.unwrap();
        assert_eq!(store.wal_appends_since_compact().await, 0);
    }
    let replayed = crate::wal::Wal::replay(&path).unwrap();
    assert_eq!(
        replayed,
        vec![Event::ReservationCreated {
            record: booking("keep", "R1", 20 * H, 21 * H)
        }]
    );
}

#[tokio::test]
async fn expired_deadline_reports_storage_timeout() {
    let store = ReservationStore::open(&test_wal_path("deadline.wal")).unwrap();
    store
        .create_reservation(booking("b1", "R1", 10 * H, 11 * H), deadline())
        .await
        .unwrap();

    // Hold the resource's read view so the writer has to wait.
    let snapshot = store.snapshot("R1", deadline()).await.unwrap();
    assert!(snapshot.is_some());
    let err = store
        .create_reservation(
            booking("b2", "R1", 12 * H, 13 * H),
            Instant::now() + Duration::from_millis(20),
        )
        .await
        .unwrap_err();
    assert_eq!(
        err,
        Error::DependencyTimeout {
            which: crate::error::Dependency::Storage
        }
    );
}
