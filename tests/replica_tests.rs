//! Replica sync engine tests against a real SQLite database

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use walshadow::client::ReplicaClient;
use walshadow::{CheckpointMode, ReplicaState};

#[tokio::test]
async fn test_first_sync_ships_wal_verbatim() {
    let t = open_test_db();
    let pos = t.db.sync().unwrap();

    let client = file_client(&t.tmp);
    let replica = new_replica(&t.db, client.clone());
    let acked = replica.sync().await.unwrap();
    assert_eq!(acked, pos);

    assert_eq!(client.generations().await.unwrap(), vec![pos.generation.clone()]);
    let snapshots = client.snapshots(&pos.generation).await.unwrap();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].pos(), pos.truncate());

    let shipped = replica
        .transport()
        .read_segment(&pos.generation, 0)
        .await
        .unwrap();
    let wal = std::fs::read(t.db.wal_path()).unwrap();
    assert_eq!(shipped, wal);
}

#[tokio::test]
async fn test_snapshot_catalog_across_truncate_checkpoint() {
    let t = open_test_db();
    let client = file_client(&t.tmp);
    let replica = new_replica(&t.db, client.clone());

    t.db.sync().unwrap();
    replica.sync().await.unwrap();
    let pos0 = t.db.pos();
    let snapshot0 = replica.snapshot().await.unwrap();
    assert_eq!(snapshot0.pos(), pos0.truncate());

    insert_rows(&t.conn, "a", 1);
    t.db.sync().unwrap();
    replica.sync().await.unwrap();
    t.db.checkpoint(CheckpointMode::Truncate).unwrap();

    t.db.sync().unwrap();
    replica.sync().await.unwrap();
    let pos1 = t.db.pos();
    let snapshot1 = replica.snapshot().await.unwrap();
    assert_eq!(snapshot1.pos(), pos1.truncate());
    assert_ne!(pos0.generation, pos1.generation);

    let catalog: Vec<_> = replica
        .snapshots()
        .await
        .unwrap()
        .iter()
        .map(|s| s.pos())
        .collect();
    assert_eq!(catalog, vec![pos0.truncate(), pos1.truncate()]);

    // The old generation's WAL stays on the replica.
    assert!(!client.wal_segments(&pos0.generation).await.unwrap().is_empty());
    assert_eq!(
        client.generations().await.unwrap(),
        vec![pos0.generation.clone(), pos1.generation.clone()]
    );
}

#[tokio::test]
async fn test_shipped_bytes_match_local_segments() {
    let t = open_test_db();
    let client = file_client(&t.tmp);
    let replica = new_replica(&t.db, client.clone());

    for round in 0..5 {
        insert_rows(&t.conn, &format!("r{}", round), 3);
        t.db.sync().unwrap();
        replica.sync().await.unwrap();
    }

    let pos = t.db.pos();
    assert_eq!(replica.pos(), Some(pos.clone()));
    let shipped = replica
        .transport()
        .read_segment(&pos.generation, pos.index)
        .await
        .unwrap();
    let local = std::fs::read(t.db.shadow_segment_path(&pos.generation, pos.index)).unwrap();
    assert_eq!(shipped, local);
    assert_eq!(shipped.len() as u64, pos.offset);
}

#[tokio::test]
async fn test_restart_checkpoint_seals_previous_segment() {
    let t = open_test_db();
    let client = file_client(&t.tmp);
    let replica = new_replica(&t.db, client.clone());

    insert_rows(&t.conn, "before", 2);
    t.db.sync().unwrap();
    replica.sync().await.unwrap();
    let before = t.db.pos();

    t.db.checkpoint(CheckpointMode::Restart).unwrap();
    insert_rows(&t.conn, "after", 2);
    t.db.sync().unwrap();
    let after = replica.sync().await.unwrap();

    assert_eq!(after.generation, before.generation);
    assert_eq!(after.index, before.index + 1);

    let parts = client.wal_segments(&before.generation).await.unwrap();
    assert!(parts.iter().filter(|p| p.index == before.index).all(|p| p.sealed));
    assert!(parts.iter().any(|p| p.index == after.index && !p.sealed));
}

#[tokio::test]
async fn test_resume_does_not_reupload() {
    let t = open_test_db();
    let client = file_client(&t.tmp);

    insert_rows(&t.conn, "a", 5);
    t.db.sync().unwrap();
    let first = new_replica(&t.db, client.clone());
    let pos = first.sync().await.unwrap();
    drop(first);

    let parts_before = client.wal_segments(&pos.generation).await.unwrap();
    let second = new_replica(&t.db, client.clone());
    assert_eq!(second.sync().await.unwrap(), pos);

    assert_eq!(client.wal_segments(&pos.generation).await.unwrap(), parts_before);
    assert_eq!(client.snapshots(&pos.generation).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_failed_writes_do_not_advance_acknowledgment() {
    let t = open_test_db();
    let faulty = Arc::new(FaultyClient::new(file_client(&t.tmp)));
    let replica = new_replica(&t.db, faulty.clone());

    insert_rows(&t.conn, "a", 2);
    t.db.sync().unwrap();
    replica.sync().await.unwrap();
    let acked = replica.pos().unwrap();

    faulty.set_failing(true);
    insert_rows(&t.conn, "b", 2);
    t.db.sync().unwrap();
    assert!(replica.sync().await.is_err());
    assert!(replica.sync().await.is_err());

    let status = replica.status();
    assert_eq!(status.state, ReplicaState::Backoff);
    assert_eq!(status.consecutive_failures, 2);
    assert!(status.last_error.is_some());
    assert_eq!(replica.pos(), Some(acked));

    let refused = t.db.checkpoint(CheckpointMode::Truncate).unwrap_err();
    assert!(refused.is_checkpoint_refused());

    faulty.set_failing(false);
    let pos = replica.sync().await.unwrap();
    assert_eq!(pos, t.db.pos());
    let status = replica.status();
    assert_eq!(status.state, ReplicaState::Idle);
    assert_eq!(status.consecutive_failures, 0);
    assert!(status.last_sync_at.is_some());
}

#[tokio::test]
async fn test_overlapping_syncs_share_one_pass() {
    let t = open_test_db();
    let faulty = Arc::new(FaultyClient::new(file_client(&t.tmp)));
    let replica = new_replica(&t.db, faulty.clone());

    insert_rows(&t.conn, "a", 2);
    t.db.sync().unwrap();
    replica.sync().await.unwrap();
    let writes_before = faulty.wal_writes.load(Ordering::SeqCst);

    insert_rows(&t.conn, "b", 2);
    let target = t.db.sync().unwrap();
    faulty.set_write_delay(Duration::from_millis(100));
    let (first, second) = tokio::join!(replica.sync(), replica.sync());

    assert_eq!(first.unwrap(), target);
    assert_eq!(second.unwrap(), target);
    assert_eq!(faulty.wal_writes.load(Ordering::SeqCst) - writes_before, 1);
}

#[tokio::test]
async fn test_coalesced_sync_reports_failure_of_running_pass() {
    let t = open_test_db();
    let faulty = Arc::new(FaultyClient::new(file_client(&t.tmp)));
    faulty.set_failing(true);
    faulty.set_write_delay(Duration::from_millis(50));
    let replica = new_replica(&t.db, faulty.clone());

    insert_rows(&t.conn, "a", 2);
    t.db.sync().unwrap();
    let (first, second) = tokio::join!(replica.sync(), replica.sync());

    assert!(first.is_err());
    let err = second.unwrap_err();
    assert!(err.is_transient(), "got {:?}", err);
    assert!(replica.pos().is_none());
    assert_eq!(replica.status().consecutive_failures, 1);
    assert_eq!(faulty.failed_writes.load(Ordering::SeqCst), 1);
}
