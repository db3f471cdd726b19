//! Point-in-time restore tests

mod common;

use std::sync::Arc;

use common::*;
use walshadow::client::ReplicaClient;
use walshadow::{restore, CheckpointMode, RestoreOptions, ShadowError};

#[tokio::test]
async fn test_restore_latest_matches_source() {
    let t = open_test_db();
    let client = file_client(&t.tmp);
    let replica = new_replica(&t.db, client.clone());

    insert_rows(&t.conn, "a", 10);
    t.db.sync().unwrap();
    replica.sync().await.unwrap();
    insert_rows(&t.conn, "b", 10);
    t.db.sync().unwrap();
    let shipped = replica.sync().await.unwrap();

    let output = t.tmp.path().join("restored.db");
    let restored = restore(client.clone(), &RestoreOptions::new(&output)).await.unwrap();
    assert_eq!(restored, shipped);

    let rows = read_rows(&output);
    assert_eq!(rows.len(), 20);
    assert_eq!(rows, read_rows(&t.path));
}

#[tokio::test]
async fn test_restore_replays_multiple_segments() {
    let t = open_test_db();
    let client = file_client(&t.tmp);
    let replica = new_replica(&t.db, client.clone());

    insert_rows(&t.conn, "first", 5);
    t.db.sync().unwrap();
    let first = replica.sync().await.unwrap();

    t.db.checkpoint(CheckpointMode::Restart).unwrap();
    insert_rows(&t.conn, "second", 5);
    t.db.sync().unwrap();
    let second = replica.sync().await.unwrap();
    assert_eq!(second.index, first.index + 1);

    let output = t.tmp.path().join("latest.db");
    restore(client.clone(), &RestoreOptions::new(&output)).await.unwrap();
    assert_eq!(read_rows(&output), read_rows(&t.path));

    // Stop after the first segment.
    let output = t.tmp.path().join("early.db");
    let opts = RestoreOptions {
        index: Some(first.index),
        ..RestoreOptions::new(&output)
    };
    let restored = restore(client.clone(), &opts).await.unwrap();
    assert_eq!(restored.index, first.index);
    let rows = read_rows(&output);
    assert_eq!(rows.len(), 5);
    assert!(rows.iter().all(|(_, v)| v.starts_with("first-")));
}

#[tokio::test]
async fn test_restore_older_generation() {
    let t = open_test_db();
    let client = file_client(&t.tmp);
    let replica = new_replica(&t.db, client.clone());

    insert_rows(&t.conn, "old", 3);
    t.db.sync().unwrap();
    let old = replica.sync().await.unwrap();

    t.db.checkpoint(CheckpointMode::Truncate).unwrap();
    insert_rows(&t.conn, "new", 3);
    t.db.sync().unwrap();
    replica.sync().await.unwrap();

    let output = t.tmp.path().join("old.db");
    let opts = RestoreOptions {
        generation: Some(old.generation.clone()),
        ..RestoreOptions::new(&output)
    };
    let restored = restore(client.clone(), &opts).await.unwrap();
    assert_eq!(restored, old);
    assert_eq!(read_rows(&output).len(), 3);
}

#[tokio::test]
async fn test_restore_detects_corrupt_segment() {
    let t = open_test_db();
    let client = file_client(&t.tmp);
    let replica = new_replica(&t.db, client.clone());

    insert_rows(&t.conn, "a", 4);
    t.db.sync().unwrap();
    let pos = replica.sync().await.unwrap();

    let parts = client.wal_segments(&pos.generation).await.unwrap();
    let path = client.wal_segment_path(&parts[0].pos());
    let mut bytes = std::fs::read(&path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    std::fs::write(&path, bytes).unwrap();

    let output = t.tmp.path().join("corrupt.db");
    let err = restore(client.clone(), &RestoreOptions::new(&output))
        .await
        .unwrap_err();
    assert!(matches!(err, ShadowError::Corruption(_)), "got {:?}", err);
    assert!(!output.exists());
}

#[tokio::test]
async fn test_restore_refuses_existing_output_and_empty_replica() {
    let t = open_test_db();
    let client = file_client(&t.tmp);

    let output = t.tmp.path().join("out.db");
    let err = restore(client.clone(), &RestoreOptions::new(&output))
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    std::fs::write(&output, b"keep me").unwrap();
    let err = restore(Arc::clone(&client) as Arc<dyn ReplicaClient>, &RestoreOptions::new(&output))
        .await
        .unwrap_err();
    assert!(matches!(err, ShadowError::Restore(_)));
    assert_eq!(std::fs::read(&output).unwrap(), b"keep me");
}
