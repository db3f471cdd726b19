//! Common test utilities for replication tests
//!
//! Provides shared helper functions for:
//! - Creating a WAL-mode SQLite database with a monitor attached
//! - Building file replicas, optionally with injected write failures
//! - Polling for background progress

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rusqlite::Connection;
use tempfile::TempDir;
use walshadow::client::{ByteReader, ReplicaClient, SnapshotInfo, WalSegmentInfo};
use walshadow::{Db, DbOptions, FileReplicaClient, Generation, Pos, Replica, ReplicaOptions, ShadowError, ShadowResult};

pub struct TestDb {
    pub tmp: TempDir,
    pub path: PathBuf,
    pub conn: Connection,
    pub db: Arc<Db>,
}

/// Create `app.db` in WAL mode with a table `t (id, v)` and a monitor for it.
pub fn open_test_db() -> TestDb {
    open_test_db_with(DbOptions::default())
}

pub fn open_test_db_with(options: DbOptions) -> TestDb {
    let tmp = TempDir::new().expect("Failed to create temp dir");
    let path = tmp.path().join("app.db");
    let conn = Connection::open(&path).expect("Failed to open database");
    let mode: String = conn
        .query_row("PRAGMA journal_mode = wal", [], |r| r.get(0))
        .unwrap();
    assert_eq!(mode, "wal");
    conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT NOT NULL)")
        .unwrap();
    let db = Arc::new(Db::new(&path, options));
    TestDb {
        tmp,
        path,
        conn,
        db,
    }
}

pub fn insert_rows(conn: &Connection, prefix: &str, n: usize) {
    for i in 0..n {
        conn.execute("INSERT INTO t (v) VALUES (?1)", [format!("{}-{}", prefix, i)])
            .unwrap();
    }
}

pub fn read_rows(path: &Path) -> Vec<(i64, String)> {
    let conn = Connection::open(path).unwrap();
    let mut stmt = conn.prepare("SELECT id, v FROM t ORDER BY id").unwrap();
    let rows = stmt
        .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    rows
}

pub fn file_client(tmp: &TempDir) -> Arc<FileReplicaClient> {
    Arc::new(FileReplicaClient::new(tmp.path().join("replica")))
}

pub fn new_replica(db: &Arc<Db>, client: Arc<dyn ReplicaClient>) -> Arc<Replica> {
    Arc::new(Replica::new(
        "test",
        Arc::clone(db),
        client,
        fast_replica_options(),
    ))
}

pub fn fast_replica_options() -> ReplicaOptions {
    ReplicaOptions {
        sync_interval: Duration::from_millis(20),
        min_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(50),
        ..ReplicaOptions::default()
    }
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn wait_for<F: Fn() -> bool>(timeout: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Replica client wrapper whose writes fail while `fail_writes` is set.
///
/// Failures are I/O errors unless `fatal` is set, in which case they are
/// configuration errors. Every write first sleeps `write_delay_ms`.
#[derive(Debug)]
pub struct FaultyClient {
    inner: Arc<dyn ReplicaClient>,
    pub fail_writes: AtomicBool,
    pub fatal: AtomicBool,
    pub write_delay_ms: AtomicU64,
    pub failed_writes: AtomicUsize,
    pub wal_writes: AtomicUsize,
}

impl FaultyClient {
    pub fn new(inner: Arc<dyn ReplicaClient>) -> Self {
        Self {
            inner,
            fail_writes: AtomicBool::new(false),
            fatal: AtomicBool::new(false),
            write_delay_ms: AtomicU64::new(0),
            failed_writes: AtomicUsize::new(0),
            wal_writes: AtomicUsize::new(0),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_writes.store(failing, Ordering::SeqCst);
    }

    /// Fail every write with a configuration error from now on.
    pub fn set_misconfigured(&self) {
        self.fatal.store(true, Ordering::SeqCst);
        self.set_failing(true);
    }

    pub fn set_write_delay(&self, delay: Duration) {
        self.write_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    async fn check(&self) -> ShadowResult<()> {
        let delay = self.write_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            self.failed_writes.fetch_add(1, Ordering::SeqCst);
            if self.fatal.load(Ordering::SeqCst) {
                return Err(ShadowError::Configuration(
                    "injected bad credentials".to_string(),
                ));
            }
            return Err(ShadowError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "injected failure",
            )));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ReplicaClient for FaultyClient {
    fn kind(&self) -> &'static str {
        "faulty"
    }

    async fn generations(&self) -> ShadowResult<Vec<Generation>> {
        self.inner.generations().await
    }

    async fn delete_generation(&self, generation: &Generation) -> ShadowResult<()> {
        self.inner.delete_generation(generation).await
    }

    async fn snapshots(&self, generation: &Generation) -> ShadowResult<Vec<SnapshotInfo>> {
        self.inner.snapshots(generation).await
    }

    async fn write_snapshot(
        &self,
        generation: &Generation,
        index: u64,
        data: Vec<u8>,
    ) -> ShadowResult<SnapshotInfo> {
        self.check().await?;
        self.inner.write_snapshot(generation, index, data).await
    }

    async fn snapshot_reader(&self, generation: &Generation, index: u64) -> ShadowResult<ByteReader> {
        self.inner.snapshot_reader(generation, index).await
    }

    async fn delete_snapshot(&self, generation: &Generation, index: u64) -> ShadowResult<()> {
        self.inner.delete_snapshot(generation, index).await
    }

    async fn wal_segments(&self, generation: &Generation) -> ShadowResult<Vec<WalSegmentInfo>> {
        self.inner.wal_segments(generation).await
    }

    async fn write_wal_segment(&self, pos: &Pos, data: Vec<u8>) -> ShadowResult<WalSegmentInfo> {
        self.check().await?;
        self.wal_writes.fetch_add(1, Ordering::SeqCst);
        self.inner.write_wal_segment(pos, data).await
    }

    async fn wal_segment_reader(&self, pos: &Pos) -> ShadowResult<ByteReader> {
        self.inner.wal_segment_reader(pos).await
    }

    async fn seal_wal_segment(&self, generation: &Generation, index: u64) -> ShadowResult<()> {
        self.check().await?;
        self.inner.seal_wal_segment(generation, index).await
    }

    async fn delete_wal_segments(&self, segments: &[WalSegmentInfo]) -> ShadowResult<()> {
        self.inner.delete_wal_segments(segments).await
    }
}
