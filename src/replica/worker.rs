//! Replica sync engine
//!
//! One `Replica` drives one destination for one database:
//! - On each tick, or as soon as the database position moves, ships the
//!   captured WAL bytes the destination does not have yet
//! - Takes a snapshot first whenever the database is on a generation the
//!   destination has not seen
//! - Publishes every confirmed position to the database's checkpoint gate
//! - Backs off exponentially on failure, keeping its acknowledged position

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::retention::{KeepAll, RetentionPolicy};
use super::snapshot::SnapshotManager;
use super::transport::{SegmentTransport, MAX_PART_SIZE};
use crate::client::{ReplicaClient, SnapshotInfo};
use crate::db::{AckHandle, Db};
use crate::error::{ShadowError, ShadowResult};
use crate::pos::{Generation, Pos};

#[derive(Debug, Clone)]
pub struct ReplicaOptions {
    pub sync_interval: Duration,
    /// Take a snapshot this often in addition to the one on every new
    /// generation.
    pub snapshot_interval: Option<Duration>,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    pub retention: Arc<dyn RetentionPolicy>,
}

impl Default for ReplicaOptions {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(1),
            snapshot_interval: None,
            min_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            retention: Arc::new(KeepAll),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReplicaState {
    Idle,
    Syncing,
    Backoff,
    /// Stopped for good after a configuration error.
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplicaStatus {
    pub state: ReplicaState,
    /// Last position the destination confirmed.
    pub pos: Option<Pos>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub last_sync_at: Option<DateTime<Utc>>,
}

impl Default for ReplicaStatus {
    fn default() -> Self {
        Self {
            state: ReplicaState::Idle,
            pos: None,
            consecutive_failures: 0,
            last_error: None,
            last_sync_at: None,
        }
    }
}

/// Delay before retry number `failures` (1-based): `min * 2^(failures-1)`,
/// capped at `max`.
pub fn backoff_delay(min: Duration, max: Duration, failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(31);
    min.saturating_mul(1u32 << exp).min(max)
}

pub struct Replica {
    name: String,
    db: Arc<Db>,
    client: Arc<dyn ReplicaClient>,
    transport: SegmentTransport,
    snapshots: SnapshotManager,
    options: ReplicaOptions,
    ack: AckHandle,
    sync_lock: Mutex<()>,
    status: RwLock<ReplicaStatus>,
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica")
            .field("name", &self.name)
            .field("client", &self.client.kind())
            .field("status", &*self.status.read())
            .finish()
    }
}

impl Replica {
    pub fn new(
        name: impl Into<String>,
        db: Arc<Db>,
        client: Arc<dyn ReplicaClient>,
        options: ReplicaOptions,
    ) -> Self {
        let name = name.into();
        let ack = db.register_replica(name.clone());
        Self {
            transport: SegmentTransport::new(Arc::clone(&client)),
            snapshots: SnapshotManager::new(Arc::clone(&client), Arc::clone(&options.retention)),
            name,
            db,
            client,
            options,
            ack,
            sync_lock: Mutex::new(()),
            status: RwLock::new(ReplicaStatus::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn db(&self) -> &Arc<Db> {
        &self.db
    }

    pub fn client(&self) -> &Arc<dyn ReplicaClient> {
        &self.client
    }

    pub fn transport(&self) -> &SegmentTransport {
        &self.transport
    }

    /// Last acknowledged position.
    pub fn pos(&self) -> Option<Pos> {
        self.status.read().pos.clone()
    }

    pub fn status(&self) -> ReplicaStatus {
        self.status.read().clone()
    }

    pub async fn generations(&self) -> ShadowResult<Vec<Generation>> {
        self.client.generations().await
    }

    /// Snapshot catalog, ordered by generation then index.
    pub async fn snapshots(&self) -> ShadowResult<Vec<SnapshotInfo>> {
        self.snapshots.snapshots().await
    }

    /// Take a snapshot now, between syncs.
    pub async fn snapshot(&self) -> ShadowResult<SnapshotInfo> {
        let _guard = self.sync_lock.lock().await;
        self.snapshots.snapshot(&self.db).await
    }

    /// Bring the destination up to the database's current position.
    ///
    /// A call made while another sync is running waits for that one and
    /// returns its outcome instead of starting a second pass.
    pub async fn sync(&self) -> ShadowResult<Pos> {
        let _guard = match self.sync_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                // Already syncing
                let _wait = self.sync_lock.lock().await;
                return self.coalesced_result();
            }
        };

        self.status.write().state = ReplicaState::Syncing;
        let result = self.sync_locked().await;

        let mut status = self.status.write();
        match &result {
            Ok(_) => {
                status.state = ReplicaState::Idle;
                status.consecutive_failures = 0;
                status.last_error = None;
                status.last_sync_at = Some(Utc::now());
            }
            Err(e) => {
                status.consecutive_failures += 1;
                status.last_error = Some(e.to_string());
                if e.is_fatal_for_replica() {
                    status.state = ReplicaState::Failed;
                    self.ack.deactivate();
                } else {
                    status.state = ReplicaState::Backoff;
                }
            }
        }
        result
    }

    /// Outcome of the sync a coalesced caller waited for.
    fn coalesced_result(&self) -> ShadowResult<Pos> {
        let status = self.status.read();
        if let Some(e) = &status.last_error {
            return Err(ShadowError::Internal(format!(
                "concurrent sync of replica {} failed: {}",
                self.name, e
            )));
        }
        status.pos.clone().ok_or(ShadowError::NoGeneration)
    }

    async fn sync_locked(&self) -> ShadowResult<Pos> {
        let dpos = self.db.pos();
        if dpos.is_zero() {
            debug!("Replica {}: database has no generation yet", self.name);
            return Ok(self.pos().unwrap_or_default());
        }

        let pos = match self.pos() {
            Some(pos) => Some(pos),
            None => self.load_pos(&dpos.generation).await?,
        };

        let reason = match &pos {
            None => Some("destination has no snapshot of this generation"),
            Some(p) if p.generation != dpos.generation => Some("generation is new to the destination"),
            Some(p) if !self.shadow_holds(p).await? => Some("WAL is no longer held locally"),
            Some(_) => None,
        };
        let mut pos = match (reason, pos) {
            (None, Some(pos)) => pos,
            (reason, _) => {
                info!(
                    "Replica {}: taking snapshot of generation {} ({})",
                    self.name,
                    dpos.generation,
                    reason.unwrap_or("no position")
                );
                self.restart_from_snapshot().await?
            }
        };
        let mut restarted = false;

        loop {
            let dpos = self.db.pos();
            if pos.generation != dpos.generation || pos >= dpos {
                break;
            }

            let limit = if pos.index == dpos.index {
                (dpos.offset - pos.offset).min(MAX_PART_SIZE as u64)
            } else {
                MAX_PART_SIZE as u64
            };
            let data = match self.read_shadow(&pos, limit).await {
                Ok(data) => data,
                // Pruned between the check above and the read.
                Err(e) if e.is_not_found() && !restarted => {
                    warn!("Replica {}: WAL at {} vanished locally: {}", self.name, pos, e);
                    restarted = true;
                    pos = self.restart_from_snapshot().await?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            if data.is_empty() {
                if pos.index < dpos.index {
                    self.transport.seal(&pos.generation, pos.index).await?;
                    debug!("Replica {}: sealed {}", self.name, pos.truncate());
                    pos = pos.next_index();
                    self.acknowledge(pos.clone());
                    continue;
                }
                break;
            }

            pos = self.transport.write(&pos, &data).await?;
            self.acknowledge(pos.clone());
        }

        debug!("Replica {}: synced to {}", self.name, pos);
        Ok(pos)
    }

    /// Snapshot the database and ship from the snapshot's position.
    async fn restart_from_snapshot(&self) -> ShadowResult<Pos> {
        let snapshot = self.snapshots.snapshot(&self.db).await?;
        let start = snapshot.pos();
        self.acknowledge(start.clone());
        Ok(start)
    }

    /// Whether the local shadow store still has the segment `pos` points into.
    async fn shadow_holds(&self, pos: &Pos) -> ShadowResult<bool> {
        let db = Arc::clone(&self.db);
        let generation = pos.generation.clone();
        let first = tokio::task::spawn_blocking(move || db.first_shadow_index(&generation)).await??;
        Ok(first.map_or(false, |first| first <= pos.index))
    }

    /// Rebuild the acknowledged position from the destination.
    async fn load_pos(&self, generation: &Generation) -> ShadowResult<Option<Pos>> {
        let snapshots = self.client.snapshots(generation).await?;
        let Some(latest) = snapshots.last() else {
            return Ok(None);
        };
        let pos = match self.transport.resume_pos(generation).await? {
            Some(pos) if pos >= latest.pos() => pos,
            _ => latest.pos(),
        };
        info!("Replica {}: resuming at {}", self.name, pos);
        self.acknowledge(pos.clone());
        Ok(Some(pos))
    }

    async fn read_shadow(&self, pos: &Pos, limit: u64) -> ShadowResult<Vec<u8>> {
        let db = Arc::clone(&self.db);
        let pos = pos.clone();
        tokio::task::spawn_blocking(move || {
            db.read_shadow(&pos.generation, pos.index, pos.offset, Some(limit))
        })
        .await?
    }

    fn acknowledge(&self, pos: Pos) {
        self.ack.publish(pos.clone());
        self.status.write().pos = Some(pos);
    }

    /// Background loop until `shutdown` fires. Stops early only on a
    /// configuration error.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.options.sync_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut pos_rx = self.db.subscribe();
        let mut snapshot_ticker = self.options.snapshot_interval.map(|every| {
            let mut t = tokio::time::interval_at(Instant::now() + every, every);
            t.set_missed_tick_behavior(MissedTickBehavior::Skip);
            t
        });

        info!(
            "Replica {}: replicating {} to {}",
            self.name,
            self.db.path().display(),
            self.client.kind()
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
                _ = pos_rx.changed() => {}
                _ = async {
                    match snapshot_ticker.as_mut() {
                        Some(t) => {
                            t.tick().await;
                        }
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    if let Err(e) = self.snapshot().await {
                        warn!("Replica {}: scheduled snapshot failed: {}", self.name, e);
                    }
                    continue;
                }
            }

            match self.sync().await {
                Ok(_) => {}
                Err(e) if e.is_fatal_for_replica() => {
                    error!("Replica {}: stopping: {}", self.name, e);
                    self.ack.deactivate();
                    break;
                }
                Err(e) => {
                    let failures = self.status.read().consecutive_failures;
                    let delay =
                        backoff_delay(self.options.min_backoff, self.options.max_backoff, failures);
                    warn!(
                        "Replica {}: sync failed (attempt {}), retrying in {:?}: {}",
                        self.name, failures, delay, e
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        debug!("Replica {}: loop stopped", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_delay() {
        let min = Duration::from_millis(100);
        let max = Duration::from_secs(2);
        assert_eq!(backoff_delay(min, max, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(min, max, 2), Duration::from_millis(200));
        assert_eq!(backoff_delay(min, max, 4), Duration::from_millis(800));
        assert_eq!(backoff_delay(min, max, 6), max);
        assert_eq!(backoff_delay(min, max, 500), max);
        assert_eq!(backoff_delay(min, max, 0), min);
    }

    #[test]
    fn test_status_default() {
        let status = ReplicaStatus::default();
        assert_eq!(status.state, ReplicaState::Idle);
        assert!(status.pos.is_none());
        assert_eq!(status.consecutive_failures, 0);
    }
}
