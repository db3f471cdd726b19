//! Snapshot manager
//!
//! Takes full copies of the database file, stores them through the replica
//! client under the current segment-granular position, and applies the
//! retention policy afterwards.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use super::retention::RetentionPolicy;
use super::transport::{encode, read_object};
use crate::client::{ReplicaClient, SnapshotInfo};
use crate::db::Db;
use crate::error::ShadowResult;
use crate::pos::Generation;

#[derive(Debug, Clone)]
pub struct SnapshotManager {
    client: Arc<dyn ReplicaClient>,
    retention: Arc<dyn RetentionPolicy>,
}

impl SnapshotManager {
    pub fn new(client: Arc<dyn ReplicaClient>, retention: Arc<dyn RetentionPolicy>) -> Self {
        Self { client, retention }
    }

    /// Copy the database and store it at `db.pos().truncate()`.
    pub async fn snapshot(&self, db: &Arc<Db>) -> ShadowResult<SnapshotInfo> {
        let source = Arc::clone(db);
        let (pos, encoded) = tokio::task::spawn_blocking(move || {
            let (pos, image) = source.snapshot_image()?;
            Ok::<_, crate::error::ShadowError>((pos, encode(&image)))
        })
        .await??;

        let info = self
            .client
            .write_snapshot(&pos.generation, pos.index, encoded)
            .await?;
        info!(
            "SnapshotManager: stored snapshot of {} at {} ({} bytes)",
            db.path().display(),
            pos,
            info.size
        );

        if let Err(e) = self.enforce_retention().await {
            warn!("SnapshotManager: retention failed: {}", e);
        }
        Ok(info)
    }

    /// All snapshots, ordered by generation then index.
    pub async fn snapshots(&self) -> ShadowResult<Vec<SnapshotInfo>> {
        let mut all = Vec::new();
        for generation in self.client.generations().await? {
            all.extend(self.client.snapshots(&generation).await?);
        }
        Ok(all)
    }

    pub async fn snapshots_for(&self, generation: &Generation) -> ShadowResult<Vec<SnapshotInfo>> {
        self.client.snapshots(generation).await
    }

    /// Decoded database image of a stored snapshot.
    pub async fn read_snapshot(&self, snapshot: &SnapshotInfo) -> ShadowResult<Vec<u8>> {
        let reader = self
            .client
            .snapshot_reader(&snapshot.generation, snapshot.index)
            .await?;
        read_object(reader).await
    }

    /// Delete expired snapshots, generations left without snapshots, and WAL
    /// segments no remaining snapshot needs. Returns the number of snapshots
    /// deleted.
    pub async fn enforce_retention(&self) -> ShadowResult<usize> {
        let all = self.snapshots().await?;
        let Some(newest) = all.last().cloned() else {
            return Ok(0);
        };

        let mut deleted = 0;
        for snapshot in self.retention.expired(&all, Utc::now()) {
            if snapshot.generation == newest.generation && snapshot.index == newest.index {
                continue;
            }
            self.client
                .delete_snapshot(&snapshot.generation, snapshot.index)
                .await?;
            debug!(
                "SnapshotManager: deleted snapshot {}",
                snapshot.pos()
            );
            deleted += 1;
        }

        for generation in self.client.generations().await? {
            let remaining = self.client.snapshots(&generation).await?;
            match remaining.first() {
                None if generation < newest.generation => {
                    self.client.delete_generation(&generation).await?;
                    info!("SnapshotManager: deleted generation {}", generation);
                }
                None => {}
                Some(earliest) => {
                    let stale: Vec<_> = self
                        .client
                        .wal_segments(&generation)
                        .await?
                        .into_iter()
                        .filter(|s| s.index < earliest.index)
                        .collect();
                    if !stale.is_empty() {
                        self.client.delete_wal_segments(&stale).await?;
                        debug!(
                            "SnapshotManager: deleted {} WAL part(s) of {} below index {}",
                            stale.len(),
                            generation,
                            earliest.index
                        );
                    }
                }
            }
        }

        Ok(deleted)
    }
}
