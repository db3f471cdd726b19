//! Snapshot retention strategies
//!
//! A policy only decides which snapshots have expired. The snapshot manager
//! applies the decision and always keeps the newest snapshot of the newest
//! generation, whatever the policy says.

use std::fmt::Debug;

use chrono::{DateTime, Duration, Utc};

use crate::client::SnapshotInfo;

pub trait RetentionPolicy: Send + Sync + Debug {
    /// Snapshots to delete. `snapshots` is ordered oldest first.
    fn expired(&self, snapshots: &[SnapshotInfo], now: DateTime<Utc>) -> Vec<SnapshotInfo>;
}

/// Never delete anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeepAll;

impl RetentionPolicy for KeepAll {
    fn expired(&self, _snapshots: &[SnapshotInfo], _now: DateTime<Utc>) -> Vec<SnapshotInfo> {
        Vec::new()
    }
}

/// Keep the `n` most recent snapshots.
#[derive(Debug, Clone, Copy)]
pub struct KeepLast(pub usize);

impl RetentionPolicy for KeepLast {
    fn expired(&self, snapshots: &[SnapshotInfo], _now: DateTime<Utc>) -> Vec<SnapshotInfo> {
        let keep = self.0.max(1);
        if snapshots.len() <= keep {
            return Vec::new();
        }
        snapshots[..snapshots.len() - keep].to_vec()
    }
}

/// Delete snapshots older than the given age.
#[derive(Debug, Clone, Copy)]
pub struct MaxAge(pub Duration);

impl RetentionPolicy for MaxAge {
    fn expired(&self, snapshots: &[SnapshotInfo], now: DateTime<Utc>) -> Vec<SnapshotInfo> {
        snapshots
            .iter()
            .filter(|s| now - s.created_at > self.0)
            .cloned()
            .collect()
    }
}
