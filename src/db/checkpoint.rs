//! Checkpoint modes and the replica acknowledgment gate
//!
//! Replicas publish the last position their destination confirmed into an
//! `AckRegistry` shared with the database monitor. Before a checkpoint that
//! throws away WAL history (RESTART or TRUNCATE) the monitor asks the registry
//! whether every active replica has reached the position being discarded.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::ShadowError;
use crate::pos::Pos;

/// Engine checkpoint modes, named after `PRAGMA wal_checkpoint(<MODE>)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckpointMode {
    /// Copy as many frames as possible without waiting on readers or writers.
    Passive,
    /// Wait for writers, then copy every frame. The WAL is kept.
    Full,
    /// Like FULL, then make the next writer restart the WAL from the beginning.
    Restart,
    /// Like RESTART, and shrink the WAL file to zero bytes.
    Truncate,
}

impl CheckpointMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointMode::Passive => "PASSIVE",
            CheckpointMode::Full => "FULL",
            CheckpointMode::Restart => "RESTART",
            CheckpointMode::Truncate => "TRUNCATE",
        }
    }

    /// Whether this mode can destroy WAL bytes that replicas have not shipped.
    pub fn discards_wal(&self) -> bool {
        matches!(self, CheckpointMode::Restart | CheckpointMode::Truncate)
    }
}

impl fmt::Display for CheckpointMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckpointMode {
    type Err = ShadowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PASSIVE" => Ok(CheckpointMode::Passive),
            "FULL" => Ok(CheckpointMode::Full),
            "RESTART" => Ok(CheckpointMode::Restart),
            "TRUNCATE" => Ok(CheckpointMode::Truncate),
            other => Err(ShadowError::Configuration(format!(
                "unknown checkpoint mode: {}",
                other
            ))),
        }
    }
}

/// Outcome of `PRAGMA wal_checkpoint`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointResult {
    pub mode: CheckpointMode,
    /// The engine could not finish because another connection held a lock.
    pub busy: bool,
    /// Frames in the WAL when the checkpoint ran.
    pub log_frames: i64,
    /// Frames copied back into the database file.
    pub checkpointed_frames: i64,
}

#[derive(Debug)]
struct AckEntry {
    name: String,
    pos: Option<Pos>,
}

/// Positions acknowledged by each active replica of one database.
///
/// Each replica owns one slot and is the only writer to it. The monitor only
/// reads.
#[derive(Debug, Default)]
pub struct AckRegistry {
    entries: RwLock<HashMap<u64, AckEntry>>,
    next_id: AtomicU64,
}

impl AckRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an active replica. The slot is released when the handle drops.
    pub fn register(self: &Arc<Self>, name: impl Into<String>) -> AckHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.write().insert(
            id,
            AckEntry {
                name: name.into(),
                pos: None,
            },
        );
        AckHandle {
            id,
            registry: Arc::clone(self),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Lowest acknowledged position across all replicas.
    ///
    /// Returns `None` when there are no replicas or when any replica has not
    /// acknowledged anything yet.
    pub fn min_acknowledged(&self) -> Option<Pos> {
        let entries = self.entries.read();
        let mut min: Option<Pos> = None;
        for entry in entries.values() {
            let pos = entry.pos.as_ref()?;
            if min.as_ref().map_or(true, |m| pos < m) {
                min = Some(pos.clone());
            }
        }
        min
    }

    /// Whether every replica has moved to `generation`.
    pub fn all_in_generation(&self, generation: &crate::pos::Generation) -> bool {
        self.entries
            .read()
            .values()
            .all(|e| e.pos.as_ref().map_or(false, |p| &p.generation == generation))
    }

    /// Check that every replica has acknowledged at least `target` within the
    /// same generation. Returns a description of the first laggard otherwise.
    pub fn check(&self, target: &Pos) -> Result<(), String> {
        let entries = self.entries.read();
        for entry in entries.values() {
            match &entry.pos {
                None => {
                    return Err(format!(
                        "replica {} has not acknowledged any position",
                        entry.name
                    ))
                }
                Some(pos) if pos.generation != target.generation || pos < target => {
                    return Err(format!(
                        "replica {} is at {}, checkpoint would discard up to {}",
                        entry.name, pos, target
                    ))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    fn publish(&self, id: u64, pos: Pos) {
        if let Some(entry) = self.entries.write().get_mut(&id) {
            entry.pos = Some(pos);
        }
    }

    fn remove(&self, id: u64) {
        self.entries.write().remove(&id);
    }
}

/// A replica's slot in the `AckRegistry`.
#[derive(Debug)]
pub struct AckHandle {
    id: u64,
    registry: Arc<AckRegistry>,
}

impl AckHandle {
    /// Record a position the destination has confirmed.
    pub fn publish(&self, pos: Pos) {
        self.registry.publish(self.id, pos);
    }

    /// Leave the gate for good. Later publishes are ignored.
    pub fn deactivate(&self) {
        self.registry.remove(self.id);
    }
}

impl Drop for AckHandle {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}
