//! Replica storage backends
//!
//! A `ReplicaClient` is the only thing the sync engine knows about a
//! destination. It stores opaque, already-encoded objects:
//! - snapshots, keyed by `(generation, index)`
//! - WAL segment parts, keyed by `(generation, index, offset)`, where `offset`
//!   is the byte offset of the part's first decoded byte within the segment
//!
//! Dropping any returned future cancels the operation. Implementations must
//! report a missing object as `ShadowError::NotFound` and keep other failures
//! as I/O errors so callers can tell the two apart.

pub mod file;

use std::fmt::Debug;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;

use crate::error::ShadowResult;
use crate::pos::{Generation, Pos};

pub use file::FileReplicaClient;

/// Boxed byte stream returned by readers.
pub type ByteReader = Box<dyn AsyncRead + Send + Unpin>;

/// A stored snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub generation: Generation,
    pub index: u64,
    /// Stored (encoded) size in bytes.
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

impl SnapshotInfo {
    /// Segment-granular position the snapshot is anchored at.
    pub fn pos(&self) -> Pos {
        Pos::new(self.generation.clone(), self.index, 0)
    }
}

/// One stored part of a WAL segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalSegmentInfo {
    pub generation: Generation,
    pub index: u64,
    pub offset: u64,
    /// Stored (encoded) size in bytes.
    pub size: u64,
    /// No further parts will be written to this segment.
    pub sealed: bool,
    pub created_at: DateTime<Utc>,
}

impl WalSegmentInfo {
    pub fn pos(&self) -> Pos {
        Pos::new(self.generation.clone(), self.index, self.offset)
    }
}

#[async_trait::async_trait]
pub trait ReplicaClient: Send + Sync + Debug {
    /// Backend name for logs, e.g. "file".
    fn kind(&self) -> &'static str;

    /// Generations present on the destination, oldest first.
    async fn generations(&self) -> ShadowResult<Vec<Generation>>;

    async fn delete_generation(&self, generation: &Generation) -> ShadowResult<()>;

    /// Snapshots of a generation, ordered by index.
    async fn snapshots(&self, generation: &Generation) -> ShadowResult<Vec<SnapshotInfo>>;

    async fn write_snapshot(
        &self,
        generation: &Generation,
        index: u64,
        data: Vec<u8>,
    ) -> ShadowResult<SnapshotInfo>;

    async fn snapshot_reader(&self, generation: &Generation, index: u64) -> ShadowResult<ByteReader>;

    async fn delete_snapshot(&self, generation: &Generation, index: u64) -> ShadowResult<()>;

    /// WAL segment parts of a generation, ordered by `(index, offset)`.
    async fn wal_segments(&self, generation: &Generation) -> ShadowResult<Vec<WalSegmentInfo>>;

    /// Store one part. A part already stored at the same position is
    /// replaced. Fails with `SegmentSealed` once the segment is sealed.
    async fn write_wal_segment(&self, pos: &Pos, data: Vec<u8>) -> ShadowResult<WalSegmentInfo>;

    async fn wal_segment_reader(&self, pos: &Pos) -> ShadowResult<ByteReader>;

    /// Mark a segment complete.
    async fn seal_wal_segment(&self, generation: &Generation, index: u64) -> ShadowResult<()>;

    async fn delete_wal_segments(&self, segments: &[WalSegmentInfo]) -> ShadowResult<()>;
}
