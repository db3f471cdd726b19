//! Segment transport
//!
//! Moves WAL byte ranges between the local shadow store and a replica client.
//! Every stored object uses the same envelope:
//!
//! ```text
//! [lz4 block, 4-byte LE size prefix][decoded length: u64 BE][crc32 of decoded bytes: u32 BE]
//! ```
//!
//! A segment is stored as one or more parts, each keyed by the offset of its
//! first byte, so an interrupted upload resumes at the end of the last stored
//! part instead of starting the segment over.

use std::sync::Arc;

use async_stream::try_stream;
use futures::{Stream, StreamExt};
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::client::{ReplicaClient, WalSegmentInfo};
use crate::error::{ShadowError, ShadowResult};
use crate::pos::{Generation, Pos};

/// Largest decoded part written in one call (16 MB).
pub const MAX_PART_SIZE: usize = 16 * 1024 * 1024;

const TRAILER_SIZE: usize = 12;

/// Compress and frame `data`.
pub fn encode(data: &[u8]) -> Vec<u8> {
    let mut out = lz4_flex::compress_prepend_size(data);
    out.extend_from_slice(&(data.len() as u64).to_be_bytes());
    out.extend_from_slice(&crc32fast::hash(data).to_be_bytes());
    out
}

/// Verify and decompress an object produced by `encode`.
pub fn decode(encoded: &[u8]) -> ShadowResult<Vec<u8>> {
    if encoded.len() < TRAILER_SIZE {
        return Err(ShadowError::Corruption(format!(
            "object too short for trailer: {} bytes",
            encoded.len()
        )));
    }
    let (body, trailer) = encoded.split_at(encoded.len() - TRAILER_SIZE);
    let mut len = [0u8; 8];
    len.copy_from_slice(&trailer[..8]);
    let expected_len = u64::from_be_bytes(len);
    let mut crc = [0u8; 4];
    crc.copy_from_slice(&trailer[8..]);
    let expected_crc = u32::from_be_bytes(crc);

    let data = lz4_flex::decompress_size_prepended(body)
        .map_err(|e| ShadowError::Corruption(format!("lz4 decode failed: {}", e)))?;
    if data.len() as u64 != expected_len {
        return Err(ShadowError::Corruption(format!(
            "length mismatch: trailer says {}, decoded {}",
            expected_len,
            data.len()
        )));
    }
    let actual_crc = crc32fast::hash(&data);
    if actual_crc != expected_crc {
        return Err(ShadowError::Corruption(format!(
            "checksum mismatch: expected {:08x}, got {:08x}",
            expected_crc, actual_crc
        )));
    }
    Ok(data)
}

/// Read a whole object from a reader and decode it.
pub async fn read_object(mut reader: crate::client::ByteReader) -> ShadowResult<Vec<u8>> {
    let mut encoded = Vec::new();
    reader.read_to_end(&mut encoded).await?;
    decode(&encoded)
}

#[derive(Debug, Clone)]
pub struct SegmentTransport {
    client: Arc<dyn ReplicaClient>,
}

impl SegmentTransport {
    pub fn new(client: Arc<dyn ReplicaClient>) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Arc<dyn ReplicaClient> {
        &self.client
    }

    /// Upload `data` as the part starting at `pos`. Returns the position just
    /// past it once the client has confirmed the write.
    pub async fn write(&self, pos: &Pos, data: &[u8]) -> ShadowResult<Pos> {
        if data.is_empty() {
            return Ok(pos.clone());
        }
        let encoded = encode(data);
        let stored = encoded.len();
        self.client.write_wal_segment(pos, encoded).await?;
        debug!(
            "SegmentTransport: wrote {} bytes ({} stored) at {}",
            data.len(),
            stored,
            pos
        );
        Ok(pos.advance(data.len() as u64))
    }

    pub async fn seal(&self, generation: &Generation, index: u64) -> ShadowResult<()> {
        self.client.seal_wal_segment(generation, index).await
    }

    /// Position just past the last stored byte of a generation, or `None` if
    /// no WAL has been stored for it.
    pub async fn resume_pos(&self, generation: &Generation) -> ShadowResult<Option<Pos>> {
        let parts = self.client.wal_segments(generation).await?;
        let Some(last) = parts.last() else {
            return Ok(None);
        };
        if last.sealed {
            return Ok(Some(Pos::new(generation.clone(), last.index + 1, 0)));
        }
        let reader = self.client.wal_segment_reader(&last.pos()).await?;
        let data = read_object(reader).await?;
        Ok(Some(last.pos().advance(data.len() as u64)))
    }

    /// Lazy stream over the decoded bytes of one segment, one item per part.
    ///
    /// Each part is checked against its trailer before it is yielded, and the
    /// parts must be contiguous from offset 0.
    pub fn read(
        &self,
        generation: &Generation,
        index: u64,
    ) -> impl Stream<Item = ShadowResult<Vec<u8>>> + Send + 'static {
        let client = Arc::clone(&self.client);
        let generation = generation.clone();
        try_stream! {
            let parts: Vec<WalSegmentInfo> = client
                .wal_segments(&generation)
                .await?
                .into_iter()
                .filter(|p| p.index == index)
                .collect();
            if parts.is_empty() {
                Err(ShadowError::NotFound(format!("WAL segment {}/{:016x}", generation, index)))?;
            }

            let mut expected = 0u64;
            for part in parts {
                if part.offset != expected {
                    Err(ShadowError::Corruption(format!(
                        "WAL segment {}/{:016x} has a gap at offset {} (next part at {})",
                        generation, index, expected, part.offset
                    )))?;
                }
                let reader = client.wal_segment_reader(&part.pos()).await?;
                let data = read_object(reader).await?;
                expected += data.len() as u64;
                yield data;
            }
        }
    }

    /// Collect a whole segment into memory.
    pub async fn read_segment(&self, generation: &Generation, index: u64) -> ShadowResult<Vec<u8>> {
        let mut out = Vec::new();
        let mut stream = Box::pin(self.read(generation, index));
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }

    /// Contiguous segment indexes stored for a generation, ascending.
    pub async fn indexes(&self, generation: &Generation) -> ShadowResult<Vec<u64>> {
        let mut indexes: Vec<u64> = self
            .client
            .wal_segments(generation)
            .await?
            .iter()
            .map(|p| p.index)
            .collect();
        indexes.dedup();
        Ok(indexes)
    }
}
