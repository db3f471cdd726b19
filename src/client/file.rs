//! Local filesystem replica
//!
//! ```text
//! <root>/generations/<gen>/snapshots/<index>.snapshot.lz4
//! <root>/generations/<gen>/wal/<index>/<offset>.wal.lz4
//! <root>/generations/<gen>/wal/<index>/sealed
//! ```
//!
//! Index and offset are 16 hex digits. Objects are written to a temporary
//! name and renamed into place, so readers never see a partial object.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio::fs;
use tracing::debug;

use super::{ByteReader, ReplicaClient, SnapshotInfo, WalSegmentInfo};
use crate::error::{ShadowError, ShadowResult};
use crate::pos::{Generation, Pos};

const SNAPSHOT_EXT: &str = ".snapshot.lz4";
const WAL_EXT: &str = ".wal.lz4";
const SEALED_MARKER: &str = "sealed";

#[derive(Debug, Clone)]
pub struct FileReplicaClient {
    root: PathBuf,
}

impl FileReplicaClient {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn generations_dir(&self) -> PathBuf {
        self.root.join("generations")
    }

    fn generation_dir(&self, generation: &Generation) -> PathBuf {
        self.generations_dir().join(generation.as_str())
    }

    fn snapshots_dir(&self, generation: &Generation) -> PathBuf {
        self.generation_dir(generation).join("snapshots")
    }

    pub fn snapshot_path(&self, generation: &Generation, index: u64) -> PathBuf {
        self.snapshots_dir(generation)
            .join(format!("{:016x}{}", index, SNAPSHOT_EXT))
    }

    fn segment_dir(&self, generation: &Generation, index: u64) -> PathBuf {
        self.generation_dir(generation)
            .join("wal")
            .join(format!("{:016x}", index))
    }

    pub fn wal_segment_path(&self, pos: &Pos) -> PathBuf {
        self.segment_dir(&pos.generation, pos.index)
            .join(format!("{:016x}{}", pos.offset, WAL_EXT))
    }

    async fn is_sealed(&self, generation: &Generation, index: u64) -> ShadowResult<bool> {
        match fs::metadata(self.segment_dir(generation, index).join(SEALED_MARKER)).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn open(&self, path: &Path, what: String) -> ShadowResult<ByteReader> {
        match fs::File::open(path).await {
            Ok(f) => Ok(Box::new(f)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(ShadowError::NotFound(what)),
            Err(e) => Err(e.into()),
        }
    }
}

/// Write `data` to `path` through a temporary file and a rename.
async fn write_atomic(path: &Path, data: &[u8]) -> ShadowResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let tmp = PathBuf::from(format!("{}.tmp", path.display()));
    fs::write(&tmp, data).await?;
    let file = fs::File::open(&tmp).await?;
    file.sync_all().await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

async fn read_dir_names(dir: &Path) -> ShadowResult<Vec<String>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(e) => e,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    Ok(names)
}

fn parse_hex_name(name: &str, ext: &str) -> Option<u64> {
    let hex = name.strip_suffix(ext)?;
    if hex.len() != 16 {
        return None;
    }
    u64::from_str_radix(hex, 16).ok()
}

async fn file_stat(path: &Path) -> ShadowResult<(u64, DateTime<Utc>)> {
    let meta = fs::metadata(path).await?;
    let created_at = meta
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());
    Ok((meta.len(), created_at))
}

async fn remove_if_exists(path: &Path) -> ShadowResult<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait::async_trait]
impl ReplicaClient for FileReplicaClient {
    fn kind(&self) -> &'static str {
        "file"
    }

    async fn generations(&self) -> ShadowResult<Vec<Generation>> {
        let mut generations: Vec<Generation> = read_dir_names(&self.generations_dir())
            .await?
            .iter()
            .filter_map(|name| Generation::parse(name).ok())
            .collect();
        generations.sort();
        Ok(generations)
    }

    async fn delete_generation(&self, generation: &Generation) -> ShadowResult<()> {
        match fs::remove_dir_all(self.generation_dir(generation)).await {
            Ok(()) => {
                debug!("FileReplicaClient: deleted generation {}", generation);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn snapshots(&self, generation: &Generation) -> ShadowResult<Vec<SnapshotInfo>> {
        let mut snapshots = Vec::new();
        for name in read_dir_names(&self.snapshots_dir(generation)).await? {
            let Some(index) = parse_hex_name(&name, SNAPSHOT_EXT) else {
                continue;
            };
            let (size, created_at) = file_stat(&self.snapshot_path(generation, index)).await?;
            snapshots.push(SnapshotInfo {
                generation: generation.clone(),
                index,
                size,
                created_at,
            });
        }
        snapshots.sort_by_key(|s| s.index);
        Ok(snapshots)
    }

    async fn write_snapshot(
        &self,
        generation: &Generation,
        index: u64,
        data: Vec<u8>,
    ) -> ShadowResult<SnapshotInfo> {
        let path = self.snapshot_path(generation, index);
        write_atomic(&path, &data).await?;
        let (size, created_at) = file_stat(&path).await?;
        Ok(SnapshotInfo {
            generation: generation.clone(),
            index,
            size,
            created_at,
        })
    }

    async fn snapshot_reader(&self, generation: &Generation, index: u64) -> ShadowResult<ByteReader> {
        self.open(
            &self.snapshot_path(generation, index),
            format!("snapshot {}/{:016x}", generation, index),
        )
        .await
    }

    async fn delete_snapshot(&self, generation: &Generation, index: u64) -> ShadowResult<()> {
        remove_if_exists(&self.snapshot_path(generation, index)).await
    }

    async fn wal_segments(&self, generation: &Generation) -> ShadowResult<Vec<WalSegmentInfo>> {
        let wal_dir = self.generation_dir(generation).join("wal");
        let mut segments = Vec::new();
        for dir_name in read_dir_names(&wal_dir).await? {
            let Some(index) = parse_hex_name(&dir_name, "") else {
                continue;
            };
            let sealed = self.is_sealed(generation, index).await?;
            for name in read_dir_names(&self.segment_dir(generation, index)).await? {
                let Some(offset) = parse_hex_name(&name, WAL_EXT) else {
                    continue;
                };
                let pos = Pos::new(generation.clone(), index, offset);
                let (size, created_at) = file_stat(&self.wal_segment_path(&pos)).await?;
                segments.push(WalSegmentInfo {
                    generation: generation.clone(),
                    index,
                    offset,
                    size,
                    sealed,
                    created_at,
                });
            }
        }
        segments.sort_by_key(|s| (s.index, s.offset));
        Ok(segments)
    }

    async fn write_wal_segment(&self, pos: &Pos, data: Vec<u8>) -> ShadowResult<WalSegmentInfo> {
        if self.is_sealed(&pos.generation, pos.index).await? {
            return Err(ShadowError::SegmentSealed(pos.truncate().to_string()));
        }
        let path = self.wal_segment_path(pos);
        write_atomic(&path, &data).await?;
        let (size, created_at) = file_stat(&path).await?;
        Ok(WalSegmentInfo {
            generation: pos.generation.clone(),
            index: pos.index,
            offset: pos.offset,
            size,
            sealed: false,
            created_at,
        })
    }

    async fn wal_segment_reader(&self, pos: &Pos) -> ShadowResult<ByteReader> {
        self.open(&self.wal_segment_path(pos), format!("WAL segment {}", pos))
            .await
    }

    async fn seal_wal_segment(&self, generation: &Generation, index: u64) -> ShadowResult<()> {
        write_atomic(&self.segment_dir(generation, index).join(SEALED_MARKER), b"").await
    }

    async fn delete_wal_segments(&self, segments: &[WalSegmentInfo]) -> ShadowResult<()> {
        for segment in segments {
            remove_if_exists(&self.wal_segment_path(&segment.pos())).await?;
            let dir = self.segment_dir(&segment.generation, segment.index);
            let remaining = read_dir_names(&dir).await?;
            if remaining.iter().all(|n| n == SEALED_MARKER) {
                if let Err(e) = fs::remove_dir_all(&dir).await {
                    if e.kind() != ErrorKind::NotFound {
                        return Err(e.into());
                    }
                }
            }
        }
        Ok(())
    }
}
