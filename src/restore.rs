//! Point-in-time restore from a replica
//!
//! Restore picks a snapshot, writes it to a temporary file next to the
//! output, then replays each following WAL segment by laying it down as the
//! temporary file's `-wal` companion and letting SQLite checkpoint it in.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rusqlite::Connection;
use tokio::fs;
use tracing::{debug, info};

use crate::client::ReplicaClient;
use crate::error::{ShadowError, ShadowResult};
use crate::pos::{Generation, Pos};
use crate::replica::snapshot::SnapshotManager;
use crate::replica::retention::KeepAll;
use crate::replica::transport::SegmentTransport;

#[derive(Debug, Clone)]
pub struct RestoreOptions {
    pub output_path: PathBuf,
    /// Generation to restore. Defaults to the newest one on the replica.
    pub generation: Option<Generation>,
    /// Last WAL segment index to replay. Defaults to every segment available.
    pub index: Option<u64>,
}

impl RestoreOptions {
    pub fn new(output_path: impl Into<PathBuf>) -> Self {
        Self {
            output_path: output_path.into(),
            generation: None,
            index: None,
        }
    }
}

/// Restore a database from `client` into `opts.output_path` and return the
/// position it was restored to.
pub async fn restore(client: Arc<dyn ReplicaClient>, opts: &RestoreOptions) -> ShadowResult<Pos> {
    if fs::metadata(&opts.output_path).await.is_ok() {
        return Err(ShadowError::Restore(format!(
            "output {} already exists",
            opts.output_path.display()
        )));
    }

    let generation = match &opts.generation {
        Some(g) => g.clone(),
        None => client
            .generations()
            .await?
            .pop()
            .ok_or_else(|| ShadowError::NotFound("no generations on replica".to_string()))?,
    };

    let snapshots = SnapshotManager::new(Arc::clone(&client), Arc::new(KeepAll));
    let snapshot = snapshots
        .snapshots_for(&generation)
        .await?
        .into_iter()
        .rev()
        .find(|s| opts.index.map_or(true, |i| s.index <= i))
        .ok_or_else(|| {
            ShadowError::NotFound(format!(
                "no snapshot in generation {} at or before the requested index",
                generation
            ))
        })?;

    let transport = SegmentTransport::new(Arc::clone(&client));
    let available: Vec<u64> = transport
        .indexes(&generation)
        .await?
        .into_iter()
        .filter(|i| *i >= snapshot.index)
        .collect();

    let mut plan = Vec::new();
    let mut next = snapshot.index;
    for index in available {
        if opts.index.map_or(false, |target| index > target) {
            break;
        }
        if index != next {
            break;
        }
        plan.push(index);
        next += 1;
    }
    if let Some(target) = opts.index {
        if plan.last().copied().unwrap_or(snapshot.index) != target {
            return Err(ShadowError::Restore(format!(
                "WAL segment {}/{:016x} is missing on the replica",
                generation, next
            )));
        }
    }

    info!(
        "Restore: generation {} from snapshot {:016x}, replaying {} segment(s)",
        generation,
        snapshot.index,
        plan.len()
    );

    let tmp = PathBuf::from(format!("{}.tmp", opts.output_path.display()));
    remove_companions(&tmp).await?;
    if let Some(parent) = opts.output_path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let image = snapshots.read_snapshot(&snapshot).await?;
    fs::write(&tmp, &image).await?;

    let mut restored = snapshot.pos();
    for index in plan {
        let data = transport.read_segment(&generation, index).await?;
        fs::write(companion(&tmp, "-wal"), &data).await?;
        remove_if_exists(&companion(&tmp, "-shm")).await?;

        let path = tmp.clone();
        tokio::task::spawn_blocking(move || apply_wal(&path)).await??;
        restored = Pos::new(generation.clone(), index, data.len() as u64);
        debug!("Restore: applied {}", restored);
    }

    remove_if_exists(&companion(&tmp, "-wal")).await?;
    remove_if_exists(&companion(&tmp, "-shm")).await?;
    fs::rename(&tmp, &opts.output_path).await?;

    info!("Restore: wrote {} at {}", opts.output_path.display(), restored);
    Ok(restored)
}

/// Open the database so SQLite recovers its `-wal` file, then fold it into the
/// main file.
fn apply_wal(path: &Path) -> ShadowResult<()> {
    let conn = Connection::open(path)?;
    let busy: i64 = conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |r| r.get(0))?;
    if busy != 0 {
        return Err(ShadowError::Restore(format!(
            "checkpoint of {} did not complete",
            path.display()
        )));
    }
    conn.close().map_err(|(_, e)| ShadowError::from(e))?;
    Ok(())
}

fn companion(path: &Path, suffix: &str) -> PathBuf {
    PathBuf::from(format!("{}{}", path.display(), suffix))
}

async fn remove_if_exists(path: &Path) -> ShadowResult<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn remove_companions(path: &Path) -> ShadowResult<()> {
    remove_if_exists(path).await?;
    remove_if_exists(&companion(path, "-wal")).await?;
    remove_if_exists(&companion(path, "-shm")).await
}
