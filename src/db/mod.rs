//! Database monitor
//!
//! A `Db` owns the change capture for one SQLite database in WAL mode:
//! - Copies every durable WAL byte into the local shadow store (`sync`)
//! - Tracks the current generation and position, published to replicas
//!   through a `watch` channel
//! - Runs checkpoints behind the replica acknowledgment gate
//! - Holds a long-lived read transaction so no other connection can restart
//!   the WAL while bytes are still unshipped

pub mod checkpoint;
pub mod shadow;
pub mod wal;

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rusqlite::Connection;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use checkpoint::{AckHandle, AckRegistry, CheckpointMode, CheckpointResult};
pub use shadow::ShadowStore;
pub use wal::WalHeader;

use crate::error::{ShadowError, ShadowResult};
use crate::pos::{Generation, Pos};

pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_MIN_CHECKPOINT_PAGE_COUNT: u64 = 1000;
pub const DEFAULT_MAX_CHECKPOINT_PAGE_COUNT: u64 = 10_000;

const SEQ_TABLE: &str = "_walshadow_seq";
const LOCK_TABLE: &str = "_walshadow_lock";

#[derive(Debug, Clone)]
pub struct DbOptions {
    /// How often the background monitor calls `sync`.
    pub monitor_interval: Duration,
    /// WAL frame count that triggers a PASSIVE checkpoint after a sync.
    pub min_checkpoint_page_count: u64,
    /// WAL frame count that triggers a gated RESTART checkpoint after a sync.
    pub max_checkpoint_page_count: u64,
    pub busy_timeout: Duration,
}

impl Default for DbOptions {
    fn default() -> Self {
        Self {
            monitor_interval: DEFAULT_MONITOR_INTERVAL,
            min_checkpoint_page_count: DEFAULT_MIN_CHECKPOINT_PAGE_COUNT,
            max_checkpoint_page_count: DEFAULT_MAX_CHECKPOINT_PAGE_COUNT,
            busy_timeout: Duration::from_secs(1),
        }
    }
}

/// Capture state for the open segment.
#[derive(Debug, Clone)]
struct Capture {
    generation: Generation,
    index: u64,
    /// Bytes of the live WAL copied so far, header included.
    offset: u64,
    header: WalHeader,
    /// Cumulative WAL checksum at `offset`.
    checksum: (u32, u32),
    /// Frames captured for this index.
    frames: u64,
}

impl Capture {
    fn pos(&self) -> Pos {
        Pos::new(self.generation.clone(), self.index, self.offset)
    }
}

/// What the next header change means, set by a monitor-run checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    /// The WAL may restart; accept it as index+1 if the checkpoint saw
    /// exactly the frames we captured.
    Rollover { frames: i64 },
    NewGeneration,
}

enum Step {
    NewGeneration(&'static str),
    NextIndex(Capture),
    Continue(Capture),
}

struct Connections {
    /// Used for pragmas, checkpoints and sequence writes.
    conn: Connection,
    /// Holds the long-lived read transaction.
    lock_conn: Connection,
    read_locked: bool,
}

#[derive(Default)]
struct Inner {
    conns: Option<Connections>,
    capture: Option<Capture>,
    pending: Option<Pending>,
    closed: bool,
}

pub struct Db {
    path: PathBuf,
    wal_path: PathBuf,
    options: DbOptions,
    shadow: ShadowStore,
    inner: Mutex<Inner>,
    pos_tx: watch::Sender<Pos>,
    acks: Arc<AckRegistry>,
    last_error: RwLock<Option<String>>,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("path", &self.path)
            .field("pos", &*self.pos_tx.borrow())
            .finish()
    }
}

impl Db {
    /// Create a monitor for the database at `path`. Nothing is opened until
    /// the first `sync`, and only if the database file exists by then.
    pub fn new(path: impl Into<PathBuf>, options: DbOptions) -> Self {
        let path = path.into();
        let wal_path = PathBuf::from(format!("{}-wal", path.display()));
        let shadow = ShadowStore::new(ShadowStore::meta_dir_for(&path));
        let (pos_tx, _) = watch::channel(Pos::default());
        Self {
            path,
            wal_path,
            options,
            shadow,
            inner: Mutex::new(Inner::default()),
            pos_tx,
            acks: Arc::new(AckRegistry::new()),
            last_error: RwLock::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn wal_path(&self) -> &Path {
        &self.wal_path
    }

    pub fn meta_dir(&self) -> &Path {
        self.shadow.root()
    }

    pub fn options(&self) -> &DbOptions {
        &self.options
    }

    /// Last synced position. Never blocks on a running `sync`.
    pub fn pos(&self) -> Pos {
        self.pos_tx.borrow().clone()
    }

    /// Receiver notified whenever the position advances.
    pub fn subscribe(&self) -> watch::Receiver<Pos> {
        self.pos_tx.subscribe()
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    /// Register a replica with the checkpoint gate.
    pub fn register_replica(&self, name: impl Into<String>) -> AckHandle {
        self.acks.register(name)
    }

    pub fn min_acknowledged_pos(&self) -> Option<Pos> {
        self.acks.min_acknowledged()
    }

    pub fn shadow_segment_path(&self, generation: &Generation, index: u64) -> PathBuf {
        self.shadow.segment_path(generation, index)
    }

    /// Lowest locally retained segment index of a generation.
    pub fn first_shadow_index(&self, generation: &Generation) -> ShadowResult<Option<u64>> {
        Ok(self.shadow.indexes(generation)?.first().copied())
    }

    /// Read captured bytes of one segment. `len = None` reads to the end.
    pub fn read_shadow(
        &self,
        generation: &Generation,
        index: u64,
        offset: u64,
        len: Option<u64>,
    ) -> ShadowResult<Vec<u8>> {
        self.shadow.read(generation, index, offset, len)
    }

    /// Capture new WAL bytes, then run automatic checkpoints and prune local
    /// segments every registered replica has acknowledged.
    ///
    /// Blocking; async callers go through `spawn_blocking`. On error no state
    /// is advanced and the next call starts over from the same position.
    pub fn sync(&self) -> ShadowResult<Pos> {
        let mut inner = self.inner.lock();
        let pos = self.sync_locked(&mut inner)?;

        if let Some(frames) = inner.capture.as_ref().map(|c| c.frames) {
            let mode = if frames >= self.options.max_checkpoint_page_count {
                Some(CheckpointMode::Restart)
            } else if frames >= self.options.min_checkpoint_page_count {
                Some(CheckpointMode::Passive)
            } else {
                None
            };
            if let Some(mode) = mode {
                match self.checkpoint_locked(&mut inner, mode) {
                    Ok(_) => {}
                    Err(e) if e.is_checkpoint_refused() => {
                        debug!("Db: automatic checkpoint of {} deferred: {}", self.path.display(), e)
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        if let Err(e) = self.clean_locked(&inner) {
            warn!("Db: failed to prune shadow segments for {}: {}", self.path.display(), e);
        }

        Ok(inner.capture.as_ref().map(|c| c.pos()).unwrap_or(pos))
    }

    /// Run a checkpoint. RESTART and TRUNCATE are refused with
    /// `CheckpointRefused` until every replica has acknowledged the current
    /// position.
    pub fn checkpoint(&self, mode: CheckpointMode) -> ShadowResult<CheckpointResult> {
        let mut inner = self.inner.lock();
        self.checkpoint_locked(&mut inner, mode)
    }

    /// Copy of the database file at a segment boundary.
    ///
    /// The copy is taken under the monitor's read transaction, so the engine
    /// cannot restart the WAL mid-copy. Pages the engine checkpoints during
    /// the copy are rewritten on restore when the returned segment replays.
    pub fn snapshot_image(&self) -> ShadowResult<(Pos, Vec<u8>)> {
        let mut inner = self.inner.lock();
        let pos = self.sync_locked(&mut inner)?;
        if pos.is_zero() {
            return Err(ShadowError::NoGeneration);
        }
        let data = fs::read(&self.path)?;
        Ok((pos.truncate(), data))
    }

    /// Release the engine connections. Later calls to `sync` fail.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if let Some(mut conns) = inner.conns.take() {
            if let Err(e) = release_read_lock(&mut conns) {
                debug!("Db: rollback on close failed: {}", e);
            }
        }
        inner.closed = true;
        info!("Db: closed {}", self.path.display());
    }

    /// Background loop: `sync` on every tick until `shutdown` fires.
    pub async fn monitor(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.options.monitor_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("Db: monitoring {}", self.path.display());
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let db = Arc::clone(&self);
                    let result = match tokio::task::spawn_blocking(move || db.sync()).await {
                        Ok(r) => r,
                        Err(e) => Err(e.into()),
                    };
                    match result {
                        Ok(_) => *self.last_error.write() = None,
                        Err(e) => {
                            warn!("Db: sync of {} failed: {}", self.path.display(), e);
                            *self.last_error.write() = Some(e.to_string());
                        }
                    }
                }
            }
        }
        debug!("Db: monitor for {} stopped", self.path.display());
    }

    /// Open connections on first use. Returns false while the database file
    /// does not exist.
    fn init_locked(&self, inner: &mut Inner) -> ShadowResult<bool> {
        if inner.closed {
            return Err(ShadowError::Internal(format!(
                "database {} is closed",
                self.path.display()
            )));
        }
        if inner.conns.is_some() {
            return Ok(true);
        }
        if !self.path.exists() {
            return Ok(false);
        }

        let conn = open_connection(&self.path, self.options.busy_timeout)?;
        let mode: String = conn.query_row("PRAGMA journal_mode = wal", [], |r| r.get(0))?;
        if !mode.eq_ignore_ascii_case("wal") {
            return Err(ShadowError::Configuration(format!(
                "{} could not be switched to WAL mode (journal_mode={})",
                self.path.display(),
                mode
            )));
        }
        conn.query_row("PRAGMA wal_autocheckpoint = 0", [], |r| r.get::<_, i64>(0))?;
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} (id INTEGER PRIMARY KEY, seq INTEGER);
             CREATE TABLE IF NOT EXISTS {} (id INTEGER);",
            SEQ_TABLE, LOCK_TABLE
        ))?;
        if wal::read_header(&self.wal_path)?.is_none() {
            bump_sequence(&conn)?;
        }

        let lock_conn = open_connection(&self.path, self.options.busy_timeout)?;
        let mut conns = Connections {
            conn,
            lock_conn,
            read_locked: false,
        };
        acquire_read_lock(&mut conns)?;
        inner.conns = Some(conns);
        debug!("Db: opened {}", self.path.display());

        if let Err(e) = self.resume_locked(inner) {
            warn!(
                "Db: cannot resume previous generation of {}: {}",
                self.path.display(),
                e
            );
        }
        Ok(true)
    }

    /// Continue the generation recorded by a previous run if the live WAL
    /// still carries the captured history.
    fn resume_locked(&self, inner: &mut Inner) -> ShadowResult<()> {
        let Some(generation) = self.shadow.current_generation()? else {
            return Ok(());
        };
        let Some(&index) = self.shadow.indexes(&generation)?.last() else {
            return Ok(());
        };
        let Some(live) = wal::read_header(&self.wal_path)? else {
            return Ok(());
        };

        let mut segment = File::open(self.shadow.segment_path(&generation, index))?;
        let len = segment.metadata()?.len();
        let mut raw = [0u8; 32];
        if len < wal::WAL_HEADER_SIZE || segment.read_exact(&mut raw).is_err() || raw != live.raw {
            info!(
                "Db: WAL of {} no longer matches generation {}",
                self.path.display(),
                generation
            );
            return Ok(());
        }

        let scan = wal::scan(&mut segment, &live, wal::WAL_HEADER_SIZE, live.checksum, Some(len))?;
        if scan.end != len {
            return Err(ShadowError::Corruption(format!(
                "shadow segment {}/{:016x} has {} trailing bytes",
                generation,
                index,
                len - scan.end
            )));
        }

        if scan.frames > 0 {
            let frame_size = live.frame_size();
            let start = len - frame_size;
            let shadow_frame = self.shadow.read(&generation, index, start, Some(frame_size))?;
            let mut live_frame = vec![0u8; frame_size as usize];
            let mut wal_file = File::open(&self.wal_path)?;
            wal_file.seek(SeekFrom::Start(start))?;
            if wal_file.read_exact(&mut live_frame).is_err() || live_frame != shadow_frame {
                info!(
                    "Db: last captured frame of {} differs from the WAL, starting over",
                    generation
                );
                return Ok(());
            }
        }

        let capture = Capture {
            generation,
            index,
            offset: len,
            header: live,
            checksum: scan.checksum,
            frames: scan.frames,
        };
        info!("Db: resuming {} at {}", self.path.display(), capture.pos());
        self.publish(capture.pos());
        inner.capture = Some(capture);
        Ok(())
    }

    fn sync_locked(&self, inner: &mut Inner) -> ShadowResult<Pos> {
        if !self.init_locked(inner)? {
            return Ok(self.pos());
        }

        let header = match wal::read_header(&self.wal_path)? {
            Some(h) => h,
            None => {
                // Truncated WAL: write a sequence row so it gets a fresh header.
                if let Some(conns) = inner.conns.as_mut() {
                    release_read_lock(conns)?;
                    let bumped = bump_sequence(&conns.conn);
                    acquire_read_lock(conns)?;
                    bumped?;
                }
                wal::read_header(&self.wal_path)?.ok_or_else(|| {
                    ShadowError::Internal(format!("{} has no WAL after a write", self.path.display()))
                })?
            }
        };

        let step = match (&inner.capture, inner.pending) {
            (None, _) => Step::NewGeneration("no generation"),
            (Some(_), Some(Pending::NewGeneration)) => Step::NewGeneration("truncating checkpoint"),
            (Some(c), pending) if c.header.raw != header.raw => match pending {
                Some(Pending::Rollover { frames }) if frames >= 0 && frames as u64 == c.frames => {
                    Step::NextIndex(c.clone())
                }
                _ => Step::NewGeneration("WAL header changed"),
            },
            (Some(c), _) => {
                if fs::metadata(&self.wal_path)?.len() < c.offset {
                    Step::NewGeneration("WAL shrank")
                } else {
                    Step::Continue(c.clone())
                }
            }
        };

        let (mut next, mut prefix) = match step {
            Step::Continue(c) => (c, Vec::new()),
            Step::NextIndex(c) => {
                self.shadow.create_segment(&c.generation, c.index + 1)?;
                let next = Capture {
                    generation: c.generation,
                    index: c.index + 1,
                    offset: 0,
                    checksum: header.checksum,
                    header: header.clone(),
                    frames: 0,
                };
                info!("Db: WAL of {} restarted, continuing at {}", self.path.display(), next.pos());
                (next, header.raw.to_vec())
            }
            Step::NewGeneration(reason) => {
                let generation = Generation::new();
                self.shadow.create_segment(&generation, 0)?;
                info!(
                    "Db: new generation {} for {} ({})",
                    generation,
                    self.path.display(),
                    reason
                );
                let next = Capture {
                    generation,
                    index: 0,
                    offset: 0,
                    checksum: header.checksum,
                    header: header.clone(),
                    frames: 0,
                };
                (next, header.raw.to_vec())
            }
        };

        let start = if prefix.is_empty() { next.offset } else { wal::WAL_HEADER_SIZE };
        let mut wal_file = File::open(&self.wal_path)?;
        let scan = wal::scan(&mut wal_file, &next.header, start, next.checksum, None)?;
        if scan.end > start {
            wal_file.seek(SeekFrom::Start(start))?;
            let mut frames = Vec::with_capacity((scan.end - start) as usize);
            (&mut wal_file).take(scan.end - start).read_to_end(&mut frames)?;
            prefix.extend_from_slice(&frames);
        }

        if !prefix.is_empty() {
            self.shadow.append(&next.pos(), &prefix)?;
            next.offset += prefix.len() as u64;
            next.checksum = scan.checksum;
            next.frames += scan.frames;
            debug!(
                "Db: captured {} bytes ({} frames) of {}",
                prefix.len(),
                scan.frames,
                self.path.display()
            );
        }

        let new_generation = inner
            .capture
            .as_ref()
            .map_or(true, |c| c.generation != next.generation);
        if new_generation {
            self.shadow.set_current_generation(&next.generation)?;
        }

        let pos = next.pos();
        inner.capture = Some(next);
        inner.pending = None;
        self.publish(pos.clone());
        Ok(pos)
    }

    fn checkpoint_locked(
        &self,
        inner: &mut Inner,
        mode: CheckpointMode,
    ) -> ShadowResult<CheckpointResult> {
        let target = self.sync_locked(inner)?;
        if inner.conns.is_none() {
            return Err(ShadowError::NotFound(format!(
                "database {}",
                self.path.display()
            )));
        }

        if mode.discards_wal() {
            if let Err(reason) = self.acks.check(&target) {
                return Err(ShadowError::CheckpointRefused { mode, reason });
            }
        }

        let result = {
            let conns = inner
                .conns
                .as_mut()
                .ok_or_else(|| ShadowError::Internal("connections missing".to_string()))?;
            release_read_lock(conns)?;
            let result = run_checkpoint(&conns.conn, mode);
            let result = match result {
                Ok(r) if r.busy && mode.discards_wal() => {
                    acquire_read_lock(conns)?;
                    return Err(ShadowError::CheckpointRefused {
                        mode,
                        reason: "database is busy".to_string(),
                    });
                }
                Ok(r) => r,
                Err(e) => {
                    acquire_read_lock(conns)?;
                    return Err(e);
                }
            };
            let bumped = bump_sequence(&conns.conn);
            acquire_read_lock(conns)?;
            bumped?;
            result
        };

        inner.pending = Some(match mode {
            CheckpointMode::Truncate => Pending::NewGeneration,
            _ => Pending::Rollover {
                frames: result.log_frames,
            },
        });
        let pos = self.sync_locked(inner)?;

        info!(
            "Db: {} checkpoint of {} ({}/{} frames, busy={}), now at {}",
            mode,
            self.path.display(),
            result.checkpointed_frames,
            result.log_frames,
            result.busy,
            pos
        );
        Ok(result)
    }

    /// Drop local segments every replica has moved past.
    ///
    /// With no replica registered nothing is pruned: a replica that registers
    /// later may still resume from any retained segment.
    fn clean_locked(&self, inner: &Inner) -> ShadowResult<()> {
        let Some(capture) = &inner.capture else {
            return Ok(());
        };
        if self.acks.is_empty() {
            return Ok(());
        }

        let keep_from = self
            .acks
            .min_acknowledged()
            .filter(|p| p.generation == capture.generation)
            .map(|p| p.index.min(capture.index));
        if let Some(index) = keep_from {
            self.shadow.remove_segments_before(&capture.generation, index)?;
        }

        if self.acks.all_in_generation(&capture.generation) {
            for generation in self.shadow.generations()? {
                if generation != capture.generation {
                    self.shadow.remove_generation(&generation)?;
                }
            }
        }
        Ok(())
    }

    fn publish(&self, pos: Pos) {
        self.pos_tx.send_if_modified(|current| {
            if *current == pos {
                false
            } else {
                *current = pos;
                true
            }
        });
    }
}

fn open_connection(path: &Path, busy_timeout: Duration) -> ShadowResult<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(busy_timeout)?;
    Ok(conn)
}

fn acquire_read_lock(conns: &mut Connections) -> ShadowResult<()> {
    if conns.read_locked {
        return Ok(());
    }
    conns.lock_conn.execute_batch("BEGIN")?;
    let started = conns
        .lock_conn
        .query_row(&format!("SELECT COUNT(1) FROM {}", LOCK_TABLE), [], |r| {
            r.get::<_, i64>(0)
        });
    if let Err(e) = started {
        let _ = conns.lock_conn.execute_batch("ROLLBACK");
        return Err(e.into());
    }
    conns.read_locked = true;
    Ok(())
}

fn release_read_lock(conns: &mut Connections) -> ShadowResult<()> {
    if !conns.read_locked {
        return Ok(());
    }
    conns.lock_conn.execute_batch("ROLLBACK")?;
    conns.read_locked = false;
    Ok(())
}

/// A write that gives the WAL a new header after a checkpoint reset it.
fn bump_sequence(conn: &Connection) -> ShadowResult<()> {
    conn.execute(
        &format!(
            "INSERT INTO {} (id, seq) VALUES (1, 1) ON CONFLICT (id) DO UPDATE SET seq = seq + 1",
            SEQ_TABLE
        ),
        [],
    )?;
    Ok(())
}

fn run_checkpoint(conn: &Connection, mode: CheckpointMode) -> ShadowResult<CheckpointResult> {
    let (busy, log_frames, checkpointed_frames) = conn.query_row(
        &format!("PRAGMA wal_checkpoint({})", mode),
        [],
        |r| Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?, r.get::<_, i64>(2)?)),
    )?;
    Ok(CheckpointResult {
        mode,
        busy: busy != 0,
        log_frames,
        checkpointed_frames,
    })
}
