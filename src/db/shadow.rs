//! Local shadow WAL store
//!
//! Captured WAL bytes are copied into per-segment files inside the monitor's
//! metadata directory before the engine is allowed to checkpoint them away:
//!
//! ```text
//! .<db-file-name>-walshadow/
//!   generation                          current generation id
//!   generations/<gen>/wal/<index>.wal   raw WAL bytes, index as 16 hex digits
//! ```
//!
//! Each segment file starts with the 32-byte WAL header it was captured from.
//! Segment files are append-only; they are only ever removed whole.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{ShadowError, ShadowResult};
use crate::pos::{Generation, Pos};

const GENERATION_FILE: &str = "generation";

#[derive(Debug, Clone)]
pub struct ShadowStore {
    root: PathBuf,
}

impl ShadowStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Metadata directory for a database file: `.<name>-walshadow` beside it.
    pub fn meta_dir_for(db_path: &Path) -> PathBuf {
        let name = db_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let dir = db_path.parent().unwrap_or_else(|| Path::new("."));
        dir.join(format!(".{}-walshadow", name))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn generations_dir(&self) -> PathBuf {
        self.root.join("generations")
    }

    fn wal_dir(&self, generation: &Generation) -> PathBuf {
        self.generations_dir().join(generation.as_str()).join("wal")
    }

    pub fn segment_path(&self, generation: &Generation, index: u64) -> PathBuf {
        self.wal_dir(generation).join(format!("{:016x}.wal", index))
    }

    /// Generation recorded by the last run, if any.
    pub fn current_generation(&self) -> ShadowResult<Option<Generation>> {
        match fs::read_to_string(self.root.join(GENERATION_FILE)) {
            Ok(s) => Generation::parse(s.trim()).map(Some),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn set_current_generation(&self, generation: &Generation) -> ShadowResult<()> {
        fs::create_dir_all(&self.root)?;
        let tmp = self.root.join(format!("{}.tmp", GENERATION_FILE));
        fs::write(&tmp, generation.as_str())?;
        fs::rename(&tmp, self.root.join(GENERATION_FILE))?;
        Ok(())
    }

    /// Create an empty segment, discarding any leftover file of the same name.
    pub fn create_segment(&self, generation: &Generation, index: u64) -> ShadowResult<()> {
        fs::create_dir_all(self.wal_dir(generation))?;
        File::create(self.segment_path(generation, index))?;
        Ok(())
    }

    /// Append `data` to a segment at `pos.offset`.
    ///
    /// The file is first cut back to `pos.offset`, so a retry after a failed
    /// append never duplicates bytes.
    pub fn append(&self, pos: &Pos, data: &[u8]) -> ShadowResult<()> {
        let path = self.segment_path(&pos.generation, pos.index);
        let mut file = OpenOptions::new().write(true).open(&path)?;
        let len = file.metadata()?.len();
        if len < pos.offset {
            return Err(ShadowError::Internal(format!(
                "shadow segment {} is {} bytes, expected at least {}",
                path.display(),
                len,
                pos.offset
            )));
        }
        file.set_len(pos.offset)?;
        file.seek(SeekFrom::Start(pos.offset))?;
        file.write_all(data)?;
        file.sync_data()?;
        Ok(())
    }

    pub fn segment_len(&self, generation: &Generation, index: u64) -> ShadowResult<u64> {
        Ok(fs::metadata(self.segment_path(generation, index))?.len())
    }

    /// Read `len` bytes starting at `offset`, or to the end when `len` is `None`.
    pub fn read(
        &self,
        generation: &Generation,
        index: u64,
        offset: u64,
        len: Option<u64>,
    ) -> ShadowResult<Vec<u8>> {
        let mut file = File::open(self.segment_path(generation, index))?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::new();
        match len {
            Some(n) => {
                file.take(n).read_to_end(&mut buf)?;
            }
            None => {
                file.read_to_end(&mut buf)?;
            }
        }
        Ok(buf)
    }

    /// Segment indexes present for a generation, ascending.
    pub fn indexes(&self, generation: &Generation) -> ShadowResult<Vec<u64>> {
        let entries = match fs::read_dir(self.wal_dir(generation)) {
            Ok(e) => e,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut indexes = Vec::new();
        for entry in entries {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            if let Some(hex) = name.strip_suffix(".wal") {
                if let Ok(index) = u64::from_str_radix(hex, 16) {
                    indexes.push(index);
                }
            }
        }
        indexes.sort_unstable();
        Ok(indexes)
    }

    pub fn generations(&self) -> ShadowResult<Vec<Generation>> {
        let entries = match fs::read_dir(self.generations_dir()) {
            Ok(e) => e,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut generations = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Ok(g) = Generation::parse(&entry.file_name().to_string_lossy()) {
                generations.push(g);
            }
        }
        generations.sort();
        Ok(generations)
    }

    /// Delete segments of `generation` with an index below `index`.
    pub fn remove_segments_before(&self, generation: &Generation, index: u64) -> ShadowResult<usize> {
        let mut removed = 0;
        for i in self.indexes(generation)? {
            if i >= index {
                break;
            }
            fs::remove_file(self.segment_path(generation, i))?;
            removed += 1;
        }
        if removed > 0 {
            debug!(
                "ShadowStore: removed {} segment(s) of {} below index {}",
                removed, generation, index
            );
        }
        Ok(removed)
    }

    pub fn remove_generation(&self, generation: &Generation) -> ShadowResult<()> {
        let dir = self.generations_dir().join(generation.as_str());
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                debug!("ShadowStore: removed generation {}", generation);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
