//! SQLite WAL file parsing
//!
//! Layout of a WAL file:
//!
//! ```text
//! header (32 bytes)
//!   0  magic            0x377f0682 (LE checksum words) / 0x377f0683 (BE)
//!   4  format version   3007000
//!   8  page size        1 means 65536
//!   12 checkpoint seq
//!   16 salt-1, 20 salt-2
//!   24 checksum-1, 28 checksum-2   over bytes 0..24
//! frames, each (24 + page size) bytes
//!   0  page number
//!   4  db size after commit, non-zero only on commit frames
//!   8  salt-1, 12 salt-2           copied from the header
//!   16 checksum-1, 20 checksum-2   cumulative, over frame header 0..8 + page
//! ```
//!
//! All header integers are big-endian. Checksums chain from the header through
//! every frame, so a frame is only valid if every frame before it is.

use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::Path;

use crate::error::{ShadowError, ShadowResult};

pub const WAL_HEADER_SIZE: u64 = 32;
pub const WAL_FRAME_HEADER_SIZE: u64 = 24;

const WAL_MAGIC_LE: u32 = 0x377f_0682;
const WAL_MAGIC_BE: u32 = 0x377f_0683;
const WAL_FORMAT_VERSION: u32 = 3_007_000;

/// Parsed WAL header. `raw` keeps the exact bytes so two headers can be
/// compared for identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalHeader {
    pub raw: [u8; 32],
    pub big_endian: bool,
    pub page_size: u32,
    pub checkpoint_seq: u32,
    pub salt1: u32,
    pub salt2: u32,
    pub checksum: (u32, u32),
}

impl WalHeader {
    pub fn parse(buf: &[u8]) -> ShadowResult<Self> {
        if buf.len() < WAL_HEADER_SIZE as usize {
            return Err(ShadowError::Corruption(format!(
                "WAL header too short: {} bytes",
                buf.len()
            )));
        }
        let mut raw = [0u8; 32];
        raw.copy_from_slice(&buf[..32]);

        let magic = be32(&raw[0..4]);
        let big_endian = match magic {
            WAL_MAGIC_LE => false,
            WAL_MAGIC_BE => true,
            other => {
                return Err(ShadowError::Corruption(format!(
                    "bad WAL magic: {:#010x}",
                    other
                )))
            }
        };

        let version = be32(&raw[4..8]);
        if version != WAL_FORMAT_VERSION {
            return Err(ShadowError::Corruption(format!(
                "unsupported WAL format version: {}",
                version
            )));
        }

        let page_size = match be32(&raw[8..12]) {
            1 => 65_536,
            n if n >= 512 && n <= 32_768 && n.is_power_of_two() => n,
            n => {
                return Err(ShadowError::Corruption(format!(
                    "invalid WAL page size: {}",
                    n
                )))
            }
        };

        let stored = (be32(&raw[24..28]), be32(&raw[28..32]));
        let computed = checksum(big_endian, (0, 0), &raw[..24]);
        if stored != computed {
            return Err(ShadowError::Corruption(
                "WAL header checksum mismatch".to_string(),
            ));
        }

        Ok(Self {
            raw,
            big_endian,
            page_size,
            checkpoint_seq: be32(&raw[12..16]),
            salt1: be32(&raw[16..20]),
            salt2: be32(&raw[20..24]),
            checksum: stored,
        })
    }

    pub fn frame_size(&self) -> u64 {
        WAL_FRAME_HEADER_SIZE + self.page_size as u64
    }
}

/// Read the header of the WAL at `path`.
///
/// Returns `None` when the file is missing or shorter than a header, which is
/// how SQLite leaves it between a truncating checkpoint and the next write.
pub fn read_header(path: &Path) -> ShadowResult<Option<WalHeader>> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut buf = [0u8; 32];
    match file.read_exact(&mut buf) {
        Ok(()) => WalHeader::parse(&buf).map(Some),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// SQLite's WAL checksum. `data` must be a multiple of 8 bytes.
pub fn checksum(big_endian: bool, seed: (u32, u32), data: &[u8]) -> (u32, u32) {
    let (mut s1, mut s2) = seed;
    for chunk in data.chunks_exact(8) {
        let (w0, w1) = if big_endian {
            (be32(&chunk[..4]), be32(&chunk[4..]))
        } else {
            (le32(&chunk[..4]), le32(&chunk[4..]))
        };
        s1 = s1.wrapping_add(w0).wrapping_add(s2);
        s2 = s2.wrapping_add(w1).wrapping_add(s1);
    }
    (s1, s2)
}

/// Result of scanning WAL frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalScan {
    /// Offset just past the last valid commit frame, or `start` if none.
    pub end: u64,
    /// Cumulative checksum at `end`.
    pub checksum: (u32, u32),
    /// Number of frames between `start` and `end`.
    pub frames: u64,
}

/// Walk frames from `start` (a frame boundary) and find the last durable
/// commit.
///
/// `seed` is the cumulative checksum at `start`: the header checksum when
/// `start` is the end of the header. Scanning stops at EOF, at `limit`, or at
/// the first frame whose salt or checksum does not continue the chain; frames
/// after the last commit frame are not counted.
pub fn scan<R: Read + Seek>(
    reader: &mut R,
    header: &WalHeader,
    start: u64,
    seed: (u32, u32),
    limit: Option<u64>,
) -> ShadowResult<WalScan> {
    let frame_size = header.frame_size();
    let mut result = WalScan {
        end: start,
        checksum: seed,
        frames: 0,
    };

    reader.seek(SeekFrom::Start(start))?;
    let mut frame = vec![0u8; frame_size as usize];
    let mut offset = start;
    let mut running = seed;
    let mut frames = 0u64;

    loop {
        if let Some(limit) = limit {
            if offset + frame_size > limit {
                break;
            }
        }
        match reader.read_exact(&mut frame) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }

        if be32(&frame[8..12]) != header.salt1 || be32(&frame[12..16]) != header.salt2 {
            break;
        }
        running = checksum(header.big_endian, running, &frame[..8]);
        running = checksum(
            header.big_endian,
            running,
            &frame[WAL_FRAME_HEADER_SIZE as usize..],
        );
        if (be32(&frame[16..20]), be32(&frame[20..24])) != running {
            break;
        }

        offset += frame_size;
        frames += 1;
        if be32(&frame[4..8]) != 0 {
            result = WalScan {
                end: offset,
                checksum: running,
                frames,
            };
        }
    }

    Ok(result)
}

fn be32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

fn le32(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}
