//! Generation and position model
//!
//! A `Generation` names one continuous run of WAL history. A `Pos` points at an
//! exact byte inside that history: the WAL segment `index` within the
//! generation and the number of durable bytes `offset` inside that segment.
//!
//! Textual form (logs, restore targets):
//!
//! ```text
//! <generation-hex>/<index:16 hex digits>:<offset-hex>
//! 0190f4c2a7e37b3c8d5e1f2a3b4c5d6e/0000000000000003:1f80
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ShadowError, ShadowResult};

/// Opaque identifier of a gap-free run of WAL history.
///
/// Identifiers are UUIDv7 values rendered as 32 lowercase hex digits, so the
/// string order of two generations created by this crate is their creation
/// order.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Generation(String);

impl Generation {
    pub fn new() -> Self {
        Self(Uuid::now_v7().simple().to_string())
    }

    /// Parse an identifier. Any non-empty run of lowercase hex digits is
    /// accepted so that generations written by other tools still load.
    pub fn parse(s: &str) -> ShadowResult<Self> {
        if s.is_empty() || !is_lower_hex(s) {
            return Err(ShadowError::InvalidPosition(format!(
                "invalid generation: {:?}",
                s
            )));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Generation {
    type Err = ShadowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Exact location in replicated WAL history.
///
/// Field order matters: the derived ordering compares generation first, then
/// `(index, offset)`, which is the total order inside one generation.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Pos {
    pub generation: Generation,
    pub index: u64,
    pub offset: u64,
}

impl Pos {
    pub fn new(generation: Generation, index: u64, offset: u64) -> Self {
        Self {
            generation,
            index,
            offset,
        }
    }

    /// The position before any generation exists.
    pub fn is_zero(&self) -> bool {
        self.generation.is_empty() && self.index == 0 && self.offset == 0
    }

    /// Segment-granular form of this position.
    pub fn truncate(&self) -> Pos {
        Pos {
            generation: self.generation.clone(),
            index: self.index,
            offset: 0,
        }
    }

    /// Position `len` bytes further into the same segment.
    pub fn advance(&self, len: u64) -> Pos {
        Pos {
            generation: self.generation.clone(),
            index: self.index,
            offset: self.offset + len,
        }
    }

    /// Start of the segment following this one.
    pub fn next_index(&self) -> Pos {
        Pos {
            generation: self.generation.clone(),
            index: self.index + 1,
            offset: 0,
        }
    }
}

impl fmt::Display for Pos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:016x}:{:x}", self.generation, self.index, self.offset)
    }
}

impl FromStr for Pos {
    type Err = ShadowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ShadowError::InvalidPosition(s.to_string());

        let (generation, rest) = s.split_once('/').ok_or_else(invalid)?;
        let (index, offset) = rest.split_once(':').ok_or_else(invalid)?;

        let generation = if generation.is_empty() {
            Generation::default()
        } else {
            Generation::parse(generation).map_err(|_| invalid())?
        };

        if index.len() != 16 || !is_lower_hex(index) {
            return Err(invalid());
        }
        // Canonical offsets carry no leading zeros, so format(parse(s)) == s.
        if offset.is_empty()
            || !is_lower_hex(offset)
            || (offset.len() > 1 && offset.starts_with('0'))
        {
            return Err(invalid());
        }

        let index = u64::from_str_radix(index, 16).map_err(|_| invalid())?;
        let offset = u64::from_str_radix(offset, 16).map_err(|_| invalid())?;

        Ok(Pos {
            generation,
            index,
            offset,
        })
    }
}

fn is_lower_hex(s: &str) -> bool {
    s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(generation: &str, index: u64, offset: u64) -> Pos {
        Pos::new(Generation::parse(generation).unwrap(), index, offset)
    }

    #[test]
    fn test_generation_new_is_hex_and_ordered() {
        let a = Generation::new();
        let b = Generation::new();
        assert_eq!(a.as_str().len(), 32);
        assert!(Generation::parse(a.as_str()).is_ok());
        assert_ne!(a, b);
        assert!(a < b, "later generations sort after earlier ones");
    }

    #[test]
    fn test_generation_parse_rejects_garbage() {
        assert!(Generation::parse("").is_err());
        assert!(Generation::parse("ABCDEF").is_err());
        assert!(Generation::parse("xyz").is_err());
        assert!(Generation::parse("00ff").is_ok());
    }

    #[test]
    fn test_truncate_is_idempotent() {
        let p = pos("00aa", 7, 4120);
        let t = p.truncate();
        assert_eq!(t, pos("00aa", 7, 0));
        assert_eq!(t.truncate(), t);
    }

    #[test]
    fn test_ordering_within_generation() {
        let g = "0abc";
        assert!(pos(g, 0, 10) < pos(g, 0, 11));
        assert!(pos(g, 0, 999_999) < pos(g, 1, 0));
        assert!(pos(g, 2, 0) > pos(g, 1, 40));
        assert_eq!(pos(g, 3, 5).cmp(&pos(g, 3, 5)), std::cmp::Ordering::Equal);
    }

    #[test]
    fn test_format() {
        let p = pos("0190f4c2a7e37b3c", 3, 0x1f80);
        assert_eq!(p.to_string(), "0190f4c2a7e37b3c/0000000000000003:1f80");
        assert_eq!(Pos::default().to_string(), "/0000000000000000:0");
    }

    #[test]
    fn test_parse_is_inverse_of_format() {
        for p in [
            pos("0190f4c2a7e37b3c8d5e1f2a3b4c5d6e", 0, 0),
            pos("ff", u64::MAX, u64::MAX),
            pos("12ab", 42, 32 + 4120 * 3),
            Pos::default(),
        ] {
            let s = p.to_string();
            let parsed: Pos = s.parse().unwrap();
            assert_eq!(parsed, p);
            assert_eq!(parsed.to_string(), s);
        }
    }

    #[test]
    fn test_parse_rejects_non_canonical() {
        for s in [
            "",
            "abc",
            "abc/0000000000000001",
            "abc/1:0",
            "abc/000000000000000G:0",
            "abc/0000000000000001:",
            "abc/0000000000000001:0a0x",
            "abc/0000000000000001:00ff",
            "abc/0000000000000001:FF",
            "ABC/0000000000000001:ff",
        ] {
            assert!(s.parse::<Pos>().is_err(), "{:?} should not parse", s);
        }
    }

    #[test]
    fn test_advance_and_next_index() {
        let p = pos("01", 2, 100);
        assert_eq!(p.advance(28), pos("01", 2, 128));
        assert_eq!(p.next_index(), pos("01", 3, 0));
        assert!(Pos::default().is_zero());
        assert!(!p.is_zero());
    }
}
