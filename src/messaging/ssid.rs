//! Topic keys (SSIDs).
//!
//! A topic key is the hashed, tenant-prefixed form of a '/'-delimited topic:
//! element 0 is the tenant id and every following element is the xxHash32 of
//! one non-empty topic segment. Matching walks these integers and never
//! compares strings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hasher;

use thiserror::Error;
use twox_hash::XxHash32;

/// Fixed seed for segment hashing; every node in a cluster must agree on it.
pub const HASH_SEED: u32 = 0x9747_b28c;

/// Hash of the single-level wildcard token `+` under [`HASH_SEED`].
pub const WILDCARD: u32 = 0x9163_ee52;

/// Single-level wildcard token as it appears in topic strings.
pub const WILDCARD_TOKEN: &str = "+";

/// Topic separator.
pub const SEPARATOR: char = '/';

/// Hash one topic segment.
pub fn hash_segment(segment: &str) -> u32 {
    let mut hasher = XxHash32::with_seed(HASH_SEED);
    Hasher::write(&mut hasher, segment.as_bytes());
    Hasher::finish(&hasher) as u32
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopicError {
    #[error("topic is empty")]
    Empty,
    #[error("topic contains a non-ASCII character at byte {0}")]
    NonAscii(usize),
    #[error("topic contains a NUL byte at {0}")]
    ContainsNul(usize),
    #[error("topic length {len} exceeds limit {max}")]
    TooLong { len: usize, max: usize },
}

/// Tenant-prefixed hashed topic key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Ssid(Vec<u32>);

impl Ssid {
    /// Build the key for `topic` under `tenant`.
    ///
    /// Empty segments (including the one after a trailing '/') are skipped, so
    /// `"a/b/"`, `"a/b"` and `"a//b"` produce the same key. The topic is assumed
    /// to be well formed; use [`Ssid::parse`] at trust boundaries.
    pub fn new(tenant: u32, topic: &str) -> Self {
        let mut parts = Vec::with_capacity(1 + topic.len() / 4);
        parts.push(tenant);
        parts.extend(
            topic
                .split(SEPARATOR)
                .filter(|segment| !segment.is_empty())
                .map(hash_segment),
        );
        Self(parts)
    }

    /// Validate `topic` and build its key.
    ///
    /// Topics travel inside peer frames one byte per character with a NUL
    /// terminator, so only ASCII without NUL is accepted.
    pub fn parse(tenant: u32, topic: &str, max_len: usize) -> Result<Self, TopicError> {
        if topic.split(SEPARATOR).all(str::is_empty) {
            return Err(TopicError::Empty);
        }
        if topic.len() > max_len {
            return Err(TopicError::TooLong {
                len: topic.len(),
                max: max_len,
            });
        }
        for (offset, byte) in topic.bytes().enumerate() {
            if byte == 0 {
                return Err(TopicError::ContainsNul(offset));
            }
            if !byte.is_ascii() {
                return Err(TopicError::NonAscii(offset));
            }
        }
        Ok(Self::new(tenant, topic))
    }

    /// Key made of raw parts, tenant first.
    pub fn from_parts(parts: Vec<u32>) -> Self {
        Self(parts)
    }

    pub fn tenant(&self) -> u32 {
        self.0.first().copied().unwrap_or_default()
    }

    /// Segment hashes without the tenant.
    pub fn segments(&self) -> &[u32] {
        self.0.get(1..).unwrap_or(&[])
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when any segment is the single-level wildcard.
    pub fn has_wildcard(&self) -> bool {
        self.segments().contains(&WILDCARD)
    }
}

impl AsRef<[u32]> for Ssid {
    fn as_ref(&self) -> &[u32] {
        &self.0
    }
}

impl fmt::Display for Ssid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "{part:08x}")?;
        }
        Ok(())
    }
}
