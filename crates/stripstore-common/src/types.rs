//! Core type definitions for stripstore
//!
//! This module defines the identifiers and small value types shared by the
//! engine and its callers: collection and object ids, sequencer positions,
//! and the stat outputs.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Collection identifier: a namespace for objects.
///
/// Collections are ordered by their byte representation. Names may not be
/// empty and may not contain NUL (reserved as the key separator).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Cid(String);

impl Cid {
    /// Create a new collection id, validating the name.
    pub fn new(name: impl Into<String>) -> Result<Self, NameError> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self(name))
    }

    /// Create without validation (internal use only)
    #[must_use]
    pub fn new_unchecked(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Get the collection name as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cid({:?})", self.0)
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Object identifier within a collection.
///
/// Oids are opaque and totally ordered by their byte representation; the pair
/// (cid, oid) uniquely identifies an object header.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Oid(String);

impl Oid {
    /// Create a new object id, validating the name.
    pub fn new(name: impl Into<String>) -> Result<Self, NameError> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self(name))
    }

    /// Create without validation (internal use only)
    #[must_use]
    pub fn new_unchecked(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Get the object name as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Stable 32-bit hash of the object id, used for collection splits.
    #[must_use]
    pub fn stable_hash(&self) -> u32 {
        crc32c::crc32c(self.0.as_bytes())
    }

    /// Whether this object lands in the split bucket `(bits, rem)`:
    /// the low `bits` bits of the stable hash equal `rem`.
    #[must_use]
    pub fn split_match(&self, bits: u32, rem: u32) -> bool {
        let mask = if bits >= 32 { u32::MAX } else { (1u32 << bits) - 1 };
        self.stable_hash() & mask == rem & mask
    }
}

impl fmt::Debug for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Oid({:?})", self.0)
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn validate_name(name: &str) -> Result<(), NameError> {
    if name.is_empty() {
        return Err(NameError::Empty);
    }
    if name.len() > 4096 {
        return Err(NameError::TooLong);
    }
    if name.as_bytes().contains(&0) {
        return Err(NameError::ContainsNul);
    }
    Ok(())
}

/// Errors that can occur when creating a collection or object id
#[derive(Debug, Clone, thiserror::Error)]
pub enum NameError {
    #[error("name cannot be empty")]
    Empty,
    #[error("name cannot exceed 4096 bytes")]
    TooLong,
    #[error("name cannot contain a NUL byte")]
    ContainsNul,
}

/// Position of an operation within the global submit stream.
///
/// Totally ordered lexicographically: global op number, then index within the
/// op's transaction list, then op index within a single transaction. A
/// mutation whose position is less than or equal to the position recorded on
/// an object header has already been applied and is skipped on replay.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SequencerPosition {
    /// Global op number assigned at submit
    pub seq: u64,
    /// Index within the op's transaction list
    pub trans: u32,
    /// Op index within a single transaction
    pub op: u32,
}

impl SequencerPosition {
    /// Create a new position
    #[must_use]
    pub const fn new(seq: u64, trans: u32, op: u32) -> Self {
        Self { seq, trans, op }
    }
}

impl fmt::Display for SequencerPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.seq, self.trans, self.op)
    }
}

/// Stat output for a single object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObjectStat {
    /// Logical object length in bytes
    pub size: u64,
    /// Stripe width of the object
    pub block_size: u64,
    /// Number of stripes covering the object
    pub blocks: u64,
    /// Link count (always 1)
    pub nlink: u32,
}

/// Filesystem-level stats for the store's base directory
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StoreStatFs {
    /// Total bytes on the backing filesystem
    pub total_bytes: u64,
    /// Bytes available to unprivileged users
    pub available_bytes: u64,
    /// Free bytes
    pub free_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cid_valid() {
        assert!(Cid::new("meta").is_ok());
        assert!(Cid::new("pg_1.2").is_ok());
    }

    #[test]
    fn test_cid_invalid() {
        assert!(Cid::new("").is_err());
        assert!(Cid::new("a\0b").is_err());
    }

    #[test]
    fn test_oid_ordering() {
        let a = Oid::new("a").unwrap();
        let b = Oid::new("b").unwrap();
        let ab = Oid::new("ab").unwrap();
        assert!(a < ab);
        assert!(ab < b);
    }

    #[test]
    fn test_split_match_partitions() {
        // With `bits` bits, every oid matches exactly one remainder.
        for name in ["alpha", "beta", "gamma", "delta"] {
            let oid = Oid::new(name).unwrap();
            let matching: Vec<u32> = (0..4).filter(|&rem| oid.split_match(2, rem)).collect();
            assert_eq!(matching.len(), 1);
        }
    }

    #[test]
    fn test_sequencer_position_ordering() {
        let a = SequencerPosition::new(1, 0, 5);
        let b = SequencerPosition::new(1, 1, 0);
        let c = SequencerPosition::new(2, 0, 0);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(a, SequencerPosition::new(1, 0, 5));
        assert_eq!(c.to_string(), "2.0.0");
    }
}
