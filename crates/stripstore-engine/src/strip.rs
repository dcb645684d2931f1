//! Strip object map
//!
//! Translates byte-addressable object streams into fixed-size stripe rows in
//! the object map. Each object header tracks its stripe width, logical size,
//! a presence bitmap (bit set = stripe row materialized, bit clear = implicit
//! zero hole), and the sequencer position of the last applied mutation.

use crate::kv::KvBatch;
use crate::object_map::{Header, ObjectMap, Prefix};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use stripstore_common::{Cid, Error, Oid, Result, SequencerPosition};
use tracing::{debug, trace};

/// Presence bitmap indexed by stripe number
///
/// One bit per stripe, byte-packed. After any write or truncate the length is
/// `ceil(max_size / strip_size) + 1`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StripBitmap {
    bytes: Vec<u8>,
    len: usize,
}

impl StripBitmap {
    /// Empty bitmap
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracked stripes
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether no stripes are tracked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether stripe `no` is materialized; out-of-range stripes are holes.
    #[must_use]
    pub fn get(&self, no: u64) -> bool {
        if no as usize >= self.len {
            return false;
        }
        self.bytes[(no / 8) as usize] & (1 << (no % 8)) != 0
    }

    /// Set or clear the presence bit for stripe `no`.
    ///
    /// # Panics
    /// Panics if `no` is out of range; resize first.
    pub fn set(&mut self, no: u64, present: bool) {
        assert!((no as usize) < self.len, "stripe {no} out of bitmap range");
        let byte = (no / 8) as usize;
        let bit = 1u8 << (no % 8);
        if present {
            self.bytes[byte] |= bit;
        } else {
            self.bytes[byte] &= !bit;
        }
    }

    /// Resize to `new_len` stripes; new stripes start as holes.
    pub fn resize(&mut self, new_len: usize) {
        if new_len < self.len {
            // Clear dropped bits so the encoding stays canonical
            for no in new_len..self.len {
                self.bytes[no / 8] &= !(1 << (no % 8));
            }
        }
        self.len = new_len;
        self.bytes.resize(new_len.div_ceil(8), 0);
    }

    /// Stripe numbers with the presence bit set
    pub fn ones(&self) -> impl Iterator<Item = u64> + '_ {
        (0..self.len as u64).filter(|&no| self.get(no))
    }
}

/// One stripe-relative piece of a byte range
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StripExtent {
    /// Stripe number
    pub no: u64,
    /// Offset within the stripe
    pub offset: u64,
    /// Length within the stripe
    pub len: u64,
}

impl StripExtent {
    #[must_use]
    pub const fn new(no: u64, offset: u64, len: u64) -> Self {
        Self { no, offset, len }
    }
}

/// Split `[offset, offset + len)` into stripe extents.
///
/// The first extent may start mid-stripe; middle extents are whole stripes;
/// the last extent may end mid-stripe. Extents are non-empty and their
/// lengths sum to `len`. An empty range yields no extents.
#[must_use]
pub fn file_to_extents(offset: u64, len: u64, strip_size: u64) -> Vec<StripExtent> {
    let mut extents = Vec::new();
    if len == 0 {
        return extents;
    }

    let mut start = offset / strip_size;
    let end = (offset + len) / strip_size;
    let mut strip_offset = start * strip_size;

    // The range may begin in the middle of the first stripe
    if offset > strip_offset {
        let extent_offset = offset - strip_offset;
        let extent_len = if extent_offset + len <= strip_size {
            len
        } else {
            strip_size - extent_offset
        };
        extents.push(StripExtent::new(start, extent_offset, extent_len));
        start += 1;
        strip_offset += strip_size;
    }

    while start < end {
        extents.push(StripExtent::new(start, 0, strip_size));
        start += 1;
        strip_offset += strip_size;
    }

    // The range may end in the middle of the last stripe
    if offset + len > strip_offset {
        extents.push(StripExtent::new(start, 0, offset + len - strip_offset));
    }

    debug_assert!(!extents.is_empty());
    extents
}

/// KV key for stripe `no`: zero-padded hex so key order equals stripe order.
#[must_use]
pub fn strip_object_key(no: u64) -> String {
    format!("{no:016x}")
}

/// Persistent portion of a strip header
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct StripHeaderRecord {
    strip_size: u64,
    max_size: u64,
    bits: StripBitmap,
    spos: SequencerPosition,
}

/// In-memory strip header for one object.
///
/// `deleted` and `buffers` exist only inside a buffered transaction and are
/// never persisted; `buffers` maps `(prefix, key)` to the value staged by an
/// earlier op in the same transaction (`None` marks a staged removal).
pub struct StripHeader {
    pub cid: Cid,
    pub oid: Oid,
    /// Stripe width, fixed at creation
    pub strip_size: u64,
    /// Logical object length in bytes
    pub max_size: u64,
    /// Stripe presence bitmap
    pub bits: StripBitmap,
    /// Position of the last applied mutation
    pub spos: SequencerPosition,
    /// Tombstone; set only inside a buffered transaction
    pub deleted: bool,
    /// Transaction-local staged values
    pub buffers: BTreeMap<(Prefix, String), Option<Bytes>>,
    /// Backing object-map handle
    pub handle: Header,
}

impl StripHeader {
    fn from_parts(handle: Header, rec: StripHeaderRecord, default_strip_size: u64) -> Self {
        let strip_size = if rec.strip_size == 0 {
            default_strip_size
        } else {
            rec.strip_size
        };
        Self {
            cid: handle.cid.clone(),
            oid: handle.oid.clone(),
            strip_size,
            max_size: rec.max_size,
            bits: rec.bits,
            spos: rec.spos,
            deleted: false,
            buffers: BTreeMap::new(),
            handle,
        }
    }

    fn record(&self) -> StripHeaderRecord {
        StripHeaderRecord {
            strip_size: self.strip_size,
            max_size: self.max_size,
            bits: self.bits.clone(),
            spos: self.spos,
        }
    }

    /// Bitmap length required for `max_size`
    #[must_use]
    pub fn bits_len_for(&self, max_size: u64) -> usize {
        (max_size.div_ceil(self.strip_size) + 1) as usize
    }
}

impl std::fmt::Debug for StripHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripHeader")
            .field("cid", &self.cid)
            .field("oid", &self.oid)
            .field("strip_size", &self.strip_size)
            .field("max_size", &self.max_size)
            .field("spos", &self.spos)
            .field("deleted", &self.deleted)
            .finish()
    }
}

/// Strip-aware facade over the object map
pub struct StripObjectMap {
    map: ObjectMap,
    default_strip_size: u64,
}

impl StripObjectMap {
    /// Wrap `map`, using `default_strip_size` for newly created objects.
    #[must_use]
    pub fn new(map: ObjectMap, default_strip_size: u64) -> Self {
        Self {
            map,
            default_strip_size,
        }
    }

    /// The underlying object map
    #[must_use]
    pub fn map(&self) -> &ObjectMap {
        &self.map
    }

    /// Stripe width for newly created objects
    #[must_use]
    pub fn default_strip_size(&self) -> u64 {
        self.default_strip_size
    }

    /// Look up an object's strip header.
    pub fn lookup_strip_header(&self, cid: &Cid, oid: &Oid) -> Result<StripHeader> {
        let handle = self
            .map
            .lookup_header(cid, oid)?
            .ok_or_else(|| Error::not_found(format!("{cid}/{oid}")))?;
        let rec = if handle.data.is_empty() {
            StripHeaderRecord::default()
        } else {
            bincode::deserialize(&handle.data)
                .map_err(|e| Error::storage(format!("decode strip header: {e}")))?
        };
        trace!(%cid, %oid, "lookup_strip_header done");
        Ok(StripHeader::from_parts(handle, rec, self.default_strip_size))
    }

    /// Create an empty strip header, staging the new row into `batch`.
    pub fn create_strip_header(
        &self,
        cid: &Cid,
        oid: &Oid,
        batch: &mut KvBatch,
    ) -> Result<StripHeader> {
        let handle = self.map.lookup_create_header(cid, oid, batch)?;
        let mut rec = StripHeaderRecord {
            strip_size: self.default_strip_size,
            ..Default::default()
        };
        rec.bits.resize(1);
        Ok(StripHeader::from_parts(handle, rec, self.default_strip_size))
    }

    /// Re-encode the header payload and stage the header row.
    pub fn save_strip_header(&self, header: &mut StripHeader, batch: &mut KvBatch) -> Result<()> {
        header.handle.data = bincode::serialize(&header.record())
            .map_err(|e| Error::storage(format!("encode strip header: {e}")))?;
        self.map.set_header(&header.handle, batch);
        Ok(())
    }

    /// Whether a mutation at `spos` was already applied to `header` and must
    /// be skipped (idempotent replay).
    #[must_use]
    pub fn check_spos(&self, header: &StripHeader, spos: &SequencerPosition) -> bool {
        if *spos > header.spos {
            trace!(oid = %header.oid, %spos, header_spos = %header.spos, "applying op");
            false
        } else {
            debug!(oid = %header.oid, %spos, header_spos = %header.spos, "skipping replayed op");
            true
        }
    }

    /// Clone `old` into (cid, oid) and return the target header.
    ///
    /// The target inherits size, bitmap, and the source's transaction-local
    /// buffers; both headers record `spos` as their last mutation.
    pub fn clone_wrap(
        &self,
        old: &mut StripHeader,
        cid: &Cid,
        oid: &Oid,
        batch: &mut KvBatch,
        spos: &SequencerPosition,
    ) -> Result<StripHeader> {
        let target_handle = self.map.clone(&old.handle, cid, oid, batch)?;
        old.spos = *spos;
        Ok(StripHeader {
            cid: cid.clone(),
            oid: oid.clone(),
            strip_size: old.strip_size,
            max_size: old.max_size,
            bits: old.bits.clone(),
            spos: *spos,
            deleted: false,
            buffers: old.buffers.clone(),
            handle: target_handle,
        })
    }

    /// Rename `header` to (cid, oid); records `spos` on the header.
    pub fn rename_wrap(
        &self,
        header: &mut StripHeader,
        cid: &Cid,
        oid: &Oid,
        batch: &mut KvBatch,
        spos: &SequencerPosition,
    ) {
        self.map.rename(&mut header.handle, cid, oid, batch);
        header.cid = cid.clone();
        header.oid = oid.clone();
        header.spos = *spos;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extents_empty() {
        assert!(file_to_extents(10, 0, 4).is_empty());
    }

    #[test]
    fn test_extents_aligned_single() {
        let e = file_to_extents(0, 4, 4);
        assert_eq!(e, vec![StripExtent::new(0, 0, 4)]);
    }

    #[test]
    fn test_extents_partial_left() {
        let e = file_to_extents(2, 2, 4);
        assert_eq!(e, vec![StripExtent::new(0, 2, 2)]);
    }

    #[test]
    fn test_extents_spanning() {
        // [3, 11) over stripes of 4: partial left, full middle, partial right
        let e = file_to_extents(3, 8, 4);
        assert_eq!(
            e,
            vec![
                StripExtent::new(0, 3, 1),
                StripExtent::new(1, 0, 4),
                StripExtent::new(2, 0, 3),
            ]
        );
        let total: u64 = e.iter().map(|x| x.len).sum();
        assert_eq!(total, 8);
    }

    #[test]
    fn test_extents_partial_right_only() {
        let e = file_to_extents(4, 3, 4);
        assert_eq!(e, vec![StripExtent::new(1, 0, 3)]);
    }

    #[test]
    fn test_extents_lengths_cover_range() {
        for offset in 0..12 {
            for len in 1..20 {
                let extents = file_to_extents(offset, len, 4);
                assert!(!extents.is_empty());
                let total: u64 = extents.iter().map(|e| e.len).sum();
                assert_eq!(total, len, "offset={offset} len={len}");
                for e in &extents {
                    assert!(e.len > 0);
                    assert!(e.offset + e.len <= 4);
                }
            }
        }
    }

    #[test]
    fn test_strip_object_key_sorts_numerically() {
        let mut keys: Vec<String> = [0u64, 9, 10, 255, 256, 1 << 32]
            .iter()
            .map(|&n| strip_object_key(n))
            .collect();
        let sorted = keys.clone();
        keys.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn test_bitmap_set_get_resize() {
        let mut bits = StripBitmap::new();
        bits.resize(10);
        assert_eq!(bits.len(), 10);
        assert!(!bits.get(3));

        bits.set(3, true);
        bits.set(9, true);
        assert!(bits.get(3));
        assert!(bits.get(9));
        assert_eq!(bits.ones().collect::<Vec<_>>(), vec![3, 9]);

        // Shrink drops bit 9, grow must not resurrect it
        bits.resize(5);
        bits.resize(12);
        assert!(bits.get(3));
        assert!(!bits.get(9));
    }

    #[test]
    fn test_bitmap_out_of_range_is_hole() {
        let mut bits = StripBitmap::new();
        bits.resize(2);
        assert!(!bits.get(100));
    }

    #[test]
    fn test_header_record_roundtrip() {
        let mut bits = StripBitmap::new();
        bits.resize(3);
        bits.set(1, true);
        let rec = StripHeaderRecord {
            strip_size: 4096,
            max_size: 5000,
            bits: bits.clone(),
            spos: SequencerPosition::new(7, 1, 2),
        };
        let raw = bincode::serialize(&rec).unwrap();
        let back: StripHeaderRecord = bincode::deserialize(&raw).unwrap();
        assert_eq!(back.strip_size, 4096);
        assert_eq!(back.max_size, 5000);
        assert_eq!(back.bits, bits);
        assert_eq!(back.spos, SequencerPosition::new(7, 1, 2));
    }
}
