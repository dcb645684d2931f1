//! Transaction op stream
//!
//! A [`Transaction`] is an ordered sequence of ops applied atomically by the
//! store. The op set is the full wire grammar, including deprecated codes
//! that are recognized but no-ops and the unsupported collection rename.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use stripstore_common::{Cid, Error, Oid, Result};

/// One decoded operation. Variant order is the wire opcode order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TransactionOp {
    /// No-op
    Nop,
    /// Ensure the object exists
    Touch { cid: Cid, oid: Oid },
    /// Write `data` at `offset`; at most `len` bytes of `data` are used
    Write {
        cid: Cid,
        oid: Oid,
        offset: u64,
        len: u64,
        data: Bytes,
    },
    /// Write zeros over `[offset, offset + len)`
    Zero {
        cid: Cid,
        oid: Oid,
        offset: u64,
        len: u64,
    },
    /// Deprecated cache hint; recognized and ignored
    TrimCache {
        cid: Cid,
        oid: Oid,
        offset: u64,
        len: u64,
    },
    /// Set the object length to `size`
    Truncate { cid: Cid, oid: Oid, size: u64 },
    /// Remove the object
    Remove { cid: Cid, oid: Oid },
    /// Set one attribute
    SetAttr {
        cid: Cid,
        oid: Oid,
        name: String,
        value: Bytes,
    },
    /// Set several attributes
    SetAttrs {
        cid: Cid,
        oid: Oid,
        attrs: BTreeMap<String, Bytes>,
    },
    /// Remove one attribute
    RmAttr { cid: Cid, oid: Oid, name: String },
    /// Remove all attributes
    RmAttrs { cid: Cid, oid: Oid },
    /// Clone `src` to `dst` within the collection
    Clone { cid: Cid, src: Oid, dst: Oid },
    /// Clone `[offset, offset + len)` of `src` to the same range of `dst`
    CloneRange {
        cid: Cid,
        src: Oid,
        dst: Oid,
        offset: u64,
        len: u64,
    },
    /// Clone `[src_offset, src_offset + len)` of `src` to `dst_offset` of `dst`
    CloneRange2 {
        cid: Cid,
        src: Oid,
        dst: Oid,
        src_offset: u64,
        len: u64,
        dst_offset: u64,
    },
    /// Create a collection
    MkColl { cid: Cid },
    /// Destroy an empty collection
    RmColl { cid: Cid },
    /// Copy an object's data from `old_cid` into `cid` under the same name
    CollAdd { cid: Cid, old_cid: Cid, oid: Oid },
    /// Remove an object (collection-scoped removal)
    CollRemove { cid: Cid, oid: Oid },
    /// Deprecated move: add to `cid` then remove from `old_cid`
    CollMove { old_cid: Cid, cid: Cid, oid: Oid },
    /// Move and rename an object across collections
    CollMoveRename {
        old_cid: Cid,
        old_oid: Oid,
        cid: Cid,
        oid: Oid,
    },
    /// Set one collection attribute
    CollSetAttr { cid: Cid, name: String, value: Bytes },
    /// Remove one collection attribute
    CollRmAttr { cid: Cid, name: String },
    /// Commit nudge; recognized and ignored
    StartSync,
    /// Collection rename; recognized and rejected as unsupported
    CollRename { cid: Cid, new_cid: Cid },
    /// Remove every omap key and the omap header
    OmapClear { cid: Cid, oid: Oid },
    /// Insert or overwrite omap keys
    OmapSetKeys {
        cid: Cid,
        oid: Oid,
        keys: BTreeMap<String, Bytes>,
    },
    /// Remove omap keys
    OmapRmKeys {
        cid: Cid,
        oid: Oid,
        keys: BTreeSet<String>,
    },
    /// Remove omap keys in `[first, last)`
    OmapRmKeyRange {
        cid: Cid,
        oid: Oid,
        first: String,
        last: String,
    },
    /// Set the omap header blob
    OmapSetHeader { cid: Cid, oid: Oid, data: Bytes },
    /// Reserved split variant; recognized and ignored
    SplitCollection {
        cid: Cid,
        bits: u32,
        rem: u32,
        dest: Cid,
    },
    /// Move objects matching `(bits, rem)` from `cid` into `dest`
    SplitCollection2 {
        cid: Cid,
        bits: u32,
        rem: u32,
        dest: Cid,
    },
}

/// An ordered list of ops applied as one atomic unit
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Transaction {
    ops: Vec<TransactionOp>,
}

impl Transaction {
    /// Empty transaction
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ops in application order
    #[must_use]
    pub fn ops(&self) -> &[TransactionOp] {
        &self.ops
    }

    /// Number of ops
    #[must_use]
    pub fn num_ops(&self) -> usize {
        self.ops.len()
    }

    /// Total data payload bytes carried by the transaction
    #[must_use]
    pub fn num_bytes(&self) -> u64 {
        self.ops
            .iter()
            .map(|op| match op {
                TransactionOp::Write { data, .. } => data.len() as u64,
                TransactionOp::SetAttr { value, .. } => value.len() as u64,
                TransactionOp::SetAttrs { attrs, .. } => {
                    attrs.values().map(|v| v.len() as u64).sum()
                }
                TransactionOp::OmapSetKeys { keys, .. } => {
                    keys.values().map(|v| v.len() as u64).sum()
                }
                TransactionOp::OmapSetHeader { data, .. } => data.len() as u64,
                _ => 0,
            })
            .sum()
    }

    /// Append a raw op
    pub fn push(&mut self, op: TransactionOp) {
        self.ops.push(op);
    }

    /// Encode to the wire format
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).expect("transaction serialization cannot fail")
    }

    /// Decode from the wire format
    pub fn decode(raw: &[u8]) -> Result<Self> {
        bincode::deserialize(raw)
            .map_err(|e| Error::invalid_argument(format!("decode transaction: {e}")))
    }

    /// Structured dump for fatal-error reporting
    #[must_use]
    pub fn dump(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!("<undumpable>"))
    }

    // Builder helpers, one per opcode

    pub fn nop(&mut self) {
        self.push(TransactionOp::Nop);
    }

    pub fn touch(&mut self, cid: &Cid, oid: &Oid) {
        self.push(TransactionOp::Touch {
            cid: cid.clone(),
            oid: oid.clone(),
        });
    }

    pub fn write(&mut self, cid: &Cid, oid: &Oid, offset: u64, data: impl Into<Bytes>) {
        let data = data.into();
        self.push(TransactionOp::Write {
            cid: cid.clone(),
            oid: oid.clone(),
            offset,
            len: data.len() as u64,
            data,
        });
    }

    pub fn zero(&mut self, cid: &Cid, oid: &Oid, offset: u64, len: u64) {
        self.push(TransactionOp::Zero {
            cid: cid.clone(),
            oid: oid.clone(),
            offset,
            len,
        });
    }

    pub fn trim_cache(&mut self, cid: &Cid, oid: &Oid, offset: u64, len: u64) {
        self.push(TransactionOp::TrimCache {
            cid: cid.clone(),
            oid: oid.clone(),
            offset,
            len,
        });
    }

    pub fn truncate(&mut self, cid: &Cid, oid: &Oid, size: u64) {
        self.push(TransactionOp::Truncate {
            cid: cid.clone(),
            oid: oid.clone(),
            size,
        });
    }

    pub fn remove(&mut self, cid: &Cid, oid: &Oid) {
        self.push(TransactionOp::Remove {
            cid: cid.clone(),
            oid: oid.clone(),
        });
    }

    pub fn setattr(&mut self, cid: &Cid, oid: &Oid, name: impl Into<String>, value: impl Into<Bytes>) {
        self.push(TransactionOp::SetAttr {
            cid: cid.clone(),
            oid: oid.clone(),
            name: name.into(),
            value: value.into(),
        });
    }

    pub fn setattrs(&mut self, cid: &Cid, oid: &Oid, attrs: BTreeMap<String, Bytes>) {
        self.push(TransactionOp::SetAttrs {
            cid: cid.clone(),
            oid: oid.clone(),
            attrs,
        });
    }

    pub fn rmattr(&mut self, cid: &Cid, oid: &Oid, name: impl Into<String>) {
        self.push(TransactionOp::RmAttr {
            cid: cid.clone(),
            oid: oid.clone(),
            name: name.into(),
        });
    }

    pub fn rmattrs(&mut self, cid: &Cid, oid: &Oid) {
        self.push(TransactionOp::RmAttrs {
            cid: cid.clone(),
            oid: oid.clone(),
        });
    }

    pub fn clone_object(&mut self, cid: &Cid, src: &Oid, dst: &Oid) {
        self.push(TransactionOp::Clone {
            cid: cid.clone(),
            src: src.clone(),
            dst: dst.clone(),
        });
    }

    pub fn clone_range(&mut self, cid: &Cid, src: &Oid, dst: &Oid, offset: u64, len: u64) {
        self.push(TransactionOp::CloneRange {
            cid: cid.clone(),
            src: src.clone(),
            dst: dst.clone(),
            offset,
            len,
        });
    }

    pub fn clone_range2(
        &mut self,
        cid: &Cid,
        src: &Oid,
        dst: &Oid,
        src_offset: u64,
        len: u64,
        dst_offset: u64,
    ) {
        self.push(TransactionOp::CloneRange2 {
            cid: cid.clone(),
            src: src.clone(),
            dst: dst.clone(),
            src_offset,
            len,
            dst_offset,
        });
    }

    pub fn create_collection(&mut self, cid: &Cid) {
        self.push(TransactionOp::MkColl { cid: cid.clone() });
    }

    pub fn remove_collection(&mut self, cid: &Cid) {
        self.push(TransactionOp::RmColl { cid: cid.clone() });
    }

    pub fn collection_add(&mut self, cid: &Cid, old_cid: &Cid, oid: &Oid) {
        self.push(TransactionOp::CollAdd {
            cid: cid.clone(),
            old_cid: old_cid.clone(),
            oid: oid.clone(),
        });
    }

    pub fn collection_remove(&mut self, cid: &Cid, oid: &Oid) {
        self.push(TransactionOp::CollRemove {
            cid: cid.clone(),
            oid: oid.clone(),
        });
    }

    pub fn collection_move(&mut self, old_cid: &Cid, cid: &Cid, oid: &Oid) {
        self.push(TransactionOp::CollMove {
            old_cid: old_cid.clone(),
            cid: cid.clone(),
            oid: oid.clone(),
        });
    }

    pub fn collection_move_rename(&mut self, old_cid: &Cid, old_oid: &Oid, cid: &Cid, oid: &Oid) {
        self.push(TransactionOp::CollMoveRename {
            old_cid: old_cid.clone(),
            old_oid: old_oid.clone(),
            cid: cid.clone(),
            oid: oid.clone(),
        });
    }

    pub fn collection_setattr(&mut self, cid: &Cid, name: impl Into<String>, value: impl Into<Bytes>) {
        self.push(TransactionOp::CollSetAttr {
            cid: cid.clone(),
            name: name.into(),
            value: value.into(),
        });
    }

    pub fn collection_rmattr(&mut self, cid: &Cid, name: impl Into<String>) {
        self.push(TransactionOp::CollRmAttr {
            cid: cid.clone(),
            name: name.into(),
        });
    }

    pub fn start_sync(&mut self) {
        self.push(TransactionOp::StartSync);
    }

    pub fn collection_rename(&mut self, cid: &Cid, new_cid: &Cid) {
        self.push(TransactionOp::CollRename {
            cid: cid.clone(),
            new_cid: new_cid.clone(),
        });
    }

    pub fn omap_clear(&mut self, cid: &Cid, oid: &Oid) {
        self.push(TransactionOp::OmapClear {
            cid: cid.clone(),
            oid: oid.clone(),
        });
    }

    pub fn omap_setkeys(&mut self, cid: &Cid, oid: &Oid, keys: BTreeMap<String, Bytes>) {
        self.push(TransactionOp::OmapSetKeys {
            cid: cid.clone(),
            oid: oid.clone(),
            keys,
        });
    }

    pub fn omap_rmkeys(&mut self, cid: &Cid, oid: &Oid, keys: BTreeSet<String>) {
        self.push(TransactionOp::OmapRmKeys {
            cid: cid.clone(),
            oid: oid.clone(),
            keys,
        });
    }

    pub fn omap_rmkeyrange(
        &mut self,
        cid: &Cid,
        oid: &Oid,
        first: impl Into<String>,
        last: impl Into<String>,
    ) {
        self.push(TransactionOp::OmapRmKeyRange {
            cid: cid.clone(),
            oid: oid.clone(),
            first: first.into(),
            last: last.into(),
        });
    }

    pub fn omap_setheader(&mut self, cid: &Cid, oid: &Oid, data: impl Into<Bytes>) {
        self.push(TransactionOp::OmapSetHeader {
            cid: cid.clone(),
            oid: oid.clone(),
            data: data.into(),
        });
    }

    pub fn split_collection(&mut self, cid: &Cid, bits: u32, rem: u32, dest: &Cid) {
        self.push(TransactionOp::SplitCollection {
            cid: cid.clone(),
            bits,
            rem,
            dest: dest.clone(),
        });
    }

    pub fn split_collection2(&mut self, cid: &Cid, bits: u32, rem: u32, dest: &Cid) {
        self.push(TransactionOp::SplitCollection2 {
            cid: cid.clone(),
            bits,
            rem,
            dest: dest.clone(),
        });
    }
}
