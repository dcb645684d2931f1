//! Generic object map
//!
//! Maps (collection, object) pairs onto the KV keyspace. Every object owns a
//! header row holding a store-unique sequence number plus an opaque payload,
//! and a set of data rows keyed by that sequence number, one namespace per
//! [`Prefix`]. Rename therefore moves only the header row; clone copies the
//! source's data rows onto a fresh sequence number.
//!
//! Header handles returned by `lookup_header` / `lookup_create_header` hold
//! their sequence number in an in-use set; a second lookup of the same object
//! blocks until the first handle is dropped, which is what serializes two
//! buffered transactions touching the same object.

use crate::kv::{KeyValueDb, KvBatch};
use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use stripstore_common::{Cid, Error, Oid, Result};
use tracing::{debug, trace};

/// Per-object KV namespaces
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Prefix {
    /// Fixed-size data stripes
    Strip,
    /// Flat object attributes
    Xattr,
    /// Sorted user key map
    Omap,
    /// Single-entry omap header blob
    OmapHeader,
    /// Collection attributes (meta-collection objects only)
    CollAttr,
}

impl Prefix {
    fn tag(self) -> u8 {
        match self {
            Prefix::Strip => b's',
            Prefix::Xattr => b'x',
            Prefix::Omap => b'o',
            Prefix::OmapHeader => b'h',
            Prefix::CollAttr => b'c',
        }
    }
}

/// Key under [`Prefix::OmapHeader`] holding the omap header blob
pub const OMAP_HEADER_KEY: &str = "__omap_header__";

const HEADER_TAG: u8 = b'H';
const DATA_TAG: u8 = b'D';
const SYS_TAG: u8 = b'S';
const SEP: u8 = 0;

const NEXT_SEQ_KEY: &[u8] = b"next_seq";

/// Length of a data-row prefix up to and including the sequence number
const DATA_SEQ_PREFIX_LEN: usize = 1 + 8;

fn header_key(cid: &Cid, oid: &Oid) -> Vec<u8> {
    let mut key = Vec::with_capacity(2 + cid.as_str().len() + oid.as_str().len());
    key.push(HEADER_TAG);
    key.extend_from_slice(cid.as_str().as_bytes());
    key.push(SEP);
    key.extend_from_slice(oid.as_str().as_bytes());
    key
}

fn header_prefix(cid: &Cid) -> Vec<u8> {
    let mut key = Vec::with_capacity(2 + cid.as_str().len());
    key.push(HEADER_TAG);
    key.extend_from_slice(cid.as_str().as_bytes());
    key.push(SEP);
    key
}

fn data_seq_prefix(seq: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(DATA_SEQ_PREFIX_LEN);
    key.push(DATA_TAG);
    key.extend_from_slice(&seq.to_be_bytes()); // big-endian for sort order
    key
}

fn data_prefix(seq: u64, prefix: Prefix) -> Vec<u8> {
    let mut key = data_seq_prefix(seq);
    key.push(prefix.tag());
    key
}

fn data_key(seq: u64, prefix: Prefix, user_key: &str) -> Vec<u8> {
    let mut key = data_prefix(seq, prefix);
    key.extend_from_slice(user_key.as_bytes());
    key
}

fn sys_key(name: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + name.len());
    key.push(SYS_TAG);
    key.extend_from_slice(name);
    key
}

/// Persistent header row payload
#[derive(Debug, Clone, Serialize, Deserialize)]
struct HeaderRecord {
    seq: u64,
    data: Vec<u8>,
}

impl HeaderRecord {
    fn decode(raw: &[u8]) -> Result<Self> {
        bincode::deserialize(raw).map_err(|e| Error::storage(format!("decode header record: {e}")))
    }

    fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).expect("header record serialization cannot fail")
    }
}

struct InUse {
    set: Mutex<HashSet<u64>>,
    cond: Condvar,
}

impl InUse {
    fn new() -> Self {
        Self {
            set: Mutex::new(HashSet::new()),
            cond: Condvar::new(),
        }
    }

    fn acquire(&self, seq: u64) {
        let mut set = self.set.lock();
        while set.contains(&seq) {
            trace!(seq, "header in use, waiting");
            self.cond.wait(&mut set);
        }
        set.insert(seq);
    }

    fn release(&self, seq: u64) {
        let mut set = self.set.lock();
        set.remove(&seq);
        self.cond.notify_all();
    }
}

/// Handle to an object header. Holds the header's sequence number in the
/// in-use set until dropped; concurrent lookups of the same object block.
pub struct Header {
    pub seq: u64,
    pub cid: Cid,
    pub oid: Oid,
    /// Opaque payload (the strip layer's encoded header)
    pub data: Vec<u8>,
    in_use: Arc<InUse>,
}

impl Drop for Header {
    fn drop(&mut self) {
        self.in_use.release(self.seq);
    }
}

impl std::fmt::Debug for Header {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Header")
            .field("seq", &self.seq)
            .field("cid", &self.cid)
            .field("oid", &self.oid)
            .finish()
    }
}

/// Sorted cursor over one object's keys under a prefix.
///
/// The snapshot is taken at construction; mutations staged afterwards are not
/// visible.
pub struct OmapIterator {
    entries: Vec<(String, Bytes)>,
    pos: usize,
}

impl OmapIterator {
    fn new(entries: Vec<(String, Bytes)>) -> Self {
        Self { entries, pos: 0 }
    }

    /// Position at the first entry with key >= `key`
    pub fn lower_bound(&mut self, key: &str) {
        self.pos = self.entries.partition_point(|(k, _)| k.as_str() < key);
    }

    /// Position at the first entry
    pub fn seek_to_first(&mut self) {
        self.pos = 0;
    }

    /// Whether the cursor points at an entry
    #[must_use]
    pub fn valid(&self) -> bool {
        self.pos < self.entries.len()
    }

    /// Current key, if the cursor is valid
    #[must_use]
    pub fn key(&self) -> Option<&str> {
        self.entries.get(self.pos).map(|(k, _)| k.as_str())
    }

    /// Current value, if the cursor is valid
    #[must_use]
    pub fn value(&self) -> Option<Bytes> {
        self.entries.get(self.pos).map(|(_, v)| v.clone())
    }

    /// Advance to the next entry
    pub fn next(&mut self) {
        if self.pos < self.entries.len() {
            self.pos += 1;
        }
    }
}

/// The generic object map over a KV backend
pub struct ObjectMap {
    db: Arc<dyn KeyValueDb>,
    next_seq: AtomicU64,
    in_use: Arc<InUse>,
}

impl ObjectMap {
    /// Open the map over `db`, restoring the sequence counter.
    pub fn new(db: Arc<dyn KeyValueDb>) -> Result<Self> {
        let next_seq = match db.get(&sys_key(NEXT_SEQ_KEY))? {
            Some(raw) => {
                let bytes: [u8; 8] = raw
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::storage("corrupt sequence counter"))?;
                u64::from_be_bytes(bytes)
            }
            None => 0,
        };
        debug!(next_seq, "object map opened");
        Ok(Self {
            db,
            next_seq: AtomicU64::new(next_seq),
            in_use: Arc::new(InUse::new()),
        })
    }

    /// Allocate a fresh header sequence number and persist the counter into
    /// the caller's batch.
    fn alloc_seq(&self, batch: &mut KvBatch) -> u64 {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        batch.set(sys_key(NEXT_SEQ_KEY), seq.to_be_bytes().to_vec());
        seq
    }

    fn make_header(&self, seq: u64, cid: &Cid, oid: &Oid, data: Vec<u8>) -> Header {
        Header {
            seq,
            cid: cid.clone(),
            oid: oid.clone(),
            data,
            in_use: Arc::clone(&self.in_use),
        }
    }

    /// Committed sequence number for (cid, oid), without touching the in-use
    /// set. Read-side paths use this so a transaction holding the header
    /// handle can still read through the backend.
    pub(crate) fn read_seq(&self, cid: &Cid, oid: &Oid) -> Result<Option<u64>> {
        match self.db.get(&header_key(cid, oid))? {
            Some(raw) => Ok(Some(HeaderRecord::decode(&raw)?.seq)),
            None => Ok(None),
        }
    }

    /// Whether a committed header row exists
    pub fn contains_header(&self, cid: &Cid, oid: &Oid) -> Result<bool> {
        Ok(self.read_seq(cid, oid)?.is_some())
    }

    /// Look up a header, blocking while another handle to it is live.
    pub fn lookup_header(&self, cid: &Cid, oid: &Oid) -> Result<Option<Header>> {
        loop {
            let Some(raw) = self.db.get(&header_key(cid, oid))? else {
                return Ok(None);
            };
            let rec = HeaderRecord::decode(&raw)?;
            self.in_use.acquire(rec.seq);

            // The row may have changed while we waited for the holder
            let reread = self
                .db
                .get(&header_key(cid, oid))
                .and_then(|raw2| raw2.map(|r| HeaderRecord::decode(&r)).transpose());
            match reread {
                Ok(Some(rec2)) if rec2.seq == rec.seq => {
                    return Ok(Some(self.make_header(rec2.seq, cid, oid, rec2.data)));
                }
                Ok(Some(_)) => self.in_use.release(rec.seq),
                Ok(None) => {
                    self.in_use.release(rec.seq);
                    return Ok(None);
                }
                Err(e) => {
                    self.in_use.release(rec.seq);
                    return Err(e);
                }
            }
        }
    }

    /// Look up a header, creating an empty one in `batch` if absent.
    pub fn lookup_create_header(
        &self,
        cid: &Cid,
        oid: &Oid,
        batch: &mut KvBatch,
    ) -> Result<Header> {
        if let Some(header) = self.lookup_header(cid, oid)? {
            return Ok(header);
        }
        let seq = self.alloc_seq(batch);
        self.in_use.acquire(seq);
        let rec = HeaderRecord { seq, data: vec![] };
        batch.set(header_key(cid, oid), rec.encode());
        debug!(%cid, %oid, seq, "created header");
        Ok(self.make_header(seq, cid, oid, vec![]))
    }

    /// Stage the header row with the handle's current payload.
    pub fn set_header(&self, header: &Header, batch: &mut KvBatch) {
        let rec = HeaderRecord {
            seq: header.seq,
            data: header.data.clone(),
        };
        batch.set(header_key(&header.cid, &header.oid), rec.encode());
    }

    /// Stage removal of the header row and every data row under its seq.
    pub fn clear(&self, header: &Header, batch: &mut KvBatch) {
        batch.remove(header_key(&header.cid, &header.oid));
        batch.remove_prefix(data_seq_prefix(header.seq));
    }

    /// Stage `values` under `prefix`.
    pub fn set_keys(
        &self,
        header: &Header,
        prefix: Prefix,
        values: &BTreeMap<String, Bytes>,
        batch: &mut KvBatch,
    ) {
        for (key, value) in values {
            batch.set(data_key(header.seq, prefix, key), value.to_vec());
        }
    }

    /// Stage removal of `keys` under `prefix`.
    pub fn rm_keys(
        &self,
        header: &Header,
        prefix: Prefix,
        keys: &BTreeSet<String>,
        batch: &mut KvBatch,
    ) {
        for key in keys {
            batch.remove(data_key(header.seq, prefix, key));
        }
    }

    /// Committed values for the requested keys; absent keys are omitted.
    pub fn get_values(
        &self,
        cid: &Cid,
        oid: &Oid,
        prefix: Prefix,
        keys: &BTreeSet<String>,
    ) -> Result<BTreeMap<String, Bytes>> {
        let seq = self
            .read_seq(cid, oid)?
            .ok_or_else(|| Error::not_found(format!("{cid}/{oid}")))?;
        let raw_keys: Vec<Vec<u8>> = keys.iter().map(|k| data_key(seq, prefix, k)).collect();
        let raw_values = self.db.get_many(&raw_keys)?;
        let mut out = BTreeMap::new();
        for (key, value) in keys.iter().zip(raw_values) {
            if let Some(v) = value {
                out.insert(key.clone(), Bytes::from(v));
            }
        }
        Ok(out)
    }

    /// Which of the requested keys exist.
    pub fn check_keys(
        &self,
        cid: &Cid,
        oid: &Oid,
        prefix: Prefix,
        keys: &BTreeSet<String>,
    ) -> Result<BTreeSet<String>> {
        let values = self.get_values(cid, oid, prefix, keys)?;
        Ok(values.into_keys().collect())
    }

    /// All committed keys under `prefix`.
    pub fn get_keys(&self, cid: &Cid, oid: &Oid, prefix: Prefix) -> Result<BTreeSet<String>> {
        Ok(self.get(cid, oid, prefix)?.into_keys().collect())
    }

    /// All committed `(key, value)` pairs under `prefix`.
    pub fn get(&self, cid: &Cid, oid: &Oid, prefix: Prefix) -> Result<BTreeMap<String, Bytes>> {
        let seq = self
            .read_seq(cid, oid)?
            .ok_or_else(|| Error::not_found(format!("{cid}/{oid}")))?;
        let row_prefix = data_prefix(seq, prefix);
        let rows = self.db.scan_prefix(&row_prefix)?;
        let mut out = BTreeMap::new();
        for (k, v) in rows {
            let user_key = String::from_utf8(k[row_prefix.len()..].to_vec())
                .map_err(|_| Error::storage("non-utf8 data key"))?;
            out.insert(user_key, Bytes::from(v));
        }
        Ok(out)
    }

    /// Sorted cursor over the committed keys under `prefix`.
    pub fn get_iterator(&self, cid: &Cid, oid: &Oid, prefix: Prefix) -> Result<OmapIterator> {
        let entries = match self.get(cid, oid, prefix) {
            Ok(map) => map.into_iter().collect(),
            Err(e) if e.is_not_found() => vec![],
            Err(e) => return Err(e),
        };
        Ok(OmapIterator::new(entries))
    }

    /// Clone `src` into (cid, oid): logical duplication of the source's
    /// committed rows onto a fresh sequence number, staged into `batch`.
    ///
    /// Mutations already staged in the caller's transaction for the source are
    /// not visible here; the buffered-transaction layer replays them onto the
    /// returned target. Callers must serialize clones of the same origin at
    /// collection granularity.
    pub fn clone(
        &self,
        src: &Header,
        cid: &Cid,
        oid: &Oid,
        batch: &mut KvBatch,
    ) -> Result<Header> {
        // An existing target is replaced wholesale
        if let Some(old_seq) = self.read_seq(cid, oid)? {
            batch.remove(header_key(cid, oid));
            batch.remove_prefix(data_seq_prefix(old_seq));
        }

        let seq = self.alloc_seq(batch);
        let src_prefix = data_seq_prefix(src.seq);
        let rows = self.db.scan_prefix(&src_prefix)?;
        let copied = rows.len();
        for (k, v) in rows {
            let mut new_key = data_seq_prefix(seq);
            new_key.extend_from_slice(&k[DATA_SEQ_PREFIX_LEN..]);
            batch.set(new_key, v);
        }

        let rec = HeaderRecord {
            seq,
            data: src.data.clone(),
        };
        batch.set(header_key(cid, oid), rec.encode());

        self.in_use.acquire(seq);
        debug!(src = %src.oid, dst = %oid, seq, copied, "cloned header");
        Ok(self.make_header(seq, cid, oid, src.data.clone()))
    }

    /// Move the header row to (cid, oid); data rows stay under the same seq.
    pub fn rename(&self, header: &mut Header, cid: &Cid, oid: &Oid, batch: &mut KvBatch) {
        batch.remove(header_key(&header.cid, &header.oid));
        let rec = HeaderRecord {
            seq: header.seq,
            data: header.data.clone(),
        };
        batch.set(header_key(cid, oid), rec.encode());
        header.cid = cid.clone();
        header.oid = oid.clone();
    }

    /// Ordered object listing for a collection.
    ///
    /// Returns up to `max` oids starting at `start` (inclusive), plus the
    /// continuation oid if more remain. `max == 0` lists everything.
    pub fn list_objects(
        &self,
        cid: &Cid,
        start: Option<&Oid>,
        max: usize,
    ) -> Result<(Vec<Oid>, Option<Oid>)> {
        let prefix = header_prefix(cid);
        let start_key = start.map(|oid| header_key(cid, oid));
        let limit = if max == 0 { 0 } else { max + 1 };
        let rows = self
            .db
            .scan_prefix_from(&prefix, start_key.as_deref(), limit)?;

        let mut oids = Vec::with_capacity(rows.len());
        for (k, _) in &rows {
            let name = String::from_utf8(k[prefix.len()..].to_vec())
                .map_err(|_| Error::storage("non-utf8 object name"))?;
            oids.push(Oid::new_unchecked(name));
        }

        // The continuation points at the first unreturned oid
        let next = if max != 0 && oids.len() > max {
            let n = oids[max].clone();
            oids.truncate(max);
            Some(n)
        } else {
            None
        };
        Ok((oids, next))
    }

    /// Apply a staged batch atomically.
    pub fn submit(&self, batch: KvBatch) -> Result<()> {
        self.db.submit(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::RedbStore;
    use tempfile::tempdir;

    fn open_map(dir: &tempfile::TempDir) -> ObjectMap {
        let db = RedbStore::open(dir.path().join("store.redb")).unwrap();
        ObjectMap::new(Arc::new(db)).unwrap()
    }

    fn cid(s: &str) -> Cid {
        Cid::new(s).unwrap()
    }

    fn oid(s: &str) -> Oid {
        Oid::new(s).unwrap()
    }

    #[test]
    fn test_create_lookup_roundtrip() {
        let dir = tempdir().unwrap();
        let map = open_map(&dir);
        let (c, o) = (cid("pg1"), oid("obj"));

        assert!(map.lookup_header(&c, &o).unwrap().is_none());

        let mut batch = KvBatch::new();
        let header = map.lookup_create_header(&c, &o, &mut batch).unwrap();
        let seq = header.seq;
        drop(header);
        map.submit(batch).unwrap();

        let header = map.lookup_header(&c, &o).unwrap().unwrap();
        assert_eq!(header.seq, seq);
    }

    #[test]
    fn test_seq_counter_survives_reopen() {
        let dir = tempdir().unwrap();
        let first_seq = {
            let map = open_map(&dir);
            let mut batch = KvBatch::new();
            let header = map
                .lookup_create_header(&cid("c"), &oid("a"), &mut batch)
                .unwrap();
            let seq = header.seq;
            drop(header);
            map.submit(batch).unwrap();
            seq
        };

        let map = open_map(&dir);
        let mut batch = KvBatch::new();
        let header = map
            .lookup_create_header(&cid("c"), &oid("b"), &mut batch)
            .unwrap();
        assert!(header.seq > first_seq);
    }

    #[test]
    fn test_set_get_keys() {
        let dir = tempdir().unwrap();
        let map = open_map(&dir);
        let (c, o) = (cid("pg1"), oid("obj"));

        let mut batch = KvBatch::new();
        let header = map.lookup_create_header(&c, &o, &mut batch).unwrap();
        let mut values = BTreeMap::new();
        values.insert("k1".to_string(), Bytes::from_static(b"v1"));
        values.insert("k2".to_string(), Bytes::from_static(b"v2"));
        map.set_keys(&header, Prefix::Omap, &values, &mut batch);
        drop(header);
        map.submit(batch).unwrap();

        let keys: BTreeSet<String> = ["k1", "k2", "k3"].iter().map(|s| s.to_string()).collect();
        let got = map.get_values(&c, &o, Prefix::Omap, &keys).unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got["k1"], Bytes::from_static(b"v1"));

        let present = map.check_keys(&c, &o, Prefix::Omap, &keys).unwrap();
        assert!(present.contains("k2"));
        assert!(!present.contains("k3"));
    }

    #[test]
    fn test_prefixes_are_disjoint() {
        let dir = tempdir().unwrap();
        let map = open_map(&dir);
        let (c, o) = (cid("pg1"), oid("obj"));

        let mut batch = KvBatch::new();
        let header = map.lookup_create_header(&c, &o, &mut batch).unwrap();
        let mut omap = BTreeMap::new();
        omap.insert("k".to_string(), Bytes::from_static(b"omap"));
        map.set_keys(&header, Prefix::Omap, &omap, &mut batch);
        let mut xattr = BTreeMap::new();
        xattr.insert("k".to_string(), Bytes::from_static(b"xattr"));
        map.set_keys(&header, Prefix::Xattr, &xattr, &mut batch);
        drop(header);
        map.submit(batch).unwrap();

        let omap = map.get(&c, &o, Prefix::Omap).unwrap();
        let xattr = map.get(&c, &o, Prefix::Xattr).unwrap();
        assert_eq!(omap["k"], Bytes::from_static(b"omap"));
        assert_eq!(xattr["k"], Bytes::from_static(b"xattr"));
    }

    #[test]
    fn test_clone_is_isolated() {
        let dir = tempdir().unwrap();
        let map = open_map(&dir);
        let c = cid("pg1");

        let mut batch = KvBatch::new();
        let src = map.lookup_create_header(&c, &oid("src"), &mut batch).unwrap();
        let mut values = BTreeMap::new();
        values.insert("k".to_string(), Bytes::from_static(b"orig"));
        map.set_keys(&src, Prefix::Omap, &values, &mut batch);
        drop(src);
        map.submit(batch).unwrap();

        let mut batch = KvBatch::new();
        let src = map.lookup_header(&c, &oid("src")).unwrap().unwrap();
        let dst = map.clone(&src, &c, &oid("dst"), &mut batch).unwrap();
        assert_ne!(src.seq, dst.seq);
        drop(src);
        drop(dst);
        map.submit(batch).unwrap();

        // Mutate the source; the clone must not change
        let mut batch = KvBatch::new();
        let src = map.lookup_header(&c, &oid("src")).unwrap().unwrap();
        let mut values = BTreeMap::new();
        values.insert("k".to_string(), Bytes::from_static(b"changed"));
        map.set_keys(&src, Prefix::Omap, &values, &mut batch);
        drop(src);
        map.submit(batch).unwrap();

        let got = map.get(&c, &oid("dst"), Prefix::Omap).unwrap();
        assert_eq!(got["k"], Bytes::from_static(b"orig"));
    }

    #[test]
    fn test_rename_moves_header_only() {
        let dir = tempdir().unwrap();
        let map = open_map(&dir);
        let c = cid("pg1");

        let mut batch = KvBatch::new();
        let header = map.lookup_create_header(&c, &oid("old"), &mut batch).unwrap();
        let seq = header.seq;
        let mut values = BTreeMap::new();
        values.insert("k".to_string(), Bytes::from_static(b"v"));
        map.set_keys(&header, Prefix::Xattr, &values, &mut batch);
        drop(header);
        map.submit(batch).unwrap();

        let mut batch = KvBatch::new();
        let mut header = map.lookup_header(&c, &oid("old")).unwrap().unwrap();
        map.rename(&mut header, &c, &oid("new"), &mut batch);
        drop(header);
        map.submit(batch).unwrap();

        assert!(map.lookup_header(&c, &oid("old")).unwrap().is_none());
        let header = map.lookup_header(&c, &oid("new")).unwrap().unwrap();
        assert_eq!(header.seq, seq);
        let got = map.get(&c, &oid("new"), Prefix::Xattr).unwrap();
        assert_eq!(got["k"], Bytes::from_static(b"v"));
    }

    #[test]
    fn test_list_objects_paginated() {
        let dir = tempdir().unwrap();
        let map = open_map(&dir);
        let c = cid("pg1");

        let mut batch = KvBatch::new();
        for name in ["a", "b", "c", "d", "e"] {
            let header = map.lookup_create_header(&c, &oid(name), &mut batch).unwrap();
            drop(header);
        }
        map.submit(batch).unwrap();

        let (first, next) = map.list_objects(&c, None, 2).unwrap();
        assert_eq!(first, vec![oid("a"), oid("b")]);
        let next = next.unwrap();
        assert_eq!(next, oid("c"));

        let (rest, next) = map.list_objects(&c, Some(&next), 0).unwrap();
        assert_eq!(rest, vec![oid("c"), oid("d"), oid("e")]);
        assert!(next.is_none());
    }

    #[test]
    fn test_omap_iterator_lower_bound() {
        let dir = tempdir().unwrap();
        let map = open_map(&dir);
        let (c, o) = (cid("pg1"), oid("obj"));

        let mut batch = KvBatch::new();
        let header = map.lookup_create_header(&c, &o, &mut batch).unwrap();
        let mut values = BTreeMap::new();
        for k in ["aa", "ab", "ba", "bb"] {
            values.insert(k.to_string(), Bytes::from_static(b"v"));
        }
        map.set_keys(&header, Prefix::Omap, &values, &mut batch);
        drop(header);
        map.submit(batch).unwrap();

        let mut it = map.get_iterator(&c, &o, Prefix::Omap).unwrap();
        it.lower_bound("ac");
        assert!(it.valid());
        assert_eq!(it.key(), Some("ba"));
        it.next();
        assert_eq!(it.key(), Some("bb"));
        it.next();
        assert!(!it.valid());
        assert_eq!(it.key(), None);
    }

    #[test]
    fn test_in_use_blocks_second_lookup() {
        let dir = tempdir().unwrap();
        let map = Arc::new(open_map(&dir));
        let (c, o) = (cid("pg1"), oid("obj"));

        let mut batch = KvBatch::new();
        let header = map.lookup_create_header(&c, &o, &mut batch).unwrap();
        drop(header);
        map.submit(batch).unwrap();

        let held = map.lookup_header(&c, &o).unwrap().unwrap();

        let map2 = Arc::clone(&map);
        let (c2, o2) = (c.clone(), o.clone());
        let t = std::thread::spawn(move || {
            let h = map2.lookup_header(&c2, &o2).unwrap().unwrap();
            h.seq
        });

        // Give the thread a chance to block, then release
        std::thread::sleep(std::time::Duration::from_millis(50));
        let seq = held.seq;
        drop(held);
        assert_eq!(t.join().unwrap(), seq);
    }
}
