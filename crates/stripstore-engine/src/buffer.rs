//! Buffered transaction
//!
//! Combines the ops of one pipeline op into a single KV batch and caches
//! in-flight header and key mutations so later ops in the same transaction
//! observe earlier ones without touching the backend.
//!
//! Headers live in an insertion-ordered arena; callers hold [`HeaderHandle`]
//! indices and look the header up on each access, so clone and rename can
//! rewire the (cid, oid) index without invalidating anything.

use crate::kv::KvBatch;
use crate::object_map::Prefix;
use crate::store::{coll_meta, is_coll_meta, oid_for_coll};
use crate::strip::{StripHeader, StripObjectMap};
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use stripstore_common::{Cid, Error, Oid, Result, SequencerPosition};
use tracing::{debug, warn};

/// Index of a header in a buffered transaction's arena
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeaderHandle(usize);

struct HeaderSlot {
    key: (Cid, Oid),
    header: StripHeader,
    /// Superseded by a clone or rename; skipped at commit
    detached: bool,
}

/// One atomic unit of work: an op-scoped header cache plus the staged KV batch.
pub struct BufferTransaction<'a> {
    backend: &'a StripObjectMap,
    /// Current decoder position; advanced between transactions and ops
    pub spos: SequencerPosition,
    slots: Vec<HeaderSlot>,
    index: HashMap<(Cid, Oid), usize>,
    batch: KvBatch,
}

impl<'a> BufferTransaction<'a> {
    /// Start a buffered transaction at `spos`.
    #[must_use]
    pub fn new(backend: &'a StripObjectMap, spos: SequencerPosition) -> Self {
        Self {
            backend,
            spos,
            slots: Vec::new(),
            index: HashMap::new(),
            batch: KvBatch::new(),
        }
    }

    /// Whether `cid` exists: committed state first, then collections created
    /// earlier in this transaction.
    pub fn check_coll(&self, cid: &Cid) -> Result<()> {
        if is_coll_meta(cid) {
            return Ok(());
        }
        let meta = coll_meta();
        let coll_oid = oid_for_coll(cid);
        if self.backend.map().contains_header(&meta, &coll_oid)? {
            return Ok(());
        }
        if let Some(&i) = self.index.get(&(meta, coll_oid)) {
            if !self.slots[i].header.deleted {
                return Ok(());
            }
        }
        Err(Error::not_found(format!("collection {cid}")))
    }

    /// Look up (or create) the cached header for (cid, oid).
    ///
    /// An object removed earlier in this transaction reports `NotFound` even
    /// with `create_if_missing`.
    pub fn lookup_cached_header(
        &mut self,
        cid: &Cid,
        oid: &Oid,
        create_if_missing: bool,
    ) -> Result<HeaderHandle> {
        self.check_coll(cid)?;

        let key = (cid.clone(), oid.clone());
        if let Some(&i) = self.index.get(&key) {
            if self.slots[i].header.deleted {
                return Err(Error::not_found(format!("{cid}/{oid}")));
            }
            return Ok(HeaderHandle(i));
        }

        let header = match self.backend.lookup_strip_header(cid, oid) {
            Ok(h) => h,
            Err(e) if e.is_not_found() && create_if_missing => {
                self.backend.create_strip_header(cid, oid, &mut self.batch)?
            }
            Err(e) => {
                debug!(%cid, %oid, error = %e, "header lookup failed");
                return Err(e);
            }
        };

        let i = self.slots.len();
        self.slots.push(HeaderSlot {
            key: key.clone(),
            header,
            detached: false,
        });
        self.index.insert(key, i);
        Ok(HeaderHandle(i))
    }

    /// Shared access to a cached header
    #[must_use]
    pub fn header(&self, h: HeaderHandle) -> &StripHeader {
        &self.slots[h.0].header
    }

    /// Mutable access to a cached header
    pub fn header_mut(&mut self, h: HeaderHandle) -> &mut StripHeader {
        &mut self.slots[h.0].header
    }

    /// Cached (cid, oid) entries, insertion order, clones/renames excluded
    pub fn cached_headers(&self) -> impl Iterator<Item = (&(Cid, Oid), &StripHeader)> {
        self.slots
            .iter()
            .filter(|s| !s.detached)
            .map(|s| (&s.key, &s.header))
    }

    /// Whether (cid, oid) is cached in this transaction
    #[must_use]
    pub fn contains_cached(&self, cid: &Cid, oid: &Oid) -> bool {
        self.index.contains_key(&(cid.clone(), oid.clone()))
    }

    /// Read one key, honoring values staged earlier in this transaction.
    pub fn get_buffer_key(&self, h: HeaderHandle, prefix: Prefix, key: &str) -> Result<Bytes> {
        let header = &self.slots[h.0].header;
        if let Some(entry) = header.buffers.get(&(prefix, key.to_string())) {
            return match entry {
                Some(value) => Ok(value.clone()),
                None => Err(Error::not_found(format!(
                    "{}/{} key {key} removed in transaction",
                    header.cid, header.oid
                ))),
            };
        }

        let mut keys = BTreeSet::new();
        keys.insert(key.to_string());
        let mut out = self
            .backend
            .map()
            .get_values(&header.cid, &header.oid, prefix, &keys)?;
        out.remove(key)
            .ok_or_else(|| Error::not_found(format!("{}/{} key {key}", header.cid, header.oid)))
    }

    /// Stage `values` under `prefix`, mirroring them into the buffer cache.
    pub fn set_buffer_keys(
        &mut self,
        h: HeaderHandle,
        prefix: Prefix,
        values: BTreeMap<String, Bytes>,
    ) {
        if self.backend.check_spos(&self.slots[h.0].header, &self.spos) {
            return;
        }
        self.backend.map().set_keys(
            &self.slots[h.0].header.handle,
            prefix,
            &values,
            &mut self.batch,
        );
        let header = &mut self.slots[h.0].header;
        for (key, value) in values {
            header.buffers.insert((prefix, key), Some(value));
        }
    }

    /// Stage removal of `keys` under `prefix`, recording the removals in the
    /// buffer cache.
    pub fn remove_buffer_keys(
        &mut self,
        h: HeaderHandle,
        prefix: Prefix,
        keys: &BTreeSet<String>,
    ) -> Result<()> {
        if self.backend.check_spos(&self.slots[h.0].header, &self.spos) {
            return Ok(());
        }
        self.backend.map().rm_keys(
            &self.slots[h.0].header.handle,
            prefix,
            keys,
            &mut self.batch,
        );
        let header = &mut self.slots[h.0].header;
        for key in keys {
            header.buffers.insert((prefix, key.clone()), None);
        }
        Ok(())
    }

    /// Mark every cached buffer under `prefix` as removed.
    pub fn clear_buffer_keys(&mut self, h: HeaderHandle, prefix: Prefix) {
        let header = &mut self.slots[h.0].header;
        for ((p, _), value) in header.buffers.iter_mut() {
            if *p == prefix {
                *value = None;
            }
        }
    }

    /// Tombstone the object and stage erasure of all its rows.
    pub fn clear_buffer(&mut self, h: HeaderHandle) -> Result<()> {
        if self.backend.check_spos(&self.slots[h.0].header, &self.spos) {
            return Ok(());
        }
        let header = &mut self.slots[h.0].header;
        header.deleted = true;
        self.backend.map().clear(&header.handle, &mut self.batch);
        Ok(())
    }

    /// Clone the object behind `old_h` into (cid, new_oid).
    ///
    /// Any cached entry for the target is detached first to avoid aliasing.
    /// The source's in-transaction buffer mutations are replayed onto the
    /// clone so it matches the source as seen by this transaction, not just
    /// committed state.
    pub fn clone_buffer(&mut self, old_h: HeaderHandle, cid: &Cid, new_oid: &Oid) -> Result<()> {
        if self.backend.check_spos(&self.slots[old_h.0].header, &self.spos) {
            return Ok(());
        }

        let target_key = (cid.clone(), new_oid.clone());
        if let Some(i) = self.index.remove(&target_key) {
            self.slots[i].detached = true;
        }

        let spos = self.spos;
        let target = self.backend.clone_wrap(
            &mut self.slots[old_h.0].header,
            cid,
            new_oid,
            &mut self.batch,
            &spos,
        )?;

        // Replay staged source mutations onto the target's rows
        let mut sets: BTreeMap<Prefix, BTreeMap<String, Bytes>> = BTreeMap::new();
        let mut removes: BTreeMap<Prefix, BTreeSet<String>> = BTreeMap::new();
        for ((prefix, key), value) in &target.buffers {
            match value {
                Some(v) => {
                    sets.entry(*prefix).or_default().insert(key.clone(), v.clone());
                }
                None => {
                    removes.entry(*prefix).or_default().insert(key.clone());
                }
            }
        }
        for (prefix, values) in &sets {
            self.backend
                .map()
                .set_keys(&target.handle, *prefix, values, &mut self.batch);
        }
        for (prefix, keys) in &removes {
            self.backend
                .map()
                .rm_keys(&target.handle, *prefix, keys, &mut self.batch);
        }

        let i = self.slots.len();
        self.slots.push(HeaderSlot {
            key: target_key.clone(),
            header: target,
            detached: false,
        });
        self.index.insert(target_key, i);
        Ok(())
    }

    /// Rename the object behind `old_h` to (cid, new_oid).
    pub fn rename_buffer(&mut self, old_h: HeaderHandle, cid: &Cid, new_oid: &Oid) {
        if self.backend.check_spos(&self.slots[old_h.0].header, &self.spos) {
            return;
        }
        let spos = self.spos;
        self.backend.rename_wrap(
            &mut self.slots[old_h.0].header,
            cid,
            new_oid,
            &mut self.batch,
            &spos,
        );
        let old_key = self.slots[old_h.0].key.clone();
        self.index.remove(&old_key);
        let new_key = (cid.clone(), new_oid.clone());
        self.slots[old_h.0].key = new_key.clone();
        self.index.insert(new_key, old_h.0);
    }

    /// Commit: save every live header (skipping replayed and deleted ones) in
    /// insertion order, then submit the batch to the backend. The backend
    /// submit runs even if a header save failed; the save error is logged and
    /// returned afterwards.
    pub fn submit_transaction(mut self) -> Result<()> {
        let backend = self.backend;
        let spos = self.spos;
        let mut save_err = None;

        for slot in &mut self.slots {
            if slot.detached {
                continue;
            }
            if backend.check_spos(&slot.header, &spos) {
                continue;
            }
            if slot.header.deleted {
                continue;
            }
            slot.header.spos = spos;
            if let Err(e) = backend.save_strip_header(&mut slot.header, &mut self.batch) {
                warn!(cid = %slot.header.cid, oid = %slot.header.oid, error = %e,
                      "failed to save strip header");
                save_err = Some(e);
                break;
            }
        }

        debug!(ops = self.batch.len(), %spos, "submitting buffered transaction");
        backend.map().submit(self.batch)?;
        match save_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
