//! The store facade
//!
//! Ties the pieces together: lifecycle (mkfs / mount / umount), the read-side
//! query API, and the single mutation entry point `queue_transactions`, which
//! feeds the sequenced op pipeline. Workers replay each op through a
//! buffered transaction and commit it as one KV batch.
//!
//! Collections are modeled as objects of a reserved meta-collection: the
//! header and attributes of collection `c` live on the synthetic object named
//! `c` inside the meta-collection.

use crate::buffer::BufferTransaction;
use crate::kv::RedbStore;
use crate::layout;
use crate::object_map::{ObjectMap, OmapIterator, Prefix, OMAP_HEADER_KEY};
use crate::sequencer::{
    Finisher, Op, OpCallbacks, OpSequencer, OpWorkQueue, Sequencer, SubmitManager, Watchdog,
};
use crate::strip::{file_to_extents, strip_object_key, StripHeader, StripObjectMap};
use crate::transaction::{Transaction, TransactionOp};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use stripstore_common::{Cid, Error, ObjectStat, Oid, Result, SequencerPosition, StoreConfig,
    StoreStatFs};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Reserved collection whose objects carry real collections' headers
const COLLECTION_META: &str = "__collections__";

/// Objects listed per batch by range listings and recursive removal
const LIST_BATCH: usize = 300;

pub(crate) fn coll_meta() -> Cid {
    Cid::new_unchecked(COLLECTION_META)
}

pub(crate) fn oid_for_coll(cid: &Cid) -> Oid {
    Oid::new_unchecked(cid.as_str())
}

pub(crate) fn is_coll_meta(cid: &Cid) -> bool {
    cid.as_str() == COLLECTION_META
}

fn cid_for_meta_oid(oid: &Oid) -> Cid {
    Cid::new_unchecked(oid.as_str())
}

#[derive(Default)]
struct ReadErrors {
    data: HashSet<Oid>,
    mdata: HashSet<Oid>,
}

/// Object store striping byte streams over an ordered KV backend.
///
/// All mutation flows through [`StripStore::queue_transactions`]; queries are
/// served from committed state.
pub struct StripStore {
    inner: Arc<StoreInner>,
}

pub(crate) struct StoreInner {
    basedir: PathBuf,
    config: StoreConfig,
    backend: RwLock<Option<Arc<StripObjectMap>>>,
    submit: SubmitManager,
    default_osr: Arc<OpSequencer>,
    wq: OpWorkQueue,
    readable_finisher: Finisher,
    ondisk_finisher: Finisher,
    watchdog: Watchdog,
    fsid_file: Mutex<Option<File>>,
    fsid: Mutex<Option<Uuid>>,
    read_errors: Mutex<ReadErrors>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    mounted: AtomicBool,
}

impl StripStore {
    /// Create a store over `basedir` with `config`. Nothing touches disk
    /// until [`Self::mkfs`] or [`Self::mount`].
    #[must_use]
    pub fn new(basedir: impl AsRef<Path>, config: StoreConfig) -> Self {
        let grace = Duration::from_secs(config.op_thread_timeout_secs.max(1));
        Self {
            inner: Arc::new(StoreInner {
                basedir: basedir.as_ref().to_path_buf(),
                config,
                backend: RwLock::new(None),
                submit: SubmitManager::new(),
                default_osr: Arc::new(OpSequencer::new("default")),
                wq: OpWorkQueue::new(),
                readable_finisher: Finisher::new("stripstore-readable".to_string()),
                ondisk_finisher: Finisher::new("stripstore-ondisk".to_string()),
                watchdog: Watchdog::new(grace),
                fsid_file: Mutex::new(None),
                fsid: Mutex::new(None),
                read_errors: Mutex::new(ReadErrors::default()),
                workers: Mutex::new(Vec::new()),
                mounted: AtomicBool::new(false),
            }),
        }
    }

    /// Base directory this store lives in
    #[must_use]
    pub fn basedir(&self) -> &Path {
        &self.inner.basedir
    }

    /// Initialize the on-disk layout: fsid, version stamp, `current/`, and
    /// the KV database. Idempotent over an existing store with the same fsid.
    pub fn mkfs(&self) -> Result<()> {
        let basedir = &self.inner.basedir;
        info!(basedir = %basedir.display(), "mkfs");
        std::fs::create_dir_all(basedir)?;

        let mut fsid_file = layout::open_fsid(basedir, true)?;
        layout::lock_fsid(&fsid_file)?;

        let fsid = match layout::read_fsid(&mut fsid_file)? {
            Some(existing) => {
                info!(%existing, "mkfs fsid already set");
                existing
            }
            None => {
                let fresh = Uuid::new_v4();
                layout::write_fsid(&mut fsid_file, fresh)?;
                info!(fsid = %fresh, "mkfs generated fsid");
                fresh
            }
        };

        layout::write_version_stamp(basedir)?;
        layout::create_current(basedir)?;

        // Create the database so mount finds it
        let _ = RedbStore::open(layout::db_path(basedir))?;

        *self.inner.fsid.lock() = Some(fsid);
        info!(basedir = %basedir.display(), "mkfs done");
        Ok(())
    }

    /// Open the store: lock the fsid, validate the version stamp, open the
    /// KV backend, and start the worker pool and completion threads.
    pub fn mount(&self) -> Result<()> {
        let inner = &self.inner;
        let basedir = &inner.basedir;
        info!(basedir = %basedir.display(), "mount");

        if inner.mounted.load(Ordering::SeqCst) {
            return Err(Error::busy("store already mounted"));
        }

        let mut fsid_file = layout::open_fsid(basedir, false)?;
        layout::lock_fsid(&fsid_file)?;
        let fsid = layout::read_fsid(&mut fsid_file)?
            .ok_or_else(|| Error::invalid_argument("fsid file is empty, run mkfs first"))?;

        match layout::read_version_stamp(basedir)? {
            Some(v) if v == layout::STORE_VERSION => {}
            stamp => {
                if inner.config.do_update {
                    warn!(?stamp, "stale version stamp, upgrading");
                    layout::write_version_stamp(basedir)?;
                } else {
                    return Err(Error::invalid_argument(format!(
                        "stale version stamp {stamp:?}, expected {}",
                        layout::STORE_VERSION
                    )));
                }
            }
        }

        let current = layout::current_path(basedir);
        if !current.is_dir() {
            return Err(Error::invalid_argument(format!(
                "{} missing, run mkfs first",
                current.display()
            )));
        }

        let db = Arc::new(RedbStore::open(layout::db_path(basedir))?);
        let map = ObjectMap::new(db)?;
        let backend = Arc::new(StripObjectMap::new(map, inner.config.strip_size));
        *inner.backend.write() = Some(backend);

        inner.readable_finisher.start();
        inner.ondisk_finisher.start();
        inner.wq.start();
        let mut workers = inner.workers.lock();
        for i in 0..inner.config.op_threads.max(1) {
            let worker_inner = Arc::clone(inner);
            let handle = thread::Builder::new()
                .name(format!("stripstore-op-{i}"))
                .spawn(move || worker_inner.worker_loop())
                .expect("spawn op worker");
            workers.push(handle);
        }
        drop(workers);

        *inner.fsid_file.lock() = Some(fsid_file);
        *inner.fsid.lock() = Some(fsid);
        inner.mounted.store(true, Ordering::SeqCst);
        info!(%fsid, "mounted");
        Ok(())
    }

    /// Stop workers and completion threads, close the backend, and release
    /// the fsid lock. Idempotent.
    pub fn umount(&self) -> Result<()> {
        let inner = &self.inner;
        if !inner.mounted.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        info!(basedir = %inner.basedir.display(), "umount");

        inner.wq.stop();
        for handle in inner.workers.lock().drain(..) {
            let _ = handle.join();
        }
        inner.readable_finisher.stop();
        inner.ondisk_finisher.stop();

        *inner.backend.write() = None;
        *inner.fsid_file.lock() = None; // releases the lock
        Ok(())
    }

    /// Whether the store is mounted
    #[must_use]
    pub fn is_mounted(&self) -> bool {
        self.inner.mounted.load(Ordering::SeqCst)
    }

    /// Store uuid, once known from mkfs or mount
    #[must_use]
    pub fn fsid(&self) -> Option<Uuid> {
        *self.inner.fsid.lock()
    }

    /// Probe whether another process holds the store locked.
    ///
    /// POSIX record locks are per-process, so this must not be called while
    /// this process has the store mounted: the probe would succeed, and
    /// closing the probe fd drops the mount's own lock.
    pub fn test_mount_in_use(&self) -> Result<bool> {
        if self.is_mounted() {
            return Err(Error::busy("store is mounted by this process"));
        }
        let file = match layout::open_fsid(&self.inner.basedir, false) {
            Ok(f) => f,
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e),
        };
        Ok(layout::lock_fsid(&file).is_err())
    }

    /// Rewrite the version stamp to the current format version.
    pub fn update_version_stamp(&self) -> Result<()> {
        layout::write_version_stamp(&self.inner.basedir)
    }

    /// Whether the on-disk collection format is current
    #[must_use]
    pub fn collection_version_current(&self) -> bool {
        matches!(
            layout::read_version_stamp(&self.inner.basedir),
            Ok(Some(layout::STORE_VERSION))
        )
    }

    /// Filesystem stats for the base directory
    pub fn stat_fs(&self) -> Result<StoreStatFs> {
        layout::stat_fs(&self.inner.basedir)
    }

    /// Longest object name the backing filesystem supports
    pub fn get_max_object_name_length(&self) -> Result<u64> {
        layout::max_name_length(&self.inner.basedir)
    }

    /// Create a named sequencer. Ops queued through it commit in submission
    /// order; ops on different sequencers may run in parallel.
    #[must_use]
    pub fn sequencer(&self, name: impl Into<String>) -> Sequencer {
        Sequencer::new(name)
    }

    /// Queue a list of transactions as one op.
    ///
    /// The op number is assigned and the op enqueued under the submit mutex,
    /// so enqueue order equals op-number order. Completions fire on the
    /// pipeline's threads, never on the caller's.
    pub fn queue_transactions(
        &self,
        osr: Option<&Sequencer>,
        tls: Vec<Transaction>,
        callbacks: OpCallbacks,
    ) -> Result<()> {
        let inner = &self.inner;
        if !inner.mounted.load(Ordering::SeqCst) {
            return Err(Error::storage("store is not mounted"));
        }

        let osr = osr
            .map(|s| Arc::clone(&s.inner))
            .unwrap_or_else(|| Arc::clone(&inner.default_osr));

        let ticket = inner.submit.start();
        let op = Op {
            op: ticket.op(),
            tls,
            on_readable: callbacks.on_readable,
            on_readable_sync: callbacks.on_readable_sync,
            on_disk: callbacks.on_disk,
            start: Instant::now(),
        };
        debug!(op = ticket.op(), sequencer = osr.name(), "queue transactions");
        osr.queue(op);
        inner.wq.queue(osr);
        inner.submit.finish(ticket);
        Ok(())
    }

    /// Queue `tls` and block until the op is on disk.
    pub fn apply_transactions(&self, osr: Option<&Sequencer>, tls: Vec<Transaction>) -> Result<()> {
        let (tx, rx) = std::sync::mpsc::channel();
        let callbacks = OpCallbacks {
            on_disk: Some(Box::new(move |r| {
                let _ = tx.send(r);
            })),
            ..Default::default()
        };
        self.queue_transactions(osr, tls, callbacks)?;
        // The on-disk callback is dropped when the op fails, so a closed
        // channel means failure or shutdown.
        let r = rx
            .recv()
            .map_err(|_| Error::storage("op failed or store shut down before completion"))?;
        if r < 0 {
            return Err(Error::storage(format!("op failed with result {r}")));
        }
        Ok(())
    }

    /// Queue a single transaction and block until it is on disk.
    pub fn apply_transaction(&self, osr: Option<&Sequencer>, t: Transaction) -> Result<()> {
        self.apply_transactions(osr, vec![t])
    }

    /// Re-apply a transaction list under an explicit op number, synchronously
    /// on the caller's thread. Intended for replay by an upper layer that
    /// journals its op stream: mutations at positions the object headers
    /// already record are skipped, so replaying a committed list leaves the
    /// store byte-identical.
    pub fn replay_transactions(&self, op_seq: u64, tls: &[Transaction]) -> Result<()> {
        if !self.inner.mounted.load(Ordering::SeqCst) {
            return Err(Error::storage("store is not mounted"));
        }
        self.inner.do_transactions(tls, op_seq)
    }

    // ── queries ──────────────────────────────────────────────────────────

    /// Whether (cid, oid) exists
    pub fn exists(&self, cid: &Cid, oid: &Oid) -> Result<bool> {
        let inner = &self.inner;
        if inner.check_coll(cid).is_err() {
            return Ok(false);
        }
        inner.backend()?.map().contains_header(cid, oid)
    }

    /// Object metadata
    pub fn stat(&self, cid: &Cid, oid: &Oid) -> Result<ObjectStat> {
        let inner = &self.inner;
        if inner.debug_mdata_eio(oid) {
            return Err(inner.injected_io_error(oid));
        }
        inner.check_coll(cid)?;
        let header = inner.backend()?.lookup_strip_header(cid, oid)?;
        Ok(ObjectStat {
            size: header.max_size,
            block_size: header.strip_size,
            blocks: header.max_size.div_ceil(header.strip_size),
            nlink: 1,
        })
    }

    /// Read up to `len` bytes at `offset`; `len == 0` reads to the end.
    /// Unwritten ranges read as zeros.
    pub fn read(&self, cid: &Cid, oid: &Oid, offset: u64, len: u64) -> Result<Vec<u8>> {
        let inner = &self.inner;
        if inner.debug_data_eio(oid) {
            return Err(inner.injected_io_error(oid));
        }
        inner.generic_read(cid, oid, offset, len, None)
    }

    /// Logical extent map `offset → length` covering the clamped request
    /// range; holes are included.
    pub fn fiemap(&self, cid: &Cid, oid: &Oid, offset: u64, len: u64) -> Result<BTreeMap<u64, u64>> {
        let inner = &self.inner;
        inner.check_coll(cid)?;
        let header = inner.backend()?.lookup_strip_header(cid, oid)?;

        if offset > header.max_size {
            return Err(Error::invalid_argument(format!(
                "fiemap offset {offset} beyond object size {}",
                header.max_size
            )));
        }
        let len = if len == 0 || offset + len > header.max_size {
            header.max_size - offset
        } else {
            len
        };
        let mut out = BTreeMap::new();
        for e in file_to_extents(offset, len, header.strip_size) {
            out.insert(e.no * header.strip_size + e.offset, e.len);
        }
        Ok(out)
    }

    /// One object attribute; `NoData` if absent.
    pub fn getattr(&self, cid: &Cid, oid: &Oid, name: &str) -> Result<Bytes> {
        let inner = &self.inner;
        inner.check_coll(cid)?;
        let mut keys = BTreeSet::new();
        keys.insert(name.to_string());
        let mut got = match inner.backend()?.map().get_values(cid, oid, Prefix::Xattr, &keys) {
            Ok(got) => got,
            Err(e) if e.is_not_found() => BTreeMap::new(),
            Err(e) => return Err(e),
        };
        got.remove(name)
            .ok_or_else(|| Error::no_data(format!("{cid}/{oid} attr {name}")))
    }

    /// All object attributes. With `user_only`, keeps names with a leading
    /// underscore (except the bare `_`) and strips it.
    pub fn getattrs(&self, cid: &Cid, oid: &Oid, user_only: bool) -> Result<BTreeMap<String, Bytes>> {
        let inner = &self.inner;
        inner.check_coll(cid)?;
        let attrs = match inner.backend()?.map().get(cid, oid, Prefix::Xattr) {
            Ok(attrs) => attrs,
            Err(e) if e.is_not_found() => BTreeMap::new(),
            Err(e) => return Err(e),
        };
        if !user_only {
            return Ok(attrs);
        }
        Ok(attrs
            .into_iter()
            .filter_map(|(name, value)| {
                let rest = name.strip_prefix('_')?;
                if rest.is_empty() {
                    return None;
                }
                Some((rest.to_string(), value))
            })
            .collect())
    }

    /// All collections, in order
    pub fn list_collections(&self) -> Result<Vec<Cid>> {
        let inner = &self.inner;
        let (oids, next) = inner.backend()?.map().list_objects(&coll_meta(), None, 0)?;
        debug_assert!(next.is_none());
        Ok(oids.iter().map(cid_for_meta_oid).collect())
    }

    /// Whether the collection exists
    pub fn collection_exists(&self, cid: &Cid) -> Result<bool> {
        Ok(self.inner.check_coll(cid).is_ok())
    }

    /// Whether the collection holds no objects
    pub fn collection_empty(&self, cid: &Cid) -> Result<bool> {
        let inner = &self.inner;
        if inner.check_coll(cid).is_err() {
            return Ok(false);
        }
        let (oids, _) = inner.backend()?.map().list_objects(cid, None, 1)?;
        Ok(oids.is_empty())
    }

    /// All objects of a collection, in order
    pub fn collection_list(&self, cid: &Cid) -> Result<Vec<Oid>> {
        let (oids, next) = self.collection_list_partial(cid, None, 0)?;
        debug_assert!(next.is_none());
        Ok(oids)
    }

    /// Up to `max` objects starting at `start`, plus a continuation oid.
    /// `max == 0` lists everything.
    pub fn collection_list_partial(
        &self,
        cid: &Cid,
        start: Option<&Oid>,
        max: usize,
    ) -> Result<(Vec<Oid>, Option<Oid>)> {
        let inner = &self.inner;
        inner.check_coll(cid)?;
        inner.backend()?.map().list_objects(cid, start, max)
    }

    /// Objects in `[start, end)`, in order
    pub fn collection_list_range(&self, cid: &Cid, start: &Oid, end: &Oid) -> Result<Vec<Oid>> {
        let mut ls = Vec::new();
        let mut cursor = Some(start.clone());
        loop {
            let (oids, next) = self.collection_list_partial(cid, cursor.as_ref(), LIST_BATCH)?;
            let mut done = next.is_none();
            for oid in oids {
                if &oid >= end {
                    done = true;
                    break;
                }
                ls.push(oid);
            }
            if let Some(n) = &next {
                if n >= end {
                    done = true;
                }
            }
            if done {
                break;
            }
            cursor = next;
        }
        Ok(ls)
    }

    /// One collection attribute; `NoData` if absent.
    pub fn collection_getattr(&self, cid: &Cid, name: &str) -> Result<Bytes> {
        let inner = &self.inner;
        inner.check_coll(cid)?;
        let mut keys = BTreeSet::new();
        keys.insert(name.to_string());
        let mut got = inner.backend()?.map().get_values(
            &coll_meta(),
            &oid_for_coll(cid),
            Prefix::CollAttr,
            &keys,
        )?;
        got.remove(name)
            .ok_or_else(|| Error::no_data(format!("collection {cid} attr {name}")))
    }

    /// All collection attributes
    pub fn collection_getattrs(&self, cid: &Cid) -> Result<BTreeMap<String, Bytes>> {
        let inner = &self.inner;
        inner.check_coll(cid)?;
        match inner
            .backend()?
            .map()
            .get(&coll_meta(), &oid_for_coll(cid), Prefix::CollAttr)
        {
            Ok(attrs) => Ok(attrs),
            Err(e) if e.is_not_found() => Ok(BTreeMap::new()),
            Err(e) => Err(e),
        }
    }

    /// Omap header and all omap entries
    pub fn omap_get(&self, cid: &Cid, oid: &Oid) -> Result<(Bytes, BTreeMap<String, Bytes>)> {
        let inner = &self.inner;
        inner.check_coll(cid)?;
        let entries = match inner.backend()?.map().get(cid, oid, Prefix::Omap) {
            Ok(entries) => entries,
            Err(e) if e.is_not_found() => BTreeMap::new(),
            Err(e) => return Err(e),
        };
        let header = self.omap_get_header(cid, oid)?;
        Ok((header, entries))
    }

    /// Omap header blob; empty if never set.
    pub fn omap_get_header(&self, cid: &Cid, oid: &Oid) -> Result<Bytes> {
        let inner = &self.inner;
        inner.check_coll(cid)?;
        let mut keys = BTreeSet::new();
        keys.insert(OMAP_HEADER_KEY.to_string());
        let mut got =
            match inner
                .backend()?
                .map()
                .get_values(cid, oid, Prefix::OmapHeader, &keys)
            {
                Ok(got) => got,
                Err(e) if e.is_not_found() => BTreeMap::new(),
                Err(e) => return Err(e),
            };
        Ok(got.remove(OMAP_HEADER_KEY).unwrap_or_default())
    }

    /// All omap keys
    pub fn omap_get_keys(&self, cid: &Cid, oid: &Oid) -> Result<BTreeSet<String>> {
        let inner = &self.inner;
        inner.check_coll(cid)?;
        match inner.backend()?.map().get_keys(cid, oid, Prefix::Omap) {
            Ok(keys) => Ok(keys),
            Err(e) if e.is_not_found() => Ok(BTreeSet::new()),
            Err(e) => Err(e),
        }
    }

    /// Values for the requested omap keys; absent keys are omitted.
    pub fn omap_get_values(
        &self,
        cid: &Cid,
        oid: &Oid,
        keys: &BTreeSet<String>,
    ) -> Result<BTreeMap<String, Bytes>> {
        let inner = &self.inner;
        inner.check_coll(cid)?;
        match inner.backend()?.map().get_values(cid, oid, Prefix::Omap, keys) {
            Ok(values) => Ok(values),
            Err(e) if e.is_not_found() => Ok(BTreeMap::new()),
            Err(e) => Err(e),
        }
    }

    /// Which of the requested omap keys exist
    pub fn omap_check_keys(
        &self,
        cid: &Cid,
        oid: &Oid,
        keys: &BTreeSet<String>,
    ) -> Result<BTreeSet<String>> {
        Ok(self.omap_get_values(cid, oid, keys)?.into_keys().collect())
    }

    /// Sorted cursor over the object's omap
    pub fn get_omap_iterator(&self, cid: &Cid, oid: &Oid) -> Result<OmapIterator> {
        let inner = &self.inner;
        inner.check_coll(cid)?;
        inner.backend()?.map().get_iterator(cid, oid, Prefix::Omap)
    }

    /// Remove every object of `cid` in listing batches, then the collection
    /// itself, through the regular transaction pipeline.
    pub fn remove_collection_recursive(&self, osr: Option<&Sequencer>, cid: &Cid) -> Result<()> {
        if self.inner.check_coll(cid).is_err() {
            return Ok(());
        }
        let mut cursor = None;
        loop {
            let (oids, next) = self.collection_list_partial(cid, cursor.as_ref(), LIST_BATCH)?;
            if oids.is_empty() {
                break;
            }
            let mut t = Transaction::new();
            for oid in &oids {
                t.collection_remove(cid, oid);
            }
            self.apply_transaction(osr, t)?;
            match next {
                Some(n) => cursor = Some(n),
                None => break,
            }
        }
        let mut t = Transaction::new();
        t.remove_collection(cid);
        self.apply_transaction(osr, t)
    }

    // ── debug fault injection ────────────────────────────────────────────

    /// Make data reads of `oid` fail with an I/O error
    pub fn inject_data_error(&self, oid: &Oid) {
        debug!(%oid, "inject data error");
        self.inner.read_errors.lock().data.insert(oid.clone());
    }

    /// Make metadata reads of `oid` fail with an I/O error
    pub fn inject_mdata_error(&self, oid: &Oid) {
        debug!(%oid, "inject mdata error");
        self.inner.read_errors.lock().mdata.insert(oid.clone());
    }
}

impl Drop for StripStore {
    fn drop(&mut self) {
        let _ = self.umount();
    }
}

impl StoreInner {
    fn backend(&self) -> Result<Arc<StripObjectMap>> {
        self.backend
            .read()
            .clone()
            .ok_or_else(|| Error::storage("store is not mounted"))
    }

    /// Committed-state collection existence check
    fn check_coll(&self, cid: &Cid) -> Result<()> {
        if is_coll_meta(cid) {
            return Ok(());
        }
        if self
            .backend()?
            .map()
            .contains_header(&coll_meta(), &oid_for_coll(cid))?
        {
            Ok(())
        } else {
            Err(Error::not_found(format!("collection {cid}")))
        }
    }

    fn debug_data_eio(&self, oid: &Oid) -> bool {
        self.read_errors.lock().data.contains(oid)
    }

    fn debug_mdata_eio(&self, oid: &Oid) -> bool {
        self.read_errors.lock().mdata.contains(oid)
    }

    fn debug_obj_on_delete(&self, oid: &Oid) {
        let mut errors = self.read_errors.lock();
        errors.data.remove(oid);
        errors.mdata.remove(oid);
    }

    fn injected_io_error(&self, oid: &Oid) -> Error {
        if self.config.fail_on_io_error {
            error!(%oid, "I/O read error with fail_on_io_error set");
            std::process::abort();
        }
        Error::Io(std::io::Error::other(format!("injected read error on {oid}")))
    }

    // ── worker side ──────────────────────────────────────────────────────

    fn worker_loop(self: Arc<Self>) {
        while let Some(osr) = self.wq.dequeue() {
            self.do_op(&osr);
        }
    }

    /// Execute the head op of `osr` under its apply lock, then fan out the
    /// completions in order: dequeue, release the apply lock, run
    /// `on_readable_sync` inline, queue `on_readable`, and finally queue
    /// `on_disk` (dropped when the result is negative).
    ///
    /// Fatal conditions abort inside the decoder; an error surfacing here is
    /// the commit path's header-save failure, which is logged and reported
    /// through the op result instead of taking the process down.
    fn do_op(&self, osr: &OpSequencer) {
        let apply_guard = osr.apply_lock.lock();
        let (op_num, tls) = osr.take_head_work();
        debug!(op = op_num, sequencer = osr.name(), "op start");

        let r: i32 = match self.do_transactions(&tls, op_num) {
            Ok(()) => 0,
            Err(e) => {
                error!(op = op_num, error = %e, "buffered transaction commit failed");
                -1
            }
        };

        let op = osr.dequeue();
        drop(apply_guard);

        let lat = op.start.elapsed();
        debug!(op = op_num, latency_us = lat.as_micros() as u64, "op finish");

        if let Some(sync_cb) = op.on_readable_sync {
            sync_cb(r);
        }
        if let Some(cb) = op.on_readable {
            self.readable_finisher.queue(cb, r);
        }
        if let Some(on_disk) = op.on_disk {
            if r < 0 {
                drop(on_disk);
            } else {
                self.ondisk_finisher.queue(on_disk, r);
            }
        }
    }

    /// Run the op's transaction list through one buffered transaction and
    /// commit it as a single KV batch.
    fn do_transactions(&self, tls: &[Transaction], op_seq: u64) -> Result<()> {
        let backend = self.backend()?;
        let mut bt = BufferTransaction::new(&backend, SequencerPosition::new(op_seq, 0, 0));
        for (trans_num, t) in tls.iter().enumerate() {
            bt.spos.trans = trans_num as u32;
            bt.spos.op = 0;
            self.do_transaction(t, &mut bt);
            self.watchdog.tick();
        }
        bt.submit_transaction()
    }

    /// Decode one transaction into buffered-transaction primitives.
    ///
    /// `NotFound` is tolerated except on clones (an upper-layer bug there);
    /// `NoData` is tolerated; `Unsupported` is logged and skipped; anything
    /// else - `NoSpace` above all - aborts the process after a structured
    /// dump, before a partial application can be committed.
    fn do_transaction(&self, t: &Transaction, bt: &mut BufferTransaction) {
        for op in t.ops() {
            self.watchdog.tick();
            if let Err(e) = self.apply_op(op, bt) {
                let is_clone = matches!(
                    op,
                    TransactionOp::Clone { .. }
                        | TransactionOp::CloneRange { .. }
                        | TransactionOp::CloneRange2 { .. }
                );
                let tolerated = (e.is_not_found() && !is_clone) || e.is_no_data();
                if tolerated {
                    debug!(spos = %bt.spos, error = %e, "tolerated op error");
                } else if matches!(e, Error::Unsupported(_)) {
                    warn!(spos = %bt.spos, error = %e, "unsupported op skipped");
                } else {
                    let msg = if e.is_no_space() {
                        "no-space handling not implemented, aborting before partial application"
                    } else if is_clone && e.is_not_found() {
                        "missing clone source indicates an upper-layer bug"
                    } else {
                        "unexpected error applying transaction op"
                    };
                    error!(spos = %bt.spos, error = %e, "{msg}");
                    error!(transaction = %t.dump(), "transaction dump");
                    std::process::abort();
                }
            }
            bt.spos.op += 1;
        }
    }

    fn apply_op(&self, op: &TransactionOp, bt: &mut BufferTransaction) -> Result<()> {
        match op {
            TransactionOp::Nop => Ok(()),
            TransactionOp::Touch { cid, oid } => self.op_touch(cid, oid, bt),
            TransactionOp::Write {
                cid,
                oid,
                offset,
                len,
                data,
            } => self.op_write(cid, oid, *offset, *len, data, bt),
            TransactionOp::Zero {
                cid,
                oid,
                offset,
                len,
            } => self.op_zero(cid, oid, *offset, *len, bt),
            TransactionOp::TrimCache { .. } => Ok(()), // deprecated
            TransactionOp::Truncate { cid, oid, size } => self.op_truncate(cid, oid, *size, bt),
            TransactionOp::Remove { cid, oid } => self.op_remove(cid, oid, bt),
            TransactionOp::SetAttr {
                cid,
                oid,
                name,
                value,
            } => {
                let mut attrs = BTreeMap::new();
                attrs.insert(name.clone(), value.clone());
                self.op_setattrs(cid, oid, attrs, bt)
            }
            TransactionOp::SetAttrs { cid, oid, attrs } => {
                self.op_setattrs(cid, oid, attrs.clone(), bt)
            }
            TransactionOp::RmAttr { cid, oid, name } => self.op_rmattr(cid, oid, name, bt),
            TransactionOp::RmAttrs { cid, oid } => self.op_rmattrs(cid, oid, bt),
            TransactionOp::Clone { cid, src, dst } => self.op_clone(cid, src, dst, bt),
            TransactionOp::CloneRange {
                cid,
                src,
                dst,
                offset,
                len,
            } => self.op_clone_range(cid, src, dst, *offset, *len, *offset, bt),
            TransactionOp::CloneRange2 {
                cid,
                src,
                dst,
                src_offset,
                len,
                dst_offset,
            } => self.op_clone_range(cid, src, dst, *src_offset, *len, *dst_offset, bt),
            TransactionOp::MkColl { cid } => self.op_create_collection(cid, bt),
            TransactionOp::RmColl { cid } => self.op_destroy_collection(cid, bt),
            TransactionOp::CollAdd { cid, old_cid, oid } => {
                self.op_collection_add(cid, old_cid, oid, bt)
            }
            TransactionOp::CollRemove { cid, oid } => self.op_remove(cid, oid, bt),
            TransactionOp::CollMove { old_cid, cid, oid } => {
                // Deprecated; kept to replay old streams
                self.op_collection_add(cid, old_cid, oid, bt)?;
                self.op_remove(old_cid, oid, bt)
            }
            TransactionOp::CollMoveRename {
                old_cid,
                old_oid,
                cid,
                oid,
            } => self.op_collection_move_rename(old_cid, old_oid, cid, oid, bt),
            TransactionOp::CollSetAttr { cid, name, value } => {
                let mut attrs = BTreeMap::new();
                attrs.insert(name.clone(), value.clone());
                self.op_collection_setattrs(cid, attrs, bt)
            }
            TransactionOp::CollRmAttr { cid, name } => self.op_collection_rmattr(cid, name, bt),
            TransactionOp::StartSync => Ok(()), // commit nudge; batches are atomic
            TransactionOp::CollRename { cid, new_cid } => Err(Error::unsupported(format!(
                "collection rename {cid} -> {new_cid}"
            ))),
            TransactionOp::OmapClear { cid, oid } => self.op_omap_clear(cid, oid, bt),
            TransactionOp::OmapSetKeys { cid, oid, keys } => {
                self.op_omap_setkeys(cid, oid, keys.clone(), bt)
            }
            TransactionOp::OmapRmKeys { cid, oid, keys } => self.op_omap_rmkeys(cid, oid, keys, bt),
            TransactionOp::OmapRmKeyRange {
                cid,
                oid,
                first,
                last,
            } => self.op_omap_rmkeyrange(cid, oid, first, last, bt),
            TransactionOp::OmapSetHeader { cid, oid, data } => {
                self.op_omap_setheader(cid, oid, data.clone(), bt)
            }
            TransactionOp::SplitCollection { cid, bits, rem, dest } => {
                // Reserved variant, accepted as a no-op
                debug!(%cid, bits, rem, %dest, "split-collection (reserved) ignored");
                Ok(())
            }
            TransactionOp::SplitCollection2 {
                cid,
                bits,
                rem,
                dest,
            } => self.op_split_collection(cid, *bits, *rem, dest, bt),
        }
    }

    // ── object ops ───────────────────────────────────────────────────────

    fn op_touch(&self, cid: &Cid, oid: &Oid, bt: &mut BufferTransaction) -> Result<()> {
        bt.lookup_cached_header(cid, oid, true)
            .map_err(|e| Error::invalid_argument(format!("touch {cid}/{oid}: {e}")))?;
        Ok(())
    }

    fn op_write(
        &self,
        cid: &Cid,
        oid: &Oid,
        offset: u64,
        len: u64,
        data: &Bytes,
        bt: &mut BufferTransaction,
    ) -> Result<()> {
        let h = bt.lookup_cached_header(cid, oid, true)?;
        let len = len.min(data.len() as u64);

        {
            let header = bt.header_mut(h);
            if len + offset > header.max_size {
                header.max_size = len + offset;
                let need = header.bits_len_for(header.max_size);
                header.bits.resize(need);
            }
        }

        let strip_size = bt.header(h).strip_size;
        let extents = file_to_extents(offset, len, strip_size);
        let mut data_off = 0usize;
        let mut values = BTreeMap::new();
        for e in &extents {
            let key = strip_object_key(e.no);
            let chunk = &data[data_off..data_off + e.len as usize];
            let value = if bt.header(h).bits.get(e.no) {
                if e.offset == 0 && e.len == strip_size {
                    // Whole-stripe overwrite
                    chunk.to_vec()
                } else {
                    // Splice into the existing stripe, preserving both ends
                    let old = bt.get_buffer_key(h, Prefix::Strip, &key)?;
                    let mut value = Vec::with_capacity(strip_size as usize);
                    value.extend_from_slice(&old[..e.offset as usize]);
                    value.extend_from_slice(chunk);
                    if (value.len() as u64) < strip_size {
                        value.extend_from_slice(&old[value.len()..strip_size as usize]);
                    }
                    value
                }
            } else {
                // Fresh stripe: zero-fill around the written range
                let mut value = vec![0u8; e.offset as usize];
                value.extend_from_slice(chunk);
                value.resize(strip_size as usize, 0);
                bt.header_mut(h).bits.set(e.no, true);
                value
            };
            debug_assert_eq!(value.len() as u64, strip_size);
            data_off += e.len as usize;
            values.insert(key, Bytes::from(value));
        }
        debug_assert_eq!(data_off as u64, len);

        bt.set_buffer_keys(h, Prefix::Strip, values);
        Ok(())
    }

    fn op_zero(
        &self,
        cid: &Cid,
        oid: &Oid,
        offset: u64,
        len: u64,
        bt: &mut BufferTransaction,
    ) -> Result<()> {
        let zeros = Bytes::from(vec![0u8; len as usize]);
        self.op_write(cid, oid, offset, len, &zeros, bt)
    }

    fn op_truncate(
        &self,
        cid: &Cid,
        oid: &Oid,
        size: u64,
        bt: &mut BufferTransaction,
    ) -> Result<()> {
        let h = bt.lookup_cached_header(cid, oid, false)?;
        let (old_max, strip_size) = {
            let header = bt.header(h);
            (header.max_size, header.strip_size)
        };
        if old_max == size {
            return Ok(());
        }

        if old_max > size {
            let extents = file_to_extents(size, old_max - size, strip_size);
            debug_assert!(!extents.is_empty());

            let mut removal_start = 0;
            let first = extents[0];
            if first.offset != 0 {
                // The boundary stripe survives: keep its prefix, zero the tail
                if bt.header(h).bits.get(first.no) {
                    let key = strip_object_key(first.no);
                    let old = bt.get_buffer_key(h, Prefix::Strip, &key)?;
                    let mut value = old[..first.offset as usize].to_vec();
                    value.resize(strip_size as usize, 0);
                    let mut values = BTreeMap::new();
                    values.insert(key, Bytes::from(value));
                    bt.set_buffer_keys(h, Prefix::Strip, values);
                }
                removal_start = 1;
            }

            let mut keys = BTreeSet::new();
            for e in &extents[removal_start..] {
                if bt.header(h).bits.get(e.no) {
                    keys.insert(strip_object_key(e.no));
                    bt.header_mut(h).bits.set(e.no, false);
                }
            }
            bt.remove_buffer_keys(h, Prefix::Strip, &keys)?;
        }

        let header = bt.header_mut(h);
        header.max_size = size;
        let need = header.bits_len_for(size);
        header.bits.resize(need);
        Ok(())
    }

    fn op_remove(&self, cid: &Cid, oid: &Oid, bt: &mut BufferTransaction) -> Result<()> {
        let h = bt.lookup_cached_header(cid, oid, false)?;
        self.debug_obj_on_delete(oid);
        bt.clear_buffer(h)
    }

    fn op_setattrs(
        &self,
        cid: &Cid,
        oid: &Oid,
        attrs: BTreeMap<String, Bytes>,
        bt: &mut BufferTransaction,
    ) -> Result<()> {
        let h = bt.lookup_cached_header(cid, oid, false)?;
        bt.set_buffer_keys(h, Prefix::Xattr, attrs);
        Ok(())
    }

    fn op_rmattr(
        &self,
        cid: &Cid,
        oid: &Oid,
        name: &str,
        bt: &mut BufferTransaction,
    ) -> Result<()> {
        let h = bt.lookup_cached_header(cid, oid, false)?;
        let mut keys = BTreeSet::new();
        keys.insert(name.to_string());
        bt.remove_buffer_keys(h, Prefix::Xattr, &keys)
    }

    fn op_rmattrs(&self, cid: &Cid, oid: &Oid, bt: &mut BufferTransaction) -> Result<()> {
        let h = bt.lookup_cached_header(cid, oid, false)?;
        let keys = match self.backend()?.map().get_keys(cid, oid, Prefix::Xattr) {
            Ok(keys) => keys,
            Err(e) if e.is_not_found() => BTreeSet::new(),
            Err(e) => return Err(e),
        };
        bt.remove_buffer_keys(h, Prefix::Xattr, &keys)?;
        bt.clear_buffer_keys(h, Prefix::Xattr);
        Ok(())
    }

    fn op_clone(&self, cid: &Cid, src: &Oid, dst: &Oid, bt: &mut BufferTransaction) -> Result<()> {
        if src == dst {
            return Ok(());
        }
        let h = bt.lookup_cached_header(cid, src, false)?;
        bt.clone_buffer(h, cid, dst)
    }

    fn op_clone_range(
        &self,
        cid: &Cid,
        src: &Oid,
        dst: &Oid,
        src_offset: u64,
        len: u64,
        dst_offset: u64,
        bt: &mut BufferTransaction,
    ) -> Result<()> {
        let data = self.generic_read(cid, src, src_offset, len, Some(&mut *bt))?;
        let len = data.len() as u64;
        self.op_write(cid, dst, dst_offset, len, &Bytes::from(data), bt)
    }

    /// Range read honoring an in-flight buffered transaction when given one.
    fn generic_read(
        &self,
        cid: &Cid,
        oid: &Oid,
        offset: u64,
        len: u64,
        bt: Option<&mut BufferTransaction>,
    ) -> Result<Vec<u8>> {
        let backend = self.backend()?;
        match bt {
            Some(bt) => {
                let h = bt.lookup_cached_header(cid, oid, false)?;
                read_header_range(&backend, bt.header(h), offset, len)
            }
            None => {
                self.check_coll(cid)?;
                let header = backend.lookup_strip_header(cid, oid)?;
                read_header_range(&backend, &header, offset, len)
            }
        }
    }

    // ── collection ops ───────────────────────────────────────────────────

    fn op_create_collection(&self, cid: &Cid, bt: &mut BufferTransaction) -> Result<()> {
        let meta = coll_meta();
        let coid = oid_for_coll(cid);
        match bt.lookup_cached_header(&meta, &coid, false) {
            Ok(_) => return Err(Error::already_exists(format!("collection {cid}"))),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        bt.lookup_cached_header(&meta, &coid, true)?;
        debug!(%cid, "created collection");
        Ok(())
    }

    fn op_destroy_collection(&self, cid: &Cid, bt: &mut BufferTransaction) -> Result<()> {
        let meta = coll_meta();
        let coid = oid_for_coll(cid);
        let h = bt.lookup_cached_header(&meta, &coid, false)?;

        // Objects of this collection touched by the current transaction must
        // all be deletions
        let mut modified = 0usize;
        for ((c, _), header) in bt.cached_headers() {
            if c != cid {
                continue;
            }
            modified += 1;
            if !header.deleted {
                return Err(Error::not_empty(format!("collection {cid}")));
            }
        }

        // Anything still committed must be one of those deletions
        let (oids, _) = self.backend()?.map().list_objects(cid, None, modified + 1)?;
        if oids.len() != modified && !oids.is_empty() {
            return Err(Error::not_empty(format!("collection {cid}")));
        }
        for oid in &oids {
            if !bt.contains_cached(cid, oid) {
                return Err(Error::not_empty(format!("collection {cid}")));
            }
        }

        bt.clear_buffer(h)
    }

    fn op_collection_add(
        &self,
        cid: &Cid,
        old_cid: &Cid,
        oid: &Oid,
        bt: &mut BufferTransaction,
    ) -> Result<()> {
        let old_h = bt.lookup_cached_header(old_cid, oid, false)?;
        match bt.lookup_cached_header(cid, oid, false) {
            Ok(_) => {
                return Err(Error::already_exists(format!(
                    "{cid}/{oid} while adding from {old_cid}"
                )))
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let max_size = bt.header(old_h).max_size;
        let data = self
            .generic_read(old_cid, oid, 0, max_size, Some(&mut *bt))
            .map_err(|e| Error::invalid_argument(format!("read {old_cid}/{oid}: {e}")))?;
        let len = data.len() as u64;
        self.op_write(cid, oid, 0, len, &Bytes::from(data), bt)
            .map_err(|e| Error::invalid_argument(format!("write {cid}/{oid}: {e}")))
    }

    fn op_collection_move_rename(
        &self,
        old_cid: &Cid,
        old_oid: &Oid,
        cid: &Cid,
        oid: &Oid,
        bt: &mut BufferTransaction,
    ) -> Result<()> {
        match bt.lookup_cached_header(cid, oid, false) {
            Ok(_) => return Err(Error::already_exists(format!("{cid}/{oid}"))),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        let h = bt.lookup_cached_header(old_cid, old_oid, false)?;
        bt.rename_buffer(h, cid, oid);
        Ok(())
    }

    fn op_collection_setattrs(
        &self,
        cid: &Cid,
        attrs: BTreeMap<String, Bytes>,
        bt: &mut BufferTransaction,
    ) -> Result<()> {
        let h = bt.lookup_cached_header(&coll_meta(), &oid_for_coll(cid), false)?;
        bt.set_buffer_keys(h, Prefix::CollAttr, attrs);
        Ok(())
    }

    fn op_collection_rmattr(
        &self,
        cid: &Cid,
        name: &str,
        bt: &mut BufferTransaction,
    ) -> Result<()> {
        let h = bt.lookup_cached_header(&coll_meta(), &oid_for_coll(cid), false)?;
        let mut keys = BTreeSet::new();
        keys.insert(name.to_string());
        bt.remove_buffer_keys(h, Prefix::CollAttr, &keys)
    }

    fn op_split_collection(
        &self,
        cid: &Cid,
        bits: u32,
        rem: u32,
        dest: &Cid,
        bt: &mut BufferTransaction,
    ) -> Result<()> {
        let meta = coll_meta();
        if bt.lookup_cached_header(&meta, &oid_for_coll(cid), false).is_err() {
            debug!(%cid, "split: source collection does not exist");
            return Ok(());
        }
        if bt.lookup_cached_header(&meta, &oid_for_coll(dest), false).is_err() {
            debug!(%dest, "split: destination collection does not exist");
            return Ok(());
        }

        let backend = self.backend()?;
        let mut moved = 0usize;
        let mut cursor: Option<Oid> = None;
        loop {
            let (oids, next) = backend.map().list_objects(cid, cursor.as_ref(), LIST_BATCH)?;
            if oids.is_empty() {
                break;
            }
            for oid in &oids {
                if oid.split_match(bits, rem) {
                    self.op_collection_add(dest, cid, oid, bt)?;
                    self.op_remove(cid, oid, bt)?;
                    moved += 1;
                }
            }
            match next {
                Some(n) => cursor = Some(n),
                None => break,
            }
        }
        debug!(%cid, %dest, bits, rem, moved, "split collection");

        if self.config.debug_verify_split {
            self.verify_split(cid, bits, rem, dest, bt)?;
        }
        Ok(())
    }

    /// Debug pass: nothing matching may remain in the source (modulo objects
    /// this transaction already removed), and everything moved must match.
    fn verify_split(
        &self,
        cid: &Cid,
        bits: u32,
        rem: u32,
        dest: &Cid,
        bt: &BufferTransaction,
    ) -> Result<()> {
        let backend = self.backend()?;
        let (source, _) = backend.map().list_objects(cid, None, 0)?;
        for oid in &source {
            if bt.contains_cached(cid, oid) {
                continue; // removed by this transaction
            }
            assert!(
                !oid.split_match(bits, rem),
                "{oid} still in split source {cid}"
            );
        }
        let (dest_committed, _) = backend.map().list_objects(dest, None, 0)?;
        for oid in &dest_committed {
            assert!(
                oid.split_match(bits, rem),
                "{oid} in split destination {dest} without matching"
            );
        }
        Ok(())
    }

    // ── omap ops ─────────────────────────────────────────────────────────

    fn op_omap_clear(&self, cid: &Cid, oid: &Oid, bt: &mut BufferTransaction) -> Result<()> {
        let h = bt.lookup_cached_header(cid, oid, false)?;
        let keys = match self.backend()?.map().get_keys(cid, oid, Prefix::Omap) {
            Ok(keys) => keys,
            Err(e) if e.is_not_found() => BTreeSet::new(),
            Err(e) => return Err(e),
        };
        bt.remove_buffer_keys(h, Prefix::Omap, &keys)?;

        let mut header_key = BTreeSet::new();
        header_key.insert(OMAP_HEADER_KEY.to_string());
        bt.remove_buffer_keys(h, Prefix::OmapHeader, &header_key)?;
        bt.clear_buffer_keys(h, Prefix::OmapHeader);
        Ok(())
    }

    fn op_omap_setkeys(
        &self,
        cid: &Cid,
        oid: &Oid,
        keys: BTreeMap<String, Bytes>,
        bt: &mut BufferTransaction,
    ) -> Result<()> {
        let h = bt.lookup_cached_header(cid, oid, false)?;
        bt.set_buffer_keys(h, Prefix::Omap, keys);
        Ok(())
    }

    fn op_omap_rmkeys(
        &self,
        cid: &Cid,
        oid: &Oid,
        keys: &BTreeSet<String>,
        bt: &mut BufferTransaction,
    ) -> Result<()> {
        let h = bt.lookup_cached_header(cid, oid, false)?;
        bt.remove_buffer_keys(h, Prefix::Omap, keys)
    }

    fn op_omap_rmkeyrange(
        &self,
        cid: &Cid,
        oid: &Oid,
        first: &str,
        last: &str,
        bt: &mut BufferTransaction,
    ) -> Result<()> {
        let mut keys = BTreeSet::new();
        let mut it = self.backend()?.map().get_iterator(cid, oid, Prefix::Omap)?;
        it.lower_bound(first);
        while let Some(key) = it.key() {
            if key >= last {
                break;
            }
            keys.insert(key.to_string());
            it.next();
        }
        self.op_omap_rmkeys(cid, oid, &keys, bt)
    }

    fn op_omap_setheader(
        &self,
        cid: &Cid,
        oid: &Oid,
        data: Bytes,
        bt: &mut BufferTransaction,
    ) -> Result<()> {
        let h = bt.lookup_cached_header(cid, oid, false)?;
        let mut values = BTreeMap::new();
        values.insert(OMAP_HEADER_KEY.to_string(), data);
        bt.set_buffer_keys(h, Prefix::OmapHeader, values);
        Ok(())
    }
}

/// Assemble `[offset, offset + len)` from stripe rows, buffered values, and
/// zero holes. Reads clamp to the object size; an offset beyond it is an
/// error; `len == 0` reads to the end.
fn read_header_range(
    backend: &StripObjectMap,
    header: &StripHeader,
    offset: u64,
    len: u64,
) -> Result<Vec<u8>> {
    if offset > header.max_size {
        return Err(Error::invalid_argument(format!(
            "read offset {offset} beyond object size {}",
            header.max_size
        )));
    }
    let len = if len == 0 || offset + len > header.max_size {
        header.max_size - offset
    } else {
        len
    };
    if len == 0 {
        return Ok(Vec::new());
    }

    let extents = file_to_extents(offset, len, header.strip_size);

    let mut have: BTreeMap<String, Bytes> = BTreeMap::new();
    let mut want: BTreeSet<String> = BTreeSet::new();
    for e in &extents {
        let key = strip_object_key(e.no);
        if let Some(Some(value)) = header.buffers.get(&(Prefix::Strip, key.clone())) {
            debug_assert!(header.bits.get(e.no));
            have.insert(key, value.clone());
        } else if header.bits.get(e.no) {
            want.insert(key);
        }
    }
    if !want.is_empty() {
        let fetched = backend
            .map()
            .get_values(&header.cid, &header.oid, Prefix::Strip, &want)?;
        if fetched.len() != want.len() {
            return Err(Error::storage(format!(
                "{}/{} missing stripe rows for materialized stripes",
                header.cid, header.oid
            )));
        }
        have.extend(fetched);
    }

    let mut out = Vec::with_capacity(len as usize);
    for e in &extents {
        if header.bits.get(e.no) {
            let value = &have[&strip_object_key(e.no)];
            out.extend_from_slice(&value[e.offset as usize..(e.offset + e.len) as usize]);
        } else {
            out.resize(out.len() + e.len as usize, 0);
        }
    }
    Ok(out)
}
