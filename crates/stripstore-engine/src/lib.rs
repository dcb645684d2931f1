//! Stripstore Engine - object storage over an ordered KV backend
//!
//! This crate implements the store engine:
//! - Generic object map: per-(collection, object) headers over KV
//! - Strip engine: byte-range to stripe-key translation with sparse holes
//! - Buffered transactions: op batching with a write-through header cache
//! - Sequenced op pipeline: ordered submission over a worker pool
//! - Transaction decoding and the public store facade

pub mod buffer;
pub mod kv;
pub mod layout;
pub mod object_map;
pub mod sequencer;
pub mod store;
pub mod strip;
pub mod transaction;

// Re-exports
pub use buffer::{BufferTransaction, HeaderHandle};
pub use kv::{KeyValueDb, KvBatch, KvOp, RedbStore};
pub use object_map::{Header, ObjectMap, OmapIterator, Prefix, OMAP_HEADER_KEY};
pub use sequencer::{Completion, OpCallbacks, Sequencer};
pub use store::StripStore;
pub use strip::{file_to_extents, strip_object_key, StripBitmap, StripExtent, StripObjectMap};
pub use transaction::{Transaction, TransactionOp};

pub use stripstore_common::{
    Cid, Error, NameError, ObjectStat, Oid, Result, SequencerPosition, StoreConfig, StoreStatFs,
};
