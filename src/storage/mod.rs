//! Storage engine module providing MVCC (Multi-Version Concurrency Control) semantics.
//!
//! The storage module implements etcd's core versioning and consistency model using sled as
//! the underlying key-value store:
//!
//! 1. **Revision index**: in-memory history of every key, queried at any revision
//! 2. **Buffered backend**: a single write batch at a time, readers see snapshots
//!    combining the last flush with the overlay of finished batches
//! 3. **MVCC store**: Put / DeleteRange / Txn / Range / Compact over the two
//!
//! The MVCC model ensures:
//! - Every write creates a monotonically increasing revision number
//! - Point-in-time reads at any historical revision
//! - Efficient range queries
//! - Background compaction to reclaim storage space

pub mod backend;
pub mod buffer;
pub mod compaction;
pub mod index;
pub mod mvcc;
pub mod revision;
pub mod txn;

pub use backend::{Backend, BackendConfig, BackendError, BackendResult, Bucket};
pub use compaction::{AutoCompactionMode, CompactionHandle, Compactor, CompactorConfig};
pub use index::{IndexError, KeyIndex};
pub use mvcc::{
    DeleteResult, Event, EventType, KeyValue, MvccConfig, MvccStore, PutResult, RangeOptions,
    RangeResult, WriteOutcome, WriteTxn,
};
pub use revision::Revision;
pub use txn::{
    Compare, CompareResult, CompareTarget, RequestOp, ResponseOp, TxnRequest, TxnResponse,
};

use thiserror::Error;

/// Storage engine errors.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("mvcc: required revision {requested} has been compacted (compacted at {compacted})")]
    Compacted { requested: i64, compacted: i64 },

    #[error("mvcc: required revision {requested} is a future revision (current {current})")]
    FutureRevision { requested: i64, current: i64 },

    #[error("lease not found: {0}")]
    LeaseNotFound(i64),

    #[error("duplicate key given in txn request: {}", String::from_utf8_lossy(.0))]
    DuplicateKey(Vec<u8>),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;
