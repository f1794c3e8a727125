//! # rusd-mvcc: the revisioned key-value core of rusd
//!
//! An embeddable etcd-style storage core. It provides:
//!
//! - **MVCC semantics**: every write gets a revision, reads at any retained revision
//! - **Transactions**: compare-and-swap with nested branches, one revision per txn
//! - **Watch subsystem**: ordered, exactly-once change notifications with catch-up
//! - **Lease management**: TTL-based automatic key deletion
//! - **Apply arbitration**: space quota and alarms gating writes
//! - **Compaction**: manual and automatic, with background payload removal
//!
//! # Usage
//!
//! ```no_run
//! use rusd_mvcc::{ApplyCommand, CoreConfig, KvCore, WatchRequest};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let core = KvCore::open(CoreConfig::with_data_dir("default.rusd")).await?;
//! let mut watch = core.store().watch_stream();
//! watch.watch(WatchRequest::key(b"foo"))?;
//!
//! core.apply_handle()
//!     .apply(ApplyCommand::Put { key: b"foo".to_vec(), value: b"bar".to_vec(), lease: 0 })
//!     .await?;
//! let change = watch.recv().await;
//! # drop(change);
//! core.shutdown().await
//! # }
//! ```

pub mod apply;
pub mod lease;
pub mod server;
pub mod storage;
pub mod watch;

// Re-export main types at crate root for convenience
pub use apply::{ApplyCommand, ApplyError, ApplyHandle, ApplyResponse};
pub use lease::LeaseManager;
pub use server::{init_tracing, CoreConfig, KvCore};
pub use storage::{Backend, Event, KeyValue, MvccStore};
pub use watch::{WatchRequest, WatchResponse, WatchStream, WatchableStore};
