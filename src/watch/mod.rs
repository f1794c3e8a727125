//! Watchable store and watch streams.
//!
//! [`WatchableStore`] wraps the MVCC store: every write it performs is forwarded, with
//! the exact events it produced, to a single dispatcher task that owns all watcher
//! state. Watchers are created through a [`WatchStream`], which multiplexes the
//! responses of all its watchers onto one ordered channel.
//!
//! A watcher is either synced (receives commits as they happen) or unsynced (still
//! replaying history from its start revision). The dispatcher catches unsynced
//! watchers up in the background and promotes them once they reach the revision it
//! has dispatched.

mod dispatcher;
mod group;
mod stream;

pub use stream::WatchStream;

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::storage::index::key_in_range;
use crate::storage::{
    CompactionHandle, DeleteResult, Event, MvccStore, PutResult, RangeOptions,
    RangeResult, StorageResult, TxnRequest, TxnResponse, WriteOutcome, WriteTxn,
};
use dispatcher::{Command, Dispatcher};

/// Watch id asking the stream to pick one.
pub const AUTO_WATCH_ID: i64 = 0;

/// Watch id of responses that concern every watcher of a stream.
pub const INVALID_WATCH_ID: i64 = -1;

/// Watch-related errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WatchError {
    #[error("Watch not found: {0}")]
    WatchNotFound(i64),

    #[error("Duplicate watch id: {0}")]
    DuplicateWatchId(i64),

    #[error("Watch range is empty")]
    EmptyRange,

    #[error("Invalid watch configuration: {0}")]
    InvalidConfig(String),

    #[error("Channel closed")]
    ChannelClosed,
}

pub type WatchResult<T> = Result<T, WatchError>;

/// A watched key or key range.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct WatchRange {
    pub key: Vec<u8>,
    pub range_end: Vec<u8>,
}

impl WatchRange {
    /// Check if a key falls within this watch range.
    ///
    /// An empty `range_end` watches only `key`; `"\0"` watches every key >= `key`.
    pub fn contains(&self, key: &[u8]) -> bool {
        key_in_range(key, &self.key, &self.range_end)
    }

    pub fn is_single_key(&self) -> bool {
        self.range_end.is_empty()
    }
}

/// Filter types for watch events.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchFilter {
    /// Do not emit delete events.
    NoDelete,
    /// Do not emit put events.
    NoPut,
}

/// Parameters of a new watcher.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WatchRequest {
    pub key: Vec<u8>,
    pub range_end: Vec<u8>,
    /// First revision to deliver, inclusive. 0 watches from the next commit.
    pub start_revision: i64,
    /// Requested id, or [`AUTO_WATCH_ID`]
    pub watch_id: i64,
    pub filters: Vec<WatchFilter>,
    /// Attach the previous key-value to each event
    pub prev_kv: bool,
    /// Receive periodic progress notifications while idle
    pub progress_notify: bool,
}

impl WatchRequest {
    /// Watches a single key from the next commit.
    pub fn key(key: &[u8]) -> Self {
        Self {
            key: key.to_vec(),
            ..Default::default()
        }
    }

    /// Watches `[key, range_end)` from the next commit.
    pub fn range(key: &[u8], range_end: &[u8]) -> Self {
        Self {
            key: key.to_vec(),
            range_end: range_end.to_vec(),
            ..Default::default()
        }
    }

    pub fn from_revision(mut self, start_revision: i64) -> Self {
        self.start_revision = start_revision;
        self
    }

    pub fn with_id(mut self, watch_id: i64) -> Self {
        self.watch_id = watch_id;
        self
    }

    pub fn with_filter(mut self, filter: WatchFilter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_prev_kv(mut self) -> Self {
        self.prev_kv = true;
        self
    }

    pub fn with_progress_notify(mut self) -> Self {
        self.progress_notify = true;
        self
    }

    pub(crate) fn watch_range(&self) -> WatchRange {
        WatchRange {
            key: self.key.clone(),
            range_end: self.range_end.clone(),
        }
    }

    fn validate(&self) -> WatchResult<()> {
        if self.key.is_empty() && self.range_end.is_empty() {
            return Err(WatchError::InvalidConfig(
                "Watch key cannot be empty".to_string(),
            ));
        }
        if !self.range_end.is_empty()
            && self.range_end.as_slice() != b"\0"
            && self.range_end <= self.key
        {
            return Err(WatchError::EmptyRange);
        }
        if self.start_revision < 0 {
            return Err(WatchError::InvalidConfig(format!(
                "negative start revision {}",
                self.start_revision
            )));
        }
        if self.watch_id < 0 {
            return Err(WatchError::InvalidConfig(format!(
                "negative watch id {}",
                self.watch_id
            )));
        }
        Ok(())
    }

    /// Whether an event passes this watcher's filters.
    pub(crate) fn accepts(&self, event: &Event) -> bool {
        use crate::storage::EventType;
        match event.event_type {
            EventType::Put => !self.filters.contains(&WatchFilter::NoPut),
            EventType::Delete => !self.filters.contains(&WatchFilter::NoDelete),
        }
    }
}

/// A response delivered on a watch stream.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WatchResponse {
    pub watch_id: i64,
    /// Main revision of the events, or the dispatched revision for progress
    pub revision: i64,
    /// Empty for progress notifications
    pub events: Vec<Event>,
    /// Set when the watcher was terminated because its history was compacted
    pub compact_revision: i64,
    /// The watcher was terminated; nothing follows for this id
    pub canceled: bool,
}

impl WatchResponse {
    pub fn is_progress_notify(&self) -> bool {
        self.events.is_empty() && !self.canceled
    }
}

/// Watch subsystem configuration.
#[derive(Clone, Debug)]
pub struct WatchConfig {
    /// Responses staged per stream before a slow consumer is disconnected
    pub stream_buffer: usize,

    /// Interval of the catch-up pass over unsynced watchers
    pub sync_interval: Duration,

    /// Interval of progress notifications to watchers that asked for them
    pub progress_interval: Duration,

    /// Unsynced watchers advanced per catch-up pass
    pub sync_watcher_limit: usize,

    /// Revisions replayed per watcher per catch-up pass
    pub sync_revision_limit: i64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            stream_buffer: 128,
            sync_interval: Duration::from_millis(100),
            progress_interval: Duration::from_secs(600),
            sync_watcher_limit: 512,
            sync_revision_limit: 1000,
        }
    }
}

/// MVCC store whose writes are observable through watch streams.
///
/// Writes made on the wrapped [`MvccStore`] directly are not seen by watchers.
pub struct WatchableStore {
    store: Arc<MvccStore>,
    commands: mpsc::UnboundedSender<Command>,
    /// Keeps commit notifications in revision order
    write_lock: Mutex<()>,
    next_stream_id: AtomicU64,
    config: WatchConfig,
}

impl WatchableStore {
    /// Wraps `store` and spawns the dispatcher task on the current runtime.
    pub fn new(store: Arc<MvccStore>, config: WatchConfig) -> (Arc<Self>, JoinHandle<()>) {
        let (commands, rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(store.clone(), config.clone());
        let handle = tokio::spawn(dispatcher.run(rx));

        info!(
            revision = store.current_revision(),
            "Watchable store started"
        );
        let watchable = Arc::new(Self {
            store,
            commands,
            write_lock: Mutex::new(()),
            next_stream_id: AtomicU64::new(1),
            config,
        });
        (watchable, handle)
    }

    pub fn store(&self) -> &Arc<MvccStore> {
        &self.store
    }

    pub fn current_revision(&self) -> i64 {
        self.store.current_revision()
    }

    pub fn range(
        &self,
        key: &[u8],
        range_end: &[u8],
        options: &RangeOptions,
    ) -> StorageResult<RangeResult> {
        self.store.range(key, range_end, options)
    }

    pub fn put(&self, key: &[u8], value: &[u8], lease: i64) -> StorageResult<PutResult> {
        let _guard = self.write_lock.lock();
        let result = self.store.put(key, value, lease)?;
        self.notify(result.revision, &result.events);
        Ok(result)
    }

    pub fn delete_range(&self, key: &[u8], range_end: &[u8]) -> StorageResult<DeleteResult> {
        let _guard = self.write_lock.lock();
        let result = self.store.delete_range(key, range_end)?;
        self.notify(result.revision, &result.events);
        Ok(result)
    }

    pub fn txn(&self, request: &TxnRequest) -> StorageResult<TxnResponse> {
        let ((succeeded, responses), outcome) = self.write(|txn| txn.txn(request))?;
        Ok(TxnResponse {
            succeeded,
            responses,
            revision: outcome.revision,
            events: outcome.events,
        })
    }

    /// Runs `f` inside one write txn and notifies watchers of what it wrote.
    ///
    /// Changes staged before `f` fails are still committed and dispatched.
    pub fn write<T>(
        &self,
        f: impl FnOnce(&mut WriteTxn<'_>) -> StorageResult<T>,
    ) -> StorageResult<(T, WriteOutcome)> {
        let _guard = self.write_lock.lock();
        let mut txn = self.store.write();
        let result = f(&mut txn);
        let outcome = txn.end();
        self.notify(outcome.revision, &outcome.events);
        result.map(|value| (value, outcome))
    }

    /// Compacts the store. Unsynced watchers that still need the removed history
    /// are terminated on their next catch-up pass.
    pub fn compact(&self, revision: i64) -> StorageResult<CompactionHandle> {
        self.store.compact(revision)
    }

    /// Opens a stream. Must be called within a tokio runtime.
    pub fn watch_stream(&self) -> WatchStream {
        let id = self.next_stream_id.fetch_add(1, Ordering::SeqCst);
        WatchStream::open(id, self.commands.clone(), self.config.stream_buffer)
    }

    fn notify(&self, revision: i64, events: &[Event]) {
        if events.is_empty() {
            return;
        }
        let command = Command::Commit {
            revision,
            events: events.to_vec(),
        };
        if self.commands.send(command).is_err() {
            debug!(revision, "Watch dispatcher is gone, commit not dispatched");
        }
    }
}

/// Event as delivered to a watcher, honoring its `prev_kv` option.
pub(crate) fn deliverable(event: &Event, prev_kv: bool) -> Event {
    Event {
        event_type: event.event_type,
        kv: event.kv.clone(),
        prev_kv: if prev_kv {
            event.prev_kv.clone()
        } else {
            None
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{
        Backend, BackendConfig, EventType, MvccConfig, RequestOp, StorageError,
    };
    use tempfile::TempDir;
    use tokio::time::timeout;

    fn setup(config: WatchConfig) -> (TempDir, Arc<WatchableStore>) {
        let temp_dir = TempDir::new().unwrap();
        let backend = Backend::new(BackendConfig {
            data_dir: temp_dir.path().to_path_buf(),
            ..Default::default()
        })
        .unwrap();
        let store = MvccStore::new(backend, MvccConfig::default(), None).unwrap();
        let (watchable, _dispatcher) = WatchableStore::new(store, config);
        (temp_dir, watchable)
    }

    async fn next(stream: &mut WatchStream) -> WatchResponse {
        timeout(Duration::from_secs(5), stream.recv())
            .await
            .expect("timed out waiting for a watch response")
            .expect("stream closed")
    }

    async fn assert_quiet(stream: &mut WatchStream) {
        let got = timeout(Duration::from_millis(300), stream.recv()).await;
        assert!(got.is_err(), "unexpected response {:?}", got);
    }

    #[test]
    fn test_watch_range_contains() {
        let range = WatchRange {
            key: b"foo".to_vec(),
            range_end: b"fop".to_vec(),
        };

        assert!(range.contains(b"foo"));
        assert!(range.contains(b"foobar"));
        assert!(!range.contains(b"fop"));
        assert!(!range.contains(b"aaa"));
        assert!(!range.contains(b"fon"));
    }

    #[test]
    fn test_watch_range_single_and_all_keys() {
        let single = WatchRange {
            key: b"foo/".to_vec(),
            range_end: Vec::new(),
        };
        assert!(single.contains(b"foo/"));
        assert!(!single.contains(b"foo/a"));

        let all = WatchRange {
            key: b"".to_vec(),
            range_end: b"\0".to_vec(),
        };
        assert!(all.contains(b"aaa"));
        assert!(all.contains(b""));
    }

    #[test]
    fn test_request_validation() {
        assert_eq!(
            WatchRequest::range(b"b", b"a").validate(),
            Err(WatchError::EmptyRange)
        );
        assert_eq!(
            WatchRequest::range(b"a", b"a").validate(),
            Err(WatchError::EmptyRange)
        );
        assert!(WatchRequest::range(b"a", b"\0").validate().is_ok());
        assert!(WatchRequest::range(b"", b"\0").validate().is_ok());
        assert!(matches!(
            WatchRequest::key(b"").validate(),
            Err(WatchError::InvalidConfig(_))
        ));
        assert!(matches!(
            WatchRequest::key(b"a").from_revision(-1).validate(),
            Err(WatchError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_catch_up_from_history() {
        let (_dir, store) = setup(WatchConfig::default());
        assert_eq!(store.put(b"foo", b"bar", 0).unwrap().revision, 2);

        let mut stream = store.watch_stream();
        let id = stream
            .watch(WatchRequest::key(b"foo").from_revision(1))
            .unwrap();

        let resp = next(&mut stream).await;
        assert_eq!(resp.watch_id, id);
        assert_eq!(resp.revision, 2);
        assert_eq!(resp.events.len(), 1);
        assert_eq!(resp.events[0].event_type, EventType::Put);
        assert_eq!(resp.events[0].kv.key, b"foo");
        assert_eq!(resp.events[0].kv.value, b"bar");
        assert_eq!(resp.events[0].kv.mod_revision, 2);

        // Promoted: later commits arrive live
        store.put(b"foo", b"baz", 0).unwrap();
        let resp = next(&mut stream).await;
        assert_eq!(resp.revision, 3);
        assert_eq!(resp.events[0].kv.value, b"baz");
    }

    #[tokio::test]
    async fn test_put_then_delete_are_separate_responses() {
        let (_dir, store) = setup(WatchConfig::default());
        let mut stream = store.watch_stream();
        stream.watch(WatchRequest::key(b"a")).unwrap();

        store.put(b"a", b"1", 0).unwrap();
        store.delete_range(b"a", b"").unwrap();

        let first = next(&mut stream).await;
        assert_eq!(first.events.len(), 1);
        assert_eq!(first.events[0].event_type, EventType::Put);
        assert_eq!(first.revision, 2);

        let second = next(&mut stream).await;
        assert_eq!(second.events.len(), 1);
        assert_eq!(second.events[0].event_type, EventType::Delete);
        assert_eq!(second.revision, 3);
    }

    #[tokio::test]
    async fn test_catch_up_is_exactly_once_and_ordered() {
        let (_dir, store) = setup(WatchConfig {
            sync_revision_limit: 3,
            ..Default::default()
        });
        for i in 0..10 {
            store.put(b"k", format!("{}", i).as_bytes(), 0).unwrap();
        }
        store.put(b"other", b"x", 0).unwrap();

        let mut stream = store.watch_stream();
        stream
            .watch(WatchRequest::range(b"k", b"l").from_revision(4))
            .unwrap();

        // Writes racing with catch-up must be neither lost nor duplicated
        store.put(b"k", b"live", 0).unwrap();

        let mut revisions = Vec::new();
        while revisions.len() < 9 {
            let resp = next(&mut stream).await;
            assert_eq!(resp.events.len(), 1);
            revisions.push(resp.events[0].kv.mod_revision);
        }
        assert_eq!(revisions, vec![4, 5, 6, 7, 8, 9, 10, 11, 13]);
        assert_quiet(&mut stream).await;
    }

    #[tokio::test]
    async fn test_txn_events_grouped_per_revision() {
        let (_dir, store) = setup(WatchConfig::default());
        let mut live = store.watch_stream();
        live.watch(WatchRequest::range(b"a", b"z")).unwrap();

        let put = |key: &str| crate::storage::RequestOp::Put {
            key: key.as_bytes().to_vec(),
            value: b"v".to_vec(),
            lease: 0,
        };
        store
            .txn(&TxnRequest {
                success: vec![put("a"), put("b"), put("c")],
                ..Default::default()
            })
            .unwrap();

        let resp = next(&mut live).await;
        assert_eq!(resp.revision, 2);
        assert_eq!(resp.events.len(), 3);

        // Catch-up groups the same way
        let mut replay = store.watch_stream();
        replay
            .watch(WatchRequest::range(b"a", b"z").from_revision(1))
            .unwrap();
        let resp = next(&mut replay).await;
        assert_eq!(resp.revision, 2);
        assert_eq!(resp.events.len(), 3);
    }

    #[tokio::test]
    async fn test_filters_and_prev_kv() {
        let (_dir, store) = setup(WatchConfig::default());
        let mut stream = store.watch_stream();
        let no_put = stream
            .watch(WatchRequest::key(b"k").with_filter(WatchFilter::NoPut).with_prev_kv())
            .unwrap();
        let plain = stream.watch(WatchRequest::key(b"k")).unwrap();

        store.put(b"k", b"1", 0).unwrap();
        store.delete_range(b"k", b"").unwrap();

        let resp = next(&mut stream).await;
        assert_eq!(resp.watch_id, plain);
        assert!(resp.events[0].prev_kv.is_none());

        let mut seen = vec![next(&mut stream).await, next(&mut stream).await];
        seen.sort_by_key(|r| r.watch_id);
        assert_eq!(seen[0].watch_id, no_put);
        assert_eq!(seen[0].events[0].event_type, EventType::Delete);
        assert_eq!(seen[0].events[0].prev_kv.as_ref().unwrap().value, b"1");
        assert_eq!(seen[1].watch_id, plain);
        assert!(seen[1].events[0].prev_kv.is_none());
    }

    #[tokio::test]
    async fn test_cancel_twice() {
        let (_dir, store) = setup(WatchConfig::default());
        let mut stream = store.watch_stream();
        let id = stream.watch(WatchRequest::key(b"k")).unwrap();

        assert!(stream.cancel(id).is_ok());
        assert_eq!(stream.cancel(id), Err(WatchError::WatchNotFound(id)));
        assert_eq!(stream.cancel(42), Err(WatchError::WatchNotFound(42)));

        store.put(b"k", b"v", 0).unwrap();
        assert_quiet(&mut stream).await;
    }

    #[tokio::test]
    async fn test_watch_ids() {
        let (_dir, store) = setup(WatchConfig::default());
        let mut stream = store.watch_stream();

        let custom = stream.watch(WatchRequest::key(b"a").with_id(1)).unwrap();
        assert_eq!(custom, 1);
        assert_eq!(
            stream.watch(WatchRequest::key(b"b").with_id(1)),
            Err(WatchError::DuplicateWatchId(1))
        );

        // Auto ids start at zero and skip ids in use
        assert_eq!(stream.watch(WatchRequest::key(b"b")).unwrap(), 0);
        assert_eq!(stream.watch(WatchRequest::key(b"c")).unwrap(), 2);

        // Ids are scoped to their stream
        let mut other = store.watch_stream();
        assert_eq!(other.watch(WatchRequest::key(b"a").with_id(1)).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_progress_requests() {
        let (_dir, store) = setup(WatchConfig::default());
        store.put(b"x", b"1", 0).unwrap();

        let mut stream = store.watch_stream();
        let id = stream.watch(WatchRequest::key(b"k")).unwrap();
        stream.request_progress(id).unwrap();

        let resp = next(&mut stream).await;
        assert_eq!(resp.watch_id, id);
        assert_eq!(resp.revision, 2);
        assert!(resp.is_progress_notify());

        stream.request_progress_all().unwrap();
        let resp = next(&mut stream).await;
        assert_eq!(resp.watch_id, INVALID_WATCH_ID);
        assert_eq!(resp.revision, 2);
        assert!(resp.events.is_empty());

        assert_eq!(
            stream.request_progress(7),
            Err(WatchError::WatchNotFound(7))
        );
    }

    #[tokio::test]
    async fn test_no_progress_for_unsynced_watcher() {
        let (_dir, store) = setup(WatchConfig {
            // Catch-up only runs on registration and commits
            sync_interval: Duration::from_secs(3600),
            sync_revision_limit: 1,
            ..Default::default()
        });
        for i in 0..5 {
            store.put(b"k", format!("{}", i).as_bytes(), 0).unwrap();
        }

        let mut stream = store.watch_stream();
        let id = stream
            .watch(WatchRequest::key(b"k").from_revision(2))
            .unwrap();
        stream.request_progress(id).unwrap();
        stream.request_progress_all().unwrap();

        // Only the first replayed revision; no progress while catching up
        let resp = next(&mut stream).await;
        assert_eq!(resp.revision, 2);
        assert_eq!(resp.events.len(), 1);
        assert_quiet(&mut stream).await;
    }

    #[tokio::test]
    async fn test_periodic_progress_notify() {
        let (_dir, store) = setup(WatchConfig {
            progress_interval: Duration::from_millis(100),
            ..Default::default()
        });
        let mut stream = store.watch_stream();
        let id = stream
            .watch(WatchRequest::key(b"k").with_progress_notify())
            .unwrap();
        stream.watch(WatchRequest::key(b"quiet")).unwrap();

        let resp = next(&mut stream).await;
        assert_eq!(resp.watch_id, id);
        assert!(resp.is_progress_notify());
        assert_eq!(resp.revision, 1);
    }

    #[tokio::test]
    async fn test_compacted_watcher_is_terminated() {
        let (_dir, store) = setup(WatchConfig::default());
        for i in 0..5 {
            store.put(b"key", format!("v{}", i).as_bytes(), 0).unwrap();
        }
        store.compact(4).unwrap();

        let mut stream = store.watch_stream();
        let id = stream
            .watch(WatchRequest::key(b"key").from_revision(2))
            .unwrap();

        let resp = next(&mut stream).await;
        assert_eq!(resp.watch_id, id);
        assert!(resp.canceled);
        assert_eq!(resp.compact_revision, 4);
        assert!(resp.events.is_empty());

        store.put(b"key", b"after", 0).unwrap();
        assert_quiet(&mut stream).await;
        assert_eq!(stream.cancel(id), Err(WatchError::WatchNotFound(id)));
    }

    #[tokio::test]
    async fn test_slow_consumer_is_disconnected() {
        let (_dir, store) = setup(WatchConfig {
            stream_buffer: 1,
            ..Default::default()
        });
        let mut slow = store.watch_stream();
        slow.watch(WatchRequest::key(b"k")).unwrap();
        let mut healthy = store.watch_stream();
        healthy.watch(WatchRequest::key(b"k")).unwrap();

        for i in 0..20 {
            store.put(b"k", format!("{}", i).as_bytes(), 0).unwrap();
            // The healthy stream keeps up
            let resp = next(&mut healthy).await;
            assert_eq!(resp.revision, i + 2);
        }

        let mut delivered = 0;
        while timeout(Duration::from_secs(5), slow.recv())
            .await
            .expect("slow stream was never closed")
            .is_some()
        {
            delivered += 1;
        }
        assert!(delivered < 20);
    }

    #[tokio::test]
    async fn test_write_closure_notifies_once() {
        let (_dir, store) = setup(WatchConfig::default());
        let mut stream = store.watch_stream();
        stream.watch(WatchRequest::range(b"a", b"c")).unwrap();

        let (_, outcome) = store
            .write(|txn| {
                txn.put(b"a", b"1", 0)?;
                txn.put(b"b", b"1", 0)?;
                Ok(())
            })
            .unwrap();
        assert_eq!(outcome.revision, 2);

        let resp = next(&mut stream).await;
        assert_eq!(resp.events.len(), 2);
        assert_quiet(&mut stream).await;
    }

    #[tokio::test]
    async fn test_rejected_txn_is_neither_applied_nor_dispatched() {
        let (_dir, store) = setup(WatchConfig::default());
        let mut stream = store.watch_stream();
        stream.watch(WatchRequest::range(b"a", b"z")).unwrap();

        let request = TxnRequest {
            success: vec![
                RequestOp::Put {
                    key: b"a".to_vec(),
                    value: b"1".to_vec(),
                    lease: 0,
                },
                RequestOp::Range {
                    key: b"a".to_vec(),
                    range_end: Vec::new(),
                    options: RangeOptions {
                        revision: 999,
                        ..Default::default()
                    },
                },
            ],
            ..Default::default()
        };
        assert!(matches!(
            store.txn(&request),
            Err(StorageError::FutureRevision { requested: 999, .. })
        ));
        assert_eq!(store.current_revision(), 1);
        assert!(store
            .range(b"a", b"", &RangeOptions::default())
            .unwrap()
            .kvs
            .is_empty());

        // The next write takes the revision the rejected txn would have used
        assert_eq!(store.put(b"b", b"1", 0).unwrap().revision, 2);
        let resp = next(&mut stream).await;
        assert_eq!(resp.revision, 2);
        assert_eq!(resp.events[0].kv.key, b"b");
        assert_quiet(&mut stream).await;
    }

    #[tokio::test]
    async fn test_failed_write_closure_dispatches_what_it_staged() {
        let (_dir, store) = setup(WatchConfig::default());
        let mut stream = store.watch_stream();
        stream.watch(WatchRequest::range(b"a", b"z")).unwrap();

        let result: StorageResult<((), WriteOutcome)> = store.write(|txn| {
            txn.put(b"a", b"1", 0)?;
            Err(StorageError::InvalidArgument("stop".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(store.current_revision(), 2);

        let resp = next(&mut stream).await;
        assert_eq!(resp.revision, 2);
        assert_eq!(resp.events.len(), 1);
    }

    #[tokio::test]
    async fn test_reused_watch_id_skips_staged_responses_of_old_watcher() {
        let (_dir, store) = setup(WatchConfig {
            stream_buffer: 4,
            ..Default::default()
        });
        let mut stream = store.watch_stream();
        stream.watch(WatchRequest::key(b"a").with_id(1)).unwrap();

        // Fill the consumer channel, the delivery task and the staging channel
        for i in 0..8 {
            store.put(b"a", format!("{}", i).as_bytes(), 0).unwrap();
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        stream.cancel(1).unwrap();
        stream.watch(WatchRequest::key(b"b").with_id(1)).unwrap();
        let rev = store.put(b"b", b"1", 0).unwrap().revision;
        assert_eq!(rev, 10);

        let mut old = Vec::new();
        let resp = loop {
            let resp = next(&mut stream).await;
            assert_eq!(resp.watch_id, 1);
            if resp.events[0].kv.key == b"b" {
                break resp;
            }
            old.push(resp.revision);
        };
        assert_eq!(resp.revision, rev);
        // Only what was handed on before the cancel arrives, in order
        assert!(old.len() <= 5, "stale responses delivered: {:?}", old);
        assert_eq!(old, (2..2 + old.len() as i64).collect::<Vec<_>>());
        assert_quiet(&mut stream).await;
    }
}
