//! Multi-Version Concurrency Control (MVCC) store.
//!
//! This is the core of the storage engine, implementing etcd's revision-based versioning.
//! Every write operation increments the global revision counter, enabling:
//!
//! - Point-in-time reads at any historical revision
//! - Consistent snapshots
//! - Reliable watch/notification semantics
//! - Non-blocking concurrent reads
//!
//! The MVCC store maintains:
//! 1. KeyValue payloads in the `key` bucket, keyed by encoded revision
//! 2. An in-memory index mapping keys to their revision history
//! 3. Current and compact revision counters
//!
//! All mutations go through a [`WriteTxn`], which holds the backend's single write
//! batch. Every change inside one write txn shares a main revision and gets the
//! next sub revision.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::lease::Lessor;
use crate::storage::backend::{BatchTx, BucketReader};
use crate::storage::compaction::{CompactionHandle, CompactionWorker};
use crate::storage::revision::{is_tombstone, Revision};
use crate::storage::{Backend, Bucket, KeyIndex, StorageError, StorageResult};

/// Meta bucket key holding the last scheduled compaction revision.
pub(crate) const SCHEDULED_COMPACT_KEY: &[u8] = b"scheduledCompactRev";
/// Meta bucket key holding the last finished compaction revision.
pub(crate) const FINISHED_COMPACT_KEY: &[u8] = b"finishedCompactRev";

/// Entries fetched per backend read while rebuilding the index.
const RESTORE_CHUNK: usize = 10_000;

/// A key-value pair with MVCC metadata.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    /// The actual key
    pub key: Vec<u8>,

    /// The revision when this key was created
    pub create_revision: i64,

    /// The revision when this key was last modified
    pub mod_revision: i64,

    /// Version is the number of times this key has been modified
    pub version: i64,

    /// The actual value
    pub value: Vec<u8>,

    /// Associated lease ID (0 if no lease)
    pub lease: i64,
}

impl KeyValue {
    /// Serializes the KeyValue to bytes for storage.
    pub(crate) fn encode(&self) -> StorageResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserializes a KeyValue from bytes.
    pub(crate) fn decode(data: &[u8]) -> StorageResult<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    Put,
    Delete,
}

/// Represents a watch event (key-value change).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    pub event_type: EventType,

    /// The key-value pair involved. For deletions only `key` and `mod_revision` are set.
    pub kv: KeyValue,

    /// The previous key-value, if any
    pub prev_kv: Option<KeyValue>,
}

/// Options of a range read.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RangeOptions {
    /// Maximum number of keys returned, 0 for no limit
    pub limit: usize,
    /// Revision to read at, 0 for the current revision
    pub revision: i64,
    /// Only count the keys
    pub count_only: bool,
    /// Omit values
    pub keys_only: bool,
}

/// Result of a range query.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RangeResult {
    /// The key-value pairs
    pub kvs: Vec<KeyValue>,

    /// More indicates if there are more keys
    pub more: bool,

    /// Number of keys in the range (before limit)
    pub count: usize,

    /// Store revision at the time of the read
    pub revision: i64,
}

/// Revision and events produced by a finished write txn.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WriteOutcome {
    /// New revision, or the unchanged current revision if nothing was written
    pub revision: i64,
    pub events: Vec<Event>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PutResult {
    pub revision: i64,
    pub prev_kv: Option<KeyValue>,
    pub events: Vec<Event>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeleteResult {
    pub revision: i64,
    pub deleted: i64,
    pub prev_kvs: Vec<KeyValue>,
    pub events: Vec<Event>,
}

/// MVCC store configuration.
#[derive(Clone, Debug)]
pub struct MvccConfig {
    /// Revisions removed per backend batch during physical compaction.
    pub compaction_batch_limit: usize,
}

impl Default for MvccConfig {
    fn default() -> Self {
        Self {
            compaction_batch_limit: 1000,
        }
    }
}

/// The MVCC Store - the core storage engine.
pub struct MvccStore {
    /// The underlying persistent storage backend
    backend: Arc<Backend>,

    /// Current global revision (monotonically increasing)
    current_revision: AtomicI64,

    /// Revisions older than this have been compacted away
    compact_revision: AtomicI64,

    /// In-memory index of keys to revisions
    key_index: RwLock<KeyIndex>,

    /// Lease validation and key attachment
    lessor: Option<Arc<dyn Lessor>>,

    /// Physical compaction worker
    compactor: CompactionWorker,

    /// Serializes compaction requests; remembers the latest job
    last_compaction: Mutex<Option<CompactionHandle>>,
}

impl MvccStore {
    /// Opens the store, rebuilding the key index from the backend.
    pub fn new(
        backend: Arc<Backend>,
        config: MvccConfig,
        lessor: Option<Arc<dyn Lessor>>,
    ) -> StorageResult<Arc<Self>> {
        info!("Initializing MVCC store");

        let (index, last_main, scheduled, finished) = Self::restore(&backend)?;

        let current_revision = last_main.max(scheduled).max(1);
        let compactor = CompactionWorker::start(backend.clone(), config.compaction_batch_limit);

        let store = Arc::new(Self {
            backend,
            current_revision: AtomicI64::new(current_revision),
            compact_revision: AtomicI64::new(scheduled),
            key_index: RwLock::new(index),
            lessor,
            compactor,
            last_compaction: Mutex::new(None),
        });

        if scheduled > finished {
            info!(
                revision = scheduled,
                "Resuming unfinished compaction"
            );
            let handle = store.schedule_compaction(scheduled);
            *store.last_compaction.lock() = Some(handle);
        }

        info!(
            "MVCC store initialized with revision={}, compact_revision={}",
            current_revision, scheduled
        );

        Ok(store)
    }

    /// Scans the backend and rebuilds the index.
    ///
    /// Returns the index, the last main revision seen and the scheduled and
    /// finished compaction watermarks.
    fn restore(backend: &Backend) -> StorageResult<(KeyIndex, i64, i64, i64)> {
        let rtx = backend.read_tx();
        let scheduled = read_meta_i64(&rtx, SCHEDULED_COMPACT_KEY)?;
        let finished = read_meta_i64(&rtx, FINISHED_COMPACT_KEY)?;

        let mut index = KeyIndex::new();
        let mut last_main = 0;
        let mut restored = 0usize;
        let mut start = Revision::default().to_bytes();

        loop {
            let chunk = rtx.range(Bucket::Key, &start, None, RESTORE_CHUNK)?;
            let Some((last_key, _)) = chunk.last() else {
                break;
            };
            start = next_key(last_key);
            let done = chunk.len() < RESTORE_CHUNK;

            for (rev_bytes, data) in chunk {
                let Some(rev) = Revision::from_bytes(&rev_bytes) else {
                    continue;
                };
                let kv = KeyValue::decode(&data)?;
                if is_tombstone(&rev_bytes) {
                    // The put it closes may have been compacted away already.
                    if let Err(e) = index.tombstone(&kv.key, rev) {
                        debug!("Restore: skipping tombstone at {}: {}", rev, e);
                    }
                } else {
                    index.restore(
                        &kv.key,
                        Revision::first_of(kv.create_revision),
                        rev,
                        kv.version,
                    );
                }
                last_main = rev.main;
                restored += 1;
            }

            if done {
                break;
            }
        }

        debug!(
            "Restored {} revisions for {} keys (last main revision {})",
            restored,
            index.len(),
            last_main
        );
        Ok((index, last_main, scheduled, finished))
    }

    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }

    /// Gets the current global revision.
    pub fn current_revision(&self) -> i64 {
        self.current_revision.load(Ordering::SeqCst)
    }

    /// Gets the compact revision (oldest readable revision).
    pub fn compact_revision(&self) -> i64 {
        self.compact_revision.load(Ordering::SeqCst)
    }

    /// Opens a write txn, blocking while another write is in progress.
    pub fn write(&self) -> WriteTxn<'_> {
        let tx = self.backend.batch_tx();
        let begin_rev = self.current_revision();
        WriteTxn {
            store: self,
            tx: Some(tx),
            begin_rev,
            changes: 0,
            events: Vec::new(),
        }
    }

    /// Stores a single key-value pair at a new revision.
    pub fn put(&self, key: &[u8], value: &[u8], lease: i64) -> StorageResult<PutResult> {
        let mut txn = self.write();
        let prev_kv = txn.put(key, value, lease)?;
        let outcome = txn.end();
        Ok(PutResult {
            revision: outcome.revision,
            prev_kv,
            events: outcome.events,
        })
    }

    /// Deletes a range of keys. No revision is consumed when nothing matches.
    pub fn delete_range(&self, key: &[u8], range_end: &[u8]) -> StorageResult<DeleteResult> {
        let mut txn = self.write();
        let prev_kvs = txn.delete_range(key, range_end)?;
        let outcome = txn.end();
        Ok(DeleteResult {
            revision: outcome.revision,
            deleted: prev_kvs.len() as i64,
            prev_kvs,
            events: outcome.events,
        })
    }

    /// Performs a range query against a consistent snapshot.
    pub fn range(
        &self,
        key: &[u8],
        range_end: &[u8],
        options: &RangeOptions,
    ) -> StorageResult<RangeResult> {
        let current = self.current_revision();
        let at = if options.revision <= 0 {
            current
        } else {
            options.revision
        };
        if at > current {
            return Err(StorageError::FutureRevision {
                requested: at,
                current,
            });
        }

        let rtx = self.backend.read_tx();
        self.check_compacted(at)?;
        let result = self.range_at(&rtx, key, range_end, at, options);
        // A compaction that raced with the index lookup makes the result meaningless.
        self.check_compacted(at)?;
        result.map(|mut result| {
            result.revision = current;
            result
        })
    }

    fn check_compacted(&self, at: i64) -> StorageResult<()> {
        let compacted = self.compact_revision();
        if at < compacted {
            return Err(StorageError::Compacted {
                requested: at,
                compacted,
            });
        }
        Ok(())
    }

    /// Range read at `at` through the given reader.
    fn range_at<R: BucketReader>(
        &self,
        reader: &R,
        key: &[u8],
        range_end: &[u8],
        at: i64,
        options: &RangeOptions,
    ) -> StorageResult<RangeResult> {
        let limit = if options.count_only { 0 } else { options.limit };
        let (revs, count) = self.key_index.read().revisions(key, range_end, at, limit);

        if options.count_only {
            return Ok(RangeResult {
                kvs: Vec::new(),
                more: false,
                count,
                revision: at,
            });
        }

        let mut kvs = Vec::with_capacity(revs.len());
        for rev in revs {
            let (mut kv, _) = fetch_revision(reader, rev)?;
            if options.keys_only {
                kv.value.clear();
            }
            kvs.push(kv);
        }

        let more = options.limit > 0 && count > kvs.len();
        Ok(RangeResult {
            kvs,
            more,
            count,
            revision: at,
        })
    }

    /// Events for keys in range with `after < revision.main <= until`, in revision order.
    ///
    /// Used by watcher catch-up. With `prev_kv` each event carries the value the key
    /// had right before it, when that is still retained.
    pub fn events_since(
        &self,
        key: &[u8],
        range_end: &[u8],
        after: i64,
        until: i64,
        prev_kv: bool,
    ) -> StorageResult<Vec<Event>> {
        let rtx = self.backend.read_tx();
        self.check_compacted(after + 1)?;

        let revs: Vec<Revision> = self
            .key_index
            .read()
            .range_since(key, range_end, after)
            .into_iter()
            .take_while(|rev| rev.main <= until)
            .collect();
        self.check_compacted(after + 1)?;

        let mut events = Vec::with_capacity(revs.len());
        for rev in revs {
            let (kv, tombstone) = fetch_revision(&rtx, rev)?;
            let prev = if prev_kv {
                self.previous_kv(&rtx, &kv.key, rev.main)?
            } else {
                None
            };
            events.push(Event {
                event_type: if tombstone {
                    EventType::Delete
                } else {
                    EventType::Put
                },
                kv,
                prev_kv: prev,
            });
        }
        Ok(events)
    }

    fn previous_kv<R: BucketReader>(
        &self,
        reader: &R,
        key: &[u8],
        main: i64,
    ) -> StorageResult<Option<KeyValue>> {
        let at = main - 1;
        if at < self.compact_revision() {
            return Ok(None);
        }
        let found = self.key_index.read().get(key, at);
        match found {
            Some(kr) => Ok(Some(fetch_revision(reader, kr.modified)?.0)),
            None => Ok(None),
        }
    }

    /// Compacts the store: history at or below `revision` becomes unreadable.
    ///
    /// The index is compacted before this returns; payloads are removed in the
    /// background and the returned handle reports when that is done. Compacting
    /// again to the current compaction revision returns the same handle.
    pub fn compact(&self, revision: i64) -> StorageResult<CompactionHandle> {
        let mut last = self.last_compaction.lock();

        let compacted = self.compact_revision();
        if revision == compacted && revision > 0 {
            return Ok(last
                .clone()
                .filter(|handle| handle.revision() == revision)
                .unwrap_or_else(|| CompactionHandle::finished(revision)));
        }
        if revision < compacted {
            return Err(StorageError::Compacted {
                requested: revision,
                compacted,
            });
        }
        let current = self.current_revision();
        if revision > current {
            return Err(StorageError::FutureRevision {
                requested: revision,
                current,
            });
        }

        {
            let mut tx = self.backend.batch_tx();
            tx.put(Bucket::Meta, SCHEDULED_COMPACT_KEY, &revision.to_be_bytes());
        }
        self.compact_revision.store(revision, Ordering::SeqCst);

        let handle = self.schedule_compaction(revision);
        *last = Some(handle.clone());

        info!(revision, "Compacted MVCC index, physical compaction scheduled");
        Ok(handle)
    }

    fn schedule_compaction(&self, revision: i64) -> CompactionHandle {
        let keep = self.key_index.write().compact(revision).keep;
        self.compactor.schedule(revision, keep)
    }

    /// Number of keys in the index, live or with retained history.
    pub fn key_count(&self) -> usize {
        self.key_index.read().len()
    }
}

fn read_meta_i64<R: BucketReader>(reader: &R, key: &[u8]) -> StorageResult<i64> {
    let Some(bytes) = reader.get(Bucket::Meta, key)? else {
        return Ok(0);
    };
    let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
        StorageError::InvalidArgument(format!(
            "malformed meta value for {}",
            String::from_utf8_lossy(key)
        ))
    })?;
    Ok(i64::from_be_bytes(raw))
}

/// Smallest key strictly greater than `key`.
pub(crate) fn next_key(key: &[u8]) -> Vec<u8> {
    let mut next = key.to_vec();
    next.push(0);
    next
}

/// Reads the payload stored at `rev`, tombstone or not.
///
/// # Panics
///
/// Panics if the index refers to a revision the backend does not have.
fn fetch_revision<R: BucketReader>(reader: &R, rev: Revision) -> StorageResult<(KeyValue, bool)> {
    let start = rev.to_bytes();
    let end = rev.successor().to_bytes();
    let mut found = reader.range(Bucket::Key, &start, Some(end.as_slice()), 1)?;
    let Some((rev_bytes, data)) = found.pop() else {
        error!(revision = %rev, "MVCC: revision missing from backend");
        panic!("mvcc: revision {} is indexed but missing from the backend", rev);
    };
    Ok((KeyValue::decode(&data)?, is_tombstone(&rev_bytes)))
}

/// An open write transaction.
///
/// Holds the backend's write batch until it ends. Ending (explicitly or by drop)
/// publishes the staged payloads and then the new revision, in that order.
pub struct WriteTxn<'a> {
    store: &'a MvccStore,
    tx: Option<BatchTx<'a>>,
    begin_rev: i64,
    changes: i64,
    events: Vec<Event>,
}

impl<'a> WriteTxn<'a> {
    /// Revision reads inside this txn see, including its own changes.
    fn read_rev(&self) -> i64 {
        if self.changes == 0 {
            self.begin_rev
        } else {
            self.begin_rev + 1
        }
    }

    fn next_revision(&self) -> Revision {
        Revision::new(self.begin_rev + 1, self.changes)
    }

    fn batch(&mut self) -> &mut BatchTx<'a> {
        self.tx
            .as_mut()
            .unwrap_or_else(|| unreachable!("write txn used after end"))
    }

    fn reader(&self) -> &BatchTx<'a> {
        self.tx
            .as_ref()
            .unwrap_or_else(|| unreachable!("write txn used after end"))
    }

    /// Revision the txn started from.
    pub fn begin_revision(&self) -> i64 {
        self.begin_rev
    }

    /// Range read that observes this txn's own writes.
    pub fn range(
        &self,
        key: &[u8],
        range_end: &[u8],
        options: &RangeOptions,
    ) -> StorageResult<RangeResult> {
        let current = self.read_rev();
        let at = if options.revision <= 0 {
            current
        } else {
            options.revision
        };
        self.check_read_revision(at)?;
        let mut result = self
            .store
            .range_at(self.reader(), key, range_end, at, options)?;
        result.revision = current;
        Ok(result)
    }

    /// Rejects a read revision this txn cannot serve. 0 reads the latest.
    pub(crate) fn check_read_revision(&self, revision: i64) -> StorageResult<()> {
        if revision <= 0 {
            return Ok(());
        }
        let current = self.read_rev();
        if revision > current {
            return Err(StorageError::FutureRevision {
                requested: revision,
                current,
            });
        }
        self.store.check_compacted(revision)
    }

    /// Checks that a lease exists before anything is staged.
    pub fn check_lease(&self, lease: i64) -> StorageResult<()> {
        if lease == 0 {
            return Ok(());
        }
        match &self.store.lessor {
            Some(lessor) if lessor.lookup(lease).is_some() => Ok(()),
            _ => Err(StorageError::LeaseNotFound(lease)),
        }
    }

    /// Writes `key` at the next revision, returning the previous value.
    pub fn put(&mut self, key: &[u8], value: &[u8], lease: i64) -> StorageResult<Option<KeyValue>> {
        self.check_lease(lease)?;

        let rev = self.next_revision();
        let existing = self.store.key_index.read().get(key, rev.main);
        let prev_kv = match existing {
            Some(kr) => Some(fetch_revision(self.reader(), kr.modified)?.0),
            None => None,
        };

        let kv = KeyValue {
            key: key.to_vec(),
            create_revision: existing.map_or(rev.main, |kr| kr.created.main),
            mod_revision: rev.main,
            version: existing.map_or(1, |kr| kr.version + 1),
            value: value.to_vec(),
            lease,
        };
        let encoded = kv.encode()?;

        self.batch().put(Bucket::Key, &rev.to_bytes(), &encoded);
        self.store.key_index.write().put(key, rev);
        self.changes += 1;

        if let Some(lessor) = &self.store.lessor {
            let old_lease = prev_kv.as_ref().map_or(0, |prev| prev.lease);
            if old_lease != 0 && old_lease != lease {
                if let Err(e) = lessor.detach(old_lease, key) {
                    debug!("Detach from lease {} failed: {}", old_lease, e);
                }
            }
            if lease != 0 {
                if let Err(e) = lessor.attach(lease, key) {
                    error!("Attach to lease {} failed after lookup: {}", lease, e);
                }
            }
        }

        debug!(
            "Put key {:?} at revision {}",
            String::from_utf8_lossy(key),
            rev
        );
        self.events.push(Event {
            event_type: EventType::Put,
            kv,
            prev_kv: prev_kv.clone(),
        });
        Ok(prev_kv)
    }

    /// Deletes every key live in range, one sub revision each.
    pub fn delete_range(&mut self, key: &[u8], range_end: &[u8]) -> StorageResult<Vec<KeyValue>> {
        let keys = self
            .store
            .key_index
            .read()
            .range(key, range_end, self.read_rev());

        let mut deleted = Vec::with_capacity(keys.len());
        for (key, kr) in keys {
            let (prev, _) = fetch_revision(self.reader(), kr.modified)?;
            let rev = self.next_revision();
            let tombstone = KeyValue {
                key: key.clone(),
                mod_revision: rev.main,
                ..Default::default()
            };

            let encoded = tombstone.encode()?;
            self.batch()
                .put(Bucket::Key, &rev.to_tombstone_bytes(), &encoded);
            self.store.key_index.write().tombstone(&key, rev)?;
            self.changes += 1;

            if prev.lease != 0 {
                if let Some(lessor) = &self.store.lessor {
                    if let Err(e) = lessor.detach(prev.lease, &key) {
                        debug!("Detach from lease {} failed: {}", prev.lease, e);
                    }
                }
            }

            self.events.push(Event {
                event_type: EventType::Delete,
                kv: tombstone,
                prev_kv: Some(prev.clone()),
            });
            deleted.push(prev);
        }

        if !deleted.is_empty() {
            debug!(
                "Deleted {} keys at revision {}",
                deleted.len(),
                self.begin_rev + 1
            );
        }
        Ok(deleted)
    }

    /// Ends the txn, publishing its writes and the new revision.
    pub fn end(mut self) -> WriteOutcome {
        let revision = self.finish();
        WriteOutcome {
            revision,
            events: std::mem::take(&mut self.events),
        }
    }

    fn finish(&mut self) -> i64 {
        let Some(tx) = self.tx.take() else {
            return self.read_rev();
        };
        // Payloads must be visible before readers can ask for the new revision.
        drop(tx);
        if self.changes > 0 {
            self.store
                .current_revision
                .store(self.begin_rev + 1, Ordering::SeqCst);
        }
        self.read_rev()
    }
}

impl Drop for WriteTxn<'_> {
    fn drop(&mut self) {
        self.finish();
    }
}
