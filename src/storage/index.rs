//! In-memory key index for MVCC (equivalent to etcd's treeIndex).
//!
//! The KeyIndex maintains a BTreeMap of all keys to their revision history.
//! This allows efficient point-in-time reads and range queries at specific revisions.
//!
//! Key design:
//! - Uses generations to track the lifecycle of keys (created, updated, deleted)
//! - Each generation contains a list of revisions where modifications occurred
//! - A key's generations live in a `Vec`, oldest first; only the last one may be open
//! - Compaction removes old revisions to bound memory usage
//!
//! Range arguments follow the etcd conventions used across the crate: an empty
//! `range_end` selects exactly `key`, a `range_end` of `"\0"` selects every key
//! `>= key`, anything else is the exclusive upper bound.

use std::collections::{BTreeMap, HashSet};
use std::ops::Bound;
use thiserror::Error;
use tracing::{debug, error};

use crate::storage::revision::Revision;

/// Index errors. Only the ordinary, recoverable ones; ordering violations panic.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IndexError {
    #[error("revision not found for key {0:?}")]
    RevisionNotFound(Vec<u8>),
}

pub type IndexResult<T> = Result<T, IndexError>;

/// Computes BTreeMap bounds for `[key, range_end)`, or `None` if the range is empty.
pub fn range_bounds<'a>(
    key: &'a [u8],
    range_end: &'a [u8],
) -> Option<(Bound<&'a [u8]>, Bound<&'a [u8]>)> {
    if range_end.is_empty() {
        return Some((Bound::Included(key), Bound::Included(key)));
    }
    if range_end == [0] {
        return Some((Bound::Included(key), Bound::Unbounded));
    }
    if range_end <= key {
        return None;
    }
    Some((Bound::Included(key), Bound::Excluded(range_end)))
}

/// Whether `target` falls inside `[key, range_end)` under the etcd conventions.
pub fn key_in_range(target: &[u8], key: &[u8], range_end: &[u8]) -> bool {
    if range_end.is_empty() {
        return target == key;
    }
    if target < key {
        return false;
    }
    range_end == [0] || target < range_end
}

/// Bookkeeping fields of a key as of some revision.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyRevision {
    /// Revision of the newest modification visible at the queried point
    pub modified: Revision,
    /// Revision that created the generation
    pub created: Revision,
    /// Number of puts within the generation up to and including `modified`
    pub version: i64,
}

/// A single generation of a key's lifecycle.
///
/// A generation starts when a key is created and ends when it's deleted.
/// Each generation contains a list of revisions where the key was modified.
#[derive(Clone, Debug)]
struct Generation {
    /// The revision when this generation was created
    created: Revision,

    /// Revisions where this key was written (including creation), oldest first.
    /// Compaction may trim the front.
    revisions: Vec<Revision>,

    /// The revision when this generation was deleted (None if still alive)
    deleted: Option<Revision>,

    /// Total number of puts in this generation, unaffected by compaction
    version: i64,
}

impl Generation {
    fn open(created: Revision, version: i64) -> Self {
        Self {
            created,
            revisions: vec![created],
            deleted: None,
            version,
        }
    }

    fn covers(&self, at: i64) -> bool {
        self.created.main <= at && self.deleted.map_or(true, |del| at < del.main)
    }

    fn ended_by(&self, at: i64) -> bool {
        self.deleted.map_or(false, |del| del.main <= at)
    }

    /// Newest revision `<= at` with the version the key had at that point.
    fn find(&self, at: i64) -> Option<(Revision, i64)> {
        let idx = self.revisions.iter().rposition(|r| r.main <= at)?;
        let newer = (self.revisions.len() - 1 - idx) as i64;
        Some((self.revisions[idx], self.version - newer))
    }
}

/// Index entry for a single key.
#[derive(Clone, Debug)]
struct KeyIndexEntry {
    /// Highest revision ever recorded for the key (put or tombstone)
    modified: Revision,

    /// List of generations (lifecycle stages) for this key
    generations: Vec<Generation>,
}

impl KeyIndexEntry {
    fn new() -> Self {
        Self {
            modified: Revision::default(),
            generations: Vec::new(),
        }
    }

    fn live_generation(&mut self) -> Option<&mut Generation> {
        self.generations.last_mut().filter(|gen| gen.deleted.is_none())
    }

    /// Gets the generation that was alive at the given revision.
    fn get_generation_at(&self, revision: i64) -> Option<&Generation> {
        self.generations.iter().rev().find(|gen| gen.covers(revision))
    }

    fn get(&self, at: i64) -> Option<KeyRevision> {
        let gen = self.get_generation_at(at)?;
        let (modified, version) = gen.find(at)?;
        Some(KeyRevision {
            modified,
            created: gen.created,
            version,
        })
    }

    fn check_monotonic(&self, key: &[u8], revision: Revision) {
        if revision <= self.modified {
            error!(
                key = ?String::from_utf8_lossy(key),
                given = %revision,
                recorded = %self.modified,
                "Index: non-monotonic revision"
            );
            panic!(
                "index: revision {} for key {:?} is not newer than recorded revision {}",
                revision,
                String::from_utf8_lossy(key),
                self.modified
            );
        }
    }

    /// Revisions newer than `after`, keeping only the last sub per main.
    fn since(&self, after: i64, out: &mut Vec<Revision>) {
        let start = out.len();
        for gen in &self.generations {
            if gen.deleted.map_or(false, |del| del.main <= after) {
                continue;
            }
            let tail = gen.revisions.iter().chain(gen.deleted.iter());
            for rev in tail.filter(|r| r.main > after) {
                let fresh = out.len() > start;
                match out.last_mut() {
                    Some(last) if fresh && last.main == rev.main => *last = *rev,
                    _ => out.push(*rev),
                }
            }
        }
    }

    /// Drops history at or below `at`, keeping the newest revision of the
    /// surviving generation. Returns true when nothing is left.
    fn compact(&mut self, at: i64, keep: &mut HashSet<Revision>) -> bool {
        let first_kept = self
            .generations
            .iter()
            .position(|gen| !gen.ended_by(at))
            .unwrap_or(self.generations.len());
        self.generations.drain(..first_kept);

        if let Some(gen) = self.generations.first_mut() {
            if let Some(idx) = gen.revisions.iter().rposition(|r| r.main <= at) {
                keep.insert(gen.revisions[idx]);
                gen.revisions.drain(..idx);
            }
        }

        self.generations.is_empty()
    }
}

/// Outcome of compacting the index.
#[derive(Debug, Default)]
pub struct IndexCompaction {
    /// Revisions at or below the compaction point that still back a live view
    /// and therefore must survive in the backend
    pub keep: HashSet<Revision>,
    /// Keys whose entire history was discarded
    pub removed_keys: Vec<Vec<u8>>,
}

/// The in-memory key index for MVCC operations.
///
/// This structure tracks all keys and their revision history, enabling:
/// - Point-in-time reads at any historical revision
/// - Efficient range queries
/// - Compaction to remove old revisions
pub struct KeyIndex {
    /// Map from key to its index entry
    tree: BTreeMap<Vec<u8>, KeyIndexEntry>,
}

impl KeyIndex {
    /// Creates a new empty key index.
    pub fn new() -> Self {
        Self {
            tree: BTreeMap::new(),
        }
    }

    /// Gets the bookkeeping of a key at a specific point in time.
    ///
    /// Returns None if the key didn't exist at that revision.
    pub fn get(&self, key: &[u8], revision: i64) -> Option<KeyRevision> {
        self.tree.get(key)?.get(revision)
    }

    /// Records a new modification (write) of a key.
    ///
    /// If the key has no live generation, creates a new generation.
    /// Otherwise, adds to the current generation.
    ///
    /// # Panics
    ///
    /// Panics if `revision` is not newer than every revision already recorded
    /// for the key.
    pub fn put(&mut self, key: &[u8], revision: Revision) {
        let entry = self
            .tree
            .entry(key.to_vec())
            .or_insert_with(KeyIndexEntry::new);
        entry.check_monotonic(key, revision);

        match entry.live_generation() {
            Some(gen) => {
                gen.revisions.push(revision);
                gen.version += 1;
            }
            None => entry.generations.push(Generation::open(revision, 1)),
        }
        entry.modified = revision;

        debug!(
            "Index: put key {:?} at revision {}",
            String::from_utf8_lossy(key),
            revision
        );
    }

    /// Records a deletion of a key, closing its live generation.
    ///
    /// # Panics
    ///
    /// Panics on a non-monotonic revision, like [`KeyIndex::put`].
    pub fn tombstone(&mut self, key: &[u8], revision: Revision) -> IndexResult<()> {
        let entry = self
            .tree
            .get_mut(key)
            .ok_or_else(|| IndexError::RevisionNotFound(key.to_vec()))?;
        entry.check_monotonic(key, revision);

        let gen = entry
            .live_generation()
            .ok_or_else(|| IndexError::RevisionNotFound(key.to_vec()))?;
        gen.deleted = Some(revision);
        entry.modified = revision;

        debug!(
            "Index: tombstone key {:?} at revision {}",
            String::from_utf8_lossy(key),
            revision
        );
        Ok(())
    }

    /// Re-inserts a key while rebuilding the index from the backend.
    ///
    /// Unlike `put`, the creation revision and version come from the persisted
    /// record, because the oldest part of the generation may have been compacted.
    pub fn restore(&mut self, key: &[u8], created: Revision, modified: Revision, version: i64) {
        let entry = self
            .tree
            .entry(key.to_vec())
            .or_insert_with(KeyIndexEntry::new);
        entry.check_monotonic(key, modified);

        match entry.live_generation() {
            Some(gen) => {
                gen.revisions.push(modified);
                gen.version = version;
            }
            None => {
                let mut gen = Generation::open(created, version);
                gen.revisions = vec![modified];
                entry.generations.push(gen);
            }
        }
        entry.modified = modified;
    }

    /// Returns all keys (and their revisions) in a range at a specific point in time.
    ///
    /// Only keys alive at `revision` are returned, in key order.
    pub fn range(&self, start: &[u8], end: &[u8], revision: i64) -> Vec<(Vec<u8>, KeyRevision)> {
        let Some(bounds) = range_bounds(start, end) else {
            return Vec::new();
        };

        self.tree
            .range::<[u8], _>(bounds)
            .filter_map(|(key, entry)| entry.get(revision).map(|kr| (key.clone(), kr)))
            .collect()
    }

    /// Revisions visible at `revision` for keys in range, up to `limit`
    /// (0 = unlimited), plus the total number of visible keys.
    pub fn revisions(
        &self,
        start: &[u8],
        end: &[u8],
        revision: i64,
        limit: usize,
    ) -> (Vec<Revision>, usize) {
        let Some(bounds) = range_bounds(start, end) else {
            return (Vec::new(), 0);
        };

        let mut revs = Vec::new();
        let mut total = 0;
        for (_, entry) in self.tree.range::<[u8], _>(bounds) {
            if let Some(kr) = entry.get(revision) {
                if limit == 0 || revs.len() < limit {
                    revs.push(kr.modified);
                }
                total += 1;
            }
        }
        (revs, total)
    }

    /// All revisions newer than `after` that touched keys in range, including
    /// tombstones, in revision order.
    ///
    /// When a key changed several times within one main revision only the last
    /// change is reported.
    pub fn range_since(&self, start: &[u8], end: &[u8], after: i64) -> Vec<Revision> {
        let Some(bounds) = range_bounds(start, end) else {
            return Vec::new();
        };

        let mut revs = Vec::new();
        for (_, entry) in self.tree.range::<[u8], _>(bounds) {
            entry.since(after, &mut revs);
        }
        revs.sort();
        revs
    }

    /// Compacts the index by discarding history at or below `revision`.
    ///
    /// Generations that ended at or before the compaction point are dropped
    /// entirely; the surviving generation keeps only its newest revision at or
    /// below the point. After compaction, point-in-time reads below `revision`
    /// are meaningless and the MVCC layer rejects them.
    pub fn compact(&mut self, revision: i64) -> IndexCompaction {
        let mut result = IndexCompaction::default();

        for (key, entry) in self.tree.iter_mut() {
            if entry.compact(revision, &mut result.keep) {
                result.removed_keys.push(key.clone());
            }
        }
        for key in &result.removed_keys {
            self.tree.remove(key);
        }

        debug!(
            "Index: compacted at revision {} ({} keys removed, {} revisions kept)",
            revision,
            result.removed_keys.len(),
            result.keep.len()
        );

        result
    }

    /// Counts the number of revisions currently held for a key.
    pub fn count_revisions(&self, key: &[u8]) -> usize {
        self.tree
            .get(key)
            .map(|entry| {
                entry
                    .generations
                    .iter()
                    .map(|gen| gen.revisions.len() + usize::from(gen.deleted.is_some()))
                    .sum()
            })
            .unwrap_or(0)
    }

    /// Returns the total number of keys in the index.
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    /// Checks if the index is empty.
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}

impl Default for KeyIndex {
    fn default() -> Self {
        Self::new()
    }
}
