//! Watchers indexed by the keys they watch.

use std::collections::{HashMap, HashSet};

use super::WatchRange;

/// Identifies a watcher: owning stream and the id the stream assigned.
pub(crate) type WatcherKey = (u64, i64);

/// A set of watchers that can be looked up by an event key.
///
/// Single-key watchers are hashed by key; range watchers are scanned.
#[derive(Debug, Default)]
pub(crate) struct WatcherGroup {
    keys: HashMap<Vec<u8>, HashSet<WatcherKey>>,
    ranges: HashMap<WatcherKey, WatchRange>,
    len: usize,
}

impl WatcherGroup {
    pub(crate) fn add(&mut self, watcher: WatcherKey, range: &WatchRange) {
        let inserted = if range.is_single_key() {
            self.keys
                .entry(range.key.clone())
                .or_default()
                .insert(watcher)
        } else {
            self.ranges.insert(watcher, range.clone()).is_none()
        };
        if inserted {
            self.len += 1;
        }
    }

    pub(crate) fn remove(&mut self, watcher: WatcherKey, range: &WatchRange) -> bool {
        let removed = if range.is_single_key() {
            match self.keys.get_mut(&range.key) {
                Some(set) => {
                    let removed = set.remove(&watcher);
                    if set.is_empty() {
                        self.keys.remove(&range.key);
                    }
                    removed
                }
                None => false,
            }
        } else {
            self.ranges.remove(&watcher).is_some()
        };
        if removed {
            self.len -= 1;
        }
        removed
    }

    /// Watchers whose range contains `key`.
    pub(crate) fn matching(&self, key: &[u8]) -> Vec<WatcherKey> {
        let mut found: Vec<WatcherKey> = self
            .keys
            .get(key)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        found.extend(
            self.ranges
                .iter()
                .filter(|(_, range)| range.contains(key))
                .map(|(watcher, _)| *watcher),
        );
        found
    }

    pub(crate) fn contains(&self, watcher: WatcherKey, range: &WatchRange) -> bool {
        if range.is_single_key() {
            self.keys
                .get(&range.key)
                .map_or(false, |set| set.contains(&watcher))
        } else {
            self.ranges.contains_key(&watcher)
        }
    }

    /// Every watcher in the group, in no particular order.
    pub(crate) fn watchers(&self) -> impl Iterator<Item = WatcherKey> + '_ {
        self.keys
            .values()
            .flat_map(|set| set.iter().copied())
            .chain(self.ranges.keys().copied())
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }
}
