//! Write buffers layered over the persistent trees.
//!
//! A [`TxBuffer`] holds writes that have not been flushed to sled yet, per bucket
//! and ordered by key. A `None` value records a deletion so that a staged delete
//! can hide a committed entry. The backend keeps the pending buffer of the open
//! batch, and an [`Overlay`] of finished batches awaiting the next commit.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use crate::storage::backend::Bucket;

/// Staged writes for a single bucket.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BucketBuffer {
    entries: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl BucketBuffer {
    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.entries.insert(key.to_vec(), Some(value.to_vec()));
    }

    pub fn delete(&mut self, key: &[u8]) {
        self.entries.insert(key.to_vec(), None);
    }

    /// Looks up a staged entry. `Some(None)` means the key is staged for deletion.
    pub fn get(&self, key: &[u8]) -> Option<Option<&[u8]>> {
        self.entries.get(key).map(|v| v.as_deref())
    }

    /// Staged entries in `[start, end)`; `end == None` means unbounded.
    pub fn range<'a>(
        &'a self,
        start: &'a [u8],
        end: Option<&'a [u8]>,
    ) -> impl Iterator<Item = (&'a Vec<u8>, &'a Option<Vec<u8>>)> + 'a {
        let upper = match end {
            Some(end) if end <= start => None,
            Some(end) => Some(Bound::Excluded(end)),
            None => Some(Bound::Unbounded),
        };
        upper
            .map(|upper| self.entries.range::<[u8], _>((Bound::Included(start), upper)))
            .into_iter()
            .flatten()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Vec<u8>, &Option<Vec<u8>>)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Approximate bytes held by the staged entries.
    pub fn byte_size(&self) -> u64 {
        self.entries
            .iter()
            .map(|(k, v)| (k.len() + v.as_ref().map_or(0, Vec::len)) as u64)
            .sum()
    }

}

/// Staged writes for all buckets.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TxBuffer {
    buckets: BTreeMap<Bucket, BucketBuffer>,
}

impl TxBuffer {
    pub fn put(&mut self, bucket: Bucket, key: &[u8], value: &[u8]) {
        self.buckets.entry(bucket).or_default().put(key, value);
    }

    pub fn delete(&mut self, bucket: Bucket, key: &[u8]) {
        self.buckets.entry(bucket).or_default().delete(key);
    }

    pub fn bucket(&self, bucket: Bucket) -> Option<&BucketBuffer> {
        self.buckets.get(&bucket)
    }

    /// Number of staged entries across all buckets.
    pub fn len(&self) -> usize {
        self.buckets.values().map(BucketBuffer::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.values().all(BucketBuffer::is_empty)
    }

    pub fn byte_size(&self) -> u64 {
        self.buckets.values().map(BucketBuffer::byte_size).sum()
    }
}

/// Finished batches, oldest first. A published batch is frozen, so adding one
/// shares the existing layers instead of copying them.
#[derive(Clone, Debug, Default)]
pub struct Overlay {
    layers: Vec<Arc<TxBuffer>>,
}

impl Overlay {
    pub fn push(&mut self, batch: TxBuffer) {
        self.layers.push(Arc::new(batch));
    }

    pub fn layers(&self) -> &[Arc<TxBuffer>] {
        &self.layers
    }

    /// One bucket of every layer, oldest first, as taken by [`stack_layers`].
    pub fn bucket_layers(&self, bucket: Bucket) -> Vec<Option<&BucketBuffer>> {
        self.layers.iter().map(|layer| layer.bucket(bucket)).collect()
    }

    /// Staged entries across layers. A key written by several batches counts once per batch.
    pub fn len(&self) -> usize {
        self.layers.iter().map(|layer| layer.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.iter().all(|layer| layer.is_empty())
    }

    pub fn byte_size(&self) -> u64 {
        self.layers.iter().map(|layer| layer.byte_size()).sum()
    }
}

/// Collects the staged entries of several layers (oldest first) in `[start, end)`.
pub fn stack_layers(
    layers: &[Option<&BucketBuffer>],
    start: &[u8],
    end: Option<&[u8]>,
) -> BTreeMap<Vec<u8>, Option<Vec<u8>>> {
    let mut staged = BTreeMap::new();
    for layer in layers.iter().flatten() {
        for (k, v) in layer.range(start, end) {
            staged.insert(k.clone(), v.clone());
        }
    }
    staged
}

/// Merges a sorted stream of committed entries with staged entries.
///
/// Staged values shadow committed ones with the same key and staged deletions
/// hide them. Stops after `limit` results when `limit > 0`.
pub fn merge_staged<E>(
    committed: impl Iterator<Item = Result<(Vec<u8>, Vec<u8>), E>>,
    staged: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    limit: usize,
) -> Result<Vec<(Vec<u8>, Vec<u8>)>, E> {
    let mut committed = committed;
    let mut staged = staged.into_iter().peekable();
    let mut head = committed.next().transpose()?;
    let mut out = Vec::new();

    loop {
        if limit > 0 && out.len() >= limit {
            break;
        }
        let staged_first = match (&head, staged.peek()) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some((ck, _)), Some((sk, _))) => sk <= ck,
        };

        if staged_first {
            let Some((key, value)) = staged.next() else {
                break;
            };
            if matches!(&head, Some((ck, _)) if *ck == key) {
                head = committed.next().transpose()?;
            }
            if let Some(value) = value {
                out.push((key, value));
            }
        } else {
            let Some(kv) = head.take() else {
                break;
            };
            out.push(kv);
            head = committed.next().transpose()?;
        }
    }

    Ok(out)
}
