//! Lease bookkeeping for the storage core.
//!
//! The MVCC store only needs a narrow view of leases: whether an id is valid when a key
//! is written with it, and which keys are attached so that revoking the lease can delete
//! them. That view is the [`Lessor`] trait. [`LeaseManager`] is an in-memory
//! implementation:
//! - DashMap of leases so lookups on the write path never contend with grants
//! - Priority queue (BinaryHeap) for TTL tracking instead of periodic scanning
//! - Expiry only produces notifications; the apply loop turns them into revocations

use dashmap::DashMap;
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Lease-related errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LeaseError {
    #[error("Lease not found: {0}")]
    LeaseNotFound(i64),

    #[error("Lease already exists: {0}")]
    LeaseAlreadyExists(i64),

    #[error("Invalid TTL: {0}")]
    InvalidTTL(String),
}

pub type LeaseResult<T> = Result<T, LeaseError>;

/// A granted lease.
#[derive(Clone, Debug)]
pub struct Lease {
    pub id: i64,
    /// Granted TTL in seconds
    pub ttl: i64,
    pub expires_at: Instant,
    pub keys: HashSet<Vec<u8>>,
}

impl Lease {
    /// Get the remaining TTL in seconds.
    pub fn remaining_ttl(&self) -> i64 {
        self.expires_at
            .saturating_duration_since(Instant::now())
            .as_secs() as i64
    }
}

/// Event sent when a lease expires and should be revoked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseExpireEvent {
    pub lease_id: i64,
}

/// The lease operations the storage core depends on.
pub trait Lessor: Send + Sync {
    /// Grants a lease. `id == 0` asks for an auto-assigned id.
    fn grant(&self, id: i64, ttl: i64) -> LeaseResult<Lease>;

    /// Removes the lease, returning the keys that were attached to it.
    fn revoke(&self, id: i64) -> LeaseResult<Vec<Vec<u8>>>;

    fn lookup(&self, id: i64) -> Option<Lease>;

    fn attach(&self, id: i64, key: &[u8]) -> LeaseResult<()>;

    fn detach(&self, id: i64, key: &[u8]) -> LeaseResult<()>;
}

/// Manages lease lifecycle and TTL tracking.
pub struct LeaseManager {
    /// All active leases: id -> Lease
    leases: DashMap<i64, Lease>,

    /// Counter for generating unique lease IDs
    next_lease_id: AtomicI64,

    /// Upcoming expirations (min-heap, ordered by expiry time)
    expiry_queue: Mutex<BinaryHeap<Reverse<(Instant, i64)>>>,

    /// Channel for notifying the apply loop of expired leases
    expire_tx: mpsc::Sender<LeaseExpireEvent>,
}

impl LeaseManager {
    pub fn new(expire_tx: mpsc::Sender<LeaseExpireEvent>) -> Self {
        LeaseManager {
            leases: DashMap::new(),
            next_lease_id: AtomicI64::new(1),
            expiry_queue: Mutex::new(BinaryHeap::new()),
            expire_tx,
        }
    }

    /// Returns the number of active leases.
    pub fn count(&self) -> usize {
        self.leases.len()
    }

    /// Pops every lease whose deadline has passed and is still granted.
    fn take_expired(&self, now: Instant) -> Vec<i64> {
        let mut queue = self.expiry_queue.lock();
        let mut expired = Vec::new();
        while let Some(Reverse((deadline, id))) = queue.peek().copied() {
            if deadline > now {
                break;
            }
            queue.pop();
            // Stale queue entries (revoked or re-granted leases) are skipped.
            if matches!(self.leases.get(&id), Some(lease) if lease.expires_at == deadline) {
                expired.push(id);
            }
        }
        expired
    }

    /// Background loop that sends expiry notifications until the receiver is gone.
    pub async fn run_expiry_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_millis(100));
        loop {
            ticker.tick().await;
            for lease_id in self.take_expired(Instant::now()) {
                debug!(lease_id, "Lease expired");
                if let Err(e) = self.expire_tx.send(LeaseExpireEvent { lease_id }).await {
                    warn!(error = ?e, "Failed to send lease expiry event");
                    return;
                }
            }
        }
    }
}

impl Lessor for LeaseManager {
    fn grant(&self, id: i64, ttl: i64) -> LeaseResult<Lease> {
        if ttl <= 0 {
            return Err(LeaseError::InvalidTTL(format!(
                "TTL must be positive, got {}",
                ttl
            )));
        }

        let lease_id = if id == 0 {
            loop {
                let candidate = self.next_lease_id.fetch_add(1, Ordering::SeqCst);
                if !self.leases.contains_key(&candidate) {
                    break candidate;
                }
            }
        } else {
            id
        };

        let lease = Lease {
            id: lease_id,
            ttl,
            expires_at: Instant::now() + Duration::from_secs(ttl as u64),
            keys: HashSet::new(),
        };

        match self.leases.entry(lease_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(LeaseError::LeaseAlreadyExists(lease_id))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(lease.clone());
            }
        }
        self.expiry_queue
            .lock()
            .push(Reverse((lease.expires_at, lease_id)));

        debug!(lease_id, ttl, "Lease granted");
        Ok(lease)
    }

    fn revoke(&self, id: i64) -> LeaseResult<Vec<Vec<u8>>> {
        let (_, lease) = self
            .leases
            .remove(&id)
            .ok_or(LeaseError::LeaseNotFound(id))?;
        debug!(lease_id = id, key_count = lease.keys.len(), "Lease revoked");
        Ok(lease.keys.into_iter().collect())
    }

    fn lookup(&self, id: i64) -> Option<Lease> {
        self.leases.get(&id).map(|lease| lease.clone())
    }

    fn attach(&self, id: i64, key: &[u8]) -> LeaseResult<()> {
        let mut lease = self
            .leases
            .get_mut(&id)
            .ok_or(LeaseError::LeaseNotFound(id))?;
        lease.keys.insert(key.to_vec());
        debug!(lease_id = id, "Key attached to lease");
        Ok(())
    }

    fn detach(&self, id: i64, key: &[u8]) -> LeaseResult<()> {
        let mut lease = self
            .leases
            .get_mut(&id)
            .ok_or(LeaseError::LeaseNotFound(id))?;
        lease.keys.remove(key);
        debug!(lease_id = id, "Key detached from lease");
        Ok(())
    }
}
