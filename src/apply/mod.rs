//! Apply arbitration: the ordered write path.
//!
//! Commands are applied one at a time by the apply loop through a chain of
//! [`Applier`]s composed at construction:
//!
//! ```text
//! CappedApplier -> QuotaApplier -> BackendApplier -> WatchableStore / Lessor
//! ```
//!
//! The loop also turns lease expiry notifications into revocations and executes
//! the compactions requested by the auto compactor, so every mutation of the store
//! is serialized here.

pub mod alarm;
pub mod applier;
pub mod quota;

pub use alarm::{AlarmAction, AlarmMember, AlarmRequest, AlarmStore, AlarmType};
pub use applier::BackendApplier;
pub use quota::{BackendQuota, CappedApplier, QuotaApplier, QuotaConfig};

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::lease::{Lease, LeaseError, LeaseExpireEvent};
use crate::storage::{
    CompactionHandle, DeleteResult, PutResult, StorageError, TxnRequest, TxnResponse,
};

#[derive(Error, Debug)]
pub enum ApplyError {
    #[error("mvcc: database space exceeded")]
    NoSpace,

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Lease(#[from] LeaseError),

    #[error("apply loop stopped")]
    Stopped,
}

pub type ApplyResult<T> = Result<T, ApplyError>;

/// The write operations driven by the apply loop.
pub trait Applier: Send + Sync {
    fn put(&self, key: &[u8], value: &[u8], lease: i64) -> ApplyResult<PutResult>;

    fn delete_range(&self, key: &[u8], range_end: &[u8]) -> ApplyResult<DeleteResult>;

    fn txn(&self, request: &TxnRequest) -> ApplyResult<TxnResponse>;

    fn compact(&self, revision: i64) -> ApplyResult<CompactionHandle>;

    fn lease_grant(&self, id: i64, ttl: i64) -> ApplyResult<Lease>;

    fn lease_revoke(&self, id: i64) -> ApplyResult<DeleteResult>;

    fn alarm(&self, request: &AlarmRequest) -> ApplyResult<Vec<AlarmMember>>;
}

/// Builds the full chain over `base`.
pub fn arbitrate<A: Applier + 'static>(
    base: A,
    quota: BackendQuota,
    alarms: Arc<AlarmStore>,
    member_id: u64,
) -> Arc<dyn Applier> {
    let quota = QuotaApplier::new(base, quota, alarms.clone(), member_id);
    Arc::new(CappedApplier::new(quota, alarms))
}

/// A command for the apply loop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApplyCommand {
    Put {
        key: Vec<u8>,
        value: Vec<u8>,
        lease: i64,
    },
    DeleteRange {
        key: Vec<u8>,
        range_end: Vec<u8>,
    },
    Txn(TxnRequest),
    Compact {
        revision: i64,
    },
    LeaseGrant {
        id: i64,
        ttl: i64,
    },
    LeaseRevoke {
        id: i64,
    },
    Alarm(AlarmRequest),
}

#[derive(Clone, Debug)]
pub enum ApplyResponse {
    Put(PutResult),
    DeleteRange(DeleteResult),
    Txn(TxnResponse),
    Compact(CompactionHandle),
    LeaseGrant(Lease),
    LeaseRevoke(DeleteResult),
    Alarm(Vec<AlarmMember>),
}

/// Executes one command on the chain.
pub fn apply_command(applier: &dyn Applier, command: &ApplyCommand) -> ApplyResult<ApplyResponse> {
    match command {
        ApplyCommand::Put { key, value, lease } => {
            applier.put(key, value, *lease).map(ApplyResponse::Put)
        }
        ApplyCommand::DeleteRange { key, range_end } => applier
            .delete_range(key, range_end)
            .map(ApplyResponse::DeleteRange),
        ApplyCommand::Txn(request) => applier.txn(request).map(ApplyResponse::Txn),
        ApplyCommand::Compact { revision } => {
            applier.compact(*revision).map(ApplyResponse::Compact)
        }
        ApplyCommand::LeaseGrant { id, ttl } => {
            applier.lease_grant(*id, *ttl).map(ApplyResponse::LeaseGrant)
        }
        ApplyCommand::LeaseRevoke { id } => {
            applier.lease_revoke(*id).map(ApplyResponse::LeaseRevoke)
        }
        ApplyCommand::Alarm(request) => applier.alarm(request).map(ApplyResponse::Alarm),
    }
}

/// A command plus the channel its result is sent back on.
pub struct ApplyRequest {
    pub command: ApplyCommand,
    pub respond: Option<oneshot::Sender<ApplyResult<ApplyResponse>>>,
}

/// Submits commands to a running apply loop.
#[derive(Clone)]
pub struct ApplyHandle {
    requests: mpsc::Sender<ApplyRequest>,
}

impl ApplyHandle {
    /// Applies a command and waits for its result.
    pub async fn apply(&self, command: ApplyCommand) -> ApplyResult<ApplyResponse> {
        let (respond, result) = oneshot::channel();
        self.requests
            .send(ApplyRequest {
                command,
                respond: Some(respond),
            })
            .await
            .map_err(|_| ApplyError::Stopped)?;
        result.await.map_err(|_| ApplyError::Stopped)?
    }

    /// Queues a command without waiting for it.
    pub async fn submit(&self, command: ApplyCommand) -> ApplyResult<()> {
        self.requests
            .send(ApplyRequest {
                command,
                respond: None,
            })
            .await
            .map_err(|_| ApplyError::Stopped)
    }
}

/// The single writer of the store.
pub struct ApplyLoop {
    applier: Arc<dyn Applier>,
    requests: mpsc::Receiver<ApplyRequest>,
    expired: mpsc::Receiver<LeaseExpireEvent>,
    compactions: mpsc::Receiver<i64>,
}

impl ApplyLoop {
    /// Creates the loop and the handle that feeds it.
    pub fn new(
        applier: Arc<dyn Applier>,
        capacity: usize,
        expired: mpsc::Receiver<LeaseExpireEvent>,
        compactions: mpsc::Receiver<i64>,
    ) -> (ApplyHandle, Self) {
        let (tx, requests) = mpsc::channel(capacity.max(1));
        let apply_loop = Self {
            applier,
            requests,
            expired,
            compactions,
        };
        (ApplyHandle { requests: tx }, apply_loop)
    }

    /// Applies commands until every [`ApplyHandle`] is dropped.
    pub async fn run(mut self) {
        info!("Apply loop started");
        loop {
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(request) => self.handle(request),
                    None => break,
                },
                Some(event) = self.expired.recv() => self.revoke_expired(event.lease_id),
                Some(revision) = self.compactions.recv() => self.auto_compact(revision),
            }
        }
        info!("Apply loop stopped");
    }

    fn handle(&self, request: ApplyRequest) {
        let result = apply_command(self.applier.as_ref(), &request.command);
        if let Err(e) = &result {
            debug!(command = ?request.command, error = %e, "Command rejected");
        }
        if let Some(respond) = request.respond {
            // The caller may have given up waiting.
            let _ = respond.send(result);
        }
    }

    fn revoke_expired(&self, lease_id: i64) {
        match self.applier.lease_revoke(lease_id) {
            Ok(result) => info!(
                lease_id,
                deleted = result.deleted,
                revision = result.revision,
                "Expired lease revoked"
            ),
            // Revoked explicitly after the expiry was noticed.
            Err(ApplyError::Lease(LeaseError::LeaseNotFound(_))) => {
                debug!(lease_id, "Expired lease already revoked")
            }
            Err(e) => warn!(lease_id, error = %e, "Failed to revoke expired lease"),
        }
    }

    fn auto_compact(&self, revision: i64) {
        match self.applier.compact(revision) {
            Ok(_) => info!(revision, "Auto compaction applied"),
            Err(ApplyError::Storage(StorageError::Compacted { .. })) => {
                debug!(revision, "Auto compaction target already compacted")
            }
            Err(e) => warn!(revision, error = %e, "Auto compaction failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::{LeaseManager, Lessor};
    use crate::storage::{
        Backend, BackendConfig, MvccConfig, MvccStore, RangeOptions, RequestOp,
    };
    use crate::watch::{WatchConfig, WatchRequest, WatchableStore};
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: Arc<WatchableStore>,
        leases: Arc<LeaseManager>,
        alarms: Arc<AlarmStore>,
        applier: Arc<dyn Applier>,
    }

    fn fixture(quota_bytes: u64) -> Fixture {
        let dir = TempDir::new().unwrap();
        let backend = Backend::new(BackendConfig {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        })
        .unwrap();
        let (expire_tx, _expire_rx) = mpsc::channel(16);
        let leases = Arc::new(LeaseManager::new(expire_tx));
        let lessor: Arc<dyn Lessor> = leases.clone();
        let mvcc = MvccStore::new(backend.clone(), MvccConfig::default(), Some(lessor.clone()))
            .unwrap();
        let (store, _dispatcher) = WatchableStore::new(mvcc, WatchConfig::default());
        let alarms = Arc::new(AlarmStore::new(backend.clone()).unwrap());

        let base = BackendApplier::new(store.clone(), lessor, alarms.clone());
        let quota = BackendQuota::new(
            backend,
            &QuotaConfig {
                backend_bytes: quota_bytes,
            },
        );
        let applier = arbitrate(base, quota, alarms.clone(), 1);
        Fixture {
            _dir: dir,
            store,
            leases,
            alarms,
            applier,
        }
    }

    fn count(store: &WatchableStore, key: &[u8]) -> usize {
        store
            .range(key, b"", &RangeOptions::default())
            .unwrap()
            .kvs
            .len()
    }

    #[tokio::test]
    async fn test_quota_applies_then_reports_no_space() {
        // Any real backend is larger than one byte
        let f = fixture(1);

        let result = f.applier.put(b"a", b"1", 0);
        assert!(matches!(result, Err(ApplyError::NoSpace)));
        // The write went through anyway and the alarm is up
        assert_eq!(count(&f.store, b"a"), 1);
        assert!(f.alarms.is_active(AlarmType::NoSpace));

        // Now capped: nothing that adds data is applied
        assert!(matches!(f.applier.put(b"b", b"1", 0), Err(ApplyError::NoSpace)));
        assert_eq!(count(&f.store, b"b"), 0);
        assert!(matches!(
            f.applier.lease_grant(0, 10),
            Err(ApplyError::NoSpace)
        ));
        assert_eq!(f.leases.count(), 0);

        let with_put = TxnRequest {
            success: vec![RequestOp::Put {
                key: b"c".to_vec(),
                value: b"1".to_vec(),
                lease: 0,
            }],
            ..Default::default()
        };
        assert!(matches!(f.applier.txn(&with_put), Err(ApplyError::NoSpace)));

        // Deletes and read-only txns still work
        let read_only = TxnRequest {
            success: vec![RequestOp::Range {
                key: b"a".to_vec(),
                range_end: Vec::new(),
                options: RangeOptions::default(),
            }],
            ..Default::default()
        };
        assert!(f.applier.txn(&read_only).is_ok());
        assert_eq!(f.applier.delete_range(b"a", b"").unwrap().deleted, 1);
    }

    #[tokio::test]
    async fn test_disarming_lifts_the_cap() {
        let f = fixture(1);
        let _ = f.applier.put(b"a", b"1", 0);
        assert!(f.alarms.is_active(AlarmType::NoSpace));

        let listed = f
            .applier
            .alarm(&AlarmRequest {
                action: AlarmAction::Get,
                member_id: 0,
                alarm: None,
            })
            .unwrap();
        assert_eq!(listed.len(), 1);

        let cleared = f
            .applier
            .alarm(&AlarmRequest {
                action: AlarmAction::Deactivate,
                member_id: 1,
                alarm: Some(AlarmType::NoSpace),
            })
            .unwrap();
        assert_eq!(cleared.len(), 1);

        // Still over quota, so the next put is applied and raises the alarm again
        assert!(matches!(f.applier.put(b"b", b"1", 0), Err(ApplyError::NoSpace)));
        assert_eq!(count(&f.store, b"b"), 1);
        assert!(f.alarms.is_active(AlarmType::NoSpace));
    }

    #[tokio::test]
    async fn test_corrupt_alarm_does_not_cap() {
        let f = fixture(0);
        f.applier
            .alarm(&AlarmRequest {
                action: AlarmAction::Activate,
                member_id: 3,
                alarm: Some(AlarmType::Corrupt),
            })
            .unwrap();
        assert!(f.applier.put(b"a", b"1", 0).is_ok());
    }

    #[tokio::test]
    async fn test_lease_revoke_deletes_keys_at_one_revision() {
        let f = fixture(0);
        let lease = f.applier.lease_grant(0, 60).unwrap();
        f.applier.put(b"a", b"1", lease.id).unwrap();
        f.applier.put(b"b", b"1", lease.id).unwrap();
        f.applier.put(b"c", b"1", 0).unwrap();

        let mut stream = f.store.watch_stream();
        stream.watch(WatchRequest::range(b"a", b"z")).unwrap();

        let revoked = f.applier.lease_revoke(lease.id).unwrap();
        assert_eq!(revoked.deleted, 2);
        assert_eq!(revoked.revision, 5);
        assert!(f.leases.lookup(lease.id).is_none());
        assert_eq!(count(&f.store, b"a"), 0);
        assert_eq!(count(&f.store, b"c"), 1);

        let resp = tokio::time::timeout(Duration::from_secs(5), stream.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resp.revision, 5);
        assert_eq!(resp.events.len(), 2);

        assert!(matches!(
            f.applier.lease_revoke(lease.id),
            Err(ApplyError::Lease(LeaseError::LeaseNotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_apply_loop() {
        let f = fixture(0);
        let (expire_tx, expire_rx) = mpsc::channel(4);
        let (compact_tx, compact_rx) = mpsc::channel(4);
        let (handle, apply_loop) = ApplyLoop::new(f.applier.clone(), 16, expire_rx, compact_rx);
        let task = tokio::spawn(apply_loop.run());

        let response = handle
            .apply(ApplyCommand::Put {
                key: b"k".to_vec(),
                value: b"v".to_vec(),
                lease: 0,
            })
            .await
            .unwrap();
        match response {
            ApplyResponse::Put(result) => assert_eq!(result.revision, 2),
            other => panic!("unexpected response {:?}", other),
        }

        let lease = match handle
            .apply(ApplyCommand::LeaseGrant { id: 0, ttl: 60 })
            .await
            .unwrap()
        {
            ApplyResponse::LeaseGrant(lease) => lease,
            other => panic!("unexpected response {:?}", other),
        };
        handle
            .apply(ApplyCommand::Put {
                key: b"leased".to_vec(),
                value: b"v".to_vec(),
                lease: lease.id,
            })
            .await
            .unwrap();

        // Expiry notifications become revocations
        expire_tx
            .send(LeaseExpireEvent { lease_id: lease.id })
            .await
            .unwrap();
        compact_tx.send(2).await.unwrap();

        // A round trip through the loop orders us after both
        handle
            .apply(ApplyCommand::Alarm(AlarmRequest {
                action: AlarmAction::Get,
                member_id: 0,
                alarm: None,
            }))
            .await
            .unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while (f.leases.count() > 0 || f.store.store().compact_revision() != 2)
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(f.leases.count(), 0);
        assert_eq!(count(&f.store, b"leased"), 0);
        assert_eq!(f.store.store().compact_revision(), 2);

        let err = handle
            .apply(ApplyCommand::Compact { revision: 1 })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ApplyError::Storage(StorageError::Compacted { .. })
        ));

        drop(handle);
        task.await.unwrap();
    }
}
