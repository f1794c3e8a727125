//! The innermost applier: executes commands against the watchable store and lessor.

use std::sync::Arc;
use tracing::{debug, info};

use super::alarm::{AlarmAction, AlarmMember, AlarmRequest, AlarmStore};
use super::{Applier, ApplyResult};
use crate::lease::{Lease, LeaseError, Lessor};
use crate::storage::{CompactionHandle, DeleteResult, PutResult, TxnRequest, TxnResponse};
use crate::watch::WatchableStore;

pub struct BackendApplier {
    store: Arc<WatchableStore>,
    lessor: Arc<dyn Lessor>,
    alarms: Arc<AlarmStore>,
}

impl BackendApplier {
    pub fn new(store: Arc<WatchableStore>, lessor: Arc<dyn Lessor>, alarms: Arc<AlarmStore>) -> Self {
        Self {
            store,
            lessor,
            alarms,
        }
    }
}

impl Applier for BackendApplier {
    fn put(&self, key: &[u8], value: &[u8], lease: i64) -> ApplyResult<PutResult> {
        Ok(self.store.put(key, value, lease)?)
    }

    fn delete_range(&self, key: &[u8], range_end: &[u8]) -> ApplyResult<DeleteResult> {
        Ok(self.store.delete_range(key, range_end)?)
    }

    fn txn(&self, request: &TxnRequest) -> ApplyResult<TxnResponse> {
        Ok(self.store.txn(request)?)
    }

    fn compact(&self, revision: i64) -> ApplyResult<CompactionHandle> {
        let handle = self.store.compact(revision)?;
        info!(revision, "Compaction applied");
        Ok(handle)
    }

    fn lease_grant(&self, id: i64, ttl: i64) -> ApplyResult<Lease> {
        Ok(self.lessor.grant(id, ttl)?)
    }

    /// Deletes every key attached to the lease at one revision, then drops the lease.
    fn lease_revoke(&self, id: i64) -> ApplyResult<DeleteResult> {
        let lease = self
            .lessor
            .lookup(id)
            .ok_or(LeaseError::LeaseNotFound(id))?;

        let mut keys: Vec<Vec<u8>> = lease.keys.into_iter().collect();
        keys.sort();

        let (prev_kvs, outcome) = self.store.write(|txn| {
            let mut deleted = Vec::with_capacity(keys.len());
            for key in &keys {
                deleted.extend(txn.delete_range(key, b"")?);
            }
            Ok(deleted)
        })?;
        self.lessor.revoke(id)?;

        debug!(
            lease_id = id,
            deleted = prev_kvs.len(),
            revision = outcome.revision,
            "Lease revoked"
        );
        Ok(DeleteResult {
            revision: outcome.revision,
            deleted: prev_kvs.len() as i64,
            prev_kvs,
            events: outcome.events,
        })
    }

    fn alarm(&self, request: &AlarmRequest) -> ApplyResult<Vec<AlarmMember>> {
        let changed = match (request.action, request.alarm) {
            (AlarmAction::Get, alarm) => return Ok(self.alarms.get(alarm)),
            (_, None) => None,
            (AlarmAction::Activate, Some(alarm)) => self.alarms.activate(request.member_id, alarm),
            (AlarmAction::Deactivate, Some(alarm)) => {
                self.alarms.deactivate(request.member_id, alarm)
            }
        };
        Ok(changed.into_iter().collect())
    }
}
