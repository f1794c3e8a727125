//! Backend space quota and the appliers that enforce it.

use std::sync::Arc;
use tracing::warn;

use super::alarm::{AlarmMember, AlarmRequest, AlarmStore, AlarmType};
use super::{Applier, ApplyError, ApplyResult};
use crate::lease::Lease;
use crate::storage::{
    Backend, CompactionHandle, DeleteResult, PutResult, RequestOp, TxnRequest, TxnResponse,
};

/// Bytes charged per key-value on top of its key and value.
pub const KV_OVERHEAD: u64 = 256;

/// Bytes charged per lease grant.
pub const LEASE_OVERHEAD: u64 = 64;

/// Default backend quota, 2 GiB.
pub const DEFAULT_QUOTA_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// Quota configuration.
#[derive(Clone, Debug)]
pub struct QuotaConfig {
    /// Backend size above which writes raise the no-space alarm. 0 uses the default.
    pub backend_bytes: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            backend_bytes: DEFAULT_QUOTA_BYTES,
        }
    }
}

pub fn put_cost(key: &[u8], value: &[u8]) -> u64 {
    KV_OVERHEAD + key.len() as u64 + value.len() as u64
}

/// Cost of the more expensive branch; only puts cost anything.
pub fn txn_cost(request: &TxnRequest) -> u64 {
    fn branch(ops: &[RequestOp]) -> u64 {
        ops.iter()
            .map(|op| match op {
                RequestOp::Put { key, value, .. } => put_cost(key, value),
                RequestOp::Txn(nested) => txn_cost(nested),
                RequestOp::Range { .. } | RequestOp::DeleteRange { .. } => 0,
            })
            .sum()
    }
    branch(&request.success).max(branch(&request.failure))
}

/// Space accounting against the backend's current size.
pub struct BackendQuota {
    backend: Arc<Backend>,
    limit: u64,
}

impl BackendQuota {
    pub fn new(backend: Arc<Backend>, config: &QuotaConfig) -> Self {
        let limit = if config.backend_bytes == 0 {
            DEFAULT_QUOTA_BYTES
        } else {
            config.backend_bytes
        };
        Self { backend, limit }
    }

    /// Whether `cost` more bytes fit under the quota. Requests that add no
    /// data always fit, even when the backend is already over the limit.
    pub fn available(&self, cost: u64) -> bool {
        cost == 0 || self.backend.size().saturating_add(cost) <= self.limit
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }
}

/// Checks the quota before each write that adds data and reports no-space after
/// applying it, raising the alarm.
///
/// The write itself is not refused: once the alarm is up, [`CappedApplier`]
/// refuses the following ones.
pub struct QuotaApplier<A> {
    inner: A,
    quota: BackendQuota,
    alarms: Arc<AlarmStore>,
    member_id: u64,
}

impl<A: Applier> QuotaApplier<A> {
    pub fn new(inner: A, quota: BackendQuota, alarms: Arc<AlarmStore>, member_id: u64) -> Self {
        Self {
            inner,
            quota,
            alarms,
            member_id,
        }
    }

    fn settle<T>(&self, fits: bool, result: ApplyResult<T>) -> ApplyResult<T> {
        match result {
            Ok(_) if !fits => {
                warn!(
                    size = self.quota.backend.size(),
                    quota = self.quota.limit(),
                    "Backend quota exceeded"
                );
                self.alarms.activate(self.member_id, AlarmType::NoSpace);
                Err(ApplyError::NoSpace)
            }
            other => other,
        }
    }
}

impl<A: Applier> Applier for QuotaApplier<A> {
    fn put(&self, key: &[u8], value: &[u8], lease: i64) -> ApplyResult<PutResult> {
        let fits = self.quota.available(put_cost(key, value));
        let result = self.inner.put(key, value, lease);
        self.settle(fits, result)
    }

    fn delete_range(&self, key: &[u8], range_end: &[u8]) -> ApplyResult<DeleteResult> {
        self.inner.delete_range(key, range_end)
    }

    fn txn(&self, request: &TxnRequest) -> ApplyResult<TxnResponse> {
        let fits = self.quota.available(txn_cost(request));
        let result = self.inner.txn(request);
        self.settle(fits, result)
    }

    fn compact(&self, revision: i64) -> ApplyResult<CompactionHandle> {
        self.inner.compact(revision)
    }

    fn lease_grant(&self, id: i64, ttl: i64) -> ApplyResult<Lease> {
        let fits = self.quota.available(LEASE_OVERHEAD);
        let result = self.inner.lease_grant(id, ttl);
        self.settle(fits, result)
    }

    fn lease_revoke(&self, id: i64) -> ApplyResult<DeleteResult> {
        self.inner.lease_revoke(id)
    }

    fn alarm(&self, request: &AlarmRequest) -> ApplyResult<Vec<AlarmMember>> {
        self.inner.alarm(request)
    }
}

/// Refuses every write that adds data while the no-space alarm is raised.
pub struct CappedApplier<A> {
    inner: A,
    alarms: Arc<AlarmStore>,
}

impl<A: Applier> CappedApplier<A> {
    pub fn new(inner: A, alarms: Arc<AlarmStore>) -> Self {
        Self { inner, alarms }
    }

    fn capped(&self) -> bool {
        self.alarms.is_active(AlarmType::NoSpace)
    }
}

impl<A: Applier> Applier for CappedApplier<A> {
    fn put(&self, key: &[u8], value: &[u8], lease: i64) -> ApplyResult<PutResult> {
        if self.capped() {
            return Err(ApplyError::NoSpace);
        }
        self.inner.put(key, value, lease)
    }

    fn delete_range(&self, key: &[u8], range_end: &[u8]) -> ApplyResult<DeleteResult> {
        self.inner.delete_range(key, range_end)
    }

    fn txn(&self, request: &TxnRequest) -> ApplyResult<TxnResponse> {
        if self.capped() && request.has_puts() {
            return Err(ApplyError::NoSpace);
        }
        self.inner.txn(request)
    }

    fn compact(&self, revision: i64) -> ApplyResult<CompactionHandle> {
        self.inner.compact(revision)
    }

    fn lease_grant(&self, id: i64, ttl: i64) -> ApplyResult<Lease> {
        if self.capped() {
            return Err(ApplyError::NoSpace);
        }
        self.inner.lease_grant(id, ttl)
    }

    fn lease_revoke(&self, id: i64) -> ApplyResult<DeleteResult> {
        self.inner.lease_revoke(id)
    }

    fn alarm(&self, request: &AlarmRequest) -> ApplyResult<Vec<AlarmMember>> {
        self.inner.alarm(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{BackendConfig, RangeOptions};
    use tempfile::TempDir;

    fn put(key: &str, value: &str) -> RequestOp {
        RequestOp::Put {
            key: key.as_bytes().to_vec(),
            value: value.as_bytes().to_vec(),
            lease: 0,
        }
    }

    #[test]
    fn test_txn_cost_takes_larger_branch() {
        let request = TxnRequest {
            compare: vec![],
            success: vec![put("a", "1"), put("b", "22")],
            failure: vec![
                put("c", "1"),
                RequestOp::Range {
                    key: b"a".to_vec(),
                    range_end: Vec::new(),
                    options: RangeOptions::default(),
                },
            ],
        };
        assert_eq!(txn_cost(&request), 2 * KV_OVERHEAD + 5);

        let deletes_only = TxnRequest {
            success: vec![RequestOp::DeleteRange {
                key: b"a".to_vec(),
                range_end: Vec::new(),
            }],
            ..Default::default()
        };
        assert_eq!(txn_cost(&deletes_only), 0);
    }

    #[test]
    fn test_nested_txn_cost() {
        let nested = TxnRequest {
            success: vec![put("x", "123")],
            ..Default::default()
        };
        let request = TxnRequest {
            success: vec![put("a", "1"), RequestOp::Txn(nested)],
            ..Default::default()
        };
        assert_eq!(txn_cost(&request), put_cost(b"a", b"1") + put_cost(b"x", b"123"));
    }

    #[test]
    fn test_requests_adding_nothing_fit_over_quota() {
        let dir = TempDir::new().unwrap();
        let backend = Backend::new(BackendConfig {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        })
        .unwrap();
        let quota = BackendQuota::new(backend, &QuotaConfig { backend_bytes: 1 });

        assert!(quota.available(0));
        assert!(!quota.available(put_cost(b"a", b"1")));
    }
}
