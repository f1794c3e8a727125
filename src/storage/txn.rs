//! Multi-operation transactions with compare-and-swap semantics.
//!
//! A [`TxnRequest`] is evaluated inside one [`WriteTxn`]: the comparisons pick the
//! success or failure branch, and the branch's operations run in order against the
//! txn's own view, so later operations observe earlier ones. All writes of a txn
//! share one main revision.

use std::collections::HashSet;

use tracing::debug;

use crate::storage::index::key_in_range;
use crate::storage::mvcc::{Event, KeyValue, MvccStore, RangeOptions, RangeResult, WriteTxn};
use crate::storage::{StorageError, StorageResult};

/// How a comparison relates the stored field to the target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompareResult {
    Equal,
    Greater,
    Less,
    NotEqual,
}

impl CompareResult {
    fn holds<T: PartialOrd + ?Sized>(self, actual: &T, target: &T) -> bool {
        match self {
            CompareResult::Equal => actual == target,
            CompareResult::Greater => actual > target,
            CompareResult::Less => actual < target,
            CompareResult::NotEqual => actual != target,
        }
    }
}

/// The field compared and the value it is compared with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CompareTarget {
    Version(i64),
    Create(i64),
    Mod(i64),
    Value(Vec<u8>),
    Lease(i64),
}

/// A single guard of a transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Compare {
    pub key: Vec<u8>,
    /// Compares every key in `[key, range_end)` when set
    pub range_end: Vec<u8>,
    pub result: CompareResult,
    pub target: CompareTarget,
}

impl Compare {
    pub fn new(key: &[u8], result: CompareResult, target: CompareTarget) -> Self {
        Self {
            key: key.to_vec(),
            range_end: Vec::new(),
            result,
            target,
        }
    }

    /// Whether the stored pair satisfies this guard. A missing key has zero
    /// version and revisions, no lease and never matches a value guard.
    fn matches(&self, kv: Option<&KeyValue>) -> bool {
        match (&self.target, kv) {
            (CompareTarget::Value(target), Some(kv)) => {
                self.result.holds(kv.value.as_slice(), target.as_slice())
            }
            (CompareTarget::Value(_), None) => false,
            (CompareTarget::Version(target), kv) => {
                self.result.holds(&kv.map_or(0, |kv| kv.version), target)
            }
            (CompareTarget::Create(target), kv) => {
                self.result.holds(&kv.map_or(0, |kv| kv.create_revision), target)
            }
            (CompareTarget::Mod(target), kv) => {
                self.result.holds(&kv.map_or(0, |kv| kv.mod_revision), target)
            }
            (CompareTarget::Lease(target), kv) => {
                self.result.holds(&kv.map_or(0, |kv| kv.lease), target)
            }
        }
    }
}

/// One operation inside a transaction branch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequestOp {
    Range {
        key: Vec<u8>,
        range_end: Vec<u8>,
        options: RangeOptions,
    },
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
}

/// Result of one branch operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResponseOp {
    Range(RangeResult),
    Put { prev_kv: Option<KeyValue> },
    DeleteRange { deleted: i64, prev_kvs: Vec<KeyValue> },
    Txn { succeeded: bool, responses: Vec<ResponseOp> },
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TxnRequest {
    pub compare: Vec<Compare>,
    pub success: Vec<RequestOp>,
    pub failure: Vec<RequestOp>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxnResponse {
    pub succeeded: bool,
    pub responses: Vec<ResponseOp>,
    /// Revision after the txn; unchanged when it wrote nothing
    pub revision: i64,
    pub events: Vec<Event>,
}

impl TxnRequest {
    /// Whether either branch contains a put. Used for quota and capacity checks.
    pub fn has_puts(&self) -> bool {
        fn any_put(ops: &[RequestOp]) -> bool {
            ops.iter().any(|op| match op {
                RequestOp::Put { .. } => true,
                RequestOp::Txn(nested) => nested.has_puts(),
                _ => false,
            })
        }
        any_put(&self.success) || any_put(&self.failure)
    }

    /// Rejects branches that write the same key twice.
    pub fn check_duplicates(&self) -> StorageResult<()> {
        check_branch(&self.success)?;
        check_branch(&self.failure)?;
        Ok(())
    }
}

/// Puts in one branch must target distinct keys and must not fall inside a
/// delete range of the same branch. Returns the branch's put keys.
fn check_branch(ops: &[RequestOp]) -> StorageResult<HashSet<Vec<u8>>> {
    let mut puts: HashSet<Vec<u8>> = HashSet::new();
    let mut deletes: Vec<(&[u8], &[u8])> = Vec::new();

    for op in ops {
        match op {
            RequestOp::Put { key, .. } => {
                if !puts.insert(key.clone()) {
                    return Err(StorageError::DuplicateKey(key.clone()));
                }
            }
            RequestOp::DeleteRange { key, range_end } => deletes.push((key, range_end)),
            RequestOp::Txn(nested) => {
                // Only one nested branch runs, so they are checked against the
                // outer puts but not against each other.
                let mut nested_puts = check_branch(&nested.success)?;
                nested_puts.extend(check_branch(&nested.failure)?);
                if let Some(dup) = nested_puts.iter().find(|k| puts.contains(*k)) {
                    return Err(StorageError::DuplicateKey(dup.clone()));
                }
                puts.extend(nested_puts);
            }
            RequestOp::Range { .. } => {}
        }
    }

    for (start, end) in deletes {
        if let Some(dup) = puts.iter().find(|k| key_in_range(k, start, end)) {
            return Err(StorageError::DuplicateKey(dup.clone()));
        }
    }
    Ok(puts)
}

impl MvccStore {
    /// Executes a transaction atomically at one revision.
    pub fn txn(&self, request: &TxnRequest) -> StorageResult<TxnResponse> {
        let mut txn = self.write();
        let result = txn.txn(request);
        let outcome = txn.end();
        let (succeeded, responses) = result?;

        Ok(TxnResponse {
            succeeded,
            responses,
            revision: outcome.revision,
            events: outcome.events,
        })
    }
}

impl WriteTxn<'_> {
    /// Evaluates `request` and runs the chosen branch inside this txn.
    ///
    /// Every request-level rejection (duplicate keys, unknown leases, reads at a
    /// compacted or future revision) happens before anything is staged, so an
    /// error leaves the txn as it was. Only backend failures can interrupt a
    /// branch halfway.
    pub fn txn(&mut self, request: &TxnRequest) -> StorageResult<(bool, Vec<ResponseOp>)> {
        request.check_duplicates()?;

        let succeeded = evaluate(self, &request.compare)?;
        let branch = if succeeded {
            &request.success
        } else {
            &request.failure
        };
        check_ops(self, branch)?;

        let responses = execute(self, branch)?;
        debug!(succeeded, ops = branch.len(), "Txn branch applied");
        Ok((succeeded, responses))
    }
}

/// Validates a branch, nested txns in both of their branches included.
fn check_ops(txn: &WriteTxn<'_>, ops: &[RequestOp]) -> StorageResult<()> {
    for op in ops {
        match op {
            RequestOp::Range { options, .. } => txn.check_read_revision(options.revision)?,
            RequestOp::Put { lease, .. } => txn.check_lease(*lease)?,
            RequestOp::DeleteRange { .. } => {}
            RequestOp::Txn(nested) => {
                check_ops(txn, &nested.success)?;
                check_ops(txn, &nested.failure)?;
            }
        }
    }
    Ok(())
}

fn evaluate(txn: &WriteTxn<'_>, compares: &[Compare]) -> StorageResult<bool> {
    for cmp in compares {
        let found = txn.range(&cmp.key, &cmp.range_end, &RangeOptions::default())?;
        let holds = if found.kvs.is_empty() {
            cmp.matches(None)
        } else {
            found.kvs.iter().all(|kv| cmp.matches(Some(kv)))
        };
        if !holds {
            return Ok(false);
        }
    }
    Ok(true)
}

fn execute(txn: &mut WriteTxn<'_>, ops: &[RequestOp]) -> StorageResult<Vec<ResponseOp>> {
    let mut responses = Vec::with_capacity(ops.len());
    for op in ops {
        let response = match op {
            RequestOp::Range {
                key,
                range_end,
                options,
            } => ResponseOp::Range(txn.range(key, range_end, options)?),
            RequestOp::Put { key, value, lease } => ResponseOp::Put {
                prev_kv: txn.put(key, value, *lease)?,
            },
            RequestOp::DeleteRange { key, range_end } => {
                let prev_kvs = txn.delete_range(key, range_end)?;
                ResponseOp::DeleteRange {
                    deleted: prev_kvs.len() as i64,
                    prev_kvs,
                }
            }
            RequestOp::Txn(nested) => {
                let succeeded = evaluate(txn, &nested.compare)?;
                let branch = if succeeded {
                    &nested.success
                } else {
                    &nested.failure
                };
                ResponseOp::Txn {
                    succeeded,
                    responses: execute(txn, branch)?,
                }
            }
        };
        responses.push(response);
    }
    Ok(responses)
}
