//! Compaction for the MVCC store.
//!
//! Compaction is split in two. The index update happens synchronously inside
//! [`MvccStore::compact`]; removing the payloads of obsolete revisions from the backend
//! can be slow, so it is handed to a dedicated worker thread that processes jobs in
//! FIFO order and deletes in bounded batches so the writer is never locked out for long.
//!
//! This module also provides the automatic [`Compactor`], which decides *when* to
//! compact:
//! - Periodic: compact to the revision that was current one retention period ago
//! - Revision: keep the last N revisions

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::storage::backend::Backend;
use crate::storage::mvcc::{next_key, FINISHED_COMPACT_KEY};
use crate::storage::revision::Revision;
use crate::storage::{Bucket, BackendResult, MvccStore};

/// Completion signal of a physical compaction.
#[derive(Clone, Debug)]
pub struct CompactionHandle {
    revision: i64,
    done: watch::Receiver<bool>,
}

impl CompactionHandle {
    /// A handle for a compaction that needs no work.
    pub(crate) fn finished(revision: i64) -> Self {
        let (_tx, done) = watch::channel(true);
        Self { revision, done }
    }

    pub fn revision(&self) -> i64 {
        self.revision
    }

    pub fn is_done(&self) -> bool {
        *self.done.borrow()
    }

    /// Waits until the payloads are gone. Returns early if the worker died.
    pub async fn wait(&self) {
        let mut done = self.done.clone();
        if done.wait_for(|finished| *finished).await.is_err() {
            warn!(revision = self.revision, "Compaction worker exited before finishing");
        }
    }
}

struct CompactionJob {
    revision: i64,
    keep: HashSet<Revision>,
    done: watch::Sender<bool>,
}

/// FIFO worker thread deleting obsolete revisions.
pub(crate) struct CompactionWorker {
    jobs: Option<crossbeam_channel::Sender<CompactionJob>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl CompactionWorker {
    pub(crate) fn start(backend: Arc<Backend>, batch_limit: usize) -> Self {
        let (jobs, queue) = crossbeam_channel::unbounded::<CompactionJob>();
        let batch_limit = batch_limit.max(1);
        let thread = thread::spawn(move || {
            for job in queue.iter() {
                let started = Instant::now();
                match compact_backend(&backend, job.revision, &job.keep, batch_limit) {
                    Ok(removed) => info!(
                        revision = job.revision,
                        removed,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Physical compaction finished"
                    ),
                    Err(e) => {
                        error!(revision = job.revision, "Physical compaction failed: {}", e);
                        panic!("compaction at revision {} failed: {}", job.revision, e);
                    }
                }
                job.done.send_replace(true);
            }
            debug!("Compaction worker stopped");
        });

        Self {
            jobs: Some(jobs),
            thread: Some(thread),
        }
    }

    pub(crate) fn schedule(&self, revision: i64, keep: HashSet<Revision>) -> CompactionHandle {
        let (done, rx) = watch::channel(false);
        let job = CompactionJob {
            revision,
            keep,
            done,
        };
        if let Some(jobs) = &self.jobs {
            if jobs.send(job).is_err() {
                error!(revision, "Compaction worker is gone, job dropped");
            }
        }
        CompactionHandle { revision, done: rx }
    }
}

impl Drop for CompactionWorker {
    fn drop(&mut self) {
        // Closing the queue lets the thread finish queued jobs and exit.
        self.jobs.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Compaction worker panicked");
            }
        }
    }
}

/// Deletes every revision `<= revision` not in `keep`, `batch_limit` at a time,
/// then records the finished watermark.
fn compact_backend(
    backend: &Backend,
    revision: i64,
    keep: &HashSet<Revision>,
    batch_limit: usize,
) -> BackendResult<usize> {
    let end = Revision::first_of(revision + 1).to_bytes();
    let mut start = Revision::default().to_bytes();
    let mut removed = 0;

    loop {
        let mut tx = backend.batch_tx();
        let entries = tx.range(Bucket::Key, &start, Some(end.as_slice()), batch_limit)?;

        for (rev_bytes, _) in &entries {
            match Revision::from_bytes(rev_bytes) {
                Some(rev) if keep.contains(&rev) => {}
                _ => {
                    tx.delete(Bucket::Key, rev_bytes);
                    removed += 1;
                }
            }
        }

        match entries.last() {
            Some((last, _)) if entries.len() == batch_limit => {
                start = next_key(last);
                debug!(revision, removed, "Compaction batch done");
            }
            _ => {
                tx.put(Bucket::Meta, FINISHED_COMPACT_KEY, &revision.to_be_bytes());
                return Ok(removed);
            }
        }
    }
}

/// Auto compaction mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AutoCompactionMode {
    /// Periodic compaction.
    Periodic,
    /// Compaction by revision.
    Revision,
}

impl AutoCompactionMode {
    /// Parse from string (etcd-compatible).
    pub fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "periodic" => Ok(AutoCompactionMode::Periodic),
            "revision" => Ok(AutoCompactionMode::Revision),
            _ => Err(anyhow::anyhow!(
                "Invalid compaction mode: {}. Must be 'periodic' or 'revision'",
                s
            )),
        }
    }
}

/// Auto compaction settings.
#[derive(Clone, Debug)]
pub struct CompactorConfig {
    pub mode: AutoCompactionMode,

    /// Retention: a duration such as `"1h"`, `"30m"`, `"10s"` (bare numbers are hours)
    /// in periodic mode, a revision count in revision mode. `"0"` disables compaction.
    pub retention: String,

    /// How often revision mode checks the store.
    pub check_interval: Duration,
}

impl Default for CompactorConfig {
    fn default() -> Self {
        Self {
            mode: AutoCompactionMode::Periodic,
            retention: "0".to_string(),
            check_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// Parsed retention policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Retention {
    Disabled,
    Period(Duration),
    Revisions(i64),
}

impl CompactorConfig {
    pub fn retention(&self) -> anyhow::Result<Retention> {
        let raw = self.retention.trim();
        match self.mode {
            AutoCompactionMode::Revision => {
                let count: i64 = raw
                    .parse()
                    .map_err(|e| anyhow::anyhow!("Invalid revision retention {:?}: {}", raw, e))?;
                if count < 0 {
                    anyhow::bail!("Revision retention must not be negative, got {}", count);
                }
                Ok(if count == 0 {
                    Retention::Disabled
                } else {
                    Retention::Revisions(count)
                })
            }
            AutoCompactionMode::Periodic => {
                let period = parse_period(raw)?;
                Ok(if period.is_zero() {
                    Retention::Disabled
                } else {
                    Retention::Period(period)
                })
            }
        }
    }
}

fn parse_period(raw: &str) -> anyhow::Result<Duration> {
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    let amount: u64 = digits
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid retention period {:?}: {}", raw, e))?;
    let secs = match unit {
        "" | "h" => amount * 3600,
        "m" => amount * 60,
        "s" => amount,
        _ => anyhow::bail!("Invalid retention period unit in {:?}", raw),
    };
    Ok(Duration::from_secs(secs))
}

/// Background compactor that decides when to compact.
///
/// It never compacts by itself: target revisions are sent to the apply loop so
/// compaction is ordered with every other write.
pub struct Compactor {
    /// Reference to the MVCC store
    store: Arc<MvccStore>,

    retention: Retention,

    check_interval: Duration,

    requests: mpsc::Sender<i64>,
}

impl Compactor {
    /// Creates a new compactor.
    pub fn new(
        store: Arc<MvccStore>,
        config: &CompactorConfig,
        requests: mpsc::Sender<i64>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            store,
            retention: config.retention()?,
            check_interval: config.check_interval,
            requests,
        })
    }

    /// Spawns a background tokio task that requests compactions.
    ///
    /// Returns a JoinHandle that can be awaited or aborted.
    pub fn run(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            match self.retention {
                Retention::Disabled => debug!("Auto compaction disabled"),
                Retention::Period(period) => self.run_periodic(period).await,
                Retention::Revisions(keep) => self.run_revision(keep).await,
            }
        })
    }

    /// Each period, compacts to the revision observed one period earlier.
    async fn run_periodic(&self, period: Duration) {
        let mut ticker = interval(period);

        info!("Starting periodic compactor with retention: {:?}", period);

        // The first tick fires immediately and only records a sample.
        ticker.tick().await;
        let mut sampled = self.store.current_revision();

        loop {
            ticker.tick().await;
            let target = sampled;
            sampled = self.store.current_revision();
            if !self.request(target).await {
                return;
            }
        }
    }

    /// Keeps the newest `keep` revisions.
    async fn run_revision(&self, keep: i64) {
        let mut ticker = interval(self.check_interval);

        info!("Starting revision compactor retaining {} revisions", keep);

        loop {
            ticker.tick().await;
            let target = self.store.current_revision() - keep;
            if !self.request(target).await {
                return;
            }
        }
    }

    /// Returns false once the apply loop is gone.
    async fn request(&self, target: i64) -> bool {
        if target <= self.store.compact_revision() {
            return true;
        }
        debug!(
            "Auto compaction: current_rev={}, compact_rev={}, target={}",
            self.store.current_revision(),
            self.store.compact_revision(),
            target
        );
        if self.requests.send(target).await.is_err() {
            warn!("Auto compaction stopped: apply loop closed");
            return false;
        }
        true
    }
}
