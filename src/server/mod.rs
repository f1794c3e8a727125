//! Wires the storage core together and owns its background tasks.
//!
//! This module coordinates the initialization of:
//! - Persistent storage backend (sled-based, batched commits)
//! - MVCC store (revisioned key-value history)
//! - Watchable store (change notifications)
//! - Lease manager (TTL-based key expiration)
//! - Alarm store and the apply chain that arbitrates writes
//! - Auto compactor

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;
use tracing_subscriber::filter::EnvFilter;

use crate::apply::{
    self, AlarmStore, ApplyHandle, ApplyLoop, Applier, BackendApplier, BackendQuota,
    QuotaConfig,
};
use crate::lease::{LeaseManager, Lessor};
use crate::storage::{
    backend, Backend, BackendConfig, Compactor, CompactorConfig, MvccConfig, MvccStore,
};
use crate::watch::{WatchConfig, WatchableStore};

/// Configuration for the whole storage core.
#[derive(Clone, Debug)]
pub struct CoreConfig {
    pub backend: BackendConfig,

    pub mvcc: MvccConfig,

    pub watch: WatchConfig,

    pub quota: QuotaConfig,

    pub compactor: CompactorConfig,

    /// Member id recorded on alarms raised by this node.
    pub member_id: u64,

    /// Capacity of the apply request queue.
    pub apply_queue: usize,
}

impl CoreConfig {
    /// Defaults with the backend stored under `data_dir`.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            backend: BackendConfig {
                data_dir: data_dir.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            mvcc: MvccConfig::default(),
            watch: WatchConfig::default(),
            quota: QuotaConfig::default(),
            compactor: CompactorConfig::default(),
            member_id: 1,
            apply_queue: 10_000,
        }
    }
}

/// The assembled storage core.
///
/// Reads and watches go straight to [`WatchableStore`]; writes should be sent
/// through [`KvCore::apply_handle`] so they pass quota arbitration in order.
pub struct KvCore {
    config: CoreConfig,
    backend: Arc<Backend>,
    store: Arc<WatchableStore>,
    lease_mgr: Arc<LeaseManager>,
    alarms: Arc<AlarmStore>,
    applier: Arc<dyn Applier>,
    apply: ApplyHandle,
    background_tasks: Vec<JoinHandle<()>>,
}

impl KvCore {
    /// Opens (or recovers) the store and starts the background tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn open(config: CoreConfig) -> anyhow::Result<Self> {
        info!(
            data_dir = %config.backend.data_dir.display(),
            member_id = config.member_id,
            "Initializing storage core"
        );

        // 1. Backend
        let backend = Backend::new(config.backend.clone())
            .map_err(|e| anyhow::anyhow!("Failed to initialize backend: {}", e))?;
        info!("Backend storage initialized");

        // 2. Lease manager (with expiry channel)
        let (expire_tx, expire_rx) = mpsc::channel(1000);
        let lease_mgr = Arc::new(LeaseManager::new(expire_tx));
        let lessor: Arc<dyn Lessor> = lease_mgr.clone();
        info!("Lease manager initialized");

        // 3. MVCC store, restored from the backend
        let mvcc = MvccStore::new(backend.clone(), config.mvcc.clone(), Some(lessor.clone()))
            .map_err(|e| anyhow::anyhow!("Failed to initialize MVCC store: {}", e))?;
        info!(
            revision = mvcc.current_revision(),
            compact_revision = mvcc.compact_revision(),
            "MVCC store initialized"
        );

        // 4. Watchable store
        let (store, dispatcher) = WatchableStore::new(mvcc.clone(), config.watch.clone());
        info!("Watchable store initialized");

        // 5. Alarms and the apply chain
        let alarms = Arc::new(
            AlarmStore::new(backend.clone())
                .map_err(|e| anyhow::anyhow!("Failed to load alarms: {}", e))?,
        );
        let quota = BackendQuota::new(backend.clone(), &config.quota);
        info!(quota_bytes = quota.limit(), "Backend quota configured");
        let applier = apply::arbitrate(
            BackendApplier::new(store.clone(), lessor, alarms.clone()),
            quota,
            alarms.clone(),
            config.member_id,
        );

        // 6. Auto compactor feeding the apply loop
        let (compact_tx, compact_rx) = mpsc::channel(16);
        let compactor = Compactor::new(mvcc, &config.compactor, compact_tx)?;

        let (apply, apply_loop) =
            ApplyLoop::new(applier.clone(), config.apply_queue, expire_rx, compact_rx);

        let mut core = Self {
            config,
            backend,
            store,
            lease_mgr,
            alarms,
            applier,
            apply,
            background_tasks: vec![dispatcher],
        };

        core.background_tasks
            .push(tokio::spawn(backend::run_committer(core.backend.clone())));
        core.background_tasks
            .push(tokio::spawn(core.lease_mgr.clone().run_expiry_loop()));
        core.background_tasks.push(compactor.run());
        core.background_tasks.push(tokio::spawn(apply_loop.run()));

        info!("Storage core initialization complete");
        Ok(core)
    }

    /// Handle for submitting writes to the apply loop.
    pub fn apply_handle(&self) -> ApplyHandle {
        self.apply.clone()
    }

    /// The apply chain, for callers that already serialize their writes.
    pub fn applier(&self) -> Arc<dyn Applier> {
        self.applier.clone()
    }

    pub fn store(&self) -> Arc<WatchableStore> {
        self.store.clone()
    }

    pub fn backend(&self) -> Arc<Backend> {
        self.backend.clone()
    }

    pub fn lease_mgr(&self) -> Arc<LeaseManager> {
        self.lease_mgr.clone()
    }

    pub fn alarms(&self) -> Arc<AlarmStore> {
        self.alarms.clone()
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Stops the background tasks and flushes pending writes.
    pub async fn shutdown(mut self) -> anyhow::Result<()> {
        info!("Storage core shutting down");
        for task in self.background_tasks.drain(..) {
            task.abort();
            // Cancellation is the expected outcome here.
            if let Err(e) = task.await {
                if e.is_panic() {
                    anyhow::bail!("Background task panicked: {}", e);
                }
            }
        }
        let backend = self.backend.clone();
        tokio::task::spawn_blocking(move || backend.commit()).await?;
        info!("Storage core stopped");
        Ok(())
    }
}

/// Installs the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `level` when set.
pub fn init_tracing(level: &str) -> anyhow::Result<()> {
    let directive = match level.to_lowercase().as_str() {
        "trace" => "rusd_mvcc=trace",
        "debug" => "rusd_mvcc=debug",
        "info" => "rusd_mvcc=info",
        "warn" => "rusd_mvcc=warn",
        "error" => "rusd_mvcc=error",
        other => anyhow::bail!("Invalid log level: {}", other),
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {}", e))
}
