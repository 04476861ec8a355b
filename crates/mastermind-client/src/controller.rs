//! The controller: the one object application code holds
//!
//! A `Controller` owns the RPC client, the dataset cells, the optional
//! snapshot store, the callback slot and the refresh scheduler. Getters
//! only read the cells and never touch the network.

use crate::callback::{CallbackSlot, UpdateCallback};
use crate::cache::{Origin, unix_millis};
use crate::collector::{DatasetCollector, DatasetStatus, Datasets};
use crate::dataset::{DecodeContext, SettingsExtension};
use crate::endpoint::EndpointPool;
use crate::persist::{PersistedSnapshot, PersistenceStore};
use crate::rpc::{Connector, RpcClient};
use crate::scheduler::{RefreshCycle, RefreshScheduler, SchedulerPhase};
use crate::staleness::StalenessTracker;
use crate::transport::TcpConnector;
use mastermind_common::{
    BadGroups, CachedKeys, ControllerConfig, CoupleInfo, EllipticsRemotes, FakeGroupsInfo,
    NamespaceSettings, NamespaceSettingsList, NamespaceState, NamespaceStates, RemoteEndpoint,
    Result,
};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// Event of the direct couple lookup
pub const COUPLE_INFO_EVENT: &str = "fetch-couple-info";

/// Builder for `Controller`
pub struct ControllerBuilder {
    config: ControllerConfig,
    connector: Option<Arc<dyn Connector>>,
    extension: Option<Arc<dyn SettingsExtension>>,
}

impl ControllerBuilder {
    pub fn new(config: ControllerConfig) -> Self {
        Self {
            config,
            connector: None,
            extension: None,
        }
    }

    /// Replace the TCP transport
    #[must_use]
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Hook run on every decoded namespace
    #[must_use]
    pub fn settings_extension(mut self, extension: impl SettingsExtension + 'static) -> Self {
        self.extension = Some(Arc::new(extension));
        self
    }

    /// Validate the configuration, prime the caches and start if configured
    pub fn build(self) -> Result<Controller> {
        let config = self.config;
        config.validate()?;

        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(TcpConnector::new(config.worker_name.clone())));
        let pool = EndpointPool::new(config.endpoints()?, connector, config.reconnect_timeout())?;
        let rpc = Arc::new(RpcClient::new(pool, config.enqueue_timeout()));
        let collector = DatasetCollector::new(Arc::clone(&rpc), DecodeContext::new(self.extension));

        let core = Arc::new(ControllerCore {
            worker_name: config.worker_name.clone(),
            rpc,
            datasets: Datasets::new(&config),
            collector,
            tracker: StalenessTracker,
            persistence: config.cache_path.clone().map(PersistenceStore::new),
            callbacks: CallbackSlot::new(),
            expired: AtomicBool::new(true),
            cycles: AtomicU64::new(0),
        });
        core.prime_from_disk();
        core.evaluate_staleness();

        let controller = Controller {
            core,
            scheduler: RefreshScheduler::new(config.update_period()),
        };
        info!(
            "Mastermind controller created for '{}' with {} remotes",
            config.worker_name,
            config.remotes.len()
        );

        if config.auto_start {
            controller.start()?;
        }
        Ok(controller)
    }
}

struct ControllerCore {
    worker_name: String,
    rpc: Arc<RpcClient>,
    datasets: Datasets,
    collector: DatasetCollector,
    tracker: StalenessTracker,
    persistence: Option<PersistenceStore>,
    callbacks: CallbackSlot,
    expired: AtomicBool,
    cycles: AtomicU64,
}

impl ControllerCore {
    fn evaluate_staleness(&self) -> bool {
        let expired = self.tracker.evaluate(
            self.datasets
                .slots()
                .map(|slot| (slot.kind(), slot.age(), slot.thresholds())),
        );
        self.expired.store(expired, Ordering::SeqCst);
        expired
    }

    fn prime_from_disk(&self) {
        let Some(store) = &self.persistence else {
            return;
        };
        let snapshot = match store.load() {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                info!("No snapshot at {}, starting empty", store.path().display());
                return;
            }
            Err(e) => {
                warn!("Ignoring unreadable snapshot, starting empty: {}", e);
                return;
            }
        };

        let mut restored = 0;
        for slot in self.datasets.slots() {
            let kind = slot.kind();
            match snapshot.entry(kind) {
                Some(entry) => match slot.restore(entry) {
                    Ok(()) => restored += 1,
                    Err(e) => warn!("Ignoring stored {}: {}", kind, e),
                },
                None => debug!("Snapshot has no entry for {}", kind),
            }
        }
        info!(
            "Restored {} datasets from {}",
            restored,
            store.path().display()
        );
    }

    fn persist(&self) {
        let Some(store) = &self.persistence else {
            return;
        };
        let mut snapshot =
            PersistedSnapshot::new(self.worker_name.clone(), unix_millis(SystemTime::now()));
        for slot in self.datasets.slots() {
            match slot.to_persisted() {
                Ok(Some(entry)) => snapshot.insert(slot.kind(), entry),
                Ok(None) => {}
                Err(e) => warn!("Cannot serialize {}: {}", slot.kind(), e),
            }
        }
        if let Err(e) = store.save(&snapshot) {
            warn!("Failed to save snapshot: {}", e);
        }
    }
}

impl RefreshCycle for ControllerCore {
    fn run_cycle(&self) {
        let report = self.collector.collect_all(&self.datasets);
        let expired = self.evaluate_staleness();
        if report.any_refreshed() {
            self.persist();
        }
        let cycle = self.cycles.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            "Refresh cycle {} done: {} refreshed, {} failed, expired={}",
            cycle,
            report.refreshed.len(),
            report.failed.len(),
            expired
        );
        self.callbacks.notify(expired);
    }
}

/// Client-side mirror of the remote metadata service
pub struct Controller {
    core: Arc<ControllerCore>,
    scheduler: RefreshScheduler,
}

impl Controller {
    /// Build a controller with the TCP transport
    pub fn new(config: ControllerConfig) -> Result<Self> {
        ControllerBuilder::new(config).build()
    }

    pub fn builder(config: ControllerConfig) -> ControllerBuilder {
        ControllerBuilder::new(config)
    }

    /// Run one refresh cycle now and start the background loop
    ///
    /// Does nothing if already running.
    pub fn start(&self) -> Result<()> {
        let cycle: Arc<dyn RefreshCycle> = self.core.clone();
        self.scheduler.start(cycle)?;
        Ok(())
    }

    /// Stop the background loop; does nothing if not running
    pub fn stop(&self) {
        self.scheduler.stop();
    }

    pub fn is_running(&self) -> bool {
        self.scheduler.is_running()
    }

    pub fn phase(&self) -> SchedulerPhase {
        self.scheduler.phase()
    }

    /// True once any dataset holds a value from the remote or from disk
    pub fn is_valid(&self) -> bool {
        self.core
            .datasets
            .slots()
            .any(|slot| slot.origin() != Origin::Fallback)
    }

    /// Wake the background loop for an early refresh
    pub fn cache_force_update(&self) {
        self.scheduler.force_update();
    }

    /// Whether any dataset had expired at the last evaluation
    pub fn cache_is_expired(&self) -> bool {
        self.core.expired.load(Ordering::SeqCst)
    }

    /// Number of completed refresh cycles
    pub fn cycles(&self) -> u64 {
        self.core.cycles.load(Ordering::SeqCst)
    }

    pub fn endpoints(&self) -> &[RemoteEndpoint] {
        self.core.rpc.pool().endpoints()
    }

    pub fn current_remote(&self) -> RemoteEndpoint {
        self.core.rpc.pool().current()
    }

    // ---- Dataset getters ----

    pub fn namespace_states(&self) -> Arc<NamespaceStates> {
        self.core.datasets.namespace_states.read()
    }

    pub fn cached_keys(&self) -> Arc<CachedKeys> {
        self.core.datasets.cached_keys.read()
    }

    pub fn elliptics_remotes(&self) -> Arc<EllipticsRemotes> {
        self.core.datasets.elliptics_remotes.read()
    }

    pub fn namespace_settings(&self) -> Arc<NamespaceSettingsList> {
        self.core.datasets.namespace_settings.read()
    }

    pub fn bad_groups(&self) -> Arc<BadGroups> {
        self.core.datasets.bad_groups.read()
    }

    pub fn fake_groups_info(&self) -> Arc<FakeGroupsInfo> {
        self.core.datasets.fake_groups_info.read()
    }

    pub fn find_namespace_settings(&self, name: &str) -> Option<NamespaceSettings> {
        self.namespace_settings().find(name).cloned()
    }

    pub fn namespace_state(&self, name: &str) -> Option<NamespaceState> {
        self.namespace_states().get(name).cloned()
    }

    /// Cache groups holding `key` in the given couple
    pub fn cached_groups(&self, key: &str, couple_id: u32) -> Option<Vec<u32>> {
        self.cached_keys().groups(key, couple_id).map(<[u32]>::to_vec)
    }

    /// Per-dataset origin, age, staleness and refresh counters
    pub fn dataset_status(&self) -> Vec<DatasetStatus> {
        self.core.datasets.slots().map(|slot| slot.status()).collect()
    }

    // ---- Callbacks ----

    /// Register a callback run after every refresh cycle
    pub fn set_update_callback(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.core
            .callbacks
            .set(UpdateCallback::Plain(Arc::new(callback)));
    }

    /// Register a callback receiving the expired flag after every cycle
    pub fn set_update_callback_with_expiry(&self, callback: impl Fn(bool) + Send + Sync + 'static) {
        self.core
            .callbacks
            .set(UpdateCallback::WithExpiry(Arc::new(callback)));
    }

    // ---- Direct calls ----

    /// Call the remote on the calling thread
    pub fn call(&self, event: &str, payload: &Value) -> Result<Value> {
        self.core.rpc.invoke(event, payload)
    }

    /// Look up the couple a group belongs to
    pub fn couple_info(&self, group_id: u32) -> Result<CoupleInfo> {
        self.core.rpc.call(COUPLE_INFO_EVENT, &group_id)
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.scheduler.stop();
    }
}
