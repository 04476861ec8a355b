//! Per-dataset cells and the collection pass over them
//!
//! Each dataset owns a `DatasetCell`: its snapshot cache, its staleness
//! thresholds and refresh counters. `DatasetCollector::collect_all` walks
//! the cells in refresh order and refreshes each one independently; a
//! failed fetch or decode leaves that cell's value and timestamp as they
//! were.

use crate::cache::{Origin, SnapshotCache, from_unix_millis, unix_millis};
use crate::dataset::{Dataset, DecodeContext};
use crate::persist::PersistedEntry;
use crate::rpc::RpcClient;
use crate::staleness::{Staleness, StalenessThresholds};
use mastermind_common::{
    BadGroups, CachedKeys, ControllerConfig, DatasetKind, EllipticsRemotes, Error,
    FakeGroupsInfo, NamespaceSettingsList, NamespaceStates, Result,
};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

/// Refresh counters of one dataset
#[derive(Debug, Default)]
pub struct RefreshStats {
    successes: AtomicU64,
    failures: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl RefreshStats {
    fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
    }

    fn record_failure(&self, error: &Error) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock() = Some(error.to_string());
    }

    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }
}

/// Point-in-time report on one dataset
#[derive(Clone, Debug, Serialize)]
pub struct DatasetStatus {
    pub dataset: DatasetKind,
    pub origin: Origin,
    pub updated_at_ms: u64,
    pub age_secs: u64,
    pub staleness: Staleness,
    pub successes: u64,
    pub failures: u64,
    pub last_error: Option<String>,
}

/// Cache, thresholds and counters of one dataset
pub struct DatasetCell<T> {
    cache: SnapshotCache<T>,
    thresholds: StalenessThresholds,
    stats: RefreshStats,
}

impl<T: Dataset> DatasetCell<T> {
    /// Cell holding the fallback value
    pub fn new(thresholds: StalenessThresholds) -> Self {
        Self {
            cache: SnapshotCache::fallback(),
            thresholds,
            stats: RefreshStats::default(),
        }
    }

    pub fn cache(&self) -> &SnapshotCache<T> {
        &self.cache
    }

    pub fn read(&self) -> Arc<T> {
        self.cache.read()
    }

    pub fn stats(&self) -> &RefreshStats {
        &self.stats
    }
}

/// Type-erased view of a `DatasetCell` used by the collection pass,
/// staleness evaluation and persistence
pub trait DatasetSlot: Send + Sync {
    fn kind(&self) -> DatasetKind;

    /// Fetch, decode and publish one fresh value
    fn collect(&self, rpc: &RpcClient, ctx: &DecodeContext) -> Result<()>;

    fn origin(&self) -> Origin;

    fn age(&self) -> Duration;

    fn thresholds(&self) -> StalenessThresholds;

    fn status(&self) -> DatasetStatus;

    /// The value as stored on disk; `None` while only the fallback is held
    fn to_persisted(&self) -> Result<Option<PersistedEntry>>;

    /// Prime the cell from disk, keeping the stored timestamp
    fn restore(&self, entry: &PersistedEntry) -> Result<()>;
}

impl<T: Dataset> DatasetSlot for DatasetCell<T> {
    fn kind(&self) -> DatasetKind {
        T::KIND
    }

    fn collect(&self, rpc: &RpcClient, ctx: &DecodeContext) -> Result<()> {
        let outcome = rpc
            .invoke(T::KIND.event(), &Value::Null)
            .and_then(|raw| T::decode(raw, ctx));
        match outcome {
            Ok(value) => {
                self.cache.swap(value);
                self.stats.record_success();
                Ok(())
            }
            Err(e) => {
                self.stats.record_failure(&e);
                Err(e)
            }
        }
    }

    fn origin(&self) -> Origin {
        self.cache.origin()
    }

    fn age(&self) -> Duration {
        self.cache.age()
    }

    fn thresholds(&self) -> StalenessThresholds {
        self.thresholds
    }

    fn status(&self) -> DatasetStatus {
        let snapshot = self.cache.snapshot();
        let age = snapshot.age_at(SystemTime::now());
        DatasetStatus {
            dataset: T::KIND,
            origin: snapshot.origin,
            updated_at_ms: unix_millis(snapshot.updated_at),
            age_secs: age.as_secs(),
            staleness: self.thresholds.classify(age),
            successes: self.stats.successes(),
            failures: self.stats.failures(),
            last_error: self.stats.last_error(),
        }
    }

    fn to_persisted(&self) -> Result<Option<PersistedEntry>> {
        let snapshot = self.cache.snapshot();
        if snapshot.origin == Origin::Fallback {
            return Ok(None);
        }
        Ok(Some(PersistedEntry {
            value: serde_json::to_value(&*snapshot.value)?,
            timestamp_ms: unix_millis(snapshot.updated_at),
        }))
    }

    fn restore(&self, entry: &PersistedEntry) -> Result<()> {
        let value: T =
            serde_json::from_value(entry.value.clone()).map_err(|e| Error::decode(T::KIND, e))?;
        self.cache
            .replace(value, from_unix_millis(entry.timestamp_ms), Origin::Disk);
        Ok(())
    }
}

/// The fixed set of datasets one controller mirrors
pub struct Datasets {
    pub elliptics_remotes: DatasetCell<EllipticsRemotes>,
    pub namespace_settings: DatasetCell<NamespaceSettingsList>,
    pub namespace_states: DatasetCell<NamespaceStates>,
    pub cached_keys: DatasetCell<CachedKeys>,
    pub bad_groups: DatasetCell<BadGroups>,
    pub fake_groups_info: DatasetCell<FakeGroupsInfo>,
}

impl Datasets {
    /// Fallback cells with thresholds taken from `config`
    pub fn new(config: &ControllerConfig) -> Self {
        let t = |kind| StalenessThresholds::from(config.thresholds_for(kind));
        Self {
            elliptics_remotes: DatasetCell::new(t(DatasetKind::EllipticsRemotes)),
            namespace_settings: DatasetCell::new(t(DatasetKind::NamespaceSettings)),
            namespace_states: DatasetCell::new(t(DatasetKind::NamespaceStates)),
            cached_keys: DatasetCell::new(t(DatasetKind::CachedKeys)),
            bad_groups: DatasetCell::new(t(DatasetKind::BadGroups)),
            fake_groups_info: DatasetCell::new(t(DatasetKind::FakeGroupsInfo)),
        }
    }

    pub fn slot(&self, kind: DatasetKind) -> &dyn DatasetSlot {
        match kind {
            DatasetKind::EllipticsRemotes => &self.elliptics_remotes,
            DatasetKind::NamespaceSettings => &self.namespace_settings,
            DatasetKind::NamespaceStates => &self.namespace_states,
            DatasetKind::CachedKeys => &self.cached_keys,
            DatasetKind::BadGroups => &self.bad_groups,
            DatasetKind::FakeGroupsInfo => &self.fake_groups_info,
        }
    }

    /// All cells in refresh order
    pub fn slots(&self) -> impl Iterator<Item = &dyn DatasetSlot> + '_ {
        DatasetKind::ALL.into_iter().map(move |kind| self.slot(kind))
    }
}

/// Outcome of one collection pass
#[derive(Debug, Default)]
pub struct CollectReport {
    pub refreshed: Vec<DatasetKind>,
    pub failed: Vec<(DatasetKind, Error)>,
}

impl CollectReport {
    pub fn any_refreshed(&self) -> bool {
        !self.refreshed.is_empty()
    }
}

/// Drives one refresh of every dataset through the shared `RpcClient`
pub struct DatasetCollector {
    rpc: Arc<RpcClient>,
    ctx: DecodeContext,
}

impl DatasetCollector {
    pub fn new(rpc: Arc<RpcClient>, ctx: DecodeContext) -> Self {
        Self { rpc, ctx }
    }

    pub fn collect_all(&self, datasets: &Datasets) -> CollectReport {
        let mut report = CollectReport::default();
        for slot in datasets.slots() {
            let kind = slot.kind();
            match slot.collect(&self.rpc, &self.ctx) {
                Ok(()) => {
                    debug!("Refreshed dataset {}", kind);
                    report.refreshed.push(kind);
                }
                Err(e) => {
                    warn!("Failed to refresh dataset {}, keeping previous value: {}", kind, e);
                    report.failed.push((kind, e));
                }
            }
        }
        report
    }
}
