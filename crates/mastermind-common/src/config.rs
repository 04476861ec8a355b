//! Configuration types for the mastermind client
//!
//! `ControllerConfig` is read from a TOML file; every key is optional and
//! falls back to the defaults below. Call `validate()` before use.

use crate::error::{Error, Result};
use crate::types::{DatasetKind, RemoteEndpoint};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Staleness thresholds of one dataset, in seconds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    /// Soft threshold, only logged
    pub preferable_secs: Option<u64>,
    /// Age at which the dataset is reported as stale
    pub warning_secs: u64,
    /// Age at which the dataset counts as expired
    pub expire_secs: u64,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            preferable_secs: None,
            warning_secs: 600,
            expire_secs: 3600,
        }
    }
}

impl ThresholdConfig {
    /// Check that preferable < warning < expire
    pub fn validate(&self) -> Result<()> {
        if self.warning_secs == 0 {
            return Err(Error::configuration("warning threshold must be positive"));
        }
        if self.warning_secs >= self.expire_secs {
            return Err(Error::configuration(format!(
                "warning threshold ({}s) must be below expire threshold ({}s)",
                self.warning_secs, self.expire_secs
            )));
        }
        if let Some(preferable) = self.preferable_secs
            && preferable >= self.warning_secs
        {
            return Err(Error::configuration(format!(
                "preferable threshold ({}s) must be below warning threshold ({}s)",
                preferable, self.warning_secs
            )));
        }
        Ok(())
    }
}

/// Root configuration of a controller
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Remote service instances, `host:port[:family]`
    pub remotes: Vec<String>,
    /// Name of the remote application every request addresses
    pub worker_name: String,
    /// Refresh period
    pub update_period_secs: u64,
    /// Bound on one RPC attempt
    pub enqueue_timeout_ms: u64,
    /// Bound on one connection attempt
    pub reconnect_timeout_ms: u64,
    /// Snapshot file; persistence is disabled when unset
    pub cache_path: Option<PathBuf>,
    /// Start the refresh loop during construction
    pub auto_start: bool,
    /// Default staleness thresholds
    pub thresholds: ThresholdConfig,
    /// Per-dataset threshold overrides keyed by dataset name
    pub datasets: BTreeMap<String, ThresholdConfig>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            remotes: Vec::new(),
            worker_name: "mastermind".to_string(),
            update_period_secs: 60,
            enqueue_timeout_ms: 4000,
            reconnect_timeout_ms: 4000,
            cache_path: None,
            auto_start: true,
            thresholds: ThresholdConfig::default(),
            datasets: BTreeMap::new(),
        }
    }
}

impl ControllerConfig {
    /// Create a configuration for the given remotes with default settings
    pub fn with_remotes<I, S>(remotes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            remotes: remotes.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Parse a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::configuration(e.to_string()))
    }

    /// Load a TOML configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    /// Reject configurations the controller cannot run with
    pub fn validate(&self) -> Result<()> {
        self.endpoints()?;
        if self.worker_name.trim().is_empty() {
            return Err(Error::configuration("worker_name must not be empty"));
        }
        if self.update_period_secs == 0 {
            return Err(Error::configuration("update_period_secs must be positive"));
        }
        if self.enqueue_timeout_ms == 0 {
            return Err(Error::configuration("enqueue_timeout_ms must be positive"));
        }
        if self.reconnect_timeout_ms == 0 {
            return Err(Error::configuration("reconnect_timeout_ms must be positive"));
        }
        self.thresholds.validate()?;
        for (name, thresholds) in &self.datasets {
            name.parse::<DatasetKind>().map_err(Error::configuration)?;
            thresholds
                .validate()
                .map_err(|e| Error::configuration(format!("dataset '{name}': {e}")))?;
        }
        Ok(())
    }

    /// Parse the remote list, failing on an empty or malformed list
    pub fn endpoints(&self) -> Result<Vec<RemoteEndpoint>> {
        if self.remotes.is_empty() {
            return Err(Error::configuration("remote list is empty"));
        }
        self.remotes
            .iter()
            .map(|r| {
                r.parse::<RemoteEndpoint>()
                    .map_err(|e| Error::configuration(format!("remote '{r}': {e}")))
            })
            .collect()
    }

    /// Thresholds for a dataset, with overrides applied
    #[must_use]
    pub fn thresholds_for(&self, kind: DatasetKind) -> ThresholdConfig {
        self.datasets
            .get(kind.name())
            .copied()
            .unwrap_or(self.thresholds)
    }

    #[must_use]
    pub fn update_period(&self) -> Duration {
        Duration::from_secs(self.update_period_secs)
    }

    #[must_use]
    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.enqueue_timeout_ms)
    }

    #[must_use]
    pub fn reconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.reconnect_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_need_remotes() {
        let config = ControllerConfig::default();
        let err = config.validate().unwrap_err();
        assert!(err.is_configuration());

        let config = ControllerConfig::with_remotes(["meta01:10053"]);
        assert!(config.validate().is_ok());
        assert_eq!(config.enqueue_timeout(), Duration::from_secs(4));
    }

    #[test]
    fn test_parse_toml() {
        let config = ControllerConfig::from_toml_str(
            r#"
            remotes = ["meta01:10053:2", "meta02:10053"]
            worker_name = "mastermind2"
            update_period_secs = 30
            cache_path = "/var/cache/mastermind/cache.json"

            [thresholds]
            preferable_secs = 60
            warning_secs = 120
            expire_secs = 300

            [datasets.cached-keys]
            warning_secs = 1800
            expire_secs = 7200
            "#,
        )
        .unwrap();

        assert!(config.validate().is_ok());
        assert_eq!(config.endpoints().unwrap().len(), 2);
        assert_eq!(config.update_period(), Duration::from_secs(30));
        assert!(config.auto_start);

        let keys = config.thresholds_for(DatasetKind::CachedKeys);
        assert_eq!(keys.expire_secs, 7200);
        assert_eq!(keys.preferable_secs, None);
        let states = config.thresholds_for(DatasetKind::NamespaceStates);
        assert_eq!(states.preferable_secs, Some(60));
    }

    #[test]
    fn test_invalid_thresholds() {
        let mut config = ControllerConfig::with_remotes(["meta01:10053"]);
        config.thresholds.warning_secs = 300;
        config.thresholds.expire_secs = 300;
        assert!(config.validate().is_err());

        let mut config = ControllerConfig::with_remotes(["meta01:10053"]);
        config.thresholds.preferable_secs = Some(600);
        assert!(config.validate().is_err());

        let mut config = ControllerConfig::with_remotes(["meta01:10053"]);
        config
            .datasets
            .insert("metabalancer-info".into(), ThresholdConfig::default());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_remote() {
        let config = ControllerConfig::with_remotes(["meta01"]);
        assert!(config.endpoints().is_err());

        let mut config = ControllerConfig::with_remotes(["meta01:10053"]);
        config.update_period_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "remotes = [\"127.0.0.1:10053\"]").unwrap();
        writeln!(file, "auto_start = false").unwrap();

        let config = ControllerConfig::load(file.path()).unwrap();
        assert!(!config.auto_start);
        assert_eq!(config.worker_name, "mastermind");

        assert!(ControllerConfig::load("/nonexistent/mastermind.toml").is_err());
    }
}
