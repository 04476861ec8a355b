//! Staleness classification of dataset ages

use derive_more::Display;
use mastermind_common::{DatasetKind, ThresholdConfig};
use serde::Serialize;
use std::time::Duration;
use tracing::{error, info, warn};

/// Age class of a dataset against its thresholds
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Display)]
#[serde(rename_all = "kebab-case")]
pub enum Staleness {
    #[display("fresh")]
    Fresh,
    /// Past the preferable age; informational only
    #[display("aging")]
    Aging,
    #[display("stale-warning")]
    StaleWarning,
    #[display("expired")]
    Expired,
}

impl Staleness {
    pub fn is_expired(self) -> bool {
        self == Self::Expired
    }
}

/// Ordered `preferable < warning < expire` boundaries
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StalenessThresholds {
    pub preferable: Option<Duration>,
    pub warning: Duration,
    pub expire: Duration,
}

impl From<ThresholdConfig> for StalenessThresholds {
    fn from(config: ThresholdConfig) -> Self {
        Self {
            preferable: config.preferable_secs.map(Duration::from_secs),
            warning: Duration::from_secs(config.warning_secs),
            expire: Duration::from_secs(config.expire_secs),
        }
    }
}

impl StalenessThresholds {
    pub fn classify(&self, age: Duration) -> Staleness {
        if age >= self.expire {
            Staleness::Expired
        } else if age >= self.warning {
            Staleness::StaleWarning
        } else if self.preferable.is_some_and(|p| age >= p) {
            Staleness::Aging
        } else {
            Staleness::Fresh
        }
    }
}

/// Aggregates per-dataset classifications into the cache-wide expired flag
#[derive(Debug, Default)]
pub struct StalenessTracker;

impl StalenessTracker {
    /// Classify and log every `(kind, age, thresholds)`; returns true if
    /// any dataset is expired
    pub fn evaluate<I>(&self, datasets: I) -> bool
    where
        I: IntoIterator<Item = (DatasetKind, Duration, StalenessThresholds)>,
    {
        let mut expired = false;
        for (kind, age, thresholds) in datasets {
            let class = thresholds.classify(age);
            match class {
                Staleness::Fresh => {}
                Staleness::Aging => {
                    info!("Dataset {} is aging: {}s old", kind, age.as_secs());
                }
                Staleness::StaleWarning => {
                    warn!(
                        "Dataset {} is stale: {}s old (expires at {}s)",
                        kind,
                        age.as_secs(),
                        thresholds.expire.as_secs()
                    );
                }
                Staleness::Expired => {
                    error!(
                        "Dataset {} has expired: {}s old (limit {}s)",
                        kind,
                        age.as_secs(),
                        thresholds.expire.as_secs()
                    );
                }
            }
            expired |= class.is_expired();
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> StalenessThresholds {
        StalenessThresholds {
            preferable: Some(Duration::from_secs(60)),
            warning: Duration::from_secs(120),
            expire: Duration::from_secs(300),
        }
    }

    #[test]
    fn test_classify_boundaries() {
        let t = thresholds();
        assert_eq!(t.classify(Duration::from_secs(10)), Staleness::Fresh);
        assert_eq!(t.classify(Duration::from_secs(60)), Staleness::Aging);
        assert_eq!(t.classify(Duration::from_secs(120)), Staleness::StaleWarning);
        assert_eq!(t.classify(Duration::from_secs(250)), Staleness::StaleWarning);
        assert_eq!(t.classify(Duration::from_secs(300)), Staleness::Expired);
        assert_eq!(t.classify(Duration::from_secs(310)), Staleness::Expired);
    }

    #[test]
    fn test_without_preferable_never_aging() {
        let t = StalenessThresholds {
            preferable: None,
            ..thresholds()
        };
        assert_eq!(t.classify(Duration::from_secs(100)), Staleness::Fresh);
    }

    #[test]
    fn test_expired_flag_is_or_across_datasets() {
        let tracker = StalenessTracker;
        let t = thresholds();

        assert!(!tracker.evaluate([
            (DatasetKind::BadGroups, Duration::from_secs(250), t),
            (DatasetKind::CachedKeys, Duration::from_secs(5), t),
        ]));
        assert!(tracker.evaluate([
            (DatasetKind::BadGroups, Duration::from_secs(310), t),
            (DatasetKind::CachedKeys, Duration::from_secs(5), t),
        ]));
    }

    #[test]
    fn test_from_config() {
        let t = StalenessThresholds::from(ThresholdConfig {
            preferable_secs: Some(30),
            warning_secs: 600,
            expire_secs: 3600,
        });
        assert_eq!(t.preferable, Some(Duration::from_secs(30)));
        assert_eq!(t.classify(Duration::from_secs(3600)), Staleness::Expired);
    }
}
