//! Atomically swapped snapshot cells
//!
//! A `SnapshotCache` holds one immutable value behind an `Arc` together with
//! the time it was produced. Readers copy the `Arc` under a short lock and
//! keep using it after later swaps; the old value is freed once the last
//! reader drops its handle.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Where the current value of a cell came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Synthetic default, never confirmed by the remote
    Fallback,
    /// Loaded from the snapshot file
    Disk,
    /// Fetched from the remote service
    Remote,
}

/// A consistent view of a cell: value, timestamp and origin together
#[derive(Debug)]
pub struct Snapshot<T> {
    pub value: Arc<T>,
    pub updated_at: SystemTime,
    pub origin: Origin,
}

impl<T> Clone for Snapshot<T> {
    fn clone(&self) -> Self {
        Self {
            value: Arc::clone(&self.value),
            updated_at: self.updated_at,
            origin: self.origin,
        }
    }
}

impl<T> Snapshot<T> {
    /// Age of the snapshot at `now` (zero if the clock went backwards)
    #[must_use]
    pub fn age_at(&self, now: SystemTime) -> Duration {
        now.duration_since(self.updated_at).unwrap_or(Duration::ZERO)
    }
}

/// Timestamped holder of one immutable dataset value
pub struct SnapshotCache<T> {
    entry: Mutex<Snapshot<T>>,
}

impl<T: Default> SnapshotCache<T> {
    /// Cell holding the default value, already as old as it can be
    #[must_use]
    pub fn fallback() -> Self {
        Self::with_value(T::default(), UNIX_EPOCH, Origin::Fallback)
    }
}

impl<T> SnapshotCache<T> {
    /// Create a cell with an explicit value, timestamp and origin
    pub fn with_value(value: T, updated_at: SystemTime, origin: Origin) -> Self {
        Self {
            entry: Mutex::new(Snapshot {
                value: Arc::new(value),
                updated_at: truncate_to_millis(updated_at),
                origin,
            }),
        }
    }

    /// Handle to the current value
    pub fn read(&self) -> Arc<T> {
        Arc::clone(&self.entry.lock().value)
    }

    /// Value, timestamp and origin read under one lock
    pub fn snapshot(&self) -> Snapshot<T> {
        self.entry.lock().clone()
    }

    /// Publish a freshly fetched value, returning the previous one
    pub fn swap(&self, value: T) -> Arc<T> {
        self.replace(value, SystemTime::now(), Origin::Remote)
    }

    /// Publish a value with a known timestamp (used when priming from disk)
    pub fn replace(&self, value: T, updated_at: SystemTime, origin: Origin) -> Arc<T> {
        let mut fresh = Arc::new(value);
        let updated_at = truncate_to_millis(updated_at);
        let mut entry = self.entry.lock();
        std::mem::swap(&mut entry.value, &mut fresh);
        entry.updated_at = updated_at;
        entry.origin = origin;
        fresh
    }

    pub fn updated_at(&self) -> SystemTime {
        self.entry.lock().updated_at
    }

    pub fn origin(&self) -> Origin {
        self.entry.lock().origin
    }

    /// Age of the current value against the wall clock
    pub fn age(&self) -> Duration {
        self.snapshot().age_at(SystemTime::now())
    }

    /// Check the current value against an expiry threshold
    pub fn is_expired(&self, expire: Duration) -> bool {
        self.age() >= expire
    }
}

/// Milliseconds since the Unix epoch (the precision kept on disk)
#[must_use]
pub fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Inverse of `unix_millis`
#[must_use]
pub fn from_unix_millis(millis: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(millis)
}

fn truncate_to_millis(time: SystemTime) -> SystemTime {
    from_unix_millis(unix_millis(time))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct Pair {
        left: Vec<u64>,
        right: Vec<u64>,
    }

    #[test]
    fn test_fallback_is_expired() {
        let cache: SnapshotCache<Vec<u32>> = SnapshotCache::fallback();
        assert_eq!(cache.origin(), Origin::Fallback);
        assert_eq!(cache.updated_at(), UNIX_EPOCH);
        assert!(cache.is_expired(Duration::from_secs(3600)));
        assert!(cache.read().is_empty());
    }

    #[test]
    fn test_swap_records_timestamp() {
        let cache: SnapshotCache<Vec<u32>> = SnapshotCache::fallback();
        let before = truncate_to_millis(SystemTime::now());
        let previous = cache.swap(vec![1, 2, 3]);

        assert!(previous.is_empty());
        assert_eq!(*cache.read(), vec![1, 2, 3]);
        assert_eq!(cache.origin(), Origin::Remote);
        assert!(cache.updated_at() >= before);
        assert!(!cache.is_expired(Duration::from_secs(60)));
    }

    #[test]
    fn test_reader_handle_survives_swap() {
        let cache = SnapshotCache::with_value(vec![1u32], SystemTime::now(), Origin::Remote);
        let old = cache.read();
        cache.swap(vec![2]);

        assert_eq!(*old, vec![1]);
        assert_eq!(*cache.read(), vec![2]);
        assert_eq!(Arc::strong_count(&old), 1);
    }

    #[test]
    fn test_replace_keeps_millisecond_timestamp() {
        let cache: SnapshotCache<u32> = SnapshotCache::fallback();
        let at = from_unix_millis(1_700_000_000_123);
        cache.replace(7, at, Origin::Disk);

        let snap = cache.snapshot();
        assert_eq!(*snap.value, 7);
        assert_eq!(snap.updated_at, at);
        assert_eq!(snap.origin, Origin::Disk);
        assert_eq!(unix_millis(snap.updated_at), 1_700_000_000_123);
    }

    #[test]
    fn test_age_never_negative() {
        let future = SystemTime::now() + Duration::from_secs(600);
        let cache = SnapshotCache::with_value(0u8, future, Origin::Remote);
        assert_eq!(cache.age(), Duration::ZERO);
    }

    #[test]
    fn test_concurrent_readers_see_whole_values() {
        let cache = SnapshotCache::<Pair>::fallback();
        let done = AtomicBool::new(false);

        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    while !done.load(Ordering::Relaxed) {
                        let pair = cache.read();
                        assert_eq!(pair.left, pair.right);
                    }
                });
            }

            for i in 0..2000u64 {
                let items: Vec<u64> = (0..(i % 17)).map(|n| n * i).collect();
                cache.swap(Pair {
                    left: items.clone(),
                    right: items,
                });
            }
            done.store(true, Ordering::Relaxed);
        });
    }
}
