//! Remembers challenge/timestamp pairs that already authenticated a device
//!
//! An entry only has to outlive the timestamp window: once the embedded
//! timestamp is outside the window the verifier rejects it anyway. Entries
//! are kept for twice the window and swept on every insert.

use crate::domain::types::DeviceId;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::debug;

const MAX_RETAIN_SECS: u64 = 86_400;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ReplayKey {
    device: DeviceId,
    challenge: String,
    timestamp: i64,
}

pub struct ReplayCache {
    retain: Duration,
    seen: Mutex<FxHashMap<ReplayKey, DateTime<Utc>>>,
}

impl ReplayCache {
    pub fn new(window_secs: u64) -> Self {
        let retain = Duration::seconds(window_secs.saturating_mul(2).min(MAX_RETAIN_SECS) as i64);
        Self { retain, seen: Mutex::new(FxHashMap::default()) }
    }

    /// Record a use. Returns `false` when the same pair was already used.
    pub fn first_use(
        &self,
        device: DeviceId,
        challenge: &str,
        timestamp: i64,
        now: DateTime<Utc>,
    ) -> bool {
        let key = ReplayKey { device, challenge: challenge.to_ascii_lowercase(), timestamp };
        let mut seen = self.seen.lock();

        let before = seen.len();
        seen.retain(|_, used_at| now.signed_duration_since(*used_at) <= self.retain);
        let swept = before - seen.len();
        if swept > 0 {
            debug!(swept, remaining = seen.len(), "replay_cache_swept");
        }

        if seen.contains_key(&key) {
            return false;
        }
        seen.insert(key, now);
        true
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn test_second_use_rejected() {
        let cache = ReplayCache::new(30);
        assert!(cache.first_use(DeviceId(1), "abcd", 100, at(100)));
        assert!(!cache.first_use(DeviceId(1), "ABCD", 100, at(101)));
    }

    #[test]
    fn test_distinct_pairs_accepted() {
        let cache = ReplayCache::new(30);
        assert!(cache.first_use(DeviceId(1), "abcd", 100, at(100)));
        assert!(cache.first_use(DeviceId(1), "abcd", 101, at(101)));
        assert!(cache.first_use(DeviceId(2), "abcd", 100, at(101)));
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_entries_expire_after_twice_window() {
        let cache = ReplayCache::new(30);
        assert!(cache.first_use(DeviceId(1), "abcd", 100, at(100)));
        assert!(cache.first_use(DeviceId(1), "ffff", 200, at(200)));
        assert_eq!(cache.len(), 1);
    }
}
