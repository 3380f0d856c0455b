//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! All counter updates are lock-free; reporting is the only operation
//! that needs synchronization (via atomic swap).
//!
//! Two read paths: `report()` drains the periodic window for the log line,
//! `totals()` reads the cumulative series for scrapers and resets nothing.
//!
//! NOTE: All atomics use Relaxed ordering. These are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Prometheus-style exponential bucket boundaries (microseconds)
/// Buckets: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200
const BUCKET_BOUNDS: [u64; 10] = [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
const NUM_BUCKETS: usize = 11;

pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_us: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

/// Swap all buckets to zero and return their values
#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
pub(crate) fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    // Upper bounds for each bucket (last bucket uses 2x the previous bound)
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200, 102400];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Lock-free metrics collector
///
/// All recording operations are lock-free using atomics.
/// The `report()` method atomically swaps counters to get a consistent snapshot.
pub struct Metrics {
    admissions_granted: AtomicU64,
    admissions_denied: AtomicU64,
    /// Denials because nothing matched above threshold
    admissions_unrecognized: AtomicU64,
    /// Admissions since last report (reset on report)
    admissions_since_report: AtomicU64,
    /// Recognition (persist + fingerprint + match) latency, reset on report
    recognition_buckets: [AtomicU64; NUM_BUCKETS],
    recognition_sum_us: AtomicU64,
    recognition_max_us: AtomicU64,
    recognitions_since_report: AtomicU64,
    /// Cumulative recognition histogram, never reset
    recognition_total_buckets: [AtomicU64; NUM_BUCKETS],
    recognition_total_sum_us: AtomicU64,
    verifications_passed: AtomicU64,
    verifications_failed: AtomicU64,
    telemetry_samples: AtomicU64,
    telemetry_unknown_device: AtomicU64,
    geofence_syncs: AtomicU64,
    geofence_events: AtomicU64,
    geofence_breaches: AtomicU64,
    notifications_queued: AtomicU64,
    notifications_dropped: AtomicU64,
    notifications_delivered: AtomicU64,
    notifications_failed: AtomicU64,
    /// Last report time (only accessed from reporter, not atomic)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            admissions_granted: AtomicU64::new(0),
            admissions_denied: AtomicU64::new(0),
            admissions_unrecognized: AtomicU64::new(0),
            admissions_since_report: AtomicU64::new(0),
            recognition_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            recognition_sum_us: AtomicU64::new(0),
            recognition_max_us: AtomicU64::new(0),
            recognitions_since_report: AtomicU64::new(0),
            recognition_total_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            recognition_total_sum_us: AtomicU64::new(0),
            verifications_passed: AtomicU64::new(0),
            verifications_failed: AtomicU64::new(0),
            telemetry_samples: AtomicU64::new(0),
            telemetry_unknown_device: AtomicU64::new(0),
            geofence_syncs: AtomicU64::new(0),
            geofence_events: AtomicU64::new(0),
            geofence_breaches: AtomicU64::new(0),
            notifications_queued: AtomicU64::new(0),
            notifications_dropped: AtomicU64::new(0),
            notifications_delivered: AtomicU64::new(0),
            notifications_failed: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    /// Record the outcome of one admission decision
    #[inline]
    pub fn record_admission(&self, granted: bool, recognized: bool) {
        self.admissions_since_report.fetch_add(1, Ordering::Relaxed);
        if granted {
            self.admissions_granted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.admissions_denied.fetch_add(1, Ordering::Relaxed);
            if !recognized {
                self.admissions_unrecognized.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Record recognition latency (lock-free)
    #[inline]
    pub fn record_recognition_latency(&self, latency_us: u64) {
        self.recognitions_since_report.fetch_add(1, Ordering::Relaxed);
        self.recognition_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        let bucket = bucket_index(latency_us);
        self.recognition_buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.recognition_total_buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.recognition_total_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        update_atomic_max(&self.recognition_max_us, latency_us);
    }

    #[inline]
    pub fn record_verification(&self, passed: bool) {
        if passed {
            self.verifications_passed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.verifications_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_telemetry_samples(&self, count: u64) {
        self.telemetry_samples.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_telemetry_unknown_device(&self) {
        self.telemetry_unknown_device.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_geofence_sync(&self) {
        self.geofence_syncs.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_geofence_events(&self, count: u64, breaches: u64) {
        self.geofence_events.fetch_add(count, Ordering::Relaxed);
        self.geofence_breaches.fetch_add(breaches, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_notification_queued(&self) {
        self.notifications_queued.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_notification_dropped(&self) {
        self.notifications_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_notification_delivered(&self) {
        self.notifications_delivered.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_notification_failed(&self) {
        self.notifications_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn admissions_total(&self) -> u64 {
        self.admissions_granted.load(Ordering::Relaxed)
            + self.admissions_denied.load(Ordering::Relaxed)
    }

    pub fn notifications_dropped(&self) -> u64 {
        self.notifications_dropped.load(Ordering::Relaxed)
    }

    /// Cumulative counters and histogram since start
    pub fn totals(&self) -> MetricsTotals {
        let mut recognition_buckets = [0u64; NUM_BUCKETS];
        for (slot, bucket) in recognition_buckets.iter_mut().zip(&self.recognition_total_buckets) {
            *slot = bucket.load(Ordering::Relaxed);
        }

        MetricsTotals {
            admissions_granted: self.admissions_granted.load(Ordering::Relaxed),
            admissions_denied: self.admissions_denied.load(Ordering::Relaxed),
            admissions_unrecognized: self.admissions_unrecognized.load(Ordering::Relaxed),
            recognition_buckets,
            recognition_sum_us: self.recognition_total_sum_us.load(Ordering::Relaxed),
            verifications_passed: self.verifications_passed.load(Ordering::Relaxed),
            verifications_failed: self.verifications_failed.load(Ordering::Relaxed),
            telemetry_samples: self.telemetry_samples.load(Ordering::Relaxed),
            telemetry_unknown_device: self.telemetry_unknown_device.load(Ordering::Relaxed),
            geofence_syncs: self.geofence_syncs.load(Ordering::Relaxed),
            geofence_events: self.geofence_events.load(Ordering::Relaxed),
            geofence_breaches: self.geofence_breaches.load(Ordering::Relaxed),
            notifications_queued: self.notifications_queued.load(Ordering::Relaxed),
            notifications_dropped: self.notifications_dropped.load(Ordering::Relaxed),
            notifications_delivered: self.notifications_delivered.load(Ordering::Relaxed),
            notifications_failed: self.notifications_failed.load(Ordering::Relaxed),
        }
    }

    /// Generate a report and reset periodic counters
    ///
    /// This is the only method that resets counters. It uses atomic swap
    /// to get a consistent snapshot while allowing concurrent updates.
    pub fn report(&self) -> MetricsSummary {
        let admissions_count = self.admissions_since_report.swap(0, Ordering::Relaxed);
        let recognition_count = self.recognitions_since_report.swap(0, Ordering::Relaxed);
        let recognition_sum = self.recognition_sum_us.swap(0, Ordering::Relaxed);
        let recognition_max = self.recognition_max_us.swap(0, Ordering::Relaxed);
        let recognition_buckets = swap_buckets(&self.recognition_buckets);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let admissions_per_min = if elapsed.as_secs_f64() > 0.0 {
            admissions_count as f64 * 60.0 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        let recognition_avg_us =
            if recognition_count > 0 { recognition_sum / recognition_count } else { 0 };

        MetricsSummary {
            admissions_granted: self.admissions_granted.load(Ordering::Relaxed),
            admissions_denied: self.admissions_denied.load(Ordering::Relaxed),
            admissions_unrecognized: self.admissions_unrecognized.load(Ordering::Relaxed),
            admissions_per_min,
            recognition_buckets,
            recognition_avg_us,
            recognition_max_us: recognition_max,
            recognition_p50_us: percentile_from_buckets(&recognition_buckets, 0.50),
            recognition_p95_us: percentile_from_buckets(&recognition_buckets, 0.95),
            recognition_p99_us: percentile_from_buckets(&recognition_buckets, 0.99),
            verifications_passed: self.verifications_passed.load(Ordering::Relaxed),
            verifications_failed: self.verifications_failed.load(Ordering::Relaxed),
            telemetry_samples: self.telemetry_samples.load(Ordering::Relaxed),
            telemetry_unknown_device: self.telemetry_unknown_device.load(Ordering::Relaxed),
            geofence_syncs: self.geofence_syncs.load(Ordering::Relaxed),
            geofence_events: self.geofence_events.load(Ordering::Relaxed),
            geofence_breaches: self.geofence_breaches.load(Ordering::Relaxed),
            notifications_queued: self.notifications_queued.load(Ordering::Relaxed),
            notifications_dropped: self.notifications_dropped.load(Ordering::Relaxed),
            notifications_delivered: self.notifications_delivered.load(Ordering::Relaxed),
            notifications_failed: self.notifications_failed.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time snapshot produced by `Metrics::report`
#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub admissions_granted: u64,
    pub admissions_denied: u64,
    pub admissions_unrecognized: u64,
    pub admissions_per_min: f64,
    pub recognition_buckets: [u64; NUM_BUCKETS],
    pub recognition_avg_us: u64,
    pub recognition_max_us: u64,
    pub recognition_p50_us: u64,
    pub recognition_p95_us: u64,
    pub recognition_p99_us: u64,
    pub verifications_passed: u64,
    pub verifications_failed: u64,
    pub telemetry_samples: u64,
    pub telemetry_unknown_device: u64,
    pub geofence_syncs: u64,
    pub geofence_events: u64,
    pub geofence_breaches: u64,
    pub notifications_queued: u64,
    pub notifications_dropped: u64,
    pub notifications_delivered: u64,
    pub notifications_failed: u64,
}

/// Monotonic series read by `Metrics::totals`
#[derive(Debug, Clone)]
pub struct MetricsTotals {
    pub admissions_granted: u64,
    pub admissions_denied: u64,
    pub admissions_unrecognized: u64,
    pub recognition_buckets: [u64; NUM_BUCKETS],
    pub recognition_sum_us: u64,
    pub verifications_passed: u64,
    pub verifications_failed: u64,
    pub telemetry_samples: u64,
    pub telemetry_unknown_device: u64,
    pub geofence_syncs: u64,
    pub geofence_events: u64,
    pub geofence_breaches: u64,
    pub notifications_queued: u64,
    pub notifications_dropped: u64,
    pub notifications_delivered: u64,
    pub notifications_failed: u64,
}

impl MetricsTotals {
    pub fn recognition_count(&self) -> u64 {
        self.recognition_buckets.iter().sum()
    }
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            granted = %self.admissions_granted,
            denied = %self.admissions_denied,
            admissions_per_min = format!("{:.1}", self.admissions_per_min),
            recognition_avg_us = %self.recognition_avg_us,
            recognition_p99_us = %self.recognition_p99_us,
            verified = %self.verifications_passed,
            verify_failed = %self.verifications_failed,
            samples = %self.telemetry_samples,
            breaches = %self.geofence_breaches,
            notify_dropped = %self.notifications_dropped,
            notify_failed = %self.notifications_failed,
            "metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_admission() {
        let metrics = Metrics::new();
        metrics.record_admission(true, true);
        metrics.record_admission(false, false);
        metrics.record_admission(false, true);

        let summary = metrics.report();
        assert_eq!(summary.admissions_granted, 1);
        assert_eq!(summary.admissions_denied, 2);
        assert_eq!(summary.admissions_unrecognized, 1);
        assert_eq!(metrics.admissions_total(), 3);
    }

    #[test]
    fn test_bucket_index() {
        assert_eq!(bucket_index(0), 0);
        assert_eq!(bucket_index(100), 0);
        assert_eq!(bucket_index(101), 1);
        assert_eq!(bucket_index(51200), 9);
        assert_eq!(bucket_index(51201), 10);
    }

    #[test]
    fn test_recognition_latency_report_resets() {
        let metrics = Metrics::new();
        metrics.record_recognition_latency(150);
        metrics.record_recognition_latency(250);
        metrics.record_recognition_latency(60_000);

        let summary = metrics.report();
        assert_eq!(summary.recognition_avg_us, (150 + 250 + 60_000) / 3);
        assert_eq!(summary.recognition_max_us, 60_000);
        assert_eq!(summary.recognition_buckets[1], 1);
        assert_eq!(summary.recognition_buckets[2], 1);
        assert_eq!(summary.recognition_buckets[10], 1);

        let second = metrics.report();
        assert_eq!(second.recognition_avg_us, 0);
        assert_eq!(second.recognition_buckets.iter().sum::<u64>(), 0);
    }

    #[test]
    fn test_totals_survive_report() {
        let metrics = Metrics::new();
        metrics.record_recognition_latency(150);
        metrics.record_recognition_latency(250);
        metrics.report();
        metrics.record_recognition_latency(150);

        let totals = metrics.totals();
        assert_eq!(totals.recognition_count(), 3);
        assert_eq!(totals.recognition_sum_us, 550);
        assert_eq!(totals.recognition_buckets[1], 2);

        // reading totals leaves the periodic window alone
        assert_eq!(metrics.report().recognition_buckets[1], 1);
        assert_eq!(metrics.totals().recognition_count(), 3);
    }

    #[test]
    fn test_percentile_computation() {
        let metrics = Metrics::new();
        for _ in 0..100 {
            metrics.record_recognition_latency(150);
        }
        let summary = metrics.report();
        assert_eq!(summary.recognition_p50_us, 200);
        assert_eq!(summary.recognition_p99_us, 200);
    }

    #[test]
    fn test_concurrent_updates() {
        use std::sync::Arc;
        use std::thread;

        let metrics = Arc::new(Metrics::new());
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let m = metrics.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        m.record_admission(true, true);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(metrics.admissions_total(), 10_000);
    }
}
