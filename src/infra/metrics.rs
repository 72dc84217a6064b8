//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for every recording operation so the poll loop and its
//! spawned fetch tasks never contend on a lock. Reporting is the only
//! operation that resets anything (via atomic swap).
//!
//! NOTE: All atomics use Relaxed ordering intentionally; these are statistical
//! counters only. Do NOT use them for coordination or logic decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Refresh latency bucket boundaries (milliseconds)
/// Buckets: ≤25, ≤50, ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, >12800
const BUCKET_BOUNDS: [u64; 10] = [25, 50, 100, 200, 400, 800, 1600, 3200, 6400, 12800];
const NUM_BUCKETS: usize = 11;

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_ms: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_ms)
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
    std::array::from_fn(|i| buckets[i].swap(0, Ordering::Relaxed))
}

/// Load all bucket values without resetting
#[inline]
fn load_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    std::array::from_fn(|i| buckets[i].load(Ordering::Relaxed))
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    // Upper bounds for each bucket (last bucket uses 2x the previous bound)
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [25, 50, 100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600];

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
/// Monotonic counters are never reset. The refresh latency histogram has two
/// copies: a windowed one swapped out by [`Metrics::report`] for the periodic
/// log line, and a cumulative one read by the Prometheus endpoint.
pub struct Metrics {
    /// Change probes issued (monotonic)
    probes_total: AtomicU64,
    /// Probes since last report (reset on report)
    probes_since_report: AtomicU64,
    /// Probes answered with the known version (monotonic)
    unchanged_total: AtomicU64,
    /// Full refreshes completed (monotonic)
    refreshes_total: AtomicU64,
    /// Probe or fetch failures, timeouts included (monotonic)
    failures_total: AtomicU64,
    /// Late results discarded by the sequence guard (monotonic)
    stale_dropped_total: AtomicU64,
    /// Watchdog firings while a refresh was outstanding (monotonic)
    watchdog_fired_total: AtomicU64,
    /// Snapshots handed to the update channel (monotonic)
    snapshots_published_total: AtomicU64,
    /// Updates dropped because the channel was full (monotonic)
    updates_dropped_total: AtomicU64,
    /// Data-quality issues found while building snapshots (monotonic)
    parse_issues_total: AtomicU64,
    /// Degraded episodes entered (monotonic)
    degraded_episodes_total: AtomicU64,
    /// Whether the subscription is currently degraded (0/1)
    degraded: AtomicU64,
    /// Current consecutive failure count
    consecutive_failures: AtomicU64,
    /// Markers in the last published snapshot
    markers_last: AtomicU64,
    /// Refresh latency histogram (reset on report)
    refresh_buckets: [AtomicU64; NUM_BUCKETS],
    /// Sum of refresh latencies in ms (reset on report)
    refresh_sum_ms: AtomicU64,
    /// Max refresh latency in ms (reset on report)
    refresh_max_ms: AtomicU64,
    /// Refresh latency histogram (cumulative)
    refresh_buckets_total: [AtomicU64; NUM_BUCKETS],
    /// Sum of refresh latencies in ms (cumulative)
    refresh_sum_ms_total: AtomicU64,
    /// Last report time (only accessed from reporter)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            probes_total: AtomicU64::new(0),
            probes_since_report: AtomicU64::new(0),
            unchanged_total: AtomicU64::new(0),
            refreshes_total: AtomicU64::new(0),
            failures_total: AtomicU64::new(0),
            stale_dropped_total: AtomicU64::new(0),
            watchdog_fired_total: AtomicU64::new(0),
            snapshots_published_total: AtomicU64::new(0),
            updates_dropped_total: AtomicU64::new(0),
            parse_issues_total: AtomicU64::new(0),
            degraded_episodes_total: AtomicU64::new(0),
            degraded: AtomicU64::new(0),
            consecutive_failures: AtomicU64::new(0),
            markers_last: AtomicU64::new(0),
            refresh_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            refresh_sum_ms: AtomicU64::new(0),
            refresh_max_ms: AtomicU64::new(0),
            refresh_buckets_total: std::array::from_fn(|_| AtomicU64::new(0)),
            refresh_sum_ms_total: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    /// Record one change probe (lock-free)
    #[inline]
    pub fn record_probe(&self, changed: bool) {
        self.probes_total.fetch_add(1, Ordering::Relaxed);
        self.probes_since_report.fetch_add(1, Ordering::Relaxed);
        if !changed {
            self.unchanged_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a completed refresh and its end-to-end latency (lock-free)
    #[inline]
    pub fn record_refresh(&self, latency_ms: u64) {
        self.refreshes_total.fetch_add(1, Ordering::Relaxed);

        let bucket = bucket_index(latency_ms);
        self.refresh_buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.refresh_buckets_total[bucket].fetch_add(1, Ordering::Relaxed);
        self.refresh_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.refresh_sum_ms_total.fetch_add(latency_ms, Ordering::Relaxed);
        update_atomic_max(&self.refresh_max_ms, latency_ms);
    }

    /// Record a probe or fetch failure with the resulting consecutive count
    #[inline]
    pub fn record_failure(&self, consecutive: u32) {
        self.failures_total.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(u64::from(consecutive), Ordering::Relaxed);
    }

    /// Set degraded state; counts an episode on the rising edge
    #[inline]
    pub fn set_degraded(&self, degraded: bool) {
        let prev = self.degraded.swap(u64::from(degraded), Ordering::Relaxed);
        if degraded && prev == 0 {
            self.degraded_episodes_total.fetch_add(1, Ordering::Relaxed);
        }
        if !degraded {
            self.consecutive_failures.store(0, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_stale_dropped(&self) {
        self.stale_dropped_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_watchdog_fired(&self) {
        self.watchdog_fired_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a snapshot published with its marker and issue counts
    #[inline]
    pub fn record_snapshot_published(&self, markers: usize, issues: usize) {
        self.snapshots_published_total.fetch_add(1, Ordering::Relaxed);
        self.markers_last.store(markers as u64, Ordering::Relaxed);
        self.parse_issues_total.fetch_add(issues as u64, Ordering::Relaxed);
    }

    /// Record an update dropped due to channel full (lock-free)
    #[inline]
    pub fn record_update_dropped(&self) {
        self.updates_dropped_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn probes_total(&self) -> u64 {
        self.probes_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn refreshes_total(&self) -> u64 {
        self.refreshes_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn failures_total(&self) -> u64 {
        self.failures_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn stale_dropped_total(&self) -> u64 {
        self.stale_dropped_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn watchdog_fired_total(&self) -> u64 {
        self.watchdog_fired_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn snapshots_published_total(&self) -> u64 {
        self.snapshots_published_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn updates_dropped_total(&self) -> u64 {
        self.updates_dropped_total.load(Ordering::Relaxed)
    }

    /// Calculate and return metrics summary, then reset periodic counters
    ///
    /// This is the only method that resets counters. It uses atomic swap
    /// to get a consistent snapshot while allowing concurrent updates.
    pub fn report(&self) -> MetricsSummary {
        let probes_count = self.probes_since_report.swap(0, Ordering::Relaxed);
        let refresh_buckets = swap_buckets(&self.refresh_buckets);
        let refresh_sum = self.refresh_sum_ms.swap(0, Ordering::Relaxed);
        let refresh_max = self.refresh_max_ms.swap(0, Ordering::Relaxed);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let probes_per_min = if elapsed.as_secs_f64() > 0.0 {
            probes_count as f64 * 60.0 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        self.summary_with(refresh_buckets, refresh_sum, refresh_max, probes_per_min)
    }

    /// Cumulative view for scraping; resets nothing
    pub fn totals(&self) -> MetricsSummary {
        let buckets = load_buckets(&self.refresh_buckets_total);
        let sum = self.refresh_sum_ms_total.load(Ordering::Relaxed);
        let max = self.refresh_max_ms.load(Ordering::Relaxed);
        self.summary_with(buckets, sum, max, 0.0)
    }

    fn summary_with(
        &self,
        refresh_buckets: [u64; NUM_BUCKETS],
        refresh_sum_ms: u64,
        refresh_max_ms: u64,
        probes_per_min: f64,
    ) -> MetricsSummary {
        let refresh_count: u64 = refresh_buckets.iter().sum();
        let refresh_avg_ms = if refresh_count > 0 { refresh_sum_ms / refresh_count } else { 0 };

        MetricsSummary {
            probes_total: self.probes_total.load(Ordering::Relaxed),
            probes_per_min,
            unchanged_total: self.unchanged_total.load(Ordering::Relaxed),
            refreshes_total: self.refreshes_total.load(Ordering::Relaxed),
            failures_total: self.failures_total.load(Ordering::Relaxed),
            stale_dropped_total: self.stale_dropped_total.load(Ordering::Relaxed),
            watchdog_fired_total: self.watchdog_fired_total.load(Ordering::Relaxed),
            snapshots_published_total: self.snapshots_published_total.load(Ordering::Relaxed),
            updates_dropped_total: self.updates_dropped_total.load(Ordering::Relaxed),
            parse_issues_total: self.parse_issues_total.load(Ordering::Relaxed),
            degraded_episodes_total: self.degraded_episodes_total.load(Ordering::Relaxed),
            degraded: self.degraded.load(Ordering::Relaxed) == 1,
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            markers_last: self.markers_last.load(Ordering::Relaxed),
            refresh_buckets,
            refresh_sum_ms,
            refresh_avg_ms,
            refresh_max_ms,
            refresh_p50_ms: percentile_from_buckets(&refresh_buckets, 0.50),
            refresh_p95_ms: percentile_from_buckets(&refresh_buckets, 0.95),
            refresh_p99_ms: percentile_from_buckets(&refresh_buckets, 0.99),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of histogram buckets (exported for Prometheus formatting)
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

/// Exported bucket bounds for Prometheus formatting
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;

#[derive(Debug)]
pub struct MetricsSummary {
    pub probes_total: u64,
    pub probes_per_min: f64,
    pub unchanged_total: u64,
    pub refreshes_total: u64,
    pub failures_total: u64,
    pub stale_dropped_total: u64,
    pub watchdog_fired_total: u64,
    pub snapshots_published_total: u64,
    pub updates_dropped_total: u64,
    pub parse_issues_total: u64,
    pub degraded_episodes_total: u64,
    pub degraded: bool,
    pub consecutive_failures: u64,
    pub markers_last: u64,
    /// Refresh latency histogram buckets
    /// Bounds: ≤25, ≤50, ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, >12800 ms
    pub refresh_buckets: [u64; NUM_BUCKETS],
    pub refresh_sum_ms: u64,
    pub refresh_avg_ms: u64,
    pub refresh_max_ms: u64,
    pub refresh_p50_ms: u64,
    pub refresh_p95_ms: u64,
    pub refresh_p99_ms: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            probes_total = %self.probes_total,
            probes_per_min = %format!("{:.1}", self.probes_per_min),
            unchanged_total = %self.unchanged_total,
            refreshes_total = %self.refreshes_total,
            failures_total = %self.failures_total,
            stale_dropped = %self.stale_dropped_total,
            watchdog_fired = %self.watchdog_fired_total,
            snapshots = %self.snapshots_published_total,
            updates_dropped = %self.updates_dropped_total,
            parse_issues = %self.parse_issues_total,
            degraded = %self.degraded,
            markers = %self.markers_last,
            refresh_avg_ms = %self.refresh_avg_ms,
            refresh_max_ms = %self.refresh_max_ms,
            refresh_p50_ms = %self.refresh_p50_ms,
            refresh_p95_ms = %self.refresh_p95_ms,
            refresh_p99_ms = %self.refresh_p99_ms,
            "metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = Metrics::new();
        assert_eq!(metrics.probes_total(), 0);
        assert_eq!(metrics.refreshes_total(), 0);
    }

    #[test]
    fn test_record_probe() {
        let metrics = Metrics::new();
        metrics.record_probe(true);
        metrics.record_probe(false);
        metrics.record_probe(false);

        let summary = metrics.report();
        assert_eq!(summary.probes_total, 3);
        assert_eq!(summary.unchanged_total, 2);
        assert_eq!(metrics.probes_since_report.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_report_resets_window_but_not_totals() {
        let metrics = Metrics::new();
        metrics.record_refresh(100);
        metrics.record_refresh(200);
        metrics.record_refresh(300);

        let summary = metrics.report();
        assert_eq!(summary.refreshes_total, 3);
        assert_eq!(summary.refresh_avg_ms, 200);
        assert_eq!(summary.refresh_max_ms, 300);

        let again = metrics.report();
        assert_eq!(again.refresh_avg_ms, 0);
        assert_eq!(again.refreshes_total, 3);

        let totals = metrics.totals();
        assert_eq!(totals.refresh_buckets.iter().sum::<u64>(), 3);
        assert_eq!(totals.refresh_sum_ms, 600);
    }

    #[test]
    fn test_degraded_episodes_count_rising_edges() {
        let metrics = Metrics::new();
        metrics.record_failure(1);
        metrics.set_degraded(true);
        metrics.set_degraded(true);
        metrics.set_degraded(false);
        metrics.set_degraded(true);

        let summary = metrics.totals();
        assert_eq!(summary.degraded_episodes_total, 2);
        assert!(summary.degraded);
    }

    #[test]
    fn test_concurrent_updates() {
        use std::sync::Arc;
        use std::thread;

        let metrics = Arc::new(Metrics::new());
        let mut handles = vec![];

        for _ in 0..10 {
            let m = metrics.clone();
            handles.push(thread::spawn(move || {
                for i in 0..1000 {
                    m.record_refresh(i as u64);
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(metrics.refreshes_total(), 10_000);
    }

    #[test]
    fn test_bucket_index() {
        assert_eq!(bucket_index(0), 0);
        assert_eq!(bucket_index(25), 0);
        assert_eq!(bucket_index(26), 1);
        assert_eq!(bucket_index(12800), 9);
        assert_eq!(bucket_index(12801), 10);
    }

    #[test]
    fn test_percentile_computation() {
        let metrics = Metrics::new();
        for _ in 0..100 {
            metrics.record_refresh(150);
        }

        let summary = metrics.report();
        assert_eq!(summary.refresh_p50_ms, 200);
        assert_eq!(summary.refresh_p99_ms, 200);
    }
}
