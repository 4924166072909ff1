// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Counters and latency samples for judging how well stampedes are prevented.
//!
//! Every [`fetch`](crate::SingleFlightFetcher::fetch) records exactly one [`FetchAttempt`] into
//! the fetcher's [`MetricsCollector`]. A [`RunMetrics`] snapshot can be taken at any time,
//! including while other tasks keep recording.

use std::fmt::{self, Display};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use parking_lot::Mutex;

/// How a single fetch was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Outcome {
    /// The value was already cached, either on the first read or on the double-check
    /// after winning the lock.
    CacheHit,
    /// The caller won the lock, invoked the source and populated the cache.
    LockAcquiredFetched,
    /// The caller lost the lock race and later found the value populated by the winner.
    LockWaitThenHit,
    /// The caller exhausted its retry budget without seeing a value.
    Timeout,
    /// The caller invoked the source without holding the lock.
    ///
    /// This happens when the retry budget is exhausted under
    /// [`RetryExhausted::FetchAnyway`](crate::RetryExhausted::FetchAnyway) or when the
    /// store could not be reached to take the lock.
    Fallback,
    /// The source returned an error.
    SourceFailed,
}

impl Outcome {
    /// All outcomes, in declaration order.
    pub const ALL: [Self; 6] = [
        Self::CacheHit,
        Self::LockAcquiredFetched,
        Self::LockWaitThenHit,
        Self::Timeout,
        Self::Fallback,
        Self::SourceFailed,
    ];

    /// Returns a stable, lowercase name suitable for logs and metric attributes.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CacheHit => "cache_hit",
            Self::LockAcquiredFetched => "lock_acquired_fetched",
            Self::LockWaitThenHit => "lock_wait_then_hit",
            Self::Timeout => "timeout",
            Self::Fallback => "fallback",
            Self::SourceFailed => "source_failed",
        }
    }

    /// Returns `true` if the caller was served from the cache.
    #[must_use]
    pub fn is_hit(self) -> bool {
        matches!(self, Self::CacheHit | Self::LockWaitThenHit)
    }

    /// Returns `true` if the caller invoked the upstream source.
    #[must_use]
    pub fn invoked_source(self) -> bool {
        matches!(self, Self::LockAcquiredFetched | Self::Fallback | Self::SourceFailed)
    }

    fn index(self) -> usize {
        match self {
            Self::CacheHit => 0,
            Self::LockAcquiredFetched => 1,
            Self::LockWaitThenHit => 2,
            Self::Timeout => 3,
            Self::Fallback => 4,
            Self::SourceFailed => 5,
        }
    }
}

impl Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The record of one `fetch` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchAttempt {
    request_id: u64,
    start_time: SystemTime,
    outcome: Outcome,
    latency: Duration,
    retry_count: u32,
}

impl FetchAttempt {
    /// Creates a new attempt record.
    #[must_use]
    pub fn new(request_id: u64, start_time: SystemTime, outcome: Outcome, latency: Duration, retry_count: u32) -> Self {
        Self {
            request_id,
            start_time,
            outcome,
            latency,
            retry_count,
        }
    }

    /// Identifier of the request, unique per fetcher.
    #[must_use]
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Wall-clock time at which the fetch started.
    #[must_use]
    pub fn start_time(&self) -> SystemTime {
        self.start_time
    }

    /// How the fetch was resolved.
    #[must_use]
    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    /// Time from the start of the fetch until it returned.
    #[must_use]
    pub fn latency(&self) -> Duration {
        self.latency
    }

    /// Number of backoff delays the caller slept through.
    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }
}

/// Default number of latency samples kept for percentiles.
pub const DEFAULT_LATENCY_SAMPLES: usize = 10_000;

/// Default span of per-second buckets kept, counted back from the newest bucket.
pub const DEFAULT_BUCKET_RETENTION: Duration = Duration::from_secs(300);

#[derive(Debug, Default)]
struct BucketCounters {
    requests: AtomicU64,
    cache_hits: AtomicU64,
    source_calls: AtomicU64,
    timeouts: AtomicU64,
}

/// Thread-safe accumulator of [`FetchAttempt`]s.
///
/// Counters are plain atomics and per-second buckets live in a concurrent map, so
/// recording never blocks other recorders except for the short critical section that
/// updates the latency reservoir.
///
/// Memory stays bounded for the lifetime of the collector. Percentiles come from a
/// uniform reservoir of at most [`DEFAULT_LATENCY_SAMPLES`] latencies (exact until the
/// reservoir fills), while count, min, max and mean cover every fetch. Per-second
/// buckets older than [`DEFAULT_BUCKET_RETENTION`] before the newest one are dropped.
///
/// # Examples
///
/// ```
/// use std::time::{Duration, SystemTime};
///
/// use stampede::{FetchAttempt, MetricsCollector, Outcome};
///
/// let metrics = MetricsCollector::new();
/// let now = SystemTime::now();
///
/// metrics.record(&FetchAttempt::new(0, now, Outcome::LockAcquiredFetched, Duration::from_millis(50), 0));
/// metrics.record(&FetchAttempt::new(1, now, Outcome::LockWaitThenHit, Duration::from_millis(70), 1));
///
/// let run = metrics.snapshot();
/// assert_eq!(run.total_requests(), 2);
/// assert_eq!(run.source_calls(), 1);
/// assert_eq!(run.cache_hits(), 1);
/// assert!((run.source_call_reduction() - 0.5).abs() < f64::EPSILON);
/// ```
#[derive(Debug)]
pub struct MetricsCollector {
    outcomes: [AtomicU64; Outcome::ALL.len()],
    lock_waits: AtomicU64,
    lock_overruns: AtomicU64,
    buckets: DashMap<u64, BucketCounters>,
    bucket_retention: u64,
    newest_second: AtomicU64,
    latencies: Mutex<Reservoir>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self {
            outcomes: Default::default(),
            lock_waits: AtomicU64::new(0),
            lock_overruns: AtomicU64::new(0),
            buckets: DashMap::new(),
            bucket_retention: DEFAULT_BUCKET_RETENTION.as_secs(),
            newest_second: AtomicU64::new(0),
            latencies: Mutex::new(Reservoir::new(DEFAULT_LATENCY_SAMPLES)),
        }
    }
}

impl MetricsCollector {
    /// Creates an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps at most `samples` latencies for percentile estimates.
    ///
    /// At least one sample is always kept.
    #[must_use]
    pub fn latency_samples(self, samples: usize) -> Self {
        Self {
            latencies: Mutex::new(Reservoir::new(samples)),
            ..self
        }
    }

    /// Keeps per-second buckets for `retention` before the newest bucket, at least one second.
    #[must_use]
    pub fn bucket_retention(self, retention: Duration) -> Self {
        Self {
            bucket_retention: retention.as_secs().max(1),
            ..self
        }
    }

    /// Records one completed fetch.
    pub fn record(&self, attempt: &FetchAttempt) {
        let outcome = attempt.outcome();
        self.outcomes[outcome.index()].fetch_add(1, Ordering::Relaxed);

        let second = unix_second(attempt.start_time());
        {
            let bucket = self.buckets.entry(second).or_default();
            bucket.requests.fetch_add(1, Ordering::Relaxed);
            if outcome.is_hit() {
                bucket.cache_hits.fetch_add(1, Ordering::Relaxed);
            }
            if outcome.invoked_source() {
                bucket.source_calls.fetch_add(1, Ordering::Relaxed);
            }
            if outcome == Outcome::Timeout {
                bucket.timeouts.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.evict_buckets(second);
        self.latencies.lock().add(attempt.latency());
    }

    fn evict_buckets(&self, second: u64) {
        let newest = self.newest_second.fetch_max(second, Ordering::Relaxed).max(second);
        // each bucket covers one second, so more buckets than seconds retained means stale entries
        if self.buckets.len() as u64 > self.bucket_retention {
            let oldest = newest.saturating_sub(self.bucket_retention);
            self.buckets.retain(|&bucket, _| bucket > oldest);
        }
    }

    /// Counts a fetch that found the lock held by someone else at least once.
    pub fn record_lock_wait(&self) {
        self.lock_waits.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a winner whose source call outlived the lock TTL.
    pub fn record_lock_overrun(&self) {
        self.lock_overruns.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns how many fetches resolved with `outcome`.
    #[must_use]
    pub fn count(&self, outcome: Outcome) -> u64 {
        self.outcomes[outcome.index()].load(Ordering::Relaxed)
    }

    /// Aggregates everything recorded so far.
    #[must_use]
    pub fn snapshot(&self) -> RunMetrics {
        let mut outcomes = [0; Outcome::ALL.len()];
        for outcome in Outcome::ALL {
            outcomes[outcome.index()] = self.count(outcome);
        }

        let mut buckets: Vec<BucketMetrics> = self
            .buckets
            .iter()
            .map(|entry| {
                let counters = entry.value();
                BucketMetrics {
                    second: *entry.key(),
                    requests: counters.requests.load(Ordering::Relaxed),
                    cache_hits: counters.cache_hits.load(Ordering::Relaxed),
                    source_calls: counters.source_calls.load(Ordering::Relaxed),
                    timeouts: counters.timeouts.load(Ordering::Relaxed),
                }
            })
            .collect();
        buckets.sort_unstable_by_key(|bucket| bucket.second);

        let latency = self.latencies.lock().summary();

        RunMetrics {
            outcomes,
            lock_waits: self.lock_waits.load(Ordering::Relaxed),
            lock_overruns: self.lock_overruns.load(Ordering::Relaxed),
            latency,
            buckets,
        }
    }

    /// Discards everything recorded so far.
    pub fn reset(&self) {
        for counter in &self.outcomes {
            counter.store(0, Ordering::Relaxed);
        }
        self.lock_waits.store(0, Ordering::Relaxed);
        self.lock_overruns.store(0, Ordering::Relaxed);
        self.buckets.clear();
        self.newest_second.store(0, Ordering::Relaxed);
        self.latencies.lock().clear();
    }
}

/// Exact count, sum and extremes plus a uniform sample (Algorithm R) of latencies.
#[derive(Debug)]
struct Reservoir {
    capacity: usize,
    seen: usize,
    total: Duration,
    min: Duration,
    max: Duration,
    samples: Vec<Duration>,
}

impl Reservoir {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            seen: 0,
            total: Duration::ZERO,
            min: Duration::MAX,
            max: Duration::ZERO,
            samples: Vec::new(),
        }
    }

    fn add(&mut self, latency: Duration) {
        self.seen += 1;
        self.total = self.total.saturating_add(latency);
        self.min = self.min.min(latency);
        self.max = self.max.max(latency);

        if self.samples.len() < self.capacity {
            self.samples.push(latency);
        } else {
            let slot = fastrand::usize(..self.seen);
            if let Some(sample) = self.samples.get_mut(slot) {
                *sample = latency;
            }
        }
    }

    fn clear(&mut self) {
        *self = Self::new(self.capacity);
    }

    fn summary(&self) -> LatencySummary {
        if self.seen == 0 {
            return LatencySummary::default();
        }

        let mut sorted = self.samples.clone();
        sorted.sort_unstable();
        let mean = self.total.as_nanos() / self.seen as u128;

        LatencySummary {
            count: self.seen,
            min: self.min,
            max: self.max,
            mean: Duration::from_nanos(u64::try_from(mean).unwrap_or(u64::MAX)),
            p50: percentile(&sorted, 50),
            p90: percentile(&sorted, 90),
            p95: percentile(&sorted, 95),
            p99: percentile(&sorted, 99),
        }
    }
}

fn unix_second(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH).map_or(0, |since| since.as_secs())
}

/// Distribution of fetch latencies.
///
/// `count`, `min`, `max` and `mean` cover every fetch; percentiles are taken over the
/// collector's latency reservoir.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LatencySummary {
    /// Number of samples.
    pub count: usize,
    /// Fastest fetch.
    pub min: Duration,
    /// Slowest fetch.
    pub max: Duration,
    /// Arithmetic mean.
    pub mean: Duration,
    /// Median, nearest-rank.
    pub p50: Duration,
    /// 90th percentile, nearest-rank.
    pub p90: Duration,
    /// 95th percentile, nearest-rank.
    pub p95: Duration,
    /// 99th percentile, nearest-rank.
    pub p99: Duration,
}

fn percentile(sorted: &[Duration], pct: usize) -> Duration {
    let rank = (pct * sorted.len()).div_ceil(100);
    sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
}

/// Counts for the fetches that started within one wall-clock second.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketMetrics {
    /// Seconds since the Unix epoch at which the bucket starts.
    pub second: u64,
    /// Fetches started in this second.
    pub requests: u64,
    /// Fetches served from the cache.
    pub cache_hits: u64,
    /// Fetches that invoked the source.
    pub source_calls: u64,
    /// Fetches that timed out.
    pub timeouts: u64,
}

/// Immutable aggregate of a [`MetricsCollector`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunMetrics {
    outcomes: [u64; Outcome::ALL.len()],
    lock_waits: u64,
    lock_overruns: u64,
    latency: LatencySummary,
    buckets: Vec<BucketMetrics>,
}

impl RunMetrics {
    /// Number of fetches recorded.
    #[must_use]
    pub fn total_requests(&self) -> u64 {
        self.outcomes.iter().sum()
    }

    /// Number of fetches that resolved with `outcome`.
    #[must_use]
    pub fn count(&self, outcome: Outcome) -> u64 {
        self.outcomes[outcome.index()]
    }

    /// Fetches served from the cache, immediately or after waiting.
    #[must_use]
    pub fn cache_hits(&self) -> u64 {
        self.count(Outcome::CacheHit) + self.count(Outcome::LockWaitThenHit)
    }

    /// Fetches that invoked the upstream source, successfully or not.
    #[must_use]
    pub fn source_calls(&self) -> u64 {
        Outcome::ALL.into_iter().filter(|o| o.invoked_source()).map(|o| self.count(o)).sum()
    }

    /// Fetches that found the lock held by someone else at least once, whether or not
    /// they went on to sleep.
    #[must_use]
    pub fn lock_waits(&self) -> u64 {
        self.lock_waits
    }

    /// Fetches that gave up waiting.
    #[must_use]
    pub fn timeouts(&self) -> u64 {
        self.count(Outcome::Timeout)
    }

    /// Fetches that invoked the source without holding the lock.
    #[must_use]
    pub fn fallbacks(&self) -> u64 {
        self.count(Outcome::Fallback)
    }

    /// Fetches whose source call failed.
    #[must_use]
    pub fn source_errors(&self) -> u64 {
        self.count(Outcome::SourceFailed)
    }

    /// Source calls that took longer than the lock TTL.
    #[must_use]
    pub fn lock_overruns(&self) -> u64 {
        self.lock_overruns
    }

    /// Latency distribution over all fetches.
    #[must_use]
    pub fn latency(&self) -> &LatencySummary {
        &self.latency
    }

    /// Per-second counts, ordered by time.
    #[must_use]
    pub fn buckets(&self) -> &[BucketMetrics] {
        &self.buckets
    }

    /// Fraction of requests that did not reach the source: `1 - source_calls / total_requests`.
    ///
    /// Returns `0.0` when nothing was recorded.
    #[must_use]
    #[expect(clippy::cast_precision_loss, reason = "ratio of request counts")]
    pub fn source_call_reduction(&self) -> f64 {
        let total = self.total_requests();
        if total == 0 {
            return 0.0;
        }
        1.0 - self.source_calls() as f64 / total as f64
    }
}

impl Display for RunMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "requests={} hits={} source_calls={} reduction={:.1}% waits={} timeouts={} fallbacks={} errors={} overruns={} \
             latency[min={:?} p50={:?} p99={:?} max={:?}]",
            self.total_requests(),
            self.cache_hits(),
            self.source_calls(),
            self.source_call_reduction() * 100.0,
            self.lock_waits,
            self.timeouts(),
            self.fallbacks(),
            self.source_errors(),
            self.lock_overruns,
            self.latency.min,
            self.latency.p50,
            self.latency.p99,
            self.latency.max,
        )
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn attempt(id: u64, outcome: Outcome, latency_ms: u64, retries: u32) -> FetchAttempt {
        FetchAttempt::new(id, at(1_000), outcome, Duration::from_millis(latency_ms), retries)
    }

    #[test]
    fn outcome_names_are_unique() {
        let mut names: Vec<_> = Outcome::ALL.iter().map(|o| o.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), Outcome::ALL.len());
        assert_eq!(Outcome::LockWaitThenHit.to_string(), "lock_wait_then_hit");
    }

    #[test]
    fn outcome_classification() {
        assert!(Outcome::CacheHit.is_hit());
        assert!(Outcome::LockWaitThenHit.is_hit());
        assert!(!Outcome::Fallback.is_hit());

        assert!(Outcome::LockAcquiredFetched.invoked_source());
        assert!(Outcome::Fallback.invoked_source());
        assert!(Outcome::SourceFailed.invoked_source());
        assert!(!Outcome::Timeout.invoked_source());
        assert!(!Outcome::CacheHit.invoked_source());
    }

    #[test]
    fn attempt_accessors() {
        let a = FetchAttempt::new(7, at(5), Outcome::Timeout, Duration::from_millis(3), 5);
        assert_eq!(a.request_id(), 7);
        assert_eq!(a.start_time(), at(5));
        assert_eq!(a.outcome(), Outcome::Timeout);
        assert_eq!(a.latency(), Duration::from_millis(3));
        assert_eq!(a.retry_count(), 5);
    }

    #[test]
    fn empty_snapshot() {
        let run = MetricsCollector::new().snapshot();
        assert_eq!(run.total_requests(), 0);
        assert!(run.source_call_reduction().abs() < f64::EPSILON);
        assert_eq!(*run.latency(), LatencySummary::default());
        assert!(run.buckets().is_empty());
    }

    #[test]
    fn snapshot_aggregates_outcomes() {
        let metrics = MetricsCollector::new();
        metrics.record(&attempt(0, Outcome::LockAcquiredFetched, 100, 0));
        metrics.record(&attempt(1, Outcome::CacheHit, 1, 0));
        metrics.record(&attempt(2, Outcome::LockWaitThenHit, 150, 2));
        metrics.record(&attempt(3, Outcome::Timeout, 3_000, 5));
        metrics.record(&attempt(4, Outcome::Fallback, 90, 0));
        metrics.record(&attempt(5, Outcome::SourceFailed, 20, 0));
        metrics.record_lock_wait();
        metrics.record_lock_wait();
        metrics.record_lock_overrun();

        let run = metrics.snapshot();
        assert_eq!(run.total_requests(), 6);
        assert_eq!(run.cache_hits(), 2);
        assert_eq!(run.source_calls(), 3);
        assert_eq!(run.lock_waits(), 2);
        assert_eq!(run.timeouts(), 1);
        assert_eq!(run.fallbacks(), 1);
        assert_eq!(run.source_errors(), 1);
        assert_eq!(run.lock_overruns(), 1);
        assert_eq!(run.count(Outcome::CacheHit), 1);
        assert!((run.source_call_reduction() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn latency_percentiles_use_nearest_rank() {
        let metrics = MetricsCollector::new();
        for ms in (1..=100).rev() {
            metrics.record(&attempt(ms, Outcome::CacheHit, ms, 0));
        }

        let latency = *metrics.snapshot().latency();
        assert_eq!(latency.count, 100);
        assert_eq!(latency.min, Duration::from_millis(1));
        assert_eq!(latency.max, Duration::from_millis(100));
        assert_eq!(latency.mean, Duration::from_micros(50_500));
        assert_eq!(latency.p50, Duration::from_millis(50));
        assert_eq!(latency.p90, Duration::from_millis(90));
        assert_eq!(latency.p95, Duration::from_millis(95));
        assert_eq!(latency.p99, Duration::from_millis(99));
    }

    #[test]
    fn single_sample_fills_every_percentile() {
        let metrics = MetricsCollector::new();
        metrics.record(&attempt(0, Outcome::CacheHit, 42, 0));

        let latency = *metrics.snapshot().latency();
        assert_eq!(latency.p50, Duration::from_millis(42));
        assert_eq!(latency.p99, Duration::from_millis(42));
        assert_eq!(latency.mean, Duration::from_millis(42));
    }

    #[test]
    fn buckets_group_by_second() {
        let metrics = MetricsCollector::new();
        let ms = Duration::from_millis;
        metrics.record(&FetchAttempt::new(0, at(11), Outcome::Timeout, ms(1), 5));
        metrics.record(&FetchAttempt::new(1, at(10) + ms(200), Outcome::LockAcquiredFetched, ms(1), 0));
        metrics.record(&FetchAttempt::new(2, at(10) + ms(900), Outcome::LockWaitThenHit, ms(1), 1));

        let run = metrics.snapshot();
        assert_eq!(
            run.buckets(),
            &[
                BucketMetrics {
                    second: 10,
                    requests: 2,
                    cache_hits: 1,
                    source_calls: 1,
                    timeouts: 0,
                },
                BucketMetrics {
                    second: 11,
                    requests: 1,
                    cache_hits: 0,
                    source_calls: 0,
                    timeouts: 1,
                },
            ]
        );
    }

    #[test]
    fn long_runs_keep_bounded_state() {
        let metrics = MetricsCollector::new()
            .latency_samples(100)
            .bucket_retention(Duration::from_secs(60));

        for second in 0..50_000 {
            metrics.record(&FetchAttempt::new(
                second,
                at(second),
                Outcome::CacheHit,
                Duration::from_millis(second % 1_000 + 1),
                0,
            ));
        }

        assert!(metrics.buckets.len() <= 61, "{}", metrics.buckets.len());
        assert_eq!(metrics.latencies.lock().samples.len(), 100);

        let run = metrics.snapshot();
        assert_eq!(run.total_requests(), 50_000);
        assert_eq!(run.buckets().first().map(|b| b.second), Some(49_940));
        assert_eq!(run.buckets().last().map(|b| b.second), Some(49_999));

        let latency = run.latency();
        assert_eq!(latency.count, 50_000);
        assert_eq!(latency.min, Duration::from_millis(1));
        assert_eq!(latency.max, Duration::from_millis(1_000));
        assert!(latency.p50 >= latency.min && latency.p50 <= latency.max);
        assert!(latency.p50 <= latency.p99);
    }

    #[test]
    fn late_attempts_outside_retention_are_dropped() {
        let metrics = MetricsCollector::new().bucket_retention(Duration::from_secs(2));
        for second in [100, 101, 102, 5] {
            metrics.record(&FetchAttempt::new(0, at(second), Outcome::CacheHit, Duration::ZERO, 0));
        }

        let seconds: Vec<_> = metrics.snapshot().buckets().iter().map(|b| b.second).collect();
        assert_eq!(seconds, [101, 102]);
    }

    #[test]
    fn reset_clears_everything() {
        let metrics = MetricsCollector::new();
        metrics.record(&attempt(0, Outcome::LockAcquiredFetched, 10, 1));
        metrics.record_lock_overrun();
        metrics.reset();

        assert_eq!(metrics.snapshot(), MetricsCollector::new().snapshot());
    }

    #[test]
    fn concurrent_recording_loses_nothing() {
        let metrics = Arc::new(MetricsCollector::new());
        let threads: Vec<_> = (0..8)
            .map(|t| {
                let metrics = Arc::clone(&metrics);
                std::thread::spawn(move || {
                    for i in 0..500 {
                        let outcome = Outcome::ALL[(t + i) % Outcome::ALL.len()];
                        metrics.record(&attempt(i as u64, outcome, 1, 0));
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        let run = metrics.snapshot();
        assert_eq!(run.total_requests(), 4_000);
        assert_eq!(run.latency().count, 4_000);
        assert_eq!(run.buckets()[0].requests, 4_000);
    }

    #[test]
    fn display_is_one_line() {
        let metrics = MetricsCollector::new();
        metrics.record(&attempt(0, Outcome::LockAcquiredFetched, 10, 0));
        metrics.record(&attempt(1, Outcome::LockWaitThenHit, 20, 1));

        let line = metrics.snapshot().to_string();
        assert!(!line.contains('\n'), "{line}");
        assert!(line.contains("requests=2"), "{line}");
        assert!(line.contains("source_calls=1"), "{line}");
        assert!(line.contains("reduction=50.0%"), "{line}");
    }
}
