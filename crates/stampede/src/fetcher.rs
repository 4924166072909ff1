// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
#[cfg(any(feature = "metrics", test))]
use opentelemetry::metrics::MeterProvider;
use tick::Clock;

use crate::error::FetchError;
use crate::lock::{LockGuard, LockManager};
use crate::metrics::{FetchAttempt, MetricsCollector, Outcome};
use crate::options::{FetcherOptions, RetryExhausted, StoreOutage};
use crate::store::CacheStore;
use crate::telemetry::Telemetry;

/// Regenerates cache entries with at most one source call per key at a time.
///
/// On a cache miss, concurrent callers race for a short-lived lock in the shared store.
/// The winner double-checks the cache, invokes the source, writes the value back and
/// releases the lock. Everybody else sleeps with jittered exponential backoff and
/// re-reads the cache, trying to take the lock again on each miss, until the value shows
/// up or the retry budget runs out.
///
/// Each fetcher clone shares the same store, options and [`MetricsCollector`]. Fetchers
/// in different processes coordinate only through the store.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
///
/// use bytes::Bytes;
/// use stampede::{Outcome, SingleFlightFetcher};
/// use stampede::store::memory::MemoryStore;
/// use tick::Clock;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), stampede::FetchError<std::io::Error>> {
/// let clock = Clock::new_tokio();
/// let fetcher = SingleFlightFetcher::new(Arc::new(MemoryStore::new(clock.clone())), &clock);
///
/// let first = fetcher
///     .fetch("user:42", || async { Ok::<_, std::io::Error>(Bytes::from_static(b"Ada")) })
///     .await?;
/// assert_eq!(first.outcome(), Outcome::LockAcquiredFetched);
///
/// let second = fetcher
///     .fetch("user:42", || async { Ok::<_, std::io::Error>(Bytes::from_static(b"unused")) })
///     .await?;
/// assert_eq!(second.outcome(), Outcome::CacheHit);
/// assert_eq!(second.value(), &Bytes::from_static(b"Ada"));
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct SingleFlightFetcher<S: CacheStore + 'static> {
    shared: Arc<FetcherShared<S>>,
}

#[derive(Debug)]
struct FetcherShared<S: CacheStore + 'static> {
    store: Arc<S>,
    locks: LockManager<S>,
    clock: Clock,
    options: FetcherOptions,
    metrics: Arc<MetricsCollector>,
    telemetry: Telemetry,
    next_request_id: AtomicU64,
}

impl<S: CacheStore + 'static> Clone for SingleFlightFetcher<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// A value returned by [`SingleFlightFetcher::fetch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched {
    value: Bytes,
    outcome: Outcome,
    retries: u32,
}

impl Fetched {
    /// The fetched value.
    #[must_use]
    pub fn value(&self) -> &Bytes {
        &self.value
    }

    /// Consumes the result, returning the value.
    #[must_use]
    pub fn into_value(self) -> Bytes {
        self.value
    }

    /// How the value was obtained.
    #[must_use]
    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    /// Number of backoff delays slept through before the value was obtained.
    #[must_use]
    pub fn retries(&self) -> u32 {
        self.retries
    }
}

/// Configures and creates a [`SingleFlightFetcher`].
#[derive(Debug)]
pub struct FetcherBuilder<S: CacheStore + 'static> {
    store: Arc<S>,
    clock: Clock,
    options: FetcherOptions,
    metrics: Option<Arc<MetricsCollector>>,
    telemetry: Option<Telemetry>,
}

impl<S: CacheStore + 'static> FetcherBuilder<S> {
    /// Replaces the default [`FetcherOptions`].
    #[must_use]
    pub fn options(self, options: FetcherOptions) -> Self {
        Self { options, ..self }
    }

    /// Records into `metrics` instead of a collector owned by the fetcher.
    ///
    /// Share one collector between several fetchers to aggregate a run that simulates
    /// callers in separate processes.
    #[must_use]
    pub fn metrics(self, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            metrics: Some(metrics),
            ..self
        }
    }

    /// Records OpenTelemetry metrics through `provider` instead of the global provider.
    #[cfg(any(feature = "metrics", test))]
    #[must_use]
    pub fn meter_provider(self, provider: &dyn MeterProvider) -> Self {
        Self {
            telemetry: Some(Telemetry::with_meter_provider(provider)),
            ..self
        }
    }

    /// Creates the fetcher.
    #[must_use]
    pub fn build(self) -> SingleFlightFetcher<S> {
        let locks = LockManager::new(Arc::clone(&self.store)).prefix(self.options.get_lock_prefix().to_owned());

        SingleFlightFetcher {
            shared: Arc::new(FetcherShared {
                store: self.store,
                locks,
                clock: self.clock,
                options: self.options,
                metrics: self.metrics.unwrap_or_default(),
                telemetry: self.telemetry.unwrap_or_else(Telemetry::new),
                next_request_id: AtomicU64::new(0),
            }),
        }
    }
}

/// Where the lock protocol stands for one request.
enum Step<S: CacheStore + 'static> {
    CheckCache,
    TryLock,
    DoubleCheck(LockGuard<S>),
    WaitBackoff,
}

/// How the lock protocol resolved.
enum Decision<S: CacheStore + 'static> {
    Hit(Bytes),
    /// Call the source. Without a guard this is a fallback that bypasses the lock.
    Regenerate(Option<LockGuard<S>>),
    Timeout,
}

struct Resolution<E> {
    result: Result<Bytes, FetchError<E>>,
    outcome: Outcome,
    retries: u32,
    lost_race: bool,
}

/// What the lock protocol settled on and how it got there.
struct Negotiated<S: CacheStore + 'static> {
    decision: Decision<S>,
    retries: u32,
    /// The lock was held by someone else at least once.
    lost_race: bool,
}

impl<S: CacheStore + 'static> SingleFlightFetcher<S> {
    /// Creates a fetcher with default options.
    #[must_use]
    pub fn new(store: Arc<S>, clock: impl AsRef<Clock>) -> Self {
        Self::builder(store, clock).build()
    }

    /// Starts configuring a fetcher over `store`, timing everything with `clock`.
    #[must_use]
    pub fn builder(store: Arc<S>, clock: impl AsRef<Clock>) -> FetcherBuilder<S> {
        FetcherBuilder {
            store,
            clock: clock.as_ref().clone(),
            options: FetcherOptions::default(),
            metrics: None,
            telemetry: None,
        }
    }

    /// The options used by [`fetch`](Self::fetch).
    #[must_use]
    pub fn options(&self) -> &FetcherOptions {
        &self.shared.options
    }

    /// The collector every fetch is recorded into.
    #[must_use]
    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.shared.metrics
    }

    /// The lock manager guarding regeneration.
    #[must_use]
    pub fn locks(&self) -> &LockManager<S> {
        &self.shared.locks
    }

    /// The shared store.
    #[must_use]
    pub fn store(&self) -> &Arc<S> {
        &self.shared.store
    }

    /// Returns the value cached under `key`, calling `source` at most once to regenerate it.
    ///
    /// `source` runs only if this caller wins the lock and the value is still missing, or
    /// when a fallback policy lets it bypass the lock. While this caller holds the lock,
    /// no other caller using the same store invokes a source for `key`, as long as the
    /// lock does not expire first.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Source`] if this caller invoked `source` and it failed, and
    /// [`FetchError::LockTimeout`] if the value did not appear within the retry budget.
    pub async fn fetch<F, Fut, E>(&self, key: &str, source: F) -> Result<Fetched, FetchError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes, E>>,
    {
        self.fetch_with(key, &self.shared.options, source).await
    }

    /// Like [`fetch`](Self::fetch), with `options` overriding the fetcher's options for this call.
    ///
    /// # Errors
    ///
    /// See [`fetch`](Self::fetch).
    pub async fn fetch_with<F, Fut, E>(&self, key: &str, options: &FetcherOptions, source: F) -> Result<Fetched, FetchError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes, E>>,
    {
        let shared = &self.shared;
        let request_id = shared.next_request_id.fetch_add(1, Ordering::Relaxed);
        let start_time = shared.clock.system_time();
        let stopwatch = shared.clock.stopwatch();

        let resolution = self.resolve(key, options, source).await;

        let attempt = FetchAttempt::new(request_id, start_time, resolution.outcome, stopwatch.elapsed(), resolution.retries);
        if resolution.lost_race {
            shared.metrics.record_lock_wait();
        }
        shared.metrics.record(&attempt);
        shared.telemetry.record(key, &attempt);

        resolution.result.map(|value| Fetched {
            value,
            outcome: resolution.outcome,
            retries: resolution.retries,
        })
    }

    async fn resolve<F, Fut, E>(&self, key: &str, options: &FetcherOptions, source: F) -> Resolution<E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes, E>>,
    {
        let Negotiated {
            decision,
            retries,
            lost_race,
        } = self.negotiate(key, options).await;

        let (result, outcome) = match decision {
            Decision::Hit(value) => (Ok(value), hit_outcome(retries)),
            Decision::Timeout => (Err(FetchError::LockTimeout { retries }), Outcome::Timeout),
            Decision::Regenerate(guard) => {
                let (result, outcome) = self.regenerate(key, options, guard, source).await;
                (result.map_err(FetchError::Source), outcome)
            }
        };

        Resolution {
            result,
            outcome,
            retries,
            lost_race,
        }
    }

    /// Runs the lock protocol until the caller has a value, a lock, or gives up.
    #[cfg_attr(test, mutants::skip)] // Mutating the retry check causes infinite loops.
    async fn negotiate(&self, key: &str, options: &FetcherOptions) -> Negotiated<S> {
        let shared = &self.shared;
        let lock_key = shared.locks.lock_key(key);
        let backoff = options.backoff();
        let mut retries = 0;
        let mut lost_race = false;
        let mut step = Step::CheckCache;

        let decision = loop {
            step = match step {
                Step::CheckCache => match self.read_cache(key).await {
                    Some(value) => break Decision::Hit(value),
                    None => Step::TryLock,
                },
                Step::TryLock => match shared.locks.try_acquire(&lock_key, options.get_lock_ttl()).await {
                    Ok(true) => Step::DoubleCheck(shared.locks.guard(lock_key.clone())),
                    Ok(false) => {
                        lost_race = true;
                        Step::WaitBackoff
                    }
                    Err(error) => {
                        crate::log!(warn, stampede.key = key, error = %error, "stampede.lock.unavailable");
                        let _ = error;
                        match options.get_store_outage() {
                            StoreOutage::FetchDirect => break Decision::Regenerate(None),
                            StoreOutage::Wait => {
                                lost_race = true;
                                Step::WaitBackoff
                            }
                        }
                    }
                },
                Step::DoubleCheck(guard) => match self.read_cache(key).await {
                    Some(value) => {
                        guard.release().await;
                        break Decision::Hit(value);
                    }
                    None => break Decision::Regenerate(Some(guard)),
                },
                Step::WaitBackoff => {
                    if retries >= backoff.max_retries() {
                        match options.get_retry_exhausted() {
                            RetryExhausted::Timeout => break Decision::Timeout,
                            RetryExhausted::FetchAnyway => break Decision::Regenerate(None),
                        }
                    }

                    let delay = backoff.next_delay(retries);
                    crate::log!(
                        debug,
                        stampede.key = key,
                        stampede.retries = retries,
                        stampede.delay_ms = delay.as_millis(),
                        "stampede.wait"
                    );
                    shared.clock.delay(delay).await;
                    retries += 1;
                    Step::CheckCache
                }
            };
        };

        Negotiated {
            decision,
            retries,
            lost_race,
        }
    }

    /// Calls the source, writes a successful value back and releases the lock if held.
    async fn regenerate<F, Fut, E>(
        &self,
        key: &str,
        options: &FetcherOptions,
        guard: Option<LockGuard<S>>,
        source: F,
    ) -> (Result<Bytes, E>, Outcome)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes, E>>,
    {
        let shared = &self.shared;
        let stopwatch = shared.clock.stopwatch();
        let result = source().await;
        let latency = stopwatch.elapsed();

        if guard.is_some() && latency > options.get_lock_ttl() {
            shared.metrics.record_lock_overrun();
            shared.telemetry.record_lock_overrun(key, latency, options.get_lock_ttl());
        }

        let outcome = match (&result, &guard) {
            (Err(_), _) => Outcome::SourceFailed,
            (Ok(_), Some(_)) => Outcome::LockAcquiredFetched,
            (Ok(_), None) => Outcome::Fallback,
        };

        if let Ok(value) = &result {
            self.populate(key, value.clone(), options).await;
        }

        if let Some(guard) = guard {
            guard.release().await;
        }

        (result, outcome)
    }

    async fn read_cache(&self, key: &str) -> Option<Bytes> {
        match self.shared.store.get(key).await {
            Ok(value) => value,
            Err(error) => {
                crate::log!(warn, stampede.key = key, error = %error, "stampede.cache.read_failed");
                let _ = error;
                None
            }
        }
    }

    async fn populate(&self, key: &str, value: Bytes, options: &FetcherOptions) {
        if let Err(error) = self.shared.store.set(key, value, options.get_cache_ttl()).await {
            crate::log!(warn, stampede.key = key, error = %error, "stampede.cache.populate_failed");
            let _ = error;
        }
    }
}

fn hit_outcome(retries: u32) -> Outcome {
    if retries == 0 { Outcome::CacheHit } else { Outcome::LockWaitThenHit }
}
