// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::Duration;

use crate::backoff::{BackoffScheduler, DEFAULT_BASE_BACKOFF, DEFAULT_MAX_RETRIES};
use crate::lock::DEFAULT_LOCK_PREFIX;

/// Default time-to-live of a populated cache entry.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);

/// Default time-to-live of a regeneration lock.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(10);

/// What a waiter does once it has slept through its whole retry budget.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[non_exhaustive]
pub enum RetryExhausted {
    /// Return [`FetchError::LockTimeout`](crate::FetchError::LockTimeout).
    #[default]
    Timeout,
    /// Invoke the source directly without holding the lock.
    FetchAnyway,
}

/// What a caller does when the store cannot be reached to take the lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[non_exhaustive]
pub enum StoreOutage {
    /// Invoke the source directly without the lock. The value is still written to the
    /// cache if the store accepts it.
    #[default]
    FetchDirect,
    /// Treat the outage like a lost lock race and wait for the cache.
    Wait,
}

/// Tuning knobs of a [`SingleFlightFetcher`](crate::SingleFlightFetcher).
///
/// # Defaults
///
/// | Option | Default |
/// |---|---|
/// | `cache_ttl` | 60 s |
/// | `lock_ttl` | 10 s |
/// | `max_retries` | 5 |
/// | `base_backoff` | 100 ms |
/// | `max_backoff` | none |
/// | `lock_prefix` | `"lock:"` |
/// | `retry_exhausted` | [`RetryExhausted::Timeout`] |
/// | `store_outage` | [`StoreOutage::FetchDirect`] |
///
/// `lock_ttl` should comfortably exceed the worst-case latency of the source. A lock that
/// expires while the source is still running lets a second caller start a duplicate fetch.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use stampede::{FetcherOptions, RetryExhausted};
///
/// let options = FetcherOptions::default()
///     .cache_ttl(Duration::from_secs(300))
///     .lock_ttl(Duration::from_secs(2))
///     .retry_exhausted(RetryExhausted::FetchAnyway);
///
/// assert_eq!(options.get_lock_ttl(), Duration::from_secs(2));
/// assert_eq!(options.get_max_retries(), 5);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct FetcherOptions {
    cache_ttl: Duration,
    lock_ttl: Duration,
    max_retries: u32,
    base_backoff: Duration,
    max_backoff: Option<Duration>,
    lock_prefix: String,
    retry_exhausted: RetryExhausted,
    store_outage: StoreOutage,
}

impl Default for FetcherOptions {
    fn default() -> Self {
        Self {
            cache_ttl: DEFAULT_CACHE_TTL,
            lock_ttl: DEFAULT_LOCK_TTL,
            max_retries: DEFAULT_MAX_RETRIES,
            base_backoff: DEFAULT_BASE_BACKOFF,
            max_backoff: None,
            lock_prefix: DEFAULT_LOCK_PREFIX.to_owned(),
            retry_exhausted: RetryExhausted::default(),
            store_outage: StoreOutage::default(),
        }
    }
}

impl FetcherOptions {
    /// Sets how long a populated value stays cached.
    #[must_use]
    pub fn cache_ttl(self, cache_ttl: Duration) -> Self {
        Self { cache_ttl, ..self }
    }

    /// Sets how long a regeneration lock lives if it is never released.
    #[must_use]
    pub fn lock_ttl(self, lock_ttl: Duration) -> Self {
        Self { lock_ttl, ..self }
    }

    /// Sets how many backoff delays a waiter sleeps through before giving up.
    #[must_use]
    pub fn max_retries(self, max_retries: u32) -> Self {
        Self { max_retries, ..self }
    }

    /// Sets the delay before the first retry; later delays double.
    #[must_use]
    pub fn base_backoff(self, base_backoff: Duration) -> Self {
        Self { base_backoff, ..self }
    }

    /// Caps every individual backoff delay.
    #[must_use]
    pub fn max_backoff(self, max_backoff: Duration) -> Self {
        Self {
            max_backoff: Some(max_backoff),
            ..self
        }
    }

    /// Sets the prefix that turns a cache key into its lock key.
    ///
    /// Read once when the fetcher is built. Options passed to
    /// [`fetch_with`](crate::SingleFlightFetcher::fetch_with) keep the fetcher's prefix, so
    /// every call for a key contends on the same lock.
    #[must_use]
    pub fn lock_prefix(self, lock_prefix: impl Into<String>) -> Self {
        Self {
            lock_prefix: lock_prefix.into(),
            ..self
        }
    }

    /// Sets what a waiter does once its retry budget is exhausted.
    #[must_use]
    pub fn retry_exhausted(self, retry_exhausted: RetryExhausted) -> Self {
        Self { retry_exhausted, ..self }
    }

    /// Sets what a caller does when the store cannot be reached to take the lock.
    #[must_use]
    pub fn store_outage(self, store_outage: StoreOutage) -> Self {
        Self { store_outage, ..self }
    }

    /// Returns the cache entry TTL.
    #[must_use]
    pub fn get_cache_ttl(&self) -> Duration {
        self.cache_ttl
    }

    /// Returns the lock TTL.
    #[must_use]
    pub fn get_lock_ttl(&self) -> Duration {
        self.lock_ttl
    }

    /// Returns the retry budget of a waiter.
    #[must_use]
    pub fn get_max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Returns the base backoff delay.
    #[must_use]
    pub fn get_base_backoff(&self) -> Duration {
        self.base_backoff
    }

    /// Returns the cap on individual backoff delays, if any.
    #[must_use]
    pub fn get_max_backoff(&self) -> Option<Duration> {
        self.max_backoff
    }

    /// Returns the lock key prefix.
    #[must_use]
    pub fn get_lock_prefix(&self) -> &str {
        &self.lock_prefix
    }

    /// Returns the retry exhaustion policy.
    #[must_use]
    pub fn get_retry_exhausted(&self) -> RetryExhausted {
        self.retry_exhausted
    }

    /// Returns the store outage policy.
    #[must_use]
    pub fn get_store_outage(&self) -> StoreOutage {
        self.store_outage
    }

    pub(crate) fn backoff(&self) -> BackoffScheduler {
        let backoff = BackoffScheduler::new(self.base_backoff, self.max_retries);
        match self.max_backoff {
            Some(max) => backoff.max_delay(max),
            None => backoff,
        }
    }
}
