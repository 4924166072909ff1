// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::cmp::min;
use std::time::Duration;

use crate::rnd::Rnd;

/// Default delay before the first retry of a waiter.
pub const DEFAULT_BASE_BACKOFF: Duration = Duration::from_millis(100);

/// Default number of backoff delays a waiter sleeps through before giving up.
///
/// With [`DEFAULT_BASE_BACKOFF`] the total wait is 3.1 s plus at most 0.5 s of jitter.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

const EXPONENTIAL_FACTOR: f64 = 2.0;

/// Computes the delays a waiter sleeps between polls of the cache.
///
/// The delay before retry `i` (0-based) is `base * 2^i + jitter`, where the jitter is
/// drawn uniformly from `[0, base)`. The exponential part is deterministic, the jitter
/// spreads out waiters that lost the lock at the same moment. Because the jitter never
/// exceeds `base`, `next_delay(i + 1) >= next_delay(i)` holds for every sample, not only
/// in expectation.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use stampede::BackoffScheduler;
///
/// let backoff = BackoffScheduler::new(Duration::from_millis(100), 5);
///
/// let first = backoff.next_delay(0);
/// assert!(first >= Duration::from_millis(100) && first < Duration::from_millis(200));
///
/// assert_eq!(backoff.delays().count(), 5);
/// assert!(backoff.max_total_wait() < Duration::from_millis(3_700));
/// ```
#[derive(Debug, Clone)]
pub struct BackoffScheduler {
    base: Duration,
    max_retries: u32,
    max_delay: Option<Duration>,
    rnd: Rnd,
}

impl Default for BackoffScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_BACKOFF, DEFAULT_MAX_RETRIES)
    }
}

impl BackoffScheduler {
    /// Creates a scheduler with the given base delay and retry budget.
    #[must_use]
    pub fn new(base: Duration, max_retries: u32) -> Self {
        Self {
            base,
            max_retries,
            max_delay: None,
            rnd: Rnd::default(),
        }
    }

    /// Caps every individual delay at `max_delay`.
    #[must_use]
    pub fn max_delay(self, max_delay: Duration) -> Self {
        Self {
            max_delay: Some(max_delay),
            ..self
        }
    }

    #[cfg(test)]
    pub(crate) fn with_rnd(self, rnd: Rnd) -> Self {
        Self { rnd, ..self }
    }

    /// Returns the base delay.
    #[must_use]
    pub fn base(&self) -> Duration {
        self.base
    }

    /// Returns how many delays a waiter may sleep through.
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Returns the delay to sleep before retry number `attempt_index` (0-based).
    #[must_use]
    pub fn next_delay(&self, attempt_index: u32) -> Duration {
        if self.base.is_zero() {
            return Duration::ZERO;
        }

        let growth = duration_mul_pow2(self.base, attempt_index);
        let jitter = secs_to_duration_saturating(self.base.as_secs_f64() * self.rnd.next_f64().clamp(0.0, 1.0));
        // a sample of exactly 1.0 from a scripted source must still stay below `base`
        let jitter = if jitter >= self.base {
            self.base.saturating_sub(Duration::from_nanos(1))
        } else {
            jitter
        };

        clamp_to_max(growth.saturating_add(jitter), self.max_delay)
    }

    /// Returns the full delay schedule, one delay per allowed retry.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.max_retries).map(|attempt| self.next_delay(attempt))
    }

    /// Returns an upper bound for the total time a waiter spends sleeping.
    #[must_use]
    pub fn max_total_wait(&self) -> Duration {
        (0..self.max_retries)
            .map(|attempt| {
                let worst = duration_mul_pow2(self.base, attempt).saturating_add(self.base);
                clamp_to_max(worst, self.max_delay)
            })
            .fold(Duration::ZERO, Duration::saturating_add)
    }
}

fn clamp_to_max(d: Duration, max: Option<Duration>) -> Duration {
    max.map_or(d, |m| min(d, m))
}

fn duration_mul_pow2(base: Duration, attempt: u32) -> Duration {
    let factor = EXPONENTIAL_FACTOR.powi(i32::try_from(attempt).unwrap_or(i32::MAX));
    secs_to_duration_saturating(base.as_secs_f64() * factor)
}

fn secs_to_duration_saturating(secs: f64) -> Duration {
    if secs <= 0.0 {
        return Duration::ZERO;
    }

    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}
