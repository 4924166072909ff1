// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Structured logs and OpenTelemetry instruments for completed fetches.
//!
//! Logs are emitted through `tracing` when the `logs` feature is enabled. Metrics are
//! recorded through an OpenTelemetry meter when the `metrics` feature is enabled; the
//! global meter provider is used unless the fetcher builder was given one.

pub(crate) mod attributes;
#[cfg(any(feature = "metrics", test))]
pub(crate) mod metrics;
#[cfg(test)]
pub(crate) mod testing;

#[cfg(any(feature = "metrics", test))]
use opentelemetry::{
    KeyValue,
    metrics::{Counter, Histogram, MeterProvider},
};

use crate::metrics::FetchAttempt;
#[cfg(any(feature = "logs", test))]
use crate::metrics::Outcome;

/// Emits logs and metrics for a fetcher.
#[derive(Clone, Debug, Default)]
pub(crate) struct Telemetry {
    #[cfg(any(feature = "metrics", test))]
    fetch_count: Option<Counter<u64>>,
    #[cfg(any(feature = "metrics", test))]
    fetch_duration: Option<Histogram<f64>>,
    #[cfg(any(feature = "metrics", test))]
    lock_overruns: Option<Counter<u64>>,
}

impl Telemetry {
    /// Telemetry backed by the global meter provider when metrics are compiled in.
    pub fn new() -> Self {
        #[cfg(feature = "metrics")]
        let telemetry = Self::with_meter_provider(opentelemetry::global::meter_provider().as_ref());
        #[cfg(not(feature = "metrics"))]
        let telemetry = Self::default();

        telemetry
    }

    #[cfg(any(feature = "metrics", test))]
    pub fn with_meter_provider(provider: &dyn MeterProvider) -> Self {
        let meter = metrics::create_meter(provider);
        Self {
            fetch_count: Some(metrics::create_fetch_counter(&meter)),
            fetch_duration: Some(metrics::create_fetch_duration_histogram(&meter)),
            lock_overruns: Some(metrics::create_lock_overrun_counter(&meter)),
        }
    }

    /// Records a completed fetch of `key`.
    pub fn record(&self, key: &str, attempt: &FetchAttempt) {
        #[cfg(any(feature = "metrics", test))]
        {
            let attrs = [KeyValue::new(attributes::OUTCOME_NAME, attempt.outcome().as_str())];
            if let Some(counter) = &self.fetch_count {
                counter.add(1, &attrs);
            }
            if let Some(histogram) = &self.fetch_duration {
                histogram.record(attempt.latency().as_secs_f64(), &attrs);
            }
        }

        #[cfg(any(feature = "logs", test))]
        Self::emit(key, attempt);

        #[cfg(not(any(feature = "logs", test)))]
        let _ = key;
        #[cfg(not(any(feature = "logs", feature = "metrics", test)))]
        let _ = attempt;
    }

    /// Records a source call that took `latency` although the lock only lived for `lock_ttl`.
    pub fn record_lock_overrun(&self, key: &str, latency: std::time::Duration, lock_ttl: std::time::Duration) {
        #[cfg(any(feature = "metrics", test))]
        if let Some(counter) = &self.lock_overruns {
            counter.add(1, &[]);
        }

        crate::log!(
            warn,
            stampede.key = key,
            stampede.latency_ms = latency.as_millis(),
            stampede.lock_ttl_ms = lock_ttl.as_millis(),
            "stampede.lock.overrun"
        );

        #[cfg(not(any(feature = "logs", test)))]
        let _ = (key, latency, lock_ttl);
    }

    #[cfg(any(feature = "logs", test))]
    fn emit(key: &str, attempt: &FetchAttempt) {
        let outcome = attempt.outcome().as_str();
        let retries = attempt.retry_count();
        let latency_ms = attempt.latency().as_millis();
        let request_id = attempt.request_id();

        // Tracing level must be constant, so we use a macro to select the appropriate level.
        macro_rules! emit_event {
            ($level:ident) => {
                tracing::$level!(
                    stampede.key = key,
                    stampede.outcome = outcome,
                    stampede.retries = retries,
                    stampede.latency_ms = latency_ms,
                    stampede.request_id = request_id,
                    "stampede.fetch"
                )
            };
        }

        match attempt.outcome() {
            Outcome::CacheHit | Outcome::LockWaitThenHit => emit_event!(debug),
            Outcome::LockAcquiredFetched => emit_event!(info),
            Outcome::Timeout | Outcome::Fallback => emit_event!(warn),
            Outcome::SourceFailed => emit_event!(error),
        }
    }
}
