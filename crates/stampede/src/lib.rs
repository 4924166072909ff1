// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Single-flight cache regeneration over a shared key-value store.
//!
//! When a popular cache entry expires, every caller that misses at the same moment tends
//! to go to the upstream source at once. This crate lets exactly one of them do so. The
//! callers race for a short-lived lock stored next to the cached value; the winner
//! regenerates the value while everyone else backs off and re-reads the cache.
//!
//! Unlike an in-process single-flight group, the coordination happens through the store,
//! so callers in different processes or on different hosts are deduplicated as long as
//! they share the store.
//!
//! # Protocol
//!
//! For every [`SingleFlightFetcher::fetch`]:
//!
//! 1. Read the cache. A hit returns immediately.
//! 2. Try to create the lock entry atomically, with a TTL.
//! 3. The winner reads the cache once more, since another winner may have just
//!    finished. On a miss it calls the source, writes the value with the cache TTL and
//!    deletes the lock.
//! 4. A loser sleeps for a [`BackoffScheduler`] delay and goes back to step 1, until its
//!    retry budget is spent.
//!
//! The lock TTL bounds how long a crashed winner can block others. If the source takes
//! longer than the lock TTL, a second caller may regenerate the value concurrently; this
//! shows up as a lock overrun in [`RunMetrics`].
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use bytes::Bytes;
//! use stampede::store::memory::MemoryStore;
//! use stampede::{FetcherOptions, SingleFlightFetcher};
//! use tick::Clock;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), stampede::FetchError<std::io::Error>> {
//! let clock = Clock::new_tokio();
//! let store = Arc::new(MemoryStore::new(clock.clone()));
//!
//! let fetcher = SingleFlightFetcher::builder(store, &clock)
//!     .options(FetcherOptions::default().lock_ttl(Duration::from_secs(5)))
//!     .build();
//!
//! let fetched = fetcher
//!     .fetch("report:today", || async {
//!         // expensive upstream call
//!         Ok::<_, std::io::Error>(Bytes::from_static(b"42"))
//!     })
//!     .await?;
//!
//! assert_eq!(fetched.value(), &Bytes::from_static(b"42"));
//! println!("{}", fetcher.metrics().snapshot());
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - `memory` (default): the in-process [`MemoryStore`](store::memory::MemoryStore).
//! - `logs`: structured `tracing` events named `stampede.*`.
//! - `metrics`: OpenTelemetry counters `stampede.fetch.count` and
//!   `stampede.lock.overrun.count`, and histogram `stampede.fetch.duration`.
//! - `serde`: `Serialize`/`Deserialize` for [`FetcherOptions`].

macro_rules! log {
    ($level:ident, $($arg:tt)+) => {{
        #[cfg(any(feature = "logs", test))]
        tracing::$level!($($arg)+);
    }};
}
pub(crate) use log;

mod backoff;
mod error;
mod fetcher;
mod lock;
mod metrics;
mod options;
mod rnd;
pub mod store;
mod telemetry;

pub use backoff::{BackoffScheduler, DEFAULT_BASE_BACKOFF, DEFAULT_MAX_RETRIES};
pub use error::FetchError;
pub use fetcher::{FetcherBuilder, Fetched, SingleFlightFetcher};
pub use lock::{DEFAULT_LOCK_PREFIX, LockManager};
pub use metrics::{
    BucketMetrics, DEFAULT_BUCKET_RETENTION, DEFAULT_LATENCY_SAMPLES, FetchAttempt, LatencySummary, MetricsCollector, Outcome, RunMetrics,
};
pub use options::{DEFAULT_CACHE_TTL, DEFAULT_LOCK_TTL, FetcherOptions, RetryExhausted, StoreOutage};
