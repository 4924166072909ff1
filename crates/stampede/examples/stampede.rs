// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Simulates a cache stampede: many concurrent callers miss the same key at once.
//!
//! Three runs are compared:
//!
//! - a lock TTL comfortably above the source latency, where one caller regenerates;
//! - a lock TTL below the source latency, where the lock expires mid-fetch;
//! - a store outage, where every caller falls back to the source.
//!
//! Only warnings and errors are logged, which surfaces lock overruns and outages.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use stampede::store::memory::MemoryStore;
use stampede::{FetcherOptions, MetricsCollector, SingleFlightFetcher};
use tick::Clock;
use tracing_subscriber::Layer;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const CALLERS: usize = 100;
const SOURCE_LATENCY: Duration = Duration::from_millis(200);

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(LevelFilter::WARN))
        .init();

    let clock = Clock::new_tokio();
    let metrics = Arc::new(MetricsCollector::new());

    let healthy = FetcherOptions::default()
        .lock_ttl(SOURCE_LATENCY * 3)
        .base_backoff(Duration::from_millis(50));
    run("lock ttl > source latency", &clock, &metrics, healthy, false).await;

    let short_lock = FetcherOptions::default()
        .lock_ttl(SOURCE_LATENCY / 4)
        .base_backoff(Duration::from_millis(20));
    run("lock ttl < source latency", &clock, &metrics, short_lock, false).await;

    run("store unavailable", &clock, &metrics, FetcherOptions::default(), true).await;
}

async fn run(name: &str, clock: &Clock, metrics: &Arc<MetricsCollector>, options: FetcherOptions, outage: bool) {
    metrics.reset();

    let store = Arc::new(MemoryStore::new(clock.clone()));
    store.set_unavailable(outage);
    let calls = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..CALLERS)
        .map(|_| {
            // each caller gets its own fetcher, as if it ran in a separate process
            let fetcher = SingleFlightFetcher::builder(Arc::clone(&store), clock)
                .options(options.clone())
                .metrics(Arc::clone(metrics))
                .build();
            let (clock, calls) = (clock.clone(), Arc::clone(&calls));

            tokio::spawn(async move {
                fetcher
                    .fetch("report:daily", move || async move {
                        let n = calls.fetch_add(1, Ordering::Relaxed);
                        clock.delay(SOURCE_LATENCY).await;
                        Ok::<_, std::io::Error>(Bytes::from(format!("report #{n}")))
                    })
                    .await
            })
        })
        .collect();

    for task in tasks {
        let _ = task.await.expect("task panicked");
    }

    println!("{name}:");
    println!("  {}", metrics.snapshot());
    println!("  source invoked {} times", calls.load(Ordering::Relaxed));
}
