// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use opentelemetry::InstrumentationScope;
use opentelemetry::metrics::{Counter, Histogram, Meter, MeterProvider};

const METER_NAME: &str = "stampede";
const VERSION: &str = "v0.1.0";
const SCHEMA_URL: &str = "https://opentelemetry.io/schemas/1.47.0";
pub(crate) const FETCH_COUNT_NAME: &str = "stampede.fetch.count";
pub(crate) const FETCH_DURATION_NAME: &str = "stampede.fetch.duration";
pub(crate) const LOCK_OVERRUN_COUNT_NAME: &str = "stampede.lock.overrun.count";

pub(crate) fn create_meter(meter_provider: &dyn MeterProvider) -> Meter {
    meter_provider.meter_with_scope(
        InstrumentationScope::builder(METER_NAME)
            .with_version(VERSION)
            .with_schema_url(SCHEMA_URL)
            .build(),
    )
}

pub(crate) fn create_fetch_counter(meter: &Meter) -> Counter<u64> {
    meter
        .u64_counter(FETCH_COUNT_NAME)
        .with_description("Completed fetches by outcome")
        .with_unit("{fetch}")
        .build()
}

pub(crate) fn create_fetch_duration_histogram(meter: &Meter) -> Histogram<f64> {
    meter
        .f64_histogram(FETCH_DURATION_NAME)
        .with_description("Time from the start of a fetch until it returned")
        .with_unit("s")
        .build()
}

pub(crate) fn create_lock_overrun_counter(meter: &Meter) -> Counter<u64> {
    meter
        .u64_counter(LOCK_OVERRUN_COUNT_NAME)
        .with_description("Source calls that outlived the regeneration lock")
        .with_unit("{fetch}")
        .build()
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
#[cfg(not(miri))]
mod tests {
    use opentelemetry_sdk::metrics::{InMemoryMetricExporter, SdkMeterProvider};

    use super::*;

    #[test]
    fn assert_definitions() {
        let exporter = InMemoryMetricExporter::default();
        let meter_provider = SdkMeterProvider::builder().with_periodic_exporter(exporter.clone()).build();

        let meter = create_meter(&meter_provider);
        create_fetch_counter(&meter).add(1, &[]);
        create_fetch_duration_histogram(&meter).record(0.5, &[]);
        create_lock_overrun_counter(&meter).add(1, &[]);

        meter_provider.force_flush().unwrap();

        let metrics = exporter.get_finished_metrics().unwrap();
        let str = format!("{metrics:?}");

        assert!(str.contains(FETCH_COUNT_NAME));
        assert!(str.contains(FETCH_DURATION_NAME));
        assert!(str.contains(LOCK_OVERRUN_COUNT_NAME));
        assert!(str.contains("stampede"));
        assert!(str.contains("v0.1.0"));
        assert!(str.contains("https://opentelemetry.io/schemas/1.47"));
    }
}
