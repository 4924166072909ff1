// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! In-memory sinks for asserting on emitted metrics and logs.

use std::io::Write;
use std::sync::Arc;

use opentelemetry::KeyValue;
use opentelemetry_sdk::metrics::data::{AggregatedMetrics, Metric, MetricData, ResourceMetrics};
use opentelemetry_sdk::metrics::{InMemoryMetricExporter, SdkMeterProvider};
use parking_lot::Mutex;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;

/// A meter provider whose exports stay in memory.
#[derive(Debug)]
pub(crate) struct MetricTester {
    exporter: InMemoryMetricExporter,
    provider: SdkMeterProvider,
}

impl MetricTester {
    pub fn new() -> Self {
        let exporter = InMemoryMetricExporter::default();
        let provider = SdkMeterProvider::builder().with_periodic_exporter(exporter.clone()).build();
        Self { exporter, provider }
    }

    pub fn meter_provider(&self) -> &SdkMeterProvider {
        &self.provider
    }

    /// Flushes the provider and returns every export so far, oldest first.
    fn exports(&self) -> Vec<ResourceMetrics> {
        self.provider.force_flush().unwrap();
        self.exporter.get_finished_metrics().unwrap()
    }

    /// Sum of the `u64` counter named `name` in the latest export.
    ///
    /// Temporality is cumulative, so the latest export carries the running total.
    pub fn counter_total(&self, name: &str) -> u64 {
        self.exports()
            .last()
            .map(|export| {
                metrics_of(export)
                    .filter(|metric| metric.name() == name)
                    .map(|metric| match metric.data() {
                        AggregatedMetrics::U64(MetricData::Sum(sum)) => sum.data_points().map(|point| point.value()).sum(),
                        _ => 0,
                    })
                    .sum()
            })
            .unwrap_or_default()
    }

    pub fn assert_attributes_contain(&self, expected: &[KeyValue]) {
        let exports = self.exports();
        let seen: Vec<KeyValue> = exports.iter().flat_map(metrics_of).flat_map(attributes_of).collect();

        for attribute in expected {
            assert!(seen.contains(attribute), "missing {attribute:?}, recorded: {seen:?}");
        }
    }
}

fn metrics_of(export: &ResourceMetrics) -> impl Iterator<Item = &Metric> {
    export.scope_metrics().flat_map(|scope| scope.metrics())
}

fn attributes_of(metric: &Metric) -> Vec<KeyValue> {
    match metric.data() {
        AggregatedMetrics::U64(MetricData::Sum(sum)) => sum.data_points().flat_map(|point| point.attributes().cloned()).collect(),
        AggregatedMetrics::F64(MetricData::Histogram(histogram)) => histogram
            .data_points()
            .flat_map(|point| point.attributes().cloned())
            .collect(),
        _ => Vec::new(),
    }
}

/// Formatted `tracing` output collected into a shared buffer.
#[derive(Debug, Clone, Default)]
pub(crate) struct LogCapture {
    lines: Arc<Mutex<Vec<u8>>>,
}

impl LogCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// A subscriber writing into this capture, meant for `tracing::subscriber::set_default`.
    pub fn subscriber(&self) -> impl tracing::Subscriber + use<> {
        tracing_subscriber::registry().with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(self.clone()))
    }

    pub fn assert_contains(&self, needle: &str) {
        let text = String::from_utf8_lossy(&self.lines.lock()).into_owned();
        assert!(text.contains(needle), "expected '{needle}' in captured logs:\n{text}");
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = CaptureWriter;

    fn make_writer(&'a self) -> Self::Writer {
        CaptureWriter(Arc::clone(&self.lines))
    }
}

pub(crate) struct CaptureWriter(Arc<Mutex<Vec<u8>>>);

impl Write for CaptureWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
