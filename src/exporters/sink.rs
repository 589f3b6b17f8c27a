use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use opentelemetry_sdk::metrics::exporter::PushMetricExporter;
use opentelemetry_sdk::metrics::{MeterProviderBuilder, PeriodicReader};
use opentelemetry_sdk::trace::{SpanExporter, TracerProviderBuilder};
use tracing::warn;

/// A caller-supplied trace destination.
///
/// Sinks attach themselves to the tracer provider being built, which keeps
/// them object safe while the SDK exporter traits are not.
pub trait TraceSink: Send + Sync + fmt::Debug {
    fn attach(&self, builder: TracerProviderBuilder) -> TracerProviderBuilder;
}

/// A caller-supplied metric destination, read at `interval`.
pub trait MetricSink: Send + Sync + fmt::Debug {
    fn attach(&self, builder: MeterProviderBuilder, interval: Duration) -> MeterProviderBuilder;
}

/// Wraps any SDK span exporter as a [`TraceSink`] behind a batch processor.
///
/// The exporter is moved into the first provider it is attached to.
pub struct SpanExporterSink<E> {
    exporter: Mutex<Option<E>>,
}

impl<E> SpanExporterSink<E> {
    pub fn new(exporter: E) -> Self {
        Self {
            exporter: Mutex::new(Some(exporter)),
        }
    }
}

impl<E> fmt::Debug for SpanExporterSink<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpanExporterSink")
            .field("type", &std::any::type_name::<E>())
            .finish()
    }
}

impl<E: SpanExporter + 'static> TraceSink for SpanExporterSink<E> {
    fn attach(&self, builder: TracerProviderBuilder) -> TracerProviderBuilder {
        let taken = self
            .exporter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match taken {
            Some(exporter) => builder.with_batch_exporter(exporter),
            None => {
                warn!(sink = ?self, "Span exporter already attached to another provider");
                builder
            }
        }
    }
}

/// Wraps any SDK push metric exporter as a [`MetricSink`] behind a periodic reader.
///
/// The exporter is moved into the first provider it is attached to.
pub struct MetricExporterSink<E> {
    exporter: Mutex<Option<E>>,
}

impl<E> MetricExporterSink<E> {
    pub fn new(exporter: E) -> Self {
        Self {
            exporter: Mutex::new(Some(exporter)),
        }
    }
}

impl<E> fmt::Debug for MetricExporterSink<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricExporterSink")
            .field("type", &std::any::type_name::<E>())
            .finish()
    }
}

impl<E: PushMetricExporter> MetricSink for MetricExporterSink<E> {
    fn attach(&self, builder: MeterProviderBuilder, interval: Duration) -> MeterProviderBuilder {
        let taken = self
            .exporter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match taken {
            Some(exporter) => {
                let reader = PeriodicReader::builder(exporter)
                    .with_interval(interval)
                    .build();
                builder.with_reader(reader)
            }
            None => {
                warn!(sink = ?self, "Metric exporter already attached to another provider");
                builder
            }
        }
    }
}

/// Human-readable metrics on stdout. Used by the console preset.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdoutMetricSink;

impl MetricSink for StdoutMetricSink {
    fn attach(&self, builder: MeterProviderBuilder, interval: Duration) -> MeterProviderBuilder {
        let reader = PeriodicReader::builder(opentelemetry_stdout::MetricExporter::default())
            .with_interval(interval)
            .build();
        builder.with_reader(reader)
    }
}
