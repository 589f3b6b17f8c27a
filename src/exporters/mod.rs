//! Exporter selection for traces and metrics.
//!
//! The default exporters follow this decision table:
//!
//! | Condition | Exporter |
//! |-----------|----------|
//! | `OTEL_EXPORTER_OTLP_{TRACES,METRICS}_ENDPOINT=stdout` | pretty stdout |
//! | `otlp_use_http` | OTLP/HTTP, TLS from the endpoint scheme |
//! | otherwise | OTLP/gRPC, TLS when the raw endpoint starts with `https://` |
//!
//! Caller-supplied sinks bypass this table entirely; that check is made by
//! the plugin before asking for a default.

pub mod endpoint;
pub mod sink;

use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use std::time::Duration;

use opentelemetry_otlp::{WithExportConfig, WithHttpConfig, WithTonicConfig};
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::trace::SdkTracerProvider;
use opentelemetry_sdk::Resource;
use tonic::metadata::{MetadataKey, MetadataMap, MetadataValue};
use tonic::transport::ClientTlsConfig;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::TelemetryError;

pub use endpoint::{grpc_target, http_target, resolve_endpoint, ExportTarget};
pub use sink::{MetricExporterSink, MetricSink, SpanExporterSink, StdoutMetricSink, TraceSink};

/// Request timeout applied to every OTLP client.
pub const EXPORT_TIMEOUT: Duration = Duration::from_secs(30);

/// Set to `stdout` to print spans instead of exporting them.
pub const TRACES_ENDPOINT_ENV: &str = "OTEL_EXPORTER_OTLP_TRACES_ENDPOINT";

/// Set to `stdout` to print metrics instead of exporting them.
pub const METRICS_ENDPOINT_ENV: &str = "OTEL_EXPORTER_OTLP_METRICS_ENDPOINT";

/// Which branch of the decision table produced an exporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExporterKind {
    Stdout,
    OtlpHttp,
    OtlpGrpc,
    Custom,
}

pub enum TraceExporter {
    Stdout(opentelemetry_stdout::SpanExporter),
    OtlpHttp(opentelemetry_otlp::SpanExporter),
    OtlpGrpc(opentelemetry_otlp::SpanExporter),
    Custom(Arc<dyn TraceSink>),
}

impl TraceExporter {
    pub fn kind(&self) -> ExporterKind {
        match self {
            Self::Stdout(_) => ExporterKind::Stdout,
            Self::OtlpHttp(_) => ExporterKind::OtlpHttp,
            Self::OtlpGrpc(_) => ExporterKind::OtlpGrpc,
            Self::Custom(_) => ExporterKind::Custom,
        }
    }

    /// Build a tracer provider that batches spans into this exporter.
    pub fn into_provider(self, resource: Resource) -> SdkTracerProvider {
        let builder = SdkTracerProvider::builder().with_resource(resource);
        let builder = match self {
            Self::Stdout(exporter) => builder.with_batch_exporter(exporter),
            Self::OtlpHttp(exporter) | Self::OtlpGrpc(exporter) => {
                builder.with_batch_exporter(exporter)
            }
            Self::Custom(sink) => sink.attach(builder),
        };
        builder.build()
    }
}

pub enum MetricExporter {
    Stdout(opentelemetry_stdout::MetricExporter),
    OtlpHttp(opentelemetry_otlp::MetricExporter),
    OtlpGrpc(opentelemetry_otlp::MetricExporter),
    Custom(Arc<dyn MetricSink>),
}

impl MetricExporter {
    pub fn kind(&self) -> ExporterKind {
        match self {
            Self::Stdout(_) => ExporterKind::Stdout,
            Self::OtlpHttp(_) => ExporterKind::OtlpHttp,
            Self::OtlpGrpc(_) => ExporterKind::OtlpGrpc,
            Self::Custom(_) => ExporterKind::Custom,
        }
    }

    /// Build a meter provider that pushes to this exporter every `interval`.
    pub fn into_provider(self, interval: Duration, resource: Resource) -> SdkMeterProvider {
        let builder = SdkMeterProvider::builder().with_resource(resource);
        let builder = match self {
            Self::Stdout(exporter) => {
                builder.with_reader(PeriodicReader::builder(exporter).with_interval(interval).build())
            }
            Self::OtlpHttp(exporter) | Self::OtlpGrpc(exporter) => {
                builder.with_reader(PeriodicReader::builder(exporter).with_interval(interval).build())
            }
            Self::Custom(sink) => sink.attach(builder, interval),
        };
        builder.build()
    }
}

fn stdout_requested(var: &str) -> bool {
    env::var(var).is_ok_and(|value| value == "stdout")
}

/// Build the default trace exporter for `config`.
pub fn default_trace_exporter(config: &Config) -> Result<TraceExporter, TelemetryError> {
    if stdout_requested(TRACES_ENDPOINT_ENV) {
        debug!("Using stdout trace exporter");
        return Ok(TraceExporter::Stdout(opentelemetry_stdout::SpanExporter::default()));
    }

    if config.otlp_use_http {
        let target = http_target(&config.otlp_endpoint);
        let mut builder = opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_endpoint(target.url())
            .with_timeout(EXPORT_TIMEOUT);
        if !config.otlp_headers.is_empty() {
            builder = builder.with_headers(config.otlp_headers.clone());
        }
        debug!(endpoint = %target.url(), tls = target.tls, "Building OTLP/HTTP trace exporter");
        Ok(TraceExporter::OtlpHttp(builder.build()?))
    } else {
        let target = grpc_target(&config.otlp_endpoint);
        let mut builder = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(target.url())
            .with_timeout(EXPORT_TIMEOUT);
        if !config.otlp_headers.is_empty() {
            builder = builder.with_metadata(metadata_from_headers(&config.otlp_headers));
        }
        if target.tls {
            builder = builder.with_tls_config(ClientTlsConfig::new().with_native_roots());
        }
        debug!(endpoint = %target.url(), tls = target.tls, "Building OTLP/gRPC trace exporter");
        Ok(TraceExporter::OtlpGrpc(builder.build()?))
    }
}

/// Build the default metric exporter for `config`.
pub fn default_metric_exporter(config: &Config) -> Result<MetricExporter, TelemetryError> {
    if stdout_requested(METRICS_ENDPOINT_ENV) {
        debug!("Using stdout metric exporter");
        return Ok(MetricExporter::Stdout(opentelemetry_stdout::MetricExporter::default()));
    }

    if config.otlp_use_http {
        let target = http_target(&config.otlp_endpoint);
        let mut builder = opentelemetry_otlp::MetricExporter::builder()
            .with_http()
            .with_endpoint(target.url())
            .with_timeout(EXPORT_TIMEOUT);
        if !config.otlp_headers.is_empty() {
            builder = builder.with_headers(config.otlp_headers.clone());
        }
        debug!(endpoint = %target.url(), tls = target.tls, "Building OTLP/HTTP metric exporter");
        Ok(MetricExporter::OtlpHttp(builder.build()?))
    } else {
        let target = grpc_target(&config.otlp_endpoint);
        let mut builder = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_endpoint(target.url())
            .with_timeout(EXPORT_TIMEOUT);
        if !config.otlp_headers.is_empty() {
            builder = builder.with_metadata(metadata_from_headers(&config.otlp_headers));
        }
        if target.tls {
            builder = builder.with_tls_config(ClientTlsConfig::new().with_native_roots());
        }
        debug!(endpoint = %target.url(), tls = target.tls, "Building OTLP/gRPC metric exporter");
        Ok(MetricExporter::OtlpGrpc(builder.build()?))
    }
}

/// Convert headers to gRPC metadata, skipping pairs that are not valid metadata.
pub fn metadata_from_headers(headers: &HashMap<String, String>) -> MetadataMap {
    let mut metadata = MetadataMap::new();
    for (key, value) in headers {
        match (
            key.to_ascii_lowercase().parse::<MetadataKey<_>>(),
            value.parse::<MetadataValue<_>>(),
        ) {
            (Ok(k), Ok(v)) => {
                metadata.insert(k, v);
            }
            _ => warn!(header = %key, "Skipping header that is not valid gRPC metadata"),
        }
    }
    metadata
}
