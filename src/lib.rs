//! OpenTelemetry bootstrap for Genkit services.
//!
//! Builds trace and metric exporters from a [`Config`] or a [`Preset`],
//! installs a structured log handler and, for Prometheus, serves pull
//! metrics on `/metrics`.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use genkit_opentelemetry::{Config, TelemetryPlugin, TelemetryRegistry};
//!
//! let registry = TelemetryRegistry::new();
//! let plugin = TelemetryPlugin::new(Config::new("my-service"));
//! plugin.init(&registry).await?;
//! registry.install_global();
//!
//! // ...
//! plugin.shutdown().await?;
//! ```
//!
//! # Presets
//!
//! | Preset | Traces | Metrics | Metric interval | Log level |
//! |--------|--------|---------|-----------------|-----------|
//! | [`Preset::Otlp`] | OTLP/gRPC `http://localhost:4317` | OTLP/gRPC, same endpoint | 60s | INFO |
//! | [`Preset::Jaeger`] | OTLP/HTTP `http://localhost:14268/api/traces` | OTLP/HTTP, same endpoint | 30s | INFO |
//! | [`Preset::Prometheus`] | OTLP/gRPC `localhost:4317` | pull, `:9090/metrics` | 15s | INFO |
//! | [`Preset::Console`] | OTLP/gRPC `localhost:4317` | stdout | 10s | DEBUG |
//!
//! Setting `OTEL_EXPORTER_OTLP_TRACES_ENDPOINT=stdout` prints spans instead
//! for any preset that does not supply its own trace sink.
//!
//! ```rust,ignore
//! use genkit_opentelemetry::{Config, Preset, TelemetryPlugin};
//!
//! let plugin = TelemetryPlugin::with_preset(
//!     Preset::Jaeger,
//!     Some(Config::default().with_service_name("checkout")),
//! );
//! ```
//!
//! # Environment Variables
//!
//! | Variable | Description |
//! |----------|-------------|
//! | `GENKIT_ENV` | `dev` disables export unless `force_export` is set |
//! | `OTEL_EXPORTER_OTLP_TRACES_ENDPOINT` | `stdout` prints spans |
//! | `OTEL_EXPORTER_OTLP_METRICS_ENDPOINT` | `stdout` prints metrics |
//! | `RUST_LOG` | Overrides the configured log level |
//!
//! [`Config::from_env`] reads the standard `OTEL_*` variables into an
//! override that can be merged over a preset.

pub mod config;
pub mod error;
pub mod exporters;
pub mod logging;
pub mod plugin;
pub mod preset;
pub mod prometheus;
pub mod registry;
pub mod resource;
pub mod shutdown;

pub use config::Config;
pub use error::{SetupStage, TelemetryError};
pub use exporters::{
    default_metric_exporter, default_trace_exporter, resolve_endpoint, ExporterKind,
    MetricExporter, MetricExporterSink, MetricSink, SpanExporterSink, StdoutMetricSink,
    TraceExporter, TraceSink,
};
pub use plugin::TelemetryPlugin;
pub use preset::{preset_config, Preset};
pub use prometheus::{MetricsServer, ServerState};
pub use registry::TelemetryRegistry;
pub use shutdown::ShutdownGate;
