//! Pull-based metrics for Prometheus.
//!
//! Selected by the `prometheus` preset or by `enable_prometheus_exporter`.
//! Collections are rendered to the text exposition format and, when
//! `enable_prometheus_endpoint` is set, served on `/metrics`.
//!
//! # Example
//!
//! ```rust,ignore
//! use genkit_opentelemetry::{Preset, TelemetryPlugin, TelemetryRegistry};
//!
//! let plugin = TelemetryPlugin::with_preset(Preset::Prometheus, None);
//! plugin.init(&TelemetryRegistry::new()).await?;
//! // curl http://localhost:9090/metrics
//! ```

mod exporter;
mod server;

pub use exporter::{
    encode, gather, sanitize_name, MetricsSnapshot, PrometheusExporter, EXPOSITION_CONTENT_TYPE,
    SCOPE_LABEL,
};
pub use server::{
    MetricsServer, ScrapeTarget, ServerState, DRAIN_TIMEOUT, GRACEFUL_SHUTDOWN_TIMEOUT,
    METRICS_PATH, STARTUP_TIMEOUT,
};
