use std::env;
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use genkit_opentelemetry::plugin::DEV_ENV_VAR;
use genkit_opentelemetry::{
    Config, Preset, ServerState, SetupStage, SpanExporterSink, StdoutMetricSink, TelemetryError,
    TelemetryPlugin, TelemetryRegistry,
};
use opentelemetry::metrics::MeterProvider as _;
use opentelemetry::trace::{Tracer as _, TracerProvider as _};
use opentelemetry_sdk::trace::InMemorySpanExporter;
use serial_test::serial;
use tracing::Level;

struct EnvGuard {
    vars: Vec<&'static str>,
}

impl EnvGuard {
    fn new(vars: &[&'static str]) -> Self {
        for var in vars {
            env::remove_var(var);
        }
        Self { vars: vars.to_vec() }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for var in &self.vars {
            env::remove_var(var);
        }
    }
}

fn free_port() -> u16 {
    TcpListener::bind(("0.0.0.0", 0))
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Sinks that never touch the network.
fn local_config(exporter: &InMemorySpanExporter) -> Config {
    Config::new("plugin-test")
        .with_trace_exporter(Arc::new(SpanExporterSink::new(exporter.clone())))
        .with_metric_exporter(Arc::new(StdoutMetricSink))
}

fn prometheus_plugin(port: u16) -> TelemetryPlugin {
    let exporter = InMemorySpanExporter::default();
    let custom = Config::default()
        .with_prometheus_endpoint(port)
        .with_trace_exporter(Arc::new(SpanExporterSink::new(exporter)));
    TelemetryPlugin::with_preset(Preset::Prometheus, Some(custom))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn dev_environment_skips_setup() {
    let _guard = EnvGuard::new(&[DEV_ENV_VAR]);
    env::set_var(DEV_ENV_VAR, "dev");
    let registry = TelemetryRegistry::new();
    let plugin = TelemetryPlugin::with_preset(Preset::Prometheus, None);

    plugin.init(&registry).await.unwrap();

    assert!(!registry.is_registered());
    assert!(plugin.metrics_server().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn force_export_runs_every_stage_in_dev() {
    let _guard = EnvGuard::new(&[DEV_ENV_VAR]);
    env::set_var(DEV_ENV_VAR, "dev");
    let exporter = InMemorySpanExporter::default();
    let registry = TelemetryRegistry::new();
    let plugin = TelemetryPlugin::new(local_config(&exporter).with_force_export(true));

    plugin.init(&registry).await.unwrap();

    let tracer_provider = registry.tracer_provider().unwrap();
    tracer_provider.tracer("plugin-test").in_span("forced", |_| {});
    tracer_provider.force_flush().unwrap();
    let spans = exporter.get_finished_spans().unwrap();
    assert_eq!(spans.len(), 1);
    assert_eq!(spans[0].name, "forced");
    assert!(registry.meter_provider().is_some());

    plugin.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn prometheus_preset_serves_metrics() {
    let _guard = EnvGuard::new(&[DEV_ENV_VAR]);
    let port = free_port();
    let registry = TelemetryRegistry::new();
    let plugin = prometheus_plugin(port);

    plugin.init(&registry).await.unwrap();

    let server = plugin.metrics_server().unwrap();
    assert_eq!(server.state(), ServerState::Listening);
    assert_eq!(plugin.metrics_addr().unwrap().port(), port);

    let counter = registry
        .meter_provider()
        .unwrap()
        .meter("plugin-test")
        .u64_counter("scrapes")
        .build();
    counter.add(2, &[]);

    let response = reqwest::get(format!("http://127.0.0.1:{port}/metrics"))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let content_type = response.headers()["content-type"].to_str().unwrap().to_string();
    assert!(content_type.starts_with("text/plain"));
    let body = response.text().await.unwrap();
    assert!(body.contains("# TYPE scrapes_total counter"), "{body}");
    assert!(
        body.contains("scrapes_total{otel_scope_name=\"plugin-test\"} 2"),
        "{body}"
    );

    plugin.shutdown().await.unwrap();
    assert_eq!(server.state(), ServerState::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn bound_port_fails_metrics_stage() {
    let _guard = EnvGuard::new(&[DEV_ENV_VAR]);
    let taken = TcpListener::bind(("0.0.0.0", 0)).unwrap();
    let port = taken.local_addr().unwrap().port();
    let registry = TelemetryRegistry::new();
    let plugin = prometheus_plugin(port);

    let err = plugin.init(&registry).await.unwrap_err();

    assert_eq!(err.stage(), Some(SetupStage::Metrics));
    assert!(err.to_string().starts_with("failed to setup metrics"));
    assert!(err.to_string().contains(&port.to_string()), "{err}");
    assert_eq!(plugin.metrics_server().unwrap().state(), ServerState::Stopped);
    assert!(!registry.is_registered());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn shutdown_runs_once() {
    let _guard = EnvGuard::new(&[DEV_ENV_VAR]);
    let plugin = prometheus_plugin(free_port());
    plugin.init(&TelemetryRegistry::new()).await.unwrap();

    let first = plugin.shutdown().await;
    let second = plugin.shutdown().await;

    assert!(first.is_ok());
    assert_eq!(first, second);
    let server = plugin.metrics_server().unwrap();
    assert_eq!(server.close_attempts(), 1);
    assert_eq!(server.state(), ServerState::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn concurrent_shutdowns_share_one_outcome() {
    let _guard = EnvGuard::new(&[DEV_ENV_VAR]);
    let plugin = prometheus_plugin(free_port());
    plugin.init(&TelemetryRegistry::new()).await.unwrap();

    let other = plugin.clone();
    let (a, b) = tokio::join!(plugin.shutdown(), other.shutdown());

    assert_eq!(a, b);
    assert_eq!(plugin.metrics_server().unwrap().close_attempts(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn registry_accepts_one_plugin() {
    let _guard = EnvGuard::new(&[DEV_ENV_VAR]);
    let registry = TelemetryRegistry::new();
    let first = TelemetryPlugin::new(local_config(&InMemorySpanExporter::default()));
    let second = TelemetryPlugin::new(local_config(&InMemorySpanExporter::default()));

    first.init(&registry).await.unwrap();
    let err = second.init(&registry).await.unwrap_err();

    assert!(matches!(err, TelemetryError::Init(_)));
    first.shutdown().await.unwrap();
    second.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_before_init_is_harmless() {
    let plugin = TelemetryPlugin::new(Config::default());

    assert!(plugin.shutdown().await.is_ok());
    assert!(plugin.metrics_server().is_none());
}

#[test]
fn jaeger_preset_keeps_endpoint_under_override() {
    let plugin = TelemetryPlugin::with_preset(
        Preset::Jaeger,
        Some(Config::default().with_service_name("x")),
    );
    let config = plugin.config();

    assert_eq!(plugin.preset(), Some(Preset::Jaeger));
    assert_eq!(config.service_name, "x");
    assert_eq!(config.otlp_endpoint, "http://localhost:14268/api/traces");
    assert!(config.otlp_use_http);
    assert_eq!(config.metric_interval, Duration::from_secs(30));
    assert_eq!(config.log_level, Some(Level::INFO));
}

#[test]
#[serial]
fn env_override_layers_over_preset() {
    let _guard = EnvGuard::new(&["OTEL_SERVICE_NAME", "OTEL_EXPORTER_OTLP_HEADERS"]);
    env::set_var("OTEL_SERVICE_NAME", "from-env");
    env::set_var("OTEL_EXPORTER_OTLP_HEADERS", "x-tenant=acme");

    let plugin = TelemetryPlugin::with_preset(Preset::Otlp, Some(Config::from_env()));

    assert_eq!(plugin.config().service_name, "from-env");
    assert_eq!(plugin.config().otlp_endpoint, "http://localhost:4317");
    assert_eq!(plugin.config().otlp_headers["x-tenant"], "acme");
}
