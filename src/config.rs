use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use std::time::Duration;

use tracing::Level;

use crate::exporters::{MetricSink, TraceSink};

pub const DEFAULT_METRIC_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_LOG_LEVEL: Level = Level::INFO;
pub const DEFAULT_OTLP_ENDPOINT: &str = "localhost:4317";
pub const DEFAULT_SERVICE_NAME: &str = "genkit-service";
pub const DEFAULT_PROMETHEUS_PORT: u16 = 9090;

/// Plugin configuration.
///
/// Zero values (`false`, empty strings, zero durations and ports, `None`)
/// mean "unset": [`Config::apply_defaults`] fills them and [`Config::merge`]
/// never copies them over a base value.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Export even in the dev environment.
    pub force_export: bool,
    /// How often metrics are pushed. Defaults to 60 seconds.
    pub metric_interval: Duration,
    /// Minimum level for the default log handler. Defaults to INFO.
    pub log_level: Option<Level>,
    /// Replaces the default trace exporter.
    pub trace_exporter: Option<Arc<dyn TraceSink>>,
    /// Replaces the default metric exporter.
    pub metric_exporter: Option<Arc<dyn MetricSink>>,
    /// Replaces the default structured log handler.
    pub log_handler: Option<tracing::Dispatch>,
    /// `host:port` for gRPC, or a full `http(s)://` URL. Defaults to `localhost:4317`.
    pub otlp_endpoint: String,
    /// Use OTLP/HTTP instead of gRPC.
    pub otlp_use_http: bool,
    pub otlp_headers: HashMap<String, String>,
    /// Defaults to `genkit-service`.
    pub service_name: String,
    pub service_version: String,
    pub resource_attributes: HashMap<String, String>,
    /// Serve `/metrics` for Prometheus scraping.
    pub enable_prometheus_endpoint: bool,
    /// Defaults to 9090.
    pub prometheus_port: u16,
    /// Use the Prometheus metrics setup regardless of preset.
    pub enable_prometheus_exporter: bool,
}

impl Config {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Self::default()
        }
    }

    /// Build an override from the standard OpenTelemetry environment variables.
    ///
    /// Variables that are absent leave their field unset, so the result can be
    /// merged over a preset.
    /// - `OTEL_SERVICE_NAME`, `OTEL_SERVICE_VERSION`
    /// - `OTEL_EXPORTER_OTLP_ENDPOINT`
    /// - `OTEL_EXPORTER_OTLP_PROTOCOL`: `http/protobuf` or `http/json` selects HTTP
    /// - `OTEL_EXPORTER_OTLP_HEADERS`, `OTEL_RESOURCE_ATTRIBUTES`: `k=v,k2=v2`
    pub fn from_env() -> Self {
        Self {
            service_name: env::var("OTEL_SERVICE_NAME").unwrap_or_default(),
            service_version: env::var("OTEL_SERVICE_VERSION").unwrap_or_default(),
            otlp_endpoint: env::var("OTEL_EXPORTER_OTLP_ENDPOINT").unwrap_or_default(),
            otlp_use_http: matches!(
                env::var("OTEL_EXPORTER_OTLP_PROTOCOL").as_deref(),
                Ok("http/protobuf") | Ok("http/json")
            ),
            otlp_headers: env::var("OTEL_EXPORTER_OTLP_HEADERS")
                .map(|raw| parse_key_value_list(&raw))
                .unwrap_or_default(),
            resource_attributes: env::var("OTEL_RESOURCE_ATTRIBUTES")
                .map(|raw| parse_key_value_list(&raw))
                .unwrap_or_default(),
            ..Self::default()
        }
    }

    /// Fill every unset field with its default. Idempotent.
    ///
    /// Sinks stay `None`: that is the signal to build the default exporter.
    pub fn apply_defaults(&mut self) {
        if self.metric_interval.is_zero() {
            self.metric_interval = DEFAULT_METRIC_INTERVAL;
        }
        if self.log_level.is_none() {
            self.log_level = Some(DEFAULT_LOG_LEVEL);
        }
        if self.otlp_endpoint.is_empty() {
            self.otlp_endpoint = DEFAULT_OTLP_ENDPOINT.to_string();
        }
        if self.service_name.is_empty() {
            self.service_name = DEFAULT_SERVICE_NAME.to_string();
        }
        if self.prometheus_port == 0 {
            self.prometheus_port = DEFAULT_PROMETHEUS_PORT;
        }
    }

    /// Layer `custom` over `self`, field by field.
    ///
    /// A field of `custom` wins only when it is set (non-zero). Header and
    /// resource attribute maps are merged key by key, with `custom` winning on
    /// collisions.
    ///
    /// Because zero means unset, an override cannot turn a flag back to
    /// `false` or clear a string. Build the base config directly instead.
    pub fn merge(&mut self, custom: Config) {
        if custom.force_export {
            self.force_export = true;
        }
        if !custom.metric_interval.is_zero() {
            self.metric_interval = custom.metric_interval;
        }
        if custom.log_level.is_some() {
            self.log_level = custom.log_level;
        }
        if custom.trace_exporter.is_some() {
            self.trace_exporter = custom.trace_exporter;
        }
        if custom.metric_exporter.is_some() {
            self.metric_exporter = custom.metric_exporter;
        }
        if custom.log_handler.is_some() {
            self.log_handler = custom.log_handler;
        }
        if !custom.otlp_endpoint.is_empty() {
            self.otlp_endpoint = custom.otlp_endpoint;
        }
        if custom.otlp_use_http {
            self.otlp_use_http = true;
        }
        self.otlp_headers.extend(custom.otlp_headers);
        if !custom.service_name.is_empty() {
            self.service_name = custom.service_name;
        }
        if !custom.service_version.is_empty() {
            self.service_version = custom.service_version;
        }
        self.resource_attributes.extend(custom.resource_attributes);
        if custom.enable_prometheus_endpoint {
            self.enable_prometheus_endpoint = true;
        }
        if custom.prometheus_port != 0 {
            self.prometheus_port = custom.prometheus_port;
        }
        if custom.enable_prometheus_exporter {
            self.enable_prometheus_exporter = true;
        }
    }

    /// The configured log level, falling back to the default when unset.
    pub fn effective_log_level(&self) -> Level {
        self.log_level.unwrap_or(DEFAULT_LOG_LEVEL)
    }

    pub fn with_force_export(mut self, force: bool) -> Self {
        self.force_export = force;
        self
    }

    pub fn with_metric_interval(mut self, interval: Duration) -> Self {
        self.metric_interval = interval;
        self
    }

    pub fn with_log_level(mut self, level: Level) -> Self {
        self.log_level = Some(level);
        self
    }

    pub fn with_trace_exporter(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.trace_exporter = Some(sink);
        self
    }

    pub fn with_metric_exporter(mut self, sink: Arc<dyn MetricSink>) -> Self {
        self.metric_exporter = Some(sink);
        self
    }

    pub fn with_log_handler(mut self, dispatch: tracing::Dispatch) -> Self {
        self.log_handler = Some(dispatch);
        self
    }

    pub fn with_otlp_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.otlp_endpoint = endpoint.into();
        self
    }

    pub fn with_otlp_http(mut self, use_http: bool) -> Self {
        self.otlp_use_http = use_http;
        self
    }

    pub fn with_otlp_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.otlp_headers.insert(key.into(), value.into());
        self
    }

    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    pub fn with_service_version(mut self, version: impl Into<String>) -> Self {
        self.service_version = version.into();
        self
    }

    pub fn with_resource_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.resource_attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_prometheus_endpoint(mut self, port: u16) -> Self {
        self.enable_prometheus_endpoint = true;
        self.prometheus_port = port;
        self
    }

    pub fn with_prometheus_exporter(mut self, enabled: bool) -> Self {
        self.enable_prometheus_exporter = enabled;
        self
    }
}

/// Parse `k=v,k2=v2`. Pairs without `=` or with an empty key are skipped.
fn parse_key_value_list(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            let key = key.trim();
            (!key.is_empty()).then(|| (key.to_string(), value.trim().to_string()))
        })
        .collect()
}
