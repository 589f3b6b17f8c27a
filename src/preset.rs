use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::Level;

use crate::config::{Config, DEFAULT_PROMETHEUS_PORT, DEFAULT_SERVICE_NAME};
use crate::exporters::StdoutMetricSink;

pub const JAEGER_ENDPOINT: &str = "http://localhost:14268/api/traces";
pub const OTLP_ENDPOINT: &str = "http://localhost:4317";

/// Ready-made setups for common backends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum Preset {
    /// OTLP over gRPC to a local collector.
    #[default]
    Otlp,
    /// OTLP over HTTP to a local Jaeger.
    Jaeger,
    /// Pull metrics served on `/metrics`.
    Prometheus,
    /// Pretty stdout output for development. Always exports.
    Console,
}

impl Preset {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Otlp => "otlp",
            Self::Jaeger => "jaeger",
            Self::Prometheus => "prometheus",
            Self::Console => "console",
        }
    }

    /// Look a preset up by name. Unknown names select [`Preset::Otlp`].
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "jaeger" => Self::Jaeger,
            "prometheus" => Self::Prometheus,
            "console" => Self::Console,
            _ => Self::Otlp,
        }
    }

    /// The fully defaulted configuration for this preset.
    pub fn config(&self) -> Config {
        let mut config = match self {
            Self::Jaeger => Config {
                otlp_endpoint: JAEGER_ENDPOINT.to_string(),
                otlp_use_http: true,
                service_name: DEFAULT_SERVICE_NAME.to_string(),
                metric_interval: Duration::from_secs(30),
                log_level: Some(Level::INFO),
                ..Config::default()
            },
            Self::Prometheus => Config {
                service_name: DEFAULT_SERVICE_NAME.to_string(),
                // Prometheus scrapes frequently.
                metric_interval: Duration::from_secs(15),
                log_level: Some(Level::INFO),
                enable_prometheus_endpoint: true,
                prometheus_port: DEFAULT_PROMETHEUS_PORT,
                enable_prometheus_exporter: true,
                ..Config::default()
            },
            Self::Console => Config {
                service_name: DEFAULT_SERVICE_NAME.to_string(),
                metric_interval: Duration::from_secs(10),
                log_level: Some(Level::DEBUG),
                force_export: true,
                metric_exporter: Some(Arc::new(StdoutMetricSink)),
                ..Config::default()
            },
            Self::Otlp => Config {
                otlp_endpoint: OTLP_ENDPOINT.to_string(),
                otlp_use_http: false,
                service_name: DEFAULT_SERVICE_NAME.to_string(),
                metric_interval: Duration::from_secs(60),
                log_level: Some(Level::INFO),
                ..Config::default()
            },
        };
        config.apply_defaults();
        config
    }
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Preset {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_name(s))
    }
}

impl From<String> for Preset {
    fn from(name: String) -> Self {
        Self::from_name(&name)
    }
}

/// The preset configuration with `custom` merged on top.
pub fn preset_config(preset: Preset, custom: Option<Config>) -> Config {
    let mut config = preset.config();
    if let Some(custom) = custom {
        config.merge(custom);
    }
    config.apply_defaults();
    config
}
