use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing::Subscriber;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::Config;

/// Build the layer that turns tracing spans into OpenTelemetry spans.
pub fn build_otel_layer<S>(provider: &SdkTracerProvider, service_name: &str) -> impl Layer<S>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    let tracer = provider.tracer(service_name.to_string());
    tracing_opentelemetry::layer().with_tracer(tracer)
}

/// `RUST_LOG` wins; otherwise the configured minimum level.
pub fn build_filter(config: &Config) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(config.effective_log_level().as_str().to_ascii_lowercase())
    })
}

/// Structured JSON records on stdout.
pub fn build_json_layer<S>() -> impl Layer<S>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    tracing_subscriber::fmt::layer()
        .json()
        .with_ansi(false)
        .with_target(true)
        .with_current_span(true)
}

/// Install the default log handler as the global subscriber.
///
/// Fails only when a global subscriber is already set.
pub fn init_subscriber(provider: &SdkTracerProvider, config: &Config) -> Result<(), TryInitError> {
    tracing_subscriber::registry()
        .with(build_filter(config))
        .with(build_otel_layer(provider, &config.service_name))
        .with(build_json_layer())
        .try_init()
}
