use std::env;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::trace::SdkTracerProvider;
use opentelemetry_sdk::Resource;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{SetupStage, TelemetryError};
use crate::exporters::{default_metric_exporter, default_trace_exporter, MetricExporter, TraceExporter};
use crate::logging::init_subscriber;
use crate::preset::{preset_config, Preset};
use crate::prometheus::{MetricsServer, PrometheusExporter, ScrapeTarget, ServerState};
use crate::registry::TelemetryRegistry;
use crate::resource::build_resource;
use crate::shutdown::ShutdownGate;

/// Identifier the plugin registers under.
pub const PROVIDER_ID: &str = "opentelemetry";

/// Set to `dev` to suppress export unless `force_export` is set.
pub const DEV_ENV_VAR: &str = "GENKIT_ENV";

/// Upper bound on a shutdown triggered by SIGINT or SIGTERM.
pub const SIGNAL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Telemetry plugin: builds the tracer and meter providers, the log handler
/// and, for pull metrics, the `/metrics` server.
///
/// Cloning is cheap; clones share the same state.
#[derive(Clone)]
pub struct TelemetryPlugin {
    inner: Arc<Inner>,
}

struct Inner {
    config: Config,
    preset: Option<Preset>,
    server: OnceLock<MetricsServer>,
    providers: OnceLock<(SdkTracerProvider, SdkMeterProvider)>,
    shutdown: ShutdownGate,
    signals: CancellationToken,
    signal_handler: AtomicBool,
}

impl TelemetryPlugin {
    pub fn new(mut config: Config) -> Self {
        config.apply_defaults();
        Self::build(config, None)
    }

    /// Start from `preset` and layer `custom` on top.
    pub fn with_preset(preset: Preset, custom: Option<Config>) -> Self {
        Self::build(preset_config(preset, custom), Some(preset))
    }

    fn build(config: Config, preset: Option<Preset>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                preset,
                server: OnceLock::new(),
                providers: OnceLock::new(),
                shutdown: ShutdownGate::new(),
                signals: CancellationToken::new(),
                signal_handler: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        PROVIDER_ID
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn preset(&self) -> Option<Preset> {
        self.inner.preset
    }

    /// The `/metrics` server, if pull metrics with an endpoint were set up.
    pub fn metrics_server(&self) -> Option<&MetricsServer> {
        self.inner.server.get()
    }

    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics_server().and_then(MetricsServer::local_addr)
    }

    /// Whether `init` installed the SIGINT/SIGTERM handler. Only a listening
    /// `/metrics` server gets one.
    pub fn handles_signals(&self) -> bool {
        self.inner.signal_handler.load(Ordering::SeqCst)
    }

    fn should_export(&self) -> bool {
        self.inner.config.force_export || env::var(DEV_ENV_VAR).map_or(true, |v| v != "dev")
    }

    fn uses_pull_metrics(&self) -> bool {
        self.inner.preset == Some(Preset::Prometheus) || self.inner.config.enable_prometheus_exporter
    }

    /// Set up tracing and metrics, register the providers, then install logging.
    ///
    /// In the dev environment without `force_export` this does nothing. A
    /// failure names the stage it aborted and leaves nothing registered and no
    /// server running.
    pub async fn init(&self, registry: &TelemetryRegistry) -> Result<(), TelemetryError> {
        if !self.should_export() {
            debug!("Dev environment detected, telemetry export disabled");
            return Ok(());
        }
        if self.inner.providers.get().is_some() {
            return Err(TelemetryError::Init("plugin is already initialized".to_string()));
        }
        registry.ensure_vacant()?;

        let resource = build_resource(&self.inner.config);

        let tracer = self
            .setup_tracing(resource.clone())
            .map_err(|e| e.in_stage(SetupStage::Tracing))?;

        let meter = match self.setup_metrics(resource).await {
            Ok(meter) => meter,
            Err(e) => {
                shutdown_providers(Some(tracer), None).await;
                return Err(e.in_stage(SetupStage::Metrics));
            }
        };

        // Logging cannot fail; commit first so a rejected registration never
        // installs a subscriber.
        let committed = registry
            .register(tracer.clone(), meter.clone())
            .and_then(|()| {
                self.inner
                    .providers
                    .set((tracer.clone(), meter.clone()))
                    .map_err(|_| TelemetryError::Init("plugin is already initialized".to_string()))
            });
        if let Err(e) = committed {
            self.stop_server().await;
            shutdown_providers(Some(tracer), Some(meter)).await;
            return Err(e);
        }

        self.setup_logging(&tracer);
        self.install_signal_handler();
        info!(
            service = %self.inner.config.service_name,
            preset = self.inner.preset.map(|p| p.as_str()),
            "OpenTelemetry plugin initialized"
        );
        Ok(())
    }

    fn setup_tracing(&self, resource: Resource) -> Result<SdkTracerProvider, TelemetryError> {
        let exporter = match &self.inner.config.trace_exporter {
            Some(sink) => TraceExporter::Custom(sink.clone()),
            None => default_trace_exporter(&self.inner.config)?,
        };
        debug!(kind = ?exporter.kind(), "Trace exporter selected");
        Ok(exporter.into_provider(resource))
    }

    async fn setup_metrics(&self, resource: Resource) -> Result<SdkMeterProvider, TelemetryError> {
        let config = &self.inner.config;
        if self.uses_pull_metrics() {
            if config.metric_exporter.is_none() {
                return self.setup_prometheus_metrics(resource).await;
            }
            debug!("Custom metric exporter supplied, skipping Prometheus exporter");
        }

        let exporter = match &config.metric_exporter {
            Some(sink) => MetricExporter::Custom(sink.clone()),
            None => default_metric_exporter(config)?,
        };
        debug!(kind = ?exporter.kind(), "Metric exporter selected");
        Ok(exporter.into_provider(config.metric_interval, resource))
    }

    async fn setup_prometheus_metrics(
        &self,
        resource: Resource,
    ) -> Result<SdkMeterProvider, TelemetryError> {
        let config = &self.inner.config;
        let exporter = PrometheusExporter::new();
        let snapshot = exporter.snapshot();
        let reader = PeriodicReader::builder(exporter)
            .with_interval(config.metric_interval)
            .build();
        let provider = SdkMeterProvider::builder()
            .with_resource(resource)
            .with_reader(reader)
            .build();

        if config.enable_prometheus_endpoint {
            let server = self.inner.server.get_or_init(|| {
                MetricsServer::new(
                    config.prometheus_port,
                    ScrapeTarget::new(provider.clone(), snapshot),
                )
            });
            if let Err(e) = server.start().await {
                shutdown_providers(None, Some(provider)).await;
                return Err(e);
            }
        }
        Ok(provider)
    }

    fn setup_logging(&self, tracer: &SdkTracerProvider) {
        let installed = match &self.inner.config.log_handler {
            Some(dispatch) => tracing::dispatcher::set_global_default(dispatch.clone())
                .map_err(|e| e.to_string()),
            None => init_subscriber(tracer, &self.inner.config).map_err(|e| e.to_string()),
        };
        if let Err(e) = installed {
            warn!(error = %e, "Global log handler already set, keeping the existing one");
        }
    }

    fn install_signal_handler(&self) {
        let listening = self
            .metrics_server()
            .is_some_and(|server| server.state() == ServerState::Listening);
        if !listening {
            return;
        }

        let plugin = self.clone();
        let stopped = self.inner.signals.clone();
        self.inner.signal_handler.store(true, Ordering::SeqCst);
        tokio::spawn(async move {
            tokio::select! {
                _ = stopped.cancelled() => return,
                _ = wait_for_signal() => {}
            }
            info!("Received shutdown signal, starting graceful shutdown...");
            match tokio::time::timeout(SIGNAL_SHUTDOWN_TIMEOUT, plugin.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "Error during shutdown"),
                Err(_) => error!("Shutdown did not finish within the signal deadline"),
            }
        });
    }

    async fn stop_server(&self) {
        if let Some(server) = self.metrics_server() {
            if let Err(e) = server.shutdown().await {
                warn!(error = %e, "Failed to stop metrics server after setup failure");
            }
        }
    }

    /// Stop the metrics server and flush the providers. Safe to call many
    /// times; every call returns the outcome of the first.
    ///
    /// The teardown runs on its own task, so it completes even if the caller
    /// stops waiting.
    pub async fn shutdown(&self) -> Result<(), TelemetryError> {
        let plugin = self.clone();
        self.inner
            .shutdown
            .run(move || async move {
                info!("Shutting down OpenTelemetry plugin...");
                plugin.inner.signals.cancel();

                let result = match plugin.metrics_server() {
                    Some(server) => server.shutdown().await,
                    None => Ok(()),
                };

                if let Some((tracer, meter)) = plugin.inner.providers.get() {
                    shutdown_providers(Some(tracer.clone()), Some(meter.clone())).await;
                }
                result
            })
            .await
    }
}

impl std::fmt::Debug for TelemetryPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryPlugin")
            .field("preset", &self.inner.preset)
            .field("service_name", &self.inner.config.service_name)
            .field("metrics_server", &self.inner.server.get())
            .finish()
    }
}

/// Shut providers down on the blocking pool. Failures are logged.
async fn shutdown_providers(tracer: Option<SdkTracerProvider>, meter: Option<SdkMeterProvider>) {
    let joined = tokio::task::spawn_blocking(move || {
        if let Some(tracer) = tracer {
            if let Err(e) = tracer.shutdown() {
                warn!(error = %e, "Failed to shut down tracer provider");
            }
        }
        if let Some(meter) = meter {
            if let Err(e) = meter.shutdown() {
                warn!(error = %e, "Failed to shut down meter provider");
            }
        }
    })
    .await;
    if let Err(e) = joined {
        warn!(error = %e, "Provider shutdown task failed");
    }
}

async fn wait_for_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => {}
        _ = terminate => {}
    }
}
