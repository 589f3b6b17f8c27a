use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError};
use std::time::Duration;

use actix_web::dev::ServerHandle;
use actix_web::{web, App, HttpResponse, HttpServer};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::error::TelemetryError;
use crate::prometheus::exporter::{MetricsSnapshot, EXPOSITION_CONTENT_TYPE};

pub const METRICS_PATH: &str = "/metrics";

/// How long `start` waits for the listener to bind.
pub const STARTUP_TIMEOUT: Duration = Duration::from_secs(5);
/// Deadline for a graceful close of the listener.
pub const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
/// How long `shutdown` waits for background tasks to exit.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Unstarted,
    Starting,
    Listening,
    ShuttingDown,
    Stopped,
}

/// What a scrape reads from.
#[derive(Debug, Clone)]
pub struct ScrapeTarget {
    provider: SdkMeterProvider,
    snapshot: MetricsSnapshot,
}

impl ScrapeTarget {
    pub fn new(provider: SdkMeterProvider, snapshot: MetricsSnapshot) -> Self {
        Self { provider, snapshot }
    }
}

struct Listening {
    handle: ServerHandle,
    local_addr: SocketAddr,
}

/// Background HTTP listener serving `/metrics` for Prometheus scrapes.
///
/// Two tasks run while listening: the server itself, and a watcher that
/// closes the server when the cancellation token fires. Both are tracked so
/// [`MetricsServer::shutdown`] can wait for them.
pub struct MetricsServer {
    port: u16,
    target: ScrapeTarget,
    state: Mutex<ServerState>,
    listening: OnceLock<Listening>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    close_attempts: AtomicUsize,
    startup_timeout: Duration,
    graceful_timeout: Duration,
}

impl MetricsServer {
    pub fn new(port: u16, target: ScrapeTarget) -> Self {
        Self {
            port,
            target,
            state: Mutex::new(ServerState::Unstarted),
            listening: OnceLock::new(),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            close_attempts: AtomicUsize::new(0),
            startup_timeout: STARTUP_TIMEOUT,
            graceful_timeout: GRACEFUL_SHUTDOWN_TIMEOUT,
        }
    }

    /// Override how long `start` waits for the bind. Defaults to [`STARTUP_TIMEOUT`].
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Override the graceful close deadline. Defaults to [`GRACEFUL_SHUTDOWN_TIMEOUT`].
    pub fn with_graceful_timeout(mut self, timeout: Duration) -> Self {
        self.graceful_timeout = timeout;
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> ServerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The bound address, once listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listening.get().map(|l| l.local_addr)
    }

    /// Number of times shutdown asked the listener to close.
    pub fn close_attempts(&self) -> usize {
        self.close_attempts.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: ServerState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Bind the port and start serving. Returns once the port is bound.
    ///
    /// If binding takes longer than the startup timeout an error is returned
    /// but the background attempt is not cancelled; it may still come up
    /// later, and [`MetricsServer::shutdown`] will still close it.
    pub async fn start(&self) -> Result<SocketAddr, TelemetryError> {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state != ServerState::Unstarted {
                return Err(TelemetryError::Server(format!(
                    "metrics server on port {} was already started",
                    self.port
                )));
            }
            *state = ServerState::Starting;
        }

        let (ready_tx, ready_rx) = oneshot::channel();
        self.tracker.spawn(serve(
            self.port,
            self.target.clone(),
            self.cancel.clone(),
            self.tracker.clone(),
            self.graceful_timeout,
            ready_tx,
        ));

        self.await_listening(ready_rx).await
    }

    async fn await_listening(
        &self,
        ready_rx: oneshot::Receiver<std::io::Result<Listening>>,
    ) -> Result<SocketAddr, TelemetryError> {
        let ready = match tokio::time::timeout(self.startup_timeout, ready_rx).await {
            Ok(Ok(ready)) => ready,
            Ok(Err(_)) => Err(std::io::Error::other("server task exited before binding")),
            Err(_) => {
                warn!(port = self.port, "Abandoning slow Prometheus metrics server startup");
                self.set_state(ServerState::Stopped);
                return Err(TelemetryError::Server(format!(
                    "timeout waiting for Prometheus metrics server to start on port {}",
                    self.port
                )));
            }
        };

        match ready {
            Ok(listening) => {
                let local_addr = listening.local_addr;
                let _ = self.listening.set(listening);
                self.set_state(ServerState::Listening);
                info!(port = self.port, "Prometheus metrics server started successfully");
                Ok(local_addr)
            }
            Err(e) => {
                self.set_state(ServerState::Stopped);
                Err(TelemetryError::Server(format!(
                    "failed to start Prometheus metrics server on port {}: {}",
                    self.port, e
                )))
            }
        }
    }

    /// Close the listener and wait for the background tasks to exit.
    ///
    /// The graceful close is bounded by the graceful timeout and its
    /// failure is returned. Waiting for the tasks is bounded by
    /// [`DRAIN_TIMEOUT`]; running out of time there is only logged.
    pub async fn shutdown(&self) -> Result<(), TelemetryError> {
        self.cancel.cancel();

        let result = match self.listening.get() {
            Some(listening) => {
                self.set_state(ServerState::ShuttingDown);
                self.close_attempts.fetch_add(1, Ordering::SeqCst);
                info!(port = self.port, "Shutting down Prometheus metrics server...");
                match tokio::time::timeout(self.graceful_timeout, listening.handle.stop(true))
                    .await
                {
                    Ok(()) => {
                        info!("Prometheus metrics server shut down successfully");
                        Ok(())
                    }
                    Err(_) => {
                        error!(port = self.port, "Error shutting down Prometheus metrics server");
                        Err(TelemetryError::Shutdown(format!(
                            "failed to shutdown Prometheus server on port {}: graceful close timed out",
                            self.port
                        )))
                    }
                }
            }
            None => Ok(()),
        };

        self.tracker.close();
        match tokio::time::timeout(DRAIN_TIMEOUT, self.tracker.wait()).await {
            Ok(()) => info!("All telemetry servers stopped"),
            Err(_) => warn!("Timeout waiting for telemetry servers to stop"),
        }

        self.set_state(ServerState::Stopped);
        result
    }
}

impl fmt::Debug for MetricsServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsServer")
            .field("port", &self.port)
            .field("state", &self.state())
            .field("local_addr", &self.local_addr())
            .finish()
    }
}

/// Bind, report readiness, then serve until the server stops.
async fn serve(
    port: u16,
    target: ScrapeTarget,
    cancel: CancellationToken,
    tracker: TaskTracker,
    graceful_timeout: Duration,
    ready: oneshot::Sender<std::io::Result<Listening>>,
) {
    info!(port, endpoint = METRICS_PATH, "Starting Prometheus metrics server");

    // Bind before signalling so readiness means the port is actually held.
    let listener = match std::net::TcpListener::bind(("0.0.0.0", port)) {
        Ok(listener) => listener,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let local_addr = match listener.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    // The builder is not Send; only the running `Server` may live across awaits.
    let server = {
        let data = web::Data::new(target);
        let builder = HttpServer::new(move || {
            App::new()
                .app_data(data.clone())
                .route(METRICS_PATH, web::get().to(metrics_handler))
        })
        .workers(1)
        .shutdown_timeout(GRACEFUL_SHUTDOWN_TIMEOUT.as_secs())
        .disable_signals()
        .listen(listener);
        match builder {
            Ok(builder) => builder.run(),
            Err(e) => {
                let _ = ready.send(Err(e));
                return;
            }
        }
    };
    let handle = server.handle();

    tracker.spawn({
        let handle = handle.clone();
        async move {
            cancel.cancelled().await;
            if tokio::time::timeout(graceful_timeout, handle.stop(true))
                .await
                .is_err()
            {
                warn!(port, "Prometheus metrics server did not close in time after cancellation");
            }
        }
    });

    if ready.send(Ok(Listening { handle, local_addr })).is_err() {
        warn!(port, "Metrics server came up after its caller stopped waiting");
    }

    if let Err(e) = server.await {
        error!(error = %e, "Prometheus metrics server failed");
    }
}

async fn metrics_handler(target: web::Data<ScrapeTarget>) -> HttpResponse {
    let provider = target.provider.clone();
    match web::block(move || provider.force_flush()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "Failed to collect metrics for scrape"),
        Err(e) => warn!(error = %e, "Metrics collection task failed"),
    }
    HttpResponse::Ok()
        .content_type(EXPOSITION_CONTENT_TYPE)
        .body(target.snapshot.read())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prometheus::exporter::PrometheusExporter;
    use opentelemetry_sdk::metrics::PeriodicReader;

    fn target() -> ScrapeTarget {
        let exporter = PrometheusExporter::new();
        let snapshot = exporter.snapshot();
        let provider = SdkMeterProvider::builder()
            .with_reader(PeriodicReader::builder(exporter).build())
            .build();
        ScrapeTarget::new(provider, snapshot)
    }

    /// Complete one scrape and leave the keep-alive connection open.
    async fn hold_connection(port: u16) -> std::net::TcpStream {
        use std::io::{Read, Write};

        tokio::task::spawn_blocking(move || {
            let mut stream = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
            stream
                .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\n\r\n")
                .unwrap();
            let mut buf = [0u8; 4096];
            let n = stream.read(&mut buf).unwrap();
            assert!(buf[..n].starts_with(b"HTTP/1.1 200"));
            stream
        })
        .await
        .unwrap()
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind(("0.0.0.0", 0))
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn starts_listening_then_stops() {
        let port = free_port();
        let server = MetricsServer::new(port, target());
        assert_eq!(server.state(), ServerState::Unstarted);

        let addr = server.start().await.unwrap();
        assert_eq!(addr.port(), port);
        assert_eq!(server.state(), ServerState::Listening);

        server.shutdown().await.unwrap();
        assert_eq!(server.state(), ServerState::Stopped);
        assert_eq!(server.close_attempts(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn bind_failure_names_the_port() {
        let taken = std::net::TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let port = taken.local_addr().unwrap().port();
        let server = MetricsServer::new(port, target());

        let err = server.start().await.unwrap_err();

        assert!(matches!(err, TelemetryError::Server(_)));
        assert!(err.to_string().contains(&port.to_string()));
        assert_eq!(server.state(), ServerState::Stopped);
        assert!(server.local_addr().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cannot_start_twice() {
        let server = MetricsServer::new(free_port(), target());
        server.start().await.unwrap();

        assert!(server.start().await.is_err());

        server.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slow_bind_times_out_and_stops() {
        let port = free_port();
        let server =
            MetricsServer::new(port, target()).with_startup_timeout(Duration::from_millis(10));
        *server.state.lock().unwrap() = ServerState::Starting;
        let (_ready_tx, ready_rx) = oneshot::channel();

        let err = server.await_listening(ready_rx).await.unwrap_err();

        assert!(matches!(err, TelemetryError::Server(_)));
        assert!(err.to_string().starts_with("timeout waiting"), "{err}");
        assert!(err.to_string().contains(&port.to_string()), "{err}");
        assert_eq!(server.state(), ServerState::Stopped);
        assert!(server.local_addr().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn open_connection_fails_graceful_close() {
        let port = free_port();
        let server =
            MetricsServer::new(port, target()).with_graceful_timeout(Duration::from_millis(100));
        server.start().await.unwrap();
        let client = hold_connection(port).await;
        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            drop(client);
        });

        let err = server.shutdown().await.unwrap_err();
        release.await.unwrap();

        assert!(matches!(err, TelemetryError::Shutdown(_)));
        assert!(err.to_string().contains(&port.to_string()), "{err}");
        assert_eq!(server.close_attempts(), 1);
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn shutdown_without_start_is_a_no_op() {
        let server = MetricsServer::new(free_port(), target());

        server.shutdown().await.unwrap();

        assert_eq!(server.close_attempts(), 0);
        assert_eq!(server.state(), ServerState::Stopped);
    }
}
