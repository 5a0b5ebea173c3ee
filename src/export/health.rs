use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "cprobe";

/// Self-observability metrics for the probe.
///
/// All metrics use the "cprobe" namespace. Grouped by the component that
/// updates them:
/// - Scrape: per-job tick counters and durations
/// - Scheduler: job set and reload outcomes
/// - Writer: per-sink request, retry and queue state
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Scrape ===
    /// Target scrapes by job.
    pub scrapes_total: CounterVec,
    /// Target scrapes that returned an error or timed out, by job.
    pub scrape_errors_total: CounterVec,
    /// Duration of one scrape tick (all targets), by job.
    pub scrape_duration: HistogramVec,
    /// Targets left after target relabeling, by job.
    pub targets: GaugeVec,
    /// Series produced after metric relabeling, by job.
    pub samples_scraped_total: CounterVec,

    // === Scheduler ===
    /// Job runners currently scheduled.
    pub jobs_running: Gauge,
    /// Config reloads by result (success/failure).
    pub config_reloads_total: CounterVec,

    // === Writer ===
    /// Remote write requests by writer and final status.
    pub writer_requests_total: CounterVec,
    /// Remote write retries by writer.
    pub writer_retries_total: CounterVec,
    /// Requests dropped by writer and reason.
    pub writer_dropped_total: CounterVec,
    /// Requests waiting in a writer's queue.
    pub writer_queue_length: GaugeVec,
    /// Remote write request duration (including retries), by writer.
    pub writer_request_duration: HistogramVec,
}

impl HealthMetrics {
    /// Creates a metrics instance with everything registered. An empty
    /// `addr` disables the HTTP server.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        // === Scrape ===
        let scrapes_total = CounterVec::new(
            Opts::new("scrapes_total", "Total target scrapes by job.").namespace(NAMESPACE),
            &["job"],
        )?;
        let scrape_errors_total = CounterVec::new(
            Opts::new(
                "scrape_errors_total",
                "Total target scrapes that failed or timed out, by job.",
            )
            .namespace(NAMESPACE),
            &["job"],
        )?;
        let scrape_duration = HistogramVec::new(
            HistogramOpts::new(
                "scrape_duration_seconds",
                "Duration of one scrape tick across all targets, by job.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0]),
            &["job"],
        )?;
        let targets = GaugeVec::new(
            Opts::new("targets", "Targets kept after target relabeling, by job.")
                .namespace(NAMESPACE),
            &["job"],
        )?;
        let samples_scraped_total = CounterVec::new(
            Opts::new(
                "samples_scraped_total",
                "Total series produced after metric relabeling, by job.",
            )
            .namespace(NAMESPACE),
            &["job"],
        )?;

        // === Scheduler ===
        let jobs_running = Gauge::with_opts(
            Opts::new("jobs_running", "Number of scheduled job runners.").namespace(NAMESPACE),
        )?;
        let config_reloads_total = CounterVec::new(
            Opts::new("config_reloads_total", "Total config reloads by result.")
                .namespace(NAMESPACE),
            &["result"],
        )?;

        // === Writer ===
        let writer_requests_total = CounterVec::new(
            Opts::new(
                "writer_requests_total",
                "Total remote write requests by writer and status.",
            )
            .namespace(NAMESPACE),
            &["writer", "status"],
        )?;
        let writer_retries_total = CounterVec::new(
            Opts::new("writer_retries_total", "Total remote write retries by writer.")
                .namespace(NAMESPACE),
            &["writer"],
        )?;
        let writer_dropped_total = CounterVec::new(
            Opts::new(
                "writer_dropped_total",
                "Total remote write requests dropped by writer and reason.",
            )
            .namespace(NAMESPACE),
            &["writer", "reason"],
        )?;
        let writer_queue_length = GaugeVec::new(
            Opts::new(
                "writer_queue_length",
                "Current number of requests queued per writer.",
            )
            .namespace(NAMESPACE),
            &["writer"],
        )?;
        let writer_request_duration = HistogramVec::new(
            HistogramOpts::new(
                "writer_request_duration_seconds",
                "Remote write request duration including retries, by writer.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
            &["writer"],
        )?;

        registry.register(Box::new(scrapes_total.clone()))?;
        registry.register(Box::new(scrape_errors_total.clone()))?;
        registry.register(Box::new(scrape_duration.clone()))?;
        registry.register(Box::new(targets.clone()))?;
        registry.register(Box::new(samples_scraped_total.clone()))?;

        registry.register(Box::new(jobs_running.clone()))?;
        registry.register(Box::new(config_reloads_total.clone()))?;

        registry.register(Box::new(writer_requests_total.clone()))?;
        registry.register(Box::new(writer_retries_total.clone()))?;
        registry.register(Box::new(writer_dropped_total.clone()))?;
        registry.register(Box::new(writer_queue_length.clone()))?;
        registry.register(Box::new(writer_request_duration.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            scrapes_total,
            scrape_errors_total,
            scrape_duration,
            targets,
            samples_scraped_total,
            jobs_running,
            config_reloads_total,
            writer_requests_total,
            writer_retries_total,
            writer_dropped_total,
            writer_queue_length,
            writer_request_duration,
        })
    }

    /// Metrics instance with no HTTP server, for embedding and tests.
    pub fn disabled() -> Result<Self> {
        Self::new("")
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Starts the HTTP server serving /metrics and /healthz. Returns the
    /// bound address, or `None` when the server is disabled.
    pub async fn start(&self) -> Result<Option<SocketAddr>> {
        if self.addr.is_empty() {
            return Ok(None);
        }

        // ":port" shorthand binds all interfaces.
        let bind_addr = if self.addr.starts_with(':') {
            format!("0.0.0.0{}", self.addr)
        } else {
            self.addr.clone()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(Some(local_addr))
    }

    /// Gracefully shuts down the health metrics server.
    pub fn stop(&self) {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
    }

    /// Renders the registry in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode(&self.registry)
    }
}

fn encode(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
