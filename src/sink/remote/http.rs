use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{split_header, WriterEntry};
use crate::export::health::HealthMetrics;
use crate::metric::TimeSeries;

use super::client::build_client;
use super::prompb::encode_write_request;

pub const USER_AGENT: &str = concat!("cprobe/", env!("CARGO_PKG_VERSION"));
pub const REMOTE_WRITE_VERSION: &str = "0.1.0";

/// Why a remote write attempt failed.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
}

impl SendError {
    /// Transport failures, 5xx and 429 are retried; other statuses are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Status { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
        }
    }
}

/// State shared by the dispatcher and its sender tasks.
struct Shipper {
    name: String,
    client: reqwest::Client,
    url: url::Url,
    headers: HeaderMap,
    basic_auth: Option<(String, String)>,
    retry_times: u32,
    retry_interval: Duration,
    concurrency: usize,
    metrics: Arc<HealthMetrics>,
}

impl Shipper {
    async fn post(&self, body: Vec<u8>) -> Result<(), SendError> {
        let mut request = self
            .client
            .post(self.url.clone())
            .headers(self.headers.clone())
            .body(body);
        if let Some((user, pass)) = &self.basic_auth {
            request = request.basic_auth(user, Some(pass));
        }

        let resp = request.send().await?;
        let status = resp.status();
        if status.is_success() {
            // Drain body for connection reuse.
            let _ = resp.bytes().await;
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(SendError::Status {
            status,
            body: body.chars().take(256).collect(),
        })
    }

    /// Sends one request, retrying retryable failures at a fixed interval.
    async fn send(&self, body: Vec<u8>, cancel: &CancellationToken) {
        let started = Instant::now();
        let mut attempt: u32 = 0;

        let status = loop {
            let err = match self.post(body.clone()).await {
                Ok(()) => break "success",
                Err(e) => e,
            };

            if !err.is_retryable() {
                warn!(writer = %self.name, error = %err, "remote write rejected, dropping request");
                self.dropped("rejected");
                break "rejected";
            }
            if attempt >= self.retry_times {
                warn!(
                    writer = %self.name,
                    attempts = attempt + 1,
                    error = %err,
                    "remote write retries exhausted, dropping request"
                );
                self.dropped("retries_exhausted");
                break "failed";
            }

            attempt += 1;
            self.metrics
                .writer_retries_total
                .with_label_values(&[self.name.as_str()])
                .inc();
            warn!(
                writer = %self.name,
                attempt,
                retry_in = ?self.retry_interval,
                error = %err,
                "remote write failed, retrying"
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    self.dropped("shutdown");
                    break "cancelled";
                }
                _ = tokio::time::sleep(self.retry_interval) => {}
            }
        };

        self.metrics
            .writer_requests_total
            .with_label_values(&[self.name.as_str(), status])
            .inc();
        self.metrics
            .writer_request_duration
            .with_label_values(&[self.name.as_str()])
            .observe(started.elapsed().as_secs_f64());
        debug!(writer = %self.name, status, retries = attempt, "remote write finished");
    }

    fn dropped(&self, reason: &str) {
        self.metrics
            .writer_dropped_total
            .with_label_values(&[self.name.as_str(), reason])
            .inc();
    }
}

type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>>;

/// Prometheus remote-write sender for one writer.
///
/// Requests are queued in a bounded channel (the newest request is dropped
/// when full) and sent by up to `concurrency` tasks. The dispatcher is
/// restarted if it panics.
pub struct RemoteWriteExporter {
    shipper: Arc<Shipper>,
    max_queue_size: usize,
    tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    cancel: Mutex<Option<CancellationToken>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RemoteWriteExporter {
    /// Creates the exporter and its HTTP client. Call [`Self::start`]
    /// before exporting.
    pub fn new(cfg: &WriterEntry, metrics: Arc<HealthMetrics>) -> Result<Self> {
        let name = cfg.display_name();
        let built = build_client(cfg).with_context(|| format!("writer {name}"))?;

        Ok(Self {
            shipper: Arc::new(Shipper {
                headers: request_headers(cfg).with_context(|| format!("writer {name}"))?,
                basic_auth: (!cfg.basic_auth_user.is_empty())
                    .then(|| (cfg.basic_auth_user.clone(), cfg.basic_auth_pass.clone())),
                client: built.client,
                url: built.url,
                retry_times: cfg.retry_times,
                retry_interval: cfg.retry_interval(),
                concurrency: cfg.concurrency.max(1),
                metrics,
                name,
            }),
            max_queue_size: cfg.max_queue_size.max(1),
            tx: Mutex::new(None),
            cancel: Mutex::new(None),
            task: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.shipper.name
    }

    /// Spawns the dispatcher. `ctx` aborts retries and in-flight sends.
    pub fn start(&self, ctx: CancellationToken) -> Result<()> {
        let (tx, rx) = mpsc::channel::<Vec<u8>>(self.max_queue_size);
        *self.tx.lock() = Some(tx);
        *self.cancel.lock() = Some(ctx.clone());

        let rx: SharedReceiver = Arc::new(tokio::sync::Mutex::new(rx));
        let handle = tokio::spawn(supervise(Arc::clone(&self.shipper), rx, ctx));
        *self.task.lock() = Some(handle);

        info!(
            writer = %self.shipper.name,
            url = %self.shipper.url,
            concurrency = self.shipper.concurrency,
            max_queue_size = self.max_queue_size,
            "remote write exporter started"
        );
        Ok(())
    }

    /// Encodes and queues one batch. Never blocks.
    pub fn export(&self, series: Vec<TimeSeries>) {
        let count = series.len();
        match encode_write_request(series) {
            Ok(body) => self.enqueue(body),
            Err(e) => {
                warn!(writer = %self.shipper.name, series = count, error = %e, "encoding write request");
                self.shipper.dropped("encode");
            }
        }
    }

    /// Queues an encoded request, dropping it when the queue is full.
    pub fn enqueue(&self, body: Vec<u8>) {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            self.shipper.dropped("stopped");
            return;
        };
        match tx.try_send(body) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(
                    writer = %self.shipper.name,
                    max_queue_size = self.max_queue_size,
                    "remote write queue full, dropping newest request"
                );
                self.shipper.dropped("queue_full");
            }
            Err(TrySendError::Closed(_)) => self.shipper.dropped("stopped"),
        }
        let queued = tx.max_capacity() - tx.capacity();
        self.shipper
            .metrics
            .writer_queue_length
            .with_label_values(&[self.shipper.name.as_str()])
            .set(queued as f64);
    }

    /// Closes the queue and waits up to `timeout` for queued and in-flight
    /// requests; whatever is left is then cancelled.
    pub async fn stop(&self, timeout: Duration) {
        self.tx.lock().take();
        let handle = self.task.lock().take();
        let cancel = self.cancel.lock().take();

        if let Some(handle) = handle {
            if tokio::time::timeout(timeout, handle).await.is_err() {
                warn!(writer = %self.shipper.name, "remote write queue not drained before shutdown");
            }
        }
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        info!(writer = %self.shipper.name, "remote write exporter stopped");
    }
}

fn request_headers(cfg: &WriterEntry) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(
        reqwest::header::USER_AGENT,
        HeaderValue::from_static(USER_AGENT),
    );
    headers.insert(
        reqwest::header::CONTENT_TYPE,
        HeaderValue::from_static("application/x-protobuf"),
    );
    headers.insert(
        reqwest::header::CONTENT_ENCODING,
        HeaderValue::from_static("snappy"),
    );
    headers.insert(
        HeaderName::from_static("x-prometheus-remote-write-version"),
        HeaderValue::from_static(REMOTE_WRITE_VERSION),
    );
    for raw in &cfg.headers {
        let Some((k, v)) = split_header(raw) else {
            anyhow::bail!("header {raw:?} must be formatted as 'Key: Value'");
        };
        let name = HeaderName::from_bytes(k.as_bytes())
            .with_context(|| format!("header name {k:?}"))?;
        let value = HeaderValue::from_str(v).with_context(|| format!("header value for {k}"))?;
        headers.insert(name, value);
    }
    Ok(headers)
}

/// Runs the dispatcher, restarting it after a panic.
async fn supervise(shipper: Arc<Shipper>, rx: SharedReceiver, cancel: CancellationToken) {
    loop {
        let handle = tokio::spawn(dispatch(
            Arc::clone(&shipper),
            Arc::clone(&rx),
            cancel.clone(),
        ));
        match handle.await {
            Ok(()) => return,
            Err(e) if e.is_panic() => {
                error!(writer = %shipper.name, "remote write dispatcher panicked, restarting");
            }
            Err(e) => {
                debug!(writer = %shipper.name, error = %e, "remote write dispatcher cancelled");
                return;
            }
        }
    }
}

async fn dispatch(shipper: Arc<Shipper>, rx: SharedReceiver, cancel: CancellationToken) {
    let mut rx = rx.lock().await;
    let limit = Arc::new(Semaphore::new(shipper.concurrency));
    let mut in_flight = JoinSet::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            item = rx.recv() => {
                let Some(body) = item else { break };
                shipper
                    .metrics
                    .writer_queue_length
                    .with_label_values(&[shipper.name.as_str()])
                    .set(rx.len() as f64);

                let permit = tokio::select! {
                    _ = cancel.cancelled() => break,
                    permit = Arc::clone(&limit).acquire_owned() => permit,
                };
                let Ok(permit) = permit else { break };

                let shipper = Arc::clone(&shipper);
                let cancel = cancel.clone();
                in_flight.spawn(async move {
                    let _permit = permit;
                    shipper.send(body, &cancel).await;
                });
            }

            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = joined {
                    error!(writer = %shipper.name, error = %e, "remote write sender failed");
                }
            }
        }
    }

    while let Some(joined) = in_flight.join_next().await {
        if let Err(e) = joined {
            error!(writer = %shipper.name, error = %e, "remote write sender failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::http::{HeaderMap as AxumHeaders, StatusCode as AxumStatus};
    use axum::routing::post;
    use axum::Router;

    use super::*;
    use crate::metric::Labels;
    use crate::sink::remote::prompb::decode_write_request;

    struct Stub {
        addr: std::net::SocketAddr,
        hits: Arc<AtomicUsize>,
        bodies: Arc<Mutex<Vec<(AxumHeaders, Vec<u8>)>>>,
    }

    /// Sink answering `fail_first` requests with 503, then 204.
    async fn stub(fail_first: usize) -> Stub {
        let hits = Arc::new(AtomicUsize::new(0));
        let bodies = Arc::new(Mutex::new(Vec::new()));
        let (h, b) = (Arc::clone(&hits), Arc::clone(&bodies));
        let app = Router::new().route(
            "/write",
            post(move |headers: AxumHeaders, body: axum::body::Bytes| {
                let (h, b) = (Arc::clone(&h), Arc::clone(&b));
                async move {
                    let n = h.fetch_add(1, Ordering::SeqCst);
                    if n < fail_first {
                        return AxumStatus::SERVICE_UNAVAILABLE;
                    }
                    b.lock().push((headers, body.to_vec()));
                    AxumStatus::NO_CONTENT
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Stub { addr, hits, bodies }
    }

    fn series() -> Vec<TimeSeries> {
        vec![TimeSeries::new(
            Labels::from_pairs([("__name__", "foo"), ("job", "j1")]),
            42.0,
            1_000,
        )]
    }

    fn entry(url: String) -> WriterEntry {
        let mut cfg = WriterEntry::new(url);
        cfg.retry_interval_millis = 20;
        cfg.retry_times = 5;
        cfg.concurrency = 2;
        cfg
    }

    fn metrics() -> Arc<HealthMetrics> {
        Arc::new(HealthMetrics::disabled().expect("metrics"))
    }

    #[test]
    fn test_retry_classification() {
        let server = SendError::Status {
            status: StatusCode::BAD_GATEWAY,
            body: String::new(),
        };
        let throttled = SendError::Status {
            status: StatusCode::TOO_MANY_REQUESTS,
            body: String::new(),
        };
        let bad = SendError::Status {
            status: StatusCode::BAD_REQUEST,
            body: String::new(),
        };
        assert!(server.is_retryable());
        assert!(throttled.is_retryable());
        assert!(!bad.is_retryable());
    }

    #[test]
    fn test_request_headers() {
        let mut cfg = WriterEntry::new("http://127.0.0.1:1/write");
        cfg.headers = vec!["X-Scope-OrgID: tenant-1".to_string()];
        let headers = request_headers(&cfg).expect("headers");
        assert_eq!(headers["content-encoding"], "snappy");
        assert_eq!(headers["content-type"], "application/x-protobuf");
        assert_eq!(headers["x-prometheus-remote-write-version"], "0.1.0");
        assert_eq!(headers["x-scope-orgid"], "tenant-1");
        assert!(headers["user-agent"]
            .to_str()
            .expect("ascii")
            .starts_with("cprobe/"));
    }

    #[tokio::test]
    async fn test_ships_with_headers_and_auth() {
        let stub = stub(0).await;
        let mut cfg = entry(format!("http://{}/write", stub.addr));
        cfg.basic_auth_user = "probe".to_string();
        cfg.basic_auth_pass = "secret".to_string();
        let exporter = RemoteWriteExporter::new(&cfg, metrics()).expect("exporter");
        exporter.start(CancellationToken::new()).expect("start");

        exporter.export(series());
        exporter.stop(Duration::from_secs(5)).await;

        let bodies = stub.bodies.lock();
        assert_eq!(bodies.len(), 1);
        let (headers, body) = &bodies[0];
        assert_eq!(headers["content-encoding"], "snappy");
        assert!(headers["authorization"]
            .to_str()
            .expect("ascii")
            .starts_with("Basic "));
        let decoded = decode_write_request(body).expect("decode");
        assert_eq!(decoded.timeseries[0].samples[0].value, 42.0);
    }

    #[tokio::test]
    async fn test_retries_server_errors() {
        let stub = stub(3).await;
        let metrics = metrics();
        let cfg = entry(format!("http://{}/write", stub.addr));
        let exporter = RemoteWriteExporter::new(&cfg, Arc::clone(&metrics)).expect("exporter");
        exporter.start(CancellationToken::new()).expect("start");

        exporter.export(series());
        exporter.stop(Duration::from_secs(5)).await;

        assert_eq!(stub.hits.load(Ordering::SeqCst), 4);
        assert_eq!(stub.bodies.lock().len(), 1);
        let name = exporter.name().to_string();
        assert_eq!(
            metrics
                .writer_retries_total
                .with_label_values(&[name.as_str()])
                .get(),
            3.0
        );
    }

    #[tokio::test]
    async fn test_retries_connection_refused_then_gives_up() {
        let metrics = metrics();
        let mut cfg = entry("http://127.0.0.1:1/write".to_string());
        cfg.retry_times = 2;
        let exporter = RemoteWriteExporter::new(&cfg, Arc::clone(&metrics)).expect("exporter");
        exporter.start(CancellationToken::new()).expect("start");

        exporter.export(series());
        exporter.stop(Duration::from_secs(5)).await;

        let name = exporter.name().to_string();
        assert_eq!(
            metrics
                .writer_dropped_total
                .with_label_values(&[name.as_str(), "retries_exhausted"])
                .get(),
            1.0
        );
    }

    #[tokio::test]
    async fn test_queue_full_drops_newest() {
        let metrics = metrics();
        let mut cfg = entry("http://127.0.0.1:1/write".to_string());
        cfg.max_queue_size = 2;
        let exporter = RemoteWriteExporter::new(&cfg, Arc::clone(&metrics)).expect("exporter");
        // Not started: the queue exists only after start, so build it by hand.
        let (tx, _rx) = mpsc::channel(cfg.max_queue_size);
        *exporter.tx.lock() = Some(tx);

        for _ in 0..3 {
            exporter.enqueue(vec![1, 2, 3]);
        }
        let name = exporter.name().to_string();
        assert_eq!(
            metrics
                .writer_dropped_total
                .with_label_values(&[name.as_str(), "queue_full"])
                .get(),
            1.0
        );
        assert_eq!(
            metrics
                .writer_queue_length
                .with_label_values(&[name.as_str()])
                .get(),
            2.0
        );
    }

    #[tokio::test]
    async fn test_export_after_stop_is_dropped() {
        let metrics = metrics();
        let cfg = entry("http://127.0.0.1:1/write".to_string());
        let exporter = RemoteWriteExporter::new(&cfg, Arc::clone(&metrics)).expect("exporter");
        exporter.start(CancellationToken::new()).expect("start");
        exporter.stop(Duration::from_secs(1)).await;

        exporter.export(series());
        let name = exporter.name().to_string();
        assert_eq!(
            metrics
                .writer_dropped_total
                .with_label_values(&[name.as_str(), "stopped"])
                .get(),
            1.0
        );
    }
}
