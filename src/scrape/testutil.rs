use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::config::{GlobalConfig, JobConfig, JobId, RuleFile, ScrapeConfig};
use crate::discovery::TargetResolver;
use crate::export::health::HealthMetrics;
use crate::metric::{MetricRecord, TimeSeries};
use crate::plugin::{Plugin, PluginConfig, PluginRegistry, SampleBuffer, ScrapeContext};
use crate::sink::SeriesSink;

use super::job::JobDeps;

pub const FAKE_PLUGIN: &str = "fake";

#[derive(Default)]
struct FakeState {
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Plugin pushing `fake_value 1`, then optionally sleeping (honoring
/// cancellation) and failing for selected targets.
#[derive(Clone, Default)]
pub struct FakePlugin {
    delay: Option<Duration>,
    fail_on: Option<String>,
    state: Arc<FakeState>,
}

impl FakePlugin {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn failing_on(target: &str) -> Self {
        Self {
            fail_on: Some(target.to_string()),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.state.calls.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.state.in_flight.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a FakeState);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Plugin for FakePlugin {
    fn name(&self) -> &str {
        FAKE_PLUGIN
    }

    fn parse_config(&self, _base_dir: &Path, _bytes: &[u8]) -> Result<PluginConfig> {
        Ok(PluginConfig::new(FAKE_PLUGIN, ()))
    }

    async fn scrape(
        &self,
        ctx: &ScrapeContext,
        target: &str,
        _cfg: &PluginConfig,
        buf: &SampleBuffer,
    ) -> Result<()> {
        self.state.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.state);

        buf.push(MetricRecord::gauge("fake_value", 1.0));

        if let Some(delay) = self.delay {
            tokio::select! {
                _ = ctx.cancel.cancelled() => bail!("scrape cancelled"),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        if self.fail_on.as_deref() == Some(target) {
            bail!("connection refused");
        }
        Ok(())
    }
}

/// Sink recording every submitted batch.
#[derive(Default)]
pub struct CollectSink {
    batches: Mutex<Vec<Vec<TimeSeries>>>,
}

impl CollectSink {
    pub fn batches(&self) -> usize {
        self.batches.lock().len()
    }

    pub fn series(&self) -> Vec<TimeSeries> {
        self.batches.lock().iter().flatten().cloned().collect()
    }
}

impl SeriesSink for CollectSink {
    fn name(&self) -> &str {
        "collect"
    }

    fn submit(&self, batch: Vec<TimeSeries>) {
        self.batches.lock().push(batch);
    }
}

pub fn test_registry(plugin: FakePlugin) -> PluginRegistry {
    PluginRegistry::builder()
        .register(plugin)
        .expect("register fake plugin")
        .build()
}

pub fn test_deps(plugin: FakePlugin, sink: Arc<CollectSink>) -> JobDeps {
    JobDeps {
        registry: test_registry(plugin),
        resolver: Arc::new(TargetResolver::new(
            crate::discovery::client("cprobe-test").expect("discovery client"),
        )),
        sink,
        metrics: Arc::new(HealthMetrics::disabled().expect("metrics")),
    }
}

/// Serves an HTTP SD endpoint at `/sd` that accepts requests and never
/// answers. Returns its URL.
pub async fn silent_sd_url() -> String {
    let app = axum::Router::new().route(
        "/sd",
        axum::routing::get(|| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            "[]"
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind sd stub");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}/sd")
}

/// Resolves a job for the fake plugin; `extra` is appended to the job's YAML.
pub fn job_config(name: &str, extra: &str) -> JobConfig {
    let yaml = format!("job_name: {name}\nscrape_rule_files: [rules.toml]\n{extra}");
    let scrape: ScrapeConfig = serde_yaml::from_str(&yaml).expect("valid scrape config");
    let rules = vec![RuleFile {
        path: PathBuf::from("rules.toml"),
        raw: Arc::from(&b""[..]),
        parsed: PluginConfig::new(FAKE_PLUGIN, ()),
    }];
    JobConfig::resolve(
        JobId::new("/conf/fake/main.yaml", name),
        FAKE_PLUGIN,
        Path::new("/conf/fake"),
        scrape,
        &GlobalConfig::default(),
        rules,
    )
    .expect("resolve job")
}
