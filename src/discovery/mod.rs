pub mod file;
pub mod http;
pub mod reader;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::{TtlCache, DEFAULT_TTL};
use crate::config::{JobConfig, StaticConfig};
use crate::metric::{Labels, ADDRESS_LABEL};

pub use self::file::FileSource;
pub use self::http::{HttpSource, HttpTargets};
pub use self::reader::SourceReader;

/// A service-discovery mechanism yielding target label sets.
#[async_trait]
pub trait TargetSource: Send + Sync {
    /// Short kind name for logs.
    fn kind(&self) -> &'static str;

    async fn targets(&self) -> Result<Vec<Labels>>;
}

/// Targets listed inline in the job.
pub struct StaticSource<'a> {
    configs: &'a [StaticConfig],
}

impl<'a> StaticSource<'a> {
    pub fn new(configs: &'a [StaticConfig]) -> Self {
        Self { configs }
    }
}

#[async_trait]
impl TargetSource for StaticSource<'_> {
    fn kind(&self) -> &'static str {
        "static"
    }

    async fn targets(&self) -> Result<Vec<Labels>> {
        Ok(static_targets(self.configs, None))
    }
}

/// Expands static configs to one label set per address. The address
/// overrides an `__address__` entry in `labels`.
pub fn static_targets(configs: &[StaticConfig], meta: Option<(&str, &str)>) -> Vec<Labels> {
    let mut out = Vec::new();
    for sc in configs {
        for addr in &sc.targets {
            let mut labels = Labels::with_capacity(sc.labels.len() + 2);
            for (k, v) in &sc.labels {
                labels.push(k.as_str(), v.as_str());
            }
            labels.set(ADDRESS_LABEL, addr.as_str());
            if let Some((name, value)) = meta {
                labels.set(name, value);
            }
            out.push(labels);
        }
    }
    out
}

/// Request timeout of the shared discovery client.
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);
/// Connect timeout of the shared discovery client.
pub const CLIENT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Builds the HTTP client used by file and HTTP service discovery.
pub fn client(user_agent: &str) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(user_agent)
        .connect_timeout(CLIENT_CONNECT_TIMEOUT)
        .timeout(CLIENT_TIMEOUT)
        .build()
        .context("building discovery client")
}

/// Produces a job's current targets from every configured source.
pub struct TargetResolver {
    reader: SourceReader,
    http_cache: TtlCache<String, HttpTargets>,
}

impl TargetResolver {
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_ttl(client, DEFAULT_TTL)
    }

    pub fn with_ttl(client: reqwest::Client, ttl: Duration) -> Self {
        Self {
            reader: SourceReader::new(client, ttl),
            http_cache: TtlCache::new(ttl),
        }
    }

    /// Sources configured for `job`, in config order.
    pub fn sources<'a>(&'a self, job: &'a JobConfig) -> Vec<Box<dyn TargetSource + 'a>> {
        let scrape = &job.scrape;
        let mut sources: Vec<Box<dyn TargetSource + 'a>> = Vec::with_capacity(
            1 + scrape.file_sd_configs.len() + scrape.http_sd_configs.len(),
        );
        if !scrape.static_configs.is_empty() {
            sources.push(Box::new(StaticSource::new(&scrape.static_configs)));
        }
        for cfg in &scrape.file_sd_configs {
            sources.push(Box::new(FileSource::new(&self.reader, &job.base_dir, cfg)));
        }
        for cfg in &scrape.http_sd_configs {
            sources.push(Box::new(HttpSource::new(
                self.reader.client(),
                &self.http_cache,
                cfg,
            )));
        }
        sources
    }

    /// Unions the output of every source. A failing source, or one that
    /// does not answer within the job's scrape timeout, logs and
    /// contributes nothing. Returns what was gathered so far once `abort`
    /// fires. Duplicate names inside one label set keep their first value;
    /// identical targets are not merged.
    pub async fn resolve(&self, job: &JobConfig, abort: &CancellationToken) -> Vec<Labels> {
        let bound = job.scrape_timeout;
        let mut out = Vec::new();
        for source in self.sources(job) {
            let result = tokio::select! {
                _ = abort.cancelled() => {
                    debug!(job = %job.id, source = source.kind(), "target discovery aborted");
                    break;
                }
                r = tokio::time::timeout(bound, source.targets()) => r,
            };
            match result {
                Ok(Ok(targets)) => out.extend(targets),
                Ok(Err(e)) => {
                    warn!(job = %job.id, source = source.kind(), error = %e, "target discovery failed");
                }
                Err(_) => {
                    warn!(job = %job.id, source = source.kind(), timeout = ?bound, "target discovery timed out");
                }
            }
        }
        for labels in &mut out {
            labels.dedup_keep_first();
        }
        debug!(job = %job.id, targets = out.len(), "resolved targets");
        out
    }
}

/// Shared handle used by every job runner.
pub type SharedResolver = Arc<TargetResolver>;
