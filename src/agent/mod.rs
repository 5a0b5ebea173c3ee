use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{Loader, WriterConfig};
use crate::discovery::{self, TargetResolver};
use crate::export::health::HealthMetrics;
use crate::plugin::PluginRegistry;
use crate::scrape::{JobDeps, ReloadSummary, Scheduler};
use crate::sink::remote::http::USER_AGENT;
use crate::sink::remote::WriterPipeline;
use crate::sink::{DiscardSink, SeriesSink};

/// Name of the writer file inside `conf.d`.
pub const WRITER_FILE: &str = "writer.yaml";

/// Startup options, usually taken from the command line.
#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub conf_dir: PathBuf,
    pub strict_parse: bool,
    /// Log series instead of shipping them to the configured writers.
    pub no_writer: bool,
    /// Self-metrics listen address. Empty disables the server.
    pub http_listen: String,
}

/// Agent wires health metrics, the writer pipeline and the scheduler.
pub struct Agent {
    health: Arc<HealthMetrics>,
    pipeline: Option<Arc<WriterPipeline>>,
    scheduler: Scheduler,
    cancel: CancellationToken,
}

impl Agent {
    /// Builds an agent with the built-in plugins.
    pub fn new(opts: AgentOptions) -> Result<Self> {
        let registry = PluginRegistry::builtin().context("registering built-in plugins")?;
        Self::with_registry(opts, registry)
    }

    /// Builds an agent with a caller-supplied plugin registry.
    pub fn with_registry(opts: AgentOptions, registry: PluginRegistry) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&opts.http_listen).context("creating health metrics")?);

        let writer_path = opts.conf_dir.join(WRITER_FILE);
        let writers = WriterConfig::load(&writer_path, opts.strict_parse)?;

        let pipeline = if opts.no_writer {
            Some(Arc::new(WriterPipeline::log_only(&writers)?))
        } else if writers.writers.is_empty() {
            None
        } else {
            Some(Arc::new(WriterPipeline::new(&writers, Arc::clone(&health))?))
        };
        let sink: Arc<dyn SeriesSink> = match &pipeline {
            Some(p) => Arc::clone(p) as Arc<dyn SeriesSink>,
            None => Arc::new(DiscardSink),
        };

        let client = discovery::client(USER_AGENT)?;

        let deps = JobDeps {
            registry: registry.clone(),
            resolver: Arc::new(TargetResolver::new(client)),
            sink,
            metrics: Arc::clone(&health),
        };
        let loader = Loader::new(opts.conf_dir.clone(), registry, opts.strict_parse);

        info!(
            conf_dir = %opts.conf_dir.display(),
            strict_parse = opts.strict_parse,
            writers = writers.writers.len(),
            no_writer = opts.no_writer,
            "agent configured"
        );

        Ok(Self {
            health,
            pipeline,
            scheduler: Scheduler::new(loader, deps),
            cancel: CancellationToken::new(),
        })
    }

    /// Starts the metrics server, the writers and one runner per job.
    pub async fn start(&self) -> Result<()> {
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        if let Some(pipeline) = &self.pipeline {
            pipeline.start(&self.cancel)?;
        }

        let jobs = self.scheduler.start().context("loading scrape configs")?;
        info!(jobs, "agent started");
        Ok(())
    }

    /// Re-reads `conf.d` and applies the difference to the running jobs.
    /// Writer settings are only read at startup.
    pub async fn reload(&self) -> Result<ReloadSummary> {
        self.scheduler.reload().await
    }

    /// Stops scheduling, lets running ticks finish and drains the writer
    /// queues. Both steps share one `timeout`; writers get what the
    /// scheduler left.
    pub async fn stop(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        self.scheduler.shutdown(timeout).await;
        if let Some(pipeline) = &self.pipeline {
            pipeline
                .stop(deadline.saturating_duration_since(Instant::now()))
                .await;
        }
        self.cancel.cancel();
        self.health.stop();
        info!("agent stopped");
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn health(&self) -> &HealthMetrics {
        &self.health
    }
}
