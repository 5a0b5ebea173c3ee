//! Remote-write side of the probe: label stages, fan-out and exporters.

pub mod client;
pub mod exporter;
pub mod http;
pub mod prompb;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::config::WriterConfig;
use crate::export::health::HealthMetrics;
use crate::metric::{Labels, TimeSeries};
use crate::relabel::{self, ParsedRelabelConfigs, RelabelConfig};

use self::exporter::{Exporter, LogExporter};
use self::http::RemoteWriteExporter;
use super::SeriesSink;

/// Extra labels plus metric relabel rules of one pipeline level.
#[derive(Debug, Clone, Default)]
pub struct SinkStage {
    extra_labels: Labels,
    relabel: ParsedRelabelConfigs,
}

impl SinkStage {
    pub fn new(extra_labels: &BTreeMap<String, String>, relabel: &[RelabelConfig]) -> Result<Self> {
        Ok(Self {
            extra_labels: Labels::from_pairs(extra_labels.iter()),
            relabel: ParsedRelabelConfigs::parse(relabel)?,
        })
    }

    /// Sets the extra labels, overwriting existing values.
    fn add_extra_labels(&self, labels: &mut Labels) {
        for l in self.extra_labels.iter() {
            labels.set(l.name.as_str(), l.value.as_str());
        }
    }
}

/// Receives scrape batches and hands them to every configured writer.
///
/// Per writer, each series gets the global then the writer's extra labels,
/// then the global then the writer's relabel rules, and is finalized.
/// Series left with no labels are dropped. Every writer but the last gets
/// its own copy of the batch.
pub struct WriterPipeline {
    global: SinkStage,
    sinks: Vec<(SinkStage, Exporter)>,
}

impl WriterPipeline {
    /// Builds one remote-write exporter per configured writer.
    pub fn new(cfg: &WriterConfig, metrics: Arc<HealthMetrics>) -> Result<Self> {
        let global = SinkStage::new(&cfg.global.extra_labels, &cfg.global.metric_relabel_configs)
            .context("writer global stage")?;

        let mut sinks = Vec::with_capacity(cfg.writers.len());
        for w in &cfg.writers {
            let stage = SinkStage::new(&w.extra_labels, &w.metric_relabel_configs)
                .with_context(|| format!("writer {}", w.display_name()))?;
            let exporter = RemoteWriteExporter::new(w, Arc::clone(&metrics))?;
            sinks.push((stage, Exporter::Remote(exporter)));
        }

        Ok(Self { global, sinks })
    }

    /// Logs finalized series instead of shipping them. Only the global
    /// stage applies.
    pub fn log_only(cfg: &WriterConfig) -> Result<Self> {
        let global = SinkStage::new(&cfg.global.extra_labels, &cfg.global.metric_relabel_configs)
            .context("writer global stage")?;
        Ok(Self {
            global,
            sinks: vec![(SinkStage::default(), Exporter::Log(LogExporter))],
        })
    }

    pub fn from_parts(global: SinkStage, sinks: Vec<(SinkStage, Exporter)>) -> Self {
        Self { global, sinks }
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Starts every exporter.
    pub fn start(&self, ctx: &CancellationToken) -> Result<()> {
        for (_, exporter) in &self.sinks {
            exporter
                .start(ctx.child_token())
                .with_context(|| format!("starting writer {}", exporter.name()))?;
        }
        info!(writers = self.sinks.len(), "writer pipeline started");
        Ok(())
    }

    /// Stops the exporters concurrently. All of them share the same
    /// `timeout` to drain.
    pub async fn stop(&self, timeout: Duration) {
        join_all(self.sinks.iter().map(|(_, exporter)| exporter.stop(timeout))).await;
    }

    /// Runs the label stages of one writer over a batch.
    fn prepare(&self, stage: &SinkStage, mut batch: Vec<TimeSeries>) -> Vec<TimeSeries> {
        batch.retain_mut(|ts| {
            stage.add_extra_labels(&mut ts.labels);
            self.global.relabel.apply(&mut ts.labels);
            if ts.labels.is_empty() {
                return false;
            }
            stage.relabel.apply(&mut ts.labels);
            if ts.labels.is_empty() {
                return false;
            }
            relabel::finalize(&mut ts.labels);
            !ts.labels.is_empty()
        });
        batch
    }

    fn ship(&self, stage: &SinkStage, exporter: &Exporter, batch: Vec<TimeSeries>) {
        let batch = self.prepare(stage, batch);
        if batch.is_empty() {
            debug!(writer = exporter.name(), "every series dropped by writer relabeling");
            return;
        }
        exporter.export(batch);
    }
}

impl SeriesSink for WriterPipeline {
    fn name(&self) -> &str {
        "writer_pipeline"
    }

    fn submit(&self, mut batch: Vec<TimeSeries>) {
        let Some(((last_stage, last), rest)) = self.sinks.split_last() else {
            trace!(series = batch.len(), "no writers configured, discarding batch");
            return;
        };

        for ts in &mut batch {
            self.global.add_extra_labels(&mut ts.labels);
        }

        for (stage, exporter) in rest {
            self.ship(stage, exporter, batch.clone());
        }
        self.ship(last_stage, last, batch);
    }
}
