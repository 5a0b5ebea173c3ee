use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::metric::TimeSeries;

use super::http::RemoteWriteExporter;

/// Exporter dispatches finalized series to a remote-write endpoint or to
/// the log.
///
/// Enum dispatch keeps the call sites free of trait objects.
pub enum Exporter {
    Remote(RemoteWriteExporter),
    Log(LogExporter),
}

impl Exporter {
    /// Returns the exporter name for logging.
    pub fn name(&self) -> &str {
        match self {
            Self::Remote(e) => e.name(),
            Self::Log(e) => e.name(),
        }
    }

    /// Initialize the exporter.
    pub fn start(&self, ctx: CancellationToken) -> Result<()> {
        match self {
            Self::Remote(e) => e.start(ctx),
            Self::Log(_) => Ok(()),
        }
    }

    /// Hand over one batch. Never blocks on the network.
    pub fn export(&self, series: Vec<TimeSeries>) {
        match self {
            Self::Remote(e) => e.export(series),
            Self::Log(e) => e.export(&series),
        }
    }

    /// Shut down the exporter, waiting up to `timeout` for queued data.
    pub async fn stop(&self, timeout: Duration) {
        match self {
            Self::Remote(e) => e.stop(timeout).await,
            Self::Log(_) => {}
        }
    }
}

/// Logs every series instead of shipping it.
#[derive(Debug, Default)]
pub struct LogExporter;

impl LogExporter {
    pub fn name(&self) -> &str {
        "log"
    }

    pub fn export(&self, series: &[TimeSeries]) {
        for ts in series {
            let Some(last) = ts.samples.last() else {
                continue;
            };
            info!(
                series = %ts.labels,
                value = last.value,
                timestamp_ms = last.timestamp_ms,
                samples = ts.samples.len(),
                "series"
            );
        }
    }
}
