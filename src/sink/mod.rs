pub mod remote;

use crate::metric::TimeSeries;

/// Hand-off point from job runners to the write side.
///
/// `submit` must not block on network I/O; implementations queue or drop.
pub trait SeriesSink: Send + Sync {
    /// Returns the sink's name for logging.
    fn name(&self) -> &str;

    /// Accepts one scrape tick's series.
    fn submit(&self, batch: Vec<TimeSeries>);
}

/// Sink used when no writers are configured: series are dropped.
#[derive(Debug, Default)]
pub struct DiscardSink;

impl SeriesSink for DiscardSink {
    fn name(&self) -> &str {
        "discard"
    }

    fn submit(&self, batch: Vec<TimeSeries>) {
        tracing::trace!(series = batch.len(), "discarding batch, no writers configured");
    }
}
