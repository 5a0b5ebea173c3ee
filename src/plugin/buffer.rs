use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::metric::MetricRecord;

/// Per-scrape record buffer shared between a plugin and its job runner.
///
/// Plugins may push from several tasks at once. Once the scrape's token is
/// cancelled (timeout or shutdown) further pushes are discarded and counted.
pub struct SampleBuffer {
    records: Mutex<Vec<MetricRecord>>,
    cancel: CancellationToken,
    discarded: AtomicU64,
}

impl SampleBuffer {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            records: Mutex::new(Vec::with_capacity(64)),
            cancel,
            discarded: AtomicU64::new(0),
        }
    }

    /// Appends a record, preserving insertion order.
    pub fn push(&self, record: MetricRecord) {
        let mut records = self.records.lock();
        if self.cancel.is_cancelled() {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            return;
        }
        records.push(record);
    }

    /// Appends several records under one lock acquisition.
    pub fn extend<I>(&self, records: I)
    where
        I: IntoIterator<Item = MetricRecord>,
    {
        let mut buffered = self.records.lock();
        if self.cancel.is_cancelled() {
            let n = records.into_iter().count() as u64;
            self.discarded.fetch_add(n, Ordering::Relaxed);
            return;
        }
        buffered.extend(records);
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Records rejected because they arrived after cancellation.
    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }

    /// Takes every buffered record. Pushes after this point are discarded.
    pub fn drain(&self) -> Vec<MetricRecord> {
        let mut records = self.records.lock();
        self.cancel.cancel();
        std::mem::take(&mut *records)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_push_preserves_order() {
        let buf = SampleBuffer::new(CancellationToken::new());
        buf.push(MetricRecord::gauge("a", 1.0));
        buf.push(MetricRecord::gauge("b", 2.0));
        buf.extend([MetricRecord::gauge("c", 3.0)]);

        let names: Vec<_> = buf.drain().into_iter().map(|r| r.measurement).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_push_after_cancel_is_discarded() {
        let cancel = CancellationToken::new();
        let buf = SampleBuffer::new(cancel.clone());
        buf.push(MetricRecord::gauge("kept", 1.0));
        cancel.cancel();
        buf.push(MetricRecord::gauge("late", 1.0));
        buf.extend([MetricRecord::gauge("late2", 1.0)]);

        assert_eq!(buf.len(), 1);
        assert_eq!(buf.discarded(), 2);
    }

    #[test]
    fn test_drain_closes_buffer() {
        let buf = SampleBuffer::new(CancellationToken::new());
        buf.push(MetricRecord::gauge("a", 1.0));
        assert_eq!(buf.drain().len(), 1);

        buf.push(MetricRecord::gauge("b", 1.0));
        assert!(buf.is_empty());
        assert_eq!(buf.discarded(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_pushes() {
        let buf = Arc::new(SampleBuffer::new(CancellationToken::new()));
        let mut tasks = Vec::new();
        for i in 0..8 {
            let buf = Arc::clone(&buf);
            tasks.push(tokio::spawn(async move {
                for j in 0..100 {
                    buf.push(MetricRecord::gauge(format!("m{i}_{j}"), 1.0));
                }
            }));
        }
        for t in tasks {
            t.await.expect("task joins");
        }
        assert_eq!(buf.len(), 800);
    }

    #[test]
    fn test_push_racing_drain_is_kept_or_counted() {
        let buf = Arc::new(SampleBuffer::new(CancellationToken::new()));
        let pushers: Vec<_> = (0..4)
            .map(|i| {
                let buf = Arc::clone(&buf);
                std::thread::spawn(move || {
                    for j in 0..2_000 {
                        buf.push(MetricRecord::gauge(format!("m{i}_{j}"), 1.0));
                    }
                })
            })
            .collect();

        std::thread::sleep(std::time::Duration::from_millis(1));
        let drained = buf.drain().len() as u64;
        for p in pushers {
            p.join().expect("pusher joins");
        }

        assert!(buf.is_empty());
        assert_eq!(drained + buf.discarded(), 8_000);
    }
}
