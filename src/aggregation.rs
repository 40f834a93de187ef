//! Aggregation worker: moves samples from a device queue into its accumulator.
//!
//! This is the only writer of its [`Accumulator`]. A sample that does not
//! match the declared channels is logged and dropped; the accumulator is left
//! untouched, so column lengths never diverge.
//!
//! On [`AggregationWorker::stop`] the worker stops waiting, appends whatever
//! is already queued, and exits. It also exits on its own when the
//! acquisition side drops the queue.

use crate::acquisition::JOIN_TIMEOUT;
use crate::channel::SampleReceiver;
use crate::data::accumulator::Accumulator;
use crate::error::BufferError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::Instrument;

/// Counters returned when an aggregation worker exits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationReport {
    /// Samples appended as rows.
    pub appended: u64,
    /// Malformed samples that were logged and discarded.
    pub dropped: u64,
}

/// Handle to a running aggregation task.
pub struct AggregationWorker {
    device: String,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<AggregationReport>,
}

impl AggregationWorker {
    /// Spawn the drain loop on the current runtime.
    pub fn spawn(accumulator: Arc<Accumulator>, queue: SampleReceiver) -> Self {
        let device = accumulator.device().to_string();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let span = tracing::info_span!("aggregation", device = %device);
        let task = tokio::spawn(drain_loop(accumulator, queue, shutdown_rx).instrument(span));

        Self {
            device,
            shutdown_tx: Some(shutdown_tx),
            task,
        }
    }

    /// Device this worker feeds.
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Whether the drain loop is still alive.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Wake the worker and make it exit once the queue is drained.
    pub fn stop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
    }

    /// Wait for the task to finish, aborting it after [`JOIN_TIMEOUT`].
    pub async fn join(mut self) -> Result<AggregationReport, BufferError> {
        self.stop();
        let abort = self.task.abort_handle();
        match tokio::time::timeout(JOIN_TIMEOUT, self.task).await {
            Ok(Ok(report)) => Ok(report),
            Ok(Err(e)) => Err(BufferError::WorkerPanicked(
                format!("aggregation:{}", self.device),
                e.to_string(),
            )),
            Err(_) => {
                abort.abort();
                Err(BufferError::WorkerPanicked(
                    format!("aggregation:{}", self.device),
                    "join timed out".to_string(),
                ))
            }
        }
    }
}

async fn drain_loop(
    accumulator: Arc<Accumulator>,
    mut queue: SampleReceiver,
    mut shutdown_rx: oneshot::Receiver<()>,
) -> AggregationReport {
    let mut report = AggregationReport::default();

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown_rx => {
                while let Ok(sample) = queue.try_recv() {
                    ingest(&accumulator, &sample, &mut report);
                }
                break;
            }
            next = queue.recv() => match next {
                Some(sample) => ingest(&accumulator, &sample, &mut report),
                None => {
                    tracing::debug!("Sample queue closed");
                    break;
                }
            }
        }
    }

    tracing::debug!(
        appended = report.appended,
        dropped = report.dropped,
        rows = accumulator.len(),
        "Aggregation stopped"
    );
    report
}

fn ingest(accumulator: &Accumulator, sample: &crate::core::Sample, report: &mut AggregationReport) {
    match accumulator.append(sample) {
        Ok(_) => report.appended += 1,
        Err(rejection) => {
            report.dropped += 1;
            tracing::warn!(
                device = %accumulator.device(),
                error = %rejection,
                timestamp = %sample.timestamp,
                "Dropping malformed sample"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::sample_channel;
    use crate::core::Sample;
    use std::time::Duration;
    use tracing_test::traced_test;

    #[tokio::test]
    async fn appends_samples_in_order() {
        let acc = Arc::new(Accumulator::new("D1", ["value"]));
        let (tx, rx) = sample_channel(None);
        let worker = AggregationWorker::spawn(acc.clone(), rx);

        for value in [1.0, 2.0, 3.0] {
            tx.send(Sample::now([("value", value)])).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let report = worker.join().await.unwrap();
        assert_eq!(report.appended, 3);
        assert_eq!(acc.snapshot().column("value").unwrap(), &[1.0, 2.0, 3.0]);
    }

    #[tokio::test]
    #[traced_test]
    async fn malformed_samples_are_dropped_not_fatal() {
        let acc = Arc::new(Accumulator::new("D1", ["a", "b"]));
        let (tx, rx) = sample_channel(None);
        let worker = AggregationWorker::spawn(acc.clone(), rx);

        tx.send(Sample::now([("a", 1.0), ("b", 2.0)])).await.unwrap();
        tx.send(Sample::now([("a", 1.0)])).await.unwrap();
        tx.send(Sample::now([("a", 1.0), ("b", 2.0), ("c", 3.0)])).await.unwrap();
        tx.send(Sample::now([("a", 4.0), ("b", 5.0)])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(worker.is_running());

        let report = worker.join().await.unwrap();
        assert_eq!(report, AggregationReport { appended: 2, dropped: 2 });

        let table = acc.snapshot();
        assert_eq!(table.validate("D1").unwrap(), 2);
        assert_eq!(table.column("a").unwrap(), &[1.0, 4.0]);
        assert!(logs_contain("Dropping malformed sample"));
    }

    #[tokio::test]
    async fn stop_drains_queued_samples() {
        let acc = Arc::new(Accumulator::new("D1", ["value"]));
        let (tx, rx) = sample_channel(None);
        for value in 0..100 {
            tx.send(Sample::now([("value", value as f64)])).await.unwrap();
        }

        // Stop before the worker ever runs; everything queued must still land.
        let mut worker = AggregationWorker::spawn(acc.clone(), rx);
        worker.stop();
        let report = worker.join().await.unwrap();

        assert_eq!(report.appended, 100);
        assert_eq!(acc.len(), 100);
    }

    #[tokio::test]
    async fn stop_returns_promptly_with_idle_queue() {
        let acc = Arc::new(Accumulator::new("D1", ["value"]));
        let (_tx, rx) = sample_channel(None);
        let worker = AggregationWorker::spawn(acc, rx);

        let started = std::time::Instant::now();
        worker.join().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn exits_when_queue_closes() {
        let acc = Arc::new(Accumulator::new("D1", ["value"]));
        let (tx, rx) = sample_channel(Some(4));
        let worker = AggregationWorker::spawn(acc, rx);

        drop(tx);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!worker.is_running());
    }
}
