//! Sample queue between an acquisition worker and its aggregation worker.
//!
//! Each device gets its own single-producer, single-consumer FIFO. Devices
//! configured with a `queue_capacity` get a bounded tokio channel, which
//! applies backpressure to the poll loop; the rest get an unbounded one.
use crate::core::Sample;
use tokio::sync::mpsc::{self, error::TryRecvError};

/// Producer half of a device's sample queue.
#[derive(Debug)]
pub enum SampleSender {
    /// Queue with a fixed capacity; sends wait for room.
    Bounded(mpsc::Sender<Sample>),
    /// Queue without a capacity.
    Unbounded(mpsc::UnboundedSender<Sample>),
}

/// Consumer half of a device's sample queue.
#[derive(Debug)]
pub enum SampleReceiver {
    /// Receiving end of a bounded queue.
    Bounded(mpsc::Receiver<Sample>),
    /// Receiving end of an unbounded queue.
    Unbounded(mpsc::UnboundedReceiver<Sample>),
}

/// Create a sample queue; `None` means unbounded.
///
/// A capacity of zero is treated as one, since tokio rejects empty channels.
pub fn sample_channel(capacity: Option<usize>) -> (SampleSender, SampleReceiver) {
    match capacity {
        Some(capacity) => {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            (SampleSender::Bounded(tx), SampleReceiver::Bounded(rx))
        }
        None => {
            let (tx, rx) = mpsc::unbounded_channel();
            (SampleSender::Unbounded(tx), SampleReceiver::Unbounded(rx))
        }
    }
}

impl SampleSender {
    /// Enqueue a sample, waiting for room on a bounded queue.
    ///
    /// Hands the sample back if the receiver is gone.
    pub async fn send(&self, sample: Sample) -> Result<(), Sample> {
        match self {
            SampleSender::Bounded(tx) => tx.send(sample).await.map_err(|err| err.0),
            SampleSender::Unbounded(tx) => tx.send(sample).map_err(|err| err.0),
        }
    }

    /// Whether the receiving side has been dropped.
    pub fn is_closed(&self) -> bool {
        match self {
            SampleSender::Bounded(tx) => tx.is_closed(),
            SampleSender::Unbounded(tx) => tx.is_closed(),
        }
    }
}

impl SampleReceiver {
    /// Wait for the next sample; `None` once every sender is dropped and the
    /// queue is empty.
    pub async fn recv(&mut self) -> Option<Sample> {
        match self {
            SampleReceiver::Bounded(rx) => rx.recv().await,
            SampleReceiver::Unbounded(rx) => rx.recv().await,
        }
    }

    /// Take a queued sample without waiting.
    pub fn try_recv(&mut self) -> Result<Sample, TryRecvError> {
        match self {
            SampleReceiver::Bounded(rx) => rx.try_recv(),
            SampleReceiver::Unbounded(rx) => rx.try_recv(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unbounded_queue_is_fifo() {
        let (tx, mut rx) = sample_channel(None);
        for value in [1.0, 2.0, 3.0] {
            tx.send(Sample::now([("value", value)])).await.unwrap();
        }
        drop(tx);

        let mut seen = Vec::new();
        while let Some(sample) = rx.recv().await {
            seen.push(sample.value("value").unwrap());
        }
        assert_eq!(seen, vec![1.0, 2.0, 3.0]);
    }

    #[tokio::test]
    async fn bounded_queue_reports_closed_receiver() {
        let (tx, rx) = sample_channel(Some(0));
        drop(rx);

        assert!(tx.is_closed());
        let sample = Sample::now([("value", 1.0)]);
        assert_eq!(tx.send(sample.clone()).await, Err(sample));
    }

    #[tokio::test]
    async fn try_recv_on_empty_queue() {
        let (_tx, mut rx) = sample_channel(Some(4));
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    }
}
