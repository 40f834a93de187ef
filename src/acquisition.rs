//! Acquisition worker: polls one device on a fixed cadence.
//!
//! The worker owns a [`DeviceAdapter`] and the producer half of the device's
//! sample queue. Every `poll_interval` it takes one reading and enqueues it.
//!
//! - A [`DeviceError::Communication`] is logged and counted; polling goes on.
//! - A [`DeviceError::Fatal`] marks the pipeline failed through its
//!   [`StatusReporter`] and ends the task with [`BufferError::FatalDevice`].
//! - [`AcquisitionWorker::stop`] only signals. The loop finishes the poll in
//!   progress, then exits; [`AcquisitionWorker::join`] waits for that.

use crate::channel::SampleSender;
use crate::core::DeviceAdapter;
use crate::error::{BufferError, DeviceError};
use crate::messages::{PipelineState, StatusReporter};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::Instrument;

/// How long [`AcquisitionWorker::join`] waits before aborting the task.
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Counters returned when an acquisition worker exits cleanly.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquisitionReport {
    /// Calls made to the adapter.
    pub polls: u64,
    /// Samples handed to the queue.
    pub samples_sent: u64,
    /// Polls that failed with a communication error.
    pub communication_errors: u64,
}

/// Handle to a running acquisition task.
pub struct AcquisitionWorker {
    device: String,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<AcquisitionReport, BufferError>>,
}

impl AcquisitionWorker {
    /// Spawn the poll loop on the current runtime.
    pub fn spawn(
        adapter: Arc<dyn DeviceAdapter>,
        poll_interval: Duration,
        queue: SampleSender,
        reporter: StatusReporter,
    ) -> Self {
        let device = reporter.device().to_string();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let span = tracing::info_span!("acquisition", device = %device);
        let task = tokio::spawn(
            poll_loop(adapter, poll_interval, queue, reporter, shutdown_rx).instrument(span),
        );

        Self {
            device,
            shutdown_tx: Some(shutdown_tx),
            task,
        }
    }

    /// Device this worker polls.
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Whether the poll loop is still alive.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Ask the loop to exit after its current iteration.
    pub fn stop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
    }

    /// Wait for the task to finish, aborting it after [`JOIN_TIMEOUT`].
    pub async fn join(mut self) -> Result<AcquisitionReport, BufferError> {
        // Dropping the sender also ends the loop, but be explicit.
        self.stop();
        let abort = self.task.abort_handle();
        match tokio::time::timeout(JOIN_TIMEOUT, self.task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(BufferError::WorkerPanicked(
                format!("acquisition:{}", self.device),
                e.to_string(),
            )),
            Err(_) => {
                abort.abort();
                tracing::warn!(device = %self.device, "Acquisition worker did not stop within {:?}, aborted", JOIN_TIMEOUT);
                Err(BufferError::WorkerPanicked(
                    format!("acquisition:{}", self.device),
                    "join timed out".to_string(),
                ))
            }
        }
    }
}

async fn poll_loop(
    adapter: Arc<dyn DeviceAdapter>,
    poll_interval: Duration,
    queue: SampleSender,
    reporter: StatusReporter,
    mut shutdown_rx: oneshot::Receiver<()>,
) -> Result<AcquisitionReport, BufferError> {
    let device = reporter.device().to_string();
    let mut ticker = interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut report = AcquisitionReport::default();

    tracing::debug!(device = %device, adapter = %adapter.identify(), ?poll_interval, "Acquisition started");

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown_rx => break,
            _ = ticker.tick() => {}
        }

        report.polls += 1;
        match adapter.poll().await {
            Ok(sample) => {
                if queue.send(sample).await.is_err() {
                    tracing::debug!(device = %device, "Sample queue closed, stopping acquisition");
                    break;
                }
                report.samples_sent += 1;
            }
            Err(DeviceError::Communication(message)) => {
                report.communication_errors += 1;
                tracing::warn!(device = %device, error = %message, "Poll failed, continuing");
            }
            Err(DeviceError::Fatal(message)) => {
                tracing::error!(device = %device, error = %message, "Device connection lost, stopping acquisition");
                reporter.fail(message.clone());
                return Err(DeviceError::Fatal(message).into_buffer_error(&device));
            }
        }
    }

    reporter.set(PipelineState::Stopped);
    tracing::debug!(device = %device, polls = report.polls, sent = report.samples_sent, "Acquisition stopped");
    Ok(report)
}
