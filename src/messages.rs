//! Message types exchanged between the buffer pipeline and a control surface.
//!
//! # Status
//!
//! Every device pipeline publishes its [`PipelineState`] on a `watch` channel
//! and the manager fans [`BufferEvent`]s out on a `broadcast` channel. A GUI
//! subscribes to the events and polls the states; neither blocks the workers.
//!
//! # Commands
//!
//! [`ControlCommand`] is the request side of the control actor (see
//! [`crate::control`]). Commands are sent via an mpsc channel, and responses
//! come back through the oneshot sender embedded in each variant:
//!
//! ```text
//! Control surface                   Control task
//! ---------------                   ------------
//! 1. Create command with oneshot
//! 2. Send via mpsc channel    ------>
//!                                   3. Receive command
//!                                   4. Drive BufferManager
//!                                   5. Send response
//! 6. Await oneshot receiver   <------
//! ```
//!
//! Each variant has a helper that builds the command and returns the
//! receiver:
//!
//! ```rust
//! use daq_buffer::messages::ControlCommand;
//!
//! let (cmd, rx) = ControlCommand::start_collection();
//! // cmd_tx.send(cmd).await?;
//! // let result = rx.await?;
//! ```

use crate::data::accumulator::BufferSnapshot;
use crate::error::AppResult;
use crate::recorder::RecordingReport;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot, watch};

/// Lifecycle of one device's acquisition/aggregation pair.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineState {
    /// Registered, never started.
    Idle,
    /// Acquisition and aggregation tasks are live.
    Running,
    /// Stopped on request.
    Stopped,
    /// Acquisition terminated on a fatal device error.
    Failed(String),
}

impl PipelineState {
    /// Whether the pipeline is currently collecting.
    pub fn is_running(&self) -> bool {
        matches!(self, PipelineState::Running)
    }
}

/// Notifications published by the buffer manager.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum BufferEvent {
    /// `start_collection` finished.
    CollectionStarted {
        /// Devices that were started.
        devices: Vec<String>,
    },
    /// Every worker has been stopped and joined.
    CollectionStopped,
    /// A snapshot writer opened a session file.
    RecordingStarted {
        /// Session file.
        path: PathBuf,
    },
    /// The snapshot writer finished.
    RecordingStopped {
        /// Session file.
        path: PathBuf,
        /// Snapshots written, including the final one.
        snapshots: u64,
    },
    /// A device reported a fatal error and its acquisition ended.
    DeviceFailed {
        /// Device name.
        device: String,
        /// Error reported by the adapter.
        reason: String,
    },
    /// A torn snapshot was not written.
    SnapshotSkipped {
        /// Validation error of the snapshot.
        reason: String,
    },
}

/// Write side of one pipeline's status, handed to its acquisition worker.
#[derive(Clone, Debug)]
pub struct StatusReporter {
    device: String,
    state: Arc<watch::Sender<PipelineState>>,
    events: broadcast::Sender<BufferEvent>,
}

impl StatusReporter {
    /// Reporter for `device` publishing to `state` and `events`.
    pub fn new(
        device: impl Into<String>,
        state: Arc<watch::Sender<PipelineState>>,
        events: broadcast::Sender<BufferEvent>,
    ) -> Self {
        Self {
            device: device.into(),
            state,
            events,
        }
    }

    /// Device this reporter speaks for.
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Publish a new state.
    pub fn set(&self, state: PipelineState) {
        self.state.send_replace(state);
    }

    /// Mark the pipeline failed and tell subscribers why.
    pub fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.state.send_replace(PipelineState::Failed(reason.clone()));
        // No subscribers is fine.
        let _ = self.events.send(BufferEvent::DeviceFailed {
            device: self.device.clone(),
            reason,
        });
    }
}

/// Point-in-time view of the manager for a control surface.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BufferStatus {
    /// State of every pipeline.
    pub pipelines: BTreeMap<String, PipelineState>,
    /// Rows accumulated per device.
    pub rows: BTreeMap<String, usize>,
    /// Whether any pipeline is running.
    pub collecting: bool,
    /// Session file of the active recording, if any.
    pub recording: Option<PathBuf>,
    /// Measurement name used by the next configured recording.
    pub measurement_name: String,
    /// Folder used by the next configured recording.
    pub data_folder: PathBuf,
}

/// Commands accepted by the control task.
#[derive(Debug)]
pub enum ControlCommand {
    /// Start every pipeline that is not running.
    StartCollection {
        /// Response channel
        response: oneshot::Sender<AppResult<()>>,
    },
    /// Stop aggregation, then acquisition, for every device.
    StopCollection {
        /// Response channel
        response: oneshot::Sender<AppResult<()>>,
    },
    /// Start the snapshot writer with an explicit name and folder.
    ///
    /// Responds with the session file path.
    StartRecording {
        /// Measurement name used in the file name
        measurement_name: String,
        /// Output folder
        folder: PathBuf,
        /// Response channel
        response: oneshot::Sender<AppResult<PathBuf>>,
    },
    /// Start the snapshot writer with the stored name and folder.
    StartRecordingConfigured {
        /// Response channel
        response: oneshot::Sender<AppResult<PathBuf>>,
    },
    /// Stop and join the snapshot writer.
    StopRecording {
        /// Response channel
        response: oneshot::Sender<AppResult<Option<RecordingReport>>>,
    },
    /// Change the stored measurement name.
    SetMeasurementName {
        /// New measurement name
        name: String,
        /// Response channel
        response: oneshot::Sender<AppResult<()>>,
    },
    /// Change the stored output folder.
    SetDataFolder {
        /// Output folder
        folder: PathBuf,
        /// Response channel
        response: oneshot::Sender<AppResult<()>>,
    },
    /// Copy of all accumulators.
    Snapshot {
        /// Response channel
        response: oneshot::Sender<BufferSnapshot>,
    },
    /// Current [`BufferStatus`].
    Status {
        /// Response channel
        response: oneshot::Sender<BufferStatus>,
    },
    /// Stop recording and collection, then end the control task.
    Shutdown {
        /// Response channel
        response: oneshot::Sender<AppResult<()>>,
    },
}

impl ControlCommand {
    /// Build a [`ControlCommand::StartCollection`] and its reply receiver.
    pub fn start_collection() -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (response, rx) = oneshot::channel();
        (Self::StartCollection { response }, rx)
    }

    /// Build a [`ControlCommand::StopCollection`] and its reply receiver.
    pub fn stop_collection() -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (response, rx) = oneshot::channel();
        (Self::StopCollection { response }, rx)
    }

    /// Build a [`ControlCommand::StartRecording`] and its reply receiver.
    pub fn start_recording(
        measurement_name: impl Into<String>,
        folder: impl Into<PathBuf>,
    ) -> (Self, oneshot::Receiver<AppResult<PathBuf>>) {
        let (response, rx) = oneshot::channel();
        (
            Self::StartRecording {
                measurement_name: measurement_name.into(),
                folder: folder.into(),
                response,
            },
            rx,
        )
    }

    /// Build a [`ControlCommand::StartRecordingConfigured`] and its reply receiver.
    pub fn start_recording_configured() -> (Self, oneshot::Receiver<AppResult<PathBuf>>) {
        let (response, rx) = oneshot::channel();
        (Self::StartRecordingConfigured { response }, rx)
    }

    /// Build a [`ControlCommand::StopRecording`] and its reply receiver.
    pub fn stop_recording() -> (Self, oneshot::Receiver<AppResult<Option<RecordingReport>>>) {
        let (response, rx) = oneshot::channel();
        (Self::StopRecording { response }, rx)
    }

    /// Build a [`ControlCommand::SetMeasurementName`] and its reply receiver.
    pub fn set_measurement_name(
        name: impl Into<String>,
    ) -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (response, rx) = oneshot::channel();
        (
            Self::SetMeasurementName {
                name: name.into(),
                response,
            },
            rx,
        )
    }

    /// Build a [`ControlCommand::SetDataFolder`] and its reply receiver.
    pub fn set_data_folder(folder: impl Into<PathBuf>) -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (response, rx) = oneshot::channel();
        (
            Self::SetDataFolder {
                folder: folder.into(),
                response,
            },
            rx,
        )
    }

    /// Build a [`ControlCommand::Snapshot`] and its reply receiver.
    pub fn snapshot() -> (Self, oneshot::Receiver<BufferSnapshot>) {
        let (response, rx) = oneshot::channel();
        (Self::Snapshot { response }, rx)
    }

    /// Build a [`ControlCommand::Status`] and its reply receiver.
    pub fn status() -> (Self, oneshot::Receiver<BufferStatus>) {
        let (response, rx) = oneshot::channel();
        (Self::Status { response }, rx)
    }

    /// Build a [`ControlCommand::Shutdown`] and its reply receiver.
    pub fn shutdown() -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (response, rx) = oneshot::channel();
        (Self::Shutdown { response }, rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reporter_fail_updates_state_and_publishes_event() {
        let (state_tx, state_rx) = watch::channel(PipelineState::Running);
        let (events_tx, mut events_rx) = broadcast::channel(8);
        let reporter = StatusReporter::new("ITC1", Arc::new(state_tx), events_tx);

        reporter.fail("GPIB timeout");

        assert_eq!(
            *state_rx.borrow(),
            PipelineState::Failed("GPIB timeout".into())
        );
        assert_eq!(
            events_rx.try_recv().unwrap(),
            BufferEvent::DeviceFailed {
                device: "ITC1".into(),
                reason: "GPIB timeout".into(),
            }
        );
    }

    #[test]
    fn reporter_without_subscribers_does_not_fail() {
        let (state_tx, state_rx) = watch::channel(PipelineState::Idle);
        let (events_tx, _) = broadcast::channel(1);
        let reporter = StatusReporter::new("AH1", Arc::new(state_tx), events_tx);

        reporter.set(PipelineState::Running);
        reporter.fail("lost");
        assert!(matches!(*state_rx.borrow(), PipelineState::Failed(_)));
    }

    #[test]
    fn command_helpers_return_live_receivers() {
        let (cmd, mut rx) = ControlCommand::set_measurement_name("cooldown");
        match cmd {
            ControlCommand::SetMeasurementName { name, response } => {
                assert_eq!(name, "cooldown");
                response.send(Ok(())).unwrap();
            }
            other => panic!("unexpected command: {:?}", other),
        }
        assert!(matches!(rx.try_recv(), Ok(Ok(()))));
    }
}
