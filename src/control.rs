//! Control task: serializes commands from any number of control surfaces.
//!
//! [`spawn_control`] moves a [`BufferManager`] into a task that handles one
//! [`ControlCommand`] at a time and returns a cloneable [`ControlHandle`].
//! A GUI, a CLI and a script can all hold handles; the manager still sees a
//! strictly sequential stream of calls.
//!
//! The task ends after [`ControlHandle::shutdown`], or once every handle is
//! dropped, and hands the manager back through its `JoinHandle`.

use crate::buffer::BufferManager;
use crate::data::accumulator::BufferSnapshot;
use crate::error::{AppResult, BufferError};
use crate::messages::{BufferEvent, BufferStatus, ControlCommand};
use crate::recorder::RecordingReport;
use std::path::PathBuf;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::Instrument;

/// Default depth of the command queue.
pub const DEFAULT_COMMAND_CAPACITY: usize = 32;

/// Cloneable sender side of the control task.
#[derive(Clone)]
pub struct ControlHandle {
    commands: mpsc::Sender<ControlCommand>,
    events: broadcast::Sender<BufferEvent>,
}

/// Move `manager` into a control task.
pub fn spawn_control(
    manager: BufferManager,
    capacity: usize,
) -> (ControlHandle, JoinHandle<BufferManager>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let events = manager.event_sender();
    let task = tokio::spawn(
        command_loop(manager, rx).instrument(tracing::info_span!("control")),
    );
    (
        ControlHandle {
            commands: tx,
            events,
        },
        task,
    )
}

async fn command_loop(
    mut manager: BufferManager,
    mut commands: mpsc::Receiver<ControlCommand>,
) -> BufferManager {
    while let Some(command) = commands.recv().await {
        tracing::debug!(?command, "Handling control command");
        match command {
            ControlCommand::StartCollection { response } => {
                let _ = response.send(manager.start_collection().await);
            }
            ControlCommand::StopCollection { response } => {
                let _ = response.send(manager.stop_collection().await);
            }
            ControlCommand::StartRecording {
                measurement_name,
                folder,
                response,
            } => {
                let _ = response.send(manager.start_recording(measurement_name, folder).await);
            }
            ControlCommand::StartRecordingConfigured { response } => {
                let _ = response.send(manager.start_recording_configured().await);
            }
            ControlCommand::StopRecording { response } => {
                let _ = response.send(manager.stop_recording().await);
            }
            ControlCommand::SetMeasurementName { name, response } => {
                let _ = response.send(manager.set_measurement_name(name));
            }
            ControlCommand::SetDataFolder { folder, response } => {
                let _ = response.send(manager.set_data_folder(folder));
            }
            ControlCommand::Snapshot { response } => {
                let _ = response.send(manager.snapshot());
            }
            ControlCommand::Status { response } => {
                let _ = response.send(manager.status());
            }
            ControlCommand::Shutdown { response } => {
                let _ = response.send(manager.shutdown().await);
                tracing::info!("Control task shut down");
                return manager;
            }
        }
    }

    // Every handle dropped without an explicit shutdown.
    if let Err(err) = manager.shutdown().await {
        tracing::error!(error = %err, "Shutdown after last control handle dropped failed");
    }
    manager
}

impl ControlHandle {
    async fn request<T>(
        &self,
        (command, reply): (ControlCommand, oneshot::Receiver<T>),
    ) -> AppResult<T> {
        self.commands
            .send(command)
            .await
            .map_err(|_| BufferError::ControlClosed)?;
        reply.await.map_err(|_| BufferError::ControlClosed)
    }

    /// Start every pipeline that is not running.
    pub async fn start_collection(&self) -> AppResult<()> {
        self.request(ControlCommand::start_collection()).await?
    }

    /// Stop and join every worker.
    pub async fn stop_collection(&self) -> AppResult<()> {
        self.request(ControlCommand::stop_collection()).await?
    }

    /// Record under `measurement_name` in `folder`; returns the session file path.
    pub async fn start_recording(
        &self,
        measurement_name: impl Into<String>,
        folder: impl Into<PathBuf>,
    ) -> AppResult<PathBuf> {
        self.request(ControlCommand::start_recording(measurement_name, folder))
            .await?
    }

    /// Record with the stored name and folder.
    pub async fn start_recording_configured(&self) -> AppResult<PathBuf> {
        self.request(ControlCommand::start_recording_configured())
            .await?
    }

    /// Stop the snapshot writer. `None` when nothing was recording.
    pub async fn stop_recording(&self) -> AppResult<Option<RecordingReport>> {
        self.request(ControlCommand::stop_recording()).await?
    }

    /// Change the stored measurement name.
    pub async fn set_measurement_name(&self, name: impl Into<String>) -> AppResult<()> {
        self.request(ControlCommand::set_measurement_name(name))
            .await?
    }

    /// Change the stored output folder.
    pub async fn set_data_folder(&self, folder: impl Into<PathBuf>) -> AppResult<()> {
        self.request(ControlCommand::set_data_folder(folder)).await?
    }

    /// Copy of all accumulators.
    pub async fn snapshot(&self) -> AppResult<BufferSnapshot> {
        self.request(ControlCommand::snapshot()).await
    }

    /// Current manager status.
    pub async fn status(&self) -> AppResult<BufferStatus> {
        self.request(ControlCommand::status()).await
    }

    /// Stop recording and collection, then end the control task.
    pub async fn shutdown(&self) -> AppResult<()> {
        self.request(ControlCommand::shutdown()).await?
    }

    /// Subscribe to manager events.
    pub fn subscribe(&self) -> broadcast::Receiver<BufferEvent> {
        self.events.subscribe()
    }

    /// Whether the control task has exited.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}
