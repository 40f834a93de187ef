//! Buffer manager: owns the device registry and drives every worker.
//!
//! Each registered device gets a pipeline made of an acquisition worker, a
//! sample queue, an aggregation worker and an [`Accumulator`]. One optional
//! [`SnapshotWriter`] persists all accumulators while recording.
//!
//! The manager itself never blocks: it spawns, signals and joins. All
//! methods take `&mut self` where they touch the registry or worker handles,
//! so registration can never race with starting or stopping collection. To
//! drive a manager from several places at once, move it into
//! [`crate::control::spawn_control`].
//!
//! # Example
//!
//! ```rust,no_run
//! use daq_buffer::buffer::BufferManager;
//! use daq_buffer::core::{AcquisitionConfig, DeviceRegistration};
//! use daq_buffer::hardware::mock::ConstantAdapter;
//! use std::sync::Arc;
//!
//! # async fn demo() -> daq_buffer::error::AppResult<()> {
//! let mut manager = BufferManager::default();
//! manager.register(vec![DeviceRegistration::new(
//!     "D1",
//!     Arc::new(ConstantAdapter::new(["value"], 42.0)),
//!     AcquisitionConfig::new(["value"]),
//! )])?;
//!
//! manager.start_collection().await?;
//! let path = manager.start_recording("cooldown", "temp_data").await?;
//! tokio::time::sleep(std::time::Duration::from_secs(1)).await;
//! manager.shutdown().await?;
//! println!("wrote {}", path.display());
//! # Ok(())
//! # }
//! ```

use crate::acquisition::AcquisitionWorker;
use crate::aggregation::AggregationWorker;
use crate::channel::sample_channel;
use crate::core::{DeviceRegistration, TIMESTAMP_COLUMN};
use crate::data::accumulator::{Accumulator, BufferSnapshot};
use crate::data::storage_factory::TableStoreRegistry;
use crate::error::{AppResult, BufferError};
use crate::messages::{BufferEvent, BufferStatus, PipelineState, StatusReporter};
use crate::recorder::{
    AccumulatorSet, RecordingReport, SnapshotWriter, DEFAULT_RECORD_INTERVAL,
};
use futures::future::join_all;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};

/// Capacity of the event broadcast channel.
const EVENT_CAPACITY: usize = 256;

/// Settings used when a recording is started.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordingSettings {
    /// Measurement name placed in the file name.
    pub measurement_name: String,
    /// Folder session files are written to.
    pub data_folder: PathBuf,
    /// Delay between two snapshot writes.
    pub interval: Duration,
    /// Storage backend name, resolved through a [`TableStoreRegistry`].
    pub backend: String,
}

impl Default for RecordingSettings {
    fn default() -> Self {
        Self {
            measurement_name: "Test_Measurement".to_string(),
            data_folder: PathBuf::from("temp_data"),
            interval: DEFAULT_RECORD_INTERVAL,
            backend: "json".to_string(),
        }
    }
}

struct Pipeline {
    registration: DeviceRegistration,
    accumulator: Arc<Accumulator>,
    state: Arc<watch::Sender<PipelineState>>,
    acquisition: Option<AcquisitionWorker>,
    aggregation: Option<AggregationWorker>,
}

impl Pipeline {
    fn name(&self) -> &str {
        &self.registration.name
    }

    fn is_running(&self) -> bool {
        self.acquisition
            .as_ref()
            .is_some_and(AcquisitionWorker::is_running)
    }

    /// Join workers left over from a previous run, e.g. after a fatal error.
    async fn reap(&mut self) {
        if let Some(worker) = self.acquisition.take() {
            if let Err(err) = worker.join().await {
                tracing::debug!(device = %self.name(), error = %err, "Reaped terminated acquisition worker");
            }
        }
        if let Some(worker) = self.aggregation.take() {
            if let Err(err) = worker.join().await {
                tracing::warn!(device = %self.name(), error = %err, "Aggregation worker ended abnormally");
            }
        }
    }
}

/// Orchestrator of every device pipeline and the snapshot writer.
pub struct BufferManager {
    pipelines: Vec<Pipeline>,
    recording: RecordingSettings,
    stores: TableStoreRegistry,
    recorder: Option<SnapshotWriter>,
    events: broadcast::Sender<BufferEvent>,
}

impl Default for BufferManager {
    fn default() -> Self {
        Self::new(RecordingSettings::default())
    }
}

impl BufferManager {
    /// Empty manager using the built-in storage backends.
    pub fn new(recording: RecordingSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            pipelines: Vec::new(),
            recording,
            stores: TableStoreRegistry::new(),
            recorder: None,
            events,
        }
    }

    /// Replace the storage backend registry.
    pub fn with_store_registry(mut self, stores: TableStoreRegistry) -> Self {
        self.stores = stores;
        self
    }

    /// Register the device set. Can only be done once per manager.
    ///
    /// Everything is validated before anything is stored, so a rejected call
    /// leaves the manager empty.
    pub fn register(&mut self, devices: Vec<DeviceRegistration>) -> AppResult<()> {
        if !self.pipelines.is_empty() {
            return Err(BufferError::config("devices are already registered"));
        }
        if devices.is_empty() {
            return Err(BufferError::config("at least one device must be registered"));
        }

        let mut names = HashSet::new();
        for device in &devices {
            validate_registration(device)?;
            if !names.insert(device.name.as_str()) {
                return Err(BufferError::config(format!(
                    "duplicate device name '{}'",
                    device.name
                )));
            }
        }

        self.pipelines = devices
            .into_iter()
            .map(|registration| {
                let accumulator = Arc::new(Accumulator::new(
                    registration.name.clone(),
                    registration.config.channels.iter().cloned(),
                ));
                let (state, _) = watch::channel(PipelineState::Idle);
                Pipeline {
                    registration,
                    accumulator,
                    state: Arc::new(state),
                    acquisition: None,
                    aggregation: None,
                }
            })
            .collect();

        tracing::info!(devices = ?self.device_names(), "Devices registered");
        Ok(())
    }

    /// Start every pipeline that is not running. Idempotent.
    ///
    /// Acquisition workers are started first, then aggregation workers. A
    /// pipeline whose acquisition ended on a fatal error counts as not
    /// running and is restarted against its existing accumulator.
    pub async fn start_collection(&mut self) -> AppResult<()> {
        if self.pipelines.is_empty() {
            return Err(BufferError::config("no devices registered"));
        }

        let mut pending = Vec::new();
        for (index, pipeline) in self.pipelines.iter_mut().enumerate() {
            if pipeline.is_running() {
                continue;
            }
            pipeline.reap().await;

            let config = &pipeline.registration.config;
            let (tx, rx) = sample_channel(config.queue_capacity);
            let reporter = StatusReporter::new(
                pipeline.registration.name.clone(),
                pipeline.state.clone(),
                self.events.clone(),
            );
            reporter.set(PipelineState::Running);
            pipeline.acquisition = Some(AcquisitionWorker::spawn(
                pipeline.registration.adapter.clone(),
                config.poll_interval,
                tx,
                reporter,
            ));
            pending.push((index, rx));
        }

        if pending.is_empty() {
            tracing::debug!("Collection already running");
            return Ok(());
        }

        let mut started = Vec::with_capacity(pending.len());
        for (index, rx) in pending {
            let pipeline = &mut self.pipelines[index];
            pipeline.aggregation = Some(AggregationWorker::spawn(pipeline.accumulator.clone(), rx));
            started.push(pipeline.registration.name.clone());
        }

        tracing::info!(devices = ?started, "Collection started");
        let _ = self
            .events
            .send(BufferEvent::CollectionStarted { devices: started });
        Ok(())
    }

    /// Stop and join every aggregation worker, then every acquisition worker.
    ///
    /// Aggregation drains what is already queued before it exits. A sample
    /// polled after that point is discarded rather than waited for.
    pub async fn stop_collection(&mut self) -> AppResult<()> {
        let aggregations: Vec<_> = self
            .pipelines
            .iter_mut()
            .filter_map(|p| p.aggregation.take())
            .collect();
        let acquisitions: Vec<_> = self
            .pipelines
            .iter_mut()
            .filter_map(|p| p.acquisition.take())
            .collect();
        if aggregations.is_empty() && acquisitions.is_empty() {
            return Ok(());
        }

        let mut first_error = None;
        for result in join_all(aggregations.into_iter().map(AggregationWorker::join)).await {
            if let Err(err) = result {
                tracing::error!(error = %err, "Aggregation worker did not stop cleanly");
                first_error.get_or_insert(err);
            }
        }
        for result in join_all(acquisitions.into_iter().map(AcquisitionWorker::join)).await {
            match result {
                Ok(report) => tracing::debug!(?report, "Acquisition worker joined"),
                // Already reported through the pipeline state.
                Err(BufferError::FatalDevice { .. }) => {}
                Err(err) => {
                    tracing::error!(error = %err, "Acquisition worker did not stop cleanly");
                    first_error.get_or_insert(err);
                }
            }
        }

        for pipeline in &self.pipelines {
            pipeline.state.send_if_modified(|state| {
                if matches!(state, PipelineState::Failed(_) | PipelineState::Stopped) {
                    return false;
                }
                *state = PipelineState::Stopped;
                true
            });
        }

        tracing::info!(rows = ?self.row_counts(), "Collection stopped");
        let _ = self.events.send(BufferEvent::CollectionStopped);
        first_error.map_or(Ok(()), Err)
    }

    /// Start persisting snapshots to `folder` under `measurement_name`.
    ///
    /// Stores both values as the current recording settings and returns the
    /// session file path.
    pub async fn start_recording(
        &mut self,
        measurement_name: impl Into<String>,
        folder: impl Into<PathBuf>,
    ) -> AppResult<PathBuf> {
        let measurement_name = measurement_name.into();
        let folder = folder.into();
        if self.is_recording() {
            return Err(BufferError::config("a recording is already active"));
        }
        validate_measurement_name(&measurement_name)?;
        validate_data_folder(&folder)?;
        if self.pipelines.is_empty() {
            return Err(BufferError::config("no devices registered"));
        }

        let store = self.stores.create(&self.recording.backend)?;
        let source = AccumulatorSet(self.pipelines.iter().map(|p| p.accumulator.clone()).collect());
        let writer = SnapshotWriter::start(
            Arc::new(source),
            store,
            &measurement_name,
            &folder,
            self.recording.interval,
            self.events.clone(),
        )
        .await?;
        let path = writer.path().to_path_buf();

        // Replaces any writer whose task already ended on its own.
        self.recorder = Some(writer);
        self.recording.measurement_name = measurement_name;
        self.recording.data_folder = folder;
        let _ = self
            .events
            .send(BufferEvent::RecordingStarted { path: path.clone() });
        Ok(path)
    }

    /// [`start_recording`](Self::start_recording) with the stored settings.
    pub async fn start_recording_configured(&mut self) -> AppResult<PathBuf> {
        let RecordingSettings {
            measurement_name,
            data_folder,
            ..
        } = self.recording.clone();
        self.start_recording(measurement_name, data_folder).await
    }

    /// Stop and join the snapshot writer. `Ok(None)` when nothing was recording.
    pub async fn stop_recording(&mut self) -> AppResult<Option<RecordingReport>> {
        let Some(writer) = self.recorder.take() else {
            return Ok(None);
        };
        let report = writer.join().await?;
        let _ = self.events.send(BufferEvent::RecordingStopped {
            path: report.path.clone(),
            snapshots: report.snapshots,
        });
        Ok(Some(report))
    }

    /// Set the name used by the next configured recording.
    pub fn set_measurement_name(&mut self, name: impl Into<String>) -> AppResult<()> {
        let name = name.into();
        self.ensure_not_recording("measurement name")?;
        validate_measurement_name(&name)?;
        self.recording.measurement_name = name;
        Ok(())
    }

    /// Set the folder used by the next configured recording.
    pub fn set_data_folder(&mut self, folder: impl Into<PathBuf>) -> AppResult<()> {
        let folder = folder.into();
        self.ensure_not_recording("data folder")?;
        validate_data_folder(&folder)?;
        self.recording.data_folder = folder;
        Ok(())
    }

    /// Settings the next configured recording will use.
    pub fn recording_settings(&self) -> &RecordingSettings {
        &self.recording
    }

    /// Copy of every accumulator, keyed by device name.
    pub fn snapshot(&self) -> BufferSnapshot {
        BufferSnapshot::capture(self.pipelines.iter().map(|p| p.accumulator.as_ref()))
    }

    /// Shared handle to one device's accumulator.
    pub fn accumulator(&self, device: &str) -> Option<Arc<Accumulator>> {
        self.pipelines
            .iter()
            .find(|p| p.name() == device)
            .map(|p| p.accumulator.clone())
    }

    /// Registered device names, in registration order.
    pub fn device_names(&self) -> Vec<String> {
        self.pipelines
            .iter()
            .map(|p| p.registration.name.clone())
            .collect()
    }

    /// Current state of every pipeline, keyed by device name.
    pub fn pipeline_states(&self) -> BTreeMap<String, PipelineState> {
        self.pipelines
            .iter()
            .map(|p| (p.registration.name.clone(), p.state.borrow().clone()))
            .collect()
    }

    /// Watch one pipeline's state.
    pub fn watch_pipeline(&self, device: &str) -> Option<watch::Receiver<PipelineState>> {
        self.pipelines
            .iter()
            .find(|p| p.name() == device)
            .map(|p| p.state.subscribe())
    }

    /// Subscribe to manager events.
    pub fn subscribe(&self) -> broadcast::Receiver<BufferEvent> {
        self.events.subscribe()
    }

    pub(crate) fn event_sender(&self) -> broadcast::Sender<BufferEvent> {
        self.events.clone()
    }

    /// Whether any pipeline is running.
    pub fn is_collecting(&self) -> bool {
        self.pipelines.iter().any(Pipeline::is_running)
    }

    /// Whether a snapshot writer is live.
    pub fn is_recording(&self) -> bool {
        self.recorder.as_ref().is_some_and(SnapshotWriter::is_running)
    }

    /// Point-in-time summary for a control surface.
    pub fn status(&self) -> BufferStatus {
        BufferStatus {
            pipelines: self.pipeline_states(),
            rows: self.row_counts(),
            collecting: self.is_collecting(),
            recording: self
                .recorder
                .as_ref()
                .filter(|w| w.is_running())
                .map(|w| w.path().to_path_buf()),
            measurement_name: self.recording.measurement_name.clone(),
            data_folder: self.recording.data_folder.clone(),
        }
    }

    /// Stop recording, then collection.
    pub async fn shutdown(&mut self) -> AppResult<()> {
        let recording = self.stop_recording().await;
        let collection = self.stop_collection().await;
        recording?;
        collection
    }

    fn row_counts(&self) -> BTreeMap<String, usize> {
        self.pipelines
            .iter()
            .map(|p| (p.registration.name.clone(), p.accumulator.len()))
            .collect()
    }

    fn ensure_not_recording(&self, what: &str) -> AppResult<()> {
        if self.is_recording() {
            return Err(BufferError::config(format!(
                "cannot change the {what} while recording"
            )));
        }
        Ok(())
    }
}

fn validate_registration(device: &DeviceRegistration) -> AppResult<()> {
    if device.name.trim().is_empty() {
        return Err(BufferError::config("device name must not be empty"));
    }
    let config = &device.config;
    if config.channels.is_empty() {
        return Err(BufferError::config(format!(
            "device '{}' declares no channels",
            device.name
        )));
    }
    let mut channels = HashSet::new();
    for channel in &config.channels {
        if channel.trim().is_empty() {
            return Err(BufferError::config(format!(
                "device '{}' declares an empty channel name",
                device.name
            )));
        }
        if channel == TIMESTAMP_COLUMN {
            return Err(BufferError::config(format!(
                "device '{}' uses the reserved channel name '{TIMESTAMP_COLUMN}'",
                device.name
            )));
        }
        if !channels.insert(channel.as_str()) {
            return Err(BufferError::config(format!(
                "device '{}' declares channel '{channel}' twice",
                device.name
            )));
        }
    }
    if config.poll_interval.is_zero() {
        return Err(BufferError::config(format!(
            "device '{}' has a zero poll interval",
            device.name
        )));
    }
    if config.queue_capacity == Some(0) {
        return Err(BufferError::config(format!(
            "device '{}' has a zero queue capacity",
            device.name
        )));
    }
    Ok(())
}

fn validate_measurement_name(name: &str) -> AppResult<()> {
    if name.trim().is_empty() {
        return Err(BufferError::config("measurement name must not be empty"));
    }
    if name.contains(['/', '\\']) {
        return Err(BufferError::config(format!(
            "measurement name '{name}' must not contain path separators"
        )));
    }
    Ok(())
}

fn validate_data_folder(folder: &Path) -> AppResult<()> {
    if folder.as_os_str().is_empty() {
        return Err(BufferError::config("data folder must not be empty"));
    }
    Ok(())
}
