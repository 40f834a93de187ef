//! Core traits and data types for the buffer pipeline.
use crate::error::DeviceError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Name of the index column every accumulator and persisted table carries.
pub const TIMESTAMP_COLUMN: &str = "timestamp";

/// Default cadence of an acquisition worker.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// One timestamped set of channel readings from a device.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// When the readings were taken.
    pub timestamp: DateTime<Utc>,
    /// Channel readings in the order the device produced them.
    pub channels: Vec<(String, f64)>,
}

impl Sample {
    /// Create a sample stamped with the given instant.
    pub fn new(timestamp: DateTime<Utc>, channels: Vec<(String, f64)>) -> Self {
        Self {
            timestamp,
            channels,
        }
    }

    /// Create a sample stamped with the current time.
    pub fn now<I, S>(channels: I) -> Self
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        Self::new(
            Utc::now(),
            channels
                .into_iter()
                .map(|(name, value)| (name.into(), value))
                .collect(),
        )
    }

    /// Value of a named channel, if present.
    pub fn value(&self, channel: &str) -> Option<f64> {
        self.channels
            .iter()
            .find(|(name, _)| name == channel)
            .map(|(_, value)| *value)
    }
}

/// Capability: polled instrument.
///
/// Wraps one physical instrument behind its command protocol. Implementations
/// live with the device drivers; the pipeline only ever calls these two
/// methods.
///
/// # Contract
/// - `poll` returns one [`Sample`] per call or fails fast
/// - [`DeviceError::Communication`] means "this read failed, try again"
/// - [`DeviceError::Fatal`] means "the connection is gone", and polling stops
#[async_trait]
pub trait DeviceAdapter: Send + Sync {
    /// Human-readable identification for diagnostics (model, address).
    fn identify(&self) -> String;

    /// Take one reading from the instrument.
    async fn poll(&self) -> Result<Sample, DeviceError>;
}

/// Per-device acquisition settings, fixed at registration.
#[derive(Clone, Debug, PartialEq)]
pub struct AcquisitionConfig {
    /// Channels the device reports, in column order.
    pub channels: Vec<String>,
    /// Delay between two polls.
    pub poll_interval: Duration,
    /// Capacity of the acquisition queue; `None` means unbounded.
    pub queue_capacity: Option<usize>,
}

impl AcquisitionConfig {
    /// Settings with the default poll interval and an unbounded queue.
    pub fn new<I, S>(channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            channels: channels.into_iter().map(Into::into).collect(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            queue_capacity: None,
        }
    }

    /// Set the delay between two polls.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Bound the acquisition queue.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }
}

/// A device handed to [`BufferManager::register`](crate::buffer::BufferManager::register).
#[derive(Clone)]
pub struct DeviceRegistration {
    /// Unique device name; also the table name in session files.
    pub name: String,
    /// Instrument to poll.
    pub adapter: Arc<dyn DeviceAdapter>,
    /// Channels, cadence and queue bound.
    pub config: AcquisitionConfig,
}

impl DeviceRegistration {
    /// Bundle a name, adapter and acquisition settings.
    pub fn new(
        name: impl Into<String>,
        adapter: Arc<dyn DeviceAdapter>,
        config: AcquisitionConfig,
    ) -> Self {
        Self {
            name: name.into(),
            adapter,
            config,
        }
    }
}

impl std::fmt::Debug for DeviceRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistration")
            .field("name", &self.name)
            .field("adapter", &self.adapter.identify())
            .field("config", &self.config)
            .finish()
    }
}
