//! Custom error types for the buffer pipeline.
//!
//! This module defines the primary error type, `BufferError`, used across the
//! acquisition, aggregation and persistence layers, plus `DeviceError`, the
//! narrower error a device adapter reports from a single poll.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: bad registration input or an invalid state transition such
//!   as starting a second recording. Always reported straight to the caller.
//! - **`Communication`**: a single failed poll. Recovered by the acquisition
//!   worker, which logs it and keeps polling.
//! - **`Structural`**: a column-length mismatch observed while snapshotting an
//!   accumulator. Recovered by the snapshot writer, which skips that cycle.
//! - **`FatalDevice`**: the device connection is unusable. The device's
//!   acquisition worker terminates and the manager marks the pipeline failed.
//! - **`Storage`**, **`Serialization`**, **`Io`**: persistence failures.
//! - **`FeatureNotEnabled`**: a storage backend was requested that was not
//!   compiled in.
//! - **`WorkerPanicked`**: a worker task could not be joined cleanly.
//! - **`ControlClosed`**: a command was sent after the control task exited.

use thiserror::Error;

/// Convenience alias for results using the pipeline error type.
pub type AppResult<T> = std::result::Result<T, BufferError>;

/// Errors raised by the acquisition, buffering and recording pipeline.
#[derive(Error, Debug)]
pub enum BufferError {
    /// Bad registration input, invalid settings or an invalid state transition.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A single failed poll on one device.
    #[error("Communication error on '{device}': {message}")]
    Communication {
        /// Device name.
        device: String,
        /// What went wrong.
        message: String,
    },

    /// A table whose columns have different lengths.
    #[error("Structural error in table '{table}': {message}")]
    Structural {
        /// Table (device) name.
        table: String,
        /// What went wrong.
        message: String,
    },

    /// A device connection that can no longer be used.
    #[error("Fatal device error on '{device}': {message}")]
    FatalDevice {
        /// Device name.
        device: String,
        /// What went wrong.
        message: String,
    },

    /// A table store failed to write or flush.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A session file could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A backend that exists but was not compiled in.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    /// A worker task that panicked or did not finish in time: `(worker, reason)`.
    #[error("Worker '{0}' terminated abnormally: {1}")]
    WorkerPanicked(String, String),

    /// The control task is gone.
    #[error("Control task is no longer running")]
    ControlClosed,
}

impl BufferError {
    /// Shorthand for a [`BufferError::Config`].
    pub fn config(message: impl Into<String>) -> Self {
        BufferError::Config(message.into())
    }

    /// Whether the owning worker may keep running after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            BufferError::Communication { .. } | BufferError::Structural { .. }
        )
    }
}

/// Failure of a single [`poll`](crate::core::DeviceAdapter::poll).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    /// The read failed but the connection is still usable.
    #[error("communication failure: {0}")]
    Communication(String),

    /// The connection is gone; polling must stop.
    #[error("device connection lost: {0}")]
    Fatal(String),
}

impl DeviceError {
    /// Attach the device name, producing the pipeline-level error.
    pub fn into_buffer_error(self, device: &str) -> BufferError {
        match self {
            DeviceError::Communication(message) => BufferError::Communication {
                device: device.to_string(),
                message,
            },
            DeviceError::Fatal(message) => BufferError::FatalDevice {
                device: device.to_string(),
                message,
            },
        }
    }
}
