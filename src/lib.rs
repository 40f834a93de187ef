//! # DAQ Buffer Library
//!
//! Live acquisition buffer for slow laboratory instruments (temperature
//! controllers, capacitance bridges and the like). Each registered device is
//! polled on its own cadence, its readings are appended to a per-device
//! in-memory table, and a background writer periodically persists every table
//! to a single session file while recording is on.
//!
//! ## Crate Structure
//!
//! - **`core`**: `Sample`, the `DeviceAdapter` capability trait and
//!   per-device acquisition settings.
//! - **`acquisition`**: the poll loop that turns an adapter into a stream of
//!   samples.
//! - **`channel`**: the per-device sample queue (bounded or unbounded).
//! - **`aggregation`**: the drain loop that appends queued samples to an
//!   accumulator.
//! - **`data`**: accumulators, snapshots and the `TableStore` backends (JSON,
//!   optional HDF5).
//! - **`recorder`**: the periodic snapshot writer.
//! - **`buffer`**: `BufferManager`, which registers devices and starts,
//!   stops and joins every worker.
//! - **`control`**: a command task so several control surfaces can share one
//!   manager.
//! - **`messages`**: pipeline states, events and control commands.
//! - **`hardware`**: simulated instruments and the adapter registry.
//! - **`config`**, **`logging`**, **`error`**: Figment settings, tracing
//!   setup and the `BufferError` type.
//!
//! ## Data flow
//!
//! ```text
//! DeviceAdapter ─poll─► AcquisitionWorker ─queue─► AggregationWorker ─append─► Accumulator
//!                                                                                   │
//!                              session file ◄─TableStore─ SnapshotWriter ◄─snapshot─┘
//! ```

pub mod acquisition;
pub mod aggregation;
pub mod buffer;
pub mod channel;
pub mod config;
pub mod control;
pub mod core;
pub mod data;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod messages;
pub mod recorder;

pub use buffer::{BufferManager, RecordingSettings};
pub use control::{spawn_control, ControlHandle};
pub use core::{AcquisitionConfig, DeviceAdapter, DeviceRegistration, Sample};
pub use error::{AppResult, BufferError, DeviceError};
