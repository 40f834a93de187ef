//! Device adapters
//!
//! Simulated instruments and the registry that builds adapters from
//! configuration. Real drivers implement [`crate::core::DeviceAdapter`] and
//! are added to an [`registry::AdapterRegistry`].

pub mod mock;
pub mod registry;

pub use mock::{ConstantAdapter, SimulatedCapacitanceBridge, SimulatedTemperatureController};
pub use registry::{build_registrations, AdapterRegistry};
