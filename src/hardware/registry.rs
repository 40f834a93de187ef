//! Adapter Registry
//!
//! Maps the `type` of a configured device to a factory that builds its
//! [`DeviceAdapter`]. The built-in simulated instruments are always present;
//! real drivers are added with [`AdapterRegistry::register`].
//!
//! ```text
//! [[devices]] (config)  ──►  AdapterRegistry::create  ──►  Arc<dyn DeviceAdapter>
//!                                                          │
//!         build_registrations(settings, registry)  ◄───────┘
//!                 │
//!                 ▼
//!        Vec<DeviceRegistration>  ──►  BufferManager::register
//! ```
//!
//! # Example Usage
//!
//! ```rust
//! use daq_buffer::config::Settings;
//! use daq_buffer::hardware::registry::{build_registrations, AdapterRegistry};
//!
//! let settings = Settings::default();
//! let registry = AdapterRegistry::new();
//! let devices = build_registrations(&settings, &registry)?;
//! assert!(devices.is_empty());
//! # Ok::<(), anyhow::Error>(())
//! ```

use crate::config::{DeviceDefinition, Settings};
use crate::core::{DeviceAdapter, DeviceRegistration};
use crate::hardware::mock::{
    ConstantAdapter, SimulatedCapacitanceBridge, SimulatedTemperatureController,
};
use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Builds an adapter from its configuration entry.
pub type AdapterFactory =
    Box<dyn Fn(&DeviceDefinition) -> Result<Arc<dyn DeviceAdapter>> + Send + Sync>;

/// Default reading of the `constant` adapter.
pub const DEFAULT_CONSTANT_VALUE: f64 = 42.0;

/// Factories keyed by adapter type name.
pub struct AdapterRegistry {
    factories: HashMap<String, AdapterFactory>,
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AdapterRegistry {
    /// Registry with the built-in simulated adapters.
    pub fn new() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };

        registry.register("constant", |def| {
            let value = def.param_f64("value").unwrap_or(DEFAULT_CONSTANT_VALUE);
            Ok(Arc::new(ConstantAdapter::new(def.channels.iter().cloned(), value)))
        });

        registry.register("temperature_controller", |def| {
            let (failure_rate, latency) = fault_params(def)?;
            Ok(Arc::new(
                SimulatedTemperatureController::new(def.channels.clone())?
                    .with_failure_rate(failure_rate)
                    .with_latency(latency),
            ))
        });

        registry.register("capacitance_bridge", |def| {
            let (failure_rate, latency) = fault_params(def)?;
            let mut bridge = SimulatedCapacitanceBridge::new(def.channels.clone())?
                .with_failure_rate(failure_rate)
                .with_latency(latency);
            if let Some(pf) = def.param_f64("base_capacitance") {
                bridge = bridge.with_base_capacitance(pf);
            }
            if let Some(volts) = def.param_f64("voltage") {
                bridge = bridge.with_voltage(volts);
            }
            Ok(Arc::new(bridge))
        });

        registry
    }

    /// Add or replace the factory for `type_name`.
    pub fn register<F>(&mut self, type_name: &str, factory: F)
    where
        F: Fn(&DeviceDefinition) -> Result<Arc<dyn DeviceAdapter>> + Send + Sync + 'static,
    {
        self.factories
            .insert(type_name.to_string(), Box::new(factory));
    }

    /// Build the adapter for one configured device.
    pub fn create(&self, def: &DeviceDefinition) -> Result<Arc<dyn DeviceAdapter>> {
        let factory = self.factories.get(&def.r#type).ok_or_else(|| {
            anyhow!(
                "Unknown adapter type '{}'. Available: {}",
                def.r#type,
                self.list_types().join(", ")
            )
        })?;
        factory(def)
    }

    /// Registered type names, sorted.
    pub fn list_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }

    /// Whether an adapter type is registered.
    pub fn is_available(&self, type_name: &str) -> bool {
        self.factories.contains_key(type_name)
    }
}

fn fault_params(def: &DeviceDefinition) -> Result<(f64, Duration)> {
    let failure_rate = def.param_f64("failure_rate").unwrap_or(0.0);
    if !failure_rate.is_finite() {
        return Err(anyhow!("failure_rate must be a finite number, got {failure_rate}"));
    }
    // Negative means no latency; NaN and infinity are rejected below.
    let latency_ms = match def.param_f64("latency_ms").unwrap_or(0.0) {
        ms if ms < 0.0 => 0.0,
        ms => ms,
    };
    let latency = Duration::try_from_secs_f64(latency_ms / 1000.0)
        .with_context(|| format!("Invalid latency_ms: {latency_ms}"))?;
    Ok((failure_rate, latency))
}

/// Turn every enabled device definition into a registration, in order.
pub fn build_registrations(
    settings: &Settings,
    registry: &AdapterRegistry,
) -> Result<Vec<DeviceRegistration>> {
    settings
        .enabled_devices()
        .into_iter()
        .map(|def| {
            let adapter = registry
                .create(def)
                .with_context(|| format!("Failed to create adapter for device '{}'", def.name))?;
            tracing::debug!(device = %def.name, adapter = %adapter.identify(), "Adapter created");
            Ok(DeviceRegistration::new(
                def.name.clone(),
                adapter,
                def.acquisition_config(),
            ))
        })
        .collect()
}
