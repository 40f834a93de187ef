//! Simulated Device Adapters
//!
//! Stand-ins for real instruments, for demos and tests. None of them talks
//! to hardware; readings are generated on each poll.
//!
//! # Available Mocks
//!
//! - `ConstantAdapter` - the same value on every declared channel
//! - `SimulatedTemperatureController` - ITC-style controller (`TSorp`, `THe3`, `T1K`)
//! - `SimulatedCapacitanceBridge` - AH-style bridge (`capacitance`, `loss`, `voltage`)
//!
//! The two simulated instruments can inject communication failures at a
//! configurable rate and add a per-poll latency, which exercises the
//! recoverable error path of the acquisition worker.

use crate::core::{DeviceAdapter, Sample};
use crate::error::DeviceError;
use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::time::Duration;

/// Channels reported by [`SimulatedTemperatureController`], in Kelvin.
pub const TEMPERATURE_CHANNELS: [&str; 3] = ["TSorp", "THe3", "T1K"];

/// Channels reported by [`SimulatedCapacitanceBridge`].
pub const BRIDGE_CHANNELS: [&str; 3] = ["capacitance", "loss", "voltage"];

fn check_channels(adapter: &str, declared: &[String], known: &[&str]) -> Result<()> {
    if declared.is_empty() {
        bail!("{adapter}: no channels declared");
    }
    for channel in declared {
        if !known.contains(&channel.as_str()) {
            bail!(
                "{adapter}: unknown channel '{channel}', expected one of {}",
                known.join(", ")
            );
        }
    }
    Ok(())
}

/// Shared knobs of the simulated instruments.
#[derive(Debug, Clone, Copy, Default)]
struct Faults {
    failure_rate: f64,
    latency: Duration,
}

impl Faults {
    async fn apply(&self) -> Result<(), DeviceError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.failure_rate > 0.0 && rand::thread_rng().gen_bool(self.failure_rate) {
            return Err(DeviceError::Communication("no reply from instrument".into()));
        }
        Ok(())
    }
}

// =============================================================================
// ConstantAdapter
// =============================================================================

/// Reports `value` on every channel, every poll.
///
/// # Example
///
/// ```rust
/// use daq_buffer::core::DeviceAdapter;
/// use daq_buffer::hardware::mock::ConstantAdapter;
///
/// # #[tokio::main]
/// # async fn main() {
/// let adapter = ConstantAdapter::new(["value"], 42.0);
/// let sample = adapter.poll().await.unwrap();
/// assert_eq!(sample.value("value"), Some(42.0));
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ConstantAdapter {
    channels: Vec<String>,
    value: f64,
}

impl ConstantAdapter {
    /// Adapter reporting `value` on every channel.
    pub fn new<I, S>(channels: I, value: f64) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            channels: channels.into_iter().map(Into::into).collect(),
            value,
        }
    }
}

#[async_trait]
impl DeviceAdapter for ConstantAdapter {
    fn identify(&self) -> String {
        format!("constant({})", self.value)
    }

    async fn poll(&self) -> Result<Sample, DeviceError> {
        Ok(Sample::now(
            self.channels.iter().map(|name| (name.clone(), self.value)),
        ))
    }
}

// =============================================================================
// SimulatedTemperatureController
// =============================================================================

/// Fridge temperature controller.
///
/// Each sensor relaxes from 4.2 K towards its set point with a little
/// uniform noise on top:
/// - `TSorp`: sorption pump, 10 K
/// - `THe3`: He-3 pot, 0.3 K
/// - `T1K`: 1 K pot, 1.5 K
pub struct SimulatedTemperatureController {
    channels: Vec<String>,
    temperatures: Mutex<[f64; 3]>,
    faults: Faults,
}

impl SimulatedTemperatureController {
    const SET_POINTS: [f64; 3] = [10.0, 0.3, 1.5];
    const START: f64 = 4.2;
    const RELAXATION: f64 = 0.05;
    const NOISE: f64 = 0.002;

    /// Controller reporting the given subset of [`TEMPERATURE_CHANNELS`].
    pub fn new(channels: Vec<String>) -> Result<Self> {
        check_channels("temperature_controller", &channels, &TEMPERATURE_CHANNELS)?;
        Ok(Self {
            channels,
            temperatures: Mutex::new([Self::START; 3]),
            faults: Faults::default(),
        })
    }

    /// Fail this fraction of polls with a communication error.
    pub fn with_failure_rate(mut self, rate: f64) -> Self {
        self.faults.failure_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Delay every poll by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.faults.latency = latency;
        self
    }

    fn step(&self) -> [f64; 3] {
        let mut rng = rand::thread_rng();
        let mut temperatures = self.temperatures.lock();
        for (t, target) in temperatures.iter_mut().zip(Self::SET_POINTS) {
            *t += (target - *t) * Self::RELAXATION + rng.gen_range(-Self::NOISE..=Self::NOISE);
        }
        *temperatures
    }
}

#[async_trait]
impl DeviceAdapter for SimulatedTemperatureController {
    fn identify(&self) -> String {
        "simulated ITC temperature controller".to_string()
    }

    async fn poll(&self) -> Result<Sample, DeviceError> {
        self.faults.apply().await?;
        let temperatures = self.step();
        Ok(Sample::now(self.channels.iter().filter_map(|name| {
            TEMPERATURE_CHANNELS
                .iter()
                .position(|known| *known == name.as_str())
                .map(|i| (name.clone(), temperatures[i]))
        })))
    }
}

// =============================================================================
// SimulatedCapacitanceBridge
// =============================================================================

/// Capacitance bridge.
///
/// Reports `capacitance` in pF around `base_capacitance`, `loss` in nS and
/// the excitation `voltage` in V.
pub struct SimulatedCapacitanceBridge {
    channels: Vec<String>,
    base_capacitance: f64,
    voltage: f64,
    faults: Faults,
}

impl SimulatedCapacitanceBridge {
    /// Bridge reporting the given subset of `capacitance`, `loss` and `voltage`.
    pub fn new(channels: Vec<String>) -> Result<Self> {
        check_channels("capacitance_bridge", &channels, &BRIDGE_CHANNELS)?;
        Ok(Self {
            channels,
            base_capacitance: 12.5,
            voltage: 15.0,
            faults: Faults::default(),
        })
    }

    /// Capacitance the readings scatter around, in pF.
    pub fn with_base_capacitance(mut self, picofarads: f64) -> Self {
        self.base_capacitance = picofarads;
        self
    }

    /// Excitation voltage, in V.
    pub fn with_voltage(mut self, volts: f64) -> Self {
        self.voltage = volts;
        self
    }

    /// Fraction of polls that fail with a communication error.
    pub fn with_failure_rate(mut self, rate: f64) -> Self {
        self.faults.failure_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Delay every poll by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.faults.latency = latency;
        self
    }
}

#[async_trait]
impl DeviceAdapter for SimulatedCapacitanceBridge {
    fn identify(&self) -> String {
        "simulated AH capacitance bridge".to_string()
    }

    async fn poll(&self) -> Result<Sample, DeviceError> {
        self.faults.apply().await?;
        let (capacitance, loss) = {
            let mut rng = rand::thread_rng();
            (
                self.base_capacitance + rng.gen_range(-1e-4..=1e-4),
                0.02 + rng.gen_range(0.0..=1e-3),
            )
        };
        Ok(Sample::now(self.channels.iter().map(|name| {
            let value = match name.as_str() {
                "capacitance" => capacitance,
                "loss" => loss,
                _ => self.voltage,
            };
            (name.clone(), value)
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(channels: &[&str]) -> Vec<String> {
        channels.iter().map(|c| c.to_string()).collect()
    }

    #[tokio::test]
    async fn constant_adapter_reports_every_channel() {
        let adapter = ConstantAdapter::new(["a", "b"], 1.5);
        let sample = adapter.poll().await.unwrap();
        assert_eq!(sample.channels, vec![("a".into(), 1.5), ("b".into(), 1.5)]);
    }

    #[tokio::test]
    async fn temperature_controller_relaxes_towards_set_points() {
        let itc = SimulatedTemperatureController::new(names(&TEMPERATURE_CHANNELS)).unwrap();
        let mut last = None;
        for _ in 0..200 {
            last = Some(itc.poll().await.unwrap());
        }
        let sample = last.unwrap();
        assert!((sample.value("TSorp").unwrap() - 10.0).abs() < 0.1);
        assert!((sample.value("THe3").unwrap() - 0.3).abs() < 0.1);
        assert!((sample.value("T1K").unwrap() - 1.5).abs() < 0.1);
    }

    #[tokio::test]
    async fn temperature_controller_reports_declared_subset() {
        let itc = SimulatedTemperatureController::new(names(&["THe3"])).unwrap();
        let sample = itc.poll().await.unwrap();
        assert_eq!(sample.channels.len(), 1);
        assert!(sample.value("THe3").is_some());
    }

    #[test]
    fn unknown_channels_are_rejected() {
        assert!(SimulatedTemperatureController::new(names(&["T4K"])).is_err());
        assert!(SimulatedCapacitanceBridge::new(names(&[])).is_err());
    }

    #[tokio::test]
    async fn bridge_reports_units() {
        let bridge = SimulatedCapacitanceBridge::new(names(&BRIDGE_CHANNELS))
            .unwrap()
            .with_voltage(7.5);
        let sample = bridge.poll().await.unwrap();
        assert!((sample.value("capacitance").unwrap() - 12.5).abs() < 1e-3);
        assert!(sample.value("loss").unwrap() >= 0.02);
        assert_eq!(sample.value("voltage"), Some(7.5));
    }

    #[tokio::test]
    async fn failure_rate_one_always_fails() {
        let bridge = SimulatedCapacitanceBridge::new(names(&["loss"]))
            .unwrap()
            .with_failure_rate(1.0);
        assert!(matches!(
            bridge.poll().await,
            Err(DeviceError::Communication(_))
        ));
    }
}
