//! Configuration loading using Figment.
//!
//! Settings are layered from:
//! 1. a TOML file (`config/buffer.toml` by default)
//! 2. environment variables prefixed with `DAQ_BUFFER_`, nested keys split
//!    on `__` (e.g. `DAQ_BUFFER_STORAGE__MEASUREMENT_NAME=cooldown`)
//!
//! Every section has defaults, so a missing file yields a usable (if
//! device-less) configuration.
//!
//! # Example
//! ```no_run
//! use daq_buffer::config::Settings;
//!
//! let settings = Settings::load_from("config/buffer.toml")?;
//! settings.validate().map_err(|e| anyhow::anyhow!(e))?;
//! println!("Recording into {}", settings.storage.output_dir.display());
//! # Ok::<(), anyhow::Error>(())
//! ```

use crate::buffer::RecordingSettings;
use crate::core::{AcquisitionConfig, TIMESTAMP_COLUMN};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/buffer.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "DAQ_BUFFER_";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Recording settings
    #[serde(default)]
    pub storage: StorageConfig,
    /// Device definitions, in registration order
    #[serde(default)]
    pub devices: Vec<DeviceDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name, used in logs
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Recording configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Folder session files are written to
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Measurement name placed in session file names
    #[serde(default = "default_measurement_name")]
    pub measurement_name: String,
    /// Storage backend (json, hdf5)
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Delay between two snapshot writes
    #[serde(default = "default_record_interval")]
    pub record_interval_ms: u64,
}

/// Device definition in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDefinition {
    /// Unique device name, also the table name in session files
    pub name: String,
    /// Adapter type (e.g., "constant", "temperature_controller")
    pub r#type: String,
    /// Disabled devices are skipped at startup
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Declared channels, in column order
    #[serde(default)]
    pub channels: Vec<String>,
    /// Delay between two polls
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Bound on the sample queue; unbounded when absent
    #[serde(default)]
    pub queue_capacity: Option<usize>,
    /// Adapter-specific parameters (dynamic)
    #[serde(default = "default_params")]
    pub params: toml::Value,
}

// Default value functions
fn default_app_name() -> String {
    "daq-buffer".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_output_dir() -> PathBuf {
    std::env::current_dir()
        .unwrap_or_default()
        .join("temp_data")
}

fn default_measurement_name() -> String {
    "Test_Measurement".to_string()
}

fn default_backend() -> String {
    "json".to_string()
}

fn default_record_interval() -> u64 {
    100
}

fn default_enabled() -> bool {
    true
}

fn default_poll_interval() -> u64 {
    200
}

fn default_params() -> toml::Value {
    toml::Value::Table(toml::map::Map::new())
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            measurement_name: default_measurement_name(),
            backend: default_backend(),
            record_interval_ms: default_record_interval(),
        }
    }
}

impl Settings {
    /// Load from [`DEFAULT_CONFIG_PATH`] and environment variables
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file path and environment variables
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        let valid_backends = ["json", "hdf5"];
        if !valid_backends.contains(&self.storage.backend.as_str()) {
            return Err(format!(
                "Invalid storage backend '{}'. Must be one of: {}",
                self.storage.backend,
                valid_backends.join(", ")
            ));
        }
        if self.storage.record_interval_ms == 0 {
            return Err("record_interval_ms must be greater than zero".to_string());
        }
        if self.storage.measurement_name.trim().is_empty() {
            return Err("measurement_name must not be empty".to_string());
        }

        let mut names = std::collections::HashSet::new();
        for device in &self.devices {
            if !names.insert(&device.name) {
                return Err(format!("Duplicate device name: {}", device.name));
            }
            if device.channels.is_empty() {
                return Err(format!("Device '{}' declares no channels", device.name));
            }
            if device.channels.iter().any(|c| c == TIMESTAMP_COLUMN) {
                return Err(format!(
                    "Device '{}' uses the reserved channel name '{}'",
                    device.name, TIMESTAMP_COLUMN
                ));
            }
            if device.poll_interval_ms == 0 {
                return Err(format!(
                    "Device '{}': poll_interval_ms must be greater than zero",
                    device.name
                ));
            }
        }

        Ok(())
    }

    /// Get all enabled devices
    pub fn enabled_devices(&self) -> Vec<&DeviceDefinition> {
        self.devices.iter().filter(|d| d.enabled).collect()
    }

    /// Recording settings for a [`BufferManager`](crate::buffer::BufferManager).
    pub fn recording_settings(&self) -> RecordingSettings {
        RecordingSettings {
            measurement_name: self.storage.measurement_name.clone(),
            data_folder: self.storage.output_dir.clone(),
            interval: Duration::from_millis(self.storage.record_interval_ms),
            backend: self.storage.backend.clone(),
        }
    }
}

impl DeviceDefinition {
    /// Acquisition settings for this device
    pub fn acquisition_config(&self) -> AcquisitionConfig {
        let config = AcquisitionConfig::new(self.channels.iter().cloned())
            .with_poll_interval(Duration::from_millis(self.poll_interval_ms));
        match self.queue_capacity {
            Some(capacity) => config.with_queue_capacity(capacity),
            None => config,
        }
    }

    /// Look up a numeric parameter.
    pub fn param_f64(&self, key: &str) -> Option<f64> {
        match self.params.get(key)? {
            toml::Value::Float(v) => Some(*v),
            toml::Value::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r#"
[application]
name = "Fridge DAQ"
log_level = "debug"

[storage]
output_dir = "/data/fridge"
measurement_name = "cooldown"

[[devices]]
name = "ITC1"
type = "temperature_controller"
channels = ["TSorp", "THe3", "T1K"]
poll_interval_ms = 100

[[devices]]
name = "AH1"
type = "capacitance_bridge"
channels = ["capacitance", "loss", "voltage"]
enabled = false
queue_capacity = 64
"#;

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    fn device(name: &str, channels: &[&str]) -> DeviceDefinition {
        DeviceDefinition {
            name: name.to_string(),
            r#type: "constant".to_string(),
            enabled: true,
            channels: channels.iter().map(|c| c.to_string()).collect(),
            poll_interval_ms: 200,
            queue_capacity: None,
            params: default_params(),
        }
    }

    #[test]
    #[serial]
    fn test_load_from_file() {
        let file = write_config(SAMPLE);
        let settings = Settings::load_from(file.path()).unwrap();

        assert_eq!(settings.application.name, "Fridge DAQ");
        assert_eq!(settings.storage.output_dir, PathBuf::from("/data/fridge"));
        assert_eq!(settings.storage.backend, "json");
        assert_eq!(settings.storage.record_interval_ms, 100);
        assert_eq!(settings.devices.len(), 2);
        assert_eq!(settings.devices[1].queue_capacity, Some(64));
        assert!(settings.validate().is_ok());

        let enabled = settings.enabled_devices();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].name, "ITC1");
        let acq = enabled[0].acquisition_config();
        assert_eq!(acq.poll_interval, Duration::from_millis(100));
        assert_eq!(acq.channels, vec!["TSorp", "THe3", "T1K"]);
    }

    #[test]
    #[serial]
    fn test_missing_file_uses_defaults() {
        let settings = Settings::load_from("does/not/exist.toml").unwrap();
        assert_eq!(settings.storage.measurement_name, "Test_Measurement");
        assert!(settings.storage.output_dir.ends_with("temp_data"));
        assert!(settings.devices.is_empty());
        assert!(settings.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        let file = write_config(SAMPLE);
        std::env::set_var("DAQ_BUFFER_STORAGE__MEASUREMENT_NAME", "warmup");
        let result = Settings::load_from(file.path());
        std::env::remove_var("DAQ_BUFFER_STORAGE__MEASUREMENT_NAME");

        assert_eq!(result.unwrap().storage.measurement_name, "warmup");
    }

    #[test]
    fn test_invalid_log_level() {
        let mut settings = Settings::default();
        settings.application.log_level = "verbose".to_string();
        assert!(settings.validate().unwrap_err().contains("log_level"));
    }

    #[test]
    fn test_invalid_backend_and_interval() {
        let mut settings = Settings::default();
        settings.storage.backend = "parquet".to_string();
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.storage.record_interval_ms = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_device_validation() {
        let mut settings = Settings::default();
        settings.devices = vec![device("D1", &["value"]), device("D1", &["value"])];
        assert!(settings.validate().unwrap_err().contains("Duplicate"));

        settings.devices = vec![device("D1", &[])];
        assert!(settings.validate().is_err());

        settings.devices = vec![device("D1", &["timestamp"])];
        assert!(settings.validate().is_err());

        let mut slow = device("D1", &["value"]);
        slow.poll_interval_ms = 0;
        settings.devices = vec![slow];
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_param_lookup() {
        let mut def = device("D1", &["value"]);
        def.params = toml::Value::Table("value = 42.0\noffset = 3".parse().unwrap());
        assert_eq!(def.param_f64("value"), Some(42.0));
        assert_eq!(def.param_f64("offset"), Some(3.0));
        assert_eq!(def.param_f64("missing"), None);
    }

    #[test]
    fn test_recording_settings() {
        let settings = Settings::default();
        let recording = settings.recording_settings();
        assert_eq!(recording.interval, Duration::from_millis(100));
        assert_eq!(recording.backend, "json");
        assert_eq!(recording.measurement_name, "Test_Measurement");
    }
}
