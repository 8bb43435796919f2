//! Hardware inventory loading.
//!
//! The inventory lists every device of the instrument with the driver that
//! builds it, its settle time and timing tolerance, and a driver-specific
//! `params` table:
//!
//! ```toml
//! name = "SOLS bench 2"
//!
//! [[devices]]
//! id = "piezo"
//! driver = "mock_axis"
//! settle_us = 2000
//! tolerance_us = 1000
//! [devices.params]
//! role = "fast_focus"
//! min = 0.0
//! max = 800.0
//! ```
//!
//! Files are read through figment so inventory entries can be overridden from
//! the environment (`SOLS_HW_` prefix) the same way sequencer settings are.

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use sols_core::device::DeviceId;
use sols_core::driver::DeviceSpec;
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Inventory of the simulated instrument shipped with this crate.
pub const SOLS_MOCK_INVENTORY: &str = include_str!("../config/sols_mock.toml");

/// Error types for inventory loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    /// File not found
    #[error("Hardware config file not found: {0}")]
    NotFound(String),

    /// Parse error (invalid TOML or wrong shape)
    #[error("Failed to parse hardware config: {0}")]
    ParseError(String),

    /// Validation error
    #[error("Hardware config validation failed: {0}")]
    ValidationError(String),
}

/// One device entry of the inventory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique identifier (e.g. "piezo", "laser_488")
    pub id: DeviceId,
    /// Driver type resolved through the factory table (e.g. "mock_axis")
    pub driver: String,
    /// Minimum settle time after a command (us)
    #[serde(default)]
    pub settle_us: u64,
    /// Allowed completion lateness (us)
    #[serde(default)]
    pub tolerance_us: u64,
    /// Driver-specific parameters
    #[serde(default = "empty_table")]
    pub params: toml::Value,
}

fn empty_table() -> toml::Value {
    toml::Value::Table(toml::map::Map::new())
}

impl DeviceConfig {
    /// Per-device values handed to the driver factory.
    pub fn spec(&self) -> DeviceSpec {
        DeviceSpec {
            id: self.id.clone(),
            settle: Duration::from_micros(self.settle_us),
            tolerance: Duration::from_micros(self.tolerance_us),
            params: self.params.clone(),
        }
    }
}

/// Hardware inventory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareConfig {
    /// Instrument name for logs and manifests
    #[serde(default)]
    pub name: Option<String>,
    /// Devices to register
    pub devices: Vec<DeviceConfig>,
}

impl HardwareConfig {
    /// Load and validate an inventory file.
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ConfigLoadError::NotFound(path.display().to_string()).into());
        }
        debug!("Loading hardware config from: {}", path.display());

        let config: HardwareConfig = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("SOLS_HW_").split("__"))
            .extract()
            .map_err(|e| ConfigLoadError::ParseError(e.to_string()))
            .with_context(|| format!("Failed to load {}", path.display()))?;

        config.validate()?;
        info!(
            "Loaded hardware config '{}' with {} devices",
            config.name.as_deref().unwrap_or("unnamed"),
            config.devices.len()
        );
        Ok(config)
    }

    /// Parse and validate an inventory from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: HardwareConfig = toml::from_str(content)
            .map_err(|e| ConfigLoadError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// The simulated SOLS instrument with every device in `mode`
    /// (`instant`, `realistic` or `chaos`).
    pub fn sols_mock(mode: &str) -> Result<Self> {
        let mut config = Self::from_toml_str(SOLS_MOCK_INVENTORY)?;
        for device in &mut config.devices {
            device.set_param("mode", toml::Value::String(mode.to_string()))?;
        }
        Ok(config)
    }

    /// Entry for a device id.
    pub fn device(&self, id: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.id.as_str() == id)
    }

    /// Mutable entry for a device id.
    pub fn device_mut(&mut self, id: &str) -> Option<&mut DeviceConfig> {
        self.devices.iter_mut().find(|d| d.id.as_str() == id)
    }

    /// Reject duplicate ids and empty driver names.
    pub fn validate(&self) -> Result<(), ConfigLoadError> {
        let mut seen = BTreeSet::new();
        let mut errors = Vec::new();
        for device in &self.devices {
            if device.id.as_str().is_empty() {
                errors.push("device with empty id".to_string());
            }
            if device.driver.is_empty() {
                errors.push(format!("'{}': empty driver type", device.id));
            }
            if !device.params.is_table() {
                errors.push(format!("'{}': params must be a table", device.id));
            }
            if !seen.insert(device.id.clone()) {
                errors.push(format!("duplicate device id '{}'", device.id));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigLoadError::ValidationError(errors.join("; ")))
        }
    }
}

impl DeviceConfig {
    /// Set one key of the `params` table.
    pub fn set_param(&mut self, key: &str, value: toml::Value) -> Result<(), ConfigLoadError> {
        match &mut self.params {
            toml::Value::Table(table) => {
                table.insert(key.to_string(), value);
                Ok(())
            }
            _ => Err(ConfigLoadError::ValidationError(format!(
                "'{}': params must be a table",
                self.id
            ))),
        }
    }
}
