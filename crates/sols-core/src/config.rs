//! Sequencer settings.
//!
//! Settings are layered with figment:
//!
//! 1. Base layer: [`Settings::default()`]
//! 2. File layer: a TOML file (optional, skipped when missing)
//! 3. Environment layer: variables prefixed with `SOLS_`, nested fields split
//!    on `__` (e.g. `SOLS_COMPILER__STEP_JITTER_US=50`)
//!
//! Per-device settle times and tolerances are not settings; they belong to
//! the hardware inventory file referenced by `hardware_config`.

use crate::limits;
use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Toml};
use figment::{Figment, Provider};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Plan compiler inputs that do not come from the request or the devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    /// Padding between consecutive camera exposures (us).
    ///
    /// Valid range: 0 - 100_000. Default: 30.
    pub step_jitter_us: u64,

    /// Largest camera buffer one run may fill (bytes).
    ///
    /// Default: 2^31.
    pub max_buffer_bytes: u64,

    /// Scan mirror sweep per micrometre of z range in projection mode
    /// (micro-degrees per um).
    ///
    /// Default: 10_000 (0.01 deg/um).
    pub sweep_udeg_per_um: u64,
}

impl CompilerConfig {
    /// Jitter padding as a duration.
    pub fn step_jitter(&self) -> Duration {
        Duration::from_micros(self.step_jitter_us)
    }

    /// Projection sweep in degrees per micrometre.
    pub fn sweep_deg_per_um(&self) -> f64 {
        self.sweep_udeg_per_um as f64 * 1e-6
    }
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            step_jitter_us: u64::try_from(limits::DEFAULT_STEP_JITTER.as_micros())
                .unwrap_or(30),
            max_buffer_bytes: limits::DEFAULT_MAX_BUFFER_BYTES,
            sweep_udeg_per_um: limits::DEFAULT_SWEEP_UDEG_PER_UM,
        }
    }
}

/// Channel capacities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Device event queue
    pub event_capacity: usize,
    /// Camera frame queue
    pub frame_capacity: usize,
    /// Correlated frame output queue
    pub correlated_capacity: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            event_capacity: limits::EVENT_QUEUE_CAPACITY,
            frame_capacity: limits::FRAME_QUEUE_CAPACITY,
            correlated_capacity: limits::CORRELATED_QUEUE_CAPACITY,
        }
    }
}

/// Top-level settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Default tracing filter when `RUST_LOG` is unset.
    pub log_level: String,

    /// Hardware inventory TOML.
    pub hardware_config: Option<PathBuf>,

    /// Directory run manifests are written to.
    pub manifest_dir: PathBuf,

    /// Plan compiler inputs.
    pub compiler: CompilerConfig,

    /// Channel capacities.
    pub queues: QueueSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            hardware_config: None,
            manifest_dir: PathBuf::from("manifests"),
            compiler: CompilerConfig::default(),
            queues: QueueSettings::default(),
        }
    }
}

impl Provider for Settings {
    fn metadata(&self) -> figment::Metadata {
        figment::Metadata::named("Library Defaults")
    }

    fn data(
        &self,
    ) -> Result<figment::value::Map<figment::Profile, figment::value::Dict>, figment::Error> {
        Serialized::defaults(Settings::default()).data()
    }
}

impl Settings {
    /// Build the layered figment without extracting it.
    pub fn figment(config_path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Settings::default());
        if let Some(path) = config_path {
            if path.exists() {
                figment = figment.merge(Toml::file(path));
            } else {
                tracing::warn!(path = %path.display(), "Config file not found, using defaults");
            }
        }
        figment.merge(Env::prefixed("SOLS_").split("__"))
    }

    /// Load and validate settings.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let settings: Settings = Self::figment(config_path)
            .extract()
            .context("Failed to extract configuration from Figment")?;
        settings
            .validate()
            .context("Configuration validation failed")?;
        Ok(settings)
    }

    /// Reject values outside their documented ranges.
    pub fn validate(&self) -> Result<()> {
        if self.compiler.step_jitter_us > 100_000 {
            anyhow::bail!(
                "compiler.step_jitter_us = {} is out of valid range (0 - 100000)",
                self.compiler.step_jitter_us
            );
        }
        if self.compiler.max_buffer_bytes == 0 {
            anyhow::bail!("compiler.max_buffer_bytes must be positive");
        }
        for (name, value) in [
            ("queues.event_capacity", self.queues.event_capacity),
            ("queues.frame_capacity", self.queues.frame_capacity),
            ("queues.correlated_capacity", self.queues.correlated_capacity),
        ] {
            if value == 0 {
                anyhow::bail!("{} must be positive", name);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert_eq!(settings.compiler.step_jitter(), Duration::from_micros(30));
        assert_eq!(settings.compiler.max_buffer_bytes, 1 << 31);
    }

    #[test]
    fn file_layer_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "log_level = \"debug\"\n[compiler]\nstep_jitter_us = 50\n[queues]\nframe_capacity = 8"
        )
        .unwrap();

        let settings: Settings = Settings::figment(Some(file.path())).extract().unwrap();
        assert_eq!(settings.log_level, "debug");
        assert_eq!(settings.compiler.step_jitter_us, 50);
        assert_eq!(settings.compiler.max_buffer_bytes, 1 << 31);
        assert_eq!(settings.queues.frame_capacity, 8);
        assert_eq!(settings.queues.event_capacity, limits::EVENT_QUEUE_CAPACITY);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let settings: Settings = Settings::figment(Some(Path::new("/nonexistent/sols.toml")))
            .extract()
            .unwrap();
        assert_eq!(settings.manifest_dir, PathBuf::from("manifests"));
    }

    #[test]
    fn validation_rejects_zero_capacity() {
        let mut settings = Settings::default();
        settings.queues.event_capacity = 0;
        assert!(settings.validate().is_err());
    }
}
