//! Mock excitation laser (one line per device).

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::Deserialize;
use sols_core::capabilities::{Device, DeviceHandle, Illumination};
use sols_core::device::{Capability, DeviceDescriptor, DeviceKind, LaserState};
use sols_core::driver::{BuildContext, DeviceComponents, DeviceSpec, DriverFactory};
use std::sync::Arc;
use std::time::Duration;

use crate::common::{Actuation, CommonParams, ErrorConfig, MockMode, TimingConfig};

// =============================================================================
// MockLaserFactory - DriverFactory implementation
// =============================================================================

/// Configuration for MockLaser driver
#[derive(Debug, Clone, Deserialize)]
pub struct MockLaserConfig {
    /// Laser line (nm)
    pub wavelength_nm: u32,
    /// Maximum accepted power (percent)
    #[serde(default = "default_max_power")]
    pub max_power_pct: f64,
    /// Mode, latency and faults
    #[serde(flatten)]
    pub common: CommonParams,
}

fn default_max_power() -> f64 {
    100.0
}

/// Factory for creating MockLaser instances.
pub struct MockLaserFactory;

static MOCK_LASER_KINDS: &[DeviceKind] = &[DeviceKind::Laser];
static MOCK_LASER_CAPABILITIES: &[Capability] = &[Capability::Illumination];

impl DriverFactory for MockLaserFactory {
    fn driver_type(&self) -> &'static str {
        "mock_laser"
    }

    fn name(&self) -> &'static str {
        "Mock Excitation Laser"
    }

    fn kinds(&self) -> &'static [DeviceKind] {
        MOCK_LASER_KINDS
    }

    fn capabilities(&self) -> &'static [Capability] {
        MOCK_LASER_CAPABILITIES
    }

    fn validate(&self, params: &toml::Value) -> Result<()> {
        let cfg: MockLaserConfig = params.clone().try_into()?;
        if !(300..=1100).contains(&cfg.wavelength_nm) {
            return Err(anyhow!("Wavelength {} nm not plausible", cfg.wavelength_nm));
        }
        if !(cfg.max_power_pct > 0.0 && cfg.max_power_pct <= 100.0) {
            return Err(anyhow!(
                "max_power_pct {} out of range (0, 100]",
                cfg.max_power_pct
            ));
        }
        Ok(())
    }

    fn build(&self, spec: DeviceSpec, _ctx: BuildContext) -> BoxFuture<'static, Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg: MockLaserConfig = spec.params.clone().try_into()?;
            let laser = MockLaser::new(
                cfg.wavelength_nm,
                cfg.max_power_pct,
                cfg.common.actuation("mock_laser", spec.settle),
            );

            let descriptor = DeviceDescriptor::new(spec.id, DeviceKind::Laser)
                .with_capability(Capability::Illumination)
                .with_settle(spec.settle)
                .with_tolerance(spec.tolerance)
                .with_laser_line(cfg.wavelength_nm, cfg.max_power_pct);

            Ok(DeviceComponents {
                descriptor,
                handle: DeviceHandle::Laser(Arc::new(laser)),
            })
        })
    }
}

// =============================================================================
// MockLaser
// =============================================================================

/// Mock laser line. Starts switched off.
pub struct MockLaser {
    wavelength_nm: u32,
    max_power_pct: f64,
    state: RwLock<LaserState>,
    actuation: Actuation,
}

impl MockLaser {
    /// Create a laser line.
    pub fn new(wavelength_nm: u32, max_power_pct: f64, actuation: Actuation) -> Self {
        Self {
            wavelength_nm,
            max_power_pct,
            state: RwLock::new(LaserState::OFF),
            actuation,
        }
    }

    /// Instant-mode laser at full power range.
    pub fn instant(wavelength_nm: u32) -> Self {
        Self::new(
            wavelength_nm,
            100.0,
            Actuation::new(
                "mock_laser",
                MockMode::Instant,
                TimingConfig::laser(),
                ErrorConfig::none(),
            ),
        )
    }

    /// Laser line in nm.
    pub fn wavelength_nm(&self) -> u32 {
        self.wavelength_nm
    }
}

#[async_trait]
impl Device for MockLaser {
    async fn reset_fault(&self) -> Result<()> {
        self.actuation.reset();
        Ok(())
    }
}

#[async_trait]
impl Illumination for MockLaser {
    async fn apply(&self, state: LaserState) -> Result<()> {
        if !(0.0..=self.max_power_pct).contains(&state.power_pct) {
            return Err(anyhow!(
                "Power {:.1}% outside 0..={:.1}% for {} nm",
                state.power_pct,
                self.max_power_pct,
                self.wavelength_nm
            ));
        }
        tracing::debug!(
            "MockLaser {}nm: enabled={} power={:.1}%",
            self.wavelength_nm,
            state.enabled,
            state.power_pct
        );
        self.actuation.perform("set_laser", Duration::ZERO).await?;
        *self.state.write() = state;
        Ok(())
    }

    async fn state(&self) -> Result<LaserState> {
        Ok(*self.state.read())
    }
}
