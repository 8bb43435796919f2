//! Mock light-sheet scan mirror pair.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::Deserialize;
use sols_core::capabilities::{Device, DeviceHandle, ScanMirror};
use sols_core::device::{Capability, DeviceDescriptor, DeviceKind, MirrorAngles, TravelRange};
use sols_core::driver::{BuildContext, DeviceComponents, DeviceSpec, DriverFactory};
use std::sync::Arc;
use std::time::Duration;

use crate::common::{Actuation, CommonParams, ErrorConfig, MockMode, TimingConfig};

// =============================================================================
// MockGalvoFactory - DriverFactory implementation
// =============================================================================

/// Configuration for MockGalvo driver
#[derive(Debug, Clone, Deserialize)]
pub struct MockGalvoConfig {
    /// Mechanical half-range of both mirrors in degrees
    #[serde(default = "default_max_angle")]
    pub max_angle_deg: f64,
    /// Whether the mirrors can sweep during an exposure
    #[serde(default = "default_continuous_scan")]
    pub continuous_scan: bool,
    /// Mode, latency and faults
    #[serde(flatten)]
    pub common: CommonParams,
}

fn default_max_angle() -> f64 {
    10.0
}

fn default_continuous_scan() -> bool {
    true
}

/// Factory for creating MockGalvo instances.
pub struct MockGalvoFactory;

static MOCK_GALVO_KINDS: &[DeviceKind] = &[DeviceKind::ScanMirror];
static MOCK_GALVO_CAPABILITIES: &[Capability] = &[Capability::Movable, Capability::ContinuousScan];

impl DriverFactory for MockGalvoFactory {
    fn driver_type(&self) -> &'static str {
        "mock_galvo"
    }

    fn name(&self) -> &'static str {
        "Mock Scan Mirror Pair"
    }

    fn kinds(&self) -> &'static [DeviceKind] {
        MOCK_GALVO_KINDS
    }

    fn capabilities(&self) -> &'static [Capability] {
        MOCK_GALVO_CAPABILITIES
    }

    fn validate(&self, params: &toml::Value) -> Result<()> {
        let cfg: MockGalvoConfig = params.clone().try_into()?;
        if !(cfg.max_angle_deg > 0.0 && cfg.max_angle_deg <= 45.0) {
            return Err(anyhow!(
                "max_angle_deg {} out of range (0, 45]",
                cfg.max_angle_deg
            ));
        }
        Ok(())
    }

    fn build(&self, spec: DeviceSpec, _ctx: BuildContext) -> BoxFuture<'static, Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg: MockGalvoConfig = spec.params.clone().try_into()?;
            let limit = cfg.max_angle_deg;
            let galvo = MockGalvo::new(
                TravelRange::new(-limit, limit),
                cfg.continuous_scan,
                cfg.common.actuation("mock_galvo", spec.settle),
            );

            let mut descriptor = DeviceDescriptor::new(spec.id, DeviceKind::ScanMirror)
                .with_capability(Capability::Movable)
                .with_settle(spec.settle)
                .with_tolerance(spec.tolerance)
                .with_travel(-limit, limit)
                .with_secondary_travel(-limit, limit);
            if cfg.continuous_scan {
                descriptor = descriptor.with_capability(Capability::ContinuousScan);
            }

            Ok(DeviceComponents {
                descriptor,
                handle: DeviceHandle::Mirror(Arc::new(galvo)),
            })
        })
    }
}

// =============================================================================
// MockGalvo
// =============================================================================

/// Mock scan/tilt mirror pair sharing one driver card.
pub struct MockGalvo {
    angles: RwLock<MirrorAngles>,
    travel: TravelRange,
    continuous_scan: bool,
    actuation: Actuation,
}

impl MockGalvo {
    /// Create a mirror pair at zero angles.
    pub fn new(travel: TravelRange, continuous_scan: bool, actuation: Actuation) -> Self {
        Self {
            angles: RwLock::new(MirrorAngles::default()),
            travel,
            continuous_scan,
            actuation,
        }
    }

    /// Instant-mode mirrors with +/-10 degree travel and sweep support.
    pub fn instant() -> Self {
        Self::new(
            TravelRange::new(-10.0, 10.0),
            true,
            Actuation::new(
                "mock_galvo",
                MockMode::Instant,
                TimingConfig::galvo(),
                ErrorConfig::none(),
            ),
        )
    }
}

#[async_trait]
impl Device for MockGalvo {
    async fn reset_fault(&self) -> Result<()> {
        self.actuation.reset();
        Ok(())
    }
}

#[async_trait]
impl ScanMirror for MockGalvo {
    async fn set_angles(&self, angles: MirrorAngles) -> Result<()> {
        for (name, value) in [("scan", angles.scan_deg), ("tilt", angles.tilt_deg)] {
            if !self.travel.contains(value) {
                return Err(anyhow!(
                    "{} angle {:.3} deg outside [{}, {}]",
                    name,
                    value,
                    self.travel.min,
                    self.travel.max
                ));
            }
        }
        if angles.sweep_deg != 0.0 && !self.continuous_scan {
            return Err(anyhow!("Mirror driver cannot sweep during exposure"));
        }
        let half_sweep = angles.sweep_deg.abs() / 2.0;
        if !self.travel.contains(angles.scan_deg + half_sweep)
            || !self.travel.contains(angles.scan_deg - half_sweep)
        {
            return Err(anyhow!(
                "Sweep of {:.3} deg around {:.3} leaves travel",
                angles.sweep_deg,
                angles.scan_deg
            ));
        }

        tracing::debug!(
            "MockGalvo: scan={:.3} tilt={:.3} sweep={:.3}",
            angles.scan_deg,
            angles.tilt_deg,
            angles.sweep_deg
        );
        self.actuation.perform("set_mirrors", Duration::ZERO).await?;
        *self.angles.write() = angles;
        Ok(())
    }

    async fn angles(&self) -> Result<MirrorAngles> {
        Ok(*self.angles.read())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_angles() {
        let galvo = MockGalvo::instant();
        let target = MirrorAngles {
            scan_deg: 1.5,
            tilt_deg: -2.0,
            sweep_deg: 0.0,
        };
        galvo.set_angles(target).await.unwrap();
        assert_eq!(galvo.angles().await.unwrap(), target);
    }

    #[tokio::test]
    async fn test_out_of_travel_rejected() {
        let galvo = MockGalvo::instant();
        let target = MirrorAngles {
            scan_deg: 0.0,
            tilt_deg: 12.0,
            sweep_deg: 0.0,
        };
        assert!(galvo.set_angles(target).await.is_err());
    }

    #[tokio::test]
    async fn test_sweep_requires_continuous_scan() {
        let galvo = MockGalvo::new(
            TravelRange::new(-10.0, 10.0),
            false,
            Actuation::new(
                "mock_galvo",
                MockMode::Instant,
                TimingConfig::galvo(),
                ErrorConfig::none(),
            ),
        );
        let target = MirrorAngles {
            scan_deg: 0.0,
            tilt_deg: 0.0,
            sweep_deg: 2.0,
        };
        assert!(galvo.set_angles(target).await.is_err());
        assert!(MockGalvo::instant().set_angles(target).await.is_ok());
    }

    #[test]
    fn test_factory_validate() {
        let ok: toml::Value = toml::from_str("max_angle_deg = 12.5").unwrap();
        MockGalvoFactory.validate(&ok).unwrap();
        let bad: toml::Value = toml::from_str("max_angle_deg = -1.0").unwrap();
        assert!(MockGalvoFactory.validate(&bad).is_err());
    }
}
