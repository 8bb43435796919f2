//! Mock XY sample stage.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::Deserialize;
use sols_core::capabilities::{Device, DeviceHandle, PlanarPositioner};
use sols_core::device::{Capability, DeviceDescriptor, DeviceKind, TravelRange};
use sols_core::driver::{BuildContext, DeviceComponents, DeviceSpec, DriverFactory};
use std::sync::Arc;
use std::time::Duration;

use crate::common::{Actuation, CommonParams, ErrorConfig, MockMode, TimingConfig};

// =============================================================================
// MockXyStageFactory - DriverFactory implementation
// =============================================================================

/// Configuration for MockXyStage driver
#[derive(Debug, Clone, Deserialize)]
pub struct MockXyStageConfig {
    /// X travel (mm)
    #[serde(default = "default_x_range")]
    pub x_range: [f64; 2],
    /// Y travel (mm)
    #[serde(default = "default_y_range")]
    pub y_range: [f64; 2],
    /// Mode, latency and faults
    #[serde(flatten)]
    pub common: CommonParams,
}

fn default_x_range() -> [f64; 2] {
    [-60.0, 60.0]
}

fn default_y_range() -> [f64; 2] {
    [-40.0, 40.0]
}

/// Factory for creating MockXyStage instances.
pub struct MockXyStageFactory;

static MOCK_XY_KINDS: &[DeviceKind] = &[DeviceKind::XyStage];
static MOCK_XY_CAPABILITIES: &[Capability] = &[Capability::Movable];

impl DriverFactory for MockXyStageFactory {
    fn driver_type(&self) -> &'static str {
        "mock_xy_stage"
    }

    fn name(&self) -> &'static str {
        "Mock XY Stage"
    }

    fn kinds(&self) -> &'static [DeviceKind] {
        MOCK_XY_KINDS
    }

    fn capabilities(&self) -> &'static [Capability] {
        MOCK_XY_CAPABILITIES
    }

    fn validate(&self, params: &toml::Value) -> Result<()> {
        let cfg: MockXyStageConfig = params.clone().try_into()?;
        for (axis, [lo, hi]) in [("x", cfg.x_range), ("y", cfg.y_range)] {
            if lo >= hi {
                return Err(anyhow!("Invalid {} range [{}, {}]", axis, lo, hi));
            }
        }
        Ok(())
    }

    fn build(&self, spec: DeviceSpec, _ctx: BuildContext) -> BoxFuture<'static, Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg: MockXyStageConfig = spec.params.clone().try_into()?;
            let [x_min, x_max] = cfg.x_range;
            let [y_min, y_max] = cfg.y_range;
            let stage = MockXyStage::new(
                TravelRange::new(x_min, x_max),
                TravelRange::new(y_min, y_max),
                cfg.common.actuation("mock_xy_stage", spec.settle),
            );

            let descriptor = DeviceDescriptor::new(spec.id, DeviceKind::XyStage)
                .with_capability(Capability::Movable)
                .with_settle(spec.settle)
                .with_tolerance(spec.tolerance)
                .with_travel(x_min, x_max)
                .with_secondary_travel(y_min, y_max);

            Ok(DeviceComponents {
                descriptor,
                handle: DeviceHandle::Planar(Arc::new(stage)),
            })
        })
    }
}

// =============================================================================
// MockXyStage
// =============================================================================

/// Mock two-axis stage in millimetres. Targets outside travel are refused.
pub struct MockXyStage {
    position: RwLock<(f64, f64)>,
    x_travel: TravelRange,
    y_travel: TravelRange,
    actuation: Actuation,
}

impl MockXyStage {
    /// Create a stage at the origin.
    pub fn new(x_travel: TravelRange, y_travel: TravelRange, actuation: Actuation) -> Self {
        Self {
            position: RwLock::new((0.0, 0.0)),
            x_travel,
            y_travel,
            actuation,
        }
    }

    /// Instant-mode stage with the default SOLS travel.
    pub fn instant() -> Self {
        let [x_min, x_max] = default_x_range();
        let [y_min, y_max] = default_y_range();
        Self::new(
            TravelRange::new(x_min, x_max),
            TravelRange::new(y_min, y_max),
            Actuation::new(
                "mock_xy_stage",
                MockMode::Instant,
                TimingConfig::xy_stage(),
                ErrorConfig::none(),
            ),
        )
    }
}

#[async_trait]
impl Device for MockXyStage {
    async fn reset_fault(&self) -> Result<()> {
        self.actuation.reset();
        Ok(())
    }
}

#[async_trait]
impl PlanarPositioner for MockXyStage {
    async fn move_xy(&self, x_mm: f64, y_mm: f64) -> Result<()> {
        if !self.x_travel.contains(x_mm) || !self.y_travel.contains(y_mm) {
            return Err(anyhow!(
                "XY target ({:.3}, {:.3}) outside travel x[{}, {}] y[{}, {}]",
                x_mm,
                y_mm,
                self.x_travel.min,
                self.x_travel.max,
                self.y_travel.min,
                self.y_travel.max
            ));
        }
        tracing::debug!("MockXyStage: Moving to ({:.3}, {:.3}) mm", x_mm, y_mm);
        self.actuation.perform("move_xy", Duration::ZERO).await?;
        *self.position.write() = (x_mm, y_mm);
        Ok(())
    }

    async fn position_xy(&self) -> Result<(f64, f64)> {
        Ok(*self.position.read())
    }
}
