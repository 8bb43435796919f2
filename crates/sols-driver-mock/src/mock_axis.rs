//! Mock single-axis positioner (fast focus piezo, coarse focus stage).

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::Deserialize;
use sols_core::capabilities::{Device, DeviceHandle, Positioner};
use sols_core::device::{Capability, DeviceDescriptor, DeviceKind};
use sols_core::driver::{BuildContext, DeviceComponents, DeviceSpec, DriverFactory};
use std::sync::Arc;
use std::time::Duration;

use crate::common::{Actuation, CommonParams, ErrorConfig, MockMode, TimingConfig};

// =============================================================================
// MockAxisFactory - DriverFactory implementation
// =============================================================================

/// Role of the axis on the instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AxisRole {
    /// Fast focus piezo (um)
    #[default]
    FastFocus,
    /// Coarse focus stage (mm)
    CoarseStage,
}

impl AxisRole {
    fn kind(self) -> DeviceKind {
        match self {
            AxisRole::FastFocus => DeviceKind::FastFocus,
            AxisRole::CoarseStage => DeviceKind::CoarseStage,
        }
    }
}

/// Configuration for MockAxis driver
#[derive(Debug, Clone, Deserialize)]
pub struct MockAxisConfig {
    /// Axis role
    #[serde(default)]
    pub role: AxisRole,
    /// Lower travel limit
    pub min: f64,
    /// Upper travel limit
    pub max: f64,
    /// Initial position
    #[serde(default)]
    pub initial_position: f64,
    /// Mode, latency and faults
    #[serde(flatten)]
    pub common: CommonParams,
}

/// Factory for creating MockAxis instances.
pub struct MockAxisFactory;

static MOCK_AXIS_KINDS: &[DeviceKind] = &[DeviceKind::FastFocus, DeviceKind::CoarseStage];
static MOCK_AXIS_CAPABILITIES: &[Capability] = &[Capability::Movable];

impl DriverFactory for MockAxisFactory {
    fn driver_type(&self) -> &'static str {
        "mock_axis"
    }

    fn name(&self) -> &'static str {
        "Mock Focus Axis"
    }

    fn kinds(&self) -> &'static [DeviceKind] {
        MOCK_AXIS_KINDS
    }

    fn capabilities(&self) -> &'static [Capability] {
        MOCK_AXIS_CAPABILITIES
    }

    fn validate(&self, params: &toml::Value) -> Result<()> {
        let cfg: MockAxisConfig = params.clone().try_into()?;
        if !(cfg.min.is_finite() && cfg.max.is_finite()) || cfg.min >= cfg.max {
            return Err(anyhow!("Invalid travel range [{}, {}]", cfg.min, cfg.max));
        }
        if cfg.initial_position < cfg.min || cfg.initial_position > cfg.max {
            return Err(anyhow!(
                "Initial position {} outside [{}, {}]",
                cfg.initial_position,
                cfg.min,
                cfg.max
            ));
        }
        Ok(())
    }

    fn build(&self, spec: DeviceSpec, _ctx: BuildContext) -> BoxFuture<'static, Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg: MockAxisConfig = spec.params.clone().try_into()?;
            let axis = MockAxis::builder()
                .limits(AxisLimits::hard_stop(cfg.min, cfg.max))
                .initial_position(cfg.initial_position)
                .actuation(cfg.common.actuation("mock_axis", spec.settle))
                .build();

            let descriptor = DeviceDescriptor::new(spec.id, cfg.role.kind())
                .with_capability(Capability::Movable)
                .with_settle(spec.settle)
                .with_tolerance(spec.tolerance)
                .with_travel(cfg.min, cfg.max);

            Ok(DeviceComponents {
                descriptor,
                handle: DeviceHandle::Positioner(Arc::new(axis)),
            })
        })
    }
}

// =============================================================================
// Limits
// =============================================================================

/// Limit behavior when a target exceeds the travel range
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LimitBehavior {
    /// Hard stop - return error at limit
    HardStop,
    /// Clamp to limit - move to boundary without error
    Clamp,
}

/// Axis travel limits
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisLimits {
    /// Lower limit
    pub min_position: f64,
    /// Upper limit
    pub max_position: f64,
    /// What to do outside the limits
    pub behavior: LimitBehavior,
}

impl AxisLimits {
    /// Create limits with HardStop behavior
    pub fn hard_stop(min: f64, max: f64) -> Self {
        Self {
            min_position: min,
            max_position: max,
            behavior: LimitBehavior::HardStop,
        }
    }

    /// Create limits with Clamp behavior
    pub fn clamp(min: f64, max: f64) -> Self {
        Self {
            min_position: min,
            max_position: max,
            behavior: LimitBehavior::Clamp,
        }
    }

    fn enforce(&self, target: f64) -> Result<f64> {
        if !target.is_finite() {
            return Err(anyhow!("Non-finite target {}", target));
        }
        match self.behavior {
            LimitBehavior::Clamp => Ok(target.clamp(self.min_position, self.max_position)),
            LimitBehavior::HardStop => {
                if target < self.min_position || target > self.max_position {
                    Err(anyhow!(
                        "Position {:.3} exceeds limits [{:.3}, {:.3}]",
                        target,
                        self.min_position,
                        self.max_position
                    ))
                } else {
                    Ok(target)
                }
            }
        }
    }
}

// =============================================================================
// MockAxis - Simulated Positioner
// =============================================================================

/// Mock single-axis positioner.
///
/// Completes each move after the configured latency (realistic mode) or
/// immediately (instant mode). Limits and fault injection apply in every mode.
///
/// # Example
///
/// ```rust,ignore
/// let piezo = MockAxis::builder()
///     .limits(AxisLimits::hard_stop(0.0, 800.0))
///     .build();
///
/// piezo.move_abs(10.0).await?;
/// assert_eq!(piezo.position().await?, 10.0);
/// ```
pub struct MockAxis {
    position: RwLock<f64>,
    limits: Option<AxisLimits>,
    actuation: Actuation,
}

impl MockAxis {
    /// Create a builder for configuring MockAxis
    pub fn builder() -> MockAxisBuilder {
        MockAxisBuilder::new()
    }
}

#[async_trait]
impl Device for MockAxis {
    async fn reset_fault(&self) -> Result<()> {
        self.actuation.reset();
        Ok(())
    }
}

#[async_trait]
impl Positioner for MockAxis {
    async fn move_abs(&self, target: f64) -> Result<()> {
        let target = match &self.limits {
            Some(limits) => limits.enforce(target)?,
            None => target,
        };
        let current = *self.position.read();
        tracing::debug!("MockAxis: Moving from {:.3} to {:.3}", current, target);

        self.actuation.perform("move", Duration::ZERO).await?;

        *self.position.write() = target;
        tracing::debug!("MockAxis: Reached {:.3}", target);
        Ok(())
    }

    async fn position(&self) -> Result<f64> {
        Ok(*self.position.read())
    }
}

// =============================================================================
// Builder Pattern
// =============================================================================

/// Builder for MockAxis with fluent API
pub struct MockAxisBuilder {
    initial_position: f64,
    limits: Option<AxisLimits>,
    actuation: Actuation,
}

impl MockAxisBuilder {
    /// Create a new builder with defaults (instant mode, no limits, no faults)
    pub fn new() -> Self {
        Self {
            initial_position: 0.0,
            limits: None,
            actuation: Actuation::new(
                "mock_axis",
                MockMode::Instant,
                TimingConfig::piezo(),
                ErrorConfig::none(),
            ),
        }
    }

    /// Set initial position
    pub fn initial_position(mut self, position: f64) -> Self {
        self.initial_position = position;
        self
    }

    /// Set position limits
    pub fn limits(mut self, limits: AxisLimits) -> Self {
        self.limits = Some(limits);
        self
    }

    /// Set mode, timing and error injection at once
    pub fn actuation(mut self, actuation: Actuation) -> Self {
        self.actuation = actuation;
        self
    }

    /// Build the MockAxis
    pub fn build(self) -> MockAxis {
        MockAxis {
            position: RwLock::new(self.initial_position),
            limits: self.limits,
            actuation: self.actuation,
        }
    }
}

impl Default for MockAxisBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sols_core::clock::MonotonicClock;
    use sols_core::device::DeviceId;

    #[tokio::test]
    async fn test_absolute_move() {
        let axis = MockAxis::builder().build();
        assert_eq!(axis.position().await.unwrap(), 0.0);
        axis.move_abs(10.0).await.unwrap();
        assert_eq!(axis.position().await.unwrap(), 10.0);
    }

    #[tokio::test]
    async fn test_limits_hard_stop() {
        let axis = MockAxis::builder()
            .limits(AxisLimits::hard_stop(0.0, 800.0))
            .build();
        axis.move_abs(400.0).await.unwrap();
        assert!(axis.move_abs(-1.0).await.is_err());
        assert!(axis.move_abs(800.5).await.is_err());
        assert_eq!(axis.position().await.unwrap(), 400.0);
    }

    #[tokio::test]
    async fn test_limits_clamp() {
        let axis = MockAxis::builder()
            .limits(AxisLimits::clamp(0.0, 30.0))
            .build();
        axis.move_abs(45.0).await.unwrap();
        assert_eq!(axis.position().await.unwrap(), 30.0);
    }

    #[tokio::test]
    async fn test_fault_injection_and_reset() {
        let axis = MockAxis::builder()
            .actuation(Actuation::new(
                "mock_axis",
                MockMode::Instant,
                TimingConfig::default(),
                ErrorConfig::fail_after("move", 2),
            ))
            .build();
        axis.move_abs(1.0).await.unwrap();
        axis.move_abs(2.0).await.unwrap();
        assert!(axis.move_abs(3.0).await.is_err());
        // A failed move leaves the axis where it was
        assert_eq!(axis.position().await.unwrap(), 2.0);

        axis.reset_fault().await.unwrap();
        axis.move_abs(3.0).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_realistic_latency() {
        let axis = MockAxis::builder()
            .actuation(Actuation::new(
                "mock_axis",
                MockMode::Realistic,
                TimingConfig::with_latency(Duration::from_millis(2)),
                ErrorConfig::none(),
            ))
            .build();
        let start = tokio::time::Instant::now();
        axis.move_abs(5.0).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(2));
    }

    #[tokio::test]
    async fn test_factory_builds_descriptor() {
        let factory = MockAxisFactory;
        let params: toml::Value =
            toml::from_str("role = \"coarse_stage\"\nmin = 0.0\nmax = 30.0").unwrap();
        factory.validate(&params).unwrap();

        let spec = DeviceSpec {
            id: DeviceId::from("coarse_z"),
            settle: Duration::from_millis(100),
            tolerance: Duration::from_millis(20),
            params,
        };
        let ctx = BuildContext {
            clock: Arc::new(MonotonicClock::new()),
        };
        let built = factory.build(spec, ctx).await.unwrap();
        assert_eq!(built.descriptor.kind, DeviceKind::CoarseStage);
        assert_eq!(built.descriptor.min_settle, Duration::from_millis(100));
        assert!(built.descriptor.has(Capability::Movable));
        assert!(matches!(built.handle, DeviceHandle::Positioner(_)));
    }

    #[test]
    fn test_factory_rejects_bad_range() {
        let params: toml::Value = toml::from_str("min = 5.0\nmax = 1.0").unwrap();
        assert!(MockAxisFactory.validate(&params).is_err());
    }
}
