//! Mock emission filter wheel.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::Deserialize;
use sols_core::capabilities::{Device, DeviceHandle, FilterSelector};
use sols_core::device::{Capability, DeviceDescriptor, DeviceKind};
use sols_core::driver::{BuildContext, DeviceComponents, DeviceSpec, DriverFactory};
use std::sync::Arc;
use std::time::Duration;

use crate::common::{Actuation, CommonParams, ErrorConfig, MockMode, TimingConfig};

/// Filter set installed on the SOLS emission path, by wheel position.
pub const SOLS_FILTERS: [&str; 7] = [
    "Shutter",
    "Open",
    "ET445/58M",
    "ET525/50M",
    "ET600/50M",
    "ET706/95M",
    "ZET405/488/561/640m",
];

// =============================================================================
// MockFilterWheelFactory - DriverFactory implementation
// =============================================================================

/// Configuration for MockFilterWheel driver
#[derive(Debug, Clone, Deserialize)]
pub struct MockFilterWheelConfig {
    /// Filter names by position
    #[serde(default = "default_filters")]
    pub filters: Vec<String>,
    /// Mode, latency and faults
    #[serde(flatten)]
    pub common: CommonParams,
}

fn default_filters() -> Vec<String> {
    SOLS_FILTERS.iter().map(|s| s.to_string()).collect()
}

/// Factory for creating MockFilterWheel instances.
pub struct MockFilterWheelFactory;

static MOCK_WHEEL_KINDS: &[DeviceKind] = &[DeviceKind::FilterWheel];
static MOCK_WHEEL_CAPABILITIES: &[Capability] = &[Capability::Filterable];

impl DriverFactory for MockFilterWheelFactory {
    fn driver_type(&self) -> &'static str {
        "mock_filter_wheel"
    }

    fn name(&self) -> &'static str {
        "Mock Filter Wheel"
    }

    fn kinds(&self) -> &'static [DeviceKind] {
        MOCK_WHEEL_KINDS
    }

    fn capabilities(&self) -> &'static [Capability] {
        MOCK_WHEEL_CAPABILITIES
    }

    fn validate(&self, params: &toml::Value) -> Result<()> {
        let cfg: MockFilterWheelConfig = params.clone().try_into()?;
        if cfg.filters.is_empty() {
            return Err(anyhow!("Filter wheel needs at least one position"));
        }
        for (i, name) in cfg.filters.iter().enumerate() {
            if cfg.filters[..i].contains(name) {
                return Err(anyhow!("Duplicate filter name '{}'", name));
            }
        }
        Ok(())
    }

    fn build(&self, spec: DeviceSpec, _ctx: BuildContext) -> BoxFuture<'static, Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg: MockFilterWheelConfig = spec.params.clone().try_into()?;
            let wheel = MockFilterWheel::new(
                cfg.filters.len(),
                cfg.common.actuation("mock_filter_wheel", spec.settle),
            );

            let descriptor = DeviceDescriptor::new(spec.id, DeviceKind::FilterWheel)
                .with_capability(Capability::Filterable)
                .with_settle(spec.settle)
                .with_tolerance(spec.tolerance)
                .with_filters(cfg.filters);

            Ok(DeviceComponents {
                descriptor,
                handle: DeviceHandle::Filter(Arc::new(wheel)),
            })
        })
    }
}

// =============================================================================
// MockFilterWheel
// =============================================================================

/// Mock filter wheel. Starts at position 0.
pub struct MockFilterWheel {
    position: RwLock<u32>,
    positions: usize,
    actuation: Actuation,
}

impl MockFilterWheel {
    /// Create a wheel with `positions` slots.
    pub fn new(positions: usize, actuation: Actuation) -> Self {
        Self {
            position: RwLock::new(0),
            positions,
            actuation,
        }
    }

    /// Instant-mode wheel with the SOLS filter set.
    pub fn instant() -> Self {
        Self::new(
            SOLS_FILTERS.len(),
            Actuation::new(
                "mock_filter_wheel",
                MockMode::Instant,
                TimingConfig::filter_wheel(),
                ErrorConfig::none(),
            ),
        )
    }
}

#[async_trait]
impl Device for MockFilterWheel {
    async fn reset_fault(&self) -> Result<()> {
        self.actuation.reset();
        Ok(())
    }
}

#[async_trait]
impl FilterSelector for MockFilterWheel {
    async fn select(&self, position: u32) -> Result<()> {
        if position as usize >= self.positions {
            return Err(anyhow!(
                "Filter position {} out of range (0..{})",
                position,
                self.positions
            ));
        }
        tracing::debug!("MockFilterWheel: Rotating to position {}", position);
        self.actuation.perform("select_filter", Duration::ZERO).await?;
        *self.position.write() = position;
        Ok(())
    }

    async fn current(&self) -> Result<u32> {
        Ok(*self.position.read())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_select_position() {
        let wheel = MockFilterWheel::instant();
        assert_eq!(wheel.current().await.unwrap(), 0);
        wheel.select(3).await.unwrap();
        assert_eq!(wheel.current().await.unwrap(), 3);
        assert!(wheel.select(7).await.is_err());
        assert_eq!(wheel.current().await.unwrap(), 3);
    }

    #[test]
    fn test_factory_rejects_duplicates() {
        let params: toml::Value = toml::from_str("filters = [\"Open\", \"Open\"]").unwrap();
        assert!(MockFilterWheelFactory.validate(&params).is_err());
        let params: toml::Value = toml::from_str("filters = []").unwrap();
        assert!(MockFilterWheelFactory.validate(&params).is_err());
    }

    #[test]
    fn test_default_filters_are_sols_set() {
        let filters = default_filters();
        assert_eq!(filters.len(), 7);
        assert_eq!(filters[3], "ET525/50M");
    }
}
