//! Mock hardware autofocus.
//!
//! The readiness check polls the sample detector a few times, the way the
//! instrument confirms an interface is in range before a focus-locked run.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::Deserialize;
use sols_core::capabilities::{Device, DeviceHandle, FocusLock};
use sols_core::device::{Capability, DeviceDescriptor, DeviceKind};
use sols_core::driver::{BuildContext, DeviceComponents, DeviceSpec, DriverFactory};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::common::{Actuation, CommonParams, ErrorConfig, MockMode, TimingConfig};

/// Detector reads taken by the readiness check.
const READY_SAMPLES: usize = 3;

// =============================================================================
// MockAutofocusFactory - DriverFactory implementation
// =============================================================================

/// Configuration for MockAutofocus driver
#[derive(Debug, Clone, Deserialize)]
pub struct MockAutofocusConfig {
    /// Whether a sample interface is in range
    #[serde(default = "default_sample_present")]
    pub sample_present: bool,
    /// Mode, latency and faults
    #[serde(flatten)]
    pub common: CommonParams,
}

fn default_sample_present() -> bool {
    true
}

/// Factory for creating MockAutofocus instances.
pub struct MockAutofocusFactory;

static MOCK_AF_KINDS: &[DeviceKind] = &[DeviceKind::Autofocus];
static MOCK_AF_CAPABILITIES: &[Capability] = &[Capability::FocusLock];

impl DriverFactory for MockAutofocusFactory {
    fn driver_type(&self) -> &'static str {
        "mock_autofocus"
    }

    fn name(&self) -> &'static str {
        "Mock Autofocus"
    }

    fn kinds(&self) -> &'static [DeviceKind] {
        MOCK_AF_KINDS
    }

    fn capabilities(&self) -> &'static [Capability] {
        MOCK_AF_CAPABILITIES
    }

    fn validate(&self, params: &toml::Value) -> Result<()> {
        let _cfg: MockAutofocusConfig = params.clone().try_into()?;
        Ok(())
    }

    fn build(&self, spec: DeviceSpec, _ctx: BuildContext) -> BoxFuture<'static, Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg: MockAutofocusConfig = spec.params.clone().try_into()?;
            let autofocus = MockAutofocus::new(
                cfg.sample_present,
                cfg.common.actuation("mock_autofocus", spec.settle),
            );

            let descriptor = DeviceDescriptor::new(spec.id, DeviceKind::Autofocus)
                .with_capability(Capability::FocusLock)
                .with_settle(spec.settle)
                .with_tolerance(spec.tolerance);

            Ok(DeviceComponents {
                descriptor,
                handle: DeviceHandle::Autofocus(Arc::new(autofocus)),
            })
        })
    }
}

// =============================================================================
// MockAutofocus
// =============================================================================

/// Mock focus-lock sensor.
pub struct MockAutofocus {
    engaged: RwLock<bool>,
    sample_present: AtomicBool,
    actuation: Actuation,
}

impl MockAutofocus {
    /// Create an autofocus unit, released.
    pub fn new(sample_present: bool, actuation: Actuation) -> Self {
        Self {
            engaged: RwLock::new(false),
            sample_present: AtomicBool::new(sample_present),
            actuation,
        }
    }

    /// Instant-mode unit with a sample in range.
    pub fn instant() -> Self {
        Self::new(
            true,
            Actuation::new(
                "mock_autofocus",
                MockMode::Instant,
                TimingConfig::autofocus(),
                ErrorConfig::none(),
            ),
        )
    }

    /// Simulate inserting or removing the sample.
    pub fn set_sample_present(&self, present: bool) {
        self.sample_present.store(present, Ordering::SeqCst);
    }

    /// Whether the lock is engaged.
    pub fn is_engaged(&self) -> bool {
        *self.engaged.read()
    }
}

#[async_trait]
impl Device for MockAutofocus {
    async fn check_ready(&self) -> Result<()> {
        for _ in 0..READY_SAMPLES {
            if !self.sample_present().await? {
                return Err(anyhow!("Autofocus: no sample interface detected"));
            }
        }
        Ok(())
    }

    async fn reset_fault(&self) -> Result<()> {
        self.actuation.reset();
        Ok(())
    }
}

#[async_trait]
impl FocusLock for MockAutofocus {
    async fn set_engaged(&self, engaged: bool) -> Result<()> {
        if engaged && !self.sample_present.load(Ordering::SeqCst) {
            return Err(anyhow!("Autofocus cannot lock without a sample"));
        }
        tracing::debug!("MockAutofocus: engaged={}", engaged);
        self.actuation.perform("focus_lock", Duration::ZERO).await?;
        *self.engaged.write() = engaged;
        Ok(())
    }

    async fn sample_present(&self) -> Result<bool> {
        self.actuation.check("read_sensor")?;
        Ok(self.sample_present.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ready_with_sample() {
        let af = MockAutofocus::instant();
        af.check_ready().await.unwrap();
        af.set_engaged(true).await.unwrap();
        assert!(af.is_engaged());
    }

    #[tokio::test]
    async fn test_not_ready_without_sample() {
        let af = MockAutofocus::instant();
        af.set_sample_present(false);
        assert!(af.check_ready().await.is_err());
        assert!(af.set_engaged(true).await.is_err());
        af.set_engaged(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_sensor_read_fault() {
        let af = MockAutofocus::new(
            true,
            Actuation::new(
                "mock_autofocus",
                MockMode::Instant,
                TimingConfig::autofocus(),
                ErrorConfig::fail_after("read_sensor", 1),
            ),
        );
        let err = af.check_ready().await.unwrap_err();
        assert!(err.to_string().contains("mock_autofocus"));
    }
}
