//! Driver factory contract.
//!
//! Driver crates expose one [`DriverFactory`] per driver type. The hardware
//! registry looks factories up by the `driver` field of each device entry in
//! the hardware inventory:
//!
//! ```toml
//! [[devices]]
//! id = "piezo"
//! driver = "mock_axis"       # matches driver_type()
//! settle_us = 2000
//! tolerance_us = 500
//!
//! [devices.params]
//! role = "fast_focus"
//! min = 0.0
//! max = 800.0
//! ```
//!
//! Factories validate the `params` table first, then build the device into
//! [`DeviceComponents`]: the descriptor the DAL will own plus the capability
//! handle it will drive.

use crate::capabilities::DeviceHandle;
use crate::clock::Clock;
use crate::device::{Capability, DeviceDescriptor, DeviceId, DeviceKind};
use anyhow::Result;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;

/// Per-device values common to every driver.
#[derive(Debug, Clone)]
pub struct DeviceSpec {
    /// Device id
    pub id: DeviceId,
    /// Minimum settle time after a command
    pub settle: Duration,
    /// Allowed completion lateness
    pub tolerance: Duration,
    /// Driver-specific parameters
    pub params: toml::Value,
}

/// Runtime services handed to factories.
#[derive(Debug, Clone)]
pub struct BuildContext {
    /// Shared monotonic clock
    pub clock: Arc<dyn Clock>,
}

/// A built device.
#[derive(Debug, Clone)]
pub struct DeviceComponents {
    /// Descriptor handed to the DAL
    pub descriptor: DeviceDescriptor,
    /// Capability handle
    pub handle: DeviceHandle,
}

/// Factory for one driver type.
pub trait DriverFactory: Send + Sync + 'static {
    /// Driver type name used in the inventory `driver` field.
    fn driver_type(&self) -> &'static str;

    /// Human-readable name for documentation and error messages.
    fn name(&self) -> &'static str;

    /// Device kinds this factory can produce.
    fn kinds(&self) -> &'static [DeviceKind];

    /// Capabilities the produced devices advertise.
    fn capabilities(&self) -> &'static [Capability] {
        &[]
    }

    /// Validate driver parameters without instantiating.
    fn validate(&self, params: &toml::Value) -> Result<()>;

    /// Instantiate the device.
    fn build(&self, spec: DeviceSpec, ctx: BuildContext) -> BoxFuture<'static, Result<DeviceComponents>>;
}
