//! `sols-hardware`
//!
//! Device Abstraction Layer for the SOLS acquisition sequencer.
//!
//! - [`DeviceRegistry`]: owns devices, issues non-blocking commands, posts
//!   device events and funnels camera frames
//! - [`FactoryTable`]: driver factories keyed by driver type
//! - [`HardwareConfig`]: the hardware inventory (TOML via figment)
//!
//! ```rust,ignore
//! use sols_hardware::{create_mock_registry, DeviceRegistry};
//!
//! let registry = create_mock_registry("realistic", clock).await?;
//! let ticket = registry.configure(&"piezo".into(), DeviceTarget::Position { value: 10.0 }, 0)?;
//! ```

pub use sols_core::capabilities;
pub mod config;
pub mod factory;
pub mod registry;

pub use config::{ConfigLoadError, DeviceConfig, HardwareConfig, SOLS_MOCK_INVENTORY};
pub use factory::FactoryTable;
pub use registry::{create_mock_registry, DeviceRegistry};
