//! Common infrastructure for mock devices.
//!
//! Provides reusable components for building mock hardware drivers:
//!
//! - **mode**: Operational modes (Instant, Realistic, Chaos)
//! - **timing**: Hardware-like completion latencies
//! - **errors**: Error injection framework
//! - **actuation**: Applies the above to one simulated command
//! - **params**: Inventory parameters shared by every mock factory

pub mod actuation;
pub mod errors;
pub mod mode;
pub mod params;
pub mod timing;

// Re-export commonly used types
pub use actuation::Actuation;
pub use errors::{ErrorConfig, ErrorScenario, FaultParams};
pub use mode::MockMode;
pub use params::CommonParams;
pub use timing::TimingConfig;
