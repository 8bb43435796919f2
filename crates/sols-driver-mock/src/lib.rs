//! Mock Hardware Drivers for the SOLS acquisition sequencer
//!
//! This crate provides simulated SOLS devices for testing and dry runs
//! without physical hardware. All mock devices use async-safe operations
//! (`tokio::time::sleep`, not `std::thread::sleep`), so a paused tokio runtime
//! drives them deterministically.
//!
//! # Available Mock Drivers
//!
//! - [`MockAxis`] - fast focus piezo or coarse focus stage
//! - [`MockXyStage`] - XY sample stage
//! - [`MockGalvo`] - scan/tilt mirror pair with optional continuous sweep
//! - [`MockFilterWheel`] - emission filter wheel (SOLS filter set by default)
//! - [`MockLaser`] - one excitation line with power limit
//! - [`MockAutofocus`] - focus lock with sample detection
//! - [`MockCamera`] - triggered camera producing synthetic light-sheet frames
//!
//! # Timing
//!
//! In `realistic` and `chaos` modes every command completes after the
//! device's configured settle time (or `latency_us` when set). The camera
//! completes after exposure plus readout.
//!
//! # Driver Factory Pattern
//!
//! Each mock driver provides a `DriverFactory` implementation for use with
//! the sols-hardware registry:
//!
//! ```rust,ignore
//! use sols_driver_mock::register_all;
//! use sols_hardware::FactoryTable;
//!
//! let factories = FactoryTable::new();
//! register_all(&factories);
//! ```

pub mod common;
mod mock_autofocus;
mod mock_axis;
mod mock_camera;
mod mock_filter_wheel;
mod mock_galvo;
mod mock_laser;
mod mock_xy_stage;
mod pattern;

// Re-export common types
pub use common::{
    Actuation, CommonParams, ErrorConfig, ErrorScenario, FaultParams, MockMode, TimingConfig,
};

// Re-export driver types
pub use mock_autofocus::{MockAutofocus, MockAutofocusFactory};
pub use mock_axis::{AxisLimits, AxisRole, LimitBehavior, MockAxis, MockAxisFactory};
pub use mock_camera::{MockCamera, MockCameraFactory};
pub use mock_filter_wheel::{MockFilterWheel, MockFilterWheelFactory, SOLS_FILTERS};
pub use mock_galvo::{MockGalvo, MockGalvoFactory};
pub use mock_laser::{MockLaser, MockLaserFactory};
pub use mock_xy_stage::{MockXyStage, MockXyStageFactory};

// Re-export for convenience
pub use pattern::{generate_sheet_frame, sheet_row};

/// Register all mock driver factories.
///
/// Convenience function to register all mock factories at once.
pub fn register_all(registry: &impl FactoryRegistry) {
    registry.register_factory(Box::new(MockAxisFactory));
    registry.register_factory(Box::new(MockXyStageFactory));
    registry.register_factory(Box::new(MockGalvoFactory));
    registry.register_factory(Box::new(MockFilterWheelFactory));
    registry.register_factory(Box::new(MockLaserFactory));
    registry.register_factory(Box::new(MockAutofocusFactory));
    registry.register_factory(Box::new(MockCameraFactory));
}

/// Trait for registries that can accept driver factories.
///
/// This allows the mock driver crate to work with any registry implementation
/// without depending on sols-hardware directly.
pub trait FactoryRegistry {
    /// Register a driver factory.
    fn register_factory(&self, factory: Box<dyn sols_core::driver::DriverFactory>);
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Collect(Mutex<Vec<&'static str>>);

    impl FactoryRegistry for Collect {
        fn register_factory(&self, factory: Box<dyn sols_core::driver::DriverFactory>) {
            self.0.lock().push(factory.driver_type());
        }
    }

    #[test]
    fn test_register_all_covers_every_driver() {
        let collected = Collect::default();
        register_all(&collected);
        let names = collected.0.lock().clone();
        assert_eq!(names.len(), 7);
        assert!(names.contains(&"mock_camera"));
        assert!(names.contains(&"mock_autofocus"));
    }
}
