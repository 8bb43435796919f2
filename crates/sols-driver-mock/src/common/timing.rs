//! Timing configuration for realistic mode.
//!
//! Defines how long a mock device takes to report completion. The defaults
//! follow the order of magnitude of the SOLS hardware (galvo steps in
//! hundreds of microseconds, piezo steps in milliseconds, filter wheel and
//! stage moves in tens to hundreds of milliseconds). In a deployment the
//! hardware inventory overrides them with the device's configured settle time.

use std::time::Duration;

/// Timing configuration for realistic mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimingConfig {
    /// Time from command to completion
    pub latency: Duration,
    /// Camera readout after the exposure ends
    pub readout: Duration,
}

impl TimingConfig {
    /// Completion after `latency`, no readout.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            readout: Duration::ZERO,
        }
    }

    /// Scan mirror pair small-step response
    pub fn galvo() -> Self {
        Self::with_latency(Duration::from_micros(200))
    }

    /// Fast focus piezo
    pub fn piezo() -> Self {
        Self::with_latency(Duration::from_millis(2))
    }

    /// Coarse focus stage
    pub fn coarse_stage() -> Self {
        Self::with_latency(Duration::from_millis(100))
    }

    /// XY sample stage
    pub fn xy_stage() -> Self {
        Self::with_latency(Duration::from_millis(200))
    }

    /// Emission filter wheel
    pub fn filter_wheel() -> Self {
        Self::with_latency(Duration::from_millis(50))
    }

    /// Laser TTL/power update
    pub fn laser() -> Self {
        Self::with_latency(Duration::from_micros(500))
    }

    /// Autofocus engage
    pub fn autofocus() -> Self {
        Self::with_latency(Duration::from_millis(10))
    }

    /// Camera: readout after each exposure
    pub fn camera() -> Self {
        Self {
            latency: Duration::ZERO,
            readout: Duration::from_millis(5),
        }
    }
}
