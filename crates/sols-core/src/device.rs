//! Device identity, descriptors and targets.
//!
//! A [`DeviceDescriptor`] is the Device Abstraction Layer's record of one
//! physical actuator or sensor. The DAL owns descriptors; the plan compiler
//! and the dispatcher only ever see snapshots.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Stable identifier of a registered device.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Create an id from any string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Closed set of device roles on the instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// Excitation laser (one device per line)
    Laser,
    /// Light-sheet forming scan mirror pair
    ScanMirror,
    /// Coarse focus stage
    CoarseStage,
    /// Fast focus actuator (piezo)
    FastFocus,
    /// XY sample stage
    XyStage,
    /// Emission filter selector
    FilterWheel,
    /// Hardware autofocus sensor
    Autofocus,
    /// Camera
    Camera,
}

impl DeviceKind {
    /// Human-readable label.
    pub fn label(&self) -> &'static str {
        match self {
            DeviceKind::Laser => "laser",
            DeviceKind::ScanMirror => "scan mirror",
            DeviceKind::CoarseStage => "coarse stage",
            DeviceKind::FastFocus => "fast focus",
            DeviceKind::XyStage => "xy stage",
            DeviceKind::FilterWheel => "filter wheel",
            DeviceKind::Autofocus => "autofocus",
            DeviceKind::Camera => "camera",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Capabilities a device can advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Positionable axis (or axes)
    Movable,
    /// Accepts hardware triggers (camera)
    Triggerable,
    /// Can sweep continuously during an exposure
    ContinuousScan,
    /// Discrete filter positions
    Filterable,
    /// Light source with on/off and power
    Illumination,
    /// Closed-loop focus hold
    FocusLock,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Capability::Movable => "movable",
            Capability::Triggerable => "triggerable",
            Capability::ContinuousScan => "continuous_scan",
            Capability::Filterable => "filterable",
            Capability::Illumination => "illumination",
            Capability::FocusLock => "focus_lock",
        };
        f.write_str(label)
    }
}

/// Device status as tracked by the DAL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    /// Ready for a command
    #[default]
    Idle,
    /// A configure command is pending
    Moving,
    /// A trigger is pending
    Triggered,
    /// Latched fault; cleared only by an explicit reset
    Fault,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DeviceStatus::Idle => "idle",
            DeviceStatus::Moving => "moving",
            DeviceStatus::Triggered => "triggered",
            DeviceStatus::Fault => "fault",
        };
        f.write_str(label)
    }
}

/// Declared travel range of an axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TravelRange {
    /// Lower bound (inclusive)
    pub min: f64,
    /// Upper bound (inclusive)
    pub max: f64,
}

impl TravelRange {
    /// Create a range.
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Whether `value` lies inside the range (NaN is never inside).
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Camera readout region in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorShape {
    /// Rows
    pub height_px: u32,
    /// Columns
    pub width_px: u32,
}

/// Angles of the light-sheet scan mirror pair, in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MirrorAngles {
    /// Scan mirror angle
    pub scan_deg: f64,
    /// Tilt (projection) mirror angle
    pub tilt_deg: f64,
    /// Sweep amplitude during the exposure; zero for a static sheet
    #[serde(default)]
    pub sweep_deg: f64,
}

/// Laser output state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LaserState {
    /// Emission enabled
    pub enabled: bool,
    /// Output power in percent of maximum
    pub power_pct: f64,
}

impl LaserState {
    /// Laser switched off.
    pub const OFF: LaserState = LaserState {
        enabled: false,
        power_pct: 0.0,
    };

    /// Laser on at the given power.
    pub fn on(power_pct: f64) -> Self {
        Self {
            enabled: true,
            power_pct,
        }
    }
}

/// Target state passed to `configure`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceTarget {
    /// Single-axis absolute position (stage units)
    Position {
        /// Target value
        value: f64,
    },
    /// XY absolute position in millimetres
    PlanarPosition {
        /// X (mm)
        x_mm: f64,
        /// Y (mm)
        y_mm: f64,
    },
    /// Scan mirror pair angles
    Mirrors(MirrorAngles),
    /// Filter selector position
    Filter {
        /// Position index
        position: u32,
    },
    /// Laser output
    Laser(LaserState),
    /// Autofocus hold on/off
    FocusLock {
        /// Engage the focus lock
        engaged: bool,
    },
}

impl DeviceTarget {
    /// Short operation name for logs and errors.
    pub fn operation(&self) -> &'static str {
        match self {
            DeviceTarget::Position { .. } => "move",
            DeviceTarget::PlanarPosition { .. } => "move_xy",
            DeviceTarget::Mirrors(_) => "set_mirrors",
            DeviceTarget::Filter { .. } => "select_filter",
            DeviceTarget::Laser(_) => "set_laser",
            DeviceTarget::FocusLock { .. } => "focus_lock",
        }
    }
}

/// Everything the plan compiler and dispatcher know about a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Identity
    pub id: DeviceId,
    /// Role on the instrument
    pub kind: DeviceKind,
    /// Advertised capabilities
    pub capabilities: Vec<Capability>,
    /// Minimum time after a command before the device is ready again
    pub min_settle: Duration,
    /// Allowed lateness of a completion relative to its scheduled deadline
    pub tolerance: Duration,
    /// Declared travel range of the primary axis (z in um, mirrors in deg)
    #[serde(default)]
    pub travel: Option<TravelRange>,
    /// Secondary travel range (mirror tilt in deg, stage y in mm)
    #[serde(default)]
    pub secondary_travel: Option<TravelRange>,
    /// Laser line in nm
    #[serde(default)]
    pub wavelength_nm: Option<u32>,
    /// Maximum accepted laser power in percent
    #[serde(default)]
    pub max_power_pct: Option<f64>,
    /// Filter names indexed by position
    #[serde(default)]
    pub filter_names: Vec<String>,
    /// Camera sensor readout shape
    #[serde(default)]
    pub sensor: Option<SensorShape>,
    /// Status as last observed by the DAL
    #[serde(default)]
    pub status: DeviceStatus,
    /// Last target the device completed
    #[serde(default)]
    pub last_state: Option<DeviceTarget>,
    /// Latched fault flag
    #[serde(default)]
    pub faulted: bool,
}

impl DeviceDescriptor {
    /// Create a descriptor with no ranges and zero timing.
    pub fn new(id: impl Into<DeviceId>, kind: DeviceKind) -> Self {
        Self {
            id: id.into(),
            kind,
            capabilities: Vec::new(),
            min_settle: Duration::ZERO,
            tolerance: Duration::ZERO,
            travel: None,
            secondary_travel: None,
            wavelength_nm: None,
            max_power_pct: None,
            filter_names: Vec::new(),
            sensor: None,
            status: DeviceStatus::Idle,
            last_state: None,
            faulted: false,
        }
    }

    /// Add a capability.
    pub fn with_capability(mut self, capability: Capability) -> Self {
        if !self.capabilities.contains(&capability) {
            self.capabilities.push(capability);
        }
        self
    }

    /// Set settle time.
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.min_settle = settle;
        self
    }

    /// Set timing tolerance.
    pub fn with_tolerance(mut self, tolerance: Duration) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Set primary travel range.
    pub fn with_travel(mut self, min: f64, max: f64) -> Self {
        self.travel = Some(TravelRange::new(min, max));
        self
    }

    /// Set secondary travel range.
    pub fn with_secondary_travel(mut self, min: f64, max: f64) -> Self {
        self.secondary_travel = Some(TravelRange::new(min, max));
        self
    }

    /// Set the laser line and maximum power.
    pub fn with_laser_line(mut self, wavelength_nm: u32, max_power_pct: f64) -> Self {
        self.wavelength_nm = Some(wavelength_nm);
        self.max_power_pct = Some(max_power_pct);
        self
    }

    /// Set filter names by position.
    pub fn with_filters<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.filter_names = names.into_iter().map(Into::into).collect();
        self
    }

    /// Set the camera readout shape.
    pub fn with_sensor(mut self, height_px: u32, width_px: u32) -> Self {
        self.sensor = Some(SensorShape {
            height_px,
            width_px,
        });
        self
    }

    /// Whether the device advertises a capability.
    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Position index of a named filter.
    pub fn filter_position(&self, name: &str) -> Option<u32> {
        self.filter_names
            .iter()
            .position(|n| n == name)
            .and_then(|p| u32::try_from(p).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn travel_range_rejects_nan() {
        let range = TravelRange::new(0.0, 800.0);
        assert!(range.contains(0.0));
        assert!(range.contains(800.0));
        assert!(!range.contains(800.1));
        assert!(!range.contains(f64::NAN));
    }

    #[test]
    fn descriptor_builder() {
        let wheel = DeviceDescriptor::new("filter_wheel", DeviceKind::FilterWheel)
            .with_capability(Capability::Filterable)
            .with_capability(Capability::Filterable)
            .with_filters(["Shutter", "Open", "ET525/50M"]);
        assert_eq!(wheel.capabilities.len(), 1);
        assert_eq!(wheel.filter_position("ET525/50M"), Some(2));
        assert_eq!(wheel.filter_position("ET600/50M"), None);
    }

    #[test]
    fn target_serializes_tagged() {
        let json = serde_json::to_string(&DeviceTarget::Filter { position: 3 }).unwrap();
        assert_eq!(json, r#"{"type":"filter","position":3}"#);
    }
}
