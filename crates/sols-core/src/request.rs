//! Declarative acquisition requests.
//!
//! An [`AcquisitionRequest`] is what an operator (or a script) submits: which
//! channels, which z range, which projection angles, how many timepoints and
//! how long each exposure is. It is immutable once submitted and is stored
//! verbatim in the run manifest, so every field is plain serde data.
//!
//! # Example
//!
//! ```rust,ignore
//! let request = AcquisitionRequest::new(Duration::from_millis(10))
//!     .with_channel(Channel::new(488, 20.0, "ET525/50M"))
//!     .with_z_range(ZRange::new(0.0, 10.0, 1.0))
//!     .with_angle(ProjectionAngle::new(0.0));
//! ```

use crate::device::MirrorAngles;
use crate::error::CompilationError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One excitation/emission channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    /// Laser line (nm)
    pub laser_nm: u32,
    /// Laser power (% of maximum)
    pub power_pct: f64,
    /// Emission filter name as installed in the filter wheel
    pub filter: String,
}

impl Channel {
    /// Create a channel.
    pub fn new(laser_nm: u32, power_pct: f64, filter: impl Into<String>) -> Self {
        Self {
            laser_nm,
            power_pct,
            filter: filter.into(),
        }
    }
}

/// Inclusive z range in micrometres.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ZRange {
    /// First slice (um)
    pub start_um: f64,
    /// Last slice (um), inclusive
    pub stop_um: f64,
    /// Slice spacing (um)
    pub step_um: f64,
}

impl ZRange {
    /// Create a range.
    pub fn new(start_um: f64, stop_um: f64, step_um: f64) -> Self {
        Self {
            start_um,
            stop_um,
            step_um,
        }
    }

    /// Single slice at `z_um`.
    pub fn single(z_um: f64) -> Self {
        Self::new(z_um, z_um, 1.0)
    }

    /// Slice positions, first to last.
    ///
    /// Positions are computed as `start + i * step` rather than accumulated,
    /// so identical ranges always produce bit-identical positions.
    pub fn positions(&self) -> Result<Vec<f64>, CompilationError> {
        if !(self.start_um.is_finite() && self.stop_um.is_finite() && self.step_um.is_finite()) {
            return Err(CompilationError::InvalidZRange("non-finite bound".into()));
        }
        if self.step_um <= 0.0 {
            return Err(CompilationError::InvalidZRange(format!(
                "step must be positive, got {}",
                self.step_um
            )));
        }
        if self.stop_um < self.start_um {
            return Err(CompilationError::InvalidZRange(format!(
                "stop {} precedes start {}",
                self.stop_um, self.start_um
            )));
        }
        let intervals = ((self.stop_um - self.start_um) / self.step_um + 1e-9).floor();
        if intervals > f64::from(u32::MAX - 1) {
            return Err(CompilationError::InvalidZRange("too many slices".into()));
        }
        let slices = intervals as u32 + 1;
        Ok((0..slices)
            .map(|i| self.start_um + f64::from(i) * self.step_um)
            .collect())
    }

    /// Length of the range (um).
    pub fn span_um(&self) -> f64 {
        self.stop_um - self.start_um
    }
}

/// One projection angle and the scan mirror settings that realise it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProjectionAngle {
    /// Nominal projection angle (deg)
    pub angle_deg: f64,
    /// Mirror pair settings for this angle
    pub mirrors: MirrorAngles,
}

impl ProjectionAngle {
    /// Angle whose tilt mirror sits at `angle_deg` and scan mirror at zero.
    pub fn new(angle_deg: f64) -> Self {
        Self {
            angle_deg,
            mirrors: MirrorAngles {
                scan_deg: 0.0,
                tilt_deg: angle_deg,
                sweep_deg: 0.0,
            },
        }
    }

    /// Override the scan mirror angle.
    pub fn with_scan(mut self, scan_deg: f64) -> Self {
        self.mirrors.scan_deg = scan_deg;
        self
    }
}

/// Labelled XY stage position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagePosition {
    /// Label, e.g. `B03r00c01`
    pub label: String,
    /// X (mm)
    pub x_mm: f64,
    /// Y (mm)
    pub y_mm: f64,
}

/// How each (position, angle, channel) is exposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionMode {
    /// One exposure per z slice
    #[default]
    Volume,
    /// One exposure per angle with the sheet swept across the z range
    Projection,
}

/// Immutable description of one acquisition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionRequest {
    /// Channels, innermost loop
    pub channels: Vec<Channel>,
    /// Z range
    pub z: ZRange,
    /// Projection angles
    pub angles: Vec<ProjectionAngle>,
    /// Number of timepoints
    pub timepoints: u32,
    /// Exposure per step (us)
    pub exposure_us: u64,
    /// Minimum spacing between timepoint starts (ms)
    #[serde(default)]
    pub timepoint_interval_ms: Option<u64>,
    /// XY positions; empty means "stay where the stage is"
    #[serde(default)]
    pub positions: Vec<StagePosition>,
    /// Volume or projection acquisition
    #[serde(default)]
    pub mode: AcquisitionMode,
    /// Hold focus with the hardware autofocus during the run
    #[serde(default)]
    pub autofocus: bool,
    /// Coarse focus stage position (mm), applied before the first exposure
    #[serde(default)]
    pub coarse_focus_mm: Option<f64>,
    /// Camera-only exposures fired before the first acquisition step and
    /// discarded downstream
    #[serde(default)]
    pub camera_preframes: u32,
}

impl AcquisitionRequest {
    /// Request with one timepoint, a single slice at z = 0, no channels and no angles.
    pub fn new(exposure: Duration) -> Self {
        Self {
            channels: Vec::new(),
            z: ZRange::single(0.0),
            angles: Vec::new(),
            timepoints: 1,
            exposure_us: u64::try_from(exposure.as_micros()).unwrap_or(u64::MAX),
            timepoint_interval_ms: None,
            positions: Vec::new(),
            mode: AcquisitionMode::Volume,
            autofocus: false,
            coarse_focus_mm: None,
            camera_preframes: 0,
        }
    }

    /// Add a channel.
    pub fn with_channel(mut self, channel: Channel) -> Self {
        self.channels.push(channel);
        self
    }

    /// Set the z range.
    pub fn with_z_range(mut self, z: ZRange) -> Self {
        self.z = z;
        self
    }

    /// Add a projection angle.
    pub fn with_angle(mut self, angle: ProjectionAngle) -> Self {
        self.angles.push(angle);
        self
    }

    /// Set the timepoint count.
    pub fn with_timepoints(mut self, timepoints: u32) -> Self {
        self.timepoints = timepoints;
        self
    }

    /// Set the minimum interval between timepoint starts.
    pub fn with_timepoint_interval(mut self, interval: Duration) -> Self {
        self.timepoint_interval_ms = Some(u64::try_from(interval.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Add an XY position.
    pub fn with_position(mut self, position: StagePosition) -> Self {
        self.positions.push(position);
        self
    }

    /// Replace the XY position list.
    pub fn with_positions(mut self, positions: Vec<StagePosition>) -> Self {
        self.positions = positions;
        self
    }

    /// Set the acquisition mode.
    pub fn with_mode(mut self, mode: AcquisitionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Engage autofocus for the run.
    pub fn with_autofocus(mut self, autofocus: bool) -> Self {
        self.autofocus = autofocus;
        self
    }

    /// Park the coarse focus stage before the run.
    pub fn with_coarse_focus(mut self, position_mm: f64) -> Self {
        self.coarse_focus_mm = Some(position_mm);
        self
    }

    /// Fire `count` throwaway exposures before the run proper.
    pub fn with_camera_preframes(mut self, count: u32) -> Self {
        self.camera_preframes = count;
        self
    }

    /// Exposure as a duration.
    pub fn exposure(&self) -> Duration {
        Duration::from_micros(self.exposure_us)
    }

    /// Timepoint interval as a duration.
    pub fn timepoint_interval(&self) -> Option<Duration> {
        self.timepoint_interval_ms.map(Duration::from_millis)
    }

    /// Parse a request from TOML.
    pub fn from_toml_str(text: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn z_range_counts_inclusive_slices() {
        let z = ZRange::new(0.0, 10.0, 1.0);
        let positions = z.positions().unwrap();
        assert_eq!(positions.len(), 11);
        assert_eq!(positions[0], 0.0);
        assert_eq!(positions[10], 10.0);
    }

    #[test]
    fn z_range_tolerates_float_rounding() {
        let z = ZRange::new(0.0, 0.3, 0.1);
        assert_eq!(z.positions().unwrap().len(), 4);
    }

    #[test]
    fn z_range_rejects_bad_input() {
        assert!(ZRange::new(0.0, 10.0, 0.0).positions().is_err());
        assert!(ZRange::new(10.0, 0.0, 1.0).positions().is_err());
        assert!(ZRange::new(f64::NAN, 0.0, 1.0).positions().is_err());
    }

    #[test]
    fn request_parses_from_toml() {
        let text = r#"
            timepoints = 2
            exposure_us = 10000
            timepoint_interval_ms = 500

            [z]
            start_um = 0.0
            stop_um = 10.0
            step_um = 1.0

            [[channels]]
            laser_nm = 488
            power_pct = 20.0
            filter = "ET525/50M"

            [[angles]]
            angle_deg = 0.0
            mirrors = { scan_deg = 0.0, tilt_deg = 0.0 }
        "#;
        let request = AcquisitionRequest::from_toml_str(text).unwrap();
        assert_eq!(request.channels.len(), 1);
        assert_eq!(request.exposure(), Duration::from_millis(10));
        assert_eq!(request.timepoint_interval(), Some(Duration::from_millis(500)));
        assert_eq!(request.mode, AcquisitionMode::Volume);
        assert!(request.positions.is_empty());
        assert_eq!(request.camera_preframes, 0);
    }

    #[test]
    fn builder_collects_axes() {
        let request = AcquisitionRequest::new(Duration::from_millis(5))
            .with_channel(Channel::new(488, 10.0, "ET525/50M"))
            .with_channel(Channel::new(561, 10.0, "ET600/50M"))
            .with_angle(ProjectionAngle::new(0.0))
            .with_timepoints(3);
        assert_eq!(request.channels.len(), 2);
        assert_eq!(request.angles[0].mirrors.tilt_deg, 0.0);
        assert_eq!(request.timepoints, 3);
        assert_eq!(request.exposure_us, 5000);
    }
}
