//! Timing plan data model.
//!
//! A [`TimingPlan`] is an immutable, ordered list of [`PlanStep`]s produced by
//! the plan compiler. Each step ties one logical acquisition coordinate to a
//! target device-state vector, a scheduled exposure offset from run start, a
//! tolerance window and the device commands that realise it.
//!
//! Plans are compared bit-for-bit in reproducibility checks, so everything in
//! here uses ordered containers and integer durations.

use crate::device::{DeviceDescriptor, DeviceId, DeviceTarget, LaserState, MirrorAngles};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Logical acquisition coordinate of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct LogicalCoordinate {
    /// Timepoint index
    pub timepoint: u32,
    /// XY position index
    pub position: u32,
    /// Z slice index
    pub z_index: u32,
    /// Projection angle index
    pub angle_index: u32,
    /// Channel index
    pub channel_index: u32,
}

impl fmt::Display for LogicalCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(t{} p{} z{} a{} c{})",
            self.timepoint, self.position, self.z_index, self.angle_index, self.channel_index
        )
    }
}

/// XY stage position in millimetres.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct XyPosition {
    /// X (mm)
    pub x_mm: f64,
    /// Y (mm)
    pub y_mm: f64,
}

/// Physical state the instrument must be in while a step exposes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeviceStateVector {
    /// Active laser line (nm)
    pub laser_nm: u32,
    /// Active laser output
    pub laser: LaserState,
    /// Emission filter position
    pub filter_position: u32,
    /// Scan mirror pair
    pub mirrors: MirrorAngles,
    /// Fast focus actuator position (um)
    pub z_um: f64,
    /// XY stage position, when the run visits positions
    pub xy: Option<XyPosition>,
}

impl Default for DeviceStateVector {
    fn default() -> Self {
        Self {
            laser_nm: 0,
            laser: LaserState::OFF,
            filter_position: 0,
            mirrors: MirrorAngles::default(),
            z_um: 0.0,
            xy: None,
        }
    }
}

/// What a step asks of one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum StepAction {
    /// Drive the device to a target state
    Configure {
        /// Target state
        target: DeviceTarget,
    },
    /// Fire a camera exposure
    Trigger,
}

/// One device command within a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCommand {
    /// Target device
    pub device: DeviceId,
    /// Requested action
    pub action: StepAction,
    /// Issue time relative to run start
    pub issue_offset: Duration,
    /// Nominal time from issue to completion
    pub expected: Duration,
}

impl StepCommand {
    /// Latest acceptable completion, relative to the planned issue time.
    pub fn completion_budget(&self, tolerance: Duration) -> Duration {
        self.expected.saturating_add(tolerance)
    }
}

/// Whether a step's frame is part of the dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Exposure at a logical coordinate
    #[default]
    Acquire,
    /// Camera-only exposure that warms the sensor up; its frame is discarded
    Preframe,
}

/// One scheduled step of the plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    /// Position in the plan
    pub index: usize,
    /// Acquisition or preframe
    #[serde(default)]
    pub kind: StepKind,
    /// Logical coordinate; meaningless for preframes, see [`PlanStep::logical`]
    pub coordinate: LogicalCoordinate,
    /// Target state during exposure
    pub state: DeviceStateVector,
    /// Exposure start relative to run start
    pub offset: Duration,
    /// Exposure duration
    pub exposure: Duration,
    /// Tolerance window around `offset`
    pub tolerance: Duration,
    /// Device commands, configure commands first, camera trigger last
    pub commands: Vec<StepCommand>,
}

impl PlanStep {
    /// Whether the step only warms the camera up.
    pub fn is_preframe(&self) -> bool {
        self.kind == StepKind::Preframe
    }

    /// Logical coordinate, `None` for preframes.
    pub fn logical(&self) -> Option<LogicalCoordinate> {
        match self.kind {
            StepKind::Acquire => Some(self.coordinate),
            StepKind::Preframe => None,
        }
    }

    /// Whether the step commands `device`.
    pub fn touches(&self, device: &DeviceId) -> bool {
        self.commands.iter().any(|c| &c.device == device)
    }

    /// Earliest issue offset among the step's commands.
    pub fn first_issue(&self) -> Duration {
        self.commands
            .iter()
            .map(|c| c.issue_offset)
            .min()
            .unwrap_or(self.offset)
    }

    /// Whether `timestamp` (in plan time) falls inside `offset ± tolerance`.
    pub fn window_contains(&self, timestamp: Duration) -> bool {
        let start = self.offset.saturating_sub(self.tolerance);
        let end = self.offset.saturating_add(self.tolerance);
        timestamp >= start && timestamp <= end
    }
}

/// Immutable, compiled acquisition schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingPlan {
    /// Steps in issue order
    pub steps: Vec<PlanStep>,
    /// Camera that exposes every step
    pub camera: DeviceId,
    /// Largest tolerance across steps; sizes the correlator window
    pub max_tolerance: Duration,
    /// Offset at which the last exposure ends
    pub duration: Duration,
}

impl TimingPlan {
    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the plan has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Step by index.
    pub fn step(&self, index: usize) -> Option<&PlanStep> {
        self.steps.get(index)
    }

    /// Every device the plan commands, sorted by id.
    pub fn devices(&self) -> Vec<DeviceId> {
        let mut devices: Vec<DeviceId> = self
            .steps
            .iter()
            .flat_map(|step| step.commands.iter().map(|c| c.device.clone()))
            .collect();
        devices.sort();
        devices.dedup();
        devices
    }

    /// Commands flattened into issue order: `(step index, command index)`,
    /// sorted by issue offset, then step index, then position within the step.
    pub fn issue_order(&self) -> Vec<(usize, usize)> {
        let mut order: Vec<(Duration, usize, usize)> = self
            .steps
            .iter()
            .flat_map(|step| {
                step.commands
                    .iter()
                    .enumerate()
                    .map(move |(i, c)| (c.issue_offset, step.index, i))
            })
            .collect();
        order.sort();
        order.into_iter().map(|(_, s, c)| (s, c)).collect()
    }

    /// Hex sha256 over the canonical JSON encoding of the plan.
    pub fn fingerprint(&self) -> Result<String, serde_json::Error> {
        let bytes = serde_json::to_vec(self)?;
        let digest = Sha256::digest(&bytes);
        Ok(digest.iter().map(|b| format!("{:02x}", b)).collect())
    }

    /// Check the scheduling invariants against device settle times.
    ///
    /// Returns one message per violation: offsets must be non-decreasing, and
    /// two steps touching the same device must be at least that device's
    /// settle time apart.
    pub fn invariant_violations(&self, descriptors: &[DeviceDescriptor]) -> Vec<String> {
        let settle: BTreeMap<&DeviceId, Duration> =
            descriptors.iter().map(|d| (&d.id, d.min_settle)).collect();
        let mut violations = Vec::new();
        let mut last_touch: BTreeMap<&DeviceId, &PlanStep> = BTreeMap::new();

        for pair in self.steps.windows(2) {
            if pair[1].offset < pair[0].offset {
                violations.push(format!(
                    "step {} offset {:?} precedes step {} offset {:?}",
                    pair[1].index, pair[1].offset, pair[0].index, pair[0].offset
                ));
            }
        }

        for step in &self.steps {
            for command in &step.commands {
                if let Some(previous) = last_touch.get(&command.device) {
                    let min = settle.get(&command.device).copied().unwrap_or_default();
                    let gap = step.offset.saturating_sub(previous.offset);
                    if gap < min {
                        violations.push(format!(
                            "'{}' steps {} and {} are {:?} apart, settle is {:?}",
                            command.device, previous.index, step.index, gap, min
                        ));
                    }
                }
                last_touch.insert(&command.device, step);
            }
        }
        violations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(index: usize, offset_ms: u64, device: &str) -> PlanStep {
        PlanStep {
            index,
            kind: StepKind::Acquire,
            coordinate: LogicalCoordinate {
                z_index: index as u32,
                ..Default::default()
            },
            state: DeviceStateVector::default(),
            offset: Duration::from_millis(offset_ms),
            exposure: Duration::from_millis(5),
            tolerance: Duration::from_millis(1),
            commands: vec![StepCommand {
                device: DeviceId::from(device),
                action: StepAction::Trigger,
                issue_offset: Duration::from_millis(offset_ms),
                expected: Duration::from_millis(5),
            }],
        }
    }

    fn plan(steps: Vec<PlanStep>) -> TimingPlan {
        TimingPlan {
            steps,
            camera: DeviceId::from("camera"),
            max_tolerance: Duration::from_millis(1),
            duration: Duration::from_millis(100),
        }
    }

    #[test]
    fn settle_violation_detected() {
        let camera = DeviceDescriptor::new("camera", crate::device::DeviceKind::Camera)
            .with_settle(Duration::from_millis(10));
        let good = plan(vec![step(0, 0, "camera"), step(1, 10, "camera")]);
        assert!(good.invariant_violations(&[camera.clone()]).is_empty());

        let bad = plan(vec![step(0, 0, "camera"), step(1, 9, "camera")]);
        assert_eq!(bad.invariant_violations(&[camera]).len(), 1);
    }

    #[test]
    fn decreasing_offsets_detected() {
        let bad = plan(vec![step(0, 10, "a"), step(1, 5, "b")]);
        let violations = bad.invariant_violations(&[]);
        assert!(violations.iter().any(|v| v.contains("precedes")));
    }

    #[test]
    fn fingerprint_is_stable() {
        let a = plan(vec![step(0, 0, "camera"), step(1, 10, "camera")]);
        let b = a.clone();
        assert_eq!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
        assert_eq!(a.fingerprint().unwrap().len(), 64);
    }

    #[test]
    fn window_bounds_are_inclusive() {
        let s = step(0, 10, "camera");
        assert!(s.window_contains(Duration::from_millis(9)));
        assert!(s.window_contains(Duration::from_millis(11)));
        assert!(!s.window_contains(Duration::from_micros(11_001)));
    }

    #[test]
    fn preframes_have_no_logical_coordinate() {
        let mut s = step(0, 10, "camera");
        assert_eq!(s.logical(), Some(s.coordinate));
        s.kind = StepKind::Preframe;
        assert!(s.is_preframe());
        assert_eq!(s.logical(), None);
    }

    #[test]
    fn kind_defaults_to_acquire_when_absent() {
        let mut json = serde_json::to_value(step(0, 10, "camera")).unwrap();
        json.as_object_mut().unwrap().remove("kind");
        let parsed: PlanStep = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.kind, StepKind::Acquire);
    }

    #[test]
    fn coordinate_display() {
        let c = LogicalCoordinate {
            timepoint: 1,
            position: 0,
            z_index: 3,
            angle_index: 2,
            channel_index: 1,
        };
        assert_eq!(c.to_string(), "(t1 p0 z3 a2 c1)");
    }
}
