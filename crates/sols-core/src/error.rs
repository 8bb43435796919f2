//! Error types for the acquisition sequencer.
//!
//! Every failure the sequencer can report has its own `thiserror` enum, and
//! [`SequencerError`] consolidates them for callers that only need one type.
//!
//! ## Error Hierarchy
//!
//! - **`DriverError`**: raised by a device driver (mock or real). Carries the
//!   driver type and a [`DriverErrorKind`].
//! - **`DalError`**: raised synchronously by the Device Abstraction Layer when a
//!   command cannot even be issued (unknown device, device busy or faulted,
//!   capability mismatch, fault reset during a run).
//! - **`CompilationError`**: the acquisition request cannot be turned into a
//!   timing plan. Surfaced before the run arms; the caller may resubmit.
//! - **`PreflightError`**: a device is faulted, busy or not ready at arm time.
//!   The run stays idle.
//! - **`RunError`**: fatal in-run errors (`TimingViolation`, `DeviceFault`,
//!   `Aborted`). Every variant carries the logical coordinate of the offending
//!   step and the device identity.
//!
//! Correlation ambiguity is deliberately not an error: ambiguous frames are
//! still emitted, flagged with a `CorrelationIssue`.

use crate::device::{DeviceId, DeviceKind, DeviceStatus};
use crate::plan::LogicalCoordinate;
use std::time::Duration;
use thiserror::Error;

// =============================================================================
// Driver Errors
// =============================================================================

/// Broad classification of driver failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    Initialization,
    Configuration,
    Communication,
    Hardware,
    Timeout,
    InvalidParameter,
    Unknown,
}

impl std::fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DriverErrorKind::Initialization => "initialization",
            DriverErrorKind::Configuration => "configuration",
            DriverErrorKind::Communication => "communication",
            DriverErrorKind::Hardware => "hardware",
            DriverErrorKind::Timeout => "timeout",
            DriverErrorKind::InvalidParameter => "invalid_parameter",
            DriverErrorKind::Unknown => "unknown",
        };
        write!(f, "{}", label)
    }
}

/// Error reported by a device driver.
#[derive(Error, Debug, Clone)]
#[error("Driver '{driver_type}' {kind} error: {message}")]
pub struct DriverError {
    /// Driver type name (e.g. `mock_galvo`)
    pub driver_type: String,
    /// Failure class
    pub kind: DriverErrorKind,
    /// Human-readable detail
    pub message: String,
}

impl DriverError {
    /// Create a driver error.
    pub fn new(
        driver_type: impl Into<String>,
        kind: DriverErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            driver_type: driver_type.into(),
            kind,
            message: message.into(),
        }
    }
}

// =============================================================================
// Device Abstraction Layer Errors
// =============================================================================

/// A command was refused by the Device Abstraction Layer before reaching the driver.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DalError {
    /// No device is registered under this id.
    #[error("Unknown device '{0}'")]
    UnknownDevice(DeviceId),

    /// The device already has a pending command.
    #[error("Device '{device}' is busy ({status})")]
    Busy {
        /// Target device
        device: DeviceId,
        /// Status at the time of the refusal
        status: DeviceStatus,
    },

    /// The device is latched in fault and must be reset explicitly.
    #[error("Device '{0}' is faulted")]
    Faulted(DeviceId),

    /// The device does not implement the capability the command needs.
    #[error("Device '{device}' does not support {operation}")]
    Unsupported {
        /// Target device
        device: DeviceId,
        /// Operation that was attempted
        operation: String,
    },

    /// Fault reset is only accepted while no plan step of a run has been issued.
    #[error("Fault reset of '{0}' rejected: plan steps have already been issued")]
    ResetRejected(DeviceId),

    /// The driver refused the fault reset.
    #[error("Fault reset of '{device}' failed: {message}")]
    ResetFailed {
        /// Target device
        device: DeviceId,
        /// Driver detail
        message: String,
    },

    /// A device with this id is already registered.
    #[error("Device '{0}' is already registered")]
    Duplicate(DeviceId),
}

// =============================================================================
// Compilation Errors
// =============================================================================

/// The acquisition request cannot be compiled into a timing plan.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompilationError {
    /// The request names no channels.
    #[error("Acquisition request has no channels")]
    NoChannels,

    /// The request names no projection angles.
    #[error("Acquisition request has no projection angles")]
    NoAngles,

    /// Timepoint count must be at least one.
    #[error("Acquisition request has zero timepoints")]
    NoTimepoints,

    /// Exposure (dwell) must be strictly positive.
    #[error("Non-positive dwell time: exposure of {exposure_us} us")]
    NonPositiveDwell {
        /// Requested exposure
        exposure_us: u64,
    },

    /// Z range is malformed (non-finite, reversed, or zero step).
    #[error("Invalid z range: {0}")]
    InvalidZRange(String),

    /// A target lies outside a device's declared travel range.
    #[error("{what} = {value} on '{device}' outside travel range [{min}, {max}]")]
    OutOfRange {
        /// Device that would be commanded
        device: DeviceId,
        /// Name of the quantity (e.g. `z_um`)
        what: String,
        /// Requested value
        value: f64,
        /// Range minimum
        min: f64,
        /// Range maximum
        max: f64,
    },

    /// The plan needs a device kind that is not registered.
    #[error("No {0} device is registered")]
    MissingDevice(DeviceKind),

    /// More than one device of a kind that must be unique.
    #[error("Multiple {kind} devices registered: {devices:?}")]
    AmbiguousDevice {
        /// Device kind
        kind: DeviceKind,
        /// Candidates found
        devices: Vec<DeviceId>,
    },

    /// A device lacks the capability the request needs.
    #[error("Device '{device}' lacks capability {capability}")]
    MissingCapability {
        /// Device
        device: DeviceId,
        /// Missing capability name
        capability: String,
    },

    /// No laser provides the requested line.
    #[error("No laser provides the {0} nm line")]
    UnsupportedLaserLine(u32),

    /// Laser power outside the device's accepted range.
    #[error("Laser power {power_pct}% on '{device}' outside 0..={max_pct}%")]
    InvalidPower {
        /// Laser device
        device: DeviceId,
        /// Requested power
        power_pct: f64,
        /// Maximum accepted power
        max_pct: f64,
    },

    /// The filter selector has no position with this name.
    #[error("Filter '{name}' not installed in '{device}'")]
    UnknownFilter {
        /// Filter selector device
        device: DeviceId,
        /// Requested filter name
        name: String,
    },

    /// The camera frame buffer for the run would exceed the configured budget.
    #[error("Frame buffer of {bytes} bytes exceeds limit of {limit} bytes")]
    BufferExceeded {
        /// Bytes required
        bytes: u64,
        /// Configured limit
        limit: u64,
    },

    /// A z scan was requested on the fast focus actuator while autofocus holds it.
    #[error("Cannot scan z on '{0}' while autofocus is engaged")]
    AutofocusConflict(DeviceId),

    /// Plan duration cannot be represented.
    #[error("Plan offset overflow at step {0}")]
    OffsetOverflow(usize),

    /// An axis has more entries than a logical coordinate can index.
    #[error("Too many {axis} entries ({count}) for a logical coordinate")]
    AxisTooLong {
        /// Axis name
        axis: String,
        /// Entries requested
        count: usize,
    },
}

// =============================================================================
// Preflight Errors
// =============================================================================

/// A device failed the arm-time status check.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PreflightError {
    /// Device is latched in fault.
    #[error("Device '{0}' is faulted")]
    Faulted(DeviceId),

    /// Device still has a pending command.
    #[error("Device '{device}' is not idle ({status})")]
    NotIdle {
        /// Device
        device: DeviceId,
        /// Observed status
        status: DeviceStatus,
    },

    /// Device is not registered or unreachable.
    #[error("Device '{0}' is unreachable")]
    Unreachable(DeviceId),

    /// The driver's own readiness check failed.
    #[error("Device '{device}' not ready: {reason}")]
    NotReady {
        /// Device
        device: DeviceId,
        /// Driver detail
        reason: String,
    },
}

// =============================================================================
// In-run Errors
// =============================================================================

/// Fatal errors that terminate a run in the `faulted` state.
///
/// Every variant identifies the step (index and logical coordinate) and the
/// device involved.
#[derive(Error, Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunError {
    /// A device did not reach ready within its scheduled tolerance.
    #[error("Timing violation at step {step} {coordinate} on '{device}': {detail}")]
    TimingViolation {
        /// Step index in the plan
        step: usize,
        /// Logical coordinate of the step
        coordinate: LogicalCoordinate,
        /// Offending device
        device: DeviceId,
        /// Lateness relative to the deadline
        late_by: Duration,
        /// Human-readable detail
        detail: String,
    },

    /// A device reported a hardware fault.
    #[error("Device fault at step {step} {coordinate} on '{device}': {message}")]
    DeviceFault {
        /// Step index in the plan
        step: usize,
        /// Logical coordinate of the step
        coordinate: LogicalCoordinate,
        /// Offending device
        device: DeviceId,
        /// Driver detail
        message: String,
    },

    /// The operator aborted the run.
    #[error("Run aborted at step {step} {coordinate}")]
    Aborted {
        /// Next step that would have been issued
        step: usize,
        /// Logical coordinate of that step
        coordinate: LogicalCoordinate,
    },
}

impl RunError {
    /// Device named by the error, if any.
    pub fn device(&self) -> Option<&DeviceId> {
        match self {
            RunError::TimingViolation { device, .. } | RunError::DeviceFault { device, .. } => {
                Some(device)
            }
            RunError::Aborted { .. } => None,
        }
    }

    /// Step index named by the error.
    pub fn step(&self) -> usize {
        match self {
            RunError::TimingViolation { step, .. }
            | RunError::DeviceFault { step, .. }
            | RunError::Aborted { step, .. } => *step,
        }
    }

    /// Logical coordinate named by the error.
    pub fn coordinate(&self) -> &LogicalCoordinate {
        match self {
            RunError::TimingViolation { coordinate, .. }
            | RunError::DeviceFault { coordinate, .. }
            | RunError::Aborted { coordinate, .. } => coordinate,
        }
    }
}

// =============================================================================
// Consolidated Error
// =============================================================================

/// Convenience alias for results using the sequencer error type.
pub type AppResult<T> = std::result::Result<T, SequencerError>;

/// Primary error type of the sequencer.
#[derive(Error, Debug)]
pub enum SequencerError {
    /// Request could not be compiled.
    #[error("Compilation error: {0}")]
    Compilation(#[from] CompilationError),

    /// Arm-time device check failed.
    #[error("Preflight error: {0}")]
    Preflight(#[from] PreflightError),

    /// In-run fatal error.
    #[error(transparent)]
    Run(#[from] RunError),

    /// Device Abstraction Layer refused a command.
    #[error("Device layer error: {0}")]
    Dal(#[from] DalError),

    /// Driver failure outside a run.
    #[error(transparent)]
    Driver(#[from] DriverError),

    /// A control command is not valid in the current run state.
    #[error("Invalid run state transition: {from} -> {to}")]
    InvalidTransition {
        /// Current state
        from: String,
        /// Requested state
        to: String,
    },

    /// A control command needs a run but none is armed.
    #[error("No run is armed")]
    NoRun,

    /// Semantic configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// An internal channel closed unexpectedly.
    #[error("Channel closed: {0}")]
    ChannelClosed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_error_display() {
        let err = DriverError::new("mock_galvo", DriverErrorKind::Timeout, "no reply");
        assert_eq!(err.to_string(), "Driver 'mock_galvo' timeout error: no reply");
    }

    #[test]
    fn compilation_error_converts() {
        let err: SequencerError = CompilationError::NonPositiveDwell { exposure_us: 0 }.into();
        assert!(err.to_string().contains("Non-positive dwell"));
    }

    #[test]
    fn run_error_carries_coordinate_and_device() {
        let coordinate = LogicalCoordinate {
            timepoint: 0,
            position: 0,
            z_index: 5,
            angle_index: 0,
            channel_index: 0,
        };
        let err = RunError::DeviceFault {
            step: 5,
            coordinate,
            device: DeviceId::from("piezo"),
            message: "overcurrent".into(),
        };
        assert_eq!(err.device().map(|d| d.as_str()), Some("piezo"));
        assert_eq!(err.coordinate().z_index, 5);
        let text = err.to_string();
        assert!(text.contains("piezo"));
        assert!(text.contains("z5"));
    }

    #[test]
    fn dal_error_display() {
        let err = DalError::Busy {
            device: DeviceId::from("camera"),
            status: DeviceStatus::Triggered,
        };
        assert_eq!(err.to_string(), "Device 'camera' is busy (triggered)");
    }
}
