//! Capability traits for instrument devices.
//!
//! Each device implements [`Device`] plus exactly one capability trait. The
//! plan compiler and dispatcher never branch on device identity; they program
//! against the closed [`DeviceHandle`] set instead.
//!
//! # Capability Traits
//!
//! - [`Positioner`] - single-axis stages (coarse focus, fast focus piezo)
//! - [`PlanarPositioner`] - XY sample stage
//! - [`ScanMirror`] - light-sheet scan mirror pair
//! - [`FilterSelector`] - emission filter wheel
//! - [`Illumination`] - excitation lasers
//! - [`FocusLock`] - hardware autofocus
//! - [`FrameTrigger`] - camera
//!
//! # Completion Semantics
//!
//! Trait methods resolve when the hardware reports completion (motion settled,
//! exposure finished). The Device Abstraction Layer runs them in the
//! background and turns the outcome into a `DeviceEvent`, so the caller of
//! `configure`/`trigger` never blocks.
//!
//! # Example
//!
//! ```rust,ignore
//! use sols_core::capabilities::{DeviceHandle, Positioner};
//! use sols_core::device::DeviceTarget;
//!
//! let handle = DeviceHandle::Positioner(piezo);
//! assert!(handle.accepts(&DeviceTarget::Position { value: 10.0 }));
//! handle.configure(&DeviceTarget::Position { value: 10.0 }).await?;
//! ```

use crate::device::{DeviceTarget, LaserState, MirrorAngles};
use crate::frame::{CameraFrame, TriggerRecord};
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

// =============================================================================
// Capability Traits
// =============================================================================

/// Behaviour shared by every device.
#[async_trait]
pub trait Device: Send + Sync {
    /// Readiness check run at arm time.
    async fn check_ready(&self) -> Result<()> {
        Ok(())
    }

    /// Clear a latched hardware fault.
    async fn reset_fault(&self) -> Result<()> {
        Ok(())
    }
}

/// Single-axis absolute positioning.
#[async_trait]
pub trait Positioner: Device {
    /// Move to an absolute position and wait until settled.
    async fn move_abs(&self, position: f64) -> Result<()>;

    /// Current position.
    async fn position(&self) -> Result<f64>;
}

/// Two-axis absolute positioning in millimetres.
#[async_trait]
pub trait PlanarPositioner: Device {
    /// Move to (x, y) and wait until settled.
    async fn move_xy(&self, x_mm: f64, y_mm: f64) -> Result<()>;

    /// Current (x, y).
    async fn position_xy(&self) -> Result<(f64, f64)>;
}

/// Light-sheet scan mirror pair.
#[async_trait]
pub trait ScanMirror: Device {
    /// Apply mirror angles and wait until settled.
    async fn set_angles(&self, angles: MirrorAngles) -> Result<()>;

    /// Current angles.
    async fn angles(&self) -> Result<MirrorAngles>;
}

/// Discrete filter selector.
#[async_trait]
pub trait FilterSelector: Device {
    /// Rotate to a position and wait until settled.
    async fn select(&self, position: u32) -> Result<()>;

    /// Current position.
    async fn current(&self) -> Result<u32>;
}

/// Excitation source.
#[async_trait]
pub trait Illumination: Device {
    /// Apply emission state and power.
    async fn apply(&self, state: LaserState) -> Result<()>;

    /// Current state.
    async fn state(&self) -> Result<LaserState>;
}

/// Hardware autofocus.
#[async_trait]
pub trait FocusLock: Device {
    /// Engage or release the focus hold.
    async fn set_engaged(&self, engaged: bool) -> Result<()>;

    /// Whether the sensor currently detects a sample interface.
    async fn sample_present(&self) -> Result<bool>;
}

/// Triggered camera.
///
/// Frames are pushed into the sink attached by the Device Abstraction Layer,
/// in capture order, one per exposure.
#[async_trait]
pub trait FrameTrigger: Device {
    /// Attach the frame sink. Replaces any previous sink.
    fn attach_sink(&self, sink: mpsc::Sender<CameraFrame>);

    /// Expose once using the given trigger record; resolves after readout.
    async fn trigger(&self, record: TriggerRecord) -> Result<()>;
}

// =============================================================================
// Closed Device Set
// =============================================================================

/// A device viewed through its single capability.
#[derive(Clone)]
pub enum DeviceHandle {
    /// Single-axis stage
    Positioner(Arc<dyn Positioner>),
    /// XY stage
    Planar(Arc<dyn PlanarPositioner>),
    /// Scan mirror pair
    Mirror(Arc<dyn ScanMirror>),
    /// Filter wheel
    Filter(Arc<dyn FilterSelector>),
    /// Laser
    Laser(Arc<dyn Illumination>),
    /// Autofocus
    Autofocus(Arc<dyn FocusLock>),
    /// Camera
    Camera(Arc<dyn FrameTrigger>),
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DeviceHandle::{}", self.variant())
    }
}

impl DeviceHandle {
    /// Variant name.
    pub fn variant(&self) -> &'static str {
        match self {
            DeviceHandle::Positioner(_) => "Positioner",
            DeviceHandle::Planar(_) => "Planar",
            DeviceHandle::Mirror(_) => "Mirror",
            DeviceHandle::Filter(_) => "Filter",
            DeviceHandle::Laser(_) => "Laser",
            DeviceHandle::Autofocus(_) => "Autofocus",
            DeviceHandle::Camera(_) => "Camera",
        }
    }

    /// Whether `configure` can apply this target to this device.
    pub fn accepts(&self, target: &DeviceTarget) -> bool {
        matches!(
            (self, target),
            (DeviceHandle::Positioner(_), DeviceTarget::Position { .. })
                | (DeviceHandle::Planar(_), DeviceTarget::PlanarPosition { .. })
                | (DeviceHandle::Mirror(_), DeviceTarget::Mirrors(_))
                | (DeviceHandle::Filter(_), DeviceTarget::Filter { .. })
                | (DeviceHandle::Laser(_), DeviceTarget::Laser(_))
                | (DeviceHandle::Autofocus(_), DeviceTarget::FocusLock { .. })
        )
    }

    /// Apply a target. Resolves on completion.
    pub async fn configure(&self, target: &DeviceTarget) -> Result<()> {
        match (self, target) {
            (DeviceHandle::Positioner(p), DeviceTarget::Position { value }) => {
                p.move_abs(*value).await
            }
            (DeviceHandle::Planar(p), DeviceTarget::PlanarPosition { x_mm, y_mm }) => {
                p.move_xy(*x_mm, *y_mm).await
            }
            (DeviceHandle::Mirror(m), DeviceTarget::Mirrors(angles)) => m.set_angles(*angles).await,
            (DeviceHandle::Filter(f), DeviceTarget::Filter { position }) => {
                f.select(*position).await
            }
            (DeviceHandle::Laser(l), DeviceTarget::Laser(state)) => l.apply(*state).await,
            (DeviceHandle::Autofocus(a), DeviceTarget::FocusLock { engaged }) => {
                a.set_engaged(*engaged).await
            }
            (handle, target) => bail!(
                "{} cannot apply {}",
                handle.variant(),
                target.operation()
            ),
        }
    }

    /// Trigger an exposure. Only cameras accept triggers.
    pub async fn trigger(&self, record: TriggerRecord) -> Result<()> {
        match self {
            DeviceHandle::Camera(c) => c.trigger(record).await,
            other => bail!("{} is not triggerable", other.variant()),
        }
    }

    /// Driver readiness check.
    pub async fn check_ready(&self) -> Result<()> {
        match self {
            DeviceHandle::Positioner(d) => d.check_ready().await,
            DeviceHandle::Planar(d) => d.check_ready().await,
            DeviceHandle::Mirror(d) => d.check_ready().await,
            DeviceHandle::Filter(d) => d.check_ready().await,
            DeviceHandle::Laser(d) => d.check_ready().await,
            DeviceHandle::Autofocus(d) => d.check_ready().await,
            DeviceHandle::Camera(d) => d.check_ready().await,
        }
    }

    /// Driver fault reset.
    pub async fn reset_fault(&self) -> Result<()> {
        match self {
            DeviceHandle::Positioner(d) => d.reset_fault().await,
            DeviceHandle::Planar(d) => d.reset_fault().await,
            DeviceHandle::Mirror(d) => d.reset_fault().await,
            DeviceHandle::Filter(d) => d.reset_fault().await,
            DeviceHandle::Laser(d) => d.reset_fault().await,
            DeviceHandle::Autofocus(d) => d.reset_fault().await,
            DeviceHandle::Camera(d) => d.reset_fault().await,
        }
    }
}
