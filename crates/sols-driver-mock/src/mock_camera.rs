//! Mock triggered camera.
//!
//! Each trigger produces exactly one frame. The capture timestamp is read from
//! the shared clock when the exposure starts, and the frame is pushed into the
//! attached sink after exposure plus readout.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Deserialize;
use sols_core::capabilities::{Device, DeviceHandle, FrameTrigger};
use sols_core::clock::{Clock, MonotonicClock};
use sols_core::device::{Capability, DeviceDescriptor, DeviceKind};
use sols_core::driver::{BuildContext, DeviceComponents, DeviceSpec, DriverFactory};
use sols_core::frame::{CameraFrame, TriggerRecord};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::common::{Actuation, CommonParams, ErrorConfig, MockMode, TimingConfig};
use crate::pattern::{generate_sheet_frame, to_le_bytes};

// =============================================================================
// MockCameraFactory - DriverFactory implementation
// =============================================================================

/// Configuration for MockCamera driver
#[derive(Debug, Clone, Deserialize)]
pub struct MockCameraConfig {
    /// Sensor width in pixels
    #[serde(default = "default_width")]
    pub width: u32,
    /// Sensor height in pixels
    #[serde(default = "default_height")]
    pub height: u32,
    /// Mode, latency and faults. Latency is the readout time.
    #[serde(flatten)]
    pub common: CommonParams,
}

fn default_width() -> u32 {
    512
}

fn default_height() -> u32 {
    512
}

/// Factory for creating MockCamera instances.
pub struct MockCameraFactory;

static MOCK_CAMERA_KINDS: &[DeviceKind] = &[DeviceKind::Camera];
static MOCK_CAMERA_CAPABILITIES: &[Capability] = &[Capability::Triggerable];

impl DriverFactory for MockCameraFactory {
    fn driver_type(&self) -> &'static str {
        "mock_camera"
    }

    fn name(&self) -> &'static str {
        "Mock Camera"
    }

    fn kinds(&self) -> &'static [DeviceKind] {
        MOCK_CAMERA_KINDS
    }

    fn capabilities(&self) -> &'static [Capability] {
        MOCK_CAMERA_CAPABILITIES
    }

    fn validate(&self, params: &toml::Value) -> Result<()> {
        let cfg: MockCameraConfig = params.clone().try_into()?;
        if cfg.width == 0 || cfg.height == 0 || cfg.width > 8192 || cfg.height > 8192 {
            return Err(anyhow!(
                "Invalid sensor size {}x{} (1..=8192 per side)",
                cfg.width,
                cfg.height
            ));
        }
        Ok(())
    }

    fn build(&self, spec: DeviceSpec, ctx: BuildContext) -> BoxFuture<'static, Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg: MockCameraConfig = spec.params.clone().try_into()?;
            let camera = MockCamera::builder(cfg.width, cfg.height)
                .clock(ctx.clock)
                .actuation(cfg.common.actuation("mock_camera", spec.settle))
                .build();

            let descriptor = DeviceDescriptor::new(spec.id, DeviceKind::Camera)
                .with_capability(Capability::Triggerable)
                .with_settle(spec.settle)
                .with_tolerance(spec.tolerance)
                .with_sensor(cfg.height, cfg.width);

            Ok(DeviceComponents {
                descriptor,
                handle: DeviceHandle::Camera(Arc::new(camera)),
            })
        })
    }
}

// =============================================================================
// Builder Pattern
// =============================================================================

/// Builder for MockCamera
pub struct MockCameraBuilder {
    width: u32,
    height: u32,
    clock: Option<Arc<dyn Clock>>,
    actuation: Actuation,
}

impl MockCameraBuilder {
    /// Start a builder for a `width` x `height` sensor.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            clock: None,
            actuation: Actuation::new(
                "mock_camera",
                MockMode::Instant,
                TimingConfig::camera(),
                ErrorConfig::none(),
            ),
        }
    }

    /// Shared clock for capture timestamps.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Mode, readout and error injection.
    pub fn actuation(mut self, actuation: Actuation) -> Self {
        self.actuation = actuation;
        self
    }

    /// Build the camera. Without an explicit clock, a fresh one starts now.
    pub fn build(self) -> MockCamera {
        MockCamera {
            width: self.width,
            height: self.height,
            clock: self
                .clock
                .unwrap_or_else(|| Arc::new(MonotonicClock::new())),
            sink: Mutex::new(None),
            sequence: AtomicU64::new(0),
            actuation: self.actuation,
        }
    }
}

// =============================================================================
// MockCamera
// =============================================================================

/// Mock camera producing one synthetic frame per trigger.
pub struct MockCamera {
    width: u32,
    height: u32,
    clock: Arc<dyn Clock>,
    sink: Mutex<Option<mpsc::Sender<CameraFrame>>>,
    sequence: AtomicU64,
    actuation: Actuation,
}

impl MockCamera {
    /// Create a builder.
    pub fn builder(width: u32, height: u32) -> MockCameraBuilder {
        MockCameraBuilder::new(width, height)
    }

    /// Frames captured so far.
    pub fn frame_count(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    /// Readout time after each exposure in timed modes.
    fn readout(&self) -> Duration {
        let timing = self.actuation.timing();
        timing.latency.max(timing.readout)
    }
}

#[async_trait]
impl Device for MockCamera {
    async fn check_ready(&self) -> Result<()> {
        if self.sink.lock().is_none() {
            return Err(anyhow!("Camera has no frame sink attached"));
        }
        Ok(())
    }

    async fn reset_fault(&self) -> Result<()> {
        self.actuation.reset();
        Ok(())
    }
}

#[async_trait]
impl FrameTrigger for MockCamera {
    fn attach_sink(&self, sink: mpsc::Sender<CameraFrame>) {
        *self.sink.lock() = Some(sink);
    }

    async fn trigger(&self, record: TriggerRecord) -> Result<()> {
        self.actuation.check("trigger")?;
        let stall = self.actuation.stall_for("trigger");
        if !stall.is_zero() {
            tokio::time::sleep(stall).await;
        }

        let capture_timestamp = self.clock.now();
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(
            "MockCamera: Exposing frame {} for {:?} at {:?}",
            sequence,
            record.exposure,
            capture_timestamp
        );

        if self.actuation.mode().is_timed() {
            tokio::time::sleep(record.exposure + self.readout()).await;
        }

        let pixels = generate_sheet_frame(self.width, self.height, sequence, &record.state);
        let frame = CameraFrame {
            sequence,
            capture_timestamp,
            height: self.height,
            width: self.width,
            buffer: Bytes::from(to_le_bytes(&pixels)),
            trigger: record,
        };

        let sink = self.sink.lock().clone();
        match sink {
            Some(tx) => {
                if tx.send(frame).await.is_err() {
                    tracing::warn!("MockCamera: Frame sink closed, dropping frame {}", sequence);
                }
            }
            None => tracing::warn!("MockCamera: No frame sink, dropping frame {}", sequence),
        }
        Ok(())
    }
}
