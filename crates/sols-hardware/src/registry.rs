//! Device Abstraction Layer.
//!
//! [`DeviceRegistry`] owns every device of the instrument: its descriptor,
//! its capability handle and its status. Commands are non-blocking. The
//! registry marks the device busy, spawns the driver call on the tokio
//! runtime and, once the driver resolves, posts a [`DeviceEvent`] into one
//! bounded, ordered event queue.
//!
//! # Invariants
//!
//! - A device has at most one pending command. A command to a device that is
//!   not idle is refused, so events of one device arrive in issue order.
//! - `Fault` is sticky. Only [`DeviceRegistry::fault_reset`] clears it, and
//!   only while no plan step of the active run has been issued.
//! - Frames from every registered camera are funnelled into one bounded
//!   frame queue.

use anyhow::{anyhow, Context, Result};
use parking_lot::{Mutex, RwLock};
use sols_core::capabilities::DeviceHandle;
use sols_core::clock::Clock;
use sols_core::config::QueueSettings;
use sols_core::device::{DeviceDescriptor, DeviceId, DeviceStatus, DeviceTarget};
use sols_core::driver::{BuildContext, DeviceComponents};
use sols_core::error::{DalError, PreflightError};
use sols_core::event::{CommandTicket, DeviceEvent, DeviceEventKind};
use sols_core::frame::{CameraFrame, TriggerRecord};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::HardwareConfig;
use crate::factory::FactoryTable;

// =============================================================================
// Registered Device (Internal)
// =============================================================================

struct RegisteredDevice {
    descriptor: DeviceDescriptor,
    handle: DeviceHandle,
}

#[derive(Debug, Default, Clone, Copy)]
struct RunGate {
    active: bool,
    issued: bool,
}

struct Inner {
    devices: RwLock<BTreeMap<DeviceId, RegisteredDevice>>,
    clock: Arc<dyn Clock>,
    events_tx: mpsc::Sender<DeviceEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<DeviceEvent>>>,
    frames_tx: mpsc::Sender<CameraFrame>,
    frames_rx: Mutex<Option<mpsc::Receiver<CameraFrame>>>,
    next_seq: AtomicU64,
    gate: Mutex<RunGate>,
}

// =============================================================================
// Device Registry
// =============================================================================

/// Device Abstraction Layer.
///
/// Cheap to clone; clones share the same devices and queues.
#[derive(Clone)]
pub struct DeviceRegistry {
    inner: Arc<Inner>,
}

impl DeviceRegistry {
    /// Create an empty registry.
    pub fn new(clock: Arc<dyn Clock>, queues: QueueSettings) -> Self {
        let (events_tx, events_rx) = mpsc::channel(queues.event_capacity.max(1));
        let (frames_tx, frames_rx) = mpsc::channel(queues.frame_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                devices: RwLock::new(BTreeMap::new()),
                clock,
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                frames_tx,
                frames_rx: Mutex::new(Some(frames_rx)),
                next_seq: AtomicU64::new(0),
                gate: Mutex::new(RunGate::default()),
            }),
        }
    }

    /// Build every device of an inventory.
    ///
    /// All entries are validated before any device is instantiated.
    pub async fn from_config(
        config: &HardwareConfig,
        factories: &FactoryTable,
        clock: Arc<dyn Clock>,
        queues: QueueSettings,
    ) -> Result<Self> {
        config.validate()?;

        let mut validation_errors = Vec::new();
        for device in &config.devices {
            match factories.get(&device.driver) {
                None => validation_errors.push(format!(
                    "Device '{}': unknown driver type '{}'",
                    device.id, device.driver
                )),
                Some(factory) => {
                    if let Err(e) = factory.validate(&device.params) {
                        validation_errors.push(format!(
                            "Device '{}' ({}): {:#}",
                            device.id, device.driver, e
                        ));
                    }
                }
            }
        }
        if !validation_errors.is_empty() {
            anyhow::bail!(
                "Hardware configuration validation failed:\n  - {}",
                validation_errors.join("\n  - ")
            );
        }

        let registry = Self::new(clock.clone(), queues);
        for device in &config.devices {
            let factory = factories
                .get(&device.driver)
                .ok_or_else(|| anyhow!("Driver '{}' disappeared", device.driver))?;
            let components = factory
                .build(
                    device.spec(),
                    BuildContext {
                        clock: clock.clone(),
                    },
                )
                .await
                .with_context(|| format!("Failed to build device '{}'", device.id))?;
            registry.register(components)?;
        }
        info!(
            "Registered {} devices for '{}'",
            registry.len(),
            config.name.as_deref().unwrap_or("unnamed instrument")
        );
        Ok(registry)
    }

    /// Register a built device. Cameras get the shared frame sink attached.
    pub fn register(&self, components: DeviceComponents) -> Result<(), DalError> {
        let DeviceComponents { descriptor, handle } = components;
        let mut devices = self.inner.devices.write();
        if devices.contains_key(&descriptor.id) {
            return Err(DalError::Duplicate(descriptor.id));
        }
        if let DeviceHandle::Camera(camera) = &handle {
            camera.attach_sink(self.inner.frames_tx.clone());
        }
        debug!(device = %descriptor.id, kind = %descriptor.kind, "Registered device");
        devices.insert(
            descriptor.id.clone(),
            RegisteredDevice { descriptor, handle },
        );
        Ok(())
    }

    /// Shared clock of the instrument.
    pub fn clock(&self) -> Arc<dyn Clock> {
        self.inner.clock.clone()
    }

    /// Number of registered devices.
    pub fn len(&self) -> usize {
        self.inner.devices.read().len()
    }

    /// Whether no device is registered.
    pub fn is_empty(&self) -> bool {
        self.inner.devices.read().is_empty()
    }

    /// Whether a device id is registered.
    pub fn contains(&self, id: &DeviceId) -> bool {
        self.inner.devices.read().contains_key(id)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Current status of a device.
    pub fn status(&self, id: &DeviceId) -> Result<DeviceStatus, DalError> {
        self.inner
            .devices
            .read()
            .get(id)
            .map(|d| d.descriptor.status)
            .ok_or_else(|| DalError::UnknownDevice(id.clone()))
    }

    /// Snapshot of one descriptor.
    pub fn descriptor(&self, id: &DeviceId) -> Result<DeviceDescriptor, DalError> {
        self.inner
            .devices
            .read()
            .get(id)
            .map(|d| d.descriptor.clone())
            .ok_or_else(|| DalError::UnknownDevice(id.clone()))
    }

    /// Snapshot of every descriptor, sorted by id.
    pub fn descriptors(&self) -> Vec<DeviceDescriptor> {
        self.inner
            .devices
            .read()
            .values()
            .map(|d| d.descriptor.clone())
            .collect()
    }

    /// Capability handle of a device, for diagnostics and tests.
    pub fn handle(&self, id: &DeviceId) -> Option<DeviceHandle> {
        self.inner.devices.read().get(id).map(|d| d.handle.clone())
    }

    /// Devices with a command in flight.
    pub fn busy_devices(&self) -> Vec<DeviceId> {
        self.inner
            .devices
            .read()
            .values()
            .filter(|d| {
                matches!(
                    d.descriptor.status,
                    DeviceStatus::Moving | DeviceStatus::Triggered
                )
            })
            .map(|d| d.descriptor.id.clone())
            .collect()
    }

    // =========================================================================
    // Queues
    // =========================================================================

    /// Take the device event queue. Returns `None` once taken.
    pub fn take_event_receiver(&self) -> Option<mpsc::Receiver<DeviceEvent>> {
        self.inner.events_rx.lock().take()
    }

    /// Take the camera frame queue. Returns `None` once taken.
    pub fn take_frame_receiver(&self) -> Option<mpsc::Receiver<CameraFrame>> {
        self.inner.frames_rx.lock().take()
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Apply a target to a device. Returns as soon as the command is issued.
    pub fn configure(
        &self,
        id: &DeviceId,
        target: DeviceTarget,
        step: usize,
    ) -> Result<CommandTicket, DalError> {
        let (handle, ticket) = self.claim(id, step, DeviceStatus::Moving, |handle| {
            if handle.accepts(&target) {
                Ok(())
            } else {
                Err(DalError::Unsupported {
                    device: id.clone(),
                    operation: target.operation().to_string(),
                })
            }
        })?;

        debug!(device = %id, seq = ticket.seq, step, op = target.operation(), "configure");
        let inner = self.inner.clone();
        let id = id.clone();
        tokio::spawn(async move {
            let outcome = handle.configure(&target).await.map(|()| Some(target));
            finish(inner, id, ticket, outcome).await;
        });
        Ok(ticket)
    }

    /// Trigger a camera exposure. Returns as soon as the trigger is issued.
    pub fn trigger(
        &self,
        id: &DeviceId,
        record: TriggerRecord,
        step: usize,
    ) -> Result<CommandTicket, DalError> {
        let (handle, ticket) = self.claim(id, step, DeviceStatus::Triggered, |handle| {
            if matches!(handle, DeviceHandle::Camera(_)) {
                Ok(())
            } else {
                Err(DalError::Unsupported {
                    device: id.clone(),
                    operation: "trigger".to_string(),
                })
            }
        })?;

        debug!(device = %id, seq = ticket.seq, step, "trigger");
        let inner = self.inner.clone();
        let id = id.clone();
        tokio::spawn(async move {
            let outcome = handle.trigger(record).await.map(|()| None);
            finish(inner, id, ticket, outcome).await;
        });
        Ok(ticket)
    }

    fn claim(
        &self,
        id: &DeviceId,
        step: usize,
        busy: DeviceStatus,
        check: impl FnOnce(&DeviceHandle) -> Result<(), DalError>,
    ) -> Result<(DeviceHandle, CommandTicket), DalError> {
        let mut devices = self.inner.devices.write();
        let device = devices
            .get_mut(id)
            .ok_or_else(|| DalError::UnknownDevice(id.clone()))?;
        match device.descriptor.status {
            DeviceStatus::Idle => {}
            DeviceStatus::Fault => return Err(DalError::Faulted(id.clone())),
            status => {
                return Err(DalError::Busy {
                    device: id.clone(),
                    status,
                })
            }
        }
        check(&device.handle)?;
        device.descriptor.status = busy;
        let ticket = CommandTicket {
            seq: self.inner.next_seq.fetch_add(1, Ordering::SeqCst),
            step,
        };
        Ok((device.handle.clone(), ticket))
    }

    // =========================================================================
    // Run bracketing, fault reset, preflight
    // =========================================================================

    /// A run has armed; fault resets stay allowed until the first step is issued.
    pub fn begin_run(&self) {
        *self.inner.gate.lock() = RunGate {
            active: true,
            issued: false,
        };
    }

    /// The active run has issued a plan step.
    pub fn mark_issued(&self) {
        self.inner.gate.lock().issued = true;
    }

    /// The run has ended.
    pub fn end_run(&self) {
        *self.inner.gate.lock() = RunGate::default();
    }

    /// Clear a latched fault.
    ///
    /// Rejected while a run that has already issued plan steps is active.
    pub async fn fault_reset(&self, id: &DeviceId) -> Result<(), DalError> {
        let gate = *self.inner.gate.lock();
        if gate.active && gate.issued {
            return Err(DalError::ResetRejected(id.clone()));
        }
        let handle = self
            .handle(id)
            .ok_or_else(|| DalError::UnknownDevice(id.clone()))?;

        handle
            .reset_fault()
            .await
            .map_err(|e| DalError::ResetFailed {
                device: id.clone(),
                message: format!("{:#}", e),
            })?;

        if let Some(device) = self.inner.devices.write().get_mut(id) {
            if device.descriptor.status == DeviceStatus::Fault {
                device.descriptor.status = DeviceStatus::Idle;
            }
            device.descriptor.faulted = false;
        }
        info!(device = %id, "Fault reset");
        Ok(())
    }

    /// Arm-time check of the devices a plan touches.
    ///
    /// Fails if any is unknown, faulted, busy, or fails its driver readiness
    /// check.
    pub async fn preflight(&self, ids: &[DeviceId]) -> Result<(), PreflightError> {
        for id in ids {
            let handle = {
                let devices = self.inner.devices.read();
                let device = devices
                    .get(id)
                    .ok_or_else(|| PreflightError::Unreachable(id.clone()))?;
                match device.descriptor.status {
                    DeviceStatus::Idle => {}
                    DeviceStatus::Fault => return Err(PreflightError::Faulted(id.clone())),
                    status => {
                        return Err(PreflightError::NotIdle {
                            device: id.clone(),
                            status,
                        })
                    }
                }
                device.handle.clone()
            };
            handle
                .check_ready()
                .await
                .map_err(|e| PreflightError::NotReady {
                    device: id.clone(),
                    reason: format!("{:#}", e),
                })?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("devices", &self.inner.devices.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Record a driver outcome and post its event.
async fn finish(
    inner: Arc<Inner>,
    id: DeviceId,
    ticket: CommandTicket,
    outcome: Result<Option<DeviceTarget>>,
) {
    let kind = {
        let mut devices = inner.devices.write();
        match devices.get_mut(&id) {
            Some(device) => match outcome {
                Ok(state) => {
                    device.descriptor.status = DeviceStatus::Idle;
                    if state.is_some() {
                        device.descriptor.last_state = state;
                    }
                    DeviceEventKind::Completed
                }
                Err(e) => {
                    device.descriptor.status = DeviceStatus::Fault;
                    device.descriptor.faulted = true;
                    let message = format!("{:#}", e);
                    warn!(device = %id, seq = ticket.seq, step = ticket.step, "Device fault: {}", message);
                    DeviceEventKind::Fault { message }
                }
            },
            None => DeviceEventKind::Fault {
                message: "device unregistered while busy".to_string(),
            },
        }
    };

    let event = DeviceEvent {
        device: id,
        ticket,
        kind,
        timestamp: inner.clock.now(),
    };
    if inner.events_tx.send(event).await.is_err() {
        debug!("Device event receiver dropped");
    }
}

/// Registry with the simulated SOLS instrument, every device in `mode`.
pub async fn create_mock_registry(mode: &str, clock: Arc<dyn Clock>) -> Result<DeviceRegistry> {
    let config = HardwareConfig::sols_mock(mode)?;
    let factories = FactoryTable::with_mock_drivers();
    DeviceRegistry::from_config(&config, &factories, clock, QueueSettings::default()).await
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use sols_core::clock::MonotonicClock;
    use sols_core::device::LaserState;

    async fn mock() -> DeviceRegistry {
        create_mock_registry("instant", Arc::new(MonotonicClock::new()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_descriptors_sorted() {
        let registry = mock().await;
        let ids: Vec<String> = registry
            .descriptors()
            .iter()
            .map(|d| d.id.to_string())
            .collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
        assert_eq!(ids.len(), 11);
    }

    #[tokio::test]
    async fn test_configure_posts_completion() {
        let registry = mock().await;
        let mut events = registry.take_event_receiver().unwrap();
        let piezo = DeviceId::from("piezo");

        let ticket = registry
            .configure(&piezo, DeviceTarget::Position { value: 50.0 }, 3)
            .unwrap();
        let event = events.recv().await.unwrap();
        assert_eq!(event.device, piezo);
        assert_eq!(event.ticket, ticket);
        assert_eq!(event.ticket.step, 3);
        assert!(!event.is_fault());
        assert_eq!(registry.status(&piezo).unwrap(), DeviceStatus::Idle);
        assert_eq!(
            registry.descriptor(&piezo).unwrap().last_state,
            Some(DeviceTarget::Position { value: 50.0 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_command_refused_while_busy() {
        let registry = create_mock_registry("realistic", Arc::new(MonotonicClock::new()))
            .await
            .unwrap();
        let wheel = DeviceId::from("filter_wheel");
        registry
            .configure(&wheel, DeviceTarget::Filter { position: 2 }, 0)
            .unwrap();
        let err = registry
            .configure(&wheel, DeviceTarget::Filter { position: 3 }, 1)
            .unwrap_err();
        assert_eq!(
            err,
            DalError::Busy {
                device: wheel.clone(),
                status: DeviceStatus::Moving
            }
        );
        assert_eq!(registry.busy_devices(), vec![wheel]);
    }

    #[tokio::test]
    async fn test_capability_mismatch_refused() {
        let registry = mock().await;
        let err = registry
            .configure(
                &DeviceId::from("galvo"),
                DeviceTarget::Laser(LaserState::on(5.0)),
                0,
            )
            .unwrap_err();
        assert!(matches!(err, DalError::Unsupported { .. }));
        let err = registry
            .trigger(&DeviceId::from("piezo"), TriggerRecord::default(), 0)
            .unwrap_err();
        assert!(matches!(err, DalError::Unsupported { .. }));
        assert!(matches!(
            registry.status(&DeviceId::from("nope")),
            Err(DalError::UnknownDevice(_))
        ));
    }

    #[tokio::test]
    async fn test_out_of_range_faults_and_latches() {
        let registry = mock().await;
        let mut events = registry.take_event_receiver().unwrap();
        let piezo = DeviceId::from("piezo");

        registry
            .configure(&piezo, DeviceTarget::Position { value: 900.0 }, 0)
            .unwrap();
        let event = events.recv().await.unwrap();
        assert!(event.is_fault());
        assert_eq!(registry.status(&piezo).unwrap(), DeviceStatus::Fault);
        assert!(registry.descriptor(&piezo).unwrap().faulted);

        let err = registry
            .configure(&piezo, DeviceTarget::Position { value: 1.0 }, 1)
            .unwrap_err();
        assert_eq!(err, DalError::Faulted(piezo.clone()));

        registry.fault_reset(&piezo).await.unwrap();
        assert_eq!(registry.status(&piezo).unwrap(), DeviceStatus::Idle);
    }

    #[tokio::test]
    async fn test_fault_reset_gated_by_run() {
        let registry = mock().await;
        let piezo = DeviceId::from("piezo");
        registry.begin_run();
        registry.fault_reset(&piezo).await.unwrap();
        registry.mark_issued();
        assert_eq!(
            registry.fault_reset(&piezo).await.unwrap_err(),
            DalError::ResetRejected(piezo.clone())
        );
        registry.end_run();
        registry.fault_reset(&piezo).await.unwrap();
    }

    #[tokio::test]
    async fn test_preflight_checks_only_requested() {
        let registry = mock().await;
        let mut events = registry.take_event_receiver().unwrap();
        let piezo = DeviceId::from("piezo");
        registry
            .configure(&piezo, DeviceTarget::Position { value: -5.0 }, 0)
            .unwrap();
        events.recv().await.unwrap();

        let camera = DeviceId::from("camera");
        registry.preflight(&[camera.clone()]).await.unwrap();
        assert_eq!(
            registry.preflight(&[camera, piezo.clone()]).await.unwrap_err(),
            PreflightError::Faulted(piezo)
        );
        assert_eq!(
            registry
                .preflight(&[DeviceId::from("ghost")])
                .await
                .unwrap_err(),
            PreflightError::Unreachable(DeviceId::from("ghost"))
        );
    }

    #[tokio::test]
    async fn test_camera_frames_funnelled() {
        let registry = mock().await;
        let mut frames = registry.take_frame_receiver().unwrap();
        let mut events = registry.take_event_receiver().unwrap();
        assert!(registry.take_frame_receiver().is_none());

        registry
            .trigger(&DeviceId::from("camera"), TriggerRecord::default(), 0)
            .unwrap();
        let event = events.recv().await.unwrap();
        assert!(!event.is_fault());
        let frame = frames.recv().await.unwrap();
        assert_eq!(frame.sequence, 0);
        assert_eq!(frame.pixel_count(), 512 * 512);
    }

    #[tokio::test]
    async fn test_unknown_driver_rejected() {
        let mut config = HardwareConfig::sols_mock("instant").unwrap();
        if let Some(device) = config.device_mut("camera") {
            device.driver = "pvcam".to_string();
        }
        let err = DeviceRegistry::from_config(
            &config,
            &FactoryTable::with_mock_drivers(),
            Arc::new(MonotonicClock::new()),
            QueueSettings::default(),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("unknown driver type 'pvcam'"));
    }
}
