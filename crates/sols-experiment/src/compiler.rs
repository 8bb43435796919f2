//! Timing plan compiler.
//!
//! [`PlanCompiler::compile`] expands an [`AcquisitionRequest`] against a
//! snapshot of the instrument's device descriptors and produces an immutable
//! [`TimingPlan`].
//!
//! # Expansion order
//!
//! Outer to inner: timepoint, XY position, z slice, projection angle, channel.
//! Requested camera preframes come first, as trigger-only steps with every
//! laser left off and no logical coordinate.
//! A request without XY positions visits one implicit position (the stage is
//! not commanded). In projection mode the z axis collapses to a single slice
//! at the centre of the range and the scan mirror sweeps the whole range
//! during each exposure.
//!
//! # Scheduling
//!
//! A device is reconfigured only when its target differs from the last one it
//! was given (every device is configured on the first step). Reconfiguration
//! starts once the previous exposure has ended and the device has settled
//! from its own previous command; the exposure starts once every reconfigured
//! device has settled and the camera has read out the previous frame plus the
//! jitter padding. Two steps touching the same device are therefore always at
//! least that device's settle time apart.
//!
//! Only ordered containers are used, so identical inputs produce bit-identical
//! plans.

use sols_core::config::CompilerConfig;
use sols_core::device::{
    Capability, DeviceDescriptor, DeviceId, DeviceKind, DeviceTarget, LaserState, MirrorAngles,
    TravelRange,
};
use sols_core::error::CompilationError;
use sols_core::plan::{
    DeviceStateVector, LogicalCoordinate, PlanStep, StepAction, StepCommand, StepKind,
    TimingPlan, XyPosition,
};
use sols_core::request::{AcquisitionMode, AcquisitionRequest};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, info};

/// Compiles acquisition requests into timing plans.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanCompiler {
    config: CompilerConfig,
}

impl PlanCompiler {
    /// Compiler with explicit settings.
    pub fn new(config: CompilerConfig) -> Self {
        Self { config }
    }

    /// Settings in use.
    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    /// Compile `request` against `descriptors`.
    ///
    /// Fails without side effects if the request is malformed or cannot be
    /// realised by the registered devices.
    pub fn compile(
        &self,
        request: &AcquisitionRequest,
        descriptors: &[DeviceDescriptor],
    ) -> Result<TimingPlan, CompilationError> {
        check_request(request)?;
        let instrument = Instrument::resolve(request, descriptors)?;
        let channels = instrument.channels(request)?;
        let slices = self.slices(request, &instrument)?;
        let mirrors = self.mirror_settings(request, &instrument)?;
        let stops = instrument.stops(request)?;
        let fixed = instrument.fixed_targets(request)?;

        let frames = [
            u64::from(request.timepoints),
            stops.len() as u64,
            slices.len() as u64,
            mirrors.len() as u64,
            channels.len() as u64,
        ]
        .iter()
        .try_fold(1u64, |acc, n| acc.checked_mul(*n))
        .and_then(|n| n.checked_add(u64::from(request.camera_preframes)));
        self.check_buffer(instrument.camera, frames)?;

        let lasers: BTreeSet<&DeviceId> = channels.iter().map(|c| &c.laser).collect();
        let camera = instrument.camera;
        let exposure = request.exposure();
        let interval = request.timepoint_interval().unwrap_or_default();
        let camera_busy = exposure
            .checked_add(camera.min_settle)
            .ok_or(CompilationError::OffsetOverflow(0))?;

        let mut schedule = Schedule::new(descriptors, self.config.step_jitter());
        let mut steps = Vec::new();

        for _ in 0..request.camera_preframes {
            let index = steps.len();
            steps.push(schedule.step(
                index,
                StepKind::Preframe,
                LogicalCoordinate::default(),
                DeviceStateVector::default(),
                BTreeMap::new(),
                camera,
                exposure,
                camera_busy,
                Duration::ZERO,
            )?);
        }

        for t in 0..request.timepoints {
            let timepoint_start = interval
                .checked_mul(t)
                .ok_or(CompilationError::OffsetOverflow(steps.len()))?;
            for (p, xy) in stops.iter().enumerate() {
                for (zi, &z_um) in slices.iter().enumerate() {
                    for (ai, angle) in mirrors.iter().enumerate() {
                        for (ci, channel) in channels.iter().enumerate() {
                            let index = steps.len();
                            let state = DeviceStateVector {
                                laser_nm: channel.laser_nm,
                                laser: channel.output,
                                filter_position: channel.filter_position,
                                mirrors: *angle,
                                z_um,
                                xy: *xy,
                            };

                            let mut targets = fixed.clone();
                            for laser in &lasers {
                                let output = if **laser == channel.laser {
                                    channel.output
                                } else {
                                    LaserState::OFF
                                };
                                targets.insert((*laser).clone(), DeviceTarget::Laser(output));
                            }
                            targets.insert(
                                instrument.filter.id.clone(),
                                DeviceTarget::Filter {
                                    position: channel.filter_position,
                                },
                            );
                            targets.insert(instrument.mirrors.id.clone(), DeviceTarget::Mirrors(*angle));
                            targets.insert(
                                instrument.focus.id.clone(),
                                DeviceTarget::Position { value: z_um },
                            );
                            if let (Some(stage), Some(xy)) = (instrument.stage, xy) {
                                targets.insert(
                                    stage.id.clone(),
                                    DeviceTarget::PlanarPosition {
                                        x_mm: xy.x_mm,
                                        y_mm: xy.y_mm,
                                    },
                                );
                            }

                            let coordinate = LogicalCoordinate {
                                timepoint: t,
                                position: index_u32("position", p)?,
                                z_index: index_u32("z slice", zi)?,
                                angle_index: index_u32("angle", ai)?,
                                channel_index: index_u32("channel", ci)?,
                            };
                            steps.push(schedule.step(
                                index,
                                StepKind::Acquire,
                                coordinate,
                                state,
                                targets,
                                camera,
                                exposure,
                                camera_busy,
                                timepoint_start,
                            )?);
                        }
                    }
                }
            }
        }

        let plan = TimingPlan {
            steps,
            camera: camera.id.clone(),
            max_tolerance: schedule.max_tolerance,
            duration: schedule.exposure_end,
        };
        info!(
            steps = plan.len(),
            duration_ms = plan.duration.as_millis() as u64,
            max_tolerance_us = plan.max_tolerance.as_micros() as u64,
            "Compiled timing plan"
        );
        Ok(plan)
    }

    /// Fast focus positions, one per exposure slice.
    fn slices(
        &self,
        request: &AcquisitionRequest,
        instrument: &Instrument<'_>,
    ) -> Result<Vec<f64>, CompilationError> {
        let positions = request.z.positions()?;
        let slices = match request.mode {
            AcquisitionMode::Volume => positions,
            AcquisitionMode::Projection => vec![request.z.start_um + request.z.span_um() / 2.0],
        };
        if request.autofocus && slices.len() > 1 {
            return Err(CompilationError::AutofocusConflict(instrument.focus.id.clone()));
        }
        for z in &slices {
            check_travel(instrument.focus, instrument.focus.travel, "z_um", *z)?;
        }
        Ok(slices)
    }

    /// Mirror settings per angle, with the projection sweep applied.
    fn mirror_settings(
        &self,
        request: &AcquisitionRequest,
        instrument: &Instrument<'_>,
    ) -> Result<Vec<MirrorAngles>, CompilationError> {
        let galvo = instrument.mirrors;
        let sweep = match request.mode {
            AcquisitionMode::Volume => None,
            AcquisitionMode::Projection => {
                Some(request.z.span_um().abs() * self.config.sweep_deg_per_um())
            }
        };

        let mut settings = Vec::with_capacity(request.angles.len());
        for angle in &request.angles {
            let mut mirrors = angle.mirrors;
            if let Some(sweep) = sweep {
                mirrors.sweep_deg = sweep;
            }
            if (mirrors.sweep_deg != 0.0 || request.mode == AcquisitionMode::Projection)
                && !galvo.has(Capability::ContinuousScan)
            {
                return Err(CompilationError::MissingCapability {
                    device: galvo.id.clone(),
                    capability: Capability::ContinuousScan.to_string(),
                });
            }
            let half_sweep = mirrors.sweep_deg.abs() / 2.0;
            check_travel(galvo, galvo.travel, "scan_deg", mirrors.scan_deg - half_sweep)?;
            check_travel(galvo, galvo.travel, "scan_deg", mirrors.scan_deg + half_sweep)?;
            check_travel(galvo, galvo.secondary_travel, "tilt_deg", mirrors.tilt_deg)?;
            settings.push(mirrors);
        }
        Ok(settings)
    }

    fn check_buffer(
        &self,
        camera: &DeviceDescriptor,
        frames: Option<u64>,
    ) -> Result<(), CompilationError> {
        let sensor = camera
            .sensor
            .ok_or_else(|| CompilationError::MissingCapability {
                device: camera.id.clone(),
                capability: "sensor shape".to_string(),
            })?;
        let limit = self.config.max_buffer_bytes;
        let bytes = frames
            .and_then(|f| f.checked_mul(2))
            .and_then(|b| b.checked_mul(u64::from(sensor.height_px)))
            .and_then(|b| b.checked_mul(u64::from(sensor.width_px)))
            .unwrap_or(u64::MAX);
        if bytes > limit {
            return Err(CompilationError::BufferExceeded { bytes, limit });
        }
        debug!(bytes, limit, "Frame buffer within budget");
        Ok(())
    }
}

fn check_request(request: &AcquisitionRequest) -> Result<(), CompilationError> {
    if request.channels.is_empty() {
        return Err(CompilationError::NoChannels);
    }
    if request.angles.is_empty() {
        return Err(CompilationError::NoAngles);
    }
    if request.timepoints == 0 {
        return Err(CompilationError::NoTimepoints);
    }
    if request.exposure_us == 0 {
        return Err(CompilationError::NonPositiveDwell {
            exposure_us: request.exposure_us,
        });
    }
    Ok(())
}

fn check_travel(
    device: &DeviceDescriptor,
    range: Option<TravelRange>,
    what: &str,
    value: f64,
) -> Result<(), CompilationError> {
    let range = range.unwrap_or(TravelRange::new(f64::MIN, f64::MAX));
    if range.contains(value) {
        Ok(())
    } else {
        Err(CompilationError::OutOfRange {
            device: device.id.clone(),
            what: what.to_string(),
            value,
            min: range.min,
            max: range.max,
        })
    }
}

fn index_u32(axis: &str, index: usize) -> Result<u32, CompilationError> {
    u32::try_from(index).map_err(|_| CompilationError::AxisTooLong {
        axis: axis.to_string(),
        count: index.saturating_add(1),
    })
}

// =============================================================================
// Device Resolution
// =============================================================================

/// Channel resolved against the registered lasers and filter selector.
#[derive(Debug, Clone)]
struct ResolvedChannel {
    laser: DeviceId,
    laser_nm: u32,
    output: LaserState,
    filter_position: u32,
}

/// The devices a request needs, looked up by kind.
struct Instrument<'a> {
    descriptors: &'a [DeviceDescriptor],
    camera: &'a DeviceDescriptor,
    mirrors: &'a DeviceDescriptor,
    focus: &'a DeviceDescriptor,
    filter: &'a DeviceDescriptor,
    stage: Option<&'a DeviceDescriptor>,
    coarse: Option<&'a DeviceDescriptor>,
    autofocus: Option<&'a DeviceDescriptor>,
}

impl<'a> Instrument<'a> {
    fn resolve(
        request: &AcquisitionRequest,
        descriptors: &'a [DeviceDescriptor],
    ) -> Result<Self, CompilationError> {
        let camera = require(descriptors, DeviceKind::Camera, Capability::Triggerable)?;
        let mirrors = require(descriptors, DeviceKind::ScanMirror, Capability::Movable)?;
        let focus = require(descriptors, DeviceKind::FastFocus, Capability::Movable)?;
        let filter = require(descriptors, DeviceKind::FilterWheel, Capability::Filterable)?;

        let stage = if request.positions.is_empty() {
            None
        } else {
            Some(require(descriptors, DeviceKind::XyStage, Capability::Movable)?)
        };
        let coarse = match request.coarse_focus_mm {
            None => None,
            Some(_) => Some(require(descriptors, DeviceKind::CoarseStage, Capability::Movable)?),
        };
        let autofocus = if request.autofocus {
            Some(require(descriptors, DeviceKind::Autofocus, Capability::FocusLock)?)
        } else {
            None
        };

        Ok(Self {
            descriptors,
            camera,
            mirrors,
            focus,
            filter,
            stage,
            coarse,
            autofocus,
        })
    }

    fn channels(&self, request: &AcquisitionRequest) -> Result<Vec<ResolvedChannel>, CompilationError> {
        request
            .channels
            .iter()
            .map(|channel| {
                let candidates: Vec<&DeviceDescriptor> = self
                    .descriptors
                    .iter()
                    .filter(|d| {
                        d.kind == DeviceKind::Laser && d.wavelength_nm == Some(channel.laser_nm)
                    })
                    .collect();
                let laser = match candidates.as_slice() {
                    [] => return Err(CompilationError::UnsupportedLaserLine(channel.laser_nm)),
                    [laser] => *laser,
                    many => {
                        return Err(CompilationError::AmbiguousDevice {
                            kind: DeviceKind::Laser,
                            devices: many.iter().map(|d| d.id.clone()).collect(),
                        })
                    }
                };
                ensure_capability(laser, Capability::Illumination)?;

                let max_pct = laser.max_power_pct.unwrap_or(100.0);
                if !(channel.power_pct >= 0.0 && channel.power_pct <= max_pct) {
                    return Err(CompilationError::InvalidPower {
                        device: laser.id.clone(),
                        power_pct: channel.power_pct,
                        max_pct,
                    });
                }

                let filter_position = self.filter.filter_position(&channel.filter).ok_or_else(|| {
                    CompilationError::UnknownFilter {
                        device: self.filter.id.clone(),
                        name: channel.filter.clone(),
                    }
                })?;

                Ok(ResolvedChannel {
                    laser: laser.id.clone(),
                    laser_nm: channel.laser_nm,
                    output: LaserState::on(channel.power_pct),
                    filter_position,
                })
            })
            .collect()
    }

    /// XY stops; one implicit stop when the request lists none.
    fn stops(&self, request: &AcquisitionRequest) -> Result<Vec<Option<XyPosition>>, CompilationError> {
        let Some(stage) = self.stage else {
            return Ok(vec![None]);
        };
        request
            .positions
            .iter()
            .map(|position| {
                check_travel(stage, stage.travel, "x_mm", position.x_mm)?;
                check_travel(stage, stage.secondary_travel, "y_mm", position.y_mm)?;
                Ok(Some(XyPosition {
                    x_mm: position.x_mm,
                    y_mm: position.y_mm,
                }))
            })
            .collect()
    }

    /// Targets that stay the same for the whole run.
    fn fixed_targets(
        &self,
        request: &AcquisitionRequest,
    ) -> Result<BTreeMap<DeviceId, DeviceTarget>, CompilationError> {
        let mut targets = BTreeMap::new();
        if let (Some(coarse), Some(position)) = (self.coarse, request.coarse_focus_mm) {
            check_travel(coarse, coarse.travel, "coarse_mm", position)?;
            targets.insert(coarse.id.clone(), DeviceTarget::Position { value: position });
        }
        if let Some(autofocus) = self.autofocus {
            targets.insert(autofocus.id.clone(), DeviceTarget::FocusLock { engaged: true });
        }
        Ok(targets)
    }
}

fn find_unique(
    descriptors: &[DeviceDescriptor],
    kind: DeviceKind,
) -> Result<Option<&DeviceDescriptor>, CompilationError> {
    let found: Vec<&DeviceDescriptor> = descriptors.iter().filter(|d| d.kind == kind).collect();
    match found.as_slice() {
        [] => Ok(None),
        [one] => Ok(Some(*one)),
        many => Err(CompilationError::AmbiguousDevice {
            kind,
            devices: many.iter().map(|d| d.id.clone()).collect(),
        }),
    }
}

fn require(
    descriptors: &[DeviceDescriptor],
    kind: DeviceKind,
    capability: Capability,
) -> Result<&DeviceDescriptor, CompilationError> {
    let device = find_unique(descriptors, kind)?.ok_or(CompilationError::MissingDevice(kind))?;
    ensure_capability(device, capability)?;
    Ok(device)
}

fn ensure_capability(
    device: &DeviceDescriptor,
    capability: Capability,
) -> Result<(), CompilationError> {
    if device.has(capability) {
        Ok(())
    } else {
        Err(CompilationError::MissingCapability {
            device: device.id.clone(),
            capability: capability.to_string(),
        })
    }
}

// =============================================================================
// Offset Scheduling
// =============================================================================

/// Running schedule state while steps are emitted.
struct Schedule<'a> {
    devices: BTreeMap<&'a DeviceId, &'a DeviceDescriptor>,
    jitter: Duration,
    last: BTreeMap<DeviceId, DeviceTarget>,
    ready_at: BTreeMap<DeviceId, Duration>,
    camera_ready: Duration,
    exposure_end: Duration,
    max_tolerance: Duration,
}

impl<'a> Schedule<'a> {
    fn new(descriptors: &'a [DeviceDescriptor], jitter: Duration) -> Self {
        Self {
            devices: descriptors.iter().map(|d| (&d.id, d)).collect(),
            jitter,
            last: BTreeMap::new(),
            ready_at: BTreeMap::new(),
            camera_ready: Duration::ZERO,
            exposure_end: Duration::ZERO,
            max_tolerance: Duration::ZERO,
        }
    }

    fn settle(&self, id: &DeviceId) -> Duration {
        self.devices.get(id).map(|d| d.min_settle).unwrap_or_default()
    }

    fn tolerance(&self, id: &DeviceId) -> Duration {
        self.devices.get(id).map(|d| d.tolerance).unwrap_or_default()
    }

    #[allow(clippy::too_many_arguments)]
    fn step(
        &mut self,
        index: usize,
        kind: StepKind,
        coordinate: LogicalCoordinate,
        state: DeviceStateVector,
        targets: BTreeMap<DeviceId, DeviceTarget>,
        camera: &DeviceDescriptor,
        exposure: Duration,
        camera_busy: Duration,
        not_before: Duration,
    ) -> Result<PlanStep, CompilationError> {
        let overflow = || CompilationError::OffsetOverflow(index);

        let changed: Vec<(DeviceId, DeviceTarget)> = targets
            .into_iter()
            .filter(|(id, target)| self.last.get(id) != Some(target))
            .collect();

        let config_at = changed
            .iter()
            .filter_map(|(id, _)| self.ready_at.get(id).copied())
            .fold(self.exposure_end, Duration::max);
        let max_settle = changed
            .iter()
            .map(|(id, _)| self.settle(id))
            .max()
            .unwrap_or_default();
        let offset = config_at
            .checked_add(max_settle)
            .ok_or_else(overflow)?
            .max(self.camera_ready)
            .max(not_before);

        let mut tolerance = camera.tolerance;
        let mut commands = Vec::with_capacity(changed.len() + 1);
        for (device, target) in changed {
            let settle = self.settle(&device);
            tolerance = tolerance.max(self.tolerance(&device));
            self.ready_at
                .insert(device.clone(), config_at.checked_add(settle).ok_or_else(overflow)?);
            self.last.insert(device.clone(), target.clone());
            commands.push(StepCommand {
                device,
                action: StepAction::Configure { target },
                issue_offset: config_at,
                expected: settle,
            });
        }
        commands.push(StepCommand {
            device: camera.id.clone(),
            action: StepAction::Trigger,
            issue_offset: offset,
            expected: camera_busy,
        });

        self.exposure_end = offset.checked_add(exposure).ok_or_else(overflow)?;
        self.camera_ready = self
            .exposure_end
            .checked_add(camera.min_settle)
            .and_then(|t| t.checked_add(self.jitter))
            .ok_or_else(overflow)?;
        self.max_tolerance = self.max_tolerance.max(tolerance);

        Ok(PlanStep {
            index,
            kind,
            coordinate,
            state,
            offset,
            exposure,
            tolerance,
            commands,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use sols_core::request::{Channel, ProjectionAngle, StagePosition, ZRange};

    const FILTERS: [&str; 7] = [
        "Shutter",
        "Open",
        "ET445/58M",
        "ET525/50M",
        "ET600/50M",
        "ET706/95M",
        "ZET405/488/561/640m",
    ];

    fn us(v: u64) -> Duration {
        Duration::from_micros(v)
    }

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    fn instrument() -> Vec<DeviceDescriptor> {
        let mut devices = vec![
            DeviceDescriptor::new("camera", DeviceKind::Camera)
                .with_capability(Capability::Triggerable)
                .with_settle(ms(5))
                .with_tolerance(ms(1))
                .with_sensor(512, 512),
            DeviceDescriptor::new("galvo", DeviceKind::ScanMirror)
                .with_capability(Capability::Movable)
                .with_capability(Capability::ContinuousScan)
                .with_settle(us(200))
                .with_tolerance(ms(1))
                .with_travel(-10.0, 10.0)
                .with_secondary_travel(-10.0, 10.0),
            DeviceDescriptor::new("piezo", DeviceKind::FastFocus)
                .with_capability(Capability::Movable)
                .with_settle(ms(2))
                .with_tolerance(ms(1))
                .with_travel(0.0, 800.0),
            DeviceDescriptor::new("filter_wheel", DeviceKind::FilterWheel)
                .with_capability(Capability::Filterable)
                .with_settle(ms(50))
                .with_tolerance(ms(20))
                .with_filters(FILTERS),
            DeviceDescriptor::new("xy_stage", DeviceKind::XyStage)
                .with_capability(Capability::Movable)
                .with_settle(ms(200))
                .with_tolerance(ms(50))
                .with_travel(-60.0, 60.0)
                .with_secondary_travel(-40.0, 40.0),
            DeviceDescriptor::new("coarse_z", DeviceKind::CoarseStage)
                .with_capability(Capability::Movable)
                .with_settle(ms(100))
                .with_tolerance(ms(20))
                .with_travel(0.0, 30.0),
            DeviceDescriptor::new("autofocus", DeviceKind::Autofocus)
                .with_capability(Capability::FocusLock)
                .with_settle(ms(10))
                .with_tolerance(ms(5)),
        ];
        for nm in [405u32, 488, 561, 640] {
            devices.push(
                DeviceDescriptor::new(format!("laser_{nm}"), DeviceKind::Laser)
                    .with_capability(Capability::Illumination)
                    .with_settle(us(500))
                    .with_tolerance(ms(1))
                    .with_laser_line(nm, 100.0),
            );
        }
        devices
    }

    fn volume(slices: u32) -> AcquisitionRequest {
        AcquisitionRequest::new(ms(10))
            .with_channel(Channel::new(488, 20.0, "ET525/50M"))
            .with_z_range(ZRange::new(0.0, f64::from(slices - 1), 1.0))
            .with_angle(ProjectionAngle::new(0.0))
    }

    fn compile(request: &AcquisitionRequest) -> Result<TimingPlan, CompilationError> {
        PlanCompiler::default().compile(request, &instrument())
    }

    fn configured(step: &PlanStep) -> Vec<&str> {
        step.commands
            .iter()
            .filter(|c| matches!(c.action, StepAction::Configure { .. }))
            .map(|c| c.device.as_str())
            .collect()
    }

    #[test]
    fn eleven_slice_volume_offsets() {
        let plan = compile(&volume(11)).unwrap();
        assert_eq!(plan.len(), 11);

        // Filter wheel is the slowest device configured on the first step.
        assert_eq!(plan.steps[0].offset, ms(50));
        // Afterwards the camera readout (5 ms + 30 us jitter) paces the run.
        assert_eq!(plan.steps[1].offset, us(65_030));
        assert_eq!(plan.steps[2].offset, us(80_060));
        assert_eq!(plan.duration, plan.steps[10].offset + ms(10));

        for pair in plan.steps.windows(2) {
            assert!(pair[1].offset > pair[0].offset);
        }
        assert!(plan.invariant_violations(&instrument()).is_empty());
        assert_eq!(plan.steps[5].state.z_um, 5.0);
    }

    #[test]
    fn only_changed_devices_are_commanded() {
        let plan = compile(&volume(3)).unwrap();
        assert_eq!(
            configured(&plan.steps[0]),
            vec!["filter_wheel", "galvo", "laser_488", "piezo"]
        );
        assert_eq!(configured(&plan.steps[1]), vec!["piezo"]);

        let piezo = &plan.steps[1].commands[0];
        assert_eq!(piezo.issue_offset, ms(60));
        assert_eq!(piezo.expected, ms(2));
        let trigger = plan.steps[1].commands.last().unwrap();
        assert_eq!(trigger.action, StepAction::Trigger);
        assert_eq!(trigger.issue_offset, plan.steps[1].offset);
        assert_eq!(trigger.expected, ms(15));
    }

    #[test]
    fn preframes_lead_as_trigger_only_steps() {
        let plan = compile(&volume(3).with_camera_preframes(2)).unwrap();
        assert_eq!(plan.len(), 5);

        for step in &plan.steps[..2] {
            assert!(step.is_preframe());
            assert_eq!(step.logical(), None);
            assert_eq!(step.commands.len(), 1);
            assert_eq!(step.commands[0].action, StepAction::Trigger);
            assert_eq!(step.state.laser, LaserState::OFF);
        }
        assert_eq!(plan.steps[0].offset, Duration::ZERO);
        assert_eq!(plan.steps[1].offset, us(15_030));

        // The first acquisition still configures everything after the
        // last preframe exposure ends.
        let first = &plan.steps[2];
        assert!(!first.is_preframe());
        assert_eq!(first.logical().map(|c| c.z_index), Some(0));
        assert_eq!(
            configured(first),
            vec!["filter_wheel", "galvo", "laser_488", "piezo"]
        );
        assert_eq!(first.offset, us(25_030) + ms(50));
        assert!(plan.invariant_violations(&instrument()).is_empty());
    }

    #[test]
    fn preframes_count_against_the_buffer() {
        let compiler = PlanCompiler::new(CompilerConfig {
            max_buffer_bytes: 4 * 512 * 512,
            ..CompilerConfig::default()
        });
        assert!(compiler.compile(&volume(2), &instrument()).is_ok());
        assert!(matches!(
            compiler.compile(&volume(2).with_camera_preframes(1), &instrument()),
            Err(CompilationError::BufferExceeded { .. })
        ));
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn oversized_axis_index_is_rejected() {
        assert_eq!(index_u32("z slice", 7), Ok(7));
        let too_far = u32::MAX as usize + 1;
        assert_eq!(
            index_u32("z slice", too_far),
            Err(CompilationError::AxisTooLong {
                axis: "z slice".into(),
                count: too_far + 1,
            })
        );
    }

    #[test]
    fn nesting_order_is_z_angle_channel() {
        let request = volume(2)
            .with_channel(Channel::new(561, 10.0, "ET600/50M"))
            .with_angle(ProjectionAngle::new(2.0));
        let plan = compile(&request).unwrap();
        assert_eq!(plan.len(), 8);

        let order: Vec<(u32, u32, u32)> = plan
            .steps
            .iter()
            .map(|s| (s.coordinate.z_index, s.coordinate.angle_index, s.coordinate.channel_index))
            .collect();
        assert_eq!(
            order,
            vec![
                (0, 0, 0),
                (0, 0, 1),
                (0, 1, 0),
                (0, 1, 1),
                (1, 0, 0),
                (1, 0, 1),
                (1, 1, 0),
                (1, 1, 1),
            ]
        );
        assert!(plan.invariant_violations(&instrument()).is_empty());
    }

    #[test]
    fn channel_switch_swaps_lasers() {
        let request = volume(1).with_channel(Channel::new(561, 10.0, "ET600/50M"));
        let plan = compile(&request).unwrap();

        let targets: BTreeMap<&str, &DeviceTarget> = plan.steps[1]
            .commands
            .iter()
            .filter_map(|c| match &c.action {
                StepAction::Configure { target } => Some((c.device.as_str(), target)),
                StepAction::Trigger => None,
            })
            .collect();
        assert_eq!(targets["laser_561"], &DeviceTarget::Laser(LaserState::on(10.0)));
        assert_eq!(targets["laser_488"], &DeviceTarget::Laser(LaserState::OFF));
        assert_eq!(targets["filter_wheel"], &DeviceTarget::Filter { position: 4 });
        assert!(!targets.contains_key("laser_405"));
    }

    #[test]
    fn identical_inputs_give_identical_plans() {
        let request = volume(5)
            .with_channel(Channel::new(640, 50.0, "ET706/95M"))
            .with_timepoints(2);
        let a = compile(&request).unwrap();
        let b = compile(&request).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
    }

    #[test]
    fn timepoint_interval_delays_next_timepoint() {
        let request = volume(3)
            .with_timepoints(2)
            .with_timepoint_interval(Duration::from_secs(1));
        let plan = compile(&request).unwrap();
        let first_of_second = plan
            .steps
            .iter()
            .find(|s| s.coordinate.timepoint == 1)
            .unwrap();
        assert_eq!(first_of_second.offset, Duration::from_secs(1));
    }

    #[test]
    fn positions_wrap_z_stack() {
        let request = volume(2)
            .with_position(StagePosition {
                label: "A01r00c00".into(),
                x_mm: 1.0,
                y_mm: 2.0,
            })
            .with_position(StagePosition {
                label: "A01r01c00".into(),
                x_mm: 1.0,
                y_mm: 3.0,
            });
        let plan = compile(&request).unwrap();
        assert_eq!(plan.len(), 4);
        assert_eq!(plan.steps[1].coordinate.position, 0);
        assert_eq!(plan.steps[2].coordinate.position, 1);
        assert!(configured(&plan.steps[2]).contains(&"xy_stage"));
        // The stage settles for 200 ms before the next exposure.
        assert!(plan.steps[2].offset >= plan.steps[1].offset + ms(200));
        assert_eq!(plan.steps[2].tolerance, ms(50));
        assert!(plan.invariant_violations(&instrument()).is_empty());
    }

    #[test]
    fn coarse_focus_and_autofocus_set_once() {
        let request = volume(1)
            .with_coarse_focus(12.5)
            .with_autofocus(true)
            .with_timepoints(3);
        let plan = compile(&request).unwrap();
        assert!(configured(&plan.steps[0]).contains(&"coarse_z"));
        assert!(configured(&plan.steps[0]).contains(&"autofocus"));
        assert!(configured(&plan.steps[1]).is_empty());
        assert_eq!(plan.steps[0].offset, ms(100));
    }

    #[test]
    fn projection_sweeps_mirrors() {
        let request = volume(1)
            .with_z_range(ZRange::new(100.0, 300.0, 1.0))
            .with_mode(AcquisitionMode::Projection);
        let plan = compile(&request).unwrap();
        assert_eq!(plan.len(), 1);
        let state = plan.steps[0].state;
        assert_eq!(state.z_um, 200.0);
        assert!((state.mirrors.sweep_deg - 2.0).abs() < 1e-9);
    }

    #[test]
    fn projection_requires_continuous_scan() {
        let mut devices = instrument();
        devices[1].capabilities.retain(|c| *c != Capability::ContinuousScan);
        let request = volume(3).with_mode(AcquisitionMode::Projection);
        let err = PlanCompiler::default().compile(&request, &devices).unwrap_err();
        assert!(matches!(err, CompilationError::MissingCapability { .. }));
    }

    #[test]
    fn rejects_malformed_requests() {
        let mut request = volume(3);
        request.channels.clear();
        assert_eq!(compile(&request).unwrap_err(), CompilationError::NoChannels);

        let mut request = volume(3);
        request.angles.clear();
        assert_eq!(compile(&request).unwrap_err(), CompilationError::NoAngles);

        let request = volume(3).with_timepoints(0);
        assert_eq!(compile(&request).unwrap_err(), CompilationError::NoTimepoints);

        let mut request = volume(3);
        request.exposure_us = 0;
        assert!(matches!(
            compile(&request).unwrap_err(),
            CompilationError::NonPositiveDwell { .. }
        ));

        let request = volume(3).with_z_range(ZRange::new(5.0, 0.0, 1.0));
        assert!(matches!(
            compile(&request).unwrap_err(),
            CompilationError::InvalidZRange(_)
        ));
    }

    #[test]
    fn rejects_what_the_instrument_cannot_do() {
        let request = volume(1).with_channel(Channel::new(532, 10.0, "Open"));
        assert_eq!(
            compile(&request).unwrap_err(),
            CompilationError::UnsupportedLaserLine(532)
        );

        let request = volume(1).with_channel(Channel::new(561, 150.0, "Open"));
        assert!(matches!(
            compile(&request).unwrap_err(),
            CompilationError::InvalidPower { .. }
        ));

        let request = volume(1).with_channel(Channel::new(561, 10.0, "GFP"));
        assert!(matches!(
            compile(&request).unwrap_err(),
            CompilationError::UnknownFilter { .. }
        ));

        let request = volume(1).with_z_range(ZRange::new(790.0, 810.0, 10.0));
        assert!(matches!(
            compile(&request).unwrap_err(),
            CompilationError::OutOfRange { what, .. } if what == "z_um"
        ));

        let request = volume(1).with_angle(ProjectionAngle::new(45.0));
        assert!(matches!(
            compile(&request).unwrap_err(),
            CompilationError::OutOfRange { what, .. } if what == "tilt_deg"
        ));

        let request = volume(1).with_position(StagePosition {
            label: "far".into(),
            x_mm: 100.0,
            y_mm: 0.0,
        });
        assert!(matches!(
            compile(&request).unwrap_err(),
            CompilationError::OutOfRange { what, .. } if what == "x_mm"
        ));
    }

    #[test]
    fn rejects_autofocus_during_z_scan() {
        let request = volume(11).with_autofocus(true);
        assert_eq!(
            compile(&request).unwrap_err(),
            CompilationError::AutofocusConflict(DeviceId::from("piezo"))
        );
    }

    #[test]
    fn rejects_buffer_over_budget() {
        let compiler = PlanCompiler::new(CompilerConfig {
            max_buffer_bytes: 4 * 512 * 512,
            ..CompilerConfig::default()
        });
        assert!(compiler.compile(&volume(2), &instrument()).is_ok());
        let err = compiler.compile(&volume(3), &instrument()).unwrap_err();
        assert_eq!(
            err,
            CompilationError::BufferExceeded {
                bytes: 6 * 512 * 512,
                limit: 4 * 512 * 512,
            }
        );
    }

    #[test]
    fn rejects_missing_and_ambiguous_devices() {
        let devices: Vec<DeviceDescriptor> = instrument()
            .into_iter()
            .filter(|d| d.kind != DeviceKind::Camera)
            .collect();
        assert_eq!(
            PlanCompiler::default().compile(&volume(1), &devices).unwrap_err(),
            CompilationError::MissingDevice(DeviceKind::Camera)
        );

        let mut devices = instrument();
        devices.push(
            DeviceDescriptor::new("camera_2", DeviceKind::Camera)
                .with_capability(Capability::Triggerable)
                .with_sensor(512, 512),
        );
        assert!(matches!(
            PlanCompiler::default().compile(&volume(1), &devices).unwrap_err(),
            CompilationError::AmbiguousDevice { kind: DeviceKind::Camera, .. }
        ));
    }
}
