//! Acquisition controller.
//!
//! The operator-facing entry point. It owns the run state machine and the
//! DAL's event and frame queues, and wires one dispatcher and one correlator
//! task per run.
//!
//! ```text
//! arm(request) ──▶ compile ──▶ preflight ──▶ Armed
//! start()      ──▶ spawn { dispatcher ║ correlator } ──▶ Running
//! pause/resume/stop/abort ──▶ control channel ──▶ dispatcher
//! wait()       ──▶ RunManifest
//! ```

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sols_core::config::{CompilerConfig, QueueSettings, Settings};
use sols_core::device::{DeviceDescriptor, DeviceId};
use sols_core::error::{AppResult, RunError, SequencerError};
use sols_core::event::DeviceEvent;
use sols_core::frame::CameraFrame;
use sols_core::limits::CONTROL_QUEUE_CAPACITY;
use sols_core::plan::TimingPlan;
use sols_core::request::AcquisitionRequest;
use sols_hardware::DeviceRegistry;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use crate::compiler::PlanCompiler;
use crate::correlator::{CorrelatedFrame, Correlator, FrameCounts};
use crate::dispatcher::{ControlCommand, DispatchReport, Dispatcher};
use crate::manifest::{RunManifest, SystemInfo};
use crate::state::{RunState, RunStateMachine, StateTransition};

/// Outcome of a finished run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    /// Dispatcher outcome
    pub dispatch: DispatchReport,
    /// Correlator tallies
    pub frames: FrameCounts,
    /// Wall-clock end of the run
    pub finished_at: DateTime<Utc>,
}

struct ActiveRun {
    run_id: Uuid,
    armed_at: DateTime<Utc>,
    request: AcquisitionRequest,
    plan: Arc<TimingPlan>,
    descriptors: Vec<DeviceDescriptor>,
    history_start: usize,
    control: Option<mpsc::Sender<ControlCommand>>,
    output: Option<mpsc::Receiver<CorrelatedFrame>>,
    output_tx: Option<mpsc::Sender<CorrelatedFrame>>,
    task: Option<JoinHandle<RunReport>>,
    report: Option<RunReport>,
}

/// Arms, starts and supervises acquisition runs against one DAL.
pub struct AcquisitionController {
    registry: DeviceRegistry,
    compiler: PlanCompiler,
    queues: QueueSettings,
    state: Arc<RunStateMachine>,
    events: Arc<tokio::sync::Mutex<mpsc::Receiver<DeviceEvent>>>,
    frames: Arc<tokio::sync::Mutex<mpsc::Receiver<CameraFrame>>>,
    run: Mutex<Option<ActiveRun>>,
}

impl AcquisitionController {
    /// Controller over `registry`.
    ///
    /// Takes the registry's event and frame queues; only one controller may
    /// exist per registry.
    pub fn new(
        registry: DeviceRegistry,
        compiler: CompilerConfig,
        queues: QueueSettings,
    ) -> AppResult<Self> {
        let events = registry
            .take_event_receiver()
            .ok_or_else(|| SequencerError::ChannelClosed("device event queue already taken".into()))?;
        let frames = registry
            .take_frame_receiver()
            .ok_or_else(|| SequencerError::ChannelClosed("camera frame queue already taken".into()))?;
        Ok(Self {
            state: Arc::new(RunStateMachine::new(registry.clock())),
            registry,
            compiler: PlanCompiler::new(compiler),
            queues,
            events: Arc::new(tokio::sync::Mutex::new(events)),
            frames: Arc::new(tokio::sync::Mutex::new(frames)),
            run: Mutex::new(None),
        })
    }

    /// Controller configured from layered settings.
    pub fn from_settings(registry: DeviceRegistry, settings: &Settings) -> AppResult<Self> {
        Self::new(registry, settings.compiler, settings.queues)
    }

    /// The DAL this controller drives.
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Current run state.
    pub fn state(&self) -> RunState {
        self.state.current()
    }

    /// Watch the run state.
    pub fn subscribe_state(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }

    /// Receive every future state transition.
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<StateTransition> {
        self.state.subscribe_transitions()
    }

    /// Plan of the armed or last run.
    pub fn plan(&self) -> Option<Arc<TimingPlan>> {
        self.run.lock().as_ref().map(|r| r.plan.clone())
    }

    /// Compile `request`, preflight its devices and arm.
    ///
    /// A completed or faulted run is cleared first. On a compilation or
    /// preflight error the controller stays idle.
    pub async fn arm(&self, request: AcquisitionRequest) -> AppResult<Arc<TimingPlan>> {
        let current = self.state.current();
        if current.is_terminal() {
            self.state.transition(RunState::Idle, "cleared for next run")?;
            *self.run.lock() = None;
        }
        self.state.check(RunState::Armed)?;

        let descriptors = self.registry.descriptors();
        let plan = Arc::new(self.compiler.compile(&request, &descriptors)?);
        self.registry.preflight(&plan.devices()).await?;

        let history_start = self.state.history_len();
        self.state.transition(
            RunState::Armed,
            format!("{} steps over {} devices", plan.len(), plan.devices().len()),
        )?;
        self.registry.begin_run();

        let (output_tx, output) = mpsc::channel(self.queues.correlated_capacity.max(1));
        let run_id = Uuid::new_v4();
        info!(%run_id, steps = plan.len(), duration = ?plan.duration, "Run armed");
        *self.run.lock() = Some(ActiveRun {
            run_id,
            armed_at: Utc::now(),
            request,
            plan: plan.clone(),
            descriptors,
            history_start,
            control: None,
            output: Some(output),
            output_tx: Some(output_tx),
            task: None,
            report: None,
        });
        Ok(plan)
    }

    /// Start the armed run.
    pub fn start(&self) -> AppResult<()> {
        let mut guard = self.run.lock();
        let run = guard.as_mut().ok_or(SequencerError::NoRun)?;
        if self.state.current() != RunState::Armed {
            return Err(invalid(self.state.current(), RunState::Running));
        }
        let output = run
            .output_tx
            .take()
            .ok_or_else(|| SequencerError::ChannelClosed("correlated frame output".into()))?;
        self.state.transition(RunState::Running, "start")?;

        let (control_tx, mut control_rx) = mpsc::channel(CONTROL_QUEUE_CAPACITY);
        let (notes_tx, notes_rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(
            self.registry.clone(),
            run.plan.clone(),
            self.state.clone(),
            notes_tx,
        );
        let correlator = Correlator::new(run.plan.clone(), self.registry.clock());
        let events = self.events.clone();
        let frames = self.frames.clone();
        let run_id = run.run_id;

        run.control = Some(control_tx);
        run.task = Some(tokio::spawn(async move {
            let mut events = events.lock_owned().await;
            let mut frames = frames.lock_owned().await;
            while let Ok(event) = events.try_recv() {
                debug!(device = %event.device, seq = event.ticket.seq, "Discarding stale event");
            }
            while let Ok(frame) = frames.try_recv() {
                debug!(sequence = frame.sequence, "Discarding stale frame");
            }

            let (dispatch, counts) = tokio::join!(
                dispatcher.run(&mut events, &mut control_rx),
                correlator.run(&mut frames, notes_rx, output),
            );
            info!(%run_id, state = %dispatch.final_state, frames = counts.total, "Run finished");
            RunReport {
                dispatch,
                frames: counts,
                finished_at: Utc::now(),
            }
        }));
        info!(%run_id, "Run started");
        Ok(())
    }

    /// Let the current step finish, then pause.
    pub async fn pause(&self) -> AppResult<()> {
        self.state.check(RunState::Pausing)?;
        self.send(ControlCommand::Pause).await
    }

    /// Continue a paused run.
    pub async fn resume(&self) -> AppResult<()> {
        let current = self.state.current();
        if current != RunState::Paused {
            return Err(invalid(current, RunState::Running));
        }
        self.send(ControlCommand::Resume).await
    }

    /// Issue nothing further and complete once in-flight commands drain.
    pub async fn stop(&self) -> AppResult<()> {
        self.state.check(RunState::Stopping)?;
        self.send(ControlCommand::Stop).await
    }

    /// Fault the run immediately.
    ///
    /// An armed run that never started faults without touching any device.
    pub async fn abort(&self) -> AppResult<()> {
        let current = self.state.current();
        if current != RunState::Armed {
            self.state.check(RunState::Faulted)?;
            return self.send(ControlCommand::Abort).await;
        }

        let mut guard = self.run.lock();
        let run = guard.as_mut().ok_or(SequencerError::NoRun)?;
        let err = RunError::Aborted {
            step: 0,
            coordinate: run
                .plan
                .step(0)
                .map(|s| s.coordinate)
                .unwrap_or_default(),
        };
        self.state.transition(RunState::Faulted, err.to_string())?;
        self.registry.end_run();
        run.output_tx = None;
        run.report = Some(RunReport {
            dispatch: DispatchReport {
                final_state: RunState::Faulted,
                steps_completed: 0,
                faults: vec![err],
            },
            frames: FrameCounts::default(),
            finished_at: Utc::now(),
        });
        Ok(())
    }

    /// Clear a latched device fault. Rejected once a run has issued steps.
    pub async fn reset_fault(&self, device: &DeviceId) -> AppResult<()> {
        self.registry.fault_reset(device).await?;
        Ok(())
    }

    /// Take the correlated frame stream of the armed run.
    pub fn take_frames(&self) -> Option<mpsc::Receiver<CorrelatedFrame>> {
        self.run.lock().as_mut().and_then(|r| r.output.take())
    }

    /// Wait for the run to end and build its manifest.
    ///
    /// Correlated frames nobody took are counted and discarded.
    pub async fn wait(&self) -> AppResult<RunManifest> {
        let task = {
            let mut guard = self.run.lock();
            let run = guard.as_mut().ok_or(SequencerError::NoRun)?;
            run.output = None;
            run.task.take()
        };

        if let Some(task) = task {
            let report = task
                .await
                .map_err(|e| SequencerError::ChannelClosed(format!("run task: {}", e)))?;
            if let Some(run) = self.run.lock().as_mut() {
                run.report = Some(report);
            }
        }

        let guard = self.run.lock();
        let run = guard.as_ref().ok_or(SequencerError::NoRun)?;
        let report = run
            .report
            .as_ref()
            .ok_or_else(|| invalid(self.state.current(), RunState::Completed))?;
        let fingerprint = run
            .plan
            .fingerprint()
            .map_err(|e| SequencerError::Configuration(format!("plan fingerprint: {}", e)))?;
        Ok(RunManifest {
            run_id: run.run_id,
            armed_at: run.armed_at,
            finished_at: report.finished_at,
            system: SystemInfo::collect(),
            request: run.request.clone(),
            plan: (*run.plan).clone(),
            fingerprint,
            devices: run.descriptors.clone(),
            compiler: *self.compiler.config(),
            final_state: report.dispatch.final_state,
            transitions: self.state.history_since(run.history_start),
            faults: report.dispatch.faults.clone(),
            steps_completed: report.dispatch.steps_completed,
            frames: report.frames,
        })
    }

    async fn send(&self, command: ControlCommand) -> AppResult<()> {
        let control = self
            .run
            .lock()
            .as_ref()
            .and_then(|r| r.control.clone())
            .ok_or(SequencerError::NoRun)?;
        debug!(?command, "Control command");
        control
            .send(command)
            .await
            .map_err(|_| SequencerError::ChannelClosed("dispatcher control".into()))
    }
}

impl std::fmt::Debug for AcquisitionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquisitionController")
            .field("state", &self.state.current())
            .field("registry", &self.registry)
            .finish()
    }
}

fn invalid(from: RunState, to: RunState) -> SequencerError {
    SequencerError::InvalidTransition {
        from: from.to_string(),
        to: to.to_string(),
    }
}
