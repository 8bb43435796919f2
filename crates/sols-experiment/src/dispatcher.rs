//! Synchronization dispatcher.
//!
//! One task per run. The dispatcher walks the plan's commands in issue order
//! (issue offset, then step, then position within the step), sleeps until
//! each command's issue time on the shared clock and hands it to the Device
//! Abstraction Layer. Completion and fault events come back on the DAL's
//! ordered event queue.
//!
//! # Rules
//!
//! - A command is only issued to a device with nothing in flight; if the
//!   device is still busy when its slot comes up, the dispatcher waits for
//!   the completion event, but only up to `planned issue + step tolerance`.
//!   A command still held back after that is a timing violation.
//! - A camera trigger waits until every configure command of its step has
//!   completed, under the same limit.
//! - A command not completed by `planned issue + expected + step tolerance`
//!   is a timing violation and faults the run. Deadlines are taken from the
//!   plan, never from when the command actually went out, so small delays
//!   cannot accumulate from step to step.
//! - A fault event faults the run. In-flight commands are drained (bounded by
//!   [`SHUTDOWN_TIMEOUT`]) so the event queue is clean for the next run.
//! - Pause lets the current step finish, then waits. Resume rebases the rest
//!   of the timeline onto the current time, keeping the spacing between
//!   steps, and tells the correlator about the new time base.
//! - Stop issues nothing further, drains in-flight commands and completes.

use sols_core::clock::Clock;
use sols_core::device::DeviceId;
use sols_core::error::RunError;
use sols_core::event::{DeviceEvent, DeviceEventKind};
use sols_core::frame::TriggerRecord;
use sols_core::limits::SHUTDOWN_TIMEOUT;
use sols_core::plan::{StepAction, TimingPlan};
use sols_hardware::DeviceRegistry;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::correlator::{CorrelatorNote, ScheduleAnchor, TimeBase};
use crate::state::{RunState, RunStateMachine};

/// Operator commands forwarded to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Finish the current step, then pause
    Pause,
    /// Continue a paused run
    Resume,
    /// Issue nothing further and complete once drained
    Stop,
    /// Fault the run immediately
    Abort,
}

/// How a dispatcher run ended.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchReport {
    /// Final run state
    pub final_state: RunState,
    /// Steps whose every command completed
    pub steps_completed: usize,
    /// Fatal error, if the run faulted
    pub faults: Vec<RunError>,
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    seq: u64,
    step: usize,
    deadline: Duration,
}

/// Drives one timing plan through the DAL.
pub struct Dispatcher {
    registry: DeviceRegistry,
    plan: Arc<TimingPlan>,
    state: Arc<RunStateMachine>,
    clock: Arc<dyn Clock>,
    notes: mpsc::UnboundedSender<CorrelatorNote>,
    order: Vec<(usize, usize)>,
    next: usize,
    base: TimeBase,
    mode: RunState,
    in_flight: BTreeMap<DeviceId, InFlight>,
    issued: Vec<usize>,
    outstanding: Vec<usize>,
    steps_completed: usize,
    marked: bool,
}

impl Dispatcher {
    /// Dispatcher for an armed plan. The state machine must already be `Running`.
    pub fn new(
        registry: DeviceRegistry,
        plan: Arc<TimingPlan>,
        state: Arc<RunStateMachine>,
        notes: mpsc::UnboundedSender<CorrelatorNote>,
    ) -> Self {
        let order = plan.issue_order();
        let outstanding = plan.steps.iter().map(|s| s.commands.len()).collect();
        Self {
            clock: registry.clock(),
            registry,
            issued: vec![0; plan.len()],
            plan,
            state,
            notes,
            order,
            next: 0,
            base: TimeBase::default(),
            mode: RunState::Running,
            in_flight: BTreeMap::new(),
            outstanding,
            steps_completed: 0,
            marked: false,
        }
    }

    /// Execute the plan until it completes, stops or faults.
    pub async fn run(
        mut self,
        events: &mut mpsc::Receiver<DeviceEvent>,
        control: &mut mpsc::Receiver<ControlCommand>,
    ) -> DispatchReport {
        self.base = TimeBase::starting_at(self.clock.now());
        self.note(CorrelatorNote::Anchor(ScheduleAnchor {
            from_step: 0,
            base: self.base,
        }));
        info!(
            steps = self.plan.len(),
            commands = self.order.len(),
            "Dispatcher started"
        );

        let (final_state, faults) = match self.drive(events, control).await {
            Ok(state) => (state, Vec::new()),
            Err(err) => {
                error!(step = err.step(), device = ?err.device(), "Run faulted: {}", err);
                self.note(CorrelatorNote::Fault {
                    step: err.step(),
                    at: self.clock.now(),
                });
                self.enter(RunState::Faulted, err.to_string());
                self.drain(events).await;
                (RunState::Faulted, vec![err])
            }
        };

        self.registry.end_run();
        info!(
            state = %final_state,
            steps_completed = self.steps_completed,
            "Dispatcher finished"
        );
        DispatchReport {
            final_state,
            steps_completed: self.steps_completed,
            faults,
        }
    }

    async fn drive(
        &mut self,
        events: &mut mpsc::Receiver<DeviceEvent>,
        control: &mut mpsc::Receiver<ControlCommand>,
    ) -> Result<RunState, RunError> {
        loop {
            if self.in_flight.is_empty() {
                match self.mode {
                    RunState::Stopping => {
                        self.enter(RunState::Completed, "stopped");
                        return Ok(RunState::Completed);
                    }
                    RunState::Pausing if !self.mid_step() => {
                        self.enter(RunState::Paused, "paused at step boundary");
                        self.mode = RunState::Paused;
                    }
                    RunState::Running if self.next >= self.order.len() => {
                        self.enter(RunState::Completed, "plan finished");
                        return Ok(RunState::Completed);
                    }
                    _ => {}
                }
            }

            if self.mode == RunState::Paused {
                tokio::select! {
                    Some(command) = control.recv() => self.on_control(command)?,
                    Some(event) = events.recv() => self.on_event(event)?,
                    else => return Err(self.aborted()),
                }
                continue;
            }

            let now = self.clock.now();
            // Strictly after the earliest deadline.
            let mut wake = self
                .in_flight
                .values()
                .map(|f| f.deadline + Duration::from_micros(1))
                .min();
            if let Some((s, c)) = self.next_command() {
                let planned = self.planned_issue(s, c);
                let at = if self.blocker(s, c).is_some() {
                    planned + self.plan.steps[s].tolerance + Duration::from_micros(1)
                } else if now >= planned {
                    self.issue()?;
                    continue;
                } else {
                    planned
                };
                wake = Some(wake.map_or(at, |w| w.min(at)));
            }

            let sleep = tokio::time::sleep_until(self.clock.instant_at(wake.unwrap_or(now)));
            tokio::select! {
                biased;
                Some(event) = events.recv() => self.on_event(event)?,
                Some(command) = control.recv() => self.on_control(command)?,
                _ = sleep, if wake.is_some() => {
                    while let Ok(event) = events.try_recv() {
                        self.on_event(event)?;
                    }
                    self.check_deadlines()?;
                }
                else => return Err(self.aborted()),
            }
        }
    }

    /// Whether the next command belongs to a step that is already partly issued.
    fn mid_step(&self) -> bool {
        self.order
            .get(self.next)
            .is_some_and(|(step, _)| self.issued[*step] > 0)
    }

    /// The next command, unless the mode forbids issuing it.
    fn next_command(&self) -> Option<(usize, usize)> {
        let &(s, c) = self.order.get(self.next)?;
        let may_issue = match self.mode {
            RunState::Running => true,
            RunState::Pausing => self.issued[s] > 0,
            _ => false,
        };
        may_issue.then_some((s, c))
    }

    fn planned_issue(&self, s: usize, c: usize) -> Duration {
        self.base.to_clock(self.plan.steps[s].commands[c].issue_offset)
    }

    /// In-flight device holding back command `c` of step `s`.
    fn blocker(&self, s: usize, c: usize) -> Option<&DeviceId> {
        let command = &self.plan.steps[s].commands[c];
        if self.in_flight.contains_key(&command.device) {
            return Some(&command.device);
        }
        if command.action == StepAction::Trigger {
            return self
                .in_flight
                .iter()
                .find(|(_, f)| f.step == s)
                .map(|(device, _)| device);
        }
        None
    }

    fn issue(&mut self) -> Result<(), RunError> {
        let Some(&(s, c)) = self.order.get(self.next) else {
            return Ok(());
        };
        let plan = self.plan.clone();
        let step = &plan.steps[s];
        let command = &step.commands[c];

        if !self.marked {
            self.registry.mark_issued();
            self.marked = true;
        }
        let ticket = match &command.action {
            StepAction::Configure { target } => {
                self.registry.configure(&command.device, target.clone(), s)
            }
            StepAction::Trigger => self.registry.trigger(
                &command.device,
                TriggerRecord {
                    exposure: step.exposure,
                    state: step.state,
                },
                s,
            ),
        }
        .map_err(|e| RunError::DeviceFault {
            step: s,
            coordinate: step.coordinate,
            device: command.device.clone(),
            message: e.to_string(),
        })?;

        let issued_at = self.clock.now();
        let planned = self.base.to_clock(command.issue_offset);
        self.in_flight.insert(
            command.device.clone(),
            InFlight {
                seq: ticket.seq,
                step: s,
                deadline: planned + command.completion_budget(step.tolerance),
            },
        );
        self.issued[s] += 1;
        self.next += 1;
        debug!(
            step = s,
            device = %command.device,
            seq = ticket.seq,
            late_us = issued_at.saturating_sub(planned).as_micros() as u64,
            "Issued"
        );
        Ok(())
    }

    fn on_event(&mut self, event: DeviceEvent) -> Result<(), RunError> {
        let Some(flight) = self.in_flight.get(&event.device).copied() else {
            debug!(device = %event.device, seq = event.ticket.seq, "Ignoring event not issued by this run");
            return Ok(());
        };
        if flight.seq != event.ticket.seq {
            debug!(device = %event.device, seq = event.ticket.seq, "Ignoring stale event");
            return Ok(());
        }
        self.in_flight.remove(&event.device);

        match event.kind {
            DeviceEventKind::Completed if event.timestamp > flight.deadline => {
                let step = &self.plan.steps[flight.step];
                Err(RunError::TimingViolation {
                    step: flight.step,
                    coordinate: step.coordinate,
                    device: event.device,
                    late_by: event.timestamp - flight.deadline,
                    detail: format!("completed outside tolerance of {:?}", step.tolerance),
                })
            }
            DeviceEventKind::Completed => {
                let remaining = &mut self.outstanding[flight.step];
                *remaining = remaining.saturating_sub(1);
                if *remaining == 0 {
                    self.steps_completed += 1;
                    debug!(step = flight.step, "Step complete");
                }
                Ok(())
            }
            DeviceEventKind::Fault { message } => Err(RunError::DeviceFault {
                step: flight.step,
                coordinate: self.plan.steps[flight.step].coordinate,
                device: event.device,
                message,
            }),
        }
    }

    fn on_control(&mut self, command: ControlCommand) -> Result<(), RunError> {
        match (command, self.mode) {
            (ControlCommand::Pause, RunState::Running) if self.next >= self.order.len() => {
                debug!("Pause ignored, every command already issued");
            }
            (ControlCommand::Pause, RunState::Running) => {
                self.enter(RunState::Pausing, "pause requested");
                self.mode = RunState::Pausing;
            }
            (ControlCommand::Resume, RunState::Paused) => {
                self.rebase();
                self.enter(RunState::Running, "resumed");
                self.mode = RunState::Running;
            }
            (ControlCommand::Stop, RunState::Running | RunState::Pausing | RunState::Paused) => {
                self.enter(RunState::Stopping, "stop requested");
                self.mode = RunState::Stopping;
            }
            (ControlCommand::Abort, _) => return Err(self.aborted()),
            (command, mode) => {
                debug!(?command, %mode, "Ignoring control command");
            }
        }
        Ok(())
    }

    /// Anchor the remaining timeline at the current time.
    fn rebase(&mut self) {
        let Some(&(s, c)) = self.order.get(self.next) else {
            return;
        };
        self.base = TimeBase {
            plan_origin: self.plan.steps[s].commands[c].issue_offset,
            clock_origin: self.clock.now(),
        };
        info!(from_step = s, "Timeline rebased");
        self.note(CorrelatorNote::Anchor(ScheduleAnchor {
            from_step: s,
            base: self.base,
        }));
    }

    fn check_deadlines(&self) -> Result<(), RunError> {
        let now = self.clock.now();
        let overdue = self
            .in_flight
            .iter()
            .filter(|(_, f)| now > f.deadline)
            .min_by_key(|(_, f)| f.deadline);
        if let Some((device, flight)) = overdue {
            let step = &self.plan.steps[flight.step];
            return Err(RunError::TimingViolation {
                step: flight.step,
                coordinate: step.coordinate,
                device: device.clone(),
                late_by: now - flight.deadline,
                detail: format!("no completion within tolerance of {:?}", step.tolerance),
            });
        }

        let Some((s, c)) = self.next_command() else {
            return Ok(());
        };
        let step = &self.plan.steps[s];
        let latest = self.planned_issue(s, c) + step.tolerance;
        match self.blocker(s, c) {
            Some(device) if now > latest => Err(RunError::TimingViolation {
                step: s,
                coordinate: step.coordinate,
                device: device.clone(),
                late_by: now - latest,
                detail: format!(
                    "'{}' could not be issued within tolerance of {:?}",
                    step.commands[c].device, step.tolerance
                ),
            }),
            _ => Ok(()),
        }
    }

    fn aborted(&self) -> RunError {
        let step = self
            .order
            .get(self.next)
            .map(|(s, _)| *s)
            .unwrap_or_else(|| self.plan.len().saturating_sub(1));
        RunError::Aborted {
            step,
            coordinate: self
                .plan
                .step(step)
                .map(|s| s.coordinate)
                .unwrap_or_default(),
        }
    }

    /// Wait for in-flight commands after a fault.
    async fn drain(&mut self, events: &mut mpsc::Receiver<DeviceEvent>) {
        let deadline = tokio::time::Instant::now() + SHUTDOWN_TIMEOUT;
        while !self.in_flight.is_empty() {
            match tokio::time::timeout_at(deadline, events.recv()).await {
                Ok(Some(event)) => {
                    if self
                        .in_flight
                        .get(&event.device)
                        .is_some_and(|f| f.seq == event.ticket.seq)
                    {
                        self.in_flight.remove(&event.device);
                    }
                }
                Ok(None) | Err(_) => {
                    warn!(
                        pending = ?self.in_flight.keys().collect::<Vec<_>>(),
                        "In-flight commands did not drain"
                    );
                    break;
                }
            }
        }
    }

    fn enter(&self, to: RunState, reason: impl Into<String>) {
        if let Err(e) = self.state.transition(to, reason) {
            warn!("Dispatcher state change refused: {}", e);
        }
    }

    fn note(&self, note: CorrelatorNote) {
        if self.notes.send(note).is_err() {
            debug!("Correlator gone");
        }
    }
}
