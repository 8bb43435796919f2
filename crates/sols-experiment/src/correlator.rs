//! Frame/event correlator.
//!
//! Camera frames arrive on their own queue, independently of the device
//! events the dispatcher consumes. The correlator pairs each frame with the
//! plan step that produced it by looking at two things the frame carries:
//! its capture timestamp and the trigger record the camera echoes back.
//!
//! A step is a candidate when its scheduled exposure start, mapped onto the
//! shared clock through the active [`TimeBase`], lies within the step's
//! tolerance of the capture timestamp. Among candidates, only those whose
//! device-state vector equals the trigger record's count. Exactly one match
//! gives a confident correlation; anything else is emitted flagged. Frames
//! from camera preframe steps are flagged [`CorrelationIssue::Preframe`] and
//! carry no coordinate. Frames are never dropped.
//!
//! [`correlate`] is a pure function of the frame, the plan and the
//! [`RunSchedule`], so correlating the same frame twice gives the same
//! answer.

use serde::{Deserialize, Serialize};
use sols_core::clock::Clock;
use sols_core::frame::CameraFrame;
use sols_core::plan::{LogicalCoordinate, PlanStep, TimingPlan};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

// =============================================================================
// Schedule
// =============================================================================

/// Mapping from plan offsets onto the shared clock.
///
/// Plan offset `plan_origin` corresponds to clock reading `clock_origin`.
/// Resuming a paused run installs a new base so the remaining steps keep
/// their relative spacing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeBase {
    /// Plan offset the base is anchored at
    pub plan_origin: Duration,
    /// Clock reading for `plan_origin`
    pub clock_origin: Duration,
}

impl TimeBase {
    /// Base mapping plan offset zero onto `clock_origin`.
    pub fn starting_at(clock_origin: Duration) -> Self {
        Self {
            plan_origin: Duration::ZERO,
            clock_origin,
        }
    }

    /// Clock reading at which plan offset `offset` falls.
    pub fn to_clock(&self, offset: Duration) -> Duration {
        self.clock_origin
            .saturating_add(offset.saturating_sub(self.plan_origin))
    }
}

/// A time base applying from `from_step` onwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleAnchor {
    /// First step the base applies to
    pub from_step: usize,
    /// Time base
    pub base: TimeBase,
}

/// What the dispatcher tells the correlator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrelatorNote {
    /// The timeline was (re)based
    Anchor(ScheduleAnchor),
    /// The run faulted
    Fault {
        /// Step being executed
        step: usize,
        /// Time of the fault on the shared clock
        at: Duration,
    },
}

/// Everything the correlator knows about when steps actually ran.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSchedule {
    anchors: Vec<ScheduleAnchor>,
    fault_at: Option<Duration>,
}

impl RunSchedule {
    /// Schedule with a single base from step zero.
    pub fn new(base: TimeBase) -> Self {
        Self {
            anchors: vec![ScheduleAnchor { from_step: 0, base }],
            fault_at: None,
        }
    }

    /// Apply a dispatcher note.
    pub fn apply(&mut self, note: CorrelatorNote) {
        match note {
            CorrelatorNote::Anchor(anchor) => {
                self.anchors.retain(|a| a.from_step < anchor.from_step);
                self.anchors.push(anchor);
            }
            CorrelatorNote::Fault { at, .. } => {
                self.fault_at = Some(self.fault_at.map_or(at, |f| f.min(at)));
            }
        }
    }

    /// Time base in force for a step.
    pub fn base_for(&self, step: usize) -> TimeBase {
        self.anchors
            .iter()
            .rev()
            .find(|a| a.from_step <= step)
            .map(|a| a.base)
            .unwrap_or_default()
    }

    /// Exposure start of a step on the shared clock.
    pub fn expected_capture(&self, step: &PlanStep) -> Duration {
        self.base_for(step.index).to_clock(step.offset)
    }

    /// Earliest fault, if any.
    pub fn fault_at(&self) -> Option<Duration> {
        self.fault_at
    }
}

// =============================================================================
// Correlation
// =============================================================================

/// Why a frame could not be correlated with confidence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum CorrelationIssue {
    /// No step's window contains the capture timestamp
    NoCandidate,
    /// Several steps match both time and state
    Ambiguous {
        /// Matching steps
        steps: Vec<usize>,
    },
    /// Steps match in time but none in state
    StateMismatch,
    /// Captured after the run faulted
    AfterFault,
    /// Camera preframe, excluded from the dataset
    Preframe,
}

/// A camera frame tagged with the plan step that produced it.
#[derive(Debug, Clone)]
pub struct CorrelatedFrame {
    /// The frame
    pub frame: CameraFrame,
    /// Matched step index
    pub step: Option<usize>,
    /// Logical coordinate of the matched step
    pub coordinate: Option<LogicalCoordinate>,
    /// Exactly one step matched and the run had not faulted
    pub confident: bool,
    /// Reason the match is not confident
    pub issue: Option<CorrelationIssue>,
}

/// Correlate one frame against the plan.
pub fn correlate(frame: CameraFrame, plan: &TimingPlan, schedule: &RunSchedule) -> CorrelatedFrame {
    let capture = frame.capture_timestamp;
    let window = plan.max_tolerance;

    // Expected capture times are non-decreasing in step index.
    let first = plan
        .steps
        .partition_point(|s| schedule.expected_capture(s).saturating_add(window) < capture);

    let mut in_window: Vec<&PlanStep> = Vec::new();
    for step in &plan.steps[first..] {
        let expected = schedule.expected_capture(step);
        if expected > capture.saturating_add(window) {
            break;
        }
        let lo = expected.saturating_sub(step.tolerance);
        let hi = expected.saturating_add(step.tolerance);
        if capture >= lo && capture <= hi {
            in_window.push(step);
        }
    }

    let matching: Vec<&PlanStep> = in_window
        .iter()
        .copied()
        .filter(|s| s.state == frame.trigger.state && s.exposure == frame.trigger.exposure)
        .collect();

    let (step, issue) = match (matching.as_slice(), in_window.as_slice()) {
        ([only], _) => (Some(*only), None),
        ([], []) => (None, Some(CorrelationIssue::NoCandidate)),
        ([], candidates) => {
            let nearest = candidates
                .iter()
                .min_by_key(|s| abs_diff(schedule.expected_capture(s), capture))
                .copied();
            (nearest, Some(CorrelationIssue::StateMismatch))
        }
        (many, _) => (
            None,
            Some(CorrelationIssue::Ambiguous {
                steps: many.iter().map(|s| s.index).collect(),
            }),
        ),
    };

    let issue = match (issue, step) {
        (None, Some(s)) if s.is_preframe() => Some(CorrelationIssue::Preframe),
        (issue, _) => issue,
    };
    let issue = match schedule.fault_at() {
        Some(fault) if capture > fault => Some(CorrelationIssue::AfterFault),
        _ => issue,
    };

    CorrelatedFrame {
        frame,
        step: step.map(|s| s.index),
        coordinate: step.and_then(PlanStep::logical),
        confident: issue.is_none(),
        issue,
    }
}

fn abs_diff(a: Duration, b: Duration) -> Duration {
    if a > b {
        a - b
    } else {
        b - a
    }
}

/// Per-run frame tallies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameCounts {
    /// Frames received
    pub total: u64,
    /// Confidently correlated
    pub confident: u64,
    /// Flagged `NoCandidate`
    pub no_candidate: u64,
    /// Flagged `Ambiguous`
    pub ambiguous: u64,
    /// Flagged `StateMismatch`
    pub state_mismatch: u64,
    /// Flagged `AfterFault`
    pub after_fault: u64,
    /// Camera preframes
    #[serde(default)]
    pub preframes: u64,
}

impl FrameCounts {
    fn record(&mut self, frame: &CorrelatedFrame) {
        self.total += 1;
        match &frame.issue {
            None => self.confident += 1,
            Some(CorrelationIssue::NoCandidate) => self.no_candidate += 1,
            Some(CorrelationIssue::Ambiguous { .. }) => self.ambiguous += 1,
            Some(CorrelationIssue::StateMismatch) => self.state_mismatch += 1,
            Some(CorrelationIssue::AfterFault) => self.after_fault += 1,
            Some(CorrelationIssue::Preframe) => self.preframes += 1,
        }
    }

    /// Frames that belong to the dataset.
    pub fn acquired(&self) -> u64 {
        self.total - self.preframes
    }
}

// =============================================================================
// Correlator Task
// =============================================================================

/// Correlator for one run.
///
/// Frames are held for the plan's maximum tolerance and released in capture
/// order, so a fault note or a new time base that is raced by a frame still
/// applies to it.
pub struct Correlator {
    plan: Arc<TimingPlan>,
    clock: Arc<dyn Clock>,
    schedule: RunSchedule,
    pending: BTreeMap<(Duration, u64), CameraFrame>,
    counts: FrameCounts,
    output_open: bool,
}

impl Correlator {
    /// Correlator for `plan`.
    pub fn new(plan: Arc<TimingPlan>, clock: Arc<dyn Clock>) -> Self {
        Self {
            plan,
            clock,
            schedule: RunSchedule::default(),
            pending: BTreeMap::new(),
            counts: FrameCounts::default(),
            output_open: true,
        }
    }

    /// Run until the dispatcher hangs up its note channel, then flush.
    pub async fn run(
        mut self,
        frames: &mut mpsc::Receiver<CameraFrame>,
        mut notes: mpsc::UnboundedReceiver<CorrelatorNote>,
        output: mpsc::Sender<CorrelatedFrame>,
    ) -> FrameCounts {
        let window = self.plan.max_tolerance;
        loop {
            let release = self
                .pending
                .keys()
                .next()
                .map(|(capture, _)| capture.saturating_add(window));
            let sleep = tokio::time::sleep_until(
                self.clock.instant_at(release.unwrap_or_default()),
            );

            tokio::select! {
                biased;
                note = notes.recv() => match note {
                    Some(note) => self.schedule.apply(note),
                    None => break,
                },
                Some(frame) = frames.recv() => self.hold(frame),
                _ = sleep, if release.is_some() => self.release_due(&output).await,
            }
        }

        // Every triggered exposure has been delivered by now.
        while let Ok(frame) = frames.try_recv() {
            self.hold(frame);
        }
        let pending = std::mem::take(&mut self.pending);
        for frame in pending.into_values() {
            self.emit(frame, &output).await;
        }
        debug!(counts = ?self.counts, "Correlator finished");
        self.counts
    }

    fn hold(&mut self, frame: CameraFrame) {
        self.pending
            .insert((frame.capture_timestamp, frame.sequence), frame);
    }

    async fn release_due(&mut self, output: &mpsc::Sender<CorrelatedFrame>) {
        let now = self.clock.now();
        let window = self.plan.max_tolerance;
        while let Some(entry) = self.pending.first_entry() {
            if entry.key().0.saturating_add(window) > now {
                break;
            }
            let frame = entry.remove();
            self.emit(frame, output).await;
        }
    }

    async fn emit(&mut self, frame: CameraFrame, output: &mpsc::Sender<CorrelatedFrame>) {
        let correlated = correlate(frame, &self.plan, &self.schedule);
        self.counts.record(&correlated);
        match &correlated.issue {
            None => {}
            Some(CorrelationIssue::Preframe) => {
                debug!(sequence = correlated.frame.sequence, "Camera preframe excluded");
            }
            Some(issue) => warn!(
                sequence = correlated.frame.sequence,
                capture_us = correlated.frame.capture_timestamp.as_micros() as u64,
                ?issue,
                "Frame not confidently correlated"
            ),
        }
        if self.output_open && output.send(correlated).await.is_err() {
            debug!("Correlated frame receiver dropped");
            self.output_open = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use sols_core::device::DeviceId;
    use sols_core::frame::TriggerRecord;
    use sols_core::plan::{DeviceStateVector, StepAction, StepCommand, StepKind};

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    fn step(index: usize, offset_ms: u64, z_um: f64) -> PlanStep {
        PlanStep {
            index,
            kind: StepKind::Acquire,
            coordinate: LogicalCoordinate {
                z_index: index as u32,
                ..Default::default()
            },
            state: DeviceStateVector {
                z_um,
                ..Default::default()
            },
            offset: ms(offset_ms),
            exposure: ms(10),
            tolerance: ms(1),
            commands: vec![StepCommand {
                device: DeviceId::from("camera"),
                action: StepAction::Trigger,
                issue_offset: ms(offset_ms),
                expected: ms(15),
            }],
        }
    }

    fn plan() -> TimingPlan {
        TimingPlan {
            steps: vec![step(0, 50, 0.0), step(1, 65, 1.0), step(2, 80, 2.0)],
            camera: DeviceId::from("camera"),
            max_tolerance: ms(1),
            duration: ms(90),
        }
    }

    fn frame(sequence: u64, capture: Duration, z_um: f64) -> CameraFrame {
        CameraFrame {
            sequence,
            capture_timestamp: capture,
            height: 1,
            width: 1,
            buffer: Bytes::from_static(&[0, 0]),
            trigger: TriggerRecord {
                exposure: ms(10),
                state: DeviceStateVector {
                    z_um,
                    ..Default::default()
                },
            },
        }
    }

    #[test]
    fn matches_by_time_and_state() {
        let schedule = RunSchedule::new(TimeBase::starting_at(ms(100)));
        let out = correlate(frame(1, ms(165) + Duration::from_micros(400), 1.0), &plan(), &schedule);
        assert!(out.confident);
        assert_eq!(out.step, Some(1));
        assert_eq!(out.coordinate.map(|c| c.z_index), Some(1));
    }

    #[test]
    fn flags_without_dropping() {
        let schedule = RunSchedule::new(TimeBase::starting_at(ms(100)));

        let out = correlate(frame(0, ms(172), 1.0), &plan(), &schedule);
        assert_eq!(out.issue, Some(CorrelationIssue::NoCandidate));
        assert_eq!(out.step, None);

        let out = correlate(frame(0, ms(165), 7.0), &plan(), &schedule);
        assert_eq!(out.issue, Some(CorrelationIssue::StateMismatch));
        assert_eq!(out.step, Some(1));
        assert!(!out.confident);
    }

    #[test]
    fn ambiguous_when_windows_overlap() {
        let mut overlapping = plan();
        overlapping.steps[1].offset = ms(51);
        overlapping.steps[1].state.z_um = 0.0;
        let schedule = RunSchedule::new(TimeBase::default());
        let out = correlate(frame(0, Duration::from_micros(50_500), 0.0), &overlapping, &schedule);
        assert_eq!(
            out.issue,
            Some(CorrelationIssue::Ambiguous { steps: vec![0, 1] })
        );
    }

    #[test]
    fn preframes_are_flagged_without_coordinate() {
        let mut with_preframe = plan();
        with_preframe.steps[0].kind = StepKind::Preframe;
        let schedule = RunSchedule::new(TimeBase::default());

        let out = correlate(frame(0, ms(50), 0.0), &with_preframe, &schedule);
        assert_eq!(out.issue, Some(CorrelationIssue::Preframe));
        assert_eq!(out.step, Some(0));
        assert_eq!(out.coordinate, None);
        assert!(!out.confident);

        let out = correlate(frame(1, ms(65), 1.0), &with_preframe, &schedule);
        assert!(out.confident);
        assert_eq!(out.coordinate.map(|c| c.z_index), Some(1));
    }

    #[test]
    fn resumed_steps_use_new_base() {
        let mut schedule = RunSchedule::new(TimeBase::starting_at(ms(0)));
        schedule.apply(CorrelatorNote::Anchor(ScheduleAnchor {
            from_step: 2,
            base: TimeBase {
                plan_origin: ms(75),
                clock_origin: ms(500),
            },
        }));
        assert_eq!(schedule.expected_capture(&plan().steps[1]), ms(65));
        assert_eq!(schedule.expected_capture(&plan().steps[2]), ms(505));

        let out = correlate(frame(2, ms(505), 2.0), &plan(), &schedule);
        assert!(out.confident);
        assert_eq!(out.step, Some(2));
    }

    #[test]
    fn frames_after_fault_are_flagged() {
        let mut schedule = RunSchedule::new(TimeBase::default());
        schedule.apply(CorrelatorNote::Fault { step: 1, at: ms(60) });
        let out = correlate(frame(1, ms(65), 1.0), &plan(), &schedule);
        assert_eq!(out.issue, Some(CorrelationIssue::AfterFault));
        assert_eq!(out.step, Some(1));
        assert!(!out.confident);
    }

    #[test]
    fn correlation_is_idempotent() {
        let schedule = RunSchedule::new(TimeBase::starting_at(ms(3)));
        let input = frame(4, ms(83), 2.0);
        let a = correlate(input.clone(), &plan(), &schedule);
        let b = correlate(input, &plan(), &schedule);
        assert_eq!(
            (a.step, a.coordinate, a.confident, a.issue),
            (b.step, b.coordinate, b.confident, b.issue)
        );
        assert!(a.confident);
    }

    #[tokio::test(start_paused = true)]
    async fn task_releases_in_capture_order() {
        let clock: Arc<dyn Clock> = Arc::new(sols_core::clock::MonotonicClock::new());
        let (frames_tx, mut frames_rx) = mpsc::channel(8);
        let (notes_tx, notes_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::channel(8);

        notes_tx
            .send(CorrelatorNote::Anchor(ScheduleAnchor {
                from_step: 0,
                base: TimeBase::default(),
            }))
            .unwrap();
        // Delivered out of order.
        frames_tx.send(frame(1, ms(65), 1.0)).await.unwrap();
        frames_tx.send(frame(0, ms(50), 0.0)).await.unwrap();
        drop(notes_tx);

        let counts = Correlator::new(Arc::new(plan()), clock)
            .run(&mut frames_rx, notes_rx, out_tx)
            .await;
        assert_eq!(counts.total, 2);
        assert_eq!(counts.confident, 2);
        assert_eq!(out_rx.recv().await.unwrap().step, Some(0));
        assert_eq!(out_rx.recv().await.unwrap().step, Some(1));
    }
}
