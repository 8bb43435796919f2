//! Acquisition run state machine.
//!
//! ```text
//!            arm           start
//! ┌──────┐ ───────▶ ┌───────┐ ─────▶ ┌─────────┐ ── done ──▶ ┌───────────┐
//! │ Idle │          │ Armed │        │ Running │             │ Completed │
//! └──────┘          └───────┘        └─────────┘             └───────────┘
//!                                   pause │  ▲ resume              ▲
//!                                         ▼  │                     │
//!                              ┌─────────┐  ┌────────┐   stop  ┌──────────┐
//!                              │ Pausing │─▶│ Paused │ ──────▶ │ Stopping │
//!                              └─────────┘  └────────┘         └──────────┘
//!
//! Armed, Running, Pausing, Paused and Stopping may all fall into Faulted.
//! Completed and Faulted return to Idle when the next run is armed.
//! ```
//!
//! [`RunStateMachine`] is the only writer of the run state. The current state
//! is published through a `watch` channel and every transition is broadcast
//! and kept in an in-memory log for the run manifest.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sols_core::clock::Clock;
use sols_core::error::SequencerError;
use sols_core::limits::STATE_BROADCAST_CAPACITY;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

/// State of the acquisition run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// No run armed
    Idle,
    /// Plan compiled and devices preflighted
    Armed,
    /// Dispatcher issuing plan steps
    Running,
    /// Finishing the current step before pausing
    Pausing,
    /// Waiting for resume or stop
    Paused,
    /// Draining in-flight commands before completing
    Stopping,
    /// Run ended normally
    Completed,
    /// Run ended on a fault, a timing violation or an abort
    Faulted,
}

impl RunState {
    /// Whether `self -> to` is a legal transition.
    pub fn can_transition_to(self, to: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, to),
            (Idle, Armed)
                | (Armed, Running)
                | (Running, Pausing)
                | (Pausing, Paused)
                | (Paused, Running)
                | (Running | Pausing | Paused, Stopping)
                | (Running | Stopping, Completed)
                | (Armed | Running | Pausing | Paused | Stopping, Faulted)
                | (Completed | Faulted, Idle)
        )
    }

    /// Whether the run has ended.
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Completed | RunState::Faulted)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RunState::Idle => "idle",
            RunState::Armed => "armed",
            RunState::Running => "running",
            RunState::Pausing => "pausing",
            RunState::Paused => "paused",
            RunState::Stopping => "stopping",
            RunState::Completed => "completed",
            RunState::Faulted => "faulted",
        };
        f.write_str(label)
    }
}

/// One recorded state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    /// Previous state
    pub from: RunState,
    /// New state
    pub to: RunState,
    /// Time of the change on the shared monotonic clock
    pub at: Duration,
    /// Why the state changed
    pub reason: String,
}

/// Single writer of the run state.
pub struct RunStateMachine {
    clock: Arc<dyn Clock>,
    state_tx: watch::Sender<RunState>,
    transitions_tx: broadcast::Sender<StateTransition>,
    log: Mutex<Vec<StateTransition>>,
}

impl RunStateMachine {
    /// Machine in `Idle`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let (state_tx, _) = watch::channel(RunState::Idle);
        let (transitions_tx, _) = broadcast::channel(STATE_BROADCAST_CAPACITY);
        Self {
            clock,
            state_tx,
            transitions_tx,
            log: Mutex::new(Vec::new()),
        }
    }

    /// Current state.
    pub fn current(&self) -> RunState {
        *self.state_tx.borrow()
    }

    /// Watch the current state.
    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.state_tx.subscribe()
    }

    /// Receive every future transition.
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<StateTransition> {
        self.transitions_tx.subscribe()
    }

    /// Check that `to` is reachable from the current state without moving.
    pub fn check(&self, to: RunState) -> Result<RunState, SequencerError> {
        let from = self.current();
        if from.can_transition_to(to) {
            Ok(from)
        } else {
            Err(invalid(from, to))
        }
    }

    /// Move to `to`, recording `reason`.
    pub fn transition(
        &self,
        to: RunState,
        reason: impl Into<String>,
    ) -> Result<StateTransition, SequencerError> {
        let mut log = self.log.lock();
        let from = *self.state_tx.borrow();
        if !from.can_transition_to(to) {
            warn!(%from, %to, "Rejected run state transition");
            return Err(invalid(from, to));
        }
        let record = StateTransition {
            from,
            to,
            at: self.clock.now(),
            reason: reason.into(),
        };
        self.state_tx.send_replace(to);
        log.push(record.clone());
        drop(log);

        info!(from = %record.from, to = %record.to, reason = %record.reason, "Run state changed");
        // No subscribers is fine.
        let _ = self.transitions_tx.send(record.clone());
        Ok(record)
    }

    /// Every transition so far.
    pub fn history(&self) -> Vec<StateTransition> {
        self.log.lock().clone()
    }

    /// Transitions recorded from position `start` of the history onwards.
    pub fn history_since(&self, start: usize) -> Vec<StateTransition> {
        self.log.lock().get(start..).map(<[_]>::to_vec).unwrap_or_default()
    }

    /// Length of the history.
    pub fn history_len(&self) -> usize {
        self.log.lock().len()
    }
}

impl fmt::Debug for RunStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunStateMachine")
            .field("state", &self.current())
            .field("transitions", &self.history_len())
            .finish()
    }
}

fn invalid(from: RunState, to: RunState) -> SequencerError {
    SequencerError::InvalidTransition {
        from: from.to_string(),
        to: to.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sols_core::clock::MonotonicClock;

    fn machine() -> RunStateMachine {
        RunStateMachine::new(Arc::new(MonotonicClock::new()))
    }

    #[test]
    fn transition_table() {
        use RunState::*;
        assert!(Idle.can_transition_to(Armed));
        assert!(Paused.can_transition_to(Running));
        assert!(Pausing.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Completed));
        assert!(Armed.can_transition_to(Faulted));
        assert!(Faulted.can_transition_to(Idle));

        assert!(!Idle.can_transition_to(Running));
        assert!(!Pausing.can_transition_to(Running));
        assert!(!Paused.can_transition_to(Completed));
        assert!(!Idle.can_transition_to(Faulted));
        assert!(!Completed.can_transition_to(Faulted));
    }

    #[tokio::test]
    async fn transitions_are_published_and_logged() {
        let sm = machine();
        let mut state = sm.subscribe();
        let mut transitions = sm.subscribe_transitions();

        sm.transition(RunState::Armed, "armed").unwrap();
        sm.transition(RunState::Running, "start").unwrap();

        assert_eq!(*state.borrow_and_update(), RunState::Running);
        assert_eq!(transitions.recv().await.unwrap().to, RunState::Armed);
        assert_eq!(transitions.recv().await.unwrap().to, RunState::Running);
        assert_eq!(sm.history().len(), 2);
        assert_eq!(sm.history_since(1)[0].reason, "start");
    }

    #[test]
    fn invalid_transition_leaves_state_unchanged() {
        let sm = machine();
        let err = sm.transition(RunState::Running, "skip arm").unwrap_err();
        assert!(matches!(err, SequencerError::InvalidTransition { .. }));
        assert_eq!(sm.current(), RunState::Idle);
        assert!(sm.history().is_empty());
        assert!(sm.check(RunState::Armed).is_ok());
    }
}
