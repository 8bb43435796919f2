//! `sols-experiment`
//!
//! Turns an acquisition request into hardware activity and labelled frames.
//!
//! - [`compiler::PlanCompiler`]: request + device descriptors → [`TimingPlan`]
//! - [`state::RunStateMachine`]: single writer of the run state
//! - [`dispatcher::Dispatcher`]: issues plan commands on the shared clock and
//!   enforces completion deadlines
//! - [`correlator::Correlator`]: matches camera frames to plan steps
//! - [`controller::AcquisitionController`]: arm / start / pause / resume /
//!   stop / abort, one dispatcher and one correlator per run
//! - [`manifest::RunManifest`]: reproducibility record of a run
//! - [`positions::PlateScan`]: multiwell plate position lists
//!
//! ```rust,ignore
//! let controller = AcquisitionController::new(registry, CompilerConfig::default(), QueueSettings::default())?;
//! controller.arm(request).await?;
//! let mut frames = controller.take_frames().unwrap();
//! controller.start()?;
//! while let Some(frame) = frames.recv().await {
//!     println!("{} -> step {:?}", frame.frame.sequence, frame.step);
//! }
//! let manifest = controller.wait().await?;
//! ```
//!
//! [`TimingPlan`]: sols_core::plan::TimingPlan

pub mod compiler;
pub mod controller;
pub mod correlator;
pub mod dispatcher;
pub mod manifest;
pub mod positions;
pub mod state;

pub use compiler::PlanCompiler;
pub use controller::{AcquisitionController, RunReport};
pub use correlator::{CorrelatedFrame, CorrelationIssue, FrameCounts};
pub use dispatcher::ControlCommand;
pub use manifest::RunManifest;
pub use positions::{PlateError, PlateScan};
pub use state::{RunState, StateTransition};
