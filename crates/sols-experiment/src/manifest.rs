//! Run manifests.
//!
//! One JSON document per run capturing everything needed to audit and
//! reproduce it: the request, the compiled plan and its fingerprint, the
//! device inventory and compiler settings the plan was compiled against, the
//! state transitions, any fault, and the correlator tallies.
//!
//! # Example
//!
//! ```json
//! {
//!   "run_id": "6b0e...",
//!   "fingerprint": "3f1c...",
//!   "final_state": "completed",
//!   "steps_completed": 11,
//!   "frames": { "total": 11, "confident": 11, ... },
//!   "system": { "hostname": "sols-rig-01", "sequencer_version": "0.1.0", "os": "linux" }
//! }
//! ```

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sols_core::config::CompilerConfig;
use sols_core::device::DeviceDescriptor;
use sols_core::error::RunError;
use sols_core::plan::TimingPlan;
use sols_core::request::AcquisitionRequest;
use std::path::{Path, PathBuf};
use tracing::info;
use uuid::Uuid;

use crate::compiler::PlanCompiler;
use crate::correlator::FrameCounts;
use crate::state::{RunState, StateTransition};

/// Host the run executed on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemInfo {
    /// Host name, if the OS reports one
    pub hostname: Option<String>,
    /// Sequencer crate version
    pub sequencer_version: String,
    /// Target operating system
    pub os: String,
}

impl SystemInfo {
    /// Describe the current host.
    pub fn collect() -> Self {
        Self {
            hostname: hostname::get().ok().and_then(|h| h.into_string().ok()),
            sequencer_version: env!("CARGO_PKG_VERSION").to_string(),
            os: std::env::consts::OS.to_string(),
        }
    }
}

/// Complete record of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    /// Run identifier
    pub run_id: Uuid,
    /// Wall-clock arm time
    pub armed_at: DateTime<Utc>,
    /// Wall-clock end time
    pub finished_at: DateTime<Utc>,
    /// Host information
    pub system: SystemInfo,
    /// Request as submitted
    pub request: AcquisitionRequest,
    /// Plan as compiled
    pub plan: TimingPlan,
    /// Plan fingerprint
    pub fingerprint: String,
    /// Device descriptors at arm time
    pub devices: Vec<DeviceDescriptor>,
    /// Compiler settings at arm time
    pub compiler: CompilerConfig,
    /// Final run state
    pub final_state: RunState,
    /// State transitions from arm to end
    pub transitions: Vec<StateTransition>,
    /// Fatal errors
    pub faults: Vec<RunError>,
    /// Steps whose every command completed
    pub steps_completed: usize,
    /// Correlator tallies
    pub frames: FrameCounts,
}

impl RunManifest {
    /// Pretty JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Parse a manifest.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// File name the manifest is written under.
    pub fn file_name(&self) -> String {
        format!("run_{}.json", self.run_id)
    }

    /// Write to `dir`, creating it if needed. Returns the file path.
    pub fn write_to_dir(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create manifest directory {}", dir.display()))?;
        let path = dir.join(self.file_name());
        std::fs::write(&path, self.to_json()?)
            .with_context(|| format!("Failed to write manifest {}", path.display()))?;
        info!(path = %path.display(), run_id = %self.run_id, "Wrote run manifest");
        Ok(path)
    }

    /// Read a manifest file.
    pub fn read(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest {}", path.display()))?;
        Self::from_json(&json).with_context(|| format!("Invalid manifest {}", path.display()))
    }

    /// Recompile the recorded request against the recorded devices and
    /// compiler settings and compare with the recorded plan.
    pub fn verify_reproducible(&self) -> Result<bool> {
        let plan = PlanCompiler::new(self.compiler)
            .compile(&self.request, &self.devices)
            .context("Recorded request no longer compiles")?;
        let fingerprint = plan.fingerprint()?;
        Ok(fingerprint == self.fingerprint && plan == self.plan)
    }

    /// Whether every frame outside the camera preframes was matched to
    /// exactly one step.
    pub fn all_frames_confident(&self) -> bool {
        self.frames.confident == self.frames.acquired()
    }
}
