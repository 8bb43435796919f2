//! Shared hard limits and defaults.
//!
//! This module centralizes queue capacities and instrument-independent
//! defaults so every crate sizes its channels the same way. Per-device settle
//! times and tolerances are never defined here; they come from the hardware
//! configuration.

use std::time::Duration;

// =============================================================================
// Queue Capacities
// =============================================================================

/// Capacity of the DAL's single ordered device event queue.
pub const EVENT_QUEUE_CAPACITY: usize = 1024;

/// Capacity of the camera frame queue feeding the correlator.
pub const FRAME_QUEUE_CAPACITY: usize = 256;

/// Capacity of the correlated frame output queue.
pub const CORRELATED_QUEUE_CAPACITY: usize = 256;

/// Capacity of the control command queue into the dispatcher.
pub const CONTROL_QUEUE_CAPACITY: usize = 16;

/// Capacity of the run state broadcast channel.
pub const STATE_BROADCAST_CAPACITY: usize = 64;

// =============================================================================
// Compiler Defaults
// =============================================================================

/// Padding added between consecutive camera exposures (30 us).
pub const DEFAULT_STEP_JITTER: Duration = Duration::from_micros(30);

/// Largest camera frame buffer a single run may allocate (2 GiB).
pub const DEFAULT_MAX_BUFFER_BYTES: u64 = 1 << 31;

/// Projection-mode scan mirror sweep per micrometre of z range (0.01 deg/um).
pub const DEFAULT_SWEEP_UDEG_PER_UM: u64 = 10_000;

// =============================================================================
// Shutdown
// =============================================================================

/// Time allowed for background tasks to drain after a run ends.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);
