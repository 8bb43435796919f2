//! Device completion and fault notifications.

use crate::device::DeviceId;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Receipt returned when the DAL accepts a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommandTicket {
    /// DAL-wide sequence number, increasing in issue order
    pub seq: u64,
    /// Plan step that issued the command
    pub step: usize,
}

/// Outcome of a device command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeviceEventKind {
    /// The command completed
    Completed,
    /// The device reported a fault; the device is latched in `fault`
    Fault {
        /// Driver detail
        message: String,
    },
}

/// Timestamped notification from a device, tagged with its originating step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEvent {
    /// Reporting device
    pub device: DeviceId,
    /// Ticket of the command this event concludes
    pub ticket: CommandTicket,
    /// Outcome
    pub kind: DeviceEventKind,
    /// Time of the notification on the shared monotonic clock
    pub timestamp: Duration,
}

impl DeviceEvent {
    /// Whether the event reports a fault.
    pub fn is_fault(&self) -> bool {
        matches!(self.kind, DeviceEventKind::Fault { .. })
    }
}
