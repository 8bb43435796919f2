//! Camera frame records.

use crate::plan::DeviceStateVector;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What the camera was told when it was triggered.
///
/// The camera echoes this back with every frame so the correlator can match
/// the frame against the plan without trusting arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TriggerRecord {
    /// Exposure duration
    pub exposure: Duration,
    /// Device-state vector the exposure was taken under
    pub state: DeviceStateVector,
}

/// One exposure delivered by a camera driver.
#[derive(Debug, Clone)]
pub struct CameraFrame {
    /// Monotonic per-camera sequence number, starting at 0
    pub sequence: u64,
    /// Exposure start on the shared monotonic clock
    pub capture_timestamp: Duration,
    /// Frame height in pixels
    pub height: u32,
    /// Frame width in pixels
    pub width: u32,
    /// Raw 16-bit little-endian pixels
    pub buffer: Bytes,
    /// Trigger record of this exposure
    pub trigger: TriggerRecord,
}

impl CameraFrame {
    /// Bytes per pixel of the raw buffer.
    pub const BYTES_PER_PIXEL: u64 = 2;

    /// Pixel count.
    pub fn pixel_count(&self) -> usize {
        self.height as usize * self.width as usize
    }

    /// Read back the pixel at (row, col).
    pub fn pixel(&self, row: u32, col: u32) -> Option<u16> {
        if row >= self.height || col >= self.width {
            return None;
        }
        let index = (row as usize * self.width as usize + col as usize) * 2;
        let lo = *self.buffer.get(index)?;
        let hi = *self.buffer.get(index + 1)?;
        Some(u16::from_le_bytes([lo, hi]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_reads_little_endian() {
        let frame = CameraFrame {
            sequence: 0,
            capture_timestamp: Duration::ZERO,
            height: 1,
            width: 2,
            buffer: Bytes::from(vec![0x34, 0x12, 0xff, 0x00]),
            trigger: TriggerRecord::default(),
        };
        assert_eq!(frame.pixel_count(), 2);
        assert_eq!(frame.pixel(0, 0), Some(0x1234));
        assert_eq!(frame.pixel(0, 1), Some(0x00ff));
        assert_eq!(frame.pixel(1, 0), None);
    }
}
