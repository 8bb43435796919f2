//! Synthetic light-sheet frames for the mock camera.

use sols_core::plan::DeviceStateVector;

/// Simple pseudo-random number generator (LCG) for reproducible noise.
/// Uses the same algorithm as glibc for predictable cross-platform behavior.
#[inline]
fn prng(seed: u64) -> u64 {
    seed.wrapping_mul(1103515245).wrapping_add(12345) & 0x7fffffff
}

/// Fast focus travel mapped onto the frame height.
const Z_SPAN_UM: f64 = 800.0;

/// Generates a light-sheet-like test frame.
///
/// The frame has:
/// - a dim diagonal gradient background with per-frame noise
/// - a bright horizontal band (the sheet) whose row follows the focus position
///   and whose intensity follows the laser power
/// - the band is absent when the laser is off
///
/// Two frames taken under the same state differ only in noise, so tests can
/// check where the sheet landed without knowing the frame number.
pub fn generate_sheet_frame(
    width: u32,
    height: u32,
    sequence: u64,
    state: &DeviceStateVector,
) -> Vec<u16> {
    let w = width as usize;
    let h = height as usize;
    let mut buffer = vec![0u16; w * h];
    if w == 0 || h == 0 {
        return buffer;
    }

    let frame_seed = sequence.wrapping_mul(2654435761);
    let sheet_row = sheet_row(height, state.z_um);
    let half_width = (h / 64).max(1);
    let sheet_peak = if state.laser.enabled {
        (state.laser.power_pct.clamp(0.0, 100.0) / 100.0 * 40000.0) as i32
    } else {
        0
    };

    for y in 0..h {
        let distance = y.abs_diff(sheet_row);
        let sheet = if distance <= half_width {
            sheet_peak - (sheet_peak * distance as i32) / (half_width as i32 + 1)
        } else {
            0
        };
        for x in 0..w {
            let idx = y * w + x;
            let background = ((x + y) * 8000 / (w + h)) as i32 + 1000;
            let noise = (prng(frame_seed ^ idx as u64) & 0x1FF) as i32 - 256;
            buffer[idx] = (background + sheet + noise).clamp(0, 65535) as u16;
        }
    }
    buffer
}

/// Row the sheet lands on for a given focus position.
pub fn sheet_row(height: u32, z_um: f64) -> usize {
    if height == 0 {
        return 0;
    }
    let fraction = (z_um / Z_SPAN_UM).clamp(0.0, 1.0);
    ((height - 1) as f64 * fraction).round() as usize
}

/// Pack pixels as 16-bit little-endian bytes.
pub fn to_le_bytes(pixels: &[u16]) -> Vec<u8> {
    pixels.iter().flat_map(|p| p.to_le_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sols_core::device::LaserState;

    #[test]
    fn test_sheet_follows_focus() {
        let mut state = DeviceStateVector {
            laser: LaserState::on(100.0),
            ..Default::default()
        };
        state.z_um = 400.0;
        let frame = generate_sheet_frame(32, 65, 0, &state);
        let row = sheet_row(65, 400.0);
        assert_eq!(row, 32);
        let on_sheet = frame[row * 32 + 5];
        let off_sheet = frame[5];
        assert!(on_sheet > off_sheet + 20000);
    }

    #[test]
    fn test_no_sheet_when_laser_off() {
        let state = DeviceStateVector::default();
        let frame = generate_sheet_frame(16, 16, 3, &state);
        assert!(frame.iter().all(|&p| p < 10000));
    }

    #[test]
    fn test_le_packing() {
        assert_eq!(to_le_bytes(&[0x1234, 0x00ff]), vec![0x34, 0x12, 0xff, 0x00]);
    }
}
