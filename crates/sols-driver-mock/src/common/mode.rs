//! Operational modes for mock devices.
//!
//! Mock devices can operate in different modes optimized for specific testing scenarios:
//!
//! - **Instant**: Zero delays, deterministic behavior for unit tests
//! - **Realistic**: Completion latency equal to the configured settle/readout times
//! - **Chaos**: Realistic timing plus the configured random failures

use serde::Deserialize;

/// Operational modes for mock devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MockMode {
    /// Zero delays, deterministic - for unit tests
    #[default]
    Instant,
    /// Hardware-like timing - for integration tests and dry runs
    Realistic,
    /// Hardware-like timing with failures - for resilience testing
    Chaos,
}

impl MockMode {
    /// Whether operations take simulated time.
    pub fn is_timed(&self) -> bool {
        !matches!(self, MockMode::Instant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_mode() {
        assert_eq!(MockMode::default(), MockMode::Instant);
        assert!(!MockMode::Instant.is_timed());
        assert!(MockMode::Chaos.is_timed());
    }

    #[test]
    fn test_mode_from_config() {
        #[derive(Deserialize)]
        struct Wrapper {
            mode: MockMode,
        }
        let parsed: Wrapper = toml::from_str("mode = \"realistic\"").unwrap();
        assert_eq!(parsed.mode, MockMode::Realistic);
    }
}
