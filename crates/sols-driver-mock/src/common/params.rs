//! Inventory parameters shared by every mock factory.

use super::{Actuation, ErrorConfig, FaultParams, MockMode, TimingConfig};
use serde::Deserialize;
use std::time::Duration;

/// Parameters every mock device accepts in its `params` table.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommonParams {
    /// Operational mode
    #[serde(default)]
    pub mode: MockMode,
    /// Completion latency override (us); defaults to the device's settle time
    #[serde(default)]
    pub latency_us: Option<u64>,
    /// Fault injection
    #[serde(default)]
    pub faults: FaultParams,
}

impl CommonParams {
    /// Build the actuation profile. Latency falls back to `settle`.
    pub fn actuation(&self, driver_type: &'static str, settle: Duration) -> Actuation {
        let latency = self
            .latency_us
            .map(Duration::from_micros)
            .unwrap_or(settle);
        Actuation::new(
            driver_type,
            self.mode,
            TimingConfig::with_latency(latency),
            ErrorConfig::from_params(&self.faults),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_defaults_to_settle() {
        let params = CommonParams::default();
        let act = params.actuation("mock_axis", Duration::from_millis(2));
        assert_eq!(act.timing().latency, Duration::from_millis(2));
        assert_eq!(act.mode(), MockMode::Instant);
    }

    #[test]
    fn parses_overrides() {
        let params: CommonParams = toml::from_str(
            "mode = \"realistic\"\nlatency_us = 150\n[faults]\nfailure_rate = 0.0",
        )
        .unwrap();
        let act = params.actuation("mock_axis", Duration::from_millis(2));
        assert_eq!(act.timing().latency, Duration::from_micros(150));
        assert_eq!(act.mode(), MockMode::Realistic);
    }
}
