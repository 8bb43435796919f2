//! Shared command simulation for mock devices.

use super::{ErrorConfig, MockMode, TimingConfig};
use anyhow::Result;
use std::time::Duration;
use tokio::time::sleep;

/// Applies mode, timing and error injection to one simulated command.
#[derive(Debug, Clone)]
pub struct Actuation {
    driver_type: &'static str,
    mode: MockMode,
    timing: TimingConfig,
    errors: ErrorConfig,
}

impl Actuation {
    /// Create an actuation profile.
    pub fn new(
        driver_type: &'static str,
        mode: MockMode,
        timing: TimingConfig,
        errors: ErrorConfig,
    ) -> Self {
        Self {
            driver_type,
            mode,
            timing,
            errors,
        }
    }

    /// Driver type name used in errors.
    pub fn driver_type(&self) -> &'static str {
        self.driver_type
    }

    /// Timing in effect.
    pub fn timing(&self) -> TimingConfig {
        self.timing
    }

    /// Operational mode.
    pub fn mode(&self) -> MockMode {
        self.mode
    }

    /// Fail if an injected error fires for `operation`.
    pub fn check(&self, operation: &str) -> Result<()> {
        self.errors.check_operation(self.driver_type, operation)?;
        Ok(())
    }

    /// Injected extra delay for this call of `operation`.
    pub fn stall_for(&self, operation: &str) -> Duration {
        self.errors.stall_for(operation)
    }

    /// Check for injected errors, then wait out the simulated latency plus any `busy` time.
    pub async fn perform(&self, operation: &str, busy: Duration) -> Result<()> {
        self.check(operation)?;
        let mut delay = self.errors.stall_for(operation);
        if self.mode.is_timed() {
            delay += self.timing.latency + busy;
        }
        if !delay.is_zero() {
            sleep(delay).await;
        }
        Ok(())
    }

    /// Clear injected fault state.
    pub fn reset(&self) {
        self.errors.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn realistic_mode_waits_latency() {
        let act = Actuation::new(
            "mock_test",
            MockMode::Realistic,
            TimingConfig::with_latency(Duration::from_millis(3)),
            ErrorConfig::none(),
        );
        let start = tokio::time::Instant::now();
        act.perform("move", Duration::from_millis(2)).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(5));
    }

    #[tokio::test(start_paused = true)]
    async fn instant_mode_skips_latency() {
        let act = Actuation::new(
            "mock_test",
            MockMode::Instant,
            TimingConfig::with_latency(Duration::from_millis(3)),
            ErrorConfig::none(),
        );
        let start = tokio::time::Instant::now();
        act.perform("move", Duration::from_millis(2)).await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn injected_failure_propagates() {
        let act = Actuation::new(
            "mock_test",
            MockMode::Instant,
            TimingConfig::default(),
            ErrorConfig::fail_after("move", 0),
        );
        let err = act.perform("move", Duration::ZERO).await.unwrap_err();
        assert!(err.to_string().contains("mock_test"));
    }
}
