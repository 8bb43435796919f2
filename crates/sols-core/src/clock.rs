//! Shared monotonic time base.
//!
//! Dispatcher deadlines, device event timestamps and camera capture timestamps
//! are all expressed as a [`Duration`] since one clock epoch. The default
//! [`MonotonicClock`] reads `tokio::time::Instant`, so tests running under a
//! paused runtime get a fully deterministic time base.

use std::fmt::Debug;
use std::time::Duration;
use tokio::time::Instant;

/// Monotonic clock shared by every component of a run.
pub trait Clock: Send + Sync + Debug {
    /// Time elapsed since the clock epoch.
    fn now(&self) -> Duration;

    /// Tokio instant corresponding to a clock reading.
    fn instant_at(&self, at: Duration) -> Instant;
}

/// Clock backed by the tokio runtime's monotonic time.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    epoch: Instant,
}

impl MonotonicClock {
    /// Start a clock whose epoch is now.
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }

    fn instant_at(&self, at: Duration) -> Instant {
        self.epoch + at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn clock_follows_tokio_time() {
        let clock = MonotonicClock::new();
        assert_eq!(clock.now(), Duration::ZERO);
        tokio::time::advance(Duration::from_millis(25)).await;
        assert_eq!(clock.now(), Duration::from_millis(25));
        tokio::time::sleep_until(clock.instant_at(Duration::from_millis(40))).await;
        assert_eq!(clock.now(), Duration::from_millis(40));
    }
}
