//! Error injection framework for mock devices.
//!
//! Enables configurable failures, stalls and hardware faults for resilience
//! testing. Failures surface as sols-core [`DriverError`]s, which the Device
//! Abstraction Layer turns into fault events.

use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Deserialize;
use sols_core::error::{DriverError, DriverErrorKind};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Error injection configuration for mock devices
#[derive(Clone, Debug)]
pub struct ErrorConfig {
    /// Per-operation failure rate (0.0 to 1.0); `*` applies to every operation
    failure_rates: Arc<HashMap<String, f64>>,
    /// Specific failure scenarios
    scenarios: Arc<Vec<ErrorScenario>>,
    /// Seeded RNG for failure decisions
    rng: Arc<Mutex<ChaCha8Rng>>,
    /// State tracking for scenarios
    state: Arc<Mutex<ErrorState>>,
}

/// Scripted failure behaviour.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorScenario {
    /// Fail every call of `operation` after `count` successful ones
    FailAfterN {
        /// Operation name (e.g. `move`, `trigger`)
        operation: String,
        /// Successful calls before failing
        count: u32,
    },
    /// Every call of `operation` after `count` successful ones takes `delay` longer
    StallAfterN {
        /// Operation name
        operation: String,
        /// Calls completed on time
        count: u32,
        /// Extra latency
        delay: Duration,
    },
    /// Every call of `operation` after `count` successful ones times out
    TimeoutAfterN {
        /// Operation name
        operation: String,
        /// Successful calls before timing out
        count: u32,
    },
    /// Hardware fault with specific code after `after` successful
    /// operations of any kind, latched until reset
    HardwareFault {
        /// Vendor fault code
        code: u32,
        /// Operations completed before the fault
        after: u32,
    },
}

#[derive(Default, Debug)]
struct ErrorState {
    /// Operation counters for FailAfterN scenarios
    fail_counts: HashMap<String, u32>,
    /// Operation counters for StallAfterN scenarios
    stall_counts: HashMap<String, u32>,
    /// Operation counters for TimeoutAfterN scenarios
    timeout_counts: HashMap<String, u32>,
    /// Operations of any kind, for HardwareFault
    operations: u32,
    /// Hardware fault code (0 = no fault)
    hardware_fault_code: u32,
}

/// Fault injection parameters accepted in a device's inventory `params` table.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FaultParams {
    /// Fail `operation` after `count` successes
    #[serde(default)]
    pub fail_after: Option<OperationCount>,
    /// Delay `operation` after `count` on-time calls
    #[serde(default)]
    pub stall_after: Option<OperationStall>,
    /// Time out `operation` after `count` successes
    #[serde(default)]
    pub timeout_after: Option<OperationCount>,
    /// Latch a hardware fault after a number of operations
    #[serde(default)]
    pub hardware_fault: Option<HardwareFaultParams>,
    /// Random failure probability applied to every operation
    #[serde(default)]
    pub failure_rate: Option<f64>,
    /// RNG seed for random failures
    #[serde(default)]
    pub seed: Option<u64>,
}

/// Operation name plus a count.
#[derive(Debug, Clone, Deserialize)]
pub struct OperationCount {
    /// Operation name
    pub operation: String,
    /// Count
    pub count: u32,
}

/// Vendor fault code and the operations that succeed before it latches.
#[derive(Debug, Clone, Deserialize)]
pub struct HardwareFaultParams {
    /// Vendor fault code
    pub code: u32,
    /// Successful operations before the fault
    #[serde(default)]
    pub after: u32,
}

/// Operation name, on-time calls and the extra latency after them.
#[derive(Debug, Clone, Deserialize)]
pub struct OperationStall {
    /// Operation name
    pub operation: String,
    /// Calls completed on time
    pub count: u32,
    /// Extra latency (ms)
    pub delay_ms: u64,
}

impl ErrorConfig {
    /// Create error config with no errors (default)
    pub fn none() -> Self {
        Self::build(HashMap::new(), Vec::new(), None)
    }

    /// Create error config with uniform random failures and specific seed
    pub fn random_failures_seeded(rate: f64, seed: Option<u64>) -> Self {
        let mut rates = HashMap::new();
        rates.insert("*".to_string(), rate);
        Self::build(rates, Vec::new(), seed)
    }

    /// Create error config with a single scenario
    pub fn scenario(scenario: ErrorScenario) -> Self {
        Self::scenarios(vec![scenario])
    }

    /// Create error config with multiple scenarios
    pub fn scenarios(scenarios: Vec<ErrorScenario>) -> Self {
        Self::build(HashMap::new(), scenarios, None)
    }

    /// Fail `operation` after `count` successful calls.
    pub fn fail_after(operation: impl Into<String>, count: u32) -> Self {
        Self::scenario(ErrorScenario::FailAfterN {
            operation: operation.into(),
            count,
        })
    }

    /// Build from inventory parameters.
    pub fn from_params(params: &FaultParams) -> Self {
        let mut rates = HashMap::new();
        if let Some(rate) = params.failure_rate {
            rates.insert("*".to_string(), rate);
        }
        let scenarios = params
            .fail_after
            .iter()
            .map(|f| ErrorScenario::FailAfterN {
                operation: f.operation.clone(),
                count: f.count,
            })
            .chain(params.stall_after.iter().map(|s| ErrorScenario::StallAfterN {
                operation: s.operation.clone(),
                count: s.count,
                delay: Duration::from_millis(s.delay_ms),
            }))
            .chain(params.timeout_after.iter().map(|t| ErrorScenario::TimeoutAfterN {
                operation: t.operation.clone(),
                count: t.count,
            }))
            .chain(params.hardware_fault.iter().map(|h| ErrorScenario::HardwareFault {
                code: h.code,
                after: h.after,
            }))
            .collect();
        Self::build(rates, scenarios, params.seed)
    }

    fn build(rates: HashMap<String, f64>, scenarios: Vec<ErrorScenario>, seed: Option<u64>) -> Self {
        Self {
            failure_rates: Arc::new(rates),
            scenarios: Arc::new(scenarios),
            rng: Arc::new(Mutex::new(match seed {
                Some(seed) => ChaCha8Rng::seed_from_u64(seed),
                None => ChaCha8Rng::from_entropy(),
            })),
            state: Arc::new(Mutex::new(ErrorState::default())),
        }
    }

    /// Whether a call fails at `rate` (0.0 never, 1.0 always).
    fn roll(&self, rate: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        if rate >= 1.0 {
            return true;
        }
        self.rng.lock().gen::<f64>() < rate
    }

    /// Check if an operation should fail and return appropriate error
    pub fn check_operation(&self, driver_type: &str, operation: &str) -> Result<(), DriverError> {
        let mut state = self.state.lock();

        // Latched hardware fault
        if state.hardware_fault_code != 0 {
            return Err(DriverError::new(
                driver_type,
                DriverErrorKind::Hardware,
                format!("Hardware fault: {}", state.hardware_fault_code),
            ));
        }

        for scenario in self.scenarios.iter() {
            match scenario {
                ErrorScenario::FailAfterN {
                    operation: op,
                    count,
                } if op == operation => {
                    let current = state.fail_counts.entry(op.clone()).or_insert(0);
                    *current += 1;
                    if *current > *count {
                        return Err(DriverError::new(
                            driver_type,
                            DriverErrorKind::Hardware,
                            format!("Injected failure after {} operations", count),
                        ));
                    }
                }
                ErrorScenario::TimeoutAfterN {
                    operation: op,
                    count,
                } if op == operation => {
                    let current = state.timeout_counts.entry(op.clone()).or_insert(0);
                    *current += 1;
                    if *current > *count {
                        return Err(DriverError::new(
                            driver_type,
                            DriverErrorKind::Timeout,
                            format!("Operation '{}' timed out", operation),
                        ));
                    }
                }
                ErrorScenario::HardwareFault { code, after } => {
                    state.operations += 1;
                    if state.operations > *after {
                        state.hardware_fault_code = *code;
                        return Err(DriverError::new(
                            driver_type,
                            DriverErrorKind::Hardware,
                            format!("Hardware fault: {}", code),
                        ));
                    }
                }
                _ => {}
            }
        }

        let rate = self
            .failure_rates
            .get(operation)
            .or_else(|| self.failure_rates.get("*"))
            .copied()
            .unwrap_or(0.0);

        if self.roll(rate) {
            return Err(DriverError::new(
                driver_type,
                DriverErrorKind::Hardware,
                format!("Random failure on operation '{}'", operation),
            ));
        }

        Ok(())
    }

    /// Extra latency to add to this call of `operation`.
    pub fn stall_for(&self, operation: &str) -> Duration {
        let mut state = self.state.lock();
        let mut extra = Duration::ZERO;
        for scenario in self.scenarios.iter() {
            if let ErrorScenario::StallAfterN {
                operation: op,
                count,
                delay,
            } = scenario
            {
                if op == operation {
                    let current = state.stall_counts.entry(op.clone()).or_insert(0);
                    *current += 1;
                    if *current > *count {
                        extra += *delay;
                    }
                }
            }
        }
        extra
    }

    /// Reset error state (clear counters, faults)
    pub fn reset(&self) {
        *self.state.lock() = ErrorState::default();
    }
}

impl Default for ErrorConfig {
    fn default() -> Self {
        Self::none()
    }
}
