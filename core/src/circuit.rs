//! Per-service circuit breaker records.
//!
//! The transition rules live in the runtime's `CircuitBreaker`; this module only
//! holds the state it keeps per service name and the snapshot it reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum State {
    /// Circuit is closed, requests pass through normally
    Closed,
    /// Circuit is open, requests fail immediately
    Open,
    /// Circuit is half-open, testing if service recovered
    HalfOpen,
}

impl State {
    /// Numeric encoding used by the state gauge.
    ///
    /// 0 = Closed, 1 = `HalfOpen`, 2 = Open
    #[must_use]
    pub const fn as_gauge(self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::HalfOpen => 1.0,
            Self::Open => 2.0,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Failure tracking for one service name.
///
/// `failure_count` is the number of failures since the last success;
/// `success_count` only counts trial successes while `HalfOpen`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitState {
    /// Service this circuit guards
    pub service_name: String,
    /// Current state
    pub state: State,
    /// Consecutive failures since the last success
    pub failure_count: u64,
    /// Successful trial calls while half-open
    pub success_count: u64,
    /// When `state` last changed
    pub last_state_change: DateTime<Utc>,
    /// Lifetime success count
    pub total_successes: u64,
    /// Lifetime failure count
    pub total_failures: u64,
    /// Lifetime count of calls refused while open
    pub total_rejections: u64,
}

impl CircuitState {
    /// Fresh closed circuit.
    #[must_use]
    pub fn closed(service_name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            service_name: service_name.into(),
            state: State::Closed,
            failure_count: 0,
            success_count: 0,
            last_state_change: now,
            total_successes: 0,
            total_failures: 0,
            total_rejections: 0,
        }
    }

    /// Snapshot for observability.
    #[must_use]
    pub fn statistics(&self) -> CircuitStatistics {
        CircuitStatistics {
            service_name: self.service_name.clone(),
            state: self.state,
            failure_count: self.failure_count,
            success_count: self.success_count,
            last_state_change: self.last_state_change,
            total_successes: self.total_successes,
            total_failures: self.total_failures,
            total_rejections: self.total_rejections,
            failure_rate: failure_rate(self.total_failures, self.total_successes),
        }
    }
}

/// Observability snapshot of one circuit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitStatistics {
    /// Service this circuit guards
    pub service_name: String,
    /// Current state
    pub state: State,
    /// Consecutive failures since the last success
    pub failure_count: u64,
    /// Successful trial calls while half-open
    pub success_count: u64,
    /// When `state` last changed
    pub last_state_change: DateTime<Utc>,
    /// Lifetime success count
    pub total_successes: u64,
    /// Lifetime failure count
    pub total_failures: u64,
    /// Lifetime count of calls refused while open
    pub total_rejections: u64,
    /// `total_failures / (total_failures + total_successes)`, 0.0 with no calls
    pub failure_rate: f64,
}

#[allow(clippy::cast_precision_loss)]
fn failure_rate(failures: u64, successes: u64) -> f64 {
    let total = failures + successes;
    if total == 0 {
        return 0.0;
    }
    failures as f64 / total as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_rate_without_calls_is_zero() {
        let circuit = CircuitState::closed("users", Utc::now());
        assert!((circuit.statistics().failure_rate - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_failure_rate() {
        let mut circuit = CircuitState::closed("users", Utc::now());
        circuit.total_failures = 1;
        circuit.total_successes = 3;
        assert!((circuit.statistics().failure_rate - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_rejections_do_not_affect_failure_rate() {
        let mut circuit = CircuitState::closed("users", Utc::now());
        circuit.total_rejections = 10;
        circuit.total_successes = 1;
        let stats = circuit.statistics();
        assert_eq!(stats.total_rejections, 10);
        assert!((stats.failure_rate - 0.0).abs() < f64::EPSILON);
    }

    proptest::proptest! {
        #[test]
        fn failure_rate_is_a_ratio(failures in 0u64..1_000_000, successes in 0u64..1_000_000) {
            let mut circuit = CircuitState::closed("users", Utc::now());
            circuit.total_failures = failures;
            circuit.total_successes = successes;
            let rate = circuit.statistics().failure_rate;
            proptest::prop_assert!((0.0..=1.0).contains(&rate));
            if failures == 0 {
                proptest::prop_assert!(rate.abs() < f64::EPSILON);
            }
        }
    }

    #[test]
    fn test_state_display_and_gauge() {
        assert_eq!(State::HalfOpen.to_string(), "HALF_OPEN");
        assert!((State::Open.as_gauge() - 2.0).abs() < f64::EPSILON);
    }
}
