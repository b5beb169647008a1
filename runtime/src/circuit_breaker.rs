//! Per-service circuit breakers for preventing cascading failures.
//!
//! A circuit breaker monitors calls to a service and "opens" (stops allowing
//! requests) when failures exceed a threshold, so a failing dependency is not
//! hammered while it recovers.
//!
//! # States
//!
//! - **Closed**: Normal operation. Requests pass through. Failures are counted.
//! - **Open**: Too many failures detected. Requests fail immediately until
//!   `reset_timeout` has elapsed since the circuit opened.
//! - **HalfOpen**: Trial requests are allowed. `success_threshold` successes close
//!   the circuit, a single failure opens it again.
//!
//! One [`CircuitState`] is kept per service name, created lazily on first access.
//! Every read-modify-write of a circuit happens under that circuit's own mutex;
//! the map lock is only held to find or insert a circuit, so unrelated services
//! never serialize behind each other.
//!
//! # Example
//!
//! ```rust
//! use guarded_mesh_runtime::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
//! use guarded_mesh_core::{State, SystemClock};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let config = CircuitBreakerConfig::builder()
//!     .failure_threshold(5)
//!     .reset_timeout(Duration::from_secs(30))
//!     .success_threshold(2)
//!     .build();
//!
//! let breaker = CircuitBreaker::new(config, Arc::new(SystemClock));
//!
//! match breaker.acquire("pricing-service") {
//!     Ok(permit) => {
//!         // ... perform the call ...
//!         permit.success();
//!     }
//!     Err(e) => println!("rejected: {e}"),
//! }
//! assert_eq!(breaker.state("pricing-service"), State::Closed);
//! ```

use crate::metrics::CircuitMetrics;
use chrono::{DateTime, Utc};
use guarded_mesh_core::circuit::{CircuitState, CircuitStatistics, State};
use guarded_mesh_core::environment::Clock;
use guarded_mesh_core::error::ServiceError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit
    pub failure_threshold: u64,
    /// Duration to wait before transitioning from Open to `HalfOpen`
    pub reset_timeout: Duration,
    /// Number of successes in `HalfOpen` state before closing the circuit
    pub success_threshold: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new configuration builder.
    #[must_use]
    pub const fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder {
            failure_threshold: None,
            reset_timeout: None,
            success_threshold: None,
        }
    }
}

/// Builder for [`CircuitBreakerConfig`].
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfigBuilder {
    failure_threshold: Option<u64>,
    reset_timeout: Option<Duration>,
    success_threshold: Option<u64>,
}

impl CircuitBreakerConfigBuilder {
    /// Set the failure threshold.
    ///
    /// Circuit opens after this many consecutive failures.
    #[must_use]
    pub const fn failure_threshold(mut self, threshold: u64) -> Self {
        self.failure_threshold = Some(threshold);
        self
    }

    /// Set the reset timeout.
    ///
    /// How long to stay Open before allowing trial calls.
    #[must_use]
    pub const fn reset_timeout(mut self, duration: Duration) -> Self {
        self.reset_timeout = Some(duration);
        self
    }

    /// Set the success threshold.
    ///
    /// Number of successes in `HalfOpen` state before closing the circuit.
    #[must_use]
    pub const fn success_threshold(mut self, threshold: u64) -> Self {
        self.success_threshold = Some(threshold);
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> CircuitBreakerConfig {
        let defaults = CircuitBreakerConfig::default();
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold.unwrap_or(defaults.failure_threshold),
            reset_timeout: self.reset_timeout.unwrap_or(defaults.reset_timeout),
            success_threshold: self.success_threshold.unwrap_or(defaults.success_threshold),
        }
    }
}

/// Errors from [`CircuitBreaker::call`].
#[derive(Error, Debug)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open, request rejected
    #[error("Circuit breaker for '{0}' is open")]
    Open(String),
    /// Operation failed
    #[error("Operation failed: {0}")]
    Inner(E),
}

type Circuits = HashMap<String, Arc<Mutex<CircuitState>>>;

/// Circuit breakers for every service name, behind one handle.
///
/// Cloning is cheap and clones share state.
#[derive(Clone)]
pub struct CircuitBreaker {
    config: Arc<CircuitBreakerConfig>,
    clock: Arc<dyn Clock>,
    circuits: Arc<RwLock<Circuits>>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("circuits", &self.service_names())
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration.
    #[must_use]
    pub fn new(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config: Arc::new(config),
            clock,
            circuits: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Check whether a call to `service` may proceed.
    ///
    /// An Open circuit whose reset timeout has elapsed moves to `HalfOpen` and
    /// admits the call.
    #[must_use]
    pub fn is_allowed(&self, service: &str) -> bool {
        let cell = self.cell(service);
        let mut circuit = lock(&cell);
        self.admit(&mut circuit, self.clock.now())
    }

    /// Admit a call and hand out a permit that must be resolved with its outcome.
    ///
    /// Admission and permit creation happen under the circuit's lock, so there
    /// is no window between the check and the call.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::CircuitOpen`] if the circuit rejects the call.
    pub fn acquire(&self, service: &str) -> Result<CallPermit, ServiceError> {
        let now = self.clock.now();
        let cell = self.cell(service);
        let mut circuit = lock(&cell);
        if self.admit(&mut circuit, now) {
            CircuitMetrics::record_call(service);
            Ok(CallPermit {
                breaker: self.clone(),
                service: service.to_string(),
                started_at: now,
                resolved: false,
            })
        } else {
            Err(ServiceError::CircuitOpen {
                service: service.to_string(),
            })
        }
    }

    /// Record a successful call.
    pub fn record_success(&self, service: &str) {
        let cell = self.cell(service);
        let mut circuit = lock(&cell);
        let now = self.clock.now();

        circuit.failure_count = 0;
        circuit.total_successes += 1;
        CircuitMetrics::record_success(service);

        if circuit.state == State::HalfOpen {
            circuit.success_count += 1;
            if circuit.success_count >= self.config.success_threshold {
                tracing::info!(
                    service,
                    successes = circuit.success_count,
                    "Circuit breaker transitioning HALF_OPEN -> CLOSED"
                );
                Self::transition(&mut circuit, State::Closed, now);
            }
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self, service: &str) {
        let cell = self.cell(service);
        let mut circuit = lock(&cell);
        let now = self.clock.now();

        circuit.failure_count += 1;
        circuit.total_failures += 1;
        CircuitMetrics::record_failure(service);

        match circuit.state {
            State::Closed => {
                if circuit.failure_count >= self.config.failure_threshold {
                    tracing::warn!(
                        service,
                        failures = circuit.failure_count,
                        threshold = self.config.failure_threshold,
                        "Circuit breaker transitioning CLOSED -> OPEN"
                    );
                    Self::transition(&mut circuit, State::Open, now);
                }
            },
            State::HalfOpen => {
                tracing::warn!(
                    service,
                    "Circuit breaker transitioning HALF_OPEN -> OPEN (recovery failed)"
                );
                Self::transition(&mut circuit, State::Open, now);
            },
            State::Open => {
                // Late outcome of a call admitted before the circuit opened
            },
        }
    }

    /// Current state for `service` (Closed for a service never seen before).
    #[must_use]
    pub fn state(&self, service: &str) -> State {
        lock(&self.cell(service)).state
    }

    /// Full record for `service`.
    #[must_use]
    pub fn circuit(&self, service: &str) -> CircuitState {
        lock(&self.cell(service)).clone()
    }

    /// Statistics for `service`, including the computed failure rate.
    #[must_use]
    pub fn statistics(&self, service: &str) -> CircuitStatistics {
        lock(&self.cell(service)).statistics()
    }

    /// Statistics for every known service, sorted by name.
    #[must_use]
    pub fn all_statistics(&self) -> Vec<CircuitStatistics> {
        let cells: Vec<_> = read(&self.circuits).values().cloned().collect();
        let mut stats: Vec<_> = cells.iter().map(|cell| lock(cell).statistics()).collect();
        stats.sort_by(|a, b| a.service_name.cmp(&b.service_name));
        stats
    }

    /// Reset the circuit for `service` to a fresh closed state.
    ///
    /// Useful for testing or manual intervention.
    pub fn reset(&self, service: &str) {
        let cell = self.cell(service);
        let mut circuit = lock(&cell);
        tracing::info!(service, "Circuit breaker manually reset to CLOSED");
        *circuit = CircuitState::closed(service, self.clock.now());
        CircuitMetrics::record_state(service, State::Closed);
    }

    /// Forget every circuit.
    pub fn reset_all(&self) {
        let mut circuits = write(&self.circuits);
        tracing::info!(count = circuits.len(), "Circuit breaker reset for all services");
        circuits.clear();
    }

    /// Names of every service with a circuit.
    #[must_use]
    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<_> = read(&self.circuits).keys().cloned().collect();
        names.sort();
        names
    }

    /// Call an operation through the circuit for `service`.
    ///
    /// # Errors
    ///
    /// Returns `CircuitBreakerError::Open` if the circuit is open.
    /// Returns `CircuitBreakerError::Inner` if the operation fails.
    pub async fn call<F, Fut, T, E>(
        &self,
        service: &str,
        operation: F,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        let permit = self
            .acquire(service)
            .map_err(|_| CircuitBreakerError::Open(service.to_string()))?;

        match operation().await {
            Ok(result) => {
                permit.success();
                Ok(result)
            },
            Err(err) => {
                permit.failure();
                Err(CircuitBreakerError::Inner(err))
            },
        }
    }

    fn cell(&self, service: &str) -> Arc<Mutex<CircuitState>> {
        if let Some(cell) = read(&self.circuits).get(service) {
            return Arc::clone(cell);
        }

        let mut circuits = write(&self.circuits);
        let cell = circuits.entry(service.to_string()).or_insert_with(|| {
            tracing::debug!(service, "Creating circuit");
            Arc::new(Mutex::new(CircuitState::closed(service, self.clock.now())))
        });
        Arc::clone(cell)
    }

    fn admit(&self, circuit: &mut CircuitState, now: DateTime<Utc>) -> bool {
        match circuit.state {
            State::Closed | State::HalfOpen => true,
            State::Open => {
                let elapsed = (now - circuit.last_state_change)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.reset_timeout {
                    tracing::info!(
                        service = %circuit.service_name,
                        "Circuit breaker transitioning OPEN -> HALF_OPEN"
                    );
                    Self::transition(circuit, State::HalfOpen, now);
                    true
                } else {
                    circuit.total_rejections += 1;
                    CircuitMetrics::record_rejection(&circuit.service_name);
                    tracing::warn!(
                        service = %circuit.service_name,
                        "Circuit breaker is OPEN, rejecting request"
                    );
                    false
                }
            },
        }
    }

    fn transition(circuit: &mut CircuitState, to: State, now: DateTime<Utc>) {
        CircuitMetrics::record_transition(&circuit.service_name, circuit.state, to);
        circuit.state = to;
        circuit.last_state_change = now;
        circuit.success_count = 0;
        if to == State::Closed {
            circuit.failure_count = 0;
        }
    }
}

/// Admission granted by [`CircuitBreaker::acquire`] for one in-flight call.
///
/// Resolve it with [`success`](Self::success) or [`failure`](Self::failure).
/// A permit dropped unresolved (for example because the caller's future was
/// cancelled mid-call) is recorded as a failure: the outcome is unknown.
#[must_use = "an unresolved permit is recorded as a failure when dropped"]
pub struct CallPermit {
    breaker: CircuitBreaker,
    service: String,
    started_at: DateTime<Utc>,
    resolved: bool,
}

impl std::fmt::Debug for CallPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallPermit")
            .field("service", &self.service)
            .field("started_at", &self.started_at)
            .finish_non_exhaustive()
    }
}

impl CallPermit {
    /// Service the permit was granted for.
    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// When the call was admitted.
    #[must_use]
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Report that the call succeeded.
    pub fn success(mut self) {
        self.resolved = true;
        self.breaker.record_success(&self.service);
    }

    /// Report that the call failed.
    pub fn failure(mut self) {
        self.resolved = true;
        self.breaker.record_failure(&self.service);
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if !self.resolved {
            tracing::warn!(
                service = %self.service,
                "Call abandoned before its outcome was known, recording failure"
            );
            self.breaker.record_failure(&self.service);
        }
    }
}

// Circuit state stays consistent across a panicking holder: every mutation
// above is a sequence of plain field writes.
fn lock(cell: &Mutex<CircuitState>) -> MutexGuard<'_, CircuitState> {
    cell.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read(circuits: &RwLock<Circuits>) -> std::sync::RwLockReadGuard<'_, Circuits> {
    circuits.read().unwrap_or_else(PoisonError::into_inner)
}

fn write(circuits: &RwLock<Circuits>) -> std::sync::RwLockWriteGuard<'_, Circuits> {
    circuits.write().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use guarded_mesh_testing::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn breaker(config: CircuitBreakerConfig) -> (CircuitBreaker, ManualClock) {
        let clock = ManualClock::default();
        (CircuitBreaker::new(config, Arc::new(clock.clone())), clock)
    }

    fn open(breaker: &CircuitBreaker, service: &str) {
        for _ in 0..breaker.config().failure_threshold {
            breaker.record_failure(service);
        }
    }

    #[test]
    fn test_unknown_service_is_closed() {
        let (breaker, _) = breaker(CircuitBreakerConfig::default());
        assert_eq!(breaker.state("never-seen"), State::Closed);
        assert!(breaker.is_allowed("never-seen"));
    }

    #[test]
    fn test_opens_after_threshold() {
        let config = CircuitBreakerConfig::builder().failure_threshold(3).build();
        let (breaker, _) = breaker(config);

        breaker.record_failure("users");
        breaker.record_failure("users");
        assert_eq!(breaker.state("users"), State::Closed);

        breaker.record_failure("users");
        assert_eq!(breaker.state("users"), State::Open);
    }

    #[test]
    fn test_success_resets_failure_count() {
        let config = CircuitBreakerConfig::builder().failure_threshold(3).build();
        let (breaker, _) = breaker(config);

        breaker.record_failure("users");
        breaker.record_failure("users");
        breaker.record_success("users");
        breaker.record_failure("users");
        breaker.record_failure("users");

        assert_eq!(breaker.state("users"), State::Closed);
        assert_eq!(breaker.circuit("users").failure_count, 2);
    }

    #[test]
    fn test_rejects_while_open() {
        let (breaker, clock) = breaker(CircuitBreakerConfig::default());
        open(&breaker, "users");

        clock.advance(Duration::from_secs(29));
        for _ in 0..3 {
            assert!(!breaker.is_allowed("users"));
        }
        assert!(matches!(
            breaker.acquire("users"),
            Err(ServiceError::CircuitOpen { .. })
        ));
        assert_eq!(breaker.statistics("users").total_rejections, 4);
        assert_eq!(breaker.state("users"), State::Open);
    }

    #[test]
    fn test_transitions_to_half_open_at_timeout() {
        let (breaker, clock) = breaker(CircuitBreakerConfig::default());
        open(&breaker, "users");

        clock.advance(Duration::from_secs(30));
        assert!(breaker.is_allowed("users"));
        assert_eq!(breaker.state("users"), State::HalfOpen);
        assert_eq!(breaker.circuit("users").last_state_change, clock.now());
    }

    #[test]
    fn test_closes_after_success_threshold() {
        let (breaker, clock) = breaker(CircuitBreakerConfig::default());
        open(&breaker, "users");
        clock.advance(Duration::from_secs(31));
        assert!(breaker.is_allowed("users"));

        breaker.record_success("users");
        assert_eq!(breaker.state("users"), State::HalfOpen);
        breaker.record_success("users");
        assert_eq!(breaker.state("users"), State::Closed);
        assert_eq!(breaker.circuit("users").success_count, 0);
    }

    #[test]
    fn test_reopens_on_half_open_failure() {
        let (breaker, clock) = breaker(CircuitBreakerConfig::default());
        open(&breaker, "users");
        clock.advance(Duration::from_secs(30));
        assert!(breaker.is_allowed("users"));
        breaker.record_success("users");

        breaker.record_failure("users");
        assert_eq!(breaker.state("users"), State::Open);
        assert!(!breaker.is_allowed("users"));
    }

    #[test]
    fn test_services_are_independent() {
        let (breaker, _) = breaker(CircuitBreakerConfig::default());
        open(&breaker, "users");
        assert_eq!(breaker.state("users"), State::Open);
        assert_eq!(breaker.state("orders"), State::Closed);
        assert!(breaker.is_allowed("orders"));
    }

    #[test]
    fn test_statistics() {
        let (breaker, _) = breaker(CircuitBreakerConfig::default());
        for _ in 0..3 {
            breaker.record_success("users");
        }
        breaker.record_failure("users");

        let stats = breaker.statistics("users");
        assert_eq!(stats.total_successes, 3);
        assert_eq!(stats.total_failures, 1);
        assert!((stats.failure_rate - 0.25).abs() < f64::EPSILON);
        assert_eq!(breaker.all_statistics().len(), 1);
    }

    #[test]
    fn test_reset() {
        let (breaker, _) = breaker(CircuitBreakerConfig::default());
        open(&breaker, "users");
        breaker.reset("users");
        assert_eq!(breaker.state("users"), State::Closed);
        assert_eq!(breaker.statistics("users").total_failures, 0);

        open(&breaker, "orders");
        breaker.reset_all();
        assert!(breaker.service_names().is_empty());
        assert_eq!(breaker.state("orders"), State::Closed);
    }

    #[test]
    fn test_dropped_permit_records_failure() {
        let (breaker, _) = breaker(CircuitBreakerConfig::default());
        let permit = breaker.acquire("users").unwrap();
        assert_eq!(permit.service(), "users");
        drop(permit);

        let stats = breaker.statistics("users");
        assert_eq!(stats.total_failures, 1);
        assert_eq!(stats.total_successes, 0);
    }

    #[test]
    fn test_resolved_permit_records_once() {
        let (breaker, _) = breaker(CircuitBreakerConfig::default());
        breaker.acquire("users").unwrap().success();
        breaker.acquire("users").unwrap().failure();

        let stats = breaker.statistics("users");
        assert_eq!(stats.total_successes, 1);
        assert_eq!(stats.total_failures, 1);
    }

    #[tokio::test]
    async fn test_call_wraps_operation() {
        let config = CircuitBreakerConfig::builder().failure_threshold(2).build();
        let (breaker, _) = breaker(config);

        let ok = breaker.call("users", || async { Ok::<_, String>(42) }).await;
        assert_eq!(ok.unwrap(), 42);

        for _ in 0..2 {
            let _ = breaker.call("users", || async { Err::<i32, _>("error") }).await;
        }

        let rejected = breaker.call("users", || async { Ok::<_, String>(42) }).await;
        assert!(matches!(rejected, Err(CircuitBreakerError::Open(name)) if name == "users"));
    }

    #[tokio::test]
    async fn test_concurrent_calls() {
        let (breaker, _) = breaker(CircuitBreakerConfig::default());
        let counter = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];

        for i in 0..100 {
            let breaker = breaker.clone();
            let counter = Arc::clone(&counter);
            handles.push(tokio::spawn(async move {
                let service = if i % 2 == 0 { "even" } else { "odd" };
                let _ = breaker
                    .call(service, || async {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, String>(())
                    })
                    .await;
            }));
        }

        for handle in handles {
            handle.await.ok();
        }

        assert_eq!(counter.load(Ordering::SeqCst), 100);
        assert_eq!(breaker.statistics("even").total_successes, 50);
        assert_eq!(breaker.statistics("odd").total_successes, 50);
    }

    #[tokio::test]
    async fn test_concurrent_failures_open_exactly_once() {
        let config = CircuitBreakerConfig::builder().failure_threshold(10).build();
        let (breaker, _) = breaker(config);
        let mut handles = vec![];

        for _ in 0..10 {
            let breaker = breaker.clone();
            handles.push(tokio::spawn(async move {
                breaker.record_failure("users");
            }));
        }
        for handle in handles {
            handle.await.ok();
        }

        let circuit = breaker.circuit("users");
        assert_eq!(circuit.state, State::Open);
        assert_eq!(circuit.total_failures, 10);
    }
}
