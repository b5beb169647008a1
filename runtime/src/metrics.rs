//! Prometheus metrics for observability and monitoring.
//!
//! This module provides metric collection for all mesh components:
//! - Guarded calls (outcome and latency per service)
//! - Circuit breaker state and transitions
//! - Registry membership
//! - Saga executions and compensations
//! - Broker publish/consume
//!
//! Recorders are plain functions over the global `metrics` recorder; when no
//! recorder is installed they are no-ops, so library code calls them
//! unconditionally.
//!
//! # Example
//!
//! ```rust,no_run
//! use guarded_mesh_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! if let Some(text) = server.render() {
//!     println!("{text}");
//! }
//! # Ok(())
//! # }
//! ```

use guarded_mesh_core::circuit::State;
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// Installs the Prometheus recorder; [`render`](Self::render) produces the
/// scrape payload for whatever HTTP surface the host application exposes.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Address the host application intends to serve `/metrics` on.
    ///   Nothing binds it here.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Address the host application was configured to serve metrics on.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Register metric descriptions and install the recorder.
    ///
    /// # Errors
    ///
    /// Returns error if the metrics exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// If a metrics recorder is already installed (e.g., in tests), this logs a
    /// warning and succeeds without a handle.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(
                    addr = %self.addr,
                    "Metrics recorder installed, no listener is bound; the host serves render()"
                );
                Ok(())
            },
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            },
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    // Call Metrics
    describe_counter!(
        "mesh_calls_total",
        "Total number of guarded calls, labelled by service and outcome"
    );
    describe_histogram!(
        "mesh_call_duration_seconds",
        "Time spent in the transport for admitted calls"
    );

    // Circuit Breaker Metrics
    describe_gauge!(
        "circuit_breaker_state",
        "Current circuit breaker state (0=closed, 1=half-open, 2=open)"
    );
    describe_counter!(
        "circuit_breaker_calls_total",
        "Total number of calls admitted through circuit breaker"
    );
    describe_counter!(
        "circuit_breaker_successes_total",
        "Total number of successful calls"
    );
    describe_counter!(
        "circuit_breaker_failures_total",
        "Total number of failed calls"
    );
    describe_counter!(
        "circuit_breaker_rejections_total",
        "Total number of rejected calls (circuit open)"
    );
    describe_counter!(
        "circuit_breaker_transitions_total",
        "Total number of circuit state transitions"
    );

    // Registry Metrics
    describe_gauge!(
        "registry_instances",
        "Number of registered service instances"
    );
    describe_counter!(
        "registry_expired_total",
        "Total number of instances marked inactive by heartbeat expiry"
    );

    // Saga Metrics
    describe_counter!(
        "saga_executions_total",
        "Total number of saga executions, labelled by outcome"
    );
    describe_counter!(
        "saga_compensations_total",
        "Total number of compensating calls, labelled by outcome"
    );
    describe_histogram!(
        "saga_duration_seconds",
        "Time taken to execute a saga including compensation"
    );

    // Broker Metrics
    describe_counter!(
        "broker_messages_published_total",
        "Total number of messages published to the broker"
    );
    describe_counter!(
        "broker_messages_consumed_total",
        "Total number of messages consumed from the broker"
    );
    describe_counter!(
        "broker_lagged_total",
        "Total number of messages dropped for lagging subscribers"
    );
}

/// Guarded call metrics recorder.
pub struct CallMetrics;

impl CallMetrics {
    /// Record a call outcome (`ok`, `not_found`, `circuit_open`, `failed`).
    pub fn record_outcome(service: &str, outcome: &'static str) {
        counter!("mesh_calls_total", "service" => service.to_string(), "outcome" => outcome)
            .increment(1);
    }

    /// Record time spent in the transport.
    pub fn record_duration(service: &str, duration: Duration) {
        histogram!("mesh_call_duration_seconds", "service" => service.to_string())
            .record(duration.as_secs_f64());
    }
}

/// Circuit breaker metrics recorder.
pub struct CircuitMetrics;

impl CircuitMetrics {
    /// Record circuit breaker state.
    pub fn record_state(service: &str, state: State) {
        gauge!("circuit_breaker_state", "service" => service.to_string()).set(state.as_gauge());
    }

    /// Record a state transition and the new state.
    pub fn record_transition(service: &str, from: State, to: State) {
        counter!(
            "circuit_breaker_transitions_total",
            "service" => service.to_string(),
            "from" => from.to_string(),
            "to" => to.to_string()
        )
        .increment(1);
        Self::record_state(service, to);
    }

    /// Record an admitted call.
    pub fn record_call(service: &str) {
        counter!("circuit_breaker_calls_total", "service" => service.to_string()).increment(1);
    }

    /// Record a successful call.
    pub fn record_success(service: &str) {
        counter!("circuit_breaker_successes_total", "service" => service.to_string()).increment(1);
    }

    /// Record a failed call.
    pub fn record_failure(service: &str) {
        counter!("circuit_breaker_failures_total", "service" => service.to_string()).increment(1);
    }

    /// Record a rejected call (circuit open).
    pub fn record_rejection(service: &str) {
        counter!("circuit_breaker_rejections_total", "service" => service.to_string())
            .increment(1);
    }
}

/// Registry metrics recorder.
pub struct RegistryMetrics;

impl RegistryMetrics {
    /// Record the number of registered instances.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_instances(count: usize) {
        gauge!("registry_instances").set(count as f64);
    }

    /// Record instances expired by the heartbeat monitor.
    pub fn record_expired(count: usize) {
        counter!("registry_expired_total").increment(count as u64);
    }
}

/// Saga metrics recorder.
pub struct SagaMetrics;

impl SagaMetrics {
    /// Record a finished saga (`completed` or `failed`).
    pub fn record_execution(saga: &str, outcome: &'static str, duration: Duration) {
        counter!("saga_executions_total", "saga" => saga.to_string(), "outcome" => outcome)
            .increment(1);
        histogram!("saga_duration_seconds", "saga" => saga.to_string())
            .record(duration.as_secs_f64());
    }

    /// Record a compensating call (`ok` or `failed`).
    pub fn record_compensation(saga: &str, outcome: &'static str) {
        counter!("saga_compensations_total", "saga" => saga.to_string(), "outcome" => outcome)
            .increment(1);
    }
}

/// Broker metrics recorder.
pub struct BrokerMetrics;

impl BrokerMetrics {
    /// Record a message publish.
    pub fn record_publish(topic: &str) {
        counter!("broker_messages_published_total", "topic" => topic.to_string()).increment(1);
    }

    /// Record a message consumption.
    pub fn record_consume(topic: &str) {
        counter!("broker_messages_consumed_total", "topic" => topic.to_string()).increment(1);
    }

    /// Record messages dropped for a lagging subscriber.
    pub fn record_lagged(topic: &str, skipped: u64) {
        counter!("broker_lagged_total", "topic" => topic.to_string()).increment(skipped);
    }
}
