//! Error taxonomy for guarded calls and orchestrations.
//!
//! - [`ServiceError::ServiceNotFound`]: registry miss, no breaker change
//! - [`ServiceError::CircuitOpen`]: fast-fail, the transport was never touched
//! - [`ServiceError::ServiceCallFailed`]: the transport failed, wraps the cause
//! - [`OrchestrationError::Failed`]: a saga step failed, carries the index of the
//!   failed step and the outcome of every compensation that ran
//!
//! A duplicate registration is not an error: `ServiceRegistry::register`
//! returns `false` for an existing `(name, address)` pair.

use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Failures reported by a [`Transport`](crate::transport::Transport).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No response within the configured call timeout
    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    /// The instance could not be reached
    #[error("Instance unreachable at {address}: {reason}")]
    Unreachable {
        /// Address that was tried
        address: String,
        /// Underlying reason
        reason: String,
    },

    /// The remote side answered with an error
    #[error("Remote error: {0}")]
    Remote(String),

    /// The instance does not expose the requested method
    #[error("Method '{method}' not found on service '{service}'")]
    MethodNotFound {
        /// Service name
        service: String,
        /// Requested method
        method: String,
    },
}

/// Errors returned by `ServiceClient::call`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// No active instance of the service is registered
    #[error("Service '{service}' not found")]
    ServiceNotFound {
        /// Requested service name
        service: String,
    },

    /// The circuit for the service is open; no attempt was made
    #[error("Circuit breaker for '{service}' is open")]
    CircuitOpen {
        /// Requested service name
        service: String,
    },

    /// The transport failed or timed out
    #[error("Call to {service}.{method} failed: {cause}")]
    ServiceCallFailed {
        /// Requested service name
        service: String,
        /// Requested method
        method: String,
        /// What went wrong
        #[source]
        cause: TransportError,
    },
}

impl ServiceError {
    /// Name of the service the failed call was addressed to.
    #[must_use]
    pub fn service(&self) -> &str {
        match self {
            Self::ServiceNotFound { service }
            | Self::CircuitOpen { service }
            | Self::ServiceCallFailed { service, .. } => service,
        }
    }

    /// Whether the call was refused without reaching the transport.
    #[must_use]
    pub const fn is_fast_fail(&self) -> bool {
        matches!(self, Self::ServiceNotFound { .. } | Self::CircuitOpen { .. })
    }
}

/// Outcome of one compensating action.
#[derive(Debug, Clone, PartialEq)]
pub struct CompensationResult {
    /// Index of the step being compensated
    pub step_index: usize,
    /// Name of the step being compensated
    pub step_name: String,
    /// Result of the compensating call
    pub outcome: Result<Value, ServiceError>,
}

impl CompensationResult {
    /// Whether the compensating call succeeded.
    #[must_use]
    pub const fn succeeded(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Errors returned by `Orchestrator::execute`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OrchestrationError {
    /// A step failed; compensations for the completed steps have already run
    #[error("Saga '{saga}' failed at step {failed_step_index} ('{failed_step}'): {cause}")]
    Failed {
        /// Saga name
        saga: String,
        /// Index of the step that failed
        failed_step_index: usize,
        /// Name of the step that failed
        failed_step: String,
        /// The step's error
        #[source]
        cause: ServiceError,
        /// Compensations that ran, in execution order
        compensations: Vec<CompensationResult>,
    },
}

impl OrchestrationError {
    /// Index of the step that failed.
    #[must_use]
    pub const fn failed_step_index(&self) -> usize {
        match self {
            Self::Failed {
                failed_step_index, ..
            } => *failed_step_index,
        }
    }

    /// Compensations that ran, in execution order.
    #[must_use]
    pub fn compensations(&self) -> &[CompensationResult] {
        match self {
            Self::Failed { compensations, .. } => compensations,
        }
    }

    /// The error of the failed step.
    #[must_use]
    pub const fn cause(&self) -> &ServiceError {
        match self {
            Self::Failed { cause, .. } => cause,
        }
    }
}
