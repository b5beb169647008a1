//! Saga orchestration over guarded calls.
//!
//! A [`Saga`] is an ordered list of [`Step`]s. Each step is one
//! [`ServiceCall`] plus an optional compensating call. The [`Orchestrator`]
//! runs the steps in order through a [`ServiceClient`]; when step `i` fails it
//! runs the compensations of steps `i-1..=0` in reverse order and reports the
//! failure together with every compensation outcome.
//!
//! Compensation is best effort: a failing compensation is logged and recorded
//! in the returned [`CompensationResult`]s, and the remaining compensations
//! still run. The failed step's own compensation never runs.
//!
//! ```text
//! reserve ──ok──► charge ──ok──► ship ──✗
//!                                   │
//!              refund ◄── release ◄─┘   (compensations, reverse order)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! let saga = Saga::new("checkout")
//!     .step(
//!         Step::new("reserve", ServiceCall::new("inventory", "reserve", json!({"sku": "A-1"})))
//!             .compensate_from(|reservation| {
//!                 ServiceCall::new("inventory", "release", reservation.clone())
//!             }),
//!     )
//!     .step(Step::new("charge", ServiceCall::new("payments", "charge", json!({"cents": 1999})))
//!         .compensate_with(ServiceCall::new("payments", "refund", json!({"cents": 1999}))));
//!
//! let outcome = Orchestrator::new(client).execute(&saga).await?;
//! ```

use crate::client::ServiceClient;
use crate::metrics::SagaMetrics;
use guarded_mesh_core::broker::{Broker, Message};
use guarded_mesh_core::environment::Clock;
use guarded_mesh_core::error::{CompensationResult, OrchestrationError};
use guarded_mesh_core::service::ServiceCall;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Message kinds published while a saga runs.
pub mod kinds {
    /// Saga execution began
    pub const SAGA_STARTED: &str = "saga.started";
    /// A step returned successfully
    pub const STEP_COMPLETED: &str = "saga.step_completed";
    /// A step failed, compensation follows
    pub const STEP_FAILED: &str = "saga.step_failed";
    /// A compensating call finished (successfully or not)
    pub const COMPENSATED: &str = "saga.compensated";
    /// Every step succeeded
    pub const SAGA_COMPLETED: &str = "saga.completed";
    /// The saga failed after compensating
    pub const SAGA_FAILED: &str = "saga.failed";
}

type CompensationFn = Arc<dyn Fn(&Value) -> ServiceCall + Send + Sync>;

/// How a step is undone.
#[derive(Clone)]
pub enum Compensation {
    /// A fixed call
    Call(ServiceCall),
    /// A call built from the step's result
    Derived(CompensationFn),
}

impl Compensation {
    fn build(&self, result: &Value) -> ServiceCall {
        match self {
            Self::Call(call) => call.clone(),
            Self::Derived(build) => build(result),
        }
    }
}

impl fmt::Debug for Compensation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Call(call) => f.debug_tuple("Call").field(call).finish(),
            Self::Derived(_) => f.write_str("Derived(<fn>)"),
        }
    }
}

/// One unit of work in a saga.
#[derive(Debug, Clone)]
pub struct Step {
    /// Step name, used in logs, errors and notifications
    pub name: String,
    /// The forward call
    pub call: ServiceCall,
    compensation: Option<Compensation>,
}

impl Step {
    /// A step with no compensation.
    #[must_use]
    pub fn new(name: impl Into<String>, call: ServiceCall) -> Self {
        Self {
            name: name.into(),
            call,
            compensation: None,
        }
    }

    /// Undo this step with a fixed call.
    #[must_use]
    pub fn compensate_with(mut self, call: ServiceCall) -> Self {
        self.compensation = Some(Compensation::Call(call));
        self
    }

    /// Undo this step with a call built from the step's result.
    #[must_use]
    pub fn compensate_from<F>(mut self, build: F) -> Self
    where
        F: Fn(&Value) -> ServiceCall + Send + Sync + 'static,
    {
        self.compensation = Some(Compensation::Derived(Arc::new(build)));
        self
    }

    /// Whether the step can be undone.
    #[must_use]
    pub const fn has_compensation(&self) -> bool {
        self.compensation.is_some()
    }
}

/// An ordered list of steps.
#[derive(Debug, Clone)]
pub struct Saga {
    /// Saga name
    pub name: String,
    /// Steps, run in order
    pub steps: Vec<Step>,
}

impl Saga {
    /// An empty saga.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    /// Append a step.
    #[must_use]
    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Number of steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the saga has no steps.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Result of one completed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    /// Position of the step in the saga
    pub step_index: usize,
    /// Step name
    pub step_name: String,
    /// Value returned by the step's call
    pub value: Value,
}

/// Result of a saga where every step succeeded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaOutcome {
    /// Saga name
    pub saga: String,
    /// One entry per step, in order
    pub results: Vec<StepResult>,
}

impl SagaOutcome {
    /// Value returned by the named step.
    #[must_use]
    pub fn value(&self, step_name: &str) -> Option<&Value> {
        self.results
            .iter()
            .find(|result| result.step_name == step_name)
            .map(|result| &result.value)
    }
}

/// Runs sagas through a [`ServiceClient`].
///
/// The orchestrator is stateless between executions; concurrent `execute`
/// calls are independent.
#[derive(Clone)]
pub struct Orchestrator {
    client: ServiceClient,
    clock: Arc<dyn Clock>,
    broker: Option<(Arc<dyn Broker>, String)>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("client", &self.client)
            .field("topic", &self.broker.as_ref().map(|(_, topic)| topic))
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Create an orchestrator that publishes nothing.
    #[must_use]
    pub fn new(client: ServiceClient) -> Self {
        let clock = client.clock();
        Self {
            client,
            clock,
            broker: None,
        }
    }

    /// Publish saga progress to `topic` on `broker`.
    #[must_use]
    pub fn with_broker(mut self, broker: Arc<dyn Broker>, topic: impl Into<String>) -> Self {
        self.broker = Some((broker, topic.into()));
        self
    }

    /// Run every step of `saga` in order.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestrationError::Failed`] when a step fails, after the
    /// compensations of all previously completed steps have run.
    pub async fn execute(&self, saga: &Saga) -> Result<SagaOutcome, OrchestrationError> {
        let started = Instant::now();
        tracing::info!(saga = %saga.name, steps = saga.len(), "Saga started");
        self.notify(
            kinds::SAGA_STARTED,
            json!({ "saga": saga.name, "steps": saga.len() }),
        )
        .await;

        let mut results: Vec<StepResult> = Vec::with_capacity(saga.len());

        for (index, step) in saga.steps.iter().enumerate() {
            match self.client.call_service(&step.call).await {
                Ok(value) => {
                    tracing::debug!(saga = %saga.name, step = %step.name, index, "Step completed");
                    self.notify(
                        kinds::STEP_COMPLETED,
                        json!({ "saga": saga.name, "step": step.name, "index": index }),
                    )
                    .await;
                    results.push(StepResult {
                        step_index: index,
                        step_name: step.name.clone(),
                        value,
                    });
                },
                Err(cause) => {
                    tracing::warn!(
                        saga = %saga.name,
                        step = %step.name,
                        index,
                        error = %cause,
                        "Step failed, compensating"
                    );
                    self.notify(
                        kinds::STEP_FAILED,
                        json!({
                            "saga": saga.name,
                            "step": step.name,
                            "index": index,
                            "error": cause.to_string(),
                        }),
                    )
                    .await;

                    let compensations = self.compensate(saga, &results).await;
                    SagaMetrics::record_execution(&saga.name, "failed", started.elapsed());
                    self.notify(
                        kinds::SAGA_FAILED,
                        json!({
                            "saga": saga.name,
                            "failed_step": step.name,
                            "failed_step_index": index,
                            "compensated": compensations.len(),
                        }),
                    )
                    .await;

                    return Err(OrchestrationError::Failed {
                        saga: saga.name.clone(),
                        failed_step_index: index,
                        failed_step: step.name.clone(),
                        cause,
                        compensations,
                    });
                },
            }
        }

        SagaMetrics::record_execution(&saga.name, "completed", started.elapsed());
        tracing::info!(saga = %saga.name, "Saga completed");
        self.notify(
            kinds::SAGA_COMPLETED,
            json!({ "saga": saga.name, "steps": results.len() }),
        )
        .await;

        Ok(SagaOutcome {
            saga: saga.name.clone(),
            results,
        })
    }

    async fn compensate(&self, saga: &Saga, completed: &[StepResult]) -> Vec<CompensationResult> {
        let mut compensations = Vec::new();

        for (step, done) in saga.steps.iter().zip(completed).rev() {
            let Some(compensation) = &step.compensation else {
                continue;
            };

            let call = compensation.build(&done.value);
            let outcome = self.client.call_service(&call).await;
            match &outcome {
                Ok(_) => {
                    SagaMetrics::record_compensation(&saga.name, "ok");
                    tracing::info!(saga = %saga.name, step = %step.name, "Step compensated");
                },
                Err(error) => {
                    SagaMetrics::record_compensation(&saga.name, "failed");
                    tracing::error!(
                        saga = %saga.name,
                        step = %step.name,
                        service = %call.service,
                        method = %call.method,
                        error = %error,
                        "Compensation failed"
                    );
                },
            }
            self.notify(
                kinds::COMPENSATED,
                json!({
                    "saga": saga.name,
                    "step": step.name,
                    "index": done.step_index,
                    "succeeded": outcome.is_ok(),
                }),
            )
            .await;

            compensations.push(CompensationResult {
                step_index: done.step_index,
                step_name: step.name.clone(),
                outcome,
            });
        }

        compensations
    }

    async fn notify(&self, kind: &str, payload: Value) {
        let Some((broker, topic)) = &self.broker else {
            return;
        };
        let message = Message::new(topic.clone(), kind, payload, self.clock.now());
        if let Err(error) = broker.publish(message).await {
            tracing::warn!(topic = %topic, kind, error = %error, "Failed to publish saga notification");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
    use crate::client::ClientConfig;
    use crate::registry::ServiceRegistry;
    use futures::StreamExt;
    use guarded_mesh_core::error::{ServiceError, TransportError};
    use guarded_mesh_core::service::Metadata;
    use guarded_mesh_testing::{ManualClock, ScriptedTransport};

    async fn setup() -> (Orchestrator, ScriptedTransport) {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());
        let registry = ServiceRegistry::new(Arc::clone(&clock));
        for service in ["inventory", "payments", "shipping"] {
            registry.register(service, "in-process", Metadata::new()).await;
        }
        let breaker = CircuitBreaker::new(CircuitBreakerConfig::default(), Arc::clone(&clock));
        let transport = ScriptedTransport::new();
        let client = ServiceClient::new(
            registry,
            breaker,
            Arc::new(transport.clone()),
            clock,
            ClientConfig::default(),
        );
        (Orchestrator::new(client), transport)
    }

    fn checkout() -> Saga {
        Saga::new("checkout")
            .step(
                Step::new(
                    "reserve",
                    ServiceCall::new("inventory", "reserve", json!({"sku": "A-1"})),
                )
                .compensate_from(|reservation| {
                    ServiceCall::new("inventory", "release", reservation.clone())
                }),
            )
            .step(
                Step::new("charge", ServiceCall::new("payments", "charge", json!({"cents": 1999})))
                    .compensate_with(ServiceCall::new("payments", "refund", json!({"cents": 1999}))),
            )
            .step(
                Step::new("ship", ServiceCall::new("shipping", "create", json!({})))
                    .compensate_with(ServiceCall::new("shipping", "cancel", json!({}))),
            )
    }

    #[tokio::test]
    async fn test_all_steps_succeed() {
        let (orchestrator, transport) = setup().await;
        transport.respond("inventory", "reserve", json!({"reservation": 17}));

        let outcome = orchestrator.execute(&checkout()).await.unwrap();

        assert_eq!(outcome.saga, "checkout");
        assert_eq!(outcome.results.len(), 3);
        assert_eq!(outcome.value("reserve"), Some(&json!({"reservation": 17})));
        assert_eq!(
            transport.call_log(),
            vec!["inventory.reserve", "payments.charge", "shipping.create"]
        );
    }

    #[tokio::test]
    async fn test_failure_compensates_completed_steps_in_reverse() {
        let (orchestrator, transport) = setup().await;
        transport.respond("inventory", "reserve", json!({"reservation": 17}));
        transport.fail_times("shipping", "create", 1);

        let err = orchestrator.execute(&checkout()).await.unwrap_err();

        assert_eq!(err.failed_step_index(), 2);
        let compensated: Vec<_> = err.compensations().iter().map(|c| c.step_index).collect();
        assert_eq!(compensated, vec![1, 0]);
        assert!(err.compensations().iter().all(CompensationResult::succeeded));
        assert_eq!(
            transport.call_log(),
            vec![
                "inventory.reserve",
                "payments.charge",
                "shipping.create",
                "payments.refund",
                "inventory.release",
            ]
        );
        // Release is built from the reserve result
        let release = transport.calls().pop().unwrap();
        assert_eq!(release.params, json!({"reservation": 17}));
    }

    #[tokio::test]
    async fn test_failing_compensation_does_not_stop_the_rest() {
        let (orchestrator, transport) = setup().await;
        transport.fail_times("shipping", "create", 1);
        transport.fail_times("payments", "refund", 1);

        let err = orchestrator.execute(&checkout()).await.unwrap_err();

        let compensations = err.compensations();
        assert_eq!(compensations.len(), 2);
        assert_eq!(compensations[0].step_name, "charge");
        assert!(!compensations[0].succeeded());
        assert_eq!(compensations[1].step_name, "reserve");
        assert!(compensations[1].succeeded());
    }

    #[tokio::test]
    async fn test_first_step_failure_runs_no_compensation() {
        let (orchestrator, transport) = setup().await;
        transport.fail("inventory", "reserve", TransportError::Remote("out of stock".into()));

        let err = orchestrator.execute(&checkout()).await.unwrap_err();

        assert_eq!(err.failed_step_index(), 0);
        assert!(err.compensations().is_empty());
        assert_eq!(transport.call_log(), vec!["inventory.reserve"]);
    }

    #[tokio::test]
    async fn test_steps_without_compensation_are_skipped() {
        let (orchestrator, transport) = setup().await;
        let saga = Saga::new("audit")
            .step(Step::new("log", ServiceCall::new("inventory", "log", json!({}))))
            .step(
                Step::new("charge", ServiceCall::new("payments", "charge", json!({})))
                    .compensate_with(ServiceCall::new("payments", "refund", json!({}))),
            )
            .step(Step::new("ship", ServiceCall::new("unknown", "create", json!({}))));

        let err = orchestrator.execute(&saga).await.unwrap_err();

        assert!(matches!(err.cause(), ServiceError::ServiceNotFound { .. }));
        assert_eq!(err.compensations().len(), 1);
        assert_eq!(err.compensations()[0].step_name, "charge");
        assert_eq!(
            transport.call_log(),
            vec!["inventory.log", "payments.charge", "payments.refund"]
        );
    }

    #[tokio::test]
    async fn test_empty_saga_succeeds() {
        let (orchestrator, transport) = setup().await;
        let outcome = orchestrator.execute(&Saga::new("noop")).await.unwrap();
        assert!(outcome.results.is_empty());
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_progress_is_published() {
        let (orchestrator, transport) = setup().await;
        transport.fail_times("shipping", "create", 1);
        let broker = Arc::new(InMemoryBroker::new(64));
        let mut stream = broker.subscribe(&["sagas"]).await.unwrap();
        let orchestrator = orchestrator.with_broker(broker, "sagas");

        let _ = orchestrator.execute(&checkout()).await;

        let mut seen = Vec::new();
        for _ in 0..7 {
            let message = stream.next().await.unwrap().unwrap();
            assert_eq!(message.topic, "sagas");
            seen.push(message.kind);
        }
        assert_eq!(
            seen,
            vec![
                kinds::SAGA_STARTED,
                kinds::STEP_COMPLETED,
                kinds::STEP_COMPLETED,
                kinds::STEP_FAILED,
                kinds::COMPENSATED,
                kinds::COMPENSATED,
                kinds::SAGA_FAILED,
            ]
        );
    }
}
