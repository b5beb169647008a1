//! Scripted transport for deterministic client tests
//!
//! [`ScriptedTransport`] answers every invocation from a per-service queue of
//! scripted outcomes and falls back to a default answer once the queue is
//! drained. Every attempt is recorded, which is how tests prove that a
//! fast-failed call never reached the transport.

#![allow(clippy::missing_panics_doc)] // Lock poisoning is recovered, never panics

use guarded_mesh_core::error::TransportError;
use guarded_mesh_core::service::ServiceRecord;
use guarded_mesh_core::transport::{Transport, TransportFuture};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// One scripted answer.
#[derive(Debug, Clone)]
enum Scripted {
    Respond(Result<Value, TransportError>),
    Hang(Duration),
}

/// An invocation observed by the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    /// Service name of the instance that was invoked
    pub service: String,
    /// Address of the instance that was invoked
    pub address: String,
    /// Method name
    pub method: String,
    /// Parameters passed
    pub params: Value,
}

#[derive(Debug, Default)]
struct Inner {
    scripts: HashMap<String, VecDeque<Scripted>>,
    calls: Vec<RecordedCall>,
}

/// Transport that replays scripted outcomes and records every attempt.
///
/// Unscripted invocations succeed and echo their parameters back.
///
/// # Example
///
/// ```
/// use guarded_mesh_testing::ScriptedTransport;
/// use guarded_mesh_core::{ServiceRecord, Transport};
/// use chrono::Utc;
/// use serde_json::json;
///
/// # async fn example() {
/// let transport = ScriptedTransport::new();
/// transport.fail_times("pricing", "quote", 1);
///
/// let record = ServiceRecord::new("pricing", "10.0.0.1:9000", Default::default(), Utc::now());
/// assert!(transport.invoke(&record, "quote", json!({})).await.is_err());
/// assert!(transport.invoke(&record, "quote", json!({})).await.is_ok());
/// assert_eq!(transport.attempts("pricing"), 2);
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct ScriptedTransport {
    inner: Arc<Mutex<Inner>>,
}

impl ScriptedTransport {
    /// Create a transport with no scripts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful response for `service.method`.
    pub fn respond(&self, service: &str, method: &str, value: Value) {
        self.push(service, method, Scripted::Respond(Ok(value)));
    }

    /// Queue a failure for `service.method`.
    pub fn fail(&self, service: &str, method: &str, error: TransportError) {
        self.push(service, method, Scripted::Respond(Err(error)));
    }

    /// Queue `times` remote failures for `service.method`.
    pub fn fail_times(&self, service: &str, method: &str, times: usize) {
        for attempt in 0..times {
            self.fail(
                service,
                method,
                TransportError::Remote(format!("scripted failure #{}", attempt + 1)),
            );
        }
    }

    /// Queue an invocation that sleeps for `duration` before succeeding.
    ///
    /// Used to drive timeouts and cancellation.
    pub fn hang(&self, service: &str, method: &str, duration: Duration) {
        self.push(service, method, Scripted::Hang(duration));
    }

    /// Every call observed so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.lock().calls.clone()
    }

    /// Number of invocations that reached `service`.
    #[must_use]
    pub fn attempts(&self, service: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.service == service)
            .count()
    }

    /// Methods invoked, as `service.method`, in order.
    #[must_use]
    pub fn call_log(&self) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .map(|call| format!("{}.{}", call.service, call.method))
            .collect()
    }

    fn push(&self, service: &str, method: &str, scripted: Scripted) {
        self.lock()
            .scripts
            .entry(key(service, method))
            .or_default()
            .push_back(scripted);
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn key(service: &str, method: &str) -> String {
    format!("{service}.{method}")
}

impl Transport for ScriptedTransport {
    fn invoke<'a>(
        &'a self,
        endpoint: &'a ServiceRecord,
        method: &'a str,
        params: Value,
    ) -> TransportFuture<'a> {
        let scripted = {
            let mut inner = self.lock();
            inner.calls.push(RecordedCall {
                service: endpoint.name.clone(),
                address: endpoint.address.clone(),
                method: method.to_string(),
                params: params.clone(),
            });
            inner
                .scripts
                .get_mut(&key(&endpoint.name, method))
                .and_then(VecDeque::pop_front)
        };

        Box::pin(async move {
            match scripted {
                Some(Scripted::Respond(outcome)) => outcome,
                Some(Scripted::Hang(duration)) => {
                    tokio::time::sleep(duration).await;
                    Ok(params)
                },
                None => Ok(params),
            }
        })
    }
}
