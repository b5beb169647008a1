//! In-process transport.
//!
//! [`InProcessTransport`] dispatches an invocation to a handler registered for
//! `(service, method)` and awaits it directly. It stands in for HTTP/RPC when
//! every service lives in the same process, which is how the demo and the
//! integration tests run.

use futures::future::BoxFuture;
use guarded_mesh_core::error::TransportError;
use guarded_mesh_core::service::ServiceRecord;
use guarded_mesh_core::transport::{Transport, TransportFuture};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

type Handler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, TransportError>> + Send + Sync>;

/// Transport that calls registered async handlers directly.
///
/// # Example
///
/// ```rust
/// use guarded_mesh_runtime::transport::InProcessTransport;
/// use serde_json::json;
///
/// let transport = InProcessTransport::new();
/// transport.handle("pricing-service", "quote", |params| async move {
///     let sku = params["sku"].as_str().unwrap_or_default().to_string();
///     Ok(json!({ "sku": sku, "price_cents": 1999 }))
/// });
/// assert!(transport.has_handler("pricing-service", "quote"));
/// ```
#[derive(Clone, Default)]
pub struct InProcessTransport {
    handlers: Arc<RwLock<HashMap<(String, String), Handler>>>,
}

impl std::fmt::Debug for InProcessTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<_> = handlers.keys().map(|(s, m)| format!("{s}.{m}")).collect();
        keys.sort();
        f.debug_struct("InProcessTransport")
            .field("handlers", &keys)
            .finish()
    }
}

impl InProcessTransport {
    /// Create a transport with no handlers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for `service.method`.
    pub fn handle<F, Fut>(&self, service: &str, method: &str, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, TransportError>> + Send + 'static,
    {
        let boxed: Handler = Arc::new(
            move |params| -> BoxFuture<'static, Result<Value, TransportError>> {
                Box::pin(handler(params))
            },
        );
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((service.to_string(), method.to_string()), boxed);
    }

    /// Whether a handler exists for `service.method`.
    #[must_use]
    pub fn has_handler(&self, service: &str, method: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&(service.to_string(), method.to_string()))
    }
}

impl Transport for InProcessTransport {
    fn invoke<'a>(
        &'a self,
        endpoint: &'a ServiceRecord,
        method: &'a str,
        params: Value,
    ) -> TransportFuture<'a> {
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(endpoint.name.clone(), method.to_string()))
            .cloned();

        Box::pin(async move {
            match handler {
                Some(handler) => {
                    tracing::trace!(
                        service = %endpoint.name,
                        address = %endpoint.address,
                        method,
                        "Dispatching in-process call"
                    );
                    handler(params).await
                },
                None => Err(TransportError::MethodNotFound {
                    service: endpoint.name.clone(),
                    method: method.to_string(),
                }),
            }
        })
    }
}
