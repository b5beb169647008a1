//! Guarded service client.
//!
//! [`ServiceClient::call`] is the one place where discovery, admission control
//! and the transport meet:
//!
//! 1. discover an active instance (optionally through a TTL cache);
//!    a miss fails with `ServiceNotFound`
//! 2. ask the circuit breaker for a permit; an open circuit fails with
//!    `CircuitOpen` before the transport is touched
//! 3. invoke the transport under `call_timeout`, then resolve the permit with
//!    the outcome; timeouts count as failures
//!
//! The client never retries. Retry policy, if any, belongs to the caller.
//!
//! # Cancellation
//!
//! Dropping the future returned by `call` drops the breaker permit unresolved,
//! which records a failure: the call may or may not have completed remotely.
//!
//! # Example
//!
//! ```rust
//! use guarded_mesh_runtime::{
//!     CircuitBreaker, CircuitBreakerConfig, ClientConfig, InProcessTransport, ServiceClient,
//!     ServiceRegistry,
//! };
//! use guarded_mesh_core::SystemClock;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let clock = Arc::new(SystemClock);
//! let registry = ServiceRegistry::new(clock.clone());
//! let breaker = CircuitBreaker::new(CircuitBreakerConfig::default(), clock.clone());
//! let transport = InProcessTransport::new();
//! transport.handle("pricing-service", "quote", |_| async { Ok(json!({"price_cents": 1999})) });
//!
//! registry.register("pricing-service", "10.0.0.1:9000", Default::default()).await;
//!
//! let client = ServiceClient::new(registry, breaker, Arc::new(transport), clock, ClientConfig::default());
//! let quote = client.call("pricing-service", "quote", json!({"sku": "A-1"})).await?;
//! assert_eq!(quote["price_cents"], 1999);
//! # Ok(())
//! # }
//! ```

use crate::circuit_breaker::CircuitBreaker;
use crate::metrics::CallMetrics;
use crate::registry::ServiceRegistry;
use chrono::{DateTime, Utc};
use guarded_mesh_core::environment::Clock;
use guarded_mesh_core::error::{ServiceError, TransportError};
use guarded_mesh_core::service::{ServiceCall, ServiceRecord};
use guarded_mesh_core::transport::Transport;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Upper bound on a single transport invocation
    pub call_timeout: Duration,
    /// How long a discovery result may be reused; zero disables caching
    pub discovery_cache_ttl: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(5),
            discovery_cache_ttl: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone)]
struct CachedRecord {
    record: ServiceRecord,
    cached_at: DateTime<Utc>,
}

/// Combines registry lookup, circuit breaking and a transport.
///
/// Cloning is cheap and clones share the registry, breaker and cache.
#[derive(Clone)]
pub struct ServiceClient {
    registry: ServiceRegistry,
    breaker: CircuitBreaker,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    config: ClientConfig,
    cache: Arc<Mutex<HashMap<String, CachedRecord>>>,
}

impl std::fmt::Debug for ServiceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceClient")
            .field("registry", &self.registry)
            .field("breaker", &self.breaker)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ServiceClient {
    /// Create a client over the given registry, breaker and transport.
    #[must_use]
    pub fn new(
        registry: ServiceRegistry,
        breaker: CircuitBreaker,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        config: ClientConfig,
    ) -> Self {
        Self {
            registry,
            breaker,
            transport,
            clock,
            config,
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Registry used for discovery.
    #[must_use]
    pub const fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    /// Breaker used for admission control.
    #[must_use]
    pub const fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Configuration in use.
    #[must_use]
    pub const fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Clock shared with the registry and breaker.
    #[must_use]
    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// Perform a guarded call.
    ///
    /// # Errors
    ///
    /// - [`ServiceError::ServiceNotFound`] when no active instance is registered
    /// - [`ServiceError::CircuitOpen`] when the breaker rejects the call; the
    ///   transport is not invoked
    /// - [`ServiceError::ServiceCallFailed`] when the transport fails or exceeds
    ///   `call_timeout`
    pub async fn call(
        &self,
        service: &str,
        method: &str,
        params: Value,
    ) -> Result<Value, ServiceError> {
        let Some(endpoint) = self.resolve(service).await else {
            CallMetrics::record_outcome(service, "not_found");
            tracing::warn!(service, method, "No active instance, call not attempted");
            return Err(ServiceError::ServiceNotFound {
                service: service.to_string(),
            });
        };

        let permit = match self.breaker.acquire(service) {
            Ok(permit) => permit,
            Err(err) => {
                CallMetrics::record_outcome(service, "circuit_open");
                return Err(err);
            },
        };

        let started = Instant::now();
        let outcome = tokio::time::timeout(
            self.config.call_timeout,
            self.transport.invoke(&endpoint, method, params),
        )
        .await;
        CallMetrics::record_duration(service, started.elapsed());

        let cause = match outcome {
            Ok(Ok(value)) => {
                permit.success();
                CallMetrics::record_outcome(service, "ok");
                tracing::debug!(service, method, address = %endpoint.address, "Call succeeded");
                return Ok(value);
            },
            Ok(Err(cause)) => cause,
            Err(_elapsed) => TransportError::Timeout(self.config.call_timeout),
        };

        permit.failure();
        self.invalidate(service);
        CallMetrics::record_outcome(service, "failed");
        tracing::warn!(
            service,
            method,
            address = %endpoint.address,
            error = %cause,
            "Call failed"
        );
        Err(ServiceError::ServiceCallFailed {
            service: service.to_string(),
            method: method.to_string(),
            cause,
        })
    }

    /// Perform a guarded call described by a [`ServiceCall`].
    ///
    /// # Errors
    ///
    /// Same as [`call`](Self::call).
    pub async fn call_service(&self, call: &ServiceCall) -> Result<Value, ServiceError> {
        self.call(&call.service, &call.method, call.params.clone())
            .await
    }

    /// Drop cached discovery results for one service, or for all with `None`.
    pub fn clear_cache(&self, service: Option<&str>) {
        let mut cache = self.lock_cache();
        match service {
            Some(service) => {
                cache.remove(service);
            },
            None => cache.clear(),
        }
    }

    async fn resolve(&self, service: &str) -> Option<ServiceRecord> {
        let ttl = self.config.discovery_cache_ttl;
        if ttl.is_zero() {
            return self.registry.discover(service).await;
        }

        if let Some(record) = self.cached(service, ttl) {
            return Some(record);
        }

        let record = self.registry.discover(service).await?;
        self.lock_cache().insert(
            service.to_string(),
            CachedRecord {
                record: record.clone(),
                cached_at: self.clock.now(),
            },
        );
        Some(record)
    }

    fn cached(&self, service: &str, ttl: Duration) -> Option<ServiceRecord> {
        let now = self.clock.now();
        let mut cache = self.lock_cache();
        let entry = cache.get(service)?;
        let age = (now - entry.cached_at).to_std().unwrap_or(Duration::ZERO);
        if age < ttl {
            return Some(entry.record.clone());
        }
        cache.remove(service);
        None
    }

    fn invalidate(&self, service: &str) {
        if !self.config.discovery_cache_ttl.is_zero() {
            self.lock_cache().remove(service);
        }
    }

    fn lock_cache(&self) -> MutexGuard<'_, HashMap<String, CachedRecord>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
