//! # Guarded Mesh Runtime
//!
//! Runtime components for calling services through a registry and a circuit
//! breaker, and for coordinating multi-service work as sagas.
//!
//! ## Core Components
//!
//! - **`ServiceRegistry`**: which instances exist and whether they are believed alive
//! - **`CircuitBreaker`**: per-service admission control (Closed → Open → `HalfOpen`)
//! - **`ServiceClient`**: discovery + admission + bounded transport invocation
//! - **`Orchestrator`**: ordered saga steps with reverse-order compensation
//! - **`InMemoryBroker`**: topic fan-out for saga progress notifications
//! - **`HeartbeatMonitor`**: marks silent instances inactive
//!
//! ## Example
//!
//! ```ignore
//! use guarded_mesh_runtime::{Mesh, MeshConfig, InProcessTransport};
//! use guarded_mesh_core::SystemClock;
//!
//! let transport = InProcessTransport::new();
//! transport.handle("pricing-service", "quote", |_| async { Ok(json!({"price_cents": 1999})) });
//!
//! let mesh = Mesh::new(MeshConfig::from_env(), Arc::new(transport), Arc::new(SystemClock))?;
//! mesh.registry().register("pricing-service", "10.0.0.1:9000", Metadata::new()).await;
//!
//! let quote = mesh.client().call("pricing-service", "quote", json!({"sku": "A-1"})).await?;
//! ```

/// Topic fan-out over `tokio::sync::broadcast`
pub mod broker;

/// Circuit breaker pattern for preventing cascading failures
pub mod circuit_breaker;

/// Guarded service client
pub mod client;

/// Environment-driven configuration
pub mod config;

/// Background heartbeat expiry
pub mod heartbeat;

/// Prometheus metrics for observability
pub mod metrics;

/// Saga orchestration
pub mod orchestrator;

/// Service registry and instance selection
pub mod registry;

/// In-process transport
pub mod transport;

pub use broker::InMemoryBroker;
pub use circuit_breaker::{CallPermit, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError};
pub use client::{ClientConfig, ServiceClient};
pub use config::{ConfigError, MeshConfig};
pub use heartbeat::{HeartbeatConfig, HeartbeatMonitor, MIN_SWEEP_INTERVAL};
pub use metrics::{MetricsError, MetricsServer};
pub use orchestrator::{Orchestrator, Saga, SagaOutcome, Step, StepResult};
pub use registry::{
    FirstActive, RandomChoice, RoundRobin, SelectionStrategy, ServiceRegistry, StrategyKind,
};
pub use transport::InProcessTransport;

pub use mesh::Mesh;

/// Wiring of every component from one [`MeshConfig`]
pub mod mesh {
    use super::{
        CircuitBreaker, ConfigError, HeartbeatMonitor, InMemoryBroker, MeshConfig, Orchestrator,
        ServiceClient, ServiceRegistry,
    };
    use guarded_mesh_core::broker::Broker;
    use guarded_mesh_core::environment::Clock;
    use guarded_mesh_core::transport::Transport;
    use std::sync::Arc;
    use tokio::task::JoinHandle;

    /// A registry, breaker, client and broker sharing one clock.
    #[derive(Debug, Clone)]
    pub struct Mesh {
        config: MeshConfig,
        registry: ServiceRegistry,
        client: ServiceClient,
        broker: InMemoryBroker,
    }

    impl Mesh {
        /// Validate `config` and build every component.
        ///
        /// # Errors
        ///
        /// Returns [`ConfigError`] if the configuration is invalid.
        pub fn new(
            config: MeshConfig,
            transport: Arc<dyn Transport>,
            clock: Arc<dyn Clock>,
        ) -> Result<Self, ConfigError> {
            config.validate()?;

            let registry = ServiceRegistry::with_strategy(Arc::clone(&clock), config.strategy.build());
            let breaker = CircuitBreaker::new(config.breaker.clone(), Arc::clone(&clock));
            let client = ServiceClient::new(
                registry.clone(),
                breaker,
                transport,
                clock,
                config.client.clone(),
            );
            let broker = InMemoryBroker::new(config.broker_capacity);

            tracing::info!(
                failure_threshold = config.breaker.failure_threshold,
                reset_timeout_secs = config.breaker.reset_timeout.as_secs_f64(),
                call_timeout_secs = config.client.call_timeout.as_secs_f64(),
                strategy = ?config.strategy,
                "Mesh initialized"
            );

            Ok(Self {
                config,
                registry,
                client,
                broker,
            })
        }

        /// Configuration the mesh was built from.
        #[must_use]
        pub const fn config(&self) -> &MeshConfig {
            &self.config
        }

        /// Shared registry.
        #[must_use]
        pub const fn registry(&self) -> &ServiceRegistry {
            &self.registry
        }

        /// Shared breaker.
        #[must_use]
        pub const fn breaker(&self) -> &CircuitBreaker {
            self.client.breaker()
        }

        /// Guarded client.
        #[must_use]
        pub const fn client(&self) -> &ServiceClient {
            &self.client
        }

        /// Shared broker.
        #[must_use]
        pub const fn broker(&self) -> &InMemoryBroker {
            &self.broker
        }

        /// Orchestrator publishing saga progress to `topic`.
        #[must_use]
        pub fn orchestrator(&self, topic: &str) -> Orchestrator {
            let broker: Arc<dyn Broker> = Arc::new(self.broker.clone());
            Orchestrator::new(self.client.clone()).with_broker(broker, topic)
        }

        /// Start the heartbeat monitor for the shared registry.
        #[must_use]
        pub fn spawn_heartbeat_monitor(&self) -> JoinHandle<()> {
            HeartbeatMonitor::new(self.registry.clone(), self.config.heartbeat.clone()).spawn()
        }
    }
}
