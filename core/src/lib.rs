//! # Guarded Mesh Core
//!
//! Core records, traits and errors for a circuit-breaker-guarded service
//! registry and call router.
//!
//! This crate holds no behaviour of its own. It defines the vocabulary shared by
//! the runtime components and by the code that drives them:
//!
//! - **Records**: [`ServiceRecord`](service::ServiceRecord),
//!   [`CircuitState`](circuit::CircuitState) and friends, typed structs instead of
//!   ad hoc maps
//! - **Environment traits**: [`Clock`](environment::Clock),
//!   [`Transport`](transport::Transport) and [`Broker`](broker::Broker), injected
//!   into the runtime components at construction time
//! - **Errors**: the taxonomy in [`error`]
//!
//! ## Architecture
//!
//! ```text
//! caller ──► Orchestrator ──► ServiceClient ──┬──► ServiceRegistry (discover)
//!                 │                           ├──► CircuitBreaker  (admission)
//!                 │                           └──► Transport       (invoke)
//!                 └──► Broker (notifications)
//! ```
//!
//! ## Example
//!
//! ```
//! use guarded_mesh_core::service::{ServiceFilter, ServiceStatus};
//!
//! let filter = ServiceFilter::new()
//!     .name("pricing-service")
//!     .status(ServiceStatus::Active)
//!     .metadata("region", "eu-west-1");
//! assert_eq!(filter.metadata.len(), 1);
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde_json::Value;

/// Broker abstraction for topic-based publish/subscribe.
pub mod broker;

/// Circuit breaker records.
pub mod circuit;

/// Error taxonomy.
pub mod error;

/// Service records, filters and call descriptions.
pub mod service;

/// Transport abstraction used to reach a service instance.
pub mod transport;

/// Environment module - Dependency injection traits
///
/// All time-dependent behaviour in the runtime reads the time through
/// [`Clock`](environment::Clock) so tests can move time forward explicitly.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use guarded_mesh_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let before = clock.now();
    /// assert!(clock.now() >= before);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

pub use broker::{Broker, BrokerError, Message, MessageStream};
pub use circuit::{CircuitState, CircuitStatistics, State};
pub use environment::{Clock, SystemClock};
pub use error::{CompensationResult, OrchestrationError, ServiceError, TransportError};
pub use service::{Metadata, ServiceCall, ServiceFilter, ServiceRecord, ServiceStatus};
pub use transport::{Transport, TransportFuture};
