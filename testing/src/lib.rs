//! # Guarded Mesh Testing
//!
//! Testing utilities and helpers for Guarded Mesh.
//!
//! This crate provides:
//! - Deterministic clocks ([`FixedClock`], [`ManualClock`])
//! - A scripted [`Transport`](guarded_mesh_core::Transport) that records every
//!   attempt ([`ScriptedTransport`])
//! - Tracing setup for tests ([`init_test_tracing`])
//!
//! ## Example
//!
//! ```ignore
//! use guarded_mesh_testing::{ManualClock, ScriptedTransport};
//!
//! #[tokio::test]
//! async fn test_breaker_recovers() {
//!     let clock = ManualClock::default();
//!     let transport = ScriptedTransport::new();
//!     transport.fail_times("pricing-service", "quote", 5);
//!
//!     // ... build registry, breaker and client around `clock` and `transport` ...
//!
//!     clock.advance(Duration::from_secs(30));
//!     assert_eq!(transport.attempts("pricing-service"), 5);
//! }
//! ```

use chrono::{DateTime, Utc};
use guarded_mesh_core::environment::Clock;

/// Scripted transport for exercising the client without a network.
pub mod transport_mocks;

/// Mock implementations for testing.
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::{Arc, Mutex, PoisonError};
    use std::time::Duration;

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use guarded_mesh_testing::mocks::FixedClock;
    /// use guarded_mesh_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that only moves when told to.
    ///
    /// Clones share the same time, so a test can keep one handle and inject
    /// another into the components under test.
    ///
    /// # Example
    ///
    /// ```
    /// use guarded_mesh_testing::ManualClock;
    /// use guarded_mesh_core::environment::Clock;
    /// use std::time::Duration;
    ///
    /// let clock = ManualClock::default();
    /// let injected = clock.clone();
    /// let start = injected.now();
    ///
    /// clock.advance(Duration::from_secs(30));
    /// assert_eq!((injected.now() - start).num_seconds(), 30);
    /// ```
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    impl ManualClock {
        /// Create a manual clock starting at `time`.
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// Move the clock forward.
        ///
        /// # Panics
        ///
        /// Panics if `by` does not fit a `chrono::Duration`.
        #[allow(clippy::expect_used)]
        pub fn advance(&self, by: Duration) {
            let delta = chrono::Duration::from_std(by).expect("advance duration out of range");
            let mut time = self.time.lock().unwrap_or_else(PoisonError::into_inner);
            *time += delta;
        }

        /// Set the clock to an absolute time.
        pub fn set(&self, to: DateTime<Utc>) {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner) = to;
        }
    }

    impl Default for ManualClock {
        fn default() -> Self {
            Self::new(test_clock().now())
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Install a `tracing` subscriber for tests.
///
/// Honours `RUST_LOG`, writes through the test harness' captured output and is
/// safe to call from every test (only the first call installs anything).
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

// Re-export commonly used items
pub use mocks::{FixedClock, ManualClock, test_clock};
pub use transport_mocks::{RecordedCall, ScriptedTransport};
