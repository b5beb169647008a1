//! In-memory service registry.
//!
//! The registry maps logical service names to the instances that serve them and
//! keeps the stored belief about each instance's liveness. It never probes the
//! network; liveness changes only through the method contracts below (and the
//! [`HeartbeatMonitor`](crate::heartbeat::HeartbeatMonitor), which ages stale
//! heartbeats).
//!
//! # Concurrency
//!
//! Records live in a copy-on-write snapshot. Readers (`discover`, `list`) clone
//! the current `Arc<Vec<_>>` under a short read lock and work on it unlocked;
//! writers take the write lock and copy the vector only if a reader still holds
//! the old snapshot.
//!
//! # Example
//!
//! ```rust
//! use guarded_mesh_runtime::registry::ServiceRegistry;
//! use guarded_mesh_core::SystemClock;
//! use std::sync::Arc;
//!
//! # async fn example() {
//! let registry = ServiceRegistry::new(Arc::new(SystemClock));
//!
//! assert!(registry.register("pricing-service", "10.0.0.1:9000", Default::default()).await);
//! assert!(!registry.register("pricing-service", "10.0.0.1:9000", Default::default()).await);
//!
//! let record = registry.discover("pricing-service").await;
//! assert_eq!(record.map(|r| r.address), Some("10.0.0.1:9000".to_string()));
//! # }
//! ```

use crate::metrics::RegistryMetrics;
use guarded_mesh_core::environment::Clock;
use guarded_mesh_core::service::{Metadata, ServiceFilter, ServiceRecord, ServiceStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::RwLock;

/// Picks one instance among the active candidates for a service.
///
/// `candidates` is never empty and is in registration order.
pub trait SelectionStrategy: Send + Sync + fmt::Debug {
    /// Choose an instance.
    fn select<'a>(&self, service: &str, candidates: &[&'a ServiceRecord]) -> Option<&'a ServiceRecord>;
}

/// Always the first active instance in registration order.
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstActive;

impl SelectionStrategy for FirstActive {
    fn select<'a>(&self, _service: &str, candidates: &[&'a ServiceRecord]) -> Option<&'a ServiceRecord> {
        candidates.first().copied()
    }
}

/// Rotates through active instances, one cursor per service name.
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursors: Mutex<HashMap<String, usize>>,
}

impl SelectionStrategy for RoundRobin {
    fn select<'a>(&self, service: &str, candidates: &[&'a ServiceRecord]) -> Option<&'a ServiceRecord> {
        if candidates.is_empty() {
            return None;
        }
        let mut cursors = self.cursors.lock().unwrap_or_else(PoisonError::into_inner);
        let cursor = cursors.entry(service.to_string()).or_insert(0);
        let chosen = candidates[*cursor % candidates.len()];
        *cursor = cursor.wrapping_add(1);
        Some(chosen)
    }
}

/// Uniformly random active instance.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomChoice;

impl SelectionStrategy for RandomChoice {
    fn select<'a>(&self, _service: &str, candidates: &[&'a ServiceRecord]) -> Option<&'a ServiceRecord> {
        use rand::seq::SliceRandom;
        candidates.choose(&mut rand::thread_rng()).copied()
    }
}

/// Named selection strategies, for configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    /// [`FirstActive`]
    #[default]
    First,
    /// [`RoundRobin`]
    RoundRobin,
    /// [`RandomChoice`]
    Random,
}

impl StrategyKind {
    /// Instantiate the strategy.
    #[must_use]
    pub fn build(self) -> Arc<dyn SelectionStrategy> {
        match self {
            Self::First => Arc::new(FirstActive),
            Self::RoundRobin => Arc::new(RoundRobin::default()),
            Self::Random => Arc::new(RandomChoice),
        }
    }
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "first" | "first-active" => Ok(Self::First),
            "round-robin" | "roundrobin" => Ok(Self::RoundRobin),
            "random" => Ok(Self::Random),
            other => Err(format!("unknown selection strategy: {other}")),
        }
    }
}

/// Directory of service instances.
///
/// Cloning is cheap and clones share state.
#[derive(Clone)]
pub struct ServiceRegistry {
    records: Arc<RwLock<Arc<Vec<ServiceRecord>>>>,
    strategy: Arc<dyn SelectionStrategy>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("strategy", &self.strategy)
            .finish_non_exhaustive()
    }
}

impl ServiceRegistry {
    /// Create an empty registry that returns the first active instance.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_strategy(clock, Arc::new(FirstActive))
    }

    /// Create an empty registry with a custom selection strategy.
    #[must_use]
    pub fn with_strategy(clock: Arc<dyn Clock>, strategy: Arc<dyn SelectionStrategy>) -> Self {
        Self {
            records: Arc::new(RwLock::new(Arc::new(Vec::new()))),
            strategy,
            clock,
        }
    }

    /// Register an instance.
    ///
    /// Returns `false` without changing anything if `(name, address)` is
    /// already registered.
    pub async fn register(&self, name: &str, address: &str, metadata: Metadata) -> bool {
        let now = self.clock.now();
        let inserted = self
            .mutate(|records| {
                if records.iter().any(|r| r.is_instance(name, address)) {
                    return false;
                }
                records.push(ServiceRecord::new(name, address, metadata, now));
                true
            })
            .await;

        if inserted {
            tracing::info!(service = name, address, "Service instance registered");
        } else {
            tracing::debug!(service = name, address, "Duplicate registration ignored");
        }
        inserted
    }

    /// Remove an instance. Returns `false` if it was not registered.
    pub async fn unregister(&self, name: &str, address: &str) -> bool {
        let removed = self
            .mutate(|records| {
                let before = records.len();
                records.retain(|r| !r.is_instance(name, address));
                records.len() != before
            })
            .await;

        if removed {
            tracing::info!(service = name, address, "Service instance unregistered");
        }
        removed
    }

    /// Pick an active instance of `name`.
    ///
    /// Inactive instances are never returned.
    pub async fn discover(&self, name: &str) -> Option<ServiceRecord> {
        let snapshot = self.snapshot().await;
        let candidates: Vec<&ServiceRecord> = snapshot
            .iter()
            .filter(|r| r.name == name && r.is_active())
            .collect();
        if candidates.is_empty() {
            tracing::debug!(service = name, "No active instance found");
            return None;
        }
        self.strategy.select(name, &candidates).cloned()
    }

    /// Stored liveness belief for an instance.
    ///
    /// Returns `status == Active` and, when the instance exists, refreshes its
    /// `last_heartbeat`. This never contacts the instance.
    pub async fn is_alive(&self, name: &str, address: &str) -> bool {
        let known = self
            .snapshot()
            .await
            .iter()
            .any(|r| r.is_instance(name, address));
        if !known {
            return false;
        }

        let now = self.clock.now();
        self.mutate(|records| {
            records
                .iter_mut()
                .find(|r| r.is_instance(name, address))
                .is_some_and(|record| {
                    record.last_heartbeat = now;
                    record.is_active()
                })
        })
        .await
    }

    /// Record a liveness report. Returns `false` for an unknown instance.
    ///
    /// The status is left unchanged; use [`mark_active`](Self::mark_active) to
    /// bring an expired instance back.
    pub async fn heartbeat(&self, name: &str, address: &str) -> bool {
        let now = self.clock.now();
        self.mutate(|records| {
            records
                .iter_mut()
                .find(|r| r.is_instance(name, address))
                .map(|record| record.last_heartbeat = now)
                .is_some()
        })
        .await
    }

    /// Mark an instance active. Returns `false` for an unknown instance.
    pub async fn mark_active(&self, name: &str, address: &str) -> bool {
        self.set_status(name, address, ServiceStatus::Active).await
    }

    /// Mark an instance inactive. Returns `false` for an unknown instance.
    pub async fn mark_inactive(&self, name: &str, address: &str) -> bool {
        self.set_status(name, address, ServiceStatus::Inactive).await
    }

    /// Merge `metadata` into an instance's metadata (new values win).
    ///
    /// Returns `false` for an unknown instance.
    pub async fn update_metadata(&self, name: &str, address: &str, metadata: Metadata) -> bool {
        let updated = self
            .mutate(|records| {
                records
                    .iter_mut()
                    .find(|r| r.is_instance(name, address))
                    .map(|record| record.metadata.extend(metadata))
                    .is_some()
            })
            .await;

        if updated {
            tracing::debug!(service = name, address, "Service metadata updated");
        }
        updated
    }

    /// Every record matching `filter`, in registration order.
    pub async fn list(&self, filter: &ServiceFilter) -> Vec<ServiceRecord> {
        self.snapshot()
            .await
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect()
    }

    /// Mark every active instance whose last heartbeat is more than `ttl` ago
    /// as inactive, and return the records that changed.
    pub async fn expire_stale(&self, ttl: Duration) -> Vec<ServiceRecord> {
        let now = self.clock.now();
        let expired = self
            .mutate(|records| {
                let mut expired = Vec::new();
                for record in records.iter_mut().filter(|r| r.is_active()) {
                    let silent_for = (now - record.last_heartbeat)
                        .to_std()
                        .unwrap_or(Duration::ZERO);
                    if silent_for > ttl {
                        record.status = ServiceStatus::Inactive;
                        expired.push(record.clone());
                    }
                }
                expired
            })
            .await;

        for record in &expired {
            tracing::warn!(
                service = %record.name,
                address = %record.address,
                last_heartbeat = %record.last_heartbeat,
                "Heartbeat expired, instance marked inactive"
            );
        }
        if !expired.is_empty() {
            RegistryMetrics::record_expired(expired.len());
        }
        expired
    }

    /// Number of registered instances, active or not.
    pub async fn len(&self) -> usize {
        self.snapshot().await.len()
    }

    /// Whether no instance is registered.
    pub async fn is_empty(&self) -> bool {
        self.snapshot().await.is_empty()
    }

    async fn set_status(&self, name: &str, address: &str, status: ServiceStatus) -> bool {
        let changed = self
            .mutate(|records| {
                records
                    .iter_mut()
                    .find(|r| r.is_instance(name, address))
                    .map(|record| record.status = status)
                    .is_some()
            })
            .await;

        if changed {
            tracing::info!(service = name, address, %status, "Service status changed");
        }
        changed
    }

    async fn snapshot(&self) -> Arc<Vec<ServiceRecord>> {
        Arc::clone(&*self.records.read().await)
    }

    async fn mutate<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut Vec<ServiceRecord>) -> R,
    {
        let mut guard = self.records.write().await;
        let records = Arc::make_mut(&mut *guard);
        let result = f(&mut *records);
        RegistryMetrics::record_instances(records.len());
        result
    }
}
