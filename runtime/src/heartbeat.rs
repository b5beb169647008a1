//! Background expiry of stale heartbeats.
//!
//! The registry only stores beliefs about liveness. Instances (or the tooling
//! that deploys them) report liveness via `ServiceRegistry::heartbeat`; the
//! monitor periodically marks instances that stopped reporting as inactive so
//! discovery stops returning them.
//!
//! The monitor does not contact instances. How stale is too stale is the
//! configured `ttl`; there is no built-in default beyond what
//! [`HeartbeatConfig::default`] documents.

use crate::registry::ServiceRegistry;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Shortest sweep interval a monitor will run with.
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

/// Heartbeat expiry configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Instances silent for longer than this are marked inactive
    pub ttl: Duration,
    /// How often the registry is swept
    pub sweep_interval: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
        }
    }
}

/// Periodic sweeper for a [`ServiceRegistry`].
#[derive(Debug)]
pub struct HeartbeatMonitor {
    registry: ServiceRegistry,
    config: HeartbeatConfig,
}

impl HeartbeatMonitor {
    /// Creates a new monitor.
    ///
    /// A `sweep_interval` below [`MIN_SWEEP_INTERVAL`] is raised to it.
    #[must_use]
    pub fn new(registry: ServiceRegistry, mut config: HeartbeatConfig) -> Self {
        if config.sweep_interval < MIN_SWEEP_INTERVAL {
            tracing::warn!(
                requested_secs = config.sweep_interval.as_secs_f64(),
                used_secs = MIN_SWEEP_INTERVAL.as_secs_f64(),
                "Sweep interval too short, raised to minimum"
            );
            config.sweep_interval = MIN_SWEEP_INTERVAL;
        }
        Self { registry, config }
    }

    /// Effective configuration.
    #[must_use]
    pub const fn config(&self) -> &HeartbeatConfig {
        &self.config
    }

    /// Run one sweep and return how many instances expired.
    pub async fn sweep(&self) -> usize {
        self.registry.expire_stale(self.config.ttl).await.len()
    }

    /// Starts the monitor task. Abort the handle to stop it.
    #[must_use]
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(self) {
        tracing::info!(
            ttl_secs = self.config.ttl.as_secs_f64(),
            interval_secs = self.config.sweep_interval.as_secs_f64(),
            "Heartbeat monitor started"
        );
        let mut interval = tokio::time::interval(self.config.sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            let expired = self.sweep().await;
            if expired > 0 {
                tracing::info!(expired, "Heartbeat sweep completed");
            }
        }
    }
}
