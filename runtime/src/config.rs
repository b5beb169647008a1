//! Configuration for a mesh node.
//!
//! Loads from environment variables with defaults. Unset or unparsable
//! variables fall back to the default; call [`MeshConfig::validate`] before
//! wiring components.
//!
//! | Variable                      | Default | Field                           |
//! |-------------------------------|---------|---------------------------------|
//! | `MESH_FAILURE_THRESHOLD`      | 5       | `breaker.failure_threshold`     |
//! | `MESH_RESET_TIMEOUT_SECS`     | 30      | `breaker.reset_timeout`         |
//! | `MESH_SUCCESS_THRESHOLD`      | 2       | `breaker.success_threshold`     |
//! | `MESH_CALL_TIMEOUT_MS`        | 5000    | `client.call_timeout`           |
//! | `MESH_DISCOVERY_CACHE_TTL_MS` | 0       | `client.discovery_cache_ttl`    |
//! | `MESH_HEARTBEAT_TTL_SECS`     | 30      | `heartbeat.ttl`                 |
//! | `MESH_HEARTBEAT_SWEEP_SECS`   | 5       | `heartbeat.sweep_interval`      |
//! | `MESH_SELECTION_STRATEGY`     | first   | `strategy`                      |
//! | `MESH_BROKER_CAPACITY`        | 1024    | `broker_capacity`               |
//! | `MESH_METRICS_ADDR`           | unset   | `metrics_addr`                  |

use crate::broker::DEFAULT_CAPACITY;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::client::ClientConfig;
use crate::heartbeat::HeartbeatConfig;
use crate::registry::StrategyKind;
use serde::{Deserialize, Serialize};
use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A field holds a value the mesh cannot run with
    #[error("Invalid configuration for {field}: {reason}")]
    Invalid {
        /// Offending field
        field: &'static str,
        /// Why it was rejected
        reason: String,
    },
}

/// Complete node configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Circuit breaker thresholds
    pub breaker: CircuitBreakerConfig,
    /// Client timeouts and caching
    pub client: ClientConfig,
    /// Heartbeat expiry
    pub heartbeat: HeartbeatConfig,
    /// Instance selection for discovery
    pub strategy: StrategyKind,
    /// Per-topic broker buffer
    pub broker_capacity: usize,
    /// Installs the Prometheus recorder when set. The address is only
    /// reported; serving `MetricsServer::render` on it is up to the host.
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            breaker: CircuitBreakerConfig::default(),
            client: ClientConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            strategy: StrategyKind::default(),
            broker_capacity: DEFAULT_CAPACITY,
            metrics_addr: None,
        }
    }
}

impl MeshConfig {
    /// Load configuration from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    #[must_use]
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        Self {
            breaker: CircuitBreakerConfig {
                failure_threshold: parse(&lookup, "MESH_FAILURE_THRESHOLD")
                    .unwrap_or(defaults.breaker.failure_threshold),
                reset_timeout: parse(&lookup, "MESH_RESET_TIMEOUT_SECS")
                    .map_or(defaults.breaker.reset_timeout, Duration::from_secs),
                success_threshold: parse(&lookup, "MESH_SUCCESS_THRESHOLD")
                    .unwrap_or(defaults.breaker.success_threshold),
            },
            client: ClientConfig {
                call_timeout: parse(&lookup, "MESH_CALL_TIMEOUT_MS")
                    .map_or(defaults.client.call_timeout, Duration::from_millis),
                discovery_cache_ttl: parse(&lookup, "MESH_DISCOVERY_CACHE_TTL_MS")
                    .map_or(defaults.client.discovery_cache_ttl, Duration::from_millis),
            },
            heartbeat: HeartbeatConfig {
                ttl: parse(&lookup, "MESH_HEARTBEAT_TTL_SECS")
                    .map_or(defaults.heartbeat.ttl, Duration::from_secs),
                sweep_interval: parse(&lookup, "MESH_HEARTBEAT_SWEEP_SECS")
                    .map_or(defaults.heartbeat.sweep_interval, Duration::from_secs),
            },
            strategy: parse(&lookup, "MESH_SELECTION_STRATEGY").unwrap_or(defaults.strategy),
            broker_capacity: parse(&lookup, "MESH_BROKER_CAPACITY")
                .unwrap_or(defaults.broker_capacity),
            metrics_addr: parse(&lookup, "MESH_METRICS_ADDR").or(defaults.metrics_addr),
        }
    }

    /// Reject values the components cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for zero thresholds, zero timeouts, a
    /// zero sweep interval or a zero broker capacity.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.breaker.failure_threshold == 0 {
            return Err(invalid("breaker.failure_threshold", "must be at least 1"));
        }
        if self.breaker.success_threshold == 0 {
            return Err(invalid("breaker.success_threshold", "must be at least 1"));
        }
        if self.breaker.reset_timeout.is_zero() {
            return Err(invalid("breaker.reset_timeout", "must be greater than zero"));
        }
        if self.client.call_timeout.is_zero() {
            return Err(invalid("client.call_timeout", "must be greater than zero"));
        }
        if self.heartbeat.ttl.is_zero() {
            return Err(invalid("heartbeat.ttl", "must be greater than zero"));
        }
        if self.heartbeat.sweep_interval.is_zero() {
            return Err(invalid("heartbeat.sweep_interval", "must be greater than zero"));
        }
        if self.broker_capacity == 0 {
            return Err(invalid("broker_capacity", "must be at least 1"));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}

fn parse<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = var(key)?;
    let parsed = raw.trim().parse().ok();
    if parsed.is_none() {
        tracing::warn!(key, value = %raw, "Ignoring unparsable configuration value");
    }
    parsed
}
