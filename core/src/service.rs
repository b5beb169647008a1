//! Service instance records and the query types used against the registry.
//!
//! A service is identified by its logical `name`; an *instance* of it by the
//! `(name, address)` pair. Several instances of the same service may be
//! registered at once, and the registry picks among the active ones.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Free-form string metadata attached to a service instance.
///
/// Ordered so that records serialize deterministically.
pub type Metadata = BTreeMap<String, String>;

/// Stored belief about whether an instance can take traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    /// Instance is eligible for discovery
    Active,
    /// Instance is registered but never returned by discovery
    Inactive,
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Inactive => write!(f, "inactive"),
        }
    }
}

/// One registered service instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    /// Logical service name (e.g. `pricing-service`)
    pub name: String,
    /// Where the instance is reachable (URL or `host:port`)
    pub address: String,
    /// Arbitrary key/value metadata
    pub metadata: Metadata,
    /// Current liveness belief
    pub status: ServiceStatus,
    /// When the instance was registered
    pub registered_at: DateTime<Utc>,
    /// Last time a liveness report was recorded
    pub last_heartbeat: DateTime<Utc>,
}

impl ServiceRecord {
    /// Create an active record with both timestamps set to `now`.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        address: impl Into<String>,
        metadata: Metadata,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            metadata,
            status: ServiceStatus::Active,
            registered_at: now,
            last_heartbeat: now,
        }
    }

    /// Whether this record is the instance `(name, address)`.
    #[must_use]
    pub fn is_instance(&self, name: &str, address: &str) -> bool {
        self.name == name && self.address == address
    }

    /// Whether discovery may return this record.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == ServiceStatus::Active
    }
}

/// Filter for listing registry contents.
///
/// Every populated field must match (AND semantics). Metadata entries are
/// matched key by key against the record's metadata; an empty filter matches
/// everything.
///
/// # Example
///
/// ```
/// use guarded_mesh_core::service::{Metadata, ServiceFilter, ServiceRecord};
/// use chrono::Utc;
///
/// let mut metadata = Metadata::new();
/// metadata.insert("version".to_string(), "2".to_string());
/// let record = ServiceRecord::new("pricing", "10.0.0.1:9000", metadata, Utc::now());
///
/// assert!(ServiceFilter::new().metadata("version", "2").matches(&record));
/// assert!(!ServiceFilter::new().name("billing").matches(&record));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceFilter {
    /// Exact service name
    pub name: Option<String>,
    /// Exact instance address
    pub address: Option<String>,
    /// Required status
    pub status: Option<ServiceStatus>,
    /// Required metadata entries
    pub metadata: Metadata,
}

impl ServiceFilter {
    /// Create a filter that matches every record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Require an exact service name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Require an exact address.
    #[must_use]
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Require a status.
    #[must_use]
    pub const fn status(mut self, status: ServiceStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Require a metadata entry.
    #[must_use]
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Check a record against every populated criterion.
    #[must_use]
    pub fn matches(&self, record: &ServiceRecord) -> bool {
        self.name.as_ref().is_none_or(|name| *name == record.name)
            && self
                .address
                .as_ref()
                .is_none_or(|address| *address == record.address)
            && self.status.is_none_or(|status| status == record.status)
            && self
                .metadata
                .iter()
                .all(|(key, value)| record.metadata.get(key) == Some(value))
    }
}

/// Description of one remote invocation: which service, which method, what
/// parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceCall {
    /// Logical service name to discover
    pub service: String,
    /// Method or endpoint on that service
    pub method: String,
    /// JSON parameters
    pub params: Value,
}

impl ServiceCall {
    /// Describe a call.
    #[must_use]
    pub fn new(service: impl Into<String>, method: impl Into<String>, params: Value) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
            params,
        }
    }
}
