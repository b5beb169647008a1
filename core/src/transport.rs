//! Transport abstraction.
//!
//! A [`Transport`] delivers one method invocation to one concrete service
//! instance. HTTP or RPC clients implement it in production; the runtime ships
//! an in-process implementation that calls registered handlers directly.
//!
//! The transport knows nothing about circuit breaking or timeouts. The
//! `ServiceClient` wraps every invocation in its own deadline and reports the
//! outcome to the breaker.
//!
//! # Dyn Compatibility
//!
//! The trait returns `Pin<Box<dyn Future>>` instead of using `async fn` so that
//! it can be shared as `Arc<dyn Transport>`.

use crate::error::TransportError;
use crate::service::ServiceRecord;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by [`Transport::invoke`].
pub type TransportFuture<'a> = Pin<Box<dyn Future<Output = Result<Value, TransportError>> + Send + 'a>>;

/// Delivers calls to service instances.
pub trait Transport: Send + Sync {
    /// Invoke `method` on the given instance.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] when the instance is unreachable, does not
    /// know the method, or answers with an error.
    fn invoke<'a>(
        &'a self,
        endpoint: &'a ServiceRecord,
        method: &'a str,
        params: Value,
    ) -> TransportFuture<'a>;
}
