//! Broker abstraction for decoupled notifications.
//!
//! The [`Broker`] trait provides topic-based publish/subscribe fan-out. The
//! orchestrator publishes saga progress through it; monitoring or audit code
//! subscribes without the orchestrator knowing who listens.
//!
//! # Key Principles
//!
//! - **Fan-out**: every live subscriber of a topic receives every message
//!   published after it subscribed
//! - **Fire-and-forget**: publishing to a topic nobody listens to succeeds and
//!   reaches zero subscribers
//! - **No persistence**: messages published before a subscription are not replayed
//!
//! # Example
//!
//! ```rust,ignore
//! use futures::StreamExt;
//! use serde_json::json;
//!
//! let mut stream = broker.subscribe(&["orchestration"]).await?;
//! broker.publish(Message::new("orchestration", "saga.started", json!({}), now)).await?;
//!
//! while let Some(result) = stream.next().await {
//!     match result {
//!         Ok(message) => println!("{}: {}", message.kind, message.payload),
//!         Err(e) => eprintln!("stream error: {e}"),
//!     }
//! }
//! ```

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during broker operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Topic name is empty or otherwise unusable
    #[error("Invalid topic: {0:?}")]
    InvalidTopic(String),

    /// Failed to publish a message to a topic
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to subscribe to topics
    #[error("Subscription failed for topics {topics:?}: {reason}")]
    SubscriptionFailed {
        /// The topics that failed to subscribe
        topics: Vec<String>,
        /// The reason for failure
        reason: String,
    },

    /// The subscriber fell behind and messages were dropped
    #[error("Subscriber on topic '{topic}' lagged, {skipped} messages dropped")]
    Lagged {
        /// Topic the subscriber lagged on
        topic: String,
        /// Number of dropped messages
        skipped: u64,
    },
}

/// A message flowing through the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Topic the message was published to
    pub topic: String,
    /// Message kind (e.g. `saga.completed`)
    pub kind: String,
    /// JSON payload
    pub payload: Value,
    /// Publication time
    pub published_at: DateTime<Utc>,
}

impl Message {
    /// Create a new message.
    #[must_use]
    pub fn new(
        topic: impl Into<String>,
        kind: impl Into<String>,
        payload: Value,
        published_at: DateTime<Utc>,
    ) -> Self {
        Self {
            topic: topic.into(),
            kind: kind.into(),
            payload,
            published_at,
        }
    }
}

/// Stream of messages from a subscription.
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<Message, BrokerError>> + Send>>;

/// Topic-based publish/subscribe.
///
/// All implementations must be `Send + Sync`; the trait uses explicit
/// `Pin<Box<dyn Future>>` returns so it can be used as `Arc<dyn Broker>`.
pub trait Broker: Send + Sync {
    /// Publish a message to its topic.
    ///
    /// Returns the number of subscribers the message was delivered to.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::InvalidTopic`] for an empty topic, or
    /// [`BrokerError::PublishFailed`] if the implementation cannot deliver.
    fn publish(
        &self,
        message: Message,
    ) -> Pin<Box<dyn Future<Output = Result<usize, BrokerError>> + Send + '_>>;

    /// Subscribe to one or more topics.
    ///
    /// The stream yields messages from all subscribed topics; ordering is only
    /// guaranteed within a single topic.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::InvalidTopic`] if any topic is empty, or
    /// [`BrokerError::SubscriptionFailed`] if no topics are given.
    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<MessageStream, BrokerError>> + Send + '_>>;
}
