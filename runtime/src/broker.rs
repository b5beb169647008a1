//! In-memory [`Broker`] built on `tokio::sync::broadcast`.
//!
//! One broadcast channel per topic, created on first subscription. Publishing
//! to a topic nobody ever subscribed to reaches zero subscribers and allocates
//! nothing. A subscriber that falls more than `capacity` messages behind
//! receives a single [`BrokerError::Lagged`] item and then resumes with the
//! oldest retained message.
//!
//! A topic whose last subscriber is gone is forgotten on the next publish to
//! it, or on the next subscription to any topic.

use crate::metrics::BrokerMetrics;
use futures::stream::{self, StreamExt};
use guarded_mesh_core::broker::{Broker, BrokerError, Message, MessageStream};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::broadcast::{self, error::RecvError};

/// Default per-topic buffer size.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Process-local publish/subscribe.
///
/// Cloning is cheap and clones share topics.
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    capacity: usize,
    topics: Arc<RwLock<HashMap<String, broadcast::Sender<Message>>>>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl InMemoryBroker {
    /// Create a broker buffering up to `capacity` messages per topic.
    ///
    /// A capacity of zero is raised to one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            topics: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Per-topic buffer size.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of live subscribers on `topic`.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .map_or(0, broadcast::Sender::receiver_count)
    }

    /// Number of topics with a channel, live or not yet pruned.
    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn prune(&self, topic: &str) {
        let mut topics = self.topics.write().unwrap_or_else(PoisonError::into_inner);
        // A subscriber may have arrived since the read lock was released
        if topics
            .get(topic)
            .is_some_and(|sender| sender.receiver_count() == 0)
        {
            topics.remove(topic);
            tracing::trace!(topic, "Pruned topic without subscribers");
        }
    }

    fn send(&self, message: Message) -> Result<usize, BrokerError> {
        if message.topic.is_empty() {
            return Err(BrokerError::InvalidTopic(message.topic));
        }

        let topics = self.topics.read().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = topics.get(&message.topic) else {
            tracing::trace!(topic = %message.topic, kind = %message.kind, "No subscribers");
            return Ok(0);
        };

        if sender.receiver_count() == 0 {
            drop(topics);
            self.prune(&message.topic);
            return Ok(0);
        }

        let topic = message.topic.clone();
        // A send error only means every receiver is gone
        let delivered = sender.send(message).unwrap_or(0);
        drop(topics);
        BrokerMetrics::record_publish(&topic);
        Ok(delivered)
    }

    fn open(&self, topics: &[&str]) -> Result<MessageStream, BrokerError> {
        if topics.is_empty() {
            return Err(BrokerError::SubscriptionFailed {
                topics: Vec::new(),
                reason: "no topics given".to_string(),
            });
        }
        if let Some(empty) = topics.iter().find(|topic| topic.is_empty()) {
            return Err(BrokerError::InvalidTopic((*empty).to_string()));
        }

        let mut channels = self.topics.write().unwrap_or_else(PoisonError::into_inner);
        channels.retain(|_, sender| sender.receiver_count() > 0);
        let streams: Vec<MessageStream> = topics
            .iter()
            .map(|topic| {
                let receiver = channels
                    .entry((*topic).to_string())
                    .or_insert_with(|| broadcast::channel(self.capacity).0)
                    .subscribe();
                receiver_stream((*topic).to_string(), receiver)
            })
            .collect();
        drop(channels);

        tracing::debug!(?topics, "Subscribed");
        Ok(stream::select_all(streams).boxed())
    }
}

fn receiver_stream(topic: String, receiver: broadcast::Receiver<Message>) -> MessageStream {
    stream::unfold((receiver, topic), |(mut receiver, topic)| async move {
        match receiver.recv().await {
            Ok(message) => {
                BrokerMetrics::record_consume(&topic);
                Some((Ok(message), (receiver, topic)))
            },
            Err(RecvError::Lagged(skipped)) => {
                BrokerMetrics::record_lagged(&topic, skipped);
                tracing::warn!(topic = %topic, skipped, "Subscriber lagged");
                let error = BrokerError::Lagged {
                    topic: topic.clone(),
                    skipped,
                };
                Some((Err(error), (receiver, topic)))
            },
            Err(RecvError::Closed) => None,
        }
    })
    .boxed()
}

impl Broker for InMemoryBroker {
    fn publish(
        &self,
        message: Message,
    ) -> Pin<Box<dyn Future<Output = Result<usize, BrokerError>> + Send + '_>> {
        let result = self.send(message);
        Box::pin(async move { result })
    }

    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<MessageStream, BrokerError>> + Send + '_>> {
        let result = self.open(topics);
        Box::pin(async move { result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn message(topic: &str, n: i64) -> Message {
        Message::new(topic, "test", json!(n), Utc::now())
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let broker = InMemoryBroker::default();
        assert_eq!(broker.publish(message("sagas", 1)).await, Ok(0));
        assert_eq!(broker.subscriber_count("sagas"), 0);
    }

    #[tokio::test]
    async fn test_fan_out_to_every_subscriber() {
        let broker = InMemoryBroker::new(16);
        let mut first = broker.subscribe(&["sagas"]).await.unwrap();
        let mut second = broker.subscribe(&["sagas"]).await.unwrap();

        assert_eq!(broker.publish(message("sagas", 1)).await, Ok(2));

        assert_eq!(first.next().await.unwrap().unwrap().payload, json!(1));
        assert_eq!(second.next().await.unwrap().unwrap().payload, json!(1));
    }

    #[tokio::test]
    async fn test_order_is_kept_within_a_topic() {
        let broker = InMemoryBroker::new(16);
        let mut stream = broker.subscribe(&["sagas"]).await.unwrap();
        for n in 0..5 {
            broker.publish(message("sagas", n)).await.unwrap();
        }
        let payloads: Vec<_> = stream
            .by_ref()
            .take(5)
            .map(|m| m.unwrap().payload)
            .collect()
            .await;
        assert_eq!(payloads, vec![json!(0), json!(1), json!(2), json!(3), json!(4)]);
    }

    #[tokio::test]
    async fn test_multi_topic_subscription() {
        let broker = InMemoryBroker::new(16);
        let mut stream = broker.subscribe(&["a", "b"]).await.unwrap();

        broker.publish(message("a", 1)).await.unwrap();
        broker.publish(message("b", 2)).await.unwrap();
        broker.publish(message("c", 3)).await.unwrap();

        let mut topics = vec![
            stream.next().await.unwrap().unwrap().topic,
            stream.next().await.unwrap().unwrap().topic,
        ];
        topics.sort();
        assert_eq!(topics, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_invalid_topics_are_rejected() {
        let broker = InMemoryBroker::default();
        assert_eq!(
            broker.publish(message("", 1)).await,
            Err(BrokerError::InvalidTopic(String::new()))
        );
        assert!(matches!(
            broker.subscribe(&["ok", ""]).await,
            Err(BrokerError::InvalidTopic(_))
        ));
        assert!(matches!(
            broker.subscribe(&[]).await,
            Err(BrokerError::SubscriptionFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags() {
        let broker = InMemoryBroker::new(2);
        let mut stream = broker.subscribe(&["sagas"]).await.unwrap();
        for n in 0..5 {
            broker.publish(message("sagas", n)).await.unwrap();
        }

        assert_eq!(
            stream.next().await.unwrap(),
            Err(BrokerError::Lagged {
                topic: "sagas".to_string(),
                skipped: 3,
            })
        );
        assert_eq!(stream.next().await.unwrap().unwrap().payload, json!(3));
        assert_eq!(stream.next().await.unwrap().unwrap().payload, json!(4));
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_not_counted() {
        let broker = InMemoryBroker::new(4);
        let stream = broker.subscribe(&["sagas"]).await.unwrap();
        assert_eq!(broker.subscriber_count("sagas"), 1);
        drop(stream);
        assert_eq!(broker.publish(message("sagas", 1)).await, Ok(0));
    }

    #[tokio::test]
    async fn test_abandoned_topic_is_pruned_on_publish() {
        let broker = InMemoryBroker::new(4);
        let stream = broker.subscribe(&["sagas"]).await.unwrap();
        assert_eq!(broker.topic_count(), 1);

        drop(stream);
        assert_eq!(broker.topic_count(), 1);
        assert_eq!(broker.publish(message("sagas", 1)).await, Ok(0));
        assert_eq!(broker.topic_count(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_topics_are_pruned_on_subscribe() {
        let broker = InMemoryBroker::new(4);
        for n in 0..1000 {
            let topic = format!("req-{n}");
            let stream = broker.subscribe(&[topic.as_str()]).await.unwrap();
            drop(stream);
        }
        assert!(broker.topic_count() <= 1);

        let _live = broker.subscribe(&["sagas"]).await.unwrap();
        assert_eq!(broker.topic_count(), 1);
        assert_eq!(broker.subscriber_count("sagas"), 1);
    }

    #[tokio::test]
    async fn test_live_topic_survives_pruning() {
        let broker = InMemoryBroker::new(4);
        let mut live = broker.subscribe(&["sagas"]).await.unwrap();
        drop(broker.subscribe(&["orders"]).await.unwrap());

        assert_eq!(broker.publish(message("orders", 1)).await, Ok(0));
        assert_eq!(broker.publish(message("sagas", 2)).await, Ok(1));
        assert_eq!(broker.topic_count(), 1);
        assert_eq!(live.next().await.unwrap().unwrap().payload, json!(2));
    }
}
