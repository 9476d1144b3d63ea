//! Fan-out topic and the storage-side publisher that feeds it.
//!
//! The topic only accepts publishes from its designated storage source and
//! enqueues into every subscribed queue under its own identity, which is the
//! identity those queues' policies admit. Delivery is at-least-once and
//! unordered; nothing here deduplicates.

use crate::{
    models::event::{ObjectEvent, StorageEvent},
    services::queue::{DurableQueue, QueueError},
};
use futures::future::join_all;
use thiserror::Error;
use tracing::{info, instrument, warn};

#[derive(Debug, Error)]
pub enum TopicError {
    #[error("source `{source_identity}` may not publish to topic `{topic}`")]
    Unauthorized {
        topic: String,
        source_identity: String,
    },
    #[error("fan-out to queue `{queue}` failed: {source}")]
    Delivery {
        queue: String,
        #[source]
        source: QueueError,
    },
}

pub type TopicResult<T> = Result<T, TopicError>;

/// Who may publish. Checked against the identity the caller presents.
#[derive(Clone, Debug)]
pub struct TopicPolicy {
    pub allowed_publisher: String,
}

impl TopicPolicy {
    pub fn allows(&self, source_identity: &str) -> bool {
        self.allowed_publisher == source_identity
    }
}

#[derive(Clone)]
pub struct FanOutTopic {
    name: String,
    policy: TopicPolicy,
    subscribers: Vec<DurableQueue>,
}

impl FanOutTopic {
    pub fn new(name: impl Into<String>, policy: TopicPolicy) -> Self {
        Self {
            name: name.into(),
            policy,
            subscribers: Vec::new(),
        }
    }

    pub fn subscribe(&mut self, queue: DurableQueue) {
        self.subscribers.push(queue);
    }

    /// Broadcast `event` to every subscribed queue.
    ///
    /// All queues are attempted even if one fails; the first failure is
    /// returned so the publisher can retry the whole publish. Queues that
    /// already accepted the event will then hold a duplicate, which is fine
    /// under at-least-once delivery.
    #[instrument(skip(self, event), fields(topic = %self.name, dedup_key = %event.dedup_key()))]
    pub async fn publish(&self, source_identity: &str, event: &ObjectEvent) -> TopicResult<usize> {
        if !self.policy.allows(source_identity) {
            warn!(source_identity, "rejected publish from unauthorized source");
            return Err(TopicError::Unauthorized {
                topic: self.name.clone(),
                source_identity: source_identity.to_string(),
            });
        }

        let results = join_all(
            self.subscribers
                .iter()
                .map(|queue| queue.enqueue_event(&self.name, event)),
        )
        .await;

        let mut delivered = 0;
        let mut first_err = None;
        for (queue, result) in self.subscribers.iter().zip(results) {
            match result {
                Ok(_) => delivered += 1,
                Err(err) => {
                    warn!(queue = %queue.name(), error = %err, "fan-out enqueue failed");
                    if first_err.is_none() {
                        first_err = Some(TopicError::Delivery {
                            queue: queue.name().to_string(),
                            source: err,
                        });
                    }
                }
            }
        }

        if let Some(err) = first_err {
            return Err(err);
        }
        Ok(delivered)
    }
}

/// Turns storage notifications into topic publishes. Fire-and-forget from the
/// storage system's point of view.
#[derive(Clone)]
pub struct EventPublisher {
    topic: FanOutTopic,
}

impl EventPublisher {
    pub fn new(topic: FanOutTopic) -> Self {
        Self { topic }
    }

    #[cfg(test)]
    pub fn topic(&self) -> &FanOutTopic {
        &self.topic
    }

    /// Publish one storage event on behalf of `source_identity`.
    pub async fn publish(&self, source_identity: &str, event: StorageEvent) -> TopicResult<usize> {
        let event = ObjectEvent::from(event);
        let fanned_out = self.topic.publish(source_identity, &event).await?;
        info!(
            bucket = %event.bucket,
            object_key = %event.object_key,
            queues = fanned_out,
            "published object event"
        );
        Ok(fanned_out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db::test_pool, models::event::EventType, services::queue::QueuePolicy};
    use chrono::Utc;
    use std::time::Duration;

    const SOURCE: &str = "storage:ingest-bucket";
    const TOPIC: &str = "topic:object-events";

    fn storage_event(key: &str) -> StorageEvent {
        StorageEvent {
            bucket: "ingest-bucket".into(),
            key: key.into(),
            event_type: EventType::Created,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn publish_reaches_every_subscribed_queue() {
        let db = test_pool().await;
        let policy = QueuePolicy {
            allowed_source: TOPIC.into(),
        };
        let a = DurableQueue::new(db.clone(), "queue-a", policy.clone(), 3);
        let b = DurableQueue::new(db.clone(), "queue-b", policy, 3);

        let mut topic = FanOutTopic::new(
            TOPIC,
            TopicPolicy {
                allowed_publisher: SOURCE.into(),
            },
        );
        topic.subscribe(a.clone());
        topic.subscribe(b.clone());
        let publisher = EventPublisher::new(topic);

        let fanned_out = publisher.publish(SOURCE, storage_event("k1")).await.unwrap();
        assert_eq!(fanned_out, 2);

        for queue in [&a, &b] {
            let batch = queue.receive(10, Duration::from_secs(5)).await.unwrap();
            assert_eq!(batch.len(), 1);
            assert!(batch[0].body.contains("\"objectKey\":\"k1\""));
        }
    }

    #[tokio::test]
    async fn unknown_publisher_is_rejected() {
        let db = test_pool().await;
        let queue = DurableQueue::new(
            db,
            "queue-a",
            QueuePolicy {
                allowed_source: TOPIC.into(),
            },
            3,
        );
        let mut topic = FanOutTopic::new(
            TOPIC,
            TopicPolicy {
                allowed_publisher: SOURCE.into(),
            },
        );
        topic.subscribe(queue.clone());

        let err = EventPublisher::new(topic)
            .publish("storage:other-bucket", storage_event("k1"))
            .await
            .unwrap_err();
        assert!(matches!(err, TopicError::Unauthorized { .. }));
        assert_eq!(queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn queue_subscribed_to_another_topic_refuses_fan_out() {
        let db = test_pool().await;
        let foreign = DurableQueue::new(
            db,
            "queue-foreign",
            QueuePolicy {
                allowed_source: "topic:elsewhere".into(),
            },
            3,
        );
        let mut topic = FanOutTopic::new(
            TOPIC,
            TopicPolicy {
                allowed_publisher: SOURCE.into(),
            },
        );
        topic.subscribe(foreign);

        let event = ObjectEvent::created("ingest-bucket", "k1", Utc::now());
        let err = topic.publish(SOURCE, &event).await.unwrap_err();
        assert!(matches!(
            err,
            TopicError::Delivery {
                source: QueueError::Unauthorized { .. },
                ..
            }
        ));
    }
}
