//! Represents a storage mutation and the envelope it travels in.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of storage mutation. Only `Created` is ingested.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    Created,
    Removed,
}

/// One storage mutation observed on a bucket.
///
/// The same physical upload may be observed and published more than once, so
/// every stage downstream of the publisher has to tolerate duplicates.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectEvent {
    /// Opaque identifier, unique per object version.
    pub object_key: String,

    /// Logical storage namespace.
    pub bucket: String,

    pub event_type: EventType,

    /// When the storage system detected the mutation.
    pub observed_at: DateTime<Utc>,
}

impl ObjectEvent {
    #[cfg(test)]
    pub fn created(
        bucket: impl Into<String>,
        object_key: impl Into<String>,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            object_key: object_key.into(),
            bucket: bucket.into(),
            event_type: EventType::Created,
            observed_at,
        }
    }

    /// `bucket/key@observedAt`, identifying one observation of one upload.
    pub fn dedup_key(&self) -> String {
        format!(
            "{}/{}@{}",
            self.bucket,
            self.object_key,
            self.observed_at.timestamp_millis()
        )
    }
}

/// Event as delivered by the external storage system.
#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct StorageEvent {
    pub bucket: String,
    pub key: String,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
}

impl From<StorageEvent> for ObjectEvent {
    fn from(event: StorageEvent) -> Self {
        Self {
            object_key: event.key,
            bucket: event.bucket,
            event_type: event.event_type,
            observed_at: event.timestamp,
        }
    }
}

/// JSON body carried by every queue message.
///
/// Unknown fields are ignored on decode so producers can add fields without
/// breaking older consumers.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEnvelope {
    pub object_key: String,
    pub bucket: String,
    pub event_type: EventType,
    pub observed_at: DateTime<Utc>,
    #[serde(default)]
    pub delivery_count: u32,
}

impl NotificationEnvelope {
    pub fn into_event(self) -> ObjectEvent {
        ObjectEvent {
            object_key: self.object_key,
            bucket: self.bucket,
            event_type: self.event_type,
            observed_at: self.observed_at,
        }
    }
}

impl From<&ObjectEvent> for NotificationEnvelope {
    fn from(event: &ObjectEvent) -> Self {
        Self {
            object_key: event.object_key.clone(),
            bucket: event.bucket.clone(),
            event_type: event.event_type,
            observed_at: event.observed_at,
            delivery_count: 0,
        }
    }
}
