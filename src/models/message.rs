//! Queue-resident messages and the dead-letter records they can turn into.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A message as handed to a consumer by `receive`.
///
/// `body` is kept as the raw text that was enqueued; decoding it is the
/// consumer's job, so a malformed payload can still be received and routed to
/// the dead-letter sink.
#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct NotificationMessage {
    pub message_id: String,

    pub queue_name: String,

    pub body: String,

    /// Number of times this message has been handed out, including this one.
    pub delivery_count: u32,

    /// Instant after which the queue exposes the message to other consumers.
    pub visibility_deadline: DateTime<Utc>,

    pub enqueued_at: DateTime<Utc>,

    pub last_error: Option<String>,
}

/// Entry in the dead-letter sink, kept for operator inspection only.
#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub message_id: String,
    pub queue_name: String,
    pub original_message: String,
    pub delivery_count: u32,
    pub last_error: Option<String>,
    pub dead_lettered_at: DateTime<Utc>,
}
