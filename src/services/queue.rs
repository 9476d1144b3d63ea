//! src/services/queue.rs
//!
//! DurableQueue: Visibility-timeout queue backed by SQLite. A received
//! message stays in its row with `visible_at_ms` pushed into the future; if
//! the consumer never deletes it, the lease lapses and the next `receive`
//! hands it out again with a higher delivery count.

use crate::{
    db::{from_ms, now_ms},
    models::{
        event::{NotificationEnvelope, ObjectEvent},
        message::{DeadLetter, NotificationMessage},
    },
};
use sqlx::{FromRow, SqlitePool};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("`{sender}` is not allowed to enqueue on queue `{queue}`")]
    Unauthorized { queue: String, sender: String },
    #[error("message `{0}` not found")]
    MessageNotFound(String),
    #[error("message body could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

impl QueueError {
    /// Storage errors are worth retrying; everything else is a caller mistake.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Sqlx(_))
    }
}

pub type QueueResult<T> = Result<T, QueueError>;

/// Which sender may enqueue. The only accepted source is the topic this queue
/// is subscribed to.
#[derive(Clone, Debug)]
pub struct QueuePolicy {
    pub allowed_source: String,
}

impl QueuePolicy {
    pub fn allows(&self, sender: &str) -> bool {
        self.allowed_source == sender
    }
}

#[derive(FromRow)]
struct MessageRow {
    id: String,
    queue_name: String,
    body: String,
    delivery_count: i64,
    visible_at_ms: i64,
    enqueued_at_ms: i64,
    last_error: Option<String>,
}

impl MessageRow {
    fn into_message(self) -> NotificationMessage {
        NotificationMessage {
            message_id: self.id,
            queue_name: self.queue_name,
            body: self.body,
            delivery_count: self.delivery_count as u32,
            visibility_deadline: from_ms(self.visible_at_ms),
            enqueued_at: from_ms(self.enqueued_at_ms),
            last_error: self.last_error,
        }
    }
}

#[derive(FromRow)]
struct DeadLetterRow {
    message_id: String,
    queue_name: String,
    original_message: String,
    delivery_count: i64,
    last_error: Option<String>,
    dead_lettered_at_ms: i64,
}

impl From<DeadLetterRow> for DeadLetter {
    fn from(row: DeadLetterRow) -> Self {
        Self {
            message_id: row.message_id,
            queue_name: row.queue_name,
            original_message: row.original_message,
            delivery_count: row.delivery_count as u32,
            last_error: row.last_error,
            dead_lettered_at: from_ms(row.dead_lettered_at_ms),
        }
    }
}

/// One named queue. Many queues (and many consumers of one queue) can share
/// the same database.
#[derive(Clone)]
pub struct DurableQueue {
    pub db: Arc<SqlitePool>,
    name: String,
    policy: QueuePolicy,

    /// Deliveries allowed before a message is dead-lettered instead.
    max_deliveries: u32,
}

impl DurableQueue {
    pub fn new(
        db: Arc<SqlitePool>,
        name: impl Into<String>,
        policy: QueuePolicy,
        max_deliveries: u32,
    ) -> Self {
        Self {
            db,
            name: name.into(),
            policy,
            max_deliveries: max_deliveries.max(1),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Store a raw body. The body is not validated here; consumers decide what
    /// a malformed payload means.
    pub async fn enqueue(&self, sender: &str, body: &str) -> QueueResult<String> {
        if !self.policy.allows(sender) {
            return Err(QueueError::Unauthorized {
                queue: self.name.clone(),
                sender: sender.to_string(),
            });
        }

        let id = Uuid::new_v4().to_string();
        let now = now_ms();
        sqlx::query(
            "INSERT INTO queue_messages (id, queue_name, body, delivery_count, visible_at_ms, enqueued_at_ms)
             VALUES (?, ?, ?, 0, ?, ?)",
        )
        .bind(&id)
        .bind(&self.name)
        .bind(body)
        .bind(now)
        .bind(now)
        .execute(&*self.db)
        .await?;

        debug!(queue = %self.name, message_id = %id, "enqueued message");
        Ok(id)
    }

    /// Encode the event as a wire envelope and enqueue it.
    pub async fn enqueue_event(&self, sender: &str, event: &ObjectEvent) -> QueueResult<String> {
        let body = serde_json::to_string(&NotificationEnvelope::from(event))?;
        self.enqueue(sender, &body).await
    }

    /// Hand out up to `max_count` visible messages, each leased for
    /// `visibility_timeout`.
    ///
    /// - Every handed-out message has its delivery count incremented.
    /// - A message that would exceed `max_deliveries` is moved to the
    ///   dead-letter sink instead and never returned again.
    /// - Claims are conditional on the row still being visible with the count
    ///   we read, so two consumers never receive the same lease.
    pub async fn receive(
        &self,
        max_count: usize,
        visibility_timeout: Duration,
    ) -> QueueResult<Vec<NotificationMessage>> {
        let mut delivered = Vec::with_capacity(max_count);
        if max_count == 0 {
            return Ok(delivered);
        }

        loop {
            let now = now_ms();
            let remaining = max_count - delivered.len();
            let candidates = sqlx::query_as::<_, MessageRow>(
                "SELECT id, queue_name, body, delivery_count, visible_at_ms, enqueued_at_ms, last_error
                 FROM queue_messages
                 WHERE queue_name = ? AND visible_at_ms <= ?
                 ORDER BY visible_at_ms ASC, enqueued_at_ms ASC
                 LIMIT ?",
            )
            .bind(&self.name)
            .bind(now)
            .bind(remaining as i64)
            .fetch_all(&*self.db)
            .await?;

            if candidates.is_empty() {
                break;
            }

            let mut dead_lettered = 0usize;
            for row in candidates {
                if row.delivery_count as u32 >= self.max_deliveries {
                    if self.move_to_dead_letter(&row, now).await? {
                        dead_lettered += 1;
                    }
                    continue;
                }

                let deadline = now + visibility_timeout.as_millis() as i64;
                let claimed = sqlx::query_as::<_, MessageRow>(
                    "UPDATE queue_messages
                     SET delivery_count = delivery_count + 1, visible_at_ms = ?
                     WHERE id = ? AND visible_at_ms <= ? AND delivery_count = ?
                     RETURNING id, queue_name, body, delivery_count, visible_at_ms, enqueued_at_ms, last_error",
                )
                .bind(deadline)
                .bind(&row.id)
                .bind(now)
                .bind(row.delivery_count)
                .fetch_optional(&*self.db)
                .await?;

                if let Some(claimed) = claimed {
                    delivered.push(claimed.into_message());
                }
            }

            // Dead-lettered rows freed up room in this batch; look again.
            if dead_lettered == 0 || delivered.len() >= max_count {
                break;
            }
        }

        Ok(delivered)
    }

    /// Push the visibility deadline of a leased message to `now + extension`.
    pub async fn extend_visibility(&self, message_id: &str, extension: Duration) -> QueueResult<()> {
        let deadline = now_ms() + extension.as_millis() as i64;
        let result = sqlx::query(
            "UPDATE queue_messages SET visible_at_ms = ? WHERE id = ? AND queue_name = ?",
        )
        .bind(deadline)
        .bind(message_id)
        .bind(&self.name)
        .execute(&*self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::MessageNotFound(message_id.to_string()));
        }
        Ok(())
    }

    /// Permanently remove a message. Returns false if it was already gone.
    pub async fn delete(&self, message_id: &str) -> QueueResult<bool> {
        let result = sqlx::query("DELETE FROM queue_messages WHERE id = ? AND queue_name = ?")
            .bind(message_id)
            .bind(&self.name)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Remember why the last delivery failed; reported if the message is
    /// eventually dead-lettered.
    pub async fn record_error(&self, message_id: &str, error: &str) -> QueueResult<()> {
        sqlx::query("UPDATE queue_messages SET last_error = ? WHERE id = ? AND queue_name = ?")
            .bind(error)
            .bind(message_id)
            .bind(&self.name)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    /// Remove a received message and file it in the dead-letter sink with
    /// `error`. Used for payloads that can never succeed.
    pub async fn dead_letter(&self, message: &NotificationMessage, error: &str) -> QueueResult<()> {
        let mut tx = self.db.begin().await?;
        let removed = sqlx::query("DELETE FROM queue_messages WHERE id = ? AND queue_name = ?")
            .bind(&message.message_id)
            .bind(&self.name)
            .execute(&mut *tx)
            .await?;

        if removed.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(QueueError::MessageNotFound(message.message_id.clone()));
        }

        sqlx::query(
            "INSERT OR IGNORE INTO dead_letters
                (message_id, queue_name, original_message, delivery_count, last_error, dead_lettered_at_ms)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&message.message_id)
        .bind(&self.name)
        .bind(&message.body)
        .bind(message.delivery_count as i64)
        .bind(error)
        .bind(now_ms())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        warn!(
            queue = %self.name,
            message_id = %message.message_id,
            delivery_count = message.delivery_count,
            error,
            "message routed to dead-letter sink"
        );
        Ok(())
    }

    /// Atomically move an exhausted message out of the queue. Returns false if
    /// another consumer got to the row first.
    async fn move_to_dead_letter(&self, row: &MessageRow, now: i64) -> QueueResult<bool> {
        let mut tx = self.db.begin().await?;
        let removed = sqlx::query(
            "DELETE FROM queue_messages
             WHERE id = ? AND visible_at_ms <= ? AND delivery_count = ?",
        )
        .bind(&row.id)
        .bind(now)
        .bind(row.delivery_count)
        .execute(&mut *tx)
        .await?;

        if removed.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        let last_error = row
            .last_error
            .clone()
            .unwrap_or_else(|| "visibility timeout lapsed without acknowledgement".into());
        sqlx::query(
            "INSERT OR IGNORE INTO dead_letters
                (message_id, queue_name, original_message, delivery_count, last_error, dead_lettered_at_ms)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&row.id)
        .bind(&self.name)
        .bind(&row.body)
        .bind(row.delivery_count)
        .bind(&last_error)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        warn!(
            queue = %self.name,
            message_id = %row.id,
            delivery_count = row.delivery_count,
            max_deliveries = self.max_deliveries,
            last_error = %last_error,
            "delivery ceiling exceeded, message dead-lettered"
        );
        Ok(true)
    }

    /// Dead letters recorded for this queue, newest first.
    pub async fn list_dead_letters(&self, limit: usize) -> QueueResult<Vec<DeadLetter>> {
        let rows = sqlx::query_as::<_, DeadLetterRow>(
            "SELECT message_id, queue_name, original_message, delivery_count, last_error, dead_lettered_at_ms
             FROM dead_letters
             WHERE queue_name = ?
             ORDER BY dead_lettered_at_ms DESC
             LIMIT ?",
        )
        .bind(&self.name)
        .bind(limit.clamp(1, 1000) as i64)
        .fetch_all(&*self.db)
        .await?;

        Ok(rows.into_iter().map(DeadLetter::from).collect())
    }

    /// Messages still held by the queue, visible or leased.
    pub async fn depth(&self) -> QueueResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue_messages WHERE queue_name = ?")
            .bind(&self.name)
            .fetch_one(&*self.db)
            .await?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use chrono::Utc;

    const TOPIC: &str = "topic:object-events";

    async fn queue(max_deliveries: u32) -> DurableQueue {
        DurableQueue::new(
            test_pool().await,
            "ingest-queue",
            QueuePolicy {
                allowed_source: TOPIC.into(),
            },
            max_deliveries,
        )
    }

    #[tokio::test]
    async fn rejects_unauthorized_sender() {
        let q = queue(3).await;
        let err = q.enqueue("someone-else", "{}").await.unwrap_err();
        assert!(matches!(err, QueueError::Unauthorized { .. }));
        assert!(!err.is_transient());
        assert_eq!(q.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn received_message_is_hidden_until_deadline() {
        let q = queue(5).await;
        q.enqueue_event(TOPIC, &ObjectEvent::created("b", "k1", Utc::now()))
            .await
            .unwrap();

        let first = q.receive(10, Duration::from_secs(30)).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].delivery_count, 1);

        let second = q.receive(10, Duration::from_secs(30)).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn lapsed_visibility_redelivers_with_higher_count() {
        let q = queue(5).await;
        q.enqueue(TOPIC, "payload").await.unwrap();

        let mut counts = Vec::new();
        for _ in 0..3 {
            let batch = q.receive(1, Duration::from_millis(20)).await.unwrap();
            assert_eq!(batch.len(), 1);
            counts.push(batch[0].delivery_count);
            tokio::time::sleep(Duration::from_millis(40)).await;
        }

        assert_eq!(counts, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn extend_visibility_keeps_message_hidden() {
        let q = queue(5).await;
        q.enqueue(TOPIC, "payload").await.unwrap();
        let msg = q.receive(1, Duration::from_millis(30)).await.unwrap().remove(0);

        q.extend_visibility(&msg.message_id, Duration::from_secs(30))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(q.receive(1, Duration::from_secs(1)).await.unwrap().is_empty());

        assert!(q.delete(&msg.message_id).await.unwrap());
        assert!(!q.delete(&msg.message_id).await.unwrap());
        assert!(matches!(
            q.extend_visibility(&msg.message_id, Duration::from_secs(1)).await,
            Err(QueueError::MessageNotFound(_))
        ));
    }

    #[tokio::test]
    async fn exhausted_message_lands_in_dead_letter_sink_once() {
        let q = queue(2).await;
        let id = q.enqueue(TOPIC, "payload").await.unwrap();

        for _ in 0..2 {
            let batch = q.receive(1, Duration::from_millis(10)).await.unwrap();
            assert_eq!(batch.len(), 1);
            q.record_error(&id, "engine unavailable").await.unwrap();
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        assert!(q.receive(1, Duration::from_millis(10)).await.unwrap().is_empty());
        assert!(q.receive(1, Duration::from_millis(10)).await.unwrap().is_empty());

        let dead = q.list_dead_letters(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].message_id, id);
        assert_eq!(dead[0].delivery_count, 2);
        assert_eq!(dead[0].last_error.as_deref(), Some("engine unavailable"));
        assert_eq!(q.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn dead_lettered_rows_do_not_starve_a_batch() {
        let q = queue(1).await;
        let stale = q.enqueue(TOPIC, "stale").await.unwrap();
        q.receive(1, Duration::from_millis(5)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(15)).await;
        q.enqueue(TOPIC, "fresh").await.unwrap();

        let batch = q.receive(1, Duration::from_secs(5)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].body, "fresh");
        assert_eq!(q.list_dead_letters(10).await.unwrap()[0].message_id, stale);
    }

    #[tokio::test]
    async fn explicit_dead_letter_removes_message() {
        let q = queue(5).await;
        q.enqueue(TOPIC, "not json").await.unwrap();
        let msg = q.receive(1, Duration::from_secs(5)).await.unwrap().remove(0);

        q.dead_letter(&msg, "malformed payload").await.unwrap();

        assert_eq!(q.depth().await.unwrap(), 0);
        let dead = q.list_dead_letters(10).await.unwrap();
        assert_eq!(dead[0].original_message, "not json");
        assert_eq!(dead[0].last_error.as_deref(), Some("malformed payload"));
    }
}
