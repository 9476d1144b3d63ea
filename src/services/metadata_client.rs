//! Metadata client used by the terminal workflow step.
//!
//! The metadata service itself is an external collaborator; the pipeline only
//! needs an idempotent `upsert`. `SqliteMetadataClient` is the bundled
//! implementation, writing into the same SQLite database as the pipeline.

use crate::{
    db::{from_ms, now_ms},
    models::metadata::{Attributes, MetadataRecord},
};
use async_trait::async_trait;
use sqlx::{FromRow, SqlitePool};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("object key must not be empty")]
    EmptyKey,
    #[error("attributes could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

impl MetadataError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Sqlx(_))
    }
}

pub type MetadataResult<T> = Result<T, MetadataError>;

/// Upsert request as sent to the metadata service.
#[derive(Clone, Debug)]
pub struct UpsertRequest {
    pub object_key: String,
    pub bucket: String,
    pub attributes: Attributes,

    /// `workflowId:stepIndex` of the writing step.
    pub idempotency_token: String,
}

#[async_trait]
pub trait MetadataClient: Send + Sync {
    /// Insert or overwrite the record for `object_key`. Repeating a call with
    /// identical input must leave identical stored state.
    async fn upsert(&self, request: UpsertRequest) -> MetadataResult<()>;

    async fn get(&self, object_key: &str) -> MetadataResult<Option<MetadataRecord>>;

    /// Number of objects with a stored record.
    async fn count(&self) -> MetadataResult<u64>;
}

#[derive(FromRow)]
struct MetadataRow {
    object_key: String,
    bucket: String,
    attributes: String,
    idempotency_token: String,
    updated_at_ms: i64,
}

#[derive(Clone)]
pub struct SqliteMetadataClient {
    pub db: Arc<SqlitePool>,
}

impl SqliteMetadataClient {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl MetadataClient for SqliteMetadataClient {
    async fn upsert(&self, request: UpsertRequest) -> MetadataResult<()> {
        if request.object_key.is_empty() {
            return Err(MetadataError::EmptyKey);
        }
        let attributes = serde_json::to_string(&request.attributes)?;

        // Same upsert shape as object overwrite: conflict on the key replaces
        // the row in place, so retries never add a second record.
        sqlx::query(
            r#"
            INSERT INTO metadata_records (object_key, bucket, attributes, idempotency_token, updated_at_ms)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(object_key) DO UPDATE SET
                bucket = excluded.bucket,
                attributes = excluded.attributes,
                idempotency_token = excluded.idempotency_token,
                updated_at_ms = excluded.updated_at_ms
            "#,
        )
        .bind(&request.object_key)
        .bind(&request.bucket)
        .bind(&attributes)
        .bind(&request.idempotency_token)
        .bind(now_ms())
        .execute(&*self.db)
        .await?;

        debug!(object_key = %request.object_key, token = %request.idempotency_token, "metadata upserted");
        Ok(())
    }

    async fn get(&self, object_key: &str) -> MetadataResult<Option<MetadataRecord>> {
        let row = sqlx::query_as::<_, MetadataRow>(
            "SELECT object_key, bucket, attributes, idempotency_token, updated_at_ms
             FROM metadata_records WHERE object_key = ?",
        )
        .bind(object_key)
        .fetch_optional(&*self.db)
        .await?;

        row.map(|row| {
            Ok(MetadataRecord {
                object_key: row.object_key,
                bucket: row.bucket,
                attributes: serde_json::from_str(&row.attributes)?,
                idempotency_token: row.idempotency_token,
                updated_at: from_ms(row.updated_at_ms),
            })
        })
        .transpose()
    }

    async fn count(&self) -> MetadataResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM metadata_records")
            .fetch_one(&*self.db)
            .await?;
        Ok(count as u64)
    }
}
