//! src/services/workflow_store.rs
//!
//! WorkflowStore: SQLite persistence for ingest workflows. A table keyed by
//! the deterministic workflow id (atomic create-if-absent) plus an append-only
//! step completion log keyed by `(workflow_id, step_index)`. Execution lives in
//! `workflow_engine`; this file only knows rows and state transitions.

use crate::{
    db::{from_ms, now_ms},
    models::workflow::{IngestWorkflow, StartRequest, StepRecord, WorkflowId, WorkflowState},
};
use sqlx::{FromRow, SqlitePool};
use std::{sync::Arc, time::Duration};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("workflow `{0}` not found")]
    NotFound(String),
    #[error("stored workflow `{id}` is unreadable: {reason}")]
    Corrupt { id: String, reason: String },
    #[error(transparent)]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

impl WorkflowError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Sqlx(_))
    }
}

pub type WorkflowResult<T> = Result<T, WorkflowError>;

const WORKFLOW_COLUMNS: &str = "id, input, state, attempt, failure_reason, lease_owner, \
     created_at_ms, updated_at_ms, deadline_at_ms";

/// A workflow is claimable when nobody holds a live lease on it.
const CLAIMABLE: &str = "(state = 'pending' \
     OR (state = 'running' AND (lease_expires_at_ms IS NULL OR lease_expires_at_ms <= ?)))";

#[derive(FromRow)]
struct WorkflowRow {
    id: String,
    input: String,
    state: String,
    attempt: i64,
    failure_reason: Option<String>,
    lease_owner: Option<String>,
    created_at_ms: i64,
    updated_at_ms: i64,
    deadline_at_ms: i64,
}

impl WorkflowRow {
    fn into_workflow(self) -> WorkflowResult<IngestWorkflow> {
        let state = WorkflowState::parse(&self.state).ok_or_else(|| WorkflowError::Corrupt {
            id: self.id.clone(),
            reason: format!("unknown state `{}`", self.state),
        })?;
        let input = serde_json::from_str(&self.input).map_err(|err| WorkflowError::Corrupt {
            id: self.id.clone(),
            reason: err.to_string(),
        })?;

        Ok(IngestWorkflow {
            workflow_id: WorkflowId::from(self.id),
            input,
            state,
            attempt: self.attempt as u32,
            failure_reason: self.failure_reason,
            lease_owner: self.lease_owner,
            created_at: from_ms(self.created_at_ms),
            updated_at: from_ms(self.updated_at_ms),
            deadline_at: from_ms(self.deadline_at_ms),
        })
    }
}

#[derive(FromRow)]
struct StepRow {
    step_index: i64,
    step_name: String,
    output: String,
    completed_at_ms: i64,
}

#[derive(Clone)]
pub struct WorkflowStore {
    pub db: Arc<SqlitePool>,
}

impl WorkflowStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Insert a `Pending` workflow unless one with the same id exists.
    ///
    /// Returns true when this call created it. Concurrent duplicate starts are
    /// serialized by the primary key, so exactly one caller sees `true`.
    pub async fn create_if_absent(
        &self,
        request: &StartRequest,
        deadline: Duration,
    ) -> WorkflowResult<bool> {
        let input = serde_json::to_string(&request.input)?;
        let now = now_ms();
        let result = sqlx::query(
            "INSERT INTO workflows
                (id, bucket, object_key, input, state, attempt, created_at_ms, updated_at_ms, deadline_at_ms)
             VALUES (?, ?, ?, ?, 'pending', 0, ?, ?, ?)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(request.workflow_id.as_str())
        .bind(&request.input.bucket)
        .bind(&request.input.object_key)
        .bind(&input)
        .bind(now)
        .bind(now)
        .bind(now + deadline.as_millis() as i64)
        .execute(&*self.db)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn get(&self, id: &WorkflowId) -> WorkflowResult<IngestWorkflow> {
        let sql = format!("SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE id = ?");
        sqlx::query_as::<_, WorkflowRow>(&sql)
            .bind(id.as_str())
            .fetch_optional(&*self.db)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(id.to_string()))?
            .into_workflow()
    }

    /// Lease the oldest claimable workflow to `owner` and mark it `Running`.
    ///
    /// A `Running` workflow whose lease has expired belongs to a crashed or
    /// stalled worker and is claimable again; the new owner replays its step
    /// log.
    pub async fn claim_next(
        &self,
        owner: &str,
        lease: Duration,
    ) -> WorkflowResult<Option<IngestWorkflow>> {
        let now = now_ms();
        let sql = format!(
            "UPDATE workflows
             SET state = 'running', lease_owner = ?, lease_expires_at_ms = ?, updated_at_ms = ?
             WHERE id = (SELECT id FROM workflows WHERE {CLAIMABLE} ORDER BY created_at_ms ASC LIMIT 1)
               AND {CLAIMABLE}
             RETURNING {WORKFLOW_COLUMNS}"
        );
        let row = sqlx::query_as::<_, WorkflowRow>(&sql)
            .bind(owner)
            .bind(now + lease.as_millis() as i64)
            .bind(now)
            .bind(now)
            .bind(now)
            .fetch_optional(&*self.db)
            .await?;

        row.map(WorkflowRow::into_workflow).transpose()
    }

    /// Extend `owner`'s lease. Returns false when the lease was lost: taken
    /// over by another worker, or the workflow left `Running` (cancelled).
    pub async fn renew_lease(
        &self,
        id: &WorkflowId,
        owner: &str,
        lease: Duration,
    ) -> WorkflowResult<bool> {
        let now = now_ms();
        let result = sqlx::query(
            "UPDATE workflows SET lease_expires_at_ms = ?, updated_at_ms = ?
             WHERE id = ? AND lease_owner = ? AND state = 'running'",
        )
        .bind(now + lease.as_millis() as i64)
        .bind(now)
        .bind(id.as_str())
        .bind(owner)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Count one failed step attempt.
    pub async fn record_attempt(&self, id: &WorkflowId) -> WorkflowResult<u32> {
        let attempt: i64 = sqlx::query_scalar(
            "UPDATE workflows SET attempt = attempt + 1, updated_at_ms = ? WHERE id = ? RETURNING attempt",
        )
        .bind(now_ms())
        .bind(id.as_str())
        .fetch_one(&*self.db)
        .await?;
        Ok(attempt as u32)
    }

    /// Completed steps in index order.
    pub async fn steps(&self, id: &WorkflowId) -> WorkflowResult<Vec<StepRecord>> {
        let rows = sqlx::query_as::<_, StepRow>(
            "SELECT step_index, step_name, output, completed_at_ms
             FROM workflow_steps WHERE workflow_id = ? ORDER BY step_index ASC",
        )
        .bind(id.as_str())
        .fetch_all(&*self.db)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(StepRecord {
                    step_index: row.step_index as u32,
                    step_name: row.step_name,
                    output: serde_json::from_str(&row.output).map_err(|err| {
                        WorkflowError::Corrupt {
                            id: id.to_string(),
                            reason: format!("step {}: {}", row.step_index, err),
                        }
                    })?,
                    completed_at: from_ms(row.completed_at_ms),
                })
            })
            .collect()
    }

    /// Append a step completion. The log is append-only: a second completion
    /// for the same index is ignored and the first output wins. Returns true
    /// when this call wrote the entry.
    pub async fn append_step(
        &self,
        id: &WorkflowId,
        step_index: u32,
        step_name: &str,
        output: &serde_json::Value,
    ) -> WorkflowResult<bool> {
        let result = sqlx::query(
            "INSERT INTO workflow_steps (workflow_id, step_index, step_name, output, completed_at_ms)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(workflow_id, step_index) DO NOTHING",
        )
        .bind(id.as_str())
        .bind(step_index as i64)
        .bind(step_name)
        .bind(serde_json::to_string(output)?)
        .bind(now_ms())
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// `Running → Completed` for the lease holder.
    pub async fn complete(&self, id: &WorkflowId, owner: &str) -> WorkflowResult<bool> {
        let result = sqlx::query(
            "UPDATE workflows
             SET state = 'completed', lease_owner = NULL, lease_expires_at_ms = NULL, updated_at_ms = ?
             WHERE id = ? AND state = 'running' AND lease_owner = ?",
        )
        .bind(now_ms())
        .bind(id.as_str())
        .bind(owner)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Move a non-terminal workflow to `Failed` regardless of who holds the
    /// lease (operator cancellation). Returns false if it was already terminal.
    pub async fn fail(&self, id: &WorkflowId, reason: &str) -> WorkflowResult<bool> {
        let result = sqlx::query(
            "UPDATE workflows
             SET state = 'failed', failure_reason = ?, lease_owner = NULL,
                 lease_expires_at_ms = NULL, updated_at_ms = ?
             WHERE id = ? AND state IN ('pending', 'running')",
        )
        .bind(reason)
        .bind(now_ms())
        .bind(id.as_str())
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Engine-side failure: like [`fail`](Self::fail), but only while
    /// `owner` still holds the lease (or nobody does). A worker whose lease
    /// was taken over cannot fail a workflow another worker is running.
    pub async fn fail_owned(
        &self,
        id: &WorkflowId,
        owner: &str,
        reason: &str,
    ) -> WorkflowResult<bool> {
        let result = sqlx::query(
            "UPDATE workflows
             SET state = 'failed', failure_reason = ?, lease_owner = NULL,
                 lease_expires_at_ms = NULL, updated_at_ms = ?
             WHERE id = ? AND state IN ('pending', 'running')
               AND (lease_owner IS NULL OR lease_owner = ?)",
        )
        .bind(reason)
        .bind(now_ms())
        .bind(id.as_str())
        .bind(owner)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Flip the reported flag. Only the first caller gets `true`, which is
    /// what keeps a failure from being reported twice.
    pub async fn mark_failure_reported(&self, id: &WorkflowId) -> WorkflowResult<bool> {
        let result = sqlx::query(
            "UPDATE workflows SET failure_reported = 1
             WHERE id = ? AND state = 'failed' AND failure_reported = 0",
        )
        .bind(id.as_str())
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn list(
        &self,
        state: Option<WorkflowState>,
        limit: usize,
    ) -> WorkflowResult<Vec<IngestWorkflow>> {
        let limit = limit.clamp(1, 1000) as i64;
        let rows = match state {
            Some(state) => {
                let sql = format!(
                    "SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE state = ?
                     ORDER BY updated_at_ms DESC LIMIT ?"
                );
                sqlx::query_as::<_, WorkflowRow>(&sql)
                    .bind(state.as_str())
                    .bind(limit)
                    .fetch_all(&*self.db)
                    .await?
            }
            None => {
                let sql = format!(
                    "SELECT {WORKFLOW_COLUMNS} FROM workflows ORDER BY updated_at_ms DESC LIMIT ?"
                );
                sqlx::query_as::<_, WorkflowRow>(&sql)
                    .bind(limit)
                    .fetch_all(&*self.db)
                    .await?
            }
        };

        rows.into_iter().map(WorkflowRow::into_workflow).collect()
    }

    pub async fn count(&self, state: WorkflowState) -> WorkflowResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM workflows WHERE state = ?")
            .bind(state.as_str())
            .fetch_one(&*self.db)
            .await?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db::test_pool, models::event::ObjectEvent};
    use chrono::Utc;
    use serde_json::json;

    fn request(key: &str) -> StartRequest {
        StartRequest::for_event(ObjectEvent::created("b", key, Utc::now()))
    }

    #[tokio::test]
    async fn create_if_absent_is_idempotent() {
        let store = WorkflowStore::new(test_pool().await);
        let req = request("k1");

        assert!(store.create_if_absent(&req, Duration::from_secs(60)).await.unwrap());
        assert!(!store.create_if_absent(&req, Duration::from_secs(60)).await.unwrap());

        let wf = store.get(&req.workflow_id).await.unwrap();
        assert_eq!(wf.state, WorkflowState::Pending);
        assert_eq!(wf.input.object_key, "k1");
        assert_eq!(store.count(WorkflowState::Pending).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn live_lease_blocks_second_claim_until_it_expires() {
        let store = WorkflowStore::new(test_pool().await);
        let req = request("k1");
        store.create_if_absent(&req, Duration::from_secs(60)).await.unwrap();

        let claimed = store
            .claim_next("worker-a", Duration::from_millis(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.state, WorkflowState::Running);
        assert_eq!(claimed.lease_owner.as_deref(), Some("worker-a"));
        assert!(store.claim_next("worker-b", Duration::from_secs(5)).await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(50)).await;
        let taken_over = store
            .claim_next("worker-b", Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(taken_over.lease_owner.as_deref(), Some("worker-b"));
        assert!(!store
            .renew_lease(&req.workflow_id, "worker-a", Duration::from_secs(5))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn step_log_keeps_first_completion() {
        let store = WorkflowStore::new(test_pool().await);
        let id = request("k1").workflow_id;

        assert!(store.append_step(&id, 0, "resolve_partition", &json!({"a": 1})).await.unwrap());
        assert!(!store.append_step(&id, 0, "resolve_partition", &json!({"a": 2})).await.unwrap());
        store.append_step(&id, 1, "record_metadata", &json!(null)).await.unwrap();

        let steps = store.steps(&id).await.unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].output, json!({"a": 1}));
        assert_eq!(steps[1].step_name, "record_metadata");
    }

    #[tokio::test]
    async fn terminal_states_are_sticky_and_reported_once() {
        let store = WorkflowStore::new(test_pool().await);
        let req = request("k1");
        store.create_if_absent(&req, Duration::from_secs(60)).await.unwrap();

        assert!(store.fail(&req.workflow_id, "boom").await.unwrap());
        assert!(!store.fail(&req.workflow_id, "again").await.unwrap());
        assert!(store.mark_failure_reported(&req.workflow_id).await.unwrap());
        assert!(!store.mark_failure_reported(&req.workflow_id).await.unwrap());

        let wf = store.get(&req.workflow_id).await.unwrap();
        assert_eq!(wf.failure_reason.as_deref(), Some("boom"));
        assert!(store.claim_next("w", Duration::from_secs(1)).await.unwrap().is_none());
        assert_eq!(store.list(Some(WorkflowState::Failed), 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stale_lease_holder_cannot_fail_a_taken_over_workflow() {
        let store = WorkflowStore::new(test_pool().await);
        let req = request("k1");
        store.create_if_absent(&req, Duration::from_secs(60)).await.unwrap();

        store
            .claim_next("worker-a", Duration::from_millis(20))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        store
            .claim_next("worker-b", Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();

        assert!(!store
            .fail_owned(&req.workflow_id, "worker-a", "workflow deadline exceeded")
            .await
            .unwrap());
        let wf = store.get(&req.workflow_id).await.unwrap();
        assert_eq!(wf.state, WorkflowState::Running);
        assert_eq!(wf.lease_owner.as_deref(), Some("worker-b"));

        assert!(store
            .fail_owned(&req.workflow_id, "worker-b", "workflow deadline exceeded")
            .await
            .unwrap());
        assert_eq!(
            store.get(&req.workflow_id).await.unwrap().state,
            WorkflowState::Failed
        );
    }

    #[tokio::test]
    async fn unclaimed_workflow_can_be_failed_by_any_worker() {
        let store = WorkflowStore::new(test_pool().await);
        let req = request("k1");
        store.create_if_absent(&req, Duration::from_secs(60)).await.unwrap();

        assert!(store.fail_owned(&req.workflow_id, "worker-a", "boom").await.unwrap());
    }

    #[tokio::test]
    async fn missing_workflow_is_not_found() {
        let store = WorkflowStore::new(test_pool().await);
        let err = store.get(&WorkflowId::for_object("b", "nope")).await.unwrap_err();
        assert!(matches!(err, WorkflowError::NotFound(_)));
    }
}
