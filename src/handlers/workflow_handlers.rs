//! Operator endpoints: workflow inspection and cancellation, the dead-letter
//! sink and stored metadata.

use crate::{
    errors::AppError,
    models::{
        message::DeadLetter,
        metadata::MetadataRecord,
        workflow::{IngestWorkflow, StepRecord, WorkflowId, WorkflowState},
    },
    state::AppState,
};
use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const DEFAULT_LIMIT: usize = 100;

#[derive(Debug, Deserialize)]
pub struct ListWorkflowsQuery {
    pub state: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelRequest {
    pub reason: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDetail {
    #[serde(flatten)]
    pub workflow: IngestWorkflow,
    pub steps: Vec<StepRecord>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelResponse {
    pub workflow_id: WorkflowId,
    pub cancelled: bool,
    pub state: WorkflowState,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStats {
    pub queue_depth: u64,
    pub workflows: BTreeMap<&'static str, u64>,
    pub metadata_records: u64,
}

/// `GET /stats`
///
/// Backlog and outcome counts for operators.
pub async fn pipeline_stats(State(state): State<AppState>) -> Result<Json<PipelineStats>, AppError> {
    let store = state.engine.store();
    let mut workflows = BTreeMap::new();
    for workflow_state in [
        WorkflowState::Pending,
        WorkflowState::Running,
        WorkflowState::Completed,
        WorkflowState::Failed,
    ] {
        workflows.insert(workflow_state.as_str(), store.count(workflow_state).await?);
    }

    Ok(Json(PipelineStats {
        queue_depth: state.queue.depth().await?,
        workflows,
        metadata_records: state.metadata.count().await?,
    }))
}

/// `GET /workflows?state=failed&limit=50`
pub async fn list_workflows(
    State(state): State<AppState>,
    Query(query): Query<ListWorkflowsQuery>,
) -> Result<Json<Vec<IngestWorkflow>>, AppError> {
    let filter = match query.state.as_deref() {
        Some(raw) => Some(
            WorkflowState::parse(raw)
                .ok_or_else(|| AppError::bad_request(format!("unknown workflow state `{}`", raw)))?,
        ),
        None => None,
    };

    let workflows = state
        .engine
        .store()
        .list(filter, query.limit.unwrap_or(DEFAULT_LIMIT))
        .await?;
    Ok(Json(workflows))
}

/// `GET /workflows/{id}` with its step log.
pub async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<WorkflowDetail>, AppError> {
    let id = WorkflowId::from(id);
    let store = state.engine.store();
    let workflow = store.get(&id).await?;
    let steps = store.steps(&id).await?;
    Ok(Json(WorkflowDetail { workflow, steps }))
}

/// `POST /workflows/{id}/cancel`
///
/// Body is optional: `{"reason": "..."}`. Cancelling a finished workflow is
/// not an error; `cancelled` is then false.
pub async fn cancel_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<CancelResponse>, AppError> {
    let id = WorkflowId::from(id);
    let request: CancelRequest = if body.is_empty() {
        CancelRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|err| AppError::bad_request(format!("invalid cancel body: {}", err)))?
    };
    let reason = request
        .reason
        .unwrap_or_else(|| "operator request".into());

    let cancelled = state.engine.cancel(&id, &reason).await?;
    let workflow = state.engine.store().get(&id).await?;
    Ok(Json(CancelResponse {
        workflow_id: id,
        cancelled,
        state: workflow.state,
    }))
}

/// `GET /dead-letters`
pub async fn list_dead_letters(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<DeadLetter>>, AppError> {
    let letters = state
        .queue
        .list_dead_letters(query.limit.unwrap_or(DEFAULT_LIMIT))
        .await?;
    Ok(Json(letters))
}

/// `GET /metadata/{*key}`
pub async fn get_metadata(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<MetadataRecord>, AppError> {
    state
        .metadata
        .get(&key)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("no metadata for `{}`", key)))
}
