//! Hook the storage system calls when an object changes.

use crate::{errors::AppError, models::event::StorageEvent, state::AppState};
use axum::{
    Json,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use serde::Serialize;

/// Header carrying the caller's source identity, checked by the topic policy.
pub const SOURCE_IDENTITY_HEADER: &str = "x-source-identity";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PublishResponse {
    queues: usize,
}

/// `POST /events`
///
/// Publishes one storage event to the topic. 202 once every subscribed queue
/// holds it; 403 if the caller is not the topic's allowed publisher.
pub async fn publish_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(event): Json<StorageEvent>,
) -> Result<impl IntoResponse, AppError> {
    let source = headers
        .get(SOURCE_IDENTITY_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::forbidden(format!("missing {} header", SOURCE_IDENTITY_HEADER)))?;

    if event.bucket.is_empty() || event.key.is_empty() {
        return Err(AppError::bad_request("bucket and key are required"));
    }

    let queues = state.publisher.publish(source, event).await?;
    Ok((StatusCode::ACCEPTED, Json(PublishResponse { queues })))
}
