//! Defines routes for event intake, operator inspection and health.
//!
//! ## Structure
//! - **Intake**
//!   - `POST /events`: storage event hook (requires `x-source-identity`)
//!
//! - **Operator endpoints**
//!   - `GET  /workflows`: list workflows (supports `state`, `limit`)
//!   - `GET  /workflows/{id}`: one workflow with its step log
//!   - `POST /workflows/{id}/cancel`: cancel with an optional reason
//!   - `GET  /dead-letters`: dead-lettered messages, newest first
//!   - `GET  /metadata/{*key}`: stored metadata for an object key
//!   - `GET  /stats`: queue depth, workflow counts per state, metadata records
//!
//! The wildcard `*key` allows nested keys like `tenant_id=acme/table=logs/a.json`.

use crate::{
    handlers::{
        event_handlers::publish_event,
        health_handlers::{healthz, readyz},
        workflow_handlers::{
            cancel_workflow, get_metadata, get_workflow, list_dead_letters, list_workflows,
            pipeline_stats,
        },
    },
    state::AppState,
};
use axum::{
    Router,
    routing::{get, post},
};

/// Build the router. Handlers share `AppState`.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/events", post(publish_event))
        .route("/workflows", get(list_workflows))
        .route("/workflows/{id}", get(get_workflow))
        .route("/workflows/{id}/cancel", post(cancel_workflow))
        .route("/dead-letters", get(list_dead_letters))
        .route("/metadata/{*key}", get(get_metadata))
        .route("/stats", get(pipeline_stats))
}
