//! The two steps of an ingest workflow.
//!
//! 1. `resolve_partition` reads the tenant/table layout out of the object key.
//! 2. `record_metadata` upserts the object's metadata record.

use crate::{
    models::metadata::Attributes,
    services::{
        metadata_client::{MetadataClient, UpsertRequest},
        workflow_engine::{StepContext, StepError, WorkflowStep},
    },
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use regex::Regex;
use serde_json::{Value, json};
use std::sync::{Arc, LazyLock};
use tracing::debug;

/// Where an object belongs, derived from keys containing
/// `tenant_id=<tenant>/table=<table>/<file>`. Keys outside that layout only
/// carry `file`, the last path segment.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Partition {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    pub file: String,
}

/// `tenant_id=<tenant>/table=<table>/<file>`, matched anywhere in the key.
static KEY_LAYOUT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"tenant_id=(?P<tenant>[^/]*)/table=(?P<table>[^/]*)/(?P<file>.*)")
        .expect("key layout pattern is valid")
});

impl Partition {
    pub fn from_key(key: &str) -> Self {
        match KEY_LAYOUT.captures(key) {
            Some(caps) => Self {
                tenant_id: Some(caps["tenant"].to_string()),
                table: Some(caps["table"].to_string()),
                file: caps["file"].to_string(),
            },
            None => Self {
                tenant_id: None,
                table: None,
                file: key.rsplit('/').next().unwrap_or(key).to_string(),
            },
        }
    }
}

pub struct ResolvePartition;

#[async_trait]
impl WorkflowStep for ResolvePartition {
    fn name(&self) -> &'static str {
        "resolve_partition"
    }

    async fn execute(&self, ctx: &StepContext) -> Result<Value, StepError> {
        let partition = Partition::from_key(&ctx.input.object_key);
        serde_json::to_value(partition).map_err(|err| StepError::Permanent(err.to_string()))
    }
}

/// Terminal step. Safe to repeat: the write is an upsert keyed by object key,
/// and every attribute comes from the workflow input or the logged partition.
pub struct RecordMetadata {
    client: Arc<dyn MetadataClient>,
}

impl RecordMetadata {
    pub fn new(client: Arc<dyn MetadataClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl WorkflowStep for RecordMetadata {
    fn name(&self) -> &'static str {
        "record_metadata"
    }

    async fn execute(&self, ctx: &StepContext) -> Result<Value, StepError> {
        let partition: Partition = ctx
            .outputs
            .first()
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|err| StepError::Permanent(format!("unreadable partition: {}", err)))?
            .unwrap_or_else(|| Partition::from_key(&ctx.input.object_key));

        let event = &ctx.input;
        let mut attributes = Attributes::new();
        attributes.insert("bucket".into(), json!(event.bucket));
        attributes.insert("eventType".into(), json!(event.event_type));
        attributes.insert("observedAt".into(), json!(event.observed_at));
        attributes.insert("workflowId".into(), json!(ctx.workflow_id));
        attributes.insert("file".into(), json!(partition.file));
        if let Some(tenant_id) = &partition.tenant_id {
            attributes.insert("tenantId".into(), json!(tenant_id));
        }
        if let Some(table) = &partition.table {
            attributes.insert("table".into(), json!(table));
        }

        let token = ctx.idempotency_token();
        debug!(
            workflow_id = %ctx.workflow_id,
            attempt = ctx.attempt,
            token = %token,
            "upserting object metadata"
        );
        self.client
            .upsert(UpsertRequest {
                object_key: event.object_key.clone(),
                bucket: event.bucket.clone(),
                attributes,
                idempotency_token: token.clone(),
            })
            .await
            .map_err(|err| {
                if err.is_transient() {
                    StepError::Retryable(err.to_string())
                } else {
                    StepError::Permanent(err.to_string())
                }
            })?;

        Ok(json!({ "objectKey": event.object_key, "token": token }))
    }
}

/// The ingest workflow definition, in execution order.
pub fn ingest_steps(client: Arc<dyn MetadataClient>) -> Vec<Arc<dyn WorkflowStep>> {
    vec![
        Arc::new(ResolvePartition),
        Arc::new(RecordMetadata::new(client)),
    ]
}
