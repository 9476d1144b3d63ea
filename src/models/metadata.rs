//! Durable outcome of a completed ingest workflow.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// Attribute map carried by an upsert. Ordered so that identical input always
/// serializes to identical stored text.
pub type Attributes = BTreeMap<String, serde_json::Value>;

/// Metadata stored for one object, keyed by `object_key`.
///
/// Written by upsert only, so retrying the owning step never produces a second
/// record.
#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct MetadataRecord {
    pub object_key: String,
    pub bucket: String,
    pub attributes: Attributes,

    /// Token of the step execution that last wrote this record.
    pub idempotency_token: String,

    pub updated_at: DateTime<Utc>,
}
