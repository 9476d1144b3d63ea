//! Durable ingest workflow instances and their start contract.

use crate::models::event::ObjectEvent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of an [`IngestWorkflow`]. `Completed` and `Failed` are terminal.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl WorkflowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deterministic workflow identity for one `(bucket, objectKey)`.
///
/// Re-publishing the same object always yields the same id, which is what lets
/// the engine fold duplicate starts onto a single instance.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct WorkflowId(String);

impl WorkflowId {
    /// `ingest-<md5(bucket/key)>`. Hashing keeps the id bounded in length and
    /// unambiguous for keys that themselves contain separators.
    pub fn for_object(bucket: &str, object_key: &str) -> Self {
        let digest = md5::compute(format!("{}/{}", bucket, object_key));
        Self(format!("ingest-{:x}", digest))
    }

    pub fn for_event(event: &ObjectEvent) -> Self {
        Self::for_object(&event.bucket, &event.object_key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for WorkflowId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One durable unit of work per object.
#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct IngestWorkflow {
    pub workflow_id: WorkflowId,
    pub input: ObjectEvent,
    pub state: WorkflowState,

    /// Step-level retries consumed so far across all steps.
    pub attempt: u32,

    pub failure_reason: Option<String>,
    pub lease_owner: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Overall deadline; the engine fails the workflow once it is passed.
    pub deadline_at: DateTime<Utc>,
}

/// Entry of the append-only step completion log.
#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    pub step_index: u32,
    pub step_name: String,
    pub output: serde_json::Value,
    pub completed_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub workflow_id: WorkflowId,
    pub input: ObjectEvent,
}

impl StartRequest {
    pub fn for_event(input: ObjectEvent) -> Self {
        Self {
            workflow_id: WorkflowId::for_event(&input),
            input,
        }
    }
}

/// Engine answer to a [`StartRequest`]. Both `Started` and `AlreadyExists`
/// mean the work is durably accepted.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "outcome", content = "reason")]
pub enum StartOutcome {
    Started,
    AlreadyExists,
    RejectedPermanent(String),
    RejectedTransient(String),
}

impl StartOutcome {
    #[cfg(test)]
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Started | Self::AlreadyExists)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workflow_id_is_stable_per_object() {
        let a = WorkflowId::for_object("b", "k1");
        assert_eq!(a, WorkflowId::for_object("b", "k1"));
        assert_ne!(a, WorkflowId::for_object("b", "k2"));
        assert_ne!(a, WorkflowId::for_object("c", "k1"));
        assert!(a.as_str().starts_with("ingest-"));
    }

    #[test]
    fn workflow_id_does_not_collide_on_separators() {
        assert_ne!(
            WorkflowId::for_object("a-b", "c"),
            WorkflowId::for_object("a", "b-c")
        );
    }

    #[test]
    fn state_round_trips_through_column_text() {
        for state in [
            WorkflowState::Pending,
            WorkflowState::Running,
            WorkflowState::Completed,
            WorkflowState::Failed,
        ] {
            assert_eq!(WorkflowState::parse(state.as_str()), Some(state));
        }
        assert_eq!(WorkflowState::parse("paused"), None);
    }
}
