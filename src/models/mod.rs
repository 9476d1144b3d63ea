//! Core data models for the ingestion pipeline.
//!
//! These entities describe what moves through the pipeline: storage events,
//! the queue messages that carry them, the durable workflows started per
//! object, and the metadata records those workflows write. They serialize as
//! camelCase JSON via `serde`, which is also the queue wire format.

pub mod event;
pub mod message;
pub mod metadata;
pub mod workflow;
