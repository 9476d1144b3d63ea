pub mod dispatcher;
pub mod health;
pub mod ingest_steps;
pub mod metadata_client;
pub mod queue;
pub mod topic;
pub mod workflow_engine;
pub mod workflow_store;
