//! Shared handles for the HTTP layer and the background workers.

use crate::{
    config::AppConfig,
    services::{
        dispatcher::{Dispatcher, DispatcherConfig},
        health::WorkerHealth,
        ingest_steps::ingest_steps,
        metadata_client::{MetadataClient, SqliteMetadataClient},
        queue::{DurableQueue, QueuePolicy},
        topic::{EventPublisher, FanOutTopic, TopicPolicy},
        workflow_engine::{FailureReporter, LogReporter, WorkflowEngine},
        workflow_store::WorkflowStore,
    },
};
use sqlx::SqlitePool;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<SqlitePool>,
    pub publisher: EventPublisher,
    pub queue: DurableQueue,
    pub engine: WorkflowEngine,
    pub metadata: Arc<dyn MetadataClient>,
    pub health: WorkerHealth,
}

impl AppState {
    pub fn new(db: Arc<SqlitePool>, cfg: &AppConfig) -> Self {
        Self::with_reporter(db, cfg, Arc::new(LogReporter))
    }

    /// Wire topic -> queue -> engine over one database.
    pub fn with_reporter(
        db: Arc<SqlitePool>,
        cfg: &AppConfig,
        reporter: Arc<dyn FailureReporter>,
    ) -> Self {
        let queue = DurableQueue::new(
            db.clone(),
            cfg.queue_name.as_str(),
            QueuePolicy {
                allowed_source: cfg.topic_name.clone(),
            },
            cfg.queue.max_deliveries,
        );

        let mut topic = FanOutTopic::new(
            cfg.topic_name.as_str(),
            TopicPolicy {
                allowed_publisher: cfg.publisher_source.clone(),
            },
        );
        topic.subscribe(queue.clone());

        let metadata: Arc<dyn MetadataClient> = Arc::new(SqliteMetadataClient::new(db.clone()));
        let engine = WorkflowEngine::new(
            WorkflowStore::new(db.clone()),
            ingest_steps(metadata.clone()),
            cfg.engine.clone(),
            reporter,
        );

        Self {
            db,
            publisher: EventPublisher::new(topic),
            queue,
            engine,
            metadata,
            health: WorkerHealth::new(),
        }
    }

    pub fn dispatcher(&self, config: DispatcherConfig) -> Dispatcher {
        Dispatcher::new(self.queue.clone(), Arc::new(self.engine.clone()), config)
    }
}
