//! src/services/dispatcher.rs
//!
//! Dispatcher: Bridges at-least-once queue delivery to idempotent workflow
//! starts. A message is deleted once the engine has durably accepted its
//! workflow (started, or already there), not once the workflow finishes. A
//! worker crashing between start and delete therefore only causes a
//! redelivery into a start call that answers `AlreadyExists`.

use crate::{
    models::{
        event::{EventType, NotificationEnvelope},
        message::NotificationMessage,
        workflow::{StartOutcome, StartRequest},
    },
    services::{health::WorkerHealth, queue::DurableQueue, workflow_engine::WorkflowStarter},
};
use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::{sync::Semaphore, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    /// Most messages requested per receive call.
    pub max_messages: usize,

    /// In-flight ceiling for this worker.
    pub concurrency: usize,

    pub visibility_timeout: Duration,

    /// How often visibility is extended while a start call is pending.
    pub heartbeat_interval: Duration,

    /// Upper bound on one hand-off; exceeding it is treated as transient.
    pub handle_timeout: Duration,

    /// Sleep between polls that came back empty.
    pub poll_interval: Duration,
}

/// What happened to one message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Workflow accepted and message deleted.
    Acknowledged(StartOutcome),
    /// Not an object-created event; deleted without starting anything.
    Skipped,
    /// Payload could never succeed; moved to the dead-letter sink.
    DeadLettered(String),
    /// Left in the queue for redelivery after the visibility deadline.
    Retry(String),
}

#[derive(Clone)]
pub struct Dispatcher {
    queue: DurableQueue,
    starter: Arc<dyn WorkflowStarter>,
    config: DispatcherConfig,
    permits: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
}

impl Dispatcher {
    pub fn new(
        queue: DurableQueue,
        starter: Arc<dyn WorkflowStarter>,
        config: DispatcherConfig,
    ) -> Self {
        let ceiling = config.concurrency.max(1);
        Self {
            queue,
            starter,
            config,
            permits: Arc::new(Semaphore::new(ceiling)),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Messages currently held by this worker.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Poll loop. Never holds more than `concurrency` messages: each receive
    /// asks only for as many messages as there are free permits.
    pub async fn run(&self, shutdown: CancellationToken, health: WorkerHealth) {
        let mut tasks = JoinSet::new();
        info!(
            queue = %self.queue.name(),
            concurrency = self.config.concurrency,
            "dispatcher started"
        );

        loop {
            // Wait for at least one free slot before polling.
            let first = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let mut permits = vec![first];
            let wanted = self.config.max_messages.max(1);
            while permits.len() < wanted {
                match self.permits.clone().try_acquire_owned() {
                    Ok(permit) => permits.push(permit),
                    Err(_) => break,
                }
            }

            let batch = match self
                .queue
                .receive(permits.len(), self.config.visibility_timeout)
                .await
            {
                Ok(batch) => {
                    health.record_success("queue");
                    batch
                }
                Err(err) => {
                    error!(error = %err, "failed to receive from queue");
                    health.record_failure("queue", &err);
                    drop(permits);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                    continue;
                }
            };

            if batch.is_empty() {
                drop(permits);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
                continue;
            }

            // Extra permits beyond the batch size go back to the pool.
            permits.truncate(batch.len());
            for (message, permit) in batch.into_iter().zip(permits) {
                let dispatcher = self.clone();
                let health = health.clone();
                self.in_flight.fetch_add(1, Ordering::SeqCst);
                tasks.spawn(async move {
                    dispatcher.handle(message, &health).await;
                    dispatcher.in_flight.fetch_sub(1, Ordering::SeqCst);
                    drop(permit);
                });
            }

            while tasks.try_join_next().is_some() {}
        }

        info!(in_flight = self.in_flight(), "dispatcher draining in-flight messages");
        while tasks.join_next().await.is_some() {}
    }

    /// Process one received message to a [`Disposition`], keeping its
    /// visibility extended until the hand-off settles.
    #[instrument(
        skip(self, message, health),
        fields(message_id = %message.message_id, delivery_count = message.delivery_count)
    )]
    pub async fn handle(&self, message: NotificationMessage, health: &WorkerHealth) -> Disposition {
        let work = tokio::time::timeout(self.config.handle_timeout, self.hand_off(&message));
        tokio::pin!(work);

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.tick().await;

        let disposition = loop {
            tokio::select! {
                result = &mut work => {
                    break match result {
                        Ok(disposition) => disposition,
                        Err(_) => Disposition::Retry(format!(
                            "hand-off exceeded {:?}",
                            self.config.handle_timeout
                        )),
                    };
                }
                _ = heartbeat.tick() => {
                    if let Err(err) = self
                        .queue
                        .extend_visibility(&message.message_id, self.config.visibility_timeout)
                        .await
                    {
                        warn!(error = %err, "failed to extend visibility");
                    }
                }
            }
        };

        self.settle(&message, disposition, health).await
    }

    /// Decode and start; no queue side effects.
    async fn hand_off(&self, message: &NotificationMessage) -> Disposition {
        let envelope: NotificationEnvelope = match serde_json::from_str(&message.body) {
            Ok(envelope) => envelope,
            Err(err) => return Disposition::DeadLettered(format!("malformed payload: {}", err)),
        };

        if envelope.event_type != EventType::Created {
            return Disposition::Skipped;
        }

        let request = StartRequest::for_event(envelope.into_event());
        debug!(workflow_id = %request.workflow_id, "starting workflow");

        match self.starter.start(request).await {
            outcome @ (StartOutcome::Started | StartOutcome::AlreadyExists) => {
                Disposition::Acknowledged(outcome)
            }
            StartOutcome::RejectedPermanent(reason) => {
                Disposition::DeadLettered(format!("workflow start rejected: {}", reason))
            }
            StartOutcome::RejectedTransient(reason) => Disposition::Retry(reason),
        }
    }

    /// Apply the queue side of a disposition.
    async fn settle(
        &self,
        message: &NotificationMessage,
        disposition: Disposition,
        health: &WorkerHealth,
    ) -> Disposition {
        let result = match &disposition {
            Disposition::Acknowledged(outcome) => {
                debug!(?outcome, "workflow accepted, deleting message");
                self.queue.delete(&message.message_id).await.map(|_| ())
            }
            Disposition::Skipped => {
                debug!("ignoring non-create event");
                self.queue.delete(&message.message_id).await.map(|_| ())
            }
            Disposition::DeadLettered(reason) => {
                error!(reason = %reason, "unprocessable message");
                self.queue.dead_letter(message, reason).await
            }
            Disposition::Retry(reason) => {
                warn!(reason = %reason, "workflow start failed transiently, leaving for redelivery");
                health.record_failure("engine", reason);
                self.queue.record_error(&message.message_id, reason).await
            }
        };

        if let Err(err) = result {
            // The message keeps its lease and will come back; nothing is lost.
            warn!(error = %err, "failed to settle message");
            if err.is_transient() {
                health.record_failure("queue", &err);
            }
        } else if !matches!(disposition, Disposition::Retry(_)) {
            health.record_success("engine");
        }

        disposition
    }
}
