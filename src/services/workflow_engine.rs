//! src/services/workflow_engine.rs
//!
//! WorkflowEngine: Durable, checkpointed execution of ingest workflows.
//!
//! A workflow is an ordered list of steps. After each successful step the
//! engine appends its output to the step log; a worker that claims a workflow
//! (fresh, or after another worker's lease expired) first reads that log,
//! skips every logged step, and resumes at the first missing index with the
//! logged outputs in hand. Nothing is captured implicitly: the step log is the
//! resumption point.

use crate::{
    db::now_ms,
    models::{
        event::{EventType, ObjectEvent},
        workflow::{IngestWorkflow, StartOutcome, StartRequest, WorkflowId},
    },
    services::{
        health::WorkerHealth,
        workflow_store::{WorkflowResult, WorkflowStore},
    },
};
use async_trait::async_trait;
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{sync::Semaphore, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Failure of one step attempt.
#[derive(Debug, Error)]
pub enum StepError {
    /// Worth another attempt (I/O, backpressure, timeouts).
    #[error("{0}")]
    Retryable(String),
    /// Will fail the same way every time; fails the workflow without retries.
    #[error("{0}")]
    Permanent(String),
}

/// What a step sees when it runs.
#[derive(Clone, Debug)]
pub struct StepContext {
    pub workflow_id: WorkflowId,
    pub step_index: u32,
    pub input: ObjectEvent,

    /// Outputs of all earlier steps, from the log on replay.
    pub outputs: Vec<Value>,

    /// 1-based attempt number of this step within the current run.
    pub attempt: u32,
}

impl StepContext {
    /// Stable token for side effects that are not naturally idempotent.
    /// Identical across retries and replays of the same step.
    pub fn idempotency_token(&self) -> String {
        format!("{}:{}", self.workflow_id, self.step_index)
    }
}

#[async_trait]
pub trait WorkflowStep: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run the step. May be invoked more than once for the same context if a
    /// worker dies after the side effect but before the log append.
    async fn execute(&self, ctx: &StepContext) -> Result<Value, StepError>;
}

/// Accepts start requests. Implemented by the engine; the dispatcher only
/// depends on this seam.
#[async_trait]
pub trait WorkflowStarter: Send + Sync {
    async fn start(&self, request: StartRequest) -> StartOutcome;
}

/// Exponential backoff with a hard ceiling on attempts per step.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`: `base * 2^(attempt-1)`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exp = attempt.saturating_sub(1).min(31);
        self.backoff_base
            .saturating_mul(1u32 << exp)
            .min(self.backoff_max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub worker_id: String,
    pub retry: RetryPolicy,
    pub step_timeout: Duration,
    pub workflow_deadline: Duration,
    pub lease_duration: Duration,
    pub poll_interval: Duration,
    pub concurrency: usize,
}

/// Sent to the failure reporter exactly once per failed workflow.
#[derive(Clone, Debug)]
pub struct FailureReport {
    pub workflow_id: WorkflowId,
    pub bucket: String,
    pub object_key: String,
    pub reason: String,
}

pub trait FailureReporter: Send + Sync {
    fn report(&self, failure: &FailureReport);
}

/// Reports failed workflows to the log for operator alerting.
pub struct LogReporter;

impl FailureReporter for LogReporter {
    fn report(&self, failure: &FailureReport) {
        error!(
            workflow_id = %failure.workflow_id,
            bucket = %failure.bucket,
            object_key = %failure.object_key,
            reason = %failure.reason,
            "ingest workflow failed"
        );
    }
}

/// How one drive of a claimed workflow ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Failed(String),
    /// Lease lost or workflow cancelled underneath us; someone else owns it now.
    Abandoned,
}

enum StepFailure {
    Fatal(String),
    LeaseLost,
}

#[derive(Clone)]
pub struct WorkflowEngine {
    store: WorkflowStore,
    steps: Arc<[Arc<dyn WorkflowStep>]>,
    config: EngineConfig,
    reporter: Arc<dyn FailureReporter>,
}

impl WorkflowEngine {
    pub fn new(
        store: WorkflowStore,
        steps: Vec<Arc<dyn WorkflowStep>>,
        config: EngineConfig,
        reporter: Arc<dyn FailureReporter>,
    ) -> Self {
        Self {
            store,
            steps: steps.into(),
            config,
            reporter,
        }
    }

    pub fn store(&self) -> &WorkflowStore {
        &self.store
    }

    /// Cancel a workflow by id. It moves to `Failed` with the reason recorded;
    /// metadata already written by earlier steps stays. Returns false if the
    /// workflow had already finished.
    pub async fn cancel(&self, id: &WorkflowId, reason: &str) -> WorkflowResult<bool> {
        if self.store.get(id).await?.state.is_terminal() {
            return Ok(false);
        }
        let cancelled = self
            .store
            .fail(id, &format!("cancelled: {}", reason))
            .await?;
        if cancelled {
            info!(workflow_id = %id, reason, "workflow cancelled");
        }
        Ok(cancelled)
    }

    /// Claim one runnable workflow and drive it to an outcome. `None` when
    /// nothing is runnable.
    #[cfg(test)]
    pub async fn run_once(&self) -> WorkflowResult<Option<(WorkflowId, RunOutcome)>> {
        match self
            .store
            .claim_next(&self.config.worker_id, self.config.lease_duration)
            .await?
        {
            Some(workflow) => {
                let id = workflow.workflow_id.clone();
                let outcome = self.drive(workflow).await?;
                Ok(Some((id, outcome)))
            }
            None => Ok(None),
        }
    }

    /// Worker loop: keep up to `concurrency` workflows in flight until
    /// `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken, health: WorkerHealth) {
        let permits = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut in_flight = JoinSet::new();
        info!(worker_id = %self.config.worker_id, "workflow engine started");

        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self
                .store
                .claim_next(&self.config.worker_id, self.config.lease_duration)
                .await
            {
                Ok(Some(workflow)) => {
                    health.record_success("engine");
                    let engine = self.clone();
                    in_flight.spawn(async move {
                        let id = workflow.workflow_id.clone();
                        if let Err(err) = engine.drive(workflow).await {
                            // The lease will lapse and another pass resumes from the log.
                            warn!(workflow_id = %id, error = %err, "workflow run interrupted");
                        }
                        drop(permit);
                    });
                }
                Ok(None) => {
                    health.record_success("engine");
                    drop(permit);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
                Err(err) => {
                    error!(error = %err, "failed to claim workflow");
                    health.record_failure("engine", &err);
                    drop(permit);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
            }

            while in_flight.try_join_next().is_some() {}
        }

        info!("workflow engine draining in-flight workflows");
        while in_flight.join_next().await.is_some() {}
    }

    /// Drive a claimed workflow from its first unlogged step to a terminal
    /// state.
    #[instrument(skip(self, workflow), fields(workflow_id = %workflow.workflow_id))]
    async fn drive(&self, workflow: IngestWorkflow) -> WorkflowResult<RunOutcome> {
        let id = workflow.workflow_id.clone();
        let owner = self.config.worker_id.as_str();

        // Only a gap-free prefix of the log counts as completed.
        let mut outputs = Vec::new();
        for (expected, record) in self.store.steps(&id).await?.into_iter().enumerate() {
            if record.step_index as usize != expected {
                break;
            }
            outputs.push(record.output);
        }
        if !outputs.is_empty() {
            debug!(skipped = outputs.len(), "replaying from step log");
        }

        for index in outputs.len()..self.steps.len() {
            let step = self.steps[index].clone();

            if now_ms() >= workflow.deadline_at.timestamp_millis() {
                return self.fail(&workflow, "workflow deadline exceeded").await;
            }
            if !self
                .store
                .renew_lease(&id, owner, self.config.lease_duration)
                .await?
            {
                return Ok(RunOutcome::Abandoned);
            }

            let ctx = StepContext {
                workflow_id: id.clone(),
                step_index: index as u32,
                input: workflow.input.clone(),
                outputs: outputs.clone(),
                attempt: 1,
            };

            match self.execute_with_retry(&workflow, step.as_ref(), ctx).await? {
                Ok(output) => {
                    self.store
                        .append_step(&id, index as u32, step.name(), &output)
                        .await?;
                    debug!(step = step.name(), index, "step completed");
                    outputs.push(output);
                }
                Err(StepFailure::Fatal(reason)) => return self.fail(&workflow, &reason).await,
                Err(StepFailure::LeaseLost) => return Ok(RunOutcome::Abandoned),
            }
        }

        if self.store.complete(&id, owner).await? {
            info!(object_key = %workflow.input.object_key, "workflow completed");
            Ok(RunOutcome::Completed)
        } else {
            Ok(RunOutcome::Abandoned)
        }
    }

    /// Run one step under the retry policy, the per-step timeout and whatever
    /// is left of the workflow deadline.
    async fn execute_with_retry(
        &self,
        workflow: &IngestWorkflow,
        step: &dyn WorkflowStep,
        mut ctx: StepContext,
    ) -> WorkflowResult<Result<Value, StepFailure>> {
        let policy = &self.config.retry;
        let max_attempts = policy.max_attempts.max(1);
        let deadline_ms = workflow.deadline_at.timestamp_millis();

        for attempt in 1..=max_attempts {
            ctx.attempt = attempt;
            let remaining = deadline_ms - now_ms();
            if remaining <= 0 {
                return Ok(Err(StepFailure::Fatal("workflow deadline exceeded".into())));
            }
            let budget = self
                .config
                .step_timeout
                .min(Duration::from_millis(remaining as u64));

            let error = match tokio::time::timeout(budget, step.execute(&ctx)).await {
                Ok(Ok(output)) => return Ok(Ok(output)),
                Ok(Err(StepError::Permanent(reason))) => {
                    self.store.record_attempt(&workflow.workflow_id).await?;
                    return Ok(Err(StepFailure::Fatal(format!(
                        "step `{}` failed permanently: {}",
                        step.name(),
                        reason
                    ))));
                }
                Ok(Err(StepError::Retryable(reason))) => reason,
                Err(_) => format!("timed out after {:?}", budget),
            };

            self.store.record_attempt(&workflow.workflow_id).await?;
            warn!(step = step.name(), attempt, max_attempts, error = %error, "step attempt failed");

            if attempt == max_attempts {
                return Ok(Err(StepFailure::Fatal(format!(
                    "step `{}` failed after {} attempts: {}",
                    step.name(),
                    attempt,
                    error
                ))));
            }

            tokio::time::sleep(policy.backoff(attempt)).await;
            if !self
                .store
                .renew_lease(&workflow.workflow_id, &self.config.worker_id, self.config.lease_duration)
                .await?
            {
                return Ok(Err(StepFailure::LeaseLost));
            }
        }

        Ok(Err(StepFailure::Fatal(format!(
            "step `{}` exhausted its retries",
            step.name()
        ))))
    }

    async fn fail(&self, workflow: &IngestWorkflow, reason: &str) -> WorkflowResult<RunOutcome> {
        let id = &workflow.workflow_id;
        if !self
            .store
            .fail_owned(id, &self.config.worker_id, reason)
            .await?
        {
            return Ok(RunOutcome::Abandoned);
        }
        if self.store.mark_failure_reported(id).await? {
            self.reporter.report(&FailureReport {
                workflow_id: id.clone(),
                bucket: workflow.input.bucket.clone(),
                object_key: workflow.input.object_key.clone(),
                reason: reason.to_string(),
            });
        }
        Ok(RunOutcome::Failed(reason.to_string()))
    }
}

#[async_trait]
impl WorkflowStarter for WorkflowEngine {
    /// Idempotent start. A second start for an existing id, whatever its state,
    /// is `AlreadyExists`; only storage trouble is transient.
    async fn start(&self, request: StartRequest) -> StartOutcome {
        let input = &request.input;
        if input.bucket.is_empty() || input.object_key.is_empty() {
            return StartOutcome::RejectedPermanent("bucket and object key are required".into());
        }
        if input.event_type != EventType::Created {
            return StartOutcome::RejectedPermanent(format!(
                "unsupported event type {:?}",
                input.event_type
            ));
        }
        if request.workflow_id != WorkflowId::for_event(input) {
            return StartOutcome::RejectedPermanent(format!(
                "workflow id `{}` does not match object identity",
                request.workflow_id
            ));
        }

        match self
            .store
            .create_if_absent(&request, self.config.workflow_deadline)
            .await
        {
            Ok(true) => {
                info!(workflow_id = %request.workflow_id, object_key = %input.object_key, "workflow started");
                StartOutcome::Started
            }
            Ok(false) => {
                debug!(workflow_id = %request.workflow_id, "workflow already exists");
                StartOutcome::AlreadyExists
            }
            Err(err) if err.is_transient() => StartOutcome::RejectedTransient(err.to_string()),
            Err(err) => StartOutcome::RejectedPermanent(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::test_pool, models::workflow::WorkflowState, services::workflow_store::WorkflowError,
    };
    use chrono::Utc;
    use serde_json::json;
    use std::sync::{
        Mutex,
        atomic::{AtomicU32, Ordering},
    };

    /// Step that counts calls and fails the first `fail_times` of them.
    struct CountingStep {
        name: &'static str,
        calls: Arc<AtomicU32>,
        fail_times: u32,
        permanent: bool,
    }

    impl CountingStep {
        fn ok(name: &'static str) -> (Arc<dyn WorkflowStep>, Arc<AtomicU32>) {
            Self::failing(name, 0)
        }

        fn failing(name: &'static str, fail_times: u32) -> (Arc<dyn WorkflowStep>, Arc<AtomicU32>) {
            let calls = Arc::new(AtomicU32::new(0));
            let step: Arc<dyn WorkflowStep> = Arc::new(Self {
                name,
                calls: calls.clone(),
                fail_times,
                permanent: false,
            });
            (step, calls)
        }
    }

    #[async_trait]
    impl WorkflowStep for CountingStep {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn execute(&self, ctx: &StepContext) -> Result<Value, StepError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.fail_times {
                return Err(if self.permanent {
                    StepError::Permanent("bad input".into())
                } else {
                    StepError::Retryable(format!("transient failure {call}"))
                });
            }
            Ok(json!({ "step": self.name, "seen": ctx.outputs.len() }))
        }
    }

    struct SlowStep;

    #[async_trait]
    impl WorkflowStep for SlowStep {
        fn name(&self) -> &'static str {
            "slow"
        }

        async fn execute(&self, _ctx: &StepContext) -> Result<Value, StepError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Value::Null)
        }
    }

    #[derive(Default)]
    struct RecordingReporter {
        reports: Mutex<Vec<FailureReport>>,
    }

    impl FailureReporter for RecordingReporter {
        fn report(&self, failure: &FailureReport) {
            self.reports.lock().unwrap().push(failure.clone());
        }
    }

    fn config(worker_id: &str, max_attempts: u32) -> EngineConfig {
        EngineConfig {
            worker_id: worker_id.into(),
            retry: RetryPolicy {
                max_attempts,
                backoff_base: Duration::from_millis(1),
                backoff_max: Duration::from_millis(5),
            },
            step_timeout: Duration::from_secs(5),
            workflow_deadline: Duration::from_secs(60),
            lease_duration: Duration::from_secs(30),
            poll_interval: Duration::from_millis(10),
            concurrency: 2,
        }
    }

    fn engine(
        store: WorkflowStore,
        steps: Vec<Arc<dyn WorkflowStep>>,
        config: EngineConfig,
    ) -> (WorkflowEngine, Arc<RecordingReporter>) {
        let reporter = Arc::new(RecordingReporter::default());
        (
            WorkflowEngine::new(store, steps, config, reporter.clone()),
            reporter,
        )
    }

    fn event(key: &str) -> ObjectEvent {
        ObjectEvent::created("b", key, Utc::now())
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_millis(350),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(350));
        assert_eq!(policy.backoff(40), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn duplicate_starts_converge_on_one_instance() {
        let store = WorkflowStore::new(test_pool().await);
        let (step, _) = CountingStep::ok("only");
        let (engine, _) = engine(store.clone(), vec![step], config("w1", 3));

        let req = StartRequest::for_event(event("k1"));
        let outcomes = futures::future::join_all(
            (0..5).map(|_| engine.start(req.clone())),
        )
        .await;

        assert_eq!(outcomes.iter().filter(|o| **o == StartOutcome::Started).count(), 1);
        assert!(outcomes.iter().all(StartOutcome::is_accepted));
        assert_eq!(store.count(WorkflowState::Pending).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn start_rejects_bad_input_permanently() {
        let store = WorkflowStore::new(test_pool().await);
        let (engine, _) = engine(store, vec![], config("w1", 3));

        let mut req = StartRequest::for_event(event(""));
        assert!(matches!(engine.start(req.clone()).await, StartOutcome::RejectedPermanent(_)));

        req = StartRequest::for_event(event("k1"));
        req.workflow_id = WorkflowId::from("ingest-forged".to_string());
        assert!(matches!(engine.start(req).await, StartOutcome::RejectedPermanent(_)));
    }

    #[tokio::test]
    async fn runs_steps_in_order_and_completes() {
        let store = WorkflowStore::new(test_pool().await);
        let (first, first_calls) = CountingStep::ok("first");
        let (second, second_calls) = CountingStep::ok("second");
        let (engine, _) = engine(store.clone(), vec![first, second], config("w1", 3));

        let req = StartRequest::for_event(event("k1"));
        engine.start(req.clone()).await;
        let (id, outcome) = engine.run_once().await.unwrap().unwrap();

        assert_eq!(id, req.workflow_id);
        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(first_calls.load(Ordering::SeqCst), 1);
        assert_eq!(second_calls.load(Ordering::SeqCst), 1);

        let steps = store.steps(&id).await.unwrap();
        assert_eq!(steps[1].output, json!({ "step": "second", "seen": 1 }));
        assert!(engine.run_once().await.unwrap().is_none());

        // Starting a completed workflow again is a no-op success.
        assert_eq!(engine.start(req).await, StartOutcome::AlreadyExists);
        assert!(engine.run_once().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn always_failing_step_fails_after_exactly_max_attempts() {
        let store = WorkflowStore::new(test_pool().await);
        let (step, calls) = CountingStep::failing("flaky", u32::MAX);
        let (engine, reporter) = engine(store.clone(), vec![step], config("w1", 3));

        let req = StartRequest::for_event(event("k1"));
        engine.start(req.clone()).await;
        let (_, outcome) = engine.run_once().await.unwrap().unwrap();

        assert!(matches!(outcome, RunOutcome::Failed(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let wf = store.get(&req.workflow_id).await.unwrap();
        assert_eq!(wf.state, WorkflowState::Failed);
        assert_eq!(wf.attempt, 3);

        // No further retries, and the failure was reported once.
        assert!(engine.run_once().await.unwrap().is_none());
        assert_eq!(engine.start(req).await, StartOutcome::AlreadyExists);
        assert!(engine.run_once().await.unwrap().is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(reporter.reports.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn transient_failures_within_budget_still_complete() {
        let store = WorkflowStore::new(test_pool().await);
        let (step, calls) = CountingStep::failing("flaky", 2);
        let (engine, reporter) = engine(store.clone(), vec![step], config("w1", 3));

        engine.start(StartRequest::for_event(event("k1"))).await;
        let (_, outcome) = engine.run_once().await.unwrap().unwrap();

        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(reporter.reports.lock().unwrap().is_empty());
    }

    /// Fails until its third attempt and remembers the attempt numbers it saw.
    struct AttemptRecordingStep {
        seen: Arc<Mutex<Vec<u32>>>,
    }

    #[async_trait]
    impl WorkflowStep for AttemptRecordingStep {
        fn name(&self) -> &'static str {
            "attempts"
        }

        async fn execute(&self, ctx: &StepContext) -> Result<Value, StepError> {
            self.seen.lock().unwrap().push(ctx.attempt);
            if ctx.attempt < 3 {
                return Err(StepError::Retryable("not yet".into()));
            }
            Ok(json!({ "attempt": ctx.attempt }))
        }
    }

    #[tokio::test]
    async fn steps_see_their_attempt_number() {
        let store = WorkflowStore::new(test_pool().await);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let step: Arc<dyn WorkflowStep> = Arc::new(AttemptRecordingStep { seen: seen.clone() });
        let (engine, _) = engine(store.clone(), vec![step], config("w1", 3));

        let req = StartRequest::for_event(event("k1"));
        engine.start(req.clone()).await;
        let (_, outcome) = engine.run_once().await.unwrap().unwrap();

        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
        let steps = store.steps(&req.workflow_id).await.unwrap();
        assert_eq!(steps[0].output, json!({ "attempt": 3 }));
    }

    #[tokio::test]
    async fn start_is_transient_when_storage_is_unreachable() {
        let store = WorkflowStore::new(test_pool().await);
        let (engine, _) = engine(store.clone(), vec![], config("w1", 3));
        store.db.close().await;

        let outcome = engine.start(StartRequest::for_event(event("k1"))).await;
        assert!(matches!(outcome, StartOutcome::RejectedTransient(_)));
    }

    #[tokio::test]
    async fn permanent_step_error_skips_retries() {
        let store = WorkflowStore::new(test_pool().await);
        let calls = Arc::new(AtomicU32::new(0));
        let step: Arc<dyn WorkflowStep> = Arc::new(CountingStep {
            name: "strict",
            calls: calls.clone(),
            fail_times: u32::MAX,
            permanent: true,
        });
        let (engine, reporter) = engine(store, vec![step], config("w1", 5));

        engine.start(StartRequest::for_event(event("k1"))).await;
        let (_, outcome) = engine.run_once().await.unwrap().unwrap();

        assert!(matches!(outcome, RunOutcome::Failed(reason) if reason.contains("permanently")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(reporter.reports.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn replay_after_crash_skips_completed_steps() {
        let store = WorkflowStore::new(test_pool().await);
        let req = StartRequest::for_event(event("k1"));
        store
            .create_if_absent(&req, Duration::from_secs(60))
            .await
            .unwrap();

        // A worker claims the workflow, logs step 0, then dies mid step 1.
        store
            .claim_next("crashed-worker", Duration::from_millis(20))
            .await
            .unwrap()
            .unwrap();
        store
            .append_step(&req.workflow_id, 0, "first", &json!({ "from": "crashed-worker" }))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        let (first, first_calls) = CountingStep::ok("first");
        let (second, second_calls) = CountingStep::ok("second");
        let (engine, _) = engine(store.clone(), vec![first, second], config("w2", 3));

        let (_, outcome) = engine.run_once().await.unwrap().unwrap();
        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(first_calls.load(Ordering::SeqCst), 0);
        assert_eq!(second_calls.load(Ordering::SeqCst), 1);

        let steps = store.steps(&req.workflow_id).await.unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].output, json!({ "from": "crashed-worker" }));
    }

    #[tokio::test]
    async fn step_timeout_counts_as_failed_attempt() {
        let store = WorkflowStore::new(test_pool().await);
        let mut cfg = config("w1", 2);
        cfg.step_timeout = Duration::from_millis(20);
        let slow: Arc<dyn WorkflowStep> = Arc::new(SlowStep);
        let (engine, reporter) = engine(store.clone(), vec![slow], cfg);

        let req = StartRequest::for_event(event("k1"));
        engine.start(req.clone()).await;
        let (_, outcome) = engine.run_once().await.unwrap().unwrap();

        assert!(matches!(outcome, RunOutcome::Failed(reason) if reason.contains("timed out")));
        assert_eq!(store.get(&req.workflow_id).await.unwrap().attempt, 2);
        assert_eq!(reporter.reports.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn expired_workflow_deadline_fails_without_running() {
        let store = WorkflowStore::new(test_pool().await);
        let (step, calls) = CountingStep::ok("first");
        let mut cfg = config("w1", 3);
        cfg.workflow_deadline = Duration::from_millis(10);
        let (engine, _) = engine(store, vec![step], cfg);

        engine.start(StartRequest::for_event(event("k1"))).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        let (_, outcome) = engine.run_once().await.unwrap().unwrap();

        assert_eq!(outcome, RunOutcome::Failed("workflow deadline exceeded".into()));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancel_marks_failed_with_reason() {
        let store = WorkflowStore::new(test_pool().await);
        let (step, calls) = CountingStep::ok("first");
        let (engine, reporter) = engine(store.clone(), vec![step], config("w1", 3));

        let req = StartRequest::for_event(event("k1"));
        engine.start(req.clone()).await;
        assert!(engine.cancel(&req.workflow_id, "operator request").await.unwrap());
        assert!(!engine.cancel(&req.workflow_id, "twice").await.unwrap());

        let wf = store.get(&req.workflow_id).await.unwrap();
        assert_eq!(wf.state, WorkflowState::Failed);
        assert_eq!(wf.failure_reason.as_deref(), Some("cancelled: operator request"));
        assert!(engine.run_once().await.unwrap().is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(reporter.reports.lock().unwrap().is_empty());

        let missing = WorkflowId::for_object("b", "nope");
        assert!(matches!(
            engine.cancel(&missing, "x").await,
            Err(WorkflowError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn run_loop_drains_pending_work_and_stops_on_shutdown() {
        let store = WorkflowStore::new(test_pool().await);
        let (step, calls) = CountingStep::ok("only");
        let (engine, _) = engine(store.clone(), vec![step], config("w1", 3));
        for key in ["k1", "k2", "k3"] {
            engine.start(StartRequest::for_event(event(key))).await;
        }

        let shutdown = CancellationToken::new();
        let health = WorkerHealth::new();
        let runner = {
            let engine = engine.clone();
            let shutdown = shutdown.clone();
            let health = health.clone();
            tokio::spawn(async move { engine.run(shutdown, health).await })
        };

        for _ in 0..200 {
            if store.count(WorkflowState::Completed).await.unwrap() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();
        runner.await.unwrap();

        assert_eq!(store.count(WorkflowState::Completed).await.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(health.is_healthy());
    }
}
