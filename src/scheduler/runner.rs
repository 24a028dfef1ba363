use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::definition::WorkflowDefinition;
use crate::broker::{BrokerError, TaskBroker, TaskEnvelope};
use crate::cache::{self, CacheIndex};
use crate::context::{
    ContextError, ContextStore, StagePatch, StageStatus, WorkflowContext, WorkflowStatus,
};
use crate::error::{ErrorKind, StageError};
use crate::node::NodeRegistry;
use crate::observability::metrics::Metrics;
use crate::params::InputTemplate;
use crate::util::retry::RetryConfig;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid workflow definition: {0}")]
    InvalidDefinition(String),
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Outcome of driving one stage.
enum StageOutcome {
    /// The stage is terminal; move to the next one.
    Completed,
    /// Stop the workflow with this terminal status.
    Halt(WorkflowStatus),
}

/// Result of awaiting a dispatched stage.
enum StageWait {
    /// The stage reached `SUCCESS`, `SKIPPED` or `FAILED`.
    Terminal,
    /// The attempt failed retryably and the stage is `PENDING` again.
    AttemptFailed,
    /// The per-stage deadline elapsed first.
    TimedOut,
}

/// Drives workflow chains stage by stage through the task broker.
pub struct WorkflowScheduler {
    store: Arc<ContextStore>,
    broker: Arc<dyn TaskBroker>,
    cache: Arc<CacheIndex>,
    registry: Arc<NodeRegistry>,
    metrics: Arc<Metrics>,
    storage_root: PathBuf,
    max_attempts_per_stage: u32,
    default_stage_deadline: Duration,
    poll_interval: Duration,
    redispatch_backoff: RetryConfig,
    /// Workflow ids this process is currently driving, to keep the resume
    /// daemon from double-driving them.
    driving: Mutex<HashSet<String>>,
}

impl WorkflowScheduler {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        store: Arc<ContextStore>,
        broker: Arc<dyn TaskBroker>,
        cache: Arc<CacheIndex>,
        registry: Arc<NodeRegistry>,
        metrics: Arc<Metrics>,
        storage_root: PathBuf,
        max_attempts_per_stage: u32,
        default_stage_deadline: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            broker,
            cache,
            registry,
            metrics,
            storage_root,
            max_attempts_per_stage,
            default_stage_deadline,
            poll_interval,
            redispatch_backoff: RetryConfig::new(usize::MAX, 250, 5000),
            driving: Mutex::new(HashSet::new()),
        }
    }

    pub fn store(&self) -> &Arc<ContextStore> {
        &self.store
    }

    /// Validate and persist a submission. The returned context is the
    /// initial snapshot; driving starts separately via [`spawn_run`].
    ///
    /// [`spawn_run`]: WorkflowScheduler::spawn_run
    pub async fn submit(
        &self,
        definition: &WorkflowDefinition,
    ) -> Result<WorkflowContext, SchedulerError> {
        definition
            .validate()
            .map_err(SchedulerError::InvalidDefinition)?;
        let context = definition.build_context(&self.storage_root);
        self.store.create(&context).await?;
        self.metrics.workflows_submitted.inc();
        info!(
            workflow_id = %context.workflow_id,
            stages = context.stages.len(),
            "workflow submitted"
        );
        Ok(context)
    }

    /// Drive the workflow in a background task. A workflow already being
    /// driven by this process is left alone.
    pub fn spawn_run(self: Arc<Self>, workflow_id: String) -> JoinHandle<()> {
        let scheduler = self;
        tokio::spawn(async move {
            if !scheduler.begin_driving(&workflow_id) {
                debug!(%workflow_id, "workflow already driven by this process");
                return;
            }
            let result = scheduler.run(&workflow_id).await;
            scheduler.end_driving(&workflow_id);
            match result {
                Ok(status) => info!(%workflow_id, ?status, "workflow finished"),
                Err(scheduler_error) => {
                    error!(%workflow_id, error = %scheduler_error, "workflow driver failed");
                }
            }
        })
    }

    /// Iterate the stage chain to a terminal workflow status.
    pub async fn run(&self, workflow_id: &str) -> Result<WorkflowStatus, SchedulerError> {
        let context = self.store.load(workflow_id).await?;
        if context.status.is_terminal() {
            return Ok(context.status);
        }
        if context.status == WorkflowStatus::Pending {
            self.store
                .set_workflow_status(workflow_id, WorkflowStatus::Running)
                .await?;
        }

        let stage_names: Vec<String> = context
            .stages
            .iter()
            .map(|record| record.name.clone())
            .collect();

        for stage_name in &stage_names {
            match self.drive_stage(workflow_id, stage_name).await? {
                StageOutcome::Completed => {}
                StageOutcome::Halt(status) => {
                    self.finalize(workflow_id, status).await;
                    return Ok(status);
                }
            }
        }

        self.finalize(workflow_id, WorkflowStatus::Success).await;
        Ok(WorkflowStatus::Success)
    }

    /// Ask the workflow to stop at the next cooperative checkpoint.
    pub async fn cancel(&self, workflow_id: &str) -> Result<(), SchedulerError> {
        self.store.request_cancel(workflow_id).await?;
        Ok(())
    }

    async fn drive_stage(
        &self,
        workflow_id: &str,
        stage_name: &str,
    ) -> Result<StageOutcome, SchedulerError> {
        loop {
            let context = self.store.load(workflow_id).await?;
            let Some(record) = context.stage(stage_name) else {
                return Ok(StageOutcome::Halt(WorkflowStatus::Failed));
            };

            match record.status {
                StageStatus::Success | StageStatus::Skipped => {
                    return Ok(StageOutcome::Completed);
                }
                StageStatus::Failed => {
                    let kind = record.error.as_ref().map(|e| e.kind);
                    if kind == Some(ErrorKind::Cancelled) {
                        return Ok(StageOutcome::Halt(WorkflowStatus::Cancelled));
                    }
                    if record.optional {
                        warn!(workflow_id, stage_name, "optional stage failed, skipping");
                        self.store
                            .update_stage(
                                workflow_id,
                                stage_name,
                                StagePatch::status(StageStatus::Skipped),
                            )
                            .await?;
                        self.metrics.stages_skipped.inc();
                        return Ok(StageOutcome::Completed);
                    }
                    return Ok(StageOutcome::Halt(WorkflowStatus::Failed));
                }
                StageStatus::Pending => {
                    if record.cancel_requested {
                        self.store
                            .record_failure(
                                workflow_id,
                                stage_name,
                                StageError::cancelled("workflow cancelled before dispatch"),
                                false,
                                self.max_attempts_per_stage,
                            )
                            .await?;
                        continue;
                    }

                    // Reuse a prior run's output when the cache key matches.
                    if record.attempts == 0 && self.try_graft(&context, stage_name).await {
                        continue;
                    }

                    let baseline_attempts = record.attempts;
                    let deadline = self.stage_deadline(&context, stage_name);
                    self.dispatch(&context, stage_name, baseline_attempts + 1)
                        .await?;

                    match self
                        .await_stage(workflow_id, stage_name, baseline_attempts, deadline)
                        .await?
                    {
                        StageWait::Terminal => {}
                        StageWait::AttemptFailed => {
                            let delay = self
                                .redispatch_backoff
                                .delay_for_attempt(baseline_attempts as usize + 1);
                            debug!(
                                workflow_id,
                                stage_name,
                                delay_ms = delay.as_millis() as u64,
                                "stage attempt failed retryably, backing off before re-dispatch"
                            );
                            sleep(delay).await;
                        }
                        StageWait::TimedOut => {
                            self.handle_timeout(workflow_id, stage_name, deadline).await?;
                        }
                    }
                }
                StageStatus::Running => {
                    // A worker (possibly from a previous driver) holds the
                    // stage; await it under the same deadline rules.
                    let deadline = self.stage_deadline(&context, stage_name);
                    match self
                        .await_stage(
                            workflow_id,
                            stage_name,
                            record.attempts.saturating_sub(1),
                            deadline,
                        )
                        .await?
                    {
                        StageWait::Terminal | StageWait::AttemptFailed => {}
                        StageWait::TimedOut => {
                            self.handle_timeout(workflow_id, stage_name, deadline).await?;
                        }
                    }
                }
            }
        }
    }

    async fn dispatch(
        &self,
        context: &WorkflowContext,
        stage_name: &str,
        attempt: u32,
    ) -> Result<(), SchedulerError> {
        let node_name = context
            .stage(stage_name)
            .map(|record| record.node.clone())
            .unwrap_or_default();
        self.broker
            .publish(&TaskEnvelope {
                node_name,
                workflow_id: context.workflow_id.clone(),
                stage_name: stage_name.to_string(),
                attempt,
            })
            .await?;
        self.metrics.stages_dispatched.inc();
        debug!(workflow_id = %context.workflow_id, stage_name, attempt, "stage dispatched");
        Ok(())
    }

    async fn await_stage(
        &self,
        workflow_id: &str,
        stage_name: &str,
        baseline_attempts: u32,
        deadline: Duration,
    ) -> Result<StageWait, SchedulerError> {
        let started = Instant::now();
        loop {
            let context = self.store.load(workflow_id).await?;
            let Some(record) = context.stage(stage_name) else {
                return Ok(StageWait::Terminal);
            };

            match record.status {
                StageStatus::Success | StageStatus::Skipped | StageStatus::Failed => {
                    return Ok(StageWait::Terminal);
                }
                StageStatus::Pending if record.attempts > baseline_attempts => {
                    return Ok(StageWait::AttemptFailed);
                }
                StageStatus::Pending | StageStatus::Running => {
                    if started.elapsed() >= deadline {
                        return Ok(StageWait::TimedOut);
                    }
                    sleep(self.poll_interval).await;
                }
            }
        }
    }

    async fn handle_timeout(
        &self,
        workflow_id: &str,
        stage_name: &str,
        deadline: Duration,
    ) -> Result<(), SchedulerError> {
        warn!(workflow_id, stage_name, deadline_s = deadline.as_secs(), "stage deadline exceeded");

        // Flag the possibly-stale worker first so it aborts at its next
        // checkpoint, then record the timeout.
        let _ = self
            .store
            .update_stage(
                workflow_id,
                stage_name,
                StagePatch {
                    cancel_requested: Some(true),
                    ..StagePatch::default()
                },
            )
            .await;
        self.store
            .record_failure(
                workflow_id,
                stage_name,
                StageError::timeout(format!(
                    "stage exceeded its {}s deadline",
                    deadline.as_secs()
                )),
                true,
                self.max_attempts_per_stage,
            )
            .await?;

        // When budget remains the stage is PENDING again; clear the flag so
        // the retry is not cancelled on arrival.
        let context = self.store.load(workflow_id).await?;
        if context
            .stage(stage_name)
            .is_some_and(|record| record.status == StageStatus::Pending)
        {
            let _ = self
                .store
                .update_stage(
                    workflow_id,
                    stage_name,
                    StagePatch {
                        cancel_requested: Some(false),
                        ..StagePatch::default()
                    },
                )
                .await;
        }
        Ok(())
    }

    /// Cross-run reuse: graft a cached output into this context and move the
    /// stage straight to `SUCCESS` with `cache_hit` set. No side effects are
    /// re-performed.
    async fn try_graft(&self, context: &WorkflowContext, stage_name: &str) -> bool {
        let Some(record) = context.stage(stage_name) else {
            return false;
        };
        let Some(node) = self.registry.get(&record.node) else {
            return false;
        };
        if node.cache_key_fields().is_empty() {
            return false;
        }

        let Ok(template) = InputTemplate::parse(&record.input_template, &context.reference_sources())
        else {
            return false;
        };
        let Ok(input) = template.resolve(context) else {
            return false;
        };
        let Some(key) = cache::cache_key(&record.node, &input, node.cache_key_fields()) else {
            return false;
        };
        let Ok(Some(output)) = self.cache.lookup(&key, node.required_output_fields()).await
        else {
            return false;
        };

        let graft = async {
            self.store
                .update_stage(
                    &context.workflow_id,
                    stage_name,
                    StagePatch {
                        input: Some(input),
                        cache_hit: Some(true),
                        ..StagePatch::default()
                    },
                )
                .await?;
            self.store
                .record_output(&context.workflow_id, stage_name, output, None)
                .await
        };
        match graft.await {
            Ok(_) => {
                info!(workflow_id = %context.workflow_id, stage_name, cache_key = %key, "grafted cached output");
                self.metrics.cache_hits.inc();
                true
            }
            Err(context_error) => {
                warn!(workflow_id = %context.workflow_id, stage_name, error = %context_error, "cache graft failed, dispatching normally");
                false
            }
        }
    }

    fn stage_deadline(&self, context: &WorkflowContext, stage_name: &str) -> Duration {
        let record = context.stage(stage_name);
        if let Some(seconds) = record.and_then(|r| r.deadline_s) {
            return Duration::from_secs(seconds);
        }
        record
            .and_then(|r| self.registry.get(&r.node))
            .and_then(|node| node.stage_deadline())
            .unwrap_or(self.default_stage_deadline)
    }

    async fn finalize(&self, workflow_id: &str, status: WorkflowStatus) {
        if let Err(context_error) = self.store.set_workflow_status(workflow_id, status).await {
            warn!(workflow_id, error = %context_error, "failed to persist terminal workflow status");
        }
        match status {
            WorkflowStatus::Success => self.metrics.workflows_completed.inc(),
            WorkflowStatus::Failed => self.metrics.workflows_failed.inc(),
            WorkflowStatus::Cancelled => self.metrics.workflows_cancelled.inc(),
            WorkflowStatus::Pending | WorkflowStatus::Running => {}
        }
        self.dump_context(workflow_id).await;
        info!(workflow_id, ?status, "workflow finalized");
    }

    /// Best-effort `context.json` dump for post-mortem debugging.
    async fn dump_context(&self, workflow_id: &str) {
        let Ok(context) = self.store.load(workflow_id).await else {
            return;
        };
        let path = context.layout().context_dump_path();
        let Ok(raw) = serde_json::to_string_pretty(&context) else {
            return;
        };
        if let Some(parent) = path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        if let Err(io_error) = tokio::fs::write(&path, raw).await {
            debug!(workflow_id, error = %io_error, "context dump skipped");
        }
    }

    fn begin_driving(&self, workflow_id: &str) -> bool {
        self.driving
            .lock()
            .expect("driving mutex")
            .insert(workflow_id.to_string())
    }

    fn end_driving(&self, workflow_id: &str) {
        self.driving.lock().expect("driving mutex").remove(workflow_id);
    }

    /// Whether this process currently drives the workflow.
    pub(crate) fn is_driving(&self, workflow_id: &str) -> bool {
        self.driving
            .lock()
            .expect("driving mutex")
            .contains(workflow_id)
    }
}
