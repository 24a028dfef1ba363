use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use super::types::{StagePatch, StageStatus, WorkflowContext, WorkflowStatus};
use crate::error::{ErrorKind, StageError};
use crate::kv::{CasOutcome, KvError, KvStore};
use crate::util::retry::RetryConfig;
use crate::util::time;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("workflow {0} already exists")]
    AlreadyExists(String),
    #[error("workflow {0} not found")]
    NotFound(String),
    #[error("stage {stage} of workflow {workflow} not found")]
    StageNotFound { workflow: String, stage: String },
    #[error("stage {stage} is already running")]
    AlreadyRunning { stage: String },
    #[error("conflicting write for stage {stage}: {message}")]
    Conflict { stage: String, message: String },
    #[error("invalid status transition for stage {stage}: {from:?} -> {to:?}")]
    InvalidTransition {
        stage: String,
        from: StageStatus,
        to: StageStatus,
    },
    #[error("stored context for {workflow} could not be decoded: {message}")]
    Corrupt { workflow: String, message: String },
    #[error(transparent)]
    Store(#[from] KvError),
}

impl From<ContextError> for StageError {
    fn from(error: ContextError) -> Self {
        match &error {
            ContextError::Store(_) => StageError::store_unavailable(error.to_string()),
            ContextError::AlreadyExists(_)
            | ContextError::AlreadyRunning { .. }
            | ContextError::Conflict { .. }
            | ContextError::InvalidTransition { .. } => {
                StageError::new(ErrorKind::Conflict, error.to_string())
            }
            ContextError::NotFound(_)
            | ContextError::StageNotFound { .. }
            | ContextError::Corrupt { .. } => StageError::invalid_input(error.to_string()),
        }
    }
}

/// Persisted workflow state with atomic read-modify-write semantics.
///
/// Every mutation loads the workflow-scoped key, applies the change in memory
/// and writes it back through a version-token compare-and-set; version races
/// are retried with a short full-jitter backoff.
pub struct ContextStore {
    kv: Arc<dyn KvStore>,
    cas_retry: RetryConfig,
}

impl ContextStore {
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            cas_retry: RetryConfig::new(8, 20, 500),
        }
    }

    fn key(workflow_id: &str) -> String {
        format!("workflow:{workflow_id}:context")
    }

    fn decode(workflow_id: &str, value: &Value) -> Result<WorkflowContext, ContextError> {
        serde_json::from_value(value.clone()).map_err(|error| ContextError::Corrupt {
            workflow: workflow_id.to_string(),
            message: error.to_string(),
        })
    }

    fn encode(context: &WorkflowContext) -> Value {
        serde_json::to_value(context).unwrap_or(Value::Null)
    }

    /// Initialize a context with every stage `PENDING`.
    pub async fn create(&self, context: &WorkflowContext) -> Result<(), ContextError> {
        let key = Self::key(&context.workflow_id);
        match self
            .kv
            .set_if_version(&key, &Self::encode(context), None)
            .await?
        {
            CasOutcome::Written(_) => {
                debug!(workflow_id = %context.workflow_id, stages = context.stages.len(), "workflow context created");
                Ok(())
            }
            CasOutcome::VersionMismatch => {
                Err(ContextError::AlreadyExists(context.workflow_id.clone()))
            }
        }
    }

    /// Snapshot of the current context.
    pub async fn load(&self, workflow_id: &str) -> Result<WorkflowContext, ContextError> {
        let entry = self
            .kv
            .get(&Self::key(workflow_id))
            .await?
            .ok_or_else(|| ContextError::NotFound(workflow_id.to_string()))?;
        Self::decode(workflow_id, &entry.value)
    }

    /// Apply `mutate` to the context under a CAS loop. The closure may be
    /// invoked several times against fresh snapshots; it must be free of side
    /// effects beyond the context itself.
    async fn update<F>(&self, workflow_id: &str, mutate: F) -> Result<WorkflowContext, ContextError>
    where
        F: Fn(&mut WorkflowContext) -> Result<(), ContextError>,
    {
        let key = Self::key(workflow_id);
        for attempt in 0..self.cas_retry.max_attempts {
            let entry = self
                .kv
                .get(&key)
                .await?
                .ok_or_else(|| ContextError::NotFound(workflow_id.to_string()))?;
            let mut context = Self::decode(workflow_id, &entry.value)?;

            mutate(&mut context)?;
            context.updated_at = time::now();

            match self
                .kv
                .set_if_version(&key, &Self::encode(&context), Some(entry.version))
                .await?
            {
                CasOutcome::Written(_) => return Ok(context),
                CasOutcome::VersionMismatch => {
                    debug!(workflow_id, attempt, "context CAS lost the race, retrying");
                    tokio::time::sleep(self.cas_retry.delay_for_attempt(attempt + 1)).await;
                }
            }
        }
        Err(ContextError::Conflict {
            stage: String::new(),
            message: format!("context CAS for {workflow_id} kept losing the race"),
        })
    }

    /// Atomic merge of a stage patch. Rejects status rewinds.
    pub async fn update_stage(
        &self,
        workflow_id: &str,
        stage_name: &str,
        patch: StagePatch,
    ) -> Result<WorkflowContext, ContextError> {
        let workflow = workflow_id.to_string();
        self.update(workflow_id, move |context| {
            let record = context.stage_mut(stage_name).ok_or_else(|| {
                ContextError::StageNotFound {
                    workflow: workflow.clone(),
                    stage: stage_name.to_string(),
                }
            })?;

            if let Some(next) = patch.status {
                if next != record.status && !record.status.can_transition_to(next) {
                    return Err(ContextError::InvalidTransition {
                        stage: stage_name.to_string(),
                        from: record.status,
                        to: next,
                    });
                }
                record.status = next;
            }
            if let Some(started_at) = patch.started_at {
                record.started_at = Some(started_at);
            }
            if let Some(finished_at) = patch.finished_at {
                record.finished_at = Some(finished_at);
            }
            if let Some(input) = &patch.input {
                record.input = input.clone();
            }
            if let Some(output) = &patch.output {
                record.output = output.clone();
            }
            if let Some(error) = &patch.error {
                record.error = Some(error.clone());
            }
            if patch.increment_attempts {
                record.attempts += 1;
            }
            if let Some(cache_hit) = patch.cache_hit {
                record.cache_hit = cache_hit;
            }
            if let Some(cancel) = patch.cancel_requested {
                record.cancel_requested = cancel;
            }
            if let Some(duration_ms) = patch.duration_ms {
                record.duration_ms = Some(duration_ms);
            }
            Ok(())
        })
        .await
    }

    /// Claim a `PENDING` stage for execution. Exactly one of any set of
    /// concurrent claimants wins; the rest observe [`ContextError::AlreadyRunning`].
    pub async fn acquire_stage(
        &self,
        workflow_id: &str,
        stage_name: &str,
    ) -> Result<WorkflowContext, ContextError> {
        let workflow = workflow_id.to_string();
        self.update(workflow_id, move |context| {
            let record = context.stage_mut(stage_name).ok_or_else(|| {
                ContextError::StageNotFound {
                    workflow: workflow.clone(),
                    stage: stage_name.to_string(),
                }
            })?;
            if record.status != StageStatus::Pending {
                return Err(ContextError::AlreadyRunning {
                    stage: stage_name.to_string(),
                });
            }
            record.status = StageStatus::Running;
            record.started_at = Some(time::now());
            record.finished_at = None;
            record.attempts += 1;
            if context.status == WorkflowStatus::Pending {
                context.status = WorkflowStatus::Running;
            }
            Ok(())
        })
        .await
    }

    /// Record a successful stage output. Idempotent: a second call with an
    /// identical output is a no-op; a diverging output is a conflict.
    pub async fn record_output(
        &self,
        workflow_id: &str,
        stage_name: &str,
        output: serde_json::Map<String, Value>,
        duration: Option<Duration>,
    ) -> Result<WorkflowContext, ContextError> {
        let workflow = workflow_id.to_string();
        self.update(workflow_id, move |context| {
            let record = context.stage_mut(stage_name).ok_or_else(|| {
                ContextError::StageNotFound {
                    workflow: workflow.clone(),
                    stage: stage_name.to_string(),
                }
            })?;

            if record.status == StageStatus::Success {
                if record.output == output {
                    return Ok(());
                }
                return Err(ContextError::Conflict {
                    stage: stage_name.to_string(),
                    message: "stage already succeeded with a different output".to_string(),
                });
            }
            if !record.status.can_transition_to(StageStatus::Success) {
                return Err(ContextError::InvalidTransition {
                    stage: stage_name.to_string(),
                    from: record.status,
                    to: StageStatus::Success,
                });
            }

            record.status = StageStatus::Success;
            record.output = output.clone();
            record.finished_at = Some(time::now());
            record.error = None;
            record.duration_ms =
                duration.map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
            Ok(())
        })
        .await
    }

    /// Record a stage failure. Retryable failures with remaining budget
    /// return the stage to `PENDING`; everything else leaves it `FAILED`.
    /// The first terminal error is preserved verbatim.
    pub async fn record_failure(
        &self,
        workflow_id: &str,
        stage_name: &str,
        error: StageError,
        is_retryable: bool,
        max_attempts: u32,
    ) -> Result<WorkflowContext, ContextError> {
        let workflow = workflow_id.to_string();
        self.update(workflow_id, move |context| {
            let record = context.stage_mut(stage_name).ok_or_else(|| {
                ContextError::StageNotFound {
                    workflow: workflow.clone(),
                    stage: stage_name.to_string(),
                }
            })?;

            if record.status == StageStatus::Failed && record.error.is_some() {
                // Terminal failure already recorded; keep the original error.
                return Ok(());
            }

            let target = if is_retryable && record.attempts < max_attempts {
                StageStatus::Pending
            } else {
                StageStatus::Failed
            };
            if record.status != target && !record.status.can_transition_to(target) {
                return Err(ContextError::InvalidTransition {
                    stage: stage_name.to_string(),
                    from: record.status,
                    to: target,
                });
            }

            record.status = target;
            record.error = Some(error.clone());
            record.finished_at = Some(time::now());
            Ok(())
        })
        .await
    }

    /// Transition the workflow status. Terminal states are never left.
    pub async fn set_workflow_status(
        &self,
        workflow_id: &str,
        status: WorkflowStatus,
    ) -> Result<WorkflowContext, ContextError> {
        self.update(workflow_id, move |context| {
            if context.status.is_terminal() && context.status != status {
                return Err(ContextError::Conflict {
                    stage: String::new(),
                    message: format!(
                        "workflow already terminal as {:?}, refusing {:?}",
                        context.status, status
                    ),
                });
            }
            context.status = status;
            Ok(())
        })
        .await
    }

    /// Flag every non-terminal stage for cooperative cancellation.
    pub async fn request_cancel(&self, workflow_id: &str) -> Result<WorkflowContext, ContextError> {
        let context = self
            .update(workflow_id, |context| {
                for record in &mut context.stages {
                    if !record.status.is_terminal() {
                        record.cancel_requested = true;
                    }
                }
                Ok(())
            })
            .await?;
        warn!(workflow_id, "cancellation requested");
        Ok(context)
    }

    /// Workflow ids of every context currently persisted.
    pub async fn list_workflow_ids(&self) -> Result<Vec<String>, ContextError> {
        let keys = self.kv.list_keys("workflow:").await?;
        Ok(keys
            .into_iter()
            .filter_map(|key| {
                key.strip_prefix("workflow:")
                    .and_then(|rest| rest.strip_suffix(":context"))
                    .map(ToString::to_string)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;
    use serde_json::{json, Map};

    fn store() -> ContextStore {
        ContextStore::new(Arc::new(MemoryKvStore::new()))
    }

    fn two_stage_context() -> WorkflowContext {
        WorkflowContext::new(
            "wf-A",
            "/share/workflows/wf-A",
            vec!["ffmpeg.extract_audio".to_string(), "asr.transcribe".to_string()],
            Map::new(),
        )
    }

    fn output_of(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn create_rejects_duplicate_workflow_ids() {
        let store = store();
        store.create(&two_stage_context()).await.expect("create");

        let error = store
            .create(&two_stage_context())
            .await
            .expect_err("duplicate create should fail");
        assert!(matches!(error, ContextError::AlreadyExists(id) if id == "wf-A"));
    }

    #[tokio::test]
    async fn load_missing_workflow_is_not_found() {
        let error = store().load("wf-missing").await.expect_err("missing");
        assert!(matches!(error, ContextError::NotFound(_)));
    }

    #[tokio::test]
    async fn acquire_stage_races_have_one_winner() {
        let store = store();
        store.create(&two_stage_context()).await.expect("create");

        store
            .acquire_stage("wf-A", "ffmpeg.extract_audio")
            .await
            .expect("first claim wins");

        let error = store
            .acquire_stage("wf-A", "ffmpeg.extract_audio")
            .await
            .expect_err("second claim loses");
        assert!(matches!(error, ContextError::AlreadyRunning { .. }));

        let context = store.load("wf-A").await.expect("load");
        let record = context.stage("ffmpeg.extract_audio").expect("stage");
        assert_eq!(record.status, StageStatus::Running);
        assert_eq!(record.attempts, 1);
        assert_eq!(context.status, WorkflowStatus::Running);
    }

    #[tokio::test]
    async fn record_output_is_idempotent_and_conflicts_on_divergence() {
        let store = store();
        store.create(&two_stage_context()).await.expect("create");
        store
            .acquire_stage("wf-A", "ffmpeg.extract_audio")
            .await
            .expect("acquire");

        let output = output_of(&[("audio_path", json!("/share/a.wav"))]);
        store
            .record_output("wf-A", "ffmpeg.extract_audio", output.clone(), None)
            .await
            .expect("first record");

        // Identical output: no-op.
        store
            .record_output("wf-A", "ffmpeg.extract_audio", output, None)
            .await
            .expect("idempotent record");

        // Diverging output: conflict.
        let other = output_of(&[("audio_path", json!("/share/b.wav"))]);
        let error = store
            .record_output("wf-A", "ffmpeg.extract_audio", other, None)
            .await
            .expect_err("diverging output");
        assert!(matches!(error, ContextError::Conflict { .. }));
    }

    #[tokio::test]
    async fn success_status_never_rewinds() {
        let store = store();
        store.create(&two_stage_context()).await.expect("create");
        store
            .acquire_stage("wf-A", "ffmpeg.extract_audio")
            .await
            .expect("acquire");
        store
            .record_output(
                "wf-A",
                "ffmpeg.extract_audio",
                output_of(&[("audio_path", json!("/share/a.wav"))]),
                None,
            )
            .await
            .expect("record");

        let error = store
            .update_stage(
                "wf-A",
                "ffmpeg.extract_audio",
                StagePatch::status(StageStatus::Running),
            )
            .await
            .expect_err("rewind must be rejected");
        assert!(matches!(error, ContextError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn retryable_failure_returns_stage_to_pending() {
        let store = store();
        store.create(&two_stage_context()).await.expect("create");
        store
            .acquire_stage("wf-A", "asr.transcribe")
            .await
            .expect("acquire");

        let context = store
            .record_failure(
                "wf-A",
                "asr.transcribe",
                StageError::timeout("deadline elapsed"),
                true,
                3,
            )
            .await
            .expect("failure");
        let record = context.stage("asr.transcribe").expect("stage");
        assert_eq!(record.status, StageStatus::Pending);
        assert_eq!(record.attempts, 1);
        assert!(record.error.is_some());
    }

    #[tokio::test]
    async fn exhausted_budget_leaves_stage_failed() {
        let store = store();
        store.create(&two_stage_context()).await.expect("create");

        for _ in 0..2 {
            store
                .acquire_stage("wf-A", "asr.transcribe")
                .await
                .expect("acquire");
            store
                .record_failure(
                    "wf-A",
                    "asr.transcribe",
                    StageError::timeout("deadline elapsed"),
                    true,
                    2,
                )
                .await
                .expect("failure");
        }

        let context = store.load("wf-A").await.expect("load");
        let record = context.stage("asr.transcribe").expect("stage");
        assert_eq!(record.status, StageStatus::Failed);
        assert_eq!(record.attempts, 2);
    }

    #[tokio::test]
    async fn terminal_failure_error_is_preserved() {
        let store = store();
        store.create(&two_stage_context()).await.expect("create");
        store
            .acquire_stage("wf-A", "asr.transcribe")
            .await
            .expect("acquire");

        let first = StageError::invalid_input("missing audio_path");
        store
            .record_failure("wf-A", "asr.transcribe", first.clone(), false, 3)
            .await
            .expect("terminal failure");

        // A later report does not overwrite the original error.
        store
            .record_failure(
                "wf-A",
                "asr.transcribe",
                StageError::store_unavailable("late report"),
                false,
                3,
            )
            .await
            .expect("no-op");

        let context = store.load("wf-A").await.expect("load");
        assert_eq!(
            context.stage("asr.transcribe").expect("stage").error,
            Some(first)
        );
    }

    #[tokio::test]
    async fn cancel_flags_every_open_stage() {
        let store = store();
        store.create(&two_stage_context()).await.expect("create");
        store
            .acquire_stage("wf-A", "ffmpeg.extract_audio")
            .await
            .expect("acquire");
        store
            .record_output(
                "wf-A",
                "ffmpeg.extract_audio",
                output_of(&[("audio_path", json!("/share/a.wav"))]),
                None,
            )
            .await
            .expect("record");

        let context = store.request_cancel("wf-A").await.expect("cancel");
        assert!(
            !context
                .stage("ffmpeg.extract_audio")
                .expect("stage")
                .cancel_requested,
            "terminal stages are not flagged"
        );
        assert!(
            context
                .stage("asr.transcribe")
                .expect("stage")
                .cancel_requested
        );
    }

    #[tokio::test]
    async fn list_workflow_ids_round_trips() {
        let store = store();
        store.create(&two_stage_context()).await.expect("create");
        let ids = store.list_workflow_ids().await.expect("list");
        assert_eq!(ids, vec!["wf-A".to_string()]);
    }
}
