use std::sync::Arc;
use std::time::Instant;

use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::executor::{NodeContext, NodeExecutor, NodeServices};
use super::registry::NodeRegistry;
use crate::cache::{self, CacheIndex};
use crate::context::{ContextError, ContextStore, StagePatch, WorkflowContext};
use crate::error::{ErrorKind, StageError};
use crate::observability::metrics::Metrics;
use crate::params::InputTemplate;

/// Drives one stage through the fixed execution lifecycle.
///
/// The context is mutated only at the acquire, cache-graft and record steps;
/// everything in between works on in-memory snapshots. Any error raised by a
/// node's core logic is classified into the stage taxonomy at this boundary
/// and funneled through `record_failure`.
pub struct NodeRunner {
    store: Arc<ContextStore>,
    registry: Arc<NodeRegistry>,
    cache: Arc<CacheIndex>,
    services: Arc<NodeServices>,
    metrics: Arc<Metrics>,
    max_attempts_per_stage: u32,
    worker_id: String,
}

impl NodeRunner {
    #[must_use]
    pub fn new(
        store: Arc<ContextStore>,
        registry: Arc<NodeRegistry>,
        cache: Arc<CacheIndex>,
        services: Arc<NodeServices>,
        metrics: Arc<Metrics>,
        max_attempts_per_stage: u32,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            registry,
            cache,
            services,
            metrics,
            max_attempts_per_stage,
            worker_id: worker_id.into(),
        }
    }

    /// Execute one stage occurrence to a terminal outcome for this attempt.
    ///
    /// Losing the acquire race is reported as a `Conflict` without touching
    /// the stage record; every later failure is recorded on the stage before
    /// being returned.
    pub async fn execute(
        &self,
        workflow_id: &str,
        stage_name: &str,
    ) -> Result<WorkflowContext, StageError> {
        // Step 1: claim the stage. Exactly one concurrent claimant wins.
        let context = match self.store.acquire_stage(workflow_id, stage_name).await {
            Ok(context) => context,
            Err(error @ ContextError::AlreadyRunning { .. }) => {
                debug!(workflow_id, stage_name, "stage slot already taken");
                return Err(error.into());
            }
            Err(error) => return Err(error.into()),
        };
        let started = Instant::now();
        self.metrics.running_stages.inc();

        let result = self
            .run_claimed_stage(workflow_id, stage_name, &context, started)
            .await;
        self.metrics.running_stages.dec();

        match result {
            Ok(context) => Ok(context),
            Err(error) => {
                let retryable = self.is_retryable(&context, stage_name, &error);
                self.metrics.stages_failed.inc();
                if retryable {
                    self.metrics.stage_retries.inc();
                }
                warn!(
                    workflow_id,
                    stage_name,
                    kind = error.kind.as_str(),
                    retryable,
                    "stage execution failed: {}",
                    error.message
                );
                if let Err(store_error) = self
                    .store
                    .record_failure(
                        workflow_id,
                        stage_name,
                        error.clone(),
                        retryable,
                        self.max_attempts_per_stage,
                    )
                    .await
                {
                    warn!(workflow_id, stage_name, %store_error, "failed to record stage failure");
                }
                Err(error)
            }
        }
    }

    async fn run_claimed_stage(
        &self,
        workflow_id: &str,
        stage_name: &str,
        context: &WorkflowContext,
        started: Instant,
    ) -> Result<WorkflowContext, StageError> {
        let record = context
            .stage(stage_name)
            .ok_or_else(|| StageError::invalid_input(format!("unknown stage {stage_name}")))?;
        self.check_cancel(record.cancel_requested)?;

        let node = self.registry.get(&record.node).ok_or_else(|| {
            StageError::invalid_input(format!("no executor registered for node {}", record.node))
        })?;

        // Step 2: resolve the input template against the context.
        let template = InputTemplate::parse(&record.input_template, &context.reference_sources())?;
        let input = template.resolve(context)?;

        // Step 3: node-supplied validation.
        node.validate(&input)?;

        // Step 4: cache check. A matching prior output short-circuits the run.
        let cache_key = cache::cache_key(&record.node, &input, node.cache_key_fields());
        if let Some(key) = &cache_key {
            if let Some(output) = self
                .cache
                .lookup(key, node.required_output_fields())
                .await?
            {
                info!(workflow_id, stage_name, cache_key = %key, "cache hit, reusing prior output");
                self.metrics.cache_hits.inc();
                return self.record_success(workflow_id, stage_name, input, output, true, started)
                    .await;
            }
            self.metrics.cache_misses.inc();
        }

        let fresh = self.store.load(workflow_id).await?;
        let fresh_record = fresh
            .stage(stage_name)
            .ok_or_else(|| StageError::invalid_input(format!("unknown stage {stage_name}")))?;
        self.check_cancel(fresh_record.cancel_requested)?;

        // Step 5: core logic. The only step allowed side effects, and those
        // stay inside the workflow's shared storage.
        let node_ctx = NodeContext {
            workflow_id: workflow_id.to_string(),
            stage_name: stage_name.to_string(),
            layout: context.layout(),
            services: Arc::clone(&self.services),
            holder_id: format!("{}:{workflow_id}:{stage_name}", self.worker_id),
        };
        let output = node.execute(&node_ctx, &input).await?;

        // Step 6: required fields and optional schema.
        validate_output(node.as_ref(), &output)?;

        // Step 7: record the output and publish it to the cache index.
        let context = self
            .record_success(workflow_id, stage_name, input, output.clone(), false, started)
            .await?;
        if let Some(key) = &cache_key {
            self.cache.publish(key, workflow_id, &output).await;
        }
        Ok(context)
    }

    async fn record_success(
        &self,
        workflow_id: &str,
        stage_name: &str,
        input: Map<String, Value>,
        output: Map<String, Value>,
        cache_hit: bool,
        started: Instant,
    ) -> Result<WorkflowContext, StageError> {
        self.store
            .update_stage(
                workflow_id,
                stage_name,
                StagePatch {
                    input: Some(input),
                    cache_hit: Some(cache_hit),
                    ..StagePatch::default()
                },
            )
            .await?;
        let context = self
            .store
            .record_output(workflow_id, stage_name, output, Some(started.elapsed()))
            .await?;
        self.metrics.stages_executed.inc();
        self.metrics
            .stage_duration_seconds
            .observe(started.elapsed().as_secs_f64());
        info!(workflow_id, stage_name, cache_hit, "stage succeeded");
        Ok(context)
    }

    fn check_cancel(&self, cancel_requested: bool) -> Result<(), StageError> {
        if cancel_requested {
            Err(StageError::cancelled("stage cancellation requested"))
        } else {
            Ok(())
        }
    }

    fn is_retryable(
        &self,
        context: &WorkflowContext,
        stage_name: &str,
        error: &StageError,
    ) -> bool {
        if error.kind == ErrorKind::Cancelled {
            return false;
        }
        let retryable_kinds: Vec<String> = context
            .stage(stage_name)
            .and_then(|record| self.registry.get(&record.node))
            .map(|node| {
                node.retryable_child_kinds()
                    .iter()
                    .map(|kind| (*kind).to_string())
                    .collect()
            })
            .unwrap_or_default();
        error.is_retryable_for(&retryable_kinds)
    }
}

fn validate_output(node: &dyn NodeExecutor, output: &Map<String, Value>) -> Result<(), StageError> {
    if output.is_empty() {
        return Err(StageError::invalid_output(format!(
            "{} produced an empty output",
            node.node_name()
        )));
    }
    for field in node.required_output_fields() {
        let present = output.get(*field).is_some_and(cache::is_meaningful);
        if !present {
            return Err(StageError::invalid_output(format!(
                "output of {} is missing required field {field}",
                node.node_name()
            )));
        }
    }

    if let Some(schema) = node.output_schema() {
        let validator = jsonschema::validator_for(&schema).map_err(|error| {
            StageError::invalid_output(format!(
                "output schema of {} is invalid: {error}",
                node.node_name()
            ))
        })?;
        if let Err(error) = validator.validate(&Value::Object(output.clone())) {
            return Err(StageError::invalid_output(format!(
                "output of {} violates its schema: {error}",
                node.node_name()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use prometheus::Registry;
    use serde_json::json;

    use super::*;
    use crate::bridge::InferenceBridge;
    use crate::context::{StageStatus, WorkflowContext};
    use crate::gpu::GpuArbiter;
    use crate::kv::{KvStore, MemoryKvStore};

    struct CountingNode {
        name: &'static str,
        executions: Mutex<u32>,
        output: Map<String, Value>,
        fail_first: bool,
    }

    impl CountingNode {
        fn new(name: &'static str, output: &[(&str, Value)]) -> Self {
            Self {
                name,
                executions: Mutex::new(0),
                output: output
                    .iter()
                    .map(|(k, v)| ((*k).to_string(), v.clone()))
                    .collect(),
                fail_first: false,
            }
        }

        fn executions(&self) -> u32 {
            *self.executions.lock().expect("executions lock")
        }
    }

    #[async_trait]
    impl NodeExecutor for CountingNode {
        fn node_name(&self) -> &str {
            self.name
        }

        fn cache_key_fields(&self) -> &[&'static str] {
            &["video_path"]
        }

        fn required_output_fields(&self) -> &[&'static str] {
            &["audio_path"]
        }

        fn retryable_child_kinds(&self) -> &[&'static str] {
            &["cuda_oom"]
        }

        fn validate(&self, input: &Map<String, Value>) -> Result<(), StageError> {
            super::super::executor::require_str(input, "video_path")?;
            Ok(())
        }

        async fn execute(
            &self,
            _ctx: &NodeContext,
            _input: &Map<String, Value>,
        ) -> Result<Map<String, Value>, StageError> {
            let mut executions = self.executions.lock().expect("executions lock");
            *executions += 1;
            if self.fail_first && *executions == 1 {
                return Err(StageError::inference_failed("decoder crashed")
                    .with_child_kind("cuda_oom"));
            }
            Ok(self.output.clone())
        }
    }

    struct Harness {
        store: Arc<ContextStore>,
        runner: NodeRunner,
        node: Arc<CountingNode>,
    }

    fn harness(node: CountingNode, cache_enabled: bool) -> Harness {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let store = Arc::new(ContextStore::new(Arc::clone(&kv)));
        let node = Arc::new(node);

        let mut registry = NodeRegistry::new();
        registry.register(Arc::clone(&node) as Arc<dyn NodeExecutor>);

        let services = Arc::new(NodeServices {
            gpu: Arc::new(GpuArbiter::new(
                Arc::clone(&kv),
                Duration::from_secs(60),
                Duration::from_secs(20),
                Duration::from_secs(60),
            )),
            bridge: Arc::new(InferenceBridge::new(Duration::from_secs(5))),
            gpu_devices: vec![0],
        });
        let metrics =
            Arc::new(Metrics::new(Arc::new(Registry::new())).expect("metrics registry"));

        let runner = NodeRunner::new(
            Arc::clone(&store),
            Arc::new(registry),
            Arc::new(CacheIndex::new(kv, cache_enabled)),
            services,
            metrics,
            2,
            "worker-test",
        );

        Harness { store, runner, node }
    }

    async fn seed_workflow(store: &ContextStore, workflow_id: &str) {
        let mut context = WorkflowContext::new(
            workflow_id,
            format!("/tmp/subflow-test/{workflow_id}"),
            vec!["test.extract".to_string()],
            {
                let mut params = Map::new();
                params.insert("video_path".into(), json!("/share/in/a.mp4"));
                params
            },
        );
        context.stages[0].input_template = json!({"video_path": "${input_params.video_path}"});
        store.create(&context).await.expect("create");
    }

    #[tokio::test]
    async fn lifecycle_records_resolved_input_and_output() {
        let h = harness(
            CountingNode::new("test.extract", &[("audio_path", json!("/share/a.wav"))]),
            true,
        );
        seed_workflow(&h.store, "wf-A").await;

        h.runner
            .execute("wf-A", "test.extract")
            .await
            .expect("stage runs");

        let context = h.store.load("wf-A").await.expect("load");
        let record = context.stage("test.extract").expect("stage");
        assert_eq!(record.status, StageStatus::Success);
        assert_eq!(record.input["video_path"], json!("/share/in/a.mp4"));
        assert_eq!(record.output["audio_path"], json!("/share/a.wav"));
        assert_eq!(record.attempts, 1);
        assert!(!record.cache_hit);
        assert_eq!(h.node.executions(), 1);
    }

    #[tokio::test]
    async fn identical_input_hits_the_cache_across_workflows() {
        let h = harness(
            CountingNode::new("test.extract", &[("audio_path", json!("/share/a.wav"))]),
            true,
        );
        seed_workflow(&h.store, "wf-A").await;
        seed_workflow(&h.store, "wf-B").await;

        h.runner.execute("wf-A", "test.extract").await.expect("first run");
        h.runner.execute("wf-B", "test.extract").await.expect("second run");

        let context = h.store.load("wf-B").await.expect("load");
        let record = context.stage("test.extract").expect("stage");
        assert_eq!(record.status, StageStatus::Success);
        assert!(record.cache_hit);
        assert_eq!(record.output["audio_path"], json!("/share/a.wav"));
        assert_eq!(h.node.executions(), 1, "core logic must not re-run on a hit");
    }

    #[tokio::test]
    async fn kill_switch_forces_re_execution() {
        let h = harness(
            CountingNode::new("test.extract", &[("audio_path", json!("/share/a.wav"))]),
            false,
        );
        seed_workflow(&h.store, "wf-A").await;
        seed_workflow(&h.store, "wf-B").await;

        h.runner.execute("wf-A", "test.extract").await.expect("first run");
        h.runner.execute("wf-B", "test.extract").await.expect("second run");

        assert_eq!(h.node.executions(), 2);
        let context = h.store.load("wf-B").await.expect("load");
        assert!(!context.stage("test.extract").expect("stage").cache_hit);
    }

    #[tokio::test]
    async fn invalid_input_is_recorded_as_terminal_failure() {
        let h = harness(
            CountingNode::new("test.extract", &[("audio_path", json!("/share/a.wav"))]),
            true,
        );
        // No input template: resolution yields an empty map, validation fails.
        let context = WorkflowContext::new(
            "wf-A",
            "/tmp/subflow-test/wf-A",
            vec!["test.extract".to_string()],
            Map::new(),
        );
        h.store.create(&context).await.expect("create");

        let error = h
            .runner
            .execute("wf-A", "test.extract")
            .await
            .expect_err("validation fails");
        assert_eq!(error.kind, ErrorKind::InvalidInput);

        let context = h.store.load("wf-A").await.expect("load");
        let record = context.stage("test.extract").expect("stage");
        assert_eq!(record.status, StageStatus::Failed);
        assert_eq!(record.error.as_ref().expect("error").kind, ErrorKind::InvalidInput);
        assert_eq!(h.node.executions(), 0, "core logic never ran");
    }

    #[tokio::test]
    async fn retryable_child_failure_returns_stage_to_pending() {
        let mut node =
            CountingNode::new("test.extract", &[("audio_path", json!("/share/a.wav"))]);
        node.fail_first = true;
        let h = harness(node, true);
        seed_workflow(&h.store, "wf-A").await;

        let error = h
            .runner
            .execute("wf-A", "test.extract")
            .await
            .expect_err("first attempt fails");
        assert_eq!(error.kind, ErrorKind::InferenceFailed);

        let context = h.store.load("wf-A").await.expect("load");
        let record = context.stage("test.extract").expect("stage");
        assert_eq!(record.status, StageStatus::Pending, "retry budget remains");
        assert_eq!(record.attempts, 1);

        // Second attempt succeeds.
        h.runner.execute("wf-A", "test.extract").await.expect("retry");
        let context = h.store.load("wf-A").await.expect("load");
        let record = context.stage("test.extract").expect("stage");
        assert_eq!(record.status, StageStatus::Success);
        assert_eq!(record.attempts, 2);
        assert!(!record.cache_hit);
    }

    #[tokio::test]
    async fn missing_required_output_field_is_invalid_output() {
        let h = harness(CountingNode::new("test.extract", &[("other", json!("x"))]), true);
        seed_workflow(&h.store, "wf-A").await;

        let error = h
            .runner
            .execute("wf-A", "test.extract")
            .await
            .expect_err("output incomplete");
        assert_eq!(error.kind, ErrorKind::InvalidOutput);
    }

    #[tokio::test]
    async fn cancel_flag_stops_execution_before_core_logic() {
        let h = harness(
            CountingNode::new("test.extract", &[("audio_path", json!("/share/a.wav"))]),
            true,
        );
        seed_workflow(&h.store, "wf-A").await;
        h.store.request_cancel("wf-A").await.expect("cancel");

        let error = h
            .runner
            .execute("wf-A", "test.extract")
            .await
            .expect_err("cancelled");
        assert_eq!(error.kind, ErrorKind::Cancelled);
        assert_eq!(h.node.executions(), 0);
    }

    #[tokio::test]
    async fn losing_the_acquire_race_does_not_touch_the_record() {
        let h = harness(
            CountingNode::new("test.extract", &[("audio_path", json!("/share/a.wav"))]),
            true,
        );
        seed_workflow(&h.store, "wf-A").await;
        h.store
            .acquire_stage("wf-A", "test.extract")
            .await
            .expect("simulate another worker");

        let error = h
            .runner
            .execute("wf-A", "test.extract")
            .await
            .expect_err("slot taken");
        assert_eq!(error.kind, ErrorKind::Conflict);

        let context = h.store.load("wf-A").await.expect("load");
        let record = context.stage("test.extract").expect("stage");
        assert_eq!(record.status, StageStatus::Running);
        assert_eq!(record.attempts, 1, "loser must not bump attempts");
        assert!(record.error.is_none());
    }
}
