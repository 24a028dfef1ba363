use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tracing::warn;
use uuid::Uuid;

use crate::{
    api,
    bridge::InferenceBridge,
    broker::{BrokerWorker, RedisBroker, TaskBroker},
    cache::CacheIndex,
    config::Config,
    context::ContextStore,
    gpu::GpuArbiter,
    kv::{KvStore, RedisKvStore},
    node::{NodeRegistry, NodeRunner, NodeServices},
    nodes::{DiarizeNode, ExtractAudioNode, OptimizeNode, RebuildNode, TranscribeNode},
    observability::{Telemetry, TracingSettings},
    scheduler::WorkflowScheduler,
};

#[derive(Clone)]
pub(crate) struct AppState {
    registry: Arc<ComponentRegistry>,
}

pub struct ComponentRegistry {
    config: Arc<Config>,
    telemetry: Telemetry,
    kv: Arc<dyn KvStore>,
    context_store: Arc<ContextStore>,
    scheduler: Arc<WorkflowScheduler>,
}

impl AppState {
    pub(crate) fn new(registry: ComponentRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }

    pub(crate) fn telemetry(&self) -> &Telemetry {
        &self.registry.telemetry
    }

    pub(crate) fn scheduler(&self) -> Arc<WorkflowScheduler> {
        Arc::clone(&self.registry.scheduler)
    }

    pub(crate) fn context_store(&self) -> Arc<ContextStore> {
        Arc::clone(&self.registry.context_store)
    }

    pub(crate) fn kv(&self) -> Arc<dyn KvStore> {
        Arc::clone(&self.registry.kv)
    }

    #[allow(dead_code)]
    pub(crate) fn config(&self) -> &Config {
        &self.registry.config
    }
}

impl ComponentRegistry {
    /// Connect the stores, register the hosted nodes and start the worker
    /// pool, the lease sweeper and the scheduler.
    ///
    /// # Errors
    /// Fails when telemetry cannot initialize or the key-value store and
    /// broker are unreachable at startup.
    pub async fn build(config: Config) -> Result<Self> {
        let config = Arc::new(config);
        let telemetry = Telemetry::new(&TracingSettings {
            otlp_endpoint: config.otel_exporter_endpoint().map(ToString::to_string),
            sampling_ratio: config.otel_sampling_ratio(),
        })?;
        let metrics = telemetry.metrics_arc();

        let kv: Arc<dyn KvStore> = Arc::new(
            RedisKvStore::connect(config.context_store_address())
                .await
                .context("failed to connect the context store")?,
        );
        let context_store = Arc::new(ContextStore::new(Arc::clone(&kv)));
        let cache = Arc::new(CacheIndex::new(
            Arc::clone(&kv),
            config.cache_reuse_enabled(),
        ));

        let worker_id = format!("worker-{}", Uuid::new_v4());
        let broker: Arc<dyn TaskBroker> = Arc::new(
            RedisBroker::connect(config.broker_address(), &worker_id)
                .await
                .context("failed to connect the task broker")?,
        );

        let arbiter = Arc::new(
            GpuArbiter::new(
                Arc::clone(&kv),
                config.gpu_lease_ttl(),
                config.gpu_lease_renew_interval(),
                config.gpu_lease_acquire_max_wait(),
            )
            .with_metrics(Arc::clone(&metrics)),
        );
        let services = Arc::new(NodeServices {
            gpu: Arc::clone(&arbiter),
            bridge: Arc::new(InferenceBridge::new(config.subprocess_startup_timeout())),
            gpu_devices: config.gpu_devices().to_vec(),
        });

        let node_registry = Arc::new(build_node_registry(&config));
        let runner = Arc::new(NodeRunner::new(
            Arc::clone(&context_store),
            Arc::clone(&node_registry),
            Arc::clone(&cache),
            services,
            Arc::clone(&metrics),
            config.max_attempts_per_stage(),
            worker_id,
        ));

        let scheduler = Arc::new(WorkflowScheduler::new(
            Arc::clone(&context_store),
            Arc::clone(&broker),
            cache,
            Arc::clone(&node_registry),
            metrics,
            config.shared_storage_root().clone(),
            config.max_attempts_per_stage(),
            config.stage_deadline_default(),
            config.scheduler_poll_interval(),
        ));

        for worker_index in 0..config.worker_concurrency() {
            let worker = BrokerWorker::new(
                Arc::clone(&broker),
                Arc::clone(&runner),
                node_registry.capabilities(),
            );
            let _handle = worker.spawn(worker_index);
        }
        let _sweeper = Arc::clone(&arbiter).spawn_sweeper(config.gpu_sweep_interval());

        Ok(Self {
            config,
            telemetry,
            kv,
            context_store,
            scheduler,
        })
    }

    #[must_use]
    pub fn scheduler(&self) -> Arc<WorkflowScheduler> {
        Arc::clone(&self.scheduler)
    }

    #[must_use]
    pub fn config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }
}

/// Register executors for the nodes this worker declares capability for.
fn build_node_registry(config: &Config) -> NodeRegistry {
    let deadline = config.stage_deadline_default();
    let mut registry = NodeRegistry::new();
    for capability in config.worker_capabilities() {
        match capability.as_str() {
            "ffmpeg.extract_audio" => registry.register(Arc::new(ExtractAudioNode::new(
                config.ffmpeg_extract_cmd().clone(),
                deadline,
            ))),
            "asr.transcribe" => registry.register(Arc::new(TranscribeNode::new(
                config.asr_infer_cmd().clone(),
                deadline,
            ))),
            "pyannote.diarize" => registry.register(Arc::new(DiarizeNode::new(
                config.diarize_infer_cmd().clone(),
                deadline,
            ))),
            "subtitle.optimize" => registry.register(Arc::new(OptimizeNode::new(
                config.optimize_cmd().clone(),
                deadline,
            ))),
            "subtitle.rebuild" => registry.register(Arc::new(RebuildNode::new(
                config.rebuild_cmd().clone(),
                deadline,
            ))),
            other => warn!(node = other, "unknown worker capability, skipping"),
        }
    }
    registry
}

pub fn build_router(registry: ComponentRegistry) -> Router {
    let state = AppState::new(registry);
    api::router(state)
}
