/// Prometheus metric definitions.
use prometheus::{
    Counter, Gauge, Histogram, Registry, register_counter_with_registry,
    register_gauge_with_registry, register_histogram_with_registry,
};
use std::sync::Arc;

/// Metrics collector for the orchestration core.
#[derive(Debug, Clone)]
pub struct Metrics {
    // Counters
    pub workflows_submitted: Counter,
    pub workflows_completed: Counter,
    pub workflows_failed: Counter,
    pub workflows_cancelled: Counter,
    pub stages_dispatched: Counter,
    pub stages_executed: Counter,
    pub stages_failed: Counter,
    pub stages_skipped: Counter,
    pub stage_retries: Counter,
    pub cache_hits: Counter,
    pub cache_misses: Counter,
    pub gpu_leases_acquired: Counter,
    pub gpu_lease_takeovers: Counter,
    pub gpu_leases_swept: Counter,

    // Histograms
    pub stage_duration_seconds: Histogram,
    pub gpu_acquire_wait_seconds: Histogram,

    // Gauges
    pub running_stages: Gauge,
    pub gpu_wait_queue: Gauge,
}

impl Metrics {
    /// Register all collectors against the given registry.
    pub fn new(registry: Arc<Registry>) -> Result<Self, prometheus::Error> {
        Ok(Self {
            workflows_submitted: register_counter_with_registry!(
                "subflow_workflows_submitted_total",
                "Total number of workflows submitted",
                registry
            )?,
            workflows_completed: register_counter_with_registry!(
                "subflow_workflows_completed_total",
                "Total number of workflows that reached SUCCESS",
                registry
            )?,
            workflows_failed: register_counter_with_registry!(
                "subflow_workflows_failed_total",
                "Total number of workflows that reached FAILED",
                registry
            )?,
            workflows_cancelled: register_counter_with_registry!(
                "subflow_workflows_cancelled_total",
                "Total number of workflows that reached CANCELLED",
                registry
            )?,
            stages_dispatched: register_counter_with_registry!(
                "subflow_stages_dispatched_total",
                "Stage dispatches through the task broker, retries included",
                registry
            )?,
            stages_executed: register_counter_with_registry!(
                "subflow_stages_executed_total",
                "Stage executions that reached SUCCESS",
                registry
            )?,
            stages_failed: register_counter_with_registry!(
                "subflow_stages_failed_total",
                "Stage attempts that ended in a recorded failure",
                registry
            )?,
            stages_skipped: register_counter_with_registry!(
                "subflow_stages_skipped_total",
                "Optional stages skipped after a terminal failure",
                registry
            )?,
            stage_retries: register_counter_with_registry!(
                "subflow_stage_retries_total",
                "Stage attempts that failed retryably",
                registry
            )?,
            cache_hits: register_counter_with_registry!(
                "subflow_cache_hits_total",
                "Stage executions short-circuited by a cache hit",
                registry
            )?,
            cache_misses: register_counter_with_registry!(
                "subflow_cache_misses_total",
                "Cache lookups that found no reusable output",
                registry
            )?,
            gpu_leases_acquired: register_counter_with_registry!(
                "subflow_gpu_leases_acquired_total",
                "GPU leases granted",
                registry
            )?,
            gpu_lease_takeovers: register_counter_with_registry!(
                "subflow_gpu_lease_takeovers_total",
                "GPU leases granted over an expired prior holder",
                registry
            )?,
            gpu_leases_swept: register_counter_with_registry!(
                "subflow_gpu_leases_swept_total",
                "Expired GPU leases reaped by the sweeper",
                registry
            )?,
            stage_duration_seconds: register_histogram_with_registry!(
                "subflow_stage_duration_seconds",
                "Wall-clock duration of successful stage executions",
                registry
            )?,
            gpu_acquire_wait_seconds: register_histogram_with_registry!(
                "subflow_gpu_acquire_wait_seconds",
                "Time spent waiting for a GPU lease",
                registry
            )?,
            running_stages: register_gauge_with_registry!(
                "subflow_running_stages",
                "Stages currently executing in this worker",
                registry
            )?,
            gpu_wait_queue: register_gauge_with_registry!(
                "subflow_gpu_wait_queue",
                "Registered waiters for GPU device slots",
                registry
            )?,
        })
    }
}
