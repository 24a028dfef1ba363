use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::bridge::InferenceBridge;
use crate::error::StageError;
use crate::gpu::GpuArbiter;
use crate::layout::StorageLayout;

/// Shared infrastructure handed to every node execution.
pub struct NodeServices {
    pub gpu: Arc<GpuArbiter>,
    pub bridge: Arc<InferenceBridge>,
    /// Device indexes this worker may lease.
    pub gpu_devices: Vec<u32>,
}

/// Per-execution context: where the stage lives and who is running it.
pub struct NodeContext {
    pub workflow_id: String,
    pub stage_name: String,
    pub layout: StorageLayout,
    pub services: Arc<NodeServices>,
    /// Lease holder identity of the executing worker process.
    pub holder_id: String,
}

/// Contract implemented by every node.
///
/// Implementations hold no orchestration state; everything they may touch
/// arrives through the [`NodeContext`], and their only permitted side effects
/// are writes under the workflow's shared storage during [`execute`].
///
/// [`execute`]: NodeExecutor::execute
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    /// Fully-qualified node name, unique across the system.
    fn node_name(&self) -> &str;

    /// Input fields that define this node's cache identity. An empty list
    /// opts the node out of reuse.
    fn cache_key_fields(&self) -> &[&'static str] {
        &[]
    }

    /// Output fields that must be present and non-empty on success.
    fn required_output_fields(&self) -> &[&'static str] {
        &[]
    }

    /// Optional JSON schema validated against the output mapping.
    fn output_schema(&self) -> Option<Value> {
        None
    }

    /// Child-declared error kinds that make an `InferenceFailed` retryable.
    fn retryable_child_kinds(&self) -> &[&'static str] {
        &[]
    }

    /// Per-node stage deadline, overriding the configured default.
    fn stage_deadline(&self) -> Option<Duration> {
        None
    }

    /// Node-supplied input checks, run before any side effect.
    fn validate(&self, input: &Map<String, Value>) -> Result<(), StageError>;

    /// Core logic. Produces the stage's output mapping.
    async fn execute(
        &self,
        ctx: &NodeContext,
        input: &Map<String, Value>,
    ) -> Result<Map<String, Value>, StageError>;
}

/// Convenience for node validators: a required string parameter.
pub(crate) fn require_str<'a>(
    input: &'a Map<String, Value>,
    field: &str,
) -> Result<&'a str, StageError> {
    input
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| StageError::invalid_input(format!("missing required parameter: {field}")))
}
