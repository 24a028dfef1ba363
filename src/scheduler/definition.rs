use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::context::WorkflowContext;
use crate::params::InputTemplate;

/// Declarative workflow submission: an ordered chain of node occurrences
/// with input templates. Accepted as YAML from the CLI and as JSON from the
/// control-plane API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Caller-chosen id; generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(default)]
    pub input_params: Map<String, Value>,
    pub stages: Vec<StageSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSpec {
    /// Fully-qualified node name, e.g. `ffmpeg.extract_audio`.
    pub node: String,
    /// Input template; leaves may reference prior stages or `input_params`.
    #[serde(default)]
    pub input: Value,
    /// Optional stages are skipped instead of halting the workflow.
    #[serde(default)]
    pub optional: bool,
    /// Per-stage deadline override in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_s: Option<u64>,
}

impl WorkflowDefinition {
    pub fn from_yaml(raw: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(raw)
    }

    /// Structural validation, run before anything is persisted.
    pub fn validate(&self) -> Result<(), String> {
        if self.stages.is_empty() {
            return Err("workflow has no stages".to_string());
        }
        if let Some(id) = &self.workflow_id {
            if id.is_empty() || id.contains(['/', ':', ' ']) {
                return Err(format!("workflow_id {id:?} is not a valid identifier"));
            }
        }
        let chain: Vec<String> = self.stages.iter().map(|s| s.node.clone()).collect();
        let mut sources = crate::context::unique_stage_names(&chain);
        sources.push(crate::params::INPUT_PARAMS_SOURCE.to_string());

        for spec in &self.stages {
            if spec.node.is_empty() {
                return Err("stage with empty node name".to_string());
            }
            if !spec.input.is_null() {
                InputTemplate::parse(&spec.input, &sources)
                    .map_err(|error| format!("stage {}: {}", spec.node, error.message))?;
            }
        }
        Ok(())
    }

    /// Materialize the initial context, with every stage `PENDING` and the
    /// workflow's storage directory rooted under `storage_root`.
    #[must_use]
    pub fn build_context(&self, storage_root: &Path) -> WorkflowContext {
        let workflow_id = self
            .workflow_id
            .clone()
            .unwrap_or_else(|| format!("wf-{}", Uuid::new_v4()));
        let chain: Vec<String> = self.stages.iter().map(|s| s.node.clone()).collect();

        let mut context = WorkflowContext::new(
            workflow_id.clone(),
            storage_root.join(&workflow_id),
            chain,
            self.input_params.clone(),
        );
        for (record, spec) in context.stages.iter_mut().zip(&self.stages) {
            record.input_template = spec.input.clone();
            record.optional = spec.optional;
            record.deadline_s = spec.deadline_s;
        }
        context
    }
}
