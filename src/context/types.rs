use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::StageError;
use crate::layout::StorageLayout;
use crate::util::time;

/// Status of a single stage occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

impl StageStatus {
    /// Terminal states never change again.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, StageStatus::Success | StageStatus::Skipped)
    }

    /// Legal transitions form a DAG plus the retry edges back to `Pending`.
    /// No path leaves `Success` or `Skipped`.
    #[must_use]
    pub fn can_transition_to(self, next: StageStatus) -> bool {
        use StageStatus::{Failed, Pending, Running, Skipped, Success};
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Success)
                | (Pending, Skipped)
                | (Pending, Failed)
                | (Running, Success)
                | (Running, Failed)
                | (Running, Pending)
                | (Failed, Pending)
                | (Failed, Skipped)
        )
    }
}

/// Status of the whole workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Success | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }
}

/// Record of one stage occurrence within a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    /// Unique stage name within the workflow. Equal to the node name, with a
    /// `#k` suffix for repeated occurrences of the same node.
    pub name: String,
    /// Fully-qualified node name, e.g. `ffmpeg.extract_audio`.
    pub node: String,
    pub status: StageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Resolved input, written when the stage is acquired for execution.
    #[serde(default)]
    pub input: Map<String, Value>,
    /// Output produced by the node, written on success.
    #[serde(default)]
    pub output: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StageError>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub cache_hit: bool,
    /// Cooperative cancellation flag, observed between lifecycle steps.
    #[serde(default)]
    pub cancel_requested: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Raw input template as declared by the workflow definition.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub input_template: Value,
    /// Optional stages become `SKIPPED` instead of halting the workflow.
    #[serde(default)]
    pub optional: bool,
    /// Per-stage deadline override from the workflow definition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_s: Option<u64>,
}

impl StageRecord {
    #[must_use]
    pub fn new(name: impl Into<String>, node: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            node: node.into(),
            status: StageStatus::Pending,
            started_at: None,
            finished_at: None,
            input: Map::new(),
            output: Map::new(),
            error: None,
            attempts: 0,
            cache_hit: false,
            cancel_requested: false,
            duration_ms: None,
            input_template: Value::Null,
            optional: false,
            deadline_s: None,
        }
    }
}

/// Partial update merged into a [`StageRecord`] through a compare-and-set.
#[derive(Debug, Clone, Default)]
pub struct StagePatch {
    pub status: Option<StageStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub input: Option<Map<String, Value>>,
    pub output: Option<Map<String, Value>>,
    pub error: Option<StageError>,
    pub increment_attempts: bool,
    pub cache_hit: Option<bool>,
    pub cancel_requested: Option<bool>,
    pub duration_ms: Option<u64>,
}

impl StagePatch {
    #[must_use]
    pub fn status(status: StageStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

/// Persisted shared state of one workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowContext {
    pub workflow_id: String,
    pub shared_storage_path: PathBuf,
    /// Node names in declared execution order.
    pub stage_chain: Vec<String>,
    pub input_params: Map<String, Value>,
    pub stages: Vec<StageRecord>,
    pub status: WorkflowStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowContext {
    #[must_use]
    pub fn new(
        workflow_id: impl Into<String>,
        shared_storage_path: impl Into<PathBuf>,
        stage_chain: Vec<String>,
        input_params: Map<String, Value>,
    ) -> Self {
        let names = unique_stage_names(&stage_chain);
        let stages = names
            .into_iter()
            .zip(stage_chain.iter())
            .map(|(name, node)| StageRecord::new(name, node.clone()))
            .collect();
        let now = time::now();
        Self {
            workflow_id: workflow_id.into(),
            shared_storage_path: shared_storage_path.into(),
            stage_chain,
            input_params,
            stages,
            status: WorkflowStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageRecord> {
        self.stages.iter().find(|record| record.name == name)
    }

    pub(crate) fn stage_mut(&mut self, name: &str) -> Option<&mut StageRecord> {
        self.stages.iter_mut().find(|record| record.name == name)
    }

    /// The at-most-one stage currently marked `RUNNING`.
    #[must_use]
    pub fn running_stage(&self) -> Option<&StageRecord> {
        self.stages
            .iter()
            .find(|record| record.status == StageStatus::Running)
    }

    #[must_use]
    pub fn layout(&self) -> StorageLayout {
        StorageLayout::new(&self.shared_storage_path)
    }

    /// Names a parameter reference may use as its source: every stage name
    /// plus the workflow's `input_params`.
    #[must_use]
    pub fn reference_sources(&self) -> Vec<String> {
        let mut sources: Vec<String> =
            self.stages.iter().map(|record| record.name.clone()).collect();
        sources.push(crate::params::INPUT_PARAMS_SOURCE.to_string());
        sources
    }
}

/// Unique stage names for a chain: repeated node names get a positional
/// `#k` suffix starting at the second occurrence.
#[must_use]
pub fn unique_stage_names(stage_chain: &[String]) -> Vec<String> {
    let mut seen: std::collections::HashMap<&str, usize> = std::collections::HashMap::new();
    stage_chain
        .iter()
        .map(|node| {
            let count = seen.entry(node.as_str()).or_insert(0);
            *count += 1;
            if *count == 1 {
                node.clone()
            } else {
                format!("{node}#{count}")
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_nodes_get_positional_names() {
        let chain = vec![
            "ffmpeg.extract_audio".to_string(),
            "asr.transcribe".to_string(),
            "asr.transcribe".to_string(),
        ];
        assert_eq!(
            unique_stage_names(&chain),
            vec![
                "ffmpeg.extract_audio".to_string(),
                "asr.transcribe".to_string(),
                "asr.transcribe#2".to_string(),
            ]
        );
    }

    #[test]
    fn success_is_terminal() {
        assert!(!StageStatus::Success.can_transition_to(StageStatus::Running));
        assert!(!StageStatus::Success.can_transition_to(StageStatus::Pending));
        assert!(!StageStatus::Skipped.can_transition_to(StageStatus::Pending));
    }

    #[test]
    fn retry_edge_returns_to_pending() {
        assert!(StageStatus::Failed.can_transition_to(StageStatus::Pending));
        assert!(StageStatus::Running.can_transition_to(StageStatus::Pending));
    }

    #[test]
    fn new_context_starts_all_pending() {
        let ctx = WorkflowContext::new(
            "wf-A",
            "/share/workflows/wf-A",
            vec!["ffmpeg.extract_audio".to_string(), "asr.transcribe".to_string()],
            Map::new(),
        );
        assert_eq!(ctx.status, WorkflowStatus::Pending);
        assert_eq!(ctx.stages.len(), 2);
        assert!(ctx.stages.iter().all(|s| s.status == StageStatus::Pending));
        assert!(ctx.running_stage().is_none());
    }
}
