use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::{push_arg, run_child};
use crate::error::StageError;
use crate::node::{NodeContext, NodeExecutor};

pub(crate) const NODE_NAME: &str = "subtitle.optimize";

/// Text optimization and correction over the raw transcription: punctuation
/// repair, segment merging and LLM-backed wording fixes, all owned by the
/// external optimizer command. CPU node.
pub struct OptimizeNode {
    program: PathBuf,
    deadline: Duration,
}

impl OptimizeNode {
    #[must_use]
    pub fn new(program: PathBuf, deadline: Duration) -> Self {
        Self { program, deadline }
    }

    fn build_args(transcribe_data_path: &str, data_file: &str, prompt_version: &str) -> Vec<String> {
        let mut args = Vec::new();
        push_arg(&mut args, "transcribe_data_path", transcribe_data_path);
        push_arg(&mut args, "data_file", data_file);
        push_arg(&mut args, "prompt_version", prompt_version);
        args
    }
}

#[async_trait]
impl NodeExecutor for OptimizeNode {
    fn node_name(&self) -> &str {
        NODE_NAME
    }

    fn cache_key_fields(&self) -> &[&'static str] {
        &["transcribe_data_path", "prompt_version"]
    }

    fn required_output_fields(&self) -> &[&'static str] {
        &["optimized_data_path"]
    }

    fn validate(&self, input: &Map<String, Value>) -> Result<(), StageError> {
        crate::node::require_str(input, "transcribe_data_path")?;
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &NodeContext,
        input: &Map<String, Value>,
    ) -> Result<Map<String, Value>, StageError> {
        let transcribe_data_path = crate::node::require_str(input, "transcribe_data_path")?;
        let prompt_version = input
            .get("prompt_version")
            .and_then(Value::as_str)
            .unwrap_or("subtitle-opt-v1");

        let data_file =
            ctx.layout
                .artifact_path(NODE_NAME, "optimized_data", &ctx.workflow_id, None, "json");
        let args = Self::build_args(
            transcribe_data_path,
            &data_file.display().to_string(),
            prompt_version,
        );
        run_child(ctx, NODE_NAME, &self.program, args, self.deadline, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_requires_transcribe_data_path() {
        let node = OptimizeNode::new(PathBuf::from("/opt/subflow/bin/optimize"), Duration::from_secs(5));
        assert!(node.validate(&Map::new()).is_err());
    }

    #[test]
    fn prompt_version_is_part_of_the_args() {
        let args = OptimizeNode::build_args("/share/t.json", "/share/o.json", "subtitle-opt-v2");
        assert!(args.windows(2).any(|w| w == ["--prompt_version", "subtitle-opt-v2"]));
    }
}
