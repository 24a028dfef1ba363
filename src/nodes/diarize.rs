use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::{push_arg, run_child_with_gpu};
use crate::error::StageError;
use crate::node::{NodeContext, NodeExecutor};

pub(crate) const NODE_NAME: &str = "pyannote.diarize";

/// Speaker diarization over the extracted audio. GPU node.
pub struct DiarizeNode {
    program: PathBuf,
    deadline: Duration,
}

impl DiarizeNode {
    #[must_use]
    pub fn new(program: PathBuf, deadline: Duration) -> Self {
        Self { program, deadline }
    }

    fn build_args(audio_path: &str, data_file: &str, model_name: &str) -> Vec<String> {
        let mut args = Vec::new();
        push_arg(&mut args, "audio_path", audio_path);
        push_arg(&mut args, "data_file", data_file);
        push_arg(&mut args, "model_name", model_name);
        args
    }
}

#[async_trait]
impl NodeExecutor for DiarizeNode {
    fn node_name(&self) -> &str {
        NODE_NAME
    }

    fn cache_key_fields(&self) -> &[&'static str] {
        &["audio_path", "model_name"]
    }

    fn required_output_fields(&self) -> &[&'static str] {
        &["speaker_data_path"]
    }

    fn retryable_child_kinds(&self) -> &[&'static str] {
        &["cuda_oom", "model_load_failed"]
    }

    fn validate(&self, input: &Map<String, Value>) -> Result<(), StageError> {
        crate::node::require_str(input, "audio_path")?;
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &NodeContext,
        input: &Map<String, Value>,
    ) -> Result<Map<String, Value>, StageError> {
        let audio_path = crate::node::require_str(input, "audio_path")?;
        let model_name = input
            .get("model_name")
            .and_then(Value::as_str)
            .unwrap_or("pyannote/speaker-diarization-3.1");

        let data_file =
            ctx.layout
                .artifact_path(NODE_NAME, "speaker_data", &ctx.workflow_id, None, "json");
        let args = Self::build_args(audio_path, &data_file.display().to_string(), model_name);
        run_child_with_gpu(ctx, NODE_NAME, &self.program, args, self.deadline).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_requires_audio_path() {
        let node = DiarizeNode::new(PathBuf::from("/opt/subflow/bin/diarize"), Duration::from_secs(5));
        assert!(node.validate(&Map::new()).is_err());
    }

    #[test]
    fn args_carry_audio_and_model() {
        let args = DiarizeNode::build_args("/share/a.wav", "/share/speakers.json", "pyannote/speaker-diarization-3.1");
        assert_eq!(
            args,
            vec![
                "--audio_path",
                "/share/a.wav",
                "--data_file",
                "/share/speakers.json",
                "--model_name",
                "pyannote/speaker-diarization-3.1",
            ]
        );
    }
}
