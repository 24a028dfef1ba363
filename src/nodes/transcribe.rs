use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::{push_arg, push_flag, run_child_with_gpu};
use crate::error::StageError;
use crate::node::{NodeContext, NodeExecutor};

pub(crate) const NODE_NAME: &str = "asr.transcribe";

/// Speech-to-text over the extracted audio. GPU node: the worker leases a
/// device before spawning the decoder child and releases it after the exit
/// status is read.
pub struct TranscribeNode {
    program: PathBuf,
    deadline: Duration,
}

impl TranscribeNode {
    #[must_use]
    pub fn new(program: PathBuf, deadline: Duration) -> Self {
        Self { program, deadline }
    }

    fn build_args(
        audio_path: &str,
        data_file: &str,
        model_name: &str,
        language: Option<&str>,
        word_timestamps: bool,
    ) -> Vec<String> {
        let mut args = Vec::new();
        push_arg(&mut args, "audio_path", audio_path);
        push_arg(&mut args, "data_file", data_file);
        push_arg(&mut args, "model_name", model_name);
        if let Some(language) = language {
            push_arg(&mut args, "language", language);
        }
        push_flag(&mut args, "enable_word_timestamps", word_timestamps);
        args
    }
}

#[async_trait]
impl NodeExecutor for TranscribeNode {
    fn node_name(&self) -> &str {
        NODE_NAME
    }

    fn cache_key_fields(&self) -> &[&'static str] {
        &["audio_path", "model_name", "language"]
    }

    fn required_output_fields(&self) -> &[&'static str] {
        &["transcribe_data_path"]
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
            .unwrap_or("large-v3");
        let language = input
            .get("language")
            .and_then(Value::as_str)
            .filter(|l| !l.is_empty() && *l != "auto");
        let word_timestamps = input
            .get("word_timestamps")
            .and_then(Value::as_bool)
            .unwrap_or(true);

        let data_file = ctx.layout.artifact_path(
            NODE_NAME,
            "transcribe_data",
            &ctx.workflow_id,
            None,
            "json",
        );
        let args = Self::build_args(
            audio_path,
            &data_file.display().to_string(),
            model_name,
            language,
            word_timestamps,
        );
        run_child_with_gpu(ctx, NODE_NAME, &self.program, args, self.deadline).await
    }
}
