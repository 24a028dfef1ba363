use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::{push_arg, run_child};
use crate::error::StageError;
use crate::node::{NodeContext, NodeExecutor};

pub(crate) const NODE_NAME: &str = "subtitle.rebuild";

/// Rebuild final subtitle files from the optimized transcription and the
/// speaker timeline: merge by speaker, then emit one file per requested
/// format. The concrete emitters live in the external rebuild command.
pub struct RebuildNode {
    program: PathBuf,
    deadline: Duration,
}

impl RebuildNode {
    #[must_use]
    pub fn new(program: PathBuf, deadline: Duration) -> Self {
        Self { program, deadline }
    }

    fn build_args(
        optimized_data_path: &str,
        speaker_data_path: Option<&str>,
        data_dir: &str,
        formats: &[String],
    ) -> Vec<String> {
        let mut args = Vec::new();
        push_arg(&mut args, "optimized_data_path", optimized_data_path);
        if let Some(speaker_data_path) = speaker_data_path {
            push_arg(&mut args, "speaker_data_path", speaker_data_path);
        }
        push_arg(&mut args, "data_dir", data_dir);
        push_arg(&mut args, "formats", formats.join(","));
        args
    }
}

#[async_trait]
impl NodeExecutor for RebuildNode {
    fn node_name(&self) -> &str {
        NODE_NAME
    }

    fn cache_key_fields(&self) -> &[&'static str] {
        &["optimized_data_path", "speaker_data_path", "formats"]
    }

    fn required_output_fields(&self) -> &[&'static str] {
        &["subtitle_paths"]
    }

    fn validate(&self, input: &Map<String, Value>) -> Result<(), StageError> {
        crate::node::require_str(input, "optimized_data_path")?;
        if let Some(formats) = input.get("formats") {
            let valid = formats
                .as_array()
                .is_some_and(|list| list.iter().all(|f| f.as_str().is_some()));
            if !valid {
                return Err(StageError::invalid_input(
                    "formats must be a list of strings",
                ));
            }
        }
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &NodeContext,
        input: &Map<String, Value>,
    ) -> Result<Map<String, Value>, StageError> {
        let optimized_data_path = crate::node::require_str(input, "optimized_data_path")?;
        let speaker_data_path = input
            .get("speaker_data_path")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty());
        let formats: Vec<String> = input
            .get("formats")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(Value::as_str)
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_else(|| vec!["srt".to_string()]);

        let data_dir = ctx.layout.node_data_dir(NODE_NAME);
        let args = Self::build_args(
            optimized_data_path,
            speaker_data_path,
            &data_dir.display().to_string(),
            &formats,
        );
        run_child(ctx, NODE_NAME, &self.program, args, self.deadline, None).await
    }
}
