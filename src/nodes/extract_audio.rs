use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::{push_arg, run_child};
use crate::error::StageError;
use crate::node::{NodeContext, NodeExecutor};

pub(crate) const NODE_NAME: &str = "ffmpeg.extract_audio";

/// Pull the audio track out of a source video into a mono 16 kHz WAV, the
/// shape every downstream ASR and diarization model expects.
pub struct ExtractAudioNode {
    program: PathBuf,
    deadline: Duration,
}

impl ExtractAudioNode {
    #[must_use]
    pub fn new(program: PathBuf, deadline: Duration) -> Self {
        Self { program, deadline }
    }

    fn build_args(video_path: &str, audio_path: &str) -> Vec<String> {
        let mut args = Vec::new();
        push_arg(&mut args, "video_path", video_path);
        push_arg(&mut args, "audio_path", audio_path);
        push_arg(&mut args, "sample_rate", 16000);
        push_arg(&mut args, "channels", 1);
        args
    }
}

#[async_trait]
impl NodeExecutor for ExtractAudioNode {
    fn node_name(&self) -> &str {
        NODE_NAME
    }

    fn cache_key_fields(&self) -> &[&'static str] {
        &["video_path"]
    }

    fn required_output_fields(&self) -> &[&'static str] {
        &["audio_path"]
    }

    fn validate(&self, input: &Map<String, Value>) -> Result<(), StageError> {
        crate::node::require_str(input, "video_path")?;
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &NodeContext,
        input: &Map<String, Value>,
    ) -> Result<Map<String, Value>, StageError> {
        let video_path = crate::node::require_str(input, "video_path")?;
        let audio_path = ctx
            .layout
            .artifact_path(NODE_NAME, "audio", &ctx.workflow_id, None, "wav");

        let args = Self::build_args(video_path, &audio_path.display().to_string());
        run_child(ctx, NODE_NAME, &self.program, args, self.deadline, None).await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Arc;

    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::bridge::InferenceBridge;
    use crate::gpu::GpuArbiter;
    use crate::kv::MemoryKvStore;
    use crate::layout::StorageLayout;
    use crate::node::NodeServices;

    fn node_context(storage: &TempDir) -> NodeContext {
        let kv = Arc::new(MemoryKvStore::new());
        NodeContext {
            workflow_id: "wf-A".to_string(),
            stage_name: NODE_NAME.to_string(),
            layout: StorageLayout::new(storage.path()),
            services: Arc::new(NodeServices {
                gpu: Arc::new(GpuArbiter::new(
                    kv,
                    Duration::from_secs(60),
                    Duration::from_secs(20),
                    Duration::from_secs(60),
                )),
                bridge: Arc::new(InferenceBridge::new(Duration::from_secs(5))),
                gpu_devices: vec![0],
            }),
            holder_id: "worker-test".to_string(),
        }
    }

    /// Stub extractor: echoes the requested audio path back in its report.
    fn write_stub_program(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("extract_stub.sh");
        let script = r#"#!/bin/sh
echo "extracting" >&2
audio_path=""
output_file=""
while [ $# -gt 0 ]; do
  case "$1" in
    --audio_path) audio_path="$2"; shift 2 ;;
    --output_file) output_file="$2"; shift 2 ;;
    *) shift ;;
  esac
done
printf '{"success": true, "result": {"audio_path": "%s"}, "error": null, "statistics": {"decode_seconds": 0.1}}' "$audio_path" > "$output_file"
"#;
        std::fs::write(&path, script).expect("write stub");
        let mut permissions = std::fs::metadata(&path).expect("stat").permissions();
        permissions.set_mode(0o755);
        std::fs::set_permissions(&path, permissions).expect("chmod");
        path
    }

    #[test]
    fn validate_requires_video_path() {
        let node = ExtractAudioNode::new(PathBuf::from("/usr/bin/true"), Duration::from_secs(5));
        let error = node.validate(&Map::new()).expect_err("missing video_path");
        assert!(error.message.contains("video_path"));
    }

    #[test]
    fn args_carry_the_audio_target() {
        let args = ExtractAudioNode::build_args("/share/in/a.mp4", "/share/out/audio.wav");
        assert_eq!(
            args,
            vec![
                "--video_path",
                "/share/in/a.mp4",
                "--audio_path",
                "/share/out/audio.wav",
                "--sample_rate",
                "16000",
                "--channels",
                "1",
            ]
        );
    }

    #[tokio::test]
    async fn execute_returns_the_extracted_audio_path() {
        let storage = TempDir::new().expect("tempdir");
        let program_dir = TempDir::new().expect("tempdir");
        let program = write_stub_program(&program_dir);

        let node = ExtractAudioNode::new(program, Duration::from_secs(5));
        let ctx = node_context(&storage);
        let mut input = Map::new();
        input.insert("video_path".into(), json!("/share/in/a.mp4"));

        let output = node.execute(&ctx, &input).await.expect("execute");
        let audio_path = output["audio_path"].as_str().expect("audio_path");
        assert!(audio_path.ends_with("nodes/ffmpeg.extract_audio/data/audio_wf-A.wav"));
        assert_eq!(output["statistics"]["decode_seconds"], json!(0.1));
    }
}
