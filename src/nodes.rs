//! Built-in node set.
//!
//! The pipeline's worker services — audio extraction, ASR transcription,
//! speaker diarization, subtitle optimization and subtitle rebuild — appear
//! here as thin [`NodeExecutor`] adapters. Each declares its contract (cache
//! key fields, required outputs, retryable child kinds) and delegates the
//! actual media and inference work to an external command through the
//! subprocess bridge; the inference internals stay outside the core.
//!
//! [`NodeExecutor`]: crate::node::NodeExecutor

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::warn;

use crate::bridge::InferenceLaunch;
use crate::error::StageError;
use crate::gpu::GpuError;
use crate::node::NodeContext;

mod diarize;
mod extract_audio;
mod optimize;
mod rebuild;
mod transcribe;

pub use diarize::DiarizeNode;
pub use extract_audio::ExtractAudioNode;
pub use optimize::OptimizeNode;
pub use rebuild::RebuildNode;
pub use transcribe::TranscribeNode;

/// Run one child command and turn its report into a stage output mapping.
///
/// The report's `result` object becomes the output; `statistics` rides along
/// under its own key when present.
pub(crate) async fn run_child(
    ctx: &NodeContext,
    node_name: &str,
    program: &Path,
    args: Vec<String>,
    deadline: Duration,
    gpu_device: Option<u32>,
) -> Result<Map<String, Value>, StageError> {
    ctx.layout.ensure_node_data_dir(node_name).map_err(|error| {
        StageError::inference_failed(format!("failed to prepare data dir: {error}"))
    })?;

    let work_dir = ctx.layout.node_work_dir(node_name, &ctx.stage_name);
    let report_path = work_dir.join("report.json");
    let mut args = args;
    args.push("--output_file".to_string());
    args.push(report_path.display().to_string());

    let report = ctx
        .services
        .bridge
        .run(InferenceLaunch {
            program: program.to_path_buf(),
            args,
            output_file: report_path,
            work_dir,
            gpu_device,
            deadline,
            stage_tag: format!("{node_name}/{}", ctx.stage_name),
        })
        .await?;

    let mut output = report
        .result
        .as_ref()
        .and_then(Value::as_object)
        .cloned()
        .ok_or_else(|| {
            StageError::invalid_output(format!(
                "{node_name} child reported success without a result object"
            ))
        })?;
    if let Some(statistics) = report.statistics {
        output.insert("statistics".to_string(), statistics);
    }
    Ok(output)
}

/// Like [`run_child`], holding a GPU lease for the duration.
///
/// The lease is acquired before the spawn and released after the exit status
/// is read; the child only inherits device pinning. An output produced under
/// a lost lease is discarded — the next attempt starts from scratch.
pub(crate) async fn run_child_with_gpu(
    ctx: &NodeContext,
    node_name: &str,
    program: &Path,
    args: Vec<String>,
    deadline: Duration,
) -> Result<Map<String, Value>, StageError> {
    let services = &ctx.services;
    let lease = services
        .gpu
        .acquire_any(
            &services.gpu_devices,
            &ctx.holder_id,
            services.gpu.default_max_wait(),
        )
        .await?;

    let renewal = Arc::clone(&services.gpu).start_renewal(lease.clone());
    let result = run_child(
        ctx,
        node_name,
        program,
        args,
        deadline,
        Some(lease.device_id),
    )
    .await;
    let lost = renewal.stop();

    match services.gpu.release(&lease).await {
        Ok(()) if !lost => result,
        Ok(()) | Err(GpuError::LeaseLost { .. }) => Err(StageError::lease_lost(
            "GPU lease was lost during inference, discarding output",
        )),
        Err(release_error) => {
            warn!(%release_error, device_id = lease.device_id, "lease release failed");
            result
        }
    }
}

/// Flag argument helper: `--name` when `enabled`.
pub(crate) fn push_flag(args: &mut Vec<String>, name: &str, enabled: bool) {
    if enabled {
        args.push(format!("--{name}"));
    }
}

/// Value argument helper: `--name value`.
pub(crate) fn push_arg(args: &mut Vec<String>, name: &str, value: impl ToString) {
    args.push(format!("--{name}"));
    args.push(value.to_string());
}
