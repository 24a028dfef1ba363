//! Subprocess inference bridge.
//!
//! GPU inference runs in a detached child process so library state and
//! device memory die with the child instead of accumulating in the long-lived
//! worker. The contract with the child: its command line fully describes the
//! task, progress goes to stderr, and on completion it writes a single JSON
//! report to the declared output file, exiting 0 iff `success` is true. The
//! parent owns the GPU lease; the child only inherits device pinning through
//! `CUDA_VISIBLE_DEVICES`.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::StageError;

/// Device-visibility variable understood by the CUDA runtime.
const DEVICE_ENV: &str = "CUDA_VISIBLE_DEVICES";

/// One child invocation.
#[derive(Debug, Clone)]
pub struct InferenceLaunch {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// File the child must write its JSON report to.
    pub output_file: PathBuf,
    /// Scratch directory, recreated clean before the spawn.
    pub work_dir: PathBuf,
    /// Device index pinned into the child environment.
    pub gpu_device: Option<u32>,
    /// Overall deadline for the child run.
    pub deadline: Duration,
    /// Tag prefixed to every teed stderr line.
    pub stage_tag: String,
}

/// Report the child writes on completion.
#[derive(Debug, Clone, Deserialize)]
pub struct InferenceReport {
    pub success: bool,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<ChildError>,
    #[serde(default)]
    pub statistics: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChildError {
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub traceback: Option<String>,
}

/// Spawns and supervises inference children.
pub struct InferenceBridge {
    startup_timeout: Duration,
    term_grace: Duration,
}

impl InferenceBridge {
    #[must_use]
    pub fn new(startup_timeout: Duration) -> Self {
        Self {
            startup_timeout,
            term_grace: Duration::from_secs(5),
        }
    }

    #[must_use]
    pub fn with_term_grace(mut self, grace: Duration) -> Self {
        self.term_grace = grace;
        self
    }

    /// Run one child to completion and return its parsed report.
    ///
    /// Any of {nonzero exit, missing report, unparseable report,
    /// `success == false`} yields a structured error and no stage output.
    pub async fn run(&self, launch: InferenceLaunch) -> Result<InferenceReport, StageError> {
        self.prepare_work_dir(&launch).await?;

        let mut command = Command::new(&launch.program);
        command
            .args(&launch.args)
            .current_dir(&launch.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(device) = launch.gpu_device {
            command.env(DEVICE_ENV, device.to_string());
        }

        let mut child = command.spawn().map_err(|error| {
            StageError::inference_failed(format!(
                "failed to spawn {}: {error}",
                launch.program.display()
            ))
        })?;
        debug!(stage = %launch.stage_tag, program = %launch.program.display(), "inference child spawned");

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| StageError::inference_failed("child stderr was not captured"))?;
        let mut lines = BufReader::new(stderr).lines();

        // The child must show a sign of life before the startup timeout.
        match timeout(self.startup_timeout, lines.next_line()).await {
            Err(_) => {
                self.terminate(&mut child).await;
                return Err(StageError::inference_failed(format!(
                    "no progress within {}s of spawn",
                    self.startup_timeout.as_secs()
                ))
                .with_child_kind("startup_timeout"));
            }
            Ok(Ok(Some(line))) => {
                info!(target: "inference", stage = %launch.stage_tag, "{line}");
            }
            // Stream closed right away; the exit status decides below.
            Ok(Ok(None)) | Ok(Err(_)) => {}
        }

        // Tee the rest of stderr into the worker log.
        let tag = launch.stage_tag.clone();
        let tee = tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                info!(target: "inference", stage = %tag, "{line}");
            }
        });

        let status = match timeout(launch.deadline, child.wait()).await {
            Err(_) => {
                self.terminate(&mut child).await;
                tee.abort();
                return Err(StageError::timeout(format!(
                    "inference child exceeded its {}s deadline",
                    launch.deadline.as_secs()
                )));
            }
            Ok(result) => result.map_err(|error| {
                StageError::inference_failed(format!("failed to await child exit: {error}"))
            })?,
        };
        let _ = tee.await;

        let report = self.read_report(&launch).await?;
        if !report.success || !status.success() {
            let (kind, message, traceback) = match &report.error {
                Some(child_error) => (
                    child_error.kind.clone(),
                    child_error.message.clone(),
                    child_error.traceback.clone(),
                ),
                None => (
                    "unknown".to_string(),
                    format!("child exited with {status} and no error report"),
                    None,
                ),
            };
            let mut error = StageError::inference_failed(message).with_child_kind(kind);
            if let Some(traceback) = traceback {
                error = error.with_detail(Value::String(traceback));
            }
            return Err(error);
        }

        Ok(report)
    }

    async fn prepare_work_dir(&self, launch: &InferenceLaunch) -> Result<(), StageError> {
        let _ = tokio::fs::remove_dir_all(&launch.work_dir).await;
        tokio::fs::create_dir_all(&launch.work_dir)
            .await
            .map_err(|error| {
                StageError::inference_failed(format!(
                    "failed to create work dir {}: {error}",
                    launch.work_dir.display()
                ))
            })?;
        if let Some(parent) = launch.output_file.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|error| {
                StageError::inference_failed(format!(
                    "failed to create output dir {}: {error}",
                    parent.display()
                ))
            })?;
        }
        // A stale report from a previous attempt must never be mistaken for
        // this run's result.
        let _ = tokio::fs::remove_file(&launch.output_file).await;
        Ok(())
    }

    async fn read_report(&self, launch: &InferenceLaunch) -> Result<InferenceReport, StageError> {
        let raw = tokio::fs::read_to_string(&launch.output_file)
            .await
            .map_err(|error| {
                StageError::inference_failed(format!(
                    "child produced no report at {}: {error}",
                    launch.output_file.display()
                ))
            })?;
        serde_json::from_str(&raw).map_err(|error| {
            StageError::inference_failed(format!("child report is not valid JSON: {error}"))
        })
    }

    /// Graceful-then-forceful termination: SIGTERM, a grace period, SIGKILL.
    async fn terminate(&self, child: &mut Child) {
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            // SAFETY: pid belongs to a child this process spawned and still owns.
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
            if timeout(self.term_grace, child.wait()).await.is_ok() {
                return;
            }
            warn!(pid, "child ignored SIGTERM, killing");
        }
        let _ = child.kill().await;
    }
}
