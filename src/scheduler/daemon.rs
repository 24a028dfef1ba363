use std::sync::Arc;
use std::time::Duration;

use tokio::{task::JoinHandle, time::sleep};
use tracing::{error, info};

use super::runner::WorkflowScheduler;

/// Spawn the resume daemon: re-drive workflows left non-terminal by a
/// previous process, at startup and on a periodic rescan.
pub fn spawn_resume_daemon(
    scheduler: Arc<WorkflowScheduler>,
    rescan_interval: Duration,
) -> JoinHandle<()> {
    ResumeDaemon {
        scheduler,
        rescan_interval,
    }
    .spawn()
}

struct ResumeDaemon {
    scheduler: Arc<WorkflowScheduler>,
    rescan_interval: Duration,
}

impl ResumeDaemon {
    fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(self) {
        loop {
            if let Err(error) = self.resume_pass().await {
                error!(%error, "resume scan failed");
            }
            sleep(self.rescan_interval).await;
        }
    }

    async fn resume_pass(&self) -> anyhow::Result<()> {
        let workflow_ids = self.scheduler.store().list_workflow_ids().await?;
        let candidates: Vec<String> = workflow_ids
            .into_iter()
            .filter(|workflow_id| !self.scheduler.is_driving(workflow_id))
            .collect();

        let contexts = futures::future::join_all(
            candidates
                .iter()
                .map(|workflow_id| self.scheduler.store().load(workflow_id)),
        )
        .await;

        for (workflow_id, context) in candidates.into_iter().zip(contexts) {
            let context = context?;
            if context.status.is_terminal() {
                continue;
            }
            info!(%workflow_id, status = ?context.status, "resuming unfinished workflow");
            let _handle = Arc::clone(&self.scheduler).spawn_run(workflow_id);
        }
        Ok(())
    }
}
