use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::types::TaskBroker;
use crate::error::ErrorKind;
use crate::node::NodeRunner;

/// Background worker that consumes broker deliveries and runs them through
/// the node lifecycle.
///
/// Every delivery is acknowledged, success or not: failures are recorded on
/// the stage record and the scheduler decides whether to re-dispatch, so
/// leaving the payload in flight would only produce duplicate claims.
pub struct BrokerWorker {
    broker: Arc<dyn TaskBroker>,
    runner: Arc<NodeRunner>,
    capabilities: Vec<String>,
    poll_wait: Duration,
}

impl BrokerWorker {
    #[must_use]
    pub fn new(
        broker: Arc<dyn TaskBroker>,
        runner: Arc<NodeRunner>,
        capabilities: Vec<String>,
    ) -> Self {
        Self {
            broker,
            runner,
            capabilities,
            poll_wait: Duration::from_secs(2),
        }
    }

    pub fn spawn(self, worker_index: usize) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            info!(worker_index, "starting broker worker");
            self.run().await
        })
    }

    /// Run the consume loop.
    pub async fn run(&self) -> Result<()> {
        info!(
            capabilities = self.capabilities.len(),
            "broker worker consuming"
        );

        loop {
            let delivery = match self.broker.consume(&self.capabilities, self.poll_wait).await {
                Ok(Some(delivery)) => delivery,
                Ok(None) => continue,
                Err(broker_error) => {
                    error!(error = %broker_error, "broker consume failed");
                    sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            let task = &delivery.task;
            debug!(
                workflow_id = %task.workflow_id,
                stage = %task.stage_name,
                node = %task.node_name,
                attempt = task.attempt,
                "processing delivery"
            );

            match self
                .runner
                .execute(&task.workflow_id, &task.stage_name)
                .await
            {
                Ok(_) => {}
                // Another worker holds the stage, or it is already terminal.
                // Benign under at-least-once delivery.
                Err(stage_error) if stage_error.kind == ErrorKind::Conflict => {
                    debug!(
                        workflow_id = %task.workflow_id,
                        stage = %task.stage_name,
                        "stage slot not claimable: {}",
                        stage_error.message
                    );
                }
                Err(stage_error) => {
                    warn!(
                        workflow_id = %task.workflow_id,
                        stage = %task.stage_name,
                        kind = stage_error.kind.as_str(),
                        "stage attempt failed: {}",
                        stage_error.message
                    );
                }
            }

            if let Err(ack_error) = self.broker.ack(&delivery).await {
                warn!(error = %ack_error, "failed to ack delivery");
            }
        }
    }
}
