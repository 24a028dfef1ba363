use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::StageError;

/// One unit of dispatch: run `stage_name` of `workflow_id` on a worker that
/// hosts `node_name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub node_name: String,
    pub workflow_id: String,
    pub stage_name: String,
    /// Dispatch attempt counter, for log correlation only.
    #[serde(default)]
    pub attempt: u32,
}

/// A consumed task plus the token needed to acknowledge it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub task: TaskEnvelope,
    pub(crate) token: String,
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("task broker unavailable: {0}")]
    Unavailable(String),
    #[error("broker payload could not be decoded: {0}")]
    Corrupt(String),
}

impl From<BrokerError> for StageError {
    fn from(error: BrokerError) -> Self {
        StageError::store_unavailable(error.to_string())
    }
}

#[async_trait]
pub trait TaskBroker: Send + Sync {
    /// Enqueue a task for any worker capable of its node.
    async fn publish(&self, task: &TaskEnvelope) -> Result<(), BrokerError>;

    /// Take the next task for any of `capabilities`, waiting up to `wait`.
    /// Returns `None` when nothing became available in time. The delivery
    /// stays in flight until acknowledged; unacknowledged deliveries are
    /// redelivered.
    async fn consume(
        &self,
        capabilities: &[String],
        wait: Duration,
    ) -> Result<Option<Delivery>, BrokerError>;

    /// Acknowledge a delivery, removing it from the in-flight set.
    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError>;
}
