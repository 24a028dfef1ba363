//! Redis-list-backed [`TaskBroker`].
//!
//! One list per node name (`broker:queue:<node>`); consumption moves the
//! payload into a per-consumer processing list with `BLMOVE`, and an ack
//! removes it with `LREM`. A payload that was consumed but never removed can
//! be recovered from the processing list, which is what gives the broker its
//! at-least-once behavior.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;

use super::types::{BrokerError, Delivery, TaskBroker, TaskEnvelope};

pub struct RedisBroker {
    conn: ConnectionManager,
    consumer_id: String,
}

impl RedisBroker {
    pub(crate) async fn connect(address: &str, consumer_id: &str) -> Result<Self, BrokerError> {
        let client = redis::Client::open(address)
            .map_err(|error| BrokerError::Unavailable(error.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|error| BrokerError::Unavailable(error.to_string()))?;
        Ok(Self::new(conn, consumer_id))
    }

    #[must_use]
    pub(crate) fn new(conn: ConnectionManager, consumer_id: &str) -> Self {
        Self {
            conn,
            consumer_id: consumer_id.to_string(),
        }
    }

    fn queue_key(node_name: &str) -> String {
        format!("broker:queue:{node_name}")
    }

    fn processing_key(&self) -> String {
        format!("broker:processing:{}", self.consumer_id)
    }

    fn unavailable(error: redis::RedisError) -> BrokerError {
        BrokerError::Unavailable(error.to_string())
    }
}

#[async_trait]
impl TaskBroker for RedisBroker {
    async fn publish(&self, task: &TaskEnvelope) -> Result<(), BrokerError> {
        let payload = serde_json::to_string(task)
            .map_err(|error| BrokerError::Corrupt(error.to_string()))?;
        let mut conn = self.conn.clone();
        redis::cmd("LPUSH")
            .arg(Self::queue_key(&task.node_name))
            .arg(payload)
            .query_async::<()>(&mut conn)
            .await
            .map_err(Self::unavailable)?;
        Ok(())
    }

    async fn consume(
        &self,
        capabilities: &[String],
        wait: Duration,
    ) -> Result<Option<Delivery>, BrokerError> {
        if capabilities.is_empty() {
            tokio::time::sleep(wait).await;
            return Ok(None);
        }

        // BLMOVE blocks on one source list, so the wait is split across the
        // declared capabilities per round.
        let per_queue = (wait.as_secs_f64() / capabilities.len() as f64).max(0.1);
        let mut conn = self.conn.clone();

        for capability in capabilities {
            let payload: Option<String> = redis::cmd("BLMOVE")
                .arg(Self::queue_key(capability))
                .arg(self.processing_key())
                .arg("RIGHT")
                .arg("LEFT")
                .arg(per_queue)
                .query_async(&mut conn)
                .await
                .map_err(Self::unavailable)?;

            if let Some(payload) = payload {
                let task: TaskEnvelope = serde_json::from_str(&payload)
                    .map_err(|error| BrokerError::Corrupt(error.to_string()))?;
                return Ok(Some(Delivery {
                    task,
                    token: payload,
                }));
            }
        }
        Ok(None)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        redis::cmd("LREM")
            .arg(self.processing_key())
            .arg(1)
            .arg(&delivery.token)
            .query_async::<()>(&mut conn)
            .await
            .map_err(Self::unavailable)?;
        Ok(())
    }
}
