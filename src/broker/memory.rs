//! In-process [`TaskBroker`] used by tests and single-process deployments.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Notify;
use uuid::Uuid;

use super::types::{BrokerError, Delivery, TaskBroker, TaskEnvelope};

struct InFlight {
    task: TaskEnvelope,
    delivered_at: Instant,
}

#[derive(Default)]
struct QueueState {
    queues: HashMap<String, VecDeque<TaskEnvelope>>,
    in_flight: HashMap<String, InFlight>,
}

/// At-least-once in-memory broker. Deliveries not acknowledged within the
/// visibility timeout are put back at the front of their queue.
pub struct MemoryBroker {
    state: Mutex<QueueState>,
    notify: Notify,
    visibility_timeout: Duration,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl MemoryBroker {
    #[must_use]
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            visibility_timeout,
        }
    }

    fn requeue_expired(state: &mut QueueState, visibility_timeout: Duration) {
        let now = Instant::now();
        let expired: Vec<String> = state
            .in_flight
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.delivered_at) >= visibility_timeout)
            .map(|(token, _)| token.clone())
            .collect();
        for token in expired {
            if let Some(entry) = state.in_flight.remove(&token) {
                state
                    .queues
                    .entry(entry.task.node_name.clone())
                    .or_default()
                    .push_front(entry.task);
            }
        }
    }

    fn try_take(&self, capabilities: &[String]) -> Option<Delivery> {
        let mut state = self.state.lock().expect("broker mutex");
        Self::requeue_expired(&mut state, self.visibility_timeout);

        for capability in capabilities {
            if let Some(queue) = state.queues.get_mut(capability) {
                if let Some(task) = queue.pop_front() {
                    let token = Uuid::new_v4().to_string();
                    state.in_flight.insert(
                        token.clone(),
                        InFlight {
                            task: task.clone(),
                            delivered_at: Instant::now(),
                        },
                    );
                    return Some(Delivery { task, token });
                }
            }
        }
        None
    }
}

#[async_trait]
impl TaskBroker for MemoryBroker {
    async fn publish(&self, task: &TaskEnvelope) -> Result<(), BrokerError> {
        {
            let mut state = self.state.lock().expect("broker mutex");
            state
                .queues
                .entry(task.node_name.clone())
                .or_default()
                .push_back(task.clone());
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn consume(
        &self,
        capabilities: &[String],
        wait: Duration,
    ) -> Result<Option<Delivery>, BrokerError> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(delivery) = self.try_take(capabilities) {
                return Ok(Some(delivery));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            // Wake on publish or poll again shortly; redelivery of expired
            // in-flight tasks happens on the next take.
            let _ = tokio::time::timeout(
                remaining.min(Duration::from_millis(100)),
                self.notify.notified(),
            )
            .await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let mut state = self.state.lock().expect("broker mutex");
        state.in_flight.remove(&delivery.token);
        Ok(())
    }
}
