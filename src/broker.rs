//! Task broker interface.
//!
//! A durable broker delivers `(node_name, workflow_id, stage_name)` tuples to
//! workers that declare capability for the node, with at-least-once
//! semantics. Workers are idempotent with respect to redelivery because the
//! executor's `PENDING -> RUNNING` claim admits exactly one winner.

mod memory;
mod redis;
mod types;
mod worker;

pub use memory::MemoryBroker;
pub use redis::RedisBroker;
pub use types::{BrokerError, Delivery, TaskBroker, TaskEnvelope};
pub use worker::BrokerWorker;
