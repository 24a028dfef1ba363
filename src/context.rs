//! Workflow context: the persisted shared state of one workflow run.
//!
//! The context is a pure data-access layer. It knows nothing about node
//! implementations; executors depend on it, never the other way around.

mod store;
mod types;

pub use store::{ContextError, ContextStore};
pub use types::{
    StagePatch, StageRecord, StageStatus, WorkflowContext, WorkflowStatus, unique_stage_names,
};
