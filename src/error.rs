//! Stage failure taxonomy.
//!
//! Every failure that crosses a component boundary is classified into one of
//! the kinds below. The node runner translates anything raised by core logic
//! into a [`StageError`] at the execution boundary; orchestration code only
//! ever consumes these typed values.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Closed set of failure classifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Input parameters failed validation. Not retryable.
    InvalidInput,
    /// A parameter reference points at a stage that has not succeeded. Not retryable.
    UnresolvedReference,
    /// A parameter reference's dotted path does not exist. Not retryable.
    MissingField,
    /// The node returned an output missing a required field. Not retryable.
    InvalidOutput,
    /// The stage deadline elapsed. Retryable while budget remains.
    Timeout,
    /// The GPU lease was taken over by another holder. Retryable.
    LeaseLost,
    /// The inference child exited nonzero or reported failure. Retryable only
    /// when the child's declared kind is in the node's retryable set.
    InferenceFailed,
    /// The key-value store was transiently unreachable. Retryable with backoff.
    StoreUnavailable,
    /// The workflow or stage was cancelled externally. Terminal.
    Cancelled,
    /// A context compare-and-set lost the race. The current step is retried,
    /// not the whole stage.
    Conflict,
}

impl ErrorKind {
    /// Retryability independent of node declarations. `InferenceFailed` is
    /// resolved against the node's retryable set by
    /// [`StageError::is_retryable_for`].
    #[must_use]
    pub fn default_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout | ErrorKind::LeaseLost | ErrorKind::StoreUnavailable
        )
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::UnresolvedReference => "unresolved_reference",
            ErrorKind::MissingField => "missing_field",
            ErrorKind::InvalidOutput => "invalid_output",
            ErrorKind::Timeout => "timeout",
            ErrorKind::LeaseLost => "lease_lost",
            ErrorKind::InferenceFailed => "inference_failed",
            ErrorKind::StoreUnavailable => "store_unavailable",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Conflict => "conflict",
        }
    }
}

/// Structured stage failure, persisted verbatim on the stage record.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq)]
#[error("{}: {message}", kind.as_str())]
pub struct StageError {
    pub kind: ErrorKind,
    pub message: String,
    /// Failure kind declared by an inference child, when one was involved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_kind: Option<String>,
    /// Free-form context for post-mortem (tracebacks, paths, raw payloads).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

impl StageError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            child_kind: None,
            detail: None,
        }
    }

    #[must_use]
    pub fn with_child_kind(mut self, child_kind: impl Into<String>) -> Self {
        self.child_kind = Some(child_kind.into());
        self
    }

    #[must_use]
    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }

    pub fn unresolved_reference(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnresolvedReference, message)
    }

    pub fn missing_field(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::MissingField, message)
    }

    pub fn invalid_output(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidOutput, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn lease_lost(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::LeaseLost, message)
    }

    pub fn inference_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InferenceFailed, message)
    }

    pub fn store_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::StoreUnavailable, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    /// Retryability of this failure for a node that declares
    /// `retryable_child_kinds` for its inference children.
    #[must_use]
    pub fn is_retryable_for(&self, retryable_child_kinds: &[String]) -> bool {
        match self.kind {
            ErrorKind::InferenceFailed => match &self.child_kind {
                Some(kind) => retryable_child_kinds.iter().any(|k| k == kind),
                None => false,
            },
            kind => kind.default_retryable(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_retryable_kinds() {
        assert!(ErrorKind::Timeout.default_retryable());
        assert!(ErrorKind::LeaseLost.default_retryable());
        assert!(ErrorKind::StoreUnavailable.default_retryable());
        assert!(!ErrorKind::InvalidInput.default_retryable());
        assert!(!ErrorKind::Cancelled.default_retryable());
        assert!(!ErrorKind::InferenceFailed.default_retryable());
    }

    #[test]
    fn inference_failure_retryable_only_for_declared_child_kind() {
        let error = StageError::inference_failed("decoder crashed").with_child_kind("cuda_oom");

        assert!(error.is_retryable_for(&["cuda_oom".to_string()]));
        assert!(!error.is_retryable_for(&["io_error".to_string()]));
        assert!(!error.is_retryable_for(&[]));
    }

    #[test]
    fn inference_failure_without_child_kind_is_not_retryable() {
        let error = StageError::inference_failed("missing report");
        assert!(!error.is_retryable_for(&["cuda_oom".to_string()]));
    }

    #[test]
    fn error_round_trips_through_json() {
        let error = StageError::timeout("stage deadline exceeded")
            .with_detail(serde_json::json!({"deadline_s": 30}));
        let raw = serde_json::to_string(&error).expect("serialize");
        let back: StageError = serde_json::from_str(&raw).expect("deserialize");
        assert_eq!(back, error);
    }
}
