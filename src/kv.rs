//! Key-value store interface consumed by the context store, the cache index,
//! the task broker, and the GPU arbiter.
//!
//! The contract is deliberately small: versioned reads, compare-and-set
//! writes keyed on the version token, unconditional writes with an optional
//! TTL, and prefix listing. The production backend is Redis; an in-memory
//! implementation backs unit tests.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::error::StageError;

mod memory;
mod redis;

pub use memory::MemoryKvStore;
pub(crate) use redis::RedisKvStore;

/// A stored value together with its version token.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedValue {
    pub version: u64,
    pub value: Value,
}

/// Result of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// The write landed; the new version token is returned.
    Written(u64),
    /// Another writer got there first.
    VersionMismatch,
}

#[derive(Debug, Error)]
pub enum KvError {
    #[error("key-value store unavailable: {0}")]
    Unavailable(String),
    #[error("stored value for {key} could not be decoded: {message}")]
    Corrupt { key: String, message: String },
}

impl From<KvError> for StageError {
    fn from(error: KvError) -> Self {
        StageError::store_unavailable(error.to_string())
    }
}

#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read a value and its version token. Expired entries read as absent.
    async fn get(&self, key: &str) -> Result<Option<VersionedValue>, KvError>;

    /// Unconditional write. Returns the new version token.
    async fn put(&self, key: &str, value: &Value) -> Result<u64, KvError>;

    /// Unconditional write with an expiry; the entry disappears after `ttl`.
    async fn put_with_ttl(&self, key: &str, value: &Value, ttl: Duration) -> Result<u64, KvError>;

    /// Compare-and-set on the version token. `expected == None` means
    /// "create only if absent".
    async fn set_if_version(
        &self,
        key: &str,
        value: &Value,
        expected: Option<u64>,
    ) -> Result<CasOutcome, KvError>;

    async fn delete(&self, key: &str) -> Result<(), KvError>;

    /// All live keys starting with `prefix`.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, KvError>;
}
