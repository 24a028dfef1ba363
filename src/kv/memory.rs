//! In-memory [`KvStore`] used by unit and scenario tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;

use super::{CasOutcome, KvError, KvStore, VersionedValue};

#[derive(Debug)]
struct Entry {
    version: u64,
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|deadline| Instant::now() >= deadline)
    }
}

/// Process-local store with the same observable semantics as the Redis
/// backend, including TTL expiry and version tokens.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryKvStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<VersionedValue>, KvError> {
        let mut entries = self.entries.lock().expect("kv mutex");
        match entries.get(key) {
            Some(entry) if entry.is_expired() => {
                entries.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(VersionedValue {
                version: entry.version,
                value: entry.value.clone(),
            })),
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: &Value) -> Result<u64, KvError> {
        let mut entries = self.entries.lock().expect("kv mutex");
        let version = match entries.get(key) {
            Some(entry) if !entry.is_expired() => entry.version + 1,
            _ => 1,
        };
        entries.insert(
            key.to_string(),
            Entry {
                version,
                value: value.clone(),
                expires_at: None,
            },
        );
        Ok(version)
    }

    async fn put_with_ttl(&self, key: &str, value: &Value, ttl: Duration) -> Result<u64, KvError> {
        let mut entries = self.entries.lock().expect("kv mutex");
        let version = match entries.get(key) {
            Some(entry) if !entry.is_expired() => entry.version + 1,
            _ => 1,
        };
        entries.insert(
            key.to_string(),
            Entry {
                version,
                value: value.clone(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(version)
    }

    async fn set_if_version(
        &self,
        key: &str,
        value: &Value,
        expected: Option<u64>,
    ) -> Result<CasOutcome, KvError> {
        let mut entries = self.entries.lock().expect("kv mutex");
        let current = match entries.get(key) {
            Some(entry) if entry.is_expired() => None,
            Some(entry) => Some(entry.version),
            None => None,
        };

        if current != expected {
            return Ok(CasOutcome::VersionMismatch);
        }

        let version = current.map_or(1, |v| v + 1);
        entries.insert(
            key.to_string(),
            Entry {
                version,
                value: value.clone(),
                expires_at: None,
            },
        );
        Ok(CasOutcome::Written(version))
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.entries.lock().expect("kv mutex").remove(key);
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        let entries = self.entries.lock().expect("kv mutex");
        Ok(entries
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && !entry.is_expired())
            .map(|(key, _)| key.clone())
            .collect())
    }
}
