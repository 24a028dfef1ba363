//! Redis-backed [`KvStore`].
//!
//! Every key is a Redis hash holding a `version` counter and a `value` field
//! with the JSON payload. Version arithmetic and the compare-and-set path run
//! server-side as Lua scripts so concurrent workers observe a single atomic
//! step. TTL entries use `PEXPIRE` on the same hash.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use serde_json::Value;

use super::{CasOutcome, KvError, KvStore, VersionedValue};

const PUT_SCRIPT: &str = r"
local next = redis.call('HINCRBY', KEYS[1], 'version', 1)
redis.call('HSET', KEYS[1], 'value', ARGV[1])
if ARGV[2] ~= '0' then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return next
";

const CAS_SCRIPT: &str = r"
local cur = redis.call('HGET', KEYS[1], 'version')
if cur == false then
  if ARGV[1] == '0' then
    redis.call('HSET', KEYS[1], 'version', 1, 'value', ARGV[2])
    return 1
  end
  return -1
end
if cur == ARGV[1] then
  local next = tonumber(cur) + 1
  redis.call('HSET', KEYS[1], 'version', next, 'value', ARGV[2])
  return next
end
return -1
";

pub(crate) struct RedisKvStore {
    conn: ConnectionManager,
    put_script: Script,
    cas_script: Script,
}

impl RedisKvStore {
    /// Open a managed connection to the store. The connection manager
    /// reconnects transparently after transient failures.
    pub(crate) async fn connect(address: &str) -> Result<Self, KvError> {
        let client = redis::Client::open(address)
            .map_err(|error| KvError::Unavailable(error.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|error| KvError::Unavailable(error.to_string()))?;
        Ok(Self::new(conn))
    }

    pub(crate) fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            put_script: Script::new(PUT_SCRIPT),
            cas_script: Script::new(CAS_SCRIPT),
        }
    }

    fn unavailable(error: redis::RedisError) -> KvError {
        KvError::Unavailable(error.to_string())
    }
}

#[async_trait]
impl KvStore for RedisKvStore {
    async fn get(&self, key: &str) -> Result<Option<VersionedValue>, KvError> {
        let mut conn = self.conn.clone();
        let (version, raw): (Option<u64>, Option<String>) = redis::cmd("HMGET")
            .arg(key)
            .arg("version")
            .arg("value")
            .query_async(&mut conn)
            .await
            .map_err(Self::unavailable)?;

        match (version, raw) {
            (Some(version), Some(raw)) => {
                let value =
                    serde_json::from_str(&raw).map_err(|error| KvError::Corrupt {
                        key: key.to_string(),
                        message: error.to_string(),
                    })?;
                Ok(Some(VersionedValue { version, value }))
            }
            _ => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: &Value) -> Result<u64, KvError> {
        let mut conn = self.conn.clone();
        let version: u64 = self
            .put_script
            .key(key)
            .arg(value.to_string())
            .arg(0u64)
            .invoke_async(&mut conn)
            .await
            .map_err(Self::unavailable)?;
        Ok(version)
    }

    async fn put_with_ttl(&self, key: &str, value: &Value, ttl: Duration) -> Result<u64, KvError> {
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let mut conn = self.conn.clone();
        let version: u64 = self
            .put_script
            .key(key)
            .arg(value.to_string())
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(Self::unavailable)?;
        Ok(version)
    }

    async fn set_if_version(
        &self,
        key: &str,
        value: &Value,
        expected: Option<u64>,
    ) -> Result<CasOutcome, KvError> {
        let mut conn = self.conn.clone();
        let outcome: i64 = self
            .cas_script
            .key(key)
            .arg(expected.unwrap_or(0))
            .arg(value.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(Self::unavailable)?;

        if outcome < 0 {
            Ok(CasOutcome::VersionMismatch)
        } else {
            Ok(CasOutcome::Written(outcome as u64))
        }
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<()>(&mut conn)
            .await
            .map_err(Self::unavailable)?;
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        let mut conn = self.conn.clone();
        let pattern = format!("{prefix}*");
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(Self::unavailable)?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(keys)
    }
}
