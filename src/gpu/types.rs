use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::StageError;
use crate::kv::KvError;

/// A granted claim on one GPU device slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub device_id: u32,
    pub holder_id: String,
    /// Monotonically increasing per device; a mismatch on renew or release
    /// means another holder took the slot over.
    pub generation: u64,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Persisted state of one device slot.
///
/// `generation` survives releases and sweeps; it only advances when a fresh
/// lease is granted, so generations on any one device form a strictly
/// increasing sequence across holders.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct SlotState {
    pub(crate) generation: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) lease: Option<HeldSlot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct HeldSlot {
    pub(crate) holder_id: String,
    pub(crate) acquired_at: DateTime<Utc>,
    pub(crate) expires_at: DateTime<Utc>,
}

impl HeldSlot {
    pub(crate) fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Error)]
pub enum GpuError {
    #[error("no GPU device became free within {waited_ms}ms")]
    Timeout { waited_ms: u64 },
    #[error("lease on device {device_id} was lost: {message}")]
    LeaseLost { device_id: u32, message: String },
    #[error(transparent)]
    Store(#[from] KvError),
}

impl From<GpuError> for StageError {
    fn from(error: GpuError) -> Self {
        match &error {
            GpuError::Timeout { .. } => StageError::timeout(error.to_string()),
            GpuError::LeaseLost { .. } => StageError::lease_lost(error.to_string()),
            GpuError::Store(_) => StageError::store_unavailable(error.to_string()),
        }
    }
}
