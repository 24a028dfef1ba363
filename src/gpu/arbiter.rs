use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::types::{GpuError, HeldSlot, Lease, SlotState};
use crate::kv::{CasOutcome, KvStore, VersionedValue};
use crate::observability::metrics::Metrics;
use crate::util::retry::RetryConfig;
use crate::util::time;

/// Mutual-exclusion lock over GPU device slots.
///
/// At any instant a slot is either free or leased to exactly one holder.
/// Waiters poll with full-jitter backoff; fairness is observable (each waiter
/// registers an ephemeral marker that feeds the wait-queue gauge) but strict
/// FIFO is not promised.
pub struct GpuArbiter {
    kv: Arc<dyn KvStore>,
    lease_ttl: Duration,
    renew_interval: Duration,
    acquire_max_wait: Duration,
    backoff: RetryConfig,
    metrics: Option<Arc<Metrics>>,
}

impl GpuArbiter {
    #[must_use]
    pub fn new(
        kv: Arc<dyn KvStore>,
        lease_ttl: Duration,
        renew_interval: Duration,
        acquire_max_wait: Duration,
    ) -> Self {
        Self {
            kv,
            lease_ttl,
            renew_interval,
            acquire_max_wait,
            backoff: RetryConfig::new(usize::MAX, 100, 2000),
            metrics: None,
        }
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn slot_key(device_id: u32) -> String {
        format!("gpu:slot:{device_id}")
    }

    fn waiter_key(device_id: u32, holder_id: &str) -> String {
        format!("gpu:wait:{device_id}:{holder_id}")
    }

    fn decode_slot(entry: Option<&VersionedValue>) -> SlotState {
        entry
            .and_then(|entry| serde_json::from_value(entry.value.clone()).ok())
            .unwrap_or_default()
    }

    fn encode_slot(state: &SlotState) -> Value {
        serde_json::to_value(state).unwrap_or(Value::Null)
    }

    /// One conditional grab: succeeds only when the slot is free or expired.
    async fn try_acquire_once(
        &self,
        device_id: u32,
        holder_id: &str,
    ) -> Result<Option<Lease>, GpuError> {
        let key = Self::slot_key(device_id);
        let entry = self.kv.get(&key).await?;
        let state = Self::decode_slot(entry.as_ref());
        let now = time::now();

        let occupied = state
            .lease
            .as_ref()
            .is_some_and(|held| !held.is_expired_at(now));
        if occupied {
            return Ok(None);
        }

        let taken_over = state.lease.is_some();
        let generation = state.generation + 1;
        let expires_at = now
            + chrono::Duration::from_std(self.lease_ttl)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let next = SlotState {
            generation,
            lease: Some(HeldSlot {
                holder_id: holder_id.to_string(),
                acquired_at: now,
                expires_at,
            }),
        };

        let outcome = self
            .kv
            .set_if_version(&key, &Self::encode_slot(&next), entry.map(|e| e.version))
            .await?;
        match outcome {
            CasOutcome::Written(_) => {
                if taken_over {
                    info!(device_id, holder_id, generation, "took over an expired lease");
                    if let Some(metrics) = &self.metrics {
                        metrics.gpu_lease_takeovers.inc();
                    }
                }
                if let Some(metrics) = &self.metrics {
                    metrics.gpu_leases_acquired.inc();
                }
                Ok(Some(Lease {
                    device_id,
                    holder_id: holder_id.to_string(),
                    generation,
                    acquired_at: now,
                    expires_at,
                }))
            }
            CasOutcome::VersionMismatch => Ok(None),
        }
    }

    /// Acquire a lease on one device, waiting up to `max_wait`.
    pub async fn acquire(
        &self,
        device_id: u32,
        holder_id: &str,
        max_wait: Duration,
    ) -> Result<Lease, GpuError> {
        self.acquire_any(&[device_id], holder_id, max_wait).await
    }

    /// Acquire a lease on whichever of `devices` frees up first.
    pub async fn acquire_any(
        &self,
        devices: &[u32],
        holder_id: &str,
        max_wait: Duration,
    ) -> Result<Lease, GpuError> {
        let started = Instant::now();
        let mut attempt = 0usize;

        loop {
            for &device_id in devices {
                if let Some(lease) = self.try_acquire_once(device_id, holder_id).await? {
                    self.clear_waiters(devices, holder_id).await;
                    if let Some(metrics) = &self.metrics {
                        metrics
                            .gpu_acquire_wait_seconds
                            .observe(started.elapsed().as_secs_f64());
                    }
                    return Ok(lease);
                }
            }

            let waited = started.elapsed();
            if waited >= max_wait {
                self.clear_waiters(devices, holder_id).await;
                return Err(GpuError::Timeout {
                    waited_ms: u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
                });
            }

            self.register_waiters(devices, holder_id, max_wait - waited)
                .await;

            attempt += 1;
            let delay = self
                .backoff
                .delay_for_attempt(attempt)
                .min(max_wait - waited);
            debug!(holder_id, attempt, delay_ms = delay.as_millis() as u64, "gpu busy, backing off");
            sleep(delay).await;
        }
    }

    /// Extend the lease deadline. Fails with `LeaseLost` when the generation
    /// no longer matches (another holder took over).
    pub async fn renew(&self, lease: &Lease) -> Result<Lease, GpuError> {
        let key = Self::slot_key(lease.device_id);
        for _ in 0..3 {
            let entry = self.kv.get(&key).await?;
            let state = Self::decode_slot(entry.as_ref());

            let ours = state.generation == lease.generation
                && state
                    .lease
                    .as_ref()
                    .is_some_and(|held| held.holder_id == lease.holder_id);
            if !ours {
                return Err(GpuError::LeaseLost {
                    device_id: lease.device_id,
                    message: format!(
                        "generation advanced to {} past held {}",
                        state.generation, lease.generation
                    ),
                });
            }

            let now = time::now();
            let expires_at = now
                + chrono::Duration::from_std(self.lease_ttl)
                    .unwrap_or_else(|_| chrono::Duration::seconds(60));
            let next = SlotState {
                generation: state.generation,
                lease: Some(HeldSlot {
                    holder_id: lease.holder_id.clone(),
                    acquired_at: lease.acquired_at,
                    expires_at,
                }),
            };
            let outcome = self
                .kv
                .set_if_version(&key, &Self::encode_slot(&next), entry.map(|e| e.version))
                .await?;
            if let CasOutcome::Written(_) = outcome {
                return Ok(Lease {
                    expires_at,
                    ..lease.clone()
                });
            }
        }
        Err(GpuError::LeaseLost {
            device_id: lease.device_id,
            message: "renew kept losing the slot race".to_string(),
        })
    }

    /// Release the slot. Idempotent: releasing an already-released lease is a
    /// no-op; releasing a slot currently leased to someone else fails.
    pub async fn release(&self, lease: &Lease) -> Result<(), GpuError> {
        let key = Self::slot_key(lease.device_id);
        for _ in 0..3 {
            let entry = self.kv.get(&key).await?;
            let state = Self::decode_slot(entry.as_ref());

            let Some(held) = &state.lease else {
                return Ok(());
            };
            if held.holder_id != lease.holder_id || state.generation != lease.generation {
                return Err(GpuError::LeaseLost {
                    device_id: lease.device_id,
                    message: format!("slot is leased to {} now", held.holder_id),
                });
            }

            let next = SlotState {
                generation: state.generation,
                lease: None,
            };
            let outcome = self
                .kv
                .set_if_version(&key, &Self::encode_slot(&next), entry.map(|e| e.version))
                .await?;
            if let CasOutcome::Written(_) = outcome {
                debug!(device_id = lease.device_id, holder_id = %lease.holder_id, "lease released");
                return Ok(());
            }
        }
        Err(GpuError::LeaseLost {
            device_id: lease.device_id,
            message: "release kept losing the slot race".to_string(),
        })
    }

    /// Reap expired leases. Any participant may call this on a timer; the
    /// generation is left untouched so the next grant still bumps it.
    pub async fn sweep(&self) -> Result<usize, GpuError> {
        let keys = self.kv.list_keys("gpu:slot:").await?;
        let now = time::now();
        let mut reaped = 0usize;

        for key in keys {
            let entry = self.kv.get(&key).await?;
            let state = Self::decode_slot(entry.as_ref());
            let expired = state
                .lease
                .as_ref()
                .is_some_and(|held| held.is_expired_at(now));
            if !expired {
                continue;
            }
            let next = SlotState {
                generation: state.generation,
                lease: None,
            };
            let outcome = self
                .kv
                .set_if_version(&key, &Self::encode_slot(&next), entry.map(|e| e.version))
                .await?;
            if let CasOutcome::Written(_) = outcome {
                warn!(slot = %key, "reaped an expired lease");
                reaped += 1;
                if let Some(metrics) = &self.metrics {
                    metrics.gpu_leases_swept.inc();
                }
            }
        }
        Ok(reaped)
    }

    /// Periodic sweep daemon.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                sleep(interval).await;
                if let Err(error) = self.sweep().await {
                    warn!(%error, "lease sweep failed");
                }
            }
        })
    }

    /// Background renewal at the configured cadence. The returned handle
    /// reports whether the lease was lost; stop it before releasing.
    #[must_use]
    pub fn start_renewal(self: Arc<Self>, lease: Lease) -> RenewalHandle {
        let lost = Arc::new(AtomicBool::new(false));
        let lost_flag = Arc::clone(&lost);
        let interval = self.renew_interval;
        let arbiter = self;

        let handle = tokio::spawn(async move {
            let mut current = lease;
            loop {
                sleep(interval).await;
                match arbiter.renew(&current).await {
                    Ok(renewed) => current = renewed,
                    Err(GpuError::Store(error)) => {
                        warn!(%error, device_id = current.device_id, "lease renew hit the store, retrying");
                    }
                    Err(error) => {
                        warn!(%error, device_id = current.device_id, "lease lost during renewal");
                        lost_flag.store(true, Ordering::SeqCst);
                        break;
                    }
                }
            }
        });

        RenewalHandle { handle, lost }
    }

    /// Number of registered waiters for `device_id`.
    pub async fn queue_length(&self, device_id: u32) -> Result<usize, GpuError> {
        let keys = self
            .kv
            .list_keys(&format!("gpu:wait:{device_id}:"))
            .await?;
        Ok(keys.len())
    }

    /// Configured wait cap for acquire calls that do not pass their own.
    #[must_use]
    pub fn default_max_wait(&self) -> Duration {
        self.acquire_max_wait
    }

    async fn register_waiters(&self, devices: &[u32], holder_id: &str, remaining: Duration) {
        let ttl = remaining.max(Duration::from_millis(500));
        for &device_id in devices {
            let key = Self::waiter_key(device_id, holder_id);
            if let Err(error) = self.kv.put_with_ttl(&key, &json!(holder_id), ttl).await {
                debug!(%error, device_id, "waiter registration failed");
            }
        }
        if let Some(metrics) = &self.metrics {
            if let Some(&device_id) = devices.first() {
                if let Ok(depth) = self.queue_length(device_id).await {
                    metrics.gpu_wait_queue.set(depth as f64);
                }
            }
        }
    }

    async fn clear_waiters(&self, devices: &[u32], holder_id: &str) {
        for &device_id in devices {
            let _ = self.kv.delete(&Self::waiter_key(device_id, holder_id)).await;
        }
    }
}

/// Handle to a background renewal task.
pub struct RenewalHandle {
    handle: JoinHandle<()>,
    lost: Arc<AtomicBool>,
}

impl RenewalHandle {
    /// Whether the lease was observed lost since renewal started.
    #[must_use]
    pub fn lease_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// Stop renewing. Call before releasing the lease.
    pub fn stop(self) -> bool {
        self.handle.abort();
        self.lost.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;

    fn arbiter_with_ttl(ttl: Duration) -> Arc<GpuArbiter> {
        Arc::new(GpuArbiter::new(
            Arc::new(MemoryKvStore::new()),
            ttl,
            ttl / 3,
            Duration::from_secs(5),
        ))
    }

    #[tokio::test]
    async fn acquire_grants_generation_one_on_fresh_slot() {
        let arbiter = arbiter_with_ttl(Duration::from_secs(60));
        let lease = arbiter
            .acquire(0, "worker-a", Duration::from_millis(100))
            .await
            .expect("acquire");
        assert_eq!(lease.device_id, 0);
        assert_eq!(lease.generation, 1);
        assert!(lease.expires_at > lease.acquired_at);
    }

    #[tokio::test]
    async fn second_holder_times_out_while_slot_is_held() {
        let arbiter = arbiter_with_ttl(Duration::from_secs(60));
        let _held = arbiter
            .acquire(0, "worker-a", Duration::from_millis(100))
            .await
            .expect("acquire");

        let error = arbiter
            .acquire(0, "worker-b", Duration::from_millis(300))
            .await
            .expect_err("slot is held");
        assert!(matches!(error, GpuError::Timeout { .. }));
    }

    #[tokio::test]
    async fn release_frees_the_slot_for_the_next_holder() {
        let arbiter = arbiter_with_ttl(Duration::from_secs(60));
        let lease = arbiter
            .acquire(0, "worker-a", Duration::from_millis(100))
            .await
            .expect("acquire");
        arbiter.release(&lease).await.expect("release");

        let next = arbiter
            .acquire(0, "worker-b", Duration::from_millis(100))
            .await
            .expect("second acquire");
        assert_eq!(next.generation, 2);
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let arbiter = arbiter_with_ttl(Duration::from_secs(60));
        let lease = arbiter
            .acquire(0, "worker-a", Duration::from_millis(100))
            .await
            .expect("acquire");
        arbiter.release(&lease).await.expect("first release");
        arbiter.release(&lease).await.expect("second release is a no-op");
    }

    #[tokio::test]
    async fn releasing_someone_elses_lease_fails() {
        let arbiter = arbiter_with_ttl(Duration::from_millis(30));
        let stale = arbiter
            .acquire(0, "worker-a", Duration::from_millis(100))
            .await
            .expect("acquire");

        // Let the lease expire and hand the slot to another worker.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _fresh = arbiter
            .acquire(0, "worker-b", Duration::from_millis(200))
            .await
            .expect("takeover");

        let error = arbiter.release(&stale).await.expect_err("not the holder");
        assert!(matches!(error, GpuError::LeaseLost { .. }));
    }

    #[tokio::test]
    async fn expired_lease_is_taken_over_with_higher_generation() {
        let arbiter = arbiter_with_ttl(Duration::from_millis(30));
        let first = arbiter
            .acquire(0, "worker-a", Duration::from_millis(100))
            .await
            .expect("acquire");

        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = arbiter
            .acquire(0, "worker-b", Duration::from_millis(500))
            .await
            .expect("takeover after expiry");
        assert!(second.generation > first.generation);

        // The dead holder's renew now fails.
        let error = arbiter.renew(&first).await.expect_err("lease was lost");
        assert!(matches!(error, GpuError::LeaseLost { .. }));
    }

    #[tokio::test]
    async fn renew_extends_the_deadline() {
        let arbiter = arbiter_with_ttl(Duration::from_millis(200));
        let lease = arbiter
            .acquire(0, "worker-a", Duration::from_millis(100))
            .await
            .expect("acquire");

        tokio::time::sleep(Duration::from_millis(50)).await;
        let renewed = arbiter.renew(&lease).await.expect("renew");
        assert!(renewed.expires_at > lease.expires_at);
        assert_eq!(renewed.generation, lease.generation);
    }

    #[tokio::test]
    async fn sweep_reaps_expired_leases_without_bumping_generation() {
        let arbiter = arbiter_with_ttl(Duration::from_millis(30));
        let dead = arbiter
            .acquire(0, "worker-a", Duration::from_millis(100))
            .await
            .expect("acquire");

        tokio::time::sleep(Duration::from_millis(50)).await;

        let reaped = arbiter.sweep().await.expect("sweep");
        assert_eq!(reaped, 1);

        // Sweeping again finds nothing.
        assert_eq!(arbiter.sweep().await.expect("sweep"), 0);

        // The slot is free; the next grant bumps the generation past the
        // reaped one.
        let next = arbiter
            .acquire(0, "worker-b", Duration::from_millis(100))
            .await
            .expect("acquire after sweep");
        assert_eq!(next.generation, dead.generation + 1);
    }

    #[tokio::test]
    async fn contended_acquire_succeeds_after_release() {
        let arbiter = arbiter_with_ttl(Duration::from_secs(60));
        let lease = arbiter
            .acquire(0, "worker-a", Duration::from_millis(100))
            .await
            .expect("acquire");

        let waiter = {
            let arbiter = Arc::clone(&arbiter);
            tokio::spawn(async move {
                arbiter
                    .acquire(0, "worker-b", Duration::from_secs(5))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        arbiter.release(&lease).await.expect("release");

        let second = waiter.await.expect("join").expect("waiter acquires");
        assert_eq!(second.holder_id, "worker-b");
        assert!(second.generation > lease.generation);
    }
}
