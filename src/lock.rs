//! Queue admission: system locks and per-worker concurrency slots.
//!
//! [`LockManager`] is a thin facade over the store's atomic lock
//! primitives. It owns the two clock-dependent rules: a queue counts as
//! locked strictly while `now < locked_until`, and every lease expiry is
//! computed from the injected [`Clock`], never from wall time directly.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use opentelemetry::KeyValue;

use crate::clock::Clock;
use crate::error::Result;
use crate::model::SlotInfo;
use crate::store::TaskStore;
use crate::telemetry::metrics;

pub const DEFAULT_SLOT_TTL_SECS: i64 = 60;

#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    /// Lease TTL for slots and execution locks.
    slot_ttl: Duration,
}

impl LockManager {
    pub fn new(store: Arc<dyn TaskStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            slot_ttl: Duration::seconds(DEFAULT_SLOT_TTL_SECS),
        }
    }

    pub fn with_slot_ttl(mut self, ttl: Duration) -> Self {
        self.slot_ttl = ttl;
        self
    }

    // -- system lock -------------------------------------------------------

    /// Suspend the queue for `duration` from now, overwriting any prior
    /// deadline. Returns the deadline; a zero duration clears the lock.
    pub async fn set_system_lock(&self, queue: &str, duration: Duration) -> Result<DateTime<Utc>> {
        let until = self.clock.now() + duration;
        self.store.set_system_lock(queue, until).await?;
        tracing::info!(queue, until = %until, "system lock set");
        Ok(until)
    }

    /// The active deadline, or `None` once it has passed. The boundary
    /// instant itself counts as unlocked.
    pub async fn get_system_lock(&self, queue: &str) -> Result<Option<DateTime<Utc>>> {
        let until = self.store.system_lock(queue).await?;
        Ok(until.filter(|&u| self.clock.now() < u))
    }

    pub async fn is_locked(&self, queue: &str) -> Result<bool> {
        Ok(self.get_system_lock(queue).await?.is_some())
    }

    // -- concurrency slots -------------------------------------------------

    pub async fn acquire_slot(
        &self,
        queue: &str,
        worker_id: &str,
        max_workers: u32,
    ) -> Result<bool> {
        let granted = self
            .store
            .acquire_slot(queue, worker_id, max_workers, self.slot_ttl, self.clock.now())
            .await?;
        metrics::slot_operations().add(
            1,
            &[
                KeyValue::new("queue", queue.to_string()),
                KeyValue::new("operation", "acquire"),
                KeyValue::new("granted", granted),
            ],
        );
        Ok(granted)
    }

    pub async fn renew_slot(&self, queue: &str, worker_id: &str) -> Result<bool> {
        let renewed = self
            .store
            .renew_slot(queue, worker_id, self.slot_ttl, self.clock.now())
            .await?;
        metrics::slot_operations().add(
            1,
            &[
                KeyValue::new("queue", queue.to_string()),
                KeyValue::new("operation", "renew"),
                KeyValue::new("granted", renewed),
            ],
        );
        Ok(renewed)
    }

    pub async fn release_slot(&self, queue: &str, worker_id: &str) -> Result<()> {
        self.store.release_slot(queue, worker_id).await?;
        metrics::slot_operations().add(
            1,
            &[
                KeyValue::new("queue", queue.to_string()),
                KeyValue::new("operation", "release"),
                KeyValue::new("granted", true),
            ],
        );
        Ok(())
    }

    pub async fn live_slots(&self, queue: &str) -> Result<Vec<SlotInfo>> {
        self.store.list_slots(queue, self.clock.now()).await
    }

    // -- execution locks ---------------------------------------------------

    pub async fn acquire_execution_lock(
        &self,
        queue: &str,
        key: &str,
        holder: &str,
    ) -> Result<bool> {
        self.store
            .acquire_execution_lock(queue, key, holder, self.slot_ttl, self.clock.now())
            .await
    }

    pub async fn renew_execution_lock(
        &self,
        queue: &str,
        key: &str,
        holder: &str,
    ) -> Result<bool> {
        self.store
            .renew_execution_lock(queue, key, holder, self.slot_ttl, self.clock.now())
            .await
    }

    pub async fn release_execution_lock(&self, queue: &str, key: &str, holder: &str) -> Result<()> {
        self.store.release_execution_lock(queue, key, holder).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use chrono::TimeZone;

    fn manager(clock: Arc<ManualClock>) -> LockManager {
        LockManager::new(Arc::new(MemoryStore::new()), clock)
    }

    #[tokio::test]
    async fn system_lock_deadline_is_start_plus_duration() {
        let start = Utc.with_ymd_and_hms(2014, 1, 1, 0, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let lock = manager(clock.clone());

        let until = lock
            .set_system_lock("periodic", Duration::seconds(10))
            .await
            .unwrap();
        assert_eq!(until, start + Duration::seconds(10));
        assert!(lock.is_locked("periodic").await.unwrap());

        // The deadline instant itself is already unlocked.
        clock.set(until);
        assert!(!lock.is_locked("periodic").await.unwrap());
        assert_eq!(lock.get_system_lock("periodic").await.unwrap(), None);
    }

    #[tokio::test]
    async fn relocking_extends_and_zero_duration_clears() {
        let start = Utc.with_ymd_and_hms(2014, 1, 1, 0, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let lock = manager(clock.clone());

        lock.set_system_lock("q", Duration::seconds(10)).await.unwrap();
        clock.advance(Duration::seconds(5));
        let until = lock.set_system_lock("q", Duration::seconds(10)).await.unwrap();
        assert_eq!(until, start + Duration::seconds(15));

        lock.set_system_lock("q", Duration::zero()).await.unwrap();
        assert!(!lock.is_locked("q").await.unwrap());
    }
}
