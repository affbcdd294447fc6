//! Batch aggregation.
//!
//! A batch record carries the counters; a companion hash maps each task id to
//! its outcome. The hash is the source of truth: counters are always derived
//! from it, so a duplicate outcome report can never double-count and a
//! counter write lost to an expired lock is repaired on the next pass.
//!
//! The per-task outcome is written first, without the lock; it is atomic and
//! idempotent on its own. Counter writes happen under the `batch:{id}` lock
//! so two completions can never write derived counts out of order. A report
//! that cannot get the lock in time marks the batch dirty, and the reaper
//! re-derives its counters later.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use fairq_core::{BatchId, BatchStatus, Outcome, QueueError, QueueResult, SharedClock, TaskId, TenantId};
use fairq_events::BatchEvent;

use crate::event_bus::Notifier;
use crate::keys::Keys;
use crate::lock::LockManager;
use crate::record;
use crate::store::SharedStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub batch_id: BatchId,
    pub tenant_id: TenantId,
    pub total: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Batch {
    pub fn progress(&self) -> BatchProgress {
        let done = self.succeeded + self.failed;
        let percent_complete = if self.total == 0 {
            100
        } else {
            ((done as u64 * 100) / self.total as u64).min(100) as u32
        };
        BatchProgress {
            batch_id: self.batch_id.clone(),
            total: self.total,
            succeeded: self.succeeded,
            failed: self.failed,
            percent_complete,
            status: self.status,
        }
    }

    fn settle(&mut self, succeeded: u32, failed: u32) {
        self.succeeded = succeeded;
        self.failed = failed;
        if succeeded + failed >= self.total {
            self.status = if failed == 0 {
                BatchStatus::Completed
            } else {
                BatchStatus::CompletedWithErrors
            };
        }
    }
}

/// Read-only snapshot returned to producers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchProgress {
    pub batch_id: BatchId,
    pub total: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub percent_complete: u32,
    pub status: BatchStatus,
}

/// Hash value stored per task.
fn outcome_label(outcome: &Outcome) -> &'static str {
    match outcome {
        Outcome::Succeeded => "succeeded",
        Outcome::Failed { .. } => "failed",
        Outcome::Cancelled => "cancelled",
    }
}

pub struct BatchCoordinator {
    store: SharedStore,
    keys: Keys,
    clock: SharedClock,
    locks: Arc<LockManager>,
    notifier: Notifier,
    lock_ttl: Duration,
    lock_wait: Duration,
    retention: Duration,
}

impl core::fmt::Debug for BatchCoordinator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BatchCoordinator")
            .field("keys", &self.keys)
            .field("lock_ttl", &self.lock_ttl)
            .field("lock_wait", &self.lock_wait)
            .finish_non_exhaustive()
    }
}

impl BatchCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: SharedStore,
        keys: Keys,
        clock: SharedClock,
        locks: Arc<LockManager>,
        notifier: Notifier,
        lock_ttl: Duration,
        lock_wait: Duration,
        retention: Duration,
    ) -> Self {
        Self {
            store,
            keys,
            clock,
            locks,
            notifier,
            lock_ttl,
            lock_wait,
            retention,
        }
    }

    /// A batch of zero tasks is complete on creation.
    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub fn create_batch(&self, tenant_id: &TenantId, total: u32) -> QueueResult<Batch> {
        let now = self.clock.now();
        let batch = Batch {
            batch_id: BatchId::generate(),
            tenant_id: tenant_id.clone(),
            total,
            succeeded: 0,
            failed: 0,
            status: if total == 0 {
                BatchStatus::Completed
            } else {
                BatchStatus::Running
            },
            created_at: now,
            updated_at: now,
        };

        let key = self.keys.batch(&batch.batch_id);
        if !record::swap(self.store.as_ref(), &key, None, &batch, self.ttl_for(&batch))? {
            return Err(QueueError::invalid_task(format!("batch {} already exists", batch.batch_id)));
        }

        if batch.status.is_terminal() {
            self.announce_completion(&batch);
        }
        Ok(batch)
    }

    pub fn get(&self, batch_id: &BatchId) -> QueueResult<Batch> {
        record::load::<Batch>(self.store.as_ref(), &self.keys.batch(batch_id))?
            .map(|(_, batch)| batch)
            .ok_or_else(|| QueueError::not_found(format!("batch {batch_id}")))
    }

    /// Never blocks on the batch lock.
    pub fn progress(&self, batch_id: &BatchId) -> QueueResult<BatchProgress> {
        Ok(self.get(batch_id)?.progress())
    }

    /// Count one task outcome toward the batch, at most once per task.
    ///
    /// Reports for terminal batches, repeated reports for the same task and
    /// reports beyond `total` leave the batch untouched. Once the outcome is
    /// stored the report never fails on lock contention; the returned
    /// progress may then lag until `resync_dirty` catches up.
    #[instrument(skip(self, outcome), fields(batch_id = %batch_id, task_id = %task_id))]
    pub fn record_outcome(&self, batch_id: &BatchId, task_id: &TaskId, outcome: &Outcome) -> QueueResult<BatchProgress> {
        let (_, batch) = self.load(batch_id)?;
        if batch.status.is_terminal() {
            return Ok(batch.progress());
        }

        let outcomes = self.keys.batch_outcomes(batch_id);
        if self.store.hash_len(&outcomes)? >= batch.total as usize {
            warn!(total = batch.total, "outcome beyond batch total ignored");
            return Ok(batch.progress());
        }
        if !self
            .store
            .hash_set_if_absent(&outcomes, task_id.as_str(), outcome_label(outcome))?
        {
            return Ok(batch.progress());
        }

        match self.resync(batch_id) {
            Err(QueueError::LockContended { .. } | QueueError::LockLost { .. }) => {
                warn!("batch lock unavailable, counters deferred");
                self.store.set_add(&self.keys.dirty_batches(), batch_id.as_str())?;
                Ok(batch.progress())
            }
            other => other,
        }
    }

    /// Recompute the counters from the outcome hash.
    pub fn resync(&self, batch_id: &BatchId) -> QueueResult<BatchProgress> {
        let resource = format!("batch:{batch_id}");
        self.locks.with_lock(&resource, self.lock_ttl, self.lock_wait, |_| {
            let (raw, batch) = self.load(batch_id)?;
            self.write_derived(batch_id, &raw, batch)
        })
    }

    /// Resync up to `limit` batches marked dirty. Returns how many caught up;
    /// a batch still contended stays marked for the next call.
    pub fn resync_dirty(&self, limit: usize) -> QueueResult<usize> {
        let dirty = self.keys.dirty_batches();
        let mut resynced = 0;
        for raw in self.store.set_members(&dirty)?.into_iter().take(limit) {
            let outcome = match BatchId::parse(raw.as_str()) {
                Ok(batch_id) => self.resync(&batch_id).map(|_| ()),
                Err(e) => Err(e),
            };
            match outcome {
                Ok(()) => {
                    self.store.set_remove(&dirty, &raw)?;
                    resynced += 1;
                }
                Err(QueueError::NotFound(_) | QueueError::InvalidTask(_)) => {
                    self.store.set_remove(&dirty, &raw)?;
                }
                Err(e) => warn!(batch_id = %raw, error = %e, "batch still out of date"),
            }
        }
        Ok(resynced)
    }

    fn load(&self, batch_id: &BatchId) -> QueueResult<(String, Batch)> {
        record::load(self.store.as_ref(), &self.keys.batch(batch_id))?
            .ok_or_else(|| QueueError::not_found(format!("batch {batch_id}")))
    }

    fn write_derived(&self, batch_id: &BatchId, raw: &str, mut batch: Batch) -> QueueResult<BatchProgress> {
        let was_terminal = batch.status.is_terminal();
        let (mut succeeded, mut failed) = (0u32, 0u32);
        for (_, label) in self.store.hash_get_all(&self.keys.batch_outcomes(batch_id))? {
            if label == "succeeded" {
                succeeded += 1;
            } else {
                failed += 1;
            }
        }

        if (succeeded, failed) == (batch.succeeded, batch.failed) {
            return Ok(batch.progress());
        }

        batch.settle(succeeded, failed);
        batch.updated_at = self.clock.now();

        let key = self.keys.batch(batch_id);
        if !record::swap(self.store.as_ref(), &key, Some(raw), &batch, self.ttl_for(&batch))? {
            // Only possible if the lock was lost.
            return Err(QueueError::lock_lost(format!("batch:{batch_id}")));
        }
        if batch.status.is_terminal() {
            self.expire_outcomes(batch_id);
        }

        self.notifier.batch(
            &batch.tenant_id,
            batch_id,
            BatchEvent::Progress {
                batch_id: batch_id.clone(),
                total: batch.total,
                succeeded: batch.succeeded,
                failed: batch.failed,
            },
        );
        if batch.status.is_terminal() && !was_terminal {
            self.announce_completion(&batch);
        }

        Ok(batch.progress())
    }

    fn ttl_for(&self, batch: &Batch) -> Option<Duration> {
        batch.status.is_terminal().then_some(self.retention)
    }

    fn expire_outcomes(&self, batch_id: &BatchId) {
        if let Err(e) = self.store.expire(&self.keys.batch_outcomes(batch_id), self.retention) {
            warn!(batch_id = %batch_id, error = %e, "failed to set retention on batch outcomes");
        }
    }

    fn announce_completion(&self, batch: &Batch) {
        info!(
            batch_id = %batch.batch_id,
            status = batch.status.as_str(),
            succeeded = batch.succeeded,
            failed = batch.failed,
            "batch completed"
        );
        self.notifier.batch(
            &batch.tenant_id,
            &batch.batch_id,
            BatchEvent::Completed {
                batch_id: batch.batch_id.clone(),
                status: batch.status,
                total: batch.total,
                succeeded: batch.succeeded,
                failed: batch.failed,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration as StdDuration;

    use fairq_core::ManualClock;
    use fairq_events::{Channel, Event, InMemoryNotificationBus, NotificationBus};

    use super::*;
    use crate::retry::RetryPolicy;
    use crate::store::InMemoryKvStore;

    struct Fixture {
        batches: BatchCoordinator,
        bus: Arc<InMemoryNotificationBus>,
        locks: Arc<LockManager>,
    }

    fn fixture() -> Fixture {
        let clock = ManualClock::starting_now();
        let store: SharedStore = Arc::new(InMemoryKvStore::with_clock(clock.clone()));
        let keys = Keys::new("t");
        let bus = InMemoryNotificationBus::arc();
        let locks = Arc::new(LockManager::new(
            store.clone(),
            keys.clone(),
            clock.clone(),
            RetryPolicy::fixed(0, StdDuration::from_millis(1)),
        ));
        let batches = BatchCoordinator::new(
            store,
            keys,
            clock.clone(),
            locks.clone(),
            Notifier::new(bus.clone(), clock),
            StdDuration::from_secs(5),
            StdDuration::from_millis(50),
            StdDuration::from_secs(3600),
        );
        Fixture { batches, bus, locks }
    }

    fn tenant() -> TenantId {
        TenantId::parse("acme").unwrap()
    }

    fn task(n: u32) -> TaskId {
        TaskId::parse(format!("t{n}")).unwrap()
    }

    #[test]
    fn empty_batch_is_completed_immediately() {
        let f = fixture();
        let batch = f.batches.create_batch(&tenant(), 0).unwrap();
        let progress = f.batches.progress(&batch.batch_id).unwrap();
        assert_eq!(progress.status, BatchStatus::Completed);
        assert_eq!(progress.percent_complete, 100);
    }

    #[test]
    fn mixed_outcomes_complete_with_errors() {
        let f = fixture();
        let batch = f.batches.create_batch(&tenant(), 3).unwrap();
        let sub = f.bus.subscribe(&Channel::batch(&batch.batch_id));

        f.batches.record_outcome(&batch.batch_id, &task(1), &Outcome::Succeeded).unwrap();
        let mid = f.batches.record_outcome(&batch.batch_id, &task(2), &Outcome::failed("boom")).unwrap();
        assert_eq!(mid.percent_complete, 66);
        assert_eq!(mid.status, BatchStatus::Running);

        let done = f.batches.record_outcome(&batch.batch_id, &task(3), &Outcome::Cancelled).unwrap();
        assert_eq!((done.succeeded, done.failed), (1, 2));
        assert_eq!(done.status, BatchStatus::CompletedWithErrors);

        let events: Vec<_> = std::iter::from_fn(|| sub.try_recv().ok()).collect();
        assert_eq!(events.len(), 4);
        assert!(matches!(
            events.last().map(|n| &n.event),
            Some(Event::Batch(BatchEvent::Completed { status: BatchStatus::CompletedWithErrors, .. }))
        ));
    }

    #[test]
    fn duplicate_reports_are_counted_once() {
        let f = fixture();
        let batch = f.batches.create_batch(&tenant(), 2).unwrap();

        for _ in 0..3 {
            f.batches.record_outcome(&batch.batch_id, &task(1), &Outcome::Succeeded).unwrap();
        }
        // A later, different outcome for the same task is ignored as well.
        f.batches.record_outcome(&batch.batch_id, &task(1), &Outcome::failed("late")).unwrap();

        let progress = f.batches.progress(&batch.batch_id).unwrap();
        assert_eq!((progress.succeeded, progress.failed), (1, 0));
        assert_eq!(progress.status, BatchStatus::Running);
    }

    #[test]
    fn terminal_batch_is_not_mutated() {
        let f = fixture();
        let batch = f.batches.create_batch(&tenant(), 1).unwrap();
        f.batches.record_outcome(&batch.batch_id, &task(1), &Outcome::Succeeded).unwrap();
        let after = f.batches.record_outcome(&batch.batch_id, &task(2), &Outcome::failed("x")).unwrap();
        assert_eq!((after.succeeded, after.failed), (1, 0));
        assert_eq!(after.status, BatchStatus::Completed);
    }

    #[test]
    fn contended_lock_defers_counters_without_losing_the_outcome() {
        let f = fixture();
        let batch = f.batches.create_batch(&tenant(), 1).unwrap();
        let held = f
            .locks
            .acquire(&format!("batch:{}", batch.batch_id), StdDuration::from_secs(5))
            .unwrap();

        let progress = f
            .batches
            .record_outcome(&batch.batch_id, &task(1), &Outcome::Succeeded)
            .unwrap();
        assert_eq!(progress.succeeded, 0);
        assert_eq!(progress.status, BatchStatus::Running);
        assert_eq!(f.batches.resync_dirty(10).unwrap(), 0);

        f.locks.release(&held).unwrap();
        assert_eq!(f.batches.resync_dirty(10).unwrap(), 1);
        let progress = f.batches.progress(&batch.batch_id).unwrap();
        assert_eq!(progress.succeeded, 1);
        assert_eq!(progress.status, BatchStatus::Completed);

        // Nothing left to catch up on.
        assert_eq!(f.batches.resync_dirty(10).unwrap(), 0);
    }

    #[test]
    fn unknown_batch_is_not_found() {
        let f = fixture();
        let missing = BatchId::parse("nope").unwrap();
        assert!(matches!(f.batches.progress(&missing), Err(QueueError::NotFound(_))));
    }
}
