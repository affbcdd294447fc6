//! Worker liveness.
//!
//! Each worker has a record `{worker_id, last_seen, current_task_id}` and an
//! entry in a sorted set scored by `last_seen`, so the reaper can find stale
//! workers with one range query. Records expire after `RECORD_TTL_FACTOR`
//! heartbeat TTLs, so a worker nobody reaps is still cleaned up.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use fairq_core::{QueueError, QueueResult, SharedClock, TaskId, WorkerId};

use crate::keys::Keys;
use crate::record::{self, MAX_CAS_ATTEMPTS};
use crate::store::SharedStore;

/// Record lifetime in heartbeat TTLs.
const RECORD_TTL_FACTOR: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub worker_id: WorkerId,
    pub last_seen: DateTime<Utc>,
    pub current_task_id: Option<TaskId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Never seen, or forgotten by the reaper.
    Unknown,
    Alive,
    /// Not seen for at least the heartbeat TTL.
    PresumedDead,
}

pub struct HeartbeatRegistry {
    store: SharedStore,
    keys: Keys,
    clock: SharedClock,
    ttl: Duration,
}

impl core::fmt::Debug for HeartbeatRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HeartbeatRegistry")
            .field("keys", &self.keys)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl HeartbeatRegistry {
    pub fn new(store: SharedStore, keys: Keys, clock: SharedClock, ttl: Duration) -> Self {
        Self { store, keys, clock, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Record that the worker is alive now.
    pub fn touch(&self, worker_id: &WorkerId) -> QueueResult<WorkerHeartbeat> {
        self.update(worker_id, true, |_| true)
    }

    /// Record the task the worker just leased. Also counts as a heartbeat.
    pub fn set_current_task(&self, worker_id: &WorkerId, task_id: &TaskId) -> QueueResult<WorkerHeartbeat> {
        self.update(worker_id, true, |hb| {
            hb.current_task_id = Some(task_id.clone());
            true
        })
    }

    /// Clear the current task if it is still `task_id`.
    ///
    /// Does not refresh `last_seen`: the reaper calls this on behalf of dead
    /// workers.
    pub fn clear_current_task(&self, worker_id: &WorkerId, task_id: &TaskId) -> QueueResult<()> {
        if self.get(worker_id)?.is_none() {
            return Ok(());
        }
        self.update(worker_id, false, |hb| {
            if hb.current_task_id.as_ref() == Some(task_id) {
                hb.current_task_id = None;
                true
            } else {
                false
            }
        })
        .map(|_| ())
    }

    pub fn get(&self, worker_id: &WorkerId) -> QueueResult<Option<WorkerHeartbeat>> {
        Ok(record::load(self.store.as_ref(), &self.keys.worker(worker_id))?.map(|(_, hb)| hb))
    }

    pub fn state(&self, worker_id: &WorkerId) -> QueueResult<WorkerState> {
        let Some(hb) = self.get(worker_id)? else {
            return Ok(WorkerState::Unknown);
        };
        Ok(if self.is_stale(&hb, self.clock.now()) {
            WorkerState::PresumedDead
        } else {
            WorkerState::Alive
        })
    }

    /// Workers not seen for at least the TTL, stalest first.
    pub fn presumed_dead(&self, limit: usize) -> QueueResult<Vec<WorkerHeartbeat>> {
        let now = self.clock.now();
        let cutoff = now.timestamp_millis() - self.ttl.as_millis() as i64;
        let workers = self.keys.workers();

        let mut dead = Vec::new();
        for (member, _) in self.store.zrange_by_score(&workers, cutoff, limit)? {
            let worker_id = WorkerId::parse(member.clone())?;
            match self.get(&worker_id)? {
                Some(hb) if self.is_stale(&hb, now) => dead.push(hb),
                Some(_) => {}
                None => {
                    self.store.zrem(&workers, &member)?;
                }
            }
        }
        Ok(dead)
    }

    /// Drop the worker's record; it becomes `Unknown` until it touches again.
    pub fn forget(&self, worker_id: &WorkerId) -> QueueResult<()> {
        self.store.delete(&self.keys.worker(worker_id))?;
        self.store.zrem(&self.keys.workers(), worker_id.as_str())?;
        debug!(worker_id = %worker_id, "forgot worker");
        Ok(())
    }

    fn is_stale(&self, hb: &WorkerHeartbeat, now: DateTime<Utc>) -> bool {
        (now - hb.last_seen).to_std().is_ok_and(|elapsed| elapsed >= self.ttl)
    }

    /// Read-modify-write of the worker record, creating it if absent.
    /// `f` returns false to leave the record unchanged.
    fn update(
        &self,
        worker_id: &WorkerId,
        seen: bool,
        mut f: impl FnMut(&mut WorkerHeartbeat) -> bool,
    ) -> QueueResult<WorkerHeartbeat> {
        let key = self.keys.worker(worker_id);

        for _ in 0..MAX_CAS_ATTEMPTS {
            let now = self.clock.now();
            let current = record::load::<WorkerHeartbeat>(self.store.as_ref(), &key)?;
            let (expected, mut hb) = match current {
                Some((raw, hb)) => (Some(raw), hb),
                None => (
                    None,
                    WorkerHeartbeat {
                        worker_id: worker_id.clone(),
                        last_seen: now,
                        current_task_id: None,
                    },
                ),
            };

            let changed = f(&mut hb);
            if seen {
                hb.last_seen = now;
            } else if !changed {
                return Ok(hb);
            }

            let record_ttl = self.ttl * RECORD_TTL_FACTOR;
            if record::swap(self.store.as_ref(), &key, expected.as_deref(), &hb, Some(record_ttl))? {
                if seen {
                    self.store
                        .zadd(&self.keys.workers(), worker_id.as_str(), now.timestamp_millis())?;
                }
                return Ok(hb);
            }
        }

        Err(QueueError::store(format!("heartbeat for {worker_id} is contended")))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use fairq_core::ManualClock;

    use super::*;
    use crate::store::InMemoryKvStore;

    fn registry() -> (HeartbeatRegistry, Arc<ManualClock>) {
        let clock = ManualClock::starting_now();
        let store = Arc::new(InMemoryKvStore::with_clock(clock.clone()));
        (
            HeartbeatRegistry::new(store, Keys::new("t"), clock.clone(), Duration::from_secs(300)),
            clock,
        )
    }

    fn worker(name: &str) -> WorkerId {
        WorkerId::parse(name).unwrap()
    }

    #[test]
    fn state_follows_ttl() {
        let (hb, clock) = registry();
        let w = worker("w1");
        assert_eq!(hb.state(&w).unwrap(), WorkerState::Unknown);

        hb.touch(&w).unwrap();
        assert_eq!(hb.state(&w).unwrap(), WorkerState::Alive);

        clock.advance(Duration::from_secs(299));
        assert_eq!(hb.state(&w).unwrap(), WorkerState::Alive);

        clock.advance(Duration::from_secs(1));
        assert_eq!(hb.state(&w).unwrap(), WorkerState::PresumedDead);

        hb.touch(&w).unwrap();
        assert_eq!(hb.state(&w).unwrap(), WorkerState::Alive);
    }

    #[test]
    fn presumed_dead_lists_only_stale_workers() {
        let (hb, clock) = registry();
        hb.set_current_task(&worker("old"), &TaskId::parse("t1").unwrap()).unwrap();
        clock.advance(Duration::from_secs(200));
        hb.touch(&worker("young")).unwrap();
        clock.advance(Duration::from_secs(150));

        let dead = hb.presumed_dead(10).unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].worker_id, worker("old"));
        assert_eq!(dead[0].current_task_id, Some(TaskId::parse("t1").unwrap()));

        hb.forget(&worker("old")).unwrap();
        assert!(hb.presumed_dead(10).unwrap().is_empty());
        assert_eq!(hb.state(&worker("old")).unwrap(), WorkerState::Unknown);
    }

    #[test]
    fn clearing_a_task_does_not_revive_a_worker() {
        let (hb, clock) = registry();
        let w = worker("w1");
        let t = TaskId::parse("t1").unwrap();
        hb.set_current_task(&w, &t).unwrap();
        clock.advance(Duration::from_secs(400));

        hb.clear_current_task(&w, &TaskId::parse("other").unwrap()).unwrap();
        assert_eq!(hb.get(&w).unwrap().unwrap().current_task_id, Some(t.clone()));

        hb.clear_current_task(&w, &t).unwrap();
        assert_eq!(hb.get(&w).unwrap().unwrap().current_task_id, None);
        assert_eq!(hb.state(&w).unwrap(), WorkerState::PresumedDead);
    }

    #[test]
    fn clearing_an_unknown_worker_is_a_no_op() {
        let (hb, _) = registry();
        hb.clear_current_task(&worker("ghost"), &TaskId::parse("t").unwrap()).unwrap();
        assert_eq!(hb.state(&worker("ghost")).unwrap(), WorkerState::Unknown);
    }

    #[test]
    fn unreaped_records_expire_on_their_own() {
        let (hb, clock) = registry();
        let w = worker("w1");
        hb.touch(&w).unwrap();

        clock.advance(Duration::from_secs(300 * 3 - 1));
        assert_eq!(hb.state(&w).unwrap(), WorkerState::PresumedDead);

        clock.advance(Duration::from_secs(2));
        assert_eq!(hb.state(&w).unwrap(), WorkerState::Unknown);
        assert!(hb.presumed_dead(10).unwrap().is_empty());
    }
}
