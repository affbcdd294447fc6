//! Queue & lease manager.
//!
//! ## Queues
//!
//! Each (tenant, user) has its own FIFO list of task ids. Users with queued
//! work are kept in a ring; every dequeue pass rotates the ring once around
//! so users are served round-robin. Tasks submitted with
//! `PriorityKey::Global` wait in a shared overflow list that is scanned after
//! the ring.
//!
//! ## Claiming a task
//!
//! 1. mint a lease token and record a claim for it, due after `claim_grace`
//! 2. reserve user + global slots for the claim
//! 3. remove the task id from its queue (the winner of this step owns it)
//! 4. compare-and-swap the record from `pending` to `leased`, index the
//!    lease, drop the claim
//!
//! A loser at step 3 or 4 releases only its own reservation. A process that
//! dies part way leaves its claim behind; `recover_claims` finishes or
//! undoes it once the grace period is over.
//!
//! ## Fencing
//!
//! Every write by a worker carries its lease token and is checked against
//! the record under compare-and-swap. A token that no longer matches, or a
//! lease whose deadline has passed, yields `LeaseLost`.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, instrument, warn};

use fairq_core::{
    add_duration, LeaseToken, Outcome, PriorityKey, QueueError, QueueResult, SharedClock, TaskId, TaskStatus,
    TenantId, UserId, WorkerId,
};
use fairq_events::TaskEvent;

use super::types::{parse_slot_member, slot_member, Lease, LeasedTask, RequeueOutcome, Task};
use crate::admission::{AdmissionController, ReconcileReport};
use crate::batch::BatchCoordinator;
use crate::config::QueueConfig;
use crate::event_bus::Notifier;
use crate::heartbeat::HeartbeatRegistry;
use crate::keys::{Keys, Scope, UserScope};
use crate::record::{self, MAX_CAS_ATTEMPTS};
use crate::store::SharedStore;

/// Queue entries examined per user per pass before moving on.
const MAX_HEAD_SKIPS: usize = 64;

/// Result of trying one queue entry.
enum Claim {
    Leased(LeasedTask),
    /// Admission refused; the entry stays queued.
    Blocked,
    /// The entry was stale, cancelled or taken by another worker.
    Skipped,
}

/// Result of draining the head of one user queue.
enum Head {
    Leased(LeasedTask),
    Blocked,
    Empty,
}

pub struct QueueManager {
    store: SharedStore,
    keys: Keys,
    clock: SharedClock,
    admission: Arc<AdmissionController>,
    batches: Arc<BatchCoordinator>,
    heartbeats: Arc<HeartbeatRegistry>,
    notifier: Notifier,
    config: QueueConfig,
}

impl core::fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("QueueManager")
            .field("keys", &self.keys)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl QueueManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: SharedStore,
        keys: Keys,
        clock: SharedClock,
        admission: Arc<AdmissionController>,
        batches: Arc<BatchCoordinator>,
        heartbeats: Arc<HeartbeatRegistry>,
        notifier: Notifier,
        config: QueueConfig,
    ) -> Self {
        Self {
            store,
            keys,
            clock,
            admission,
            batches,
            heartbeats,
            notifier,
            config,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    // -- producer side -----------------------------------------------------

    /// Store a new pending task and queue it.
    #[instrument(skip(self, task), fields(task_id = %task.task_id, user_id = %task.user_id), err)]
    pub fn enqueue(&self, mut task: Task) -> QueueResult<Task> {
        task.validate()?;
        let now = self.clock.now();
        task.created_at = now;
        task.updated_at = now;
        task.attempt_count = task.attempt_count.max(1);

        let key = self.keys.task(&task.task_id);
        if !record::swap(self.store.as_ref(), &key, None, &task, None)? {
            return Err(QueueError::invalid_task(format!("task {} already exists", task.task_id)));
        }

        if let Err(e) = self.push_queued(&task, false) {
            // Not queued yet, so nothing else can have seen the record.
            if let Err(undo) = self.store.delete(&key) {
                error!(error = %undo, "failed to remove record of unqueued task");
            }
            return Err(e);
        }
        debug!("task enqueued");

        self.notifier.task(
            &task.tenant_id,
            &task.user_id,
            TaskEvent::Enqueued {
                task_id: task.task_id.clone(),
                user_id: task.user_id.clone(),
                batch_id: task.batch_id.clone(),
            },
        );
        Ok(task)
    }

    pub fn get(&self, task_id: &TaskId) -> QueueResult<Task> {
        self.load(task_id)?
            .map(|(_, task)| task)
            .ok_or_else(|| QueueError::not_found(format!("task {task_id}")))
    }

    /// Ask for a task to be cancelled.
    ///
    /// A pending task is cancelled on the spot. A leased task only gets its
    /// `cancel_requested` flag set; its worker is expected to notice and
    /// complete with `Outcome::Cancelled`. Terminal tasks are returned as is.
    #[instrument(skip(self), fields(task_id = %task_id))]
    pub fn request_cancel(&self, task_id: &TaskId) -> QueueResult<Task> {
        let updated = self.update_task(task_id, |task, _| {
            if task.status.is_terminal() || task.cancel_requested {
                return Ok(false);
            }
            task.cancel_requested = true;
            Ok(true)
        })?;
        let task = updated.task;

        if updated.written {
            self.notifier.task(
                &task.tenant_id,
                &task.user_id,
                TaskEvent::CancelRequested {
                    task_id: task.task_id.clone(),
                },
            );
        }

        if task.status == TaskStatus::Pending && self.store.remove(&self.queue_key(&task), task_id.as_str())? {
            return self.cancel_pending(task_id);
        }
        Ok(task)
    }

    pub fn is_cancel_requested(&self, task_id: &TaskId) -> QueueResult<bool> {
        Ok(self.get(task_id)?.cancel_requested)
    }

    pub fn queue_depth(&self, tenant_id: &TenantId, user_id: &UserId) -> QueueResult<usize> {
        let user = UserScope::new(tenant_id.clone(), user_id.clone());
        Ok(self.store.list_len(&self.keys.user_queue(&user))?)
    }

    pub fn overflow_depth(&self) -> QueueResult<usize> {
        Ok(self.store.list_len(&self.keys.overflow_queue())?)
    }

    // -- worker side -------------------------------------------------------

    /// Lease the next task, waiting up to `wait_timeout` for one to appear.
    ///
    /// `NoTaskAvailable` when nothing could be leased in time, either because
    /// the queues are empty or because every waiting user is at quota.
    pub fn dequeue(
        &self,
        worker_id: &WorkerId,
        wait_timeout: Duration,
        visibility_timeout: Duration,
    ) -> QueueResult<LeasedTask> {
        let give_up_at = Instant::now() + wait_timeout;

        loop {
            if let Some(leased) = self.try_dequeue(worker_id, visibility_timeout)? {
                return Ok(leased);
            }

            let now = Instant::now();
            if now >= give_up_at {
                return Err(QueueError::NoTaskAvailable);
            }
            thread::sleep(self.config.poll_interval.min(give_up_at - now));
        }
    }

    /// One non-blocking pass over the ring and the overflow queue.
    pub fn try_dequeue(&self, worker_id: &WorkerId, visibility_timeout: Duration) -> QueueResult<Option<LeasedTask>> {
        let ring = self.keys.ring();
        let users = self.store.list_len(&ring)?;

        for _ in 0..users {
            let Some(entry) = self.store.rotate(&ring)? else {
                break;
            };
            let user = match UserScope::decode(&entry) {
                Ok(user) => user,
                Err(e) => {
                    warn!(entry = %entry, error = %e, "dropping undecodable ring entry");
                    self.store.remove(&ring, &entry)?;
                    self.store.set_remove(&self.keys.ring_members(), &entry)?;
                    continue;
                }
            };

            match self.claim_head(&self.keys.user_queue(&user), worker_id, visibility_timeout)? {
                Head::Leased(leased) => return Ok(Some(leased)),
                Head::Blocked => {}
                Head::Empty => self.deindex_user(&user, &entry)?,
            }
        }

        let overflow = self.keys.overflow_queue();
        for id in self.store.range(&overflow, self.config.overflow_scan)? {
            if let Claim::Leased(leased) = self.claim(&overflow, &id, worker_id, visibility_timeout)? {
                return Ok(Some(leased));
            }
        }

        Ok(None)
    }

    /// Push the lease deadline to `now + extension`.
    #[instrument(skip(self, lease_token), fields(task_id = %task_id), err)]
    pub fn renew(&self, task_id: &TaskId, lease_token: &LeaseToken, extension: Duration) -> QueueResult<Lease> {
        let updated = self.update_task(task_id, |task, now| {
            task.ensure_lease(lease_token, now)?;
            task.lease_deadline = Some(add_duration(now, extension));
            Ok(true)
        })?;

        let deadline = updated
            .task
            .lease_deadline
            .ok_or_else(|| QueueError::lease_lost(task_id.as_str()))?;
        self.store
            .zadd(&self.keys.leases(), task_id.as_str(), deadline.timestamp_millis())?;

        Ok(Lease {
            task_id: task_id.clone(),
            lease_token: lease_token.clone(),
            deadline,
        })
    }

    /// Report the task's outcome and give up the lease.
    #[instrument(skip(self, lease_token, outcome), fields(task_id = %task_id), err)]
    pub fn complete(&self, task_id: &TaskId, lease_token: &LeaseToken, outcome: Outcome) -> QueueResult<Task> {
        let updated = self.update_task(task_id, |task, now| {
            task.ensure_lease(lease_token, now)?;
            task.status = outcome.task_status();
            task.lease_token = None;
            task.lease_deadline = None;
            if let Outcome::Failed { reason } = &outcome {
                task.last_error = Some(reason.clone());
            }
            Ok(true)
        })?;
        let task = updated.task;

        self.store.zrem(&self.keys.leases(), task_id.as_str())?;
        self.admission
            .release(&task.tenant_id, &task.user_id, &slot_member(task_id, lease_token))?;
        if let Some(worker_id) = &task.worker_id {
            self.clear_worker_task(worker_id, task_id);
        }

        if let Some(batch_id) = &task.batch_id {
            if let Err(e) = self.batches.record_outcome(batch_id, task_id, &outcome) {
                error!(batch_id = %batch_id, error = %e, "failed to record batch outcome");
                return Err(e);
            }
        }

        info!(status = task.status.as_str(), attempt = task.attempt_count, "task completed");
        self.notifier.task(
            &task.tenant_id,
            &task.user_id,
            TaskEvent::Completed {
                task_id: task_id.clone(),
                status: task.status,
                error: task.last_error.clone(),
            },
        );
        Ok(task)
    }

    // -- reaper side -------------------------------------------------------

    /// Put a task whose lease has expired back at the front of its queue.
    ///
    /// Once the task has been delivered `max_attempts` times it is moved to
    /// the dead-letter list instead and `DeadLetter` is returned.
    #[instrument(skip(self), fields(task_id = %task_id))]
    pub fn requeue(&self, task_id: &TaskId) -> QueueResult<RequeueOutcome> {
        let max_attempts = self.config.max_attempts;
        let mut decision = RequeueOutcome::NotLeased;
        let mut expired: Option<(LeaseToken, Option<WorkerId>)> = None;

        let updated = self.update_task(task_id, |task, now| {
            expired = None;
            if task.status != TaskStatus::Leased {
                decision = RequeueOutcome::NotLeased;
                return Ok(false);
            }
            if !task.lease_expired(now) {
                decision = RequeueOutcome::NotExpired;
                return Ok(false);
            }

            expired = task.lease_token.take().map(|token| (token, task.worker_id.clone()));
            task.lease_deadline = None;
            task.attempt_count += 1;
            if task.attempt_count > max_attempts {
                task.status = TaskStatus::DeadLetter;
                task.last_error = Some(format!("lease expired on each of {max_attempts} deliveries"));
            } else {
                task.status = TaskStatus::Pending;
            }
            decision = RequeueOutcome::Requeued {
                attempt: task.attempt_count,
            };
            Ok(true)
        })?;
        let task = updated.task;

        if !updated.written {
            if decision == RequeueOutcome::NotLeased {
                self.store.zrem(&self.keys.leases(), task_id.as_str())?;
            }
            return Ok(decision);
        }

        self.store.zrem(&self.keys.leases(), task_id.as_str())?;
        if let Some((token, worker_id)) = &expired {
            self.admission
                .release(&task.tenant_id, &task.user_id, &slot_member(task_id, token))?;
            if let Some(worker_id) = worker_id {
                self.clear_worker_task(worker_id, task_id);
            }
        }

        if task.status == TaskStatus::DeadLetter {
            return Err(self.dead_letter(&task));
        }

        self.push_queued(&task, true)?;
        info!(attempt = task.attempt_count, "expired lease requeued");
        self.notifier.task(
            &task.tenant_id,
            &task.user_id,
            TaskEvent::Requeued {
                task_id: task_id.clone(),
                attempt: task.attempt_count,
            },
        );
        Ok(decision)
    }

    /// Force the lease held by `worker_id` to expire now.
    ///
    /// Returns false if the task is not leased by that worker.
    pub fn expire_lease(&self, task_id: &TaskId, worker_id: &WorkerId) -> QueueResult<bool> {
        let updated = self.update_task(task_id, |task, now| {
            if task.status != TaskStatus::Leased || task.worker_id.as_ref() != Some(worker_id) {
                return Ok(false);
            }
            task.lease_deadline = Some(now);
            Ok(true)
        })?;

        if let (true, Some(deadline)) = (updated.written, updated.task.lease_deadline) {
            self.store
                .zadd(&self.keys.leases(), task_id.as_str(), deadline.timestamp_millis())?;
        }
        Ok(updated.written)
    }

    /// Leased tasks whose deadline is at or before `now`, earliest first.
    pub fn expired_leases(&self, now: DateTime<Utc>, limit: usize) -> QueueResult<Vec<TaskId>> {
        self.store
            .zrange_by_score(&self.keys.leases(), now.timestamp_millis(), limit)?
            .into_iter()
            .map(|(member, _)| TaskId::parse(member))
            .collect()
    }

    /// Oldest dead-lettered task ids first.
    pub fn dead_letters(&self, limit: usize) -> QueueResult<Vec<TaskId>> {
        self.store
            .range(&self.keys.dead_letters(), limit)?
            .into_iter()
            .map(TaskId::parse)
            .collect()
    }

    /// Give a dead-lettered task a fresh delivery budget.
    #[instrument(skip(self), fields(task_id = %task_id), err)]
    pub fn retry_dead_letter(&self, task_id: &TaskId) -> QueueResult<Task> {
        let updated = self.update_task(task_id, |task, _| {
            if task.status != TaskStatus::DeadLetter {
                return Err(QueueError::invalid_task(format!(
                    "task {} is {}, not dead-lettered",
                    task.task_id,
                    task.status.as_str()
                )));
            }
            task.status = TaskStatus::Pending;
            task.attempt_count = 1;
            task.worker_id = None;
            Ok(true)
        })?;
        let task = updated.task;

        self.store.remove(&self.keys.dead_letters(), task_id.as_str())?;
        self.push_queued(&task, false)?;
        info!("dead-lettered task retried");
        self.notifier.task(
            &task.tenant_id,
            &task.user_id,
            TaskEvent::Enqueued {
                task_id: task_id.clone(),
                user_id: task.user_id.clone(),
                batch_id: task.batch_id.clone(),
            },
        );
        Ok(task)
    }

    /// Resolve claims whose grace period ended at or before `now`.
    ///
    /// A claim that got as far as leasing its task has its lease indexed;
    /// one that stopped earlier gives back its slot and, if the task is
    /// still pending, puts it back at the front of its queue.
    #[instrument(skip(self))]
    pub fn recover_claims(&self, now: DateTime<Utc>, limit: usize) -> QueueResult<usize> {
        let claims = self.keys.claims();
        let mut recovered = 0;
        for (member, _) in self.store.zrange_by_score(&claims, now.timestamp_millis(), limit)? {
            if self.recover_claim(&member)? {
                recovered += 1;
            }
            self.store.zrem(&claims, &member)?;
        }
        Ok(recovered)
    }

    /// Recount a concurrency scope from its holders.
    ///
    /// A holder stays while its claim is within the grace period, or while
    /// its task is leased under the same token.
    pub fn reconcile_scope(&self, scope: &Scope) -> QueueResult<ReconcileReport> {
        let claims = self.keys.claims();
        let now_ms = self.clock.now().timestamp_millis();
        self.admission.reconcile(scope, |member| {
            if self.store.zscore(&claims, member)?.is_some_and(|until| until > now_ms) {
                return Ok(true);
            }
            let Some((task_id, token)) = parse_slot_member(member) else {
                return Ok(false);
            };
            Ok(match self.load(&task_id)? {
                Some((_, task)) => {
                    task.status == TaskStatus::Leased && task.lease_token.as_ref() == Some(&token)
                }
                None => false,
            })
        })
    }

    /// Scopes whose slot counters the reaper recounts.
    pub fn tracked_scopes(&self) -> QueueResult<Vec<Scope>> {
        self.admission.tracked_scopes()
    }

    /// Re-derive counters of batches that missed an outcome update.
    pub fn resync_dirty_batches(&self, limit: usize) -> QueueResult<usize> {
        self.batches.resync_dirty(limit)
    }

    /// Make the ring and its member set agree. Returns the number of fixes.
    pub fn repair_index(&self) -> QueueResult<usize> {
        let ring = self.keys.ring();
        let members_key = self.keys.ring_members();
        let in_ring = self.store.range(&ring, self.store.list_len(&ring)?)?;
        let members = self.store.set_members(&members_key)?;
        let mut repairs = 0;

        for entry in &in_ring {
            if self.store.set_add(&members_key, entry)? {
                repairs += 1;
            }
        }
        for member in members.iter().filter(|m| !in_ring.contains(m)) {
            self.store.push_back(&ring, member)?;
            repairs += 1;
        }

        if repairs > 0 {
            warn!(repairs, "repaired user ring");
        }
        Ok(repairs)
    }

    // -- internals ---------------------------------------------------------

    fn load(&self, task_id: &TaskId) -> QueueResult<Option<(String, Task)>> {
        record::load(self.store.as_ref(), &self.keys.task(task_id))
    }

    fn queue_key(&self, task: &Task) -> String {
        match task.priority_key {
            PriorityKey::User => self.keys.user_queue(&task.user_scope()),
            PriorityKey::Global => self.keys.overflow_queue(),
        }
    }

    /// Retention applies to finished tasks; dead letters stay until retried.
    fn ttl_for(&self, task: &Task) -> Option<Duration> {
        match task.status {
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Cancelled => Some(self.config.retention),
            _ => None,
        }
    }

    /// Read-modify-write of a task record under compare-and-swap.
    ///
    /// `f` returns `Ok(false)` to leave the record untouched; an error from
    /// `f` aborts without writing.
    fn update_task(
        &self,
        task_id: &TaskId,
        mut f: impl FnMut(&mut Task, DateTime<Utc>) -> QueueResult<bool>,
    ) -> QueueResult<Updated> {
        let key = self.keys.task(task_id);

        for _ in 0..MAX_CAS_ATTEMPTS {
            let (raw, mut task) = self
                .load(task_id)?
                .ok_or_else(|| QueueError::not_found(format!("task {task_id}")))?;
            let now = self.clock.now();

            if !f(&mut task, now)? {
                return Ok(Updated { task, written: false });
            }
            task.updated_at = now;

            if record::swap(self.store.as_ref(), &key, Some(&raw), &task, self.ttl_for(&task))? {
                return Ok(Updated { task, written: true });
            }
        }

        Err(QueueError::store(format!("task {task_id} is contended")))
    }

    /// Append (or, for requeues, prepend) the task to its queue.
    fn push_queued(&self, task: &Task, front: bool) -> QueueResult<()> {
        let queue = self.queue_key(task);
        if front {
            self.store.push_front(&queue, task.task_id.as_str())?;
        } else {
            self.store.push_back(&queue, task.task_id.as_str())?;
        }
        if task.priority_key == PriorityKey::User {
            self.index_user(&task.user_scope())?;
        }
        Ok(())
    }

    fn index_user(&self, user: &UserScope) -> QueueResult<()> {
        let entry = user.encode();
        if self.store.set_add(&self.keys.ring_members(), &entry)? {
            self.store.push_back(&self.keys.ring(), &entry)?;
        }
        Ok(())
    }

    fn deindex_user(&self, user: &UserScope, entry: &str) -> QueueResult<()> {
        self.store.set_remove(&self.keys.ring_members(), entry)?;
        self.store.remove(&self.keys.ring(), entry)?;
        // An enqueue may have slipped in between the empty check and removal.
        if self.store.list_len(&self.keys.user_queue(user))? > 0 {
            self.index_user(user)?;
        }
        Ok(())
    }

    fn claim_head(&self, queue: &str, worker_id: &WorkerId, visibility_timeout: Duration) -> QueueResult<Head> {
        for _ in 0..MAX_HEAD_SKIPS {
            let Some(id) = self.store.front(queue)? else {
                return Ok(Head::Empty);
            };
            match self.claim(queue, &id, worker_id, visibility_timeout)? {
                Claim::Leased(leased) => return Ok(Head::Leased(leased)),
                Claim::Blocked => return Ok(Head::Blocked),
                Claim::Skipped => {}
            }
        }
        Ok(Head::Blocked)
    }

    fn claim(&self, queue: &str, raw_id: &str, worker_id: &WorkerId, visibility_timeout: Duration) -> QueueResult<Claim> {
        let task_id = match TaskId::parse(raw_id) {
            Ok(id) => id,
            Err(_) => {
                self.store.remove(queue, raw_id)?;
                return Ok(Claim::Skipped);
            }
        };

        let task = match self.load(&task_id)? {
            Some((_, task)) if task.status == TaskStatus::Pending => task,
            _ => {
                debug!(task_id = %task_id, "dropping stale queue entry");
                self.store.remove(queue, raw_id)?;
                return Ok(Claim::Skipped);
            }
        };

        if task.cancel_requested {
            if self.store.remove(queue, raw_id)? {
                self.cancel_pending(&task_id)?;
            }
            return Ok(Claim::Skipped);
        }

        let lease_token = LeaseToken::generate();
        let member = slot_member(&task_id, &lease_token);
        let claims = self.keys.claims();
        let grace_until = add_duration(self.clock.now(), self.config.claim_grace);
        self.store.zadd(&claims, &member, grace_until.timestamp_millis())?;

        match self.admission.try_acquire(&task.tenant_id, &task.user_id, &member) {
            Ok(()) => {}
            Err(QueueError::QuotaExceeded { .. }) => {
                self.store.zrem(&claims, &member)?;
                return Ok(Claim::Blocked);
            }
            Err(e) => {
                self.store.zrem(&claims, &member)?;
                return Err(e);
            }
        }

        if !self.store.remove(queue, raw_id)? {
            self.abandon_claim(&task, &member)?;
            return Ok(Claim::Skipped);
        }

        let mut deadline = None;
        let leased = self.update_task(&task_id, |task, now| {
            if task.status != TaskStatus::Pending || task.cancel_requested {
                return Ok(false);
            }
            let until = add_duration(now, visibility_timeout);
            task.status = TaskStatus::Leased;
            task.lease_token = Some(lease_token.clone());
            task.lease_deadline = Some(until);
            task.worker_id = Some(worker_id.clone());
            deadline = Some(until);
            Ok(true)
        });

        let updated = match leased {
            Ok(updated) => updated,
            Err(e) => {
                // Put the entry back so the task is not stranded.
                self.push_queued(&task, true)?;
                self.abandon_claim(&task, &member)?;
                return Err(e);
            }
        };
        let (true, Some(deadline)) = (updated.written, deadline) else {
            self.abandon_claim(&task, &member)?;
            if updated.task.status == TaskStatus::Pending && updated.task.cancel_requested {
                self.cancel_pending(&task_id)?;
            }
            return Ok(Claim::Skipped);
        };
        let task = updated.task;

        self.store
            .zadd(&self.keys.leases(), task_id.as_str(), deadline.timestamp_millis())?;
        self.store.zrem(&claims, &member)?;
        if let Err(e) = self.heartbeats.set_current_task(worker_id, &task_id) {
            warn!(worker_id = %worker_id, task_id = %task_id, error = %e, "failed to record current task");
        }

        debug!(task_id = %task_id, worker_id = %worker_id, attempt = task.attempt_count, "task leased");
        self.notifier.task(
            &task.tenant_id,
            &task.user_id,
            TaskEvent::Leased {
                task_id: task_id.clone(),
                worker_id: worker_id.clone(),
                attempt: task.attempt_count,
                lease_deadline: deadline,
            },
        );

        Ok(Claim::Leased(LeasedTask {
            task,
            lease: Lease {
                task_id,
                lease_token,
                deadline,
            },
        }))
    }

    /// Move a pending task that is no longer queued to `cancelled`.
    fn cancel_pending(&self, task_id: &TaskId) -> QueueResult<Task> {
        let updated = self.update_task(task_id, |task, _| {
            if task.status != TaskStatus::Pending {
                return Ok(false);
            }
            task.status = TaskStatus::Cancelled;
            Ok(true)
        })?;
        let task = updated.task;
        if !updated.written {
            return Ok(task);
        }

        if let Some(batch_id) = &task.batch_id {
            self.batches.record_outcome(batch_id, task_id, &Outcome::Cancelled)?;
        }
        info!(task_id = %task_id, "pending task cancelled");
        self.notifier.task(
            &task.tenant_id,
            &task.user_id,
            TaskEvent::Completed {
                task_id: task_id.clone(),
                status: TaskStatus::Cancelled,
                error: None,
            },
        );
        Ok(task)
    }

    fn abandon_claim(&self, task: &Task, member: &str) -> QueueResult<()> {
        self.admission.release(&task.tenant_id, &task.user_id, member)?;
        self.store.zrem(&self.keys.claims(), member)?;
        Ok(())
    }

    /// Finish or undo one claim that outlived its grace period.
    fn recover_claim(&self, member: &str) -> QueueResult<bool> {
        let Some((task_id, token)) = parse_slot_member(member) else {
            return Ok(false);
        };
        let Some((_, task)) = self.load(&task_id)? else {
            return Ok(false);
        };

        match task.status {
            TaskStatus::Leased if task.lease_token.as_ref() == Some(&token) => {
                if let Some(deadline) = task.lease_deadline {
                    self.store
                        .zadd(&self.keys.leases(), task_id.as_str(), deadline.timestamp_millis())?;
                }
            }
            TaskStatus::Pending => {
                self.admission.release(&task.tenant_id, &task.user_id, member)?;
                if task.cancel_requested {
                    self.cancel_pending(&task_id)?;
                } else {
                    self.store.remove(&self.queue_key(&task), task_id.as_str())?;
                    self.push_queued(&task, true)?;
                    warn!(task_id = %task_id, "requeued task left behind by an abandoned claim");
                }
            }
            _ => {
                self.admission.release(&task.tenant_id, &task.user_id, member)?;
            }
        }
        Ok(true)
    }

    fn dead_letter(&self, task: &Task) -> QueueError {
        let task_id = &task.task_id;
        let attempts = task.attempt_count.saturating_sub(1);

        if let Err(e) = self.store.push_back(&self.keys.dead_letters(), task_id.as_str()) {
            error!(task_id = %task_id, error = %e, "failed to append to dead-letter list");
        }
        if let Some(batch_id) = &task.batch_id {
            if let Err(e) = self
                .batches
                .record_outcome(batch_id, task_id, &Outcome::failed("dead-lettered"))
            {
                error!(batch_id = %batch_id, task_id = %task_id, error = %e, "failed to record dead letter in batch");
            }
        }

        warn!(task_id = %task_id, attempts, "task dead-lettered");
        self.notifier.task(
            &task.tenant_id,
            &task.user_id,
            TaskEvent::DeadLettered {
                task_id: task_id.clone(),
                attempts,
            },
        );

        QueueError::DeadLetter {
            task_id: task_id.to_string(),
            attempts,
        }
    }

    fn clear_worker_task(&self, worker_id: &WorkerId, task_id: &TaskId) {
        if let Err(e) = self.heartbeats.clear_current_task(worker_id, task_id) {
            warn!(worker_id = %worker_id, task_id = %task_id, error = %e, "failed to clear current task");
        }
    }
}

struct Updated {
    task: Task,
    written: bool,
}

#[cfg(test)]
mod tests {
    use fairq_core::{Clock, ManualClock};
    use fairq_events::{Channel, Event, InMemoryNotificationBus, NotificationBus};

    use super::*;
    use crate::admission::AdmissionLimits;
    use crate::lock::LockManager;
    use crate::store::InMemoryKvStore;

    struct Fixture {
        queue: QueueManager,
        clock: Arc<ManualClock>,
        bus: Arc<InMemoryNotificationBus>,
        heartbeats: Arc<HeartbeatRegistry>,
        admission: Arc<AdmissionController>,
    }

    fn fixture(config: QueueConfig) -> Fixture {
        let clock = ManualClock::starting_now();
        let store: SharedStore = Arc::new(InMemoryKvStore::with_clock(clock.clone()));
        let keys = Keys::new(config.key_prefix.clone());
        let bus = InMemoryNotificationBus::arc();
        let notifier = Notifier::new(bus.clone(), clock.clone());
        let locks = Arc::new(LockManager::new(
            store.clone(),
            keys.clone(),
            clock.clone(),
            config.lock_backoff.clone(),
        ));
        let admission = Arc::new(AdmissionController::new(store.clone(), keys.clone(), config.limits.clone()));
        let batches = Arc::new(BatchCoordinator::new(
            store.clone(),
            keys.clone(),
            clock.clone(),
            locks,
            notifier.clone(),
            config.lock_ttl,
            config.lock_wait,
            config.retention,
        ));
        let heartbeats = Arc::new(HeartbeatRegistry::new(
            store.clone(),
            keys.clone(),
            clock.clone(),
            config.heartbeat_ttl,
        ));
        let queue = QueueManager::new(
            store,
            keys,
            clock.clone(),
            admission.clone(),
            batches,
            heartbeats.clone(),
            notifier,
            config,
        );
        Fixture {
            queue,
            clock,
            bus,
            heartbeats,
            admission,
        }
    }

    fn task(user: &str) -> Task {
        Task::new(
            TenantId::parse("acme").unwrap(),
            UserId::parse(user).unwrap(),
            serde_json::json!({"user": user}),
        )
    }

    fn worker() -> WorkerId {
        WorkerId::parse("w1").unwrap()
    }

    const VIS: Duration = Duration::from_secs(30);

    #[test]
    fn enqueue_rejects_duplicates_and_null_payloads() {
        let f = fixture(QueueConfig::default());
        let t = f.queue.enqueue(task("u1")).unwrap();
        assert!(matches!(
            f.queue.enqueue(task("u1").with_id(t.task_id.clone())),
            Err(QueueError::InvalidTask(_))
        ));

        let mut bad = task("u1");
        bad.payload = serde_json::Value::Null;
        assert!(matches!(f.queue.enqueue(bad), Err(QueueError::InvalidTask(_))));
        assert_eq!(f.queue.queue_depth(&t.tenant_id, &t.user_id).unwrap(), 1);
    }

    #[test]
    fn dequeue_leases_in_fifo_order_per_user() {
        let f = fixture(QueueConfig::default());
        let first = f.queue.enqueue(task("u1")).unwrap();
        let second = f.queue.enqueue(task("u1")).unwrap();

        let a = f.queue.try_dequeue(&worker(), VIS).unwrap().unwrap();
        let b = f.queue.try_dequeue(&worker(), VIS).unwrap().unwrap();
        assert_eq!(a.task.task_id, first.task_id);
        assert_eq!(b.task.task_id, second.task_id);
        assert_eq!(a.task.status, TaskStatus::Leased);
        assert_eq!(a.task.attempt_count, 1);
        assert_eq!(a.lease.deadline, f.clock.now() + chrono::Duration::seconds(30));
    }

    #[test]
    fn empty_queue_times_out() {
        let f = fixture(QueueConfig::default().with_poll_interval(Duration::from_millis(5)));
        let started = Instant::now();
        let err = f
            .queue
            .dequeue(&worker(), Duration::from_millis(20), VIS)
            .unwrap_err();
        assert_eq!(err, QueueError::NoTaskAvailable);
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn user_at_quota_is_skipped_for_other_users() {
        let f = fixture(QueueConfig::default().with_user_cap(1));
        f.queue.enqueue(task("greedy")).unwrap();
        f.queue.enqueue(task("greedy")).unwrap();
        let other = f.queue.enqueue(task("polite")).unwrap();

        let first = f.queue.try_dequeue(&worker(), VIS).unwrap().unwrap();
        assert_eq!(first.task.user_id.as_str(), "greedy");

        let second = f.queue.try_dequeue(&worker(), VIS).unwrap().unwrap();
        assert_eq!(second.task.task_id, other.task_id);

        assert!(f.queue.try_dequeue(&worker(), VIS).unwrap().is_none());
        assert_eq!(f.queue.queue_depth(&first.task.tenant_id, &first.task.user_id).unwrap(), 1);
    }

    #[test]
    fn renew_and_complete_enforce_the_fence() {
        let f = fixture(QueueConfig::default());
        f.queue.enqueue(task("u1")).unwrap();
        let leased = f.queue.try_dequeue(&worker(), VIS).unwrap().unwrap();
        let id = &leased.task.task_id;

        let stranger = LeaseToken::generate();
        assert!(matches!(
            f.queue.renew(id, &stranger, VIS),
            Err(QueueError::LeaseLost { .. })
        ));

        f.clock.advance(Duration::from_secs(20));
        let renewed = f.queue.renew(id, &leased.lease.lease_token, VIS).unwrap();
        assert_eq!(renewed.deadline, f.clock.now() + chrono::Duration::seconds(30));

        f.clock.advance(Duration::from_secs(31));
        assert!(matches!(
            f.queue.complete(id, &leased.lease.lease_token, Outcome::Succeeded),
            Err(QueueError::LeaseLost { .. })
        ));
    }

    #[test]
    fn complete_releases_slot_and_publishes() {
        let f = fixture(QueueConfig::default().with_user_cap(1));
        let t = f.queue.enqueue(task("u1")).unwrap();
        let sub = f.bus.subscribe(&Channel::task(&t.task_id));

        let leased = f.queue.try_dequeue(&worker(), VIS).unwrap().unwrap();
        assert_eq!(
            f.heartbeats.get(&worker()).unwrap().unwrap().current_task_id,
            Some(t.task_id.clone())
        );

        let done = f
            .queue
            .complete(&t.task_id, &leased.lease.lease_token, Outcome::failed("bad input"))
            .unwrap();
        assert_eq!(done.status, TaskStatus::Failed);
        assert_eq!(done.last_error.as_deref(), Some("bad input"));
        assert_eq!(f.admission.usage(&Scope::Global).unwrap().current, 0);
        assert_eq!(f.heartbeats.get(&worker()).unwrap().unwrap().current_task_id, None);

        // Completing twice is fenced off.
        assert!(matches!(
            f.queue.complete(&t.task_id, &leased.lease.lease_token, Outcome::Succeeded),
            Err(QueueError::LeaseLost { .. })
        ));

        let kinds: Vec<_> = std::iter::from_fn(|| sub.try_recv().ok())
            .map(|n| match n.event {
                Event::Task(TaskEvent::Leased { .. }) => "leased",
                Event::Task(TaskEvent::Completed { .. }) => "completed",
                _ => "other",
            })
            .collect();
        assert_eq!(kinds, vec!["leased", "completed"]);
    }

    #[test]
    fn requeue_only_touches_expired_leases() {
        let f = fixture(QueueConfig::default());
        let t = f.queue.enqueue(task("u1")).unwrap();
        let leased = f.queue.try_dequeue(&worker(), VIS).unwrap().unwrap();

        assert_eq!(f.queue.requeue(&t.task_id).unwrap(), RequeueOutcome::NotExpired);

        f.clock.advance(VIS);
        assert_eq!(f.queue.expired_leases(f.clock.now(), 10).unwrap(), vec![t.task_id.clone()]);
        assert_eq!(
            f.queue.requeue(&t.task_id).unwrap(),
            RequeueOutcome::Requeued { attempt: 2 }
        );
        assert_eq!(f.queue.requeue(&t.task_id).unwrap(), RequeueOutcome::NotLeased);
        assert!(f.queue.expired_leases(f.clock.now(), 10).unwrap().is_empty());

        // The old holder is fenced off; the next delivery is attempt 2.
        assert!(matches!(
            f.queue.complete(&t.task_id, &leased.lease.lease_token, Outcome::Succeeded),
            Err(QueueError::LeaseLost { .. })
        ));
        let again = f.queue.try_dequeue(&worker(), VIS).unwrap().unwrap();
        assert_eq!(again.task.attempt_count, 2);
    }

    #[test]
    fn requeue_goes_to_front_of_queue() {
        let f = fixture(QueueConfig::default());
        let first = f.queue.enqueue(task("u1")).unwrap();
        f.queue.try_dequeue(&worker(), VIS).unwrap().unwrap();
        f.queue.enqueue(task("u1")).unwrap();

        f.clock.advance(VIS);
        f.queue.requeue(&first.task_id).unwrap();

        let next = f.queue.try_dequeue(&worker(), VIS).unwrap().unwrap();
        assert_eq!(next.task.task_id, first.task_id);
    }

    #[test]
    fn exhausted_task_is_dead_lettered_and_can_be_retried() {
        let f = fixture(QueueConfig::default().with_max_attempts(2));
        let t = f.queue.enqueue(task("u1")).unwrap();

        f.queue.try_dequeue(&worker(), VIS).unwrap().unwrap();
        f.clock.advance(VIS);
        f.queue.requeue(&t.task_id).unwrap();

        f.queue.try_dequeue(&worker(), VIS).unwrap().unwrap();
        f.clock.advance(VIS);
        let err = f.queue.requeue(&t.task_id).unwrap_err();
        assert_eq!(
            err,
            QueueError::DeadLetter {
                task_id: t.task_id.to_string(),
                attempts: 2
            }
        );

        assert_eq!(f.queue.get(&t.task_id).unwrap().status, TaskStatus::DeadLetter);
        assert_eq!(f.queue.dead_letters(10).unwrap(), vec![t.task_id.clone()]);
        assert_eq!(f.admission.usage(&Scope::Global).unwrap().current, 0);
        assert!(f.queue.try_dequeue(&worker(), VIS).unwrap().is_none());

        let retried = f.queue.retry_dead_letter(&t.task_id).unwrap();
        assert_eq!(retried.attempt_count, 1);
        assert!(f.queue.dead_letters(10).unwrap().is_empty());
        assert!(f.queue.try_dequeue(&worker(), VIS).unwrap().is_some());
    }

    #[test]
    fn cancelling_a_pending_task_removes_it() {
        let f = fixture(QueueConfig::default());
        let t = f.queue.enqueue(task("u1")).unwrap();

        let cancelled = f.queue.request_cancel(&t.task_id).unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        assert_eq!(f.queue.queue_depth(&t.tenant_id, &t.user_id).unwrap(), 0);
        assert!(f.queue.try_dequeue(&worker(), VIS).unwrap().is_none());
    }

    #[test]
    fn cancelling_a_leased_task_sets_the_flag() {
        let f = fixture(QueueConfig::default());
        let t = f.queue.enqueue(task("u1")).unwrap();
        let leased = f.queue.try_dequeue(&worker(), VIS).unwrap().unwrap();

        let flagged = f.queue.request_cancel(&t.task_id).unwrap();
        assert_eq!(flagged.status, TaskStatus::Leased);
        assert!(f.queue.is_cancel_requested(&t.task_id).unwrap());

        let done = f
            .queue
            .complete(&t.task_id, &leased.lease.lease_token, Outcome::Cancelled)
            .unwrap();
        assert_eq!(done.status, TaskStatus::Cancelled);
    }

    #[test]
    fn expire_lease_requires_the_holding_worker() {
        let f = fixture(QueueConfig::default());
        let t = f.queue.enqueue(task("u1")).unwrap();
        f.queue.try_dequeue(&worker(), VIS).unwrap().unwrap();

        assert!(!f.queue.expire_lease(&t.task_id, &WorkerId::parse("w2").unwrap()).unwrap());
        assert!(f.queue.expire_lease(&t.task_id, &worker()).unwrap());
        assert_eq!(
            f.queue.requeue(&t.task_id).unwrap(),
            RequeueOutcome::Requeued { attempt: 2 }
        );
    }

    #[test]
    fn overflow_queue_is_served_after_users() {
        let f = fixture(QueueConfig::default());
        let shared = f.queue.enqueue(task("u1").with_priority(PriorityKey::Global)).unwrap();
        let own = f.queue.enqueue(task("u2")).unwrap();
        assert_eq!(f.queue.overflow_depth().unwrap(), 1);

        let a = f.queue.try_dequeue(&worker(), VIS).unwrap().unwrap();
        let b = f.queue.try_dequeue(&worker(), VIS).unwrap().unwrap();
        assert_eq!(a.task.task_id, own.task_id);
        assert_eq!(b.task.task_id, shared.task_id);
    }

    #[test]
    fn reconcile_keeps_live_leases_and_drops_leaks() {
        let f = fixture(QueueConfig::default());
        let t = f.queue.enqueue(task("u1")).unwrap();
        let leased = f.queue.try_dequeue(&worker(), VIS).unwrap().unwrap();
        let scope = Scope::user(&t.tenant_id, &t.user_id);

        // A reservation whose claim never finished.
        f.admission
            .try_acquire(&t.tenant_id, &t.user_id, &slot_member(&TaskId::parse("gone").unwrap(), &LeaseToken::generate()))
            .unwrap();
        assert_eq!(f.admission.usage(&scope).unwrap().current, 2);

        let report = f.queue.reconcile_scope(&scope).unwrap();
        assert_eq!(report.current, 1);
        assert_eq!(
            f.admission.holders(&scope).unwrap(),
            vec![slot_member(&t.task_id, &leased.lease.lease_token)]
        );
    }

    #[test]
    fn repair_index_restores_missing_ring_entries() {
        let f = fixture(QueueConfig::default());
        let t = f.queue.enqueue(task("u1")).unwrap();
        let entry = t.user_scope().encode();
        f.queue.store.remove(&f.queue.keys.ring(), &entry).unwrap();
        assert!(f.queue.try_dequeue(&worker(), VIS).unwrap().is_none());

        assert_eq!(f.queue.repair_index().unwrap(), 1);
        assert!(f.queue.try_dequeue(&worker(), VIS).unwrap().is_some());
    }

    #[test]
    fn reconcile_prunes_a_slot_whose_claim_died_before_removing_the_entry() {
        let f = fixture(QueueConfig::default().with_user_cap(1));
        let t = f.queue.enqueue(task("u1")).unwrap();
        let scope = Scope::user(&t.tenant_id, &t.user_id);

        // The task is still pending and queued, but its only slot is held
        // by a claim that was never recorded or finished.
        let member = slot_member(&t.task_id, &LeaseToken::generate());
        f.admission.try_acquire(&t.tenant_id, &t.user_id, &member).unwrap();
        assert!(f.queue.try_dequeue(&worker(), VIS).unwrap().is_none());

        let report = f.queue.reconcile_scope(&scope).unwrap();
        assert_eq!(report.pruned, vec![member]);
        assert_eq!(f.admission.usage(&scope).unwrap().current, 0);
        assert!(f.queue.try_dequeue(&worker(), VIS).unwrap().is_some());
    }

    #[test]
    fn a_claim_within_its_grace_period_keeps_its_slot() {
        let f = fixture(QueueConfig::default());
        let t = f.queue.enqueue(task("u1")).unwrap();
        let scope = Scope::user(&t.tenant_id, &t.user_id);
        let member = slot_member(&t.task_id, &LeaseToken::generate());
        let until = add_duration(f.clock.now(), f.queue.config.claim_grace);
        f.queue
            .store
            .zadd(&f.queue.keys.claims(), &member, until.timestamp_millis())
            .unwrap();
        f.admission.try_acquire(&t.tenant_id, &t.user_id, &member).unwrap();

        assert!(f.queue.reconcile_scope(&scope).unwrap().pruned.is_empty());

        f.clock.advance(f.queue.config.claim_grace + Duration::from_secs(1));
        assert_eq!(f.queue.reconcile_scope(&scope).unwrap().pruned, vec![member]);
    }

    #[test]
    fn abandoned_claim_after_queue_removal_is_requeued() {
        let f = fixture(QueueConfig::default().with_claim_grace(Duration::from_secs(5)));
        let t = f.queue.enqueue(task("u1")).unwrap();
        let queue = f.queue.queue_key(&t);

        // A dequeue that took the entry off the queue and then died before
        // leasing the task.
        let member = slot_member(&t.task_id, &LeaseToken::generate());
        let until = add_duration(f.clock.now(), Duration::from_secs(5));
        f.queue
            .store
            .zadd(&f.queue.keys.claims(), &member, until.timestamp_millis())
            .unwrap();
        f.admission.try_acquire(&t.tenant_id, &t.user_id, &member).unwrap();
        assert!(f.queue.store.remove(&queue, t.task_id.as_str()).unwrap());
        assert!(f.queue.try_dequeue(&worker(), VIS).unwrap().is_none());

        assert_eq!(f.queue.recover_claims(f.clock.now(), 10).unwrap(), 0);

        f.clock.advance(Duration::from_secs(6));
        assert_eq!(f.queue.recover_claims(f.clock.now(), 10).unwrap(), 1);
        assert_eq!(f.queue.queue_depth(&t.tenant_id, &t.user_id).unwrap(), 1);
        assert_eq!(f.admission.usage(&Scope::Global).unwrap().current, 0);
        assert!(f.queue.store.zscore(&f.queue.keys.claims(), &member).unwrap().is_none());

        let leased = f.queue.try_dequeue(&worker(), VIS).unwrap().unwrap();
        assert_eq!(leased.task.task_id, t.task_id);
    }

    #[test]
    fn abandoned_claim_after_leasing_gets_its_lease_indexed() {
        let f = fixture(QueueConfig::default().with_claim_grace(Duration::from_secs(5)));
        let t = f.queue.enqueue(task("u1")).unwrap();
        let leased = f.queue.try_dequeue(&worker(), VIS).unwrap().unwrap();
        let member = slot_member(&t.task_id, &leased.lease.lease_token);

        // The claim died after the compare-and-swap but before indexing the lease.
        f.queue.store.zrem(&f.queue.keys.leases(), t.task_id.as_str()).unwrap();
        f.queue.store.zadd(&f.queue.keys.claims(), &member, 0).unwrap();

        assert_eq!(f.queue.recover_claims(f.clock.now(), 10).unwrap(), 1);
        f.clock.advance(VIS);
        assert_eq!(f.queue.expired_leases(f.clock.now(), 10).unwrap(), vec![t.task_id.clone()]);
        assert_eq!(
            f.queue.requeue(&t.task_id).unwrap(),
            RequeueOutcome::Requeued { attempt: 2 }
        );
    }

    #[test]
    fn finished_claims_leave_nothing_behind() {
        let f = fixture(QueueConfig::default().with_user_cap(1));
        f.queue.enqueue(task("u1")).unwrap();
        f.queue.enqueue(task("u1")).unwrap();

        f.queue.try_dequeue(&worker(), VIS).unwrap().unwrap();
        // Blocked by the user cap.
        assert!(f.queue.try_dequeue(&worker(), VIS).unwrap().is_none());

        let claims = f.queue.store.zrange_by_score(&f.queue.keys.claims(), i64::MAX, 10).unwrap();
        assert!(claims.is_empty());
    }
}
