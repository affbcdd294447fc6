//! Producer / worker / observer facade.
//!
//! Wires the components over one store, bus and clock and exposes the
//! operations the surrounding application calls.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use fairq_core::{
    BatchId, LeaseToken, Outcome, QueueError, QueueResult, SharedClock, SystemClock, TaskId, TenantId, UserId,
    WorkerId,
};
use fairq_events::{Channel, InMemoryNotificationBus, NotificationBus, SharedBus, Subscription};

use crate::admission::AdmissionController;
use crate::batch::{BatchCoordinator, BatchProgress};
use crate::config::QueueConfig;
use crate::event_bus::Notifier;
use crate::heartbeat::{HeartbeatRegistry, WorkerHeartbeat};
use crate::keys::Keys;
use crate::lock::LockManager;
use crate::queue::{Lease, LeasedTask, NewTask, QueueManager, Task};
use crate::reaper::Reaper;
use crate::store::{InMemoryKvStore, SharedStore};
use crate::worker::{TaskContext, TaskWorker, TaskWorkerConfig};

/// A submitted batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSubmission {
    pub batch_id: BatchId,
    pub task_ids: Vec<TaskId>,
}

pub struct TaskService {
    queue: Arc<QueueManager>,
    batches: Arc<BatchCoordinator>,
    heartbeats: Arc<HeartbeatRegistry>,
    admission: Arc<AdmissionController>,
    locks: Arc<LockManager>,
    bus: SharedBus,
    clock: SharedClock,
}

impl core::fmt::Debug for TaskService {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TaskService")
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

impl TaskService {
    pub fn new(store: SharedStore, bus: SharedBus, clock: SharedClock, config: QueueConfig) -> Self {
        let keys = Keys::new(config.key_prefix.clone());
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
            locks.clone(),
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
        let queue = Arc::new(QueueManager::new(
            store,
            keys,
            clock.clone(),
            admission.clone(),
            batches.clone(),
            heartbeats.clone(),
            notifier,
            config,
        ));

        Self {
            queue,
            batches,
            heartbeats,
            admission,
            locks,
            bus,
            clock,
        }
    }

    /// Single-process service over the in-memory store and bus.
    pub fn in_memory(config: QueueConfig) -> Self {
        Self::in_memory_with_clock(config, SystemClock::shared())
    }

    pub fn in_memory_with_clock(config: QueueConfig, clock: SharedClock) -> Self {
        let store = Arc::new(InMemoryKvStore::with_clock(clock.clone()));
        Self::new(store, InMemoryNotificationBus::arc(), clock, config)
    }

    pub fn queue(&self) -> &Arc<QueueManager> {
        &self.queue
    }

    pub fn batches(&self) -> &Arc<BatchCoordinator> {
        &self.batches
    }

    pub fn heartbeats(&self) -> &Arc<HeartbeatRegistry> {
        &self.heartbeats
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn config(&self) -> &QueueConfig {
        self.queue.config()
    }

    // -- producers ---------------------------------------------------------

    pub fn submit_task(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
        payload: serde_json::Value,
        batch_id: Option<BatchId>,
    ) -> QueueResult<TaskId> {
        let mut task = Task::new(tenant_id, user_id, payload);
        task.batch_id = batch_id;
        self.submit(task)
    }

    /// Submit a fully specified task (custom id or priority key).
    pub fn submit(&self, task: Task) -> QueueResult<TaskId> {
        Ok(self.queue.enqueue(task)?.task_id)
    }

    /// Create a batch and enqueue its tasks.
    ///
    /// Every task is validated before anything is stored, so an invalid
    /// entry rejects the whole submission. If storing fails part way, the
    /// tasks already queued are cancelled and the rest are counted as failed,
    /// so the batch still reaches a terminal status.
    pub fn submit_batch(&self, tenant_id: TenantId, tasks: Vec<NewTask>) -> QueueResult<BatchSubmission> {
        if tasks.is_empty() {
            return Err(QueueError::invalid_task("a batch needs at least one task"));
        }
        let total = u32::try_from(tasks.len()).map_err(|_| QueueError::invalid_task("batch is too large"))?;

        let prepared: Vec<Task> = tasks
            .into_iter()
            .map(|t| Task::new(tenant_id.clone(), t.user_id, t.payload).with_priority(t.priority_key))
            .collect();
        for task in &prepared {
            task.validate()?;
        }

        let batch = self.batches.create_batch(&tenant_id, total)?;
        let all_ids: Vec<TaskId> = prepared.iter().map(|t| t.task_id.clone()).collect();
        let mut task_ids = Vec::with_capacity(prepared.len());
        for task in prepared {
            match self.submit(task.with_batch(batch.batch_id.clone())) {
                Ok(task_id) => task_ids.push(task_id),
                Err(e) => {
                    self.abort_batch(&batch.batch_id, &task_ids, &all_ids[task_ids.len()..]);
                    return Err(e);
                }
            }
        }

        info!(batch_id = %batch.batch_id, total, "batch submitted");
        Ok(BatchSubmission {
            batch_id: batch.batch_id,
            task_ids,
        })
    }

    fn abort_batch(&self, batch_id: &BatchId, enqueued: &[TaskId], unsubmitted: &[TaskId]) {
        warn!(
            batch_id = %batch_id,
            enqueued = enqueued.len(),
            unsubmitted = unsubmitted.len(),
            "batch submission failed part way, aborting"
        );
        for task_id in enqueued {
            if let Err(e) = self.queue.request_cancel(task_id) {
                error!(batch_id = %batch_id, task_id = %task_id, error = %e, "failed to cancel task of aborted batch");
            }
        }
        let aborted = Outcome::failed("batch submission aborted");
        for task_id in unsubmitted {
            if let Err(e) = self.batches.record_outcome(batch_id, task_id, &aborted) {
                error!(batch_id = %batch_id, task_id = %task_id, error = %e, "failed to record aborted task");
            }
        }
    }

    pub fn get_task_status(&self, task_id: &TaskId) -> QueueResult<Task> {
        self.queue.get(task_id)
    }

    pub fn get_batch_progress(&self, batch_id: &BatchId) -> QueueResult<BatchProgress> {
        self.batches.progress(batch_id)
    }

    pub fn cancel_task(&self, task_id: &TaskId) -> QueueResult<Task> {
        self.queue.request_cancel(task_id)
    }

    // -- workers -----------------------------------------------------------

    pub fn dequeue(
        &self,
        worker_id: &WorkerId,
        wait_timeout: Duration,
        visibility_timeout: Duration,
    ) -> QueueResult<LeasedTask> {
        self.queue.dequeue(worker_id, wait_timeout, visibility_timeout)
    }

    pub fn renew(&self, task_id: &TaskId, lease_token: &LeaseToken, extension: Duration) -> QueueResult<Lease> {
        self.queue.renew(task_id, lease_token, extension)
    }

    pub fn complete(&self, task_id: &TaskId, lease_token: &LeaseToken, outcome: Outcome) -> QueueResult<Task> {
        self.queue.complete(task_id, lease_token, outcome)
    }

    pub fn is_cancel_requested(&self, task_id: &TaskId) -> QueueResult<bool> {
        self.queue.is_cancel_requested(task_id)
    }

    pub fn touch(&self, worker_id: &WorkerId) -> QueueResult<WorkerHeartbeat> {
        self.heartbeats.touch(worker_id)
    }

    /// Worker settings using the configured visibility timeout.
    pub fn worker_config(&self, worker_id: WorkerId) -> TaskWorkerConfig {
        TaskWorkerConfig::new(worker_id, self.config().visibility_timeout)
    }

    /// Build a worker runtime bound to this service.
    pub fn worker<F>(&self, config: TaskWorkerConfig, handler: F) -> TaskWorker
    where
        F: Fn(&TaskContext<'_>) -> Outcome + Send + Sync + 'static,
    {
        TaskWorker::new(self.queue.clone(), self.heartbeats.clone(), config, handler)
    }

    // -- observers and operators ------------------------------------------

    pub fn subscribe(&self, channel: &Channel) -> Subscription {
        self.bus.subscribe(channel)
    }

    pub fn reaper(&self) -> Reaper {
        Reaper::new(self.queue.clone(), self.heartbeats.clone(), self.clock.clone())
    }
}
