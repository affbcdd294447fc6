//! Worker runtime: dequeue, run a handler, report the outcome.
//!
//! Cancellation is cooperative. Handlers are expected to call
//! `TaskContext::is_cancel_requested` at safe points and return
//! `Outcome::Cancelled` when it turns true; the core never interrupts a
//! running handler.

use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use fairq_core::{Outcome, QueueError, QueueResult, TaskStatus, WorkerId};

use crate::heartbeat::HeartbeatRegistry;
use crate::queue::{Lease, LeasedTask, QueueManager, Task};

/// Task handler function type.
pub type TaskHandler = Box<dyn Fn(&TaskContext<'_>) -> Outcome + Send + Sync>;

/// What a handler sees while it runs.
pub struct TaskContext<'a> {
    leased: &'a LeasedTask,
    worker_id: &'a WorkerId,
    queue: &'a QueueManager,
    heartbeats: &'a HeartbeatRegistry,
}

impl TaskContext<'_> {
    pub fn task(&self) -> &Task {
        &self.leased.task
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.leased.task.payload
    }

    pub fn lease(&self) -> &Lease {
        &self.leased.lease
    }

    pub fn attempt(&self) -> u32 {
        self.leased.task.attempt_count
    }

    /// Poll at safe points; a read error counts as "not requested".
    pub fn is_cancel_requested(&self) -> bool {
        self.queue
            .is_cancel_requested(&self.leased.task.task_id)
            .unwrap_or(false)
    }

    /// Extend the lease and refresh the worker heartbeat.
    pub fn renew(&self, extension: Duration) -> QueueResult<Lease> {
        self.heartbeats.touch(self.worker_id)?;
        self.queue
            .renew(&self.leased.task.task_id, &self.leased.lease.lease_token, extension)
    }
}

#[derive(Debug, Clone)]
pub struct TaskWorkerConfig {
    pub worker_id: WorkerId,
    /// Longest a single dequeue call blocks.
    pub wait_timeout: Duration,
    pub visibility_timeout: Duration,
    /// Sleep after an unexpected error before polling again.
    pub error_backoff: Duration,
}

impl TaskWorkerConfig {
    pub fn new(worker_id: WorkerId, visibility_timeout: Duration) -> Self {
        Self {
            worker_id,
            wait_timeout: Duration::from_secs(1),
            visibility_timeout,
            error_backoff: Duration::from_millis(250),
        }
    }

    pub fn with_wait_timeout(mut self, wait: Duration) -> Self {
        self.wait_timeout = wait;
        self
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WorkerStats {
    pub tasks_processed: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub tasks_cancelled: u64,
    pub leases_lost: u64,
    pub uptime_secs: u64,
}

#[derive(Debug)]
pub struct TaskWorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl TaskWorkerHandle {
    /// Finish the current task, then stop.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

/// What happened to one dequeued task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Processed {
    Completed(TaskStatus),
    /// The lease expired or was taken over before the outcome was recorded.
    LeaseLost,
}

pub struct TaskWorker {
    queue: Arc<QueueManager>,
    heartbeats: Arc<HeartbeatRegistry>,
    handler: TaskHandler,
    config: TaskWorkerConfig,
}

impl TaskWorker {
    pub fn new<F>(
        queue: Arc<QueueManager>,
        heartbeats: Arc<HeartbeatRegistry>,
        config: TaskWorkerConfig,
        handler: F,
    ) -> Self
    where
        F: Fn(&TaskContext<'_>) -> Outcome + Send + Sync + 'static,
    {
        Self {
            queue,
            heartbeats,
            handler: Box::new(handler),
            config,
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.config.worker_id
    }

    /// Dequeue one task (waiting up to `wait_timeout`) and run it.
    ///
    /// `Ok(None)` when no task became available.
    pub fn run_once(&self) -> QueueResult<Option<Processed>> {
        self.heartbeats.touch(&self.config.worker_id)?;

        let leased = match self.queue.dequeue(
            &self.config.worker_id,
            self.config.wait_timeout,
            self.config.visibility_timeout,
        ) {
            Ok(leased) => leased,
            Err(QueueError::NoTaskAvailable) => return Ok(None),
            Err(e) => return Err(e),
        };

        let ctx = TaskContext {
            leased: &leased,
            worker_id: &self.config.worker_id,
            queue: &self.queue,
            heartbeats: &self.heartbeats,
        };
        let outcome = (self.handler)(&ctx);

        match self
            .queue
            .complete(&leased.task.task_id, &leased.lease.lease_token, outcome)
        {
            Ok(task) => Ok(Some(Processed::Completed(task.status))),
            Err(QueueError::LeaseLost { .. }) => {
                warn!(
                    worker_id = %self.config.worker_id,
                    task_id = %leased.task.task_id,
                    "lease lost before completion; outcome discarded"
                );
                Ok(Some(Processed::LeaseLost))
            }
            Err(e) => Err(e),
        }
    }

    /// Run the worker loop on a background thread.
    pub fn spawn(self) -> std::io::Result<TaskWorkerHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        let stats_clone = stats.clone();

        let join = thread::Builder::new()
            .name(format!("fairq-worker-{}", self.config.worker_id))
            .spawn(move || worker_loop(self, shutdown_rx, stats_clone))?;

        Ok(TaskWorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }
}

fn worker_loop(worker: TaskWorker, shutdown_rx: mpsc::Receiver<()>, stats: Arc<Mutex<WorkerStats>>) {
    let worker_id = worker.config.worker_id.clone();
    info!(worker_id = %worker_id, "worker started");
    let start_time = Instant::now();

    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        let result = worker.run_once();

        {
            let mut s = stats.lock().unwrap_or_else(|p| p.into_inner());
            s.uptime_secs = start_time.elapsed().as_secs();
            if let Ok(Some(processed)) = &result {
                s.tasks_processed += 1;
                match processed {
                    Processed::Completed(TaskStatus::Succeeded) => s.tasks_succeeded += 1,
                    Processed::Completed(TaskStatus::Cancelled) => s.tasks_cancelled += 1,
                    Processed::Completed(_) => s.tasks_failed += 1,
                    Processed::LeaseLost => s.leases_lost += 1,
                }
            }
        }

        match result {
            Ok(Some(processed)) => debug!(worker_id = %worker_id, ?processed, "task processed"),
            Ok(None) => {}
            Err(e) => {
                error!(worker_id = %worker_id, error = %e, "worker iteration failed");
                thread::sleep(worker.config.error_backoff);
            }
        }
    }

    info!(worker_id = %worker_id, "worker stopped");
}
