//! Recovery of work held by expired leases and dead workers.
//!
//! One pass (`run_once`):
//!
//! 1. finish or undo dequeue claims whose grace period has ended
//! 2. requeue every task whose lease deadline has passed
//! 3. for each worker presumed dead, expire the lease on its current task,
//!    requeue it and forget the worker
//! 4. recount the global slot scope and every user scope holding slots
//! 5. re-derive batch counters that missed an update
//! 6. repair the user ring
//!
//! Requeue is idempotent, so several reapers may run concurrently.

use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use fairq_core::{QueueError, QueueResult, SharedClock, TaskId};

use crate::heartbeat::HeartbeatRegistry;
use crate::keys::Scope;
use crate::queue::{QueueManager, RequeueOutcome};

/// What one pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ReapReport {
    pub claims_recovered: usize,
    pub requeued: usize,
    pub dead_lettered: usize,
    pub dead_workers: usize,
    pub slots_pruned: usize,
    pub batch_resyncs: usize,
    pub ring_repairs: usize,
    pub errors: usize,
}

/// Running totals of a spawned reaper.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ReaperStats {
    pub passes: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
    pub dead_workers: u64,
    pub errors: u64,
    pub last_pass_at: Option<DateTime<Utc>>,
    pub uptime_secs: u64,
}

#[derive(Debug)]
pub struct ReaperHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<ReaperStats>>,
}

impl ReaperHandle {
    /// Stop after the current pass and wait for the thread to exit.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    pub fn stats(&self) -> ReaperStats {
        self.stats.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

pub struct Reaper {
    queue: Arc<QueueManager>,
    heartbeats: Arc<HeartbeatRegistry>,
    clock: SharedClock,
    batch: usize,
}

impl core::fmt::Debug for Reaper {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Reaper").field("batch", &self.batch).finish_non_exhaustive()
    }
}

impl Reaper {
    pub fn new(queue: Arc<QueueManager>, heartbeats: Arc<HeartbeatRegistry>, clock: SharedClock) -> Self {
        let batch = queue.config().reap_batch;
        Self {
            queue,
            heartbeats,
            clock,
            batch,
        }
    }

    pub fn run_once(&self) -> QueueResult<ReapReport> {
        let mut report = ReapReport::default();

        match self.queue.recover_claims(self.clock.now(), self.batch) {
            Ok(n) => report.claims_recovered = n,
            Err(e) => {
                error!(error = %e, "failed to recover abandoned claims");
                report.errors += 1;
            }
        }

        for task_id in self.queue.expired_leases(self.clock.now(), self.batch)? {
            self.requeue(&task_id, &mut report);
        }

        let dead = self.heartbeats.presumed_dead(self.batch)?;
        for hb in &dead {
            report.dead_workers += 1;
            warn!(worker_id = %hb.worker_id, last_seen = %hb.last_seen, "worker presumed dead");

            if let Some(task_id) = &hb.current_task_id {
                match self.queue.expire_lease(task_id, &hb.worker_id) {
                    Ok(true) => self.requeue(task_id, &mut report),
                    Ok(false) => {}
                    Err(QueueError::NotFound(_)) => {}
                    Err(e) => {
                        error!(task_id = %task_id, error = %e, "failed to expire lease of dead worker");
                        report.errors += 1;
                    }
                }
            }

            if let Err(e) = self.heartbeats.forget(&hb.worker_id) {
                error!(worker_id = %hb.worker_id, error = %e, "failed to forget dead worker");
                report.errors += 1;
            }
        }

        for scope in self.queue.tracked_scopes()? {
            self.reconcile(&scope, &mut report);
        }

        match self.queue.resync_dirty_batches(self.batch) {
            Ok(n) => report.batch_resyncs = n,
            Err(e) => {
                error!(error = %e, "failed to resync batch counters");
                report.errors += 1;
            }
        }

        match self.queue.repair_index() {
            Ok(n) => report.ring_repairs = n,
            Err(e) => {
                error!(error = %e, "failed to repair user ring");
                report.errors += 1;
            }
        }

        if report != ReapReport::default() {
            info!(
                claims_recovered = report.claims_recovered,
                requeued = report.requeued,
                dead_lettered = report.dead_lettered,
                dead_workers = report.dead_workers,
                slots_pruned = report.slots_pruned,
                batch_resyncs = report.batch_resyncs,
                errors = report.errors,
                "reaper pass"
            );
        }
        Ok(report)
    }

    fn requeue(&self, task_id: &TaskId, report: &mut ReapReport) {
        match self.queue.requeue(task_id) {
            Ok(RequeueOutcome::Requeued { .. }) => report.requeued += 1,
            Ok(_) => {}
            Err(QueueError::DeadLetter { .. }) => report.dead_lettered += 1,
            Err(QueueError::NotFound(_)) => {
                debug!(task_id = %task_id, "lease index pointed at a missing task");
            }
            Err(e) => {
                error!(task_id = %task_id, error = %e, "failed to requeue task");
                report.errors += 1;
            }
        }
    }

    fn reconcile(&self, scope: &Scope, report: &mut ReapReport) {
        match self.queue.reconcile_scope(scope) {
            Ok(r) => report.slots_pruned += r.pruned.len(),
            Err(e) => {
                error!(scope = %scope, error = %e, "failed to reconcile slots");
                report.errors += 1;
            }
        }
    }

    /// Run `run_once` every `interval` on a background thread.
    pub fn spawn(self, interval: Duration) -> std::io::Result<ReaperHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(ReaperStats::default()));
        let stats_clone = stats.clone();

        let join = thread::Builder::new()
            .name("fairq-reaper".to_string())
            .spawn(move || reaper_loop(self, interval, shutdown_rx, stats_clone))?;

        Ok(ReaperHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }
}

fn reaper_loop(reaper: Reaper, interval: Duration, shutdown_rx: mpsc::Receiver<()>, stats: Arc<Mutex<ReaperStats>>) {
    info!(interval_ms = interval.as_millis() as u64, "reaper started");
    let start_time = Instant::now();

    loop {
        let pass = reaper.run_once();

        {
            let mut s = stats.lock().unwrap_or_else(|p| p.into_inner());
            s.passes += 1;
            s.uptime_secs = start_time.elapsed().as_secs();
            s.last_pass_at = Some(reaper.clock.now());
            match &pass {
                Ok(r) => {
                    s.requeued += r.requeued as u64;
                    s.dead_lettered += r.dead_lettered as u64;
                    s.dead_workers += r.dead_workers as u64;
                    s.errors += r.errors as u64;
                }
                Err(_) => s.errors += 1,
            }
        }

        if let Err(e) = pass {
            error!(error = %e, "reaper pass failed");
        }

        match shutdown_rx.recv_timeout(interval) {
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    info!("reaper stopped");
}
