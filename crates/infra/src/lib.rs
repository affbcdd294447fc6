//! Infrastructure layer: shared store, queue, admission, locks, batches,
//! heartbeats and the reaper.

pub mod admission;
pub mod batch;
pub mod config;
pub mod event_bus;
pub mod heartbeat;
pub mod keys;
pub mod lock;
pub mod queue;
pub mod reaper;
pub mod retry;
pub mod service;
pub mod store;
pub mod worker;

mod record;


pub use admission::{AdmissionController, AdmissionLimits, SlotUsage};
pub use batch::{Batch, BatchCoordinator, BatchProgress};
pub use config::QueueConfig;
pub use heartbeat::{HeartbeatRegistry, WorkerHeartbeat, WorkerState};
pub use lock::{LockGrant, LockManager};
pub use queue::{Lease, LeasedTask, NewTask, QueueManager, RequeueOutcome, Task};
pub use reaper::{ReapReport, Reaper, ReaperHandle};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use service::{BatchSubmission, TaskService};
pub use store::{InMemoryKvStore, KvStore, SharedStore};
pub use worker::{Processed, TaskContext, TaskWorker, TaskWorkerConfig, TaskWorkerHandle};
