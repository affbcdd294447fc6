//! Task queue with fair, lease-based delivery.
//!
//! - `Task`: the stored record
//! - `QueueManager`: enqueue, dequeue, renew, complete, and the reaper's
//!   requeue/expire operations

pub mod manager;
pub mod types;

pub use manager::QueueManager;
pub use types::{Lease, LeasedTask, NewTask, RequeueOutcome, Task};
