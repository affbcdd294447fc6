//! `fairq-core`: building blocks shared by every fairq crate.
//!
//! This crate contains identifiers, the error taxonomy and the clock
//! abstraction. It has no storage or transport concerns.

pub mod clock;
pub mod error;
pub mod id;
pub mod status;

pub use clock::{add_duration, Clock, ManualClock, SharedClock, SystemClock};
pub use error::{QueueError, QueueResult};
pub use status::{BatchStatus, Outcome, PriorityKey, TaskStatus};
pub use id::{BatchId, LeaseToken, LockToken, TaskId, TenantId, UserId, WorkerId};
