//! Task records and lease grants.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use fairq_core::{
    BatchId, LeaseToken, PriorityKey, QueueError, QueueResult, TaskId, TaskStatus, TenantId, UserId, WorkerId,
};

use crate::keys::UserScope;

/// A unit of work.
///
/// Mutated only by the holder of its current lease token, or by the reaper
/// once that lease has expired.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub tenant_id: TenantId,
    pub user_id: UserId,
    /// Opaque to the core.
    pub payload: serde_json::Value,
    pub status: TaskStatus,
    #[serde(default)]
    pub priority_key: PriorityKey,
    /// Delivery number; 1 for the first delivery.
    pub attempt_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub lease_token: Option<LeaseToken>,
    pub lease_deadline: Option<DateTime<Utc>>,
    pub worker_id: Option<WorkerId>,
    pub batch_id: Option<BatchId>,
    #[serde(default)]
    pub cancel_requested: bool,
    pub last_error: Option<String>,
}

impl Task {
    pub fn new(tenant_id: TenantId, user_id: UserId, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            task_id: TaskId::generate(),
            tenant_id,
            user_id,
            payload,
            status: TaskStatus::Pending,
            priority_key: PriorityKey::User,
            attempt_count: 1,
            created_at: now,
            updated_at: now,
            lease_token: None,
            lease_deadline: None,
            worker_id: None,
            batch_id: None,
            cancel_requested: false,
            last_error: None,
        }
    }

    pub fn with_id(mut self, task_id: TaskId) -> Self {
        self.task_id = task_id;
        self
    }

    pub fn with_batch(mut self, batch_id: BatchId) -> Self {
        self.batch_id = Some(batch_id);
        self
    }

    pub fn with_priority(mut self, priority_key: PriorityKey) -> Self {
        self.priority_key = priority_key;
        self
    }

    pub fn user_scope(&self) -> UserScope {
        UserScope::new(self.tenant_id.clone(), self.user_id.clone())
    }

    /// Reject records that cannot be enqueued.
    pub fn validate(&self) -> QueueResult<()> {
        if self.task_id.is_blank() {
            return Err(QueueError::invalid_task("task_id must not be empty"));
        }
        if self.tenant_id.is_blank() {
            return Err(QueueError::invalid_task("tenant_id must not be empty"));
        }
        if self.user_id.is_blank() {
            return Err(QueueError::invalid_task("user_id must not be empty"));
        }
        if self.payload.is_null() {
            return Err(QueueError::invalid_task("payload must not be null"));
        }
        if self.status != TaskStatus::Pending {
            return Err(QueueError::invalid_task(format!(
                "new tasks must be pending, got {}",
                self.status.as_str()
            )));
        }
        Ok(())
    }

    /// True iff `token` is the current lease and it has not expired.
    pub fn holds_lease(&self, token: &LeaseToken, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Leased
            && self.lease_token.as_ref() == Some(token)
            && self.lease_deadline.is_some_and(|deadline| now < deadline)
    }

    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Leased && self.lease_deadline.is_none_or(|deadline| deadline <= now)
    }

    pub(crate) fn ensure_lease(&self, token: &LeaseToken, now: DateTime<Utc>) -> QueueResult<()> {
        if self.holds_lease(token, now) {
            Ok(())
        } else {
            Err(QueueError::lease_lost(self.task_id.as_str()))
        }
    }
}

/// Input for one task of a batch submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub user_id: UserId,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub priority_key: PriorityKey,
}

impl NewTask {
    pub fn new(user_id: UserId, payload: serde_json::Value) -> Self {
        Self {
            user_id,
            payload,
            priority_key: PriorityKey::User,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub task_id: TaskId,
    pub lease_token: LeaseToken,
    pub deadline: DateTime<Utc>,
}

/// What `dequeue` hands a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct LeasedTask {
    pub task: Task,
    pub lease: Lease,
}

/// Result of a reaper requeue that did not dead-letter the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueOutcome {
    /// Back at the front of its queue for delivery number `attempt`.
    Requeued { attempt: u32 },
    /// The task is not leased (already completed or requeued).
    NotLeased,
    /// The lease is still valid.
    NotExpired,
}

/// Slot holder for one lease grant: `{task_id}/{lease_token}`.
///
/// A fresh token per grant means a worker that lost a claim race can only
/// ever release its own reservation.
pub(crate) fn slot_member(task_id: &TaskId, token: &LeaseToken) -> String {
    format!("{task_id}/{token}")
}

pub(crate) fn parse_slot_member(member: &str) -> Option<(TaskId, LeaseToken)> {
    let (task, token) = member.rsplit_once('/')?;
    Some((TaskId::parse(task).ok()?, LeaseToken::parse(token).ok()?))
}
