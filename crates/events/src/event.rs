use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use fairq_core::{BatchId, BatchStatus, TaskId, TaskStatus, TenantId, UserId, WorkerId};

/// Named pub/sub channel.
///
/// Channel names are `task:{task_id}`, `user:{tenant_id}:{user_id}` and
/// `batch:{batch_id}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Channel(String);

impl Channel {
    pub fn task(task_id: &TaskId) -> Self {
        Self(format!("task:{task_id}"))
    }

    pub fn user(tenant_id: &TenantId, user_id: &UserId) -> Self {
        Self(format!("user:{tenant_id}:{user_id}"))
    }

    pub fn batch(batch_id: &BatchId) -> Self {
        Self(format!("batch:{batch_id}"))
    }

    /// Arbitrary channel name (e.g. for operator tooling).
    pub fn named(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for Channel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Task state transitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    Enqueued {
        task_id: TaskId,
        user_id: UserId,
        batch_id: Option<BatchId>,
    },
    Leased {
        task_id: TaskId,
        worker_id: WorkerId,
        attempt: u32,
        lease_deadline: DateTime<Utc>,
    },
    /// Terminal outcome reported by a worker (or a cancellation of a pending task).
    Completed {
        task_id: TaskId,
        status: TaskStatus,
        error: Option<String>,
    },
    CancelRequested {
        task_id: TaskId,
    },
    Requeued {
        task_id: TaskId,
        attempt: u32,
    },
    DeadLettered {
        task_id: TaskId,
        attempts: u32,
    },
}

impl TaskEvent {
    pub fn task_id(&self) -> &TaskId {
        match self {
            TaskEvent::Enqueued { task_id, .. }
            | TaskEvent::Leased { task_id, .. }
            | TaskEvent::Completed { task_id, .. }
            | TaskEvent::CancelRequested { task_id }
            | TaskEvent::Requeued { task_id, .. }
            | TaskEvent::DeadLettered { task_id, .. } => task_id,
        }
    }
}

/// Batch aggregate changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BatchEvent {
    Progress {
        batch_id: BatchId,
        total: u32,
        succeeded: u32,
        failed: u32,
    },
    Completed {
        batch_id: BatchId,
        status: BatchStatus,
        total: u32,
        succeeded: u32,
        failed: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Event {
    Task(TaskEvent),
    Batch(BatchEvent),
}

/// A published notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub occurred_at: DateTime<Utc>,
    pub event: Event,
}

impl Notification {
    pub fn new(tenant_id: TenantId, occurred_at: DateTime<Utc>, event: Event) -> Self {
        Self {
            id: Uuid::now_v7(),
            tenant_id,
            occurred_at,
            event,
        }
    }

    pub fn task(tenant_id: TenantId, occurred_at: DateTime<Utc>, event: TaskEvent) -> Self {
        Self::new(tenant_id, occurred_at, Event::Task(event))
    }

    pub fn batch(tenant_id: TenantId, occurred_at: DateTime<Utc>, event: BatchEvent) -> Self {
        Self::new(tenant_id, occurred_at, Event::Batch(event))
    }
}
