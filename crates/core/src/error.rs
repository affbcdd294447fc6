//! Error taxonomy for queueing, admission, leasing and locking.

use thiserror::Error;

/// Result type used across fairq.
pub type QueueResult<T> = Result<T, QueueError>;

/// Errors surfaced by the core.
///
/// - `QuotaExceeded` and `LockContended` are transient: retry after backoff
///   or leave the task queued.
/// - `NoTaskAvailable` is the normal empty-queue signal, not a failure.
/// - `LeaseLost` and `LockLost` are fatal to the current operation only; the
///   caller must discard in-progress side effects.
/// - `DeadLetter` is terminal and needs operator intervention.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Malformed submission; rejected immediately and never retried.
    #[error("invalid task: {0}")]
    InvalidTask(String),

    /// Admitting the task would push a concurrency scope over its cap.
    #[error("quota exceeded for scope {scope}")]
    QuotaExceeded { scope: String },

    /// `dequeue` waited its full timeout without finding admissible work.
    #[error("no task available")]
    NoTaskAvailable,

    /// The caller no longer holds the lease on this task.
    #[error("lease lost for task {task_id}")]
    LeaseLost { task_id: String },

    /// A lock expired or changed hands while its holder was inside the critical section.
    #[error("lock lost on {resource}")]
    LockLost { resource: String },

    /// The lock could not be acquired within the caller's budget.
    #[error("lock contended on {resource}")]
    LockContended { resource: String },

    /// The task exhausted its retry budget.
    #[error("task {task_id} dead-lettered after {attempts} attempts")]
    DeadLetter { task_id: String, attempts: u32 },

    /// A task, batch or worker record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The backing key-value store failed.
    #[error("store error: {0}")]
    Store(String),

    /// A stored record could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),
}

impl QueueError {
    pub fn invalid_task(msg: impl Into<String>) -> Self {
        Self::InvalidTask(msg.into())
    }

    pub fn quota_exceeded(scope: impl Into<String>) -> Self {
        Self::QuotaExceeded {
            scope: scope.into(),
        }
    }

    pub fn lease_lost(task_id: impl Into<String>) -> Self {
        Self::LeaseLost {
            task_id: task_id.into(),
        }
    }

    pub fn lock_lost(resource: impl Into<String>) -> Self {
        Self::LockLost {
            resource: resource.into(),
        }
    }

    pub fn lock_contended(resource: impl Into<String>) -> Self {
        Self::LockContended {
            resource: resource.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn codec(msg: impl Into<String>) -> Self {
        Self::Codec(msg.into())
    }

    /// Whether the caller may retry the same call after a backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            QueueError::QuotaExceeded { .. } | QueueError::LockContended { .. } | QueueError::NoTaskAvailable
        )
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(QueueError::quota_exceeded("user:a").is_transient());
        assert!(QueueError::lock_contended("batch:1").is_transient());
        assert!(!QueueError::lease_lost("t1").is_transient());
        assert!(!QueueError::lock_lost("batch:1").is_transient());
        assert!(
            !QueueError::DeadLetter {
                task_id: "t1".into(),
                attempts: 4
            }
            .is_transient()
        );
    }

    #[test]
    fn messages_name_the_subject() {
        assert_eq!(
            QueueError::lease_lost("t9").to_string(),
            "lease lost for task t9"
        );
    }
}
