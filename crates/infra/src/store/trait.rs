use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use fairq_core::QueueError;

/// Key-value store error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KvError {
    #[error("store connection error: {0}")]
    Connection(String),
    #[error("store command error: {0}")]
    Command(String),
    /// The key holds a value of a different kind (e.g. list vs string).
    #[error("wrong value type at key {0}")]
    WrongType(String),
    #[error("store lock poisoned")]
    Poisoned,
}

impl From<KvError> for QueueError {
    fn from(err: KvError) -> Self {
        QueueError::store(err.to_string())
    }
}

/// A counter paired with the set of members that currently hold a unit of it.
///
/// The holder set makes increments and decrements idempotent per member and
/// gives reconciliation an authoritative list to recount from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardedCounter {
    pub counter_key: String,
    pub holders_key: String,
    pub cap: i64,
}

/// Shared, low-latency key-value store with per-key expiry.
///
/// This is the only state the core shares between processes. Every method is
/// atomic on its own; multi-key methods (`acquire_guarded`,
/// `release_guarded`, `prune_guarded`) are atomic across all the keys they
/// touch. Scores in sorted sets are milliseconds since the Unix epoch.
///
/// Implementations must be safe to share across threads.
pub trait KvStore: Send + Sync {
    // -- strings ---------------------------------------------------------

    fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError>;

    /// Write only if the key is absent. Returns whether the write happened.
    fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool, KvError>;

    /// Write `new` only if the current value equals `expected`
    /// (`None` = key must be absent). A `None` ttl clears any expiry.
    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, KvError>;

    /// Delete only if the current value equals `expected`.
    fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, KvError>;

    fn delete(&self, key: &str) -> Result<bool, KvError>;

    fn expire(&self, key: &str, ttl: Duration) -> Result<bool, KvError>;

    // -- lists -----------------------------------------------------------

    fn push_back(&self, key: &str, value: &str) -> Result<usize, KvError>;

    fn push_front(&self, key: &str, value: &str) -> Result<usize, KvError>;

    fn front(&self, key: &str) -> Result<Option<String>, KvError>;

    /// Remove the first occurrence of `value`. Returns whether one was removed.
    fn remove(&self, key: &str, value: &str) -> Result<bool, KvError>;

    fn list_len(&self, key: &str) -> Result<usize, KvError>;

    /// Pop the front element and push it to the back, returning it.
    fn rotate(&self, key: &str) -> Result<Option<String>, KvError>;

    /// First `limit` elements, front to back.
    fn range(&self, key: &str, limit: usize) -> Result<Vec<String>, KvError>;

    // -- sets ------------------------------------------------------------

    fn set_add(&self, key: &str, member: &str) -> Result<bool, KvError>;

    fn set_remove(&self, key: &str, member: &str) -> Result<bool, KvError>;

    fn set_members(&self, key: &str) -> Result<Vec<String>, KvError>;

    // -- sorted sets -----------------------------------------------------

    fn zadd(&self, key: &str, member: &str, score: i64) -> Result<(), KvError>;

    fn zrem(&self, key: &str, member: &str) -> Result<bool, KvError>;

    fn zscore(&self, key: &str, member: &str) -> Result<Option<i64>, KvError>;

    /// Members with `score <= max`, lowest score first.
    fn zrange_by_score(&self, key: &str, max: i64, limit: usize) -> Result<Vec<(String, i64)>, KvError>;

    // -- hashes ----------------------------------------------------------

    fn hash_set_if_absent(&self, key: &str, field: &str, value: &str) -> Result<bool, KvError>;

    fn hash_get_all(&self, key: &str) -> Result<Vec<(String, String)>, KvError>;

    fn hash_len(&self, key: &str) -> Result<usize, KvError>;

    // -- guarded counters ------------------------------------------------

    /// All-or-nothing admission across every counter.
    ///
    /// Succeeds when, for each counter, `member` already holds it or
    /// `current < cap`. On success the member is added to every holder set
    /// it was missing from and those counters are incremented. On failure
    /// nothing changes.
    fn acquire_guarded(&self, counters: &[GuardedCounter], member: &str) -> Result<bool, KvError>;

    /// Remove `member` from every holder set and decrement exactly the
    /// counters it was removed from. Returns how many were released.
    fn release_guarded(&self, counters: &[GuardedCounter], member: &str) -> Result<usize, KvError>;

    /// Drop `stale` holders and reset the counter to the holder-set size.
    fn prune_guarded(&self, counter: &GuardedCounter, stale: &[String]) -> Result<i64, KvError>;

    fn counter_value(&self, key: &str) -> Result<i64, KvError>;
}

/// Shared, dynamically-dispatched store handle.
pub type SharedStore = Arc<dyn KvStore>;
