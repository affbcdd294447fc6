//! Distributed locks with TTL and owner tokens.

use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use fairq_core::{add_duration, LockToken, QueueError, QueueResult, SharedClock};

use crate::keys::Keys;
use crate::retry::RetryPolicy;
use crate::store::SharedStore;

/// A held lock. Only the grant's token can release it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockGrant {
    pub resource: String,
    pub token: LockToken,
    pub deadline: DateTime<Utc>,
}

pub struct LockManager {
    store: SharedStore,
    keys: Keys,
    clock: SharedClock,
    backoff: RetryPolicy,
}

impl core::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LockManager")
            .field("keys", &self.keys)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl LockManager {
    pub fn new(store: SharedStore, keys: Keys, clock: SharedClock, backoff: RetryPolicy) -> Self {
        Self {
            store,
            keys,
            clock,
            backoff,
        }
    }

    /// Single attempt. `LockContended` if someone else holds it.
    pub fn acquire(&self, resource: &str, ttl: Duration) -> QueueResult<LockGrant> {
        self.acquire_as(resource, ttl, LockToken::generate())
    }

    fn acquire_as(&self, resource: &str, ttl: Duration, token: LockToken) -> QueueResult<LockGrant> {
        let deadline = add_duration(self.clock.now(), ttl);

        if self
            .store
            .set_if_absent(&self.keys.lock(resource), token.as_str(), Some(ttl))?
        {
            return Ok(LockGrant {
                resource: resource.to_string(),
                token,
                deadline,
            });
        }
        Err(QueueError::lock_contended(resource))
    }

    /// Retry with backoff until acquired or `wait` has elapsed.
    ///
    /// The caller's token seeds the backoff spread.
    pub fn acquire_within(&self, resource: &str, ttl: Duration, wait: Duration) -> QueueResult<LockGrant> {
        let give_up_at = Instant::now() + wait;
        let token = LockToken::generate();
        let mut attempt = 0;

        loop {
            match self.acquire_as(resource, ttl, token.clone()) {
                Err(QueueError::LockContended { .. }) => {}
                other => return other,
            }

            attempt += 1;
            let now = Instant::now();
            if now >= give_up_at || !self.backoff.should_retry(attempt) {
                debug!(resource, attempts = attempt, "lock acquisition timed out");
                return Err(QueueError::lock_contended(resource));
            }
            let delay = self.backoff.delay_for_attempt_seeded(attempt, token.as_str());
            thread::sleep(delay.min(give_up_at - now));
        }
    }

    /// Release iff the lock is still ours. `LockLost` if it expired (and
    /// possibly changed hands) in the meantime.
    pub fn release(&self, grant: &LockGrant) -> QueueResult<()> {
        if self
            .store
            .compare_and_delete(&self.keys.lock(&grant.resource), grant.token.as_str())?
        {
            return Ok(());
        }
        warn!(resource = %grant.resource, "lock expired before release");
        Err(QueueError::lock_lost(grant.resource.clone()))
    }

    /// Run `f` while holding `resource`.
    ///
    /// If `f` succeeds but the lock turned out to have expired under it,
    /// the result is `LockLost`: the caller must assume another holder may
    /// have interleaved with the critical section.
    pub fn with_lock<T>(
        &self,
        resource: &str,
        ttl: Duration,
        wait: Duration,
        f: impl FnOnce(&LockGrant) -> QueueResult<T>,
    ) -> QueueResult<T> {
        let grant = self.acquire_within(resource, ttl, wait)?;
        let result = f(&grant);
        let released = self.release(&grant);

        match (result, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(lost)) => Err(lost),
            (Err(e), _) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use fairq_core::ManualClock;

    use super::*;
    use crate::store::InMemoryKvStore;

    fn manager() -> (LockManager, Arc<ManualClock>) {
        let clock = ManualClock::starting_now();
        let store = Arc::new(InMemoryKvStore::with_clock(clock.clone()));
        let locks = LockManager::new(
            store,
            Keys::new("t"),
            clock.clone(),
            RetryPolicy::fixed(0, Duration::from_millis(1)),
        );
        (locks, clock)
    }

    #[test]
    fn second_acquire_is_contended() {
        let (locks, _) = manager();
        let grant = locks.acquire("batch:1", Duration::from_secs(5)).unwrap();
        assert!(matches!(
            locks.acquire("batch:1", Duration::from_secs(5)),
            Err(QueueError::LockContended { .. })
        ));

        locks.release(&grant).unwrap();
        locks.acquire("batch:1", Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn acquire_within_gives_up_after_wait() {
        let (locks, _) = manager();
        let _held = locks.acquire("r", Duration::from_secs(5)).unwrap();

        let started = Instant::now();
        let err = locks
            .acquire_within("r", Duration::from_secs(5), Duration::from_millis(20))
            .unwrap_err();
        assert!(matches!(err, QueueError::LockContended { .. }));
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn expired_lock_is_lost_and_can_be_taken_over() {
        let (locks, clock) = manager();
        let first = locks.acquire("r", Duration::from_secs(5)).unwrap();

        clock.advance(Duration::from_secs(6));
        let second = locks.acquire("r", Duration::from_secs(5)).unwrap();

        assert!(matches!(locks.release(&first), Err(QueueError::LockLost { .. })));
        locks.release(&second).unwrap();
    }

    #[test]
    fn with_lock_reports_expiry_during_critical_section() {
        let (locks, clock) = manager();
        let result = locks.with_lock("r", Duration::from_secs(1), Duration::ZERO, |_| {
            clock.advance(Duration::from_secs(2));
            Ok(42)
        });
        assert!(matches!(result, Err(QueueError::LockLost { .. })));

        let ok = locks.with_lock("r", Duration::from_secs(1), Duration::ZERO, |_| Ok(7));
        assert_eq!(ok.unwrap(), 7);
    }
}
