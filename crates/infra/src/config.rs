//! Queue configuration.
//!
//! Every duration and cap the core uses lives here and is passed in by the
//! embedding process. `from_env` reads `FAIRQ_*` variables on top of the
//! defaults:
//!
//! | variable | field |
//! |---|---|
//! | `FAIRQ_KEY_PREFIX` | `key_prefix` |
//! | `FAIRQ_USER_CAP` | `limits.default_user_cap` |
//! | `FAIRQ_GLOBAL_CAP` | `limits.global_cap` |
//! | `FAIRQ_VISIBILITY_TIMEOUT_MS` | `visibility_timeout` |
//! | `FAIRQ_HEARTBEAT_TTL_MS` | `heartbeat_ttl` |
//! | `FAIRQ_CLAIM_GRACE_MS` | `claim_grace` |
//! | `FAIRQ_REAPER_INTERVAL_MS` | `reaper_interval` |
//! | `FAIRQ_MAX_ATTEMPTS` | `max_attempts` |
//! | `FAIRQ_LOCK_TTL_MS` | `lock_ttl` |
//! | `FAIRQ_LOCK_WAIT_MS` | `lock_wait` |
//! | `FAIRQ_POLL_INTERVAL_MS` | `poll_interval` |
//! | `FAIRQ_RETENTION_SECS` | `retention` |

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::admission::AdmissionLimits;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    pub key_prefix: String,
    pub limits: AdmissionLimits,
    /// Lease length used by workers that do not pass their own.
    pub visibility_timeout: Duration,
    /// A worker not seen for this long is presumed dead.
    pub heartbeat_ttl: Duration,
    /// A dequeue that has not finished leasing its task after this long is
    /// treated as abandoned by the reaper.
    pub claim_grace: Duration,
    pub reaper_interval: Duration,
    /// Deliveries allowed before a task is dead-lettered.
    pub max_attempts: u32,
    pub lock_ttl: Duration,
    /// Budget for acquiring a lock before giving up with `LockContended`.
    pub lock_wait: Duration,
    pub lock_backoff: RetryPolicy,
    /// Sleep between empty passes of a blocking dequeue.
    pub poll_interval: Duration,
    /// How long terminal task and batch records are kept.
    pub retention: Duration,
    /// Overflow-queue entries examined per dequeue pass.
    pub overflow_scan: usize,
    /// Upper bound on leases/workers handled per reaper pass.
    pub reap_batch: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            key_prefix: "fairq".to_string(),
            limits: AdmissionLimits::default(),
            visibility_timeout: Duration::from_secs(30),
            heartbeat_ttl: Duration::from_secs(300),
            claim_grace: Duration::from_secs(30),
            reaper_interval: Duration::from_secs(5),
            max_attempts: 3,
            lock_ttl: Duration::from_secs(5),
            lock_wait: Duration::from_secs(2),
            lock_backoff: RetryPolicy::default(),
            poll_interval: Duration::from_millis(50),
            retention: Duration::from_secs(24 * 60 * 60),
            overflow_scan: 16,
            reap_batch: 256,
        }
    }
}

impl QueueConfig {
    /// Defaults overridden by `FAIRQ_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as `from_env`, reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(prefix) = lookup("FAIRQ_KEY_PREFIX").filter(|p| !p.trim().is_empty()) {
            config.key_prefix = prefix;
        }
        if let Some(cap) = parse(&lookup, "FAIRQ_USER_CAP") {
            config.limits.default_user_cap = cap;
        }
        if let Some(cap) = parse(&lookup, "FAIRQ_GLOBAL_CAP") {
            config.limits.global_cap = cap;
        }
        if let Some(ms) = parse(&lookup, "FAIRQ_VISIBILITY_TIMEOUT_MS") {
            config.visibility_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse(&lookup, "FAIRQ_HEARTBEAT_TTL_MS") {
            config.heartbeat_ttl = Duration::from_millis(ms);
        }
        if let Some(ms) = parse(&lookup, "FAIRQ_CLAIM_GRACE_MS") {
            config.claim_grace = Duration::from_millis(ms);
        }
        if let Some(ms) = parse(&lookup, "FAIRQ_REAPER_INTERVAL_MS") {
            config.reaper_interval = Duration::from_millis(ms);
        }
        if let Some(n) = parse(&lookup, "FAIRQ_MAX_ATTEMPTS") {
            config.max_attempts = n;
        }
        if let Some(ms) = parse(&lookup, "FAIRQ_LOCK_TTL_MS") {
            config.lock_ttl = Duration::from_millis(ms);
        }
        if let Some(ms) = parse(&lookup, "FAIRQ_LOCK_WAIT_MS") {
            config.lock_wait = Duration::from_millis(ms);
        }
        if let Some(ms) = parse(&lookup, "FAIRQ_POLL_INTERVAL_MS") {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = parse(&lookup, "FAIRQ_RETENTION_SECS") {
            config.retention = Duration::from_secs(secs);
        }

        config
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_limits(mut self, limits: AdmissionLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_user_cap(mut self, cap: u32) -> Self {
        self.limits.default_user_cap = cap;
        self
    }

    pub fn with_global_cap(mut self, cap: u32) -> Self {
        self.limits.global_cap = cap;
        self
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn with_heartbeat_ttl(mut self, ttl: Duration) -> Self {
        self.heartbeat_ttl = ttl;
        self
    }

    pub fn with_claim_grace(mut self, grace: Duration) -> Self {
        self.claim_grace = grace;
        self
    }

    pub fn with_reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval = interval;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = wait;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }
}

fn parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    let raw = lookup(name)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(variable = name, value = %raw, "ignoring unparseable configuration value");
            None
        }
    }
}
