//! Key layout in the shared store.
//!
//! Every key starts with the configured prefix:
//!
//! | key | kind | contents |
//! |---|---|---|
//! | `{p}:task:{task_id}` | string | task record (JSON) |
//! | `{p}:queue:{tenant}:{user}` | list | pending task ids of one user |
//! | `{p}:queue:overflow` | list | pending task ids with `priority_key = global` |
//! | `{p}:ring` / `{p}:ring:members` | list / set | users with queued work, round-robin order |
//! | `{p}:leases` | sorted set | leased task ids scored by lease deadline |
//! | `{p}:dead_letters` | list | dead-lettered task ids |
//! | `{p}:slots:{scope}:count` / `:holders` | counter / set | concurrency slots |
//! | `{p}:batch:{id}` / `:outcomes` | string / hash | batch record, per-task outcomes |
//! | `{p}:lock:{resource}` | string | lock owner token |
//! | `{p}:worker:{id}` / `{p}:workers` | string / sorted set | heartbeats |

use serde::{Deserialize, Serialize};

use fairq_core::{BatchId, QueueError, TaskId, TenantId, UserId, WorkerId};

/// A (tenant, user) pair; the unit of fairness and of the per-user quota.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserScope {
    pub tenant_id: TenantId,
    pub user_id: UserId,
}

impl UserScope {
    pub fn new(tenant_id: TenantId, user_id: UserId) -> Self {
        Self { tenant_id, user_id }
    }

    /// Ring entry encoding. JSON so ids containing `:` stay unambiguous.
    pub fn encode(&self) -> String {
        serde_json::json!([self.tenant_id, self.user_id]).to_string()
    }

    pub fn decode(raw: &str) -> Result<Self, QueueError> {
        let (tenant_id, user_id): (TenantId, UserId) = serde_json::from_str(raw)?;
        Ok(Self { tenant_id, user_id })
    }
}

impl core::fmt::Display for UserScope {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}", self.tenant_id, self.user_id)
    }
}

/// A concurrency-slot scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    User(UserScope),
    Global,
}

impl Scope {
    pub fn user(tenant_id: &TenantId, user_id: &UserId) -> Self {
        Scope::User(UserScope::new(tenant_id.clone(), user_id.clone()))
    }

    pub fn name(&self) -> String {
        match self {
            Scope::User(u) => format!("user:{u}"),
            Scope::Global => "global".to_string(),
        }
    }
}

impl core::fmt::Display for Scope {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keys {
    prefix: String,
}

impl Keys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn task(&self, task_id: &TaskId) -> String {
        format!("{}:task:{task_id}", self.prefix)
    }

    pub fn user_queue(&self, user: &UserScope) -> String {
        format!("{}:queue:{}:{}", self.prefix, user.tenant_id, user.user_id)
    }

    pub fn overflow_queue(&self) -> String {
        format!("{}:queue:overflow", self.prefix)
    }

    pub fn ring(&self) -> String {
        format!("{}:ring", self.prefix)
    }

    pub fn ring_members(&self) -> String {
        format!("{}:ring:members", self.prefix)
    }

    pub fn leases(&self) -> String {
        format!("{}:leases", self.prefix)
    }

    /// Sorted set of in-flight claims, scored by the time they are abandoned.
    pub fn claims(&self) -> String {
        format!("{}:claims", self.prefix)
    }

    pub fn dead_letters(&self) -> String {
        format!("{}:dead_letters", self.prefix)
    }

    pub fn slot_counter(&self, scope: &Scope) -> String {
        format!("{}:slots:{scope}:count", self.prefix)
    }

    pub fn slot_holders(&self, scope: &Scope) -> String {
        format!("{}:slots:{scope}:holders", self.prefix)
    }

    /// Set of encoded user scopes that have held a slot.
    pub fn slot_scopes(&self) -> String {
        format!("{}:slots:scopes", self.prefix)
    }

    pub fn batch(&self, batch_id: &BatchId) -> String {
        format!("{}:batch:{batch_id}", self.prefix)
    }

    pub fn batch_outcomes(&self, batch_id: &BatchId) -> String {
        format!("{}:batch:{batch_id}:outcomes", self.prefix)
    }

    /// Batches whose derived counters missed an update.
    pub fn dirty_batches(&self) -> String {
        format!("{}:batches:dirty", self.prefix)
    }

    pub fn lock(&self, resource: &str) -> String {
        format!("{}:lock:{resource}", self.prefix)
    }

    pub fn worker(&self, worker_id: &WorkerId) -> String {
        format!("{}:worker:{worker_id}", self.prefix)
    }

    pub fn workers(&self) -> String {
        format!("{}:workers", self.prefix)
    }
}
