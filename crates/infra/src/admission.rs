//! Admission control: per-user and global concurrency slots.
//!
//! A slot is held by a *member* string (one per lease grant). Both scopes are
//! acquired in a single atomic store operation, so a refusal never leaves a
//! half-taken slot behind and the counters can never exceed their caps.

use std::collections::HashMap;

use tracing::{debug, info, instrument, warn};

use fairq_core::{QueueError, QueueResult, TenantId, UserId};

use crate::keys::{Keys, Scope, UserScope};
use crate::store::{GuardedCounter, SharedStore};

/// Concurrency caps.
///
/// `user_caps` overrides `default_user_cap` for individual users; this is
/// where tier-weighted quotas plug in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionLimits {
    pub default_user_cap: u32,
    pub global_cap: u32,
    pub user_caps: HashMap<UserScope, u32>,
}

impl Default for AdmissionLimits {
    fn default() -> Self {
        Self {
            default_user_cap: 3,
            global_cap: 20,
            user_caps: HashMap::new(),
        }
    }
}

impl AdmissionLimits {
    pub fn new(default_user_cap: u32, global_cap: u32) -> Self {
        Self {
            default_user_cap,
            global_cap,
            user_caps: HashMap::new(),
        }
    }

    pub fn with_user_cap(mut self, tenant_id: TenantId, user_id: UserId, cap: u32) -> Self {
        self.user_caps.insert(UserScope::new(tenant_id, user_id), cap);
        self
    }

    pub fn cap(&self, scope: &Scope) -> u32 {
        match scope {
            Scope::Global => self.global_cap,
            Scope::User(user) => self.user_caps.get(user).copied().unwrap_or(self.default_user_cap),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotUsage {
    pub current: i64,
    pub cap: u32,
}

impl SlotUsage {
    pub fn available(&self) -> i64 {
        (self.cap as i64 - self.current).max(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub scope: String,
    pub pruned: Vec<String>,
    pub current: i64,
}

pub struct AdmissionController {
    store: SharedStore,
    keys: Keys,
    limits: AdmissionLimits,
}

impl core::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AdmissionController")
            .field("keys", &self.keys)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl AdmissionController {
    pub fn new(store: SharedStore, keys: Keys, limits: AdmissionLimits) -> Self {
        Self { store, keys, limits }
    }

    pub fn limits(&self) -> &AdmissionLimits {
        &self.limits
    }

    fn counter(&self, scope: &Scope) -> GuardedCounter {
        GuardedCounter {
            counter_key: self.keys.slot_counter(scope),
            holders_key: self.keys.slot_holders(scope),
            cap: self.limits.cap(scope) as i64,
        }
    }

    fn counters(&self, tenant_id: &TenantId, user_id: &UserId) -> [GuardedCounter; 2] {
        [self.counter(&Scope::user(tenant_id, user_id)), self.counter(&Scope::Global)]
    }

    /// Reserve one slot in the user scope and one in the global scope.
    ///
    /// Re-acquiring with a member that already holds the slots is a no-op
    /// success.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, user_id = %user_id))]
    pub fn try_acquire(&self, tenant_id: &TenantId, user_id: &UserId, member: &str) -> QueueResult<()> {
        let counters = self.counters(tenant_id, user_id);
        if self.store.acquire_guarded(&counters, member)? {
            let user = UserScope::new(tenant_id.clone(), user_id.clone());
            self.store.set_add(&self.keys.slot_scopes(), &user.encode())?;
            return Ok(());
        }

        // Name the scope that refused; the global one if both are full.
        let user_scope = Scope::user(tenant_id, user_id);
        let scope = if self.usage(&Scope::Global)?.available() == 0 {
            Scope::Global
        } else {
            user_scope
        };
        debug!(scope = %scope, "admission refused");
        Err(QueueError::quota_exceeded(scope.name()))
    }

    /// Give back both slots held by `member`. Returns whether anything was held.
    pub fn release(&self, tenant_id: &TenantId, user_id: &UserId, member: &str) -> QueueResult<bool> {
        let released = self.store.release_guarded(&self.counters(tenant_id, user_id), member)?;
        Ok(released > 0)
    }

    pub fn usage(&self, scope: &Scope) -> QueueResult<SlotUsage> {
        Ok(SlotUsage {
            current: self.store.counter_value(&self.keys.slot_counter(scope))?,
            cap: self.limits.cap(scope),
        })
    }

    pub fn holders(&self, scope: &Scope) -> QueueResult<Vec<String>> {
        Ok(self.store.set_members(&self.keys.slot_holders(scope))?)
    }

    /// Every scope the reaper should reconcile: the global scope plus each
    /// user scope that has held a slot and not since drained.
    pub fn tracked_scopes(&self) -> QueueResult<Vec<Scope>> {
        let mut scopes = vec![Scope::Global];
        for raw in self.store.set_members(&self.keys.slot_scopes())? {
            match UserScope::decode(&raw) {
                Ok(user) => scopes.push(Scope::User(user)),
                Err(err) => {
                    warn!(entry = %raw, error = %err, "dropping undecodable slot scope");
                    self.store.set_remove(&self.keys.slot_scopes(), &raw)?;
                }
            }
        }
        Ok(scopes)
    }

    /// Drop holders for which `is_live` returns false and reset the counter
    /// to the number of remaining holders.
    pub fn reconcile<F>(&self, scope: &Scope, mut is_live: F) -> QueueResult<ReconcileReport>
    where
        F: FnMut(&str) -> QueueResult<bool>,
    {
        let mut pruned = Vec::new();
        for member in self.holders(scope)? {
            if !is_live(&member)? {
                pruned.push(member);
            }
        }

        let current = self.store.prune_guarded(&self.counter(scope), &pruned)?;
        if !pruned.is_empty() {
            info!(scope = %scope, pruned = pruned.len(), current, "reconciled concurrency slots");
        }
        if current == 0 {
            self.forget_if_idle(scope)?;
        }

        Ok(ReconcileReport {
            scope: scope.name(),
            pruned,
            current,
        })
    }

    // An acquire racing the removal re-adds the entry itself; the re-check
    // covers one that landed between the count and the removal.
    fn forget_if_idle(&self, scope: &Scope) -> QueueResult<()> {
        let Scope::User(user) = scope else {
            return Ok(());
        };
        let encoded = user.encode();
        self.store.set_remove(&self.keys.slot_scopes(), &encoded)?;
        if self.store.counter_value(&self.keys.slot_counter(scope))? > 0 {
            self.store.set_add(&self.keys.slot_scopes(), &encoded)?;
        }
        Ok(())
    }
}
