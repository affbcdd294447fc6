//! JSON records stored under a single key, updated by compare-and-swap.

use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

use fairq_core::QueueResult;

use crate::store::KvStore;

/// Attempts a read-modify-write loop makes before reporting contention.
pub(crate) const MAX_CAS_ATTEMPTS: usize = 16;

/// Current raw value and its decoded form.
pub(crate) fn load<T: DeserializeOwned>(store: &dyn KvStore, key: &str) -> QueueResult<Option<(String, T)>> {
    match store.get(key)? {
        None => Ok(None),
        Some(raw) => {
            let value = serde_json::from_str(&raw)?;
            Ok(Some((raw, value)))
        }
    }
}

/// Write `value` iff the key still holds `expected`.
pub(crate) fn swap<T: Serialize>(
    store: &dyn KvStore,
    key: &str,
    expected: Option<&str>,
    value: &T,
    ttl: Option<Duration>,
) -> QueueResult<bool> {
    let encoded = serde_json::to_string(value)?;
    Ok(store.compare_and_swap(key, expected, &encoded, ttl)?)
}
