use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};

use fairq_core::{add_duration, SharedClock, SystemClock};

use super::r#trait::{GuardedCounter, KvError, KvStore};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    List(VecDeque<String>),
    Set(BTreeSet<String>),
    ZSet(HashMap<String, i64>),
    Hash(BTreeMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Operations between two full expiry sweeps.
const SWEEP_EVERY: u64 = 1024;

/// In-memory key-value store.
///
/// Intended for tests/dev and single-process deployments. One mutex guards
/// the whole keyspace, which makes every operation (including the multi-key
/// guarded-counter operations) trivially atomic. Expiry is evaluated lazily
/// against the injected clock: each operation drops the expired keys it
/// touches, and every `SWEEP_EVERY` operations the whole keyspace is swept.
#[derive(Debug)]
pub struct InMemoryKvStore {
    entries: Mutex<HashMap<String, Entry>>,
    clock: SharedClock,
    ops: AtomicU64,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::with_clock(SystemClock::shared())
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
            ops: AtomicU64::new(0),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Lock the keyspace and drop `keys` if they have expired.
    fn lock(&self, keys: &[&str]) -> Result<MutexGuard<'_, HashMap<String, Entry>>, KvError> {
        let mut entries = self.entries.lock().map_err(|_| KvError::Poisoned)?;
        let now = self.clock.now();

        if self.ops.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            entries.retain(|_, e| !e.expired(now));
            return Ok(entries);
        }
        for key in keys {
            if entries.get(*key).is_some_and(|e| e.expired(now)) {
                entries.remove(*key);
            }
        }
        Ok(entries)
    }

    fn deadline(&self, ttl: Option<Duration>) -> Option<DateTime<Utc>> {
        ttl.map(|ttl| add_duration(self.clock.now(), ttl))
    }
}

impl Default for InMemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

fn guarded_keys(counters: &[GuardedCounter]) -> Vec<&str> {
    counters
        .iter()
        .flat_map(|c| [c.counter_key.as_str(), c.holders_key.as_str()])
        .collect()
}

fn wrong_type(key: &str) -> KvError {
    KvError::WrongType(key.to_string())
}

fn get_str<'a>(entries: &'a HashMap<String, Entry>, key: &str) -> Result<Option<&'a str>, KvError> {
    match entries.get(key).map(|e| &e.value) {
        None => Ok(None),
        Some(Value::Str(s)) => Ok(Some(s.as_str())),
        Some(_) => Err(wrong_type(key)),
    }
}

fn get_counter(entries: &HashMap<String, Entry>, key: &str) -> Result<i64, KvError> {
    match get_str(entries, key)? {
        None => Ok(0),
        Some(s) => s.parse::<i64>().map_err(|_| wrong_type(key)),
    }
}

fn put_counter(entries: &mut HashMap<String, Entry>, key: &str, value: i64) {
    let expires_at = entries.get(key).and_then(|e| e.expires_at);
    entries.insert(
        key.to_string(),
        Entry {
            value: Value::Str(value.to_string()),
            expires_at,
        },
    );
}

fn list_mut<'a>(entries: &'a mut HashMap<String, Entry>, key: &str) -> Result<&'a mut VecDeque<String>, KvError> {
    let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
        value: Value::List(VecDeque::new()),
        expires_at: None,
    });
    match &mut entry.value {
        Value::List(list) => Ok(list),
        _ => Err(wrong_type(key)),
    }
}

fn list_ref<'a>(entries: &'a HashMap<String, Entry>, key: &str) -> Result<Option<&'a VecDeque<String>>, KvError> {
    match entries.get(key).map(|e| &e.value) {
        None => Ok(None),
        Some(Value::List(list)) => Ok(Some(list)),
        Some(_) => Err(wrong_type(key)),
    }
}

fn set_mut<'a>(entries: &'a mut HashMap<String, Entry>, key: &str) -> Result<&'a mut BTreeSet<String>, KvError> {
    let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
        value: Value::Set(BTreeSet::new()),
        expires_at: None,
    });
    match &mut entry.value {
        Value::Set(set) => Ok(set),
        _ => Err(wrong_type(key)),
    }
}

fn set_ref<'a>(entries: &'a HashMap<String, Entry>, key: &str) -> Result<Option<&'a BTreeSet<String>>, KvError> {
    match entries.get(key).map(|e| &e.value) {
        None => Ok(None),
        Some(Value::Set(set)) => Ok(Some(set)),
        Some(_) => Err(wrong_type(key)),
    }
}

/// Empty collections disappear, as they do in Redis.
fn drop_if_empty(entries: &mut HashMap<String, Entry>, key: &str) {
    let empty = match entries.get(key).map(|e| &e.value) {
        Some(Value::List(l)) => l.is_empty(),
        Some(Value::Set(s)) => s.is_empty(),
        Some(Value::ZSet(z)) => z.is_empty(),
        Some(Value::Hash(h)) => h.is_empty(),
        _ => false,
    };
    if empty {
        entries.remove(key);
    }
}

impl KvStore for InMemoryKvStore {
    fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let entries = self.lock(&[key])?;
        Ok(get_str(&entries, key)?.map(str::to_string))
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        let expires_at = self.deadline(ttl);
        let mut entries = self.lock(&[key])?;
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at,
            },
        );
        Ok(())
    }

    fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool, KvError> {
        let expires_at = self.deadline(ttl);
        let mut entries = self.lock(&[key])?;
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at,
            },
        );
        Ok(true)
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, KvError> {
        let expires_at = self.deadline(ttl);
        let mut entries = self.lock(&[key])?;
        if get_str(&entries, key)? != expected {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(new.to_string()),
                expires_at,
            },
        );
        Ok(true)
    }

    fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, KvError> {
        let mut entries = self.lock(&[key])?;
        if get_str(&entries, key)? != Some(expected) {
            return Ok(false);
        }
        entries.remove(key);
        Ok(true)
    }

    fn delete(&self, key: &str) -> Result<bool, KvError> {
        Ok(self.lock(&[key])?.remove(key).is_some())
    }

    fn expire(&self, key: &str, ttl: Duration) -> Result<bool, KvError> {
        let expires_at = self.deadline(Some(ttl));
        let mut entries = self.lock(&[key])?;
        match entries.get_mut(key) {
            Some(entry) => {
                entry.expires_at = expires_at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn push_back(&self, key: &str, value: &str) -> Result<usize, KvError> {
        let mut entries = self.lock(&[key])?;
        let list = list_mut(&mut entries, key)?;
        list.push_back(value.to_string());
        Ok(list.len())
    }

    fn push_front(&self, key: &str, value: &str) -> Result<usize, KvError> {
        let mut entries = self.lock(&[key])?;
        let list = list_mut(&mut entries, key)?;
        list.push_front(value.to_string());
        Ok(list.len())
    }

    fn front(&self, key: &str) -> Result<Option<String>, KvError> {
        let entries = self.lock(&[key])?;
        Ok(list_ref(&entries, key)?.and_then(|l| l.front().cloned()))
    }

    fn remove(&self, key: &str, value: &str) -> Result<bool, KvError> {
        let mut entries = self.lock(&[key])?;
        if list_ref(&entries, key)?.is_none() {
            return Ok(false);
        }
        let list = list_mut(&mut entries, key)?;
        let removed = match list.iter().position(|v| v == value) {
            Some(idx) => {
                list.remove(idx);
                true
            }
            None => false,
        };
        drop_if_empty(&mut entries, key);
        Ok(removed)
    }

    fn list_len(&self, key: &str) -> Result<usize, KvError> {
        let entries = self.lock(&[key])?;
        Ok(list_ref(&entries, key)?.map_or(0, VecDeque::len))
    }

    fn rotate(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut entries = self.lock(&[key])?;
        if list_ref(&entries, key)?.is_none() {
            return Ok(None);
        }
        let list = list_mut(&mut entries, key)?;
        let head = list.pop_front();
        if let Some(head) = &head {
            list.push_back(head.clone());
        }
        Ok(head)
    }

    fn range(&self, key: &str, limit: usize) -> Result<Vec<String>, KvError> {
        let entries = self.lock(&[key])?;
        Ok(list_ref(&entries, key)?
            .map(|l| l.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    fn set_add(&self, key: &str, member: &str) -> Result<bool, KvError> {
        let mut entries = self.lock(&[key])?;
        Ok(set_mut(&mut entries, key)?.insert(member.to_string()))
    }

    fn set_remove(&self, key: &str, member: &str) -> Result<bool, KvError> {
        let mut entries = self.lock(&[key])?;
        if set_ref(&entries, key)?.is_none() {
            return Ok(false);
        }
        let removed = set_mut(&mut entries, key)?.remove(member);
        drop_if_empty(&mut entries, key);
        Ok(removed)
    }

    fn set_members(&self, key: &str) -> Result<Vec<String>, KvError> {
        let entries = self.lock(&[key])?;
        Ok(set_ref(&entries, key)?
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn zadd(&self, key: &str, member: &str, score: i64) -> Result<(), KvError> {
        let mut entries = self.lock(&[key])?;
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::ZSet(HashMap::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Value::ZSet(z) => {
                z.insert(member.to_string(), score);
                Ok(())
            }
            _ => Err(wrong_type(key)),
        }
    }

    fn zrem(&self, key: &str, member: &str) -> Result<bool, KvError> {
        let mut entries = self.lock(&[key])?;
        let removed = match entries.get_mut(key).map(|e| &mut e.value) {
            None => return Ok(false),
            Some(Value::ZSet(z)) => z.remove(member).is_some(),
            Some(_) => return Err(wrong_type(key)),
        };
        drop_if_empty(&mut entries, key);
        Ok(removed)
    }

    fn zscore(&self, key: &str, member: &str) -> Result<Option<i64>, KvError> {
        let entries = self.lock(&[key])?;
        match entries.get(key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::ZSet(z)) => Ok(z.get(member).copied()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn zrange_by_score(&self, key: &str, max: i64, limit: usize) -> Result<Vec<(String, i64)>, KvError> {
        let entries = self.lock(&[key])?;
        let z = match entries.get(key).map(|e| &e.value) {
            None => return Ok(vec![]),
            Some(Value::ZSet(z)) => z,
            Some(_) => return Err(wrong_type(key)),
        };
        let mut hits: Vec<(String, i64)> = z
            .iter()
            .filter(|(_, score)| **score <= max)
            .map(|(m, s)| (m.clone(), *s))
            .collect();
        hits.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        hits.truncate(limit);
        Ok(hits)
    }

    fn hash_set_if_absent(&self, key: &str, field: &str, value: &str) -> Result<bool, KvError> {
        let mut entries = self.lock(&[key])?;
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Hash(BTreeMap::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Value::Hash(h) => {
                if h.contains_key(field) {
                    return Ok(false);
                }
                h.insert(field.to_string(), value.to_string());
                Ok(true)
            }
            _ => Err(wrong_type(key)),
        }
    }

    fn hash_get_all(&self, key: &str) -> Result<Vec<(String, String)>, KvError> {
        let entries = self.lock(&[key])?;
        match entries.get(key).map(|e| &e.value) {
            None => Ok(vec![]),
            Some(Value::Hash(h)) => Ok(h.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn hash_len(&self, key: &str) -> Result<usize, KvError> {
        let entries = self.lock(&[key])?;
        match entries.get(key).map(|e| &e.value) {
            None => Ok(0),
            Some(Value::Hash(h)) => Ok(h.len()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn acquire_guarded(&self, counters: &[GuardedCounter], member: &str) -> Result<bool, KvError> {
        let mut entries = self.lock(&guarded_keys(counters))?;

        let mut missing = Vec::with_capacity(counters.len());
        for c in counters {
            let held = set_ref(&entries, &c.holders_key)?.is_some_and(|s| s.contains(member));
            if held {
                continue;
            }
            if get_counter(&entries, &c.counter_key)? >= c.cap {
                return Ok(false);
            }
            missing.push(c);
        }

        for c in missing {
            set_mut(&mut entries, &c.holders_key)?.insert(member.to_string());
            let next = get_counter(&entries, &c.counter_key)? + 1;
            put_counter(&mut entries, &c.counter_key, next);
        }
        Ok(true)
    }

    fn release_guarded(&self, counters: &[GuardedCounter], member: &str) -> Result<usize, KvError> {
        let mut entries = self.lock(&guarded_keys(counters))?;
        let mut released = 0;
        for c in counters {
            let exists = set_ref(&entries, &c.holders_key)?.is_some();
            let removed = exists && set_mut(&mut entries, &c.holders_key)?.remove(member);
            drop_if_empty(&mut entries, &c.holders_key);
            if removed {
                let next = (get_counter(&entries, &c.counter_key)? - 1).max(0);
                put_counter(&mut entries, &c.counter_key, next);
                released += 1;
            }
        }
        Ok(released)
    }

    fn prune_guarded(&self, counter: &GuardedCounter, stale: &[String]) -> Result<i64, KvError> {
        let mut entries = self.lock(&[counter.counter_key.as_str(), counter.holders_key.as_str()])?;
        if set_ref(&entries, &counter.holders_key)?.is_some() {
            let holders = set_mut(&mut entries, &counter.holders_key)?;
            for member in stale {
                holders.remove(member);
            }
        }
        let remaining = set_ref(&entries, &counter.holders_key)?.map_or(0, |s| s.len() as i64);
        drop_if_empty(&mut entries, &counter.holders_key);
        put_counter(&mut entries, &counter.counter_key, remaining);
        Ok(remaining)
    }

    fn counter_value(&self, key: &str) -> Result<i64, KvError> {
        let entries = self.lock(&[key])?;
        get_counter(&entries, key)
    }
}
