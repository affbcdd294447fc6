//! Redis-backed key-value store (optional, feature `redis`).
//!
//! Single-key operations map onto plain Redis commands. Anything that has to
//! check-then-write (`compare_and_swap`, `compare_and_delete`, the guarded
//! counters) runs as a Lua script so Redis executes it atomically.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::instrument;

use super::r#trait::{GuardedCounter, KvError, KvStore};

const COMPARE_AND_SWAP: &str = r#"
local cur = redis.call('GET', KEYS[1])
if ARGV[1] == '1' then
  if cur ~= ARGV[2] then return 0 end
else
  if cur then return 0 end
end
if tonumber(ARGV[4]) > 0 then
  redis.call('SET', KEYS[1], ARGV[3], 'PX', ARGV[4])
else
  redis.call('SET', KEYS[1], ARGV[3])
end
return 1
"#;

const COMPARE_AND_DELETE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

// KEYS = counter_1, holders_1, counter_2, holders_2, ...
// ARGV = member, cap_1, cap_2, ...
const ACQUIRE_GUARDED: &str = r#"
local n = #KEYS / 2
for i = 1, n do
  if redis.call('SISMEMBER', KEYS[2 * i], ARGV[1]) == 0 then
    local cur = tonumber(redis.call('GET', KEYS[2 * i - 1]) or '0')
    if cur >= tonumber(ARGV[i + 1]) then return 0 end
  end
end
for i = 1, n do
  if redis.call('SADD', KEYS[2 * i], ARGV[1]) == 1 then
    redis.call('INCR', KEYS[2 * i - 1])
  end
end
return 1
"#;

const RELEASE_GUARDED: &str = r#"
local released = 0
for i = 1, #KEYS / 2 do
  if redis.call('SREM', KEYS[2 * i], ARGV[1]) == 1 then
    if redis.call('DECR', KEYS[2 * i - 1]) < 0 then
      redis.call('SET', KEYS[2 * i - 1], 0)
    end
    released = released + 1
  end
end
return released
"#;

// KEYS = counter, holders; ARGV = stale members
const PRUNE_GUARDED: &str = r#"
for i = 1, #ARGV do
  redis.call('SREM', KEYS[2], ARGV[i])
end
local n = redis.call('SCARD', KEYS[2])
redis.call('SET', KEYS[1], n)
return n
"#;

#[derive(Debug, Clone)]
struct Scripts {
    compare_and_swap: Arc<redis::Script>,
    compare_and_delete: Arc<redis::Script>,
    acquire_guarded: Arc<redis::Script>,
    release_guarded: Arc<redis::Script>,
    prune_guarded: Arc<redis::Script>,
}

/// Redis key-value store.
///
/// Opens a connection per call; put a pooled proxy in front of Redis for
/// high worker counts.
#[derive(Debug, Clone)]
pub struct RedisKvStore {
    client: Arc<redis::Client>,
    scripts: Scripts,
}

impl RedisKvStore {
    /// Create a store from a Redis URL (e.g. "redis://localhost:6379").
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, KvError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| KvError::Connection(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            scripts: Scripts {
                compare_and_swap: Arc::new(redis::Script::new(COMPARE_AND_SWAP)),
                compare_and_delete: Arc::new(redis::Script::new(COMPARE_AND_DELETE)),
                acquire_guarded: Arc::new(redis::Script::new(ACQUIRE_GUARDED)),
                release_guarded: Arc::new(redis::Script::new(RELEASE_GUARDED)),
                prune_guarded: Arc::new(redis::Script::new(PRUNE_GUARDED)),
            },
        })
    }

    fn conn(&self) -> Result<redis::Connection, KvError> {
        self.client
            .get_connection()
            .map_err(|e| KvError::Connection(e.to_string()))
    }

    fn query<T: redis::FromRedisValue>(&self, cmd: &redis::Cmd) -> Result<T, KvError> {
        let mut conn = self.conn()?;
        cmd.query(&mut conn).map_err(command_error)
    }
}

fn command_error(e: redis::RedisError) -> KvError {
    if e.code() == Some("WRONGTYPE") {
        return KvError::WrongType(e.to_string());
    }
    KvError::Command(e.to_string())
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

impl KvStore for RedisKvStore {
    fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        self.query(redis::cmd("GET").arg(key))
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        self.query::<()>(&cmd)
    }

    fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool, KvError> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        let reply: Option<String> = self.query(&cmd)?;
        Ok(reply.is_some())
    }

    #[instrument(skip(self, new), err)]
    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, KvError> {
        let mut conn = self.conn()?;
        let swapped: i64 = self
            .scripts
            .compare_and_swap
            .key(key)
            .arg(if expected.is_some() { "1" } else { "0" })
            .arg(expected.unwrap_or(""))
            .arg(new)
            .arg(ttl.map_or(0, ttl_millis))
            .invoke(&mut conn)
            .map_err(command_error)?;
        Ok(swapped == 1)
    }

    fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, KvError> {
        let mut conn = self.conn()?;
        let deleted: i64 = self
            .scripts
            .compare_and_delete
            .key(key)
            .arg(expected)
            .invoke(&mut conn)
            .map_err(command_error)?;
        Ok(deleted == 1)
    }

    fn delete(&self, key: &str) -> Result<bool, KvError> {
        let n: i64 = self.query(redis::cmd("DEL").arg(key))?;
        Ok(n > 0)
    }

    fn expire(&self, key: &str, ttl: Duration) -> Result<bool, KvError> {
        let n: i64 = self.query(redis::cmd("PEXPIRE").arg(key).arg(ttl_millis(ttl)))?;
        Ok(n == 1)
    }

    fn push_back(&self, key: &str, value: &str) -> Result<usize, KvError> {
        self.query(redis::cmd("RPUSH").arg(key).arg(value))
    }

    fn push_front(&self, key: &str, value: &str) -> Result<usize, KvError> {
        self.query(redis::cmd("LPUSH").arg(key).arg(value))
    }

    fn front(&self, key: &str) -> Result<Option<String>, KvError> {
        self.query(redis::cmd("LINDEX").arg(key).arg(0))
    }

    fn remove(&self, key: &str, value: &str) -> Result<bool, KvError> {
        let n: i64 = self.query(redis::cmd("LREM").arg(key).arg(1).arg(value))?;
        Ok(n > 0)
    }

    fn list_len(&self, key: &str) -> Result<usize, KvError> {
        self.query(redis::cmd("LLEN").arg(key))
    }

    fn rotate(&self, key: &str) -> Result<Option<String>, KvError> {
        self.query(redis::cmd("LMOVE").arg(key).arg(key).arg("LEFT").arg("RIGHT"))
    }

    fn range(&self, key: &str, limit: usize) -> Result<Vec<String>, KvError> {
        if limit == 0 {
            return Ok(vec![]);
        }
        self.query(redis::cmd("LRANGE").arg(key).arg(0).arg(limit as i64 - 1))
    }

    fn set_add(&self, key: &str, member: &str) -> Result<bool, KvError> {
        let n: i64 = self.query(redis::cmd("SADD").arg(key).arg(member))?;
        Ok(n == 1)
    }

    fn set_remove(&self, key: &str, member: &str) -> Result<bool, KvError> {
        let n: i64 = self.query(redis::cmd("SREM").arg(key).arg(member))?;
        Ok(n == 1)
    }

    fn set_members(&self, key: &str) -> Result<Vec<String>, KvError> {
        let mut members: Vec<String> = self.query(redis::cmd("SMEMBERS").arg(key))?;
        members.sort();
        Ok(members)
    }

    fn zadd(&self, key: &str, member: &str, score: i64) -> Result<(), KvError> {
        self.query::<i64>(redis::cmd("ZADD").arg(key).arg(score).arg(member))
            .map(|_| ())
    }

    fn zrem(&self, key: &str, member: &str) -> Result<bool, KvError> {
        let n: i64 = self.query(redis::cmd("ZREM").arg(key).arg(member))?;
        Ok(n == 1)
    }

    fn zscore(&self, key: &str, member: &str) -> Result<Option<i64>, KvError> {
        let score: Option<f64> = self.query(redis::cmd("ZSCORE").arg(key).arg(member))?;
        Ok(score.map(|s| s as i64))
    }

    fn zrange_by_score(&self, key: &str, max: i64, limit: usize) -> Result<Vec<(String, i64)>, KvError> {
        let hits: Vec<(String, f64)> = self.query(
            redis::cmd("ZRANGEBYSCORE")
                .arg(key)
                .arg("-inf")
                .arg(max)
                .arg("WITHSCORES")
                .arg("LIMIT")
                .arg(0)
                .arg(limit),
        )?;
        Ok(hits.into_iter().map(|(m, s)| (m, s as i64)).collect())
    }

    fn hash_set_if_absent(&self, key: &str, field: &str, value: &str) -> Result<bool, KvError> {
        let n: i64 = self.query(redis::cmd("HSETNX").arg(key).arg(field).arg(value))?;
        Ok(n == 1)
    }

    fn hash_get_all(&self, key: &str) -> Result<Vec<(String, String)>, KvError> {
        let all: HashMap<String, String> = self.query(redis::cmd("HGETALL").arg(key))?;
        let mut pairs: Vec<_> = all.into_iter().collect();
        pairs.sort();
        Ok(pairs)
    }

    fn hash_len(&self, key: &str) -> Result<usize, KvError> {
        self.query(redis::cmd("HLEN").arg(key))
    }

    #[instrument(skip(self, counters), err)]
    fn acquire_guarded(&self, counters: &[GuardedCounter], member: &str) -> Result<bool, KvError> {
        let mut conn = self.conn()?;
        let mut invocation = self.scripts.acquire_guarded.prepare_invoke();
        for c in counters {
            invocation.key(&c.counter_key).key(&c.holders_key);
        }
        invocation.arg(member);
        for c in counters {
            invocation.arg(c.cap);
        }
        let granted: i64 = invocation.invoke(&mut conn).map_err(command_error)?;
        Ok(granted == 1)
    }

    fn release_guarded(&self, counters: &[GuardedCounter], member: &str) -> Result<usize, KvError> {
        let mut conn = self.conn()?;
        let mut invocation = self.scripts.release_guarded.prepare_invoke();
        for c in counters {
            invocation.key(&c.counter_key).key(&c.holders_key);
        }
        invocation.arg(member);
        let released: i64 = invocation.invoke(&mut conn).map_err(command_error)?;
        Ok(released.max(0) as usize)
    }

    fn prune_guarded(&self, counter: &GuardedCounter, stale: &[String]) -> Result<i64, KvError> {
        let mut conn = self.conn()?;
        let mut invocation = self.scripts.prune_guarded.prepare_invoke();
        invocation.key(&counter.counter_key).key(&counter.holders_key);
        for member in stale {
            invocation.arg(member);
        }
        invocation.invoke(&mut conn).map_err(command_error)
    }

    fn counter_value(&self, key: &str) -> Result<i64, KvError> {
        let raw: Option<String> = self.query(redis::cmd("GET").arg(key))?;
        match raw {
            None => Ok(0),
            Some(s) => s.parse().map_err(|_| KvError::WrongType(key.to_string())),
        }
    }
}
