//! Redis-backed store client.
//!
//! Compound operations run as server-side Lua scripts, so each one is a
//! single atomic step on the store's command loop. The client itself holds
//! no state beyond the connection handle; it is a long-lived object meant
//! to be injected into every component at construction.

use std::time::Duration;

use redis::Script;

use latch_core::{CoordConfig, CoordError, CoordResult, QueueKeys};

use crate::traits::{AtomicStore, QueueDepths};

// Delete only if the stored value matches (release-safety for locks).
const CAD_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

// Re-arm the TTL only if the stored value matches.
const CAE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

// Optimistic swap. ARGV[1] = expected value, '' meaning "must be absent".
const CAS_SCRIPT: &str = r#"
local cur = redis.call('GET', KEYS[1])
if ARGV[1] == '' then
  if cur then return 0 end
elseif cur ~= ARGV[1] then
  return 0
end
if tonumber(ARGV[3]) > 0 then
  redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
else
  redis.call('SET', KEYS[1], ARGV[2])
end
return 1
"#;

// INCRBY that stamps a TTL only when the key is created.
const INCR_SCRIPT: &str = r#"
local existed = redis.call('EXISTS', KEYS[1])
local v = redis.call('INCRBY', KEYS[1], ARGV[1])
if existed == 0 and tonumber(ARGV[2]) > 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return v
"#;

// KEYS: delayed, ready, scores. ARGV: now_ms.
const PROMOTE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
for _, id in ipairs(due) do
  local score = redis.call('HGET', KEYS[3], id)
  redis.call('ZADD', KEYS[2], score and tonumber(score) or 0, id)
  redis.call('ZREM', KEYS[1], id)
end
return #due
"#;

// KEYS: ready, active. ARGV: lease deadline. Pop best ready job, lease it.
const CLAIM_SCRIPT: &str = r#"
local popped = redis.call('ZPOPMIN', KEYS[1])
if #popped == 0 then return false end
redis.call('ZADD', KEYS[2], tonumber(ARGV[1]), popped[1])
return popped[1]
"#;

// KEYS: active. ARGV: job id, new deadline.
const EXTEND_SCRIPT: &str = r#"
if redis.call('ZSCORE', KEYS[1], ARGV[1]) then
  redis.call('ZADD', KEYS[1], tonumber(ARGV[2]), ARGV[1])
  return 1
end
return 0
"#;

// KEYS: active, scores, stalls. ARGV: job id.
const COMPLETE_SCRIPT: &str = r#"
local removed = redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[3], ARGV[1])
return removed
"#;

// KEYS: active, ready, scores, stalls. ARGV: now_ms.
// Returns a flat [id, stall_count, ...] list.
const REAP_SCRIPT: &str = r#"
local expired = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
local out = {}
for _, id in ipairs(expired) do
  redis.call('ZREM', KEYS[1], id)
  local score = redis.call('HGET', KEYS[3], id)
  redis.call('ZADD', KEYS[2], score and tonumber(score) or 0, id)
  local n = redis.call('HINCRBY', KEYS[4], id, 1)
  out[#out + 1] = id
  out[#out + 1] = tostring(n)
end
return out
"#;

// KEYS: ready, scores, stalls. ARGV: job id.
const REMOVE_READY_SCRIPT: &str = r#"
local removed = redis.call('ZREM', KEYS[1], ARGV[1])
if removed == 1 then
  redis.call('HDEL', KEYS[2], ARGV[1])
  redis.call('HDEL', KEYS[3], ARGV[1])
end
return removed
"#;

// KEYS: retention zset. ARGV: score, member, max_len.
const PUSH_TRIM_SCRIPT: &str = r#"
redis.call('ZADD', KEYS[1], tonumber(ARGV[1]), ARGV[2])
local excess = redis.call('ZCARD', KEYS[1]) - tonumber(ARGV[3])
if excess <= 0 then return {} end
local evicted = redis.call('ZRANGE', KEYS[1], 0, excess - 1)
redis.call('ZREMRANGEBYRANK', KEYS[1], 0, excess - 1)
return evicted
"#;

/// Shared atomic store client over Redis.
pub struct RedisStore {
    client: redis::Client,
    cad: Script,
    cae: Script,
    cas: Script,
    incr: Script,
    promote: Script,
    claim: Script,
    extend: Script,
    complete: Script,
    reap: Script,
    remove_ready: Script,
    push_trim: Script,
}

fn store_err(e: redis::RedisError) -> CoordError {
    CoordError::connection(e.to_string())
}

fn ttl_ms(ttl: Option<Duration>) -> u64 {
    ttl.map(|t| t.as_millis() as u64).unwrap_or(0)
}

impl RedisStore {
    pub fn connect(config: &CoordConfig) -> CoordResult<Self> {
        Self::open(&config.redis_url)
    }

    pub fn open(url: &str) -> CoordResult<Self> {
        let client = redis::Client::open(url).map_err(store_err)?;
        Ok(Self {
            client,
            cad: Script::new(CAD_SCRIPT),
            cae: Script::new(CAE_SCRIPT),
            cas: Script::new(CAS_SCRIPT),
            incr: Script::new(INCR_SCRIPT),
            promote: Script::new(PROMOTE_SCRIPT),
            claim: Script::new(CLAIM_SCRIPT),
            extend: Script::new(EXTEND_SCRIPT),
            complete: Script::new(COMPLETE_SCRIPT),
            reap: Script::new(REAP_SCRIPT),
            remove_ready: Script::new(REMOVE_READY_SCRIPT),
            push_trim: Script::new(PUSH_TRIM_SCRIPT),
        })
    }

    fn conn(&self) -> CoordResult<redis::Connection> {
        self.client.get_connection().map_err(store_err)
    }
}

impl AtomicStore for RedisStore {
    fn get(&self, key: &str) -> CoordResult<Option<String>> {
        let mut conn = self.conn()?;
        redis::cmd("GET")
            .arg(key)
            .query::<Option<String>>(&mut conn)
            .map_err(store_err)
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CoordResult<()> {
        let mut conn = self.conn()?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(t) = ttl {
            cmd.arg("PX").arg(t.as_millis() as u64);
        }
        cmd.query::<()>(&mut conn).map_err(store_err)
    }

    fn delete(&self, key: &str) -> CoordResult<bool> {
        let mut conn = self.conn()?;
        let removed: i64 = redis::cmd("DEL").arg(key).query(&mut conn).map_err(store_err)?;
        Ok(removed > 0)
    }

    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> CoordResult<bool> {
        let mut conn = self.conn()?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query(&mut conn)
            .map_err(store_err)?;
        Ok(reply.is_some())
    }

    fn compare_and_delete(&self, key: &str, expected: &str) -> CoordResult<bool> {
        let mut conn = self.conn()?;
        let deleted: i64 = self
            .cad
            .key(key)
            .arg(expected)
            .invoke(&mut conn)
            .map_err(store_err)?;
        Ok(deleted == 1)
    }

    fn compare_and_expire(&self, key: &str, expected: &str, ttl: Duration) -> CoordResult<bool> {
        let mut conn = self.conn()?;
        let updated: i64 = self
            .cae
            .key(key)
            .arg(expected)
            .arg(ttl.as_millis() as u64)
            .invoke(&mut conn)
            .map_err(store_err)?;
        Ok(updated == 1)
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> CoordResult<bool> {
        let mut conn = self.conn()?;
        // '' encodes "key must be absent"; no stored value here is empty.
        let swapped: i64 = self
            .cas
            .key(key)
            .arg(expected.unwrap_or(""))
            .arg(new)
            .arg(ttl_ms(ttl))
            .invoke(&mut conn)
            .map_err(store_err)?;
        Ok(swapped == 1)
    }

    fn increment(&self, key: &str, by: i64, ttl_on_create: Option<Duration>) -> CoordResult<i64> {
        let mut conn = self.conn()?;
        self.incr
            .key(key)
            .arg(by)
            .arg(ttl_ms(ttl_on_create))
            .invoke(&mut conn)
            .map_err(store_err)
    }

    fn ttl_millis(&self, key: &str) -> CoordResult<Option<u64>> {
        let mut conn = self.conn()?;
        let pttl: i64 = redis::cmd("PTTL").arg(key).query(&mut conn).map_err(store_err)?;
        // -2 = missing key, -1 = no expiry.
        Ok(if pttl >= 0 { Some(pttl as u64) } else { None })
    }

    fn enqueue_ready(&self, keys: &QueueKeys, job_id: &str, score: f64) -> CoordResult<()> {
        let mut conn = self.conn()?;
        redis::pipe()
            .atomic()
            .cmd("ZADD")
            .arg(&keys.ready)
            .arg(score)
            .arg(job_id)
            .ignore()
            .cmd("HSET")
            .arg(&keys.scores)
            .arg(job_id)
            .arg(score)
            .ignore()
            .query::<()>(&mut conn)
            .map_err(store_err)
    }

    fn enqueue_delayed(
        &self,
        keys: &QueueKeys,
        job_id: &str,
        ready_at_ms: u64,
        ready_score: f64,
    ) -> CoordResult<()> {
        let mut conn = self.conn()?;
        redis::pipe()
            .atomic()
            .cmd("ZADD")
            .arg(&keys.delayed)
            .arg(ready_at_ms as f64)
            .arg(job_id)
            .ignore()
            .cmd("HSET")
            .arg(&keys.scores)
            .arg(job_id)
            .arg(ready_score)
            .ignore()
            .query::<()>(&mut conn)
            .map_err(store_err)
    }

    fn promote_due(&self, keys: &QueueKeys, now_ms: u64) -> CoordResult<u64> {
        let mut conn = self.conn()?;
        let promoted: i64 = self
            .promote
            .key(&keys.delayed)
            .key(&keys.ready)
            .key(&keys.scores)
            .arg(now_ms)
            .invoke(&mut conn)
            .map_err(store_err)?;
        Ok(promoted as u64)
    }

    fn claim_ready(
        &self,
        keys: &QueueKeys,
        now_ms: u64,
        lease: Duration,
    ) -> CoordResult<Option<String>> {
        let mut conn = self.conn()?;
        self.claim
            .key(&keys.ready)
            .key(&keys.active)
            .arg(now_ms + lease.as_millis() as u64)
            .invoke(&mut conn)
            .map_err(store_err)
    }

    fn extend_lease(
        &self,
        keys: &QueueKeys,
        job_id: &str,
        now_ms: u64,
        lease: Duration,
    ) -> CoordResult<bool> {
        let mut conn = self.conn()?;
        let extended: i64 = self
            .extend
            .key(&keys.active)
            .arg(job_id)
            .arg(now_ms + lease.as_millis() as u64)
            .invoke(&mut conn)
            .map_err(store_err)?;
        Ok(extended == 1)
    }

    fn complete_active(&self, keys: &QueueKeys, job_id: &str) -> CoordResult<bool> {
        let mut conn = self.conn()?;
        let removed: i64 = self
            .complete
            .key(&keys.active)
            .key(&keys.scores)
            .key(&keys.stalls)
            .arg(job_id)
            .invoke(&mut conn)
            .map_err(store_err)?;
        Ok(removed == 1)
    }

    fn reap_expired_leases(
        &self,
        keys: &QueueKeys,
        now_ms: u64,
    ) -> CoordResult<Vec<(String, u32)>> {
        let mut conn = self.conn()?;
        let flat: Vec<String> = self
            .reap
            .key(&keys.active)
            .key(&keys.ready)
            .key(&keys.scores)
            .key(&keys.stalls)
            .arg(now_ms)
            .invoke(&mut conn)
            .map_err(store_err)?;

        let mut out = Vec::with_capacity(flat.len() / 2);
        let mut it = flat.into_iter();
        while let (Some(id), Some(count)) = (it.next(), it.next()) {
            let count = count
                .parse::<u32>()
                .map_err(|_| CoordError::serialization("bad stall count from store"))?;
            out.push((id, count));
        }
        Ok(out)
    }

    fn remove_ready(&self, keys: &QueueKeys, job_id: &str) -> CoordResult<bool> {
        let mut conn = self.conn()?;
        let removed: i64 = self
            .remove_ready
            .key(&keys.ready)
            .key(&keys.scores)
            .key(&keys.stalls)
            .arg(job_id)
            .invoke(&mut conn)
            .map_err(store_err)?;
        Ok(removed == 1)
    }

    fn push_trim(
        &self,
        key: &str,
        member: &str,
        score: f64,
        max_len: usize,
    ) -> CoordResult<Vec<String>> {
        let mut conn = self.conn()?;
        self.push_trim
            .key(key)
            .arg(score)
            .arg(member)
            .arg(max_len)
            .invoke(&mut conn)
            .map_err(store_err)
    }

    fn remove_member(&self, key: &str, member: &str) -> CoordResult<bool> {
        let mut conn = self.conn()?;
        let removed: i64 = redis::cmd("ZREM")
            .arg(key)
            .arg(member)
            .query(&mut conn)
            .map_err(store_err)?;
        Ok(removed > 0)
    }

    fn queue_depths(&self, keys: &QueueKeys) -> CoordResult<QueueDepths> {
        let mut conn = self.conn()?;
        let (ready, delayed, active): (u64, u64, u64) = redis::pipe()
            .atomic()
            .cmd("ZCARD")
            .arg(&keys.ready)
            .cmd("ZCARD")
            .arg(&keys.delayed)
            .cmd("ZCARD")
            .arg(&keys.active)
            .query(&mut conn)
            .map_err(store_err)?;
        Ok(QueueDepths {
            ready,
            delayed,
            active,
        })
    }
}
