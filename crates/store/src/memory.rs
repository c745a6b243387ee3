//! In-memory store for tests/dev.
//!
//! A single mutex stands in for the store's single-threaded execution
//! model, so every trait method is atomic exactly the way the Redis
//! scripts are. TTLs are evaluated against an injected clock, which lets
//! tests expire keys by advancing a `ManualClock` instead of sleeping.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use latch_core::{Clock, CoordError, CoordResult, QueueKeys, SystemClock};

use crate::traits::{AtomicStore, QueueDepths};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<u64>,
}

#[derive(Default)]
struct Inner {
    kv: HashMap<String, Entry>,
    // Sorted ascending by (score, member); small enough for a test fake.
    zsets: HashMap<String, Vec<(f64, String)>>,
    hashes: HashMap<String, HashMap<String, String>>,
}

/// Mutex-guarded fake of the shared atomic store.
pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
    broken: AtomicBool,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            inner: Mutex::new(Inner::default()),
            broken: AtomicBool::new(false),
        }
    }

    pub fn with_system_clock() -> Self {
        Self::new(Arc::new(SystemClock))
    }

    pub fn arc(clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self::new(clock))
    }

    /// Simulate the store becoming unreachable: every subsequent call
    /// returns `CoordError::Connection` until restored.
    pub fn break_connection(&self, broken: bool) {
        self.broken.store(broken, Ordering::SeqCst);
    }

    fn guard(&self) -> CoordResult<MutexGuard<'_, Inner>> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(CoordError::connection("simulated store outage"));
        }
        Ok(self.inner.lock().unwrap_or_else(|e| e.into_inner()))
    }

    fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }
}

fn purge_if_expired(inner: &mut Inner, key: &str, now: u64) {
    if let Some(entry) = inner.kv.get(key) {
        if matches!(entry.expires_at, Some(at) if at <= now) {
            inner.kv.remove(key);
        }
    }
}

fn zset_insert(zset: &mut Vec<(f64, String)>, score: f64, member: &str) {
    zset.retain(|(_, m)| m != member);
    zset.push((score, member.to_string()));
    zset.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
}

fn zset_remove(zset: &mut Vec<(f64, String)>, member: &str) -> bool {
    let before = zset.len();
    zset.retain(|(_, m)| m != member);
    zset.len() != before
}

impl AtomicStore for MemoryStore {
    fn get(&self, key: &str) -> CoordResult<Option<String>> {
        let now = self.now_ms();
        let mut inner = self.guard()?;
        purge_if_expired(&mut inner, key, now);
        Ok(inner.kv.get(key).map(|e| e.value.clone()))
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CoordResult<()> {
        let now = self.now_ms();
        let mut inner = self.guard()?;
        inner.kv.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|t| now + t.as_millis() as u64),
            },
        );
        Ok(())
    }

    fn delete(&self, key: &str) -> CoordResult<bool> {
        let now = self.now_ms();
        let mut inner = self.guard()?;
        purge_if_expired(&mut inner, key, now);
        Ok(inner.kv.remove(key).is_some())
    }

    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> CoordResult<bool> {
        let now = self.now_ms();
        let mut inner = self.guard()?;
        purge_if_expired(&mut inner, key, now);
        if inner.kv.contains_key(key) {
            return Ok(false);
        }
        inner.kv.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(now + ttl.as_millis() as u64),
            },
        );
        Ok(true)
    }

    fn compare_and_delete(&self, key: &str, expected: &str) -> CoordResult<bool> {
        let now = self.now_ms();
        let mut inner = self.guard()?;
        purge_if_expired(&mut inner, key, now);
        match inner.kv.get(key) {
            Some(entry) if entry.value == expected => {
                inner.kv.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn compare_and_expire(&self, key: &str, expected: &str, ttl: Duration) -> CoordResult<bool> {
        let now = self.now_ms();
        let mut inner = self.guard()?;
        purge_if_expired(&mut inner, key, now);
        match inner.kv.get_mut(key) {
            Some(entry) if entry.value == expected => {
                entry.expires_at = Some(now + ttl.as_millis() as u64);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> CoordResult<bool> {
        let now = self.now_ms();
        let mut inner = self.guard()?;
        purge_if_expired(&mut inner, key, now);

        let current = inner.kv.get(key).map(|e| e.value.as_str());
        if current != expected {
            return Ok(false);
        }

        inner.kv.insert(
            key.to_string(),
            Entry {
                value: new.to_string(),
                expires_at: ttl.map(|t| now + t.as_millis() as u64),
            },
        );
        Ok(true)
    }

    fn increment(&self, key: &str, by: i64, ttl_on_create: Option<Duration>) -> CoordResult<i64> {
        let now = self.now_ms();
        let mut inner = self.guard()?;
        purge_if_expired(&mut inner, key, now);

        match inner.kv.get_mut(key) {
            Some(entry) => {
                let current: i64 = entry.value.parse().map_err(|_| {
                    CoordError::serialization(format!("non-integer value at {key}"))
                })?;
                let next = current + by;
                entry.value = next.to_string();
                Ok(next)
            }
            None => {
                inner.kv.insert(
                    key.to_string(),
                    Entry {
                        value: by.to_string(),
                        expires_at: ttl_on_create.map(|t| now + t.as_millis() as u64),
                    },
                );
                Ok(by)
            }
        }
    }

    fn ttl_millis(&self, key: &str) -> CoordResult<Option<u64>> {
        let now = self.now_ms();
        let mut inner = self.guard()?;
        purge_if_expired(&mut inner, key, now);
        Ok(inner
            .kv
            .get(key)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_sub(now)))
    }

    fn enqueue_ready(&self, keys: &QueueKeys, job_id: &str, score: f64) -> CoordResult<()> {
        let mut inner = self.guard()?;
        zset_insert(inner.zsets.entry(keys.ready.clone()).or_default(), score, job_id);
        inner
            .hashes
            .entry(keys.scores.clone())
            .or_default()
            .insert(job_id.to_string(), score.to_string());
        Ok(())
    }

    fn enqueue_delayed(
        &self,
        keys: &QueueKeys,
        job_id: &str,
        ready_at_ms: u64,
        ready_score: f64,
    ) -> CoordResult<()> {
        let mut inner = self.guard()?;
        zset_insert(
            inner.zsets.entry(keys.delayed.clone()).or_default(),
            ready_at_ms as f64,
            job_id,
        );
        inner
            .hashes
            .entry(keys.scores.clone())
            .or_default()
            .insert(job_id.to_string(), ready_score.to_string());
        Ok(())
    }

    fn promote_due(&self, keys: &QueueKeys, now_ms: u64) -> CoordResult<u64> {
        let mut inner = self.guard()?;

        let due: Vec<String> = inner
            .zsets
            .get(&keys.delayed)
            .map(|z| {
                z.iter()
                    .take_while(|(score, _)| *score <= now_ms as f64)
                    .map(|(_, m)| m.clone())
                    .collect()
            })
            .unwrap_or_default();

        for job_id in &due {
            if let Some(z) = inner.zsets.get_mut(&keys.delayed) {
                zset_remove(z, job_id);
            }
            let score = inner
                .hashes
                .get(&keys.scores)
                .and_then(|h| h.get(job_id))
                .and_then(|s| s.parse::<f64>().ok())
                .unwrap_or(0.0);
            zset_insert(inner.zsets.entry(keys.ready.clone()).or_default(), score, job_id);
        }

        Ok(due.len() as u64)
    }

    fn claim_ready(
        &self,
        keys: &QueueKeys,
        now_ms: u64,
        lease: Duration,
    ) -> CoordResult<Option<String>> {
        let mut inner = self.guard()?;

        let job_id = match inner.zsets.get_mut(&keys.ready) {
            Some(z) if !z.is_empty() => z.remove(0).1,
            _ => return Ok(None),
        };

        let deadline = (now_ms + lease.as_millis() as u64) as f64;
        zset_insert(
            inner.zsets.entry(keys.active.clone()).or_default(),
            deadline,
            &job_id,
        );
        Ok(Some(job_id))
    }

    fn extend_lease(
        &self,
        keys: &QueueKeys,
        job_id: &str,
        now_ms: u64,
        lease: Duration,
    ) -> CoordResult<bool> {
        let mut inner = self.guard()?;
        let Some(z) = inner.zsets.get_mut(&keys.active) else {
            return Ok(false);
        };
        if !z.iter().any(|(_, m)| m == job_id) {
            return Ok(false);
        }
        zset_insert(z, (now_ms + lease.as_millis() as u64) as f64, job_id);
        Ok(true)
    }

    fn complete_active(&self, keys: &QueueKeys, job_id: &str) -> CoordResult<bool> {
        let mut inner = self.guard()?;
        let removed = inner
            .zsets
            .get_mut(&keys.active)
            .map(|z| zset_remove(z, job_id))
            .unwrap_or(false);
        if let Some(h) = inner.hashes.get_mut(&keys.scores) {
            h.remove(job_id);
        }
        if let Some(h) = inner.hashes.get_mut(&keys.stalls) {
            h.remove(job_id);
        }
        Ok(removed)
    }

    fn reap_expired_leases(
        &self,
        keys: &QueueKeys,
        now_ms: u64,
    ) -> CoordResult<Vec<(String, u32)>> {
        let mut inner = self.guard()?;

        let expired: Vec<String> = inner
            .zsets
            .get(&keys.active)
            .map(|z| {
                z.iter()
                    .take_while(|(score, _)| *score <= now_ms as f64)
                    .map(|(_, m)| m.clone())
                    .collect()
            })
            .unwrap_or_default();

        let mut out = Vec::with_capacity(expired.len());
        for job_id in expired {
            if let Some(z) = inner.zsets.get_mut(&keys.active) {
                zset_remove(z, &job_id);
            }
            let score = inner
                .hashes
                .get(&keys.scores)
                .and_then(|h| h.get(&job_id))
                .and_then(|s| s.parse::<f64>().ok())
                .unwrap_or(0.0);
            zset_insert(inner.zsets.entry(keys.ready.clone()).or_default(), score, &job_id);

            let stalls = inner.hashes.entry(keys.stalls.clone()).or_default();
            let count = stalls
                .get(&job_id)
                .and_then(|s| s.parse::<u32>().ok())
                .unwrap_or(0)
                + 1;
            stalls.insert(job_id.clone(), count.to_string());
            out.push((job_id, count));
        }

        Ok(out)
    }

    fn remove_ready(&self, keys: &QueueKeys, job_id: &str) -> CoordResult<bool> {
        let mut inner = self.guard()?;
        let removed = inner
            .zsets
            .get_mut(&keys.ready)
            .map(|z| zset_remove(z, job_id))
            .unwrap_or(false);
        if removed {
            if let Some(h) = inner.hashes.get_mut(&keys.scores) {
                h.remove(job_id);
            }
            if let Some(h) = inner.hashes.get_mut(&keys.stalls) {
                h.remove(job_id);
            }
        }
        Ok(removed)
    }

    fn push_trim(
        &self,
        key: &str,
        member: &str,
        score: f64,
        max_len: usize,
    ) -> CoordResult<Vec<String>> {
        let mut inner = self.guard()?;
        let z = inner.zsets.entry(key.to_string()).or_default();
        zset_insert(z, score, member);

        let mut evicted = Vec::new();
        while z.len() > max_len {
            evicted.push(z.remove(0).1);
        }
        Ok(evicted)
    }

    fn remove_member(&self, key: &str, member: &str) -> CoordResult<bool> {
        let mut inner = self.guard()?;
        Ok(inner
            .zsets
            .get_mut(key)
            .map(|z| zset_remove(z, member))
            .unwrap_or(false))
    }

    fn queue_depths(&self, keys: &QueueKeys) -> CoordResult<QueueDepths> {
        let inner = self.guard()?;
        let len = |k: &str| inner.zsets.get(k).map(|z| z.len() as u64).unwrap_or(0);
        Ok(QueueDepths {
            ready: len(&keys.ready),
            delayed: len(&keys.delayed),
            active: len(&keys.active),
        })
    }
}
