//! Store abstraction.

use std::time::Duration;

use latch_core::{CoordResult, QueueKeys};

/// Depth of each live queue structure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueDepths {
    pub ready: u64,
    pub delayed: u64,
    pub active: u64,
}

/// Atomic primitives over the shared store.
///
/// Each method is a single atomic step on the store. Compound operations
/// (`compare_and_*`, `claim_ready`, `promote_due`, ...) must not be
/// emulated with separate reads and writes by implementations; on Redis
/// they are Lua scripts, in memory they run under one mutex.
///
/// All errors are infrastructure errors (`CoordError::Connection` for
/// transport failures); callers decide retry/fail-open/fail-closed policy.
pub trait AtomicStore: Send + Sync {
    // --- plain KV ---

    fn get(&self, key: &str) -> CoordResult<Option<String>>;

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CoordResult<()>;

    /// Returns true if the key existed.
    fn delete(&self, key: &str) -> CoordResult<bool>;

    /// `SET key value NX PX ttl`. Returns true if the key was created.
    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> CoordResult<bool>;

    /// Delete `key` only if its current value equals `expected`.
    /// Returns false (a no-op signal, not an error) on mismatch or absence.
    fn compare_and_delete(&self, key: &str, expected: &str) -> CoordResult<bool>;

    /// Reset the TTL of `key` only if its current value equals `expected`.
    fn compare_and_expire(&self, key: &str, expected: &str, ttl: Duration) -> CoordResult<bool>;

    /// Replace the value of `key` only if its current value equals
    /// `expected` (`None` = key must be absent). The optimistic-concurrency
    /// primitive behind the token bucket.
    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> CoordResult<bool>;

    /// Atomic increment. `ttl_on_create` is stamped only when this call
    /// creates the key, so a counter's expiry is fixed by its first hit.
    fn increment(&self, key: &str, by: i64, ttl_on_create: Option<Duration>) -> CoordResult<i64>;

    /// Remaining TTL in milliseconds, or None if the key is absent or has
    /// no expiry.
    fn ttl_millis(&self, key: &str) -> CoordResult<Option<u64>>;

    // --- queue structures ---

    /// Make a job claimable. Records `score` (priority band + insertion
    /// sequence) in the scores hash so the job keeps its place if it is
    /// ever reaped back from a crashed worker.
    fn enqueue_ready(&self, keys: &QueueKeys, job_id: &str, score: f64) -> CoordResult<()>;

    /// Park a job until `ready_at_ms`; `ready_score` is its ready-zset
    /// score once promoted.
    fn enqueue_delayed(
        &self,
        keys: &QueueKeys,
        job_id: &str,
        ready_at_ms: u64,
        ready_score: f64,
    ) -> CoordResult<()>;

    /// Move every delayed job whose ready-at time has passed into the
    /// ready zset. Returns the number promoted.
    fn promote_due(&self, keys: &QueueKeys, now_ms: u64) -> CoordResult<u64>;

    /// Atomically pop the best ready job and mark it active with a lease
    /// expiring at `now_ms + lease`. At most one caller ever receives a
    /// given job id.
    fn claim_ready(
        &self,
        keys: &QueueKeys,
        now_ms: u64,
        lease: Duration,
    ) -> CoordResult<Option<String>>;

    /// Push a held job's lease deadline forward. Returns false if the job
    /// is no longer active (completed or reaped).
    fn extend_lease(
        &self,
        keys: &QueueKeys,
        job_id: &str,
        now_ms: u64,
        lease: Duration,
    ) -> CoordResult<bool>;

    /// Drop a job from the active set and clear its bookkeeping.
    /// Returns false if it was not active.
    fn complete_active(&self, keys: &QueueKeys, job_id: &str) -> CoordResult<bool>;

    /// Move every active job whose lease deadline has passed back into the
    /// ready zset (at its original score) and bump its stall count.
    /// Returns `(job_id, stall_count)` pairs.
    fn reap_expired_leases(&self, keys: &QueueKeys, now_ms: u64)
    -> CoordResult<Vec<(String, u32)>>;

    /// Remove a specific job from the ready zset (used to terminally fail
    /// a repeatedly stalling job). Returns false if another worker already
    /// claimed it.
    fn remove_ready(&self, keys: &QueueKeys, job_id: &str) -> CoordResult<bool>;

    /// Add `member` to a retention zset and trim it to `max_len` entries,
    /// returning the evicted members (oldest first) so their records can
    /// be deleted.
    fn push_trim(
        &self,
        key: &str,
        member: &str,
        score: f64,
        max_len: usize,
    ) -> CoordResult<Vec<String>>;

    /// Remove one member from a retention zset (e.g. when a failed job is
    /// resurrected for another run).
    fn remove_member(&self, key: &str, member: &str) -> CoordResult<bool>;

    fn queue_depths(&self, keys: &QueueKeys) -> CoordResult<QueueDepths>;
}
