//! Store key layout.
//!
//! Every key the coordination layer writes lives under one namespace so
//! several deployments can share a store, and so the three subsystems
//! (locks, rate limits, queues) can never collide.
//!
//! Layout:
//!
//! - `{ns}:lock:{resource}` — lock owner token
//! - `{ns}:rate:win:{id}:{window}` — fixed-window counter
//! - `{ns}:rate:bkt:{id}` — token bucket state (JSON)
//! - `{ns}:queue:{name}:ready` — zset of claimable job ids, priority order
//! - `{ns}:queue:{name}:delayed` — zset of job ids scored by ready-at time
//! - `{ns}:queue:{name}:active` — zset of claimed job ids scored by lease
//!   deadline
//! - `{ns}:queue:{name}:scores` — hash job id -> ready score (kept until
//!   the job finishes so reaping can restore priority order)
//! - `{ns}:queue:{name}:stalls` — hash job id -> times reaped from active
//! - `{ns}:queue:{name}:job:{id}` — serialized job record
//! - `{ns}:queue:{name}:seq` — insertion-order counter
//! - `{ns}:queue:{name}:completed` / `:failed` — retention zsets and
//!   `:completed_total` / `:failed_total` cumulative counters

/// Key prefix shared by one logical deployment of the coordination layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace(String);

impl Namespace {
    pub fn new(ns: impl Into<String>) -> Self {
        Self(ns.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn lock(&self, resource: &str) -> String {
        format!("{}:lock:{}", self.0, resource)
    }

    pub fn rate_window(&self, identifier: &str, window_index: u64) -> String {
        format!("{}:rate:win:{}:{}", self.0, identifier, window_index)
    }

    pub fn rate_bucket(&self, identifier: &str) -> String {
        format!("{}:rate:bkt:{}", self.0, identifier)
    }

    pub fn queue(&self, name: &str) -> QueueKeys {
        let base = format!("{}:queue:{}", self.0, name);
        QueueKeys {
            ready: format!("{base}:ready"),
            delayed: format!("{base}:delayed"),
            active: format!("{base}:active"),
            scores: format!("{base}:scores"),
            stalls: format!("{base}:stalls"),
            seq: format!("{base}:seq"),
            completed: format!("{base}:completed"),
            failed: format!("{base}:failed"),
            completed_total: format!("{base}:completed_total"),
            failed_total: format!("{base}:failed_total"),
            base,
        }
    }
}

impl Default for Namespace {
    fn default() -> Self {
        Self::new("latch")
    }
}

/// The full set of keys backing one named queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    base: String,
    pub ready: String,
    pub delayed: String,
    pub active: String,
    pub scores: String,
    pub stalls: String,
    pub seq: String,
    pub completed: String,
    pub failed: String,
    pub completed_total: String,
    pub failed_total: String,
}

impl QueueKeys {
    pub fn job(&self, job_id: &str) -> String {
        format!("{}:job:{}", self.base, job_id)
    }
}
