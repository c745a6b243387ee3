//! Admission decisions and store-failure policy.

use std::time::Duration;

use tracing::{error, warn};

use latch_core::{CoordError, CoordResult};

/// Outcome of one rate-limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// Permits left after this check (0 when rejected).
    pub remaining: u64,
    /// When the current window/budget resets, epoch ms. None when the
    /// limiter cannot say (e.g. a fail-open decision during an outage).
    pub reset_at_ms: Option<u64>,
    /// How long the caller should wait before retrying. Only set on
    /// rejection.
    pub retry_after: Option<Duration>,
}

impl RateDecision {
    pub(crate) fn allow(remaining: u64, reset_at_ms: Option<u64>) -> Self {
        Self {
            allowed: true,
            remaining,
            reset_at_ms,
            retry_after: None,
        }
    }

    pub(crate) fn reject(reset_at_ms: Option<u64>, retry_after: Duration) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            reset_at_ms,
            retry_after: Some(retry_after),
        }
    }
}

/// What a limiter does when the store is unreachable.
///
/// Fail closed (reject) for security-sensitive call sites such as auth
/// endpoints; fail open (admit) for best-effort ones. This must be an
/// explicit caller choice, never a hard-coded default buried in a limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    FailOpen,
    FailClosed,
}

impl FailurePolicy {
    /// Resolve a store error into a decision, or propagate it if it is
    /// not a connectivity problem.
    pub(crate) fn on_store_error(self, err: CoordError) -> CoordResult<RateDecision> {
        if !err.is_connection() {
            return Err(err);
        }
        error!(error = %err, policy = ?self, "rate-limit store unreachable");
        Ok(match self {
            Self::FailOpen => RateDecision::allow(0, None),
            Self::FailClosed => RateDecision::reject(None, Duration::from_secs(1)),
        })
    }

    /// Resolve a lost optimistic-concurrency race that exhausted its
    /// retry budget.
    pub(crate) fn on_contention(self) -> RateDecision {
        warn!(policy = ?self, "rate-limit state contention exhausted retries");
        match self {
            Self::FailOpen => RateDecision::allow(0, None),
            Self::FailClosed => RateDecision::reject(None, Duration::from_millis(50)),
        }
    }
}
