//! Token bucket.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use latch_core::{Clock, CoordError, CoordResult, Namespace};
use latch_store::AtomicStore;

use crate::decision::{FailurePolicy, RateDecision};

/// How many optimistic-swap attempts before the failure policy decides.
const MAX_CAS_ATTEMPTS: u32 = 4;

/// Bucket shape: `capacity` permits, refilled `refill_rate` per
/// `refill_period`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketConfig {
    pub capacity: u64,
    pub refill_rate: u64,
    pub refill_period: Duration,
}

impl BucketConfig {
    fn period_ms(&self) -> u64 {
        (self.refill_period.as_millis() as u64).max(1)
    }

    /// Time for one whole token to accrue.
    fn token_interval(&self) -> Duration {
        Duration::from_millis(self.period_ms().div_ceil(self.refill_rate.max(1)))
    }

    /// Idle expiry: twice the time to refill from empty. A bucket nobody
    /// checks for that long may as well start full again.
    fn idle_ttl(&self) -> Duration {
        let to_full = self
            .capacity
            .max(1)
            .div_ceil(self.refill_rate.max(1))
            .saturating_mul(self.period_ms());
        Duration::from_millis(to_full.saturating_mul(2).max(1_000))
    }
}

/// Persisted bucket state.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BucketState {
    tokens: u64,
    last_refill: u64,
}

/// Refillable-budget limiter.
///
/// State lives in one store key per identifier. Each check reads the
/// state, applies the deterministic refill function, and writes back via
/// compare-and-swap; losing a swap means another process checked the same
/// identifier concurrently, and we retry against its update. The refill is
/// persisted even on rejection, otherwise a bucket under sustained
/// overload would never refill.
pub struct TokenBucketLimiter {
    store: Arc<dyn AtomicStore>,
    clock: Arc<dyn Clock>,
    ns: Namespace,
    policy: FailurePolicy,
}

impl TokenBucketLimiter {
    pub fn new(
        store: Arc<dyn AtomicStore>,
        clock: Arc<dyn Clock>,
        ns: Namespace,
        policy: FailurePolicy,
    ) -> Self {
        Self {
            store,
            clock,
            ns,
            policy,
        }
    }

    /// Take one permit for `identifier` if the bucket holds any.
    pub fn check(&self, identifier: &str, config: &BucketConfig) -> CoordResult<RateDecision> {
        let key = self.ns.rate_bucket(identifier);

        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = match self.store.get(&key) {
                Ok(v) => v,
                Err(e) => return self.policy.on_store_error(e),
            };

            let now = self.clock.now_ms();
            let state = current
                .as_deref()
                .and_then(parse_state)
                // Unknown identifier (or garbage state): lazily start full.
                .unwrap_or(BucketState {
                    tokens: config.capacity,
                    last_refill: now,
                });

            let elapsed = now.saturating_sub(state.last_refill);
            let refill = elapsed.saturating_mul(config.refill_rate) / config.period_ms();
            let tokens = config.capacity.min(state.tokens.saturating_add(refill));

            let allowed = tokens >= 1;
            let next = BucketState {
                tokens: if allowed { tokens - 1 } else { tokens },
                last_refill: now,
            };
            let encoded = serde_json::to_string(&next)
                .map_err(|e| CoordError::serialization(e.to_string()))?;

            let swapped = match self.store.compare_and_swap(
                &key,
                current.as_deref(),
                &encoded,
                Some(config.idle_ttl()),
            ) {
                Ok(swapped) => swapped,
                Err(e) => return self.policy.on_store_error(e),
            };

            if swapped {
                return Ok(if allowed {
                    RateDecision::allow(next.tokens, None)
                } else {
                    RateDecision::reject(None, config.token_interval())
                });
            }
            // Lost the race; re-read and retry.
        }

        Ok(self.policy.on_contention())
    }
}

fn parse_state(raw: &str) -> Option<BucketState> {
    serde_json::from_str(raw).ok()
}
