//! Fixed-window counter.

use std::sync::Arc;
use std::time::Duration;

use latch_core::{Clock, CoordResult, Namespace};
use latch_store::AtomicStore;

use crate::decision::{FailurePolicy, RateDecision};

/// Counts admissions per `(identifier, window index)` bucket.
///
/// The window index is epoch time divided by the window size, so all
/// processes agree on bucket boundaries without coordination. The counter
/// key's expiry is stamped on the first increment of the window and never
/// refreshed, so it dies no later than the window does.
pub struct FixedWindowLimiter {
    store: Arc<dyn AtomicStore>,
    clock: Arc<dyn Clock>,
    ns: Namespace,
    policy: FailurePolicy,
}

impl FixedWindowLimiter {
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

    /// Record one attempt for `identifier` and decide admission.
    ///
    /// Every attempt is counted, admitted or not, so a saturated caller
    /// cannot probe for free.
    pub fn check(
        &self,
        identifier: &str,
        limit: u64,
        window: Duration,
    ) -> CoordResult<RateDecision> {
        let window_ms = (window.as_millis() as u64).max(1);
        let now = self.clock.now_ms();
        let window_index = now / window_ms;
        let reset_at = (window_index + 1) * window_ms;

        let key = self.ns.rate_window(identifier, window_index);
        let ttl = Duration::from_millis(reset_at - now);
        let count = match self.store.increment(&key, 1, Some(ttl)) {
            Ok(count) => count.max(0) as u64,
            Err(e) => return self.policy.on_store_error(e),
        };

        Ok(if count <= limit {
            RateDecision::allow(limit - count, Some(reset_at))
        } else {
            RateDecision::reject(Some(reset_at), Duration::from_millis(reset_at - now))
        })
    }
}
