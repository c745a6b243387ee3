//! `latch-lock` — TTL-bounded distributed mutual exclusion.
//!
//! A lock is a single store key holding a random owner token, created with
//! set-if-absent + expiry. The TTL trades strict safety for liveness: a
//! crashed holder cannot wedge the resource forever. The flip side is that
//! release and extend must prove ownership with a compare step executed on
//! the store, otherwise a delayed release from a previous holder could
//! delete a lock that has since expired and been legitimately re-acquired.
//! That compare is the one invariant this crate exists to uphold.
//!
//! Acquisition is polling, not FIFO-fair: any waiter may win a given retry
//! cycle. Callers bound waiting with an explicit timeout and must treat
//! `None` as "did not acquire", never as an error.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use latch_core::{Clock, CoordResult, Namespace};
use latch_store::AtomicStore;

/// Proof of ownership for one acquisition. Opaque and single-use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken(String);

impl LockToken {
    fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Distributed lock manager over the shared atomic store.
pub struct LockManager {
    store: Arc<dyn AtomicStore>,
    clock: Arc<dyn Clock>,
    ns: Namespace,
    retry_interval: Duration,
}

impl LockManager {
    pub fn new(store: Arc<dyn AtomicStore>, clock: Arc<dyn Clock>, ns: Namespace) -> Self {
        Self {
            store,
            clock,
            ns,
            retry_interval: Duration::from_millis(100),
        }
    }

    /// Override the sleep between acquisition attempts (default 100 ms).
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Try to acquire `resource` for up to `acquire_timeout`.
    ///
    /// `Ok(None)` means the timeout elapsed without acquiring — an
    /// expected outcome under contention. `Err` means the store failed and
    /// the lock state is unknown.
    pub fn acquire(
        &self,
        resource: &str,
        ttl: Duration,
        acquire_timeout: Duration,
    ) -> CoordResult<Option<LockToken>> {
        let key = self.ns.lock(resource);
        let token = LockToken::generate();
        let deadline = self.clock.now_ms() + acquire_timeout.as_millis() as u64;

        loop {
            if self.store.set_if_absent(&key, token.as_str(), ttl)? {
                debug!(resource, "lock acquired");
                return Ok(Some(token));
            }

            let now = self.clock.now_ms();
            if now >= deadline {
                debug!(resource, "lock acquisition timed out");
                return Ok(None);
            }

            let remaining = Duration::from_millis(deadline - now);
            std::thread::sleep(self.retry_interval.min(remaining));
        }
    }

    /// Release `resource` if `token` still owns it.
    ///
    /// Returns false when the token no longer matches (the lock expired,
    /// or another holder re-acquired it) — a no-op signal, not an error.
    pub fn release(&self, resource: &str, token: &LockToken) -> CoordResult<bool> {
        let released = self
            .store
            .compare_and_delete(&self.ns.lock(resource), token.as_str())?;
        if !released {
            debug!(resource, "release skipped: token no longer owns the lock");
        }
        Ok(released)
    }

    /// Push the expiry of a held lock out to `new_ttl` from now.
    pub fn extend(&self, resource: &str, token: &LockToken, new_ttl: Duration) -> CoordResult<bool> {
        self.store
            .compare_and_expire(&self.ns.lock(resource), token.as_str(), new_ttl)
    }

    /// How much longer the lock on `resource` lives, whoever holds it.
    /// `None` when it is not held.
    pub fn remaining_ttl(&self, resource: &str) -> CoordResult<Option<Duration>> {
        Ok(self
            .store
            .ttl_millis(&self.ns.lock(resource))?
            .map(Duration::from_millis))
    }

    /// Acquire as an RAII guard. Dropping the guard releases the lock.
    pub fn acquire_guard(
        &self,
        resource: &str,
        ttl: Duration,
        acquire_timeout: Duration,
    ) -> CoordResult<Option<LockGuard<'_>>> {
        Ok(self
            .acquire(resource, ttl, acquire_timeout)?
            .map(|token| LockGuard {
                manager: self,
                resource: resource.to_string(),
                token: Some(token),
            }))
    }

    /// Run `f` under the lock, releasing on every exit path (including
    /// panics, via the guard's drop).
    ///
    /// `Ok(None)` means the lock was not acquired within `acquire_timeout`
    /// and `f` never ran.
    pub fn with_lock<T>(
        &self,
        resource: &str,
        ttl: Duration,
        acquire_timeout: Duration,
        f: impl FnOnce() -> T,
    ) -> CoordResult<Option<T>> {
        let Some(guard) = self.acquire_guard(resource, ttl, acquire_timeout)? else {
            return Ok(None);
        };
        let out = f();
        guard.release()?;
        Ok(Some(out))
    }
}

/// Holds a lock for a scope; releases on drop.
pub struct LockGuard<'a> {
    manager: &'a LockManager,
    resource: String,
    token: Option<LockToken>,
}

impl LockGuard<'_> {
    pub fn token(&self) -> Option<&LockToken> {
        self.token.as_ref()
    }

    /// Push the lock's expiry forward while still holding it.
    pub fn extend(&self, new_ttl: Duration) -> CoordResult<bool> {
        match &self.token {
            Some(token) => self.manager.extend(&self.resource, token, new_ttl),
            None => Ok(false),
        }
    }

    /// Release explicitly, surfacing store errors (a drop-release cannot).
    pub fn release(mut self) -> CoordResult<bool> {
        match self.token.take() {
            Some(token) => self.manager.release(&self.resource, &token),
            None => Ok(false),
        }
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            if let Err(e) = self.manager.release(&self.resource, &token) {
                warn!(resource = %self.resource, error = %e, "failed to release lock on drop");
            }
        }
    }
}
