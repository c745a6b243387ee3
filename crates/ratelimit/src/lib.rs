//! `latch-ratelimit` — admission control over the shared atomic store.
//!
//! Two independent algorithms:
//!
//! - [`FixedWindowLimiter`] — counts requests per discrete time bucket.
//!   Cheap (one atomic increment per check) but tolerates bursts at
//!   window boundaries; this is a known approximation, not a sliding log.
//! - [`TokenBucketLimiter`] — a refillable budget of permits. State is
//!   updated through an optimistic compare-and-swap loop so concurrent
//!   checks for the same identifier never lose updates.
//!
//! Rate-limit rejection is a structured decision, not an error: hot-path
//! callers match on [`RateDecision::allowed`]. Store outages are resolved
//! by the limiter's [`FailurePolicy`] — closed for security-sensitive call
//! sites, open for best-effort ones — chosen per limiter instance.

pub mod bucket;
mod decision;
pub mod window;

pub use bucket::{BucketConfig, TokenBucketLimiter};
pub use decision::{FailurePolicy, RateDecision};
pub use window::FixedWindowLimiter;
