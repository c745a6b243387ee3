//! `latch-store` — the shared atomic store client.
//!
//! Every cross-process interaction in the coordination layer goes through
//! the [`AtomicStore`] trait: a thin set of primitives (set-if-absent,
//! compare-and-delete, atomic increment, zset-backed queue structures) that
//! the lock, rate-limiter, and queue crates compose. No read-then-write
//! sequence ever touches shared state without one of these guards.
//!
//! Two implementations:
//!
//! - [`RedisStore`] — production backend; compound operations run as
//!   server-side Lua scripts so they are atomic on the single-threaded
//!   store.
//! - [`MemoryStore`] — mutex-guarded fake for tests and development, with
//!   an injected clock so TTL behavior is deterministic.

pub mod memory;
pub mod redis_store;
mod traits;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;
pub use traits::{AtomicStore, QueueDepths};
