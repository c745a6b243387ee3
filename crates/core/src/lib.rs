//! `latch-core` — foundation building blocks for the coordination layer.
//!
//! This crate contains the pieces every other crate composes: the error
//! taxonomy, the clock abstraction, key namespacing, and configuration.
//! No I/O happens here.

pub mod clock;
pub mod config;
pub mod error;
pub mod keys;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CoordConfig;
pub use error::{CoordError, CoordResult};
pub use keys::{Namespace, QueueKeys};
