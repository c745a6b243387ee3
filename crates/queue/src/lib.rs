//! `latch-queue` — distributed job queues with retry, backoff, and
//! stalled-job recovery.
//!
//! ## Design
//!
//! - All queue state lives in the shared atomic store; process instances
//!   coordinate only through it (work-stealing across instances is free)
//! - Jobs carry priority, delay, a retry budget, and a backoff policy
//! - Claiming is a single store-atomic step: two workers, even in
//!   different processes, never receive the same job
//! - Active jobs hold a lease; a crashed worker's lease expires and the
//!   job is reaped back to waiting instead of being lost
//! - Finished jobs are retained in a bounded window for inspection
//!
//! ## Components
//!
//! - [`QueueManager`]: queue registry, submission, and the job state
//!   machine (`Waiting → Active → Completed | retry | Failed`)
//! - [`Worker`]: per-queue pool of claim loops invoking a processor
//!   callback, with lease heartbeats and graceful shutdown
//! - [`Job`]: the unit of work, an opaque JSON payload plus scheduling
//!   metadata

pub mod manager;
pub mod types;
pub mod worker;

pub use manager::{JobCounts, QueueManager};
pub use types::{
    BackoffKind, BackoffPolicy, Job, JobAttemptRecord, JobId, JobOptions, JobState, ProcessOutcome,
    QueueOptions,
};
pub use worker::{Processor, Worker, WorkerConfig, WorkerHandle, WorkerStats};
