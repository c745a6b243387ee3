//! Worker pool: claim loops, lease heartbeats, graceful shutdown.
//!
//! A worker runs `concurrency` claim loops on OS threads against one
//! queue. Each loop does housekeeping (promote due delayed jobs, reap
//! expired leases), claims one job, runs the processor callback, and
//! reports the outcome back to the [`QueueManager`]. A shared heartbeat
//! thread extends the lease of every in-flight job so long-running
//! processors are not reaped out from under a healthy worker.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use latch_core::CoordResult;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::manager::QueueManager;
use crate::types::{Job, JobState, ProcessOutcome};

/// Job callback. Runs on a worker thread; panics are caught and treated
/// as a failed attempt.
pub type Processor = Arc<dyn Fn(&Job) -> ProcessOutcome + Send + Sync>;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of claim loops (threads).
    pub concurrency: usize,
    /// Sleep between polls when the queue is empty.
    pub poll_interval: Duration,
    /// Lease granted per claim; crashed workers are reaped this long
    /// after their last heartbeat.
    pub lease: Duration,
    /// Thread-name prefix, for logs and debuggers.
    pub name: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            poll_interval: Duration::from_millis(100),
            lease: Duration::from_secs(30),
            name: "worker".to_string(),
        }
    }
}

/// Cumulative counters for one worker pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    /// Attempts that ran to an outcome (success, failure, or panic).
    pub processed: u64,
    pub succeeded: u64,
    /// Failed attempts, including ones that will retry.
    pub failed: u64,
    /// Failed attempts the manager requeued for another run.
    pub retried: u64,
    /// Processor panics (counted in `failed` as well).
    pub panicked: u64,
    /// Expired-lease jobs this pool reaped back to waiting.
    pub stalled_reclaimed: u64,
}

/// A worker pool bound to one queue, not yet running.
pub struct Worker {
    manager: Arc<QueueManager>,
    queue: String,
    processor: Processor,
    config: WorkerConfig,
}

type InFlight = Arc<Mutex<HashMap<String, Job>>>;

impl Worker {
    pub fn new(manager: Arc<QueueManager>, queue: impl Into<String>, processor: Processor) -> Self {
        Self {
            manager,
            queue: queue.into(),
            processor,
            config: WorkerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Start the claim loops and heartbeat thread.
    ///
    /// Fails fast if the queue was never registered.
    pub fn spawn(self) -> CoordResult<WorkerHandle> {
        self.manager.options(&self.queue)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        let in_flight: InFlight = Arc::new(Mutex::new(HashMap::new()));
        let concurrency = self.config.concurrency.max(1);

        info!(
            queue = %self.queue,
            worker = %self.config.name,
            concurrency,
            "worker starting"
        );

        let mut threads = Vec::with_capacity(concurrency + 1);
        for slot in 0..concurrency {
            let loop_ = ClaimLoop {
                manager: self.manager.clone(),
                queue: self.queue.clone(),
                processor: self.processor.clone(),
                config: self.config.clone(),
                shutdown: shutdown.clone(),
                stats: stats.clone(),
                in_flight: in_flight.clone(),
            };
            let handle = thread::Builder::new()
                .name(format!("{}-{}", self.config.name, slot))
                .spawn(move || loop_.run())
                .map_err(|e| latch_core::CoordError::invalid_config(e.to_string()))?;
            threads.push(handle);
        }

        let heartbeat = Heartbeat {
            manager: self.manager.clone(),
            queue: self.queue.clone(),
            lease: self.config.lease,
            shutdown: shutdown.clone(),
            in_flight: in_flight.clone(),
        };
        let handle = thread::Builder::new()
            .name(format!("{}-heartbeat", self.config.name))
            .spawn(move || heartbeat.run())
            .map_err(|e| latch_core::CoordError::invalid_config(e.to_string()))?;
        threads.push(handle);

        Ok(WorkerHandle {
            queue: self.queue,
            name: self.config.name,
            shutdown,
            threads,
            stats,
        })
    }
}

/// Control handle for a running worker pool.
#[derive(Debug)]
pub struct WorkerHandle {
    queue: String,
    name: String,
    shutdown: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    /// Counter snapshot.
    pub fn stats(&self) -> WorkerStats {
        *self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Stop claiming immediately and wait for in-flight jobs to finish.
    pub fn shutdown(mut self) {
        info!(queue = %self.queue, worker = %self.name, "worker shutting down");
        self.shutdown.store(true, Ordering::SeqCst);
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                error!(queue = %self.queue, worker = %self.name, "worker thread panicked");
            }
        }
        info!(queue = %self.queue, worker = %self.name, "worker stopped");
    }
}

struct ClaimLoop {
    manager: Arc<QueueManager>,
    queue: String,
    processor: Processor,
    config: WorkerConfig,
    shutdown: Arc<AtomicBool>,
    stats: Arc<Mutex<WorkerStats>>,
    in_flight: InFlight,
}

impl ClaimLoop {
    fn run(self) {
        while !self.shutdown.load(Ordering::SeqCst) {
            match self.tick() {
                Ok(worked) => {
                    if !worked && !self.shutdown.load(Ordering::SeqCst) {
                        thread::sleep(self.config.poll_interval);
                    }
                }
                Err(err) => {
                    error!(queue = %self.queue, error = %err, "claim loop store error, backing off");
                    thread::sleep(self.config.poll_interval);
                }
            }
        }
    }

    /// One housekeeping-claim-process cycle. Returns false when the queue
    /// was empty (caller sleeps before the next poll).
    fn tick(&self) -> CoordResult<bool> {
        self.manager.promote_due(&self.queue)?;
        let reclaimed = self.manager.reap_stalled(&self.queue)?.len() as u64;
        if reclaimed > 0 {
            self.with_stats(|s| s.stalled_reclaimed += reclaimed);
        }

        let Some(mut job) = self.manager.claim(&self.queue, self.config.lease)? else {
            return Ok(false);
        };

        let id = job.id.to_string();
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), job.clone());
        let started_at_ms = self.manager.clock().now_ms();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| (self.processor)(&job)));

        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);

        match outcome {
            Ok(ProcessOutcome::Success) => {
                self.manager.complete(&mut job, started_at_ms)?;
                self.with_stats(|s| {
                    s.processed += 1;
                    s.succeeded += 1;
                });
            }
            Ok(ProcessOutcome::Failure(error)) => {
                self.manager.fail(&mut job, &error, started_at_ms, None)?;
                self.record_failure(&job);
            }
            Ok(ProcessOutcome::RetryAfter(error, delay)) => {
                self.manager
                    .fail(&mut job, &error, started_at_ms, Some(delay))?;
                self.record_failure(&job);
            }
            Err(payload) => {
                let error = panic_message(payload.as_ref());
                warn!(queue = %self.queue, job_id = %id, error = %error, "processor panicked");
                self.manager.fail(&mut job, &error, started_at_ms, None)?;
                self.record_failure(&job);
                self.with_stats(|s| s.panicked += 1);
            }
        }
        Ok(true)
    }

    fn record_failure(&self, job: &Job) {
        let retried = job.state != JobState::Failed;
        self.with_stats(|s| {
            s.processed += 1;
            s.failed += 1;
            if retried {
                s.retried += 1;
            }
        });
    }

    fn with_stats(&self, f: impl FnOnce(&mut WorkerStats)) {
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut stats);
    }
}

struct Heartbeat {
    manager: Arc<QueueManager>,
    queue: String,
    lease: Duration,
    shutdown: Arc<AtomicBool>,
    in_flight: InFlight,
}

impl Heartbeat {
    /// Extend in-flight leases at a third of the lease interval, sleeping
    /// in short slices so shutdown is not held up by a long lease.
    fn run(self) {
        let interval = (self.lease / 3).max(Duration::from_millis(10));
        let slice = interval.min(Duration::from_millis(50));
        let mut elapsed = Duration::ZERO;

        while !self.shutdown.load(Ordering::SeqCst) {
            thread::sleep(slice);
            elapsed += slice;
            if elapsed < interval {
                continue;
            }
            elapsed = Duration::ZERO;

            let held: Vec<Job> = self
                .in_flight
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .values()
                .cloned()
                .collect();
            for job in held {
                match self.manager.extend_lease(&job, self.lease) {
                    Ok(true) => {
                        debug!(queue = %self.queue, job_id = %job.id, "lease extended");
                    }
                    Ok(false) => {
                        // Reaped while still running; the outcome will be
                        // discarded on completion.
                        warn!(queue = %self.queue, job_id = %job.id, "lease lost while processing");
                    }
                    Err(err) => {
                        error!(queue = %self.queue, job_id = %job.id, error = %err, "heartbeat failed");
                    }
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("processor panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("processor panicked: {s}")
    } else {
        "processor panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::time::Instant;

    use latch_core::SystemClock;
    use latch_store::MemoryStore;
    use serde_json::json;

    use super::*;
    use crate::types::{BackoffPolicy, JobOptions, QueueOptions};

    fn manager() -> Arc<QueueManager> {
        let clock = Arc::new(SystemClock);
        let store = MemoryStore::arc(clock.clone());
        Arc::new(QueueManager::new(store, clock))
    }

    fn fast_config(concurrency: usize) -> WorkerConfig {
        WorkerConfig {
            concurrency,
            poll_interval: Duration::from_millis(5),
            lease: Duration::from_secs(5),
            name: "test-worker".to_string(),
        }
    }

    /// Poll until `done` or a deadline; panics with `what` on timeout.
    fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn worker_drains_the_queue() {
        let manager = manager();
        manager.queue("emails", QueueOptions::default()).unwrap();
        for i in 0..5 {
            manager
                .add_job("emails", json!({"i": i}), JobOptions::default())
                .unwrap();
        }

        let hits = Arc::new(AtomicU32::new(0));
        let processor: Processor = {
            let hits = hits.clone();
            Arc::new(move |_job| {
                hits.fetch_add(1, Ordering::SeqCst);
                ProcessOutcome::Success
            })
        };

        let handle = Worker::new(manager.clone(), "emails", processor)
            .with_config(fast_config(2))
            .spawn()
            .unwrap();

        wait_until("all jobs completed", || {
            manager.job_counts("emails").unwrap().completed == 5
        });
        handle.shutdown();

        assert_eq!(hits.load(Ordering::SeqCst), 5);
        let counts = manager.job_counts("emails").unwrap();
        assert_eq!(counts.waiting, 0);
        assert_eq!(counts.active, 0);
    }

    #[test]
    fn worker_retries_failures_until_success() {
        let manager = manager();
        manager
            .queue(
                "sync",
                QueueOptions {
                    attempts: 5,
                    backoff: BackoffPolicy::fixed(Duration::from_millis(10)),
                    ..QueueOptions::default()
                },
            )
            .unwrap();
        manager
            .add_job("sync", json!({}), JobOptions::default())
            .unwrap();

        let attempts = Arc::new(AtomicU32::new(0));
        let processor: Processor = {
            let attempts = attempts.clone();
            Arc::new(move |_job| {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    ProcessOutcome::Failure("flaky downstream".to_string())
                } else {
                    ProcessOutcome::Success
                }
            })
        };

        let handle = Worker::new(manager.clone(), "sync", processor)
            .with_config(fast_config(1))
            .spawn()
            .unwrap();

        wait_until("job completed after retries", || {
            manager.job_counts("sync").unwrap().completed == 1
        });
        let stats = handle.stats();
        handle.shutdown();

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.retried, 2);
    }

    #[test]
    fn panicking_processor_fails_the_job() {
        let manager = manager();
        manager
            .queue(
                "sync",
                QueueOptions {
                    attempts: 1,
                    ..QueueOptions::default()
                },
            )
            .unwrap();
        let job = manager
            .add_job("sync", json!({}), JobOptions::default())
            .unwrap();

        let processor: Processor = Arc::new(|_job| panic!("boom"));
        let handle = Worker::new(manager.clone(), "sync", processor)
            .with_config(fast_config(1))
            .spawn()
            .unwrap();

        wait_until("job failed terminally", || {
            manager.job_counts("sync").unwrap().failed == 1
        });
        let stats = handle.stats();
        handle.shutdown();

        assert_eq!(stats.panicked, 1);
        let stored = manager.job("sync", &job.id).unwrap().unwrap();
        assert!(stored.last_error.as_deref().unwrap().contains("boom"));
    }

    #[test]
    fn shutdown_finishes_in_flight_work() {
        let manager = manager();
        manager.queue("slow", QueueOptions::default()).unwrap();
        for i in 0..10 {
            manager
                .add_job("slow", json!({"i": i}), JobOptions::default())
                .unwrap();
        }

        let processor: Processor = Arc::new(|_job| {
            thread::sleep(Duration::from_millis(50));
            ProcessOutcome::Success
        });
        let handle = Worker::new(manager.clone(), "slow", processor)
            .with_config(fast_config(2))
            .spawn()
            .unwrap();

        wait_until("first completion", || {
            manager.job_counts("slow").unwrap().completed >= 1
        });
        handle.shutdown();

        // In-flight jobs ran to completion; nothing is stranded in Active.
        let counts = manager.job_counts("slow").unwrap();
        assert_eq!(counts.active, 0);
        assert!(counts.completed >= 1);
        assert_eq!(counts.completed + counts.waiting, 10);
    }

    #[test]
    fn spawn_rejects_unknown_queue() {
        let manager = manager();
        let processor: Processor = Arc::new(|_job| ProcessOutcome::Success);
        let err = Worker::new(manager, "ghost", processor).spawn().unwrap_err();
        assert_eq!(err, latch_core::CoordError::queue_not_found("ghost"));
    }

    #[test]
    fn heartbeat_keeps_a_slow_job_alive() {
        let manager = manager();
        manager.queue("slow", QueueOptions::default()).unwrap();
        let job = manager
            .add_job("slow", json!({}), JobOptions::default())
            .unwrap();

        // Lease far shorter than the processing time, and a second idle
        // claim loop eagerly reaping; only the heartbeat keeps the job
        // from being reaped mid-run.
        let config = WorkerConfig {
            concurrency: 2,
            poll_interval: Duration::from_millis(5),
            lease: Duration::from_millis(200),
            name: "slow-worker".to_string(),
        };
        let processor: Processor = Arc::new(|_job| {
            thread::sleep(Duration::from_millis(600));
            ProcessOutcome::Success
        });

        let handle = Worker::new(manager.clone(), "slow", processor)
            .with_config(config)
            .spawn()
            .unwrap();

        wait_until("slow job completed", || {
            manager.job_counts("slow").unwrap().completed == 1
        });
        handle.shutdown();

        let stored = manager.job("slow", &job.id).unwrap().unwrap();
        assert_eq!(stored.state, JobState::Completed);
        assert_eq!(stored.stalls, 0);
        assert_eq!(stored.attempts_made, 1);
    }
}
