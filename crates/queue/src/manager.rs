//! Queue registry and the job state machine.
//!
//! The manager owns no threads. It translates job lifecycle transitions
//! (`Waiting → Active → Completed | retry | Failed`) into atomic store
//! operations; [`crate::worker::Worker`] drives it from claim loops.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::DateTime;
use latch_core::{Clock, CoordError, CoordResult, Namespace, QueueKeys};
use latch_store::AtomicStore;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::types::{Job, JobAttemptRecord, JobId, JobOptions, JobState, QueueOptions};

/// Priorities outside this band collapse to its edge; the band keeps the
/// composed zset score inside f64's exact-integer range.
const PRIORITY_BAND: i32 = 1_024;

/// Snapshot of how many jobs sit in each state of one queue.
///
/// `completed` and `failed` are cumulative counters, not retained-record
/// counts, so they keep growing past the retention window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Composes priority and insertion order into one ready-zset score.
///
/// Lower score pops first, so higher priority maps to a lower band; the
/// store-issued sequence breaks ties in submission order.
fn ready_score(priority: i32, seq: i64) -> f64 {
    let band = (PRIORITY_BAND - priority.clamp(-PRIORITY_BAND, PRIORITY_BAND)) as f64;
    band * 1e10 + seq as f64
}

pub struct QueueManager {
    store: Arc<dyn AtomicStore>,
    clock: Arc<dyn Clock>,
    ns: Namespace,
    queues: RwLock<HashMap<String, QueueEntry>>,
    closed: AtomicBool,
}

struct QueueEntry {
    options: QueueOptions,
    closed: bool,
}

impl QueueManager {
    pub fn new(store: Arc<dyn AtomicStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            ns: Namespace::default(),
            queues: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_namespace(mut self, ns: Namespace) -> Self {
        self.ns = ns;
        self
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Register a queue. Idempotent: re-registering keeps the original
    /// options so concurrent boot paths cannot fight over defaults.
    pub fn queue(&self, name: &str, options: QueueOptions) -> CoordResult<()> {
        self.ensure_open()?;
        let mut queues = self.queues.write().unwrap_or_else(|e| e.into_inner());
        if queues.contains_key(name) {
            return Ok(());
        }
        info!(queue = %name, attempts = options.attempts, "queue registered");
        queues.insert(
            name.to_string(),
            QueueEntry {
                options,
                closed: false,
            },
        );
        Ok(())
    }

    pub fn queue_names(&self) -> Vec<String> {
        let queues = self.queues.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn options(&self, queue: &str) -> CoordResult<QueueOptions> {
        let queues = self.queues.read().unwrap_or_else(|e| e.into_inner());
        queues
            .get(queue)
            .map(|e| e.options)
            .ok_or_else(|| CoordError::queue_not_found(queue))
    }

    fn queue_is_closed(&self, queue: &str) -> bool {
        let queues = self.queues.read().unwrap_or_else(|e| e.into_inner());
        queues.get(queue).map(|e| e.closed).unwrap_or(false)
    }

    /// Close one queue: submissions are refused and claims come back
    /// empty, while in-flight jobs finish normally.
    pub fn close_queue(&self, queue: &str) -> CoordResult<()> {
        let mut queues = self.queues.write().unwrap_or_else(|e| e.into_inner());
        let entry = queues
            .get_mut(queue)
            .ok_or_else(|| CoordError::queue_not_found(queue))?;
        if !entry.closed {
            entry.closed = true;
            info!(queue = %queue, "queue closed");
        }
        Ok(())
    }

    /// Stop accepting new jobs everywhere. Claiming and in-flight
    /// completion keep working so workers can drain.
    pub fn close_all(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!("queue manager closed, refusing new jobs");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> CoordResult<()> {
        if self.is_closed() {
            return Err(CoordError::Closed);
        }
        Ok(())
    }

    fn keys(&self, queue: &str) -> QueueKeys {
        self.ns.queue(queue)
    }

    fn save_job(&self, keys: &QueueKeys, job: &Job) -> CoordResult<()> {
        let body = serde_json::to_string(job)
            .map_err(|e| CoordError::serialization(e.to_string()))?;
        self.store.set(&keys.job(&job.id.to_string()), &body, None)
    }

    fn load_job(&self, keys: &QueueKeys, job_id: &str) -> CoordResult<Option<Job>> {
        match self.store.get(&keys.job(job_id))? {
            Some(body) => serde_json::from_str(&body)
                .map(Some)
                .map_err(|e| CoordError::serialization(e.to_string())),
            None => Ok(None),
        }
    }

    /// Issue the next insertion sequence number and compose the ready score.
    fn next_score(&self, keys: &QueueKeys, priority: i32) -> CoordResult<f64> {
        let seq = self.store.increment(&keys.seq, 1, None)?;
        Ok(ready_score(priority, seq))
    }

    /// Submit a job. It lands in `Waiting` (claimable immediately) or
    /// `Delayed` (invisible until its scheduled time).
    pub fn add_job(
        &self,
        queue: &str,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> CoordResult<Job> {
        self.ensure_open()?;
        let defaults = self.options(queue)?;
        if self.queue_is_closed(queue) {
            return Err(CoordError::Closed);
        }
        let keys = self.keys(queue);

        let now_ms = self.clock.now_ms();
        let now = self.clock.now_utc();
        let delayed = !options.delay.is_zero();

        let mut job = Job {
            id: JobId::new(),
            queue: queue.to_string(),
            payload,
            priority: options.priority,
            state: if delayed {
                JobState::Delayed
            } else {
                JobState::Waiting
            },
            attempts_made: 0,
            max_attempts: options.attempts.unwrap_or(defaults.attempts).max(1),
            backoff: options.backoff.unwrap_or(defaults.backoff),
            created_at: now,
            updated_at: now,
            scheduled_at: None,
            stalls: 0,
            last_error: None,
            history: Vec::new(),
        };

        let score = self.next_score(&keys, job.priority)?;
        let id = job.id.to_string();

        if delayed {
            let ready_at_ms = now_ms + options.delay.as_millis() as u64;
            job.scheduled_at = DateTime::from_timestamp_millis(ready_at_ms as i64);
            self.save_job(&keys, &job)?;
            self.store
                .enqueue_delayed(&keys, &id, ready_at_ms, score)?;
        } else {
            self.save_job(&keys, &job)?;
            self.store.enqueue_ready(&keys, &id, score)?;
        }

        debug!(
            queue = %queue,
            job_id = %id,
            priority = job.priority,
            delayed,
            "job added"
        );
        Ok(job)
    }

    pub fn job(&self, queue: &str, id: &JobId) -> CoordResult<Option<Job>> {
        self.load_job(&self.keys(queue), &id.to_string())
    }

    pub fn job_counts(&self, queue: &str) -> CoordResult<JobCounts> {
        let keys = self.keys(queue);
        let depths = self.store.queue_depths(&keys)?;
        let completed = self.read_counter(&keys.completed_total)?;
        let failed = self.read_counter(&keys.failed_total)?;
        Ok(JobCounts {
            waiting: depths.ready,
            delayed: depths.delayed,
            active: depths.active,
            completed,
            failed,
        })
    }

    fn read_counter(&self, key: &str) -> CoordResult<u64> {
        Ok(self
            .store
            .get(key)?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    /// Move every delayed job whose time has come into the ready zset.
    pub fn promote_due(&self, queue: &str) -> CoordResult<u64> {
        let keys = self.keys(queue);
        let promoted = self.store.promote_due(&keys, self.clock.now_ms())?;
        if promoted > 0 {
            debug!(queue = %queue, promoted, "delayed jobs promoted");
            // Promotion is a zset move; the per-job records still read
            // `Delayed` until claimed, which the claim path fixes up.
        }
        Ok(promoted)
    }

    /// Claim the best ready job, marking it `Active` under a lease.
    ///
    /// The pop is a single store-atomic step, so no two callers (in any
    /// process) ever receive the same job.
    pub fn claim(&self, queue: &str, lease: Duration) -> CoordResult<Option<Job>> {
        if self.queue_is_closed(queue) {
            return Ok(None);
        }
        let keys = self.keys(queue);
        loop {
            let Some(id) = self.store.claim_ready(&keys, self.clock.now_ms(), lease)? else {
                return Ok(None);
            };
            let Some(mut job) = self.load_job(&keys, &id)? else {
                // Record vanished (e.g. trimmed by retention after a manual
                // requeue); clear the dangling membership and keep popping.
                warn!(queue = %queue, job_id = %id, "claimed id has no record, dropping");
                self.store.complete_active(&keys, &id)?;
                continue;
            };
            job.state = JobState::Active;
            job.updated_at = self.clock.now_utc();
            self.save_job(&keys, &job)?;
            debug!(queue = %queue, job_id = %id, attempt = job.attempts_made + 1, "job claimed");
            return Ok(Some(job));
        }
    }

    /// Push an active job's lease deadline forward (worker heartbeat).
    pub fn extend_lease(&self, job: &Job, lease: Duration) -> CoordResult<bool> {
        let keys = self.keys(&job.queue);
        self.store
            .extend_lease(&keys, &job.id.to_string(), self.clock.now_ms(), lease)
    }

    /// Record a successful attempt and finish the job.
    ///
    /// Returns `false` when the job was no longer active (its lease expired
    /// and it was reaped); the result is discarded so the reaped copy's
    /// next run stays authoritative.
    pub fn complete(&self, job: &mut Job, started_at_ms: u64) -> CoordResult<bool> {
        let keys = self.keys(&job.queue);
        let id = job.id.to_string();
        if !self.store.complete_active(&keys, &id)? {
            warn!(queue = %job.queue, job_id = %id, "completion after lease loss, discarding");
            return Ok(false);
        }

        job.attempts_made += 1;
        job.record_attempt(self.attempt_record(job.attempts_made, started_at_ms, None));
        job.state = JobState::Completed;
        job.updated_at = self.clock.now_utc();

        let defaults = self.options(&job.queue)?;
        self.retain_finished(&keys, &keys.completed, job, defaults.remove_on_complete, defaults.keep_finished)?;
        self.store.increment(&keys.completed_total, 1, None)?;
        debug!(queue = %job.queue, job_id = %id, attempts = job.attempts_made, "job completed");
        Ok(true)
    }

    /// Record a failed attempt: requeue with backoff while the attempt
    /// budget lasts, otherwise fail terminally.
    ///
    /// `override_delay` bypasses the backoff curve for this one retry
    /// (processor-requested `RetryAfter`).
    pub fn fail(
        &self,
        job: &mut Job,
        error: &str,
        started_at_ms: u64,
        override_delay: Option<Duration>,
    ) -> CoordResult<bool> {
        let keys = self.keys(&job.queue);
        let id = job.id.to_string();
        if !self.store.complete_active(&keys, &id)? {
            warn!(queue = %job.queue, job_id = %id, "failure report after lease loss, discarding");
            return Ok(false);
        }

        job.attempts_made += 1;
        job.record_attempt(self.attempt_record(job.attempts_made, started_at_ms, Some(error)));
        job.last_error = Some(error.to_string());
        job.updated_at = self.clock.now_utc();

        if job.attempts_made < job.max_attempts {
            let delay =
                override_delay.unwrap_or_else(|| job.backoff.delay_for_attempt(job.attempts_made));
            self.requeue_for_retry(&keys, job, delay)?;
            debug!(
                queue = %job.queue,
                job_id = %id,
                attempt = job.attempts_made,
                delay_ms = delay.as_millis() as u64,
                error,
                "job failed, retrying"
            );
        } else {
            self.fail_terminally(&keys, job)?;
            warn!(
                queue = %job.queue,
                job_id = %id,
                attempts = job.attempts_made,
                error,
                "job failed terminally, attempts exhausted"
            );
        }
        Ok(true)
    }

    fn requeue_for_retry(&self, keys: &QueueKeys, job: &mut Job, delay: Duration) -> CoordResult<()> {
        let score = self.next_score(keys, job.priority)?;
        let id = job.id.to_string();
        if delay.is_zero() {
            job.state = JobState::Waiting;
            job.scheduled_at = None;
            self.save_job(keys, job)?;
            self.store.enqueue_ready(keys, &id, score)?;
        } else {
            let ready_at_ms = self.clock.now_ms() + delay.as_millis() as u64;
            job.state = JobState::Delayed;
            job.scheduled_at = DateTime::from_timestamp_millis(ready_at_ms as i64);
            self.save_job(keys, job)?;
            self.store.enqueue_delayed(keys, &id, ready_at_ms, score)?;
        }
        Ok(())
    }

    fn fail_terminally(&self, keys: &QueueKeys, job: &mut Job) -> CoordResult<()> {
        job.state = JobState::Failed;
        job.scheduled_at = None;
        let defaults = self.options(&job.queue)?;
        self.retain_finished(keys, &keys.failed, job, defaults.remove_on_fail, defaults.keep_finished)?;
        self.store.increment(&keys.failed_total, 1, None)?;
        Ok(())
    }

    /// Persist or drop a finished job per the queue's retention policy,
    /// trimming the retention window and deleting evicted records.
    fn retain_finished(
        &self,
        keys: &QueueKeys,
        set_key: &str,
        job: &Job,
        remove: bool,
        keep: usize,
    ) -> CoordResult<()> {
        let id = job.id.to_string();
        if remove {
            self.store.delete(&keys.job(&id))?;
            return Ok(());
        }
        self.save_job(keys, job)?;
        let evicted = self
            .store
            .push_trim(set_key, &id, self.clock.now_ms() as f64, keep)?;
        for old in evicted {
            self.store.delete(&keys.job(&old))?;
        }
        Ok(())
    }

    /// Requeue every active job whose lease has expired (its worker crashed
    /// or hung). A job reaped more than `max_stalls` times fails terminally
    /// instead of cycling forever.
    ///
    /// Returns the ids put back into `Waiting`.
    pub fn reap_stalled(&self, queue: &str) -> CoordResult<Vec<JobId>> {
        let defaults = self.options(queue)?;
        let keys = self.keys(queue);
        let reaped = self.store.reap_expired_leases(&keys, self.clock.now_ms())?;

        let mut requeued = Vec::new();
        for (id, stall_count) in reaped {
            let Some(mut job) = self.load_job(&keys, &id)? else {
                self.store.remove_ready(&keys, &id)?;
                continue;
            };
            job.stalls = stall_count;
            job.updated_at = self.clock.now_utc();

            if stall_count > defaults.max_stalls {
                // Another worker may already have popped it back off ready;
                // in that case leave the new holder alone.
                if !self.store.remove_ready(&keys, &id)? {
                    continue;
                }
                job.last_error = Some(format!(
                    "job stalled {stall_count} times (lease expired without completion)"
                ));
                self.fail_terminally(&keys, &mut job)?;
                warn!(queue = %queue, job_id = %id, stalls = stall_count, "stalled job failed terminally");
            } else {
                job.state = JobState::Waiting;
                self.save_job(&keys, &job)?;
                warn!(queue = %queue, job_id = %id, stalls = stall_count, "stalled job requeued");
                requeued.push(job.id);
            }
        }
        Ok(requeued)
    }

    /// Resurrect a terminally `Failed` job: attempt and stall counters
    /// reset, back to `Waiting` at its original priority.
    pub fn retry_job(&self, queue: &str, id: &JobId) -> CoordResult<bool> {
        self.ensure_open()?;
        self.options(queue)?;
        let keys = self.keys(queue);
        let id_str = id.to_string();

        let Some(mut job) = self.load_job(&keys, &id_str)? else {
            return Ok(false);
        };
        if job.state != JobState::Failed {
            return Ok(false);
        }

        self.store.remove_member(&keys.failed, &id_str)?;
        job.state = JobState::Waiting;
        job.attempts_made = 0;
        job.stalls = 0;
        job.scheduled_at = None;
        job.updated_at = self.clock.now_utc();

        let score = self.next_score(&keys, job.priority)?;
        self.save_job(&keys, &job)?;
        self.store.enqueue_ready(&keys, &id_str, score)?;
        info!(queue = %queue, job_id = %id_str, "failed job requeued for retry");
        Ok(true)
    }

    fn attempt_record(
        &self,
        attempt: u32,
        started_at_ms: u64,
        error: Option<&str>,
    ) -> JobAttemptRecord {
        let finished_ms = self.clock.now_ms();
        JobAttemptRecord {
            attempt,
            started_at: DateTime::from_timestamp_millis(started_at_ms as i64)
                .unwrap_or_else(|| self.clock.now_utc()),
            finished_at: self.clock.now_utc(),
            success: error.is_none(),
            error: error.map(str::to_string),
            duration_ms: finished_ms.saturating_sub(started_at_ms),
        }
    }
}

impl Job {
    fn record_attempt(&mut self, record: JobAttemptRecord) {
        self.history.push(record);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Mutex;

    use latch_core::ManualClock;
    use latch_store::MemoryStore;
    use serde_json::json;

    use super::*;
    use crate::types::BackoffPolicy;

    const LEASE: Duration = Duration::from_secs(30);

    fn manager_with_clock() -> (QueueManager, Arc<ManualClock>) {
        let clock = ManualClock::arc(1_000_000);
        let store = MemoryStore::arc(clock.clone());
        (QueueManager::new(store, clock.clone()), clock)
    }

    fn registered(queue: &str, options: QueueOptions) -> (QueueManager, Arc<ManualClock>) {
        let (manager, clock) = manager_with_clock();
        manager.queue(queue, options).unwrap();
        (manager, clock)
    }

    #[test]
    fn unknown_queue_is_an_error() {
        let (manager, _) = manager_with_clock();
        let err = manager
            .add_job("nope", json!({}), JobOptions::default())
            .unwrap_err();
        assert_eq!(err, CoordError::queue_not_found("nope"));
    }

    #[test]
    fn higher_priority_claims_first_then_fifo() {
        let (manager, _) = registered("emails", QueueOptions::default());

        let low_a = manager
            .add_job("emails", json!({"n": 1}), JobOptions::default().with_priority(1))
            .unwrap();
        let high = manager
            .add_job("emails", json!({"n": 2}), JobOptions::default().with_priority(5))
            .unwrap();
        let low_b = manager
            .add_job("emails", json!({"n": 3}), JobOptions::default().with_priority(1))
            .unwrap();

        let order: Vec<JobId> = (0..3)
            .map(|_| manager.claim("emails", LEASE).unwrap().unwrap().id)
            .collect();
        assert_eq!(order, vec![high.id, low_a.id, low_b.id]);
        assert!(manager.claim("emails", LEASE).unwrap().is_none());
    }

    #[test]
    fn delayed_job_is_invisible_until_promoted() {
        let (manager, clock) = registered("reports", QueueOptions::default());

        let job = manager
            .add_job(
                "reports",
                json!({"report": "weekly"}),
                JobOptions::default().with_delay(Duration::from_secs(5)),
            )
            .unwrap();
        assert_eq!(job.state, JobState::Delayed);

        assert_eq!(manager.promote_due("reports").unwrap(), 0);
        assert!(manager.claim("reports", LEASE).unwrap().is_none());

        clock.advance(Duration::from_secs(5));
        assert_eq!(manager.promote_due("reports").unwrap(), 1);
        let claimed = manager.claim("reports", LEASE).unwrap().unwrap();
        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.state, JobState::Active);
    }

    #[test]
    fn failure_retries_with_backoff_then_exhausts() {
        let options = QueueOptions {
            attempts: 3,
            backoff: BackoffPolicy::exponential(
                Duration::from_millis(2_000),
                Duration::from_secs(60),
            ),
            ..QueueOptions::default()
        };
        let (manager, clock) = registered("sync", options);
        let job = manager
            .add_job("sync", json!({}), JobOptions::default())
            .unwrap();

        // Attempt 1 fails: retry delayed by the base 2 s.
        let mut claimed = manager.claim("sync", LEASE).unwrap().unwrap();
        manager
            .fail(&mut claimed, "upstream 503", clock.now_ms(), None)
            .unwrap();
        assert_eq!(claimed.state, JobState::Delayed);
        assert_eq!(claimed.attempts_made, 1);
        assert!(manager.claim("sync", LEASE).unwrap().is_none());

        clock.advance(Duration::from_millis(2_000));
        manager.promote_due("sync").unwrap();

        // Attempt 2 fails: delay doubles to 4 s.
        let mut claimed = manager.claim("sync", LEASE).unwrap().unwrap();
        manager
            .fail(&mut claimed, "upstream 503", clock.now_ms(), None)
            .unwrap();
        assert_eq!(claimed.attempts_made, 2);

        clock.advance(Duration::from_millis(3_999));
        manager.promote_due("sync").unwrap();
        assert!(manager.claim("sync", LEASE).unwrap().is_none());
        clock.advance(Duration::from_millis(1));
        manager.promote_due("sync").unwrap();

        // Attempt 3 fails: budget exhausted, terminal.
        let mut claimed = manager.claim("sync", LEASE).unwrap().unwrap();
        manager
            .fail(&mut claimed, "upstream 503", clock.now_ms(), None)
            .unwrap();
        assert_eq!(claimed.state, JobState::Failed);
        assert_eq!(claimed.attempts_made, 3);

        let stored = manager.job("sync", &job.id).unwrap().unwrap();
        assert_eq!(stored.state, JobState::Failed);
        assert_eq!(stored.history.len(), 3);
        assert_eq!(stored.last_error.as_deref(), Some("upstream 503"));

        let counts = manager.job_counts("sync").unwrap();
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.waiting, 0);
    }

    #[test]
    fn retry_after_overrides_backoff_delay() {
        let (manager, clock) = registered("sync", QueueOptions::default());
        manager
            .add_job("sync", json!({}), JobOptions::default())
            .unwrap();

        let mut claimed = manager.claim("sync", LEASE).unwrap().unwrap();
        manager
            .fail(
                &mut claimed,
                "rate limited",
                clock.now_ms(),
                Some(Duration::from_millis(250)),
            )
            .unwrap();

        clock.advance(Duration::from_millis(250));
        manager.promote_due("sync").unwrap();
        assert!(manager.claim("sync", LEASE).unwrap().is_some());
    }

    #[test]
    fn claims_are_exclusive_across_threads() {
        let clock = Arc::new(latch_core::SystemClock);
        let store = MemoryStore::arc(clock.clone());
        let manager = Arc::new(QueueManager::new(store, clock));
        manager.queue("work", QueueOptions::default()).unwrap();

        for i in 0..40 {
            manager
                .add_job("work", json!({"i": i}), JobOptions::default())
                .unwrap();
        }

        let seen: Arc<Mutex<Vec<JobId>>> = Arc::new(Mutex::new(Vec::new()));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                let seen = seen.clone();
                std::thread::spawn(move || {
                    while let Some(job) = manager.claim("work", LEASE).unwrap() {
                        seen.lock().unwrap().push(job.id);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let claimed = seen.lock().unwrap();
        assert_eq!(claimed.len(), 40);
        let unique: HashSet<JobId> = claimed.iter().copied().collect();
        assert_eq!(unique.len(), 40);
    }

    #[test]
    fn expired_lease_is_reaped_back_to_waiting() {
        let (manager, clock) = registered("video", QueueOptions::default());
        let job = manager
            .add_job("video", json!({}), JobOptions::default())
            .unwrap();

        let claimed = manager.claim("video", Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(claimed.id, job.id);

        // Lease still live: nothing to reap.
        assert!(manager.reap_stalled("video").unwrap().is_empty());

        clock.advance(Duration::from_secs(2));
        let requeued = manager.reap_stalled("video").unwrap();
        assert_eq!(requeued, vec![job.id]);

        let stored = manager.job("video", &job.id).unwrap().unwrap();
        assert_eq!(stored.state, JobState::Waiting);
        assert_eq!(stored.stalls, 1);
        // A stall is not a finished attempt.
        assert_eq!(stored.attempts_made, 0);

        let reclaimed = manager.claim("video", LEASE).unwrap().unwrap();
        assert_eq!(reclaimed.id, job.id);
    }

    #[test]
    fn repeated_stalls_fail_terminally() {
        let options = QueueOptions {
            max_stalls: 1,
            ..QueueOptions::default()
        };
        let (manager, clock) = registered("video", options);
        let job = manager
            .add_job("video", json!({}), JobOptions::default())
            .unwrap();

        // First stall: under the ceiling, requeued.
        manager.claim("video", Duration::from_secs(1)).unwrap().unwrap();
        clock.advance(Duration::from_secs(2));
        assert_eq!(manager.reap_stalled("video").unwrap(), vec![job.id]);

        // Second stall: over the ceiling, terminal.
        manager.claim("video", Duration::from_secs(1)).unwrap().unwrap();
        clock.advance(Duration::from_secs(2));
        assert!(manager.reap_stalled("video").unwrap().is_empty());

        let stored = manager.job("video", &job.id).unwrap().unwrap();
        assert_eq!(stored.state, JobState::Failed);
        assert_eq!(stored.stalls, 2);
        assert!(stored.last_error.as_deref().unwrap().contains("stalled"));
        assert_eq!(manager.job_counts("video").unwrap().failed, 1);
    }

    #[test]
    fn completion_after_lease_loss_is_discarded() {
        let (manager, clock) = registered("video", QueueOptions::default());
        let job = manager
            .add_job("video", json!({}), JobOptions::default())
            .unwrap();

        let mut claimed = manager.claim("video", Duration::from_secs(1)).unwrap().unwrap();
        clock.advance(Duration::from_secs(2));
        manager.reap_stalled("video").unwrap();

        // The original worker finally reports success, too late.
        assert!(!manager.complete(&mut claimed, clock.now_ms()).unwrap());

        let stored = manager.job("video", &job.id).unwrap().unwrap();
        assert_eq!(stored.state, JobState::Waiting);
        assert_eq!(manager.job_counts("video").unwrap().completed, 0);
    }

    #[test]
    fn retention_trims_oldest_completed_records() {
        let options = QueueOptions {
            keep_finished: 2,
            ..QueueOptions::default()
        };
        let (manager, clock) = registered("emails", options);

        let mut ids = Vec::new();
        for i in 0..3 {
            let job = manager
                .add_job("emails", json!({"i": i}), JobOptions::default())
                .unwrap();
            ids.push(job.id);
            let mut claimed = manager.claim("emails", LEASE).unwrap().unwrap();
            manager.complete(&mut claimed, clock.now_ms()).unwrap();
            clock.advance(Duration::from_millis(10));
        }

        // Cumulative counter keeps all three; only the two newest records
        // survive the trim.
        assert_eq!(manager.job_counts("emails").unwrap().completed, 3);
        assert!(manager.job("emails", &ids[0]).unwrap().is_none());
        assert!(manager.job("emails", &ids[1]).unwrap().is_some());
        assert!(manager.job("emails", &ids[2]).unwrap().is_some());
    }

    #[test]
    fn remove_on_complete_drops_the_record() {
        let options = QueueOptions {
            remove_on_complete: true,
            ..QueueOptions::default()
        };
        let (manager, clock) = registered("emails", options);
        let job = manager
            .add_job("emails", json!({}), JobOptions::default())
            .unwrap();

        let mut claimed = manager.claim("emails", LEASE).unwrap().unwrap();
        manager.complete(&mut claimed, clock.now_ms()).unwrap();

        assert!(manager.job("emails", &job.id).unwrap().is_none());
        assert_eq!(manager.job_counts("emails").unwrap().completed, 1);
    }

    #[test]
    fn retry_job_resurrects_a_failed_job() {
        let options = QueueOptions {
            attempts: 1,
            ..QueueOptions::default()
        };
        let (manager, clock) = registered("sync", options);
        let job = manager
            .add_job("sync", json!({}), JobOptions::default())
            .unwrap();

        let mut claimed = manager.claim("sync", LEASE).unwrap().unwrap();
        manager
            .fail(&mut claimed, "boom", clock.now_ms(), None)
            .unwrap();
        assert_eq!(claimed.state, JobState::Failed);

        assert!(manager.retry_job("sync", &job.id).unwrap());
        let stored = manager.job("sync", &job.id).unwrap().unwrap();
        assert_eq!(stored.state, JobState::Waiting);
        assert_eq!(stored.attempts_made, 0);

        let reclaimed = manager.claim("sync", LEASE).unwrap().unwrap();
        assert_eq!(reclaimed.id, job.id);

        // Only Failed jobs can be retried.
        assert!(!manager.retry_job("sync", &job.id).unwrap());
    }

    #[test]
    fn close_all_refuses_new_jobs() {
        let (manager, _) = registered("emails", QueueOptions::default());
        manager
            .add_job("emails", json!({}), JobOptions::default())
            .unwrap();

        manager.close_all();
        assert!(manager.is_closed());
        let err = manager
            .add_job("emails", json!({}), JobOptions::default())
            .unwrap_err();
        assert_eq!(err, CoordError::Closed);

        // Draining still works.
        assert!(manager.claim("emails", LEASE).unwrap().is_some());
    }

    #[test]
    fn close_queue_stops_one_queue_only() {
        let (manager, _) = registered("emails", QueueOptions::default());
        manager.queue("reports", QueueOptions::default()).unwrap();
        manager
            .add_job("emails", json!({}), JobOptions::default())
            .unwrap();

        manager.close_queue("emails").unwrap();
        assert_eq!(
            manager
                .add_job("emails", json!({}), JobOptions::default())
                .unwrap_err(),
            CoordError::Closed
        );
        // Claims against the closed queue come back empty even though a
        // job is waiting.
        assert!(manager.claim("emails", LEASE).unwrap().is_none());

        // The other queue is untouched.
        manager
            .add_job("reports", json!({}), JobOptions::default())
            .unwrap();
        assert!(manager.claim("reports", LEASE).unwrap().is_some());

        assert_eq!(
            manager.close_queue("ghost").unwrap_err(),
            CoordError::queue_not_found("ghost")
        );
    }

    #[test]
    fn registration_is_idempotent_and_first_wins() {
        let (manager, _) = manager_with_clock();
        manager
            .queue("emails", QueueOptions { attempts: 5, ..QueueOptions::default() })
            .unwrap();
        manager
            .queue("emails", QueueOptions { attempts: 9, ..QueueOptions::default() })
            .unwrap();
        assert_eq!(manager.options("emails").unwrap().attempts, 5);
        assert_eq!(manager.queue_names(), vec!["emails".to_string()]);
    }

    #[test]
    fn score_orders_priority_bands_before_sequence() {
        // Higher priority always beats lower, regardless of sequence.
        assert!(ready_score(5, 1_000_000) < ready_score(1, 1));
        // Within a band, earlier sequence wins.
        assert!(ready_score(1, 1) < ready_score(1, 2));
        // Extreme priorities clamp instead of overflowing the band.
        assert!(ready_score(i32::MAX, 1) < ready_score(0, 1));
        assert!(ready_score(0, 1) < ready_score(i32::MIN, 1));
    }
}
