//! Core job types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique job identifier (time-ordered).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Job lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Claimable by any worker.
    Waiting,
    /// Parked until its scheduled time.
    Delayed,
    /// Claimed by exactly one worker, lease-protected.
    Active,
    /// Terminal success.
    Completed,
    /// Terminal failure (retry budget exhausted or stall ceiling hit).
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

/// Backoff shape for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// Flat delay between retries.
    Fixed,
    /// base * 2^(attempt-1), capped.
    Exponential,
}

/// Maps a retry attempt number to the delay before the next attempt.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub kind: BackoffKind,
    pub base_delay: Duration,
    /// Cap so exponential growth cannot produce unbounded retry latency.
    pub max_delay: Duration,
    /// Jitter factor (0.0-1.0); deterministic per attempt so tests stay
    /// reproducible.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::exponential(Duration::from_millis(2_000), Duration::from_secs(60))
    }
}

impl BackoffPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            base_delay: delay,
            max_delay: delay,
            jitter: 0.0,
        }
    }

    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            base_delay,
            max_delay,
            jitter: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retrying after `attempt` failures (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.kind {
            BackoffKind::Fixed => base_ms.min(max_ms),
            BackoffKind::Exponential => {
                let exp = 2_f64.powi((attempt - 1).min(62) as i32);
                (base_ms * exp).min(max_ms)
            }
        };

        // Attempt-derived pseudo-jitter; zero by default.
        let jitter_range = delay_ms * self.jitter;
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }
}

/// Per-queue defaults, overridable per job.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QueueOptions {
    /// Total execution attempts before a job fails terminally.
    pub attempts: u32,
    pub backoff: BackoffPolicy,
    /// Drop the job record immediately on success instead of retaining it.
    pub remove_on_complete: bool,
    /// Drop the job record immediately on terminal failure.
    pub remove_on_fail: bool,
    /// How many finished jobs to keep for inspection (per outcome).
    pub keep_finished: usize,
    /// How many times a job may be reaped from a crashed/hung worker
    /// before it is failed terminally instead of requeued.
    pub max_stalls: u32,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: BackoffPolicy::default(),
            remove_on_complete: false,
            remove_on_fail: false,
            keep_finished: 1_000,
            max_stalls: 3,
        }
    }
}

/// Per-job submission options.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct JobOptions {
    /// Higher priority is claimed first within the same readiness tier.
    pub priority: i32,
    /// Keep the job invisible to workers until this much time has passed.
    pub delay: Duration,
    /// Override the queue's attempt budget.
    pub attempts: Option<u32>,
    /// Override the queue's backoff policy.
    pub backoff: Option<BackoffPolicy>,
}

impl JobOptions {
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts.max(1));
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = Some(backoff);
        self
    }
}

/// Record of one execution attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobAttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// A unit of background work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue: String,
    /// Opaque payload; this layer never interprets it.
    pub payload: serde_json::Value,
    pub priority: i32,
    pub state: JobState,
    /// Finished execution attempts. Never exceeds `max_attempts`.
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// When a delayed/retrying job becomes claimable.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Times this job was reaped from an expired lease.
    pub stalls: u32,
    pub last_error: Option<String>,
    pub history: Vec<JobAttemptRecord>,
}

/// What a processor callback reports back to the worker.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    Success,
    /// Failed; retried per the job's backoff policy until attempts run out.
    Failure(String),
    /// Failed; retried after exactly this delay instead of the backoff
    /// curve (still consumes an attempt).
    RetryAfter(String, Duration),
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let policy =
            BackoffPolicy::exponential(Duration::from_millis(2_000), Duration::from_secs(60));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(2_000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(4_000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(8_000));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(60));
    }

    #[test]
    fn fixed_backoff_is_flat() {
        let policy = BackoffPolicy::fixed(Duration::from_millis(500));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(7), Duration::from_millis(500));
    }

    #[test]
    fn jitter_stays_within_range_and_is_deterministic() {
        let policy = BackoffPolicy::exponential(Duration::from_millis(1_000), Duration::from_secs(60))
            .with_jitter(0.1);

        let d1 = policy.delay_for_attempt(1);
        assert_eq!(d1, policy.delay_for_attempt(1));
        assert!(d1 >= Duration::from_millis(900) && d1 <= Duration::from_millis(1_100));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: the backoff curve is monotonic (without jitter) and
        /// never exceeds its cap, for any attempt number.
        #[test]
        fn backoff_is_monotonic_and_capped(
            base_ms in 1u64..10_000,
            cap_ms in 1u64..600_000,
            attempt in 1u32..100,
        ) {
            let cap_ms = cap_ms.max(base_ms);
            let policy = BackoffPolicy::exponential(
                Duration::from_millis(base_ms),
                Duration::from_millis(cap_ms),
            );

            let here = policy.delay_for_attempt(attempt);
            let next = policy.delay_for_attempt(attempt + 1);
            prop_assert!(here <= next);
            prop_assert!(next <= Duration::from_millis(cap_ms));
        }
    }
}
