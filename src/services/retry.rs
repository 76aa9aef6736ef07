//! Retry and failure policies.
//!
//! Both policies are plain data so the degraded-mode transition of the
//! resilient store is derivable (and testable) from the policy alone,
//! with no hidden retry loops inside graph calls.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::sleep;

use crate::domain::errors::{CoreError, CoreResult};

/// Bounded retry with exponential backoff for transient errors.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt. Graph and gateway calls use 1.
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            initial_backoff_ms: 250,
            max_backoff_ms: 2_000,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_backoff_ms: u64, max_backoff_ms: u64) -> Self {
        Self {
            max_retries,
            initial_backoff_ms,
            max_backoff_ms,
        }
    }

    /// Run `operation`, retrying transient failures up to `max_retries`
    /// times. Ownership, policy, and integrity errors are never retried.
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> CoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CoreResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.max_retries => {
                    let backoff = self.backoff_for(attempt);
                    tracing::debug!(
                        attempt = attempt + 1,
                        max = self.max_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "retrying transient failure"
                    );
                    sleep(backoff).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        let ms = self
            .initial_backoff_ms
            .saturating_mul(2_u64.saturating_pow(attempt))
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// When the resilient store flips to degraded mode and back.
#[derive(Debug, Clone)]
pub struct FailurePolicy {
    /// Failures within `failure_window` that trip the degraded state.
    pub failure_threshold: u32,
    pub failure_window: chrono::Duration,
    /// Probe cadence while degraded.
    pub probe_interval: Duration,
    /// Consecutive probe successes required to exit (journal must also
    /// have drained).
    pub recovery_threshold: u32,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: chrono::Duration::seconds(60),
            probe_interval: Duration::from_secs(30),
            recovery_threshold: 10,
        }
    }
}

/// Sliding-window failure tracker driven by a [`FailurePolicy`].
#[derive(Debug, Default)]
pub struct FailureTracker {
    failures: Vec<DateTime<Utc>>,
    consecutive_probe_successes: u32,
}

impl FailureTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failed call. Returns true if the policy threshold is now
    /// met within the window.
    pub fn record_failure(&mut self, policy: &FailurePolicy, at: DateTime<Utc>) -> bool {
        self.failures.push(at);
        let cutoff = at - policy.failure_window;
        self.failures.retain(|t| *t > cutoff);
        self.failures.len() as u32 >= policy.failure_threshold
    }

    /// A successful call in healthy mode clears the window.
    pub fn record_success(&mut self) {
        self.failures.clear();
    }

    /// Record a probe outcome while degraded. Returns true once the
    /// recovery threshold is reached.
    pub fn record_probe(&mut self, policy: &FailurePolicy, success: bool) -> bool {
        if success {
            self.consecutive_probe_successes += 1;
        } else {
            self.consecutive_probe_successes = 0;
        }
        self.consecutive_probe_successes >= policy.recovery_threshold
    }

    /// Reset after leaving degraded mode.
    pub fn reset(&mut self) {
        self.failures.clear();
        self.consecutive_probe_successes = 0;
    }
}
