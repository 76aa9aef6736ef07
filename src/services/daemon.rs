//! Daemon loop: cycles aligned to wall-clock 5-minute boundaries.
//!
//! The due-task predicate divides wall-clock offsets, so cycle starts MUST
//! land on multiples of the interval. The daemon sleeps to the next
//! boundary rather than ticking a fixed period, which also absorbs drift
//! from long cycles.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};

use crate::domain::models::AgentId;
use crate::services::cancel::CancelToken;
use crate::services::cycle_runner::CycleRunner;

/// Time until the next wall-clock multiple of `interval_minutes`.
///
/// Exactly on a boundary, the full interval is returned: the current
/// boundary's cycle is assumed to have just fired.
pub fn until_next_boundary(now: DateTime<Utc>, interval_minutes: u32) -> Duration {
    let interval_secs = u64::from(interval_minutes) * 60;
    let seconds_into_hour = u64::from(now.minute()) * 60 + u64::from(now.second());
    let into_interval = seconds_into_hour % interval_secs;
    let wait = interval_secs - into_interval;
    // Shave the sub-second part so we land on the boundary, not after it.
    Duration::from_secs(wait).saturating_sub(Duration::from_nanos(u64::from(now.nanosecond())))
}

/// Long-lived heartbeat master loop.
pub struct Daemon {
    runner: Arc<CycleRunner>,
    interval_minutes: u32,
    shutdown: CancelToken,
}

impl Daemon {
    pub fn new(runner: Arc<CycleRunner>, interval_minutes: u32, shutdown: CancelToken) -> Self {
        Self {
            runner,
            interval_minutes,
            shutdown,
        }
    }

    /// Loop until the shutdown token fires. Cycle failures are logged and
    /// the loop continues; the next boundary gets a fresh attempt.
    pub async fn run(&self, agent: Option<AgentId>) {
        tracing::info!(interval_minutes = self.interval_minutes, "daemon started");
        loop {
            let wait = until_next_boundary(Utc::now(), self.interval_minutes);
            tracing::debug!(wait_secs = wait.as_secs(), "sleeping to next boundary");

            tokio::select! {
                () = self.shutdown.cancelled() => {
                    tracing::info!("daemon shutting down");
                    return;
                }
                () = tokio::time::sleep(wait) => {}
            }

            match self.runner.run_cycle(agent).await {
                Ok(summary) => {
                    if summary.had_failures() {
                        tracing::warn!(
                            cycle = summary.cycle.cycle_number,
                            failed = summary.cycle.tasks_failed,
                            "cycle completed with failures"
                        );
                    }
                }
                Err(err) => {
                    tracing::error!(error = %err, "cycle aborted");
                }
            }
        }
    }
}
