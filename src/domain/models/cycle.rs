//! Heartbeat cycle records.
//!
//! One `HeartbeatCycle` row is written per scheduler tick, with one linked
//! `TaskResult` per handler invocation. Cycle rows are immutable once
//! finalised; `cycle_number` is strictly monotonic across process restarts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::agent::AgentId;

/// Outcome class of a single handler invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskResultStatus {
    Success,
    Error,
    Timeout,
    /// Deferred because the cycle's cumulative token cap was reached.
    SkippedBudget,
}

impl TaskResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Timeout => "timeout",
            Self::SkippedBudget => "skipped_budget",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "success" => Some(Self::Success),
            "error" => Some(Self::Error),
            "timeout" => Some(Self::Timeout),
            "skipped_budget" => Some(Self::SkippedBudget),
            _ => None,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Error | Self::Timeout)
    }
}

/// One scheduler tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatCycle {
    /// Strictly monotonic across the process identity; resumes from
    /// `max(existing) + 1` after a restart.
    pub cycle_number: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub tasks_run: u32,
    pub tasks_succeeded: u32,
    pub tasks_failed: u32,
    pub total_tokens: u64,
    pub duration_seconds: f64,
}

impl HeartbeatCycle {
    /// Open a new cycle row at `started_at`. Counts are filled on finalise.
    pub fn open(cycle_number: u64, started_at: DateTime<Utc>) -> Self {
        Self {
            cycle_number,
            started_at,
            completed_at: None,
            tasks_run: 0,
            tasks_succeeded: 0,
            tasks_failed: 0,
            total_tokens: 0,
            duration_seconds: 0.0,
        }
    }

    /// Fold a handler result into the cycle counters.
    pub fn absorb(&mut self, result: &TaskResult) {
        self.tasks_run += 1;
        match result.status {
            TaskResultStatus::Success => self.tasks_succeeded += 1,
            TaskResultStatus::Error | TaskResultStatus::Timeout => self.tasks_failed += 1,
            TaskResultStatus::SkippedBudget => {}
        }
        self.total_tokens += u64::from(result.tokens_used);
    }

    /// Close the cycle at `completed_at`.
    pub fn finalise(&mut self, completed_at: DateTime<Utc>) {
        self.completed_at = Some(completed_at);
        self.duration_seconds = (completed_at - self.started_at)
            .num_milliseconds()
            .max(0) as f64
            / 1000.0;
    }
}

/// One handler invocation within a cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub agent: AgentId,
    pub task_name: String,
    pub status: TaskResultStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub summary: String,
    pub error_message: Option<String>,
    pub tokens_used: u32,
}

impl TaskResult {
    pub fn success(
        agent: AgentId,
        task_name: impl Into<String>,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
        summary: impl Into<String>,
        tokens_used: u32,
    ) -> Self {
        Self {
            agent,
            task_name: task_name.into(),
            status: TaskResultStatus::Success,
            started_at,
            completed_at,
            summary: summary.into(),
            error_message: None,
            tokens_used,
        }
    }

    pub fn error(
        agent: AgentId,
        task_name: impl Into<String>,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
        error: impl Into<String>,
    ) -> Self {
        let error = error.into();
        Self {
            agent,
            task_name: task_name.into(),
            status: TaskResultStatus::Error,
            started_at,
            completed_at,
            summary: "handler failed".to_string(),
            error_message: Some(error),
            tokens_used: 0,
        }
    }

    /// A handler that hit its hard deadline. `duration_seconds` of the
    /// recorded span equals the deadline by construction.
    pub fn timeout(
        agent: AgentId,
        task_name: impl Into<String>,
        started_at: DateTime<Utc>,
        deadline_seconds: u64,
    ) -> Self {
        let completed_at = started_at + chrono::Duration::seconds(deadline_seconds as i64);
        Self {
            agent,
            task_name: task_name.into(),
            status: TaskResultStatus::Timeout,
            started_at,
            completed_at,
            summary: format!("timed out after {deadline_seconds}s"),
            error_message: Some(format!("deadline of {deadline_seconds}s exceeded")),
            tokens_used: 0,
        }
    }

    pub fn skipped_budget(
        agent: AgentId,
        task_name: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            agent,
            task_name: task_name.into(),
            status: TaskResultStatus::SkippedBudget,
            started_at: at,
            completed_at: at,
            summary: "deferred: cycle token budget exhausted".to_string(),
            error_message: None,
            tokens_used: 0,
        }
    }

    pub fn duration_seconds(&self) -> f64 {
        (self.completed_at - self.started_at).num_milliseconds().max(0) as f64 / 1000.0
    }
}
