//! Heartbeat master CLI.
//!
//! Exit codes: 0 success, 1 fatal init error, 2 partial-cycle failure.

use clap::Parser;
use serde_json::json;

use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::models::AgentId;
use crate::services::cycle_runner::CycleSummary;
use crate::services::registry::TaskDescriptor;

/// Unified heartbeat scheduler and agent coordination plane.
#[derive(Debug, Parser)]
#[command(name = "cadence", version, about)]
pub struct Cli {
    /// Register all built-in tasks and ensure graph schema/indexes exist.
    #[arg(long)]
    pub setup: bool,

    /// Run exactly one cycle, then exit.
    #[arg(long)]
    pub cycle: bool,

    /// Loop forever aligned to 5-minute wall-clock boundaries.
    #[arg(long)]
    pub daemon: bool,

    /// Print the task registry as JSON.
    #[arg(long = "list-tasks")]
    pub list_tasks: bool,

    /// Restrict a cycle to tasks owned by one agent.
    #[arg(long, value_name = "id")]
    pub agent: Option<String>,

    /// Emit machine-readable output.
    #[arg(long)]
    pub json: bool,

    /// Force-run the weekly reflection handler regardless of cadence.
    #[arg(long = "trigger-reflection")]
    pub trigger_reflection: bool,
}

impl Cli {
    /// Parse the optional `--agent` filter against the closed agent set.
    pub fn agent_filter(&self) -> CoreResult<Option<AgentId>> {
        match &self.agent {
            None => Ok(None),
            Some(raw) => AgentId::from_str(raw)
                .map(Some)
                .ok_or_else(|| CoreError::UnknownAgent(raw.clone())),
        }
    }
}

/// Render one cycle's outcome.
pub fn print_cycle_summary(summary: &CycleSummary, json: bool) {
    if json {
        let value = json!({
            "cycle_number": summary.cycle.cycle_number,
            "started_at": summary.cycle.started_at,
            "completed_at": summary.cycle.completed_at,
            "tasks_run": summary.cycle.tasks_run,
            "tasks_succeeded": summary.cycle.tasks_succeeded,
            "tasks_failed": summary.cycle.tasks_failed,
            "total_tokens": summary.cycle.total_tokens,
            "duration_seconds": summary.cycle.duration_seconds,
            "results": summary.results.iter().map(|r| json!({
                "task_name": r.task_name,
                "agent": r.agent,
                "status": r.status.as_str(),
                "summary": r.summary,
                "error_message": r.error_message,
                "tokens_used": r.tokens_used,
            })).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&value).unwrap_or_default());
        return;
    }

    println!(
        "cycle {}: {} run, {} ok, {} failed, {} tokens, {:.1}s",
        summary.cycle.cycle_number,
        summary.cycle.tasks_run,
        summary.cycle.tasks_succeeded,
        summary.cycle.tasks_failed,
        summary.cycle.total_tokens,
        summary.cycle.duration_seconds,
    );
    for result in &summary.results {
        println!(
            "  {:<24} {:<8} {}",
            result.task_name,
            result.status.as_str(),
            result.summary
        );
    }
}

/// Render the registry listing. Always JSON, per the CLI contract.
pub fn print_task_list(tasks: &[TaskDescriptor]) {
    println!(
        "{}",
        serde_json::to_string_pretty(tasks).unwrap_or_else(|_| "[]".to_string())
    );
}
