//! Cycle runner: the single 5-minute clock driving all background work.
//!
//! One cycle loads the next cycle number, opens a cycle row, runs each due
//! handler sequentially under its timeout and the cycle's token cap, then
//! finalises the row. Handlers never abort the cycle: failures, panics,
//! and timeouts all collapse into `TaskResult` rows, and critical handler
//! failures produce ticket notifications.

use std::sync::Arc;

use chrono::Utc;

use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::models::{
    AgentId, CycleConfig, HeartbeatCycle, NewNotification, NotificationKind, TaskResult,
    TaskResultStatus,
};
use crate::domain::ports::GraphStore;
use crate::services::cancel::CancelToken;
use crate::services::registry::{HandlerContext, HeartbeatTask, TaskRegistry};

/// Outcome of one cycle, for CLI output and exit-code mapping.
#[derive(Debug, Clone)]
pub struct CycleSummary {
    pub cycle: HeartbeatCycle,
    pub results: Vec<TaskResult>,
}

impl CycleSummary {
    /// True if any handler errored or timed out.
    pub fn had_failures(&self) -> bool {
        self.results.iter().any(|r| r.status.is_failure())
    }
}

/// Drives cycles against one registry and one graph handle.
pub struct CycleRunner {
    graph: Arc<dyn GraphStore>,
    registry: Arc<TaskRegistry>,
    config: CycleConfig,
    shutdown: CancelToken,
}

impl CycleRunner {
    pub fn new(
        graph: Arc<dyn GraphStore>,
        registry: Arc<TaskRegistry>,
        config: CycleConfig,
        shutdown: CancelToken,
    ) -> Self {
        Self {
            graph,
            registry,
            config,
            shutdown,
        }
    }

    /// Run exactly one cycle. A failed write of the opening cycle row
    /// aborts before any handler runs.
    pub async fn run_cycle(&self, agent: Option<AgentId>) -> CoreResult<CycleSummary> {
        let cycle_number = self.graph.next_cycle_number().await?;
        let mut cycle = HeartbeatCycle::open(cycle_number, Utc::now());
        self.graph.record_cycle(&cycle).await?;

        let due = self
            .registry
            .due_tasks(cycle_number, self.config.interval_minutes, agent)
            .await;
        tracing::info!(cycle_number, due = due.len(), "cycle started");

        let mut results = Vec::with_capacity(due.len());
        for task in due {
            if self.shutdown.is_cancelled() {
                tracing::warn!(cycle_number, task = %task.name, "shutdown during cycle; remaining handlers skipped");
                break;
            }

            let result = if cycle.total_tokens >= self.config.token_cap {
                TaskResult::skipped_budget(task.agent, &task.name, Utc::now())
            } else {
                self.run_handler(&task).await
            };

            cycle.absorb(&result);
            self.persist_result(cycle_number, &result).await;

            if result.status.is_failure() && task.critical {
                self.open_ticket(&task, &result).await;
            }

            results.push(result);
        }

        cycle.finalise(Utc::now());
        if let Err(err) = self.graph.finalize_cycle(&cycle).await {
            tracing::error!(cycle_number, error = %err, "failed to finalise cycle row");
        }
        tracing::info!(
            cycle_number,
            run = cycle.tasks_run,
            failed = cycle.tasks_failed,
            tokens = cycle.total_tokens,
            "cycle complete"
        );

        Ok(CycleSummary { cycle, results })
    }

    /// Force-run a single registered task outside its cadence.
    pub async fn run_task_by_name(&self, name: &str) -> CoreResult<TaskResult> {
        let task = self
            .registry
            .get(name)
            .await
            .ok_or_else(|| CoreError::UnknownTask(name.to_string()))?;
        Ok(self.run_handler(&task).await)
    }

    async fn run_handler(&self, task: &HeartbeatTask) -> TaskResult {
        let started = Utc::now();
        let token = self.shutdown.child();
        let ctx = HandlerContext {
            graph: self.graph.clone(),
            cancel: token.clone(),
            registry: self.registry.clone(),
        };

        let deadline = std::time::Duration::from_secs(task.timeout_seconds);
        let handler = task.handler.clone();
        // Spawned so a panicking handler surfaces as a join error instead
        // of tearing down the cycle.
        let join = tokio::spawn(async move { handler.run(ctx).await });

        match tokio::time::timeout(deadline, join).await {
            Ok(Ok(Ok(report))) => TaskResult::success(
                task.agent,
                &task.name,
                started,
                Utc::now(),
                report.summary,
                report.tokens_used,
            ),
            Ok(Ok(Err(err))) => {
                tracing::warn!(task = %task.name, error = %err, "handler failed");
                TaskResult::error(task.agent, &task.name, started, Utc::now(), err.to_string())
            }
            Ok(Err(join_err)) => {
                tracing::error!(task = %task.name, error = %join_err, "handler panicked");
                TaskResult::error(
                    task.agent,
                    &task.name,
                    started,
                    Utc::now(),
                    "handler panicked",
                )
            }
            Err(_) => {
                token.cancel();
                tracing::warn!(task = %task.name, timeout_secs = task.timeout_seconds, "handler hit hard deadline");
                TaskResult::timeout(task.agent, &task.name, started, task.timeout_seconds)
            }
        }
    }

    /// Persist a result; one retry, then local log only.
    async fn persist_result(&self, cycle_number: u64, result: &TaskResult) {
        if self.graph.record_result(cycle_number, result).await.is_ok() {
            return;
        }
        if let Err(err) = self.graph.record_result(cycle_number, result).await {
            tracing::error!(
                cycle_number,
                task = %result.task_name,
                status = result.status.as_str(),
                error = %err,
                "dropping task result after retry"
            );
        }
    }

    async fn open_ticket(&self, task: &HeartbeatTask, result: &TaskResult) {
        let assignee = task.ticket_route.assignee();
        let summary = format!(
            "critical task '{}' ended {}: {}",
            task.name,
            result.status.as_str(),
            result
                .error_message
                .as_deref()
                .unwrap_or("no detail recorded"),
        );
        if let Err(err) = self
            .graph
            .publish_notification(NewNotification::new(
                assignee,
                NotificationKind::Ticket,
                summary,
            ))
            .await
        {
            tracing::error!(task = %task.name, error = %err, "failed to open ticket");
        }
    }
}

/// Map a cycle summary to the process exit code.
pub fn exit_code_for(summary: &CycleSummary) -> i32 {
    if summary.had_failures() {
        2
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::MemoryGraphStore;
    use crate::domain::errors::CoreError;
    use crate::services::registry::{CycleHandler, HandlerReport, TicketRoute};
    use async_trait::async_trait;

    struct FixedHandler {
        tokens: u32,
        delay_ms: u64,
        fail: bool,
    }

    #[async_trait]
    impl CycleHandler for FixedHandler {
        async fn run(&self, _ctx: HandlerContext) -> CoreResult<HandlerReport> {
            if self.delay_ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
            }
            if self.fail {
                return Err(CoreError::InvalidInput("boom".to_string()));
            }
            Ok(HandlerReport::new("done", self.tokens))
        }
    }

    struct PanicHandler;

    #[async_trait]
    impl CycleHandler for PanicHandler {
        async fn run(&self, _ctx: HandlerContext) -> CoreResult<HandlerReport> {
            panic!("handler exploded");
        }
    }

    fn ok_handler(tokens: u32) -> Arc<dyn CycleHandler> {
        Arc::new(FixedHandler {
            tokens,
            delay_ms: 0,
            fail: false,
        })
    }

    async fn runner_with(
        tasks: Vec<HeartbeatTask>,
        config: CycleConfig,
    ) -> (Arc<MemoryGraphStore>, CycleRunner) {
        let graph = Arc::new(MemoryGraphStore::new());
        graph.ensure_schema().await.unwrap();
        let registry = Arc::new(TaskRegistry::new());
        for task in tasks {
            registry.register(task).await.unwrap();
        }
        let runner = CycleRunner::new(
            graph.clone(),
            registry,
            config,
            CancelToken::new(),
        );
        (graph, runner)
    }

    #[tokio::test]
    async fn test_empty_registry_still_writes_cycle_row() {
        let (graph, runner) = runner_with(vec![], CycleConfig::default()).await;
        let summary = runner.run_cycle(None).await.unwrap();

        assert_eq!(summary.cycle.tasks_run, 0);
        let row = graph.cycle(summary.cycle.cycle_number).await.unwrap();
        assert_eq!(row.tasks_run, 0);
        assert!(row.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_cycle_numbers_increase_across_runs() {
        let (_, runner) = runner_with(vec![], CycleConfig::default()).await;
        let first = runner.run_cycle(None).await.unwrap();
        let second = runner.run_cycle(None).await.unwrap();
        assert_eq!(second.cycle.cycle_number, first.cycle.cycle_number + 1);
    }

    #[tokio::test]
    async fn test_results_recorded_per_handler() {
        let tasks = vec![
            HeartbeatTask::new("a", AgentId::Ops, 5, ok_handler(10)),
            HeartbeatTask::new("b", AgentId::Main, 5, ok_handler(20)),
        ];
        let (graph, runner) = runner_with(tasks, CycleConfig::default()).await;
        let summary = runner.run_cycle(None).await.unwrap();

        assert_eq!(summary.cycle.tasks_run, 2);
        assert_eq!(summary.cycle.tasks_succeeded, 2);
        assert_eq!(summary.cycle.total_tokens, 30);
        assert_eq!(graph.results_for(summary.cycle.cycle_number).await.len(), 2);
    }

    #[tokio::test]
    async fn test_token_cap_defers_trailing_tasks() {
        let config = CycleConfig {
            token_cap: 100,
            ..CycleConfig::default()
        };
        let tasks = vec![
            HeartbeatTask::new("big", AgentId::Analyst, 5, ok_handler(150)),
            HeartbeatTask::new("late", AgentId::Ops, 5, ok_handler(10)),
        ];
        let (_, runner) = runner_with(tasks, config).await;
        let summary = runner.run_cycle(None).await.unwrap();

        // "analyst" sorts before "ops": big runs first and exhausts the cap.
        assert_eq!(summary.results[0].status, TaskResultStatus::Success);
        assert_eq!(summary.results[1].status, TaskResultStatus::SkippedBudget);
        assert_eq!(summary.results[1].task_name, "late");
    }

    #[tokio::test]
    async fn test_handler_error_becomes_result_and_cycle_continues() {
        let tasks = vec![
            HeartbeatTask::new(
                "bad",
                AgentId::Analyst,
                5,
                Arc::new(FixedHandler {
                    tokens: 0,
                    delay_ms: 0,
                    fail: true,
                }),
            ),
            HeartbeatTask::new("good", AgentId::Ops, 5, ok_handler(5)),
        ];
        let (_, runner) = runner_with(tasks, CycleConfig::default()).await;
        let summary = runner.run_cycle(None).await.unwrap();

        assert_eq!(summary.cycle.tasks_failed, 1);
        assert_eq!(summary.cycle.tasks_succeeded, 1);
        assert!(summary.had_failures());
        assert_eq!(exit_code_for(&summary), 2);
    }

    #[tokio::test]
    async fn test_panic_becomes_error_result() {
        let tasks = vec![HeartbeatTask::new("explodes", AgentId::Ops, 5, Arc::new(PanicHandler))];
        let (_, runner) = runner_with(tasks, CycleConfig::default()).await;
        let summary = runner.run_cycle(None).await.unwrap();

        assert_eq!(summary.results[0].status, TaskResultStatus::Error);
        assert_eq!(
            summary.results[0].error_message.as_deref(),
            Some("handler panicked")
        );
    }

    #[tokio::test]
    async fn test_timeout_is_recorded_at_deadline() {
        let tasks = vec![HeartbeatTask::new(
            "slow",
            AgentId::Ops,
            5,
            Arc::new(FixedHandler {
                tokens: 0,
                delay_ms: 5_000,
                fail: false,
            }),
        )
        .with_timeout(1)];
        let (_, runner) = runner_with(tasks, CycleConfig::default()).await;
        let summary = runner.run_cycle(None).await.unwrap();

        assert_eq!(summary.results[0].status, TaskResultStatus::Timeout);
        assert!((summary.results[0].duration_seconds() - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_critical_failure_opens_routed_ticket() {
        let tasks = vec![HeartbeatTask::new(
            "sentinel",
            AgentId::Ops,
            5,
            Arc::new(FixedHandler {
                tokens: 0,
                delay_ms: 0,
                fail: true,
            }),
        )
        .critical(TicketRoute::Code)];
        let (graph, runner) = runner_with(tasks, CycleConfig::default()).await;
        runner.run_cycle(None).await.unwrap();

        let tickets = graph.notifications_for(AgentId::Developer).await;
        assert_eq!(tickets.len(), 1);
        assert_eq!(tickets[0].kind, NotificationKind::Ticket);
        assert!(tickets[0].summary.contains("sentinel"));
    }

    #[tokio::test]
    async fn test_agent_filter_runs_only_owned_tasks() {
        let tasks = vec![
            HeartbeatTask::new("ops_task", AgentId::Ops, 5, ok_handler(1)),
            HeartbeatTask::new("main_task", AgentId::Main, 5, ok_handler(1)),
        ];
        let (_, runner) = runner_with(tasks, CycleConfig::default()).await;
        let summary = runner.run_cycle(Some(AgentId::Ops)).await.unwrap();

        assert_eq!(summary.results.len(), 1);
        assert_eq!(summary.results[0].task_name, "ops_task");
    }

    #[tokio::test]
    async fn test_aborts_when_cycle_row_write_fails() {
        let graph = Arc::new(MemoryGraphStore::new());
        graph.ensure_schema().await.unwrap();
        let registry = Arc::new(TaskRegistry::new());
        registry
            .register(HeartbeatTask::new("job", AgentId::Ops, 5, ok_handler(1)))
            .await
            .unwrap();
        let runner = CycleRunner::new(
            graph.clone(),
            registry,
            CycleConfig::default(),
            CancelToken::new(),
        );

        graph.set_failing(true);
        assert!(runner.run_cycle(None).await.is_err());
    }
}
