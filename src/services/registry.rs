//! Task registry: the declarative table of background work.
//!
//! Each entry names an owner agent, a cadence from the fixed frequency set,
//! a token budget, and a handler. Handlers are trait objects registered by
//! name; new background work is added by implementing [`CycleHandler`],
//! never by capturing closures at runtime.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::models::AgentId;
use crate::domain::ports::GraphStore;
use crate::services::cancel::CancelToken;

/// The only cadences the cycle predicate understands, in minutes.
pub const ALLOWED_FREQUENCIES: [u32; 7] = [5, 15, 30, 60, 360, 1440, 10_080];

/// What a handler hands back on success.
#[derive(Debug, Clone)]
pub struct HandlerReport {
    pub summary: String,
    pub tokens_used: u32,
}

impl HandlerReport {
    pub fn new(summary: impl Into<String>, tokens_used: u32) -> Self {
        Self {
            summary: summary.into(),
            tokens_used,
        }
    }
}

/// Context threaded into each handler invocation. The runner owns the
/// graph handle's lifecycle and hands each handler a child token.
#[derive(Clone)]
pub struct HandlerContext {
    pub graph: Arc<dyn GraphStore>,
    pub cancel: CancelToken,
    pub registry: Arc<TaskRegistry>,
}

/// A background task body. Implementations suspend at graph I/O and
/// outbound HTTP, and should check `ctx.cancel` at those points.
#[async_trait]
pub trait CycleHandler: Send + Sync {
    async fn run(&self, ctx: HandlerContext) -> CoreResult<HandlerReport>;
}

/// Where the failure ticket of a critical handler routes. Resolved at
/// registration time, not at ticket creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketRoute {
    Infrastructure,
    Code,
    Analysis,
    SelfAwareness,
}

impl TicketRoute {
    pub fn assignee(&self) -> AgentId {
        match self {
            Self::Infrastructure => AgentId::Ops,
            Self::Code => AgentId::Developer,
            Self::Analysis => AgentId::Analyst,
            Self::SelfAwareness => AgentId::Main,
        }
    }
}

/// One registry entry.
#[derive(Clone)]
pub struct HeartbeatTask {
    pub name: String,
    pub agent: AgentId,
    pub frequency_minutes: u32,
    pub max_tokens: u32,
    pub timeout_seconds: u64,
    pub enabled: bool,
    /// Failure or timeout produces a ticket notification.
    pub critical: bool,
    /// Never runs concurrently with other exclusive handlers.
    pub exclusive: bool,
    pub ticket_route: TicketRoute,
    pub handler: Arc<dyn CycleHandler>,
}

impl HeartbeatTask {
    pub fn new(
        name: impl Into<String>,
        agent: AgentId,
        frequency_minutes: u32,
        handler: Arc<dyn CycleHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            agent,
            frequency_minutes,
            max_tokens: 500,
            timeout_seconds: 60,
            enabled: true,
            critical: false,
            exclusive: false,
            ticket_route: TicketRoute::Infrastructure,
            handler,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_timeout(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    pub fn critical(mut self, route: TicketRoute) -> Self {
        self.critical = true;
        self.ticket_route = route;
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Due predicate: the task fires in cycle `c` iff its frequency divides
    /// the cycle's wall-clock offset. Relies on the daemon aligning cycle
    /// starts to 5-minute boundaries.
    pub fn is_due(&self, cycle_number: u64, interval_minutes: u32) -> bool {
        let elapsed = cycle_number.saturating_mul(u64::from(interval_minutes));
        elapsed % u64::from(self.frequency_minutes) == 0
    }

    pub fn descriptor(&self) -> TaskDescriptor {
        TaskDescriptor {
            name: self.name.clone(),
            agent: self.agent,
            frequency_minutes: self.frequency_minutes,
            max_tokens: self.max_tokens,
            timeout_seconds: self.timeout_seconds,
            enabled: self.enabled,
            critical: self.critical,
            exclusive: self.exclusive,
            ticket_route: self.ticket_route,
        }
    }
}

/// Serialisable view of a registry entry (for `--list-tasks`).
#[derive(Debug, Clone, Serialize)]
pub struct TaskDescriptor {
    pub name: String,
    pub agent: AgentId,
    pub frequency_minutes: u32,
    pub max_tokens: u32,
    pub timeout_seconds: u64,
    pub enabled: bool,
    pub critical: bool,
    pub exclusive: bool,
    pub ticket_route: TicketRoute,
}

/// Optional filters for [`TaskRegistry::list`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RegistryFilter {
    pub agent: Option<AgentId>,
    pub enabled: Option<bool>,
}

impl RegistryFilter {
    fn matches(&self, task: &HeartbeatTask) -> bool {
        if let Some(agent) = self.agent {
            if task.agent != agent {
                return false;
            }
        }
        if let Some(enabled) = self.enabled {
            if task.enabled != enabled {
                return false;
            }
        }
        true
    }
}

/// Registry of background tasks. Read-mostly; the writer lock is held only
/// across a single register/toggle, so at worst it delays one cycle start.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: RwLock<Vec<HeartbeatTask>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or update an entry. Re-registering an existing name replaces the
    /// entry in place, keeping its registration position. Idempotent.
    pub async fn register(&self, task: HeartbeatTask) -> CoreResult<()> {
        if !ALLOWED_FREQUENCIES.contains(&task.frequency_minutes) {
            return Err(CoreError::InvalidFrequency(task.frequency_minutes));
        }

        let mut tasks = self.tasks.write().await;
        match tasks.iter_mut().find(|t| t.name == task.name) {
            Some(existing) => *existing = task,
            None => tasks.push(task),
        }
        Ok(())
    }

    /// Enumerate entries, optionally filtered, in registration order.
    pub async fn list(&self, filter: RegistryFilter) -> Vec<TaskDescriptor> {
        self.tasks
            .read()
            .await
            .iter()
            .filter(|t| filter.matches(t))
            .map(HeartbeatTask::descriptor)
            .collect()
    }

    pub async fn enable(&self, name: &str) -> CoreResult<()> {
        self.set_enabled(name, true).await
    }

    pub async fn disable(&self, name: &str) -> CoreResult<()> {
        self.set_enabled(name, false).await
    }

    async fn set_enabled(&self, name: &str, enabled: bool) -> CoreResult<()> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .iter_mut()
            .find(|t| t.name == name)
            .ok_or_else(|| CoreError::UnknownTask(name.to_string()))?;
        task.enabled = enabled;
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Option<HeartbeatTask> {
        self.tasks.read().await.iter().find(|t| t.name == name).cloned()
    }

    /// Enabled tasks due in `cycle_number`, ordered by owner agent then by
    /// registration order. The ordering is deterministic so token-budget
    /// deferral is reproducible.
    pub async fn due_tasks(
        &self,
        cycle_number: u64,
        interval_minutes: u32,
        agent: Option<AgentId>,
    ) -> Vec<HeartbeatTask> {
        let tasks = self.tasks.read().await;
        let mut due: Vec<(usize, HeartbeatTask)> = tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.enabled && t.is_due(cycle_number, interval_minutes))
            .filter(|(_, t)| agent.is_none_or(|a| t.agent == a))
            .map(|(i, t)| (i, t.clone()))
            .collect();

        due.sort_by_key(|(i, t)| (t.agent.as_str(), *i));
        due.into_iter().map(|(_, t)| t).collect()
    }

    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopHandler;

    #[async_trait]
    impl CycleHandler for NoopHandler {
        async fn run(&self, _ctx: HandlerContext) -> CoreResult<HandlerReport> {
            Ok(HandlerReport::new("noop", 0))
        }
    }

    fn noop() -> Arc<dyn CycleHandler> {
        Arc::new(NoopHandler)
    }

    #[tokio::test]
    async fn test_register_rejects_bad_frequency() {
        let registry = TaskRegistry::new();
        let result = registry
            .register(HeartbeatTask::new("odd", AgentId::Ops, 7, noop()))
            .await;
        assert!(matches!(result, Err(CoreError::InvalidFrequency(7))));
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let registry = TaskRegistry::new();
        let first = HeartbeatTask::new("job", AgentId::Ops, 5, noop()).with_max_tokens(100);
        let second = HeartbeatTask::new("job", AgentId::Ops, 5, noop())
            .with_max_tokens(900)
            .with_timeout(30);

        registry.register(first).await.unwrap();
        registry.register(second).await.unwrap();

        let entries = registry.list(RegistryFilter::default()).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].max_tokens, 900);
        assert_eq!(entries[0].timeout_seconds, 30);
    }

    #[tokio::test]
    async fn test_enable_disable() {
        let registry = TaskRegistry::new();
        registry
            .register(HeartbeatTask::new("job", AgentId::Ops, 5, noop()))
            .await
            .unwrap();

        registry.disable("job").await.unwrap();
        let entries = registry.list(RegistryFilter { enabled: Some(false), ..Default::default() }).await;
        assert_eq!(entries.len(), 1);

        registry.enable("job").await.unwrap();
        let entries = registry.list(RegistryFilter { enabled: Some(true), ..Default::default() }).await;
        assert_eq!(entries.len(), 1);

        assert!(matches!(
            registry.disable("missing").await,
            Err(CoreError::UnknownTask(_))
        ));
    }

    #[tokio::test]
    async fn test_due_calendar() {
        let registry = TaskRegistry::new();
        for (name, freq) in [
            ("every5", 5),
            ("every15", 15),
            ("every30", 30),
            ("hourly", 60),
            ("sixhourly", 360),
            ("daily", 1440),
            ("weekly", 10_080),
        ] {
            registry
                .register(HeartbeatTask::new(name, AgentId::Ops, freq, noop()))
                .await
                .unwrap();
        }

        // Cycle 288 = 24h: everything up to daily fires; weekly does not.
        let due = registry.due_tasks(288, 5, None).await;
        let names: Vec<&str> = due.iter().map(|t| t.name.as_str()).collect();
        assert!(names.contains(&"every5"));
        assert!(names.contains(&"every15"));
        assert!(names.contains(&"every30"));
        assert!(names.contains(&"hourly"));
        assert!(names.contains(&"sixhourly"));
        assert!(names.contains(&"daily"));
        assert!(!names.contains(&"weekly"));

        // Cycle 2016 = 7d: the full alignment set.
        let due = registry.due_tasks(2016, 5, None).await;
        assert_eq!(due.len(), 7);
    }

    #[tokio::test]
    async fn test_due_order_by_agent_then_registration() {
        let registry = TaskRegistry::new();
        registry
            .register(HeartbeatTask::new("z_ops_first", AgentId::Ops, 5, noop()))
            .await
            .unwrap();
        registry
            .register(HeartbeatTask::new("a_ops_second", AgentId::Ops, 5, noop()))
            .await
            .unwrap();
        registry
            .register(HeartbeatTask::new("analyst_job", AgentId::Analyst, 5, noop()))
            .await
            .unwrap();

        let due = registry.due_tasks(1, 5, None).await;
        let names: Vec<&str> = due.iter().map(|t| t.name.as_str()).collect();
        // "analyst" < "ops" lexically; within ops, registration order holds.
        assert_eq!(names, vec!["analyst_job", "z_ops_first", "a_ops_second"]);
    }

    #[tokio::test]
    async fn test_due_filter_by_agent() {
        let registry = TaskRegistry::new();
        registry
            .register(HeartbeatTask::new("ops_job", AgentId::Ops, 5, noop()))
            .await
            .unwrap();
        registry
            .register(HeartbeatTask::new("main_job", AgentId::Main, 5, noop()))
            .await
            .unwrap();

        let due = registry.due_tasks(1, 5, Some(AgentId::Main)).await;
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].name, "main_job");
    }
}
