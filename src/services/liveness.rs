//! Liveness and failover.
//!
//! Two independent heartbeats feed one health predicate: the sidecar's
//! infrastructure heartbeat proves the process is up, the functional
//! heartbeat proves work is flowing. The `health_check` handler evaluates
//! every agent each cycle; three consecutive bad observations of the
//! orchestrator promote the standby, three healthy ones fail back.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::errors::CoreResult;
use crate::domain::models::{
    Agent, AgentId, AgentStatus, FailoverEvent, NewNotification, NotificationKind,
};
use crate::domain::ports::GraphStore;
use crate::services::cancel::CancelToken;
use crate::services::delegation::{DelegationMessage, MessageDispatcher};
use crate::services::registry::{CycleHandler, HandlerContext, HandlerReport};

/// Gateway considered down past this infra-heartbeat age.
pub const INFRA_DEAD_AFTER_SECS: i64 = 120;

/// Functional heartbeat age past which a busy agent counts as stuck.
pub const FUNCTIONAL_STUCK_AFTER_SECS: i64 = 90;

/// Consecutive bad health checks of the orchestrator that trigger failover.
pub const FAILOVER_AFTER_CONSECUTIVE: u32 = 3;

/// Consecutive healthy checks that trigger failback.
pub const FAILBACK_AFTER_CONSECUTIVE: u32 = 3;

/// Sidecar write cadence.
pub const SIDECAR_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

/// Health of one agent, worst-of-two-heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Stuck,
    Dead,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Stuck => "stuck",
            Self::Dead => "dead",
        }
    }

    pub fn is_unhealthy(&self) -> bool {
        !matches!(self, Self::Healthy)
    }
}

/// The two-tier health predicate.
pub fn evaluate_health(agent: &Agent, now: DateTime<Utc>) -> HealthStatus {
    if agent.infra_age(now).num_seconds() > INFRA_DEAD_AFTER_SECS {
        return HealthStatus::Dead;
    }
    if agent.functional_age(now).num_seconds() > FUNCTIONAL_STUCK_AFTER_SECS
        && agent.current_task.is_some()
    {
        return HealthStatus::Stuck;
    }
    HealthStatus::Healthy
}

/// A delivery parked while the standby held routing duty.
#[derive(Debug, Clone)]
pub struct QueuedDelivery {
    pub target: AgentId,
    pub message: DelegationMessage,
}

/// Outcome of one orchestrator health observation.
#[derive(Debug)]
pub enum FailoverDecision {
    None,
    Opened(FailoverEvent),
    Resolved {
        event_id: uuid::Uuid,
        queued: Vec<QueuedDelivery>,
    },
}

#[derive(Default)]
struct Counters {
    consecutive_unhealthy: u32,
    consecutive_healthy: u32,
}

/// Tracks orchestrator health streaks and owns the delay queue.
pub struct FailoverManager {
    graph: Arc<dyn GraphStore>,
    counters: Mutex<Counters>,
    queue: Mutex<VecDeque<QueuedDelivery>>,
}

impl FailoverManager {
    pub fn new(graph: Arc<dyn GraphStore>) -> Self {
        Self {
            graph,
            counters: Mutex::new(Counters::default()),
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Where a message for `intended` should actually go right now.
    pub async fn routing_target(&self, intended: AgentId) -> CoreResult<AgentId> {
        if intended != AgentId::Main {
            return Ok(intended);
        }
        match self.graph.active_failover().await? {
            Some(_) => Ok(AgentId::Main.standby().unwrap_or(AgentId::Ops)),
            None => Ok(intended),
        }
    }

    pub async fn is_active(&self) -> CoreResult<bool> {
        Ok(self.graph.active_failover().await?.is_some())
    }

    pub async fn enqueue(&self, delivery: QueuedDelivery) {
        self.queue.lock().await.push_back(delivery);
    }

    pub async fn queued_len(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Count one message routed by the standby on the active event.
    pub async fn note_routed(&self) {
        if let Ok(Some(event)) = self.graph.active_failover().await {
            if let Err(err) = self.graph.increment_failover_routed(event.id).await {
                tracing::warn!(error = %err, "failed to count routed message");
            }
        }
    }

    /// Fold one health observation of the orchestrator into the streak
    /// counters. Opening is idempotent: observing more failures while an
    /// event is active is a no-op.
    pub async fn observe_orchestrator(
        &self,
        health: HealthStatus,
        now: DateTime<Utc>,
    ) -> CoreResult<FailoverDecision> {
        let mut counters = self.counters.lock().await;

        if health.is_unhealthy() {
            counters.consecutive_healthy = 0;
            counters.consecutive_unhealthy += 1;
            if counters.consecutive_unhealthy < FAILOVER_AFTER_CONSECUTIVE {
                return Ok(FailoverDecision::None);
            }
            if self.graph.active_failover().await?.is_some() {
                return Ok(FailoverDecision::None);
            }
            let reason = format!(
                "orchestrator {} for {} consecutive checks",
                health.as_str(),
                counters.consecutive_unhealthy
            );
            let event = self
                .graph
                .open_failover(FailoverEvent::open(AgentId::Ops, reason, now))
                .await?;
            return Ok(FailoverDecision::Opened(event));
        }

        counters.consecutive_unhealthy = 0;
        let Some(active) = self.graph.active_failover().await? else {
            counters.consecutive_healthy = 0;
            return Ok(FailoverDecision::None);
        };

        counters.consecutive_healthy += 1;
        if counters.consecutive_healthy < FAILBACK_AFTER_CONSECUTIVE {
            return Ok(FailoverDecision::None);
        }

        self.graph.resolve_failover(active.id, now).await?;
        counters.consecutive_healthy = 0;
        let queued: Vec<QueuedDelivery> = self.queue.lock().await.drain(..).collect();
        Ok(FailoverDecision::Resolved {
            event_id: active.id,
            queued,
        })
    }
}

/// The `health_check` registry handler (ops, every cycle).
pub struct HealthCheckHandler {
    failover: Arc<FailoverManager>,
    dispatcher: Arc<dyn MessageDispatcher>,
}

impl HealthCheckHandler {
    pub fn new(failover: Arc<FailoverManager>, dispatcher: Arc<dyn MessageDispatcher>) -> Self {
        Self {
            failover,
            dispatcher,
        }
    }
}

#[async_trait]
impl CycleHandler for HealthCheckHandler {
    async fn run(&self, ctx: HandlerContext) -> CoreResult<HandlerReport> {
        let now = Utc::now();
        let agents = ctx.graph.list_agents().await?;
        let mut unhealthy = 0_u32;
        let mut main_health = HealthStatus::Healthy;

        for agent in &agents {
            let health = evaluate_health(agent, now);
            if agent.id == AgentId::Main {
                main_health = health;
            }
            if health.is_unhealthy() {
                unhealthy += 1;
                tracing::warn!(agent = %agent.id, health = health.as_str(), "unhealthy agent");
            }
            let status = match health {
                HealthStatus::Healthy => AgentStatus::Active,
                HealthStatus::Stuck => AgentStatus::Degraded,
                HealthStatus::Dead => AgentStatus::Inactive,
            };
            if status != agent.status {
                ctx.graph.set_agent_status(agent.id, status).await?;
            }
        }

        match self.failover.observe_orchestrator(main_health, now).await? {
            FailoverDecision::None => {}
            FailoverDecision::Opened(event) => {
                tracing::error!(event_id = %event.id, reason = %event.reason, "failover opened");
                ctx.graph
                    .publish_notification(NewNotification::new(
                        AgentId::Ops,
                        NotificationKind::Critical,
                        format!("failover active: {}", event.reason),
                    ))
                    .await?;
            }
            FailoverDecision::Resolved { event_id, queued } => {
                tracing::info!(event_id = %event_id, replaying = queued.len(), "failover resolved");
                for delivery in queued {
                    if let Err(err) = self
                        .dispatcher
                        .dispatch(delivery.target, &delivery.message)
                        .await
                    {
                        tracing::warn!(
                            task_id = %delivery.message.task_id,
                            error = %err,
                            "queued delivery replay failed"
                        );
                    }
                }
            }
        }

        Ok(HandlerReport::new(
            format!("{} agents checked, {unhealthy} unhealthy", agents.len()),
            0,
        ))
    }
}

/// Out-of-band infra heartbeat writer: one batched update for all six
/// agents every 30 seconds.
pub struct InfraHeartbeatSidecar {
    graph: Arc<dyn GraphStore>,
    interval: std::time::Duration,
}

impl InfraHeartbeatSidecar {
    pub fn new(graph: Arc<dyn GraphStore>) -> Self {
        Self {
            graph,
            interval: SIDECAR_INTERVAL,
        }
    }

    pub fn with_interval(graph: Arc<dyn GraphStore>, interval: std::time::Duration) -> Self {
        Self { graph, interval }
    }

    pub async fn run(&self, cancel: CancelToken) {
        loop {
            if let Err(err) = self
                .graph
                .update_infra_heartbeats_at(&AgentId::ALL, Utc::now())
                .await
            {
                tracing::warn!(error = %err, "infra heartbeat write failed");
            }
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(self.interval) => {}
            }
        }
    }
}
