//! Built-in background tasks and their registration.
//!
//! `--setup` registers this fixed calendar. Only the curation family is
//! exclusive; ticket routes are pinned here, at registration time.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};

use crate::domain::errors::CoreResult;
use crate::domain::models::{AgentId, TaskPriority};
use crate::infrastructure::signing::KeyDerivation;
use crate::services::curation::{
    CurationDeepHandler, CurationHourlyHandler, CurationRapidHandler, CurationStandardHandler,
};
use crate::services::delegation::{DelegationService, MessageDispatcher};
use crate::services::liveness::{FailoverManager, HealthCheckHandler};
use crate::services::registry::{
    CycleHandler, HandlerContext, HandlerReport, HeartbeatTask, TaskRegistry, TicketRoute,
};

/// Weekly rotation of every agent's signing key; retired keys past the
/// audit window are purged in the same pass.
pub struct KeyRotationHandler {
    derivation: KeyDerivation,
}

impl KeyRotationHandler {
    pub fn new(derivation: KeyDerivation) -> Self {
        Self { derivation }
    }
}

#[async_trait]
impl CycleHandler for KeyRotationHandler {
    async fn run(&self, ctx: HandlerContext) -> CoreResult<HandlerReport> {
        for agent in AgentId::ALL {
            let material = self.derivation.key_for(agent);
            ctx.graph.upsert_agent_key(agent, &material).await?;
        }
        let purged = ctx.graph.purge_retired_keys(Utc::now()).await?;
        Ok(HandlerReport::new(
            format!("rotated 6 agent keys, purged {purged} retired"),
            0,
        ))
    }
}

/// Daily purge of rate-limit counters older than seven days.
pub struct RateLimitPurgeHandler;

#[async_trait]
impl CycleHandler for RateLimitPurgeHandler {
    async fn run(&self, ctx: HandlerContext) -> CoreResult<HandlerReport> {
        let purged = ctx
            .graph
            .purge_rate_limits(Utc::now() - Duration::days(7))
            .await?;
        Ok(HandlerReport::new(format!("purged {purged} rate counters"), 0))
    }
}

/// Weekly reflection: delegates a synthesis task to the orchestrator.
/// The content of the reflection is produced downstream; scheduling and
/// delivery are what this plane owns.
pub struct WeeklyReflectionHandler {
    delegation: Arc<DelegationService>,
}

impl WeeklyReflectionHandler {
    pub fn new(delegation: Arc<DelegationService>) -> Self {
        Self { delegation }
    }
}

#[async_trait]
impl CycleHandler for WeeklyReflectionHandler {
    async fn run(&self, _ctx: HandlerContext) -> CoreResult<HandlerReport> {
        let task_id = self
            .delegation
            .delegate(
                "synthesis",
                "Weekly reflection: review the week's cycles, failures, failovers, and curation activity",
                TaskPriority::Normal,
            )
            .await?;
        Ok(HandlerReport::new(format!("reflection task {task_id} delegated"), 0))
    }
}

/// Dependencies the built-in calendar needs beyond the graph handle.
pub struct BuiltinDeps {
    pub failover: Arc<FailoverManager>,
    pub dispatcher: Arc<dyn MessageDispatcher>,
    pub delegation: Arc<DelegationService>,
    pub key_derivation: KeyDerivation,
}

/// Register every built-in task. Idempotent, like the registry itself.
pub async fn register_builtin_tasks(registry: &TaskRegistry, deps: &BuiltinDeps) -> CoreResult<()> {
    registry
        .register(
            HeartbeatTask::new(
                "health_check",
                AgentId::Ops,
                5,
                Arc::new(HealthCheckHandler::new(
                    deps.failover.clone(),
                    deps.dispatcher.clone(),
                )),
            )
            .with_timeout(30)
            .critical(TicketRoute::Infrastructure),
        )
        .await?;

    registry
        .register(
            HeartbeatTask::new("curation_rapid", AgentId::Main, 5, Arc::new(CurationRapidHandler))
                .exclusive()
                .critical(TicketRoute::SelfAwareness),
        )
        .await?;
    registry
        .register(
            HeartbeatTask::new(
                "curation_standard",
                AgentId::Main,
                15,
                Arc::new(CurationStandardHandler),
            )
            .exclusive()
            .critical(TicketRoute::SelfAwareness),
        )
        .await?;
    registry
        .register(
            HeartbeatTask::new(
                "curation_hourly",
                AgentId::Main,
                60,
                Arc::new(CurationHourlyHandler),
            )
            .exclusive(),
        )
        .await?;
    registry
        .register(
            HeartbeatTask::new(
                "curation_deep",
                AgentId::Main,
                360,
                Arc::new(CurationDeepHandler),
            )
            .with_timeout(300)
            .exclusive()
            .critical(TicketRoute::SelfAwareness),
        )
        .await?;

    registry
        .register(HeartbeatTask::new(
            "rate_limit_purge",
            AgentId::Ops,
            1440,
            Arc::new(RateLimitPurgeHandler),
        ))
        .await?;
    registry
        .register(HeartbeatTask::new(
            "agent_key_rotation",
            AgentId::Ops,
            10_080,
            Arc::new(KeyRotationHandler::new(deps.key_derivation.clone())),
        ))
        .await?;
    registry
        .register(
            HeartbeatTask::new(
                "weekly_reflection",
                AgentId::Main,
                10_080,
                Arc::new(WeeklyReflectionHandler::new(deps.delegation.clone())),
            )
            .with_max_tokens(4_000)
            .with_timeout(120),
        )
        .await?;

    Ok(())
}
