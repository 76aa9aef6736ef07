//! Delegation: turning intents into assigned, dispatched work.
//!
//! The orchestrator side of C4: rate-limit the caller, sanitise the
//! description, route by task type against the closed agent set, persist
//! the pending task, then hand the wire message to the dispatcher. While
//! a failover is active, traffic for the orchestrator is redirected to the
//! standby under its restricted policy.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::models::{AgentId, NewTask, RateLimitDecision, TaskPriority, TaskType};
use crate::domain::ports::GraphStore;
use crate::services::liveness::{FailoverManager, QueuedDelivery};
use crate::services::sanitizer::Sanitizer;

/// Orchestrator delegation budget.
pub const DELEGATE_LIMIT_PER_HOUR: u32 = 60;

/// Wire body of a delegation message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegationMessage {
    pub task_id: Uuid,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub description_sanitised: String,
    pub priority: TaskPriority,
    pub delegated_by: AgentId,
    pub created_at: DateTime<Utc>,
}

/// Transport seam for delegation delivery. The production implementation
/// signs and POSTs to the agent gateway; tests substitute a recorder.
#[async_trait]
pub trait MessageDispatcher: Send + Sync {
    async fn dispatch(&self, target: AgentId, message: &DelegationMessage) -> CoreResult<()>;
}

/// Orchestrator-side delegation service.
pub struct DelegationService {
    graph: Arc<dyn GraphStore>,
    sanitizer: Sanitizer,
    dispatcher: Arc<dyn MessageDispatcher>,
    failover: Arc<FailoverManager>,
}

impl DelegationService {
    pub fn new(
        graph: Arc<dyn GraphStore>,
        dispatcher: Arc<dyn MessageDispatcher>,
        failover: Arc<FailoverManager>,
    ) -> Self {
        Self {
            graph,
            sanitizer: Sanitizer::new(),
            dispatcher,
            failover,
        }
    }

    /// Delegate one intent. Returns the created task id.
    pub async fn delegate(
        &self,
        raw_type: &str,
        description: &str,
        priority: TaskPriority,
    ) -> CoreResult<Uuid> {
        match self
            .graph
            .check_rate_limit(AgentId::Main, "delegate", DELEGATE_LIMIT_PER_HOUR)
            .await?
        {
            RateLimitDecision::Allowed => {}
            RateLimitDecision::Denied(count) => {
                return Err(CoreError::RateLimited {
                    agent: AgentId::Main,
                    operation: "delegate".to_string(),
                    count,
                });
            }
        }

        let sanitised = self.sanitizer.sanitise(description);
        let task_type = TaskType::parse(raw_type);
        // The routing table is total over the closed enum, so the target is
        // a known agent by construction.
        let assigned = task_type.route();

        let task_id = self
            .graph
            .create_task(
                NewTask::new(task_type, sanitised.clone())
                    .with_priority(priority)
                    .with_delegator(AgentId::Main)
                    .with_assignee(assigned),
            )
            .await?;

        let message = DelegationMessage {
            task_id,
            task_type,
            description_sanitised: sanitised,
            priority,
            delegated_by: AgentId::Main,
            created_at: Utc::now(),
        };
        self.deliver(assigned, message).await?;

        tracing::info!(%task_id, task_type = task_type.as_str(), assigned = %assigned, "delegated");
        Ok(task_id)
    }

    /// Deliver a message, honouring an active failover: traffic for the
    /// orchestrator redirects to the standby, which processes only
    /// critical-priority work and queues the rest for replay.
    pub async fn deliver(&self, target: AgentId, message: DelegationMessage) -> CoreResult<()> {
        let route = self.failover.routing_target(target).await?;
        if route != target {
            if message.priority == TaskPriority::Critical {
                self.dispatcher.dispatch(route, &message).await?;
                self.failover.note_routed().await;
                tracing::warn!(intended = %target, routed = %route, task_id = %message.task_id, "failover redirect");
            } else {
                tracing::info!(intended = %target, task_id = %message.task_id, "failover active; delivery queued");
                self.failover
                    .enqueue(QueuedDelivery { target, message })
                    .await;
            }
            return Ok(());
        }
        self.dispatcher.dispatch(target, &message).await
    }

    /// Replay deliveries queued during a failover to their original
    /// targets. Failures are logged, not propagated; the tasks are still
    /// pending in the graph and reachable by the poll path.
    pub async fn replay(&self, deliveries: Vec<QueuedDelivery>) {
        for delivery in deliveries {
            if let Err(err) = self
                .dispatcher
                .dispatch(delivery.target, &delivery.message)
                .await
            {
                tracing::warn!(
                    target = %delivery.target,
                    task_id = %delivery.message.task_id,
                    error = %err,
                    "failed to replay queued delivery"
                );
            }
        }
    }
}
