//! Specialist claim loop.
//!
//! On receipt of a delegation message (or on a periodic poll when none
//! arrived) a specialist touches its functional heartbeat, attempts the
//! atomic claim, runs the work, and closes the task out. Losing the race
//! is a normal outcome, not an error.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::models::{AgentId, ClaimOutcome, HeartbeatKind, Task};
use crate::domain::ports::GraphStore;

/// The work a specialist performs once it owns a task. The body is opaque
/// to the coordination plane; implementations live with the agent runtime.
#[async_trait]
pub trait TaskWork: Send + Sync {
    async fn execute(&self, task: Task) -> Result<serde_json::Value, String>;
}

/// Claim-then-work driver for one specialist.
pub struct ClaimWorker {
    graph: Arc<dyn GraphStore>,
    agent: AgentId,
}

impl ClaimWorker {
    pub fn new(graph: Arc<dyn GraphStore>, agent: AgentId) -> Self {
        Self { graph, agent }
    }

    pub fn agent(&self) -> AgentId {
        self.agent
    }

    /// Handle one delegation message: heartbeat, claim, work, close out.
    pub async fn process(&self, task_id: Uuid, work: &dyn TaskWork) -> CoreResult<ClaimOutcome> {
        self.graph
            .update_heartbeat_at(self.agent, HeartbeatKind::Functional, Utc::now())
            .await?;

        let outcome = self.graph.claim_task(task_id, self.agent).await?;
        match &outcome {
            ClaimOutcome::Claimed => {}
            ClaimOutcome::AlreadyClaimed(owner) => {
                tracing::debug!(%task_id, owner = %owner, "claim lost");
                return Ok(outcome);
            }
            ClaimOutcome::NotFound => return Ok(outcome),
        }

        let task = self
            .graph
            .get_task(task_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("task {task_id}")))?;

        match work.execute(task).await {
            Ok(results) => {
                self.graph
                    .complete_task(task_id, self.agent, results)
                    .await?;
            }
            Err(message) => {
                self.graph.fail_task(task_id, self.agent, &message).await?;
            }
        }

        self.graph
            .update_heartbeat_at(self.agent, HeartbeatKind::Functional, Utc::now())
            .await?;
        Ok(ClaimOutcome::Claimed)
    }

    /// Poll path: claim and work any pending tasks assigned to this agent.
    /// Returns the number of tasks actually claimed.
    pub async fn poll_once(&self, work: &dyn TaskWork, limit: usize) -> CoreResult<usize> {
        let pending = self.graph.pending_tasks_for(self.agent, limit).await?;
        let mut claimed = 0;
        for task in pending {
            if self.process(task.id, work).await?.is_claimed() {
                claimed += 1;
            }
        }
        Ok(claimed)
    }
}
