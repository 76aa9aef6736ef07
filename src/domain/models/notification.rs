//! In-graph notification inbox.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::agent::AgentId;

/// Classification of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Info,
    /// Work item produced when a critical handler fails.
    Ticket,
    /// Human-operator alert (failover, curation abort).
    Critical,
    TaskCompleted,
    TaskFailed,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Ticket => "ticket",
            Self::Critical => "critical",
            Self::TaskCompleted => "task_completed",
            Self::TaskFailed => "task_failed",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "info" => Some(Self::Info),
            "ticket" => Some(Self::Ticket),
            "critical" => Some(Self::Critical),
            "task_completed" => Some(Self::TaskCompleted),
            "task_failed" => Some(Self::TaskFailed),
            _ => None,
        }
    }
}

/// An inbox item for one agent. Read notifications older than 12 hours are
/// swept by the rapid curation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub agent: AgentId,
    pub kind: NotificationKind,
    pub summary: String,
    pub task_id: Option<Uuid>,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

/// Fields needed to publish a notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewNotification {
    pub agent: AgentId,
    pub kind: NotificationKind,
    pub summary: String,
    pub task_id: Option<Uuid>,
}

impl NewNotification {
    pub fn new(agent: AgentId, kind: NotificationKind, summary: impl Into<String>) -> Self {
        Self {
            agent,
            kind,
            summary: summary.into(),
            task_id: None,
        }
    }

    pub fn with_task(mut self, task_id: Uuid) -> Self {
        self.task_id = Some(task_id);
        self
    }
}
