//! Task domain model.
//!
//! Tasks are delegated units of work. The status machine is deliberately
//! small: `pending → in_progress → {completed | failed}`, no back-edges.
//! A task enters `in_progress` through exactly one successful claim.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::agent::AgentId;

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "completed" | "complete" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Valid transitions from this status. No back-edges.
    pub fn valid_transitions(&self) -> &'static [TaskStatus] {
        match self {
            Self::Pending => &[Self::InProgress],
            Self::InProgress => &[Self::Completed, Self::Failed],
            Self::Completed | Self::Failed => &[],
        }
    }

    pub fn can_transition_to(&self, new_status: Self) -> bool {
        self.valid_transitions().contains(&new_status)
    }
}

/// Priority level for tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low = 1,
    Normal = 2,
    High = 3,
    Critical = 4,
}

impl Default for TaskPriority {
    fn default() -> Self {
        Self::Normal
    }
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "low" => Some(Self::Low),
            "normal" => Some(Self::Normal),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

/// What kind of work a delegated task represents.
///
/// This is the routing discriminator: each variant maps to exactly one
/// specialist. Unknown inbound strings collapse to [`TaskType::Unknown`],
/// which routes to the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Research,
    Writing,
    Documentation,
    Development,
    Coding,
    Analysis,
    Security,
    Testing,
    Operations,
    Monitoring,
    HealthCheck,
    Orchestration,
    Synthesis,
    Unknown,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Research => "research",
            Self::Writing => "writing",
            Self::Documentation => "documentation",
            Self::Development => "development",
            Self::Coding => "coding",
            Self::Analysis => "analysis",
            Self::Security => "security",
            Self::Testing => "testing",
            Self::Operations => "operations",
            Self::Monitoring => "monitoring",
            Self::HealthCheck => "health_check",
            Self::Orchestration => "orchestration",
            Self::Synthesis => "synthesis",
            Self::Unknown => "unknown",
        }
    }

    /// Parse a task type. Unlike the closed enums, unknown strings are
    /// accepted and collapse to `Unknown` so routing can fall back.
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "research" => Self::Research,
            "writing" => Self::Writing,
            "documentation" => Self::Documentation,
            "development" => Self::Development,
            "coding" => Self::Coding,
            "analysis" => Self::Analysis,
            "security" => Self::Security,
            "testing" => Self::Testing,
            "operations" => Self::Operations,
            "monitoring" => Self::Monitoring,
            "health_check" => Self::HealthCheck,
            "orchestration" => Self::Orchestration,
            "synthesis" => Self::Synthesis,
            _ => Self::Unknown,
        }
    }

    /// The specialist this task type routes to.
    pub fn route(&self) -> AgentId {
        match self {
            Self::Research => AgentId::Researcher,
            Self::Writing | Self::Documentation => AgentId::Writer,
            Self::Development | Self::Coding => AgentId::Developer,
            Self::Analysis | Self::Security | Self::Testing => AgentId::Analyst,
            Self::Operations | Self::Monitoring | Self::HealthCheck => AgentId::Ops,
            Self::Orchestration | Self::Synthesis | Self::Unknown => AgentId::Main,
        }
    }
}

/// Outcome of an atomic claim attempt.
///
/// The claim is a single conditional update at the graph layer; this enum
/// replaces exception-driven control flow around contested claims.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The caller now owns the task; status moved to `in_progress`.
    Claimed,
    /// Another agent won the race (or already held the task).
    AlreadyClaimed(AgentId),
    /// No task with that id exists.
    NotFound,
}

impl ClaimOutcome {
    pub fn is_claimed(&self) -> bool {
        matches!(self, Self::Claimed)
    }
}

/// A delegated unit of work as stored in the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub task_type: TaskType,
    /// Sanitised description. Raw user text never lands here.
    pub description: String,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub delegated_by: AgentId,
    /// Target specialist. `None` until a claim pins it.
    pub assigned_to: Option<AgentId>,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Opaque result blob written on completion.
    pub results: Option<serde_json::Value>,
    pub error_message: Option<String>,
}

/// Fields required to create a task. Everything else is derived.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub task_type: TaskType,
    pub description: String,
    pub priority: TaskPriority,
    pub delegated_by: AgentId,
    pub assigned_to: Option<AgentId>,
    pub metadata: serde_json::Value,
}

impl NewTask {
    pub fn new(task_type: TaskType, description: impl Into<String>) -> Self {
        Self {
            task_type,
            description: description.into(),
            priority: TaskPriority::default(),
            delegated_by: AgentId::Main,
            assigned_to: None,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_assignee(mut self, agent: AgentId) -> Self {
        self.assigned_to = Some(agent);
        self
    }

    pub fn with_delegator(mut self, agent: AgentId) -> Self {
        self.delegated_by = agent;
        self
    }

    /// Materialise into a full task row.
    pub fn into_task(self, id: Uuid, now: DateTime<Utc>) -> Task {
        Task {
            id,
            task_type: self.task_type,
            description: self.description,
            status: TaskStatus::Pending,
            priority: self.priority,
            delegated_by: self.delegated_by,
            assigned_to: self.assigned_to,
            created_at: now,
            claimed_at: None,
            completed_at: None,
            results: None,
            error_message: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_machine_has_no_back_edges() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::InProgress));
        assert!(TaskStatus::InProgress.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::InProgress.can_transition_to(TaskStatus::Failed));

        assert!(!TaskStatus::InProgress.can_transition_to(TaskStatus::Pending));
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::InProgress));
        assert!(!TaskStatus::Failed.can_transition_to(TaskStatus::Pending));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Completed));
    }

    #[test]
    fn test_terminal_states() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::InProgress.is_terminal());
    }

    #[test]
    fn test_routing_table() {
        assert_eq!(TaskType::Research.route(), AgentId::Researcher);
        assert_eq!(TaskType::Writing.route(), AgentId::Writer);
        assert_eq!(TaskType::Documentation.route(), AgentId::Writer);
        assert_eq!(TaskType::Development.route(), AgentId::Developer);
        assert_eq!(TaskType::Coding.route(), AgentId::Developer);
        assert_eq!(TaskType::Analysis.route(), AgentId::Analyst);
        assert_eq!(TaskType::Security.route(), AgentId::Analyst);
        assert_eq!(TaskType::Testing.route(), AgentId::Analyst);
        assert_eq!(TaskType::Operations.route(), AgentId::Ops);
        assert_eq!(TaskType::Monitoring.route(), AgentId::Ops);
        assert_eq!(TaskType::HealthCheck.route(), AgentId::Ops);
        assert_eq!(TaskType::Orchestration.route(), AgentId::Main);
        assert_eq!(TaskType::Synthesis.route(), AgentId::Main);
    }

    #[test]
    fn test_unknown_type_routes_to_orchestrator() {
        assert_eq!(TaskType::parse("quantum_basketweaving"), TaskType::Unknown);
        assert_eq!(TaskType::Unknown.route(), AgentId::Main);
    }

    #[test]
    fn test_new_task_materialisation() {
        let now = Utc::now();
        let id = Uuid::new_v4();
        let task = NewTask::new(TaskType::Research, "survey crates")
            .with_priority(TaskPriority::High)
            .with_assignee(AgentId::Researcher)
            .into_task(id, now);

        assert_eq!(task.id, id);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.assigned_to, Some(AgentId::Researcher));
        assert!(task.claimed_at.is_none());
    }
}
