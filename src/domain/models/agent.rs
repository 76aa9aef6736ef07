//! Agent domain model.
//!
//! The swarm is a fixed set of six named agents. Agent rows are seeded at
//! schema setup and never deleted; only the liveness and delegation planes
//! mutate them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The closed set of agent identifiers.
///
/// Parsing any other string fails; this doubles as the allow-list for
/// delegation targets and for every identifier that reaches a graph query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentId {
    /// Orchestrator. Routes work to the specialists.
    Main,
    Researcher,
    Writer,
    Developer,
    Analyst,
    /// Operations specialist; also the designated emergency router.
    Ops,
}

impl AgentId {
    /// All six agents, in seed order.
    pub const ALL: [AgentId; 6] = [
        Self::Main,
        Self::Researcher,
        Self::Writer,
        Self::Developer,
        Self::Analyst,
        Self::Ops,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::Researcher => "researcher",
            Self::Writer => "writer",
            Self::Developer => "developer",
            Self::Analyst => "analyst",
            Self::Ops => "ops",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "main" => Some(Self::Main),
            "researcher" => Some(Self::Researcher),
            "writer" => Some(Self::Writer),
            "developer" => Some(Self::Developer),
            "analyst" => Some(Self::Analyst),
            "ops" => Some(Self::Ops),
            _ => None,
        }
    }

    /// Role of this agent in the swarm.
    pub fn role(&self) -> AgentRole {
        match self {
            Self::Main => AgentRole::Orchestrator,
            _ => AgentRole::Specialist,
        }
    }

    /// The agent that takes over routing when this one is unhealthy.
    /// Only the orchestrator has a standby.
    pub fn standby(&self) -> Option<AgentId> {
        match self {
            Self::Main => Some(Self::Ops),
            _ => None,
        }
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Orchestrator,
    Specialist,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Orchestrator => "orchestrator",
            Self::Specialist => "specialist",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "orchestrator" => Some(Self::Orchestrator),
            "specialist" => Some(Self::Specialist),
            _ => None,
        }
    }
}

/// Trust level granted to an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TrustLevel {
    Low,
    Medium,
    High,
}

impl TrustLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "LOW" => Some(Self::Low),
            "MEDIUM" => Some(Self::Medium),
            "HIGH" => Some(Self::High),
            _ => None,
        }
    }
}

/// Operational status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Active,
    Degraded,
    Inactive,
}

impl Default for AgentStatus {
    fn default() -> Self {
        Self::Active
    }
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Degraded => "degraded",
            Self::Inactive => "inactive",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "active" => Some(Self::Active),
            "degraded" => Some(Self::Degraded),
            "inactive" => Some(Self::Inactive),
            _ => None,
        }
    }
}

/// Which of the two heartbeat timestamps to touch.
///
/// The infrastructure heartbeat is written by an out-of-band sidecar and
/// proves the gateway process is alive. The functional heartbeat is written
/// by the agent itself on task claim/completion and proves useful work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatKind {
    Infra,
    Functional,
}

impl HeartbeatKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Infra => "infra",
            Self::Functional => "functional",
        }
    }
}

/// An agent row as stored in the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    /// Human-readable display name.
    pub name: String,
    pub role: AgentRole,
    pub trust_level: TrustLevel,
    pub status: AgentStatus,
    /// Last sidecar liveness write.
    pub infra_heartbeat: DateTime<Utc>,
    /// Last functional write (task claim or completion).
    pub last_heartbeat: DateTime<Utc>,
    /// Task currently being worked, if any.
    pub current_task: Option<Uuid>,
}

impl Agent {
    /// Seed row for a freshly migrated graph.
    pub fn seed(id: AgentId, now: DateTime<Utc>) -> Self {
        let trust_level = match id {
            AgentId::Main | AgentId::Ops => TrustLevel::High,
            _ => TrustLevel::Medium,
        };
        Self {
            id,
            name: id.as_str().to_string(),
            role: id.role(),
            trust_level,
            status: AgentStatus::Active,
            infra_heartbeat: now,
            last_heartbeat: now,
            current_task: None,
        }
    }

    /// Age of the infrastructure heartbeat at `now`.
    pub fn infra_age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.infra_heartbeat
    }

    /// Age of the functional heartbeat at `now`.
    pub fn functional_age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_heartbeat
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_id_round_trip() {
        for id in AgentId::ALL {
            assert_eq!(AgentId::from_str(id.as_str()), Some(id));
        }
    }

    #[test]
    fn test_unknown_agent_rejected() {
        assert_eq!(AgentId::from_str("kublai"), None);
        assert_eq!(AgentId::from_str(""), None);
        assert_eq!(AgentId::from_str("main; DROP"), None);
    }

    #[test]
    fn test_roles() {
        assert_eq!(AgentId::Main.role(), AgentRole::Orchestrator);
        assert_eq!(AgentId::Ops.role(), AgentRole::Specialist);
    }

    #[test]
    fn test_standby_only_for_orchestrator() {
        assert_eq!(AgentId::Main.standby(), Some(AgentId::Ops));
        for id in [AgentId::Researcher, AgentId::Writer, AgentId::Developer, AgentId::Analyst, AgentId::Ops] {
            assert_eq!(id.standby(), None);
        }
    }

    #[test]
    fn test_seed_trust_levels() {
        let now = Utc::now();
        assert_eq!(Agent::seed(AgentId::Main, now).trust_level, TrustLevel::High);
        assert_eq!(Agent::seed(AgentId::Writer, now).trust_level, TrustLevel::Medium);
    }
}
