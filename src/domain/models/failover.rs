//! Failover event records.
//!
//! A failover event is opened when the orchestrator fails three consecutive
//! health checks and the standby assumes routing duty. At most one event is
//! active at any time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::agent::AgentId;

/// Lifecycle status of a failover event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverStatus {
    Active,
    Resolved,
}

impl FailoverStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Resolved => "resolved",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "active" => Some(Self::Active),
            "resolved" => Some(Self::Resolved),
            _ => None,
        }
    }
}

/// Record of one standby promotion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailoverEvent {
    pub id: Uuid,
    pub triggered_by: AgentId,
    pub reason: String,
    pub activated_at: DateTime<Utc>,
    pub deactivated_at: Option<DateTime<Utc>>,
    pub status: FailoverStatus,
    /// Messages routed by the standby while the event was active.
    pub messages_routed: u64,
}

impl FailoverEvent {
    pub fn open(triggered_by: AgentId, reason: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            triggered_by,
            reason: reason.into(),
            activated_at: now,
            deactivated_at: None,
            status: FailoverStatus::Active,
            messages_routed: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == FailoverStatus::Active
    }

    pub fn resolve(&mut self, now: DateTime<Utc>) {
        self.status = FailoverStatus::Resolved;
        self.deactivated_at = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_and_resolve() {
        let now = Utc::now();
        let mut event = FailoverEvent::open(AgentId::Ops, "main dead 3x", now);
        assert!(event.is_active());
        assert!(event.deactivated_at.is_none());

        event.resolve(now + chrono::Duration::minutes(20));
        assert!(!event.is_active());
        assert!(event.deactivated_at.is_some());
    }
}
