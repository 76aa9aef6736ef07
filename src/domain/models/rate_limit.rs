//! Per-agent, per-operation rate limiting keyed by calendar hour.

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};

use super::agent::AgentId;

/// Counter key: one row per (agent, operation, date, hour).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RateLimitKey {
    pub agent: AgentId,
    pub operation: String,
    /// `YYYY-MM-DD`
    pub date: String,
    pub hour: u32,
}

impl RateLimitKey {
    pub fn at(agent: AgentId, operation: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            agent,
            operation: operation.into(),
            date: format!("{:04}-{:02}-{:02}", now.year(), now.month(), now.day()),
            hour: now.hour(),
        }
    }
}

/// Outcome of an atomic increment-and-check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    /// Denied; carries the observed count for the hour.
    Denied(u32),
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_key_buckets_by_hour() {
        let t1 = Utc.with_ymd_and_hms(2026, 3, 14, 9, 5, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2026, 3, 14, 9, 59, 0).unwrap();
        let t3 = Utc.with_ymd_and_hms(2026, 3, 14, 10, 0, 0).unwrap();

        let k1 = RateLimitKey::at(AgentId::Main, "delegate", t1);
        let k2 = RateLimitKey::at(AgentId::Main, "delegate", t2);
        let k3 = RateLimitKey::at(AgentId::Main, "delegate", t3);

        assert_eq!(k1, k2);
        assert_ne!(k1, k3);
        assert_eq!(k1.date, "2026-03-14");
        assert_eq!(k1.hour, 9);
    }
}
