//! HMAC signing material for inter-agent authentication.
//!
//! Only the hash of the shared secret is persisted. Keys expire after 90
//! days; rotation deactivates the prior key but retains it for audit.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::agent::AgentId;

/// Default key lifetime.
pub const KEY_LIFETIME_DAYS: i64 = 90;

/// Minimum audit retention for deactivated keys.
pub const KEY_AUDIT_RETENTION_DAYS: i64 = 30;

/// A signing-key row. `key_hash` is hex(SHA-256(key material)); the
/// plaintext secret never reaches the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentKey {
    pub agent_id: AgentId,
    pub key_hash: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_active: bool,
}

impl AgentKey {
    pub fn issue(agent_id: AgentId, key_hash: String, now: DateTime<Utc>) -> Self {
        Self {
            agent_id,
            key_hash,
            created_at: now,
            expires_at: now + Duration::days(KEY_LIFETIME_DAYS),
            is_active: true,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Whether a deactivated key may be purged yet.
    pub fn audit_window_elapsed(&self, now: DateTime<Utc>) -> bool {
        !self.is_active && now - self.created_at >= Duration::days(KEY_AUDIT_RETENTION_DAYS)
    }
}
