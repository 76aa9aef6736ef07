//! Domain errors for the coordination plane.
//!
//! Kinds group into the retry classes the callers rely on: transient
//! errors are retried at most once, ownership/state errors never, and
//! integrity errors are logged but answered uniformly at the boundary.

use thiserror::Error;
use uuid::Uuid;

use super::models::AgentId;

/// Domain-level errors.
#[derive(Debug, Error)]
pub enum CoreError {
    // Transient / recoverable
    #[error("Graph unavailable: {0}")]
    GraphUnavailable(String),

    #[error("Gateway unavailable: {0}")]
    GatewayUnavailable(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Operation timed out after {0}s")]
    Timeout(u64),

    // Ownership / state
    #[error("Task {task_id} already claimed by {owner}")]
    AlreadyClaimed { task_id: Uuid, owner: AgentId },

    #[error("Stale ownership: task {task_id} is not held by {agent}")]
    StaleOwnership { task_id: Uuid, agent: AgentId },

    #[error("Not found: {0}")]
    NotFound(String),

    // Policy
    #[error("Rate limited: {agent}/{operation} at {count} calls this hour")]
    RateLimited {
        agent: AgentId,
        operation: String,
        count: u32,
    },

    #[error("Curation pass would delete {would_delete} of {tier_size} {tier} nodes (cap {cap_percent}%)")]
    CurationExcess {
        tier: String,
        would_delete: usize,
        tier_size: usize,
        cap_percent: u8,
    },

    #[error("Forbidden URL scheme in {0}")]
    ForbiddenScheme(String),

    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    #[error("Invalid frequency {0} minutes; allowed: 5, 15, 30, 60, 360, 1440, 10080")]
    InvalidFrequency(u32),

    #[error("Unknown task: {0}")]
    UnknownTask(String),

    // Integrity
    #[error("Signature verification failed")]
    SignatureInvalid,

    #[error("Replayed message rejected")]
    Replay,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // Degraded-mode
    #[error("Graph store degraded; read unavailable for {0}")]
    Degraded(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    /// Transient errors are eligible for a single retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::GraphUnavailable(_)
                | Self::GatewayUnavailable(_)
                | Self::Network(_)
                | Self::Timeout(_)
        )
    }

    /// Integrity failures answered with an undifferentiated 401.
    pub fn is_integrity(&self) -> bool {
        matches!(self, Self::SignatureInvalid | Self::Replay | Self::InvalidInput(_))
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Serialization(err.to_string())
    }
}
