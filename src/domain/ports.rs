//! Port traits for the coordination plane.
//!
//! `GraphStore` is the only doorway to the property graph. Every
//! implementation must keep the invariants the models promise: the claim
//! is a single conditional update, heartbeats are monotonic, cycle numbers
//! strictly increase, and protected memory nodes are never curated away.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::errors::CoreResult;
use super::models::{
    Agent, AgentId, AgentKey, ClaimOutcome, CurationAction, FailoverEvent, HeartbeatCycle,
    HeartbeatKind, MemoryEntry, MemoryTier, NewNotification, NewTask, RateLimitDecision, Task,
    TaskResult,
};

/// Key-node counts exposed by `/health/graph`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GraphCounts {
    pub agents: u64,
    pub tasks: u64,
    pub memory_entries: u64,
    pub cycles: u64,
    pub notifications: u64,
}

/// Typed façade over the property graph.
///
/// All writes are parameterised at the query layer; no caller-supplied
/// string ever reaches query text. Identifiers cross this boundary only as
/// closed enums or UUIDs.
#[async_trait]
pub trait GraphStore: Send + Sync {
    // ------------------------------------------------------------------
    // Agents & heartbeats
    // ------------------------------------------------------------------

    async fn get_agent(&self, id: AgentId) -> CoreResult<Agent>;

    async fn list_agents(&self) -> CoreResult<Vec<Agent>>;

    /// Set one heartbeat timestamp to `at`. Monotonic: an older `at` than
    /// the stored value is a no-op, so replays can never move time backwards.
    async fn update_heartbeat_at(
        &self,
        id: AgentId,
        kind: HeartbeatKind,
        at: DateTime<Utc>,
    ) -> CoreResult<()>;

    /// One batched infra-heartbeat write for the sidecar.
    async fn update_infra_heartbeats_at(
        &self,
        ids: &[AgentId],
        at: DateTime<Utc>,
    ) -> CoreResult<()>;

    async fn set_agent_status(
        &self,
        id: AgentId,
        status: super::models::AgentStatus,
    ) -> CoreResult<()>;

    async fn set_current_task(&self, id: AgentId, task: Option<Uuid>) -> CoreResult<()>;

    // ------------------------------------------------------------------
    // Tasks
    // ------------------------------------------------------------------

    async fn create_task(&self, new: NewTask) -> CoreResult<Uuid>;

    async fn get_task(&self, id: Uuid) -> CoreResult<Option<Task>>;

    /// Atomic claim: succeeds iff the task is `pending` and `assigned_to`
    /// is the claimant or unset (in which case this call pins it). A single
    /// conditional update at the graph layer, never a read-then-write.
    async fn claim_task(&self, id: Uuid, agent: AgentId) -> CoreResult<ClaimOutcome>;

    /// Terminal transition to `completed`. Requires current ownership.
    async fn complete_task(
        &self,
        id: Uuid,
        agent: AgentId,
        results: serde_json::Value,
    ) -> CoreResult<()>;

    /// Terminal transition to `failed`. Requires current ownership.
    async fn fail_task(&self, id: Uuid, agent: AgentId, error: &str) -> CoreResult<()>;

    /// Move terminal tasks older than `older_than` into the archive tier.
    /// Returns the number archived.
    async fn archive_terminal_tasks(&self, older_than: DateTime<Utc>) -> CoreResult<u64>;

    /// Pending tasks assigned to (or claimable by) one agent, oldest first.
    /// Backs the specialist poll path when no message was delivered.
    async fn pending_tasks_for(&self, agent: AgentId, limit: usize) -> CoreResult<Vec<Task>>;

    // ------------------------------------------------------------------
    // Rate limiting
    // ------------------------------------------------------------------

    /// Atomic increment-and-check on the (agent, operation, date, hour) key.
    async fn check_rate_limit(
        &self,
        agent: AgentId,
        operation: &str,
        limit_per_hour: u32,
    ) -> CoreResult<RateLimitDecision>;

    /// Drop counters older than `older_than`. Returns rows removed.
    async fn purge_rate_limits(&self, older_than: DateTime<Utc>) -> CoreResult<u64>;

    // ------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------

    async fn publish_notification(&self, notification: NewNotification) -> CoreResult<Uuid>;

    /// Delete read notifications created before `older_than`.
    async fn sweep_read_notifications(&self, older_than: DateTime<Utc>) -> CoreResult<u64>;

    // ------------------------------------------------------------------
    // Cycles
    // ------------------------------------------------------------------

    /// `max(cycle_number) + 1`, or 1 for an empty graph.
    async fn next_cycle_number(&self) -> CoreResult<u64>;

    /// Write the opening cycle row (`started_at` set, counts zero).
    async fn record_cycle(&self, cycle: &HeartbeatCycle) -> CoreResult<()>;

    /// Update the cycle row with final counts and `completed_at`.
    async fn finalize_cycle(&self, cycle: &HeartbeatCycle) -> CoreResult<()>;

    /// Persist one handler result linked to its cycle.
    async fn record_result(&self, cycle_number: u64, result: &TaskResult) -> CoreResult<()>;

    // ------------------------------------------------------------------
    // Agent keys
    // ------------------------------------------------------------------

    /// Hash `key_material`, insert a fresh active key with a 90-day expiry,
    /// and deactivate (but retain) the prior active key.
    async fn upsert_agent_key(&self, agent: AgentId, key_material: &[u8]) -> CoreResult<AgentKey>;

    /// The active key for an agent, if one exists and has not expired.
    async fn active_key(&self, agent: AgentId) -> CoreResult<Option<AgentKey>>;

    /// Remove deactivated keys past the audit retention window.
    async fn purge_retired_keys(&self, now: DateTime<Utc>) -> CoreResult<u64>;

    // ------------------------------------------------------------------
    // Failover
    // ------------------------------------------------------------------

    async fn active_failover(&self) -> CoreResult<Option<FailoverEvent>>;

    /// Open a failover event. Idempotent: if one is already active it is
    /// returned unchanged, preserving the at-most-one-active invariant.
    async fn open_failover(&self, event: FailoverEvent) -> CoreResult<FailoverEvent>;

    async fn resolve_failover(&self, id: Uuid, at: DateTime<Utc>) -> CoreResult<()>;

    async fn increment_failover_routed(&self, id: Uuid) -> CoreResult<()>;

    // ------------------------------------------------------------------
    // Memory curation
    // ------------------------------------------------------------------

    /// Sample up to `limit` non-tombstoned nodes from a tier for scoring.
    async fn score_sample(&self, tier: MemoryTier, limit: usize) -> CoreResult<Vec<MemoryEntry>>;

    async fn get_memory(&self, id: Uuid) -> CoreResult<Option<MemoryEntry>>;

    /// Live (non-tombstoned) node count per tier.
    async fn tier_counts(&self) -> CoreResult<HashMap<MemoryTier, u64>>;

    /// Payload token totals per tier, for budget enforcement.
    async fn tier_token_totals(&self) -> CoreResult<HashMap<MemoryTier, u64>>;

    /// Record a scoring outcome: new score, chosen action, curation stamp.
    async fn record_score(
        &self,
        node: Uuid,
        score: f64,
        action: CurationAction,
        at: DateTime<Utc>,
    ) -> CoreResult<()>;

    async fn set_tier(&self, node: Uuid, tier: MemoryTier) -> CoreResult<()>;

    /// Soft-delete: set the tombstone flag and the physical-purge deadline.
    async fn tombstone(
        &self,
        node: Uuid,
        reason: &str,
        purge_after: DateTime<Utc>,
    ) -> CoreResult<()>;

    /// Fold `src` into `dst`: copy relationships, link MERGED_INTO, and
    /// tombstone `src`. Fails unless `dst.mvs_score >= src.mvs_score`.
    async fn merge_into(&self, src: Uuid, dst: Uuid) -> CoreResult<()>;

    /// Physically remove tombstoned nodes whose deadline has passed.
    async fn purge_tombstoned(&self, older_than: DateTime<Utc>) -> CoreResult<u64>;

    /// Physically remove one node (ephemeral labels below the floor).
    async fn purge_node(&self, node: Uuid) -> CoreResult<()>;

    /// Delete unprotected nodes with no incident edges. Returns count.
    async fn delete_orphans(&self) -> CoreResult<u64>;

    /// Multiply stale confidence values by `factor` for nodes not accessed
    /// since `not_accessed_since`. Returns nodes touched.
    async fn decay_stale_confidence(
        &self,
        not_accessed_since: DateTime<Utc>,
        factor: f64,
    ) -> CoreResult<u64>;

    /// Delete session contexts created before `older_than`. Returns count.
    async fn expire_session_contexts(&self, older_than: DateTime<Utc>) -> CoreResult<u64>;

    /// Near-duplicate pairs `(lower, higher)` by embedding cosine
    /// similarity, ordered so the second node never scores below the first.
    async fn dedup_candidates(
        &self,
        min_similarity: f64,
        limit: usize,
    ) -> CoreResult<Vec<(Uuid, Uuid)>>;

    // ------------------------------------------------------------------
    // Operational
    // ------------------------------------------------------------------

    /// Connection health query.
    async fn ping(&self) -> CoreResult<()>;

    async fn node_counts(&self) -> CoreResult<GraphCounts>;

    /// Create constraints/indexes and seed the six agent rows. Idempotent.
    async fn ensure_schema(&self) -> CoreResult<()>;
}

/// Convenience: touch a heartbeat at the current instant.
pub async fn update_heartbeat(
    store: &dyn GraphStore,
    id: AgentId,
    kind: HeartbeatKind,
) -> CoreResult<()> {
    store.update_heartbeat_at(id, kind, Utc::now()).await
}
