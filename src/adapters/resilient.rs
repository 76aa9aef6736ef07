//! Resilient graph store wrapper.
//!
//! Wraps any [`GraphStore`] with the externalised retry and failure
//! policies. Sustained failure flips the wrapper into degraded mode:
//! append-only writes land in an in-process journal, reads serve cached
//! values where available, and everything else answers `ErrDegraded`.
//! A probe drains the journal and restores healthy mode once the policy's
//! recovery threshold is met.
//!
//! Conflict resolution on drain: heartbeat writes replay with their
//! original timestamps against monotonic guards, so the graph's newer
//! value wins; cycle/result/notification records are append-only, so the
//! journaled value wins.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::models::{
    Agent, AgentId, AgentKey, AgentStatus, ClaimOutcome, CurationAction, FailoverEvent,
    HeartbeatCycle, HeartbeatKind, MemoryEntry, MemoryTier, NewNotification, NewTask,
    RateLimitDecision, Task, TaskResult,
};
use crate::domain::ports::{GraphCounts, GraphStore};
use crate::services::cancel::CancelToken;
use crate::services::retry::{FailurePolicy, FailureTracker, RetryPolicy};

/// Current mode of the wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    Healthy,
    Degraded,
}

/// Journalled write, keyed by operation type.
#[derive(Debug, Clone)]
enum JournalOp {
    Heartbeat {
        agent: AgentId,
        kind: HeartbeatKind,
        at: DateTime<Utc>,
    },
    InfraBatch {
        agents: Vec<AgentId>,
        at: DateTime<Utc>,
    },
    Cycle(HeartbeatCycle),
    FinalizeCycle(HeartbeatCycle),
    Result {
        cycle_number: u64,
        result: TaskResult,
    },
    Notification(NewNotification),
}

#[derive(Default)]
struct Shared {
    mode: Option<StoreMode>,
    tracker: FailureTracker,
    journal: VecDeque<JournalOp>,
    cached_agents: HashMap<AgentId, Agent>,
    /// Highest cycle number observed; lets degraded cycles keep numbering.
    last_cycle_number: u64,
}

impl Shared {
    fn mode(&self) -> StoreMode {
        self.mode.unwrap_or(StoreMode::Healthy)
    }
}

/// `GraphStore` decorator applying [`RetryPolicy`] and [`FailurePolicy`].
pub struct ResilientStore<S> {
    inner: Arc<S>,
    retry: RetryPolicy,
    policy: FailurePolicy,
    shared: Mutex<Shared>,
}

impl<S: GraphStore> ResilientStore<S> {
    pub fn new(inner: Arc<S>) -> Self {
        Self::with_policies(inner, RetryPolicy::default(), FailurePolicy::default())
    }

    pub fn with_policies(inner: Arc<S>, retry: RetryPolicy, policy: FailurePolicy) -> Self {
        Self {
            inner,
            retry,
            policy,
            shared: Mutex::new(Shared::default()),
        }
    }

    pub async fn mode(&self) -> StoreMode {
        self.shared.lock().await.mode()
    }

    pub async fn journal_len(&self) -> usize {
        self.shared.lock().await.journal.len()
    }

    async fn is_degraded(&self) -> bool {
        self.mode().await == StoreMode::Degraded
    }

    async fn note_success(&self) {
        self.shared.lock().await.tracker.record_success();
    }

    /// Record a failed call; flips to degraded when the policy trips.
    async fn note_failure(&self) -> StoreMode {
        let mut shared = self.shared.lock().await;
        if shared.tracker.record_failure(&self.policy, Utc::now())
            && shared.mode() == StoreMode::Healthy
        {
            tracing::warn!("graph store entering degraded mode");
            shared.mode = Some(StoreMode::Degraded);
            shared.tracker.reset();
        }
        shared.mode()
    }

    /// Run a non-journalable operation through the retry policy.
    async fn guard<T, F, Fut>(&self, what: &str, f: F) -> CoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CoreResult<T>>,
    {
        if self.is_degraded().await {
            return Err(CoreError::Degraded(what.to_string()));
        }
        match self.retry.execute(f).await {
            Ok(value) => {
                self.note_success().await;
                Ok(value)
            }
            Err(err) if err.is_transient() => {
                self.note_failure().await;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Run a journalable write; when degraded (or when this failure trips
    /// the transition) the op is queued instead of lost.
    async fn guard_journal<F, Fut>(&self, op: JournalOp, f: F) -> CoreResult<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CoreResult<()>>,
    {
        if self.is_degraded().await {
            self.shared.lock().await.journal.push_back(op);
            return Ok(());
        }
        match self.retry.execute(f).await {
            Ok(()) => {
                self.note_success().await;
                Ok(())
            }
            Err(err) if err.is_transient() => {
                if self.note_failure().await == StoreMode::Degraded {
                    self.shared.lock().await.journal.push_back(op);
                    Ok(())
                } else {
                    Err(err)
                }
            }
            Err(err) => Err(err),
        }
    }

    /// One probe step: ping, drain the journal on success, and exit
    /// degraded mode once the recovery streak is met and the journal is
    /// empty. No-op in healthy mode.
    pub async fn probe_once(&self) -> StoreMode {
        if !self.is_degraded().await {
            return StoreMode::Healthy;
        }

        let success = self.inner.ping().await.is_ok();
        if success {
            self.drain_journal().await;
        }

        let mut shared = self.shared.lock().await;
        let streak_met = shared.tracker.record_probe(&self.policy, success);
        if streak_met && shared.journal.is_empty() {
            tracing::info!("graph store recovered; leaving degraded mode");
            shared.mode = Some(StoreMode::Healthy);
            shared.tracker.reset();
        }
        shared.mode()
    }

    /// Background probe driver for daemon mode.
    pub async fn run_probe_loop(&self, cancel: CancelToken) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(self.policy.probe_interval) => {
                    self.probe_once().await;
                }
            }
        }
    }

    /// Replay journalled ops in order, stopping at the first failure.
    async fn drain_journal(&self) {
        loop {
            let op = {
                let mut shared = self.shared.lock().await;
                let Some(op) = shared.journal.pop_front() else {
                    return;
                };
                op
            };

            let result = match &op {
                JournalOp::Heartbeat { agent, kind, at } => {
                    self.inner.update_heartbeat_at(*agent, *kind, *at).await
                }
                JournalOp::InfraBatch { agents, at } => {
                    self.inner.update_infra_heartbeats_at(agents, *at).await
                }
                JournalOp::Cycle(cycle) => self.inner.record_cycle(cycle).await,
                JournalOp::FinalizeCycle(cycle) => self.inner.finalize_cycle(cycle).await,
                JournalOp::Result {
                    cycle_number,
                    result,
                } => self.inner.record_result(*cycle_number, result).await,
                JournalOp::Notification(n) => {
                    self.inner.publish_notification(n.clone()).await.map(|_| ())
                }
            };

            if result.is_err() {
                // Put it back and let the next probe try again.
                self.shared.lock().await.journal.push_front(op);
                return;
            }
        }
    }
}

#[async_trait]
impl<S: GraphStore> GraphStore for ResilientStore<S> {
    async fn get_agent(&self, id: AgentId) -> CoreResult<Agent> {
        if self.is_degraded().await {
            return self
                .shared
                .lock()
                .await
                .cached_agents
                .get(&id)
                .cloned()
                .ok_or_else(|| CoreError::Degraded(format!("get_agent {id}")));
        }
        let agent = self.guard("get_agent", || self.inner.get_agent(id)).await?;
        self.shared
            .lock()
            .await
            .cached_agents
            .insert(agent.id, agent.clone());
        Ok(agent)
    }

    async fn list_agents(&self) -> CoreResult<Vec<Agent>> {
        if self.is_degraded().await {
            let shared = self.shared.lock().await;
            if shared.cached_agents.is_empty() {
                return Err(CoreError::Degraded("list_agents".to_string()));
            }
            let mut agents: Vec<Agent> = shared.cached_agents.values().cloned().collect();
            agents.sort_by_key(|a| a.id.as_str());
            return Ok(agents);
        }
        let agents = self.guard("list_agents", || self.inner.list_agents()).await?;
        let mut shared = self.shared.lock().await;
        for agent in &agents {
            shared.cached_agents.insert(agent.id, agent.clone());
        }
        Ok(agents)
    }

    async fn update_heartbeat_at(
        &self,
        id: AgentId,
        kind: HeartbeatKind,
        at: DateTime<Utc>,
    ) -> CoreResult<()> {
        self.guard_journal(JournalOp::Heartbeat { agent: id, kind, at }, || {
            self.inner.update_heartbeat_at(id, kind, at)
        })
        .await
    }

    async fn update_infra_heartbeats_at(
        &self,
        ids: &[AgentId],
        at: DateTime<Utc>,
    ) -> CoreResult<()> {
        self.guard_journal(
            JournalOp::InfraBatch {
                agents: ids.to_vec(),
                at,
            },
            || self.inner.update_infra_heartbeats_at(ids, at),
        )
        .await
    }

    async fn set_agent_status(&self, id: AgentId, status: AgentStatus) -> CoreResult<()> {
        self.guard("set_agent_status", || self.inner.set_agent_status(id, status))
            .await
    }

    async fn set_current_task(&self, id: AgentId, task: Option<Uuid>) -> CoreResult<()> {
        self.guard("set_current_task", || self.inner.set_current_task(id, task))
            .await
    }

    async fn create_task(&self, new: NewTask) -> CoreResult<Uuid> {
        self.guard("create_task", || self.inner.create_task(new.clone()))
            .await
    }

    async fn get_task(&self, id: Uuid) -> CoreResult<Option<Task>> {
        self.guard("get_task", || self.inner.get_task(id)).await
    }

    async fn claim_task(&self, id: Uuid, agent: AgentId) -> CoreResult<ClaimOutcome> {
        // Never journalled: a claim is a conditional mutation whose outcome
        // the caller needs immediately.
        self.guard("claim_task", || self.inner.claim_task(id, agent)).await
    }

    async fn complete_task(
        &self,
        id: Uuid,
        agent: AgentId,
        results: serde_json::Value,
    ) -> CoreResult<()> {
        self.guard("complete_task", || {
            self.inner.complete_task(id, agent, results.clone())
        })
        .await
    }

    async fn fail_task(&self, id: Uuid, agent: AgentId, error: &str) -> CoreResult<()> {
        self.guard("fail_task", || self.inner.fail_task(id, agent, error))
            .await
    }

    async fn archive_terminal_tasks(&self, older_than: DateTime<Utc>) -> CoreResult<u64> {
        self.guard("archive_terminal_tasks", || {
            self.inner.archive_terminal_tasks(older_than)
        })
        .await
    }

    async fn pending_tasks_for(&self, agent: AgentId, limit: usize) -> CoreResult<Vec<Task>> {
        self.guard("pending_tasks_for", || self.inner.pending_tasks_for(agent, limit))
            .await
    }

    async fn check_rate_limit(
        &self,
        agent: AgentId,
        operation: &str,
        limit_per_hour: u32,
    ) -> CoreResult<RateLimitDecision> {
        self.guard("check_rate_limit", || {
            self.inner.check_rate_limit(agent, operation, limit_per_hour)
        })
        .await
    }

    async fn purge_rate_limits(&self, older_than: DateTime<Utc>) -> CoreResult<u64> {
        self.guard("purge_rate_limits", || self.inner.purge_rate_limits(older_than))
            .await
    }

    async fn publish_notification(&self, notification: NewNotification) -> CoreResult<Uuid> {
        // Journalable. While degraded the caller gets a provisional id; the
        // durable row is created at drain time.
        if self.is_degraded().await {
            self.shared
                .lock()
                .await
                .journal
                .push_back(JournalOp::Notification(notification));
            return Ok(Uuid::new_v4());
        }
        match self
            .retry
            .execute(|| self.inner.publish_notification(notification.clone()))
            .await
        {
            Ok(id) => {
                self.note_success().await;
                Ok(id)
            }
            Err(err) if err.is_transient() => {
                if self.note_failure().await == StoreMode::Degraded {
                    self.shared
                        .lock()
                        .await
                        .journal
                        .push_back(JournalOp::Notification(notification));
                    Ok(Uuid::new_v4())
                } else {
                    Err(err)
                }
            }
            Err(err) => Err(err),
        }
    }

    async fn sweep_read_notifications(&self, older_than: DateTime<Utc>) -> CoreResult<u64> {
        self.guard("sweep_read_notifications", || {
            self.inner.sweep_read_notifications(older_than)
        })
        .await
    }

    async fn next_cycle_number(&self) -> CoreResult<u64> {
        if self.is_degraded().await {
            let mut shared = self.shared.lock().await;
            shared.last_cycle_number += 1;
            return Ok(shared.last_cycle_number);
        }
        let n = self
            .guard("next_cycle_number", || self.inner.next_cycle_number())
            .await?;
        let mut shared = self.shared.lock().await;
        shared.last_cycle_number = shared.last_cycle_number.max(n.saturating_sub(1));
        Ok(n)
    }

    async fn record_cycle(&self, cycle: &HeartbeatCycle) -> CoreResult<()> {
        {
            let mut shared = self.shared.lock().await;
            shared.last_cycle_number = shared.last_cycle_number.max(cycle.cycle_number);
        }
        self.guard_journal(JournalOp::Cycle(cycle.clone()), || {
            self.inner.record_cycle(cycle)
        })
        .await
    }

    async fn finalize_cycle(&self, cycle: &HeartbeatCycle) -> CoreResult<()> {
        self.guard_journal(JournalOp::FinalizeCycle(cycle.clone()), || {
            self.inner.finalize_cycle(cycle)
        })
        .await
    }

    async fn record_result(&self, cycle_number: u64, result: &TaskResult) -> CoreResult<()> {
        self.guard_journal(
            JournalOp::Result {
                cycle_number,
                result: result.clone(),
            },
            || self.inner.record_result(cycle_number, result),
        )
        .await
    }

    async fn upsert_agent_key(&self, agent: AgentId, key_material: &[u8]) -> CoreResult<AgentKey> {
        self.guard("upsert_agent_key", || {
            self.inner.upsert_agent_key(agent, key_material)
        })
        .await
    }

    async fn active_key(&self, agent: AgentId) -> CoreResult<Option<AgentKey>> {
        self.guard("active_key", || self.inner.active_key(agent)).await
    }

    async fn purge_retired_keys(&self, now: DateTime<Utc>) -> CoreResult<u64> {
        self.guard("purge_retired_keys", || self.inner.purge_retired_keys(now))
            .await
    }

    async fn active_failover(&self) -> CoreResult<Option<FailoverEvent>> {
        self.guard("active_failover", || self.inner.active_failover()).await
    }

    async fn open_failover(&self, event: FailoverEvent) -> CoreResult<FailoverEvent> {
        self.guard("open_failover", || self.inner.open_failover(event.clone()))
            .await
    }

    async fn resolve_failover(&self, id: Uuid, at: DateTime<Utc>) -> CoreResult<()> {
        self.guard("resolve_failover", || self.inner.resolve_failover(id, at))
            .await
    }

    async fn increment_failover_routed(&self, id: Uuid) -> CoreResult<()> {
        self.guard("increment_failover_routed", || {
            self.inner.increment_failover_routed(id)
        })
        .await
    }

    async fn score_sample(&self, tier: MemoryTier, limit: usize) -> CoreResult<Vec<MemoryEntry>> {
        self.guard("score_sample", || self.inner.score_sample(tier, limit))
            .await
    }

    async fn get_memory(&self, id: Uuid) -> CoreResult<Option<MemoryEntry>> {
        self.guard("get_memory", || self.inner.get_memory(id)).await
    }

    async fn tier_counts(&self) -> CoreResult<HashMap<MemoryTier, u64>> {
        self.guard("tier_counts", || self.inner.tier_counts()).await
    }

    async fn tier_token_totals(&self) -> CoreResult<HashMap<MemoryTier, u64>> {
        self.guard("tier_token_totals", || self.inner.tier_token_totals())
            .await
    }

    async fn record_score(
        &self,
        node: Uuid,
        score: f64,
        action: CurationAction,
        at: DateTime<Utc>,
    ) -> CoreResult<()> {
        self.guard("record_score", || self.inner.record_score(node, score, action, at))
            .await
    }

    async fn set_tier(&self, node: Uuid, tier: MemoryTier) -> CoreResult<()> {
        self.guard("set_tier", || self.inner.set_tier(node, tier)).await
    }

    async fn tombstone(
        &self,
        node: Uuid,
        reason: &str,
        purge_after: DateTime<Utc>,
    ) -> CoreResult<()> {
        self.guard("tombstone", || self.inner.tombstone(node, reason, purge_after))
            .await
    }

    async fn merge_into(&self, src: Uuid, dst: Uuid) -> CoreResult<()> {
        self.guard("merge_into", || self.inner.merge_into(src, dst)).await
    }

    async fn purge_tombstoned(&self, older_than: DateTime<Utc>) -> CoreResult<u64> {
        self.guard("purge_tombstoned", || self.inner.purge_tombstoned(older_than))
            .await
    }

    async fn purge_node(&self, node: Uuid) -> CoreResult<()> {
        self.guard("purge_node", || self.inner.purge_node(node)).await
    }

    async fn delete_orphans(&self) -> CoreResult<u64> {
        self.guard("delete_orphans", || self.inner.delete_orphans()).await
    }

    async fn decay_stale_confidence(
        &self,
        not_accessed_since: DateTime<Utc>,
        factor: f64,
    ) -> CoreResult<u64> {
        self.guard("decay_stale_confidence", || {
            self.inner.decay_stale_confidence(not_accessed_since, factor)
        })
        .await
    }

    async fn expire_session_contexts(&self, older_than: DateTime<Utc>) -> CoreResult<u64> {
        self.guard("expire_session_contexts", || {
            self.inner.expire_session_contexts(older_than)
        })
        .await
    }

    async fn dedup_candidates(
        &self,
        min_similarity: f64,
        limit: usize,
    ) -> CoreResult<Vec<(Uuid, Uuid)>> {
        self.guard("dedup_candidates", || {
            self.inner.dedup_candidates(min_similarity, limit)
        })
        .await
    }

    async fn ping(&self) -> CoreResult<()> {
        self.guard("ping", || self.inner.ping()).await
    }

    async fn node_counts(&self) -> CoreResult<GraphCounts> {
        self.guard("node_counts", || self.inner.node_counts()).await
    }

    async fn ensure_schema(&self) -> CoreResult<()> {
        self.guard("ensure_schema", || self.inner.ensure_schema()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::MemoryGraphStore;
    use crate::domain::models::NotificationKind;

    fn fast_policies() -> (RetryPolicy, FailurePolicy) {
        (
            RetryPolicy::new(0, 1, 1),
            FailurePolicy {
                failure_threshold: 5,
                failure_window: chrono::Duration::seconds(60),
                probe_interval: std::time::Duration::from_millis(5),
                recovery_threshold: 3,
            },
        )
    }

    async fn degraded_store() -> (Arc<MemoryGraphStore>, ResilientStore<MemoryGraphStore>) {
        let inner = Arc::new(MemoryGraphStore::new());
        inner.ensure_schema().await.unwrap();
        let (retry, policy) = fast_policies();
        let store = ResilientStore::with_policies(inner.clone(), retry, policy);

        inner.set_failing(true);
        for _ in 0..5 {
            let _ = store.ping().await;
        }
        assert_eq!(store.mode().await, StoreMode::Degraded);
        (inner, store)
    }

    #[tokio::test]
    async fn test_five_failures_enter_degraded() {
        let inner = Arc::new(MemoryGraphStore::new());
        let (retry, policy) = fast_policies();
        let store = ResilientStore::with_policies(inner.clone(), retry, policy);

        inner.set_failing(true);
        for _ in 0..4 {
            let _ = store.ping().await;
            assert_eq!(store.mode().await, StoreMode::Healthy);
        }
        let _ = store.ping().await;
        assert_eq!(store.mode().await, StoreMode::Degraded);
    }

    #[tokio::test]
    async fn test_degraded_journals_appendable_writes() {
        let (_inner, store) = degraded_store().await;

        store
            .update_heartbeat_at(AgentId::Main, HeartbeatKind::Functional, Utc::now())
            .await
            .unwrap();
        store
            .record_result(
                1,
                &TaskResult::success(AgentId::Ops, "job", Utc::now(), Utc::now(), "ok", 1),
            )
            .await
            .unwrap();
        store
            .publish_notification(NewNotification::new(
                AgentId::Ops,
                NotificationKind::Info,
                "queued",
            ))
            .await
            .unwrap();

        assert_eq!(store.journal_len().await, 3);
    }

    #[tokio::test]
    async fn test_degraded_rejects_conditional_writes() {
        let (_inner, store) = degraded_store().await;

        let err = store.claim_task(Uuid::new_v4(), AgentId::Ops).await.unwrap_err();
        assert!(matches!(err, CoreError::Degraded(_)));

        let err = store.score_sample(MemoryTier::Hot, 10).await.unwrap_err();
        assert!(matches!(err, CoreError::Degraded(_)));
    }

    #[tokio::test]
    async fn test_degraded_serves_cached_agents() {
        let inner = Arc::new(MemoryGraphStore::new());
        inner.ensure_schema().await.unwrap();
        let (retry, policy) = fast_policies();
        let store = ResilientStore::with_policies(inner.clone(), retry, policy);

        // Warm the cache while healthy.
        store.list_agents().await.unwrap();

        inner.set_failing(true);
        for _ in 0..5 {
            let _ = store.ping().await;
        }
        assert_eq!(store.mode().await, StoreMode::Degraded);

        let agents = store.list_agents().await.unwrap();
        assert_eq!(agents.len(), 6);
        let main = store.get_agent(AgentId::Main).await.unwrap();
        assert_eq!(main.id, AgentId::Main);
    }

    #[tokio::test]
    async fn test_recovery_drains_journal_then_exits() {
        let (inner, store) = degraded_store().await;

        let at = Utc::now() + chrono::Duration::seconds(10);
        store
            .update_heartbeat_at(AgentId::Main, HeartbeatKind::Functional, at)
            .await
            .unwrap();
        assert_eq!(store.journal_len().await, 1);

        inner.set_failing(false);

        // Streak of 3 (policy above) with a drained journal exits degraded.
        assert_eq!(store.probe_once().await, StoreMode::Degraded);
        assert_eq!(store.journal_len().await, 0, "journal drains on first good probe");
        assert_eq!(store.probe_once().await, StoreMode::Degraded);
        assert_eq!(store.probe_once().await, StoreMode::Healthy);

        // The journalled heartbeat reached the inner store.
        let agent = inner.get_agent(AgentId::Main).await.unwrap();
        assert_eq!(agent.last_heartbeat, at);
    }

    #[tokio::test]
    async fn test_degraded_cycle_numbers_keep_increasing() {
        let inner = Arc::new(MemoryGraphStore::new());
        inner.ensure_schema().await.unwrap();
        let cycle = HeartbeatCycle::open(10, Utc::now());
        inner.record_cycle(&cycle).await.unwrap();

        let (retry, policy) = fast_policies();
        let store = ResilientStore::with_policies(inner.clone(), retry, policy);
        assert_eq!(store.next_cycle_number().await.unwrap(), 11);

        inner.set_failing(true);
        for _ in 0..5 {
            let _ = store.ping().await;
        }

        assert_eq!(store.next_cycle_number().await.unwrap(), 11);
        assert_eq!(store.next_cycle_number().await.unwrap(), 12);
    }
}
