//! In-process graph store.
//!
//! A complete [`GraphStore`] over plain maps behind one mutex, so every
//! operation is atomic by construction. This is the store the unit and
//! property tests run against; the production deployment uses the bolt
//! adapter with the same contract.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::models::{
    Agent, AgentId, AgentKey, AgentStatus, ClaimOutcome, CurationAction, FailoverEvent,
    FailoverStatus, HeartbeatCycle, HeartbeatKind, MemoryEntry, MemoryLabel, MemoryTier,
    NewNotification, NewTask, Notification, RateLimitDecision, RateLimitKey, Task, TaskResult,
    TaskStatus,
};
use crate::domain::ports::{GraphCounts, GraphStore};
use crate::services::curation::mvs;

#[derive(Default)]
struct State {
    agents: HashMap<AgentId, Agent>,
    tasks: HashMap<Uuid, Task>,
    archived_tasks: HashSet<Uuid>,
    rate: HashMap<RateLimitKey, (u32, DateTime<Utc>)>,
    notifications: HashMap<Uuid, Notification>,
    cycles: BTreeMap<u64, HeartbeatCycle>,
    results: HashMap<u64, Vec<TaskResult>>,
    keys: HashMap<AgentId, Vec<AgentKey>>,
    failovers: HashMap<Uuid, FailoverEvent>,
    memories: HashMap<Uuid, MemoryEntry>,
    edges: Vec<(Uuid, String, Uuid)>,
}

/// Map-backed graph store.
#[derive(Default)]
pub struct MemoryGraphStore {
    state: Mutex<State>,
    fail_mode: AtomicBool,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every call fails with `GraphUnavailable`. Used to drive
    /// the resilient wrapper through its degraded transition in tests.
    pub fn set_failing(&self, failing: bool) {
        self.fail_mode.store(failing, Ordering::SeqCst);
    }

    fn check_failing(&self) -> CoreResult<()> {
        if self.fail_mode.load(Ordering::SeqCst) {
            return Err(CoreError::GraphUnavailable("injected failure".to_string()));
        }
        Ok(())
    }

    /// Test helper: insert a memory node directly.
    pub async fn seed_memory(&self, entry: MemoryEntry) {
        self.state.lock().await.memories.insert(entry.id, entry);
    }

    /// Test helper: read a memory node back.
    pub async fn memory(&self, id: Uuid) -> Option<MemoryEntry> {
        self.state.lock().await.memories.get(&id).cloned()
    }

    /// Test helper: notifications queued for one agent.
    pub async fn notifications_for(&self, agent: AgentId) -> Vec<Notification> {
        self.state
            .lock()
            .await
            .notifications
            .values()
            .filter(|n| n.agent == agent)
            .cloned()
            .collect()
    }

    /// Test helper: mark a notification read.
    pub async fn mark_read(&self, id: Uuid) {
        if let Some(n) = self.state.lock().await.notifications.get_mut(&id) {
            n.read = true;
        }
    }

    /// Test helper: results recorded for a cycle.
    pub async fn results_for(&self, cycle_number: u64) -> Vec<TaskResult> {
        self.state
            .lock()
            .await
            .results
            .get(&cycle_number)
            .cloned()
            .unwrap_or_default()
    }

    /// Test helper: a cycle row by number.
    pub async fn cycle(&self, cycle_number: u64) -> Option<HeartbeatCycle> {
        self.state.lock().await.cycles.get(&cycle_number).cloned()
    }

    /// Test helper: whether a task has been archived.
    pub async fn is_archived(&self, id: Uuid) -> bool {
        self.state.lock().await.archived_tasks.contains(&id)
    }

    /// Test helper: edge list snapshot.
    pub async fn edges(&self) -> Vec<(Uuid, String, Uuid)> {
        self.state.lock().await.edges.clone()
    }

    /// Test helper: add a relationship between two nodes.
    pub async fn link(&self, src: Uuid, rel: impl Into<String>, dst: Uuid) {
        self.state.lock().await.edges.push((src, rel.into(), dst));
    }
}

fn hash_key_material(material: &[u8]) -> String {
    hex::encode(Sha256::digest(material))
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| f64::from(*x) * f64::from(*y)).sum();
    let norm_a: f64 = a.iter().map(|x| f64::from(*x).powi(2)).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| f64::from(*x).powi(2)).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn get_agent(&self, id: AgentId) -> CoreResult<Agent> {
        self.check_failing()?;
        self.state
            .lock()
            .await
            .agents
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("agent {id}")))
    }

    async fn list_agents(&self) -> CoreResult<Vec<Agent>> {
        self.check_failing()?;
        let state = self.state.lock().await;
        let mut agents: Vec<Agent> = state.agents.values().cloned().collect();
        agents.sort_by_key(|a| a.id.as_str());
        Ok(agents)
    }

    async fn update_heartbeat_at(
        &self,
        id: AgentId,
        kind: HeartbeatKind,
        at: DateTime<Utc>,
    ) -> CoreResult<()> {
        self.check_failing()?;
        let mut state = self.state.lock().await;
        let agent = state
            .agents
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("agent {id}")))?;
        match kind {
            HeartbeatKind::Infra => {
                if at > agent.infra_heartbeat {
                    agent.infra_heartbeat = at;
                }
            }
            HeartbeatKind::Functional => {
                if at > agent.last_heartbeat {
                    agent.last_heartbeat = at;
                }
            }
        }
        Ok(())
    }

    async fn update_infra_heartbeats_at(
        &self,
        ids: &[AgentId],
        at: DateTime<Utc>,
    ) -> CoreResult<()> {
        self.check_failing()?;
        let mut state = self.state.lock().await;
        for id in ids {
            if let Some(agent) = state.agents.get_mut(id) {
                if at > agent.infra_heartbeat {
                    agent.infra_heartbeat = at;
                }
            }
        }
        Ok(())
    }

    async fn set_agent_status(&self, id: AgentId, status: AgentStatus) -> CoreResult<()> {
        self.check_failing()?;
        let mut state = self.state.lock().await;
        let agent = state
            .agents
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("agent {id}")))?;
        agent.status = status;
        Ok(())
    }

    async fn set_current_task(&self, id: AgentId, task: Option<Uuid>) -> CoreResult<()> {
        self.check_failing()?;
        let mut state = self.state.lock().await;
        let agent = state
            .agents
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("agent {id}")))?;
        agent.current_task = task;
        Ok(())
    }

    async fn create_task(&self, new: NewTask) -> CoreResult<Uuid> {
        self.check_failing()?;
        let id = Uuid::new_v4();
        let task = new.into_task(id, Utc::now());
        self.state.lock().await.tasks.insert(id, task);
        Ok(id)
    }

    async fn get_task(&self, id: Uuid) -> CoreResult<Option<Task>> {
        self.check_failing()?;
        Ok(self.state.lock().await.tasks.get(&id).cloned())
    }

    async fn claim_task(&self, id: Uuid, agent: AgentId) -> CoreResult<ClaimOutcome> {
        self.check_failing()?;
        let mut state = self.state.lock().await;
        let Some(task) = state.tasks.get_mut(&id) else {
            return Ok(ClaimOutcome::NotFound);
        };

        let claimable = task.status == TaskStatus::Pending
            && task.assigned_to.is_none_or(|a| a == agent);
        if !claimable {
            let owner = task.assigned_to.unwrap_or(task.delegated_by);
            return Ok(ClaimOutcome::AlreadyClaimed(owner));
        }

        task.status = TaskStatus::InProgress;
        task.assigned_to = Some(agent);
        task.claimed_at = Some(Utc::now());
        if let Some(row) = state.agents.get_mut(&agent) {
            row.current_task = Some(id);
        }
        Ok(ClaimOutcome::Claimed)
    }

    async fn complete_task(
        &self,
        id: Uuid,
        agent: AgentId,
        results: serde_json::Value,
    ) -> CoreResult<()> {
        self.check_failing()?;
        let mut state = self.state.lock().await;
        let task = state
            .tasks
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("task {id}")))?;
        if task.status != TaskStatus::InProgress || task.assigned_to != Some(agent) {
            return Err(CoreError::StaleOwnership { task_id: id, agent });
        }
        task.status = TaskStatus::Completed;
        task.completed_at = Some(Utc::now());
        task.results = Some(results);
        if let Some(row) = state.agents.get_mut(&agent) {
            if row.current_task == Some(id) {
                row.current_task = None;
            }
        }
        Ok(())
    }

    async fn fail_task(&self, id: Uuid, agent: AgentId, error: &str) -> CoreResult<()> {
        self.check_failing()?;
        let mut state = self.state.lock().await;
        let task = state
            .tasks
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("task {id}")))?;
        if task.status != TaskStatus::InProgress || task.assigned_to != Some(agent) {
            return Err(CoreError::StaleOwnership { task_id: id, agent });
        }
        task.status = TaskStatus::Failed;
        task.completed_at = Some(Utc::now());
        task.error_message = Some(error.to_string());
        if let Some(row) = state.agents.get_mut(&agent) {
            if row.current_task == Some(id) {
                row.current_task = None;
            }
        }
        Ok(())
    }

    async fn archive_terminal_tasks(&self, older_than: DateTime<Utc>) -> CoreResult<u64> {
        self.check_failing()?;
        let mut state = self.state.lock().await;
        let candidates: Vec<Uuid> = state
            .tasks
            .values()
            .filter(|t| {
                t.status.is_terminal()
                    && t.completed_at.is_some_and(|c| c < older_than)
                    && !state.archived_tasks.contains(&t.id)
            })
            .map(|t| t.id)
            .collect();
        let count = candidates.len() as u64;
        state.archived_tasks.extend(candidates);
        Ok(count)
    }

    async fn pending_tasks_for(&self, agent: AgentId, limit: usize) -> CoreResult<Vec<Task>> {
        self.check_failing()?;
        let state = self.state.lock().await;
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::Pending && t.assigned_to.is_none_or(|a| a == agent)
            })
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks.truncate(limit);
        Ok(tasks)
    }

    async fn check_rate_limit(
        &self,
        agent: AgentId,
        operation: &str,
        limit_per_hour: u32,
    ) -> CoreResult<RateLimitDecision> {
        self.check_failing()?;
        let now = Utc::now();
        let key = RateLimitKey::at(agent, operation, now);
        let mut state = self.state.lock().await;
        let entry = state.rate.entry(key).or_insert((0, now));
        if entry.0 >= limit_per_hour {
            return Ok(RateLimitDecision::Denied(entry.0));
        }
        entry.0 += 1;
        entry.1 = now;
        Ok(RateLimitDecision::Allowed)
    }

    async fn purge_rate_limits(&self, older_than: DateTime<Utc>) -> CoreResult<u64> {
        self.check_failing()?;
        let mut state = self.state.lock().await;
        let before = state.rate.len();
        state.rate.retain(|_, (_, updated)| *updated >= older_than);
        Ok((before - state.rate.len()) as u64)
    }

    async fn publish_notification(&self, notification: NewNotification) -> CoreResult<Uuid> {
        self.check_failing()?;
        let id = Uuid::new_v4();
        let row = Notification {
            id,
            agent: notification.agent,
            kind: notification.kind,
            summary: notification.summary,
            task_id: notification.task_id,
            read: false,
            created_at: Utc::now(),
        };
        self.state.lock().await.notifications.insert(id, row);
        Ok(id)
    }

    async fn sweep_read_notifications(&self, older_than: DateTime<Utc>) -> CoreResult<u64> {
        self.check_failing()?;
        let mut state = self.state.lock().await;
        let before = state.notifications.len();
        state
            .notifications
            .retain(|_, n| !(n.read && n.created_at < older_than));
        Ok((before - state.notifications.len()) as u64)
    }

    async fn next_cycle_number(&self) -> CoreResult<u64> {
        self.check_failing()?;
        let state = self.state.lock().await;
        Ok(state.cycles.keys().next_back().map_or(1, |max| max + 1))
    }

    async fn record_cycle(&self, cycle: &HeartbeatCycle) -> CoreResult<()> {
        self.check_failing()?;
        self.state
            .lock()
            .await
            .cycles
            .insert(cycle.cycle_number, cycle.clone());
        Ok(())
    }

    async fn finalize_cycle(&self, cycle: &HeartbeatCycle) -> CoreResult<()> {
        self.check_failing()?;
        self.state
            .lock()
            .await
            .cycles
            .insert(cycle.cycle_number, cycle.clone());
        Ok(())
    }

    async fn record_result(&self, cycle_number: u64, result: &TaskResult) -> CoreResult<()> {
        self.check_failing()?;
        self.state
            .lock()
            .await
            .results
            .entry(cycle_number)
            .or_default()
            .push(result.clone());
        Ok(())
    }

    async fn upsert_agent_key(&self, agent: AgentId, key_material: &[u8]) -> CoreResult<AgentKey> {
        self.check_failing()?;
        let now = Utc::now();
        let key = AgentKey::issue(agent, hash_key_material(key_material), now);
        let mut state = self.state.lock().await;
        let keys = state.keys.entry(agent).or_default();
        for prior in keys.iter_mut() {
            prior.is_active = false;
        }
        keys.push(key.clone());
        Ok(key)
    }

    async fn active_key(&self, agent: AgentId) -> CoreResult<Option<AgentKey>> {
        self.check_failing()?;
        let now = Utc::now();
        Ok(self
            .state
            .lock()
            .await
            .keys
            .get(&agent)
            .and_then(|keys| {
                keys.iter()
                    .find(|k| k.is_active && !k.is_expired(now))
                    .cloned()
            }))
    }

    async fn purge_retired_keys(&self, now: DateTime<Utc>) -> CoreResult<u64> {
        self.check_failing()?;
        let mut state = self.state.lock().await;
        let mut purged = 0;
        for keys in state.keys.values_mut() {
            let before = keys.len();
            keys.retain(|k| !k.audit_window_elapsed(now));
            purged += (before - keys.len()) as u64;
        }
        Ok(purged)
    }

    async fn active_failover(&self) -> CoreResult<Option<FailoverEvent>> {
        self.check_failing()?;
        Ok(self
            .state
            .lock()
            .await
            .failovers
            .values()
            .find(|f| f.status == FailoverStatus::Active)
            .cloned())
    }

    async fn open_failover(&self, event: FailoverEvent) -> CoreResult<FailoverEvent> {
        self.check_failing()?;
        let mut state = self.state.lock().await;
        if let Some(active) = state
            .failovers
            .values()
            .find(|f| f.status == FailoverStatus::Active)
        {
            return Ok(active.clone());
        }
        state.failovers.insert(event.id, event.clone());
        Ok(event)
    }

    async fn resolve_failover(&self, id: Uuid, at: DateTime<Utc>) -> CoreResult<()> {
        self.check_failing()?;
        let mut state = self.state.lock().await;
        let event = state
            .failovers
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("failover {id}")))?;
        event.resolve(at);
        Ok(())
    }

    async fn increment_failover_routed(&self, id: Uuid) -> CoreResult<()> {
        self.check_failing()?;
        let mut state = self.state.lock().await;
        let event = state
            .failovers
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("failover {id}")))?;
        event.messages_routed += 1;
        Ok(())
    }

    async fn score_sample(&self, tier: MemoryTier, limit: usize) -> CoreResult<Vec<MemoryEntry>> {
        self.check_failing()?;
        let state = self.state.lock().await;
        let mut sample: Vec<MemoryEntry> = state
            .memories
            .values()
            .filter(|m| m.tier == tier && !m.tombstone)
            .cloned()
            .collect();
        sample.sort_by_key(|m| m.last_curated_at.unwrap_or(m.created_at));
        sample.truncate(limit);
        Ok(sample)
    }

    async fn get_memory(&self, id: Uuid) -> CoreResult<Option<MemoryEntry>> {
        self.check_failing()?;
        Ok(self.state.lock().await.memories.get(&id).cloned())
    }

    async fn tier_counts(&self) -> CoreResult<HashMap<MemoryTier, u64>> {
        self.check_failing()?;
        let state = self.state.lock().await;
        let mut counts = HashMap::new();
        for m in state.memories.values().filter(|m| !m.tombstone) {
            *counts.entry(m.tier).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn tier_token_totals(&self) -> CoreResult<HashMap<MemoryTier, u64>> {
        self.check_failing()?;
        let state = self.state.lock().await;
        let mut totals = HashMap::new();
        for m in state.memories.values().filter(|m| !m.tombstone) {
            *totals.entry(m.tier).or_insert(0) += m.token_count;
        }
        Ok(totals)
    }

    async fn record_score(
        &self,
        node: Uuid,
        score: f64,
        action: CurationAction,
        at: DateTime<Utc>,
    ) -> CoreResult<()> {
        self.check_failing()?;
        let mut state = self.state.lock().await;
        let entry = state
            .memories
            .get_mut(&node)
            .ok_or_else(|| CoreError::NotFound(format!("memory {node}")))?;
        entry.mvs_score = score;
        entry.curation_action = Some(action);
        entry.last_curated_at = Some(at);
        Ok(())
    }

    async fn set_tier(&self, node: Uuid, tier: MemoryTier) -> CoreResult<()> {
        self.check_failing()?;
        let mut state = self.state.lock().await;
        let entry = state
            .memories
            .get_mut(&node)
            .ok_or_else(|| CoreError::NotFound(format!("memory {node}")))?;
        entry.tier = tier;
        Ok(())
    }

    async fn tombstone(
        &self,
        node: Uuid,
        _reason: &str,
        purge_after: DateTime<Utc>,
    ) -> CoreResult<()> {
        self.check_failing()?;
        let mut state = self.state.lock().await;
        let entry = state
            .memories
            .get_mut(&node)
            .ok_or_else(|| CoreError::NotFound(format!("memory {node}")))?;
        entry.tombstone = true;
        entry.deleted_at = Some(purge_after);
        Ok(())
    }

    async fn merge_into(&self, src: Uuid, dst: Uuid) -> CoreResult<()> {
        self.check_failing()?;
        let mut state = self.state.lock().await;
        let src_score = state
            .memories
            .get(&src)
            .ok_or_else(|| CoreError::NotFound(format!("memory {src}")))?
            .mvs_score;
        let dst_score = state
            .memories
            .get(&dst)
            .ok_or_else(|| CoreError::NotFound(format!("memory {dst}")))?
            .mvs_score;
        if dst_score < src_score {
            return Err(CoreError::InvalidInput(format!(
                "merge target {dst} scores below source {src}"
            )));
        }

        // Re-point src's relationships at dst, then link and tombstone src.
        let mut moved = 0_u32;
        for edge in &mut state.edges {
            if edge.0 == src && edge.2 != dst {
                edge.0 = dst;
                moved += 1;
            } else if edge.2 == src && edge.0 != dst {
                edge.2 = dst;
                moved += 1;
            }
        }
        state.edges.push((src, "MERGED_INTO".to_string(), dst));

        if let Some(dst_entry) = state.memories.get_mut(&dst) {
            dst_entry.relationship_count += moved;
        }
        let purge_after = Utc::now() + chrono::Duration::days(mvs::PRUNE_GRACE_DAYS);
        if let Some(src_entry) = state.memories.get_mut(&src) {
            src_entry.tombstone = true;
            src_entry.deleted_at = Some(purge_after);
        }
        Ok(())
    }

    async fn purge_tombstoned(&self, older_than: DateTime<Utc>) -> CoreResult<u64> {
        self.check_failing()?;
        let mut state = self.state.lock().await;
        let before = state.memories.len();
        state
            .memories
            .retain(|_, m| !(m.tombstone && m.deleted_at.is_some_and(|d| d <= older_than)));
        Ok((before - state.memories.len()) as u64)
    }

    async fn purge_node(&self, node: Uuid) -> CoreResult<()> {
        self.check_failing()?;
        let mut state = self.state.lock().await;
        state.memories.remove(&node);
        state.edges.retain(|(s, _, d)| *s != node && *d != node);
        Ok(())
    }

    async fn delete_orphans(&self) -> CoreResult<u64> {
        self.check_failing()?;
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let linked: HashSet<Uuid> = state
            .edges
            .iter()
            .flat_map(|(s, _, d)| [*s, *d])
            .collect();
        let orphans: Vec<Uuid> = state
            .memories
            .values()
            .filter(|m| {
                !m.tombstone
                    && m.relationship_count == 0
                    && !linked.contains(&m.id)
                    && !mvs::is_protected(m, now)
            })
            .map(|m| m.id)
            .collect();
        for id in &orphans {
            state.memories.remove(id);
        }
        Ok(orphans.len() as u64)
    }

    async fn decay_stale_confidence(
        &self,
        not_accessed_since: DateTime<Utc>,
        factor: f64,
    ) -> CoreResult<u64> {
        self.check_failing()?;
        let mut state = self.state.lock().await;
        let mut touched = 0;
        for m in state.memories.values_mut() {
            if m.last_accessed < not_accessed_since {
                if let Some(q) = m.quality {
                    m.quality = Some(q * factor);
                    touched += 1;
                }
            }
        }
        Ok(touched)
    }

    async fn expire_session_contexts(&self, older_than: DateTime<Utc>) -> CoreResult<u64> {
        self.check_failing()?;
        let mut state = self.state.lock().await;
        let before = state.memories.len();
        state
            .memories
            .retain(|_, m| !(m.label == MemoryLabel::SessionContext && m.created_at < older_than));
        Ok((before - state.memories.len()) as u64)
    }

    async fn dedup_candidates(
        &self,
        min_similarity: f64,
        limit: usize,
    ) -> CoreResult<Vec<(Uuid, Uuid)>> {
        self.check_failing()?;
        let state = self.state.lock().await;
        let embedded: Vec<&MemoryEntry> = state
            .memories
            .values()
            .filter(|m| !m.tombstone && m.embedding.is_some())
            .collect();

        let mut pairs = Vec::new();
        for (i, a) in embedded.iter().enumerate() {
            for b in embedded.iter().skip(i + 1) {
                let sim = cosine_similarity(
                    a.embedding.as_deref().unwrap_or_default(),
                    b.embedding.as_deref().unwrap_or_default(),
                );
                if sim >= min_similarity {
                    let (lower, higher) = if a.mvs_score <= b.mvs_score {
                        (a.id, b.id)
                    } else {
                        (b.id, a.id)
                    };
                    pairs.push((lower, higher));
                    if pairs.len() >= limit {
                        return Ok(pairs);
                    }
                }
            }
        }
        Ok(pairs)
    }

    async fn ping(&self) -> CoreResult<()> {
        self.check_failing()
    }

    async fn node_counts(&self) -> CoreResult<GraphCounts> {
        self.check_failing()?;
        let state = self.state.lock().await;
        Ok(GraphCounts {
            agents: state.agents.len() as u64,
            tasks: state.tasks.len() as u64,
            memory_entries: state.memories.len() as u64,
            cycles: state.cycles.len() as u64,
            notifications: state.notifications.len() as u64,
        })
    }

    async fn ensure_schema(&self) -> CoreResult<()> {
        self.check_failing()?;
        let now = Utc::now();
        let mut state = self.state.lock().await;
        for id in AgentId::ALL {
            state.agents.entry(id).or_insert_with(|| Agent::seed(id, now));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{NotificationKind, TaskType};

    async fn seeded() -> MemoryGraphStore {
        let store = MemoryGraphStore::new();
        store.ensure_schema().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_schema_seeds_six_agents() {
        let store = seeded().await;
        assert_eq!(store.list_agents().await.unwrap().len(), 6);
        // Idempotent.
        store.ensure_schema().await.unwrap();
        assert_eq!(store.list_agents().await.unwrap().len(), 6);
    }

    #[tokio::test]
    async fn test_claim_happy_path() {
        let store = seeded().await;
        let id = store
            .create_task(NewTask::new(TaskType::Research, "dig"))
            .await
            .unwrap();

        let outcome = store.claim_task(id, AgentId::Researcher).await.unwrap();
        assert_eq!(outcome, ClaimOutcome::Claimed);

        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.assigned_to, Some(AgentId::Researcher));
        assert!(task.claimed_at.is_some());

        let agent = store.get_agent(AgentId::Researcher).await.unwrap();
        assert_eq!(agent.current_task, Some(id));
    }

    #[tokio::test]
    async fn test_second_claim_reports_winner() {
        let store = seeded().await;
        let id = store
            .create_task(NewTask::new(TaskType::Research, "dig"))
            .await
            .unwrap();

        assert_eq!(
            store.claim_task(id, AgentId::Researcher).await.unwrap(),
            ClaimOutcome::Claimed
        );
        assert_eq!(
            store.claim_task(id, AgentId::Writer).await.unwrap(),
            ClaimOutcome::AlreadyClaimed(AgentId::Researcher)
        );
    }

    #[tokio::test]
    async fn test_claim_respects_preassignment() {
        let store = seeded().await;
        let id = store
            .create_task(
                NewTask::new(TaskType::Writing, "draft").with_assignee(AgentId::Writer),
            )
            .await
            .unwrap();

        assert_eq!(
            store.claim_task(id, AgentId::Researcher).await.unwrap(),
            ClaimOutcome::AlreadyClaimed(AgentId::Writer)
        );
        assert_eq!(
            store.claim_task(id, AgentId::Writer).await.unwrap(),
            ClaimOutcome::Claimed
        );
    }

    #[tokio::test]
    async fn test_claim_missing_task() {
        let store = seeded().await;
        assert_eq!(
            store.claim_task(Uuid::new_v4(), AgentId::Ops).await.unwrap(),
            ClaimOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn test_complete_requires_ownership() {
        let store = seeded().await;
        let id = store
            .create_task(NewTask::new(TaskType::Research, "dig"))
            .await
            .unwrap();
        store.claim_task(id, AgentId::Researcher).await.unwrap();

        let err = store
            .complete_task(id, AgentId::Writer, serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::StaleOwnership { .. }));

        store
            .complete_task(id, AgentId::Researcher, serde_json::json!({"ok": true}))
            .await
            .unwrap();
        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);

        // Terminal tasks accept no further transitions.
        let err = store
            .fail_task(id, AgentId::Researcher, "late")
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::StaleOwnership { .. }));
    }

    #[tokio::test]
    async fn test_heartbeats_are_monotonic() {
        let store = seeded().await;
        let later = Utc::now() + chrono::Duration::seconds(30);
        let earlier = Utc::now() - chrono::Duration::seconds(30);

        store
            .update_heartbeat_at(AgentId::Main, HeartbeatKind::Functional, later)
            .await
            .unwrap();
        store
            .update_heartbeat_at(AgentId::Main, HeartbeatKind::Functional, earlier)
            .await
            .unwrap();

        let agent = store.get_agent(AgentId::Main).await.unwrap();
        assert_eq!(agent.last_heartbeat, later);
    }

    #[tokio::test]
    async fn test_rate_limit_denies_at_cap() {
        let store = seeded().await;
        for _ in 0..3 {
            assert!(store
                .check_rate_limit(AgentId::Main, "delegate", 3)
                .await
                .unwrap()
                .is_allowed());
        }
        let decision = store
            .check_rate_limit(AgentId::Main, "delegate", 3)
            .await
            .unwrap();
        assert_eq!(decision, RateLimitDecision::Denied(3));

        // A different operation has its own counter.
        assert!(store
            .check_rate_limit(AgentId::Main, "publish", 3)
            .await
            .unwrap()
            .is_allowed());
    }

    #[tokio::test]
    async fn test_cycle_numbers_resume_from_max() {
        let store = seeded().await;
        assert_eq!(store.next_cycle_number().await.unwrap(), 1);

        let cycle = HeartbeatCycle::open(41, Utc::now());
        store.record_cycle(&cycle).await.unwrap();
        assert_eq!(store.next_cycle_number().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_key_rotation_retains_prior() {
        let store = seeded().await;
        let first = store
            .upsert_agent_key(AgentId::Main, b"material-one")
            .await
            .unwrap();
        let second = store
            .upsert_agent_key(AgentId::Main, b"material-two")
            .await
            .unwrap();

        assert_ne!(first.key_hash, second.key_hash);
        let active = store.active_key(AgentId::Main).await.unwrap().unwrap();
        assert_eq!(active.key_hash, second.key_hash);
    }

    #[tokio::test]
    async fn test_failover_at_most_one_active() {
        let store = seeded().await;
        let now = Utc::now();
        let first = store
            .open_failover(FailoverEvent::open(AgentId::Ops, "main dead", now))
            .await
            .unwrap();
        let second = store
            .open_failover(FailoverEvent::open(AgentId::Ops, "still dead", now))
            .await
            .unwrap();
        assert_eq!(first.id, second.id);

        store.resolve_failover(first.id, now).await.unwrap();
        assert!(store.active_failover().await.unwrap().is_none());

        let third = store
            .open_failover(FailoverEvent::open(AgentId::Ops, "again", now))
            .await
            .unwrap();
        assert_ne!(third.id, first.id);
    }

    #[tokio::test]
    async fn test_merge_requires_higher_scored_target() {
        let store = seeded().await;
        let now = Utc::now();
        let mut low = MemoryEntry::new(MemoryLabel::Research, MemoryTier::Warm, now);
        low.mvs_score = 3.0;
        let mut high = MemoryEntry::new(MemoryLabel::Research, MemoryTier::Warm, now);
        high.mvs_score = 6.0;
        store.seed_memory(low.clone()).await;
        store.seed_memory(high.clone()).await;

        assert!(store.merge_into(high.id, low.id).await.is_err());
        store.merge_into(low.id, high.id).await.unwrap();

        let merged = store.memory(low.id).await.unwrap();
        assert!(merged.tombstone);
        assert!(merged.deleted_at.is_some());
        assert!(store
            .edges()
            .await
            .contains(&(low.id, "MERGED_INTO".to_string(), high.id)));
    }

    #[tokio::test]
    async fn test_sweep_read_notifications() {
        let store = seeded().await;
        let id = store
            .publish_notification(NewNotification::new(
                AgentId::Ops,
                NotificationKind::Info,
                "old news",
            ))
            .await
            .unwrap();
        store.mark_read(id).await;

        // Not old enough yet.
        let swept = store
            .sweep_read_notifications(Utc::now() - chrono::Duration::hours(12))
            .await
            .unwrap();
        assert_eq!(swept, 0);

        let swept = store
            .sweep_read_notifications(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(swept, 1);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let store = seeded().await;
        store.set_failing(true);
        assert!(store.ping().await.is_err());
        store.set_failing(false);
        assert!(store.ping().await.is_ok());
    }
}
