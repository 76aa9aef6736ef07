//! Bolt graph store.
//!
//! The production [`GraphStore`] over `neo4rs`. Every query is
//! parameterised; caller-supplied identifiers enter as parameters only,
//! and are already narrowed to closed enums or UUIDs at the port boundary.
//! Claim/complete/fail are single conditional statements; multi-statement
//! transactions appear only in the curation batch operations.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use neo4rs::{query, Graph, Query, Row};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::models::{
    Agent, AgentId, AgentKey, AgentRole, AgentStatus, ClaimOutcome, CurationAction, FailoverEvent,
    FailoverStatus, GraphConfig, HeartbeatCycle, HeartbeatKind, MemoryEntry, MemoryLabel,
    MemoryTier, NewNotification, NewTask, RateLimitDecision, RateLimitKey, Task, TaskPriority,
    TaskResult, TaskStatus, TaskType, TrustLevel,
};
use crate::domain::ports::{GraphCounts, GraphStore};

/// Validate the graph URI scheme against the allow-list.
pub fn validate_graph_uri(uri: &str) -> CoreResult<()> {
    let scheme = uri.split("://").next().unwrap_or("");
    if GraphConfig::ALLOWED_SCHEMES.contains(&scheme) {
        Ok(())
    } else {
        Err(CoreError::ForbiddenScheme(uri.to_string()))
    }
}

/// Bolt-backed graph store.
pub struct Neo4jGraphStore {
    graph: Graph,
    request_timeout: Duration,
}

impl Neo4jGraphStore {
    /// Connect with a scheme-validated URI. Fails fast on a bad scheme or
    /// an unreachable endpoint.
    pub async fn connect(config: &GraphConfig) -> CoreResult<Self> {
        validate_graph_uri(&config.uri)?;
        let graph = Graph::new(&config.uri, &config.user, &config.password)
            .await
            .map_err(graph_err)?;
        Ok(Self {
            graph,
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        })
    }

    async fn run(&self, q: Query) -> CoreResult<()> {
        let fut = self.graph.run(q);
        tokio::time::timeout(self.request_timeout, fut)
            .await
            .map_err(|_| CoreError::Timeout(self.request_timeout.as_secs()))?
            .map_err(graph_err)
    }

    async fn fetch_one(&self, q: Query) -> CoreResult<Option<Row>> {
        let fut = async {
            let mut stream = self.graph.execute(q).await.map_err(graph_err)?;
            stream.next().await.map_err(graph_err)
        };
        tokio::time::timeout(self.request_timeout, fut)
            .await
            .map_err(|_| CoreError::Timeout(self.request_timeout.as_secs()))?
    }

    async fn fetch_all(&self, q: Query) -> CoreResult<Vec<Row>> {
        let fut = async {
            let mut stream = self.graph.execute(q).await.map_err(graph_err)?;
            let mut rows = Vec::new();
            while let Some(row) = stream.next().await.map_err(graph_err)? {
                rows.push(row);
            }
            Ok(rows)
        };
        tokio::time::timeout(self.request_timeout, fut)
            .await
            .map_err(|_| CoreError::Timeout(self.request_timeout.as_secs()))?
    }

    /// Count returned by a `RETURN n AS n` aggregate row.
    async fn fetch_count(&self, q: Query) -> CoreResult<u64> {
        let row = self.fetch_one(q).await?;
        Ok(row.map_or(0, |r| r.get::<i64>("n").unwrap_or(0).max(0) as u64))
    }
}

fn graph_err(err: neo4rs::Error) -> CoreError {
    CoreError::GraphUnavailable(err.to_string())
}

fn bad_row(what: &str) -> CoreError {
    CoreError::Serialization(format!("malformed graph row: {what}"))
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

fn get_str(row: &Row, key: &str) -> CoreResult<String> {
    row.get::<String>(key).map_err(|_| bad_row(key))
}

fn get_i64(row: &Row, key: &str) -> CoreResult<i64> {
    row.get::<i64>(key).map_err(|_| bad_row(key))
}

fn get_opt_i64(row: &Row, key: &str) -> Option<i64> {
    row.get::<i64>(key).ok()
}

fn get_opt_str(row: &Row, key: &str) -> Option<String> {
    row.get::<String>(key).ok()
}

fn parse_agent_id(s: &str) -> CoreResult<AgentId> {
    AgentId::from_str(s).ok_or_else(|| CoreError::UnknownAgent(s.to_string()))
}

fn parse_uuid(s: &str) -> CoreResult<Uuid> {
    Uuid::parse_str(s).map_err(|_| bad_row("uuid"))
}

fn parse_agent(row: &Row) -> CoreResult<Agent> {
    let id = parse_agent_id(&get_str(row, "id")?)?;
    Ok(Agent {
        id,
        name: get_str(row, "name")?,
        role: AgentRole::from_str(&get_str(row, "role")?).ok_or_else(|| bad_row("role"))?,
        trust_level: TrustLevel::from_str(&get_str(row, "trust_level")?)
            .ok_or_else(|| bad_row("trust_level"))?,
        status: AgentStatus::from_str(&get_str(row, "status")?)
            .ok_or_else(|| bad_row("status"))?,
        infra_heartbeat: from_millis(get_i64(row, "infra_heartbeat")?),
        last_heartbeat: from_millis(get_i64(row, "last_heartbeat")?),
        current_task: get_opt_str(row, "current_task")
            .map(|s| parse_uuid(&s))
            .transpose()?,
    })
}

fn parse_task(row: &Row) -> CoreResult<Task> {
    let results = get_opt_str(row, "results")
        .map(|s| serde_json::from_str(&s))
        .transpose()?;
    Ok(Task {
        id: parse_uuid(&get_str(row, "id")?)?,
        task_type: TaskType::parse(&get_str(row, "task_type")?),
        description: get_str(row, "description")?,
        status: TaskStatus::from_str(&get_str(row, "status")?)
            .ok_or_else(|| bad_row("status"))?,
        priority: TaskPriority::from_str(&get_str(row, "priority")?)
            .ok_or_else(|| bad_row("priority"))?,
        delegated_by: parse_agent_id(&get_str(row, "delegated_by")?)?,
        assigned_to: get_opt_str(row, "assigned_to")
            .map(|s| parse_agent_id(&s))
            .transpose()?,
        created_at: from_millis(get_i64(row, "created_at")?),
        claimed_at: get_opt_i64(row, "claimed_at").map(from_millis),
        completed_at: get_opt_i64(row, "completed_at").map(from_millis),
        results,
        error_message: get_opt_str(row, "error_message"),
    })
}

fn parse_memory(row: &Row) -> CoreResult<MemoryEntry> {
    let label =
        MemoryLabel::from_str(&get_str(row, "label")?).ok_or_else(|| bad_row("label"))?;
    let tier = MemoryTier::from_str(&get_str(row, "tier")?).ok_or_else(|| bad_row("tier"))?;
    Ok(MemoryEntry {
        id: parse_uuid(&get_str(row, "id")?)?,
        label,
        tier,
        embedding: None,
        mvs_score: row.get::<f64>("mvs_score").unwrap_or(0.0),
        access_count_7d: get_opt_i64(row, "access_count_7d").unwrap_or(0).max(0) as u32,
        distinct_agents_7d: get_opt_i64(row, "distinct_agents_7d").unwrap_or(0).max(0) as u32,
        relationship_count: get_opt_i64(row, "relationship_count").unwrap_or(0).max(0) as u32,
        token_count: get_opt_i64(row, "token_count").unwrap_or(0).max(0) as u64,
        target_tokens: get_opt_i64(row, "target_tokens").unwrap_or(500).max(0) as u64,
        quality: row.get::<f64>("quality").ok(),
        created_at: from_millis(get_i64(row, "created_at")?),
        last_accessed: get_opt_i64(row, "last_accessed")
            .map_or_else(|| from_millis(get_i64(row, "created_at").unwrap_or(0)), from_millis),
        last_curated_at: get_opt_i64(row, "last_curated_at").map(from_millis),
        curation_action: None,
        tombstone: row.get::<bool>("tombstone").unwrap_or(false),
        deleted_at: get_opt_i64(row, "deleted_at").map(from_millis),
    })
}

fn parse_failover(row: &Row) -> CoreResult<FailoverEvent> {
    Ok(FailoverEvent {
        id: parse_uuid(&get_str(row, "id")?)?,
        triggered_by: parse_agent_id(&get_str(row, "triggered_by")?)?,
        reason: get_str(row, "reason")?,
        activated_at: from_millis(get_i64(row, "activated_at")?),
        deactivated_at: get_opt_i64(row, "deactivated_at").map(from_millis),
        status: FailoverStatus::from_str(&get_str(row, "status")?)
            .ok_or_else(|| bad_row("status"))?,
        messages_routed: get_i64(row, "messages_routed")?.max(0) as u64,
    })
}

#[async_trait]
impl GraphStore for Neo4jGraphStore {
    async fn get_agent(&self, id: AgentId) -> CoreResult<Agent> {
        let row = self
            .fetch_one(
                query(
                    "MATCH (a:Agent {id: $id})
                     RETURN a.id AS id, a.name AS name, a.role AS role,
                            a.trust_level AS trust_level, a.status AS status,
                            a.infra_heartbeat AS infra_heartbeat,
                            a.last_heartbeat AS last_heartbeat,
                            a.current_task AS current_task",
                )
                .param("id", id.as_str()),
            )
            .await?;
        row.as_ref()
            .map(parse_agent)
            .transpose()?
            .ok_or_else(|| CoreError::NotFound(format!("agent {id}")))
    }

    async fn list_agents(&self) -> CoreResult<Vec<Agent>> {
        let rows = self
            .fetch_all(query(
                "MATCH (a:Agent)
                 RETURN a.id AS id, a.name AS name, a.role AS role,
                        a.trust_level AS trust_level, a.status AS status,
                        a.infra_heartbeat AS infra_heartbeat,
                        a.last_heartbeat AS last_heartbeat,
                        a.current_task AS current_task
                 ORDER BY a.id",
            ))
            .await?;
        rows.iter().map(parse_agent).collect()
    }

    async fn update_heartbeat_at(
        &self,
        id: AgentId,
        kind: HeartbeatKind,
        at: DateTime<Utc>,
    ) -> CoreResult<()> {
        // Monotonic guard lives in the query so replays cannot move time
        // backwards.
        let text = match kind {
            HeartbeatKind::Infra => {
                "MATCH (a:Agent {id: $id}) WHERE a.infra_heartbeat < $at
                 SET a.infra_heartbeat = $at"
            }
            HeartbeatKind::Functional => {
                "MATCH (a:Agent {id: $id}) WHERE a.last_heartbeat < $at
                 SET a.last_heartbeat = $at"
            }
        };
        self.run(query(text).param("id", id.as_str()).param("at", millis(at)))
            .await
    }

    async fn update_infra_heartbeats_at(
        &self,
        ids: &[AgentId],
        at: DateTime<Utc>,
    ) -> CoreResult<()> {
        let ids: Vec<String> = ids.iter().map(|id| id.as_str().to_string()).collect();
        self.run(
            query(
                "MATCH (a:Agent) WHERE a.id IN $ids AND a.infra_heartbeat < $at
                 SET a.infra_heartbeat = $at",
            )
            .param("ids", ids)
            .param("at", millis(at)),
        )
        .await
    }

    async fn set_agent_status(&self, id: AgentId, status: AgentStatus) -> CoreResult<()> {
        self.run(
            query("MATCH (a:Agent {id: $id}) SET a.status = $status")
                .param("id", id.as_str())
                .param("status", status.as_str()),
        )
        .await
    }

    async fn set_current_task(&self, id: AgentId, task: Option<Uuid>) -> CoreResult<()> {
        self.run(
            query("MATCH (a:Agent {id: $id}) SET a.current_task = $task")
                .param("id", id.as_str())
                .param("task", task.map(|t| t.to_string())),
        )
        .await
    }

    async fn create_task(&self, new: NewTask) -> CoreResult<Uuid> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let metadata = serde_json::to_string(&new.metadata)?;
        self.run(
            query(
                "CREATE (t:Task {id: $id, task_type: $task_type,
                        description: $description, status: 'pending',
                        priority: $priority, delegated_by: $delegated_by,
                        assigned_to: $assigned_to, created_at: $created_at,
                        metadata: $metadata})
                 WITH t
                 MATCH (d:Agent {id: $delegated_by})
                 MERGE (d)-[:CREATED]->(t)",
            )
            .param("id", id.to_string())
            .param("task_type", new.task_type.as_str())
            .param("description", new.description)
            .param("priority", new.priority.as_str())
            .param("delegated_by", new.delegated_by.as_str())
            .param("assigned_to", new.assigned_to.map(|a| a.as_str().to_string()))
            .param("created_at", millis(now))
            .param("metadata", metadata),
        )
        .await?;
        Ok(id)
    }

    async fn get_task(&self, id: Uuid) -> CoreResult<Option<Task>> {
        let row = self
            .fetch_one(
                query(
                    "MATCH (t:Task {id: $id})
                     RETURN t.id AS id, t.task_type AS task_type,
                            t.description AS description, t.status AS status,
                            t.priority AS priority, t.delegated_by AS delegated_by,
                            t.assigned_to AS assigned_to, t.created_at AS created_at,
                            t.claimed_at AS claimed_at, t.completed_at AS completed_at,
                            t.results AS results, t.error_message AS error_message",
                )
                .param("id", id.to_string()),
            )
            .await?;
        row.as_ref().map(parse_task).transpose()
    }

    async fn claim_task(&self, id: Uuid, agent: AgentId) -> CoreResult<ClaimOutcome> {
        // One conditional update; the WHERE inside the CASE arms keeps the
        // whole decision in a single statement at the graph layer.
        let row = self
            .fetch_one(
                query(
                    "MATCH (t:Task {id: $id})
                     WITH t, (t.status = 'pending' AND
                              (t.assigned_to IS NULL OR t.assigned_to = $agent)) AS claimable
                     SET t.status      = CASE WHEN claimable THEN 'in_progress' ELSE t.status END,
                         t.assigned_to = CASE WHEN claimable THEN $agent ELSE t.assigned_to END,
                         t.claimed_at  = CASE WHEN claimable THEN $now ELSE t.claimed_at END
                     RETURN claimable AS claimable,
                            t.assigned_to AS assigned_to,
                            t.delegated_by AS delegated_by",
                )
                .param("id", id.to_string())
                .param("agent", agent.as_str())
                .param("now", millis(Utc::now())),
            )
            .await?;

        let Some(row) = row else {
            return Ok(ClaimOutcome::NotFound);
        };
        let claimable = row.get::<bool>("claimable").map_err(|_| bad_row("claimable"))?;
        if claimable {
            // Pin the winner's current task and ASSIGNED_TO edge.
            self.run(
                query(
                    "MATCH (a:Agent {id: $agent}), (t:Task {id: $id})
                     SET a.current_task = $id
                     MERGE (a)-[:ASSIGNED_TO]->(t)",
                )
                .param("agent", agent.as_str())
                .param("id", id.to_string()),
            )
            .await?;
            return Ok(ClaimOutcome::Claimed);
        }
        let owner = get_opt_str(&row, "assigned_to")
            .or_else(|| get_opt_str(&row, "delegated_by"))
            .and_then(|s| AgentId::from_str(&s))
            .unwrap_or(AgentId::Main);
        Ok(ClaimOutcome::AlreadyClaimed(owner))
    }

    async fn complete_task(
        &self,
        id: Uuid,
        agent: AgentId,
        results: serde_json::Value,
    ) -> CoreResult<()> {
        let row = self
            .fetch_one(
                query(
                    "MATCH (t:Task {id: $id})
                     WITH t, (t.status = 'in_progress' AND t.assigned_to = $agent) AS owned
                     SET t.status       = CASE WHEN owned THEN 'completed' ELSE t.status END,
                         t.completed_at = CASE WHEN owned THEN $now ELSE t.completed_at END,
                         t.results      = CASE WHEN owned THEN $results ELSE t.results END
                     RETURN owned AS owned",
                )
                .param("id", id.to_string())
                .param("agent", agent.as_str())
                .param("now", millis(Utc::now()))
                .param("results", serde_json::to_string(&results)?),
            )
            .await?;

        match row {
            None => Err(CoreError::NotFound(format!("task {id}"))),
            Some(row) if row.get::<bool>("owned").unwrap_or(false) => {
                self.run(
                    query(
                        "MATCH (a:Agent {id: $agent})
                         WHERE a.current_task = $id
                         SET a.current_task = NULL",
                    )
                    .param("agent", agent.as_str())
                    .param("id", id.to_string()),
                )
                .await
            }
            Some(_) => Err(CoreError::StaleOwnership { task_id: id, agent }),
        }
    }

    async fn fail_task(&self, id: Uuid, agent: AgentId, error: &str) -> CoreResult<()> {
        let row = self
            .fetch_one(
                query(
                    "MATCH (t:Task {id: $id})
                     WITH t, (t.status = 'in_progress' AND t.assigned_to = $agent) AS owned
                     SET t.status        = CASE WHEN owned THEN 'failed' ELSE t.status END,
                         t.completed_at  = CASE WHEN owned THEN $now ELSE t.completed_at END,
                         t.error_message = CASE WHEN owned THEN $error ELSE t.error_message END
                     RETURN owned AS owned",
                )
                .param("id", id.to_string())
                .param("agent", agent.as_str())
                .param("now", millis(Utc::now()))
                .param("error", error),
            )
            .await?;

        match row {
            None => Err(CoreError::NotFound(format!("task {id}"))),
            Some(row) if row.get::<bool>("owned").unwrap_or(false) => {
                self.run(
                    query(
                        "MATCH (a:Agent {id: $agent})
                         WHERE a.current_task = $id
                         SET a.current_task = NULL",
                    )
                    .param("agent", agent.as_str())
                    .param("id", id.to_string()),
                )
                .await
            }
            Some(_) => Err(CoreError::StaleOwnership { task_id: id, agent }),
        }
    }

    async fn archive_terminal_tasks(&self, older_than: DateTime<Utc>) -> CoreResult<u64> {
        self.fetch_count(
            query(
                "MATCH (t:Task)
                 WHERE t.status IN ['completed', 'failed']
                   AND t.completed_at < $cutoff
                   AND NOT t:ArchivedTask
                 SET t:ArchivedTask
                 RETURN count(t) AS n",
            )
            .param("cutoff", millis(older_than)),
        )
        .await
    }

    async fn pending_tasks_for(&self, agent: AgentId, limit: usize) -> CoreResult<Vec<Task>> {
        let rows = self
            .fetch_all(
                query(
                    "MATCH (t:Task {status: 'pending'})
                     WHERE t.assigned_to IS NULL OR t.assigned_to = $agent
                     RETURN t.id AS id, t.task_type AS task_type,
                            t.description AS description, t.status AS status,
                            t.priority AS priority, t.delegated_by AS delegated_by,
                            t.assigned_to AS assigned_to, t.created_at AS created_at,
                            t.claimed_at AS claimed_at, t.completed_at AS completed_at,
                            t.results AS results, t.error_message AS error_message
                     ORDER BY t.created_at
                     LIMIT $limit",
                )
                .param("agent", agent.as_str())
                .param("limit", limit as i64),
            )
            .await?;
        rows.iter().map(parse_task).collect()
    }

    async fn check_rate_limit(
        &self,
        agent: AgentId,
        operation: &str,
        limit_per_hour: u32,
    ) -> CoreResult<RateLimitDecision> {
        let key = RateLimitKey::at(agent, operation, Utc::now());
        // MERGE + conditional increment in one statement keeps the counter
        // atomic under concurrent callers.
        let row = self
            .fetch_one(
                query(
                    "MERGE (r:RateLimit {agent: $agent, operation: $operation,
                                         date: $date, hour: $hour})
                     ON CREATE SET r.count = 0, r.last_updated = $now
                     WITH r, r.count < $limit AS allowed
                     SET r.count        = CASE WHEN allowed THEN r.count + 1 ELSE r.count END,
                         r.last_updated = CASE WHEN allowed THEN $now ELSE r.last_updated END
                     RETURN allowed AS allowed, r.count AS count",
                )
                .param("agent", key.agent.as_str())
                .param("operation", key.operation.as_str())
                .param("date", key.date.as_str())
                .param("hour", i64::from(key.hour))
                .param("limit", i64::from(limit_per_hour))
                .param("now", millis(Utc::now())),
            )
            .await?
            .ok_or_else(|| bad_row("rate limit"))?;

        if row.get::<bool>("allowed").unwrap_or(false) {
            Ok(RateLimitDecision::Allowed)
        } else {
            let count = row.get::<i64>("count").unwrap_or(0).max(0) as u32;
            Ok(RateLimitDecision::Denied(count))
        }
    }

    async fn purge_rate_limits(&self, older_than: DateTime<Utc>) -> CoreResult<u64> {
        self.fetch_count(
            query(
                "MATCH (r:RateLimit) WHERE r.last_updated < $cutoff
                 WITH collect(r) AS victims
                 FOREACH (v IN victims | DETACH DELETE v)
                 RETURN size(victims) AS n",
            )
            .param("cutoff", millis(older_than)),
        )
        .await
    }

    async fn publish_notification(&self, notification: NewNotification) -> CoreResult<Uuid> {
        let id = Uuid::new_v4();
        self.run(
            query(
                "CREATE (n:Notification {id: $id, agent: $agent, type: $type,
                        summary: $summary, task_id: $task_id, read: false,
                        created_at: $created_at})",
            )
            .param("id", id.to_string())
            .param("agent", notification.agent.as_str())
            .param("type", notification.kind.as_str())
            .param("summary", notification.summary)
            .param("task_id", notification.task_id.map(|t| t.to_string()))
            .param("created_at", millis(Utc::now())),
        )
        .await?;
        Ok(id)
    }

    async fn sweep_read_notifications(&self, older_than: DateTime<Utc>) -> CoreResult<u64> {
        self.fetch_count(
            query(
                "MATCH (n:Notification)
                 WHERE n.read = true AND n.created_at < $cutoff
                 WITH collect(n) AS victims
                 FOREACH (v IN victims | DETACH DELETE v)
                 RETURN size(victims) AS n",
            )
            .param("cutoff", millis(older_than)),
        )
        .await
    }

    async fn next_cycle_number(&self) -> CoreResult<u64> {
        let row = self
            .fetch_one(query(
                "MATCH (c:HeartbeatCycle)
                 RETURN coalesce(max(c.cycle_number), 0) + 1 AS n",
            ))
            .await?
            .ok_or_else(|| bad_row("cycle number"))?;
        Ok(get_i64(&row, "n")?.max(1) as u64)
    }

    async fn record_cycle(&self, cycle: &HeartbeatCycle) -> CoreResult<()> {
        self.run(
            query(
                "CREATE (c:HeartbeatCycle {cycle_number: $cycle_number,
                        started_at: $started_at, tasks_run: 0,
                        tasks_succeeded: 0, tasks_failed: 0,
                        total_tokens: 0, duration_seconds: 0.0})",
            )
            .param("cycle_number", cycle.cycle_number as i64)
            .param("started_at", millis(cycle.started_at)),
        )
        .await
    }

    async fn finalize_cycle(&self, cycle: &HeartbeatCycle) -> CoreResult<()> {
        self.run(
            query(
                "MATCH (c:HeartbeatCycle {cycle_number: $cycle_number})
                 SET c.completed_at = $completed_at, c.tasks_run = $tasks_run,
                     c.tasks_succeeded = $tasks_succeeded,
                     c.tasks_failed = $tasks_failed,
                     c.total_tokens = $total_tokens,
                     c.duration_seconds = $duration_seconds",
            )
            .param("cycle_number", cycle.cycle_number as i64)
            .param("completed_at", cycle.completed_at.map(millis))
            .param("tasks_run", i64::from(cycle.tasks_run))
            .param("tasks_succeeded", i64::from(cycle.tasks_succeeded))
            .param("tasks_failed", i64::from(cycle.tasks_failed))
            .param("total_tokens", cycle.total_tokens as i64)
            .param("duration_seconds", cycle.duration_seconds),
        )
        .await
    }

    async fn record_result(&self, cycle_number: u64, result: &TaskResult) -> CoreResult<()> {
        self.run(
            query(
                "MATCH (c:HeartbeatCycle {cycle_number: $cycle_number})
                 CREATE (r:TaskResult {agent: $agent, task_name: $task_name,
                        status: $status, started_at: $started_at,
                        completed_at: $completed_at, summary: $summary,
                        error_message: $error_message, tokens_used: $tokens_used})
                 MERGE (c)-[:HAS_RESULT]->(r)",
            )
            .param("cycle_number", cycle_number as i64)
            .param("agent", result.agent.as_str())
            .param("task_name", result.task_name.as_str())
            .param("status", result.status.as_str())
            .param("started_at", millis(result.started_at))
            .param("completed_at", millis(result.completed_at))
            .param("summary", result.summary.as_str())
            .param("error_message", result.error_message.clone())
            .param("tokens_used", i64::from(result.tokens_used)),
        )
        .await
    }

    async fn upsert_agent_key(&self, agent: AgentId, key_material: &[u8]) -> CoreResult<AgentKey> {
        let now = Utc::now();
        let key = AgentKey::issue(agent, hex::encode(Sha256::digest(key_material)), now);
        self.run(
            query(
                "MATCH (a:Agent {id: $agent})
                 OPTIONAL MATCH (a)-[:HAS_KEY]->(old:AgentKey {is_active: true})
                 SET old.is_active = false
                 CREATE (k:AgentKey {agent_id: $agent, key_hash: $key_hash,
                        created_at: $created_at, expires_at: $expires_at,
                        is_active: true})
                 MERGE (a)-[:HAS_KEY]->(k)",
            )
            .param("agent", agent.as_str())
            .param("key_hash", key.key_hash.as_str())
            .param("created_at", millis(key.created_at))
            .param("expires_at", millis(key.expires_at)),
        )
        .await?;
        Ok(key)
    }

    async fn active_key(&self, agent: AgentId) -> CoreResult<Option<AgentKey>> {
        let row = self
            .fetch_one(
                query(
                    "MATCH (k:AgentKey {agent_id: $agent, is_active: true})
                     WHERE k.expires_at > $now
                     RETURN k.key_hash AS key_hash, k.created_at AS created_at,
                            k.expires_at AS expires_at
                     ORDER BY k.created_at DESC LIMIT 1",
                )
                .param("agent", agent.as_str())
                .param("now", millis(Utc::now())),
            )
            .await?;
        row.map(|row| {
            Ok(AgentKey {
                agent_id: agent,
                key_hash: get_str(&row, "key_hash")?,
                created_at: from_millis(get_i64(&row, "created_at")?),
                expires_at: from_millis(get_i64(&row, "expires_at")?),
                is_active: true,
            })
        })
        .transpose()
    }

    async fn purge_retired_keys(&self, now: DateTime<Utc>) -> CoreResult<u64> {
        let cutoff = now - chrono::Duration::days(crate::domain::models::KEY_AUDIT_RETENTION_DAYS);
        self.fetch_count(
            query(
                "MATCH (k:AgentKey {is_active: false})
                 WHERE k.created_at < $cutoff
                 WITH collect(k) AS victims
                 FOREACH (v IN victims | DETACH DELETE v)
                 RETURN size(victims) AS n",
            )
            .param("cutoff", millis(cutoff)),
        )
        .await
    }

    async fn active_failover(&self) -> CoreResult<Option<FailoverEvent>> {
        let row = self
            .fetch_one(query(
                "MATCH (f:FailoverEvent {status: 'active'})
                 RETURN f.id AS id, f.triggered_by AS triggered_by,
                        f.reason AS reason, f.activated_at AS activated_at,
                        f.deactivated_at AS deactivated_at, f.status AS status,
                        f.messages_routed AS messages_routed
                 LIMIT 1",
            ))
            .await?;
        row.as_ref().map(parse_failover).transpose()
    }

    async fn open_failover(&self, event: FailoverEvent) -> CoreResult<FailoverEvent> {
        // Idempotent: create only when no active event exists, then read
        // back whichever event is active.
        self.run(
            query(
                "OPTIONAL MATCH (existing:FailoverEvent {status: 'active'})
                 WITH existing WHERE existing IS NULL
                 CREATE (:FailoverEvent {id: $id, triggered_by: $triggered_by,
                        reason: $reason, activated_at: $activated_at,
                        status: 'active', messages_routed: 0})",
            )
            .param("id", event.id.to_string())
            .param("triggered_by", event.triggered_by.as_str())
            .param("reason", event.reason.as_str())
            .param("activated_at", millis(event.activated_at)),
        )
        .await?;
        self.active_failover()
            .await?
            .ok_or_else(|| CoreError::NotFound("failover event".to_string()))
    }

    async fn resolve_failover(&self, id: Uuid, at: DateTime<Utc>) -> CoreResult<()> {
        self.run(
            query(
                "MATCH (f:FailoverEvent {id: $id})
                 SET f.status = 'resolved', f.deactivated_at = $at",
            )
            .param("id", id.to_string())
            .param("at", millis(at)),
        )
        .await
    }

    async fn increment_failover_routed(&self, id: Uuid) -> CoreResult<()> {
        self.run(
            query(
                "MATCH (f:FailoverEvent {id: $id})
                 SET f.messages_routed = f.messages_routed + 1",
            )
            .param("id", id.to_string()),
        )
        .await
    }

    async fn score_sample(&self, tier: MemoryTier, limit: usize) -> CoreResult<Vec<MemoryEntry>> {
        let rows = self
            .fetch_all(
                query(
                    "MATCH (m:MemoryEntry {tier: $tier})
                     WHERE coalesce(m.tombstone, false) = false
                     RETURN m.id AS id, m.label AS label, m.tier AS tier,
                            m.mvs_score AS mvs_score,
                            m.access_count_7d AS access_count_7d,
                            m.distinct_agents_7d AS distinct_agents_7d,
                            COUNT { (m)--() } AS relationship_count,
                            m.token_count AS token_count,
                            m.target_tokens AS target_tokens,
                            m.quality AS quality, m.created_at AS created_at,
                            m.last_accessed AS last_accessed,
                            m.last_curated_at AS last_curated_at,
                            m.tombstone AS tombstone, m.deleted_at AS deleted_at
                     ORDER BY coalesce(m.last_curated_at, m.created_at)
                     LIMIT $limit",
                )
                .param("tier", tier.as_str())
                .param("limit", limit as i64),
            )
            .await?;
        rows.iter().map(parse_memory).collect()
    }

    async fn get_memory(&self, id: Uuid) -> CoreResult<Option<MemoryEntry>> {
        let row = self
            .fetch_one(
                query(
                    "MATCH (m:MemoryEntry {id: $id})
                     RETURN m.id AS id, m.label AS label, m.tier AS tier,
                            m.mvs_score AS mvs_score,
                            m.access_count_7d AS access_count_7d,
                            m.distinct_agents_7d AS distinct_agents_7d,
                            COUNT { (m)--() } AS relationship_count,
                            m.token_count AS token_count,
                            m.target_tokens AS target_tokens,
                            m.quality AS quality, m.created_at AS created_at,
                            m.last_accessed AS last_accessed,
                            m.last_curated_at AS last_curated_at,
                            m.tombstone AS tombstone, m.deleted_at AS deleted_at",
                )
                .param("id", id.to_string()),
            )
            .await?;
        row.as_ref().map(parse_memory).transpose()
    }

    async fn tier_counts(&self) -> CoreResult<HashMap<MemoryTier, u64>> {
        let rows = self
            .fetch_all(query(
                "MATCH (m:MemoryEntry)
                 WHERE coalesce(m.tombstone, false) = false
                 RETURN m.tier AS tier, count(m) AS n",
            ))
            .await?;
        let mut counts = HashMap::new();
        for row in rows {
            if let Some(tier) = MemoryTier::from_str(&get_str(&row, "tier")?) {
                counts.insert(tier, get_i64(&row, "n")?.max(0) as u64);
            }
        }
        Ok(counts)
    }

    async fn tier_token_totals(&self) -> CoreResult<HashMap<MemoryTier, u64>> {
        let rows = self
            .fetch_all(query(
                "MATCH (m:MemoryEntry)
                 WHERE coalesce(m.tombstone, false) = false
                 RETURN m.tier AS tier, sum(coalesce(m.token_count, 0)) AS n",
            ))
            .await?;
        let mut totals = HashMap::new();
        for row in rows {
            if let Some(tier) = MemoryTier::from_str(&get_str(&row, "tier")?) {
                totals.insert(tier, get_i64(&row, "n")?.max(0) as u64);
            }
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
        self.run(
            query(
                "MATCH (m:MemoryEntry {id: $id})
                 SET m.mvs_score = $score, m.curation_action = $action,
                     m.last_curated_at = $at",
            )
            .param("id", node.to_string())
            .param("score", score)
            .param("action", action.as_str())
            .param("at", millis(at)),
        )
        .await
    }

    async fn set_tier(&self, node: Uuid, tier: MemoryTier) -> CoreResult<()> {
        self.run(
            query("MATCH (m:MemoryEntry {id: $id}) SET m.tier = $tier")
                .param("id", node.to_string())
                .param("tier", tier.as_str()),
        )
        .await
    }

    async fn tombstone(
        &self,
        node: Uuid,
        reason: &str,
        purge_after: DateTime<Utc>,
    ) -> CoreResult<()> {
        self.run(
            query(
                "MATCH (m:MemoryEntry {id: $id})
                 SET m.tombstone = true, m.deleted_at = $purge_after,
                     m.tombstone_reason = $reason",
            )
            .param("id", node.to_string())
            .param("purge_after", millis(purge_after))
            .param("reason", reason),
        )
        .await
    }

    async fn merge_into(&self, src: Uuid, dst: Uuid) -> CoreResult<()> {
        // Curation batch op: multi-statement transaction is permitted here.
        let mut txn = self.graph.start_txn().await.map_err(graph_err)?;
        let guard = query(
            "MATCH (src:MemoryEntry {id: $src}), (dst:MemoryEntry {id: $dst})
             WHERE dst.mvs_score >= src.mvs_score
             RETURN src.id AS id",
        )
        .param("src", src.to_string())
        .param("dst", dst.to_string());
        let mut stream = txn.execute(guard).await.map_err(graph_err)?;
        if stream.next(txn.handle()).await.map_err(graph_err)?.is_none() {
            txn.rollback().await.map_err(graph_err)?;
            return Err(CoreError::InvalidInput(format!(
                "merge target {dst} missing or scores below source {src}"
            )));
        }

        let purge_after =
            Utc::now() + chrono::Duration::days(crate::services::curation::mvs::PRUNE_GRACE_DAYS);
        txn.run_queries(vec![
            query(
                "MATCH (src:MemoryEntry {id: $src})-[r:RELATES_TO]->(o)
                 MATCH (dst:MemoryEntry {id: $dst})
                 WHERE o.id <> $dst
                 MERGE (dst)-[:RELATES_TO]->(o)",
            )
            .param("src", src.to_string())
            .param("dst", dst.to_string()),
            query(
                "MATCH (o)-[r:RELATES_TO]->(src:MemoryEntry {id: $src})
                 MATCH (dst:MemoryEntry {id: $dst})
                 WHERE o.id <> $dst
                 MERGE (o)-[:RELATES_TO]->(dst)",
            )
            .param("src", src.to_string())
            .param("dst", dst.to_string()),
            query(
                "MATCH (src:MemoryEntry {id: $src}), (dst:MemoryEntry {id: $dst})
                 MERGE (src)-[:MERGED_INTO]->(dst)
                 SET src.tombstone = true, src.deleted_at = $purge_after",
            )
            .param("src", src.to_string())
            .param("dst", dst.to_string())
            .param("purge_after", millis(purge_after)),
        ])
        .await
        .map_err(graph_err)?;
        txn.commit().await.map_err(graph_err)
    }

    async fn purge_tombstoned(&self, older_than: DateTime<Utc>) -> CoreResult<u64> {
        self.fetch_count(
            query(
                "MATCH (m:MemoryEntry)
                 WHERE m.tombstone = true AND m.deleted_at <= $cutoff
                 WITH collect(m) AS victims
                 FOREACH (v IN victims | DETACH DELETE v)
                 RETURN size(victims) AS n",
            )
            .param("cutoff", millis(older_than)),
        )
        .await
    }

    async fn purge_node(&self, node: Uuid) -> CoreResult<()> {
        self.run(
            query("MATCH (m:MemoryEntry {id: $id}) DETACH DELETE m")
                .param("id", node.to_string()),
        )
        .await
    }

    async fn delete_orphans(&self) -> CoreResult<u64> {
        let day_ago = Utc::now() - chrono::Duration::hours(24);
        self.fetch_count(
            query(
                "MATCH (m:MemoryEntry)
                 WHERE NOT (m)--()
                   AND coalesce(m.tombstone, false) = false
                   AND m.created_at < $day_ago
                   AND NOT (m.label = 'Belief' AND coalesce(m.quality, 0.0) >= 0.9)
                 WITH collect(m) AS victims
                 FOREACH (v IN victims | DELETE v)
                 RETURN size(victims) AS n",
            )
            .param("day_ago", millis(day_ago)),
        )
        .await
    }

    async fn decay_stale_confidence(
        &self,
        not_accessed_since: DateTime<Utc>,
        factor: f64,
    ) -> CoreResult<u64> {
        self.fetch_count(
            query(
                "MATCH (m:MemoryEntry)
                 WHERE m.last_accessed < $cutoff AND m.quality IS NOT NULL
                 SET m.quality = m.quality * $factor
                 RETURN count(m) AS n",
            )
            .param("cutoff", millis(not_accessed_since))
            .param("factor", factor),
        )
        .await
    }

    async fn expire_session_contexts(&self, older_than: DateTime<Utc>) -> CoreResult<u64> {
        self.fetch_count(
            query(
                "MATCH (m:MemoryEntry {label: 'SessionContext'})
                 WHERE m.created_at < $cutoff
                 WITH collect(m) AS victims
                 FOREACH (v IN victims | DETACH DELETE v)
                 RETURN size(victims) AS n",
            )
            .param("cutoff", millis(older_than)),
        )
        .await
    }

    async fn dedup_candidates(
        &self,
        min_similarity: f64,
        limit: usize,
    ) -> CoreResult<Vec<(Uuid, Uuid)>> {
        let rows = self
            .fetch_all(
                query(
                    "MATCH (a:MemoryEntry), (b:MemoryEntry)
                     WHERE a.id < b.id
                       AND coalesce(a.tombstone, false) = false
                       AND coalesce(b.tombstone, false) = false
                       AND a.embedding IS NOT NULL AND b.embedding IS NOT NULL
                     WITH a, b,
                          vector.similarity.cosine(a.embedding, b.embedding) AS sim
                     WHERE sim >= $min
                     WITH CASE WHEN a.mvs_score <= b.mvs_score THEN a.id ELSE b.id END AS lower,
                          CASE WHEN a.mvs_score <= b.mvs_score THEN b.id ELSE a.id END AS higher
                     RETURN lower, higher
                     LIMIT $limit",
                )
                .param("min", min_similarity)
                .param("limit", limit as i64),
            )
            .await?;
        rows.iter()
            .map(|row| {
                Ok((
                    parse_uuid(&get_str(row, "lower")?)?,
                    parse_uuid(&get_str(row, "higher")?)?,
                ))
            })
            .collect()
    }

    async fn ping(&self) -> CoreResult<()> {
        self.fetch_one(query("RETURN 1 AS n")).await.map(|_| ())
    }

    async fn node_counts(&self) -> CoreResult<GraphCounts> {
        let row = self
            .fetch_one(query(
                "RETURN COUNT { MATCH (a:Agent) RETURN a } AS agents,
                        COUNT { MATCH (t:Task) RETURN t } AS tasks,
                        COUNT { MATCH (m:MemoryEntry) RETURN m } AS memory_entries,
                        COUNT { MATCH (c:HeartbeatCycle) RETURN c } AS cycles,
                        COUNT { MATCH (n:Notification) RETURN n } AS notifications",
            ))
            .await?
            .ok_or_else(|| bad_row("counts"))?;
        Ok(GraphCounts {
            agents: get_i64(&row, "agents")?.max(0) as u64,
            tasks: get_i64(&row, "tasks")?.max(0) as u64,
            memory_entries: get_i64(&row, "memory_entries")?.max(0) as u64,
            cycles: get_i64(&row, "cycles")?.max(0) as u64,
            notifications: get_i64(&row, "notifications")?.max(0) as u64,
        })
    }

    async fn ensure_schema(&self) -> CoreResult<()> {
        for constraint in [
            "CREATE CONSTRAINT agent_id IF NOT EXISTS FOR (a:Agent) REQUIRE a.id IS UNIQUE",
            "CREATE CONSTRAINT task_id IF NOT EXISTS FOR (t:Task) REQUIRE t.id IS UNIQUE",
            "CREATE CONSTRAINT cycle_number IF NOT EXISTS FOR (c:HeartbeatCycle) REQUIRE c.cycle_number IS UNIQUE",
            "CREATE CONSTRAINT memory_id IF NOT EXISTS FOR (m:MemoryEntry) REQUIRE m.id IS UNIQUE",
            "CREATE CONSTRAINT failover_id IF NOT EXISTS FOR (f:FailoverEvent) REQUIRE f.id IS UNIQUE",
            "CREATE INDEX task_status IF NOT EXISTS FOR (t:Task) ON (t.status)",
            "CREATE INDEX memory_tier IF NOT EXISTS FOR (m:MemoryEntry) ON (m.tier)",
            "CREATE INDEX notification_agent IF NOT EXISTS FOR (n:Notification) ON (n.agent)",
        ] {
            self.run(query(constraint)).await?;
        }

        let now = millis(Utc::now());
        for id in AgentId::ALL {
            let trust = match id {
                AgentId::Main | AgentId::Ops => TrustLevel::High,
                _ => TrustLevel::Medium,
            };
            self.run(
                query(
                    "MERGE (a:Agent {id: $id})
                     ON CREATE SET a.name = $name, a.role = $role,
                        a.trust_level = $trust_level, a.status = 'active',
                        a.infra_heartbeat = $now, a.last_heartbeat = $now,
                        a.current_task = NULL",
                )
                .param("id", id.as_str())
                .param("name", id.as_str())
                .param("role", id.role().as_str())
                .param("trust_level", trust.as_str())
                .param("now", now),
            )
            .await?;
        }
        Ok(())
    }
}
