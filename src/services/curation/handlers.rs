//! The four scheduled curation passes.
//!
//! All four are registered `exclusive`, so they never run concurrently
//! with each other. Destructive work (prune, merge) is counted against a
//! hard per-tier cap before anything is touched; tripping the cap aborts
//! the pass and surfaces as a critical-handler failure.

use async_trait::async_trait;
use chrono::{Duration, Utc};

use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::models::{CurationAction, MemoryEntry, MemoryTier};
use crate::domain::ports::GraphStore;
use crate::services::registry::{CycleHandler, HandlerContext, HandlerReport};

use super::mvs;

/// A single pass may delete at most this share of a tier.
pub const DELETION_CAP_PERCENT: u8 = 5;

/// Nodes sampled per tier by the standard pass.
pub const SAMPLE_PER_TIER: usize = 100;

/// Cosine similarity at which the deep pass merges near-duplicates.
pub const DEDUP_SIMILARITY: f64 = 0.85;

/// Confidence decay factor for entries untouched for 30 days.
pub const STALE_CONFIDENCE_FACTOR: f64 = 0.98;

/// Enforce the per-tier deletion cap on a planned destructive set.
pub fn check_deletion_cap(
    tier: MemoryTier,
    tier_size: u64,
    planned_deletes: usize,
) -> CoreResult<()> {
    let allowed = (tier_size as usize * usize::from(DELETION_CAP_PERCENT)) / 100;
    if planned_deletes > allowed {
        return Err(CoreError::CurationExcess {
            tier: tier.as_str().to_string(),
            would_delete: planned_deletes,
            tier_size: tier_size as usize,
            cap_percent: DELETION_CAP_PERCENT,
        });
    }
    Ok(())
}

async fn apply_action(
    graph: &dyn GraphStore,
    entry: &MemoryEntry,
    action: CurationAction,
) -> CoreResult<()> {
    match action {
        CurationAction::Keep
        | CurationAction::Compress
        | CurationAction::Improve
        | CurationAction::Merge
        | CurationAction::Promote => Ok(()),
        CurationAction::Demote => match entry.tier.demoted() {
            Some(down) => graph.set_tier(entry.id, down).await,
            None => Ok(()),
        },
        CurationAction::Prune => {
            let purge_after = Utc::now() + Duration::days(mvs::PRUNE_GRACE_DAYS);
            graph
                .tombstone(entry.id, "mvs below retention floor", purge_after)
                .await
        }
        CurationAction::PruneImmediate => graph.purge_node(entry.id).await,
    }
}

/// `curation_rapid` (every 5 minutes): inbox hygiene, session-context
/// expiry, and per-tier token budget enforcement by demotion.
pub struct CurationRapidHandler;

#[async_trait]
impl CycleHandler for CurationRapidHandler {
    async fn run(&self, ctx: HandlerContext) -> CoreResult<HandlerReport> {
        let now = Utc::now();
        let graph = ctx.graph.as_ref();

        let notifications = graph
            .sweep_read_notifications(now - Duration::hours(12))
            .await?;
        let contexts = graph.expire_session_contexts(now - Duration::days(1)).await?;

        let totals = graph.tier_token_totals().await?;
        let mut demoted = 0_u64;
        for tier in [MemoryTier::Hot, MemoryTier::Warm, MemoryTier::Cold] {
            let budget = tier.token_budget().unwrap_or(u64::MAX);
            let mut used = totals.get(&tier).copied().unwrap_or(0);
            if used <= budget {
                continue;
            }

            // Push the lowest-value entries down a tier until the budget
            // holds. Protected entries stay put.
            let mut sample = graph.score_sample(tier, SAMPLE_PER_TIER).await?;
            sample.sort_by(|a, b| {
                mvs::score(a, now)
                    .partial_cmp(&mvs::score(b, now))
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            for entry in sample {
                if used <= budget {
                    break;
                }
                if mvs::is_protected(&entry, now) {
                    continue;
                }
                if let Some(down) = entry.tier.demoted() {
                    graph.set_tier(entry.id, down).await?;
                    used = used.saturating_sub(entry.token_count);
                    demoted += 1;
                }
            }
        }

        Ok(HandlerReport::new(
            format!(
                "swept {notifications} notifications, {contexts} session contexts, demoted {demoted} for budget"
            ),
            0,
        ))
    }
}

/// `curation_standard` (every 15 minutes): sample each tier, recompute
/// MVS, apply the banded actions, archive stale terminal tasks.
pub struct CurationStandardHandler;

#[async_trait]
impl CycleHandler for CurationStandardHandler {
    async fn run(&self, ctx: HandlerContext) -> CoreResult<HandlerReport> {
        let now = Utc::now();
        let graph = ctx.graph.as_ref();
        let counts = graph.tier_counts().await?;

        let mut scored = 0_u64;
        let mut pruned = 0_u64;
        let mut demoted = 0_u64;

        for tier in MemoryTier::ALL {
            let sample = graph.score_sample(tier, SAMPLE_PER_TIER).await?;
            if sample.is_empty() {
                continue;
            }

            let planned: Vec<(MemoryEntry, f64, CurationAction)> = sample
                .into_iter()
                .map(|entry| {
                    let score = mvs::score(&entry, now);
                    let action = mvs::action_for(&entry, score, now);
                    (entry, score, action)
                })
                .collect();

            let destructive = planned
                .iter()
                .filter(|(_, _, action)| action.is_destructive())
                .count();
            let tier_size = counts.get(&tier).copied().unwrap_or(0);
            check_deletion_cap(tier, tier_size, destructive)?;

            for (entry, score, action) in planned {
                graph.record_score(entry.id, score, action, now).await?;
                apply_action(graph, &entry, action).await?;
                scored += 1;
                match action {
                    CurationAction::Prune | CurationAction::PruneImmediate => pruned += 1,
                    CurationAction::Demote => demoted += 1,
                    _ => {}
                }
            }
        }

        let archived = graph
            .archive_terminal_tasks(now - Duration::hours(24))
            .await?;

        Ok(HandlerReport::new(
            format!("scored {scored}, demoted {demoted}, pruned {pruned}, archived {archived} tasks"),
            0,
        ))
    }
}

/// `curation_hourly`: promote cold entries that are being read again, and
/// decay confidence on entries nothing has touched in 30 days.
pub struct CurationHourlyHandler;

#[async_trait]
impl CycleHandler for CurationHourlyHandler {
    async fn run(&self, ctx: HandlerContext) -> CoreResult<HandlerReport> {
        let now = Utc::now();
        let graph = ctx.graph.as_ref();

        let cold = graph.score_sample(MemoryTier::Cold, SAMPLE_PER_TIER).await?;
        let mut promoted = 0_u64;
        for entry in cold {
            if entry.access_count_7d > 0 {
                if let Some(up) = entry.tier.promoted() {
                    graph.set_tier(entry.id, up).await?;
                    graph
                        .record_score(
                            entry.id,
                            mvs::score(&entry, now),
                            CurationAction::Promote,
                            now,
                        )
                        .await?;
                    promoted += 1;
                }
            }
        }

        let decayed = graph
            .decay_stale_confidence(now - Duration::days(30), STALE_CONFIDENCE_FACTOR)
            .await?;

        Ok(HandlerReport::new(
            format!("promoted {promoted} cold entries, decayed {decayed} confidences"),
            0,
        ))
    }
}

/// `curation_deep` (every 6 hours): purge elapsed tombstones, drop orphan
/// nodes, and merge near-duplicates by embedding similarity.
pub struct CurationDeepHandler;

#[async_trait]
impl CycleHandler for CurationDeepHandler {
    async fn run(&self, ctx: HandlerContext) -> CoreResult<HandlerReport> {
        let now = Utc::now();
        let graph = ctx.graph.as_ref();

        let purged = graph.purge_tombstoned(now).await?;
        let orphans = graph.delete_orphans().await?;

        // Near-duplicate merges count against the per-tier deletion cap:
        // group planned merges by the tier of the node being merged away.
        let counts = graph.tier_counts().await?;
        let candidates = graph.dedup_candidates(DEDUP_SIMILARITY, 50).await?;
        let mut by_tier: std::collections::HashMap<MemoryTier, Vec<(uuid::Uuid, uuid::Uuid)>> =
            std::collections::HashMap::new();
        for (src, dst) in candidates {
            let Some(entry) = graph.get_memory(src).await? else {
                continue;
            };
            if mvs::is_protected(&entry, now) {
                continue;
            }
            by_tier.entry(entry.tier).or_default().push((src, dst));
        }

        let mut merged = 0_u64;
        for (tier, pairs) in by_tier {
            let tier_size = counts.get(&tier).copied().unwrap_or(0);
            check_deletion_cap(tier, tier_size, pairs.len())?;
            for (src, dst) in pairs {
                match graph.merge_into(src, dst).await {
                    Ok(()) => merged += 1,
                    Err(err) => {
                        tracing::warn!(%src, %dst, error = %err, "dedup merge skipped");
                    }
                }
            }
        }

        Ok(HandlerReport::new(
            format!("purged {purged} tombstones, {orphans} orphans, merged {merged} duplicates"),
            0,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::MemoryGraphStore;
    use crate::domain::models::MemoryLabel;
    use crate::services::cancel::CancelToken;
    use crate::services::registry::TaskRegistry;
    use std::sync::Arc;

    fn ctx(graph: Arc<MemoryGraphStore>) -> HandlerContext {
        HandlerContext {
            graph,
            cancel: CancelToken::new(),
            registry: Arc::new(TaskRegistry::new()),
        }
    }

    fn aged(label: MemoryLabel, tier: MemoryTier, days: i64) -> MemoryEntry {
        MemoryEntry::new(label, tier, Utc::now() - Duration::days(days))
    }

    #[test]
    fn test_cap_math() {
        assert!(check_deletion_cap(MemoryTier::Hot, 100, 5).is_ok());
        assert!(matches!(
            check_deletion_cap(MemoryTier::Hot, 100, 6),
            Err(CoreError::CurationExcess { .. })
        ));
        // A tiny tier allows zero deletions.
        assert!(check_deletion_cap(MemoryTier::Cold, 10, 0).is_ok());
        assert!(check_deletion_cap(MemoryTier::Cold, 10, 1).is_err());
    }

    #[tokio::test]
    async fn test_standard_demotes_stale_session_context() {
        let graph = Arc::new(MemoryGraphStore::new());
        graph.ensure_schema().await.unwrap();
        // Pad the tier so the demotion set stays under the cap.
        for _ in 0..30 {
            graph
                .seed_memory(aged(MemoryLabel::Belief, MemoryTier::Hot, 2))
                .await;
        }
        let stale = aged(MemoryLabel::SessionContext, MemoryTier::Hot, 3);
        let stale_id = stale.id;
        graph.seed_memory(stale).await;

        CurationStandardHandler
            .run(ctx(graph.clone()))
            .await
            .unwrap();

        let entry = graph.memory(stale_id).await.unwrap();
        assert_eq!(entry.tier, MemoryTier::Warm);
        assert!(!entry.tombstone, "demotion must never tombstone");
        assert_eq!(entry.curation_action, Some(CurationAction::Demote));
    }

    #[tokio::test]
    async fn test_standard_never_touches_protected() {
        let graph = Arc::new(MemoryGraphStore::new());
        graph.ensure_schema().await.unwrap();
        let mut belief = aged(MemoryLabel::Belief, MemoryTier::Hot, 400);
        belief.quality = Some(0.95);
        let id = belief.id;
        graph.seed_memory(belief).await;

        CurationStandardHandler
            .run(ctx(graph.clone()))
            .await
            .unwrap();

        let entry = graph.memory(id).await.unwrap();
        assert!(!entry.tombstone);
        assert_eq!(entry.tier, MemoryTier::Hot);
        assert_eq!(entry.curation_action, Some(CurationAction::Keep));
    }

    #[tokio::test]
    async fn test_standard_aborts_on_excess_deletion() {
        let graph = Arc::new(MemoryGraphStore::new());
        graph.ensure_schema().await.unwrap();
        // 20 worthless notifications: the whole tier would prune, far over 5%.
        for _ in 0..20 {
            graph
                .seed_memory(aged(MemoryLabel::Notification, MemoryTier::Cold, 40))
                .await;
        }

        let err = CurationStandardHandler
            .run(ctx(graph.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::CurationExcess { .. }));

        // Nothing was deleted: the pass aborted before applying.
        let counts = graph.tier_counts().await.unwrap();
        assert_eq!(counts.get(&MemoryTier::Cold).copied().unwrap_or(0), 20);
    }

    #[tokio::test]
    async fn test_rapid_sweeps_and_enforces_budget() {
        let graph = Arc::new(MemoryGraphStore::new());
        graph.ensure_schema().await.unwrap();

        let mut fat = aged(MemoryLabel::Research, MemoryTier::Hot, 30);
        fat.token_count = 2_000;
        let fat_id = fat.id;
        graph.seed_memory(fat).await;

        let old_ctx = aged(MemoryLabel::SessionContext, MemoryTier::Warm, 2);
        let old_ctx_id = old_ctx.id;
        graph.seed_memory(old_ctx).await;

        CurationRapidHandler.run(ctx(graph.clone())).await.unwrap();

        // HOT exceeded its 1600-token budget; the entry was demoted.
        assert_eq!(graph.memory(fat_id).await.unwrap().tier, MemoryTier::Warm);
        // Session contexts older than a day are gone.
        assert!(graph.memory(old_ctx_id).await.is_none());
    }

    #[tokio::test]
    async fn test_hourly_promotes_rewarmed_cold_entries() {
        let graph = Arc::new(MemoryGraphStore::new());
        graph.ensure_schema().await.unwrap();

        let mut warm_again = aged(MemoryLabel::Research, MemoryTier::Cold, 30);
        warm_again.access_count_7d = 4;
        let rising_id = warm_again.id;
        graph.seed_memory(warm_again).await;

        let untouched = aged(MemoryLabel::Research, MemoryTier::Cold, 30);
        let flat_id = untouched.id;
        graph.seed_memory(untouched).await;

        CurationHourlyHandler.run(ctx(graph.clone())).await.unwrap();

        assert_eq!(graph.memory(rising_id).await.unwrap().tier, MemoryTier::Warm);
        assert_eq!(graph.memory(flat_id).await.unwrap().tier, MemoryTier::Cold);
    }

    #[tokio::test]
    async fn test_hourly_decays_stale_confidence() {
        let graph = Arc::new(MemoryGraphStore::new());
        graph.ensure_schema().await.unwrap();

        let mut stale = aged(MemoryLabel::Belief, MemoryTier::Warm, 90);
        stale.last_accessed = Utc::now() - Duration::days(45);
        stale.quality = Some(0.5);
        let id = stale.id;
        graph.seed_memory(stale).await;

        CurationHourlyHandler.run(ctx(graph.clone())).await.unwrap();

        let q = graph.memory(id).await.unwrap().quality.unwrap();
        assert!((q - 0.49).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_deep_purges_elapsed_tombstones_and_merges_duplicates() {
        let graph = Arc::new(MemoryGraphStore::new());
        graph.ensure_schema().await.unwrap();

        // An elapsed tombstone.
        let mut dead = aged(MemoryLabel::Research, MemoryTier::Cold, 90);
        dead.tombstone = true;
        dead.deleted_at = Some(Utc::now() - Duration::days(1));
        let dead_id = dead.id;
        graph.seed_memory(dead).await;

        // Two near-identical entries, plus tier padding to stay under cap.
        // Everything carries a relationship so the orphan sweep skips it.
        for _ in 0..40 {
            let mut pad = aged(MemoryLabel::Analysis, MemoryTier::Warm, 10);
            pad.relationship_count = 1;
            graph.seed_memory(pad).await;
        }
        let mut low = aged(MemoryLabel::Research, MemoryTier::Warm, 30);
        low.embedding = Some(vec![1.0, 0.0, 0.1]);
        low.mvs_score = 4.0;
        low.relationship_count = 1;
        let low_id = low.id;
        graph.seed_memory(low).await;

        let mut high = aged(MemoryLabel::Research, MemoryTier::Warm, 30);
        high.embedding = Some(vec![1.0, 0.02, 0.1]);
        high.mvs_score = 7.0;
        high.relationship_count = 1;
        let high_id = high.id;
        graph.seed_memory(high).await;

        CurationDeepHandler.run(ctx(graph.clone())).await.unwrap();

        assert!(graph.memory(dead_id).await.is_none(), "tombstone purged");
        let merged = graph.memory(low_id).await.unwrap();
        assert!(merged.tombstone, "lower-MVS duplicate merged away");
        assert!(graph
            .edges()
            .await
            .contains(&(low_id, "MERGED_INTO".to_string(), high_id)));
    }
}
