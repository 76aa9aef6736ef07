//! Curation safety: the per-tier deletion cap and protected-node
//! invariants, plus the banded demotion behaviour.

use std::sync::Arc;

use cadence::adapters::MemoryGraphStore;
use cadence::domain::errors::CoreError;
use cadence::domain::models::{CurationAction, MemoryEntry, MemoryLabel, MemoryTier};
use cadence::domain::ports::GraphStore;
use cadence::services::curation::mvs;
use cadence::services::curation::{check_deletion_cap, CurationStandardHandler};
use cadence::services::registry::{HandlerContext, TaskRegistry};
use cadence::services::{CancelToken, CycleHandler};
use chrono::{Duration, Utc};
use proptest::prelude::*;

fn ctx(graph: Arc<MemoryGraphStore>) -> HandlerContext {
    HandlerContext {
        graph,
        cancel: CancelToken::new(),
        registry: Arc::new(TaskRegistry::new()),
    }
}

fn entry(label: MemoryLabel, tier: MemoryTier, age_days: i64) -> MemoryEntry {
    MemoryEntry::new(label, tier, Utc::now() - Duration::days(age_days))
}

// P4: at most 5% of a tier per run; a 6% delete set aborts.
#[test]
fn deletion_cap_boundary() {
    assert!(check_deletion_cap(MemoryTier::Warm, 100, 5).is_ok());
    let err = check_deletion_cap(MemoryTier::Warm, 100, 6).unwrap_err();
    assert!(matches!(err, CoreError::CurationExcess { .. }));
}

#[tokio::test]
async fn oversized_prune_set_aborts_pass_without_deleting() {
    let graph = Arc::new(MemoryGraphStore::new());
    graph.ensure_schema().await.unwrap();

    // 50 stale notifications in COLD: all would prune, far over the cap.
    for _ in 0..50 {
        graph
            .seed_memory(entry(MemoryLabel::Notification, MemoryTier::Cold, 45))
            .await;
    }

    let err = CurationStandardHandler
        .run(ctx(graph.clone()))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::CurationExcess { .. }));

    let counts = graph.tier_counts().await.unwrap();
    assert_eq!(
        counts.get(&MemoryTier::Cold).copied().unwrap_or(0),
        50,
        "abort must leave the tier untouched"
    );
}

proptest! {
    // P5: a protected node is never tombstoned, whatever its other fields.
    #[test]
    fn protected_nodes_are_never_pruned(
        access in 0_u32..200,
        agents in 0_u32..10,
        rels in 0_u32..50,
        tokens in 0_u64..50_000,
        quality in proptest::option::of(0.0_f64..=1.0),
        age_hours in 0_i64..12,
    ) {
        let now = Utc::now();
        let mut e = MemoryEntry::new(
            MemoryLabel::SessionContext,
            MemoryTier::Hot,
            now - Duration::hours(age_hours),
        );
        e.access_count_7d = access;
        e.distinct_agents_7d = agents;
        e.relationship_count = rels;
        e.token_count = tokens;
        e.quality = quality;

        // Under 24h old: always protected.
        prop_assert!(mvs::is_protected(&e, now));
        let score = mvs::score(&e, now);
        prop_assert!(score >= mvs::HARD_PROTECT_THRESHOLD);
        prop_assert_eq!(mvs::action_for(&e, score, now), CurationAction::Keep);
    }

    #[test]
    fn high_confidence_beliefs_are_protected_at_any_age(
        age_days in 0_i64..2_000,
        confidence in 0.9_f64..=1.0,
    ) {
        let now = Utc::now();
        let mut e = MemoryEntry::new(
            MemoryLabel::Belief,
            MemoryTier::Cold,
            now - Duration::days(age_days),
        );
        e.quality = Some(confidence);

        let score = mvs::score(&e, now);
        prop_assert_eq!(mvs::action_for(&e, score, now), CurationAction::Keep);
    }

    // Demotion band never tombstones: the action one band above prune is
    // always a tier move.
    #[test]
    fn demote_band_is_never_destructive(age_days in 2_i64..60) {
        let now = Utc::now();
        let e = MemoryEntry::new(
            MemoryLabel::SessionContext,
            MemoryTier::Hot,
            now - Duration::days(age_days),
        );
        let score = mvs::score(&e, now);
        let action = mvs::action_for(&e, score, now);
        if (1.5..3.0).contains(&score) {
            prop_assert_eq!(action, CurationAction::Demote);
        }
        prop_assert!(action != CurationAction::Merge || score >= 3.0);
    }
}

// Scenario: a 3-day-old session context lands in the demote band and
// moves one tier down, without a tombstone.
#[tokio::test]
async fn stale_session_context_demotes_one_tier() {
    let graph = Arc::new(MemoryGraphStore::new());
    graph.ensure_schema().await.unwrap();

    let stale = entry(MemoryLabel::SessionContext, MemoryTier::Hot, 3);
    let id = stale.id;
    let score = mvs::score(&stale, Utc::now());
    assert!(
        (1.5..3.0).contains(&score),
        "expected the demote band, got {score}"
    );
    graph.seed_memory(stale).await;

    CurationStandardHandler
        .run(ctx(graph.clone()))
        .await
        .unwrap();

    let after = graph.memory(id).await.unwrap();
    assert_eq!(after.tier, MemoryTier::Warm);
    assert!(!after.tombstone);
    assert!(after.deleted_at.is_none());
    assert!(after.last_curated_at.is_some());
}

#[tokio::test]
async fn merge_direction_follows_score_order() {
    let graph = Arc::new(MemoryGraphStore::new());
    graph.ensure_schema().await.unwrap();

    let mut keeper = entry(MemoryLabel::Research, MemoryTier::Warm, 10);
    keeper.mvs_score = 8.0;
    let mut duplicate = entry(MemoryLabel::Research, MemoryTier::Warm, 20);
    duplicate.mvs_score = 2.0;
    graph.seed_memory(keeper.clone()).await;
    graph.seed_memory(duplicate.clone()).await;

    // I5 direction guard: the higher-MVS node absorbs the lower.
    assert!(graph.merge_into(keeper.id, duplicate.id).await.is_err());
    graph.merge_into(duplicate.id, keeper.id).await.unwrap();

    let absorbed = graph.memory(duplicate.id).await.unwrap();
    assert!(absorbed.tombstone);
    let kept = graph.memory(keeper.id).await.unwrap();
    assert!(!kept.tombstone);
}
