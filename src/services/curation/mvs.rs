//! Memory Value Score.
//!
//! MVS is a scalar priority over memory-family nodes:
//!
//! ```text
//! MVS = (type_weight + recency + frequency + quality + centrality
//!        + cross_agent − bloat) × safety_multiplier
//! ```
//!
//! Every term is bounded, and the safety multiplier lifts protected nodes
//! above the hard-protection threshold so no curation action can touch
//! them. Scoring is pure; all state effects live in the handlers.

use chrono::{DateTime, Duration, Utc};

use crate::domain::models::{CurationAction, MemoryEntry, MemoryLabel};

/// Score at or above which a node is hard-protected.
pub const HARD_PROTECT_THRESHOLD: f64 = 50.0;

/// Multiplier applied to protected nodes.
pub const SAFETY_MULTIPLIER: f64 = 100.0;

/// Tombstoned nodes are physically purged this long after pruning.
pub const PRUNE_GRACE_DAYS: i64 = 30;

/// Fixed per-label weight.
pub fn type_weight(label: MemoryLabel) -> f64 {
    match label {
        MemoryLabel::Belief => 10.0,
        MemoryLabel::LearnedCapability => 9.0,
        MemoryLabel::Synthesis => 8.0,
        MemoryLabel::Reflection => 7.0,
        MemoryLabel::Analysis => 6.0,
        MemoryLabel::Research => 5.0,
        MemoryLabel::CompressedContext => 3.0,
        MemoryLabel::SessionContext => 1.5,
        MemoryLabel::Notification => 0.5,
    }
}

/// Per-label recency half-life, in days.
pub fn half_life_days(label: MemoryLabel) -> f64 {
    match label {
        MemoryLabel::LearnedCapability => 365.0,
        MemoryLabel::Belief => 180.0,
        MemoryLabel::Synthesis => 120.0,
        MemoryLabel::Reflection => 90.0,
        MemoryLabel::Research => 60.0,
        MemoryLabel::Analysis => 45.0,
        MemoryLabel::CompressedContext => 30.0,
        MemoryLabel::SessionContext | MemoryLabel::Notification => 1.0,
    }
}

/// `3.0 * 0.5^(age / half_life)`, in [0, 3].
pub fn recency_bonus(age_days: f64, half_life: f64) -> f64 {
    if half_life <= 0.0 {
        return 0.0;
    }
    (3.0 * 0.5_f64.powf(age_days.max(0.0) / half_life)).clamp(0.0, 3.0)
}

/// `2.0 * log10(1 + n) / log10(101)`, capped at 2.
pub fn frequency_bonus(access_count_7d: u32) -> f64 {
    (2.0 * (1.0 + f64::from(access_count_7d)).log10() / 101_f64.log10()).clamp(0.0, 2.0)
}

/// Typed quality signal mapped to [0, 2].
pub fn quality_bonus(quality: Option<f64>) -> f64 {
    quality.map_or(0.0, |q| (q * 2.0).clamp(0.0, 2.0))
}

/// `min(1.5, 0.1 * incident relationships)`.
pub fn centrality_bonus(relationship_count: u32) -> f64 {
    (0.1 * f64::from(relationship_count)).min(1.5)
}

/// `0.5 * distinct agents in 7d`, capped at 2.
pub fn cross_agent_bonus(distinct_agents_7d: u32) -> f64 {
    (0.5 * f64::from(distinct_agents_7d)).min(2.0)
}

/// `min(1.5, max(0, (tokens − target) / 1000))`.
pub fn bloat_penalty(token_count: u64, target_tokens: u64) -> f64 {
    let excess = token_count.saturating_sub(target_tokens) as f64 / 1000.0;
    excess.clamp(0.0, 1.5)
}

/// Whether a node is in the protected set. Within the memory family that
/// means a high-confidence belief or anything created in the last day;
/// infrastructure labels (agents, keys, config, migrations, live tasks)
/// never enter the scoring sample at all.
pub fn is_protected(entry: &MemoryEntry, now: DateTime<Utc>) -> bool {
    if entry.label == MemoryLabel::Belief && entry.quality.unwrap_or(0.0) >= 0.9 {
        return true;
    }
    entry.created_at > now - Duration::hours(24)
}

pub fn safety_multiplier(entry: &MemoryEntry, now: DateTime<Utc>) -> f64 {
    if is_protected(entry, now) {
        SAFETY_MULTIPLIER
    } else {
        1.0
    }
}

/// Compute the full score for one node at `now`.
pub fn score(entry: &MemoryEntry, now: DateTime<Utc>) -> f64 {
    let base = type_weight(entry.label)
        + recency_bonus(entry.age_days(now), half_life_days(entry.label))
        + frequency_bonus(entry.access_count_7d)
        + quality_bonus(entry.quality)
        + centrality_bonus(entry.relationship_count)
        + cross_agent_bonus(entry.distinct_agents_7d)
        - bloat_penalty(entry.token_count, entry.target_tokens);
    base * safety_multiplier(entry, now)
}

/// Map a score to the action the standard pass takes.
///
/// The 3–5 band returns `Improve`; the caller upgrades it to `Merge` only
/// when a similar higher-scored node actually exists.
pub fn action_for(entry: &MemoryEntry, mvs: f64, now: DateTime<Utc>) -> CurationAction {
    if is_protected(entry, now) || mvs >= HARD_PROTECT_THRESHOLD {
        return CurationAction::Keep;
    }
    if mvs >= 8.0 {
        CurationAction::Keep
    } else if mvs >= 5.0 {
        if bloat_penalty(entry.token_count, entry.target_tokens) > 0.5 {
            CurationAction::Compress
        } else {
            CurationAction::Keep
        }
    } else if mvs >= 3.0 {
        CurationAction::Improve
    } else if mvs >= 1.5 {
        CurationAction::Demote
    } else if mvs >= 0.5 {
        CurationAction::Prune
    } else if entry.label.is_ephemeral() {
        CurationAction::PruneImmediate
    } else {
        CurationAction::Prune
    }
}
