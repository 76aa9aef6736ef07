//! Memory graph domain model.
//!
//! Every curated node belongs to the `MemoryEntry` family: a label, a tier,
//! an MVS score, and the access/bloat fields the scoring formula reads.
//! Payload fields are opaque to the coordination plane.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Storage tier of a memory node. Demotion walks one step right.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MemoryTier {
    Hot,
    Warm,
    Cold,
    Archived,
}

impl MemoryTier {
    pub const ALL: [MemoryTier; 4] = [Self::Hot, Self::Warm, Self::Cold, Self::Archived];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hot => "HOT",
            Self::Warm => "WARM",
            Self::Cold => "COLD",
            Self::Archived => "ARCHIVED",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "HOT" => Some(Self::Hot),
            "WARM" => Some(Self::Warm),
            "COLD" => Some(Self::Cold),
            "ARCHIVED" => Some(Self::Archived),
            _ => None,
        }
    }

    /// The next tier down, if any.
    pub fn demoted(&self) -> Option<MemoryTier> {
        match self {
            Self::Hot => Some(Self::Warm),
            Self::Warm => Some(Self::Cold),
            Self::Cold => Some(Self::Archived),
            Self::Archived => None,
        }
    }

    /// The next tier up, if any.
    pub fn promoted(&self) -> Option<MemoryTier> {
        match self {
            Self::Hot => None,
            Self::Warm => Some(Self::Hot),
            Self::Cold => Some(Self::Warm),
            Self::Archived => Some(Self::Cold),
        }
    }

    /// Per-tier token budget enforced by the rapid curation pass.
    pub fn token_budget(&self) -> Option<u64> {
        match self {
            Self::Hot => Some(1_600),
            Self::Warm => Some(400),
            Self::Cold => Some(200),
            Self::Archived => None,
        }
    }
}

/// Node label within the memory family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryLabel {
    Belief,
    Reflection,
    Analysis,
    Synthesis,
    Research,
    LearnedCapability,
    SessionContext,
    CompressedContext,
    Notification,
}

impl MemoryLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Belief => "Belief",
            Self::Reflection => "Reflection",
            Self::Analysis => "Analysis",
            Self::Synthesis => "Synthesis",
            Self::Research => "Research",
            Self::LearnedCapability => "LearnedCapability",
            Self::SessionContext => "SessionContext",
            Self::CompressedContext => "CompressedContext",
            Self::Notification => "Notification",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "Belief" => Some(Self::Belief),
            "Reflection" => Some(Self::Reflection),
            "Analysis" => Some(Self::Analysis),
            "Synthesis" => Some(Self::Synthesis),
            "Research" => Some(Self::Research),
            "LearnedCapability" => Some(Self::LearnedCapability),
            "SessionContext" => Some(Self::SessionContext),
            "CompressedContext" => Some(Self::CompressedContext),
            "Notification" => Some(Self::Notification),
            _ => None,
        }
    }

    /// Ephemeral labels are pruned immediately below the floor threshold
    /// instead of soft-deleted.
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, Self::Notification | Self::SessionContext)
    }
}

/// Action chosen by a curation pass for one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CurationAction {
    Keep,
    /// Keep, but flag the payload for compression.
    Compress,
    /// Enrich metadata in place.
    Improve,
    /// Fold into a near-duplicate with a higher score.
    Merge,
    /// Move one tier down.
    Demote,
    /// Move one tier up.
    Promote,
    /// Soft-delete: tombstone now, physical purge later.
    Prune,
    /// Physical delete in the same pass (ephemeral labels only).
    PruneImmediate,
}

impl CurationAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Keep => "keep",
            Self::Compress => "compress",
            Self::Improve => "improve",
            Self::Merge => "merge",
            Self::Demote => "demote",
            Self::Promote => "promote",
            Self::Prune => "prune",
            Self::PruneImmediate => "prune_immediate",
        }
    }

    /// Whether this action removes the node from its tier (counts against
    /// the per-pass deletion cap).
    pub fn is_destructive(&self) -> bool {
        matches!(self, Self::Merge | Self::Prune | Self::PruneImmediate)
    }
}

/// A memory-family node as read back for scoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: Uuid,
    pub label: MemoryLabel,
    pub tier: MemoryTier,
    pub mvs_score: f64,
    pub access_count_7d: u32,
    /// Distinct agents that touched the node in the last 7 days.
    pub distinct_agents_7d: u32,
    /// Incident relationship count (in + out).
    pub relationship_count: u32,
    /// Payload size in tokens.
    pub token_count: u64,
    /// Target payload size for the bloat penalty.
    pub target_tokens: u64,
    /// Typed quality signal in [0, 1]; confidence, severity, or
    /// reliability depending on label.
    pub quality: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub last_curated_at: Option<DateTime<Utc>>,
    pub curation_action: Option<CurationAction>,
    pub tombstone: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    /// Payload embedding, when the producing pipeline attached one.
    /// Used only by the deduplication pass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl MemoryEntry {
    /// Minimal entry for tests and seeding.
    pub fn new(label: MemoryLabel, tier: MemoryTier, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            label,
            tier,
            mvs_score: 0.0,
            access_count_7d: 0,
            distinct_agents_7d: 0,
            relationship_count: 0,
            token_count: 0,
            target_tokens: 500,
            quality: None,
            created_at,
            last_accessed: created_at,
            last_curated_at: None,
            curation_action: None,
            tombstone: false,
            deleted_at: None,
            embedding: None,
        }
    }

    pub fn age_days(&self, now: DateTime<Utc>) -> f64 {
        (now - self.created_at).num_seconds().max(0) as f64 / 86_400.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_demotion_chain() {
        assert_eq!(MemoryTier::Hot.demoted(), Some(MemoryTier::Warm));
        assert_eq!(MemoryTier::Warm.demoted(), Some(MemoryTier::Cold));
        assert_eq!(MemoryTier::Cold.demoted(), Some(MemoryTier::Archived));
        assert_eq!(MemoryTier::Archived.demoted(), None);
    }

    #[test]
    fn test_tier_budgets() {
        assert_eq!(MemoryTier::Hot.token_budget(), Some(1_600));
        assert_eq!(MemoryTier::Warm.token_budget(), Some(400));
        assert_eq!(MemoryTier::Cold.token_budget(), Some(200));
        assert_eq!(MemoryTier::Archived.token_budget(), None);
    }

    #[test]
    fn test_ephemeral_labels() {
        assert!(MemoryLabel::Notification.is_ephemeral());
        assert!(MemoryLabel::SessionContext.is_ephemeral());
        assert!(!MemoryLabel::Belief.is_ephemeral());
    }

    #[test]
    fn test_destructive_actions() {
        assert!(CurationAction::Prune.is_destructive());
        assert!(CurationAction::Merge.is_destructive());
        assert!(!CurationAction::Demote.is_destructive());
        assert!(!CurationAction::Keep.is_destructive());
    }
}
