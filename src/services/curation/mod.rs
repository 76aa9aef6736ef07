//! MVS-driven memory curation.
//!
//! `mvs` holds the pure scoring formula and action bands; `handlers` the
//! four scheduled passes that apply them to the graph.

pub mod handlers;
pub mod mvs;

pub use handlers::{
    check_deletion_cap, CurationDeepHandler, CurationHourlyHandler, CurationRapidHandler,
    CurationStandardHandler, DEDUP_SIMILARITY, DELETION_CAP_PERCENT, SAMPLE_PER_TIER,
};
