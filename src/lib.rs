//! Cadence - unified heartbeat scheduler and agent coordination plane.
//!
//! Coordinates a fixed six-agent swarm over a shared property graph:
//! - One 5-minute cycle runner driving all background maintenance
//! - Atomic task delegation with HMAC-authenticated messaging
//! - Two-tier liveness with standby failover for the orchestrator
//! - MVS-driven curation of the operational memory graph

pub mod adapters;
pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

pub use domain::errors::{CoreError, CoreResult};
pub use domain::ports::GraphStore;
