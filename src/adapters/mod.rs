//! Graph store adapters.
//!
//! `neo4j` is the production bolt client; `memory` is the in-process
//! implementation the tests run against; `resilient` wraps either with
//! the retry/degraded-mode policies.

pub mod memory;
pub mod neo4j;
pub mod resilient;

pub use memory::MemoryGraphStore;
pub use neo4j::{validate_graph_uri, Neo4jGraphStore};
pub use resilient::{ResilientStore, StoreMode};
