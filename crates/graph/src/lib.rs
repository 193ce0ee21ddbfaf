//! Change-set graph: the DAG of change-sets and commits, ancestry and leaf
//! queries, and the version registry.
//!
//! # Invariants
//! - Ancestry and leaf computation are iterative worklist traversals; no
//!   recursion, so arbitrarily deep histories are safe.
//! - Ties between divergent branches are broken by DAG reachability only,
//!   never by timestamp.
//! - Version inheritance forms a tree; cycles are detected and rejected.

pub mod graph;
pub mod version;

pub use graph::{ChangeSet, ChangeSetElement, ChangeSetGraph, Commit, GraphError};
pub use version::{Version, VersionError, VersionRegistry};

pub fn crate_info() -> &'static str {
    "deltastore-graph v0.1.0"
}
