//! Versioned state engine: the facade tying the change log, change-set
//! graph, version registry, and state cache together, with the diff and
//! merge algorithms on top.
//!
//! # Invariants
//! - Every multi-step operation validates its whole input before the first
//!   mutation; a failure surfaces synchronously and leaves no partial state.
//! - Reads go through the state cache, never a full log scan.
//! - Conflicting updates merge with a fixed source-wins policy.

pub mod diff;
pub mod engine;
pub mod merge;

pub use diff::{DiffStatus, EntityDiff};
pub use engine::{CommitRef, Engine, EngineError};

pub fn crate_info() -> &'static str {
    "deltastore-engine v0.1.0"
}
