//! State cache: per-schema materialized tables resolving "what does entity X
//! look like under version V" without replaying the graph.
//!
//! # Invariants
//! - Tracked rows are a pure projection of the change log; they can be
//!   dropped and rebuilt at any time with no loss of correctness.
//! - Untracked rows bypass the log and survive rebuilds.
//! - A failed materialization batch writes no rows.
//! - Tombstones block inheritance; they never remove parent rows.

pub mod row;
pub mod state;

pub use row::{CacheRow, Provenance, ResolvedRow};
pub use state::{CacheError, SchemaTable, StateCache};

pub fn crate_info() -> &'static str {
    "deltastore-cache v0.1.0"
}
