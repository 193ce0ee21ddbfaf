//! File-backed durability for the change log and graph.
//!
//! Layout inside the store directory:
//! ```text
//! store.meta.json          - format versions, segment count, graph file hash
//! changes/
//!   000001.changes.cbor.zst - CBOR+zstd compressed change segments
//! graph/
//!   graph.cbor.zst          - change-sets, commits, versions (rewritten on checkpoint)
//! integrity/
//!   manifest.json           - hash chain over change segments
//! ```
//!
//! # Invariants
//! - Change segments are append-only and hash-chained; the graph snapshot is
//!   rewritten whole and verified against the hash recorded in the metadata.
//! - Integrity and format-version mismatches fail closed on open/load.

pub mod store;

pub use store::{DurableStore, GraphSnapshot, PersistError, StoreMeta};

pub fn crate_info() -> &'static str {
    "deltastore-persist v0.1.0"
}
