//! Shared vocabulary for the deltastore workspace: identifiers, entity keys,
//! timestamps, and the schema registry.
//!
//! # Invariants
//! - Ids are uuid-v4 newtypes, globally unique, never reused.
//! - All id types are `Ord` so BTreeMap iteration is deterministic.
//! - Schema property columns are fixed at registration time.

pub mod ids;
pub mod schema;

pub use ids::{ChangeId, ChangeSetId, CommitId, EntityKey, Timestamp, VersionId};
pub use schema::{SchemaDef, SchemaError, SchemaRegistry, ViewVariant};

pub fn crate_info() -> &'static str {
    "deltastore-common v0.1.0"
}
