use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Unique identifier for an immutable change record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChangeId(pub Uuid);

impl ChangeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ChangeId {
    fn default() -> Self {
        Self::new()
    }
}

/// Unique identifier for a change-set (one DAG node).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChangeSetId(pub Uuid);

impl ChangeSetId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ChangeSetId {
    fn default() -> Self {
        Self::new()
    }
}

/// Unique identifier for a commit wrapping a change-set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CommitId(pub Uuid);

impl CommitId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CommitId {
    fn default() -> Self {
        Self::new()
    }
}

/// Unique identifier for a named version (a mutable tip into the graph).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VersionId(pub Uuid);

impl VersionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for VersionId {
    fn default() -> Self {
        Self::new()
    }
}

/// Identifies "the same thing" across versions and time.
///
/// Two changes describe the same entity iff their keys are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub entity_id: String,
    pub schema_key: String,
    pub file_id: String,
}

impl EntityKey {
    pub fn new(
        entity_id: impl Into<String>,
        schema_key: impl Into<String>,
        file_id: impl Into<String>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            schema_key: schema_key.into(),
            file_id: file_id.into(),
        }
    }
}

/// Millisecond-precision wall-clock timestamp.
///
/// Timestamps are carried for bookkeeping only; no algorithm in the engine
/// breaks ties by time.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current wall-clock time in milliseconds since the unix epoch.
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        Self(millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_id_uniqueness() {
        let a = ChangeId::new();
        let b = ChangeId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn entity_key_equality() {
        let a = EntityKey::new("e1", "note", "f1");
        let b = EntityKey::new("e1", "note", "f1");
        let c = EntityKey::new("e1", "note", "f2");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn entity_key_orders_by_fields() {
        let a = EntityKey::new("a", "note", "f1");
        let b = EntityKey::new("b", "note", "f1");
        assert!(a < b);
    }

    #[test]
    fn timestamp_now_is_positive() {
        assert!(Timestamp::now().0 > 0);
    }
}
