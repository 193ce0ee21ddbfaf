use deltastore_common::{ChangeId, CommitId, Timestamp, VersionId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Where a resolved row came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Provenance {
    /// Tracked row owned by the queried version.
    Tracked,
    /// Untracked row owned by the queried version.
    Untracked,
    /// Tracked row inherited from an ancestor version.
    TrackedInherited,
    /// Untracked row inherited from an ancestor version.
    UntrackedInherited,
}

/// One materialized row in a schema table.
///
/// Primary key is `(entity_id, file_id, version_id)` within the table of
/// `schema_key`. `change_id`/`commit_id` are `None` only for untracked rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRow {
    pub entity_id: String,
    pub schema_key: String,
    pub file_id: String,
    pub version_id: VersionId,
    pub plugin_key: String,
    pub schema_version: String,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub change_id: Option<ChangeId>,
    pub commit_id: Option<CommitId>,
    /// Set on resolution output when the row was inherited; storage rows
    /// always carry `None` (rows live under the version that owns them).
    pub inherited_from: Option<VersionId>,
    pub is_tombstone: bool,
    pub properties: BTreeMap<String, serde_json::Value>,
}

/// The outcome of resolving an entity key under a version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedRow {
    pub row: CacheRow,
    pub provenance: Provenance,
}

impl ResolvedRow {
    pub fn change_id(&self) -> Option<ChangeId> {
        self.row.change_id
    }

    pub fn commit_id(&self) -> Option<CommitId> {
        self.row.commit_id
    }

    pub fn is_inherited(&self) -> bool {
        matches!(
            self.provenance,
            Provenance::TrackedInherited | Provenance::UntrackedInherited
        )
    }
}

/// Table primary key `(entity_id, file_id, version_id)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct RowKey {
    pub entity_id: String,
    pub file_id: String,
    pub version_id: VersionId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_key_orders_by_entity_then_file_then_version() {
        let v = VersionId::new();
        let a = RowKey {
            entity_id: "a".into(),
            file_id: "f1".into(),
            version_id: v,
        };
        let b = RowKey {
            entity_id: "b".into(),
            file_id: "f0".into(),
            version_id: v,
        };
        assert!(a < b);
    }

    #[test]
    fn provenance_inherited_flags() {
        let row = CacheRow {
            entity_id: "e".into(),
            schema_key: "note".into(),
            file_id: "f".into(),
            version_id: VersionId::new(),
            plugin_key: "p".into(),
            schema_version: "1.0".into(),
            created_at: Timestamp(0),
            updated_at: Timestamp(0),
            change_id: None,
            commit_id: None,
            inherited_from: None,
            is_tombstone: false,
            properties: BTreeMap::new(),
        };
        let resolved = ResolvedRow {
            row,
            provenance: Provenance::TrackedInherited,
        };
        assert!(resolved.is_inherited());
    }
}
