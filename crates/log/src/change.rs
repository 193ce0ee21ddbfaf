use deltastore_common::{ChangeId, EntityKey, SchemaRegistry, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An immutable record of one entity's new state or deletion.
///
/// `snapshot = None` is a tombstone: the entity was deleted at this point.
/// A change never mutates; a new state is always a new change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub id: ChangeId,
    pub entity_id: String,
    pub schema_key: String,
    pub schema_version: String,
    pub file_id: String,
    pub plugin_key: String,
    pub snapshot: Option<serde_json::Value>,
    pub created_at: Timestamp,
}

impl Change {
    /// A change recording a new entity state.
    pub fn new_snapshot(
        key: EntityKey,
        schema_version: impl Into<String>,
        plugin_key: impl Into<String>,
        snapshot: serde_json::Value,
    ) -> Self {
        Self {
            id: ChangeId::new(),
            entity_id: key.entity_id,
            schema_key: key.schema_key,
            schema_version: schema_version.into(),
            file_id: key.file_id,
            plugin_key: plugin_key.into(),
            snapshot: Some(snapshot),
            created_at: Timestamp::now(),
        }
    }

    /// A tombstone change recording a deletion.
    pub fn new_tombstone(
        key: EntityKey,
        schema_version: impl Into<String>,
        plugin_key: impl Into<String>,
    ) -> Self {
        Self {
            id: ChangeId::new(),
            entity_id: key.entity_id,
            schema_key: key.schema_key,
            schema_version: schema_version.into(),
            file_id: key.file_id,
            plugin_key: plugin_key.into(),
            snapshot: None,
            created_at: Timestamp::now(),
        }
    }

    pub fn entity_key(&self) -> EntityKey {
        EntityKey::new(
            self.entity_id.clone(),
            self.schema_key.clone(),
            self.file_id.clone(),
        )
    }

    pub fn is_tombstone(&self) -> bool {
        self.snapshot.is_none()
    }
}

/// Errors from change store operations.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("duplicate change id {0:?}")]
    DuplicateChange(ChangeId),
    #[error("change references unknown schema `{0}`")]
    UnknownSchema(String),
}

/// Append-only record of immutable changes.
///
/// Keyed by change id in a BTreeMap for deterministic iteration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeStore {
    changes: BTreeMap<ChangeId, Change>,
}

impl ChangeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a batch of changes.
    ///
    /// The whole batch is validated before any insert: a duplicate id
    /// (against the store or within the batch) or an unregistered schema key
    /// rejects the batch and mutates nothing.
    pub fn append(
        &mut self,
        changes: &[Change],
        schemas: &SchemaRegistry,
    ) -> Result<(), LogError> {
        let mut batch_ids = std::collections::BTreeSet::new();
        for change in changes {
            if self.changes.contains_key(&change.id) || !batch_ids.insert(change.id) {
                return Err(LogError::DuplicateChange(change.id));
            }
            if !schemas.contains(&change.schema_key) {
                return Err(LogError::UnknownSchema(change.schema_key.clone()));
            }
        }
        for change in changes {
            self.changes.insert(change.id, change.clone());
        }
        Ok(())
    }

    pub fn get(&self, id: ChangeId) -> Option<&Change> {
        self.changes.get(&id)
    }

    pub fn contains(&self, id: ChangeId) -> bool {
        self.changes.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Iterate all changes in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Change> {
        self.changes.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deltastore_common::SchemaDef;
    use serde_json::json;

    fn registry() -> SchemaRegistry {
        let mut reg = SchemaRegistry::new();
        reg.register(SchemaDef::new("note", "1.0", &["title", "body"]))
            .unwrap();
        reg
    }

    fn note_change(entity_id: &str) -> Change {
        Change::new_snapshot(
            EntityKey::new(entity_id, "note", "f1"),
            "1.0",
            "plugin_txt",
            json!({"title": "hello"}),
        )
    }

    #[test]
    fn append_and_get() {
        let reg = registry();
        let mut store = ChangeStore::new();
        let change = note_change("e1");
        let id = change.id;
        store.append(&[change], &reg).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(id).unwrap().entity_id, "e1");
    }

    #[test]
    fn duplicate_id_rejected_and_nothing_inserted() {
        let reg = registry();
        let mut store = ChangeStore::new();
        let change = note_change("e1");
        store.append(std::slice::from_ref(&change), &reg).unwrap();

        let other = note_change("e2");
        let dup = Change {
            id: change.id,
            ..note_change("e3")
        };
        let err = store.append(&[other, dup], &reg);
        assert!(matches!(err, Err(LogError::DuplicateChange(_))));
        // The valid change in the failed batch must not have landed.
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn duplicate_within_batch_rejected() {
        let reg = registry();
        let mut store = ChangeStore::new();
        let change = note_change("e1");
        let dup = change.clone();
        assert!(store.append(&[change, dup], &reg).is_err());
        assert!(store.is_empty());
    }

    #[test]
    fn unknown_schema_rejected() {
        let reg = registry();
        let mut store = ChangeStore::new();
        let change = Change::new_snapshot(
            EntityKey::new("e1", "ghost", "f1"),
            "1.0",
            "plugin_txt",
            json!({}),
        );
        assert!(matches!(
            store.append(&[change], &reg),
            Err(LogError::UnknownSchema(_))
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn tombstone_has_no_snapshot() {
        let t = Change::new_tombstone(EntityKey::new("e1", "note", "f1"), "1.0", "plugin_txt");
        assert!(t.is_tombstone());
        assert!(t.snapshot.is_none());
    }

    #[test]
    fn entity_key_roundtrip() {
        let change = note_change("e9");
        assert_eq!(change.entity_key(), EntityKey::new("e9", "note", "f1"));
    }
}
