use crate::engine::{Engine, EngineError};
use deltastore_common::{ChangeId, CommitId, EntityKey, VersionId};
use serde::{Deserialize, Serialize};

/// Classification of one entity between two versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiffStatus {
    /// Visible in source only.
    Created,
    /// Visible in both with different winning changes. Source wins.
    Updated,
    /// Visible in both with the same winning change.
    Unchanged,
    /// Visible in target only (including a source-side tombstone shadowing
    /// target content: deletion wins over content).
    Deleted,
}

/// One row of a version diff.
///
/// `before_*` fields describe the target side, `after_*` the source side;
/// either side is absent for created/deleted rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityDiff {
    pub entity_id: String,
    pub schema_key: String,
    pub file_id: String,
    pub status: DiffStatus,
    pub before_version_id: Option<VersionId>,
    pub before_change_id: Option<ChangeId>,
    pub before_commit_id: Option<CommitId>,
    pub after_version_id: Option<VersionId>,
    pub after_change_id: Option<ChangeId>,
    pub after_commit_id: Option<CommitId>,
}

impl EntityDiff {
    pub fn entity_key(&self) -> EntityKey {
        EntityKey::new(
            self.entity_id.clone(),
            self.schema_key.clone(),
            self.file_id.clone(),
        )
    }
}

impl Engine {
    /// Three-way comparison of two versions' resolved tracked states.
    ///
    /// Enumerates the union of entity keys visible via resolution in either
    /// version (inheritance included) and classifies each. Winners are
    /// compared by change id only; when both sides differ the winner is
    /// always `source`, independent of ancestry and timestamps. Output is in
    /// entity-key order.
    pub fn diff(
        &mut self,
        source: VersionId,
        target: VersionId,
    ) -> Result<Vec<EntityDiff>, EngineError> {
        self.ensure_fresh()?;
        let source_chain = self.versions().inheritance_chain(source)?;
        let target_chain = self.versions().inheritance_chain(target)?;

        let mut all_versions = source_chain.clone();
        all_versions.extend(target_chain.iter().copied());
        let keys = self.cache().tracked_keys(&all_versions);

        let mut diffs = Vec::new();
        for key in keys {
            let source_row = self.cache().resolve_tracked(&source_chain, &key);
            let target_row = self.cache().resolve_tracked(&target_chain, &key);
            let diff = match (source_row, target_row) {
                (None, None) => continue,
                (Some(after), None) => EntityDiff {
                    entity_id: key.entity_id,
                    schema_key: key.schema_key,
                    file_id: key.file_id,
                    status: DiffStatus::Created,
                    before_version_id: None,
                    before_change_id: None,
                    before_commit_id: None,
                    after_version_id: Some(source),
                    after_change_id: after.change_id(),
                    after_commit_id: after.commit_id(),
                },
                (None, Some(before)) => EntityDiff {
                    entity_id: key.entity_id,
                    schema_key: key.schema_key,
                    file_id: key.file_id,
                    status: DiffStatus::Deleted,
                    before_version_id: Some(target),
                    before_change_id: before.change_id(),
                    before_commit_id: before.commit_id(),
                    after_version_id: None,
                    after_change_id: None,
                    after_commit_id: None,
                },
                (Some(after), Some(before)) => EntityDiff {
                    entity_id: key.entity_id,
                    schema_key: key.schema_key,
                    file_id: key.file_id,
                    status: if after.change_id() == before.change_id() {
                        DiffStatus::Unchanged
                    } else {
                        DiffStatus::Updated
                    },
                    before_version_id: Some(target),
                    before_change_id: before.change_id(),
                    before_commit_id: before.commit_id(),
                    after_version_id: Some(source),
                    after_change_id: after.change_id(),
                    after_commit_id: after.commit_id(),
                },
            };
            diffs.push(diff);
        }
        Ok(diffs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deltastore_common::SchemaDef;
    use deltastore_log::Change;
    use serde_json::json;

    fn note_key(entity: &str) -> EntityKey {
        EntityKey::new(entity, "note", "f1")
    }

    fn note(entity: &str, title: &str) -> Change {
        Change::new_snapshot(note_key(entity), "1.0", "plugin_txt", json!({"title": title}))
    }

    /// Two sibling versions branched from a shared root with one entity.
    fn two_branches() -> (Engine, VersionId, VersionId) {
        let mut engine = Engine::in_memory().unwrap();
        engine
            .register_schema(SchemaDef::new("note", "1.0", &["title", "body"]))
            .unwrap();
        let main = engine.active_version().unwrap();
        engine.append_changes(main, vec![note("shared", "base")]).unwrap();
        let source = engine.create_version("source", Some(main), None).unwrap();
        (engine, source, main)
    }

    #[test]
    fn created_only_in_source() {
        let (mut engine, source, target) = two_branches();
        engine.append_changes(source, vec![note("e1", "new")]).unwrap();

        let diffs = engine.diff(source, target).unwrap();
        let row: Vec<_> = diffs
            .iter()
            .filter(|d| d.status == DiffStatus::Created)
            .collect();
        assert_eq!(row.len(), 1);
        assert_eq!(row[0].entity_id, "e1");
        assert!(row[0].before_change_id.is_none());
        assert!(row[0].after_change_id.is_some());
    }

    #[test]
    fn deleted_when_source_tombstones() {
        let (mut engine, source, target) = two_branches();
        engine.delete_entity(source, &note_key("shared")).unwrap();
        engine.commit(source, Default::default()).unwrap();

        let diffs = engine.diff(source, target).unwrap();
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].status, DiffStatus::Deleted);
        assert_eq!(diffs[0].entity_id, "shared");
        assert!(diffs[0].after_change_id.is_none());
        assert!(diffs[0].before_change_id.is_some());
    }

    #[test]
    fn unchanged_when_same_winning_change() {
        let (mut engine, source, target) = two_branches();
        let diffs = engine.diff(source, target).unwrap();
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].status, DiffStatus::Unchanged);
        assert_eq!(diffs[0].before_change_id, diffs[0].after_change_id);
    }

    #[test]
    fn updated_source_wins_without_common_ancestor() {
        // Divergent edits of the same entity in two unrelated versions.
        let mut engine = Engine::in_memory().unwrap();
        engine
            .register_schema(SchemaDef::new("note", "1.0", &["title", "body"]))
            .unwrap();
        let target = engine.active_version().unwrap();
        let source = engine.create_version("source", None, None).unwrap();

        engine.append_changes(target, vec![note("e1", "target edit")]).unwrap();
        let source_commit = engine
            .append_changes(source, vec![note("e1", "source edit")])
            .unwrap()
            .unwrap();

        let diffs = engine.diff(source, target).unwrap();
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].status, DiffStatus::Updated);
        // The winner is always source, regardless of ancestry.
        assert_eq!(diffs[0].after_commit_id, Some(source_commit.commit_id));
        let winner = engine.get_change(diffs[0].after_change_id.unwrap()).unwrap();
        assert_eq!(winner.snapshot.as_ref().unwrap()["title"], json!("source edit"));
    }

    #[test]
    fn diff_is_in_entity_key_order() {
        let (mut engine, source, target) = two_branches();
        engine
            .append_changes(source, vec![note("b", "b"), note("a", "a")])
            .unwrap();
        let diffs = engine.diff(source, target).unwrap();
        let ids: Vec<&str> = diffs.iter().map(|d| d.entity_id.as_str()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn untracked_rows_do_not_take_part() {
        let (mut engine, source, target) = two_branches();
        engine
            .put_untracked(source, &note_key("local"), "plugin_txt", "1.0", Some(json!({"title": "x"})))
            .unwrap();
        let diffs = engine.diff(source, target).unwrap();
        assert!(diffs.iter().all(|d| d.entity_id != "local"));
    }
}
