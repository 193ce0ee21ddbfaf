use deltastore_cache::{CacheError, ResolvedRow, StateCache};
use deltastore_common::{
    ChangeId, ChangeSetId, CommitId, EntityKey, SchemaDef, SchemaError, SchemaRegistry, VersionId,
};
use deltastore_graph::{
    ChangeSetElement, ChangeSetGraph, GraphError, Version, VersionError, VersionRegistry,
};
use deltastore_log::{Change, ChangeStore, LogError};
use deltastore_persist::{DurableStore, GraphSnapshot, PersistError};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

/// Errors surfaced by engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Log(#[from] LogError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Version(#[from] VersionError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Persist(#[from] PersistError),
    #[error("change {0:?} is not in the change store")]
    UnknownChange(ChangeId),
    #[error("entity {0:?} not found")]
    EntityNotFound(EntityKey),
    #[error("no active version set")]
    NoActiveVersion,
}

/// Reference to a freshly created commit and its change-set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitRef {
    pub commit_id: CommitId,
    pub change_set_id: ChangeSetId,
}

/// The versioned state engine.
///
/// Single-writer embedded model: every mutation takes `&mut self`, so one
/// logical writer per store is enforced by the type system. The change log
/// is the source of truth; the cache is a rebuildable projection.
pub struct Engine {
    pub(crate) schemas: SchemaRegistry,
    pub(crate) changes: ChangeStore,
    pub(crate) graph: ChangeSetGraph,
    pub(crate) versions: VersionRegistry,
    pub(crate) cache: StateCache,
    pub(crate) durable: Option<DurableStore>,
}

impl Engine {
    /// A purely in-memory engine with a bootstrap `main` version set active.
    pub fn in_memory() -> Result<Self, EngineError> {
        let mut engine = Self {
            schemas: SchemaRegistry::new(),
            changes: ChangeStore::new(),
            graph: ChangeSetGraph::new(),
            versions: VersionRegistry::new(),
            cache: StateCache::new(),
            durable: None,
        };
        let main = engine.bootstrap_version("main", None)?;
        engine.versions.set_active(main)?;
        Ok(engine)
    }

    /// Open or create a file-backed engine at `path`.
    ///
    /// Restores the graph snapshot, replays all change segments into the
    /// change store, and leaves the cache stale for lazy rebuild.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let durable = DurableStore::open(path)?;
        match durable.load_graph()? {
            Some(snapshot) => {
                let replayed = durable.load_changes()?;
                let mut engine = Self {
                    schemas: snapshot.schemas,
                    changes: ChangeStore::new(),
                    graph: snapshot.graph,
                    versions: snapshot.versions,
                    cache: StateCache::new(),
                    durable: Some(durable),
                };
                engine.changes.append(&replayed, &engine.schemas)?;
                engine.cache.mark_stale();
                info!(changes = engine.changes.len(), "restored store");
                Ok(engine)
            }
            None => {
                let mut engine = Self {
                    schemas: SchemaRegistry::new(),
                    changes: ChangeStore::new(),
                    graph: ChangeSetGraph::new(),
                    versions: VersionRegistry::new(),
                    cache: StateCache::new(),
                    durable: Some(durable),
                };
                let main = engine.bootstrap_version("main", None)?;
                engine.versions.set_active(main)?;
                engine.save_graph()?;
                Ok(engine)
            }
        }
    }

    // --- Schema port ---

    pub fn register_schema(&mut self, def: SchemaDef) -> Result<(), EngineError> {
        self.schemas.register(def)?;
        self.save_graph()?;
        Ok(())
    }

    pub fn schemas(&self) -> &SchemaRegistry {
        &self.schemas
    }

    // --- Version registry port ---

    /// Create a version. With `from`, the new version branches off that
    /// version's tip (sharing its whole history); without, it starts from a
    /// fresh empty root commit. `inherits_from` additionally lets the new
    /// version see a parent version's entities it has not overridden.
    pub fn create_version(
        &mut self,
        name: &str,
        from: Option<VersionId>,
        inherits_from: Option<VersionId>,
    ) -> Result<VersionId, EngineError> {
        let id = match from {
            Some(from_id) => {
                let tip = self.versions.require(from_id)?.commit_id;
                self.create_version_at(name, tip, inherits_from)?
            }
            None => self.bootstrap_version(name, inherits_from)?,
        };
        // Materialize the new version's rows so branched history is
        // immediately readable.
        self.populate_state_cache(Some(id))?;
        self.save_graph()?;
        Ok(id)
    }

    pub fn version(&self, id: VersionId) -> Result<&Version, EngineError> {
        Ok(self.versions.require(id)?)
    }

    pub fn version_by_name(&self, name: &str) -> Option<&Version> {
        self.versions.by_name(name)
    }

    pub fn versions(&self) -> &VersionRegistry {
        &self.versions
    }

    pub fn active_version(&self) -> Result<VersionId, EngineError> {
        self.versions.active().ok_or(EngineError::NoActiveVersion)
    }

    pub fn set_active_version(&mut self, id: VersionId) -> Result<(), EngineError> {
        self.versions.set_active(id)?;
        self.save_graph()?;
        Ok(())
    }

    // --- Write port ---

    /// Stage changes into a version's working change-set.
    ///
    /// Changes land in the change store immediately (append-only) and the
    /// rows become readable under the version; they are not part of
    /// committed history until [`Engine::commit`].
    pub fn stage_changes(
        &mut self,
        version_id: VersionId,
        changes: Vec<Change>,
    ) -> Result<(), EngineError> {
        if changes.is_empty() {
            return Ok(());
        }
        let working_commit = self.versions.require(version_id)?.working_commit_id;
        let working_cs = self.graph.require_commit(working_commit)?.change_set_id;

        // Validate the cache application before touching the log so a
        // rejected batch leaves no trace anywhere.
        self.cache.check(
            &self.schemas,
            changes.iter().map(|c| (c, working_commit)),
            version_id,
        )?;
        self.changes.append(&changes, &self.schemas)?;
        for change in &changes {
            self.graph
                .put_element(ChangeSetElement::new(working_cs, change.id, change.entity_key()))?;
        }
        self.cache.materialize(
            &self.schemas,
            changes.iter().map(|c| (c, working_commit)),
            version_id,
        )?;
        if let Some(durable) = &mut self.durable {
            durable.append_segment(&changes)?;
        }
        debug!(count = changes.len(), version = ?version_id, "staged changes");
        Ok(())
    }

    /// Promote the working change-set to the version tip.
    ///
    /// The working commit becomes the new tip (so cache rows staged against
    /// it already carry the right commit id) and a fresh working change-set
    /// is opened on top. An empty working set is a no-op.
    pub fn commit(
        &mut self,
        version_id: VersionId,
        metadata: BTreeMap<String, String>,
    ) -> Result<Option<CommitRef>, EngineError> {
        let working_commit = self.versions.require(version_id)?.working_commit_id;
        let working_cs = self.graph.require_commit(working_commit)?.change_set_id;
        if self.graph.require_change_set(working_cs)?.is_empty() {
            return Ok(None);
        }
        if !metadata.is_empty() {
            self.graph.set_metadata(working_cs, metadata)?;
        }
        self.versions.advance_tip(version_id, working_commit)?;
        self.open_working(version_id)?;
        self.save_graph()?;
        Ok(Some(CommitRef {
            commit_id: working_commit,
            change_set_id: working_cs,
        }))
    }

    /// Stage and commit in one step. An empty batch is a no-op.
    pub fn append_changes(
        &mut self,
        version_id: VersionId,
        changes: Vec<Change>,
    ) -> Result<Option<CommitRef>, EngineError> {
        if changes.is_empty() {
            return Ok(None);
        }
        self.stage_changes(version_id, changes)?;
        self.commit(version_id, BTreeMap::new())
    }

    /// Create a change-set referencing already-stored changes.
    ///
    /// Every referenced change must exist in the change store, and at most
    /// one element per entity key is allowed; both are checked before the
    /// change-set is created.
    pub fn create_change_set(
        &mut self,
        parents: Vec<ChangeSetId>,
        elements: Vec<(ChangeId, EntityKey)>,
        metadata: BTreeMap<String, String>,
    ) -> Result<ChangeSetId, EngineError> {
        let id = ChangeSetId::new();
        let mut keys = std::collections::BTreeSet::new();
        for (change_id, key) in &elements {
            if !self.changes.contains(*change_id) {
                return Err(EngineError::UnknownChange(*change_id));
            }
            if !keys.insert(key.clone()) {
                return Err(GraphError::DuplicateElement {
                    change_set_id: id,
                    key: key.clone(),
                }
                .into());
            }
        }
        self.graph.create_change_set(id, parents, metadata)?;
        for (change_id, key) in elements {
            self.graph
                .insert_element(ChangeSetElement::new(id, change_id, key))?;
        }
        self.save_graph()?;
        Ok(id)
    }

    /// Create a commit wrapping an existing change-set.
    pub fn create_commit(
        &mut self,
        change_set_id: ChangeSetId,
        parent_commit_ids: Vec<CommitId>,
    ) -> Result<CommitId, EngineError> {
        let id = CommitId::new();
        self.graph.create_commit(id, change_set_id, parent_commit_ids)?;
        self.save_graph()?;
        Ok(id)
    }

    /// Stage a tombstone for an entity currently visible under the version.
    pub fn delete_entity(
        &mut self,
        version_id: VersionId,
        key: &EntityKey,
    ) -> Result<(), EngineError> {
        let resolved = self
            .resolve(key, version_id)?
            .ok_or_else(|| EngineError::EntityNotFound(key.clone()))?;
        let tombstone = Change::new_tombstone(
            key.clone(),
            resolved.row.schema_version.clone(),
            resolved.row.plugin_key.clone(),
        );
        self.stage_changes(version_id, vec![tombstone])
    }

    /// Write an untracked row, bypassing the change log. `snapshot = None`
    /// writes an untracked tombstone.
    pub fn put_untracked(
        &mut self,
        version_id: VersionId,
        key: &EntityKey,
        plugin_key: &str,
        schema_version: &str,
        snapshot: Option<serde_json::Value>,
    ) -> Result<(), EngineError> {
        self.versions.require(version_id)?;
        self.cache
            .put_untracked(&self.schemas, key, version_id, plugin_key, schema_version, snapshot)?;
        Ok(())
    }

    pub fn remove_untracked(&mut self, version_id: VersionId, key: &EntityKey) -> bool {
        self.cache.remove_untracked(key, version_id)
    }

    // --- Read port ---

    /// Resolve an entity under a version, including inherited and untracked
    /// state. Repopulates the cache first if it is stale.
    pub fn resolve(
        &mut self,
        key: &EntityKey,
        version_id: VersionId,
    ) -> Result<Option<ResolvedRow>, EngineError> {
        self.ensure_fresh()?;
        let chain = self.versions.inheritance_chain(version_id)?;
        Ok(self.cache.resolve(&chain, key))
    }

    pub fn get_change(&self, id: ChangeId) -> Option<&Change> {
        self.changes.get(id)
    }

    pub fn leaves_of(
        &self,
        heads: &[ChangeSetId],
    ) -> Result<Vec<ChangeSetElement>, EngineError> {
        Ok(self.graph.leaves_of(heads)?)
    }

    pub fn graph(&self) -> &ChangeSetGraph {
        &self.graph
    }

    pub fn changes(&self) -> &ChangeStore {
        &self.changes
    }

    pub fn cache(&self) -> &StateCache {
        &self.cache
    }

    // --- Cache lifecycle ---

    /// Flag the cache as no longer reflecting the log. The next read
    /// repopulates it.
    pub fn invalidate_cache(&mut self) {
        self.cache.mark_stale();
    }

    /// Rebuild tracked rows from the log.
    ///
    /// With a version, rebuilds that version and every version in its
    /// inheritance chain up to the root (resolution depends on ancestor rows
    /// physically existing under their own versions). Without, clears and
    /// rebuilds all versions.
    pub fn populate_state_cache(&mut self, version: Option<VersionId>) -> Result<(), EngineError> {
        match version {
            Some(id) => {
                let chain = self.versions.inheritance_chain(id)?;
                self.cache.clear_tracked(Some(chain.as_slice()));
                for version_id in chain {
                    self.rebuild_version(version_id)?;
                }
            }
            None => {
                self.cache.clear_tracked(None);
                for version_id in self.versions.ids() {
                    self.rebuild_version(version_id)?;
                }
                self.cache.mark_fresh();
            }
        }
        Ok(())
    }

    pub(crate) fn ensure_fresh(&mut self) -> Result<(), EngineError> {
        if !self.cache.is_fresh() {
            debug!("cache stale, repopulating");
            self.populate_state_cache(None)?;
        }
        Ok(())
    }

    /// Materialize one version's rows from the leaves of its working head.
    fn rebuild_version(&mut self, version_id: VersionId) -> Result<(), EngineError> {
        let working_commit = self.versions.require(version_id)?.working_commit_id;
        let tip_commit = self.versions.require(version_id)?.commit_id;
        let working_cs = self.graph.require_commit(working_commit)?.change_set_id;
        let leaves = self.graph.leaves_of(&[working_cs])?;

        let mut items: Vec<(Change, CommitId)> = Vec::with_capacity(leaves.len());
        for leaf in leaves {
            let change = self
                .changes
                .get(leaf.change_id)
                .ok_or(EngineError::UnknownChange(leaf.change_id))?
                .clone();
            let commit_id = self
                .graph
                .commit_for_change_set(leaf.change_set_id)
                .map(|c| c.id)
                .unwrap_or(tip_commit);
            items.push((change, commit_id));
        }
        self.cache.materialize(
            &self.schemas,
            items.iter().map(|(change, commit_id)| (change, *commit_id)),
            version_id,
        )?;
        Ok(())
    }

    /// Re-derive specific keys for a version after its working set changed.
    pub(crate) fn refresh_version_keys(
        &mut self,
        version_id: VersionId,
        keys: &[EntityKey],
    ) -> Result<(), EngineError> {
        let working_commit = self.versions.require(version_id)?.working_commit_id;
        let working_cs = self.graph.require_commit(working_commit)?.change_set_id;
        let leaves = self.graph.leaves_of(&[working_cs])?;
        let wanted: std::collections::BTreeSet<EntityKey> = keys.iter().cloned().collect();

        for key in keys {
            self.cache.remove_tracked(key, version_id);
        }
        let mut items: Vec<(Change, CommitId)> = Vec::new();
        for leaf in leaves {
            if !wanted.contains(&leaf.entity_key()) {
                continue;
            }
            let change = self
                .changes
                .get(leaf.change_id)
                .ok_or(EngineError::UnknownChange(leaf.change_id))?
                .clone();
            let commit_id = self
                .graph
                .commit_for_change_set(leaf.change_set_id)
                .map(|c| c.id)
                .unwrap_or(working_commit);
            items.push((change, commit_id));
        }
        self.cache.materialize(
            &self.schemas,
            items.iter().map(|(change, commit_id)| (change, *commit_id)),
            version_id,
        )?;
        Ok(())
    }

    // --- Internals ---

    /// Root change-set + commit, then a version pointing at them.
    fn bootstrap_version(
        &mut self,
        name: &str,
        inherits_from: Option<VersionId>,
    ) -> Result<VersionId, EngineError> {
        let root_cs = ChangeSetId::new();
        self.graph.create_change_set(root_cs, vec![], BTreeMap::new())?;
        let root_commit = CommitId::new();
        self.graph.create_commit(root_commit, root_cs, vec![])?;
        self.create_version_at(name, root_commit, inherits_from)
    }

    fn create_version_at(
        &mut self,
        name: &str,
        tip: CommitId,
        inherits_from: Option<VersionId>,
    ) -> Result<VersionId, EngineError> {
        if let Some(parent) = inherits_from {
            self.versions.require(parent)?;
        }
        let tip_cs = self.graph.require_commit(tip)?.change_set_id;
        let working_cs = ChangeSetId::new();
        self.graph
            .create_change_set(working_cs, vec![tip_cs], BTreeMap::new())?;
        let working_commit = CommitId::new();
        self.graph.create_commit(working_commit, working_cs, vec![tip])?;

        let version = Version {
            id: VersionId::new(),
            name: name.to_string(),
            commit_id: tip,
            working_commit_id: working_commit,
            inherits_from,
        };
        let id = version.id;
        self.versions.insert(version)?;
        Ok(id)
    }

    /// Open a fresh working change-set/commit on top of the current tip.
    pub(crate) fn open_working(&mut self, version_id: VersionId) -> Result<(), EngineError> {
        let tip = self.versions.require(version_id)?.commit_id;
        let tip_cs = self.graph.require_commit(tip)?.change_set_id;
        let working_cs = ChangeSetId::new();
        self.graph
            .create_change_set(working_cs, vec![tip_cs], BTreeMap::new())?;
        let working_commit = CommitId::new();
        self.graph.create_commit(working_commit, working_cs, vec![tip])?;
        self.versions.set_working_commit(version_id, working_commit)?;
        Ok(())
    }

    /// Persist the metadata side of the store, if file-backed.
    pub(crate) fn save_graph(&mut self) -> Result<(), EngineError> {
        if let Some(durable) = &mut self.durable {
            durable.save_graph(&GraphSnapshot {
                schemas: self.schemas.clone(),
                graph: self.graph.clone(),
                versions: self.versions.clone(),
            })?;
        }
        Ok(())
    }

    pub(crate) fn append_durable(&mut self, changes: &[Change]) -> Result<(), EngineError> {
        if let Some(durable) = &mut self.durable {
            durable.append_segment(changes)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn note_key(entity: &str) -> EntityKey {
        EntityKey::new(entity, "note", "f1")
    }

    fn note(entity: &str, title: &str) -> Change {
        Change::new_snapshot(note_key(entity), "1.0", "plugin_txt", json!({"title": title}))
    }

    fn engine_with_note_schema() -> Engine {
        let mut engine = Engine::in_memory().unwrap();
        engine
            .register_schema(SchemaDef::new("note", "1.0", &["title", "body"]))
            .unwrap();
        engine
    }

    #[test]
    fn bootstrap_has_active_main() {
        let engine = Engine::in_memory().unwrap();
        let main = engine.active_version().unwrap();
        assert_eq!(engine.version(main).unwrap().name, "main");
    }

    #[test]
    fn append_changes_advances_tip() {
        let mut engine = engine_with_note_schema();
        let main = engine.active_version().unwrap();
        let before = engine.version(main).unwrap().commit_id;

        let commit = engine
            .append_changes(main, vec![note("e1", "hello")])
            .unwrap()
            .unwrap();
        let after = engine.version(main).unwrap().commit_id;
        assert_ne!(before, after);
        assert_eq!(after, commit.commit_id);

        let resolved = engine.resolve(&note_key("e1"), main).unwrap().unwrap();
        assert_eq!(resolved.commit_id(), Some(commit.commit_id));
    }

    #[test]
    fn staged_state_is_readable_before_commit() {
        let mut engine = engine_with_note_schema();
        let main = engine.active_version().unwrap();
        let tip_before = engine.version(main).unwrap().commit_id;

        engine.stage_changes(main, vec![note("e1", "draft")]).unwrap();
        // Tip has not moved, but the row resolves.
        assert_eq!(engine.version(main).unwrap().commit_id, tip_before);
        let resolved = engine.resolve(&note_key("e1"), main).unwrap().unwrap();
        assert_eq!(resolved.row.properties["title"], json!("draft"));
    }

    #[test]
    fn empty_commit_is_a_no_op() {
        let mut engine = engine_with_note_schema();
        let main = engine.active_version().unwrap();
        assert!(engine.commit(main, BTreeMap::new()).unwrap().is_none());
    }

    #[test]
    fn restaging_same_entity_keeps_one_element() {
        let mut engine = engine_with_note_schema();
        let main = engine.active_version().unwrap();
        engine.stage_changes(main, vec![note("e1", "first")]).unwrap();
        engine.stage_changes(main, vec![note("e1", "second")]).unwrap();

        let working = engine.version(main).unwrap().working_commit_id;
        let working_cs = engine.graph().commit(working).unwrap().change_set_id;
        assert_eq!(engine.graph().change_set(working_cs).unwrap().elements().len(), 1);

        let resolved = engine.resolve(&note_key("e1"), main).unwrap().unwrap();
        assert_eq!(resolved.row.properties["title"], json!("second"));
    }

    #[test]
    fn failed_stage_mutates_nothing() {
        let mut engine = engine_with_note_schema();
        let main = engine.active_version().unwrap();
        let good = note("e1", "ok");
        let bad = Change::new_snapshot(
            note_key("e2"),
            "1.0",
            "plugin_txt",
            json!({"color": "red"}),
        );
        assert!(engine.stage_changes(main, vec![good, bad]).is_err());
        assert!(engine.changes().is_empty());
        assert!(engine.resolve(&note_key("e1"), main).unwrap().is_none());
    }

    #[test]
    fn delete_entity_writes_tombstone() {
        let mut engine = engine_with_note_schema();
        let main = engine.active_version().unwrap();
        engine.append_changes(main, vec![note("e1", "hello")]).unwrap();
        engine.delete_entity(main, &note_key("e1")).unwrap();
        engine.commit(main, BTreeMap::new()).unwrap();

        assert!(engine.resolve(&note_key("e1"), main).unwrap().is_none());
        // Deleting again fails: the entity is no longer visible.
        assert!(matches!(
            engine.delete_entity(main, &note_key("e1")),
            Err(EngineError::EntityNotFound(_))
        ));
    }

    #[test]
    fn branch_sees_copied_history() {
        let mut engine = engine_with_note_schema();
        let main = engine.active_version().unwrap();
        engine.append_changes(main, vec![note("e1", "shared")]).unwrap();

        let branch = engine.create_version("feature", Some(main), None).unwrap();
        let resolved = engine.resolve(&note_key("e1"), branch).unwrap().unwrap();
        // Branched history is the branch's own, not inherited.
        assert!(!resolved.is_inherited());
        assert_eq!(resolved.row.properties["title"], json!("shared"));

        // Edits on the branch do not leak back.
        engine.append_changes(branch, vec![note("e1", "branched")]).unwrap();
        let on_main = engine.resolve(&note_key("e1"), main).unwrap().unwrap();
        assert_eq!(on_main.row.properties["title"], json!("shared"));
    }

    #[test]
    fn inherited_entity_resolves_through_chain() {
        let mut engine = engine_with_note_schema();
        let global = engine.active_version().unwrap();
        engine.append_changes(global, vec![note("e1", "global")]).unwrap();

        let child = engine.create_version("child", None, Some(global)).unwrap();
        let resolved = engine.resolve(&note_key("e1"), child).unwrap().unwrap();
        assert!(resolved.is_inherited());
        assert_eq!(resolved.row.version_id, child);
        assert_eq!(resolved.row.inherited_from, Some(global));

        // Tombstone in the child blocks inheritance for it and its
        // descendants, while the parent keeps the row.
        engine.delete_entity(child, &note_key("e1")).unwrap();
        assert!(engine.resolve(&note_key("e1"), child).unwrap().is_none());
        let grandchild = engine.create_version("grandchild", None, Some(child)).unwrap();
        assert!(engine.resolve(&note_key("e1"), grandchild).unwrap().is_none());
        assert!(engine.resolve(&note_key("e1"), global).unwrap().is_some());
    }

    #[test]
    fn cache_rebuild_is_idempotent() {
        let mut engine = engine_with_note_schema();
        let main = engine.active_version().unwrap();
        engine.append_changes(main, vec![note("e1", "hello")]).unwrap();
        let child = engine.create_version("child", None, Some(main)).unwrap();

        let before = engine.resolve(&note_key("e1"), child).unwrap().unwrap();
        engine.invalidate_cache();
        engine.populate_state_cache(None).unwrap();
        let after = engine.resolve(&note_key("e1"), child).unwrap().unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn stale_cache_repopulates_on_read() {
        let mut engine = engine_with_note_schema();
        let main = engine.active_version().unwrap();
        engine.append_changes(main, vec![note("e1", "hello")]).unwrap();

        engine.invalidate_cache();
        assert!(!engine.cache().is_fresh());
        let resolved = engine.resolve(&note_key("e1"), main).unwrap();
        assert!(resolved.is_some());
        assert!(engine.cache().is_fresh());
    }

    #[test]
    fn untracked_row_bypasses_log_and_survives_rebuild() {
        let mut engine = engine_with_note_schema();
        let main = engine.active_version().unwrap();
        engine
            .put_untracked(main, &note_key("e1"), "plugin_txt", "1.0", Some(json!({"title": "local"})))
            .unwrap();
        assert!(engine.changes().is_empty());

        engine.invalidate_cache();
        let resolved = engine.resolve(&note_key("e1"), main).unwrap().unwrap();
        assert!(resolved.change_id().is_none());
        assert_eq!(resolved.row.properties["title"], json!("local"));
    }

    #[test]
    fn reopen_preserves_resolved_state() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("store_data");
        let (main, expected_change) = {
            let mut engine = Engine::open(&path).unwrap();
            engine
                .register_schema(SchemaDef::new("note", "1.0", &["title", "body"]))
                .unwrap();
            let main = engine.active_version().unwrap();
            engine.append_changes(main, vec![note("e1", "durable")]).unwrap();
            let resolved = engine.resolve(&note_key("e1"), main).unwrap().unwrap();
            (main, resolved.change_id())
        };

        let mut engine = Engine::open(&path).unwrap();
        assert_eq!(engine.active_version().unwrap(), main);
        let resolved = engine.resolve(&note_key("e1"), main).unwrap().unwrap();
        assert_eq!(resolved.change_id(), expected_change);
        assert_eq!(resolved.row.properties["title"], json!("durable"));
    }

    #[test]
    fn change_set_elements_must_reference_stored_changes() {
        let mut engine = engine_with_note_schema();
        let err = engine.create_change_set(
            vec![],
            vec![(ChangeId::new(), note_key("e1"))],
            BTreeMap::new(),
        );
        assert!(matches!(err, Err(EngineError::UnknownChange(_))));

        let main = engine.active_version().unwrap();
        let change = note("e1", "stored");
        let id = change.id;
        engine.append_changes(main, vec![change]).unwrap();
        let cs = engine
            .create_change_set(vec![], vec![(id, note_key("e1"))], BTreeMap::new())
            .unwrap();
        let commit = engine.create_commit(cs, vec![]).unwrap();
        assert_eq!(engine.graph().commit(commit).unwrap().change_set_id, cs);
    }

    #[test]
    fn unknown_version_is_an_error() {
        let mut engine = engine_with_note_schema();
        let ghost = VersionId::new();
        assert!(matches!(
            engine.resolve(&note_key("e1"), ghost),
            Err(EngineError::Version(VersionError::UnknownVersion(_)))
        ));
    }
}
