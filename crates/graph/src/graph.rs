use deltastore_common::{ChangeId, ChangeSetId, CommitId, EntityKey};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One entity state referenced by a change-set.
///
/// A change-set holds at most one element per entity key; the same change
/// may be referenced by many change-sets (cross-referencing).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSetElement {
    pub change_set_id: ChangeSetId,
    pub change_id: ChangeId,
    pub entity_id: String,
    pub schema_key: String,
    pub file_id: String,
}

impl ChangeSetElement {
    pub fn new(change_set_id: ChangeSetId, change_id: ChangeId, key: EntityKey) -> Self {
        Self {
            change_set_id,
            change_id,
            entity_id: key.entity_id,
            schema_key: key.schema_key,
            file_id: key.file_id,
        }
    }

    pub fn entity_key(&self) -> EntityKey {
        EntityKey::new(
            self.entity_id.clone(),
            self.schema_key.clone(),
            self.file_id.clone(),
        )
    }
}

/// A named, parent-linked bundle of change references (one DAG node).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeSet {
    pub id: ChangeSetId,
    pub parents: Vec<ChangeSetId>,
    pub metadata: BTreeMap<String, String>,
    elements: Vec<ChangeSetElement>,
}

impl ChangeSet {
    pub fn elements(&self) -> &[ChangeSetElement] {
        &self.elements
    }

    pub fn element_for(&self, key: &EntityKey) -> Option<&ChangeSetElement> {
        self.elements.iter().find(|e| e.entity_key() == *key)
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

/// A change-set plus explicit parent-commit lineage.
///
/// A merge commit has two or more parents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commit {
    pub id: CommitId,
    pub change_set_id: ChangeSetId,
    pub parent_commit_ids: Vec<CommitId>,
}

/// Errors from graph operations.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("duplicate change-set id {0:?}")]
    DuplicateChangeSet(ChangeSetId),
    #[error("unknown change-set {0:?}")]
    UnknownChangeSet(ChangeSetId),
    #[error("duplicate commit id {0:?}")]
    DuplicateCommit(CommitId),
    #[error("unknown commit {0:?}")]
    UnknownCommit(CommitId),
    #[error("change-set {change_set_id:?} already holds a state for {key:?}")]
    DuplicateElement {
        change_set_id: ChangeSetId,
        key: EntityKey,
    },
}

/// The DAG of change-sets linked by parent edges, with the commits that
/// wrap them.
///
/// Stored as adjacency maps keyed by id; all traversals are iterative with
/// explicit visited sets.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeSetGraph {
    change_sets: BTreeMap<ChangeSetId, ChangeSet>,
    commits: BTreeMap<CommitId, Commit>,
    /// change-set -> wrapping commit, maintained on commit creation.
    commit_index: BTreeMap<ChangeSetId, CommitId>,
}

impl ChangeSetGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty change-set. All parents must already exist.
    pub fn create_change_set(
        &mut self,
        id: ChangeSetId,
        parents: Vec<ChangeSetId>,
        metadata: BTreeMap<String, String>,
    ) -> Result<(), GraphError> {
        if self.change_sets.contains_key(&id) {
            return Err(GraphError::DuplicateChangeSet(id));
        }
        for parent in &parents {
            if !self.change_sets.contains_key(parent) {
                return Err(GraphError::UnknownChangeSet(*parent));
            }
        }
        self.change_sets.insert(
            id,
            ChangeSet {
                id,
                parents,
                metadata,
                elements: Vec::new(),
            },
        );
        Ok(())
    }

    pub fn change_set(&self, id: ChangeSetId) -> Option<&ChangeSet> {
        self.change_sets.get(&id)
    }

    pub fn require_change_set(&self, id: ChangeSetId) -> Result<&ChangeSet, GraphError> {
        self.change_sets
            .get(&id)
            .ok_or(GraphError::UnknownChangeSet(id))
    }

    pub fn change_set_count(&self) -> usize {
        self.change_sets.len()
    }

    /// Insert an element, rejecting a second state for the same entity key.
    pub fn insert_element(&mut self, element: ChangeSetElement) -> Result<(), GraphError> {
        let cs = self
            .change_sets
            .get_mut(&element.change_set_id)
            .ok_or(GraphError::UnknownChangeSet(element.change_set_id))?;
        let key = element.entity_key();
        if cs.elements.iter().any(|e| e.entity_key() == key) {
            return Err(GraphError::DuplicateElement {
                change_set_id: element.change_set_id,
                key,
            });
        }
        cs.elements.push(element);
        Ok(())
    }

    /// Insert or replace the element for an entity key.
    ///
    /// Only working change-sets are mutated this way; committed history is
    /// never rewritten.
    pub fn put_element(&mut self, element: ChangeSetElement) -> Result<(), GraphError> {
        let cs = self
            .change_sets
            .get_mut(&element.change_set_id)
            .ok_or(GraphError::UnknownChangeSet(element.change_set_id))?;
        let key = element.entity_key();
        cs.elements.retain(|e| e.entity_key() != key);
        cs.elements.push(element);
        Ok(())
    }

    /// Remove the element referencing `change_id`, if present.
    pub fn remove_element_by_change(
        &mut self,
        change_set_id: ChangeSetId,
        change_id: ChangeId,
    ) -> Result<bool, GraphError> {
        let cs = self
            .change_sets
            .get_mut(&change_set_id)
            .ok_or(GraphError::UnknownChangeSet(change_set_id))?;
        let before = cs.elements.len();
        cs.elements.retain(|e| e.change_id != change_id);
        Ok(cs.elements.len() != before)
    }

    pub fn set_metadata(
        &mut self,
        id: ChangeSetId,
        metadata: BTreeMap<String, String>,
    ) -> Result<(), GraphError> {
        let cs = self
            .change_sets
            .get_mut(&id)
            .ok_or(GraphError::UnknownChangeSet(id))?;
        cs.metadata = metadata;
        Ok(())
    }

    /// Create a commit wrapping `change_set_id`.
    pub fn create_commit(
        &mut self,
        id: CommitId,
        change_set_id: ChangeSetId,
        parent_commit_ids: Vec<CommitId>,
    ) -> Result<(), GraphError> {
        if self.commits.contains_key(&id) {
            return Err(GraphError::DuplicateCommit(id));
        }
        if !self.change_sets.contains_key(&change_set_id) {
            return Err(GraphError::UnknownChangeSet(change_set_id));
        }
        for parent in &parent_commit_ids {
            if !self.commits.contains_key(parent) {
                return Err(GraphError::UnknownCommit(*parent));
            }
        }
        self.commits.insert(
            id,
            Commit {
                id,
                change_set_id,
                parent_commit_ids,
            },
        );
        self.commit_index.insert(change_set_id, id);
        Ok(())
    }

    pub fn commit(&self, id: CommitId) -> Option<&Commit> {
        self.commits.get(&id)
    }

    pub fn require_commit(&self, id: CommitId) -> Result<&Commit, GraphError> {
        self.commits.get(&id).ok_or(GraphError::UnknownCommit(id))
    }

    pub fn commit_for_change_set(&self, change_set_id: ChangeSetId) -> Option<&Commit> {
        self.commit_index
            .get(&change_set_id)
            .and_then(|id| self.commits.get(id))
    }

    pub fn commit_count(&self) -> usize {
        self.commits.len()
    }

    /// Reflexive-transitive closure over parent edges for the given heads.
    pub fn ancestry_of(&self, heads: &[ChangeSetId]) -> Result<BTreeSet<ChangeSetId>, GraphError> {
        for head in heads {
            if !self.change_sets.contains_key(head) {
                return Err(GraphError::UnknownChangeSet(*head));
            }
        }
        Ok(self.ancestry_set(heads))
    }

    /// Worklist closure; all heads are known to exist.
    fn ancestry_set(&self, heads: &[ChangeSetId]) -> BTreeSet<ChangeSetId> {
        let mut visited: BTreeSet<ChangeSetId> = BTreeSet::new();
        let mut worklist: Vec<ChangeSetId> = heads.to_vec();
        while let Some(id) = worklist.pop() {
            if !visited.insert(id) {
                continue;
            }
            if let Some(cs) = self.change_sets.get(&id) {
                for parent in &cs.parents {
                    if !visited.contains(parent) {
                        worklist.push(*parent);
                    }
                }
            }
        }
        visited
    }

    /// Leaf elements of the combined ancestry of `heads`.
    ///
    /// An element is a leaf iff no change-set that is a strict descendant of
    /// its own (within the ancestry) also touches the same entity key. With
    /// multiple heads this performs the multi-head union: a candidate whose
    /// change-set is a strict ancestor of another candidate's for the same
    /// key is superseded and dropped, while incomparable candidates
    /// (divergent branches) are both retained.
    pub fn leaves_of(&self, heads: &[ChangeSetId]) -> Result<Vec<ChangeSetElement>, GraphError> {
        let ancestry = self.ancestry_of(heads)?;

        let mut by_key: BTreeMap<EntityKey, Vec<&ChangeSetElement>> = BTreeMap::new();
        for cs_id in &ancestry {
            let Some(cs) = self.change_sets.get(cs_id) else {
                continue;
            };
            for element in &cs.elements {
                by_key.entry(element.entity_key()).or_default().push(element);
            }
        }

        // Ancestries of candidate change-sets, computed once per set.
        let mut ancestry_cache: BTreeMap<ChangeSetId, BTreeSet<ChangeSetId>> = BTreeMap::new();
        let mut leaves = Vec::new();
        for candidates in by_key.values() {
            for element in candidates {
                let superseded = candidates.iter().any(|other| {
                    if other.change_set_id == element.change_set_id {
                        return false;
                    }
                    let anc = ancestry_cache
                        .entry(other.change_set_id)
                        .or_insert_with(|| self.ancestry_set(&[other.change_set_id]));
                    anc.contains(&element.change_set_id)
                });
                if !superseded {
                    leaves.push((*element).clone());
                }
            }
        }
        Ok(leaves)
    }
}
