use deltastore_common::{CommitId, VersionId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A named, mutable tip into the commit graph.
///
/// The only mutation a version undergoes is advancing its tip (and the
/// working commit that follows it). `inherits_from` lets a version see a
/// parent version's entities it has not overridden or tombstoned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Version {
    pub id: VersionId,
    pub name: String,
    pub commit_id: CommitId,
    pub working_commit_id: CommitId,
    pub inherits_from: Option<VersionId>,
}

/// Errors from version-registry operations.
#[derive(Debug, thiserror::Error)]
pub enum VersionError {
    #[error("duplicate version id {0:?}")]
    DuplicateVersion(VersionId),
    #[error("version name `{0}` is already taken")]
    DuplicateVersionName(String),
    #[error("unknown version {0:?}")]
    UnknownVersion(VersionId),
    #[error("version inheritance cycle through {0:?}")]
    InheritanceCycle(VersionId),
}

/// Registry of named versions plus the process-wide active version.
///
/// The active version is explicit state with get/set; nothing in the engine
/// falls back to it implicitly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VersionRegistry {
    versions: BTreeMap<VersionId, Version>,
    active: Option<VersionId>,
}

impl VersionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, version: Version) -> Result<(), VersionError> {
        if self.versions.contains_key(&version.id) {
            return Err(VersionError::DuplicateVersion(version.id));
        }
        if self.versions.values().any(|v| v.name == version.name) {
            return Err(VersionError::DuplicateVersionName(version.name));
        }
        self.versions.insert(version.id, version);
        Ok(())
    }

    pub fn get(&self, id: VersionId) -> Option<&Version> {
        self.versions.get(&id)
    }

    pub fn require(&self, id: VersionId) -> Result<&Version, VersionError> {
        self.versions.get(&id).ok_or(VersionError::UnknownVersion(id))
    }

    pub fn by_name(&self, name: &str) -> Option<&Version> {
        self.versions.values().find(|v| v.name == name)
    }

    /// Advance the tip. The commit must have been created beforehand so the
    /// pointer never dangles.
    pub fn advance_tip(&mut self, id: VersionId, commit_id: CommitId) -> Result<(), VersionError> {
        let version = self
            .versions
            .get_mut(&id)
            .ok_or(VersionError::UnknownVersion(id))?;
        version.commit_id = commit_id;
        Ok(())
    }

    pub fn set_working_commit(
        &mut self,
        id: VersionId,
        commit_id: CommitId,
    ) -> Result<(), VersionError> {
        let version = self
            .versions
            .get_mut(&id)
            .ok_or(VersionError::UnknownVersion(id))?;
        version.working_commit_id = commit_id;
        Ok(())
    }

    pub fn active(&self) -> Option<VersionId> {
        self.active
    }

    pub fn set_active(&mut self, id: VersionId) -> Result<(), VersionError> {
        if !self.versions.contains_key(&id) {
            return Err(VersionError::UnknownVersion(id));
        }
        self.active = Some(id);
        Ok(())
    }

    /// The inheritance chain starting at `id` (child first, root last).
    ///
    /// Inheritance must form a tree; a cycle is reported rather than looping.
    pub fn inheritance_chain(&self, id: VersionId) -> Result<Vec<VersionId>, VersionError> {
        let mut chain = Vec::new();
        let mut seen = std::collections::BTreeSet::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            if !seen.insert(current) {
                return Err(VersionError::InheritanceCycle(current));
            }
            let version = self.require(current)?;
            chain.push(current);
            cursor = version.inherits_from;
        }
        Ok(chain)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Version> {
        self.versions.values()
    }

    pub fn ids(&self) -> Vec<VersionId> {
        self.versions.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(name: &str, inherits_from: Option<VersionId>) -> Version {
        Version {
            id: VersionId::new(),
            name: name.to_string(),
            commit_id: CommitId::new(),
            working_commit_id: CommitId::new(),
            inherits_from,
        }
    }

    #[test]
    fn insert_and_lookup() {
        let mut reg = VersionRegistry::new();
        let v = version("main", None);
        let id = v.id;
        reg.insert(v).unwrap();
        assert_eq!(reg.require(id).unwrap().name, "main");
        assert!(reg.by_name("main").is_some());
    }

    #[test]
    fn duplicate_name_rejected() {
        let mut reg = VersionRegistry::new();
        reg.insert(version("main", None)).unwrap();
        assert!(matches!(
            reg.insert(version("main", None)),
            Err(VersionError::DuplicateVersionName(_))
        ));
    }

    #[test]
    fn advance_tip_moves_pointer() {
        let mut reg = VersionRegistry::new();
        let v = version("main", None);
        let id = v.id;
        reg.insert(v).unwrap();
        let new_tip = CommitId::new();
        reg.advance_tip(id, new_tip).unwrap();
        assert_eq!(reg.require(id).unwrap().commit_id, new_tip);
    }

    #[test]
    fn active_version_is_explicit() {
        let mut reg = VersionRegistry::new();
        assert!(reg.active().is_none());
        let v = version("main", None);
        let id = v.id;
        reg.insert(v).unwrap();
        reg.set_active(id).unwrap();
        assert_eq!(reg.active(), Some(id));
        assert!(reg.set_active(VersionId::new()).is_err());
    }

    #[test]
    fn inheritance_chain_child_first() {
        let mut reg = VersionRegistry::new();
        let root = version("global", None);
        let root_id = root.id;
        reg.insert(root).unwrap();
        let child = version("feature", Some(root_id));
        let child_id = child.id;
        reg.insert(child).unwrap();
        let grandchild = version("experiment", Some(child_id));
        let grandchild_id = grandchild.id;
        reg.insert(grandchild).unwrap();

        let chain = reg.inheritance_chain(grandchild_id).unwrap();
        assert_eq!(chain, vec![grandchild_id, child_id, root_id]);
    }

    #[test]
    fn inheritance_cycle_detected() {
        let mut reg = VersionRegistry::new();
        let a = version("a", None);
        let a_id = a.id;
        reg.insert(a).unwrap();
        let b = version("b", Some(a_id));
        let b_id = b.id;
        reg.insert(b).unwrap();
        // Introduce a cycle by hand.
        reg.versions.get_mut(&a_id).unwrap().inherits_from = Some(b_id);
        assert!(matches!(
            reg.inheritance_chain(a_id),
            Err(VersionError::InheritanceCycle(_))
        ));
    }
}
