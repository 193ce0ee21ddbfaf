use crate::diff::DiffStatus;
use crate::engine::{CommitRef, Engine, EngineError};
use deltastore_common::{ChangeSetId, CommitId, EntityKey, VersionId};
use deltastore_graph::ChangeSetElement;
use deltastore_log::Change;
use std::collections::BTreeSet;
use tracing::{debug, info};

impl Engine {
    /// Merge `source` into `target` (default: the active version).
    ///
    /// Produces exactly one merge commit on target whose change-set
    /// references the diff winners and newly synthesized tombstones, with
    /// commit parents `[target tip, source tip]`. Merging a version into
    /// itself or with an empty diff is a silent no-op. The whole operation
    /// is validated before the first mutation, so a failure leaves the
    /// registry and cache untouched.
    pub fn merge_version(
        &mut self,
        source: VersionId,
        target: Option<VersionId>,
    ) -> Result<Option<CommitRef>, EngineError> {
        let target = match target {
            Some(id) => id,
            None => self.active_version()?,
        };
        if source == target {
            return Ok(None);
        }

        self.versions.require(source)?;
        self.versions.require(target)?;

        let work: Vec<_> = self
            .diff(source, target)?
            .into_iter()
            .filter(|d| d.status != DiffStatus::Unchanged)
            .collect();
        if work.is_empty() {
            debug!(?source, ?target, "merge is a no-op");
            return Ok(None);
        }

        // Collect winners to reference and synthesize tombstones for
        // target-only removals. Everything is gathered and validated before
        // any mutation.
        let mut winners: Vec<Change> = Vec::new();
        let mut tombstones: Vec<Change> = Vec::new();
        for d in &work {
            match d.status {
                DiffStatus::Created | DiffStatus::Updated => {
                    // Created/updated rows always carry a source winner.
                    let Some(id) = d.after_change_id else { continue };
                    let change = self
                        .get_change(id)
                        .ok_or(EngineError::UnknownChange(id))?;
                    winners.push(change.clone());
                }
                DiffStatus::Deleted => {
                    let Some(before_id) = d.before_change_id else { continue };
                    let before = self
                        .get_change(before_id)
                        .ok_or(EngineError::UnknownChange(before_id))?;
                    tombstones.push(Change::new_tombstone(
                        d.entity_key(),
                        before.schema_version.clone(),
                        before.plugin_key.clone(),
                    ));
                }
                DiffStatus::Unchanged => {}
            }
        }

        let source_version = self.versions.require(source)?;
        let (source_tip, source_working) =
            (source_version.commit_id, source_version.working_commit_id);
        let target_version = self.versions.require(target)?;
        let (target_tip, target_working_old) =
            (target_version.commit_id, target_version.working_commit_id);
        let source_tip_cs = self.graph.require_commit(source_tip)?.change_set_id;
        let target_tip_cs = self.graph.require_commit(target_tip)?.change_set_id;
        let source_working_cs = self.graph.require_commit(source_working)?.change_set_id;
        let target_working_cs_old = self
            .graph
            .require_commit(target_working_old)?
            .change_set_id;
        // Authorship metadata is copied from source's tip change-set.
        let source_metadata = self
            .graph
            .require_change_set(source_tip_cs)?
            .metadata
            .clone();

        // Pre-validate the incremental cache application on target
        // (immutable-schema conflicts surface here, before any mutation).
        let merge_commit_id = CommitId::new();
        self.cache.check(
            &self.schemas,
            winners
                .iter()
                .chain(tombstones.iter())
                .map(|c| (c, merge_commit_id)),
            target,
        )?;

        // Mutations begin. Tombstones enter the append-only log first.
        self.changes.append(&tombstones, &self.schemas)?;

        // Winners still pending in source's working change-set are dropped
        // so a later source commit does not double-commit them.
        let mut dropped_keys: Vec<EntityKey> = Vec::new();
        for change in &winners {
            if self
                .graph
                .remove_element_by_change(source_working_cs, change.id)?
            {
                dropped_keys.push(change.entity_key());
            }
        }

        // One new change-set and commit for target.
        let merge_cs = ChangeSetId::new();
        self.graph.create_change_set(
            merge_cs,
            vec![target_tip_cs, source_tip_cs],
            source_metadata,
        )?;
        for change in winners.iter().chain(tombstones.iter()) {
            self.graph.insert_element(ChangeSetElement::new(
                merge_cs,
                change.id,
                change.entity_key(),
            ))?;
        }
        self.graph
            .create_commit(merge_commit_id, merge_cs, vec![target_tip, source_tip])?;
        self.versions.advance_tip(target, merge_commit_id)?;
        self.open_working(target)?;

        // Target edits still pending on keys the merge did not touch carry
        // over into the fresh working change-set.
        let merged_keys: BTreeSet<EntityKey> = winners
            .iter()
            .chain(tombstones.iter())
            .map(|c| c.entity_key())
            .collect();
        let carried = self.carry_pending(target, target_working_cs_old, &merged_keys)?;

        // Incremental cache update for the touched entities only.
        self.cache.materialize(
            &self.schemas,
            winners
                .iter()
                .chain(tombstones.iter())
                .map(|c| (c, merge_commit_id)),
            target,
        )?;
        if !carried.is_empty() {
            let new_working_commit = self.versions.require(target)?.working_commit_id;
            self.cache.materialize(
                &self.schemas,
                carried.iter().map(|c| (c, new_working_commit)),
                target,
            )?;
        }
        // Source rows whose pending winner was pulled out re-derive from
        // source's remaining leaves.
        if !dropped_keys.is_empty() {
            self.refresh_version_keys(source, &dropped_keys)?;
        }

        self.append_durable(&tombstones)?;
        self.save_graph()?;
        info!(
            winners = winners.len(),
            tombstones = tombstones.len(),
            ?source,
            ?target,
            "merged version"
        );
        Ok(Some(CommitRef {
            commit_id: merge_commit_id,
            change_set_id: merge_cs,
        }))
    }

    /// Move still-pending target elements (excluding merged keys) onto the
    /// fresh working change-set, returning their changes for
    /// re-materialization under the new working commit.
    fn carry_pending(
        &mut self,
        target: VersionId,
        old_working_cs: ChangeSetId,
        merged_keys: &BTreeSet<EntityKey>,
    ) -> Result<Vec<Change>, EngineError> {
        let pending: Vec<ChangeSetElement> = self
            .graph
            .require_change_set(old_working_cs)?
            .elements()
            .iter()
            .filter(|e| !merged_keys.contains(&e.entity_key()))
            .cloned()
            .collect();
        if pending.is_empty() {
            return Ok(Vec::new());
        }
        let new_working_commit = self.versions.require(target)?.working_commit_id;
        let new_working_cs = self
            .graph
            .require_commit(new_working_commit)?
            .change_set_id;
        let mut carried = Vec::with_capacity(pending.len());
        for element in pending {
            let change = self
                .changes
                .get(element.change_id)
                .ok_or(EngineError::UnknownChange(element.change_id))?
                .clone();
            self.graph.put_element(ChangeSetElement::new(
                new_working_cs,
                element.change_id,
                element.entity_key(),
            ))?;
            carried.push(change);
        }
        Ok(carried)
    }
}
