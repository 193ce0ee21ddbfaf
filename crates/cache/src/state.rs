use crate::row::{CacheRow, Provenance, ResolvedRow, RowKey};
use deltastore_common::{CommitId, EntityKey, SchemaDef, SchemaRegistry, Timestamp, VersionId};
use deltastore_log::Change;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Errors from cache materialization and untracked writes.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("unknown schema `{0}`")]
    UnknownSchema(String),
    #[error("schema `{schema_key}` has no property `{property}`")]
    UnknownProperty { schema_key: String, property: String },
    #[error("snapshot for `{entity_id}` under schema `{schema_key}` is not a JSON object")]
    SnapshotNotObject { schema_key: String, entity_id: String },
    #[error("schema `{schema_key}` is immutable; `{entity_id}` cannot be rewritten")]
    ImmutableSchemaUpdate { schema_key: String, entity_id: String },
}

/// The materialized table for one schema key.
///
/// Tracked rows are a projection of the change log; untracked rows are
/// written directly and kept apart so rebuilds never touch them.
#[derive(Debug, Clone)]
pub struct SchemaTable {
    schema_key: String,
    columns: Vec<String>,
    rows: BTreeMap<RowKey, CacheRow>,
    untracked: BTreeMap<RowKey, CacheRow>,
}

impl SchemaTable {
    fn new(def: &SchemaDef) -> Self {
        Self {
            schema_key: def.key.clone(),
            columns: def.properties.clone(),
            rows: BTreeMap::new(),
            untracked: BTreeMap::new(),
        }
    }

    pub fn schema_key(&self) -> &str {
        &self.schema_key
    }

    /// Property columns, fixed at registration time.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn tracked_count(&self) -> usize {
        self.rows.len()
    }

    pub fn untracked_count(&self) -> usize {
        self.untracked.len()
    }

    pub fn tracked_rows(&self) -> impl Iterator<Item = &CacheRow> {
        self.rows.values()
    }
}

/// Validate a snapshot against the schema's property columns and extract
/// them. Unknown properties are an error, never silently dropped.
fn check_properties(
    schema_key: &str,
    columns: &[String],
    entity_id: &str,
    snapshot: Option<&serde_json::Value>,
) -> Result<BTreeMap<String, serde_json::Value>, CacheError> {
    let Some(snapshot) = snapshot else {
        return Ok(BTreeMap::new());
    };
    let serde_json::Value::Object(map) = snapshot else {
        return Err(CacheError::SnapshotNotObject {
            schema_key: schema_key.to_string(),
            entity_id: entity_id.to_string(),
        });
    };
    let mut properties = BTreeMap::new();
    for (name, value) in map {
        if !columns.iter().any(|c| c == name) {
            return Err(CacheError::UnknownProperty {
                schema_key: schema_key.to_string(),
                property: name.clone(),
            });
        }
        properties.insert(name.clone(), value.clone());
    }
    Ok(properties)
}

/// All schema tables plus the global freshness flag.
#[derive(Debug, Clone)]
pub struct StateCache {
    tables: BTreeMap<String, SchemaTable>,
    fresh: bool,
}

impl Default for StateCache {
    fn default() -> Self {
        Self::new()
    }
}

impl StateCache {
    /// An empty cache, starting fresh.
    pub fn new() -> Self {
        Self {
            tables: BTreeMap::new(),
            fresh: true,
        }
    }

    /// Whether the cache reflects the log. When stale, callers must
    /// repopulate before trusting reads.
    pub fn is_fresh(&self) -> bool {
        self.fresh
    }

    pub fn mark_stale(&mut self) {
        self.fresh = false;
    }

    pub fn mark_fresh(&mut self) {
        self.fresh = true;
    }

    pub fn table(&self, schema_key: &str) -> Option<&SchemaTable> {
        self.tables.get(schema_key)
    }

    pub fn tables(&self) -> impl Iterator<Item = &SchemaTable> {
        self.tables.values()
    }

    /// Resolve the physical table for a schema, creating it lazily.
    fn table_entry(
        &mut self,
        schemas: &SchemaRegistry,
        schema_key: &str,
    ) -> Result<&mut SchemaTable, CacheError> {
        match self.tables.entry(schema_key.to_string()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(vacant) => {
                let def = schemas
                    .get(schema_key)
                    .ok_or_else(|| CacheError::UnknownSchema(schema_key.to_string()))?;
                Ok(vacant.insert(SchemaTable::new(def)))
            }
        }
    }

    /// Materialize a batch of changes into `version_id`'s rows.
    ///
    /// Upserts by `(entity_id, file_id, version_id)`: `created_at` is
    /// preserved from the first insert, everything else is overwritten.
    /// Items apply in the given order, so the last change for an entity in
    /// one batch wins. The whole batch is validated before any row is
    /// written; on error the cache is unchanged. Returns the number of rows
    /// upserted.
    pub fn materialize<'a, I>(
        &mut self,
        schemas: &SchemaRegistry,
        items: I,
        version_id: VersionId,
    ) -> Result<usize, CacheError>
    where
        I: IntoIterator<Item = (&'a Change, CommitId)>,
    {
        let staged = self.stage_rows(schemas, items, version_id)?;
        let written = staged.len();
        for ((schema_key, row_key), row) in staged {
            let table = self.table_entry(schemas, &schema_key)?;
            table.rows.insert(row_key, row);
        }
        debug!(rows = written, version = ?version_id, "materialized batch");
        Ok(written)
    }

    /// Validate a batch without applying it. Used by callers that must know
    /// a batch will land before mutating other state.
    pub fn check<'a, I>(
        &self,
        schemas: &SchemaRegistry,
        items: I,
        version_id: VersionId,
    ) -> Result<(), CacheError>
    where
        I: IntoIterator<Item = (&'a Change, CommitId)>,
    {
        self.stage_rows(schemas, items, version_id).map(|_| ())
    }

    /// Validation pass: build the final row set without touching tables.
    fn stage_rows<'a, I>(
        &self,
        schemas: &SchemaRegistry,
        items: I,
        version_id: VersionId,
    ) -> Result<BTreeMap<(String, RowKey), CacheRow>, CacheError>
    where
        I: IntoIterator<Item = (&'a Change, CommitId)>,
    {
        let mut staged: BTreeMap<(String, RowKey), CacheRow> = BTreeMap::new();
        for (change, commit_id) in items {
            let def = schemas
                .get(&change.schema_key)
                .ok_or_else(|| CacheError::UnknownSchema(change.schema_key.clone()))?;
            let table = self.tables.get(&change.schema_key);
            let row_key = RowKey {
                entity_id: change.entity_id.clone(),
                file_id: change.file_id.clone(),
                version_id,
            };
            let staged_key = (change.schema_key.clone(), row_key.clone());

            let existing = staged
                .get(&staged_key)
                .or_else(|| table.and_then(|t| t.rows.get(&row_key)));
            if def.immutable {
                if let Some(prior) = existing {
                    if prior.change_id != Some(change.id) {
                        return Err(CacheError::ImmutableSchemaUpdate {
                            schema_key: change.schema_key.clone(),
                            entity_id: change.entity_id.clone(),
                        });
                    }
                }
            }

            let properties = check_properties(
                &change.schema_key,
                &def.properties,
                &change.entity_id,
                change.snapshot.as_ref(),
            )?;
            let created_at = existing.map(|r| r.created_at).unwrap_or(change.created_at);

            staged.insert(
                staged_key,
                CacheRow {
                    entity_id: change.entity_id.clone(),
                    schema_key: change.schema_key.clone(),
                    file_id: change.file_id.clone(),
                    version_id,
                    plugin_key: change.plugin_key.clone(),
                    schema_version: change.schema_version.clone(),
                    created_at,
                    updated_at: change.created_at,
                    change_id: Some(change.id),
                    commit_id: Some(commit_id),
                    inherited_from: None,
                    is_tombstone: change.is_tombstone(),
                    properties,
                },
            );
        }
        Ok(staged)
    }

    /// Write an untracked row directly, bypassing the change log.
    ///
    /// `snapshot = None` writes an untracked tombstone. `created_at` is
    /// preserved across rewrites of the same untracked row.
    pub fn put_untracked(
        &mut self,
        schemas: &SchemaRegistry,
        key: &EntityKey,
        version_id: VersionId,
        plugin_key: &str,
        schema_version: &str,
        snapshot: Option<serde_json::Value>,
    ) -> Result<(), CacheError> {
        let def = schemas
            .get(&key.schema_key)
            .ok_or_else(|| CacheError::UnknownSchema(key.schema_key.clone()))?;
        let properties = check_properties(
            &key.schema_key,
            &def.properties,
            &key.entity_id,
            snapshot.as_ref(),
        )?;

        let table = self.table_entry(schemas, &key.schema_key)?;
        let row_key = RowKey {
            entity_id: key.entity_id.clone(),
            file_id: key.file_id.clone(),
            version_id,
        };
        let now = Timestamp::now();
        let created_at = table
            .untracked
            .get(&row_key)
            .map(|r| r.created_at)
            .unwrap_or(now);
        table.untracked.insert(
            row_key,
            CacheRow {
                entity_id: key.entity_id.clone(),
                schema_key: key.schema_key.clone(),
                file_id: key.file_id.clone(),
                version_id,
                plugin_key: plugin_key.to_string(),
                schema_version: schema_version.to_string(),
                created_at,
                updated_at: now,
                change_id: None,
                commit_id: None,
                inherited_from: None,
                is_tombstone: snapshot.is_none(),
                properties,
            },
        );
        Ok(())
    }

    /// Remove a tracked row. Only used to keep the projection consistent
    /// when a pending element is pulled out of a working change-set.
    pub fn remove_tracked(&mut self, key: &EntityKey, version_id: VersionId) -> bool {
        let Some(table) = self.tables.get_mut(&key.schema_key) else {
            return false;
        };
        let row_key = RowKey {
            entity_id: key.entity_id.clone(),
            file_id: key.file_id.clone(),
            version_id,
        };
        table.rows.remove(&row_key).is_some()
    }

    /// Remove an untracked row. Returns whether one existed.
    pub fn remove_untracked(&mut self, key: &EntityKey, version_id: VersionId) -> bool {
        let Some(table) = self.tables.get_mut(&key.schema_key) else {
            return false;
        };
        let row_key = RowKey {
            entity_id: key.entity_id.clone(),
            file_id: key.file_id.clone(),
            version_id,
        };
        table.untracked.remove(&row_key).is_some()
    }

    /// Resolve an entity key along an inheritance chain (queried version
    /// first, root last). Untracked rows shadow tracked rows at the same
    /// version; tombstones stop the walk without consulting ancestors.
    pub fn resolve(&self, chain: &[VersionId], key: &EntityKey) -> Option<ResolvedRow> {
        self.resolve_with(chain, key, true)
    }

    /// Resolution over tracked rows only. Diff and merge use this variant;
    /// untracked rows never take part in history.
    pub fn resolve_tracked(&self, chain: &[VersionId], key: &EntityKey) -> Option<ResolvedRow> {
        self.resolve_with(chain, key, false)
    }

    fn resolve_with(
        &self,
        chain: &[VersionId],
        key: &EntityKey,
        include_untracked: bool,
    ) -> Option<ResolvedRow> {
        let table = self.tables.get(&key.schema_key)?;
        let queried = *chain.first()?;
        for (depth, version_id) in chain.iter().enumerate() {
            let row_key = RowKey {
                entity_id: key.entity_id.clone(),
                file_id: key.file_id.clone(),
                version_id: *version_id,
            };
            if include_untracked {
                if let Some(row) = table.untracked.get(&row_key) {
                    if row.is_tombstone {
                        return None;
                    }
                    return Some(tag_resolved(row, depth, queried, *version_id, true));
                }
            }
            if let Some(row) = table.rows.get(&row_key) {
                if row.is_tombstone {
                    return None;
                }
                return Some(tag_resolved(row, depth, queried, *version_id, false));
            }
        }
        None
    }

    /// All entity keys with a tracked row under any of `versions`.
    pub fn tracked_keys(&self, versions: &[VersionId]) -> BTreeSet<EntityKey> {
        let wanted: BTreeSet<VersionId> = versions.iter().copied().collect();
        let mut keys = BTreeSet::new();
        for table in self.tables.values() {
            for row_key in table.rows.keys() {
                if wanted.contains(&row_key.version_id) {
                    keys.insert(EntityKey::new(
                        row_key.entity_id.clone(),
                        table.schema_key.clone(),
                        row_key.file_id.clone(),
                    ));
                }
            }
        }
        keys
    }

    /// Drop tracked rows: all of them, or only those owned by the given
    /// versions. Untracked rows are never cleared here; they are not
    /// derivable from the log.
    pub fn clear_tracked(&mut self, versions: Option<&[VersionId]>) {
        match versions {
            None => {
                for table in self.tables.values_mut() {
                    table.rows.clear();
                }
            }
            Some(versions) => {
                let wanted: BTreeSet<VersionId> = versions.iter().copied().collect();
                for table in self.tables.values_mut() {
                    table.rows.retain(|row_key, _| !wanted.contains(&row_key.version_id));
                }
            }
        }
    }
}

fn tag_resolved(
    row: &CacheRow,
    depth: usize,
    queried: VersionId,
    owning: VersionId,
    untracked: bool,
) -> ResolvedRow {
    let mut row = row.clone();
    let provenance = if depth == 0 {
        if untracked {
            Provenance::Untracked
        } else {
            Provenance::Tracked
        }
    } else {
        // Report under the querying version while recording the owner.
        row.version_id = queried;
        row.inherited_from = Some(owning);
        if untracked {
            Provenance::UntrackedInherited
        } else {
            Provenance::TrackedInherited
        }
    };
    ResolvedRow { row, provenance }
}
