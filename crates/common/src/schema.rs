use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Entity-view variants a schema can expose to the query layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ViewVariant {
    /// Resolved state under one version.
    Live,
    /// State across all versions.
    AllVersions,
    /// Full change history.
    History,
}

/// An opaque schema registration.
///
/// The engine never interprets schema semantics beyond the key: it only needs
/// the property column names to materialize, whether entities under the
/// schema may be rewritten, and which view variants the query layer may
/// expose.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDef {
    pub key: String,
    pub version: String,
    /// Property columns materialized for this schema. Fixed at registration;
    /// a snapshot carrying an unlisted property is an error.
    pub properties: Vec<String>,
    /// Immutable schemas reject a second distinct change to an entity.
    pub immutable: bool,
    pub views: BTreeSet<ViewVariant>,
}

impl SchemaDef {
    /// A mutable schema with all view variants enabled.
    pub fn new(key: impl Into<String>, version: impl Into<String>, properties: &[&str]) -> Self {
        Self {
            key: key.into(),
            version: version.into(),
            properties: properties.iter().map(|p| p.to_string()).collect(),
            immutable: false,
            views: [
                ViewVariant::Live,
                ViewVariant::AllVersions,
                ViewVariant::History,
            ]
            .into_iter()
            .collect(),
        }
    }

    pub fn immutable(mut self) -> Self {
        self.immutable = true;
        self
    }
}

/// Errors from schema registration and lookup.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("schema `{0}` is already registered")]
    Duplicate(String),
    #[error("unknown schema `{0}`")]
    Unknown(String),
}

/// Registry of schema definitions keyed by schema key.
///
/// Resolved once per key and memoized by callers; unknown keys are an error
/// everywhere, never a silent fallback.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaRegistry {
    schemas: BTreeMap<String, SchemaDef>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a schema. Re-registering an identical definition is a no-op;
    /// registering a different definition under an existing key is rejected.
    pub fn register(&mut self, def: SchemaDef) -> Result<(), SchemaError> {
        if let Some(existing) = self.schemas.get(&def.key) {
            if *existing == def {
                return Ok(());
            }
            return Err(SchemaError::Duplicate(def.key));
        }
        self.schemas.insert(def.key.clone(), def);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&SchemaDef> {
        self.schemas.get(key)
    }

    pub fn require(&self, key: &str) -> Result<&SchemaDef, SchemaError> {
        self.schemas
            .get(key)
            .ok_or_else(|| SchemaError::Unknown(key.to_string()))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.schemas.contains_key(key)
    }

    pub fn view_enabled(&self, key: &str, variant: ViewVariant) -> bool {
        self.schemas
            .get(key)
            .is_some_and(|def| def.views.contains(&variant))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.schemas.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_lookup() {
        let mut reg = SchemaRegistry::new();
        reg.register(SchemaDef::new("note", "1.0", &["title", "body"]))
            .unwrap();
        let def = reg.require("note").unwrap();
        assert_eq!(def.properties, vec!["title", "body"]);
        assert!(!def.immutable);
    }

    #[test]
    fn duplicate_registration_rejected() {
        let mut reg = SchemaRegistry::new();
        reg.register(SchemaDef::new("note", "1.0", &["title"])).unwrap();
        // Identical re-registration is fine.
        reg.register(SchemaDef::new("note", "1.0", &["title"])).unwrap();
        // A different definition under the same key is not.
        let err = reg.register(SchemaDef::new("note", "2.0", &["title"]));
        assert!(matches!(err, Err(SchemaError::Duplicate(_))));
    }

    #[test]
    fn unknown_schema_is_an_error() {
        let reg = SchemaRegistry::new();
        assert!(matches!(reg.require("ghost"), Err(SchemaError::Unknown(_))));
    }

    #[test]
    fn view_variants_enabled_by_default() {
        let mut reg = SchemaRegistry::new();
        reg.register(SchemaDef::new("note", "1.0", &[])).unwrap();
        assert!(reg.view_enabled("note", ViewVariant::Live));
        assert!(reg.view_enabled("note", ViewVariant::History));
        assert!(!reg.view_enabled("ghost", ViewVariant::Live));
    }

    #[test]
    fn immutable_builder_sets_flag() {
        let def = SchemaDef::new("account", "1.0", &["balance"]).immutable();
        assert!(def.immutable);
    }
}
