//! Curated alias manifest
//!
//! Versioned data artefact naming which relations are queryable and how the
//! business refers to them. It only translates and whitelists; it is not an ORM.

use super::{BusinessSynonym, EntityType};
use crate::error::{Result, RouterError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

const DEFAULT_MANIFEST: &str = include_str!("../../data/aliases.json");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationAliases {
    pub name: String,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub variants: Vec<String>,
    /// column name -> alias
    #[serde(default)]
    pub columns: BTreeMap<String, String>,
    #[serde(default)]
    pub time_column: Option<String>,
    #[serde(default)]
    pub default_measure: Option<String>,
    /// Views only: entity type -> column carrying that entity's id
    #[serde(default)]
    pub scope_columns: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AliasManifest {
    pub version: String,
    pub tables: Vec<RelationAliases>,
    #[serde(default)]
    pub views: Vec<RelationAliases>,
    #[serde(default)]
    pub synonyms: Vec<BusinessSynonym>,
    #[serde(default)]
    pub entities: Vec<EntityType>,
}

impl AliasManifest {
    /// The manifest shipped with the crate.
    pub fn embedded() -> Result<Self> {
        Self::parse(DEFAULT_MANIFEST)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let manifest: AliasManifest = serde_json::from_str(content)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Structural checks that do not need the live schema.
    pub fn validate(&self) -> Result<()> {
        if self.version.trim().is_empty() {
            return Err(RouterError::Catalog("Alias manifest has no version".to_string()));
        }
        if self.tables.is_empty() && self.views.is_empty() {
            return Err(RouterError::Catalog(
                "Alias manifest whitelists no relation".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for r in self.tables.iter().chain(self.views.iter()) {
            if !seen.insert(r.name.as_str()) {
                return Err(RouterError::Catalog(format!(
                    "Relation '{}' listed twice in alias manifest",
                    r.name
                )));
            }
        }
        for s in &self.synonyms {
            if !seen.contains(s.table.as_str()) {
                return Err(RouterError::Catalog(format!(
                    "Synonym '{}' targets non-whitelisted relation '{}'",
                    s.phrase, s.table
                )));
            }
        }
        for e in &self.entities {
            if !self.tables.iter().any(|t| t.name == e.table) {
                return Err(RouterError::Catalog(format!(
                    "Entity type '{}' targets non-whitelisted table '{}'",
                    e.name, e.table
                )));
            }
        }
        Ok(())
    }

    pub fn relation_names(&self) -> impl Iterator<Item = &str> {
        self.tables
            .iter()
            .chain(self.views.iter())
            .map(|r| r.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_manifest_is_valid() {
        let manifest = AliasManifest::embedded().unwrap();
        assert!(!manifest.version.is_empty());
        assert!(manifest.tables.iter().any(|t| t.name == "leases"));
        assert!(manifest.entities.iter().any(|e| e.name == "tenant"));
    }

    #[test]
    fn test_synonym_outside_whitelist_is_rejected() {
        let json = r#"{
            "version": "1",
            "tables": [{ "name": "leases" }],
            "synonyms": [{ "phrase": "admins", "table": "users", "column": "role", "op": "eq", "value": "admin" }]
        }"#;
        assert!(AliasManifest::parse(json).is_err());
    }

    #[test]
    fn test_duplicate_relation_is_rejected() {
        let json = r#"{ "version": "1", "tables": [{ "name": "leases" }, { "name": "leases" }] }"#;
        assert!(AliasManifest::parse(json).is_err());
    }
}
