//! Catalog Builder
//!
//! Introspects the live schema and merges it with the curated alias manifest.
//! Any introspection failure fails the whole build: a partial whitelist is
//! worse than none.

use super::manifest::{AliasManifest, RelationAliases};
use super::{
    Catalog, ColumnInfo, ColumnType, EntityType, EntityValue, RelationInfo, TableInfo, ViewInfo,
};
use crate::error::{Result, RouterError};
use crate::fuzzy_matcher::fold;
use std::collections::HashSet;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    Table,
    View,
}

/// Raw schema of one relation, before aliases are applied
#[derive(Debug, Clone)]
pub struct RelationSchema {
    pub name: String,
    pub kind: RelationKind,
    pub columns: Vec<ColumnInfo>,
    pub relations: Vec<RelationInfo>,
}

#[derive(Debug, Clone)]
pub struct EntityLabelRow {
    pub id: i64,
    pub match_values: Vec<String>,
    pub display_values: Vec<String>,
}

/// Schema introspection source, consumed only by the builder
pub trait SchemaIntrospector: Send + Sync {
    fn list_relations(&self) -> Result<Vec<String>>;

    fn describe(&self, relation: &str) -> Result<RelationSchema>;

    fn entity_labels(&self, entity: &EntityType) -> Result<Vec<EntityLabelRow>>;
}

pub struct CatalogBuilder {
    manifest: AliasManifest,
}

impl CatalogBuilder {
    pub fn new(manifest: AliasManifest) -> Self {
        Self { manifest }
    }

    pub fn manifest(&self) -> &AliasManifest {
        &self.manifest
    }

    pub fn build(&self, source: &dyn SchemaIntrospector) -> Result<Catalog> {
        info!("Building catalog from manifest v{}", self.manifest.version);

        let available: HashSet<String> = source.list_relations()?.into_iter().collect();
        let whitelist: HashSet<&str> = self.manifest.relation_names().collect();

        let mut tables = Vec::new();
        for aliases in &self.manifest.tables {
            let schema = self.introspect(source, &available, aliases, RelationKind::Table)?;
            tables.push(self.table_info(schema, aliases, &whitelist)?);
        }

        let mut views = Vec::new();
        for aliases in &self.manifest.views {
            let schema = self.introspect(source, &available, aliases, RelationKind::View)?;
            views.push(self.view_info(schema, aliases)?);
        }

        let mut entities = Vec::new();
        for entity_type in &self.manifest.entities {
            let rows = source.entity_labels(entity_type).map_err(|e| {
                RouterError::Introspection {
                    relation: entity_type.table.clone(),
                    reason: e.to_string(),
                }
            })?;
            debug!("Loaded {} {} labels", rows.len(), entity_type.name);
            entities.extend(rows.into_iter().map(|row| entity_value(entity_type, row)));
        }

        let catalog = Catalog::new(
            self.manifest.version.clone(),
            tables,
            views,
            self.manifest.synonyms.clone(),
            self.manifest.entities.clone(),
            entities,
        )?;

        info!(
            "Catalog v{} built: {} tables, {} views, {} entities, {} ambiguous aliases",
            catalog.version,
            catalog.tables.len(),
            catalog.views.len(),
            catalog.entities.len(),
            catalog.ambiguous_aliases().len()
        );
        Ok(catalog)
    }

    fn introspect(
        &self,
        source: &dyn SchemaIntrospector,
        available: &HashSet<String>,
        aliases: &RelationAliases,
        expected: RelationKind,
    ) -> Result<RelationSchema> {
        if !available.contains(&aliases.name) {
            return Err(RouterError::Introspection {
                relation: aliases.name.clone(),
                reason: "relation not found in schema".to_string(),
            });
        }
        let schema = source
            .describe(&aliases.name)
            .map_err(|e| RouterError::Introspection {
                relation: aliases.name.clone(),
                reason: e.to_string(),
            })?;
        if schema.kind != expected {
            return Err(RouterError::Introspection {
                relation: aliases.name.clone(),
                reason: format!("expected {:?}, found {:?}", expected, schema.kind),
            });
        }
        if schema.columns.is_empty() {
            return Err(RouterError::Introspection {
                relation: aliases.name.clone(),
                reason: "no columns".to_string(),
            });
        }
        Ok(schema)
    }

    fn apply_column_aliases(
        schema_columns: Vec<ColumnInfo>,
        aliases: &RelationAliases,
    ) -> Result<Vec<ColumnInfo>> {
        for column in aliases.columns.keys() {
            if !schema_columns.iter().any(|c| &c.name == column) {
                return Err(RouterError::Catalog(format!(
                    "Alias for unknown column {}.{}",
                    aliases.name, column
                )));
            }
        }
        Ok(schema_columns
            .into_iter()
            .map(|mut c| {
                c.alias = aliases.columns.get(&c.name).cloned();
                c
            })
            .collect())
    }

    fn check_measures(columns: &[ColumnInfo], aliases: &RelationAliases) -> Result<()> {
        if let Some(time) = &aliases.time_column {
            match columns.iter().find(|c| &c.name == time) {
                Some(c) if matches!(c.data_type, ColumnType::Date | ColumnType::Text) => {}
                _ => {
                    return Err(RouterError::Catalog(format!(
                        "Time column {}.{} missing or not a date",
                        aliases.name, time
                    )))
                }
            }
        }
        if let Some(measure) = &aliases.default_measure {
            match columns.iter().find(|c| &c.name == measure) {
                Some(c) if c.data_type.is_numeric() => {}
                _ => {
                    return Err(RouterError::Catalog(format!(
                        "Measure {}.{} missing or not numeric",
                        aliases.name, measure
                    )))
                }
            }
        }
        Ok(())
    }

    fn table_info(
        &self,
        schema: RelationSchema,
        aliases: &RelationAliases,
        whitelist: &HashSet<&str>,
    ) -> Result<TableInfo> {
        let columns = Self::apply_column_aliases(schema.columns, aliases)?;
        Self::check_measures(&columns, aliases)?;

        // Join paths never lead outside the whitelist.
        let relations = schema
            .relations
            .into_iter()
            .filter(|r| whitelist.contains(r.references_table.as_str()))
            .collect();

        Ok(TableInfo {
            name: schema.name,
            alias: aliases.alias.clone(),
            alias_variants: aliases.variants.clone(),
            columns,
            relations,
            time_column: aliases.time_column.clone(),
            default_measure: aliases.default_measure.clone(),
        })
    }

    fn view_info(&self, schema: RelationSchema, aliases: &RelationAliases) -> Result<ViewInfo> {
        let columns = Self::apply_column_aliases(schema.columns, aliases)?;
        Self::check_measures(&columns, aliases)?;

        for (entity, column) in &aliases.scope_columns {
            if !columns.iter().any(|c| &c.name == column) {
                return Err(RouterError::Catalog(format!(
                    "Scope column {}.{} for '{}' does not exist",
                    aliases.name, column, entity
                )));
            }
        }

        Ok(ViewInfo {
            name: schema.name,
            alias: aliases.alias.clone(),
            alias_variants: aliases.variants.clone(),
            columns,
            time_column: aliases.time_column.clone(),
            default_measure: aliases.default_measure.clone(),
            scope_columns: aliases.scope_columns.clone(),
        })
    }
}

fn entity_value(entity_type: &EntityType, row: EntityLabelRow) -> EntityValue {
    let label = row
        .display_values
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ");

    let mut keys: Vec<String> = Vec::new();
    if !entity_type.match_columns.is_empty() {
        for value in row.match_values.iter().chain(std::iter::once(&label)) {
            let key = fold(value);
            if !key.is_empty() && !keys.contains(&key) {
                keys.push(key);
            }
        }
    }

    EntityValue {
        entity_type: entity_type.name.clone(),
        id: row.id,
        label: if label.is_empty() {
            format!("{} #{}", entity_type.name, row.id)
        } else {
            label
        },
        keys,
    }
}
