//! Whitelisted, alias-annotated schema catalog
//!
//! The catalog is the single source of truth for what the router may query.
//! It is built once (see [`builder`]), shared behind a [`handle::CatalogHandle`],
//! and never mutated in place.

pub mod builder;
pub mod handle;
pub mod manifest;

use crate::error::{Result, RouterError};
use crate::fuzzy_matcher::fold;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::Path;
use tracing::info;

pub use builder::CatalogBuilder;
pub use handle::CatalogHandle;
pub use manifest::AliasManifest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Integer,
    Real,
    Text,
    Date,
    Boolean,
    Other,
}

impl ColumnType {
    /// Map a declared SQL type to a column type (SQLite affinity rules, roughly).
    pub fn from_declared(declared: &str) -> Self {
        let upper = declared.to_uppercase();
        if upper.contains("DATE") || upper.contains("TIME") {
            ColumnType::Date
        } else if upper.contains("BOOL") {
            ColumnType::Boolean
        } else if upper.contains("INT") {
            ColumnType::Integer
        } else if upper.contains("REAL")
            || upper.contains("FLOA")
            || upper.contains("DOUB")
            || upper.contains("NUMERIC")
            || upper.contains("DECIMAL")
        {
            ColumnType::Real
        } else if upper.contains("CHAR") || upper.contains("TEXT") || upper.contains("CLOB") {
            ColumnType::Text
        } else {
            ColumnType::Other
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, ColumnType::Integer | ColumnType::Real)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: ColumnType,
    pub nullable: bool,
    pub primary_key: bool,
    pub foreign_key: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelationInfo {
    pub column: String,
    pub references_table: String,
    pub references_column: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TableInfo {
    pub name: String,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub alias_variants: Vec<String>,
    pub columns: Vec<ColumnInfo>,
    #[serde(default)]
    pub relations: Vec<RelationInfo>,
    #[serde(default)]
    pub time_column: Option<String>,
    #[serde(default)]
    pub default_measure: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ViewInfo {
    pub name: String,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub alias_variants: Vec<String>,
    pub columns: Vec<ColumnInfo>,
    #[serde(default)]
    pub time_column: Option<String>,
    #[serde(default)]
    pub default_measure: Option<String>,
    /// entity type -> column carrying that entity's id
    #[serde(default)]
    pub scope_columns: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl CompareOp {
    pub fn as_sql(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
            CompareOp::Gt => ">",
            CompareOp::Gte => ">=",
            CompareOp::Lt => "<",
            CompareOp::Lte => "<=",
        }
    }
}

/// A bound query parameter. Values never appear inside SQL text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlParam {
    Int(i64),
    Real(f64),
    Text(String),
}

/// Domain phrase mapped to a canonical condition, e.g. "baux actifs" -> leases.status = 'active'
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BusinessSynonym {
    pub phrase: String,
    pub table: String,
    pub column: String,
    pub op: CompareOp,
    pub value: SqlParam,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityType {
    pub name: String,
    pub table: String,
    pub id_column: String,
    #[serde(default)]
    pub match_columns: Vec<String>,
    #[serde(default)]
    pub display_columns: Vec<String>,
    #[serde(default)]
    pub route_segments: Vec<String>,
    #[serde(default)]
    pub query_params: Vec<String>,
}

/// A concrete entity the resolver can recognise by value (tenant surname, property name)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityValue {
    pub entity_type: String,
    pub id: i64,
    pub label: String,
    /// Folded match keys
    pub keys: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum AliasTarget {
    Table { name: String },
    View { name: String },
    Column { table: String, column: String },
    Synonym { index: usize },
}

impl AliasTarget {
    pub fn canonical(&self, catalog: &Catalog) -> String {
        match self {
            AliasTarget::Table { name } | AliasTarget::View { name } => name.clone(),
            AliasTarget::Column { table, column } => format!("{}.{}", table, column),
            AliasTarget::Synonym { index } => catalog
                .synonyms
                .get(*index)
                .map(|s| format!("synonym:{}", fold(&s.phrase)))
                .unwrap_or_default(),
        }
    }
}

/// Borrowed view over anything a query may select from
#[derive(Debug, Clone, Copy)]
pub enum Queryable<'a> {
    Table(&'a TableInfo),
    View(&'a ViewInfo),
}

impl<'a> Queryable<'a> {
    pub fn name(&self) -> &'a str {
        match self {
            Queryable::Table(t) => &t.name,
            Queryable::View(v) => &v.name,
        }
    }

    /// Display label: the French alias when there is one
    pub fn label(&self) -> &'a str {
        let alias = match self {
            Queryable::Table(t) => t.alias.as_deref(),
            Queryable::View(v) => v.alias.as_deref(),
        };
        alias.unwrap_or_else(|| self.name())
    }

    pub fn columns(&self) -> &'a [ColumnInfo] {
        match self {
            Queryable::Table(t) => &t.columns,
            Queryable::View(v) => &v.columns,
        }
    }

    pub fn column(&self, name: &str) -> Option<&'a ColumnInfo> {
        self.columns().iter().find(|c| c.name == name)
    }

    pub fn relations(&self) -> &'a [RelationInfo] {
        match self {
            Queryable::Table(t) => &t.relations,
            Queryable::View(_) => &[],
        }
    }

    pub fn time_column(&self) -> Option<&'a str> {
        match self {
            Queryable::Table(t) => t.time_column.as_deref(),
            Queryable::View(v) => v.time_column.as_deref(),
        }
    }

    pub fn default_measure(&self) -> Option<&'a str> {
        match self {
            Queryable::Table(t) => t.default_measure.as_deref(),
            Queryable::View(v) => v.default_measure.as_deref(),
        }
    }

    pub fn primary_key(&self) -> Option<&'a str> {
        self.columns()
            .iter()
            .find(|c| c.primary_key)
            .map(|c| c.name.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Catalog {
    /// Version of the alias manifest this catalog was built from
    pub version: String,
    pub built_at: DateTime<Utc>,
    pub tables: Vec<TableInfo>,
    #[serde(default)]
    pub views: Vec<ViewInfo>,
    #[serde(default)]
    pub synonyms: Vec<BusinessSynonym>,
    #[serde(default)]
    pub entity_types: Vec<EntityType>,
    #[serde(default)]
    pub entities: Vec<EntityValue>,

    #[serde(skip)]
    alias_index: HashMap<String, Vec<AliasTarget>>,
    #[serde(skip)]
    entity_key_index: HashMap<String, Vec<usize>>,
    #[serde(skip)]
    max_alias_tokens: usize,
}

impl Catalog {
    /// Assemble a catalog and build its lookup indexes.
    pub fn new(
        version: impl Into<String>,
        tables: Vec<TableInfo>,
        views: Vec<ViewInfo>,
        synonyms: Vec<BusinessSynonym>,
        entity_types: Vec<EntityType>,
        entities: Vec<EntityValue>,
    ) -> Result<Self> {
        let mut catalog = Self {
            version: version.into(),
            built_at: Utc::now(),
            tables,
            views,
            synonyms,
            entity_types,
            entities,
            alias_index: HashMap::new(),
            entity_key_index: HashMap::new(),
            max_alias_tokens: 1,
        };
        catalog.rebuild_index()?;
        Ok(catalog)
    }

    /// Check internal consistency and rebuild alias/entity indexes.
    fn rebuild_index(&mut self) -> Result<()> {
        let mut index: HashMap<String, Vec<AliasTarget>> = HashMap::new();
        let mut add = |alias: &str, target: AliasTarget| {
            let key = fold(alias);
            if key.is_empty() {
                return;
            }
            let entry = index.entry(key).or_default();
            if !entry.contains(&target) {
                entry.push(target);
            }
        };

        for t in &self.tables {
            let target = AliasTarget::Table { name: t.name.clone() };
            add(&t.name, target.clone());
            for alias in t.alias.iter().chain(t.alias_variants.iter()) {
                add(alias, target.clone());
            }
            for c in &t.columns {
                if let Some(alias) = &c.alias {
                    add(
                        alias,
                        AliasTarget::Column {
                            table: t.name.clone(),
                            column: c.name.clone(),
                        },
                    );
                }
            }
        }
        for v in &self.views {
            let target = AliasTarget::View { name: v.name.clone() };
            add(&v.name, target.clone());
            for alias in v.alias.iter().chain(v.alias_variants.iter()) {
                add(alias, target.clone());
            }
            for c in &v.columns {
                if let Some(alias) = &c.alias {
                    add(
                        alias,
                        AliasTarget::Column {
                            table: v.name.clone(),
                            column: c.name.clone(),
                        },
                    );
                }
            }
        }
        for (i, s) in self.synonyms.iter().enumerate() {
            add(&s.phrase, AliasTarget::Synonym { index: i });
        }

        for s in &self.synonyms {
            if !self.has_column(&s.table, &s.column) {
                return Err(RouterError::Catalog(format!(
                    "Synonym '{}' targets unknown column {}.{}",
                    s.phrase, s.table, s.column
                )));
            }
        }
        for et in &self.entity_types {
            if !self.has_column(&et.table, &et.id_column) {
                return Err(RouterError::Catalog(format!(
                    "Entity type '{}' targets unknown column {}.{}",
                    et.name, et.table, et.id_column
                )));
            }
        }

        let mut entity_keys: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, e) in self.entities.iter().enumerate() {
            if self.entity_type(&e.entity_type).is_none() {
                return Err(RouterError::Catalog(format!(
                    "Entity value #{} has unknown type '{}'",
                    e.id, e.entity_type
                )));
            }
            for key in &e.keys {
                entity_keys.entry(key.clone()).or_default().push(i);
            }
        }

        self.max_alias_tokens = index
            .keys()
            .chain(entity_keys.keys())
            .map(|k| k.split(' ').count())
            .max()
            .unwrap_or(1);
        self.alias_index = index;
        self.entity_key_index = entity_keys;
        Ok(())
    }

    pub fn queryable(&self, name: &str) -> Option<Queryable<'_>> {
        self.tables
            .iter()
            .find(|t| t.name == name)
            .map(Queryable::Table)
            .or_else(|| self.views.iter().find(|v| v.name == name).map(Queryable::View))
    }

    pub fn is_whitelisted(&self, name: &str) -> bool {
        self.queryable(name).is_some()
    }

    pub fn has_column(&self, relation: &str, column: &str) -> bool {
        self.queryable(relation)
            .and_then(|q| q.column(column))
            .is_some()
    }

    pub fn entity_type(&self, name: &str) -> Option<&EntityType> {
        self.entity_types.iter().find(|e| e.name == name)
    }

    pub fn entity_type_for_table(&self, table: &str) -> Option<&EntityType> {
        self.entity_types.iter().find(|e| e.table == table)
    }

    pub fn entity(&self, entity_type: &str, id: i64) -> Option<&EntityValue> {
        self.entities
            .iter()
            .find(|e| e.entity_type == entity_type && e.id == id)
    }

    pub fn alias_targets(&self, folded: &str) -> &[AliasTarget] {
        self.alias_index
            .get(folded)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Aliases mapping to more than one canonical element
    pub fn ambiguous_aliases(&self) -> Vec<&str> {
        let mut out: Vec<&str> = self
            .alias_index
            .iter()
            .filter(|(_, targets)| targets.len() > 1)
            .map(|(alias, _)| alias.as_str())
            .collect();
        out.sort();
        out
    }

    pub fn aliases(&self) -> impl Iterator<Item = (&str, &[AliasTarget])> {
        self.alias_index
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn entities_by_key(&self, folded: &str) -> Vec<&EntityValue> {
        self.entity_key_index
            .get(folded)
            .map(|ids| ids.iter().filter_map(|i| self.entities.get(*i)).collect())
            .unwrap_or_default()
    }

    /// Longest alias or entity key, in tokens
    pub fn max_alias_tokens(&self) -> usize {
        self.max_alias_tokens
    }

    /// Columns of `relation` that directly carry the id of `entity_type`.
    pub fn direct_scope_columns(&self, relation: &str, entity_type: &EntityType) -> Vec<String> {
        let Some(q) = self.queryable(relation) else {
            return Vec::new();
        };
        if q.name() == entity_type.table {
            return vec![entity_type.id_column.clone()];
        }
        match q {
            Queryable::Table(t) => t
                .relations
                .iter()
                .filter(|r| {
                    r.references_table == entity_type.table
                        && r.references_column == entity_type.id_column
                })
                .map(|r| r.column.clone())
                .collect(),
            Queryable::View(v) => v
                .scope_columns
                .get(&entity_type.name)
                .cloned()
                .into_iter()
                .collect(),
        }
    }

    /// Serialize for fast reload.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        info!("Saved catalog v{} to {}", self.version, path.display());
        Ok(())
    }

    /// Reload a serialized catalog, re-validating it and rebuilding indexes.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut catalog: Catalog = serde_json::from_str(&content)?;
        if catalog.tables.is_empty() && catalog.views.is_empty() {
            return Err(RouterError::Catalog(format!(
                "Catalog at {} whitelists nothing",
                path.display()
            )));
        }
        catalog.rebuild_index()?;
        info!(
            "Loaded catalog v{} ({} tables, {} views)",
            catalog.version,
            catalog.tables.len(),
            catalog.views.len()
        );
        Ok(catalog)
    }

    /// Export alias -> canonical mappings as CSV for audit.
    pub fn write_alias_audit<W: Write>(&self, writer: W) -> Result<()> {
        let mut wtr = csv::Writer::from_writer(writer);
        wtr.write_record(["alias", "kind", "canonical", "ambiguous"])?;

        let mut rows: Vec<(String, &'static str, String, bool)> = Vec::new();
        for (alias, targets) in self.aliases() {
            for target in targets {
                let kind = match target {
                    AliasTarget::Table { .. } => "table",
                    AliasTarget::View { .. } => "view",
                    AliasTarget::Column { .. } => "column",
                    AliasTarget::Synonym { .. } => "synonym",
                };
                rows.push((
                    alias.to_string(),
                    kind,
                    target.canonical(self),
                    targets.len() > 1,
                ));
            }
        }
        rows.sort();

        for (alias, kind, canonical, ambiguous) in rows {
            wtr.write_record([
                alias.as_str(),
                kind,
                canonical.as_str(),
                if ambiguous { "true" } else { "false" },
            ])?;
        }
        wtr.flush()?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Hand-built catalog shared by unit tests.

    use super::*;

    fn col(name: &str, data_type: ColumnType, alias: Option<&str>) -> ColumnInfo {
        ColumnInfo {
            name: name.to_string(),
            data_type,
            nullable: !name.ends_with("id"),
            primary_key: name == "id",
            foreign_key: name.ends_with("_id"),
            alias: alias.map(str::to_string),
        }
    }

    fn rel(column: &str, table: &str) -> RelationInfo {
        RelationInfo {
            column: column.to_string(),
            references_table: table.to_string(),
            references_column: "id".to_string(),
        }
    }

    fn entity(entity_type: &str, id: i64, label: &str, keys: &[&str]) -> EntityValue {
        EntityValue {
            entity_type: entity_type.to_string(),
            id,
            label: label.to_string(),
            keys: keys.iter().map(|k| fold(k)).collect(),
        }
    }

    pub fn catalog() -> Catalog {
        let tables = vec![
            TableInfo {
                name: "properties".to_string(),
                alias: Some("biens".to_string()),
                alias_variants: vec!["bien".into(), "residence".into(), "logements".into()],
                columns: vec![
                    col("id", ColumnType::Integer, None),
                    col("name", ColumnType::Text, Some("nom")),
                    col("city", ColumnType::Text, Some("ville")),
                    col("surface", ColumnType::Real, Some("surface")),
                ],
                relations: vec![],
                time_column: None,
                default_measure: Some("surface".to_string()),
            },
            TableInfo {
                name: "tenants".to_string(),
                alias: Some("locataires".to_string()),
                alias_variants: vec!["locataire".into()],
                columns: vec![
                    col("id", ColumnType::Integer, None),
                    col("first_name", ColumnType::Text, None),
                    col("last_name", ColumnType::Text, None),
                ],
                relations: vec![],
                time_column: None,
                default_measure: None,
            },
            TableInfo {
                name: "leases".to_string(),
                alias: Some("baux".to_string()),
                alias_variants: vec!["bail".into(), "locations".into()],
                columns: vec![
                    col("id", ColumnType::Integer, None),
                    col("property_id", ColumnType::Integer, None),
                    col("tenant_id", ColumnType::Integer, None),
                    col("reference", ColumnType::Text, None),
                    col("start_date", ColumnType::Date, None),
                    col("rent_amount", ColumnType::Real, Some("loyer")),
                    col("status", ColumnType::Text, Some("statut")),
                ],
                relations: vec![rel("property_id", "properties"), rel("tenant_id", "tenants")],
                time_column: Some("start_date".to_string()),
                default_measure: Some("rent_amount".to_string()),
            },
            TableInfo {
                name: "transactions".to_string(),
                alias: Some("transactions".to_string()),
                alias_variants: vec!["paiements".into(), "paiement".into()],
                columns: vec![
                    col("id", ColumnType::Integer, None),
                    col("lease_id", ColumnType::Integer, None),
                    col("property_id", ColumnType::Integer, None),
                    col("amount", ColumnType::Real, Some("montant")),
                    col("paid_on", ColumnType::Date, None),
                    col("kind", ColumnType::Text, None),
                ],
                relations: vec![rel("lease_id", "leases"), rel("property_id", "properties")],
                time_column: Some("paid_on".to_string()),
                default_measure: Some("amount".to_string()),
            },
        ];
        let views = vec![ViewInfo {
            name: "v_rent_roll".to_string(),
            alias: Some("etat locatif".to_string()),
            alias_variants: vec![],
            columns: vec![
                col("property_id", ColumnType::Integer, None),
                col("property_name", ColumnType::Text, None),
                col("monthly_rent", ColumnType::Real, Some("loyer mensuel")),
            ],
            time_column: None,
            default_measure: Some("monthly_rent".to_string()),
            scope_columns: [("property".to_string(), "property_id".to_string())]
                .into_iter()
                .collect(),
        }];
        let synonyms = vec![
            BusinessSynonym {
                phrase: "baux actifs".to_string(),
                table: "leases".to_string(),
                column: "status".to_string(),
                op: CompareOp::Eq,
                value: SqlParam::Text("active".to_string()),
            },
            BusinessSynonym {
                phrase: "loyers".to_string(),
                table: "transactions".to_string(),
                column: "kind".to_string(),
                op: CompareOp::Eq,
                value: SqlParam::Text("rent".to_string()),
            },
        ];
        let entity_types = vec![
            EntityType {
                name: "property".to_string(),
                table: "properties".to_string(),
                id_column: "id".to_string(),
                match_columns: vec!["name".to_string()],
                display_columns: vec!["name".to_string()],
                route_segments: vec!["properties".to_string(), "biens".to_string()],
                query_params: vec!["property_id".to_string(), "bien_id".to_string()],
            },
            EntityType {
                name: "tenant".to_string(),
                table: "tenants".to_string(),
                id_column: "id".to_string(),
                match_columns: vec!["last_name".to_string()],
                display_columns: vec!["first_name".to_string(), "last_name".to_string()],
                route_segments: vec!["tenants".to_string(), "locataires".to_string()],
                query_params: vec!["tenant_id".to_string()],
            },
            EntityType {
                name: "lease".to_string(),
                table: "leases".to_string(),
                id_column: "id".to_string(),
                match_columns: vec![],
                display_columns: vec!["reference".to_string()],
                route_segments: vec!["leases".to_string(), "baux".to_string()],
                query_params: vec!["lease_id".to_string()],
            },
        ];
        let entities = vec![
            entity("property", 1, "Les Tilleuls", &["Les Tilleuls"]),
            entity("property", 2, "Les Acacias", &["Les Acacias"]),
            entity("tenant", 1, "Jean Dupont", &["Dupont", "Jean Dupont"]),
            entity("tenant", 2, "Paul Martin", &["Martin", "Paul Martin"]),
            entity("tenant", 3, "Julie Martin", &["Martin", "Julie Martin"]),
            entity("tenant", 4, "Claire Lefebvre", &["Lefebvre", "Claire Lefebvre"]),
        ];
        Catalog::new("test-1", tables, views, synonyms, entity_types, entities)
            .expect("fixture catalog is consistent")
    }
}
