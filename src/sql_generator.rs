//! SQL Generator
//!
//! Emits parametrized read-only SQL for a [`QueryIntent`]. Only catalog
//! identifiers appear in the text; every value is bound as `?N`. The output
//! still goes through the validator before anything is dispatched.

use crate::catalog::{Catalog, Queryable, SqlParam};
use crate::config::RouterConfig;
use crate::intent::{Aggregation, QueryIntent};
use crate::scope::ScopeContext;
use crate::sql_validator::ValidationError;
use crate::time::TimeWindow;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedQuery {
    pub sql: String,
    pub params: Vec<SqlParam>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window: Option<TimeWindow>,
}

/// Where the scope filter lands relative to the target relation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopePath {
    /// `target.column = ?`
    Direct { column: String },
    /// target has an FK to `join`, which carries the scope column
    Forward {
        join: String,
        column: String,
        references_column: String,
        filter: String,
    },
    /// `join` has an FK to the target and carries the scope column; rows are de-duplicated
    Reverse {
        join: String,
        column: String,
        references_column: String,
        filter: String,
    },
}

pub struct SqlGenerator<'a> {
    catalog: &'a Catalog,
    list_limit: u64,
}

fn bind(params: &mut Vec<SqlParam>, value: SqlParam) -> String {
    params.push(value);
    format!("?{}", params.len())
}

impl<'a> SqlGenerator<'a> {
    pub fn new(catalog: &'a Catalog, config: &RouterConfig) -> Self {
        Self {
            catalog,
            list_limit: config.default_list_limit.min(config.max_rows),
        }
    }

    /// Find how to filter `target` on the scope entity.
    pub fn scope_path(&self, target: Queryable<'_>, scope: &ScopeContext) -> Result<ScopePath, ValidationError> {
        let entity_type = self
            .catalog
            .entity_type(&scope.entity_type)
            .ok_or(ValidationError::MissingScope)?;

        if let Some(column) = self
            .catalog
            .direct_scope_columns(target.name(), entity_type)
            .into_iter()
            .next()
        {
            return Ok(ScopePath::Direct { column });
        }

        for r in target.relations() {
            if r.references_table == target.name() {
                continue;
            }
            if let Some(filter) = self
                .catalog
                .direct_scope_columns(&r.references_table, entity_type)
                .into_iter()
                .next()
            {
                return Ok(ScopePath::Forward {
                    join: r.references_table.clone(),
                    column: r.column.clone(),
                    references_column: r.references_column.clone(),
                    filter,
                });
            }
        }

        for table in self.catalog.tables.iter().filter(|t| t.name != target.name()) {
            for r in table.relations.iter().filter(|r| r.references_table == target.name()) {
                if let Some(filter) = self
                    .catalog
                    .direct_scope_columns(&table.name, entity_type)
                    .into_iter()
                    .next()
                {
                    return Ok(ScopePath::Reverse {
                        join: table.name.clone(),
                        column: r.column.clone(),
                        references_column: r.references_column.clone(),
                        filter,
                    });
                }
            }
        }

        Err(ValidationError::MissingScope)
    }

    pub fn generate(
        &self,
        intent: &QueryIntent,
        scope: Option<&ScopeContext>,
    ) -> Result<GeneratedQuery, ValidationError> {
        let q = self
            .catalog
            .queryable(&intent.target)
            .ok_or(ValidationError::NotWhitelisted)?;
        let t = q.name();

        let path = scope.map(|s| self.scope_path(q, s)).transpose()?;
        let distinct = matches!(path, Some(ScopePath::Reverse { .. }));

        let column = |name: &str| -> Result<String, ValidationError> {
            q.column(name)
                .map(|c| format!("{}.{}", t, c.name))
                .ok_or(ValidationError::NotWhitelisted)
        };

        let (select, limit) = match &intent.aggregation {
            Aggregation::Count if distinct => {
                let pk = q.primary_key().ok_or(ValidationError::MissingScope)?;
                (format!("COUNT(DISTINCT {}.{}) AS total", t, pk), 1)
            }
            Aggregation::Count => ("COUNT(*) AS total".to_string(), 1),
            // A reverse hop would count joined rows more than once.
            Aggregation::Sum { .. } | Aggregation::Average { .. } if distinct => {
                return Err(ValidationError::MissingScope)
            }
            Aggregation::Sum { column: c } => (format!("SUM({}) AS total", column(c)?), 1),
            Aggregation::Average { column: c } => (format!("AVG({}) AS average", column(c)?), 1),
            Aggregation::List => {
                let columns = q
                    .columns()
                    .iter()
                    .map(|c| format!("{}.{}", t, c.name))
                    .collect::<Vec<_>>()
                    .join(", ");
                let prefix = if distinct { "DISTINCT " } else { "" };
                (format!("{}{}", prefix, columns), self.list_limit)
            }
        };

        let mut params = Vec::new();
        let mut from = format!("FROM {}", t);
        let mut filters = Vec::new();

        if let (Some(path), Some(scope)) = (&path, scope) {
            let id = SqlParam::Int(scope.entity_id);
            match path {
                ScopePath::Direct { column } => {
                    filters.push(format!("{}.{} = {}", t, column, bind(&mut params, id)));
                }
                ScopePath::Forward { join, column, references_column, filter } => {
                    from.push_str(&format!(
                        " JOIN {} ON {}.{} = {}.{}",
                        join, join, references_column, t, column
                    ));
                    filters.push(format!("{}.{} = {}", join, filter, bind(&mut params, id)));
                }
                ScopePath::Reverse { join, column, references_column, filter } => {
                    from.push_str(&format!(
                        " JOIN {} ON {}.{} = {}.{}",
                        join, join, column, t, references_column
                    ));
                    filters.push(format!("{}.{} = {}", join, filter, bind(&mut params, id)));
                }
            }
        }

        for condition in &intent.conditions {
            if condition.table != t {
                return Err(ValidationError::NotWhitelisted);
            }
            let placeholder = bind(&mut params, condition.value.clone());
            filters.push(format!(
                "{} {} {}",
                column(&condition.column)?,
                condition.op.as_sql(),
                placeholder
            ));
        }

        let window = match (intent.window, q.time_column()) {
            (Some(w), Some(time)) => {
                let time = column(time)?;
                let start = bind(&mut params, SqlParam::Text(w.start.format("%Y-%m-%d").to_string()));
                let end = bind(&mut params, SqlParam::Text(w.end.format("%Y-%m-%d").to_string()));
                filters.push(format!("{} >= {}", time, start));
                filters.push(format!("{} < {}", time, end));
                Some(w)
            }
            _ => None,
        };

        let mut sql = format!("SELECT {} {}", select, from);
        if !filters.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&filters.join(" AND "));
        }
        if intent.aggregation == Aggregation::List {
            if let Some(time) = q.time_column() {
                sql.push_str(&format!(" ORDER BY {} DESC", column(time)?));
            } else if let Some(pk) = q.primary_key() {
                sql.push_str(&format!(" ORDER BY {}.{} ASC", t, pk));
            }
        }
        sql.push_str(&format!(" LIMIT {}", limit));

        Ok(GeneratedQuery { sql, params, window })
    }
}
