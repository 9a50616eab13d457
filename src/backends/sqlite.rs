//! SQLite backends
//!
//! [`SqliteIntrospector`] feeds the catalog builder. [`SqliteExecutor`] is the
//! read-only execution service: `query_only` connection, positional binding,
//! blocking work off the async runtime, and an interrupt when the caller
//! stops waiting on a statement that has started.

use crate::catalog::builder::{EntityLabelRow, RelationKind, RelationSchema, SchemaIntrospector};
use crate::catalog::{ColumnInfo, ColumnType, EntityType, RelationInfo, SqlParam};
use crate::collaborators::{QueryExecutor, QueryRows};
use crate::error::{Result, RouterError};
use crate::sql_validator::ValidatedQuery;
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, InterruptHandle, OpenFlags};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

lazy_static! {
    static ref IDENTIFIER: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap();
}

fn single_quoted(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn checked_identifier(name: &str) -> Result<&str> {
    if IDENTIFIER.is_match(name) {
        Ok(name)
    } else {
        Err(RouterError::Introspection {
            relation: name.to_string(),
            reason: "not a plain identifier".to_string(),
        })
    }
}

fn open_read_only(path: &Path) -> Result<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    conn.pragma_update(None, "query_only", "ON")?;
    Ok(conn)
}

fn text_of(value: SqlValue) -> String {
    match value {
        SqlValue::Null => String::new(),
        SqlValue::Integer(i) => i.to_string(),
        SqlValue::Real(f) => f.to_string(),
        SqlValue::Text(s) => s,
        SqlValue::Blob(_) => String::new(),
    }
}

/// Schema source over a SQLite database
pub struct SqliteIntrospector {
    db: Mutex<Connection>,
}

impl SqliteIntrospector {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Introspecting SQLite schema at {}", path.display());
        Ok(Self::from_connection(open_read_only(path)?))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
        }
    }

    pub fn into_connection(self) -> Connection {
        self.db.into_inner().unwrap_or_else(|e| e.into_inner())
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn kind_of(conn: &Connection, relation: &str) -> Result<RelationKind> {
        let kind: String = conn.query_row(
            "SELECT type FROM sqlite_master WHERE name = ?1 AND type IN ('table', 'view')",
            [relation],
            |row| row.get(0),
        )?;
        Ok(if kind == "view" {
            RelationKind::View
        } else {
            RelationKind::Table
        })
    }

    fn primary_key_of(conn: &Connection, table: &str) -> Result<Option<String>> {
        let sql = format!("PRAGMA table_info({})", single_quoted(table));
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(1)?, row.get::<_, i64>(5)?)))?;
        for row in rows {
            let (name, pk) = row?;
            if pk == 1 {
                return Ok(Some(name));
            }
        }
        Ok(None)
    }

    fn foreign_keys(conn: &Connection, table: &str) -> Result<Vec<RelationInfo>> {
        let sql = format!("PRAGMA foreign_key_list({})", single_quoted(table));
        let mut stmt = conn.prepare(&sql)?;
        let raw = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut relations = Vec::new();
        for (references_table, column, to) in raw {
            // A bare REFERENCES clause points at the parent's primary key.
            let references_column = match to {
                Some(c) => c,
                None => Self::primary_key_of(conn, &references_table)?
                    .unwrap_or_else(|| "id".to_string()),
            };
            relations.push(RelationInfo {
                column,
                references_table,
                references_column,
            });
        }
        Ok(relations)
    }
}

impl SchemaIntrospector for SqliteIntrospector {
    fn list_relations(&self) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master \
             WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%' \
             ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        debug!("Found {} relations", names.len());
        Ok(names)
    }

    fn describe(&self, relation: &str) -> Result<RelationSchema> {
        let conn = self.conn();
        let kind = Self::kind_of(&conn, relation)?;
        let relations = match kind {
            RelationKind::Table => Self::foreign_keys(&conn, relation)?,
            RelationKind::View => Vec::new(),
        };

        let sql = format!("PRAGMA table_info({})", single_quoted(relation));
        let mut stmt = conn.prepare(&sql)?;
        let columns = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(5)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?
            .into_iter()
            .map(|(name, declared, not_null, pk)| ColumnInfo {
                foreign_key: relations.iter().any(|r| r.column == name),
                data_type: ColumnType::from_declared(declared.as_deref().unwrap_or("")),
                nullable: not_null == 0 && pk == 0,
                primary_key: pk > 0,
                alias: None,
                name,
            })
            .collect();

        Ok(RelationSchema {
            name: relation.to_string(),
            kind,
            columns,
            relations,
        })
    }

    fn entity_labels(&self, entity: &EntityType) -> Result<Vec<EntityLabelRow>> {
        let mut selected = vec![checked_identifier(&entity.id_column)?];
        for c in entity.match_columns.iter().chain(&entity.display_columns) {
            selected.push(checked_identifier(c)?);
        }
        let table = checked_identifier(&entity.table)?;

        let sql = format!(
            "SELECT {} FROM {} ORDER BY {}",
            selected.join(", "),
            table,
            selected[0]
        );
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let n_match = entity.match_columns.len();
        let n_display = entity.display_columns.len();

        let rows = stmt
            .query_map([], |row| {
                let id: i64 = row.get(0)?;
                let mut match_values = Vec::with_capacity(n_match);
                for i in 0..n_match {
                    match_values.push(text_of(row.get::<_, SqlValue>(1 + i)?));
                }
                let mut display_values = Vec::with_capacity(n_display);
                for i in 0..n_display {
                    display_values.push(text_of(row.get::<_, SqlValue>(1 + n_match + i)?));
                }
                Ok(EntityLabelRow {
                    id,
                    match_values,
                    display_values,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn sql_value(param: &SqlParam) -> SqlValue {
    match param {
        SqlParam::Int(i) => SqlValue::Integer(*i),
        SqlParam::Real(f) => SqlValue::Real(*f),
        SqlParam::Text(s) => SqlValue::Text(s.clone()),
    }
}

fn json_value(value: SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(i) => json!(i),
        SqlValue::Real(f) => json!(f),
        SqlValue::Text(s) => json!(s),
        SqlValue::Blob(b) => json!(format!("<{} bytes>", b.len())),
    }
}

fn run_query(conn: &Connection, sql: &str, params: &[SqlValue], row_cap: usize) -> Result<QueryRows> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().iter().map(ToString::to_string).collect();

    let mut rows = stmt.query(params_from_iter(params.iter()))?;
    let mut out = Vec::new();
    let mut truncated = false;
    while let Some(row) = rows.next()? {
        if out.len() >= row_cap {
            truncated = true;
            break;
        }
        let mut record = Vec::with_capacity(columns.len());
        for i in 0..columns.len() {
            record.push(json_value(row.get::<_, SqlValue>(i)?));
        }
        out.push(record);
    }

    Ok(QueryRows {
        columns,
        rows: out,
        truncated,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Queued,
    Running,
    Finished,
    Abandoned,
}

/// Tracks one execution so that only the statement it started can be
/// interrupted. A call still waiting for the connection is never armed.
struct RunControl {
    state: Mutex<RunState>,
    handle: Arc<InterruptHandle>,
}

impl RunControl {
    fn new(handle: Arc<InterruptHandle>) -> Self {
        Self {
            state: Mutex::new(RunState::Queued),
            handle,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Called with the connection held. Returns false if the caller left
    /// while the call was queued.
    fn begin(&self) -> bool {
        let mut state = self.lock();
        if *state == RunState::Abandoned {
            return false;
        }
        *state = RunState::Running;
        true
    }

    fn finish(&self) {
        *self.lock() = RunState::Finished;
    }

    fn abandon(&self) {
        let mut state = self.lock();
        match *state {
            RunState::Queued => {
                debug!("Query abandoned while waiting for the connection");
                *state = RunState::Abandoned;
            }
            RunState::Running => {
                warn!("Query abandoned before completion, interrupting statement");
                self.handle.interrupt();
                *state = RunState::Abandoned;
            }
            RunState::Finished | RunState::Abandoned => {}
        }
    }
}

/// Abandons the run when the awaiting future is dropped.
struct AbandonOnDrop(Arc<RunControl>);

impl Drop for AbandonOnDrop {
    fn drop(&mut self) {
        self.0.abandon();
    }
}

/// Read-only execution over a SQLite connection
pub struct SqliteExecutor {
    db: Arc<Mutex<Connection>>,
    interrupt: Arc<InterruptHandle>,
}

impl SqliteExecutor {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::wrap(open_read_only(path.as_ref())?))
    }

    /// Wrap an existing connection, switching it to `query_only`.
    pub fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "query_only", "ON")?;
        Ok(Self::wrap(conn))
    }

    fn wrap(conn: Connection) -> Self {
        let interrupt = Arc::new(conn.get_interrupt_handle());
        Self {
            db: Arc::new(Mutex::new(conn)),
            interrupt,
        }
    }

    async fn run(&self, sql: String, params: Vec<SqlValue>, row_cap: usize) -> Result<QueryRows> {
        let db = self.db.clone();
        let control = Arc::new(RunControl::new(self.interrupt.clone()));
        let guard = AbandonOnDrop(control.clone());

        let task = tokio::task::spawn_blocking(move || {
            let conn = db.lock().unwrap_or_else(|e| e.into_inner());
            if !control.begin() {
                return Err(RouterError::Collaborator("Query abandoned before it started".to_string()));
            }
            let result = run_query(&conn, &sql, &params, row_cap);
            control.finish();
            result
        });

        let result = task
            .await
            .map_err(|e| RouterError::Collaborator(format!("Execution task failed: {}", e)))?;
        drop(guard);
        result
    }
}

#[async_trait]
impl QueryExecutor for SqliteExecutor {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn execute(&self, query: &ValidatedQuery) -> Result<QueryRows> {
        let sql = query.sql().to_string();
        let params: Vec<SqlValue> = query.params().iter().map(sql_value).collect();
        let row_cap = usize::try_from(query.max_rows()).unwrap_or(usize::MAX);

        let rows = self.run(sql, params, row_cap).await?;
        debug!("Query returned {} rows", rows.row_count());
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn seeded() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE owners (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
             CREATE TABLE flats (
                 id INTEGER PRIMARY KEY,
                 owner_id INTEGER REFERENCES owners,
                 label TEXT,
                 surface REAL,
                 built_on DATE
             );
             CREATE VIEW v_flats AS SELECT f.id AS flat_id, f.surface AS surface FROM flats f;
             INSERT INTO owners (id, name) VALUES (1, 'Dupont'), (2, 'Martin');
             INSERT INTO flats (owner_id, label, surface) VALUES (1, 'A', 40.5), (2, 'B', 62.0);",
        )
        .unwrap();
        conn
    }

    #[test]
    fn test_describe_table_and_view() {
        let introspector = SqliteIntrospector::from_connection(seeded());
        let names = introspector.list_relations().unwrap();
        assert_eq!(names, vec!["flats", "owners", "v_flats"]);

        let flats = introspector.describe("flats").unwrap();
        assert_eq!(flats.kind, RelationKind::Table);
        assert_eq!(
            flats.relations,
            vec![RelationInfo {
                column: "owner_id".to_string(),
                references_table: "owners".to_string(),
                references_column: "id".to_string(),
            }]
        );
        let surface = flats.columns.iter().find(|c| c.name == "surface").unwrap();
        assert_eq!(surface.data_type, ColumnType::Real);
        assert!(flats.columns.iter().any(|c| c.name == "id" && c.primary_key));
        assert!(flats.columns.iter().any(|c| c.name == "built_on" && c.data_type == ColumnType::Date));

        let view = introspector.describe("v_flats").unwrap();
        assert_eq!(view.kind, RelationKind::View);
        assert_eq!(view.columns.len(), 2);
    }

    #[test]
    fn test_missing_relation_fails() {
        let introspector = SqliteIntrospector::from_connection(seeded());
        assert!(introspector.describe("nope").is_err());
    }

    #[test]
    fn test_entity_labels_reject_odd_identifiers() {
        let introspector = SqliteIntrospector::from_connection(seeded());
        let mut entity = EntityType {
            name: "owner".to_string(),
            table: "owners".to_string(),
            id_column: "id".to_string(),
            match_columns: vec!["name".to_string()],
            display_columns: vec!["name".to_string()],
            route_segments: vec![],
            query_params: vec![],
        };
        let rows = introspector.entity_labels(&entity).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].match_values, vec!["Martin".to_string()]);

        entity.table = "owners; DROP TABLE owners".to_string();
        assert!(introspector.entity_labels(&entity).is_err());
    }

    #[test]
    fn test_executor_connection_is_query_only() {
        let executor = SqliteExecutor::from_connection(seeded()).unwrap();
        let conn = executor.db.lock().unwrap();
        assert!(conn.execute("DELETE FROM owners", []).is_err());
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM owners", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_run_query_binds_and_caps() {
        let conn = seeded();
        let rows = run_query(
            &conn,
            "SELECT flats.label FROM flats WHERE flats.owner_id = ?1 LIMIT 10",
            &[SqlValue::Integer(2)],
            10,
        )
        .unwrap();
        assert_eq!(rows.columns, vec!["label"]);
        assert_eq!(rows.rows, vec![vec![json!("B")]]);

        let capped = run_query(&conn, "SELECT flats.id FROM flats", &[], 1).unwrap();
        assert_eq!(capped.row_count(), 1);
        assert!(capped.truncated);
    }

    const SLOW_COUNT: &str = "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < 2000000) \
         SELECT COUNT(*) FROM c";

    #[test]
    fn test_run_abandoned_while_queued_never_starts() {
        let conn = seeded();
        let control = RunControl::new(Arc::new(conn.get_interrupt_handle()));
        control.abandon();
        assert!(!control.begin());
    }

    #[test]
    fn test_finished_run_is_not_interrupted() {
        let conn = seeded();
        let control = RunControl::new(Arc::new(conn.get_interrupt_handle()));
        assert!(control.begin());
        control.finish();
        control.abandon();
        assert_eq!(*control.lock(), RunState::Finished);
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM owners", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_dropped_queued_call_leaves_running_query_alone() {
        let executor = Arc::new(SqliteExecutor::from_connection(seeded()).unwrap());

        let long = executor.clone();
        let first = tokio::spawn(async move { long.run(SLOW_COUNT.to_string(), vec![], 10).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = tokio::time::timeout(
            Duration::from_millis(20),
            executor.run("SELECT COUNT(*) FROM owners".to_string(), vec![], 10),
        )
        .await;
        assert!(second.is_err());

        let rows = first.await.unwrap().unwrap();
        assert_eq!(rows.rows, vec![vec![json!(2_000_000)]]);
    }

    #[tokio::test]
    async fn test_dropped_running_call_is_interrupted() {
        let executor = SqliteExecutor::from_connection(seeded()).unwrap();

        let abandoned = tokio::time::timeout(
            Duration::from_millis(50),
            executor.run(SLOW_COUNT.to_string(), vec![], 10),
        )
        .await;
        assert!(abandoned.is_err());

        let rows = executor
            .run("SELECT COUNT(*) FROM owners".to_string(), vec![], 10)
            .await
            .unwrap();
        assert_eq!(rows.rows, vec![vec![json!(2)]]);
    }
}
