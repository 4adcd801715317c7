// Tabular Backend (SQLite)
//
// Realizes the connection contract as rows in fixed tables.
// Relationships (successors, item linkage, edge endpoints) are rows
// carrying the identifiers they point at.

use std::path::Path;

use parking_lot::{Mutex, MutexGuard};
use rusqlite::types::{ToSql, ToSqlOutput, ValueRef};
use tracing::{debug, warn};

use super::{check_identifier, Backend, Connection, Field, ResultSet, Row, Value};
use crate::error::{CatalogError, Result};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS item (
        id TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        name TEXT
    );

    CREATE TABLE IF NOT EXISTS node_version (
        id TEXT PRIMARY KEY,
        node_id TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS edge_version (
        id TEXT PRIMARY KEY,
        edge_id TEXT NOT NULL,
        endpoint_one TEXT NOT NULL,
        endpoint_two TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS structure_version (
        id TEXT PRIMARY KEY,
        structure_id TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS structure_version_attribute (
        structure_version_id TEXT NOT NULL,
        key TEXT NOT NULL,
        type TEXT NOT NULL,
        PRIMARY KEY (structure_version_id, key)
    );

    CREATE TABLE IF NOT EXISTS rich_version (
        version_id TEXT PRIMARY KEY,
        reference TEXT,
        payload TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS version_successor (
        id TEXT PRIMARY KEY,
        from_version_id TEXT NOT NULL,
        to_version_id TEXT NOT NULL,
        UNIQUE (from_version_id, to_version_id)
    );

    CREATE TABLE IF NOT EXISTS version_history_dag (
        item_id TEXT NOT NULL,
        version_successor_id TEXT NOT NULL,
        PRIMARY KEY (item_id, version_successor_id)
    );

    CREATE INDEX IF NOT EXISTS idx_node_version_node ON node_version(node_id);
    CREATE INDEX IF NOT EXISTS idx_edge_version_edge ON edge_version(edge_id);
    CREATE INDEX IF NOT EXISTS idx_structure_version_structure ON structure_version(structure_id);
";

/// SQLite-backed tabular store.
///
/// All logical connections share one database handle. A connection
/// holds the handle from `begin` until it is committed or aborted, so
/// transactions on this backend are fully serialized. Opening a second
/// connection on the same thread while one is live blocks forever.
pub struct SqliteBackend {
    conn: Mutex<rusqlite::Connection>,
}

impl SqliteBackend {
    /// Open (or create) a database file and ensure the schema exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = rusqlite::Connection::open(path.as_ref())?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.execute_batch(SCHEMA)?;
        debug!(path = %path.as_ref().display(), "opened sqlite backend");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Private in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = rusqlite::Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl Backend for SqliteBackend {
    type Connection<'a> = SqliteConnection<'a> where Self: 'a;

    fn begin(&self) -> Result<SqliteConnection<'_>> {
        let guard = self.conn.lock();
        guard.execute_batch("BEGIN IMMEDIATE")?;
        Ok(SqliteConnection {
            conn: guard,
            finished: false,
        })
    }
}

/// One pending sqlite transaction.
pub struct SqliteConnection<'a> {
    conn: MutexGuard<'a, rusqlite::Connection>,
    finished: bool,
}

impl SqliteConnection<'_> {
    fn finish(&mut self, statement: &str) -> Result<()> {
        self.finished = true;
        self.conn.execute_batch(statement)?;
        Ok(())
    }
}

impl Connection for SqliteConnection<'_> {
    fn select(&mut self, table: &str, predicates: &[Field]) -> Result<ResultSet> {
        check_identifier(table)?;
        let (clause, params) = where_clause(predicates)?;
        let sql = format!("SELECT * FROM {table}{clause}");
        debug!(%sql, "select");

        let mut stmt = self.conn.prepare(&sql)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let mut rows = stmt.query(rusqlite::params_from_iter(params))?;

        let mut selected = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = std::collections::BTreeMap::new();
            for (i, column) in columns.iter().enumerate() {
                values.insert(column.clone(), read_value(column, row.get_ref(i)?)?);
            }
            selected.push(Row::new(values));
        }

        ResultSet::from_rows(table, selected)
    }

    fn insert(&mut self, table: &str, fields: &[Field]) -> Result<()> {
        check_identifier(table)?;
        if fields.is_empty() {
            return Err(CatalogError::InvalidArgument(format!(
                "insert into `{table}` without fields"
            )));
        }
        for field in fields {
            check_identifier(field.name())?;
        }

        let names: Vec<&str> = fields.iter().map(|f| f.name()).collect();
        let slots: Vec<String> = (1..=fields.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "INSERT INTO {table} ({}) VALUES ({})",
            names.join(", "),
            slots.join(", ")
        );
        debug!(%sql, "insert");

        self.conn
            .execute(&sql, rusqlite::params_from_iter(fields.iter().map(|f| f.value())))?;
        Ok(())
    }

    fn delete(&mut self, table: &str, predicates: &[Field]) -> Result<()> {
        check_identifier(table)?;
        if predicates.is_empty() {
            return Err(CatalogError::InvalidArgument(format!(
                "delete from `{table}` without predicates"
            )));
        }
        let (clause, params) = where_clause(predicates)?;
        let sql = format!("DELETE FROM {table}{clause}");
        debug!(%sql, "delete");

        self.conn.execute(&sql, rusqlite::params_from_iter(params))?;
        Ok(())
    }

    fn commit(mut self) -> Result<()> {
        if let Err(err) = self.finish("COMMIT") {
            // A failed COMMIT can leave the transaction open.
            if let Err(rollback_err) = self.conn.execute_batch("ROLLBACK") {
                warn!(error = %rollback_err, "rollback after failed commit also failed");
            }
            return Err(CatalogError::TransactionAborted(err.to_string()));
        }
        Ok(())
    }

    fn abort(mut self) -> Result<()> {
        self.finish("ROLLBACK")
    }
}

impl Drop for SqliteConnection<'_> {
    fn drop(&mut self) {
        if !self.finished {
            warn!("sqlite connection dropped without commit or abort, rolling back");
            if let Err(err) = self.conn.execute_batch("ROLLBACK") {
                warn!(error = %err, "rollback on drop failed");
            }
        }
    }
}

/// Build ` WHERE a = ?1 AND b IS NULL ...` and its bound values.
fn where_clause(predicates: &[Field]) -> Result<(String, Vec<&Value>)> {
    let mut terms = Vec::with_capacity(predicates.len());
    let mut params = Vec::with_capacity(predicates.len());

    for predicate in predicates {
        check_identifier(predicate.name())?;
        match predicate.value() {
            Value::Null => terms.push(format!("{} IS NULL", predicate.name())),
            value => {
                params.push(value);
                terms.push(format!("{} = ?{}", predicate.name(), params.len()));
            }
        }
    }

    if terms.is_empty() {
        Ok((String::new(), params))
    } else {
        Ok((format!(" WHERE {}", terms.join(" AND ")), params))
    }
}

fn read_value(column: &str, raw: ValueRef<'_>) -> Result<Value> {
    match raw {
        ValueRef::Null => Ok(Value::Null),
        ValueRef::Integer(n) => Ok(Value::Long(n)),
        ValueRef::Text(bytes) => String::from_utf8(bytes.to_vec())
            .map(Value::String)
            .map_err(|e| CatalogError::BackendFailure(format!("column `{column}`: {e}"))),
        ValueRef::Real(_) | ValueRef::Blob(_) => Err(CatalogError::BackendFailure(format!(
            "column `{column}` has an unsupported storage class"
        ))),
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::String(s) => ToSqlOutput::from(s.as_str()),
            Value::Long(n) => ToSqlOutput::from(*n),
            Value::Integer(n) => ToSqlOutput::from(*n),
            Value::Boolean(b) => ToSqlOutput::from(*b),
            Value::Null => ToSqlOutput::from(rusqlite::types::Null),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{tables, transaction};

    fn successor_row(id: &str, from: &str, to: &str) -> Vec<Field> {
        vec![
            Field::string("id", id),
            Field::string("from_version_id", from),
            Field::string("to_version_id", to),
        ]
    }

    #[test]
    fn committed_rows_are_visible_to_later_connections() {
        let backend = SqliteBackend::in_memory().unwrap();

        let mut conn = backend.begin().unwrap();
        conn.insert(tables::VERSION_SUCCESSOR, &successor_row("s1", "a", "b"))
            .unwrap();
        conn.commit().unwrap();

        let mut conn = backend.begin().unwrap();
        let rows = conn
            .select(tables::VERSION_SUCCESSOR, &[Field::string("id", "s1")])
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows.first().get_string("to_version_id").unwrap(), "b");
        conn.abort().unwrap();
    }

    #[test]
    fn abort_discards_pending_rows() {
        let backend = SqliteBackend::in_memory().unwrap();

        let mut conn = backend.begin().unwrap();
        conn.insert(tables::VERSION_SUCCESSOR, &successor_row("s1", "a", "b"))
            .unwrap();
        conn.abort().unwrap();

        let mut conn = backend.begin().unwrap();
        let err = conn
            .select(tables::VERSION_SUCCESSOR, &[Field::string("id", "s1")])
            .unwrap_err();
        assert!(err.is_empty_result());
    }

    #[test]
    fn dropped_connection_rolls_back() {
        let backend = SqliteBackend::in_memory().unwrap();

        {
            let mut conn = backend.begin().unwrap();
            conn.insert(tables::VERSION_SUCCESSOR, &successor_row("s1", "a", "b"))
                .unwrap();
        }

        let result = transaction(&backend, |conn| {
            conn.select(tables::VERSION_SUCCESSOR, &[Field::string("id", "s1")])
        });
        assert!(result.unwrap_err().is_empty_result());
    }

    #[test]
    fn panic_inside_unit_of_work_leaves_no_rows() {
        let backend = SqliteBackend::in_memory().unwrap();

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = transaction(&backend, |conn| -> Result<()> {
                conn.insert(tables::VERSION_SUCCESSOR, &successor_row("s1", "a", "b"))?;
                panic!("fault after first write")
            });
        }));
        assert!(outcome.is_err());

        let mut conn = backend.begin().unwrap();
        assert!(conn
            .select(tables::VERSION_SUCCESSOR, &[])
            .unwrap_err()
            .is_empty_result());
    }

    #[test]
    fn failed_commit_is_aborted_and_rolled_back() {
        let backend = SqliteBackend::in_memory().unwrap();
        backend
            .conn
            .lock()
            .execute_batch(
                "PRAGMA foreign_keys = ON;
                 CREATE TABLE parent (id TEXT PRIMARY KEY);
                 CREATE TABLE child (
                     parent_id TEXT REFERENCES parent(id) DEFERRABLE INITIALLY DEFERRED
                 );",
            )
            .unwrap();

        let mut conn = backend.begin().unwrap();
        conn.insert("child", &[Field::string("parent_id", "ghost")])
            .unwrap();
        let err = conn.commit().unwrap_err();
        assert!(matches!(err, CatalogError::TransactionAborted(_)));

        // The next connection can begin, so nothing was left open.
        let mut conn = backend.begin().unwrap();
        assert!(conn.select("child", &[]).unwrap_err().is_empty_result());
        conn.abort().unwrap();
    }

    #[test]
    fn delete_removes_only_matching_rows() {
        let backend = SqliteBackend::in_memory().unwrap();
        let mut conn = backend.begin().unwrap();

        for id in ["v1", "v2"] {
            conn.insert(
                tables::NODE_VERSION,
                &[Field::string("id", id), Field::string("node_id", "n")],
            )
            .unwrap();
        }
        conn.delete(tables::NODE_VERSION, &[Field::string("id", "v1")])
            .unwrap();

        let rows = conn
            .select(tables::NODE_VERSION, &[Field::string("node_id", "n")])
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows.first().get_string("id").unwrap(), "v2");
        conn.commit().unwrap();
    }

    #[test]
    fn null_predicates_select_missing_references() {
        let backend = SqliteBackend::in_memory().unwrap();
        let mut conn = backend.begin().unwrap();

        conn.insert(
            tables::RICH_VERSION,
            &[
                Field::string("version_id", "v1"),
                Field::opt_string("reference", None),
                Field::string("payload", "{}"),
            ],
        )
        .unwrap();

        let rows = conn
            .select(tables::RICH_VERSION, &[Field::opt_string("reference", None)])
            .unwrap();
        assert_eq!(rows.first().get_opt_string("reference").unwrap(), None);
        conn.abort().unwrap();
    }

    #[test]
    fn malformed_table_name_is_invalid_argument() {
        let backend = SqliteBackend::in_memory().unwrap();
        let mut conn = backend.begin().unwrap();

        let err = conn.select("item; --", &[]).unwrap_err();
        assert!(err.is_invalid_argument());
        assert!(conn.delete(tables::ITEM, &[]).unwrap_err().is_invalid_argument());
        conn.abort().unwrap();
    }

    #[test]
    fn file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lineage.db");

        {
            let backend = SqliteBackend::open(&path).unwrap();
            transaction(&backend, |conn| {
                conn.insert(
                    tables::ITEM,
                    &[
                        Field::string("id", "n1"),
                        Field::string("kind", "node"),
                        Field::opt_string("name", Some("orders")),
                    ],
                )
            })
            .unwrap();
        }

        let backend = SqliteBackend::open(&path).unwrap();
        let rows = transaction(&backend, |conn| {
            conn.select(tables::ITEM, &[Field::string("id", "n1")])
        })
        .unwrap();
        assert_eq!(rows.first().get_string("name").unwrap(), "orders");
    }
}
