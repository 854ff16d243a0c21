//! SQLite backend (relational-file) for rivven-unidb
//!
//! rusqlite is synchronous, so every call runs on the blocking pool via
//! `spawn_blocking`. The connection sits behind a mutex; `None` means closed.

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::ToSql;
use std::sync::Arc;
use tracing::debug;

use crate::backend::{
    settle_close, BackendAdapter, BackendHandle, BackendKind, CannedRequest, StatementKind,
};
use crate::config::ConnectionConfig;
use crate::error::{Error, Result};
use crate::security::validate_sql_identifier;
use crate::types::{MutationOutcome, Query, QueryResult, Row, Value};

const KIND: BackendKind = BackendKind::RelationalFile;

/// Default database path when none is configured
pub const DEFAULT_PATH: &str = ":memory:";

const LIST_TABLES_SQL: &str =
    "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'";

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::from(rusqlite::types::Null),
            Value::Bool(b) => ToSqlOutput::from(*b),
            Value::Int32(n) => ToSqlOutput::from(*n),
            Value::Int64(n) => ToSqlOutput::from(*n),
            Value::Float64(n) => ToSqlOutput::from(*n),
            Value::Decimal(d) => ToSqlOutput::from(d.to_string()),
            Value::String(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Value::Bytes(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
            Value::Date(d) => ToSqlOutput::from(d.to_string()),
            Value::DateTime(dt) => ToSqlOutput::from(dt.to_string()),
            Value::DateTimeTz(dt) => ToSqlOutput::from(dt.to_rfc3339()),
            Value::Uuid(u) => ToSqlOutput::from(u.to_string()),
            Value::Json(j) => ToSqlOutput::from(j.to_string()),
        })
    }
}

fn sqlite_value_to_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(n) => Value::Int64(n),
        ValueRef::Real(f) => Value::Float64(f),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Bytes(b.to_vec()),
    }
}

fn driver_err(e: rusqlite::Error) -> Error {
    Error::driver(KIND, e)
}

fn run_statement(conn: &rusqlite::Connection, sql: &str, params: &[Value]) -> Result<QueryResult> {
    match StatementKind::classify(sql) {
        StatementKind::Read => {
            let mut stmt = conn.prepare(sql).map_err(driver_err)?;
            let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
            let mut rows = stmt
                .query(rusqlite::params_from_iter(params.iter()))
                .map_err(driver_err)?;

            let mut out = Vec::new();
            while let Some(row) = rows.next().map_err(driver_err)? {
                let values = (0..columns.len())
                    .map(|i| row.get_ref(i).map(sqlite_value_to_value))
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(driver_err)?;
                out.push(Row::new(columns.clone(), values));
            }
            Ok(QueryResult::Rows(out))
        }
        StatementKind::Mutate => {
            let affected = conn
                .execute(sql, rusqlite::params_from_iter(params.iter()))
                .map_err(driver_err)?;
            let mut outcome = MutationOutcome::affected(affected as u64);
            if StatementKind::is_insert(sql) {
                let rowid = conn.last_insert_rowid();
                if rowid > 0 {
                    outcome = outcome.with_inserted_id(rowid);
                }
            }
            Ok(QueryResult::Mutation(outcome))
        }
    }
}

/// SQLite connection handle
pub struct SqliteHandle {
    conn: Arc<Mutex<Option<rusqlite::Connection>>>,
    path: String,
}

impl SqliteHandle {
    /// Wrap an open rusqlite connection
    pub fn new(conn: rusqlite::Connection, path: impl Into<String>) -> Self {
        Self {
            conn: Arc::new(Mutex::new(Some(conn))),
            path: path.into(),
        }
    }

    /// Database path this handle was opened with
    pub fn path(&self) -> &str {
        &self.path
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            match guard.as_ref() {
                Some(c) => f(c),
                None => Err(Error::driver_message(KIND, "connection is closed")),
            }
        })
        .await
        .map_err(|e| Error::internal(format!("sqlite worker failed: {}", e)))?
    }
}

#[async_trait]
impl BackendHandle for SqliteHandle {
    async fn execute(&self, query: &Query, params: &[Value]) -> Result<QueryResult> {
        let sql = query
            .as_text()
            .ok_or_else(|| Error::malformed("relational-file expects SQL text"))?
            .to_string();
        let params = params.to_vec();
        self.with_conn(move |conn| run_statement(conn, &sql, &params))
            .await
    }

    async fn is_valid(&self) -> bool {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))
                .map_err(driver_err)
        })
        .await
        .is_ok()
    }

    async fn close(&self) -> Result<()> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || match conn.lock().take() {
            Some(c) => settle_close(KIND, c.close().map_err(|(_, e)| e)),
            None => Ok(()),
        })
        .await
        .map_err(|e| Error::internal(format!("sqlite worker failed: {}", e)))?
    }
}

/// Adapter for the relational-file backend
#[derive(Debug, Default, Clone)]
pub struct SqliteAdapter;

impl SqliteAdapter {
    /// Create a new SQLite adapter
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BackendAdapter for SqliteAdapter {
    fn kind(&self) -> BackendKind {
        KIND
    }

    async fn connect(&self, config: &ConnectionConfig) -> Result<Arc<dyn BackendHandle>> {
        let path = config
            .path
            .clone()
            .or_else(|| config.database.clone())
            .unwrap_or_else(|| DEFAULT_PATH.to_string());

        let open_path = path.clone();
        let conn = tokio::task::spawn_blocking(move || rusqlite::Connection::open(open_path))
            .await
            .map_err(|e| Error::internal(format!("sqlite worker failed: {}", e)))?
            .map_err(|e| Error::connection(KIND, e))?;

        debug!(path = %path, "opened sqlite database");
        Ok(Arc::new(SqliteHandle::new(conn, path)))
    }

    fn list_tables_request(&self) -> CannedRequest {
        CannedRequest::sql(LIST_TABLES_SQL)
    }

    fn table_schema_request(&self, table: &str) -> Result<CannedRequest> {
        validate_sql_identifier(table)?;
        Ok(CannedRequest::sql(format!("PRAGMA table_info({})", table)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_and_mutate_shapes() {
        let handle = SqliteAdapter::new()
            .connect(&ConnectionConfig::new())
            .await
            .unwrap();

        let created = handle
            .execute(
                &Query::text("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)"),
                &[],
            )
            .await
            .unwrap();
        assert!(matches!(created, QueryResult::Mutation(_)));

        let inserted = handle
            .execute(
                &Query::text("INSERT INTO t (name) VALUES (?)"),
                &[Value::from("a")],
            )
            .await
            .unwrap();
        let outcome = inserted.mutation().unwrap();
        assert_eq!(outcome.affected_count, 1);
        assert_eq!(outcome.inserted_id, Some(Value::Int64(1)));

        let rows = handle
            .execute(&Query::text("select id, name from t"), &[])
            .await
            .unwrap();
        let rows = rows.rows().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_by_name("name"), Some(&Value::String("a".into())));
    }

    #[tokio::test]
    async fn test_driver_error_message_unchanged() {
        let handle = SqliteAdapter::new()
            .connect(&ConnectionConfig::new())
            .await
            .unwrap();
        let err = handle
            .execute(&Query::text("SELECT * FROM missing"), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Driver { .. }));
        assert!(err.to_string().contains("no such table: missing"));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let handle = SqliteAdapter::new()
            .connect(&ConnectionConfig::new())
            .await
            .unwrap();
        assert!(handle.is_valid().await);
        handle.close().await.unwrap();
        handle.close().await.unwrap();
        assert!(!handle.is_valid().await);
    }

    #[test]
    fn test_table_schema_template() {
        let adapter = SqliteAdapter::new();
        assert_eq!(
            adapter.table_schema_request("users").unwrap(),
            CannedRequest::sql("PRAGMA table_info(users)")
        );
        assert!(adapter.table_schema_request("users); DROP TABLE x").is_err());
    }
}
