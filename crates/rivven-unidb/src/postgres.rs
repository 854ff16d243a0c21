//! PostgreSQL backend (relational-network-b) for rivven-unidb

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_postgres::types::{FromSql, ToSql, Type};
use tokio_postgres::Column;
use tracing::{debug, warn};

use crate::backend::{BackendAdapter, BackendHandle, BackendKind, CannedRequest, StatementKind};
use crate::config::ConnectionConfig;
use crate::error::{Error, Result};
use crate::types::{MutationOutcome, Query, QueryResult, Row, Value};

const KIND: BackendKind = BackendKind::RelationalNetworkB;

/// Default server host
pub const DEFAULT_HOST: &str = "localhost";
/// Default server port
pub const DEFAULT_PORT: u16 = 5432;
/// Default user
pub const DEFAULT_USER: &str = "postgres";
/// Default database
pub const DEFAULT_DATABASE: &str = "postgres";

const LIST_TABLES_SQL: &str = "SELECT tablename FROM pg_tables WHERE schemaname = 'public'";
const TABLE_SCHEMA_SQL: &str = "SELECT column_name, data_type, is_nullable FROM information_schema.columns WHERE table_name = $1";

type BoxedParam = Box<dyn ToSql + Sync + Send>;

/// Convert a Value to a tokio-postgres compatible parameter
fn value_to_sql(value: &Value) -> BoxedParam {
    match value {
        Value::Null => Box::new(Option::<String>::None),
        Value::Bool(b) => Box::new(*b),
        Value::Int32(n) => Box::new(*n),
        Value::Int64(n) => Box::new(*n),
        Value::Float64(n) => Box::new(*n),
        Value::Decimal(d) => Box::new(*d),
        Value::String(s) => Box::new(s.clone()),
        Value::Bytes(b) => Box::new(b.clone()),
        Value::Date(d) => Box::new(*d),
        Value::DateTime(dt) => Box::new(*dt),
        Value::DateTimeTz(dt) => Box::new(*dt),
        Value::Uuid(u) => Box::new(*u),
        Value::Json(j) => Box::new(j.clone()),
    }
}

/// How a column of a given declared type is decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnDecoder {
    Bool,
    Int2,
    Int4,
    Int8,
    Float4,
    Float8,
    Numeric,
    Bytes,
    Date,
    Timestamp,
    TimestampTz,
    Uuid,
    Json,
    Text,
}

/// Decoder for a declared column type; `None` when no lossless mapping exists
fn column_decoder(pg_type: &Type) -> Option<ColumnDecoder> {
    let decoder = match *pg_type {
        Type::BOOL => ColumnDecoder::Bool,
        Type::INT2 => ColumnDecoder::Int2,
        Type::INT4 => ColumnDecoder::Int4,
        Type::INT8 => ColumnDecoder::Int8,
        Type::FLOAT4 => ColumnDecoder::Float4,
        Type::FLOAT8 => ColumnDecoder::Float8,
        Type::NUMERIC => ColumnDecoder::Numeric,
        Type::BYTEA => ColumnDecoder::Bytes,
        Type::DATE => ColumnDecoder::Date,
        Type::TIMESTAMP => ColumnDecoder::Timestamp,
        Type::TIMESTAMPTZ => ColumnDecoder::TimestampTz,
        Type::UUID => ColumnDecoder::Uuid,
        Type::JSON | Type::JSONB => ColumnDecoder::Json,
        // text, varchar, bpchar, name, citext, unknown
        ref other if <String as FromSql<'_>>::accepts(other) => ColumnDecoder::Text,
        _ => return None,
    };
    Some(decoder)
}

fn get_opt<'a, T>(
    row: &'a tokio_postgres::Row,
    idx: usize,
    wrap: fn(T) -> Value,
) -> Result<Value>
where
    T: FromSql<'a>,
{
    row.try_get::<_, Option<T>>(idx)
        .map(|v| v.map(wrap).unwrap_or(Value::Null))
        .map_err(|e| Error::driver(KIND, e))
}

/// Convert a PostgreSQL column to a Value by its declared type
fn pg_value_to_value(row: &tokio_postgres::Row, idx: usize, column: &Column) -> Result<Value> {
    let decoder = column_decoder(column.type_()).ok_or_else(|| {
        Error::driver_message(
            KIND,
            format!(
                "column \"{}\" has unsupported type {}",
                column.name(),
                column.type_()
            ),
        )
    })?;

    match decoder {
        ColumnDecoder::Bool => get_opt(row, idx, Value::Bool),
        ColumnDecoder::Int2 => get_opt::<i16>(row, idx, |n| Value::Int32(i32::from(n))),
        ColumnDecoder::Int4 => get_opt(row, idx, Value::Int32),
        ColumnDecoder::Int8 => get_opt(row, idx, Value::Int64),
        ColumnDecoder::Float4 => get_opt::<f32>(row, idx, |n| Value::Float64(f64::from(n))),
        ColumnDecoder::Float8 => get_opt(row, idx, Value::Float64),
        ColumnDecoder::Numeric => get_opt(row, idx, Value::Decimal),
        ColumnDecoder::Bytes => get_opt(row, idx, Value::Bytes),
        ColumnDecoder::Date => get_opt(row, idx, Value::Date),
        ColumnDecoder::Timestamp => get_opt(row, idx, Value::DateTime),
        ColumnDecoder::TimestampTz => get_opt(row, idx, Value::DateTimeTz),
        ColumnDecoder::Uuid => get_opt(row, idx, Value::Uuid),
        ColumnDecoder::Json => get_opt(row, idx, Value::Json),
        ColumnDecoder::Text => get_opt(row, idx, Value::String),
    }
}

fn pg_row_to_row(pg_row: &tokio_postgres::Row) -> Result<Row> {
    let columns = pg_row
        .columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect();
    let values = pg_row
        .columns()
        .iter()
        .enumerate()
        .map(|(i, col)| pg_value_to_value(pg_row, i, col))
        .collect::<Result<Vec<_>>>()?;
    Ok(Row::new(columns, values))
}

/// Build driver configuration; an explicit url wins over individual fields
fn build_config(config: &ConnectionConfig) -> Result<tokio_postgres::Config> {
    if let Some(url) = &config.url {
        return url
            .parse::<tokio_postgres::Config>()
            .map_err(|e| Error::connection(KIND, e));
    }

    let mut pg = tokio_postgres::Config::new();
    pg.host(config.host.as_deref().unwrap_or(DEFAULT_HOST))
        .port(config.port.unwrap_or(DEFAULT_PORT))
        .user(config.user.as_deref().unwrap_or(DEFAULT_USER))
        .dbname(config.database.as_deref().unwrap_or(DEFAULT_DATABASE));
    if let Some(password) = config.password_secret() {
        pg.password(password);
    }
    Ok(pg)
}

/// PostgreSQL connection handle
pub struct PgHandle {
    client: Mutex<Option<Arc<tokio_postgres::Client>>>,
    driver_task: Mutex<Option<JoinHandle<()>>>,
}

impl PgHandle {
    fn new(client: tokio_postgres::Client, driver_task: JoinHandle<()>) -> Self {
        Self {
            client: Mutex::new(Some(Arc::new(client))),
            driver_task: Mutex::new(Some(driver_task)),
        }
    }

    fn client(&self) -> Result<Arc<tokio_postgres::Client>> {
        self.client
            .lock()
            .clone()
            .ok_or_else(|| Error::driver_message(KIND, "connection is closed"))
    }
}

#[async_trait]
impl BackendHandle for PgHandle {
    async fn execute(&self, query: &Query, params: &[Value]) -> Result<QueryResult> {
        let sql = query
            .as_text()
            .ok_or_else(|| Error::malformed("relational-network-b expects SQL text"))?;
        let client = self.client()?;

        let boxed: Vec<BoxedParam> = params.iter().map(value_to_sql).collect();
        let param_refs: Vec<&(dyn ToSql + Sync)> = boxed
            .iter()
            .map(|b| b.as_ref() as &(dyn ToSql + Sync))
            .collect();

        match StatementKind::classify(sql) {
            StatementKind::Read => {
                let rows = client
                    .query(sql, &param_refs)
                    .await
                    .map_err(|e| Error::driver(KIND, e))?;
                let rows = rows.iter().map(pg_row_to_row).collect::<Result<Vec<_>>>()?;
                Ok(QueryResult::Rows(rows))
            }
            StatementKind::Mutate => {
                let affected = client
                    .execute(sql, &param_refs)
                    .await
                    .map_err(|e| Error::driver(KIND, e))?;
                Ok(QueryResult::Mutation(MutationOutcome::affected(affected)))
            }
        }
    }

    async fn is_valid(&self) -> bool {
        match self.client() {
            Ok(client) => client.simple_query("SELECT 1").await.is_ok(),
            Err(_) => false,
        }
    }

    async fn close(&self) -> Result<()> {
        // dropping the last client reference ends the session
        let client = self.client.lock().take();
        drop(client);
        if let Some(task) = self.driver_task.lock().take() {
            task.abort();
        }
        Ok(())
    }
}

/// Adapter for the relational-network-b backend
#[derive(Debug, Default, Clone)]
pub struct PgAdapter;

impl PgAdapter {
    /// Create a new PostgreSQL adapter
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BackendAdapter for PgAdapter {
    fn kind(&self) -> BackendKind {
        KIND
    }

    async fn connect(&self, config: &ConnectionConfig) -> Result<Arc<dyn BackendHandle>> {
        let pg = build_config(config)?;
        let (client, connection) = pg
            .connect(tokio_postgres::NoTls)
            .await
            .map_err(|e| Error::connection(KIND, e))?;

        let driver_task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(backend = %KIND, error = %e, "postgres connection task ended with error");
            }
        });

        debug!(dbname = ?pg.get_dbname(), "connected to postgres");
        Ok(Arc::new(PgHandle::new(client, driver_task)))
    }

    fn list_tables_request(&self) -> CannedRequest {
        CannedRequest::sql(LIST_TABLES_SQL)
    }

    fn table_schema_request(&self, table: &str) -> Result<CannedRequest> {
        Ok(CannedRequest::Query {
            query: Query::text(TABLE_SCHEMA_SQL),
            params: vec![Value::from(table)],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_postgres::config::Host;

    #[test]
    fn test_default_config() {
        let pg = build_config(&ConnectionConfig::new()).unwrap();
        assert_eq!(pg.get_hosts(), &[Host::Tcp(DEFAULT_HOST.to_string())]);
        assert_eq!(pg.get_ports(), &[DEFAULT_PORT]);
        assert_eq!(pg.get_user(), Some(DEFAULT_USER));
        assert_eq!(pg.get_dbname(), Some(DEFAULT_DATABASE));
    }

    #[test]
    fn test_url_overrides_fields() {
        let config = ConnectionConfig::from_url("postgres://app:pw@db.internal:6543/shop")
            .with_user("ignored");
        let pg = build_config(&config).unwrap();
        assert_eq!(pg.get_user(), Some("app"));
        assert_eq!(pg.get_ports(), &[6543]);
        assert_eq!(pg.get_dbname(), Some("shop"));
    }

    #[test]
    fn test_column_decoders() {
        assert_eq!(column_decoder(&Type::NUMERIC), Some(ColumnDecoder::Numeric));
        assert_eq!(column_decoder(&Type::INT2), Some(ColumnDecoder::Int2));
        assert_eq!(column_decoder(&Type::VARCHAR), Some(ColumnDecoder::Text));
        assert_eq!(column_decoder(&Type::BPCHAR), Some(ColumnDecoder::Text));
        assert_eq!(column_decoder(&Type::JSONB), Some(ColumnDecoder::Json));
        assert_eq!(column_decoder(&Type::INTERVAL), None);
        assert_eq!(column_decoder(&Type::INET), None);
        assert_eq!(column_decoder(&Type::INT4_ARRAY), None);
    }

    #[test]
    fn test_decimal_param_binds_as_numeric() {
        let exact: rust_decimal::Decimal = "1234.5678".parse().unwrap();
        let param = value_to_sql(&Value::Decimal(exact));
        assert_eq!(format!("{:?}", param), format!("{:?}", exact));
        assert!(<rust_decimal::Decimal as ToSql>::accepts(&Type::NUMERIC));
    }

    #[test]
    fn test_introspection_templates() {
        let adapter = PgAdapter::new();
        assert_eq!(adapter.list_tables_request(), CannedRequest::sql(LIST_TABLES_SQL));
        match adapter.table_schema_request("orders").unwrap() {
            CannedRequest::Query { query, params } => {
                assert_eq!(query.as_text(), Some(TABLE_SCHEMA_SQL));
                assert_eq!(params, vec![Value::String("orders".into())]);
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }
}
