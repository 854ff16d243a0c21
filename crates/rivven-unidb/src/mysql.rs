//! MySQL backend (relational-network-a) for rivven-unidb
//!
//! `mysql_async::Conn` needs `&mut self` for every call, so the handle keeps
//! it in an `Option` behind a mutex and takes it out for the duration of a
//! statement.

use async_trait::async_trait;
use chrono::{Datelike, Timelike};
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, OptsBuilder};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::backend::{
    settle_close, BackendAdapter, BackendHandle, BackendKind, CannedRequest, StatementKind,
};
use crate::config::ConnectionConfig;
use crate::error::{Error, Result};
use crate::security::validate_sql_identifier;
use crate::types::{MutationOutcome, Query, QueryResult, Row, Value};

const KIND: BackendKind = BackendKind::RelationalNetworkA;

/// Default server host
pub const DEFAULT_HOST: &str = "localhost";
/// Default server port
pub const DEFAULT_PORT: u16 = 3306;
/// Default user
pub const DEFAULT_USER: &str = "root";

/// Convert a Value to a MySQL compatible parameter
fn value_to_sql(value: &Value) -> mysql_async::Value {
    match value {
        Value::Null => mysql_async::Value::NULL,
        Value::Bool(b) => mysql_async::Value::from(*b),
        Value::Int32(n) => mysql_async::Value::from(*n),
        Value::Int64(n) => mysql_async::Value::from(*n),
        Value::Float64(n) => mysql_async::Value::from(*n),
        Value::Decimal(d) => mysql_async::Value::from(d.to_string()),
        Value::String(s) => mysql_async::Value::from(s.clone()),
        Value::Bytes(b) => mysql_async::Value::from(b.clone()),
        Value::Date(d) => {
            mysql_async::Value::Date(d.year() as u16, d.month() as u8, d.day() as u8, 0, 0, 0, 0)
        }
        Value::DateTime(dt) => naive_to_mysql(dt),
        Value::DateTimeTz(dt) => naive_to_mysql(&dt.naive_utc()),
        Value::Uuid(u) => mysql_async::Value::from(u.to_string()),
        Value::Json(j) => mysql_async::Value::from(j.to_string()),
    }
}

fn naive_to_mysql(dt: &chrono::NaiveDateTime) -> mysql_async::Value {
    let (date, time) = (dt.date(), dt.time());
    mysql_async::Value::Date(
        date.year() as u16,
        date.month() as u8,
        date.day() as u8,
        time.hour() as u8,
        time.minute() as u8,
        time.second() as u8,
        time.nanosecond() / 1000,
    )
}

/// Convert a MySQL value to a Value
fn mysql_value_to_value(val: mysql_async::Value) -> Value {
    match val {
        mysql_async::Value::NULL => Value::Null,
        mysql_async::Value::Bytes(b) => match String::from_utf8(b) {
            Ok(s) => Value::String(s),
            Err(e) => Value::Bytes(e.into_bytes()),
        },
        mysql_async::Value::Int(n) => Value::Int64(n),
        mysql_async::Value::UInt(n) => i64::try_from(n)
            .map(Value::Int64)
            .unwrap_or_else(|_| Value::String(n.to_string())),
        mysql_async::Value::Float(f) => Value::Float64(f64::from(f)),
        mysql_async::Value::Double(d) => Value::Float64(d),
        mysql_async::Value::Date(year, month, day, hour, min, sec, micro) => {
            let Some(date) = chrono::NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32)
            else {
                return Value::Null;
            };
            if hour == 0 && min == 0 && sec == 0 && micro == 0 {
                Value::Date(date)
            } else {
                chrono::NaiveTime::from_hms_micro_opt(hour as u32, min as u32, sec as u32, micro)
                    .map(|time| Value::DateTime(chrono::NaiveDateTime::new(date, time)))
                    .unwrap_or(Value::Null)
            }
        }
        mysql_async::Value::Time(neg, days, hour, min, sec, micro) => {
            let hours = days * 24 + hour as u32;
            let sign = if neg { "-" } else { "" };
            Value::String(format!("{sign}{hours:02}:{min:02}:{sec:02}.{micro:06}"))
        }
    }
}

fn mysql_row_to_row(row: mysql_async::Row) -> Row {
    let columns: Vec<String> = row
        .columns_ref()
        .iter()
        .map(|c| c.name_str().to_string())
        .collect();
    let values = row.unwrap().into_iter().map(mysql_value_to_value).collect();
    Row::new(columns, values)
}

/// Build driver options from the connection config
fn build_opts(config: &ConnectionConfig) -> Result<Opts> {
    if let Some(url) = &config.url {
        return Opts::from_url(url).map_err(|e| Error::connection(KIND, e));
    }

    let builder = OptsBuilder::default()
        .ip_or_hostname(config.host.clone().unwrap_or_else(|| DEFAULT_HOST.into()))
        .tcp_port(config.port.unwrap_or(DEFAULT_PORT))
        .user(Some(
            config.user.clone().unwrap_or_else(|| DEFAULT_USER.into()),
        ))
        .pass(config.password_secret().map(str::to_string))
        .db_name(config.database.clone());
    Ok(builder.into())
}

/// MySQL connection handle
pub struct MySqlHandle {
    conn: Arc<Mutex<Option<Conn>>>,
}

impl MySqlHandle {
    /// Wrap an open connection
    pub fn new(conn: Conn) -> Self {
        Self {
            conn: Arc::new(Mutex::new(Some(conn))),
        }
    }

    async fn take_conn(&self) -> Result<Conn> {
        self.conn
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::driver_message(KIND, "connection is closed"))
    }

    async fn put_conn(&self, conn: Conn) {
        *self.conn.lock().await = Some(conn);
    }
}

#[async_trait]
impl BackendHandle for MySqlHandle {
    async fn execute(&self, query: &Query, params: &[Value]) -> Result<QueryResult> {
        let sql = query
            .as_text()
            .ok_or_else(|| Error::malformed("relational-network-a expects SQL text"))?;
        let mysql_params: Vec<mysql_async::Value> = params.iter().map(value_to_sql).collect();

        let mut conn = self.take_conn().await?;
        let result = match StatementKind::classify(sql) {
            StatementKind::Read => conn
                .exec::<mysql_async::Row, _, _>(sql, mysql_params)
                .await
                .map(|rows| QueryResult::Rows(rows.into_iter().map(mysql_row_to_row).collect())),
            StatementKind::Mutate => conn.exec_drop(sql, mysql_params).await.map(|()| {
                let mut outcome = MutationOutcome::affected(conn.affected_rows());
                if let Some(id) = conn.last_insert_id().filter(|id| *id > 0) {
                    outcome = outcome.with_inserted_id(
                        i64::try_from(id)
                            .map(Value::Int64)
                            .unwrap_or_else(|_| Value::String(id.to_string())),
                    );
                }
                QueryResult::Mutation(outcome)
            }),
        };
        self.put_conn(conn).await;

        result.map_err(|e| Error::driver(KIND, e))
    }

    async fn is_valid(&self) -> bool {
        match self.conn.lock().await.as_mut() {
            Some(conn) => conn.ping().await.is_ok(),
            None => false,
        }
    }

    async fn close(&self) -> Result<()> {
        let conn = self.conn.lock().await.take();
        match conn {
            Some(conn) => settle_close(KIND, conn.disconnect().await),
            None => Ok(()),
        }
    }
}

/// Adapter for the relational-network-a backend
#[derive(Debug, Default, Clone)]
pub struct MySqlAdapter;

impl MySqlAdapter {
    /// Create a new MySQL adapter
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BackendAdapter for MySqlAdapter {
    fn kind(&self) -> BackendKind {
        KIND
    }

    async fn connect(&self, config: &ConnectionConfig) -> Result<Arc<dyn BackendHandle>> {
        let opts = build_opts(config)?;
        let host = opts.ip_or_hostname().to_string();
        let conn = Conn::new(opts)
            .await
            .map_err(|e| Error::connection(KIND, e))?;

        debug!(host = %host, "connected to mysql");
        Ok(Arc::new(MySqlHandle::new(conn)))
    }

    fn list_tables_request(&self) -> CannedRequest {
        CannedRequest::sql("SHOW TABLES")
    }

    fn table_schema_request(&self, table: &str) -> Result<CannedRequest> {
        validate_sql_identifier(table)?;
        Ok(CannedRequest::sql(format!("DESCRIBE {}", table)))
    }
}
