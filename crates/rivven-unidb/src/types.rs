//! Value types for rivven-unidb
//!
//! - [`Value`]: a bound parameter or a column value
//! - [`Row`]: ordered column/value pairs from a tabular backend
//! - [`Query`]: SQL text or a structured document request
//! - [`QueryResult`]: the normalized result every adapter returns

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// SQL/document value type that can hold any parameter or column value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// SQL NULL / JSON null
    Null,
    /// Boolean value
    Bool(bool),
    /// 32-bit signed integer (INTEGER)
    Int32(i32),
    /// 64-bit signed integer (BIGINT)
    Int64(i64),
    /// 64-bit floating point (DOUBLE PRECISION)
    Float64(f64),
    /// Exact decimal (NUMERIC, DECIMAL)
    Decimal(Decimal),
    /// Text string (VARCHAR, TEXT, CHAR)
    String(String),
    /// Binary data (BYTEA, BLOB, VARBINARY)
    Bytes(Vec<u8>),
    /// Date without time (DATE)
    Date(NaiveDate),
    /// Timestamp without timezone (TIMESTAMP)
    DateTime(NaiveDateTime),
    /// Timestamp with timezone (TIMESTAMPTZ)
    DateTimeTz(DateTime<Utc>),
    /// UUID
    Uuid(Uuid),
    /// JSON value
    Json(serde_json::Value),
}

impl Value {
    /// Integer view of numeric values, including whole JSON numbers
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int32(n) => Some(i64::from(*n)),
            Self::Int64(n) => Some(*n),
            Self::Json(j) => j.as_i64(),
            _ => None,
        }
    }

    /// Text view of string values
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            Self::Json(serde_json::Value::String(s)) => Some(s),
            _ => None,
        }
    }

    /// Plain JSON rendering (no type tags), used for row mappings
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;
        match self {
            Self::Null => Json::Null,
            Self::Bool(b) => Json::Bool(*b),
            Self::Int32(n) => Json::from(*n),
            Self::Int64(n) => Json::from(*n),
            Self::Float64(n) => serde_json::Number::from_f64(*n)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            // rendered as text so no precision is lost
            Self::Decimal(d) => Json::String(d.to_string()),
            Self::String(s) => Json::String(s.clone()),
            Self::Bytes(b) => Json::Array(b.iter().map(|byte| Json::from(*byte)).collect()),
            Self::Date(d) => Json::String(d.to_string()),
            Self::DateTime(dt) => Json::String(dt.to_string()),
            Self::DateTimeTz(dt) => Json::String(dt.to_rfc3339()),
            Self::Uuid(u) => Json::String(u.to_string()),
            Self::Json(j) => j.clone(),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float64(v)
    }
}

impl From<Decimal> for Value {
    fn from(v: Decimal) -> Self {
        Self::Decimal(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_owned())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Self::Date(v)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Self::DateTime(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Self::DateTimeTz(v)
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Self::Uuid(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Self::Json(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(val) => val.into(),
            None => Self::Null,
        }
    }
}

/// Database row as ordered column values
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// Column names
    columns: Vec<String>,
    /// Column values (same order as columns)
    values: Vec<Value>,
}

impl Row {
    /// Create a new row
    pub fn new(columns: Vec<String>, values: Vec<Value>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    /// Get column count
    #[inline]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Check if row is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Get column names
    #[inline]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Get all values
    #[inline]
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Get value by column index
    #[inline]
    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    /// Get value by column name
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .and_then(|idx| self.values.get(idx))
    }

    /// Render the row as a JSON object keyed by column name
    pub fn to_json(&self) -> serde_json::Value {
        let map = self
            .columns
            .iter()
            .zip(&self.values)
            .map(|(c, v)| (c.clone(), v.to_json()))
            .collect::<serde_json::Map<_, _>>();
        serde_json::Value::Object(map)
    }
}

/// A request addressed to a backend
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    /// SQL text for the tabular backends
    Text(String),
    /// Structured request for the document store: `{collection, operation, ...}`
    Structured(serde_json::Value),
}

impl Query {
    /// Create a SQL text query
    pub fn text(sql: impl Into<String>) -> Self {
        Self::Text(sql.into())
    }

    /// Create a structured document request
    pub fn structured(request: serde_json::Value) -> Self {
        Self::Structured(request)
    }

    /// SQL text, if this is a text query
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(sql) => Some(sql),
            Self::Structured(_) => None,
        }
    }
}

impl From<&str> for Query {
    fn from(sql: &str) -> Self {
        Self::Text(sql.to_owned())
    }
}

impl From<String> for Query {
    fn from(sql: String) -> Self {
        Self::Text(sql)
    }
}

impl From<serde_json::Value> for Query {
    fn from(request: serde_json::Value) -> Self {
        Self::Structured(request)
    }
}

/// Outcome of a mutating statement or document write
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MutationOutcome {
    /// Rows/documents modified, inserted or deleted
    pub affected_count: u64,
    /// Generated key of a single insert, where the backend reports one
    pub inserted_id: Option<Value>,
    /// Generated keys of a multi-document insert
    pub inserted_ids: Vec<Value>,
    /// Documents matched by an update filter (document store only)
    pub matched_count: Option<u64>,
}

impl MutationOutcome {
    /// Outcome with only an affected count
    pub fn affected(count: u64) -> Self {
        Self {
            affected_count: count,
            ..Default::default()
        }
    }

    /// Set the generated key
    pub fn with_inserted_id(mut self, id: impl Into<Value>) -> Self {
        self.inserted_id = Some(id.into());
        self
    }
}

/// Normalized result returned by every adapter
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResult {
    /// Read shape of a tabular backend
    Rows(Vec<Row>),
    /// Mutate shape of any backend
    Mutation(MutationOutcome),
    /// Document list (find, aggregate, collection listing)
    Documents(Vec<serde_json::Value>),
    /// Single optional document (findOne)
    Document(Option<serde_json::Value>),
}

impl QueryResult {
    /// Rows, if this is a tabular read result
    pub fn rows(&self) -> Option<&[Row]> {
        match self {
            Self::Rows(rows) => Some(rows),
            _ => None,
        }
    }

    /// Documents, if this is a document list result
    pub fn documents(&self) -> Option<&[serde_json::Value]> {
        match self {
            Self::Documents(docs) => Some(docs),
            _ => None,
        }
    }

    /// Mutation outcome, if this is a write result
    pub fn mutation(&self) -> Option<&MutationOutcome> {
        match self {
            Self::Mutation(outcome) => Some(outcome),
            _ => None,
        }
    }

    /// Number of rows or documents carried by the result
    pub fn len(&self) -> usize {
        match self {
            Self::Rows(rows) => rows.len(),
            Self::Documents(docs) => docs.len(),
            Self::Document(doc) => usize::from(doc.is_some()),
            Self::Mutation(_) => 0,
        }
    }

    /// Whether the result carries no rows or documents
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Render the result as JSON: row/document arrays, or a write summary object
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Rows(rows) => serde_json::Value::Array(rows.iter().map(Row::to_json).collect()),
            Self::Documents(docs) => serde_json::Value::Array(docs.clone()),
            Self::Document(doc) => doc.clone().unwrap_or(serde_json::Value::Null),
            Self::Mutation(m) => {
                let mut obj = serde_json::Map::new();
                obj.insert("affectedCount".into(), m.affected_count.into());
                if let Some(id) = &m.inserted_id {
                    obj.insert("insertedId".into(), id.to_json());
                }
                if !m.inserted_ids.is_empty() {
                    obj.insert(
                        "insertedIds".into(),
                        m.inserted_ids.iter().map(Value::to_json).collect(),
                    );
                }
                if let Some(matched) = m.matched_count {
                    obj.insert("matchedCount".into(), matched.into());
                }
                serde_json::Value::Object(obj)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_value_conversions() {
        assert_eq!(Value::Int32(42).as_i64(), Some(42));
        assert_eq!(Value::Json(json!(7)).as_i64(), Some(7));
        assert_eq!(Value::Float64(1.5).as_i64(), None);
        assert_eq!(Value::Json(json!("x")).as_str(), Some("x"));

        let v: Value = None::<i32>.into();
        assert_eq!(v, Value::Null);
    }

    #[test]
    fn test_decimal_keeps_precision_in_json() {
        let exact: Decimal = "1234567890123456.789012345".parse().unwrap();
        assert_eq!(
            Value::from(exact).to_json(),
            json!("1234567890123456.789012345")
        );
    }

    #[test]
    fn test_row_lookup_is_case_insensitive() {
        let row = Row::new(
            vec!["id".into(), "name".into()],
            vec![Value::Int64(1), Value::String("Alice".into())],
        );

        assert_eq!(row.len(), 2);
        assert_eq!(row.get(0), Some(&Value::Int64(1)));
        assert_eq!(row.get_by_name("NAME"), Some(&Value::String("Alice".into())));
        assert_eq!(row.to_json(), json!({"id": 1, "name": "Alice"}));
    }

    #[test]
    fn test_mutation_json_summary() {
        let result = QueryResult::Mutation(MutationOutcome::affected(1).with_inserted_id(7_i64));
        assert_eq!(
            result.to_json(),
            json!({"affectedCount": 1, "insertedId": 7})
        );
        assert!(result.is_empty());
    }
}
