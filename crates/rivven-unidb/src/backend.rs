//! Backend abstractions for rivven-unidb
//!
//! - [`BackendKind`]: the closed set of supported database families
//! - [`BackendAdapter`]: one per kind; performs the handshake and owns the
//!   introspection templates
//! - [`BackendHandle`]: a live connection produced by an adapter
//! - [`AdapterSet`]: kind → adapter mapping injected into the dispatcher

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::warn;

use crate::config::ConnectionConfig;
use crate::error::{Error, Result};
use crate::types::{Query, QueryResult, Value};

/// Supported database families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BackendKind {
    /// Embedded file database (SQLite)
    RelationalFile,
    /// Network relational database, variant A (MySQL/MariaDB)
    RelationalNetworkA,
    /// Network relational database, variant B (PostgreSQL)
    RelationalNetworkB,
    /// Document store (MongoDB)
    DocumentStore,
}

impl BackendKind {
    /// All kinds, in declaration order
    pub const ALL: [BackendKind; 4] = [
        Self::RelationalFile,
        Self::RelationalNetworkA,
        Self::RelationalNetworkB,
        Self::DocumentStore,
    ];

    /// Canonical name
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RelationalFile => "relational-file",
            Self::RelationalNetworkA => "relational-network-a",
            Self::RelationalNetworkB => "relational-network-b",
            Self::DocumentStore => "document-store",
        }
    }

    /// Whether the backend speaks SQL text
    pub const fn is_tabular(self) -> bool {
        !matches!(self, Self::DocumentStore)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "relational-file" | "sqlite" | "sqlite3" => Ok(Self::RelationalFile),
            "relational-network-a" | "mysql" | "mariadb" => Ok(Self::RelationalNetworkA),
            "relational-network-b" | "postgres" | "postgresql" | "pg" => {
                Ok(Self::RelationalNetworkB)
            }
            "document-store" | "mongodb" | "mongo" => Ok(Self::DocumentStore),
            _ => Err(Error::unsupported_backend(s)),
        }
    }
}

impl serde::Serialize for BackendKind {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> serde::Deserialize<'de> for BackendKind {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Introspection request prepared by an adapter
#[derive(Debug, Clone, PartialEq)]
pub enum CannedRequest {
    /// Run through the normal query path
    Query {
        /// Query to run
        query: Query,
        /// Bound parameters
        params: Vec<Value>,
    },
    /// Driver metadata call listing collections
    ListCollections,
}

impl CannedRequest {
    /// Canned SQL text without parameters
    pub fn sql(sql: impl Into<String>) -> Self {
        Self::Query {
            query: Query::Text(sql.into()),
            params: Vec::new(),
        }
    }
}

/// Adapter for one backend kind
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// The kind this adapter serves
    fn kind(&self) -> BackendKind;

    /// Perform the backend handshake
    async fn connect(&self, config: &ConnectionConfig) -> Result<Arc<dyn BackendHandle>>;

    /// Request that lists tables/collections
    fn list_tables_request(&self) -> CannedRequest;

    /// Request that describes one table/collection
    fn table_schema_request(&self, table: &str) -> Result<CannedRequest>;
}

/// A live connection owned by exactly one connection record
#[async_trait]
pub trait BackendHandle: Send + Sync {
    /// Execute a query and normalize the driver response
    async fn execute(&self, query: &Query, params: &[Value]) -> Result<QueryResult>;

    /// Check if the connection is alive
    async fn is_valid(&self) -> bool;

    /// Close the connection; `Ok` on an already-closed handle
    async fn close(&self) -> Result<()>;

    /// Driver metadata call listing collections
    async fn list_collections(&self) -> Result<QueryResult> {
        Err(Error::unsupported("collection listing is only available on document stores"))
    }
}

/// Settle the outcome of a driver disconnect.
///
/// The session is unusable after a disconnect attempt whether or not the
/// driver reported an error (a peer that already dropped the socket is the
/// common case), so a failure is logged and the handle counts as closed.
pub(crate) fn settle_close<E: fmt::Display>(
    kind: BackendKind,
    outcome: std::result::Result<(), E>,
) -> Result<()> {
    if let Err(e) = outcome {
        warn!(backend = %kind, error = %e, "disconnect failed, treating connection as closed");
    }
    Ok(())
}

/// Adapters available to a dispatcher, keyed by kind
#[derive(Clone, Default)]
pub struct AdapterSet {
    adapters: HashMap<BackendKind, Arc<dyn BackendAdapter>>,
}

impl AdapterSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Every adapter compiled into this build.
    ///
    /// The document-store slot uses MongoDB when the `mongodb` feature is
    /// enabled and the in-memory store otherwise.
    pub fn with_defaults() -> Self {
        #[allow(unused_mut)]
        let mut set = Self::new();

        #[cfg(feature = "sqlite")]
        {
            set = set.with(crate::sqlite::SqliteAdapter::new());
        }
        #[cfg(feature = "mysql")]
        {
            set = set.with(crate::mysql::MySqlAdapter::new());
        }
        #[cfg(feature = "postgres")]
        {
            set = set.with(crate::postgres::PgAdapter::new());
        }
        #[cfg(feature = "mongodb")]
        {
            set = set.with(crate::document::mongo::MongoAdapter::new());
        }
        #[cfg(not(feature = "mongodb"))]
        {
            set = set.with(crate::document::memory::MemoryDocumentAdapter::new());
        }

        set
    }

    /// Register an adapter, replacing any adapter for the same kind
    pub fn with(mut self, adapter: impl BackendAdapter + 'static) -> Self {
        self.insert(Arc::new(adapter));
        self
    }

    /// Register a shared adapter
    pub fn insert(&mut self, adapter: Arc<dyn BackendAdapter>) {
        self.adapters.insert(adapter.kind(), adapter);
    }

    /// Adapter for a kind
    pub fn get(&self, kind: BackendKind) -> Option<&Arc<dyn BackendAdapter>> {
        self.adapters.get(&kind)
    }

    /// Registered kinds, sorted
    pub fn kinds(&self) -> Vec<BackendKind> {
        let mut kinds: Vec<_> = self.adapters.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

impl fmt::Debug for AdapterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterSet")
            .field("kinds", &self.kinds())
            .finish()
    }
}

/// Lexical shape of a SQL statement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    /// Returns rows
    Read,
    /// Modifies data or schema
    Mutate,
}

const READ_KEYWORDS: &[&str] = &[
    "SELECT", "WITH", "SHOW", "DESCRIBE", "DESC", "EXPLAIN", "PRAGMA", "VALUES",
];

const INSERT_KEYWORDS: &[&str] = &["INSERT", "REPLACE"];

impl StatementKind {
    /// Classify by a case-insensitive match on the leading keyword
    pub fn classify(sql: &str) -> Self {
        let keyword = leading_keyword(sql);
        if READ_KEYWORDS
            .iter()
            .any(|k| k.eq_ignore_ascii_case(keyword))
        {
            Self::Read
        } else {
            Self::Mutate
        }
    }

    /// Whether the statement is an insert (generated key is meaningful)
    pub fn is_insert(sql: &str) -> bool {
        let keyword = leading_keyword(sql);
        INSERT_KEYWORDS
            .iter()
            .any(|k| k.eq_ignore_ascii_case(keyword))
    }
}

/// First keyword after whitespace, opening parentheses and SQL comments
fn leading_keyword(sql: &str) -> &str {
    let mut rest = sql;
    loop {
        let trimmed = rest.trim_start_matches(|c: char| c.is_whitespace() || c == '(');
        if let Some(after) = trimmed.strip_prefix("--") {
            rest = after.split_once('\n').map(|(_, tail)| tail).unwrap_or("");
        } else if let Some(after) = trimmed.strip_prefix("/*") {
            rest = after.split_once("*/").map(|(_, tail)| tail).unwrap_or("");
        } else {
            rest = trimmed;
            break;
        }
    }
    let end = rest
        .find(|c: char| !c.is_ascii_alphabetic())
        .unwrap_or(rest.len());
    &rest[..end]
}
