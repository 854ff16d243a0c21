//! # rivven-unidb
//!
//! One connection, query and introspection API over relational and document
//! databases.
//!
//! ## Features
//!
//! - **Four backend kinds**: embedded SQLite, MySQL/MariaDB, PostgreSQL and a
//!   document store (MongoDB, or an in-memory store for tests)
//! - **Connection registry**: bounded, id-addressed, with credential redaction
//! - **Retry executor**: bounded exponential backoff around every backend call
//! - **Result cache**: SHA-256 fingerprinted TTL cache of query results
//! - **Introspection**: list tables/collections and describe a table
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use rivven_unidb::prelude::*;
//! use serde_json::json;
//!
//! let dispatcher = Dispatcher::builder()
//!     .config(DispatcherConfig::default().with_cache(true))
//!     .build()?;
//!
//! // relational
//! let db = dispatcher.connect("sqlite", ConnectionConfig::from_path("app.db"), None).await?;
//! let rows = dispatcher
//!     .query(&db, "SELECT * FROM users WHERE id = ?", &[Value::Int64(1)], QueryOptions::default())
//!     .await?;
//!
//! // document
//! let docs = dispatcher.connect("document-store", ConnectionConfig::new(), Some("docs")).await?;
//! let users = dispatcher
//!     .query(&docs, json!({ "collection": "users", "operation": "find" }), &[], QueryOptions::default())
//!     .await?;
//!
//! dispatcher.close().await;
//! ```
//!
//! ## Feature Flags
//!
//! - `sqlite` (default) - relational-file backend via rusqlite
//! - `mysql` - relational-network-a backend via mysql_async
//! - `postgres` - relational-network-b backend via tokio-postgres
//! - `mongodb` - document-store backend via the MongoDB driver (otherwise the
//!   in-memory document store serves that kind)
//! - `full` - all of the above

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod backend;
pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod document;
pub mod error;
pub mod registry;
pub mod retry;
pub mod security;
pub mod types;

// Backend implementations (conditionally compiled)
#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "mysql")]
pub mod mysql;

#[cfg(feature = "postgres")]
pub mod postgres;

/// Prelude module for convenient imports
pub mod prelude {
    // Error types
    pub use crate::error::{Error, ErrorCategory, Result};

    // Values and results
    pub use crate::types::{MutationOutcome, Query, QueryResult, Row, Value};

    // Backends
    pub use crate::backend::{AdapterSet, BackendAdapter, BackendHandle, BackendKind, CannedRequest};
    pub use crate::document::{
        DocumentCollection, DocumentDatabase, DocumentOperation, DocumentRequest,
    };

    // Configuration
    pub use crate::config::{ConnectionConfig, DispatcherConfig, SensitiveString};

    // Retry, registry and dispatcher
    pub use crate::dispatcher::{Dispatcher, DispatcherBuilder, DispatcherStats, QueryOptions};
    pub use crate::registry::ConnectionSummary;
    pub use crate::retry::{RetryEvent, RetryObserver, RetryPolicy};
}

// Re-export commonly used items at crate root
pub use error::{Error, Result};
pub use types::Value;

#[cfg(test)]
mod tests {
    use super::prelude::*;

    #[test]
    fn test_prelude_imports() {
        let _value = Value::Int32(42);
        let _config = ConnectionConfig::from_path(":memory:");
        let _options = QueryOptions::no_cache();
        let _policy = RetryPolicy::default();
    }

    #[test]
    fn test_error_types() {
        let err = Error::unsupported_backend("cassandra");
        assert_eq!(err.category(), ErrorCategory::Backend);
        assert_eq!(err.to_string(), "unsupported backend: cassandra");
    }

    #[test]
    fn test_default_adapters_cover_document_store() {
        let set = AdapterSet::with_defaults();
        assert!(set.get(BackendKind::DocumentStore).is_some());
        #[cfg(feature = "sqlite")]
        assert!(set.get(BackendKind::RelationalFile).is_some());
    }
}
