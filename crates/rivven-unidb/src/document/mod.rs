//! Document-store backend support
//!
//! A structured query (`Query::Structured`) is parsed into a
//! [`DocumentRequest`] before any collection is touched, so malformed or
//! unknown requests never reach a driver. Drivers plug in through the
//! [`DocumentDatabase`] / [`DocumentCollection`] traits; [`DocumentHandle`]
//! adapts any database to the [`BackendHandle`] interface.

pub mod memory;
#[cfg(feature = "mongodb")]
pub mod mongo;

use async_trait::async_trait;
use serde_json::{json, Map, Value as Json};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::backend::{BackendHandle, BackendKind, CannedRequest};
use crate::error::{Error, Result};
use crate::types::{MutationOutcome, Query, QueryResult, Value};

/// A JSON object used as filter, update, document or pipeline stage
pub type Document = Map<String, Json>;

/// Default database name for document stores
pub const DEFAULT_DATABASE: &str = "test";

/// Supported document operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentOperation {
    /// Return every matching document
    Find,
    /// Return the first matching document, if any
    FindOne,
    /// Insert a single document
    InsertOne,
    /// Insert several documents
    InsertMany,
    /// Update the first matching document
    UpdateOne,
    /// Update every matching document
    UpdateMany,
    /// Delete the first matching document
    DeleteOne,
    /// Delete every matching document
    DeleteMany,
    /// Run an aggregation pipeline
    Aggregate,
}

impl DocumentOperation {
    /// Wire name of the operation
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Find => "find",
            Self::FindOne => "findOne",
            Self::InsertOne => "insertOne",
            Self::InsertMany => "insertMany",
            Self::UpdateOne => "updateOne",
            Self::UpdateMany => "updateMany",
            Self::DeleteOne => "deleteOne",
            Self::DeleteMany => "deleteMany",
            Self::Aggregate => "aggregate",
        }
    }
}

impl fmt::Display for DocumentOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentOperation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "find" => Ok(Self::Find),
            "findOne" => Ok(Self::FindOne),
            "insertOne" => Ok(Self::InsertOne),
            "insertMany" => Ok(Self::InsertMany),
            "updateOne" => Ok(Self::UpdateOne),
            "updateMany" => Ok(Self::UpdateMany),
            "deleteOne" => Ok(Self::DeleteOne),
            "deleteMany" => Ok(Self::DeleteMany),
            "aggregate" => Ok(Self::Aggregate),
            other => Err(Error::unsupported_operation(other)),
        }
    }
}

/// Options for find and findOne
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    /// Maximum number of documents
    pub limit: Option<u64>,
    /// Number of matching documents to skip
    pub skip: Option<u64>,
    /// Sort specification (`{field: 1 | -1}`)
    pub sort: Option<Document>,
    /// Projection specification
    pub projection: Option<Document>,
}

/// Parsed operation with its arguments
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentCommand {
    /// find
    Find {
        /// Match filter, empty for match-all
        filter: Document,
        /// Find options
        options: FindOptions,
    },
    /// findOne
    FindOne {
        /// Match filter, empty for match-all
        filter: Document,
        /// Find options
        options: FindOptions,
    },
    /// insertOne
    InsertOne {
        /// Document to insert
        document: Document,
    },
    /// insertMany
    InsertMany {
        /// Documents to insert
        documents: Vec<Document>,
    },
    /// updateOne / updateMany
    Update {
        /// Match filter
        filter: Document,
        /// Update specification
        update: Document,
        /// Update every match instead of the first
        many: bool,
        /// Insert when nothing matches
        upsert: bool,
    },
    /// deleteOne / deleteMany
    Delete {
        /// Match filter
        filter: Document,
        /// Delete every match instead of the first
        many: bool,
    },
    /// aggregate
    Aggregate {
        /// Pipeline stages
        pipeline: Vec<Document>,
    },
}

/// A validated document-store request
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentRequest {
    /// Target collection
    pub collection: String,
    /// Requested operation
    pub operation: DocumentOperation,
    /// Operation with its arguments
    pub command: DocumentCommand,
}

impl DocumentRequest {
    /// Parse a structured query
    pub fn from_query(query: &Query) -> Result<Self> {
        match query {
            Query::Structured(request) => Self::from_json(request),
            Query::Text(_) => Err(Error::malformed(
                "document-store expects a structured request, got text",
            )),
        }
    }

    /// Parse and validate a JSON request.
    ///
    /// Fails with `MalformedRequest` when `collection` or `operation` is
    /// missing, and with `UnsupportedOperation` for an unknown operation.
    pub fn from_json(request: &Json) -> Result<Self> {
        let obj = request
            .as_object()
            .ok_or_else(|| Error::malformed("request must be a JSON object"))?;

        let collection = obj
            .get("collection")
            .and_then(Json::as_str)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| Error::malformed("request is missing 'collection'"))?
            .to_string();
        let operation: DocumentOperation = obj
            .get("operation")
            .and_then(Json::as_str)
            .ok_or_else(|| Error::malformed("request is missing 'operation'"))?
            .parse()?;

        let filter = optional_object(obj, "filter")?.unwrap_or_default();
        let options = optional_object(obj, "options")?.unwrap_or_default();

        let command = match operation {
            DocumentOperation::Find => DocumentCommand::Find {
                filter,
                options: parse_find_options(&options)?,
            },
            DocumentOperation::FindOne => DocumentCommand::FindOne {
                filter,
                options: parse_find_options(&options)?,
            },
            DocumentOperation::InsertOne => DocumentCommand::InsertOne {
                document: optional_object(obj, "document")?
                    .ok_or_else(|| Error::malformed("insertOne requires 'document'"))?,
            },
            DocumentOperation::InsertMany => DocumentCommand::InsertMany {
                documents: object_array(obj, "documents")?
                    .ok_or_else(|| Error::malformed("insertMany requires 'documents'"))?,
            },
            DocumentOperation::UpdateOne | DocumentOperation::UpdateMany => {
                DocumentCommand::Update {
                    filter,
                    update: optional_object(obj, "update")?
                        .ok_or_else(|| Error::malformed(format!("{operation} requires 'update'")))?,
                    many: operation == DocumentOperation::UpdateMany,
                    upsert: options.get("upsert").and_then(Json::as_bool).unwrap_or(false),
                }
            }
            DocumentOperation::DeleteOne | DocumentOperation::DeleteMany => {
                DocumentCommand::Delete {
                    filter,
                    many: operation == DocumentOperation::DeleteMany,
                }
            }
            DocumentOperation::Aggregate => DocumentCommand::Aggregate {
                pipeline: object_array(obj, "pipeline")?.unwrap_or_default(),
            },
        };

        Ok(Self {
            collection,
            operation,
            command,
        })
    }
}

fn optional_object(obj: &Document, key: &str) -> Result<Option<Document>> {
    match obj.get(key) {
        None | Some(Json::Null) => Ok(None),
        Some(Json::Object(map)) => Ok(Some(map.clone())),
        Some(_) => Err(Error::malformed(format!("'{key}' must be an object"))),
    }
}

fn object_array(obj: &Document, key: &str) -> Result<Option<Vec<Document>>> {
    match obj.get(key) {
        None | Some(Json::Null) => Ok(None),
        Some(Json::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_object()
                    .cloned()
                    .ok_or_else(|| Error::malformed(format!("'{key}' must contain objects")))
            })
            .collect::<Result<Vec<_>>>()
            .map(Some),
        Some(_) => Err(Error::malformed(format!("'{key}' must be an array"))),
    }
}

fn parse_find_options(options: &Document) -> Result<FindOptions> {
    let count = |key: &str| -> Result<Option<u64>> {
        match options.get(key) {
            None | Some(Json::Null) => Ok(None),
            Some(v) => v
                .as_u64()
                .map(Some)
                .ok_or_else(|| Error::malformed(format!("option '{key}' must be a non-negative integer"))),
        }
    };

    Ok(FindOptions {
        limit: count("limit")?,
        skip: count("skip")?,
        sort: optional_object(options, "sort")?,
        projection: optional_object(options, "projection")?,
    })
}

/// Outcome of an update call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateSummary {
    /// Documents matching the filter
    pub matched: u64,
    /// Documents actually changed
    pub modified: u64,
    /// Id of an upserted document
    pub upserted_id: Option<Json>,
}

/// A database in a document store
#[async_trait]
pub trait DocumentDatabase: Send + Sync {
    /// Handle to a named collection
    fn collection(&self, name: &str) -> Arc<dyn DocumentCollection>;

    /// Names of all collections
    async fn list_collection_names(&self) -> Result<Vec<String>>;

    /// Round-trip to the server
    async fn ping(&self) -> Result<()>;

    /// Release driver resources
    async fn shutdown(&self) -> Result<()>;
}

/// A collection in a document store
#[async_trait]
pub trait DocumentCollection: Send + Sync {
    /// Matching documents
    async fn find(&self, filter: &Document, options: &FindOptions) -> Result<Vec<Json>>;

    /// First matching document
    async fn find_one(&self, filter: &Document, options: &FindOptions) -> Result<Option<Json>>;

    /// Insert one document, returning its id
    async fn insert_one(&self, document: Document) -> Result<Json>;

    /// Insert documents, returning their ids in order
    async fn insert_many(&self, documents: Vec<Document>) -> Result<Vec<Json>>;

    /// Apply an update to the first or every match
    async fn update(
        &self,
        filter: &Document,
        update: &Document,
        many: bool,
        upsert: bool,
    ) -> Result<UpdateSummary>;

    /// Delete the first or every match, returning the deleted count
    async fn delete(&self, filter: &Document, many: bool) -> Result<u64>;

    /// Run an aggregation pipeline
    async fn aggregate(&self, pipeline: &[Document]) -> Result<Vec<Json>>;
}

/// [`BackendHandle`] over any [`DocumentDatabase`]
pub struct DocumentHandle {
    database: Arc<dyn DocumentDatabase>,
}

impl DocumentHandle {
    /// Wrap a database
    pub fn new(database: Arc<dyn DocumentDatabase>) -> Self {
        Self { database }
    }

    /// Run a validated request against its collection
    pub async fn run(&self, request: DocumentRequest) -> Result<QueryResult> {
        let collection = self.database.collection(&request.collection);

        match request.command {
            DocumentCommand::Find { filter, options } => collection
                .find(&filter, &options)
                .await
                .map(QueryResult::Documents),
            DocumentCommand::FindOne { filter, options } => collection
                .find_one(&filter, &options)
                .await
                .map(QueryResult::Document),
            DocumentCommand::InsertOne { document } => {
                let id = collection.insert_one(document).await?;
                Ok(QueryResult::Mutation(
                    MutationOutcome::affected(1).with_inserted_id(Value::Json(id)),
                ))
            }
            DocumentCommand::InsertMany { documents } => {
                let ids = collection.insert_many(documents).await?;
                Ok(QueryResult::Mutation(MutationOutcome {
                    affected_count: ids.len() as u64,
                    inserted_id: None,
                    inserted_ids: ids.into_iter().map(Value::Json).collect(),
                    matched_count: None,
                }))
            }
            DocumentCommand::Update {
                filter,
                update,
                many,
                upsert,
            } => {
                let summary = collection.update(&filter, &update, many, upsert).await?;
                Ok(QueryResult::Mutation(MutationOutcome {
                    affected_count: summary.modified,
                    inserted_id: summary.upserted_id.map(Value::Json),
                    inserted_ids: Vec::new(),
                    matched_count: Some(summary.matched),
                }))
            }
            DocumentCommand::Delete { filter, many } => collection
                .delete(&filter, many)
                .await
                .map(|deleted| QueryResult::Mutation(MutationOutcome::affected(deleted))),
            DocumentCommand::Aggregate { pipeline } => collection
                .aggregate(&pipeline)
                .await
                .map(QueryResult::Documents),
        }
    }
}

#[async_trait]
impl BackendHandle for DocumentHandle {
    async fn execute(&self, query: &Query, _params: &[Value]) -> Result<QueryResult> {
        let request = DocumentRequest::from_query(query)?;
        self.run(request).await
    }

    async fn is_valid(&self) -> bool {
        self.database.ping().await.is_ok()
    }

    async fn close(&self) -> Result<()> {
        self.database.shutdown().await
    }

    async fn list_collections(&self) -> Result<QueryResult> {
        let names = self.database.list_collection_names().await?;
        Ok(QueryResult::Documents(
            names
                .into_iter()
                .map(|name| json!({ "name": name, "type": "collection" }))
                .collect(),
        ))
    }
}

/// Sample-one-document schema request for a collection
pub(crate) fn sample_request(collection: &str) -> CannedRequest {
    CannedRequest::Query {
        query: Query::structured(json!({
            "collection": collection,
            "operation": "find",
            "options": { "limit": 1 },
        })),
        params: Vec::new(),
    }
}

/// Kind served by document adapters
pub(crate) const KIND: BackendKind = BackendKind::DocumentStore;
