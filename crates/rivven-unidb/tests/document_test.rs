//! Integration tests for the document-store path

use async_trait::async_trait;
use rivven_unidb::document::memory::MemoryDocumentAdapter;
use rivven_unidb::document::{Document, DocumentHandle, FindOptions, UpdateSummary};
use rivven_unidb::prelude::*;
use serde_json::{json, Value as Json};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

fn memory_dispatcher(config: DispatcherConfig) -> Dispatcher {
    Dispatcher::builder()
        .config(config)
        .adapters(AdapterSet::new().with(MemoryDocumentAdapter::new()))
        .build()
        .unwrap()
}

async fn run(dispatcher: &Dispatcher, id: &str, request: Json) -> Result<Arc<QueryResult>> {
    dispatcher
        .query(id, request, &[], QueryOptions::default())
        .await
}

#[tokio::test]
async fn test_find_without_filter_returns_all() {
    let dispatcher = memory_dispatcher(DispatcherConfig::default());
    let id = dispatcher
        .connect("document-store", ConnectionConfig::new(), None)
        .await
        .unwrap();
    assert!(id.starts_with("document-store-"));

    let inserted = run(
        &dispatcher,
        &id,
        json!({
            "collection": "users",
            "operation": "insertMany",
            "documents": [
                { "_id": 1, "name": "ada" },
                { "_id": 2, "name": "grace" },
                { "_id": 3, "name": "barbara" },
            ],
        }),
    )
    .await
    .unwrap();
    let outcome = inserted.mutation().unwrap();
    assert_eq!(outcome.affected_count, 3);
    assert_eq!(
        outcome.inserted_ids,
        vec![Value::Json(json!(1)), Value::Json(json!(2)), Value::Json(json!(3))]
    );

    let found = run(&dispatcher, &id, json!({ "collection": "users", "operation": "find" }))
        .await
        .unwrap();
    assert_eq!(found.documents().unwrap().len(), 3);
}

#[tokio::test]
async fn test_write_shapes() {
    let dispatcher = memory_dispatcher(DispatcherConfig::default());
    let id = dispatcher
        .connect("mongodb", ConnectionConfig::new().with_database("shop"), Some("docs"))
        .await
        .unwrap();

    let one = run(
        &dispatcher,
        &id,
        json!({ "collection": "items", "operation": "insertOne", "document": { "sku": "a", "qty": 1 } }),
    )
    .await
    .unwrap();
    let one = one.mutation().unwrap();
    assert_eq!(one.affected_count, 1);
    assert!(one.inserted_id.is_some());

    run(
        &dispatcher,
        &id,
        json!({ "collection": "items", "operation": "insertOne", "document": { "sku": "b", "qty": 5 } }),
    )
    .await
    .unwrap();

    let updated = run(
        &dispatcher,
        &id,
        json!({
            "collection": "items",
            "operation": "updateMany",
            "filter": { "qty": { "$lt": 3 } },
            "update": { "$inc": { "qty": 10 } },
        }),
    )
    .await
    .unwrap();
    assert_eq!(
        updated.to_json(),
        json!({ "affectedCount": 1, "matchedCount": 1 })
    );

    let item = run(
        &dispatcher,
        &id,
        json!({ "collection": "items", "operation": "findOne", "filter": { "sku": "a" } }),
    )
    .await
    .unwrap();
    match item.as_ref() {
        QueryResult::Document(Some(doc)) => assert_eq!(doc["qty"], 11),
        other => panic!("unexpected result: {other:?}"),
    }

    let missing = run(
        &dispatcher,
        &id,
        json!({ "collection": "items", "operation": "findOne", "filter": { "sku": "zzz" } }),
    )
    .await
    .unwrap();
    assert_eq!(*missing, QueryResult::Document(None));

    let deleted = run(
        &dispatcher,
        &id,
        json!({ "collection": "items", "operation": "deleteMany" }),
    )
    .await
    .unwrap();
    assert_eq!(deleted.mutation().unwrap().affected_count, 2);
}

#[tokio::test]
async fn test_aggregate_pipeline() {
    let dispatcher = memory_dispatcher(DispatcherConfig::default());
    let id = dispatcher
        .connect("document-store", ConnectionConfig::new(), None)
        .await
        .unwrap();

    run(
        &dispatcher,
        &id,
        json!({
            "collection": "scores",
            "operation": "insertMany",
            "documents": [{ "n": 5 }, { "n": 1 }, { "n": 3 }],
        }),
    )
    .await
    .unwrap();

    let out = run(
        &dispatcher,
        &id,
        json!({
            "collection": "scores",
            "operation": "aggregate",
            "pipeline": [{ "$match": { "n": { "$gt": 1 } } }, { "$sort": { "n": 1 } }],
        }),
    )
    .await
    .unwrap();
    let ns: Vec<i64> = out
        .documents()
        .unwrap()
        .iter()
        .filter_map(|d| d["n"].as_i64())
        .collect();
    assert_eq!(ns, vec![3, 5]);
}

#[tokio::test]
async fn test_malformed_requests() {
    let dispatcher = memory_dispatcher(DispatcherConfig::default());
    let id = dispatcher
        .connect("document-store", ConnectionConfig::new(), None)
        .await
        .unwrap();

    for request in [
        json!({ "operation": "find" }),
        json!({ "collection": "users" }),
        json!({ "collection": "users", "operation": "insertOne" }),
        json!("find users"),
    ] {
        let err = run(&dispatcher, &id, request).await.unwrap_err();
        assert!(matches!(err, Error::MalformedRequest { .. }), "{err:?}");
    }

    let err = dispatcher
        .query(&id, "SELECT * FROM users", &[], QueryOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MalformedRequest { .. }));
}

#[tokio::test]
async fn test_introspection() {
    let dispatcher = memory_dispatcher(DispatcherConfig::default());
    let id = dispatcher
        .connect("document-store", ConnectionConfig::new(), None)
        .await
        .unwrap();
    for collection in ["orders", "users"] {
        run(
            &dispatcher,
            &id,
            json!({ "collection": collection, "operation": "insertOne", "document": { "k": collection } }),
        )
        .await
        .unwrap();
    }

    let tables = dispatcher.list_tables(&id).await.unwrap();
    let names: Vec<&str> = tables
        .documents()
        .unwrap()
        .iter()
        .filter_map(|d| d["name"].as_str())
        .collect();
    assert_eq!(names, vec!["orders", "users"]);

    let schema = dispatcher.table_schema(&id, "users").await.unwrap();
    let sample = schema.documents().unwrap();
    assert_eq!(sample.len(), 1);
    assert_eq!(sample[0]["k"], "users");
}

#[tokio::test]
async fn test_cached_structured_result_is_shared() {
    let dispatcher = memory_dispatcher(DispatcherConfig::default().with_cache(true));
    let id = dispatcher
        .connect("document-store", ConnectionConfig::new(), None)
        .await
        .unwrap();
    let request = json!({ "collection": "users", "operation": "find" });

    let first = run(&dispatcher, &id, request.clone()).await.unwrap();
    let second = run(&dispatcher, &id, request).await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(dispatcher.stats().cache_hits, 1);
}

/// Database that counts how often a collection handle is requested
#[derive(Default)]
struct SpyDatabase {
    collection_calls: AtomicU32,
}

#[async_trait]
impl DocumentDatabase for SpyDatabase {
    fn collection(&self, _name: &str) -> Arc<dyn DocumentCollection> {
        self.collection_calls.fetch_add(1, Ordering::SeqCst);
        Arc::new(EmptyCollection)
    }

    async fn list_collection_names(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

struct EmptyCollection;

#[async_trait]
impl DocumentCollection for EmptyCollection {
    async fn find(&self, _filter: &Document, _options: &FindOptions) -> Result<Vec<Json>> {
        Ok(Vec::new())
    }

    async fn find_one(&self, _filter: &Document, _options: &FindOptions) -> Result<Option<Json>> {
        Ok(None)
    }

    async fn insert_one(&self, _document: Document) -> Result<Json> {
        Ok(Json::Null)
    }

    async fn insert_many(&self, _documents: Vec<Document>) -> Result<Vec<Json>> {
        Ok(Vec::new())
    }

    async fn update(
        &self,
        _filter: &Document,
        _update: &Document,
        _many: bool,
        _upsert: bool,
    ) -> Result<UpdateSummary> {
        Ok(UpdateSummary::default())
    }

    async fn delete(&self, _filter: &Document, _many: bool) -> Result<u64> {
        Ok(0)
    }

    async fn aggregate(&self, _pipeline: &[Document]) -> Result<Vec<Json>> {
        Ok(Vec::new())
    }
}

struct SpyAdapter {
    database: Arc<SpyDatabase>,
}

#[async_trait]
impl BackendAdapter for SpyAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::DocumentStore
    }

    async fn connect(&self, _config: &ConnectionConfig) -> Result<Arc<dyn BackendHandle>> {
        Ok(Arc::new(DocumentHandle::new(
            Arc::clone(&self.database) as Arc<dyn DocumentDatabase>
        )))
    }

    fn list_tables_request(&self) -> CannedRequest {
        CannedRequest::ListCollections
    }

    fn table_schema_request(&self, table: &str) -> Result<CannedRequest> {
        Ok(CannedRequest::Query {
            query: Query::structured(json!({ "collection": table, "operation": "find" })),
            params: Vec::new(),
        })
    }
}

#[tokio::test]
async fn test_unknown_operation_never_touches_collection() {
    let database = Arc::new(SpyDatabase::default());
    let dispatcher = Dispatcher::builder()
        .adapters(AdapterSet::new().with(SpyAdapter {
            database: Arc::clone(&database),
        }))
        .build()
        .unwrap();
    let id = dispatcher
        .connect("document-store", ConnectionConfig::new(), None)
        .await
        .unwrap();

    let err = run(&dispatcher, &id, json!({ "collection": "x", "operation": "unknownOp" }))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnsupportedOperation { ref operation } if operation == "unknownOp"));
    assert_eq!(database.collection_calls.load(Ordering::SeqCst), 0);

    // the handle validates on its own as well
    let handle = DocumentHandle::new(Arc::clone(&database) as Arc<dyn DocumentDatabase>);
    let err = handle
        .execute(
            &Query::structured(json!({ "collection": "x", "operation": "unknownOp" })),
            &[],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnsupportedOperation { .. }));
    assert_eq!(database.collection_calls.load(Ordering::SeqCst), 0);

    run(&dispatcher, &id, json!({ "collection": "x", "operation": "find" }))
        .await
        .unwrap();
    assert_eq!(database.collection_calls.load(Ordering::SeqCst), 1);
}
