//! In-memory document store for testing and development
//!
//! Databases live in the adapter, so every connection opened through the
//! same [`MemoryDocumentAdapter`] with the same database name sees the same
//! data. Collections are created on first write.
//!
//! Supported query language subset:
//! - filters: field equality (dotted paths allowed) and `$eq`, `$ne`, `$gt`,
//!   `$gte`, `$lt`, `$lte`, `$in`
//! - updates: `$set`, `$unset`, `$inc`
//! - pipeline stages: `$match`, `$skip`, `$limit`, `$sort`
//!
//! Anything else fails with [`Error::Unsupported`].

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::{Map, Value as Json};
use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use tracing::debug;

use super::{
    sample_request, Document, DocumentCollection, DocumentDatabase, DocumentHandle, FindOptions,
    UpdateSummary, DEFAULT_DATABASE, KIND,
};
use crate::backend::{BackendAdapter, BackendHandle, BackendKind, CannedRequest};
use crate::config::ConnectionConfig;
use crate::error::{Error, Result};

type CollectionData = Arc<RwLock<Vec<Document>>>;

/// Shared state of one named in-memory database
#[derive(Default)]
pub struct MemoryDatabase {
    collections: DashMap<String, CollectionData>,
}

impl MemoryDatabase {
    fn existing(&self, name: &str) -> Option<CollectionData> {
        self.collections.get(name).map(|c| Arc::clone(c.value()))
    }

    fn get_or_create(&self, name: &str) -> CollectionData {
        Arc::clone(self.collections.entry(name.to_string()).or_default().value())
    }
}

/// Adapter for the document-store kind backed by process memory
#[derive(Default, Clone)]
pub struct MemoryDocumentAdapter {
    databases: Arc<DashMap<String, Arc<MemoryDatabase>>>,
}

impl MemoryDocumentAdapter {
    /// Create an adapter with no databases
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared database by name, created if missing
    pub fn database(&self, name: &str) -> Arc<MemoryDatabase> {
        Arc::clone(self.databases.entry(name.to_string()).or_default().value())
    }
}

impl std::fmt::Debug for MemoryDocumentAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDocumentAdapter")
            .field("databases", &self.databases.len())
            .finish()
    }
}

#[async_trait]
impl BackendAdapter for MemoryDocumentAdapter {
    fn kind(&self) -> BackendKind {
        KIND
    }

    async fn connect(&self, config: &ConnectionConfig) -> Result<Arc<dyn BackendHandle>> {
        let name = config.database.as_deref().unwrap_or(DEFAULT_DATABASE);
        let store = MemoryDocumentStore::new(self.database(name));
        debug!(database = %name, "opened in-memory document database");
        Ok(Arc::new(DocumentHandle::new(Arc::new(store))))
    }

    fn list_tables_request(&self) -> CannedRequest {
        CannedRequest::ListCollections
    }

    fn table_schema_request(&self, table: &str) -> Result<CannedRequest> {
        Ok(sample_request(table))
    }
}

/// One connection's view of a [`MemoryDatabase`]
pub struct MemoryDocumentStore {
    database: Arc<MemoryDatabase>,
    closed: Arc<AtomicBool>,
}

impl MemoryDocumentStore {
    /// Open a view of `database`
    pub fn new(database: Arc<MemoryDatabase>) -> Self {
        Self {
            database,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }
}

fn ensure_open(closed: &AtomicBool) -> Result<()> {
    if closed.load(AtomicOrdering::Acquire) {
        Err(Error::driver_message(KIND, "client is closed"))
    } else {
        Ok(())
    }
}

#[async_trait]
impl DocumentDatabase for MemoryDocumentStore {
    fn collection(&self, name: &str) -> Arc<dyn DocumentCollection> {
        Arc::new(MemoryCollection {
            name: name.to_string(),
            database: Arc::clone(&self.database),
            closed: Arc::clone(&self.closed),
        })
    }

    async fn list_collection_names(&self) -> Result<Vec<String>> {
        ensure_open(&self.closed)?;
        let mut names: Vec<String> = self
            .database
            .collections
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn ping(&self) -> Result<()> {
        ensure_open(&self.closed)
    }

    async fn shutdown(&self) -> Result<()> {
        self.closed.store(true, AtomicOrdering::Release);
        Ok(())
    }
}

struct MemoryCollection {
    name: String,
    database: Arc<MemoryDatabase>,
    closed: Arc<AtomicBool>,
}

impl MemoryCollection {
    fn read(&self) -> Result<Vec<Document>> {
        ensure_open(&self.closed)?;
        Ok(self
            .database
            .existing(&self.name)
            .map(|data| data.read().clone())
            .unwrap_or_default())
    }

    fn data(&self) -> Result<CollectionData> {
        ensure_open(&self.closed)?;
        Ok(self.database.get_or_create(&self.name))
    }
}

#[async_trait]
impl DocumentCollection for MemoryCollection {
    async fn find(&self, filter: &Document, options: &FindOptions) -> Result<Vec<Json>> {
        let mut docs = filter_documents(self.read()?, filter)?;
        if let Some(sort) = &options.sort {
            sort_documents(&mut docs, sort)?;
        }
        let docs = docs
            .into_iter()
            .skip(options.skip.unwrap_or(0) as usize)
            .take(options.limit.filter(|l| *l > 0).unwrap_or(u64::MAX) as usize);

        match &options.projection {
            Some(projection) => docs
                .map(|d| project(d, projection).map(Json::Object))
                .collect(),
            None => Ok(docs.map(Json::Object).collect()),
        }
    }

    async fn find_one(&self, filter: &Document, options: &FindOptions) -> Result<Option<Json>> {
        let options = FindOptions {
            limit: Some(1),
            ..options.clone()
        };
        Ok(self.find(filter, &options).await?.into_iter().next())
    }

    async fn insert_one(&self, document: Document) -> Result<Json> {
        let data = self.data()?;
        let mut docs = data.write();
        insert_into(&mut docs, document)
    }

    async fn insert_many(&self, documents: Vec<Document>) -> Result<Vec<Json>> {
        let data = self.data()?;
        let mut docs = data.write();
        documents
            .into_iter()
            .map(|document| insert_into(&mut docs, document))
            .collect()
    }

    async fn update(
        &self,
        filter: &Document,
        update: &Document,
        many: bool,
        upsert: bool,
    ) -> Result<UpdateSummary> {
        validate_update(update)?;
        let data = self.data()?;
        let mut docs = data.write();
        let mut summary = UpdateSummary::default();

        for doc in docs.iter_mut() {
            if !matches_filter(doc, filter)? {
                continue;
            }
            summary.matched += 1;
            if apply_update(doc, update)? {
                summary.modified += 1;
            }
            if !many {
                break;
            }
        }

        if summary.matched == 0 && upsert {
            let mut seed = Document::new();
            for (key, value) in filter {
                if !key.starts_with('$') && !is_operator_object(value) {
                    set_path(&mut seed, key, value.clone());
                }
            }
            apply_update(&mut seed, update)?;
            summary.upserted_id = Some(insert_into(&mut docs, seed)?);
        }

        Ok(summary)
    }

    async fn delete(&self, filter: &Document, many: bool) -> Result<u64> {
        let data = self.data()?;
        let mut docs = data.write();
        let mut deleted = 0u64;
        let mut error = None;

        docs.retain(|doc| {
            if error.is_some() || (!many && deleted == 1) {
                return true;
            }
            match matches_filter(doc, filter) {
                Ok(true) => {
                    deleted += 1;
                    false
                }
                Ok(false) => true,
                Err(e) => {
                    error = Some(e);
                    true
                }
            }
        });

        match error {
            Some(e) => Err(e),
            None => Ok(deleted),
        }
    }

    async fn aggregate(&self, pipeline: &[Document]) -> Result<Vec<Json>> {
        let mut docs = self.read()?;
        for stage in pipeline {
            let mut entries = stage.iter();
            let (name, arg) = match (entries.next(), entries.next()) {
                (Some(entry), None) => entry,
                _ => {
                    return Err(Error::malformed(
                        "pipeline stage must have exactly one field",
                    ))
                }
            };
            docs = match name.as_str() {
                "$match" => filter_documents(docs, as_document(arg, "$match")?)?,
                "$skip" => docs.into_iter().skip(as_count(arg, "$skip")?).collect(),
                "$limit" => docs.into_iter().take(as_count(arg, "$limit")?).collect(),
                "$sort" => {
                    sort_documents(&mut docs, as_document(arg, "$sort")?)?;
                    docs
                }
                other => {
                    return Err(Error::unsupported(format!(
                        "pipeline stage {other} is not supported by the in-memory store"
                    )))
                }
            };
        }
        Ok(docs.into_iter().map(Json::Object).collect())
    }
}

fn as_document<'a>(value: &'a Json, stage: &str) -> Result<&'a Document> {
    value
        .as_object()
        .ok_or_else(|| Error::malformed(format!("{stage} expects an object")))
}

fn as_count(value: &Json, stage: &str) -> Result<usize> {
    value
        .as_u64()
        .map(|n| n as usize)
        .ok_or_else(|| Error::malformed(format!("{stage} expects a non-negative integer")))
}

fn insert_into(docs: &mut Vec<Document>, mut document: Document) -> Result<Json> {
    let id = document
        .entry("_id")
        .or_insert_with(|| Json::String(uuid::Uuid::new_v4().simple().to_string()))
        .clone();
    if docs.iter().any(|d| d.get("_id") == Some(&id)) {
        return Err(Error::driver_message(
            KIND,
            format!("E11000 duplicate key error: _id {id}"),
        ));
    }
    docs.push(document);
    Ok(id)
}

fn filter_documents(docs: Vec<Document>, filter: &Document) -> Result<Vec<Document>> {
    let mut out = Vec::with_capacity(docs.len());
    for doc in docs {
        if matches_filter(&doc, filter)? {
            out.push(doc);
        }
    }
    Ok(out)
}

fn is_operator_object(value: &Json) -> bool {
    value
        .as_object()
        .is_some_and(|m| !m.is_empty() && m.keys().all(|k| k.starts_with('$')))
}

/// Whether `doc` satisfies every clause of `filter`; an empty filter matches all
pub fn matches_filter(doc: &Document, filter: &Document) -> Result<bool> {
    for (path, condition) in filter {
        if path.starts_with('$') {
            return Err(Error::unsupported(format!(
                "query operator {path} is not supported by the in-memory store"
            )));
        }
        let field = get_path(doc, path);

        let matched = if is_operator_object(condition) {
            let mut all = true;
            for (op, operand) in condition.as_object().into_iter().flatten() {
                if !eval_operator(field, op, operand)? {
                    all = false;
                    break;
                }
            }
            all
        } else {
            equals(field, condition)
        };

        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

fn eval_operator(field: Option<&Json>, op: &str, operand: &Json) -> Result<bool> {
    let ordered = |accept: fn(Ordering) -> bool| {
        field
            .and_then(|f| compare_values(f, operand))
            .is_some_and(accept)
    };

    Ok(match op {
        "$eq" => equals(field, operand),
        "$ne" => !equals(field, operand),
        "$gt" => ordered(|o| o == Ordering::Greater),
        "$gte" => ordered(|o| o != Ordering::Less),
        "$lt" => ordered(|o| o == Ordering::Less),
        "$lte" => ordered(|o| o != Ordering::Greater),
        "$in" => {
            let candidates = operand
                .as_array()
                .ok_or_else(|| Error::malformed("$in expects an array"))?;
            candidates.iter().any(|c| equals(field, c))
        }
        other => {
            return Err(Error::unsupported(format!(
                "query operator {other} is not supported by the in-memory store"
            )))
        }
    })
}

/// Equality with document-store semantics: a missing field equals null,
/// and an array field matches when any element is equal
fn equals(field: Option<&Json>, expected: &Json) -> bool {
    match field {
        None => expected.is_null(),
        Some(actual) => {
            json_eq(actual, expected)
                || matches!(actual, Json::Array(items) if items.iter().any(|i| json_eq(i, expected)))
        }
    }
}

fn json_eq(a: &Json, b: &Json) -> bool {
    match (a, b) {
        (Json::Number(x), Json::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Ordering between two comparable values of the same type class
fn compare_values(a: &Json, b: &Json) -> Option<Ordering> {
    match (a, b) {
        (Json::Number(x), Json::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Json::String(x), Json::String(y)) => Some(x.cmp(y)),
        (Json::Bool(x), Json::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn type_rank(value: Option<&Json>) -> u8 {
    match value {
        None | Some(Json::Null) => 0,
        Some(Json::Number(_)) => 1,
        Some(Json::String(_)) => 2,
        Some(Json::Object(_)) => 3,
        Some(Json::Array(_)) => 4,
        Some(Json::Bool(_)) => 5,
    }
}

fn sort_documents(docs: &mut [Document], spec: &Document) -> Result<()> {
    let mut keys = Vec::with_capacity(spec.len());
    for (path, direction) in spec {
        let descending = match direction.as_i64() {
            Some(1) => false,
            Some(-1) => true,
            _ => return Err(Error::malformed(format!("sort direction for '{path}' must be 1 or -1"))),
        };
        keys.push((path.as_str(), descending));
    }

    docs.sort_by(|a, b| {
        for (path, descending) in &keys {
            let (x, y) = (get_path(a, path), get_path(b, path));
            let ord = type_rank(x).cmp(&type_rank(y)).then_with(|| match (x, y) {
                (Some(x), Some(y)) => compare_values(x, y).unwrap_or(Ordering::Equal),
                _ => Ordering::Equal,
            });
            let ord = if *descending { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
    Ok(())
}

fn project(doc: Document, projection: &Document) -> Result<Document> {
    let include_id = projection.get("_id").map(truthy).unwrap_or(true);
    let fields: Vec<(&String, bool)> = projection
        .iter()
        .filter(|(k, _)| k.as_str() != "_id")
        .map(|(k, v)| (k, truthy(v)))
        .collect();

    let inclusive = fields.first().map(|(_, keep)| *keep);
    if fields.iter().any(|(_, keep)| Some(*keep) != inclusive) {
        return Err(Error::malformed(
            "projection cannot mix inclusion and exclusion",
        ));
    }

    let mut out = match inclusive {
        Some(true) => {
            let mut out = Map::new();
            for (key, _) in &fields {
                if let Some(value) = doc.get(key.as_str()) {
                    out.insert((*key).clone(), value.clone());
                }
            }
            if let Some(id) = doc.get("_id") {
                out.insert("_id".into(), id.clone());
            }
            out
        }
        _ => {
            let mut out = doc;
            for (key, _) in &fields {
                out.remove(key.as_str());
            }
            out
        }
    };
    if !include_id {
        out.remove("_id");
    }
    Ok(out)
}

fn truthy(value: &Json) -> bool {
    match value {
        Json::Bool(b) => *b,
        Json::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        _ => true,
    }
}

fn validate_update(update: &Document) -> Result<()> {
    if update.is_empty() {
        return Err(Error::malformed("update document is empty"));
    }
    for (op, args) in update {
        match op.as_str() {
            "$set" | "$unset" | "$inc" => {
                if !args.is_object() {
                    return Err(Error::malformed(format!("{op} expects an object")));
                }
            }
            other => {
                return Err(Error::unsupported(format!(
                    "update operator {other} is not supported by the in-memory store"
                )))
            }
        }
    }
    Ok(())
}

/// Apply `$set`, `$unset` and `$inc`; returns whether the document changed
fn apply_update(doc: &mut Document, update: &Document) -> Result<bool> {
    let before = doc.clone();

    for (op, args) in update {
        let Some(args) = args.as_object() else {
            continue;
        };
        for (path, value) in args {
            match op.as_str() {
                "$set" => set_path(doc, path, value.clone()),
                "$unset" => remove_path(doc, path),
                "$inc" => {
                    let current = get_path(doc, path).cloned();
                    let next = increment(current.as_ref(), value, path)?;
                    set_path(doc, path, next);
                }
                _ => {}
            }
        }
    }

    Ok(*doc != before)
}

fn increment(current: Option<&Json>, by: &Json, path: &str) -> Result<Json> {
    let non_numeric = || {
        Error::driver_message(
            KIND,
            format!("Cannot apply $inc to a value of non-numeric type at '{path}'"),
        )
    };
    let Json::Number(by) = by else {
        return Err(non_numeric());
    };
    let current = match current {
        None | Some(Json::Null) => return Ok(Json::Number(by.clone())),
        Some(Json::Number(n)) => n,
        Some(_) => return Err(non_numeric()),
    };

    if let (Some(a), Some(b)) = (current.as_i64(), by.as_i64()) {
        if let Some(sum) = a.checked_add(b) {
            return Ok(Json::from(sum));
        }
    }
    let sum = current.as_f64().unwrap_or(0.0) + by.as_f64().unwrap_or(0.0);
    serde_json::Number::from_f64(sum)
        .map(Json::Number)
        .ok_or_else(non_numeric)
}

fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Json> {
    let mut parts = path.split('.');
    let mut current = doc.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn set_path(doc: &mut Document, path: &str, value: Json) {
    match path.split_once('.') {
        None => {
            doc.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let child = doc
                .entry(head.to_string())
                .or_insert_with(|| Json::Object(Map::new()));
            if !child.is_object() {
                *child = Json::Object(Map::new());
            }
            if let Json::Object(child) = child {
                set_path(child, rest, value);
            }
        }
    }
}

fn remove_path(doc: &mut Document, path: &str) {
    match path.split_once('.') {
        None => {
            doc.remove(path);
        }
        Some((head, rest)) => {
            if let Some(Json::Object(child)) = doc.get_mut(head) {
                remove_path(child, rest);
            }
        }
    }
}
