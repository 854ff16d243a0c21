//! MongoDB backend (document-store)

use async_trait::async_trait;
use bson::{doc, Bson};
use futures::TryStreamExt;
use mongodb::options::{ClientOptions, Credential, ServerAddress};
use mongodb::{Client, Collection, Database};
use serde_json::Value as Json;
use std::sync::Arc;
use tracing::debug;

use super::{
    sample_request, Document, DocumentCollection, DocumentDatabase, DocumentHandle, FindOptions,
    UpdateSummary, DEFAULT_DATABASE, KIND,
};
use crate::backend::{BackendAdapter, BackendHandle, BackendKind, CannedRequest};
use crate::config::ConnectionConfig;
use crate::error::{Error, Result};

/// Default server host
pub const DEFAULT_HOST: &str = "localhost";
/// Default server port
pub const DEFAULT_PORT: u16 = 27017;

fn driver_err(e: mongodb::error::Error) -> Error {
    Error::driver(KIND, e)
}

fn to_bson_document(document: &Document) -> Result<bson::Document> {
    bson::to_document(document).map_err(|e| Error::malformed(format!("invalid document: {}", e)))
}

fn to_json(value: Bson) -> Json {
    value.into_relaxed_extjson()
}

fn document_to_json(document: bson::Document) -> Json {
    to_json(Bson::Document(document))
}

/// Build client options; an explicit url wins over individual fields
async fn client_options(config: &ConnectionConfig) -> Result<ClientOptions> {
    if let Some(url) = &config.url {
        return ClientOptions::parse(url)
            .await
            .map_err(|e| Error::connection(KIND, e));
    }

    let mut options = ClientOptions::default();
    options.hosts = vec![ServerAddress::Tcp {
        host: config.host.clone().unwrap_or_else(|| DEFAULT_HOST.into()),
        port: Some(config.port.unwrap_or(DEFAULT_PORT)),
    }];
    if let Some(user) = &config.user {
        options.credential = Some(
            Credential::builder()
                .username(user.clone())
                .password(config.password_secret().map(str::to_string))
                .build(),
        );
    }
    Ok(options)
}

/// Adapter for the document-store backend backed by MongoDB
#[derive(Debug, Default, Clone)]
pub struct MongoAdapter;

impl MongoAdapter {
    /// Create a new MongoDB adapter
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BackendAdapter for MongoAdapter {
    fn kind(&self) -> BackendKind {
        KIND
    }

    async fn connect(&self, config: &ConnectionConfig) -> Result<Arc<dyn BackendHandle>> {
        let options = client_options(config).await?;
        let db_name = config
            .database
            .clone()
            .or_else(|| options.default_database.clone())
            .unwrap_or_else(|| DEFAULT_DATABASE.to_string());

        let client = Client::with_options(options).map_err(|e| Error::connection(KIND, e))?;
        let database = client.database(&db_name);

        // the driver connects lazily; ping so handshake failures surface here
        database
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| Error::connection(KIND, e))?;

        debug!(database = %db_name, "connected to mongodb");
        let store = MongoDatabase { client, database };
        Ok(Arc::new(DocumentHandle::new(Arc::new(store))))
    }

    fn list_tables_request(&self) -> CannedRequest {
        CannedRequest::ListCollections
    }

    fn table_schema_request(&self, table: &str) -> Result<CannedRequest> {
        Ok(sample_request(table))
    }
}

struct MongoDatabase {
    client: Client,
    database: Database,
}

#[async_trait]
impl DocumentDatabase for MongoDatabase {
    fn collection(&self, name: &str) -> Arc<dyn DocumentCollection> {
        Arc::new(MongoCollection {
            inner: self.database.collection::<bson::Document>(name),
        })
    }

    async fn list_collection_names(&self) -> Result<Vec<String>> {
        self.database
            .list_collection_names()
            .await
            .map_err(driver_err)
    }

    async fn ping(&self) -> Result<()> {
        self.database
            .run_command(doc! { "ping": 1 })
            .await
            .map(|_| ())
            .map_err(driver_err)
    }

    async fn shutdown(&self) -> Result<()> {
        self.client.clone().shutdown().await;
        Ok(())
    }
}

struct MongoCollection {
    inner: Collection<bson::Document>,
}

#[async_trait]
impl DocumentCollection for MongoCollection {
    async fn find(&self, filter: &Document, options: &FindOptions) -> Result<Vec<Json>> {
        let mut action = self.inner.find(to_bson_document(filter)?);
        if let Some(limit) = options.limit {
            action = action.limit(i64::try_from(limit).unwrap_or(i64::MAX));
        }
        if let Some(skip) = options.skip {
            action = action.skip(skip);
        }
        if let Some(sort) = &options.sort {
            action = action.sort(to_bson_document(sort)?);
        }
        if let Some(projection) = &options.projection {
            action = action.projection(to_bson_document(projection)?);
        }

        let docs: Vec<bson::Document> = action
            .await
            .map_err(driver_err)?
            .try_collect()
            .await
            .map_err(driver_err)?;
        Ok(docs.into_iter().map(document_to_json).collect())
    }

    async fn find_one(&self, filter: &Document, options: &FindOptions) -> Result<Option<Json>> {
        let mut action = self.inner.find_one(to_bson_document(filter)?);
        if let Some(skip) = options.skip {
            action = action.skip(skip);
        }
        if let Some(sort) = &options.sort {
            action = action.sort(to_bson_document(sort)?);
        }
        if let Some(projection) = &options.projection {
            action = action.projection(to_bson_document(projection)?);
        }

        let found = action.await.map_err(driver_err)?;
        Ok(found.map(document_to_json))
    }

    async fn insert_one(&self, document: Document) -> Result<Json> {
        let result = self
            .inner
            .insert_one(to_bson_document(&document)?)
            .await
            .map_err(driver_err)?;
        Ok(to_json(result.inserted_id))
    }

    async fn insert_many(&self, documents: Vec<Document>) -> Result<Vec<Json>> {
        let docs = documents
            .iter()
            .map(to_bson_document)
            .collect::<Result<Vec<_>>>()?;
        let result = self.inner.insert_many(docs).await.map_err(driver_err)?;

        let mut ids: Vec<(usize, Bson)> = result.inserted_ids.into_iter().collect();
        ids.sort_by_key(|(index, _)| *index);
        Ok(ids.into_iter().map(|(_, id)| to_json(id)).collect())
    }

    async fn update(
        &self,
        filter: &Document,
        update: &Document,
        many: bool,
        upsert: bool,
    ) -> Result<UpdateSummary> {
        let filter = to_bson_document(filter)?;
        let update = to_bson_document(update)?;
        let result = if many {
            self.inner.update_many(filter, update).upsert(upsert).await
        } else {
            self.inner.update_one(filter, update).upsert(upsert).await
        }
        .map_err(driver_err)?;

        Ok(UpdateSummary {
            matched: result.matched_count,
            modified: result.modified_count,
            upserted_id: result.upserted_id.map(to_json),
        })
    }

    async fn delete(&self, filter: &Document, many: bool) -> Result<u64> {
        let filter = to_bson_document(filter)?;
        let result = if many {
            self.inner.delete_many(filter).await
        } else {
            self.inner.delete_one(filter).await
        }
        .map_err(driver_err)?;
        Ok(result.deleted_count)
    }

    async fn aggregate(&self, pipeline: &[Document]) -> Result<Vec<Json>> {
        let stages = pipeline
            .iter()
            .map(to_bson_document)
            .collect::<Result<Vec<_>>>()?;
        let docs: Vec<bson::Document> = self
            .inner
            .aggregate(stages)
            .await
            .map_err(driver_err)?
            .try_collect()
            .await
            .map_err(driver_err)?;
        Ok(docs.into_iter().map(document_to_json).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_default_client_options() {
        let options = client_options(&ConnectionConfig::new()).await.unwrap();
        assert_eq!(
            options.hosts,
            vec![ServerAddress::Tcp {
                host: DEFAULT_HOST.into(),
                port: Some(DEFAULT_PORT),
            }]
        );
        assert!(options.credential.is_none());
    }

    #[test]
    fn test_json_bson_conversion() {
        let doc = json!({ "name": "ada", "age": 36, "tags": ["a"] });
        let converted = to_bson_document(doc.as_object().unwrap()).unwrap();
        assert_eq!(converted.get_str("name").unwrap(), "ada");
        assert_eq!(document_to_json(converted), doc);
    }

    #[test]
    fn test_introspection_templates() {
        let adapter = MongoAdapter::new();
        assert_eq!(adapter.list_tables_request(), CannedRequest::ListCollections);
        assert_eq!(
            adapter.table_schema_request("users").unwrap(),
            sample_request("users")
        );
    }
}
