//! Dispatcher: the public entry point of rivven-unidb
//!
//! Owns the connection registry, the result cache and the adapter set, and
//! routes every call through them:
//!
//! ```text
//! query(id, q, params)
//!   -> registry lookup            (ConnectionNotFound)
//!   -> request pre-validation     (MalformedRequest / UnsupportedOperation, never retried)
//!   -> cache check                (hit: touch + return)
//!   -> retry(handle.execute)      (per-connection lock held per attempt)
//!   -> cache store + touch
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use rivven_unidb::prelude::*;
//!
//! let dispatcher = Dispatcher::builder()
//!     .config(DispatcherConfig::default().with_cache(true))
//!     .build()?;
//!
//! let id = dispatcher.connect("sqlite", ConnectionConfig::new(), None).await?;
//! dispatcher.query(&id, "CREATE TABLE t (x INTEGER)", &[], QueryOptions::default()).await?;
//! let rows = dispatcher.query(&id, "SELECT * FROM t", &[], QueryOptions::default()).await?;
//! dispatcher.disconnect(&id).await?;
//! ```

use futures::future::join_all;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::backend::{AdapterSet, BackendAdapter, BackendKind, CannedRequest};
use crate::cache::{fingerprint, ResultCache};
use crate::config::{ConnectionConfig, DispatcherConfig};
use crate::document::DocumentRequest;
use crate::error::{Error, Result};
use crate::registry::{ConnectionRecord, ConnectionRegistry, ConnectionSummary};
use crate::retry::{run_with_retry, NoopObserver, RetryEvent, RetryObserver};
use crate::types::{Query, QueryResult, Value};

/// Per-call query options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryOptions {
    /// `Some(false)` bypasses the cache for this call; `None` follows the
    /// dispatcher configuration
    pub cache: Option<bool>,
}

impl QueryOptions {
    /// Options that bypass the cache
    pub fn no_cache() -> Self {
        Self { cache: Some(false) }
    }
}

/// Point-in-time dispatcher statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherStats {
    /// Successful queries, cache hits included
    pub queries: u64,
    /// Queries answered from the cache
    pub cache_hits: u64,
    /// Cacheable queries that had to reach the backend
    pub cache_misses: u64,
    /// Retries scheduled by the retry executor
    pub retries: u64,
    /// Queries that failed after all attempts
    pub failures: u64,
    /// Connections opened
    pub connections_opened: u64,
    /// Connections closed
    pub connections_closed: u64,
    /// Connections currently registered
    pub active_connections: usize,
}

#[derive(Debug, Default)]
struct AtomicDispatcherStats {
    queries: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    retries: AtomicU64,
    failures: AtomicU64,
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
}

impl AtomicDispatcherStats {
    fn record(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self, active_connections: usize) -> DispatcherStats {
        DispatcherStats {
            queries: self.queries.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            active_connections,
        }
    }
}

/// Forwards retry events to the caller's observer and counts them
struct CountingObserver<'a> {
    inner: &'a dyn RetryObserver,
    stats: &'a AtomicDispatcherStats,
    connection_id: &'a str,
}

impl RetryObserver for CountingObserver<'_> {
    fn on_retry(&self, event: &RetryEvent<'_>) {
        AtomicDispatcherStats::record(&self.stats.retries);
        debug!(
            connection_id = %self.connection_id,
            attempt = event.attempt,
            "retry scheduled"
        );
        self.inner.on_retry(event);
    }
}

/// Unified connection, query and introspection API over every backend kind
pub struct Dispatcher {
    config: DispatcherConfig,
    adapters: AdapterSet,
    registry: ConnectionRegistry,
    cache: ResultCache,
    observer: Arc<dyn RetryObserver>,
    stats: AtomicDispatcherStats,
}

impl Dispatcher {
    /// Create a dispatcher from a validated configuration
    pub fn new(config: DispatcherConfig, adapters: AdapterSet) -> Result<Self> {
        Self::with_observer(config, adapters, Arc::new(NoopObserver))
    }

    /// Start building a dispatcher
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::default()
    }

    fn with_observer(
        config: DispatcherConfig,
        adapters: AdapterSet,
        observer: Arc<dyn RetryObserver>,
    ) -> Result<Self> {
        config.validate_config()?;
        Ok(Self {
            registry: ConnectionRegistry::new(config.max_connections),
            cache: ResultCache::new(config.cache_ttl),
            config,
            adapters,
            observer,
            stats: AtomicDispatcherStats::default(),
        })
    }

    /// Active configuration
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Kinds with a registered adapter
    pub fn backends(&self) -> Vec<BackendKind> {
        self.adapters.kinds()
    }

    /// Open a connection and register it.
    ///
    /// `backend` accepts canonical kind names and common aliases (`sqlite`,
    /// `mysql`, `postgres`, `mongodb`). Returns the connection id, generated
    /// when `id` is `None`.
    pub async fn connect(
        &self,
        backend: &str,
        config: ConnectionConfig,
        id: Option<&str>,
    ) -> Result<String> {
        let kind: BackendKind = backend.parse()?;
        let adapter = self
            .adapters
            .get(kind)
            .cloned()
            .ok_or_else(|| Error::unsupported_backend(backend))?;

        let reservation = self.registry.reserve(kind, id)?;
        let handle = match adapter.connect(&config).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(backend = %kind, error = %e, "connection failed");
                return Err(e);
            }
        };

        let record = reservation.commit(config, handle);
        AtomicDispatcherStats::record(&self.stats.connections_opened);
        info!(connection_id = %record.id(), backend = %kind, "connection opened");
        Ok(record.id().to_string())
    }

    /// Run a query on a registered connection.
    ///
    /// Results are shared: a cache hit returns the same `Arc` that was stored.
    pub async fn query(
        &self,
        id: &str,
        query: impl Into<Query>,
        params: &[Value],
        options: QueryOptions,
    ) -> Result<Arc<QueryResult>> {
        let query = query.into();
        let record = self.registry.lookup(id)?;
        validate_request(record.backend_kind(), &query)?;

        let use_cache = self.config.cache_enabled && options.cache != Some(false);
        let key = use_cache.then(|| fingerprint(id, &query, params));

        if let Some(key) = &key {
            if let Some(hit) = self.cache.get(key) {
                AtomicDispatcherStats::record(&self.stats.cache_hits);
                debug!(connection_id = %id, "cache hit");
                self.record_success(id);
                return Ok(hit);
            }
            AtomicDispatcherStats::record(&self.stats.cache_misses);
            debug!(connection_id = %id, "cache miss");
        }

        let request = &query;
        let result = self
            .execute_with_retry(&record, move |record| async move {
                record.handle().execute(request, params).await
            })
            .await?;

        let result = Arc::new(result);
        if let Some(key) = key {
            self.cache.put(key, Arc::clone(&result));
        }
        self.record_success(id);
        Ok(result)
    }

    async fn execute_with_retry<'r, F, Fut>(
        &self,
        record: &'r Arc<ConnectionRecord>,
        operation: F,
    ) -> Result<QueryResult>
    where
        F: Fn(&'r ConnectionRecord) -> Fut,
        Fut: std::future::Future<Output = Result<QueryResult>>,
    {
        let observer = CountingObserver {
            inner: self.observer.as_ref(),
            stats: &self.stats,
            connection_id: record.id(),
        };
        let serialize = self.config.serialize_per_connection;
        let operation = &operation;
        let record: &'r ConnectionRecord = record;

        let outcome = run_with_retry(&self.config.retry, &observer, move || async move {
            let _guard = if serialize {
                Some(record.exec_lock().lock().await)
            } else {
                None
            };
            operation(record).await
        })
        .await;

        if let Err(e) = &outcome {
            AtomicDispatcherStats::record(&self.stats.failures);
            error!(
                connection_id = %record.id(),
                backend = %record.backend_kind(),
                error = %e,
                "query failed"
            );
        }
        outcome
    }

    fn record_success(&self, id: &str) {
        self.registry.touch(id);
        AtomicDispatcherStats::record(&self.stats.queries);
    }

    /// Remove a connection and close its handle.
    ///
    /// The record is removed before the close is attempted, so a failed
    /// close still leaves the id unregistered. Unknown ids are a no-op.
    pub async fn disconnect(&self, id: &str) -> Result<()> {
        match self.registry.remove(id) {
            Some(record) => self.close_record(&record).await,
            None => {
                debug!(connection_id = %id, "disconnect of unknown connection ignored");
                Ok(())
            }
        }
    }

    async fn close_record(&self, record: &ConnectionRecord) -> Result<()> {
        let _guard = if self.config.serialize_per_connection {
            Some(record.exec_lock().lock().await)
        } else {
            None
        };
        AtomicDispatcherStats::record(&self.stats.connections_closed);

        match record.handle().close().await {
            Ok(()) => {
                info!(
                    connection_id = %record.id(),
                    backend = %record.backend_kind(),
                    "connection closed"
                );
                Ok(())
            }
            Err(e) => {
                warn!(
                    connection_id = %record.id(),
                    backend = %record.backend_kind(),
                    error = %e,
                    "failed to close connection"
                );
                Err(e)
            }
        }
    }

    /// Disconnect every connection.
    ///
    /// The registry is emptied regardless of close failures; failures are
    /// returned as `(connection_id, error)` pairs.
    pub async fn disconnect_all(&self) -> Vec<(String, Error)> {
        let records = self.registry.drain();
        let outcomes = join_all(records.iter().map(|record| async move {
            (record.id().to_string(), self.close_record(record).await)
        }))
        .await;

        outcomes
            .into_iter()
            .filter_map(|(id, outcome)| outcome.err().map(|e| (id, e)))
            .collect()
    }

    /// Disconnect everything and clear the cache
    pub async fn close(&self) -> Vec<(String, Error)> {
        let failures = self.disconnect_all().await;
        self.cache.clear();
        failures
    }

    /// Snapshot of every registered connection
    pub fn list_connections(&self) -> Vec<ConnectionSummary> {
        self.registry.list()
    }

    /// Snapshot of one connection
    pub fn connection_info(&self, id: &str) -> Option<ConnectionSummary> {
        self.registry.lookup(id).ok().map(|record| record.summary())
    }

    /// Drop every cached result
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Tables (or collections) visible on a connection
    pub async fn list_tables(&self, id: &str) -> Result<Arc<QueryResult>> {
        let (record, adapter) = self.record_and_adapter(id)?;
        self.run_canned(&record, adapter.list_tables_request()).await
    }

    /// Column description of a table, or one sample document of a collection
    pub async fn table_schema(&self, id: &str, table: &str) -> Result<Arc<QueryResult>> {
        let (record, adapter) = self.record_and_adapter(id)?;
        let request = adapter.table_schema_request(table)?;
        self.run_canned(&record, request).await
    }

    fn record_and_adapter(
        &self,
        id: &str,
    ) -> Result<(Arc<ConnectionRecord>, Arc<dyn BackendAdapter>)> {
        let record = self.registry.lookup(id)?;
        let adapter = self
            .adapters
            .get(record.backend_kind())
            .cloned()
            .ok_or_else(|| Error::unsupported_backend(record.backend_kind().as_str()))?;
        Ok((record, adapter))
    }

    async fn run_canned(
        &self,
        record: &Arc<ConnectionRecord>,
        request: CannedRequest,
    ) -> Result<Arc<QueryResult>> {
        match request {
            CannedRequest::Query { query, params } => {
                self.query(record.id(), query, &params, QueryOptions::default())
                    .await
            }
            CannedRequest::ListCollections => {
                let result = self
                    .execute_with_retry(record, |record| async move {
                        record.handle().list_collections().await
                    })
                    .await?;
                self.record_success(record.id());
                Ok(Arc::new(result))
            }
        }
    }

    /// Whether the backend still answers on this connection
    pub async fn health_check(&self, id: &str) -> Result<bool> {
        let record = self.registry.lookup(id)?;
        let _guard = if self.config.serialize_per_connection {
            Some(record.exec_lock().lock().await)
        } else {
            None
        };
        let healthy = record.handle().is_valid().await;
        if !healthy {
            warn!(connection_id = %id, backend = %record.backend_kind(), "health check failed");
        }
        Ok(healthy)
    }

    /// Counters since the dispatcher was created
    pub fn stats(&self) -> DispatcherStats {
        self.stats.snapshot(self.registry.len())
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.config)
            .field("adapters", &self.adapters)
            .field("registry", &self.registry)
            .field("cache", &self.cache)
            .finish()
    }
}

/// Reject requests whose shape cannot suit the backend, before any retry
fn validate_request(kind: BackendKind, query: &Query) -> Result<()> {
    match (kind, query) {
        (BackendKind::DocumentStore, _) => DocumentRequest::from_query(query).map(|_| ()),
        (_, Query::Text(_)) => Ok(()),
        (_, Query::Structured(_)) => Err(Error::malformed(format!(
            "{kind} expects SQL text, got a structured request"
        ))),
    }
}

/// Builder for [`Dispatcher`]
#[derive(Default)]
pub struct DispatcherBuilder {
    config: DispatcherConfig,
    adapters: Option<AdapterSet>,
    observer: Option<Arc<dyn RetryObserver>>,
}

impl DispatcherBuilder {
    /// Set the configuration
    pub fn config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the adapter set (defaults to [`AdapterSet::with_defaults`])
    pub fn adapters(mut self, adapters: AdapterSet) -> Self {
        self.adapters = Some(adapters);
        self
    }

    /// Register one adapter on top of the current set
    pub fn adapter(mut self, adapter: impl BackendAdapter + 'static) -> Self {
        let set = self.adapters.take().unwrap_or_else(AdapterSet::with_defaults);
        self.adapters = Some(set.with(adapter));
        self
    }

    /// Observe every scheduled retry
    pub fn on_retry<F>(mut self, observer: F) -> Self
    where
        F: Fn(&RetryEvent<'_>) + Send + Sync + 'static,
    {
        self.observer = Some(Arc::new(observer));
        self
    }

    /// Observe retries through a shared observer
    pub fn retry_observer(mut self, observer: Arc<dyn RetryObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Validate the configuration and build the dispatcher
    pub fn build(self) -> Result<Dispatcher> {
        Dispatcher::with_observer(
            self.config,
            self.adapters.unwrap_or_else(AdapterSet::with_defaults),
            self.observer.unwrap_or_else(|| Arc::new(NoopObserver)),
        )
    }
}

impl std::fmt::Debug for DispatcherBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatcherBuilder")
            .field("config", &self.config)
            .field("adapters", &self.adapters)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}
