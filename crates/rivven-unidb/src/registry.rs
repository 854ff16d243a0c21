//! Connection registry
//!
//! Maps connection ids to live [`ConnectionRecord`]s under a fixed capacity.
//! Admission is two-phase: [`ConnectionRegistry::reserve`] claims a slot
//! (checked against capacity and existing ids) before the handshake, and the
//! returned [`Reservation`] is either committed with the live handle or
//! dropped, which frees the slot. Pending slots count toward capacity but are
//! invisible to lookups and listings.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use crate::backend::{BackendHandle, BackendKind};
use crate::config::ConnectionConfig;
use crate::error::{Error, Result};

/// A registered connection
pub struct ConnectionRecord {
    id: String,
    backend_kind: BackendKind,
    handle: Arc<dyn BackendHandle>,
    config: ConnectionConfig,
    created_at: DateTime<Utc>,
    last_used_at: Mutex<DateTime<Utc>>,
    query_count: AtomicU64,
    exec_lock: tokio::sync::Mutex<()>,
}

impl ConnectionRecord {
    fn new(
        id: String,
        backend_kind: BackendKind,
        config: ConnectionConfig,
        handle: Arc<dyn BackendHandle>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            backend_kind,
            handle,
            config,
            created_at: now,
            last_used_at: Mutex::new(now),
            query_count: AtomicU64::new(0),
            exec_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Connection id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Backend kind
    pub fn backend_kind(&self) -> BackendKind {
        self.backend_kind
    }

    /// Live backend handle
    pub fn handle(&self) -> &Arc<dyn BackendHandle> {
        &self.handle
    }

    /// Configuration the connection was opened with
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Registration time
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Time of the last successful query
    pub fn last_used_at(&self) -> DateTime<Utc> {
        *self.last_used_at.lock()
    }

    /// Number of successful queries
    pub fn query_count(&self) -> u64 {
        self.query_count.load(Ordering::Relaxed)
    }

    /// Per-connection execution lock
    pub(crate) fn exec_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.exec_lock
    }

    fn touch(&self) {
        *self.last_used_at.lock() = Utc::now();
        self.query_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot with credentials redacted
    pub fn summary(&self) -> ConnectionSummary {
        ConnectionSummary {
            id: self.id.clone(),
            backend_kind: self.backend_kind,
            created_at: self.created_at,
            last_used_at: self.last_used_at(),
            query_count: self.query_count(),
            redacted_config: self.config.redacted(),
        }
    }
}

impl std::fmt::Debug for ConnectionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRecord")
            .field("id", &self.id)
            .field("backend_kind", &self.backend_kind)
            .field("created_at", &self.created_at)
            .field("query_count", &self.query_count())
            .finish()
    }
}

/// Public view of a registered connection
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSummary {
    /// Connection id
    pub id: String,
    /// Backend kind
    pub backend_kind: BackendKind,
    /// Registration time
    pub created_at: DateTime<Utc>,
    /// Time of the last successful query
    pub last_used_at: DateTime<Utc>,
    /// Number of successful queries
    pub query_count: u64,
    /// Connection config with every credential redacted
    pub redacted_config: serde_json::Value,
}

enum Slot {
    Pending,
    Live(Arc<ConnectionRecord>),
}

/// Registry of live connections
pub struct ConnectionRegistry {
    max_connections: usize,
    slots: DashMap<String, Slot>,
    // capacity check and insert must be atomic across keys
    admission: Mutex<()>,
    last_id_millis: AtomicI64,
}

impl ConnectionRegistry {
    /// Create a registry admitting at most `max_connections` entries
    pub fn new(max_connections: usize) -> Self {
        Self {
            max_connections,
            slots: DashMap::new(),
            admission: Mutex::new(()),
            last_id_millis: AtomicI64::new(0),
        }
    }

    /// Configured capacity
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Claim a slot for a connection about to be opened.
    ///
    /// Fails with [`Error::CapacityExceeded`] when live plus pending entries
    /// already reach capacity, and with [`Error::DuplicateConnectionId`] when
    /// `id` is taken. A generated id is used when `id` is `None`.
    pub fn reserve(&self, backend_kind: BackendKind, id: Option<&str>) -> Result<Reservation<'_>> {
        if let Some(id) = id {
            if id.trim().is_empty() {
                return Err(Error::config("connection id must not be empty"));
            }
        }

        let _admission = self.admission.lock();
        if self.slots.len() >= self.max_connections {
            return Err(Error::CapacityExceeded {
                max: self.max_connections,
            });
        }

        let id = match id {
            Some(id) if self.slots.contains_key(id) => {
                return Err(Error::DuplicateConnectionId { id: id.to_string() })
            }
            Some(id) => id.to_string(),
            None => loop {
                let candidate = self.generate_id(backend_kind);
                if !self.slots.contains_key(&candidate) {
                    break candidate;
                }
            },
        };

        self.slots.insert(id.clone(), Slot::Pending);
        Ok(Reservation {
            registry: self,
            id,
            backend_kind,
            committed: false,
        })
    }

    /// Register an already-open handle in one step
    pub fn register(
        &self,
        backend_kind: BackendKind,
        config: ConnectionConfig,
        handle: Arc<dyn BackendHandle>,
        id: Option<&str>,
    ) -> Result<Arc<ConnectionRecord>> {
        Ok(self.reserve(backend_kind, id)?.commit(config, handle))
    }

    /// `{kind}-{millis}-{suffix}` with millis strictly increasing per registry
    fn generate_id(&self, backend_kind: BackendKind) -> String {
        let now = Utc::now().timestamp_millis();
        let mut last = self.last_id_millis.load(Ordering::Relaxed);
        let millis = loop {
            let next = now.max(last + 1);
            match self.last_id_millis.compare_exchange_weak(
                last,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break next,
                Err(actual) => last = actual,
            }
        };

        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("{}-{}-{}", backend_kind, millis, &suffix[..8])
    }

    /// Live record for `id`
    pub fn lookup(&self, id: &str) -> Result<Arc<ConnectionRecord>> {
        match self.slots.get(id).as_deref() {
            Some(Slot::Live(record)) => Ok(Arc::clone(record)),
            _ => Err(Error::not_found(id)),
        }
    }

    /// Whether a live record exists for `id`
    pub fn contains(&self, id: &str) -> bool {
        self.lookup(id).is_ok()
    }

    /// Record a successful query; no-op for unknown ids
    pub fn touch(&self, id: &str) {
        if let Some(Slot::Live(record)) = self.slots.get(id).as_deref() {
            record.touch();
        }
    }

    /// Remove a live record; pending slots are left alone
    pub fn remove(&self, id: &str) -> Option<Arc<ConnectionRecord>> {
        self.slots
            .remove_if(id, |_, slot| matches!(slot, Slot::Live(_)))
            .and_then(|(_, slot)| match slot {
                Slot::Live(record) => Some(record),
                Slot::Pending => None,
            })
    }

    /// Remove every live record, returning them
    pub fn drain(&self) -> Vec<Arc<ConnectionRecord>> {
        self.ids()
            .into_iter()
            .filter_map(|id| self.remove(&id))
            .collect()
    }

    /// Snapshot of live connections ordered by creation time
    pub fn list(&self) -> Vec<ConnectionSummary> {
        let mut summaries: Vec<_> = self
            .records()
            .iter()
            .map(|record| record.summary())
            .collect();
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        summaries
    }

    /// Ids of live connections, sorted
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .slots
            .iter()
            .filter(|entry| matches!(entry.value(), Slot::Live(_)))
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    /// Number of live connections
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|entry| matches!(entry.value(), Slot::Live(_)))
            .count()
    }

    /// Whether no live connections exist
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn records(&self) -> Vec<Arc<ConnectionRecord>> {
        self.slots
            .iter()
            .filter_map(|entry| match entry.value() {
                Slot::Live(record) => Some(Arc::clone(record)),
                Slot::Pending => None,
            })
            .collect()
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("max_connections", &self.max_connections)
            .field("slots", &self.slots.len())
            .finish()
    }
}

/// A claimed registry slot; dropping it without committing frees the slot
#[must_use = "an uncommitted reservation is released on drop"]
pub struct Reservation<'a> {
    registry: &'a ConnectionRegistry,
    id: String,
    backend_kind: BackendKind,
    committed: bool,
}

impl Reservation<'_> {
    /// Reserved id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Fill the slot with a live handle
    pub fn commit(
        mut self,
        config: ConnectionConfig,
        handle: Arc<dyn BackendHandle>,
    ) -> Arc<ConnectionRecord> {
        let record = Arc::new(ConnectionRecord::new(
            self.id.clone(),
            self.backend_kind,
            config,
            handle,
        ));
        self.registry
            .slots
            .insert(self.id.clone(), Slot::Live(Arc::clone(&record)));
        self.committed = true;
        record
    }

    /// Free the slot explicitly
    pub fn release(self) {}
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.registry
                .slots
                .remove_if(&self.id, |_, slot| matches!(slot, Slot::Pending));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Query, QueryResult, Value};
    use async_trait::async_trait;

    struct NullHandle;

    #[async_trait]
    impl BackendHandle for NullHandle {
        async fn execute(&self, _query: &Query, _params: &[Value]) -> Result<QueryResult> {
            Ok(QueryResult::Rows(Vec::new()))
        }

        async fn is_valid(&self) -> bool {
            true
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    fn handle() -> Arc<dyn BackendHandle> {
        Arc::new(NullHandle)
    }

    #[test]
    fn test_capacity_boundary() {
        let registry = ConnectionRegistry::new(2);
        registry
            .register(BackendKind::RelationalFile, ConnectionConfig::new(), handle(), None)
            .unwrap();
        registry
            .register(BackendKind::RelationalFile, ConnectionConfig::new(), handle(), None)
            .unwrap();

        let err = registry
            .register(BackendKind::RelationalFile, ConnectionConfig::new(), handle(), None)
            .unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded { max: 2 }));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_pending_slot_counts_toward_capacity() {
        let registry = ConnectionRegistry::new(1);
        let reservation = registry.reserve(BackendKind::DocumentStore, None).unwrap();

        assert!(registry.lookup(reservation.id()).is_err());
        assert!(registry.list().is_empty());
        assert!(matches!(
            registry.reserve(BackendKind::DocumentStore, None),
            Err(Error::CapacityExceeded { .. })
        ));

        reservation.release();
        assert!(registry.reserve(BackendKind::DocumentStore, None).is_ok());
    }

    #[test]
    fn test_generated_ids_unique_and_shaped() {
        let registry = ConnectionRegistry::new(100);
        let mut ids = Vec::new();
        for _ in 0..50 {
            let record = registry
                .register(BackendKind::RelationalNetworkB, ConnectionConfig::new(), handle(), None)
                .unwrap();
            ids.push(record.id().to_string());
        }

        let mut millis = Vec::new();
        for id in &ids {
            let rest = id.strip_prefix("relational-network-b-").unwrap();
            let (ms, suffix) = rest.split_once('-').unwrap();
            assert_eq!(suffix.len(), 8);
            assert!(suffix
                .chars()
                .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
            millis.push(ms.parse::<i64>().unwrap());
        }
        assert!(millis.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let registry = ConnectionRegistry::new(5);
        registry
            .register(BackendKind::RelationalFile, ConnectionConfig::new(), handle(), Some("main"))
            .unwrap();
        let err = registry
            .register(BackendKind::RelationalFile, ConnectionConfig::new(), handle(), Some("main"))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateConnectionId { ref id } if id == "main"));
    }

    #[test]
    fn test_touch_and_remove() {
        let registry = ConnectionRegistry::new(5);
        let record = registry
            .register(BackendKind::RelationalFile, ConnectionConfig::new(), handle(), Some("a"))
            .unwrap();

        registry.touch("a");
        registry.touch("a");
        registry.touch("missing");
        assert_eq!(record.query_count(), 2);
        assert!(record.last_used_at() >= record.created_at());

        assert!(registry.remove("a").is_some());
        assert!(registry.remove("a").is_none());
        assert!(matches!(registry.lookup("a"), Err(Error::ConnectionNotFound { .. })));
    }

    #[test]
    fn test_summary_redacts_credentials() {
        let registry = ConnectionRegistry::new(5);
        let config = ConnectionConfig::from_url("postgres://app:hunter2@db/shop")
            .with_password("hunter2");
        registry
            .register(BackendKind::RelationalNetworkB, config, handle(), Some("pg"))
            .unwrap();

        let summary = &registry.list()[0];
        let rendered = serde_json::to_string(summary).unwrap();
        assert!(!rendered.contains("hunter2"));
        assert_eq!(summary.redacted_config["password"], crate::security::REDACTED);
        assert!(rendered.contains("queryCount"));
    }
}
