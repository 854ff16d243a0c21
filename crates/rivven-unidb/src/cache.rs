//! Result cache keyed by request fingerprint.
//!
//! Entries expire lazily: a stale entry stays in the map until it is
//! overwritten or the cache is cleared, but [`ResultCache::get`] treats it
//! exactly like a miss. There is no size bound and no invalidation on
//! writes; a read issued after a mutation on the same connection can return
//! the pre-mutation result until the TTL elapses.

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::types::{Query, QueryResult, Value};

/// Deterministic SHA-256 fingerprint of `(connection_id, query, params)`.
///
/// Each component is length-prefixed so that shifting bytes between
/// components cannot produce the same digest. Parameters are encoded with a
/// per-variant tag, so `Int32(1)` and `Int64(1)` differ, and floats by their
/// bit pattern, so NaN and the infinities never share a key.
pub fn fingerprint(connection_id: &str, query: &Query, params: &[Value]) -> String {
    let mut hasher = Sha256::new();

    update_field(&mut hasher, connection_id.as_bytes());
    match query {
        Query::Text(sql) => {
            hasher.update(b"T");
            update_field(&mut hasher, sql.as_bytes());
        }
        Query::Structured(request) => {
            hasher.update(b"S");
            update_field(&mut hasher, request.to_string().as_bytes());
        }
    }
    hasher.update((params.len() as u64).to_be_bytes());
    for param in params {
        update_value(&mut hasher, param);
    }

    hex::encode(hasher.finalize())
}

fn update_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

fn update_value(hasher: &mut Sha256, value: &Value) {
    match value {
        Value::Null => hasher.update([0u8]),
        Value::Bool(b) => hasher.update([1, u8::from(*b)]),
        Value::Int32(n) => {
            hasher.update([2]);
            hasher.update(n.to_be_bytes());
        }
        Value::Int64(n) => {
            hasher.update([3]);
            hasher.update(n.to_be_bytes());
        }
        Value::Float64(n) => {
            hasher.update([4]);
            hasher.update(n.to_bits().to_be_bytes());
        }
        Value::Decimal(d) => {
            hasher.update([5]);
            hasher.update(d.serialize());
        }
        Value::String(s) => {
            hasher.update([6]);
            update_field(hasher, s.as_bytes());
        }
        Value::Bytes(b) => {
            hasher.update([7]);
            update_field(hasher, b);
        }
        Value::Date(d) => {
            hasher.update([8]);
            update_field(hasher, d.to_string().as_bytes());
        }
        Value::DateTime(dt) => {
            hasher.update([9]);
            update_field(hasher, dt.to_string().as_bytes());
        }
        Value::DateTimeTz(dt) => {
            hasher.update([10]);
            update_field(hasher, dt.to_rfc3339().as_bytes());
        }
        Value::Uuid(u) => {
            hasher.update([11]);
            hasher.update(u.as_bytes());
        }
        Value::Json(j) => {
            hasher.update([12]);
            update_field(hasher, j.to_string().as_bytes());
        }
    }
}

struct CacheEntry {
    result: Arc<QueryResult>,
    stored_at: Instant,
}

/// Process-local TTL cache of query results
pub struct ResultCache {
    ttl: Duration,
    entries: DashMap<String, CacheEntry>,
}

impl ResultCache {
    /// Create a cache whose entries are valid for `ttl`
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
        }
    }

    /// Configured time-to-live
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Look up a fresh entry; stale entries count as a miss
    pub fn get(&self, key: &str) -> Option<Arc<QueryResult>> {
        let entry = self.entries.get(key)?;
        if entry.stored_at.elapsed() < self.ttl {
            Some(Arc::clone(&entry.result))
        } else {
            None
        }
    }

    /// Store a result, replacing any previous entry
    pub fn put(&self, key: String, result: Arc<QueryResult>) {
        self.entries.insert(
            key,
            CacheEntry {
                result,
                stored_at: Instant::now(),
            },
        );
    }

    /// Remove every entry
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Number of stored entries, stale ones included
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no entries are stored
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCache")
            .field("ttl", &self.ttl)
            .field("entries", &self.entries.len())
            .finish()
    }
}
