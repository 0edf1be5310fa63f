//! Snapshot query cache
//!
//! Holds the last N results of one kind of snapshot query. An entry is served
//! only while the snapshot version it was computed at is still current and its
//! TTL has not run out.

use std::fmt::Debug;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use tokio::sync::Mutex;
use tracing::trace;

/// A query result stamped with the global snapshot version it was read at
pub trait Versioned {
    fn snapshot_version(&self) -> i64;
}

struct Cached<V> {
    result: Arc<V>,
    stored_at: Instant,
}

pub struct QueryCache<K, V> {
    entries: Mutex<LruCache<K, Cached<V>>>,
    ttl: Duration,
}

impl<K, V> QueryCache<K, V>
where
    K: Hash + Eq + Clone + Debug,
    V: Versioned,
{
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    /// Cached result for `query` if it was computed at `current_version` and is still fresh
    pub async fn get(&self, query: &K, current_version: i64) -> Option<Arc<V>> {
        let mut entries = self.entries.lock().await;
        let valid = entries
            .peek(query)
            .is_some_and(|entry| self.is_live(entry, current_version));
        if !valid {
            if entries.pop(query).is_some() {
                trace!(?query, "Dropped stale cache entry");
            }
            return None;
        }
        entries.get(query).map(|entry| Arc::clone(&entry.result))
    }

    pub async fn put(&self, query: K, result: Arc<V>) {
        self.entries.lock().await.put(
            query,
            Cached {
                result,
                stored_at: Instant::now(),
            },
        );
    }

    /// Drop entries that can no longer be served
    pub async fn purge_expired(&self, current_version: i64) -> usize {
        let mut entries = self.entries.lock().await;
        let stale: Vec<K> = entries
            .iter()
            .filter(|(_, entry)| !self.is_live(entry, current_version))
            .map(|(query, _)| query.clone())
            .collect();
        for query in &stale {
            entries.pop(query);
        }
        stale.len()
    }

    fn is_live(&self, entry: &Cached<V>, current_version: i64) -> bool {
        entry.result.snapshot_version() == current_version && entry.stored_at.elapsed() < self.ttl
    }

    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
