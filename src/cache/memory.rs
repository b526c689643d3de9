//! In-process TTL store.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::trace;

use super::{CacheStore, ResponseSnapshot, StoreError, StoreFuture, codec};

struct Entry {
    payload: Bytes,
    expires_at: Instant,
}

/// A [`CacheStore`] backed by a locked `HashMap`.
///
/// Entries are held encoded, exactly as a networked backend would hold them,
/// and expire lazily: an entry is served while `now < stored_at + ttl` and
/// reported as a miss (and dropped) from then on. [`purge_expired`](Self::purge_expired)
/// sweeps everything that has lapsed.
///
/// Like any other store, nothing happens until the returned future is polled.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use replay_cache::cache::{CacheStore, MemoryStore, ResponseSnapshot};
/// use replay_cache::http::{Headers, StatusCode};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let store = MemoryStore::new(Duration::from_secs(60));
/// let snapshot = ResponseSnapshot::new(StatusCode::OK, Headers::new(), "hi");
/// store.set("/greeting", &snapshot, Duration::from_secs(5)).await.unwrap();
///
/// assert_eq!(store.get("/greeting").await.unwrap(), snapshot);
/// assert!(store.get("/other").await.unwrap_err().is_miss());
/// # }
/// ```
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    default_ttl: Duration,
}

impl MemoryStore {
    /// Creates an empty store. `default_ttl` applies to `set` calls made with a
    /// zero TTL.
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            default_ttl,
        }
    }

    /// Number of entries held, including lapsed ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Drops every lapsed entry and returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    fn lookup(&self, key: &str) -> Result<ResponseSnapshot, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.expires_at > now => codec::decode(&entry.payload),
            Some(_) => {
                trace!(key, "memory store entry expired");
                entries.remove(key);
                Err(StoreError::Miss)
            }
            None => Err(StoreError::Miss),
        }
    }

    fn insert(&self, key: &str, snapshot: &ResponseSnapshot, ttl: Duration) -> Result<(), StoreError> {
        let ttl = if ttl.is_zero() { self.default_ttl } else { ttl };
        let payload = codec::encode(snapshot)?;
        self.entries.lock().insert(
            key.to_owned(),
            Entry {
                payload,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }
}

impl CacheStore for MemoryStore {
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ResponseSnapshot> {
        Box::pin(async move { self.lookup(key) })
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        snapshot: &'a ResponseSnapshot,
        ttl: Duration,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move { self.insert(key, snapshot, ttl) })
    }

    fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.entries.lock().remove(key);
            Ok(())
        })
    }
}
