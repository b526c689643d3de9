//! The storage port the cache layer reads from and writes to.

use std::{future::Future, pin::Pin, time::Duration};

use super::{ResponseSnapshot, StoreError};

/// Boxed future returned by [`CacheStore`] operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// A key/value store with per-entry TTL.
///
/// Backends (in-process maps, networked caches) implement this port; the
/// layer only ever calls these three operations.
///
/// # Contract
///
/// - `get` on an absent or expired key **must** fail with [`StoreError::Miss`],
///   never with a backend error, so the layer can tell "not cached" apart from
///   "store is down".
/// - `set` replaces any existing entry and must round-trip the snapshot
///   losslessly, repeated header names included.
/// - `delete` of an absent key succeeds.
/// - The trait is object safe; per-request overrides are handed around as
///   `Arc<dyn CacheStore>`.
pub trait CacheStore: Send + Sync {
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ResponseSnapshot>;

    fn set<'a>(
        &'a self,
        key: &'a str,
        snapshot: &'a ResponseSnapshot,
        ttl: Duration,
    ) -> StoreFuture<'a, ()>;

    fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()>;
}
