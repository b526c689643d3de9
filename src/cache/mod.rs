//! Cache-aside response caching.
//!
//! [`CacheLayer`] is a [`Middleware`](crate::middleware::Middleware) that
//! replays stored responses, deduplicates concurrent misses for the same key
//! and stores successful responses as they stream to the client.
//!
//! ## Pieces
//!
//! - [`KeyStrategy`] / [`CacheStrategy`] decide whether and under which key a
//!   request is cached.
//! - [`CacheStore`] is the storage port; [`MemoryStore`] is the in-process
//!   backend, and [`codec`] is the byte format for backends holding opaque
//!   values.
//! - [`ResponseCapture`] copies a response on its way out.
//! - [`DedupCoordinator`] runs one execution per key at a time.

pub mod codec;
mod capture;
mod dedup;
mod error;
mod key;
mod layer;
mod memory;
mod snapshot;
mod store;

pub use capture::{CaptureHandle, Captured, ResponseCapture};
pub use dedup::{DedupCoordinator, Follower, Leader, Role};
pub use error::{CaptureError, DedupError, KeyError, StoreError};
pub use key::{CacheStrategy, KeyFn, KeyStrategy, normalize_query_order};
pub use layer::{
    CacheLayer, CacheLayerBuilder, CacheOptions, Observer, ReplayObserver, StrategyKind,
};
pub use memory::MemoryStore;
pub use snapshot::ResponseSnapshot;
pub use store::{CacheStore, StoreFuture};
