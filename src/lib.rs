//! # replay-cache
//!
//! A cache-aside response cache for async HTTP middleware pipelines.
//!
//! Requests whose key already has a stored response are answered from the
//! store without running downstream. Concurrent misses for the same key run
//! downstream once and share the result. Successful responses are captured as
//! they stream to the client and stored with a TTL.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use replay_cache::cache::{CacheLayer, MemoryStore};
//! use replay_cache::middleware::{Next, from_middleware, handler};
//! use replay_cache::{Method, Request, Response, StatusCode, context::Context};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let store = Arc::new(MemoryStore::new(Duration::from_secs(300)));
//! let cache = CacheLayer::builder(store, Duration::from_secs(60))
//!     .exclude_header("Set-Cookie")
//!     .build();
//!
//! let app = vec![
//!     from_middleware(Arc::new(cache)),
//!     handler(|ctx: Context| async move {
//!         Response::new(StatusCode::OK).body(format!("rendered {}", ctx.request().path()))
//!     }),
//! ];
//!
//! for _ in 0..2 {
//!     let ctx = Context::new(Request::new(Method::Get, "/home"));
//!     let response = Next::new(app.clone()).run(ctx).await;
//!     assert_eq!(response.collect().await.unwrap().as_ref(), b"rendered /home");
//! }
//! # }
//! ```

// ── Host surface ──────────────────────────────────────────────────────────────
pub mod context;
pub mod http;
pub mod middleware;

// ── Response cache ────────────────────────────────────────────────────────────
pub mod cache;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use cache::{CacheLayer, CacheStore, KeyStrategy, MemoryStore, ResponseSnapshot};
pub use http::{Headers, Method, Request, Response, StatusCode};
