//! The cache-aside middleware.
//!
//! Per request: resolve the key, try the store, and on a hit replay the stored
//! snapshot without touching downstream. On a miss, join the key's dedup group.
//! The leader runs downstream with its response captured, stores the snapshot
//! when it is a complete `2xx` that nobody aborted, and hands it to the
//! followers, who replay it as if it were a hit.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use super::{
    CacheStore, CaptureHandle, DedupCoordinator, KeyStrategy, Leader, ResponseCapture,
    ResponseSnapshot, Role, StoreError,
};
use crate::{
    Response,
    context::Context,
    middleware::{Middleware, Next},
};

/// A callback fired with the request context on a cache event.
pub type Observer = Arc<dyn Fn(&Context) + Send + Sync + 'static>;

/// A callback that sees the snapshot about to be replayed to a client.
pub type ReplayObserver = Arc<dyn Fn(&Context, &ResponseSnapshot) + Send + Sync + 'static>;

fn discard() -> Observer {
    Arc::new(|_: &Context| {})
}

fn discard_replay() -> ReplayObserver {
    Arc::new(|_: &Context, _: &ResponseSnapshot| {})
}

/// Built-in key strategies selectable from configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    RequestUri,
    Path,
    NormalizedUri,
    Body,
}

impl From<StrategyKind> for KeyStrategy {
    fn from(kind: StrategyKind) -> Self {
        match kind {
            StrategyKind::RequestUri => Self::RequestUri,
            StrategyKind::Path => Self::Path,
            StrategyKind::NormalizedUri => Self::NormalizedUri,
            StrategyKind::Body => Self::Body,
        }
    }
}

/// Declarative layer settings, for hosts that load configuration with serde.
///
/// ```
/// use replay_cache::cache::{CacheOptions, StrategyKind};
///
/// let options: CacheOptions = serde_json::from_str(
///     r#"{ "ttl_secs": 30, "strategy": "normalized_uri", "exclude_headers": ["Set-Cookie"] }"#,
/// ).unwrap();
/// assert_eq!(options.strategy, StrategyKind::NormalizedUri);
/// assert_eq!(options.forget_after_ms, None);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheOptions {
    /// Default TTL for stored responses.
    pub ttl_secs: u64,
    /// Prepended to every key before the store and dedup table see it.
    pub key_prefix: String,
    /// Dedup forget delay; unset keeps groups until their leader finishes.
    pub forget_after_ms: Option<u64>,
    /// Header names stripped from stored and shared snapshots.
    pub exclude_headers: Vec<String>,
    pub strategy: StrategyKind,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            ttl_secs: 60,
            key_prefix: String::new(),
            forget_after_ms: None,
            exclude_headers: Vec::new(),
            strategy: StrategyKind::default(),
        }
    }
}

struct LayerInner {
    store: Arc<dyn CacheStore>,
    ttl: Duration,
    strategy: KeyStrategy,
    prefix: String,
    dedup: DedupCoordinator,
    excluded: Vec<String>,
    on_hit: Observer,
    on_miss: Observer,
    on_share: Observer,
    before_replay: ReplayObserver,
}

/// Cache-aside middleware with singleflight deduplication of misses.
///
/// Every request fires exactly one of the `on_hit`, `on_miss` or `on_share`
/// observers, unless its strategy skips caching, in which case none fire.
/// Store failures are logged and treated as misses; they never change the
/// response the client sees.
///
/// A replayed response (hit or shared) is a fresh [`Response`] carrying exactly
/// the captured status, headers and body. Middleware outside the layer sees it
/// on the way back out like any other response; use
/// [`Response::set_header`] there to overwrite a captured header rather than
/// [`Response::add_header`], which would add a second value.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
/// use replay_cache::cache::{CacheLayer, KeyStrategy, MemoryStore};
/// use replay_cache::middleware::{Next, from_middleware, handler};
/// use replay_cache::{Method, Request, Response, StatusCode, context::Context};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let layer = CacheLayer::builder(Arc::new(MemoryStore::new(Duration::from_secs(60))), Duration::from_secs(30))
///     .strategy(KeyStrategy::NormalizedUri)
///     .key_prefix("api:")
///     .build();
///
/// let app = vec![
///     from_middleware(Arc::new(layer)),
///     handler(|_ctx| async { Response::new(StatusCode::OK).body("expensive") }),
/// ];
/// let ctx = Context::new(Request::new(Method::Get, "/report?b=2&a=1"));
/// let response = Next::new(app).run(ctx).await;
/// assert_eq!(response.collect().await.unwrap().as_ref(), b"expensive");
/// # }
/// ```
#[derive(Clone)]
pub struct CacheLayer {
    inner: Arc<LayerInner>,
}

impl CacheLayer {
    /// Starts a builder over `store` with `ttl` as the default entry lifetime.
    pub fn builder(store: Arc<dyn CacheStore>, ttl: Duration) -> CacheLayerBuilder {
        CacheLayerBuilder {
            store,
            ttl,
            strategy: KeyStrategy::default(),
            prefix: String::new(),
            forget_after: None,
            excluded: Vec::new(),
            on_hit: None,
            on_miss: None,
            on_share: None,
            before_replay: None,
        }
    }

    /// Builds a layer from declarative options.
    pub fn from_options(store: Arc<dyn CacheStore>, options: CacheOptions) -> Self {
        let mut builder = Self::builder(store, Duration::from_secs(options.ttl_secs))
            .strategy(options.strategy.into())
            .key_prefix(options.key_prefix);
        if let Some(ms) = options.forget_after_ms {
            builder = builder.forget_after(Duration::from_millis(ms));
        }
        for name in options.exclude_headers {
            builder = builder.exclude_header(name);
        }
        builder.build()
    }

    /// Removes the entry stored under `key` from the default store.
    ///
    /// The configured prefix is applied, so pass the key as the strategy
    /// produces it.
    ///
    /// # Errors
    ///
    /// Propagates the store's error; deleting an absent key succeeds.
    pub async fn invalidate(&self, key: &str) -> Result<(), StoreError> {
        let key = self.inner.prefixed(key);
        self.inner.store.delete(&key).await?;
        debug!(key = %key, "cache entry invalidated");
        Ok(())
    }

    /// Number of keys whose leader is still running.
    pub fn in_flight(&self) -> usize {
        self.inner.dedup.in_flight()
    }
}

impl Middleware for CacheLayer {
    fn handle(&self, ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        Box::pin(Arc::clone(&self.inner).serve(ctx, next))
    }
}

impl LayerInner {
    fn prefixed(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }

    fn replay(&self, ctx: &Context, snapshot: &ResponseSnapshot) -> Response {
        (self.before_replay)(ctx, snapshot);
        snapshot.to_response()
    }

    async fn serve(self: Arc<Self>, ctx: Context, next: Next) -> Response {
        let decision = self.strategy.resolve(&ctx);
        if !decision.is_cacheable() {
            debug!(path = ctx.request().path(), "request not cacheable, passing through");
            return next.run(ctx).await;
        }

        let key = self.prefixed(decision.key());
        let store = decision
            .store()
            .map_or_else(|| Arc::clone(&self.store), Arc::clone);
        let ttl = decision.ttl().unwrap_or(self.ttl);

        match store.get(&key).await {
            Ok(snapshot) => {
                debug!(key = %key, "cache hit");
                (self.on_hit)(&ctx);
                return self.replay(&ctx, &snapshot);
            }
            Err(StoreError::Miss) => {}
            Err(e) => warn!(key = %key, error = %e, "cache lookup failed, treating as miss"),
        }

        match self.dedup.join(&key) {
            Role::Leader(leader) => {
                // Another leader may have stored the key between our lookup and
                // the join.
                if let Ok(snapshot) = store.get(&key).await {
                    debug!(key = %key, "cache filled while joining");
                    (self.on_hit)(&ctx);
                    let response = self.replay(&ctx, &snapshot);
                    leader.publish(snapshot);
                    return response;
                }

                debug!(key = %key, "cache miss, executing downstream");
                (self.on_miss)(&ctx);
                self.lead(leader, store, ttl, ctx, next).await
            }
            Role::Follower(follower) => match follower.wait().await {
                Ok(snapshot) => {
                    debug!(key = %key, "sharing in-flight response");
                    (self.on_share)(&ctx);
                    self.replay(&ctx, &snapshot)
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "dedup leader gone, executing downstream directly");
                    (self.on_miss)(&ctx);
                    next.run(ctx).await
                }
            },
        }
    }

    async fn lead(
        self: Arc<Self>,
        leader: Leader,
        store: Arc<dyn CacheStore>,
        ttl: Duration,
        ctx: Context,
        next: Next,
    ) -> Response {
        let response = next.run(ctx).await;
        let (response, capture) = ResponseCapture::wrap(response);

        // A streamed body only completes once the host has written it out, so
        // storing waits for it off the request path.
        if capture.is_streaming() {
            tokio::spawn(self.complete(leader, capture, store, ttl));
        } else {
            self.complete(leader, capture, store, ttl).await;
        }
        response
    }

    async fn complete(
        self: Arc<Self>,
        leader: Leader,
        capture: CaptureHandle,
        store: Arc<dyn CacheStore>,
        ttl: Duration,
    ) {
        let captured = match capture.finish().await {
            Ok(captured) => captured,
            Err(e) => {
                warn!(key = %leader.key(), error = %e, "response capture failed, not caching");
                return;
            }
        };

        let storable = captured.is_storable();
        let snapshot = captured.into_snapshot().without_headers(self.excluded.as_slice());

        if storable {
            match store.set(leader.key(), &snapshot, ttl).await {
                Ok(()) => debug!(key = %leader.key(), ttl = ?ttl, "response stored"),
                Err(e) => warn!(key = %leader.key(), error = %e, "cache store failed"),
            }
        } else {
            debug!(key = %leader.key(), status = %snapshot.status(), "response not storable");
        }

        leader.publish(snapshot);
    }
}

/// Configures a [`CacheLayer`].
#[must_use]
pub struct CacheLayerBuilder {
    store: Arc<dyn CacheStore>,
    ttl: Duration,
    strategy: KeyStrategy,
    prefix: String,
    forget_after: Option<Duration>,
    excluded: Vec<String>,
    on_hit: Option<Observer>,
    on_miss: Option<Observer>,
    on_share: Option<Observer>,
    before_replay: Option<ReplayObserver>,
}

impl CacheLayerBuilder {
    /// Sets how requests map to keys. Defaults to [`KeyStrategy::RequestUri`].
    pub fn strategy(mut self, strategy: KeyStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Evicts a dedup group this long after it formed, letting later
    /// arrivals start their own execution instead of queueing behind a slow
    /// leader.
    pub fn forget_after(mut self, delay: Duration) -> Self {
        self.forget_after = Some(delay);
        self
    }

    /// Never persist or share the named header. May be called repeatedly.
    pub fn exclude_header(mut self, name: impl Into<String>) -> Self {
        self.excluded.push(name.into());
        self
    }

    pub fn on_hit<F>(mut self, f: F) -> Self
    where
        F: Fn(&Context) + Send + Sync + 'static,
    {
        self.on_hit = Some(Arc::new(f));
        self
    }

    pub fn on_miss<F>(mut self, f: F) -> Self
    where
        F: Fn(&Context) + Send + Sync + 'static,
    {
        self.on_miss = Some(Arc::new(f));
        self
    }

    pub fn on_share<F>(mut self, f: F) -> Self
    where
        F: Fn(&Context) + Send + Sync + 'static,
    {
        self.on_share = Some(Arc::new(f));
        self
    }

    /// Called with the snapshot right before it is replayed, on hits and on
    /// shared responses alike.
    pub fn on_before_replay<F>(mut self, f: F) -> Self
    where
        F: Fn(&Context, &ResponseSnapshot) + Send + Sync + 'static,
    {
        self.before_replay = Some(Arc::new(f));
        self
    }

    pub fn build(self) -> CacheLayer {
        CacheLayer {
            inner: Arc::new(LayerInner {
                store: self.store,
                ttl: self.ttl,
                strategy: self.strategy,
                prefix: self.prefix,
                dedup: DedupCoordinator::new(self.forget_after),
                excluded: self.excluded,
                on_hit: self.on_hit.unwrap_or_else(discard),
                on_miss: self.on_miss.unwrap_or_else(discard),
                on_share: self.on_share.unwrap_or_else(discard),
                before_replay: self.before_replay.unwrap_or_else(discard_replay),
            }),
        }
    }
}
