//! Cache-key derivation.
//!
//! A [`KeyStrategy`] is chosen once when the layer is built and turns every
//! request into a [`CacheStrategy`]: whether to cache at all, under which key,
//! and optional per-request store/TTL overrides.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::warn;
use url::form_urlencoded;

use super::{CacheStore, KeyError};
use crate::{Request, context::Context};

/// Caller-supplied key function used by [`KeyStrategy::Custom`].
pub type KeyFn = Arc<dyn Fn(&Context) -> CacheStrategy + Send + Sync + 'static>;

/// The per-request caching decision.
///
/// Built by a [`KeyStrategy`]; immutable once returned.
#[derive(Clone)]
pub struct CacheStrategy {
    cacheable: bool,
    key: String,
    store: Option<Arc<dyn CacheStore>>,
    ttl: Option<Duration>,
}

impl CacheStrategy {
    /// Cache the response under `key`.
    pub fn cache(key: impl Into<String>) -> Self {
        Self {
            cacheable: true,
            key: key.into(),
            store: None,
            ttl: None,
        }
    }

    /// Bypass the cache for this request entirely.
    pub fn skip() -> Self {
        Self {
            cacheable: false,
            key: String::new(),
            store: None,
            ttl: None,
        }
    }

    /// Use `store` instead of the layer's default store for this request.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use `ttl` instead of the layer's default TTL. A zero TTL is ignored.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl).filter(|ttl| !ttl.is_zero());
        self
    }

    pub fn is_cacheable(&self) -> bool {
        self.cacheable
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn store(&self) -> Option<&Arc<dyn CacheStore>> {
        self.store.as_ref()
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }
}

impl fmt::Debug for CacheStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheStrategy")
            .field("cacheable", &self.cacheable)
            .field("key", &self.key)
            .field("store_override", &self.store.is_some())
            .field("ttl", &self.ttl)
            .finish()
    }
}

/// How a request maps to a cache key.
///
/// # Examples
///
/// ```
/// use replay_cache::cache::KeyStrategy;
/// use replay_cache::{Method, Request, context::Context};
///
/// let a = Context::new(Request::new(Method::Get, "/x?b=2&a=1"));
/// let b = Context::new(Request::new(Method::Get, "/x?a=1&b=2"));
///
/// let strategy = KeyStrategy::NormalizedUri;
/// assert_eq!(strategy.resolve(&a).key(), strategy.resolve(&b).key());
/// assert_eq!(KeyStrategy::Path.resolve(&a).key(), "/x");
/// ```
#[derive(Clone, Default)]
pub enum KeyStrategy {
    /// The request target verbatim: path plus raw query string.
    #[default]
    RequestUri,
    /// The path alone. Requests differing only by query share one entry.
    Path,
    /// The path plus a canonical query: parameters sorted by name, values of
    /// a repeated parameter sorted. Falls back to the raw target when the
    /// query is malformed.
    NormalizedUri,
    /// The path plus a SHA-256 digest of the request body, for idempotent
    /// POST-style lookups.
    Body,
    /// A caller-supplied function with access to the whole request context.
    Custom(KeyFn),
}

impl KeyStrategy {
    /// Wraps a closure as [`KeyStrategy::Custom`].
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&Context) -> CacheStrategy + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(f))
    }

    /// Derives the caching decision for one request.
    pub fn resolve(&self, ctx: &Context) -> CacheStrategy {
        let request = ctx.request();
        match self {
            Self::RequestUri => CacheStrategy::cache(request.target()),
            Self::Path => CacheStrategy::cache(request.path()),
            Self::NormalizedUri => match normalize_query_order(request.target()) {
                Ok(key) => CacheStrategy::cache(key),
                Err(e) => {
                    warn!(target_uri = request.target(), error = %e, "falling back to raw request target as cache key");
                    CacheStrategy::cache(request.target())
                }
            },
            Self::Body => CacheStrategy::cache(body_key(request)),
            Self::Custom(f) => f(ctx),
        }
    }
}

impl fmt::Debug for KeyStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RequestUri => f.write_str("RequestUri"),
            Self::Path => f.write_str("Path"),
            Self::NormalizedUri => f.write_str("NormalizedUri"),
            Self::Body => f.write_str("Body"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

fn body_key(request: &Request) -> String {
    let digest = Sha256::digest(request.body());
    format!("{}#{}", request.path(), hex::encode(digest))
}

/// Rewrites a request target so that parameter order does not matter.
///
/// Parameters are sorted by name and the values of each repeated parameter are
/// sorted. Names and values are decoded and then re-encoded in one canonical
/// form, so `%41` and `A` agree while an encoded `&` stays part of its value.
/// A target without query parameters comes back as its bare path.
///
/// # Errors
///
/// Returns [`KeyError::MalformedQuery`] for invalid percent escapes or `;`
/// separators.
///
/// ```
/// use replay_cache::cache::normalize_query_order;
///
/// assert_eq!(normalize_query_order("/t?c=3&b=2&a=1").unwrap(), "/t?a=1&b=2&c=3");
/// assert_eq!(normalize_query_order("/t?a=2&a=1").unwrap(), "/t?a=1&a=2");
/// assert!(normalize_query_order("/t?a=%zz").is_err());
/// ```
pub fn normalize_query_order(target: &str) -> Result<String, KeyError> {
    let Some((path, query)) = target.split_once('?') else {
        return Ok(target.to_owned());
    };

    for pair in query.split('&') {
        validate_pair(pair)?;
    }

    let mut params: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in form_urlencoded::parse(query.as_bytes()) {
        params
            .entry(name.into_owned())
            .or_default()
            .push(value.into_owned());
    }

    if params.is_empty() {
        return Ok(path.to_owned());
    }

    let mut query = form_urlencoded::Serializer::new(String::new());
    for (name, values) in &mut params {
        values.sort();
        for value in values.iter() {
            query.append_pair(name, value);
        }
    }

    Ok(format!("{path}?{}", query.finish()))
}

fn validate_pair(pair: &str) -> Result<(), KeyError> {
    if pair.contains(';') {
        return Err(KeyError::MalformedQuery {
            reason: format!("semicolon separator in {pair:?}"),
        });
    }

    let bytes = pair.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let escape = bytes.get(i + 1..i + 3);
            if !escape.is_some_and(|hex| hex.iter().all(u8::is_ascii_hexdigit)) {
                return Err(KeyError::MalformedQuery {
                    reason: format!("invalid percent escape in {pair:?}"),
                });
            }
            i += 3;
        } else {
            i += 1;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Method;

    fn ctx(target: &str) -> Context {
        Context::new(Request::new(Method::Get, target))
    }

    #[test]
    fn request_uri_keeps_query_verbatim() {
        let strategy = KeyStrategy::RequestUri;
        assert_eq!(strategy.resolve(&ctx("/x?b=2&a=1")).key(), "/x?b=2&a=1");
        assert!(strategy.resolve(&ctx("/x")).is_cacheable());
    }

    #[test]
    fn path_collapses_queries() {
        let strategy = KeyStrategy::Path;
        assert_eq!(
            strategy.resolve(&ctx("/cache?uid=u1")).key(),
            strategy.resolve(&ctx("/cache?uid=u2")).key()
        );
    }

    #[test]
    fn normalization_sorts_names_and_values() {
        assert_eq!(normalize_query_order("/test?c=3&b=2&a=1").unwrap(), "/test?a=1&b=2&c=3");
        assert_eq!(normalize_query_order("/test?d=4&e=5").unwrap(), "/test?d=4&e=5");
        assert_eq!(
            normalize_query_order("/x?b=1&a=2&a=1").unwrap(),
            "/x?a=1&a=2&b=1"
        );
    }

    #[test]
    fn normalization_distinguishes_values() {
        let strategy = KeyStrategy::NormalizedUri;
        assert_eq!(
            strategy.resolve(&ctx("/x?b=2&a=1")).key(),
            strategy.resolve(&ctx("/x?a=1&b=2")).key()
        );
        assert_ne!(
            strategy.resolve(&ctx("/x?a=1")).key(),
            strategy.resolve(&ctx("/x?a=2")).key()
        );
    }

    #[test]
    fn normalization_decodes_and_skips_empty_segments() {
        assert_eq!(normalize_query_order("/s?q=a+b&&p=%41").unwrap(), "/s?p=A&q=a+b");
        assert_eq!(normalize_query_order("/s?q=a%20b").unwrap(), "/s?q=a+b");
        assert_eq!(normalize_query_order("/s?flag").unwrap(), "/s?flag=");
    }

    #[test]
    fn empty_query_matches_bare_path() {
        assert_eq!(normalize_query_order("/s").unwrap(), "/s");
        assert_eq!(normalize_query_order("/s?").unwrap(), "/s");
        assert_eq!(normalize_query_order("/s?&&").unwrap(), "/s");
    }

    #[test]
    fn encoded_separators_stay_inside_their_value() {
        let one = normalize_query_order("/s?a=x%26b%3Dy").unwrap();
        let two = normalize_query_order("/s?a=x&b=y").unwrap();
        assert_ne!(one, two);
        assert_eq!(one, "/s?a=x%26b%3Dy");
        assert_eq!(two, "/s?a=x&b=y");
    }

    #[test]
    fn malformed_query_is_rejected() {
        assert!(normalize_query_order("/x?a=%zz").is_err());
        assert!(normalize_query_order("/x?a=%4").is_err());
        assert!(normalize_query_order("/x?a=1;b=2").is_err());
    }

    #[test]
    fn malformed_query_falls_back_to_raw_target() {
        let strategy = KeyStrategy::NormalizedUri;
        let resolved = strategy.resolve(&ctx("/x?b=%zz&a=1"));
        assert!(resolved.is_cacheable());
        assert_eq!(resolved.key(), "/x?b=%zz&a=1");
    }

    #[test]
    fn body_key_follows_payload() {
        let strategy = KeyStrategy::Body;
        let post = |body: &'static str| {
            Context::new(Request::new(Method::Post, "/rpc").with_body(body))
        };
        let a = strategy.resolve(&post(r#"{"id":1}"#));
        let b = strategy.resolve(&post(r#"{"id":1}"#));
        let c = strategy.resolve(&post(r#"{"id":2}"#));
        assert_eq!(a.key(), b.key());
        assert_ne!(a.key(), c.key());
        assert!(a.key().starts_with("/rpc#"));
        assert_eq!(a.key().len(), "/rpc#".len() + 64);
    }

    #[test]
    fn custom_strategy_sees_extensions_and_can_skip() {
        struct User(&'static str);

        let strategy = KeyStrategy::custom(|ctx| match ctx.extensions().get::<User>() {
            Some(user) => CacheStrategy::cache(format!("{}:{}", user.0, ctx.request().path()))
                .with_ttl(Duration::from_secs(30)),
            None => CacheStrategy::skip(),
        });

        let anonymous = strategy.resolve(&ctx("/me"));
        assert!(!anonymous.is_cacheable());

        let mut authed = ctx("/me");
        authed.extensions_mut().insert(User("alice"));
        let resolved = strategy.resolve(&authed);
        assert_eq!(resolved.key(), "alice:/me");
        assert_eq!(resolved.ttl(), Some(Duration::from_secs(30)));
        assert!(resolved.store().is_none());
    }

    #[test]
    fn zero_ttl_override_is_ignored() {
        assert_eq!(CacheStrategy::cache("k").with_ttl(Duration::ZERO).ttl(), None);
    }
}
