//! Error taxonomy for the cache path.
//!
//! None of these ever reach the client: the layer logs them and falls back to
//! running the request normally.

use std::io;

use thiserror::Error;

/// Errors returned by a [`CacheStore`](super::CacheStore).
#[derive(Debug, Error)]
pub enum StoreError {
    /// The key is absent or expired. Expected; not a failure.
    #[error("cache miss")]
    Miss,

    /// The backend could not be reached or refused the operation.
    #[error("cache backend error: {0}")]
    Backend(String),

    /// A stored entry could not be encoded or decoded.
    #[error("cache codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl StoreError {
    /// Returns `true` for the miss sentinel.
    pub fn is_miss(&self) -> bool {
        matches!(self, Self::Miss)
    }
}

/// A key strategy could not derive its preferred key.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("malformed query string: {reason}")]
    MalformedQuery { reason: String },
}

/// The captured response could not be completed.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The downstream body stream failed mid-way.
    #[error("response body failed: {0}")]
    Body(#[from] io::Error),

    /// The body was dropped before its end, usually because the client went away.
    #[error("response body dropped before completion")]
    Interrupted,
}

/// A follower could not obtain the leader's result.
#[derive(Debug, Error)]
pub enum DedupError {
    #[error("leader for this key finished without publishing a response")]
    LeaderGone,
}
