//! HTTP response builder.
//!
//! Provides a fluent builder API for constructing responses. A body is either
//! fully buffered or a stream of chunks, so a middleware can observe a large
//! response while it is still being delivered.

use std::fmt;
use std::io;
use std::pin::Pin;

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};

use super::{Headers, StatusCode};

/// A boxed stream of body chunks.
pub type BodyStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// A response body.
pub enum Body {
    /// The whole body is in memory.
    Full(Bytes),
    /// Chunks produced over time; the host writes each one as it arrives.
    Stream(BodyStream),
}

impl Body {
    /// Returns an empty, fully buffered body.
    pub fn empty() -> Self {
        Self::Full(Bytes::new())
    }

    /// Returns `true` for [`Body::Stream`].
    pub fn is_stream(&self) -> bool {
        matches!(self, Self::Stream(_))
    }

    /// Drains the body into a single buffer.
    ///
    /// # Errors
    ///
    /// Returns the first error yielded by a streamed body.
    pub async fn collect(self) -> io::Result<Bytes> {
        match self {
            Self::Full(bytes) => Ok(bytes),
            Self::Stream(mut stream) => {
                let mut buf = BytesMut::new();
                while let Some(chunk) = stream.next().await {
                    buf.extend_from_slice(&chunk?);
                }
                Ok(buf.freeze())
            }
        }
    }
}

impl Default for Body {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(bytes) => f.debug_tuple("Full").field(&bytes.len()).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// An HTTP response flowing back up the middleware pipeline.
///
/// # Examples
///
/// ```
/// use replay_cache::http::{Response, StatusCode};
///
/// let mut response = Response::new(StatusCode::OK)
///     .header("Content-Type", "application/json")
///     .body(r#"{"status":"ok"}"#);
///
/// response.set_header("content-type", "text/plain");
/// assert_eq!(response.headers().get_all("Content-Type").count(), 1);
/// assert!(!response.is_aborted());
/// ```
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: Headers,
    body: Body,
    aborted: bool,
}

impl Response {
    /// Creates a new response with the given status and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Body::empty(),
            aborted: false,
        }
    }

    /// Appends a response header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Appends a header in-place. Intended for middleware pipelines that receive
    /// a `Response` from downstream and need to decorate it without consuming it.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name, value);
    }

    /// Sets a header in-place, replacing any values already present for `name`.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.set(name, value);
    }

    /// Sets the response body from a string.
    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Body::Full(Bytes::from(body.into()));
        self
    }

    /// Sets the response body from raw bytes.
    #[must_use]
    pub fn body_bytes(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Body::Full(body.into());
        self
    }

    /// Sets a streamed body; each chunk is delivered as soon as it is produced.
    #[must_use]
    pub fn body_stream<S>(mut self, stream: S) -> Self
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        self.body = Body::Stream(Box::pin(stream));
        self
    }

    /// Marks the response as short-circuited by downstream logic.
    ///
    /// Aborted responses are still delivered, but a cache layer never stores them.
    #[must_use]
    pub fn aborted(mut self) -> Self {
        self.aborted = true;
        self
    }

    /// In-place form of [`aborted`](Self::aborted).
    pub fn abort(&mut self) {
        self.aborted = true;
    }

    /// Returns `true` once [`abort`](Self::abort) has been called.
    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// Returns the status code of this response.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Overwrites the status code.
    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    /// Returns the response headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the response headers for in-place edits.
    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// Returns the body without consuming the response.
    pub fn body_ref(&self) -> &Body {
        &self.body
    }

    /// Replaces the body, returning the previous one.
    pub fn replace_body(&mut self, body: Body) -> Body {
        std::mem::replace(&mut self.body, body)
    }

    /// Consumes the response and returns its body.
    pub fn into_body(self) -> Body {
        self.body
    }

    /// Drains the body into a single buffer.
    ///
    /// # Errors
    ///
    /// Returns the first error yielded by a streamed body.
    pub async fn collect(self) -> io::Result<Bytes> {
        self.body.collect().await
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::OK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn full_body_collects() {
        let r = Response::new(StatusCode::OK).body("Hello");
        assert!(!r.body_ref().is_stream());
        assert_eq!(r.collect().await.unwrap(), Bytes::from_static(b"Hello"));
    }

    #[tokio::test]
    async fn stream_body_collects_in_order() {
        let chunks = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"he")),
            Ok(Bytes::from_static(b"llo")),
        ]);
        let r = Response::new(StatusCode::OK).body_stream(chunks);
        assert!(r.body_ref().is_stream());
        assert_eq!(r.collect().await.unwrap(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn stream_error_surfaces() {
        let chunks = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"he")),
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone")),
        ]);
        let r = Response::new(StatusCode::OK).body_stream(chunks);
        assert_eq!(r.collect().await.unwrap_err().kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn header_appends_set_header_overwrites() {
        let mut r = Response::new(StatusCode::OK)
            .header("X-Request-Id", "a")
            .header("X-Request-Id", "b");
        assert_eq!(r.headers().get_all("x-request-id").count(), 2);
        r.set_header("X-Request-Id", "c");
        let vals: Vec<_> = r.headers().get_all("x-request-id").collect();
        assert_eq!(vals, vec!["c"]);
    }

    #[test]
    fn abort_flag() {
        let r = Response::new(StatusCode::UNAUTHORIZED).aborted();
        assert!(r.is_aborted());
        assert_eq!(r.status(), StatusCode::UNAUTHORIZED);
    }
}
