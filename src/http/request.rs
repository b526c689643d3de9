//! Inbound requests, parsed from HTTP/1.1 bytes or built by the host.

use std::collections::HashMap;

use bytes::Bytes;
use thiserror::Error;
use url::form_urlencoded;

use super::{Headers, Method};

/// Failure to read a request head.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request head is incomplete")]
    Incomplete,

    #[error("malformed request head: {0}")]
    Parse(#[from] httparse::Error),

    #[error("request line has no {field}")]
    MissingField { field: &'static str },
}

/// A request as the middleware chain sees it.
///
/// Hosts that own the socket either hand over the raw bytes through
/// [`Request::parse`] or build one with [`Request::new`]. The target is kept
/// exactly as received so key strategies can use it verbatim.
///
/// # Examples
///
/// ```
/// use replay_cache::http::request::Request;
///
/// let raw = b"GET /hello?name=world HTTP/1.1\r\nHost: localhost\r\n\r\n";
/// let (request, _offset) = Request::parse(raw).unwrap();
///
/// assert_eq!(request.path(), "/hello");
/// assert_eq!(request.target(), "/hello?name=world");
/// assert_eq!(request.query_param("name"), Some("world"));
/// ```
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    target: String,
    path: String,
    query: Option<String>,
    // Minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    version: u8,
    headers: Headers,
    body: Bytes,
    params: HashMap<String, String>,
}

impl Request {
    const MAX_HEADERS: usize = 64;

    /// An HTTP/1.1 request for `target` (`path` or `path?query`) with no
    /// headers and an empty body.
    ///
    /// ```
    /// use replay_cache::http::{Method, Request};
    ///
    /// let req = Request::new(Method::Post, "/search?page=2")
    ///     .with_header("Content-Type", "application/json")
    ///     .with_body(r#"{"q":"rust"}"#);
    /// assert_eq!(req.query_string(), Some("page=2"));
    /// assert_eq!(req.body().len(), 12);
    /// ```
    pub fn new(method: Method, target: impl Into<String>) -> Self {
        let target = target.into();
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path.to_owned(), Some(query.to_owned())),
            None => (target.clone(), None),
        };
        let params = query
            .as_deref()
            .map(|q| form_urlencoded::parse(q.as_bytes()).into_owned().collect())
            .unwrap_or_default();

        Self {
            method,
            target,
            path,
            query,
            version: 1,
            headers: Headers::new(),
            body: Bytes::new(),
            params,
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Reads a request from `buf`.
    ///
    /// Returns the request and the offset where its body starts. Everything
    /// from that offset on becomes the body; headers whose value is not UTF-8
    /// are skipped.
    ///
    /// # Errors
    ///
    /// - [`RequestError::Incomplete`] if the head has not fully arrived.
    /// - [`RequestError::Parse`] if the head is malformed.
    /// - [`RequestError::MissingField`] if the request line lacks a part.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), RequestError> {
        let mut slots = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
        let mut head = httparse::Request::new(&mut slots);

        let httparse::Status::Complete(body_offset) = head.parse(buf)? else {
            return Err(RequestError::Incomplete);
        };

        let method = head
            .method
            .ok_or(RequestError::MissingField { field: "method" })?
            .parse::<Method>()
            .unwrap_or_else(|never| match never {});
        let target = head.path.ok_or(RequestError::MissingField { field: "target" })?;
        let version = head
            .version
            .ok_or(RequestError::MissingField { field: "version" })?;

        let mut request = Self::new(method, target);
        request.version = version;
        for field in head.headers.iter() {
            if let Ok(value) = std::str::from_utf8(field.value) {
                request.headers.insert(field.name, value);
            }
        }
        request.body = Bytes::copy_from_slice(&buf[body_offset..]);

        Ok((request, body_offset))
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The request target as received: path plus `?query` when present.
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// The raw query after `?`, undecoded.
    pub fn query_string(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// A decoded query parameter. For a repeated name the last value wins.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }
}
