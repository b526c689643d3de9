//! Captured responses and their replay.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::http::{Body, Headers, Response, StatusCode};

/// An immutable record of a response: status, ordered headers, body bytes.
///
/// Produced by the capture on a cache miss or decoded from a store on a hit.
/// Once published to followers it is shared behind an `Arc` and never
/// mutated; the builder-style helpers return new snapshots instead.
///
/// # Examples
///
/// ```
/// use replay_cache::cache::ResponseSnapshot;
/// use replay_cache::http::{Headers, Response, StatusCode};
///
/// let mut headers = Headers::new();
/// headers.insert("ETag", "\"v2\"");
/// let snapshot = ResponseSnapshot::new(StatusCode::OK, headers, "cached");
///
/// let mut outgoing = Response::new(StatusCode::OK).header("etag", "\"stale\"");
/// snapshot.replay_onto(&mut outgoing);
/// let etags: Vec<_> = outgoing.headers().get_all("ETag").collect();
/// assert_eq!(etags, vec!["\"v2\""]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseSnapshot {
    status: StatusCode,
    headers: Headers,
    #[serde(with = "body_base64")]
    body: Bytes,
}

impl ResponseSnapshot {
    pub fn new(status: StatusCode, headers: Headers, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Returns `true` when the captured status is `2xx`.
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Returns a copy without any of the named headers (case-insensitive).
    #[must_use]
    pub fn without_headers<S: AsRef<str>>(&self, names: &[S]) -> Self {
        let mut headers = self.headers.clone();
        for name in names {
            headers.remove(name.as_ref());
        }
        Self {
            status: self.status,
            headers,
            body: self.body.clone(),
        }
    }

    /// Writes status, headers and body onto an outgoing response.
    ///
    /// Header replay overwrites: every name present in the snapshot first has
    /// its existing values on `response` removed, then the snapshot's values are
    /// appended in their captured order. Repeated names such as `Set-Cookie`
    /// keep all of their captured values.
    pub fn replay_onto(&self, response: &mut Response) {
        response.set_status(self.status);

        let headers = response.headers_mut();
        for (name, _) in self.headers.iter() {
            headers.remove(name);
        }
        for (name, value) in self.headers.iter() {
            headers.insert(name, value);
        }

        response.replace_body(Body::Full(self.body.clone()));
    }

    /// Builds a fresh response carrying this snapshot.
    pub fn to_response(&self) -> Response {
        let mut response = Response::new(self.status);
        self.replay_onto(&mut response);
        response
    }
}

mod body_base64 {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(body: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> ResponseSnapshot {
        let mut headers = Headers::new();
        headers.insert("Content-Type", "text/plain");
        headers.insert("Set-Cookie", "a=1");
        headers.insert("Set-Cookie", "b=2");
        ResponseSnapshot::new(StatusCode::OK, headers, "body")
    }

    #[tokio::test]
    async fn to_response_is_exact() {
        let response = snapshot().to_response();
        assert_eq!(response.status(), StatusCode::OK);
        let pairs: Vec<_> = response.headers().iter().collect();
        assert_eq!(
            pairs,
            vec![
                ("Content-Type", "text/plain"),
                ("Set-Cookie", "a=1"),
                ("Set-Cookie", "b=2"),
            ]
        );
        assert_eq!(response.collect().await.unwrap(), Bytes::from_static(b"body"));
    }

    #[test]
    fn replay_overwrites_existing_values() {
        let mut response = Response::new(StatusCode::ACCEPTED)
            .header("content-type", "application/json")
            .header("X-Upstream", "kept");
        snapshot().replay_onto(&mut response);

        assert_eq!(response.status(), StatusCode::OK);
        let types: Vec<_> = response.headers().get_all("Content-Type").collect();
        assert_eq!(types, vec!["text/plain"]);
        assert_eq!(response.headers().get_all("set-cookie").count(), 2);
        assert_eq!(response.headers().get("x-upstream"), Some("kept"));
    }

    #[test]
    fn without_headers_is_case_insensitive() {
        let stripped = snapshot().without_headers(&["set-cookie"]);
        assert!(!stripped.headers().contains("Set-Cookie"));
        assert!(stripped.headers().contains("content-type"));
        assert_eq!(stripped.body(), snapshot().body());
    }

    #[test]
    fn body_is_base64_on_the_wire() {
        let json = serde_json::to_value(snapshot()).unwrap();
        assert_eq!(json["status"], 200);
        assert_eq!(json["body"], "Ym9keQ==");
        assert_eq!(json["headers"][2][1], "b=2");
    }
}
