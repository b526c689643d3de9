//! Pass-through capture of a downstream response.
//!
//! The client keeps receiving the response exactly as downstream produced it;
//! the capture only keeps a copy of every body chunk on the side and reports
//! the finished snapshot through a [`CaptureHandle`].

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures::Stream;
use tokio::sync::oneshot;

use super::{CaptureError, ResponseSnapshot};
use crate::http::{Body, BodyStream, Headers, Response, StatusCode};

/// The outcome of a completed capture.
#[derive(Debug, Clone)]
pub struct Captured {
    snapshot: ResponseSnapshot,
    aborted: bool,
}

impl Captured {
    pub fn snapshot(&self) -> &ResponseSnapshot {
        &self.snapshot
    }

    /// Whether downstream marked the response as short-circuited.
    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// Only complete, non-aborted `2xx` responses may be persisted.
    pub fn is_storable(&self) -> bool {
        !self.aborted && self.snapshot.is_success()
    }

    pub fn into_snapshot(self) -> ResponseSnapshot {
        self.snapshot
    }
}

type Completion = oneshot::Sender<Result<Captured, CaptureError>>;

/// Receives the capture result once the body has been fully delivered.
#[derive(Debug)]
pub struct CaptureHandle {
    rx: oneshot::Receiver<Result<Captured, CaptureError>>,
    streaming: bool,
}

impl CaptureHandle {
    /// `false` when the body was already complete at wrap time, in which case
    /// [`finish`](Self::finish) resolves immediately.
    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Waits for the body to finish.
    ///
    /// # Errors
    ///
    /// - [`CaptureError::Body`] when the body stream yielded an error.
    /// - [`CaptureError::Interrupted`] when the body was dropped before its end.
    pub async fn finish(self) -> Result<Captured, CaptureError> {
        self.rx
            .await
            .unwrap_or_else(|_| Err(CaptureError::Interrupted))
    }
}

/// A body stream that forwards every chunk untouched and mirrors it into a
/// buffer.
///
/// Built by [`ResponseCapture::wrap`]. Status and headers are taken when the
/// response is wrapped, which is the point at which downstream has finished
/// writing them. If the stream is dropped early the buffer goes with it and
/// the handle reports [`CaptureError::Interrupted`].
pub struct ResponseCapture {
    inner: BodyStream,
    buffer: BytesMut,
    status: StatusCode,
    headers: Headers,
    aborted: bool,
    done: Option<Completion>,
}

impl ResponseCapture {
    /// Attaches a capture to `response`.
    ///
    /// A fully buffered body is captured on the spot and left in place. A
    /// streamed body is replaced by a mirroring stream that delivers the same
    /// chunks at the same pace.
    ///
    /// ```
    /// use replay_cache::cache::ResponseCapture;
    /// use replay_cache::http::{Response, StatusCode};
    ///
    /// # #[tokio::main(flavor = "current_thread")]
    /// # async fn main() {
    /// let (response, handle) = ResponseCapture::wrap(Response::new(StatusCode::OK).body("hi"));
    /// assert!(!handle.is_streaming());
    ///
    /// let captured = handle.finish().await.unwrap();
    /// assert_eq!(captured.snapshot().body().as_ref(), b"hi");
    /// assert_eq!(response.collect().await.unwrap().as_ref(), b"hi");
    /// # }
    /// ```
    pub fn wrap(mut response: Response) -> (Response, CaptureHandle) {
        let (tx, rx) = oneshot::channel();
        let status = response.status();
        let headers = response.headers().clone();
        let aborted = response.is_aborted();

        match response.replace_body(Body::empty()) {
            Body::Full(bytes) => {
                let snapshot = ResponseSnapshot::new(status, headers, bytes.clone());
                // The receiver is held below, so this cannot fail.
                let _ = tx.send(Ok(Captured { snapshot, aborted }));
                response.replace_body(Body::Full(bytes));
                (
                    response,
                    CaptureHandle {
                        rx,
                        streaming: false,
                    },
                )
            }
            Body::Stream(inner) => {
                let capture = Self {
                    inner,
                    buffer: BytesMut::new(),
                    status,
                    headers,
                    aborted,
                    done: Some(tx),
                };
                response.replace_body(Body::Stream(Box::pin(capture)));
                (
                    response,
                    CaptureHandle {
                        rx,
                        streaming: true,
                    },
                )
            }
        }
    }

    fn complete(&mut self, result: Result<Captured, CaptureError>) {
        if let Some(tx) = self.done.take() {
            // Nobody waiting any more is fine.
            let _ = tx.send(result);
        }
    }
}

impl Stream for ResponseCapture {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done.is_none() {
            return Poll::Ready(None);
        }

        match this.inner.as_mut().poll_next(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(chunk))) => {
                this.buffer.extend_from_slice(&chunk);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                let copy = io::Error::new(e.kind(), e.to_string());
                this.complete(Err(CaptureError::Body(copy)));
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                let body = std::mem::take(&mut this.buffer).freeze();
                let headers = std::mem::take(&mut this.headers);
                let snapshot = ResponseSnapshot::new(this.status, headers, body);
                let aborted = this.aborted;
                this.complete(Ok(Captured { snapshot, aborted }));
                Poll::Ready(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio::sync::mpsc;

    fn chunked(parts: &[&'static str]) -> Response {
        let chunks: Vec<io::Result<Bytes>> = parts
            .iter()
            .map(|&p| Ok(Bytes::from_static(p.as_bytes())))
            .collect();
        Response::new(StatusCode::OK)
            .header("Content-Type", "text/plain")
            .body_stream(futures::stream::iter(chunks))
    }

    #[tokio::test]
    async fn full_body_is_captured_immediately() {
        let response = Response::new(StatusCode::CREATED)
            .header("X-A", "1")
            .body("done");
        let (response, handle) = ResponseCapture::wrap(response);
        assert!(!handle.is_streaming());

        let captured = handle.finish().await.unwrap();
        assert_eq!(captured.snapshot().status(), StatusCode::CREATED);
        assert_eq!(captured.snapshot().headers().get("x-a"), Some("1"));
        assert!(captured.is_storable());
        assert_eq!(response.collect().await.unwrap().as_ref(), b"done");
    }

    #[tokio::test]
    async fn stream_chunks_pass_through_and_are_mirrored() {
        let (response, handle) = ResponseCapture::wrap(chunked(&["a", "bc", "def"]));
        assert!(handle.is_streaming());

        let mut delivered = Vec::new();
        let Body::Stream(mut body) = response.into_body() else {
            panic!("expected a streamed body");
        };
        while let Some(chunk) = body.next().await {
            delivered.push(chunk.unwrap());
        }
        assert_eq!(delivered, vec!["a", "bc", "def"]);

        let captured = handle.finish().await.unwrap();
        assert_eq!(captured.snapshot().body().as_ref(), b"abcdef");
        assert_eq!(captured.snapshot().headers().get("content-type"), Some("text/plain"));
    }

    #[tokio::test]
    async fn chunks_are_delivered_before_the_stream_ends() {
        let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(4);
        let source = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        let (response, handle) = ResponseCapture::wrap(Response::new(StatusCode::OK).body_stream(source));
        let Body::Stream(mut body) = response.into_body() else {
            panic!("expected a streamed body");
        };

        tx.send(Ok(Bytes::from_static(b"early"))).await.unwrap();
        assert_eq!(body.next().await.unwrap().unwrap().as_ref(), b"early");

        tx.send(Ok(Bytes::from_static(b"late"))).await.unwrap();
        drop(tx);
        assert_eq!(body.next().await.unwrap().unwrap().as_ref(), b"late");
        assert!(body.next().await.is_none());
        assert_eq!(handle.finish().await.unwrap().snapshot().body().as_ref(), b"earlylate");
    }

    #[tokio::test]
    async fn dropping_mid_stream_reports_interrupted() {
        let (response, handle) = ResponseCapture::wrap(chunked(&["a", "b"]));
        let Body::Stream(mut body) = response.into_body() else {
            panic!("expected a streamed body");
        };
        let _ = body.next().await;
        drop(body);

        assert!(matches!(handle.finish().await, Err(CaptureError::Interrupted)));
    }

    #[tokio::test]
    async fn stream_error_is_forwarded_and_reported() {
        let chunks = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"a")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "upstream reset")),
        ]);
        let (response, handle) = ResponseCapture::wrap(Response::new(StatusCode::OK).body_stream(chunks));

        let err = response.collect().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert!(matches!(handle.finish().await, Err(CaptureError::Body(_))));
    }

    #[tokio::test]
    async fn aborted_and_non_2xx_are_not_storable() {
        let (_, handle) = ResponseCapture::wrap(Response::new(StatusCode::OK).body("x").aborted());
        let captured = handle.finish().await.unwrap();
        assert!(captured.is_aborted());
        assert!(!captured.is_storable());

        let (_, handle) = ResponseCapture::wrap(Response::new(StatusCode::FOUND));
        assert!(!handle.finish().await.unwrap().is_storable());
    }
}
