//! The middleware chain the cache layer plugs into.
//!
//! A chain is an ordered list of [`MiddlewareHandler`]s. Each one gets the
//! request [`Context`] and a [`Next`] cursor; it may answer on its own (as the
//! cache does on a hit) or call [`Next::run`] and work with what comes back.
//! The last entry is normally a terminal [`handler`].

use std::{future::Future, pin::Pin, sync::Arc};

use crate::{Response, StatusCode, context::Context};

/// Position in the chain for one request.
///
/// Consumed by [`run`](Self::run), so a middleware can forward a request at
/// most once.
///
/// # Examples
///
/// ```rust
/// use replay_cache::{Method, Request, Response, StatusCode, context::Context};
/// use replay_cache::middleware::{Next, handler};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let next = Next::new(vec![handler(|_ctx| async {
///     Response::new(StatusCode::OK).body("hi")
/// })]);
/// let response = next.run(Context::new(Request::new(Method::Get, "/"))).await;
/// assert_eq!(response.status(), StatusCode::OK);
/// # }
/// ```
pub struct Next {
    chain: Vec<MiddlewareHandler>,
    position: usize,
}

/// One link of the chain, shared behind an [`Arc`] so cursors can be cloned
/// freely.
pub type MiddlewareHandler = Arc<
    dyn Fn(Context, Next) -> Pin<Box<dyn Future<Output = Response> + Send>> + Send + Sync + 'static,
>;

/// Wraps a [`Middleware`] as a chain link.
pub fn from_middleware<M>(middleware: Arc<M>) -> MiddlewareHandler
where
    M: Middleware + 'static,
{
    Arc::new(move |ctx: Context, next: Next| middleware.handle(ctx, next))
}

/// Turns an async function of the context into the end of a chain.
///
/// The function never sees the cursor, so nothing after it runs.
pub fn handler<F, Fut>(f: F) -> MiddlewareHandler
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    Arc::new(move |ctx: Context, _next: Next| Box::pin(f(ctx)))
}

impl Next {
    pub fn new(chain: Vec<MiddlewareHandler>) -> Self {
        Self { chain, position: 0 }
    }

    /// Hands `ctx` to the next link and returns its response.
    ///
    /// Running off the end of the chain yields `500 Internal Server Error`.
    pub async fn run(mut self, ctx: Context) -> Response {
        let Some(link) = self.chain.get(self.position).map(Arc::clone) else {
            return Response::new(StatusCode::INTERNAL_SERVER_ERROR)
                .body("No response generated by middleware pipeline");
        };
        self.position += 1;
        link(ctx, self).await
    }
}

/// A reusable stage of request handling.
///
/// `handle` may forward with `next.run(ctx)`, answer directly, or forward and
/// then rework the response. Middleware is shared between concurrently running
/// requests, hence `Send + Sync` and the boxed `Send` future.
pub trait Middleware: Send + Sync {
    fn handle(&self, ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Method, Request};

    struct Stamp(&'static str);

    impl Middleware for Stamp {
        fn handle(&self, ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>> {
            let value = self.0;
            Box::pin(async move {
                let mut response = next.run(ctx).await;
                response.add_header("X-Stamp", value);
                response
            })
        }
    }

    fn ctx() -> Context {
        Context::new(Request::new(Method::Get, "/"))
    }

    #[tokio::test]
    async fn empty_chain_falls_back_to_500() {
        let response = Next::new(vec![]).run(ctx()).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn layers_run_outside_in() {
        let next = Next::new(vec![
            from_middleware(Arc::new(Stamp("outer"))),
            from_middleware(Arc::new(Stamp("inner"))),
            handler(|_ctx| async { Response::new(StatusCode::OK) }),
        ]);
        let response = next.run(ctx()).await;
        let stamps: Vec<_> = response.headers().get_all("x-stamp").collect();
        assert_eq!(stamps, vec!["inner", "outer"]);
    }
}
