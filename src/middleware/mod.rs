//! Middleware pipeline: the seam where the gate sits in front of the host's
//! request processing.
//!
//! - [`Middleware`]: trait implemented by all middleware, including
//!   [`IdempotencyGate`](crate::gate::IdempotencyGate).
//! - [`Next`]: cursor into the remaining chain; call [`Next::run`] to
//!   forward the request.
//! - [`MiddlewareHandler`]: type-erased, cheaply-cloneable middleware function.
//! - [`from_middleware`] and [`endpoint`]: build handlers from a
//!   [`Middleware`] or from the terminal async handler.
//!
//! # Examples
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use retrysafe::{Request, Response, StatusCode, Method};
//! use retrysafe::context::Context;
//! use retrysafe::gate::IdempotencyGate;
//! use retrysafe::config::GateConfig;
//! use retrysafe::middleware::{Next, endpoint, from_middleware};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let gate = IdempotencyGate::from_config(GateConfig::default())?;
//! let stack = vec![
//!     from_middleware(Arc::new(gate)),
//!     endpoint(|_ctx: Context| async { Response::new(StatusCode::Created) }),
//! ];
//!
//! let request = Request::new(Method::Post, "/orders").header("Idempotency-Key", "k-1");
//! let response = Next::new(stack.clone()).run(Context::new(request)).await;
//! # Ok(())
//! # }
//! ```

use std::{future::Future, pin::Pin, sync::Arc};

use crate::{Response, StatusCode, context::Context};

/// A cursor into the remaining middleware chain for a single request.
///
/// `Next` is consumed by [`run`](Self::run), so a middleware can forward a
/// request at most once.
pub struct Next {
    middlewares: Vec<MiddlewareHandler>,
    // Tracks which middleware to invoke on the next `run` call.
    index: usize,
}

/// A type-erased, reference-counted middleware function.
///
/// The [`Arc`] wrapper makes handlers cheap to clone so that [`Next`] can
/// advance through the chain without copying closures.
pub type MiddlewareHandler = Arc<
    dyn Fn(Context, Next) -> Pin<Box<dyn Future<Output = Response> + Send>> + Send + Sync + 'static,
>;

/// Converts a [`Middleware`] implementation into a [`MiddlewareHandler`].
pub fn from_middleware<M>(middleware: Arc<M>) -> MiddlewareHandler
where
    M: Middleware + 'static,
{
    Arc::new(move |ctx: Context, next: Next| middleware.handle(ctx, next))
}

/// Wraps the terminal request handler as the last entry of a chain.
///
/// The handler never sees `Next`; anything registered after it is unreachable.
pub fn endpoint<H, F>(handler: H) -> MiddlewareHandler
where
    H: Fn(Context) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    Arc::new(
        move |ctx: Context, _next: Next| -> Pin<Box<dyn Future<Output = Response> + Send>> {
            Box::pin(handler(ctx))
        },
    )
}

impl Next {
    /// Creates a new `Next` positioned at the start of the given middleware stack.
    pub fn new(middlewares: Vec<MiddlewareHandler>) -> Self {
        Self {
            middlewares,
            index: 0,
        }
    }

    /// Invokes the next middleware in the chain and returns its response.
    ///
    /// If the chain is exhausted without producing a response, a
    /// `500 Internal Server Error` response is returned as a safe fallback.
    pub async fn run(mut self, ctx: Context) -> Response {
        if self.index < self.middlewares.len() {
            let handler = self.middlewares[self.index].clone();
            self.index += 1;
            handler(ctx, self).await
        } else {
            Response::new(StatusCode::InternalServerError)
                .body("No response generated by middleware pipeline")
        }
    }
}

/// The core trait for all middleware.
///
/// Implementors receive a [`Context`] and a [`Next`] cursor. They may pass
/// through, short-circuit with their own [`Response`], or decorate the
/// downstream response.
///
/// # Contract
///
/// - Implementations **must** be `Send + Sync` because middleware is shared across
///   Tokio tasks.
/// - `handle` **must** return a pinned, `Send` future.
/// - Implementations **should not** hold locks across an `.await` point.
pub trait Middleware: Send + Sync {
    fn handle(&self, ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>>;
}
