//! [`Middleware`] adapter: the gate as one link in a request pipeline.

use std::future::Future;
use std::pin::Pin;

use tracing::warn;

use super::{Admission, Completion, GateError, IdempotencyGate};
use crate::context::Context;
use crate::http::{Response, StatusCode};
use crate::middleware::{Middleware, Next};

impl Middleware for IdempotencyGate {
    /// Replays, forwards, or rejects the request.
    ///
    /// A duplicate that cannot be served gets `409 Conflict` with
    /// `Retry-After: 1`. A downstream timeout gets `504 Gateway Timeout` and
    /// releases the claim. Forwarded requests carry their
    /// [`CacheKey`](crate::cache::CacheKey) in the context extensions.
    fn handle(&self, ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        let gate = self.clone();
        Box::pin(async move { gate.guard(ctx, next).await })
    }
}

impl IdempotencyGate {
    async fn guard(&self, mut ctx: Context, next: Next) -> Response {
        let admission = match self.before(ctx.request()).await {
            Ok(admission) => admission,
            Err(e) => return conflict(&e),
        };
        let ticket = match admission {
            Admission::Passthrough => return next.run(ctx).await,
            Admission::Replay(response) => return response,
            Admission::Forward(ticket) => ticket,
        };

        ctx.extensions_mut().insert(ticket.key().clone());
        let forwarded = next.run(ctx);
        let finished = match self.inner.downstream_timeout {
            Some(limit) => tokio::time::timeout(limit, forwarded).await.ok(),
            None => Some(forwarded.await),
        };

        match finished {
            Some(mut response) => {
                let settlement = self.after(ticket, Completion::Completed(&response)).await;
                self.mark(&mut response, settlement);
                response
            }
            None => {
                warn!(key = %ticket.key(), "downstream timed out");
                self.after(ticket, Completion::Aborted).await;
                Response::new(StatusCode::GatewayTimeout).body("downstream timed out")
            }
        }
    }
}

fn conflict(error: &GateError) -> Response {
    Response::new(StatusCode::Conflict)
        .header("Retry-After", "1")
        .body(error.to_string())
}
