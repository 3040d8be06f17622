//! Replays a retried charge through a gated pipeline.
//!
//! ```text
//! RUST_LOG=retrysafe=debug cargo run --example replay
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use retrysafe::context::Context;
use retrysafe::middleware::{Next, endpoint, from_middleware};
use retrysafe::{GateConfig, IdempotencyGate, Method, Request, Response, StatusCode};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("retrysafe=debug")),
        )
        .init();

    let gate = IdempotencyGate::from_config(
        GateConfig::default()
            .with_capacity(1_000)
            .with_ttl(Duration::from_secs(24 * 60 * 60)),
    )?;

    let charges = Arc::new(AtomicU64::new(0));
    let stack = vec![
        from_middleware(Arc::new(gate.clone())),
        endpoint(move |ctx: Context| {
            let charges = Arc::clone(&charges);
            async move {
                // the side effect we must not repeat
                tokio::time::sleep(Duration::from_millis(100)).await;
                let id = charges.fetch_add(1, Ordering::SeqCst) + 1;
                let amount = String::from_utf8_lossy(ctx.request().body_bytes()).into_owned();
                Response::new(StatusCode::Created)
                    .header("Content-Type", "application/json")
                    .body(format!("{{\"charge\":\"ch_{id}\",\"amount\":{amount}}}"))
            }
        }),
    ];

    let charge = |token: &str| {
        Context::new(
            Request::new(Method::Post, "/charges")
                .header("Idempotency-Key", token)
                .body("4200"),
        )
    };

    // two concurrent attempts plus a late retry, all with the same key
    let (a, b) = tokio::join!(
        Next::new(stack.clone()).run(charge("order-17")),
        Next::new(stack.clone()).run(charge("order-17")),
    );
    let late = Next::new(stack.clone()).run(charge("order-17")).await;
    let other = Next::new(stack).run(charge("order-18")).await;

    for (label, response) in [("first", &a), ("second", &b), ("late", &late), ("other", &other)] {
        println!(
            "{label:>6}: {} {:<4} {}",
            response.status().as_u16(),
            response.headers().get("x-cache-status").unwrap_or("-"),
            String::from_utf8_lossy(response.body_bytes()),
        );
    }
    println!("in flight after: {}", gate.in_flight());

    Ok(())
}
