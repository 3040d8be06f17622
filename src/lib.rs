//! # retrysafe
//!
//! An idempotency gate for async request pipelines. Requests carrying an
//! `Idempotency-Key` header are processed once; retries replay the recorded
//! response instead of running the side effects again.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use retrysafe::{GateConfig, IdempotencyGate, Method, Request, Response, StatusCode};
//! use retrysafe::context::Context;
//! use retrysafe::middleware::{Next, endpoint, from_middleware};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let gate = IdempotencyGate::from_config(GateConfig::default())?;
//!     let stack = vec![
//!         from_middleware(Arc::new(gate)),
//!         endpoint(|_ctx: Context| async {
//!             Response::new(StatusCode::Created).body("charged")
//!         }),
//!     ];
//!
//!     let charge = || Context::new(
//!         Request::new(Method::Post, "/charges").header("Idempotency-Key", "c-1"),
//!     );
//!     let first = Next::new(stack.clone()).run(charge()).await;
//!     let retry = Next::new(stack).run(charge()).await;
//!     assert_eq!(retry.body_bytes(), first.body_bytes());
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod context;
pub mod gate;
pub mod http;
pub mod middleware;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use cache::{CacheKey, CacheStore, Claim, ClaimToken, StoreError};
pub use config::{ConfigError, GateConfig, InFlightPolicy};
pub use gate::{Admission, Completion, GateError, IdempotencyGate, Settlement, Ticket};
pub use http::{Headers, Method, Request, Response, StatusCode};
