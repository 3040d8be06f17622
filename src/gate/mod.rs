//! The idempotency gate: check, forward, capture, store.
//!
//! Per request:
//!
//! ```text
//! START ─ no token ──────────────────────────────▶ PASSTHROUGH
//!   └─ token ─▶ LOOKUP ─ hit ────────────────────▶ REPLAY (X-Cache-Status: HIT)
//!                 └─ miss ─▶ CLAIM ─▶ FORWARD ─▶ CAPTURE ─▶ STORE
//! ```
//!
//! Duplicates that arrive while a key is being processed do not forward. In
//! one process they follow the leader through the in-flight registry and
//! replay its record (or fail fast, per [`InFlightPolicy`]). Across
//! processes, stores that implement [`CacheStore::claim`] hold a leased
//! marker that other gates poll on.
//!
//! Backend trouble never fails a request: an unavailable store forwards
//! without caching, and a malformed record reads as a miss.
//!
//! The key is computed once in [`IdempotencyGate::before`] and travels in the
//! [`Ticket`]; the store step reuses it.

use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::cache::{
    BoundedLocalStore, CacheKey, CacheStore, CachedResponse, Claim, ClaimToken, KeyGenerator,
    RemoteStore, StoreError,
};
use crate::config::{BackendKind, ConfigError, GateConfig, InFlightPolicy};
use crate::http::{Request, Response};

mod capture;
mod flight;
mod layer;

pub use capture::ResponseCapture;

use flight::{Flight, FlightGuard, FlightRegistry, Resolution};

/// Indicator value on replayed responses.
pub const HIT: &str = "HIT";

/// Indicator value on live responses that were just stored.
pub const MISS: &str = "MISS";

/// Per-request failures the gate surfaces to its caller.
#[derive(Debug, Error)]
pub enum GateError {
    /// An identical request is still being processed. Retryable.
    #[error("a request with idempotency key {key} is already in flight")]
    ConflictInFlight { key: CacheKey },

    /// The downstream pipeline failed; nothing was stored.
    #[error("downstream processing failed: {0}")]
    Downstream(#[source] Box<dyn StdError + Send + Sync>),

    /// The downstream pipeline did not finish in time; nothing was stored.
    #[error("downstream processing timed out after {0:?}")]
    DownstreamTimeout(Duration),
}

impl GateError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConflictInFlight { .. } | Self::DownstreamTimeout(_))
    }
}

/// What [`IdempotencyGate::before`] decided for a request.
#[derive(Debug)]
pub enum Admission {
    /// No token: forward untouched, nothing to report back.
    Passthrough,
    /// A recorded response, already marked `HIT`. Do not forward.
    Replay(Response),
    /// Forward the request, then hand the ticket to [`IdempotencyGate::after`].
    Forward(Ticket),
}

/// The single terminal signal for a forwarded request.
#[derive(Debug)]
pub enum Completion<'a> {
    /// The pipeline produced its final response.
    Completed(&'a Response),
    /// The pipeline errored before a final response existed.
    Failed,
    /// The request was cancelled or timed out.
    Aborted,
}

/// What [`IdempotencyGate::after`] did with a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// The response was recorded under the ticket's key.
    Stored,
    /// Nothing was recorded (degraded ticket, or the store write failed).
    Uncached,
    /// The claim was given up so a later retry starts fresh.
    Released,
}

/// Permission to forward one request, bound to the key it was looked up under.
///
/// Dropping a ticket without passing it to [`IdempotencyGate::after`] counts
/// as [`Completion::Aborted`].
pub struct Ticket {
    key: CacheKey,
    capture: ResponseCapture,
    lease: Option<Lease>,
}

impl Ticket {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// `false` when the store was unreachable and the response will not be recorded.
    pub fn is_cached(&self) -> bool {
        self.lease.is_some()
    }
}

impl fmt::Debug for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ticket")
            .field("key", &self.key)
            .field("cached", &self.is_cached())
            .finish()
    }
}

// The claim held by a cached ticket: leadership in the local registry plus
// whatever marker the store wrote.
struct Lease {
    key: CacheKey,
    store: Arc<dyn CacheStore>,
    token: ClaimToken,
    flight: FlightGuard,
    settled: bool,
}

impl Lease {
    async fn commit(&mut self, record: CachedResponse) -> Result<(), StoreError> {
        self.store.store(&self.key, &record).await?;
        self.settled = true;
        self.flight.resolve(Arc::new(record));
        Ok(())
    }

    async fn release(mut self) {
        self.settled = true;
        if let Err(e) = self.store.release(&self.key, &self.token).await {
            warn!(key = %self.key, error = %e, "failed to clear in-flight marker");
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        debug!(key = %self.key, "ticket dropped before completion, releasing claim");
        let store = Arc::clone(&self.store);
        let key = self.key.clone();
        let token = self.token.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = store.release(&key, &token).await {
                        warn!(key = %key, error = %e, "failed to clear in-flight marker");
                    }
                });
            }
            Err(_) => {
                warn!(key = %self.key, "no runtime to clear in-flight marker; it expires with its lease");
            }
        }
    }
}

enum Peek {
    Hit(Response),
    Miss,
    Unavailable,
}

struct Inner {
    store: Arc<dyn CacheStore>,
    keys: KeyGenerator,
    flights: FlightRegistry,
    token_header: String,
    indicator: Arc<str>,
    policy: InFlightPolicy,
    lock_timeout: Duration,
    lease: Duration,
    poll_interval: Duration,
    downstream_timeout: Option<Duration>,
}

/// Gate in front of a request pipeline that replays recorded responses for
/// retried requests.
///
/// Owns its [`CacheStore`] for its whole lifetime; clones share the store
/// and the in-flight registry.
///
/// # Examples
///
/// ```
/// use retrysafe::config::GateConfig;
/// use retrysafe::gate::{IdempotencyGate, HIT};
/// use retrysafe::http::{Method, Request, Response, StatusCode};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let gate = IdempotencyGate::from_config(GateConfig::default().with_capacity(1024))?;
/// let charge = || Request::new(Method::Post, "/charges").header("Idempotency-Key", "c-42");
///
/// let first = gate
///     .execute(charge(), |_req| async {
///         Ok::<_, std::io::Error>(Response::new(StatusCode::Created).body("ch_1"))
///     })
///     .await?;
/// let replay = gate
///     .execute(charge(), |_req| async {
///         Ok::<_, std::io::Error>(Response::new(StatusCode::Created).body("ch_2"))
///     })
///     .await?;
///
/// assert_eq!(replay.body_bytes(), first.body_bytes());
/// assert_eq!(replay.headers().get("x-cache-status"), Some(HIT));
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct IdempotencyGate {
    inner: Arc<Inner>,
}

impl fmt::Debug for IdempotencyGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdempotencyGate")
            .field("backend", &self.inner.store.name())
            .field("policy", &self.inner.policy)
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

impl IdempotencyGate {
    /// Builds the gate and its built-in store from `config`.
    ///
    /// # Errors
    ///
    /// [`ConfigError`] for an unknown backend, zero local capacity, a remote
    /// backend without a client, or invalid timings and header names.
    pub fn from_config(config: GateConfig) -> Result<Self, ConfigError> {
        let store: Arc<dyn CacheStore> = match config.validate()? {
            BackendKind::Local => {
                let capacity =
                    NonZeroUsize::new(config.capacity).ok_or(ConfigError::ZeroCapacity)?;
                Arc::new(BoundedLocalStore::new(capacity).with_ttl(config.ttl()))
            }
            BackendKind::Remote => {
                let client = config.client.clone().ok_or(ConfigError::MissingClient)?;
                Arc::new(
                    RemoteStore::new(client)
                        .with_namespace(config.namespace.clone())
                        .with_ttl(config.ttl())
                        .with_operation_timeout(config.remote_timeout()),
                )
            }
        };
        Self::with_store(store, config)
    }

    /// Builds the gate over any [`CacheStore`]. `backend`, `capacity`,
    /// `client`, and `namespace` in `config` are ignored.
    ///
    /// # Errors
    ///
    /// [`ConfigError`] for invalid timings or header names.
    pub fn with_store(store: Arc<dyn CacheStore>, config: GateConfig) -> Result<Self, ConfigError> {
        config.validate_gate()?;
        debug!(backend = store.name(), policy = ?config.in_flight, "idempotency gate ready");
        Ok(Self {
            inner: Arc::new(Inner {
                keys: KeyGenerator::new().with_body_digest(config.include_body_digest),
                flights: FlightRegistry::default(),
                indicator: config.status_header.as_str().into(),
                policy: config.in_flight,
                lock_timeout: config.lock_timeout(),
                lease: config.lease(),
                poll_interval: config.poll_interval(),
                downstream_timeout: config.downstream_timeout(),
                token_header: config.token_header,
                store,
            }),
        })
    }

    /// The request's idempotency token. Blank values count as absent.
    pub fn token<'r>(&self, request: &'r Request) -> Option<&'r str> {
        request
            .headers()
            .get(&self.inner.token_header)
            .map(str::trim)
            .filter(|token| !token.is_empty())
    }

    /// Number of keys currently being processed by this process.
    pub fn in_flight(&self) -> usize {
        self.inner.flights.len()
    }

    /// Decides whether `request` is replayed, forwarded, or passed through.
    ///
    /// Suspends while an identical request is in flight (under
    /// [`InFlightPolicy::Wait`]) and on remote store round trips.
    ///
    /// # Errors
    ///
    /// [`GateError::ConflictInFlight`] under [`InFlightPolicy::FailFast`],
    /// or when waiting exceeds the lock timeout.
    pub async fn before(&self, request: &Request) -> Result<Admission, GateError> {
        let Some(token) = self.token(request) else {
            trace!(method = %request.method(), path = request.path(), "no idempotency token");
            return Ok(Admission::Passthrough);
        };
        let key = self.inner.keys.generate(request, token);
        let deadline = deadline_after(self.inner.lock_timeout);

        loop {
            match self.peek(&key).await {
                Peek::Hit(response) => return Ok(Admission::Replay(response)),
                Peek::Unavailable => return Ok(self.uncached(key)),
                Peek::Miss => {}
            }

            let follower = match self.inner.flights.join_or_lead(&key) {
                Flight::Lead(guard) => return self.lead(key, guard, deadline).await,
                Flight::Follow(follower) => follower,
            };
            if self.inner.policy == InFlightPolicy::FailFast {
                debug!(key = %key, "duplicate in flight, failing fast");
                return Err(GateError::ConflictInFlight { key });
            }

            debug!(key = %key, "duplicate in flight, waiting");
            match FlightRegistry::wait(follower, deadline).await {
                Resolution::Stored(record) => match self.replay(&record) {
                    Ok(response) => return Ok(Admission::Replay(response)),
                    Err(e) => warn!(key = %key, error = %e, "unreplayable record from leader"),
                },
                Resolution::Released => debug!(key = %key, "leader released, retrying"),
                Resolution::TimedOut => {
                    debug!(key = %key, "gave up waiting for leader");
                    return Err(GateError::ConflictInFlight { key });
                }
            }
        }
    }

    async fn lead(
        &self,
        key: CacheKey,
        guard: FlightGuard,
        deadline: Instant,
    ) -> Result<Admission, GateError> {
        loop {
            // A previous leader may have stored between our peek and our lead.
            match self.peek(&key).await {
                Peek::Hit(response) => return Ok(Admission::Replay(response)),
                Peek::Unavailable => return Ok(self.uncached(key)),
                Peek::Miss => {}
            }

            match self.inner.store.claim(&key, self.inner.lease).await {
                Ok(Claim::Acquired(token)) => {
                    debug!(key = %key, "miss, forwarding");
                    return Ok(self.claimed(key, guard, token));
                }
                Ok(Claim::Held)
                    if self.inner.policy == InFlightPolicy::FailFast
                        || Instant::now() >= deadline =>
                {
                    debug!(key = %key, "claim held elsewhere");
                    return Err(GateError::ConflictInFlight { key });
                }
                Ok(Claim::Held) => tokio::time::sleep(self.inner.poll_interval).await,
                Err(e) => {
                    warn!(key = %key, error = %e, "claim failed, forwarding without caching");
                    return Ok(self.uncached(key));
                }
            }
        }
    }

    /// Settles a forwarded request: stores the captured response on
    /// [`Completion::Completed`], releases the claim otherwise.
    ///
    /// A failed store write is logged and reported as
    /// [`Settlement::Uncached`]; it never fails the request.
    pub async fn after(&self, ticket: Ticket, completion: Completion<'_>) -> Settlement {
        let Ticket {
            key,
            capture,
            lease,
        } = ticket;
        let Some(mut lease) = lease else {
            return Settlement::Uncached;
        };

        match completion {
            Completion::Completed(response) => {
                match lease.commit(capture.capture(response)).await {
                    Ok(()) => {
                        debug!(key = %key, status = response.status().as_u16(), "stored response");
                        Settlement::Stored
                    }
                    Err(e) => {
                        warn!(key = %key, error = %e, "failed to store response");
                        lease.release().await;
                        Settlement::Uncached
                    }
                }
            }
            Completion::Failed | Completion::Aborted => {
                debug!(key = %key, ?completion, "no final response, releasing claim");
                lease.release().await;
                Settlement::Released
            }
        }
    }

    /// Runs the whole protocol around `downstream`.
    ///
    /// `Err` from `downstream` and an elapsed downstream timeout release the
    /// claim and store nothing.
    ///
    /// # Errors
    ///
    /// [`GateError::ConflictInFlight`] from [`before`](Self::before),
    /// [`GateError::Downstream`] wrapping the downstream error, or
    /// [`GateError::DownstreamTimeout`].
    pub async fn execute<F, Fut, E>(
        &self,
        request: Request,
        downstream: F,
    ) -> Result<Response, GateError>
    where
        F: FnOnce(Request) -> Fut,
        Fut: Future<Output = Result<Response, E>>,
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        let ticket = match self.before(&request).await? {
            Admission::Passthrough => {
                return downstream(request)
                    .await
                    .map_err(|e| GateError::Downstream(e.into()));
            }
            Admission::Replay(response) => return Ok(response),
            Admission::Forward(ticket) => ticket,
        };

        let outcome = match self.inner.downstream_timeout {
            Some(limit) => match tokio::time::timeout(limit, downstream(request)).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(key = %ticket.key, ?limit, "downstream timed out");
                    self.after(ticket, Completion::Aborted).await;
                    return Err(GateError::DownstreamTimeout(limit));
                }
            },
            None => downstream(request).await,
        };

        match outcome {
            Ok(mut response) => {
                let settlement = self.after(ticket, Completion::Completed(&response)).await;
                self.mark(&mut response, settlement);
                Ok(response)
            }
            Err(e) => {
                self.after(ticket, Completion::Failed).await;
                Err(GateError::Downstream(e.into()))
            }
        }
    }

    async fn peek(&self, key: &CacheKey) -> Peek {
        match self.inner.store.lookup(key).await {
            Ok(Some(record)) => match self.replay(&record) {
                Ok(response) => {
                    debug!(key = %key, "hit, replaying");
                    Peek::Hit(response)
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "unreplayable record, treating as miss");
                    Peek::Miss
                }
            },
            Ok(None) => Peek::Miss,
            Err(e @ StoreError::MalformedCachedRecord { .. }) => {
                warn!(key = %key, error = %e, "treating malformed record as miss");
                Peek::Miss
            }
            Err(e) => {
                warn!(
                    key = %key,
                    backend = self.inner.store.name(),
                    error = %e,
                    "lookup failed, forwarding without caching"
                );
                Peek::Unavailable
            }
        }
    }

    fn replay(&self, record: &CachedResponse) -> Result<Response, StoreError> {
        let mut response = record.to_response()?;
        response.headers_mut().set(&*self.inner.indicator, HIT);
        Ok(response)
    }

    fn mark(&self, response: &mut Response, settlement: Settlement) {
        if settlement == Settlement::Stored {
            response.headers_mut().set(&*self.inner.indicator, MISS);
        }
    }

    fn uncached(&self, key: CacheKey) -> Admission {
        Admission::Forward(Ticket {
            key,
            capture: ResponseCapture::new(Arc::clone(&self.inner.indicator)),
            lease: None,
        })
    }

    fn claimed(&self, key: CacheKey, flight: FlightGuard, token: ClaimToken) -> Admission {
        Admission::Forward(Ticket {
            key: key.clone(),
            capture: ResponseCapture::new(Arc::clone(&self.inner.indicator)),
            lease: Some(Lease {
                key,
                store: Arc::clone(&self.inner.store),
                token,
                flight,
                settled: false,
            }),
        })
    }
}

// Saturates instead of panicking on absurdly long timeouts.
fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(365 * 24 * 60 * 60))
}
