//! Response cache: key derivation, the [`CacheStore`] seam, and its backends.
//!
//! - [`BoundedLocalStore`]: in-process, fixed capacity, strict LRU.
//! - [`RemoteStore`]: adapter over an external key-value service reached
//!   through a [`KvClient`].
//! - Custom: implement [`CacheStore`] and hand it to
//!   [`IdempotencyGate::with_store`](crate::gate::IdempotencyGate::with_store).

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

pub mod key;
pub mod local;
pub mod record;
pub mod remote;

pub use key::{CacheKey, KeyGenerator};
pub use local::BoundedLocalStore;
pub use record::CachedResponse;
pub use remote::{KvClient, KvError, MemoryKv, RemoteStore};

/// Per-operation store failures.
///
/// Neither variant ever fails a request: the gate downgrades both to a MISS.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend could not be reached or did not answer in time.
    /// The gate forwards the request and skips caching it.
    #[error("cache backend `{backend}` unavailable: {reason}")]
    BackendUnavailable {
        backend: &'static str,
        reason: String,
    },

    /// A stored record could not be decoded. Treated as absent.
    #[error("malformed cached record: {reason}")]
    MalformedCachedRecord { reason: String },
}

/// Outcome of [`CacheStore::claim`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// The caller now owns the in-flight marker for the key.
    Acquired(ClaimToken),
    /// Another holder's marker is live.
    Held,
}

/// Proof of one successful claim, handed back to [`CacheStore::release`].
///
/// Opaque to the gate. Stores that write a marker put whatever identifies
/// that marker here, so a release can only ever remove its own.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClaimToken(Bytes);

impl ClaimToken {
    pub fn new(owner: impl Into<Bytes>) -> Self {
        Self(owner.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Storage behind the gate: `CacheKey → CachedResponse`.
///
/// # Contract
///
/// - `lookup` distinguishes "no prior response" (`Ok(None)`) from "could not
///   check" (`Err`). An in-flight marker reads as `Ok(None)`.
/// - `store` is last-write-wins and overwrites any marker for the key.
/// - `release` clears a marker after a failed or aborted request, and only
///   if the marker still belongs to the given claim.
/// - Implementations must be safe under concurrent calls for the same key and
///   must not let one key's operations affect another's.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Short backend name used in logs and errors.
    fn name(&self) -> &'static str;

    async fn lookup(&self, key: &CacheKey) -> Result<Option<CachedResponse>, StoreError>;

    async fn store(&self, key: &CacheKey, response: &CachedResponse) -> Result<(), StoreError>;

    async fn remove(&self, key: &CacheKey) -> Result<(), StoreError>;

    /// Atomically writes an in-flight marker for `key` unless one (or a
    /// record) is already present. The marker expires after `lease`.
    ///
    /// Stores private to one process can rely on the gate's own in-flight
    /// registry and keep this default, which always reports `Acquired`.
    async fn claim(&self, _key: &CacheKey, _lease: Duration) -> Result<Claim, StoreError> {
        Ok(Claim::Acquired(ClaimToken::default()))
    }

    /// Gives up the claim `token` came from without storing anything.
    ///
    /// The default suits stores without markers and simply removes the key.
    async fn release(&self, key: &CacheKey, _token: &ClaimToken) -> Result<(), StoreError> {
        self.remove(key).await
    }
}
