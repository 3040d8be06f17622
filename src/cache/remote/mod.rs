//! Remote backend: a [`CacheStore`] over an external key-value service.
//!
//! Values are JSON documents of one of two shapes, written under
//! `{namespace}:{cache_key}`:
//!
//! - `{"in_flight":{"owner":…,"claimed_at_ms":…}}`: the marker written by
//!   [`CacheStore::claim`] with `SET NX` and a lease expiry. `owner` is a
//!   fresh UUID per claim; release compares the whole marker before deleting.
//! - `{"completed":{"response":{…}}}`: the recorded response.
//!
//! Expiry of completed records belongs to the service; the optional TTL is
//! passed through on every write and nothing here bounds size. A value that
//! decodes as neither shape is deleted on lookup so the key can be claimed.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{CacheKey, CacheStore, CachedResponse, Claim, ClaimToken, StoreError};

mod memory;
#[cfg(feature = "redis")]
mod redis_client;

pub use memory::MemoryKv;

/// Default namespace prefixed to every remote key.
pub const DEFAULT_NAMESPACE: &str = "idempotency";

/// Default bound on a single remote round trip.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors reported by a [`KvClient`].
#[derive(Debug, Error)]
pub enum KvError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("operation timed out")]
    Timeout,

    #[error("backend error: {0}")]
    Backend(String),
}

/// Minimal async key-value protocol the remote store needs.
///
/// `set_if_absent` must be atomic on the service side (`SET NX` semantics);
/// that is the only primitive the cross-process claim relies on.
#[async_trait]
pub trait KvClient: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), KvError>;

    /// Writes `value` only if `key` is absent. Returns `true` when written.
    async fn set_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<bool, KvError>;

    async fn delete(&self, key: &str) -> Result<(), KvError>;

    /// Deletes `key` only if it currently holds exactly `expected`. Returns
    /// `true` when deleted. Must be atomic on the service side.
    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool, KvError>;
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum RemoteRecord {
    InFlight { owner: String, claimed_at_ms: u64 },
    Completed { response: CachedResponse },
}

/// [`CacheStore`] adapter over a shared [`KvClient`].
///
/// Every call is awaited to completion (bounded by the operation timeout)
/// before the gate decides anything, and every client failure surfaces as
/// [`StoreError::BackendUnavailable`], never as an empty lookup.
pub struct RemoteStore {
    client: Arc<dyn KvClient>,
    namespace: String,
    ttl: Option<Duration>,
    op_timeout: Duration,
}

impl RemoteStore {
    pub fn new(client: Arc<dyn KvClient>) -> Self {
        Self {
            client,
            namespace: DEFAULT_NAMESPACE.to_owned(),
            ttl: None,
            op_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Expiry handed to the service with every completed record.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout = timeout;
        self
    }

    fn remote_key(&self, key: &CacheKey) -> String {
        format!("{}:{}", self.namespace, key)
    }

    async fn call<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = Result<T, KvError>>,
    ) -> Result<T, StoreError> {
        let unavailable = |reason: String| StoreError::BackendUnavailable {
            backend: "remote",
            reason: format!("{op}: {reason}"),
        };
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(unavailable(e.to_string())),
            Err(_) => Err(unavailable(format!("no reply within {:?}", self.op_timeout))),
        }
    }

    // Removes a value that failed to decode, unless it changed meanwhile.
    async fn purge(&self, key: &CacheKey, remote_key: &str, raw: &[u8]) {
        match self
            .call("purge", self.client.delete_if_equals(remote_key, raw))
            .await
        {
            Ok(true) => debug!(key = %key, "deleted undecodable remote value"),
            Ok(false) => {}
            Err(e) => warn!(key = %key, error = %e, "failed to delete undecodable remote value"),
        }
    }
}

fn encode(record: &RemoteRecord) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(record).map_err(|e| StoreError::MalformedCachedRecord {
        reason: format!("encode: {e}"),
    })
}

#[async_trait]
impl CacheStore for RemoteStore {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn lookup(&self, key: &CacheKey) -> Result<Option<CachedResponse>, StoreError> {
        let remote_key = self.remote_key(key);
        let Some(raw) = self.call("get", self.client.get(&remote_key)).await? else {
            return Ok(None);
        };
        match serde_json::from_slice::<RemoteRecord>(&raw) {
            Ok(RemoteRecord::Completed { response }) => Ok(Some(response)),
            Ok(RemoteRecord::InFlight { .. }) => {
                debug!(key = %key, "remote marker present, no record yet");
                Ok(None)
            }
            Err(e) => {
                self.purge(key, &remote_key, &raw).await;
                Err(StoreError::MalformedCachedRecord {
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn store(&self, key: &CacheKey, response: &CachedResponse) -> Result<(), StoreError> {
        let value = encode(&RemoteRecord::Completed {
            response: response.clone(),
        })?;
        let remote_key = self.remote_key(key);
        self.call("set", self.client.set(&remote_key, value, self.ttl))
            .await
    }

    async fn remove(&self, key: &CacheKey) -> Result<(), StoreError> {
        let remote_key = self.remote_key(key);
        self.call("delete", self.client.delete(&remote_key)).await
    }

    async fn claim(&self, key: &CacheKey, lease: Duration) -> Result<Claim, StoreError> {
        let marker = encode(&RemoteRecord::InFlight {
            owner: Uuid::new_v4().to_string(),
            claimed_at_ms: now_ms(),
        })?;
        let remote_key = self.remote_key(key);
        let written = self
            .call(
                "claim",
                self.client.set_if_absent(&remote_key, marker.clone(), lease),
            )
            .await?;
        Ok(if written {
            Claim::Acquired(ClaimToken::new(marker))
        } else {
            Claim::Held
        })
    }

    async fn release(&self, key: &CacheKey, token: &ClaimToken) -> Result<(), StoreError> {
        let remote_key = self.remote_key(key);
        let deleted = self
            .call(
                "release",
                self.client.delete_if_equals(&remote_key, token.as_bytes()),
            )
            .await?;
        if !deleted {
            debug!(key = %key, "marker expired or taken over, nothing to release");
        }
        Ok(())
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::http::{Headers, StatusCode};

    fn key(name: &str) -> CacheKey {
        CacheKey::from_digest(name.to_owned())
    }

    fn record() -> CachedResponse {
        let headers: Headers = [("Content-Type", "text/plain")].into_iter().collect();
        CachedResponse::new(StatusCode::Accepted, headers, Bytes::from_static(b"queued"))
    }

    struct DownKv;

    #[async_trait]
    impl KvClient for DownKv {
        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, KvError> {
            Err(KvError::Connection("refused".into()))
        }
        async fn set(
            &self,
            _key: &str,
            _value: Vec<u8>,
            _ttl: Option<Duration>,
        ) -> Result<(), KvError> {
            Err(KvError::Connection("refused".into()))
        }
        async fn set_if_absent(
            &self,
            _key: &str,
            _value: Vec<u8>,
            _ttl: Duration,
        ) -> Result<bool, KvError> {
            Err(KvError::Timeout)
        }
        async fn delete(&self, _key: &str) -> Result<(), KvError> {
            Err(KvError::Backend("READONLY".into()))
        }
        async fn delete_if_equals(&self, _key: &str, _expected: &[u8]) -> Result<bool, KvError> {
            Err(KvError::Backend("READONLY".into()))
        }
    }

    struct StalledKv;

    #[async_trait]
    impl KvClient for StalledKv {
        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, KvError> {
            std::future::pending().await
        }
        async fn set(
            &self,
            _key: &str,
            _value: Vec<u8>,
            _ttl: Option<Duration>,
        ) -> Result<(), KvError> {
            std::future::pending().await
        }
        async fn set_if_absent(
            &self,
            _key: &str,
            _value: Vec<u8>,
            _ttl: Duration,
        ) -> Result<bool, KvError> {
            std::future::pending().await
        }
        async fn delete(&self, _key: &str) -> Result<(), KvError> {
            std::future::pending().await
        }
        async fn delete_if_equals(&self, _key: &str, _expected: &[u8]) -> Result<bool, KvError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn store_then_lookup_under_namespace() {
        let kv = Arc::new(MemoryKv::new());
        let store = RemoteStore::new(kv.clone()).with_namespace("orders");

        let rec = record();
        store.store(&key("k1"), &rec).await.unwrap();
        assert!(kv.contains("orders:k1"));

        let hit = store.lookup(&key("k1")).await.unwrap().unwrap();
        assert_eq!(hit, rec);
    }

    #[tokio::test]
    async fn claim_is_exclusive_and_reads_as_absent() {
        let kv = Arc::new(MemoryKv::new());
        let store = RemoteStore::new(kv);
        let lease = Duration::from_secs(30);

        assert!(matches!(
            store.claim(&key("k"), lease).await.unwrap(),
            Claim::Acquired(_)
        ));
        assert_eq!(store.claim(&key("k"), lease).await.unwrap(), Claim::Held);
        assert!(store.lookup(&key("k")).await.unwrap().is_none());

        // the record overwrites the marker; a completed key cannot be re-claimed
        store.store(&key("k"), &record()).await.unwrap();
        assert!(store.lookup(&key("k")).await.unwrap().is_some());
        assert_eq!(store.claim(&key("k"), lease).await.unwrap(), Claim::Held);
    }

    fn acquired(claim: Claim) -> ClaimToken {
        match claim {
            Claim::Acquired(token) => token,
            Claim::Held => panic!("expected to acquire the claim"),
        }
    }

    #[tokio::test]
    async fn release_clears_own_marker() {
        let kv = Arc::new(MemoryKv::new());
        let store = RemoteStore::new(kv.clone());
        let lease = Duration::from_secs(30);

        let token = acquired(store.claim(&key("k"), lease).await.unwrap());
        store.release(&key("k"), &token).await.unwrap();
        assert!(!kv.contains("idempotency:k"));
        acquired(store.claim(&key("k"), lease).await.unwrap());
    }

    #[tokio::test]
    async fn marker_carries_a_unique_owner() {
        let kv = Arc::new(MemoryKv::new());
        let store = RemoteStore::new(kv.clone());
        let lease = Duration::from_secs(30);

        let first = acquired(store.claim(&key("a"), lease).await.unwrap());
        let second = acquired(store.claim(&key("b"), lease).await.unwrap());
        assert_ne!(first, second);

        let raw = kv.get("idempotency:a").await.unwrap().unwrap();
        assert_eq!(raw, first.as_bytes());
        match serde_json::from_slice::<RemoteRecord>(&raw).unwrap() {
            RemoteRecord::InFlight { owner, .. } => assert!(Uuid::parse_str(&owner).is_ok()),
            RemoteRecord::Completed { .. } => panic!("expected a marker"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stale_release_keeps_the_new_holders_marker() {
        let kv = Arc::new(MemoryKv::new());
        let store = RemoteStore::new(kv.clone());
        let lease = Duration::from_millis(100);

        let stale = acquired(store.claim(&key("k"), lease).await.unwrap());
        tokio::time::advance(Duration::from_millis(150)).await;
        let current = acquired(store.claim(&key("k"), Duration::from_secs(30)).await.unwrap());

        // the first holder outlived its lease and now gives up
        store.release(&key("k"), &stale).await.unwrap();
        assert!(kv.contains("idempotency:k"));
        assert_eq!(store.claim(&key("k"), lease).await.unwrap(), Claim::Held);

        store.release(&key("k"), &current).await.unwrap();
        acquired(store.claim(&key("k"), lease).await.unwrap());
    }

    #[tokio::test]
    async fn client_errors_are_unavailable_not_misses() {
        let store = RemoteStore::new(Arc::new(DownKv));
        assert!(matches!(
            store.lookup(&key("k")).await,
            Err(StoreError::BackendUnavailable { backend: "remote", .. })
        ));
        assert!(store.store(&key("k"), &record()).await.is_err());
        assert!(store.claim(&key("k"), Duration::from_secs(1)).await.is_err());
        assert!(store.remove(&key("k")).await.is_err());
        assert!(
            store
                .release(&key("k"), &ClaimToken::new("x"))
                .await
                .is_err()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_backend_times_out() {
        let store =
            RemoteStore::new(Arc::new(StalledKv)).with_operation_timeout(Duration::from_millis(50));
        let err = store.lookup(&key("k")).await.unwrap_err();
        assert!(matches!(err, StoreError::BackendUnavailable { .. }));
        assert!(err.to_string().contains("get"));
    }

    #[tokio::test]
    async fn corrupt_value_is_malformed_and_purged() {
        let kv = Arc::new(MemoryKv::new());
        kv.set("idempotency:k", b"not json".to_vec(), None)
            .await
            .unwrap();
        let store = RemoteStore::new(kv.clone());
        assert!(matches!(
            store.lookup(&key("k")).await,
            Err(StoreError::MalformedCachedRecord { .. })
        ));

        assert!(!kv.contains("idempotency:k"));
        assert!(store.lookup(&key("k")).await.unwrap().is_none());
        acquired(store.claim(&key("k"), Duration::from_secs(1)).await.unwrap());
    }

    #[test]
    fn encode_produces_decodable_documents() {
        let bytes = encode(&RemoteRecord::Completed { response: record() }).unwrap();
        assert!(!bytes.is_empty());
        assert!(matches!(
            serde_json::from_slice::<RemoteRecord>(&bytes).unwrap(),
            RemoteRecord::Completed { .. }
        ));
    }

    #[tokio::test]
    async fn ttl_is_passed_to_the_service() {
        let kv = Arc::new(MemoryKv::new());
        let store = RemoteStore::new(kv.clone()).with_ttl(Some(Duration::from_secs(60)));
        store.store(&key("k"), &record()).await.unwrap();
        assert_eq!(kv.expiry_of("idempotency:k"), Some(Duration::from_secs(60)));
    }
}
