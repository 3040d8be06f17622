use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::{KvClient, KvError};

struct Value {
    bytes: Vec<u8>,
    ttl: Option<Duration>,
    expires_at: Option<Instant>,
}

impl Value {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

/// In-process [`KvClient`] with `SET NX` and expiry semantics.
///
/// Stands in for a real service in development and tests. Expired values
/// are dropped on access.
#[derive(Default)]
pub struct MemoryKv {
    values: Mutex<HashMap<String, Value>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a live value exists for `key`.
    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.values.lock().get(key).is_some_and(|v| v.live(now))
    }

    /// The TTL the live value for `key` was written with.
    pub fn expiry_of(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.values
            .lock()
            .get(key)
            .filter(|v| v.live(now))
            .and_then(|v| v.ttl)
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.values.lock().values().filter(|v| v.live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn write(
        &self,
        key: &str,
        bytes: Vec<u8>,
        ttl: Option<Duration>,
        only_if_absent: bool,
    ) -> bool {
        let now = Instant::now();
        let mut values = self.values.lock();
        if only_if_absent && values.get(key).is_some_and(|v| v.live(now)) {
            return false;
        }
        values.insert(
            key.to_owned(),
            Value {
                bytes,
                ttl,
                expires_at: ttl.and_then(|ttl| now.checked_add(ttl)),
            },
        );
        true
    }
}

#[async_trait]
impl KvClient for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let now = Instant::now();
        let mut values = self.values.lock();
        match values.get(key) {
            Some(v) if v.live(now) => return Ok(Some(v.bytes.clone())),
            Some(_) => {}
            None => return Ok(None),
        }
        values.remove(key);
        Ok(None)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), KvError> {
        self.write(key, value, ttl, false);
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<bool, KvError> {
        Ok(self.write(key, value, Some(ttl), true))
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.values.lock().remove(key);
        Ok(())
    }

    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool, KvError> {
        let now = Instant::now();
        let mut values = self.values.lock();
        let matches = values
            .get(key)
            .is_some_and(|v| v.live(now) && v.bytes == expected);
        if matches {
            values.remove(key);
        }
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_if_absent_respects_existing_value() {
        let kv = MemoryKv::new();
        let lease = Duration::from_secs(5);
        assert!(kv.set_if_absent("k", b"one".to_vec(), lease).await.unwrap());
        assert!(!kv.set_if_absent("k", b"two".to_vec(), lease).await.unwrap());
        assert_eq!(kv.get("k").await.unwrap(), Some(b"one".to_vec()));
    }

    #[tokio::test(start_paused = true)]
    async fn values_expire() {
        let kv = MemoryKv::new();
        kv.set("k", b"v".to_vec(), Some(Duration::from_secs(1)))
            .await
            .unwrap();
        kv.set("forever", b"v".to_vec(), None).await.unwrap();

        tokio::time::advance(Duration::from_millis(1500)).await;
        assert_eq!(kv.get("k").await.unwrap(), None);
        assert_eq!(kv.len(), 1);
        // an expired marker no longer blocks a claim
        assert!(kv
            .set_if_absent("k", b"again".to_vec(), Duration::from_secs(1))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let kv = MemoryKv::new();
        kv.set("k", b"v".to_vec(), None).await.unwrap();
        kv.delete("k").await.unwrap();
        kv.delete("k").await.unwrap();
        assert!(kv.is_empty());
    }

    #[tokio::test]
    async fn delete_if_equals_only_removes_matching_value() {
        let kv = MemoryKv::new();
        kv.set("k", b"mine".to_vec(), None).await.unwrap();
        assert!(!kv.delete_if_equals("k", b"theirs").await.unwrap());
        assert!(kv.contains("k"));
        assert!(kv.delete_if_equals("k", b"mine").await.unwrap());
        assert!(!kv.contains("k"));
        assert!(!kv.delete_if_equals("k", b"mine").await.unwrap());
    }
}
