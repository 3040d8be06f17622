//! [`KvClient`] for Redis, enabled with the `redis` feature.
//!
//! ```ignore
//! let client = redis::Client::open("redis://localhost:6379")?;
//! let manager = redis::aio::ConnectionManager::new(client).await?;
//! let config = GateConfig::default()
//!     .with_backend("remote")
//!     .with_client(Arc::new(manager));
//! ```

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::RedisError;

use super::{KvClient, KvError};

impl From<RedisError> for KvError {
    fn from(e: RedisError) -> Self {
        if e.is_timeout() {
            KvError::Timeout
        } else if e.is_connection_dropped() || e.is_connection_refusal() {
            KvError::Connection(e.to_string())
        } else {
            KvError::Backend(e.to_string())
        }
    }
}

// Compare-and-delete, so a holder whose lease ran out cannot remove a
// marker that now belongs to someone else.
const DELETE_IF_EQUALS_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

fn millis(d: Duration) -> u64 {
    // PX 0 is rejected by the server
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl KvClient for ConnectionManager {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let mut conn = self.clone();
        let value: Option<Vec<u8>> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), KvError> {
        let mut conn = self.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(millis(ttl));
        }
        let () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<bool, KvError> {
        let mut conn = self.clone();
        // SET key value NX PX ms → "OK" when written, nil when the key exists
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        let mut conn = self.clone();
        let _removed: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }

    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool, KvError> {
        let mut conn = self.clone();
        let removed: i64 = redis::Script::new(DELETE_IF_EQUALS_SCRIPT)
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }
}
