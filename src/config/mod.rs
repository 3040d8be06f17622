//! Gate configuration.
//!
//! [`GateConfig`] is what [`IdempotencyGate::from_config`] consumes. It can
//! be built in code with the `with_*` setters or deserialized from any serde
//! format; the remote client handle is the one field that only exists in
//! code ([`GateConfig::with_client`]).
//!
//! Every problem is reported as a [`ConfigError`] at construction, before the
//! gate sees a request.
//!
//! [`IdempotencyGate::from_config`]: crate::gate::IdempotencyGate::from_config

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::KvClient;

/// Header carrying the client's idempotency token.
pub const DEFAULT_TOKEN_HEADER: &str = "Idempotency-Key";

/// Header marking replayed (`HIT`) and freshly stored (`MISS`) responses.
pub const DEFAULT_STATUS_HEADER: &str = "X-Cache-Status";

/// Construction-time configuration failures (the `InvalidConfiguration` condition).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid configuration: unknown backend `{0}` (expected `local` or `remote`)")]
    UnknownBackend(String),

    #[error("invalid configuration: local backend capacity must be greater than 0")]
    ZeroCapacity,

    #[error("invalid configuration: remote backend requires a client handle")]
    MissingClient,

    #[error("invalid configuration: `{field}` must be greater than 0")]
    ZeroDuration { field: &'static str },

    #[error("invalid configuration: `{field}` must not be empty")]
    EmptyField { field: &'static str },
}

/// Which built-in [`CacheStore`](crate::cache::CacheStore) backs the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Local,
    Remote,
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "local" => Ok(Self::Local),
            "remote" => Ok(Self::Remote),
            other => Err(ConfigError::UnknownBackend(other.to_owned())),
        }
    }
}

/// What a request does when an identical one is already being processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InFlightPolicy {
    /// Suspend until the first request settles, then replay its response.
    #[default]
    Wait,
    /// Return `ConflictInFlight` immediately.
    FailFast,
}

/// Configuration for [`IdempotencyGate`](crate::gate::IdempotencyGate).
///
/// | Field                   | Default            |
/// |-------------------------|--------------------|
/// | `backend`               | `"local"`          |
/// | `capacity`              | `10_000`           |
/// | `ttl_ms`                | none               |
/// | `in_flight`             | `wait`             |
/// | `lock_timeout_ms`       | `30_000`           |
/// | `lease_ms`              | `60_000`           |
/// | `poll_interval_ms`      | `50`               |
/// | `remote_timeout_ms`     | `2_000`            |
/// | `downstream_timeout_ms` | none               |
/// | `token_header`          | `Idempotency-Key`  |
/// | `status_header`         | `X-Cache-Status`   |
/// | `include_body_digest`   | `false`            |
/// | `namespace`             | `idempotency`      |
///
/// # Examples
///
/// ```
/// use retrysafe::config::{GateConfig, InFlightPolicy};
///
/// let config: GateConfig = serde_json::from_str(
///     r#"{ "backend": "local", "capacity": 512, "ttl_ms": 86400000, "in_flight": "fail_fast" }"#,
/// )
/// .unwrap();
///
/// assert_eq!(config.capacity, 512);
/// assert_eq!(config.in_flight, InFlightPolicy::FailFast);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// `"local"` or `"remote"`.
    pub backend: String,
    /// Maximum entries in the local store. Ignored by the remote backend.
    pub capacity: usize,
    pub ttl_ms: Option<u64>,
    pub in_flight: InFlightPolicy,
    /// Longest a duplicate waits for the first request to settle.
    pub lock_timeout_ms: u64,
    /// Expiry of a remote in-flight marker, so a crashed holder cannot wedge a key.
    pub lease_ms: u64,
    /// Re-check interval while another process holds the remote marker.
    pub poll_interval_ms: u64,
    pub remote_timeout_ms: u64,
    pub downstream_timeout_ms: Option<u64>,
    pub token_header: String,
    pub status_header: String,
    pub include_body_digest: bool,
    pub namespace: String,
    #[serde(skip)]
    pub client: Option<Arc<dyn KvClient>>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            backend: "local".to_owned(),
            capacity: 10_000,
            ttl_ms: None,
            in_flight: InFlightPolicy::Wait,
            lock_timeout_ms: 30_000,
            lease_ms: 60_000,
            poll_interval_ms: 50,
            remote_timeout_ms: 2_000,
            downstream_timeout_ms: None,
            token_header: DEFAULT_TOKEN_HEADER.to_owned(),
            status_header: DEFAULT_STATUS_HEADER.to_owned(),
            include_body_digest: false,
            namespace: crate::cache::remote::DEFAULT_NAMESPACE.to_owned(),
            client: None,
        }
    }
}

impl fmt::Debug for GateConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GateConfig")
            .field("backend", &self.backend)
            .field("capacity", &self.capacity)
            .field("ttl_ms", &self.ttl_ms)
            .field("in_flight", &self.in_flight)
            .field("lock_timeout_ms", &self.lock_timeout_ms)
            .field("lease_ms", &self.lease_ms)
            .field("downstream_timeout_ms", &self.downstream_timeout_ms)
            .field("token_header", &self.token_header)
            .field("client", &self.client.as_ref().map(|_| "<kv client>"))
            .finish_non_exhaustive()
    }
}

impl GateConfig {
    #[must_use]
    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = backend.into();
        self
    }

    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_ms = Some(millis(ttl));
        self
    }

    #[must_use]
    pub fn with_in_flight(mut self, policy: InFlightPolicy) -> Self {
        self.in_flight = policy;
        self
    }

    #[must_use]
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout_ms = millis(timeout);
        self
    }

    #[must_use]
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease_ms = millis(lease);
        self
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = millis(interval);
        self
    }

    #[must_use]
    pub fn with_downstream_timeout(mut self, timeout: Duration) -> Self {
        self.downstream_timeout_ms = Some(millis(timeout));
        self
    }

    #[must_use]
    pub fn with_token_header(mut self, name: impl Into<String>) -> Self {
        self.token_header = name.into();
        self
    }

    #[must_use]
    pub fn with_body_digest(mut self, enabled: bool) -> Self {
        self.include_body_digest = enabled;
        self
    }

    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Remote backend handle. Required when `backend` is `"remote"`.
    #[must_use]
    pub fn with_client(mut self, client: Arc<dyn KvClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_ms.map(Duration::from_millis)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }

    pub fn downstream_timeout(&self) -> Option<Duration> {
        self.downstream_timeout_ms.map(Duration::from_millis)
    }

    /// Checks the whole configuration and resolves the backend.
    ///
    /// # Errors
    ///
    /// The first [`ConfigError`] found.
    pub fn validate(&self) -> Result<BackendKind, ConfigError> {
        let kind: BackendKind = self.backend.parse()?;
        match kind {
            BackendKind::Local if self.capacity == 0 => return Err(ConfigError::ZeroCapacity),
            BackendKind::Remote if self.client.is_none() => {
                return Err(ConfigError::MissingClient);
            }
            BackendKind::Remote if self.namespace.is_empty() => {
                return Err(ConfigError::EmptyField { field: "namespace" });
            }
            _ => {}
        }
        self.validate_gate()?;
        Ok(kind)
    }

    /// Checks the settings the gate itself uses, whatever the store.
    pub(crate) fn validate_gate(&self) -> Result<(), ConfigError> {
        let timings = [
            ("ttl_ms", self.ttl_ms),
            ("lock_timeout_ms", Some(self.lock_timeout_ms)),
            ("lease_ms", Some(self.lease_ms)),
            ("poll_interval_ms", Some(self.poll_interval_ms)),
            ("remote_timeout_ms", Some(self.remote_timeout_ms)),
            ("downstream_timeout_ms", self.downstream_timeout_ms),
        ];
        if let Some(&(field, _)) = timings.iter().find(|(_, v)| *v == Some(0)) {
            return Err(ConfigError::ZeroDuration { field });
        }
        if self.token_header.trim().is_empty() {
            return Err(ConfigError::EmptyField {
                field: "token_header",
            });
        }
        if self.status_header.trim().is_empty() {
            return Err(ConfigError::EmptyField {
                field: "status_header",
            });
        }
        Ok(())
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
