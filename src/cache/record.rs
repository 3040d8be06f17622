//! The recorded response payload.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::http::{Headers, Response, StatusCode};

use super::StoreError;

/// A response as it looked at the completion instant, ready to replay.
///
/// Immutable once built: the gate only ever stores whole records, it never
/// merges into an existing one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    status: u16,
    headers: Headers,
    body: Bytes,
    /// Unix epoch milliseconds at capture time.
    stored_at_ms: u64,
}

impl CachedResponse {
    /// Records `status`, `headers`, and `body`, stamped with the current time.
    pub fn new(status: StatusCode, headers: Headers, body: Bytes) -> Self {
        Self {
            status: status.as_u16(),
            headers,
            body,
            stored_at_ms: now_ms(),
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn stored_at_ms(&self) -> u64 {
        self.stored_at_ms
    }

    /// Rebuilds the live [`Response`].
    ///
    /// # Errors
    ///
    /// [`StoreError::MalformedCachedRecord`] when the stored status is not a
    /// code this crate can emit (only reachable through a corrupted backend).
    pub fn to_response(&self) -> Result<Response, StoreError> {
        let status =
            StatusCode::from_u16(self.status).ok_or_else(|| StoreError::MalformedCachedRecord {
                reason: format!("unknown status code {}", self.status),
            })?;
        Ok(Response::from_parts(
            status,
            self.headers.clone(),
            self.body.clone(),
        ))
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
    use super::*;

    #[test]
    fn rebuilds_response_verbatim() {
        let headers: Headers = [("Content-Type", "application/json"), ("Set-Cookie", "a=1")]
            .into_iter()
            .collect();
        let record = CachedResponse::new(
            StatusCode::Created,
            headers.clone(),
            Bytes::from_static(b"{\"id\":1}"),
        );

        let response = record.to_response().unwrap();
        assert_eq!(response.status(), StatusCode::Created);
        assert_eq!(response.headers(), &headers);
        assert_eq!(response.body_bytes().as_ref(), b"{\"id\":1}");
        assert!(record.stored_at_ms() > 0);
    }

    #[test]
    fn unknown_status_is_malformed() {
        let json = r#"{"status":799,"headers":[],"body":[],"stored_at_ms":1}"#;
        let record: CachedResponse = serde_json::from_str(json).unwrap();
        assert!(matches!(
            record.to_response(),
            Err(StoreError::MalformedCachedRecord { .. })
        ));
    }
}
