//! Response builder.
//!
//! Downstream handlers build a [`Response`] with the fluent API; middleware
//! decorates it in place through [`Response::add_header`] and
//! [`Response::headers_mut`].

use bytes::Bytes;

use super::{Headers, StatusCode};

/// An HTTP response produced by the downstream pipeline or replayed by the gate.
///
/// # Examples
///
/// ```
/// use retrysafe::http::{Response, StatusCode};
///
/// let response = Response::new(StatusCode::Created)
///     .header("Content-Type", "application/json")
///     .body(r#"{"id":17}"#);
///
/// assert_eq!(response.status(), StatusCode::Created);
/// assert_eq!(response.body_bytes().as_ref(), br#"{"id":17}"#);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    status: StatusCode,
    headers: Headers,
    body: Bytes,
}

impl Response {
    /// Creates a new response with the given status and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    /// Assembles a response from already-materialized parts.
    pub fn from_parts(status: StatusCode, headers: Headers, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// Appends a response header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Appends a header in-place. Intended for middleware pipelines that receive
    /// a `Response` from downstream and need to decorate it without consuming it.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name, value);
    }

    /// Sets the response body.
    #[must_use]
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn body_bytes(&self) -> &Bytes {
        &self.body
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_parts() {
        let r = Response::new(StatusCode::Ok)
            .header("X-Request-Id", "abc-123")
            .body("ok");
        assert_eq!(r.headers().get("x-request-id"), Some("abc-123"));
        assert_eq!(r.body_bytes().as_ref(), b"ok");
    }

    #[test]
    fn add_header_is_additive() {
        let mut r = Response::new(StatusCode::NoContent).header("Vary", "Origin");
        r.add_header("Vary", "Accept");
        let vary: Vec<_> = r.headers().get_all("vary").collect();
        assert_eq!(vary, vec!["Origin", "Accept"]);
    }

    #[test]
    fn default_is_empty_ok() {
        let r = Response::default();
        assert_eq!(r.status(), StatusCode::Ok);
        assert!(r.headers().is_empty());
        assert!(r.body_bytes().is_empty());
    }
}
