//! Inbound request as handed to the gate by its host.

use bytes::Bytes;

use super::{Headers, Method};

/// An inbound HTTP request.
///
/// The transport that produced it is somebody else's concern; the gate reads
/// the method, the path, one header, and (optionally) the body.
///
/// # Examples
///
/// ```
/// use retrysafe::http::{Method, Request};
///
/// let request = Request::new(Method::Post, "/payments?dry_run=1")
///     .header("Idempotency-Key", "8e2f")
///     .body("{\"amount\":10}");
///
/// assert_eq!(request.path(), "/payments");
/// assert_eq!(request.query_string(), Some("dry_run=1"));
/// assert_eq!(request.headers().get("idempotency-key"), Some("8e2f"));
/// ```
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    path: String,
    query: Option<String>,
    headers: Headers,
    body: Bytes,
}

impl Request {
    /// Creates a request for `target`, splitting off any `?query` suffix.
    pub fn new(method: Method, target: impl AsRef<str>) -> Self {
        let target = target.as_ref();
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path.to_owned(), Some(query.to_owned())),
            None => (target.to_owned(), None),
        };
        Self {
            method,
            path,
            query,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    /// Appends a request header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Sets the request body.
    #[must_use]
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Returns the request path (without the query string).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the raw query string (without the leading `?`), if any.
    pub fn query_string(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the request body bytes.
    pub fn body_bytes(&self) -> &Bytes {
        &self.body
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_query_from_path() {
        let req = Request::new(Method::Get, "/search?q=rust&page=2");
        assert_eq!(req.path(), "/search");
        assert_eq!(req.query_string(), Some("q=rust&page=2"));
    }

    #[test]
    fn target_without_query() {
        let req = Request::new(Method::Delete, "/orders/7");
        assert_eq!(req.path(), "/orders/7");
        assert_eq!(req.query_string(), None);
        assert!(req.body_bytes().is_empty());
    }

    #[test]
    fn body_and_headers() {
        let req = Request::new(Method::Post, "/orders")
            .header("Content-Type", "application/json")
            .body(&b"{}"[..]);
        assert_eq!(req.headers().get("content-type"), Some("application/json"));
        assert_eq!(req.body_bytes().as_ref(), b"{}");
    }
}
