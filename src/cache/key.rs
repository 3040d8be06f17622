//! Cache key derivation.
//!
//! A token is only unique within one logical operation, so the key scopes it
//! to the route: `SHA-256(len‖method ‖ len‖path ‖ len‖token [‖ len‖SHA-256(body)])`.
//! Every component is length-prefixed with a big-endian `u64`, which keeps the
//! encoding injective whatever bytes the components contain.

use std::fmt;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::http::Request;

/// Derived identifier for one (method, path, token) operation.
///
/// Hex-encoded SHA-256, computed once per request. Cloning is cheap.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(Arc<str>);

impl CacheKey {
    pub(crate) fn from_digest(hex: String) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Derives [`CacheKey`]s from requests.
///
/// # Examples
///
/// ```
/// use retrysafe::cache::KeyGenerator;
/// use retrysafe::http::{Method, Request};
///
/// let keys = KeyGenerator::new();
/// let charge = Request::new(Method::Post, "/charges");
/// let refund = Request::new(Method::Post, "/refunds");
///
/// assert_eq!(keys.generate(&charge, "t-1"), keys.generate(&charge, "t-1"));
/// assert_ne!(keys.generate(&charge, "t-1"), keys.generate(&refund, "t-1"));
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyGenerator {
    include_body_digest: bool,
}

impl KeyGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the SHA-256 of the request body as a key component, so a token
    /// reused with a different payload is a different operation.
    #[must_use]
    pub fn with_body_digest(mut self, enabled: bool) -> Self {
        self.include_body_digest = enabled;
        self
    }

    /// Derives the key for `request` under `token`. Pure and total.
    pub fn generate(&self, request: &Request, token: &str) -> CacheKey {
        let mut hasher = Sha256::new();
        absorb(&mut hasher, request.method().as_str().as_bytes());
        absorb(&mut hasher, normalize_path(request.path()).as_bytes());
        absorb(&mut hasher, token.as_bytes());
        if self.include_body_digest {
            let body_digest = Sha256::digest(request.body_bytes());
            absorb(&mut hasher, &body_digest);
        }
        CacheKey::from_digest(format!("{:x}", hasher.finalize()))
    }
}

fn absorb(hasher: &mut Sha256, component: &[u8]) {
    hasher.update((component.len() as u64).to_be_bytes());
    hasher.update(component);
}

// `/orders/` and `/orders` name the same route; the root stays `/`.
fn normalize_path(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() { "/" } else { trimmed }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Method;

    fn post(path: &str) -> Request {
        Request::new(Method::Post, path)
    }

    #[test]
    fn same_operation_same_key() {
        let keys = KeyGenerator::new();
        assert_eq!(
            keys.generate(&post("/orders"), "abc"),
            keys.generate(&post("/orders"), "abc")
        );
    }

    #[test]
    fn method_and_path_scope_the_token() {
        let keys = KeyGenerator::new();
        let base = keys.generate(&post("/orders"), "abc");
        assert_ne!(base, keys.generate(&post("/invoices"), "abc"));
        assert_ne!(
            base,
            keys.generate(&Request::new(Method::Put, "/orders"), "abc")
        );
        assert_ne!(base, keys.generate(&post("/orders"), "abd"));
    }

    #[test]
    fn trailing_slash_is_normalized() {
        let keys = KeyGenerator::new();
        assert_eq!(
            keys.generate(&post("/orders/"), "abc"),
            keys.generate(&post("/orders"), "abc")
        );
        assert_eq!(normalize_path("///"), "/");
        assert_eq!(normalize_path("/"), "/");
    }

    #[test]
    fn query_string_does_not_change_key() {
        let keys = KeyGenerator::new();
        assert_eq!(
            keys.generate(&post("/orders?retry=2"), "abc"),
            keys.generate(&post("/orders"), "abc")
        );
    }

    #[test]
    fn components_cannot_slide_across_boundaries() {
        let keys = KeyGenerator::new();
        // "/a" + "b:c" versus "/a:b" + "c" would collide under naive joining.
        assert_ne!(
            keys.generate(&post("/a"), "b:c"),
            keys.generate(&post("/a:b"), "c")
        );
    }

    #[test]
    fn body_digest_only_when_enabled() {
        let plain = KeyGenerator::new();
        let digest = KeyGenerator::new().with_body_digest(true);
        let a = post("/orders").body("{\"qty\":1}");
        let b = post("/orders").body("{\"qty\":2}");

        assert_eq!(plain.generate(&a, "t"), plain.generate(&b, "t"));
        assert_ne!(digest.generate(&a, "t"), digest.generate(&b, "t"));
        assert_ne!(plain.generate(&a, "t"), digest.generate(&a, "t"));
    }

    #[test]
    fn key_is_hex_sha256() {
        let key = KeyGenerator::new().generate(&post("/x"), "t");
        assert_eq!(key.as_str().len(), 64);
        assert!(key.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }
}
