//! One-shot capture of the forwarded request's final response.

use std::sync::Arc;

use crate::cache::CachedResponse;
use crate::http::Response;

/// Records the final status, headers, and body of a forwarded request.
///
/// Consumed by [`capture`](Self::capture), so it fires at most once. The
/// record is a snapshot: headers are copied, and the body is an immutable
/// [`Bytes`](bytes::Bytes) handle the pipeline cannot change afterwards.
/// The gate's own indicator header is never recorded.
#[derive(Debug)]
pub struct ResponseCapture {
    indicator: Arc<str>,
}

impl ResponseCapture {
    pub(crate) fn new(indicator: Arc<str>) -> Self {
        Self { indicator }
    }

    pub fn capture(self, response: &Response) -> CachedResponse {
        let mut headers = response.headers().clone();
        headers.remove(&self.indicator);
        CachedResponse::new(response.status(), headers, response.body_bytes().clone())
    }
}
