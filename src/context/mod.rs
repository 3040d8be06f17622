//! Per-request context passed through the middleware chain.
//!
//! Carries the [`Request`] plus a type-keyed [`Extensions`] map. The gate
//! publishes the request's [`CacheKey`](crate::cache::CacheKey) there before
//! forwarding, so downstream handlers can correlate logs with it.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
};

use crate::Request;

/// Type-erased request extensions map: used to inject per-request state
/// into handlers without requiring handlers to know about each other's types.
#[derive(Default)]
pub struct Extensions {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `value`, returning the previous value of the same type.
    pub fn insert<T>(&mut self, value: T) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old)
    }

    pub fn get<T>(&self) -> Option<&T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    pub fn remove<T>(&mut self) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| *value)
    }
}

/// Per-request context: the request and its extensions.
pub struct Context {
    request: Request,
    extensions: Extensions,
}

impl Context {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            extensions: Extensions::new(),
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    /// Consumes the context, returning the request.
    pub fn into_request(self) -> Request {
        self.request
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Method;

    #[derive(Debug, PartialEq)]
    struct TraceId(u64);

    #[test]
    fn extensions_are_keyed_by_type() {
        let mut ext = Extensions::new();
        assert!(ext.insert(TraceId(1)).is_none());
        assert_eq!(ext.insert(TraceId(2)), Some(TraceId(1)));
        assert_eq!(ext.get::<TraceId>(), Some(&TraceId(2)));
        assert!(ext.get::<String>().is_none());
        assert_eq!(ext.remove::<TraceId>(), Some(TraceId(2)));
        assert!(ext.get::<TraceId>().is_none());
    }

    #[test]
    fn context_round_trips_request() {
        let mut ctx = Context::new(Request::new(Method::Get, "/health"));
        ctx.extensions_mut().insert(TraceId(9));
        assert_eq!(ctx.request().path(), "/health");
        assert_eq!(ctx.extensions().get::<TraceId>(), Some(&TraceId(9)));
        assert_eq!(ctx.into_request().path(), "/health");
    }
}
