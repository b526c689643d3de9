//! Per-request context: the request plus type-keyed extensions.
//!
//! Upstream middleware can stash values in [`Extensions`] (an authenticated
//! principal, a tenant id) for downstream layers such as a custom cache-key
//! strategy to read.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    fmt,
};

use crate::Request;

/// Values keyed by their type, set by one middleware and read by another.
#[derive(Default)]
pub struct Extensions {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, replacing any previous value of the same type
    pub fn insert<T>(&mut self, value: T)
    where
        T: Send + Sync + 'static,
    {
        self.map.insert(TypeId::of::<T>(), Box::new(value));
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

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl fmt::Debug for Extensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extensions").field("len", &self.len()).finish()
    }
}

/// What every middleware receives for one request.
#[derive(Debug)]
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

    pub fn into_request(self) -> Request {
        self.request
    }
}

impl From<Request> for Context {
    fn from(request: Request) -> Self {
        Self::new(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Method;

    #[derive(Debug, PartialEq)]
    struct Tenant(&'static str);

    #[test]
    fn extensions_are_type_keyed() {
        let mut ctx = Context::new(Request::new(Method::Get, "/"));
        assert!(ctx.extensions().is_empty());

        ctx.extensions_mut().insert(Tenant("acme"));
        ctx.extensions_mut().insert(7_u32);
        assert_eq!(ctx.extensions().get::<Tenant>(), Some(&Tenant("acme")));
        assert_eq!(ctx.extensions().get::<u32>(), Some(&7));

        ctx.extensions_mut().insert(Tenant("globex"));
        assert_eq!(ctx.extensions().len(), 2);
        assert_eq!(ctx.extensions_mut().remove::<Tenant>(), Some(Tenant("globex")));
        assert!(ctx.extensions().get::<Tenant>().is_none());
    }
}
