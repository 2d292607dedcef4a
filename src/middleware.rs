//! Handler contract and the middleware registry.
//!
//! A middleware is a handler-transform: it wraps an inner handler and
//! returns a new one. Concrete middlewares are instantiated from an
//! opaque JSON spec by a factory looked up in the registry, so the set
//! stays pluggable while the wrap contract is enforced by the compiler.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use hyper::header::{HeaderName, HeaderValue};
use hyper::{Request, Response};
use parking_lot::RwLock;
use serde::Deserialize;

use crate::error::{HttpBody, MuxError};

/// Request flowing through handlers; incoming bodies are boxed at the
/// server edge so handlers are uniform and testable.
pub type HttpRequest = Request<HttpBody>;
pub type HttpResponse = Response<HttpBody>;

/// The dispatch unit: everything registered in the router, every
/// middleware product, and the forwarder at the bottom of each chain.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, req: HttpRequest) -> HttpResponse;
}

/// A handler-transform produced by a middleware factory.
pub trait Layer: Send + Sync {
    fn wrap(&self, next: Arc<dyn Handler>) -> Arc<dyn Handler>;
}

impl std::fmt::Debug for dyn Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("<dyn Layer>")
    }
}

/// Builds a layer from the middleware's opaque spec. Factory errors
/// abort the frontend rebuild without touching the router.
pub trait MiddlewareFactory: Send + Sync {
    fn build(&self, spec: &serde_json::Value) -> Result<Arc<dyn Layer>, MuxError>;
}

/// Maps middleware kind to factory. Built-ins are pre-registered;
/// plugins extend the map before the mux starts.
pub struct MiddlewareRegistry {
    factories: RwLock<HashMap<String, Arc<dyn MiddlewareFactory>>>,
}

impl MiddlewareRegistry {
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
        }
    }

    /// Registry with the built-in middleware set.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register("request-header", Arc::new(RequestHeaderFactory));
        registry.register("response-header", Arc::new(ResponseHeaderFactory));
        registry
    }

    pub fn register(&self, kind: impl Into<String>, factory: Arc<dyn MiddlewareFactory>) {
        self.factories.write().insert(kind.into(), factory);
    }

    pub fn build(&self, kind: &str, spec: &serde_json::Value) -> Result<Arc<dyn Layer>, MuxError> {
        let factory = self
            .factories
            .read()
            .get(kind)
            .cloned()
            .ok_or_else(|| MuxError::not_found(format!("middleware kind {}", kind)))?;
        factory.build(spec)
    }
}

impl Default for MiddlewareRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[derive(Debug, Deserialize)]
struct HeaderSpec {
    name: String,
    value: String,
    /// Append instead of overwrite when the header is already present
    #[serde(default)]
    append: bool,
}

fn parse_header_spec(spec: &serde_json::Value) -> Result<(HeaderName, HeaderValue, bool), MuxError> {
    let spec: HeaderSpec = serde_json::from_value(spec.clone())
        .map_err(|e| MuxError::invalid_argument(format!("bad header spec: {}", e)))?;
    let name: HeaderName = spec
        .name
        .parse()
        .map_err(|e| MuxError::invalid_argument(format!("bad header name {}: {}", spec.name, e)))?;
    let value = HeaderValue::from_str(&spec.value)
        .map_err(|e| MuxError::invalid_argument(format!("bad header value: {}", e)))?;
    Ok((name, value, spec.append))
}

/// Sets a header on every request before it reaches the upstream.
struct RequestHeaderFactory;

impl MiddlewareFactory for RequestHeaderFactory {
    fn build(&self, spec: &serde_json::Value) -> Result<Arc<dyn Layer>, MuxError> {
        let (name, value, append) = parse_header_spec(spec)?;
        Ok(Arc::new(RequestHeaderLayer { name, value, append }))
    }
}

struct RequestHeaderLayer {
    name: HeaderName,
    value: HeaderValue,
    append: bool,
}

impl Layer for RequestHeaderLayer {
    fn wrap(&self, next: Arc<dyn Handler>) -> Arc<dyn Handler> {
        Arc::new(RequestHeaderHandler {
            name: self.name.clone(),
            value: self.value.clone(),
            append: self.append,
            next,
        })
    }
}

struct RequestHeaderHandler {
    name: HeaderName,
    value: HeaderValue,
    append: bool,
    next: Arc<dyn Handler>,
}

#[async_trait]
impl Handler for RequestHeaderHandler {
    async fn handle(&self, mut req: HttpRequest) -> HttpResponse {
        if self.append {
            req.headers_mut().append(self.name.clone(), self.value.clone());
        } else {
            req.headers_mut().insert(self.name.clone(), self.value.clone());
        }
        self.next.handle(req).await
    }
}

/// Appends (or sets) a header on every response on the way back out.
struct ResponseHeaderFactory;

impl MiddlewareFactory for ResponseHeaderFactory {
    fn build(&self, spec: &serde_json::Value) -> Result<Arc<dyn Layer>, MuxError> {
        let (name, value, append) = parse_header_spec(spec)?;
        Ok(Arc::new(ResponseHeaderLayer { name, value, append }))
    }
}

struct ResponseHeaderLayer {
    name: HeaderName,
    value: HeaderValue,
    append: bool,
}

impl Layer for ResponseHeaderLayer {
    fn wrap(&self, next: Arc<dyn Handler>) -> Arc<dyn Handler> {
        Arc::new(ResponseHeaderHandler {
            name: self.name.clone(),
            value: self.value.clone(),
            append: self.append,
            next,
        })
    }
}

struct ResponseHeaderHandler {
    name: HeaderName,
    value: HeaderValue,
    append: bool,
    next: Arc<dyn Handler>,
}

#[async_trait]
impl Handler for ResponseHeaderHandler {
    async fn handle(&self, req: HttpRequest) -> HttpResponse {
        let mut resp = self.next.handle(req).await;
        if self.append {
            resp.headers_mut().append(self.name.clone(), self.value.clone());
        } else {
            resp.headers_mut().insert(self.name.clone(), self.value.clone());
        }
        resp
    }
}
