//! Route predicate compilation and the shared request router.
//!
//! The router maps a request to the handler of the most specific
//! matching frontend. Mutations are serialized by the mux; lookups read
//! an immutable snapshot swapped atomically, so dispatch never contends
//! with configuration changes.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use hyper::{Method, Response, StatusCode};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{full_body, MuxError};
use crate::graph::FrontendKey;
use crate::middleware::{Handler, HttpRequest, HttpResponse};

/// Compiled form of the route predicate DSL.
///
/// Supported terms, conjoined with `&&`:
/// `Host("h")`, `Path("/p")`, `PathPrefix("/p")`, `Method("GET")`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledPredicate {
    host: Option<String>,
    path: Option<String>,
    path_prefix: Option<String>,
    method: Option<Method>,
}

impl CompiledPredicate {
    pub fn parse(input: &str) -> Result<Self, MuxError> {
        let mut predicate = CompiledPredicate {
            host: None,
            path: None,
            path_prefix: None,
            method: None,
        };
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(MuxError::invalid_argument("empty route predicate"));
        }

        for term in trimmed.split("&&") {
            let term = term.trim();
            let (name, arg) = parse_term(term)?;
            match name {
                "Host" => set_once(&mut predicate.host, term, arg.to_lowercase())?,
                "Path" => {
                    require_path_arg(term, &arg)?;
                    set_once(&mut predicate.path, term, arg)?;
                }
                "PathPrefix" => {
                    require_path_arg(term, &arg)?;
                    set_once(&mut predicate.path_prefix, term, arg)?;
                }
                "Method" => {
                    let method: Method = arg.parse().map_err(|_| {
                        MuxError::invalid_argument(format!("bad method in {}", term))
                    })?;
                    set_once(&mut predicate.method, term, method)?;
                }
                other => {
                    return Err(MuxError::invalid_argument(format!(
                        "unknown matcher {} in route {}",
                        other, input
                    )))
                }
            }
        }
        Ok(predicate)
    }

    /// Host-only predicates are used as listener scopes.
    pub fn parse_scope(input: &str) -> Result<Self, MuxError> {
        let predicate = Self::parse(input)?;
        if predicate.path.is_some() || predicate.path_prefix.is_some() || predicate.method.is_some()
        {
            return Err(MuxError::invalid_argument(format!(
                "listener scope may only constrain Host: {}",
                input
            )));
        }
        Ok(predicate)
    }

    /// Higher wins when several predicates match one request.
    fn specificity(&self) -> usize {
        let mut score = 0;
        if self.method.is_some() {
            score += 1;
        }
        if self.host.is_some() {
            score += 4;
        }
        if let Some(prefix) = &self.path_prefix {
            score += 16 + prefix.len();
        }
        if self.path.is_some() {
            score += 1024;
        }
        score
    }

    pub fn matches(&self, req: &HttpRequest) -> bool {
        if let Some(want) = &self.host {
            match request_host(req) {
                Some(host) if host == *want => {}
                _ => return false,
            }
        }
        if let Some(method) = &self.method {
            if req.method() != method {
                return false;
            }
        }
        let path = req.uri().path();
        if let Some(want) = &self.path {
            if path != want {
                return false;
            }
        }
        if let Some(prefix) = &self.path_prefix {
            if !path.starts_with(prefix.as_str()) {
                return false;
            }
        }
        true
    }
}

fn parse_term<'a>(term: &'a str) -> Result<(&'a str, String), MuxError> {
    let open = term
        .find('(')
        .ok_or_else(|| MuxError::invalid_argument(format!("expected matcher(...), got {}", term)))?;
    if !term.ends_with(')') {
        return Err(MuxError::invalid_argument(format!(
            "unterminated matcher {}",
            term
        )));
    }
    let name = term[..open].trim();
    let inner = term[open + 1..term.len() - 1].trim();
    let arg = inner
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .or_else(|| inner.strip_prefix('`').and_then(|s| s.strip_suffix('`')))
        .ok_or_else(|| {
            MuxError::invalid_argument(format!("matcher argument must be quoted: {}", term))
        })?;
    Ok((name, arg.to_string()))
}

fn set_once<T>(slot: &mut Option<T>, term: &str, value: T) -> Result<(), MuxError> {
    if slot.is_some() {
        return Err(MuxError::invalid_argument(format!(
            "duplicate matcher {}",
            term
        )));
    }
    *slot = Some(value);
    Ok(())
}

fn require_path_arg(term: &str, arg: &str) -> Result<(), MuxError> {
    if !arg.starts_with('/') {
        return Err(MuxError::invalid_argument(format!(
            "path must start with /: {}",
            term
        )));
    }
    Ok(())
}

/// Hostname a request addresses: URI authority for HTTP/2, Host header
/// otherwise, lowercased, port stripped.
pub fn request_host(req: &HttpRequest) -> Option<String> {
    if let Some(host) = req.uri().host() {
        return Some(host.to_lowercase());
    }
    req.headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(|h| h.split(':').next().unwrap_or(h).to_lowercase())
}

/// Predicate-to-handler dispatch shared by every server.
pub trait Router: Send + Sync {
    fn set_not_found(&self, handler: Arc<dyn Handler>);
    fn not_found(&self) -> Arc<dyn Handler>;
    /// Register or atomically replace the route for a frontend.
    fn handle(
        &self,
        key: &FrontendKey,
        predicate: &str,
        handler: Arc<dyn Handler>,
    ) -> Result<(), MuxError>;
    fn remove(&self, key: &FrontendKey);
    /// Select the handler for a request; falls back to NotFound.
    fn dispatch(&self, req: &HttpRequest) -> Arc<dyn Handler>;
}

struct RouteEntry {
    key: FrontendKey,
    predicate: CompiledPredicate,
    handler: Arc<dyn Handler>,
}

struct RouterSnapshot {
    /// Sorted most-specific first, then by key for determinism
    routes: Vec<Arc<RouteEntry>>,
    not_found: Arc<dyn Handler>,
}

/// Built-in router: immutable snapshot swapped on every mutation.
pub struct HostPathRouter {
    entries: Mutex<HashMap<FrontendKey, Arc<RouteEntry>>>,
    snapshot: ArcSwap<RouterSnapshot>,
}

impl HostPathRouter {
    pub fn new() -> Self {
        let not_found: Arc<dyn Handler> = Arc::new(DefaultNotFound);
        Self {
            entries: Mutex::new(HashMap::new()),
            snapshot: ArcSwap::from_pointee(RouterSnapshot {
                routes: Vec::new(),
                not_found,
            }),
        }
    }

    fn publish(&self, entries: &HashMap<FrontendKey, Arc<RouteEntry>>) {
        let mut routes: Vec<Arc<RouteEntry>> = entries.values().cloned().collect();
        routes.sort_by(|a, b| {
            b.predicate
                .specificity()
                .cmp(&a.predicate.specificity())
                .then_with(|| a.key.id.cmp(&b.key.id))
        });
        let not_found = self.snapshot.load().not_found.clone();
        self.snapshot
            .store(Arc::new(RouterSnapshot { routes, not_found }));
    }
}

impl Default for HostPathRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl Router for HostPathRouter {
    fn set_not_found(&self, handler: Arc<dyn Handler>) {
        let entries = self.entries.lock();
        let routes = self.snapshot.load().routes.clone();
        self.snapshot.store(Arc::new(RouterSnapshot {
            routes,
            not_found: handler,
        }));
        drop(entries);
    }

    fn not_found(&self) -> Arc<dyn Handler> {
        self.snapshot.load().not_found.clone()
    }

    fn handle(
        &self,
        key: &FrontendKey,
        predicate: &str,
        handler: Arc<dyn Handler>,
    ) -> Result<(), MuxError> {
        let predicate = CompiledPredicate::parse(predicate)?;
        let mut entries = self.entries.lock();
        entries.insert(
            key.clone(),
            Arc::new(RouteEntry {
                key: key.clone(),
                predicate,
                handler,
            }),
        );
        self.publish(&entries);
        Ok(())
    }

    fn remove(&self, key: &FrontendKey) {
        let mut entries = self.entries.lock();
        if entries.remove(key).is_some() {
            self.publish(&entries);
        }
    }

    fn dispatch(&self, req: &HttpRequest) -> Arc<dyn Handler> {
        let snapshot = self.snapshot.load();
        for entry in &snapshot.routes {
            if entry.predicate.matches(req) {
                return entry.handler.clone();
            }
        }
        snapshot.not_found.clone()
    }
}

/// Default 404 for requests no frontend claims.
pub struct DefaultNotFound;

#[async_trait]
impl Handler for DefaultNotFound {
    async fn handle(&self, req: HttpRequest) -> HttpResponse {
        debug!(method = %req.method(), uri = %req.uri(), "no route matched");
        Response::builder()
            .status(StatusCode::NOT_FOUND)
            .header("Content-Type", "application/json")
            .body(full_body(r#"{"error":"not found"}"#))
            .expect("valid response with static parts")
    }
}
