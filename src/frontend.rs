//! Live frontend objects: compiled route, middleware chain, and the
//! forwarder at the bottom of every chain.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use http_body_util::BodyExt;
use hyper::header::{HeaderValue, CONTENT_LENGTH, HOST};
use hyper::{Request, Uri};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, warn};

use crate::backend::BackendHandle;
use crate::error::{json_error_response, MuxError, ProxyErrorCode};
use crate::graph::{BodyMode, Frontend, FrontendKey, Middleware, MiddlewareKey, Server};
use crate::metrics::ProxyStats;
use crate::middleware::{Handler, HttpRequest, HttpResponse, MiddlewareRegistry};
use crate::router::Router;

/// A route predicate bound to one backend, with its middleware chain
/// materialized into the router.
///
/// Owned by the mux's frontend map; the backend keeps only a weak link
/// back for the deletion veto.
pub struct FrontendHandle {
    key: FrontendKey,
    spec: RwLock<Frontend>,
    middlewares: Mutex<HashMap<MiddlewareKey, Middleware>>,
    backend: ArcSwap<BackendHandle>,
    router: Arc<dyn Router>,
    registry: Arc<MiddlewareRegistry>,
    stats: Arc<ProxyStats>,
}

impl FrontendHandle {
    pub fn new(
        record: Frontend,
        backend: Arc<BackendHandle>,
        router: Arc<dyn Router>,
        registry: Arc<MiddlewareRegistry>,
        stats: Arc<ProxyStats>,
    ) -> Arc<Self> {
        Arc::new(Self {
            key: record.key(),
            spec: RwLock::new(record),
            middlewares: Mutex::new(HashMap::new()),
            backend: ArcSwap::from(backend),
            router,
            registry,
            stats,
        })
    }

    pub fn key(&self) -> &FrontendKey {
        &self.key
    }

    pub fn record(&self) -> Frontend {
        self.spec.read().clone()
    }

    pub fn backend(&self) -> Arc<BackendHandle> {
        self.backend.load_full()
    }

    pub fn set_middlewares(&self, middlewares: Vec<Middleware>) {
        let mut map = self.middlewares.lock();
        map.clear();
        for mw in middlewares {
            let key = MiddlewareKey::new(self.key.clone(), mw.id.clone());
            map.insert(key, mw);
        }
    }

    /// Compose the middleware chain over a fresh forwarder. Factory and
    /// predicate errors surface before anything touches the router.
    fn compose(
        &self,
        record: &Frontend,
        backend: &Arc<BackendHandle>,
    ) -> Result<Arc<dyn Handler>, MuxError> {
        let mut middlewares: Vec<Middleware> =
            self.middlewares.lock().values().cloned().collect();
        // Lower priority runs closer to the client; ties break on id.
        middlewares.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.id.cmp(&b.id))
        });

        let mut layers = Vec::with_capacity(middlewares.len());
        for mw in &middlewares {
            let layer = self.registry.build(&mw.kind, &mw.spec).map_err(|e| {
                MuxError::internal(format!(
                    "middleware {} of {}: {}",
                    mw.id, self.key, e
                ))
            })?;
            layers.push(layer);
        }

        let mut handler: Arc<dyn Handler> = Arc::new(Forwarder {
            backend: backend.clone(),
            settings: record.settings.clone(),
            stats: self.stats.clone(),
        });
        for layer in layers.iter().rev() {
            handler = layer.wrap(handler);
        }
        Ok(handler)
    }

    /// Materialize the chain and register the route, replacing any
    /// previous entry for this frontend atomically.
    pub fn rebuild(&self) -> Result<(), MuxError> {
        let record = self.spec.read().clone();
        let backend = self.backend.load_full();
        let handler = self.compose(&record, &backend)?;
        self.router.handle(&self.key, &record.route, handler)?;
        debug!(frontend = %self.key, route = %record.route, "Route rebuilt");
        Ok(())
    }

    /// Apply a new record; the caller relinks backend back-references
    /// when the returned flag says the backend changed.
    pub fn update(&self, record: Frontend, backend: Arc<BackendHandle>) -> Result<bool, MuxError> {
        let old_backend = self.backend.load_full();
        let relinked = !Arc::ptr_eq(&old_backend, &backend);

        // Validate and register before mutating our own state; the
        // router entry replacement is the commit point.
        let handler = self.compose(&record, &backend)?;
        self.router.handle(&self.key, &record.route, handler)?;

        *self.spec.write() = record;
        self.backend.store(backend);
        Ok(relinked)
    }

    /// Unregister from the router and unlink from the backend.
    pub fn remove(&self) {
        self.router.remove(&self.key);
        self.backend.load().unlink_frontend(&self.key);
    }

    pub fn upsert_middleware(&self, key: MiddlewareKey, mw: Middleware) -> Result<(), MuxError> {
        let previous = self.middlewares.lock().insert(key.clone(), mw);
        if let Err(err) = self.rebuild() {
            // Roll back so a bad spec leaves the chain untouched.
            let mut map = self.middlewares.lock();
            match previous {
                Some(prev) => {
                    map.insert(key, prev);
                }
                None => {
                    map.remove(&key);
                }
            }
            return Err(err);
        }
        Ok(())
    }

    pub fn delete_middleware(&self, key: &MiddlewareKey) -> Result<(), MuxError> {
        let previous = match self.middlewares.lock().remove(key) {
            Some(prev) => prev,
            None => return Err(MuxError::not_found(key)),
        };
        if let Err(err) = self.rebuild() {
            self.middlewares.lock().insert(key.clone(), previous);
            return Err(err);
        }
        Ok(())
    }

    pub fn middleware_count(&self) -> usize {
        self.middlewares.lock().len()
    }
}

/// Innermost handler: picks an upstream server and forwards through the
/// backend's pooled transport. Reads the live backend reference on
/// every dispatch, so transport and server-list swaps take effect
/// without a frontend rebuild.
struct Forwarder {
    backend: Arc<BackendHandle>,
    settings: crate::graph::FrontendSettings,
    stats: Arc<ProxyStats>,
}

impl Forwarder {
    /// Frontend override wins, then the backend's response-header
    /// deadline, then its read deadline.
    fn deadline(&self, transport: &crate::backend::Transport) -> Duration {
        crate::graph::secs(self.settings.request_timeout_secs)
            .or(transport.settings.response_header)
            .unwrap_or(transport.settings.read)
    }

    /// Rewrite the request line for one upstream: the server's scheme
    /// and authority, the client's path and query.
    fn upstream_uri(server: &Server, req_uri: &Uri) -> Result<Uri, MuxError> {
        let base = server.parse_url()?;
        let path_and_query = req_uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let authority = base
            .authority()
            .expect("validated on upsert")
            .to_owned();
        Uri::builder()
            .scheme("http")
            .authority(authority)
            .path_and_query(path_and_query)
            .build()
            .map_err(|e| MuxError::internal(format!("bad upstream uri: {}", e)))
    }

    fn prepare_host_header(&self, req: &mut HttpRequest) {
        // Without pass-host-header the client's Host is dropped and the
        // transport derives it from the upstream authority.
        if !self.settings.pass_host_header {
            req.headers_mut().remove(HOST);
        }
    }

    async fn send_buffered(&self, req: HttpRequest) -> HttpResponse {
        let transport = self.backend.transport();
        let servers = self.backend.servers();
        if servers.is_empty() {
            self.stats.record_upstream_error();
            return json_error_response(ProxyErrorCode::NoServers, "no upstream servers");
        }

        let (parts, body) = req.into_parts();

        if let Some(length) = parts
            .headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok())
        {
            if length > self.settings.max_body_bytes {
                return json_error_response(ProxyErrorCode::BodyTooLarge, "request body too large");
            }
        }

        let bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!(error = %e, "failed to read request body");
                return json_error_response(ProxyErrorCode::InternalError, "failed to read body");
            }
        };
        if bytes.len() > self.settings.max_body_bytes {
            return json_error_response(ProxyErrorCode::BodyTooLarge, "request body too large");
        }

        let attempts = if self.settings.failover { servers.len() } else { 1 };
        let start = self.backend.next_server_index(servers.len());
        let deadline = self.deadline(&transport);

        for attempt in 0..attempts {
            let server = &servers[(start + attempt) % servers.len()];
            let uri = match Self::upstream_uri(server, &parts.uri) {
                Ok(uri) => uri,
                Err(e) => {
                    error!(server = %server.id, error = %e, "upstream uri rewrite failed");
                    continue;
                }
            };

            let mut builder = Request::builder().method(parts.method.clone()).uri(uri);
            for (name, value) in parts.headers.iter() {
                builder = builder.header(name, value);
            }
            let mut up_req = match builder.body(crate::error::full_body(bytes.clone())) {
                Ok(req) => req,
                Err(e) => {
                    error!(error = %e, "failed to build upstream request");
                    return json_error_response(ProxyErrorCode::InternalError, "bad request");
                }
            };
            self.prepare_host_header(&mut up_req);

            match tokio::time::timeout(deadline, transport.client.request(up_req)).await {
                Ok(Ok(response)) => return response.map(|b| b.boxed()),
                Ok(Err(e)) if e.is_connect() && attempt + 1 < attempts => {
                    warn!(server = %server.id, error = %e, "connect failed, trying next server");
                    continue;
                }
                Ok(Err(e)) => {
                    self.stats.record_upstream_error();
                    error!(backend = %self.backend.key(), server = %server.id, error = %e, "forward failed");
                    return json_error_response(
                        ProxyErrorCode::ConnectionFailed,
                        "failed to reach upstream",
                    );
                }
                Err(_) => {
                    self.stats.record_upstream_error();
                    warn!(
                        backend = %self.backend.key(),
                        server = %server.id,
                        timeout_secs = deadline.as_secs(),
                        "request timed out"
                    );
                    return json_error_response(ProxyErrorCode::RequestTimeout, "upstream timed out");
                }
            }
        }

        self.stats.record_upstream_error();
        json_error_response(ProxyErrorCode::ConnectionFailed, "all upstream servers failed")
    }

    async fn send_streaming(&self, req: HttpRequest) -> HttpResponse {
        let transport = self.backend.transport();
        let servers = self.backend.servers();
        if servers.is_empty() {
            self.stats.record_upstream_error();
            return json_error_response(ProxyErrorCode::NoServers, "no upstream servers");
        }
        let server = &servers[self.backend.next_server_index(servers.len())];
        let deadline = self.deadline(&transport);

        let (mut parts, body) = req.into_parts();
        parts.uri = match Self::upstream_uri(server, &parts.uri) {
            Ok(uri) => uri,
            Err(e) => {
                error!(server = %server.id, error = %e, "upstream uri rewrite failed");
                return json_error_response(ProxyErrorCode::InternalError, "bad upstream url");
            }
        };
        let mut up_req = Request::from_parts(parts, body);
        self.prepare_host_header(&mut up_req);

        match tokio::time::timeout(deadline, transport.client.request(up_req)).await {
            Ok(Ok(response)) => response.map(|b| b.boxed()),
            Ok(Err(e)) => {
                self.stats.record_upstream_error();
                error!(backend = %self.backend.key(), server = %server.id, error = %e, "forward failed");
                json_error_response(ProxyErrorCode::ConnectionFailed, "failed to reach upstream")
            }
            Err(_) => {
                self.stats.record_upstream_error();
                json_error_response(ProxyErrorCode::RequestTimeout, "upstream timed out")
            }
        }
    }
}

#[async_trait]
impl Handler for Forwarder {
    async fn handle(&self, mut req: HttpRequest) -> HttpResponse {
        // Restate the forwarded proto for upstreams behind TLS listeners.
        if req.headers().get("x-forwarded-proto").is_none() {
            req.headers_mut()
                .insert("x-forwarded-proto", HeaderValue::from_static("http"));
        }
        match self.settings.body_mode {
            BodyMode::Buffer => self.send_buffered(req).await,
            BodyMode::Stream => self.send_streaming(req).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Backend, FrontendSettings};
    use crate::router::HostPathRouter;
    use serde_json::json;

    fn deps() -> (Arc<dyn Router>, Arc<MiddlewareRegistry>, Arc<ProxyStats>) {
        (
            Arc::new(HostPathRouter::new()),
            Arc::new(MiddlewareRegistry::with_builtins()),
            Arc::new(ProxyStats::default()),
        )
    }

    fn backend() -> Arc<BackendHandle> {
        BackendHandle::new(
            Backend::new("b1"),
            Duration::from_secs(5),
            Duration::from_secs(30),
        )
        .unwrap()
    }

    fn frontend_record(route: &str) -> Frontend {
        Frontend {
            id: "f1".into(),
            route: route.into(),
            backend_id: "b1".into(),
            settings: FrontendSettings::default(),
        }
    }

    #[tokio::test]
    async fn test_rebuild_registers_route() {
        let (router, registry, stats) = deps();
        let fe = FrontendHandle::new(
            frontend_record(r#"Host("api.example.com")"#),
            backend(),
            router.clone(),
            registry,
            stats,
        );
        fe.rebuild().unwrap();

        let req = hyper::Request::builder()
            .uri("/")
            .header("Host", "api.example.com")
            .body(crate::error::full_body(""))
            .unwrap();
        // Dispatch resolves to the forwarder rather than NotFound; with
        // no servers it answers 503.
        let resp = router.dispatch(&req).handle(req).await;
        assert_eq!(resp.status(), hyper::StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(resp.headers().get("X-Proxy-Error").unwrap(), "NO_SERVERS");
    }

    #[tokio::test]
    async fn test_rebuild_with_bad_route_leaves_router_untouched() {
        let (router, registry, stats) = deps();
        let fe = FrontendHandle::new(
            frontend_record("Bogus!!"),
            backend(),
            router.clone(),
            registry,
            stats,
        );
        assert!(fe.rebuild().is_err());

        let req = hyper::Request::builder()
            .uri("/")
            .header("Host", "api.example.com")
            .body(crate::error::full_body(""))
            .unwrap();
        let resp = router.dispatch(&req).handle(req).await;
        assert_eq!(resp.status(), hyper::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_bad_middleware_spec_rolls_back() {
        let (router, registry, stats) = deps();
        let fe = FrontendHandle::new(
            frontend_record(r#"Host("api.example.com")"#),
            backend(),
            router,
            registry,
            stats,
        );
        fe.rebuild().unwrap();

        let key = MiddlewareKey::new(fe.key().clone(), "m1");
        let err = fe
            .upsert_middleware(
                key,
                Middleware {
                    id: "m1".into(),
                    kind: "response-header".into(),
                    priority: 0,
                    spec: json!({"name": "bad name!", "value": "v"}),
                },
            )
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Internal);
        assert_eq!(fe.middleware_count(), 0);
    }

    #[tokio::test]
    async fn test_delete_missing_middleware_is_not_found() {
        let (router, registry, stats) = deps();
        let fe = FrontendHandle::new(
            frontend_record(r#"Host("a")"#),
            backend(),
            router,
            registry,
            stats,
        );
        fe.rebuild().unwrap();
        let key = MiddlewareKey::new(fe.key().clone(), "ghost");
        assert_eq!(
            fe.delete_middleware(&key).unwrap_err().kind(),
            crate::error::ErrorKind::NotFound
        );
    }
}
