//! Per-listener server: one bound socket, an HTTP(S) accept loop, and —
//! for TLS listeners — a dynamic SNI resolver whose material is swapped
//! atomically on reload, never by closing the socket.

use std::collections::HashMap;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use parking_lot::Mutex;
use rustls::crypto::ring::sign::any_supported_type;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::MuxError;
use crate::graph::{KeyPair, Listener, Protocol};
use crate::handoff::FileDescriptor;
use crate::metrics::Observers;
use crate::middleware::HttpRequest;
use crate::router::{CompiledPredicate, Router};

const X_REQUEST_ID: &str = "x-request-id";
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Per-host TLS material resolved at handshake time. Recomputed by the
/// mux on every reload and swapped in one store.
#[derive(Default)]
pub struct TlsSnapshot {
    /// CertifiedKey per SNI name, staple already attached
    pub hosts: HashMap<String, Arc<CertifiedKey>>,
    /// Listener-level fallback when no host matches
    pub default: Option<Arc<CertifiedKey>>,
}

/// SNI resolver reading the snapshot; no handshake ever blocks on the
/// stapler or the graph lock.
pub struct SniResolver {
    snapshot: ArcSwap<TlsSnapshot>,
}

impl SniResolver {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            snapshot: ArcSwap::from_pointee(TlsSnapshot::default()),
        })
    }

    fn store(&self, snapshot: TlsSnapshot) {
        self.snapshot.store(Arc::new(snapshot));
    }

    fn select(&self, sni: Option<&str>) -> Option<Arc<CertifiedKey>> {
        let snapshot = self.snapshot.load();
        if let Some(name) = sni {
            if let Some(key) = snapshot.hosts.get(&name.to_lowercase()) {
                return Some(key.clone());
            }
        }
        snapshot.default.clone()
    }
}

impl std::fmt::Debug for SniResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SniResolver").finish_non_exhaustive()
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let selected = self.select(client_hello.server_name());
        if selected.is_none() {
            debug!(sni = ?client_hello.server_name(), "no certificate for handshake");
        }
        selected
    }
}

/// Build a CertifiedKey from PEM material, attaching the OCSP staple
/// when one is cached.
pub fn certified_key(
    key_pair: &KeyPair,
    staple: Option<Vec<u8>>,
) -> Result<Arc<CertifiedKey>, MuxError> {
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut BufReader::new(key_pair.cert.as_bytes()))
            .collect::<Result<_, _>>()
            .map_err(|e| MuxError::invalid_argument(format!("bad certificate PEM: {}", e)))?;
    if certs.is_empty() {
        return Err(MuxError::invalid_argument("no certificates in PEM"));
    }
    let key = load_private_key(key_pair.key.as_bytes())
        .ok_or_else(|| MuxError::invalid_argument("no private key in PEM"))?;
    let signing_key = any_supported_type(&key)
        .map_err(|e| MuxError::invalid_argument(format!("unsupported private key: {}", e)))?;

    let mut certified = CertifiedKey::new(certs, signing_key);
    certified.ocsp = staple;
    Ok(Arc::new(certified))
}

fn load_private_key(data: &[u8]) -> Option<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(data);

    loop {
        match rustls_pemfile::read_one(&mut reader) {
            Ok(Some(rustls_pemfile::Item::Pkcs1Key(key))) => return Some(key.into()),
            Ok(Some(rustls_pemfile::Item::Pkcs8Key(key))) => return Some(key.into()),
            Ok(Some(rustls_pemfile::Item::Sec1Key(key))) => return Some(key.into()),
            Ok(None) => return None,
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SrvState {
    Init,
    Active,
    ShuttingDown,
}

/// Per-request dispatch state that can change on reload.
struct ServeState {
    scope: Option<CompiledPredicate>,
}

/// Shared construction parameters for every server of one mux.
#[derive(Clone)]
pub(crate) struct ServerDeps {
    pub router: Arc<dyn Router>,
    pub observers: Observers,
    pub read_timeout: Duration,
    pub max_header_bytes: usize,
    pub shutdown_grace: Duration,
}

/// The live object bound to one Listener.
pub struct Srv {
    listener: Mutex<Listener>,
    deps: ServerDeps,
    resolver: Arc<SniResolver>,
    serve: ArcSwap<ServeState>,
    state: Mutex<SrvState>,
    /// Retained clone of the bound socket while running; before start it
    /// holds an inherited descriptor, if any.
    socket: Mutex<Option<std::net::TcpListener>>,
    shutdown_tx: watch::Sender<bool>,
    in_flight: Arc<AtomicUsize>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Srv {
    pub(crate) fn new(listener: Listener, deps: ServerDeps) -> Result<Arc<Self>, MuxError> {
        let scope = listener
            .scope
            .as_deref()
            .map(CompiledPredicate::parse_scope)
            .transpose()?;
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Arc::new(Self {
            listener: Mutex::new(listener),
            deps,
            resolver: SniResolver::new(),
            serve: ArcSwap::from_pointee(ServeState { scope }),
            state: Mutex::new(SrvState::Init),
            socket: Mutex::new(None),
            shutdown_tx,
            in_flight: Arc::new(AtomicUsize::new(0)),
            accept_task: Mutex::new(None),
        }))
    }

    pub fn listener_record(&self) -> Listener {
        self.listener.lock().clone()
    }

    pub fn is_tls(&self) -> bool {
        self.listener.lock().is_tls()
    }

    /// Swap the TLS material and scope filter without touching the
    /// socket. Handshakes in flight finish on the snapshot they read.
    pub fn reload(&self, tls: TlsSnapshot, scope: Option<CompiledPredicate>) {
        self.resolver.store(tls);
        self.serve.store(Arc::new(ServeState { scope }));
    }

    /// Apply a new Listener record. Address and protocol are immutable;
    /// returns whether TLS settings or scope changed so the caller can
    /// trigger a reload.
    pub fn update_listener(&self, new: Listener) -> Result<bool, MuxError> {
        let mut current = self.listener.lock();
        if new.address != current.address {
            return Err(MuxError::conflict(format!(
                "listener {} address is immutable ({} -> {}); delete and re-insert",
                new.id, current.address, new.address
            )));
        }
        if new.protocol != current.protocol {
            return Err(MuxError::conflict(format!(
                "listener {} protocol is immutable",
                new.id
            )));
        }
        let changed = new.tls != current.tls || new.scope != current.scope;
        *current = new;
        Ok(changed)
    }

    /// Adopt an inherited descriptor instead of binding fresh on start.
    pub fn take_file(&self, fd: FileDescriptor) -> Result<(), MuxError> {
        if *self.state.lock() != SrvState::Init {
            return Err(MuxError::conflict(format!(
                "listener {} already started, cannot take file",
                self.listener.lock().id
            )));
        }
        info!(address = %fd.address, "adopting inherited listener socket");
        *self.socket.lock() = Some(fd.file);
        Ok(())
    }

    /// Address the socket is actually bound to; None before start.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket
            .lock()
            .as_ref()
            .and_then(|listener| listener.local_addr().ok())
    }

    /// Duplicate the bound socket for handoff; None before start.
    pub fn get_file(&self) -> Result<Option<FileDescriptor>, MuxError> {
        let socket = self.socket.lock();
        match socket.as_ref() {
            Some(listener) => {
                let file = listener.try_clone()?;
                Ok(Some(FileDescriptor {
                    address: self.listener.lock().address.clone(),
                    file,
                }))
            }
            None => Ok(None),
        }
    }

    pub(crate) fn start(self: &Arc<Self>) -> Result<(), MuxError> {
        {
            let mut state = self.state.lock();
            if *state != SrvState::Init {
                return Err(MuxError::conflict(format!(
                    "listener {} can only start from init",
                    self.listener.lock().id
                )));
            }
            *state = SrvState::Active;
        }

        let record = self.listener.lock().clone();
        let inherited = self.socket.lock().take();
        let std_listener = match inherited {
            Some(listener) => {
                info!(listener = %record.id, address = %record.address, "starting on inherited socket");
                listener
            }
            None => std::net::TcpListener::bind(&record.address.address).map_err(|e| {
                MuxError::internal(format!("failed to bind {}: {}", record.address, e))
            })?,
        };
        std_listener.set_nonblocking(true)?;
        *self.socket.lock() = Some(std_listener.try_clone()?);

        let tls_acceptor = if record.is_tls() {
            let mut tls_config = rustls::ServerConfig::builder()
                .with_no_client_auth()
                .with_cert_resolver(self.resolver.clone());
            tls_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
            Some(TlsAcceptor::from(Arc::new(tls_config)))
        } else {
            None
        };

        info!(listener = %record.id, address = %record.address, protocol = %record.protocol, "server listening");

        let srv = Arc::clone(self);
        let task = tokio::spawn(async move {
            if let Err(e) = srv.accept_loop(std_listener, tls_acceptor).await {
                error!(error = %e, "accept loop terminated");
            }
        });
        *self.accept_task.lock() = Some(task);
        Ok(())
    }

    async fn accept_loop(
        self: Arc<Self>,
        std_listener: std::net::TcpListener,
        tls_acceptor: Option<TlsAcceptor>,
    ) -> std::io::Result<()> {
        let listener = TcpListener::from_std(std_listener)?;
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        // A subscriber created after the signal fired sees it as
        // already-seen; check once before entering the loop.
        if *shutdown_rx.borrow() {
            return Ok(());
        }

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let srv = Arc::clone(&self);
                            let tls_acceptor = tls_acceptor.clone();
                            tokio::spawn(async move {
                                srv.handle_accept(stream, addr, tls_acceptor).await;
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        debug!("accept loop stopping");
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    async fn handle_accept(
        self: Arc<Self>,
        stream: tokio::net::TcpStream,
        addr: SocketAddr,
        tls_acceptor: Option<TlsAcceptor>,
    ) {
        let protocol = self.listener.lock().protocol;
        self.deps.observers.incoming.connection_opened(protocol);

        match tls_acceptor {
            Some(acceptor) => match acceptor.accept(stream).await {
                Ok(tls_stream) => {
                    if let Err(e) = self.serve_connection(tls_stream, addr, true).await {
                        debug!(addr = %addr, error = %e, "TLS connection error");
                    }
                }
                Err(e) => {
                    debug!(addr = %addr, error = %e, "TLS handshake failed");
                }
            },
            None => {
                if let Err(e) = self.serve_connection(stream, addr, false).await {
                    debug!(addr = %addr, error = %e, "connection error");
                }
            }
        }

        self.deps.observers.incoming.connection_closed(protocol);
    }

    async fn serve_connection<S>(
        self: &Arc<Self>,
        stream: S,
        addr: SocketAddr,
        is_tls: bool,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(stream);
        let srv = Arc::clone(self);

        let service = service_fn(move |req: Request<Incoming>| {
            let srv = Arc::clone(&srv);
            async move {
                Ok::<_, hyper::Error>(srv.dispatch(req, addr, is_tls).await)
            }
        });

        AutoBuilder::new(TokioExecutor::new())
            .http1()
            .timer(TokioTimer::new())
            .header_read_timeout(self.deps.read_timeout)
            .max_buf_size(self.deps.max_header_bytes)
            .preserve_header_case(true)
            .http2()
            .max_concurrent_streams(250)
            .serve_connection_with_upgrades(io, service)
            .await?;
        Ok(())
    }

    async fn dispatch(
        &self,
        req: Request<Incoming>,
        client_addr: SocketAddr,
        is_tls: bool,
    ) -> crate::middleware::HttpResponse {
        let stats = &self.deps.observers.stats;
        stats.record_request();
        stats.request_started();
        self.in_flight.fetch_add(1, Ordering::SeqCst);

        let mut req: HttpRequest = req.map(|body| body.boxed());
        apply_proxy_headers(&mut req, client_addr, is_tls);

        let serve = self.serve.load();
        let handler = match &serve.scope {
            Some(scope) if !scope.matches(&req) => {
                stats.record_not_found();
                self.deps.router.not_found()
            }
            _ => self.deps.router.dispatch(&req),
        };
        let response = handler.handle(req).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        stats.request_finished();
        response
    }

    /// Graceful shutdown: stop accepting, drain in-flight requests up to
    /// the grace period, then close the socket. A shutdown before start
    /// is a no-op.
    pub async fn shutdown(&self) {
        {
            let mut state = self.state.lock();
            match *state {
                SrvState::Init => {
                    debug!("shutdown before start is a no-op");
                    return;
                }
                SrvState::ShuttingDown => return,
                SrvState::Active => *state = SrvState::ShuttingDown,
            }
        }

        let id = self.listener.lock().id.clone();
        info!(listener = %id, "shutting down");
        let _ = self.shutdown_tx.send(true);

        let task = self.accept_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }

        let deadline = Instant::now() + self.deps.shutdown_grace;
        while self.in_flight.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        let drained = self.in_flight.load(Ordering::SeqCst) == 0;
        if !drained {
            warn!(listener = %id, in_flight = self.in_flight.load(Ordering::SeqCst), "grace period expired with requests in flight");
        }

        *self.socket.lock() = None;
        info!(listener = %id, drained, "server stopped");
    }
}

fn apply_proxy_headers(req: &mut HttpRequest, client_addr: SocketAddr, is_tls: bool) {
    // X-Forwarded-* are overwritten rather than appended: this proxy is
    // the first trusted hop.
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        req.headers_mut().insert(X_REQUEST_ID, value);
    }

    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        req.headers_mut().insert(X_FORWARDED_FOR, value);
    }

    if let Some(host) = req.headers().get(hyper::header::HOST).cloned() {
        req.headers_mut().insert(X_FORWARDED_HOST, host);
    }

    let proto = if is_tls { "https" } else { "http" };
    req.headers_mut()
        .insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::full_body;
    use crate::graph::Address;
    use crate::router::HostPathRouter;

    fn test_key_pair(name: &str) -> KeyPair {
        let cert = rcgen::generate_simple_self_signed(vec![name.to_string()]).unwrap();
        KeyPair {
            cert: cert.cert.pem(),
            key: cert.key_pair.serialize_pem(),
        }
    }

    fn deps() -> ServerDeps {
        ServerDeps {
            router: Arc::new(HostPathRouter::new()),
            observers: Observers::new_default(),
            read_timeout: Duration::from_secs(30),
            max_header_bytes: 1 << 20,
            shutdown_grace: Duration::from_secs(1),
        }
    }

    fn listener(id: &str, protocol: Protocol) -> Listener {
        Listener {
            id: id.into(),
            protocol,
            address: Address::new("tcp", "127.0.0.1:0"),
            tls: None,
            scope: None,
        }
    }

    #[test]
    fn test_certified_key_from_pem_with_staple() {
        let kp = test_key_pair("api.example.com");
        let key = certified_key(&kp, Some(vec![1, 2, 3])).unwrap();
        assert_eq!(key.ocsp.as_deref(), Some(&[1u8, 2, 3][..]));
        assert_eq!(key.cert.len(), 1);
    }

    #[test]
    fn test_certified_key_rejects_garbage() {
        let kp = KeyPair {
            cert: "not pem".into(),
            key: "not pem".into(),
        };
        assert_eq!(
            certified_key(&kp, None).unwrap_err().kind(),
            crate::error::ErrorKind::InvalidArgument
        );
    }

    #[test]
    fn test_resolver_prefers_sni_match_over_default() {
        let resolver = SniResolver::new();
        let api = certified_key(&test_key_pair("api.example.com"), None).unwrap();
        let fallback = certified_key(&test_key_pair("fallback.example.com"), None).unwrap();

        let mut hosts = HashMap::new();
        hosts.insert("api.example.com".to_string(), api.clone());
        resolver.store(TlsSnapshot {
            hosts,
            default: Some(fallback.clone()),
        });

        assert!(Arc::ptr_eq(&resolver.select(Some("api.example.com")).unwrap(), &api));
        assert!(Arc::ptr_eq(&resolver.select(Some("API.EXAMPLE.COM")).unwrap(), &api));
        assert!(Arc::ptr_eq(&resolver.select(Some("other")).unwrap(), &fallback));
        assert!(Arc::ptr_eq(&resolver.select(None).unwrap(), &fallback));
    }

    #[test]
    fn test_resolver_without_material_aborts() {
        let resolver = SniResolver::new();
        assert!(resolver.select(Some("api.example.com")).is_none());
    }

    #[test]
    fn test_update_listener_rejects_address_change() {
        let srv = Srv::new(listener("l1", Protocol::Http), deps()).unwrap();
        let mut changed = listener("l1", Protocol::Http);
        changed.address = Address::new("tcp", "127.0.0.1:1");
        assert_eq!(
            srv.update_listener(changed).unwrap_err().kind(),
            crate::error::ErrorKind::Conflict
        );
    }

    #[test]
    fn test_update_listener_reports_tls_scope_changes() {
        let srv = Srv::new(listener("l1", Protocol::Http), deps()).unwrap();

        // No change.
        assert!(!srv.update_listener(listener("l1", Protocol::Http)).unwrap());

        let mut scoped = listener("l1", Protocol::Http);
        scoped.scope = Some(r#"Host("api.example.com")"#.into());
        assert!(srv.update_listener(scoped).unwrap());
    }

    #[tokio::test]
    async fn test_shutdown_before_start_is_noop() {
        let srv = Srv::new(listener("l1", Protocol::Http), deps()).unwrap();
        srv.shutdown().await;
        assert_eq!(*srv.state.lock(), SrvState::Init);
    }

    #[test]
    fn test_proxy_headers_overwrite_client_values() {
        let mut req: HttpRequest = Request::builder()
            .uri("/")
            .header("Host", "api.example.com")
            .header(X_FORWARDED_FOR, "6.6.6.6")
            .body(full_body(""))
            .unwrap();
        apply_proxy_headers(&mut req, "10.0.0.9:4242".parse().unwrap(), true);

        assert_eq!(req.headers().get(X_FORWARDED_FOR).unwrap(), "10.0.0.9");
        assert_eq!(req.headers().get(X_FORWARDED_PROTO).unwrap(), "https");
        assert_eq!(
            req.headers().get(X_FORWARDED_HOST).unwrap(),
            "api.example.com"
        );
        assert!(req.headers().get(X_REQUEST_ID).is_some());
    }
}
