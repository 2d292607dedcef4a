//! The mux: owns the object graph, the shared router and the servers,
//! serializes every mutation behind one writer lock, and keeps the
//! request hot path on immutable snapshots.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backend::BackendHandle;
use crate::error::MuxError;
use crate::frontend::FrontendHandle;
use crate::graph::{
    validate_snapshot, Backend, BackendKey, Frontend, FrontendKey, Host, HostKey, Listener,
    ListenerKey, Middleware, MiddlewareKey, Server, ServerKey, Snapshot,
};
use crate::handoff::FileDescriptor;
use crate::metrics::{ConnectionTracker, MetricsSink, Observers};
use crate::middleware::{Handler, MiddlewareRegistry};
use crate::router::{CompiledPredicate, HostPathRouter, Router};
use crate::server::{certified_key, ServerDeps, Srv, TlsSnapshot};
use crate::stapler::{StapleUpdated, Stapler};

/// Collaborators and process-wide defaults handed to the mux at
/// construction. Everything the original design kept as process globals
/// arrives here explicitly.
pub struct Options {
    /// Default upstream connect timeout for backends that leave theirs
    /// unset
    pub dial_timeout: Duration,
    /// Default per-request read deadline for backends that leave theirs
    /// unset
    pub read_timeout: Duration,
    /// Cap on buffered request head size per connection
    pub max_header_bytes: usize,
    /// How long graceful shutdown waits for in-flight requests
    pub shutdown_grace: Duration,
    /// Listener upserted at construction, typically from static config
    pub default_listener: Option<Listener>,
    /// Router shared by every server; the built-in host/path router when
    /// unset
    pub router: Option<Arc<dyn Router>>,
    /// Override for the router's NotFound handler
    pub not_found: Option<Arc<dyn Handler>>,
    /// Middleware factory registry; built-ins when unset
    pub registry: Option<Arc<MiddlewareRegistry>>,
    /// Incoming connection lifecycle observer
    pub incoming_tracker: Option<Arc<dyn ConnectionTracker>>,
    /// Sink for the periodic gauge emission
    pub metrics: Option<Arc<dyn MetricsSink>>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(60),
            max_header_bytes: 1 << 20,
            shutdown_grace: Duration::from_secs(10),
            default_listener: None,
            router: None,
            not_found: None,
            registry: None,
            incoming_tracker: None,
            metrics: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxState {
    /// Created, not accepting connections yet
    Init,
    /// Accepting connections
    Active,
    /// Draining existing connections, not accepting new ones
    ShuttingDown,
}

struct Graph {
    state: MuxState,
    hosts: HashMap<HostKey, Host>,
    servers: HashMap<ListenerKey, Arc<Srv>>,
    backends: HashMap<BackendKey, Arc<BackendHandle>>,
    frontends: HashMap<FrontendKey, Arc<FrontendHandle>>,
}

/// Owns every listener, server, backend, frontend and host, plus the
/// shared router. All mutations serialize on the graph's writer lock;
/// request dispatch reads only atomically-published snapshots.
pub struct Mux {
    id: usize,
    graph: RwLock<Graph>,
    router: Arc<dyn Router>,
    registry: Arc<MiddlewareRegistry>,
    observers: Observers,
    stapler: Arc<dyn Stapler>,
    dial_timeout: Duration,
    read_timeout: Duration,
    server_deps: ServerDeps,
    stop_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Display for Mux {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "mux_{}", self.id)
    }
}

impl Mux {
    pub fn new(id: usize, stapler: Arc<dyn Stapler>, options: Options) -> Result<Self, MuxError> {
        let router: Arc<dyn Router> = options
            .router
            .unwrap_or_else(|| Arc::new(HostPathRouter::new()));
        if let Some(not_found) = options.not_found {
            router.set_not_found(not_found);
        }
        let registry = options
            .registry
            .unwrap_or_else(|| Arc::new(MiddlewareRegistry::with_builtins()));

        let mut observers = Observers::new_default();
        if let Some(tracker) = options.incoming_tracker {
            observers.incoming = tracker;
        }
        if let Some(metrics) = options.metrics {
            observers.metrics = metrics;
        }

        let (stop_tx, _) = watch::channel(false);
        let server_deps = ServerDeps {
            router: router.clone(),
            observers: observers.clone(),
            read_timeout: options.read_timeout,
            max_header_bytes: options.max_header_bytes,
            shutdown_grace: options.shutdown_grace,
        };

        let mux = Self {
            id,
            graph: RwLock::new(Graph {
                state: MuxState::Init,
                hosts: HashMap::new(),
                servers: HashMap::new(),
                backends: HashMap::new(),
                frontends: HashMap::new(),
            }),
            router,
            registry,
            observers,
            stapler,
            dial_timeout: options.dial_timeout,
            read_timeout: options.read_timeout,
            server_deps,
            stop_tx,
            workers: Mutex::new(Vec::new()),
        };

        if let Some(listener) = options.default_listener {
            let mut graph = mux.graph.write();
            mux.upsert_listener_locked(&mut graph, listener)?;
        }
        Ok(mux)
    }

    pub fn state(&self) -> MuxState {
        self.graph.read().state
    }

    pub fn router(&self) -> Arc<dyn Router> {
        self.router.clone()
    }

    pub fn stats(&self) -> Arc<crate::metrics::ProxyStats> {
        self.observers.stats.clone()
    }

    /// Bound address of a started listener; useful with port 0.
    pub fn listener_addr(&self, key: &ListenerKey) -> Option<std::net::SocketAddr> {
        let graph = self.graph.read();
        graph.servers.get(key).and_then(|s| s.local_addr())
    }

    /// Populate the graph from a complete snapshot, in dependency order.
    pub fn init(&self, snapshot: Snapshot) -> Result<(), MuxError> {
        let mut graph = self.graph.write();
        if graph.state != MuxState::Init {
            return Err(MuxError::conflict(format!(
                "{} can only be initialized in the init state",
                self
            )));
        }
        validate_snapshot(&snapshot)?;

        for host in snapshot.hosts {
            self.validate_host(&host)?;
            graph.hosts.insert(host.key(), host);
        }

        for spec in snapshot.backends {
            let record = spec
                .backend
                .ok_or_else(|| MuxError::invalid_argument("backend spec without a backend"))?;
            let backend = BackendHandle::new(record, self.dial_timeout, self.read_timeout)?;
            for server in spec.servers {
                backend.upsert_server(server)?;
            }
            graph.backends.insert(backend.key().clone(), backend);
        }

        for listener in snapshot.listeners {
            // A listener identical in id and address to an existing
            // server is tolerated to keep re-initialization simple.
            if let Some(existing) = graph.servers.get(&listener.key()) {
                if existing.listener_record().address == listener.address {
                    continue;
                }
                return Err(MuxError::already_exists(format!(
                    "{} conflicts with existing listener",
                    listener.id
                )));
            }
            self.upsert_listener_locked(&mut graph, listener)?;
        }

        for spec in snapshot.frontends {
            let record = spec.frontend;
            let backend = graph
                .backends
                .get(&record.backend_key())
                .cloned()
                .ok_or_else(|| {
                    MuxError::not_found(format!(
                        "backend {} in frontend {}",
                        record.backend_id, record.id
                    ))
                })?;
            let key = record.key();
            let frontend = FrontendHandle::new(
                record,
                backend.clone(),
                self.router.clone(),
                self.registry.clone(),
                self.observers.stats.clone(),
            );
            frontend.set_middlewares(spec.middlewares);
            frontend.rebuild()?;
            backend.link_frontend(key.clone(), &frontend);
            graph.frontends.insert(key, frontend);
        }
        info!(mux = %self, "initialized from snapshot");
        Ok(())
    }

    /// Start every server and the background workers, then go active.
    pub fn start(self: &Arc<Self>) -> Result<(), MuxError> {
        let mut graph = self.graph.write();
        if graph.state != MuxState::Init {
            return Err(MuxError::conflict(format!(
                "{} can start only from the init state",
                self
            )));
        }
        info!(mux = %self, "starting");

        self.spawn_staple_worker();
        self.spawn_metrics_worker();

        graph.state = MuxState::Active;
        self.reload_tls_locked(&graph);
        for srv in graph.servers.values() {
            srv.start()?;
        }
        info!(mux = %self, "started");
        Ok(())
    }

    /// Stop accepting, drain every server, and optionally join the
    /// background workers.
    pub async fn stop(&self, wait: bool) {
        info!(mux = %self, wait, "stopping");
        let servers = {
            let mut graph = self.graph.write();
            if graph.state == MuxState::ShuttingDown {
                debug!(mux = %self, "already shutting down");
                Vec::new()
            } else {
                let prev = graph.state;
                graph.state = MuxState::ShuttingDown;
                let _ = self.stop_tx.send(true);
                if prev == MuxState::Init {
                    // Nothing bound yet.
                    Vec::new()
                } else {
                    graph.servers.values().cloned().collect()
                }
            }
        };

        for srv in servers {
            srv.shutdown().await;
        }

        if wait {
            let workers = std::mem::take(&mut *self.workers.lock());
            for worker in workers {
                if let Err(err) = worker.await {
                    if err.is_panic() {
                        error!(mux = %self, "background worker panicked");
                    }
                }
            }
            info!(mux = %self, "workers finished");
        }
    }

    pub fn upsert_host(&self, host: Host) -> Result<(), MuxError> {
        info!(mux = %self, host = %host.name, "upsert host");
        self.validate_host(&host)?;

        let mut graph = self.graph.write();
        let had_key_pair = graph
            .hosts
            .get(&host.key())
            .map(|h| h.settings.key_pair.is_some())
            .unwrap_or(false);
        let has_key_pair = host.settings.key_pair.is_some();
        graph.hosts.insert(host.key(), host);

        // Reload only on a TLS-relevant change; hosts without key
        // material do not disturb running handshakes.
        if has_key_pair || had_key_pair {
            self.reload_tls_locked(&graph);
        }
        Ok(())
    }

    pub fn delete_host(&self, key: &HostKey) -> Result<(), MuxError> {
        info!(mux = %self, host = %key.name, "delete host");
        let mut graph = self.graph.write();
        let host = graph
            .hosts
            .remove(key)
            .ok_or_else(|| MuxError::not_found(key))?;

        self.stapler.delete_host(key);

        if host.settings.key_pair.is_some() {
            self.reload_tls_locked(&graph);
        }
        Ok(())
    }

    pub fn upsert_listener(&self, listener: Listener) -> Result<(), MuxError> {
        info!(mux = %self, listener = %listener.id, address = %listener.address, "upsert listener");
        let mut graph = self.graph.write();
        self.upsert_listener_locked(&mut graph, listener)
    }

    fn upsert_listener_locked(&self, graph: &mut Graph, listener: Listener) -> Result<(), MuxError> {
        // Scope predicates are validated before anything mutates.
        if let Some(scope) = listener.scope.as_deref() {
            CompiledPredicate::parse_scope(scope)?;
        }

        let key = listener.key();
        if let Some(srv) = graph.servers.get(&key).cloned() {
            let changed = srv.update_listener(listener)?;
            if changed {
                self.reload_server_locked(graph, &srv);
            }
            return Ok(());
        }

        for srv in graph.servers.values() {
            if srv.listener_record().address == listener.address {
                return Err(MuxError::already_exists(format!(
                    "listener {} conflicts with existing {} on {}",
                    listener.id,
                    srv.listener_record().id,
                    listener.address
                )));
            }
        }

        let srv = Srv::new(listener, self.server_deps.clone())?;
        graph.servers.insert(key.clone(), srv.clone());

        if graph.state == MuxState::Active {
            debug!(mux = %self, listener = %key.id, "mux is active, starting server immediately");
            self.reload_server_locked(graph, &srv);
            if let Err(err) = srv.start() {
                graph.servers.remove(&key);
                return Err(err);
            }
        }
        Ok(())
    }

    pub async fn delete_listener(&self, key: &ListenerKey) -> Result<(), MuxError> {
        info!(mux = %self, listener = %key.id, "delete listener");
        let srv = {
            let mut graph = self.graph.write();
            graph
                .servers
                .remove(key)
                .ok_or_else(|| MuxError::not_found(key))?
        };
        srv.shutdown().await;
        Ok(())
    }

    pub fn upsert_backend(&self, backend: Backend) -> Result<(), MuxError> {
        info!(mux = %self, backend = %backend.id, "upsert backend");
        let mut graph = self.graph.write();
        self.upsert_backend_locked(&mut graph, backend).map(|_| ())
    }

    fn upsert_backend_locked(
        &self,
        graph: &mut Graph,
        backend: Backend,
    ) -> Result<Arc<BackendHandle>, MuxError> {
        let key = backend.key();
        if let Some(existing) = graph.backends.get(&key) {
            existing.update(backend)?;
            return Ok(existing.clone());
        }
        let handle = BackendHandle::new(backend, self.dial_timeout, self.read_timeout)?;
        graph.backends.insert(key, handle.clone());
        Ok(handle)
    }

    pub fn delete_backend(&self, key: &BackendKey) -> Result<(), MuxError> {
        info!(mux = %self, backend = %key.id, "delete backend");
        let mut graph = self.graph.write();
        let backend = graph
            .backends
            .get(key)
            .ok_or_else(|| MuxError::not_found(key))?;

        let linked = backend.linked_frontends();
        if !linked.is_empty() {
            // The backend and its transport stay live.
            return Err(MuxError::conflict(format!(
                "{} is used by frontends: {:?}",
                key,
                linked.iter().map(|k| k.id.clone()).collect::<Vec<_>>()
            )));
        }
        graph.backends.remove(key);
        Ok(())
    }

    pub fn upsert_frontend(&self, frontend: Frontend) -> Result<(), MuxError> {
        info!(mux = %self, frontend = %frontend.id, backend = %frontend.backend_id, "upsert frontend");
        let mut graph = self.graph.write();

        let backend = graph
            .backends
            .get(&frontend.backend_key())
            .cloned()
            .ok_or_else(|| MuxError::not_found(frontend.backend_key()))?;
        let key = frontend.key();

        if let Some(existing) = graph.frontends.get(&key).cloned() {
            let old_backend = existing.backend();
            let relinked = existing.update(frontend, backend.clone())?;
            if relinked {
                old_backend.unlink_frontend(&key);
                backend.link_frontend(key, &existing);
            }
            return Ok(());
        }

        let handle = FrontendHandle::new(
            frontend,
            backend.clone(),
            self.router.clone(),
            self.registry.clone(),
            self.observers.stats.clone(),
        );
        handle.rebuild()?;
        backend.link_frontend(key.clone(), &handle);
        graph.frontends.insert(key, handle);
        Ok(())
    }

    pub fn delete_frontend(&self, key: &FrontendKey) -> Result<(), MuxError> {
        info!(mux = %self, frontend = %key.id, "delete frontend");
        let mut graph = self.graph.write();
        let frontend = graph
            .frontends
            .remove(key)
            .ok_or_else(|| MuxError::not_found(key))?;
        frontend.remove();
        Ok(())
    }

    pub fn upsert_middleware(
        &self,
        frontend_key: &FrontendKey,
        middleware: Middleware,
    ) -> Result<(), MuxError> {
        info!(mux = %self, frontend = %frontend_key.id, middleware = %middleware.id, "upsert middleware");
        let graph = self.graph.write();
        let frontend = graph
            .frontends
            .get(frontend_key)
            .ok_or_else(|| MuxError::not_found(frontend_key))?;
        let key = MiddlewareKey::new(frontend_key.clone(), middleware.id.clone());
        frontend.upsert_middleware(key, middleware)
    }

    pub fn delete_middleware(&self, key: &MiddlewareKey) -> Result<(), MuxError> {
        info!(mux = %self, frontend = %key.frontend.id, middleware = %key.id, "delete middleware");
        let graph = self.graph.write();
        let frontend = graph
            .frontends
            .get(&key.frontend)
            .ok_or_else(|| MuxError::not_found(&key.frontend))?;
        frontend.delete_middleware(key)
    }

    pub fn upsert_server(&self, backend_key: &BackendKey, server: Server) -> Result<(), MuxError> {
        info!(mux = %self, backend = %backend_key.id, server = %server.id, url = %server.url, "upsert server");
        server.parse_url()?;

        let mut graph = self.graph.write();
        let backend = match graph.backends.get(backend_key).cloned() {
            Some(backend) => backend,
            None => {
                // Convenience contract: a server may arrive before its
                // backend; create the backend with default settings.
                info!(mux = %self, backend = %backend_key.id, "auto-creating backend for server");
                self.upsert_backend_locked(&mut graph, Backend::new(backend_key.id.clone()))?
            }
        };
        backend.upsert_server(server)
    }

    pub fn delete_server(&self, key: &ServerKey) -> Result<(), MuxError> {
        info!(mux = %self, backend = %key.backend.id, server = %key.id, "delete server");
        let graph = self.graph.write();
        let backend = graph
            .backends
            .get(&key.backend)
            .ok_or_else(|| MuxError::not_found(&key.backend))?;
        backend.delete_server(&key.id)
    }

    /// Duplicate every started server's listening socket for handoff.
    pub fn get_files(&self) -> Result<Vec<FileDescriptor>, MuxError> {
        let graph = self.graph.read();
        let mut files = Vec::new();
        for srv in graph.servers.values() {
            if let Some(fd) = srv.get_file()? {
                files.push(fd);
            }
        }
        Ok(files)
    }

    /// Match inherited descriptors to servers by address, before start.
    pub fn take_files(&self, files: Vec<FileDescriptor>) -> Result<(), MuxError> {
        info!(mux = %self, count = files.len(), "taking inherited files");
        let mut by_address: HashMap<_, _> = files
            .into_iter()
            .map(|f| (f.address.clone(), f))
            .collect();

        let graph = self.graph.write();
        for srv in graph.servers.values() {
            let address = srv.listener_record().address;
            match by_address.remove(&address) {
                Some(fd) => srv.take_file(fd)?,
                None => {
                    debug!(mux = %self, address = %address, "no inherited file for address");
                }
            }
        }
        Ok(())
    }

    fn validate_host(&self, host: &Host) -> Result<(), MuxError> {
        if let Some(key_pair) = &host.settings.key_pair {
            certified_key(key_pair, None)?;
        }
        Ok(())
    }

    /// Recompute per-host TLS material (with staples) and push it to
    /// every TLS-terminating server. Scope filters ride along so one
    /// reload covers listener updates too.
    fn reload_tls_locked(&self, graph: &Graph) {
        let hosts = self.host_material_locked(graph);
        for srv in graph.servers.values() {
            if srv.is_tls() {
                self.push_snapshot(srv, hosts.clone());
            }
        }
    }

    fn reload_server_locked(&self, graph: &Graph, srv: &Arc<Srv>) {
        let hosts = if srv.is_tls() {
            self.host_material_locked(graph)
        } else {
            HashMap::new()
        };
        self.push_snapshot(srv, hosts);
    }

    fn host_material_locked(
        &self,
        graph: &Graph,
    ) -> HashMap<String, Arc<rustls::sign::CertifiedKey>> {
        let mut hosts = HashMap::new();
        for (key, host) in &graph.hosts {
            let Some(key_pair) = &host.settings.key_pair else {
                continue;
            };
            let staple = self.stapler.staple(key).map(|s| s.response);
            match certified_key(key_pair, staple) {
                Ok(certified) => {
                    hosts.insert(key.name.to_lowercase(), certified);
                }
                Err(err) => {
                    warn!(mux = %self, host = %key.name, error = %err, "skipping host with unusable TLS material");
                }
            }
        }
        hosts
    }

    fn push_snapshot(
        &self,
        srv: &Arc<Srv>,
        hosts: HashMap<String, Arc<rustls::sign::CertifiedKey>>,
    ) {
        let record = srv.listener_record();
        let default = record
            .tls
            .as_ref()
            .and_then(|tls| tls.default_key_pair.as_ref())
            .and_then(|kp| match certified_key(kp, None) {
                Ok(ck) => Some(ck),
                Err(err) => {
                    warn!(mux = %self, listener = %record.id, error = %err, "unusable default key pair");
                    None
                }
            });
        let scope = record
            .scope
            .as_deref()
            .and_then(|s| CompiledPredicate::parse_scope(s).ok());
        srv.reload(TlsSnapshot { hosts, default }, scope);
    }

    fn spawn_staple_worker(self: &Arc<Self>) {
        let mux = Arc::clone(self);
        let mut updates = self.stapler.subscribe();
        let mut stop_rx = self.stop_tx.subscribe();
        let worker = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            info!(mux = %mux, "stop listening for staple updates");
                            break;
                        }
                    }
                    event = updates.recv() => {
                        match event {
                            Some(event) => mux.process_staple_update(event),
                            None => {
                                debug!(mux = %mux, "staple subscription closed");
                                break;
                            }
                        }
                    }
                }
            }
        });
        self.workers.lock().push(worker);
    }

    fn spawn_metrics_worker(self: &Arc<Self>) {
        let mux = Arc::clone(self);
        let mut stop_rx = self.stop_tx.subscribe();
        let worker = tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            info!(mux = %mux, "stop emitting metrics");
                            break;
                        }
                    }
                    _ = tick.tick() => mux.emit_metrics(),
                }
            }
        });
        self.workers.lock().push(worker);
    }

    fn process_staple_update(&self, event: StapleUpdated) {
        debug!(mux = %self, host = %event.host_key.name, "staple update");
        let graph = self.graph.write();
        if !graph.hosts.contains_key(&event.host_key) {
            debug!(mux = %self, host = %event.host_key.name, "staple update for unknown host, skipping");
            return;
        }
        // Each TLS server picks the fresh staple up during reload.
        self.reload_tls_locked(&graph);
    }

    fn emit_metrics(&self) {
        let (frontends, backends, servers) = {
            let graph = self.graph.read();
            (
                graph.frontends.len() as u64,
                graph.backends.len() as u64,
                graph.servers.len() as u64,
            )
        };
        let metrics = &self.observers.metrics;
        metrics.gauge("frontends", frontends);
        metrics.gauge("backends", backends);
        metrics.gauge("listeners", servers);
        metrics.gauge("requests_total", self.observers.stats.get_total_requests());
        metrics.gauge("requests_active", self.observers.stats.get_active_requests());
    }
}
