//! Live backend objects: the shared upstream transport and the server
//! list, both published as atomic snapshots for the request hot path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::error::{HttpBody, MuxError};
use crate::frontend::FrontendHandle;
use crate::graph::{Backend, BackendKey, FrontendKey, Server, TransportSettings};

/// Pooled forwarding client plus the resolved settings it was built
/// from. Swapped wholesale when transport-affecting settings change;
/// in-flight requests keep the old transport alive through their Arc
/// until their response completes, at which point the old pool drops.
pub struct Transport {
    pub client: Client<HttpConnector, HttpBody>,
    pub settings: TransportSettings,
}

impl Transport {
    fn build(settings: TransportSettings) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);
        connector.set_connect_timeout(Some(settings.dial));

        let mut builder = Client::builder(TokioExecutor::new());
        builder
            .pool_max_idle_per_host(settings.max_idle_conns_per_host)
            .pool_idle_timeout(settings.keep_alive_period);
        if settings.http2 {
            builder.http2_only(true);
        }
        let client = builder.build(connector);

        debug!(
            dial_secs = settings.dial.as_secs(),
            max_idle = settings.max_idle_conns_per_host,
            http2 = settings.http2,
            "Transport built"
        );
        Self { client, settings }
    }
}

/// A named pool of upstream servers sharing one transport.
///
/// Owned by the mux's backend map. Frontends hold strong references;
/// the reverse links back to frontends are weak, so deleting a frontend
/// never leaves ownership ambiguity.
pub struct BackendHandle {
    key: BackendKey,
    spec: RwLock<Backend>,
    transport: ArcSwap<Transport>,
    servers: ArcSwap<Vec<Server>>,
    frontends: Mutex<HashMap<FrontendKey, Weak<FrontendHandle>>>,
    round_robin: AtomicUsize,
    default_dial: Duration,
    default_read: Duration,
}

impl BackendHandle {
    pub fn new(
        record: Backend,
        default_dial: Duration,
        default_read: Duration,
    ) -> Result<Arc<Self>, MuxError> {
        let resolved = record.settings.resolve(default_dial, default_read);
        Ok(Arc::new(Self {
            key: record.key(),
            transport: ArcSwap::from_pointee(Transport::build(resolved)),
            spec: RwLock::new(record),
            servers: ArcSwap::from_pointee(Vec::new()),
            frontends: Mutex::new(HashMap::new()),
            round_robin: AtomicUsize::new(0),
            default_dial,
            default_read,
        }))
    }

    pub fn key(&self) -> &BackendKey {
        &self.key
    }

    pub fn record(&self) -> Backend {
        self.spec.read().clone()
    }

    /// Apply a new record. The transport is rebuilt and swapped only
    /// when transport-affecting settings changed.
    pub fn update(&self, record: Backend) -> Result<(), MuxError> {
        let new_settings = record.settings.resolve(self.default_dial, self.default_read);
        let changed = new_settings != self.transport.load().settings;
        if changed {
            self.transport.store(Arc::new(Transport::build(new_settings)));
            debug!(backend = %self.key, "Transport swapped");
        }
        *self.spec.write() = record;
        Ok(())
    }

    /// Current transport snapshot; held across a request's lifetime.
    pub fn transport(&self) -> Arc<Transport> {
        self.transport.load_full()
    }

    /// Current server list snapshot.
    pub fn servers(&self) -> Arc<Vec<Server>> {
        self.servers.load_full()
    }

    pub fn upsert_server(&self, server: Server) -> Result<(), MuxError> {
        server.parse_url()?;
        let current = self.servers.load();
        let mut next: Vec<Server> = current.iter().cloned().collect();
        match next.iter_mut().find(|s| s.id == server.id) {
            Some(slot) => *slot = server,
            None => next.push(server),
        }
        self.servers.store(Arc::new(next));
        Ok(())
    }

    pub fn delete_server(&self, id: &str) -> Result<(), MuxError> {
        let current = self.servers.load();
        if !current.iter().any(|s| s.id == id) {
            return Err(MuxError::not_found(format!("server({}/{})", self.key.id, id)));
        }
        let next: Vec<Server> = current.iter().filter(|s| s.id != id).cloned().collect();
        self.servers.store(Arc::new(next));
        Ok(())
    }

    /// Round-robin pick for the next dispatch. The order shifts by one
    /// on every call; failover starts from the returned index.
    pub fn next_server_index(&self, len: usize) -> usize {
        if len == 0 {
            return 0;
        }
        self.round_robin.fetch_add(1, Ordering::Relaxed) % len
    }

    pub fn link_frontend(&self, key: FrontendKey, frontend: &Arc<FrontendHandle>) {
        self.frontends.lock().insert(key, Arc::downgrade(frontend));
    }

    pub fn unlink_frontend(&self, key: &FrontendKey) {
        self.frontends.lock().remove(key);
    }

    /// Frontends still referencing this backend; dead weak links are
    /// pruned on the way through.
    pub fn linked_frontends(&self) -> Vec<FrontendKey> {
        let mut links = self.frontends.lock();
        links.retain(|_, weak| weak.strong_count() > 0);
        links.keys().cloned().collect()
    }
}
