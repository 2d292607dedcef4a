//! Configuration object graph: hosts, listeners, backends, upstream
//! servers, frontends and middlewares, plus the typed keys that address
//! them.
//!
//! Records are plain data. The live objects built from them (bound
//! sockets, transports, compiled routes) live in the `server`, `backend`
//! and `frontend` modules; the mux owns the maps.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::MuxError;

/// Network endpoint a listener binds. Compared byte-for-byte for
/// uniqueness across listeners.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    /// Typically "tcp" or "tcp6"
    #[serde(default = "default_network")]
    pub network: String,
    /// "host:port"
    pub address: String,
}

fn default_network() -> String {
    "tcp".to_string()
}

impl Address {
    pub fn new(network: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            address: address.into(),
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", self.network, self.address)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostKey {
    pub name: String,
}

impl HostKey {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl std::fmt::Display for HostKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "host({})", self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListenerKey {
    pub id: String,
}

impl ListenerKey {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl std::fmt::Display for ListenerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "listener({})", self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackendKey {
    pub id: String,
}

impl BackendKey {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl std::fmt::Display for BackendKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "backend({})", self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerKey {
    pub backend: BackendKey,
    pub id: String,
}

impl ServerKey {
    pub fn new(backend: BackendKey, id: impl Into<String>) -> Self {
        Self {
            backend,
            id: id.into(),
        }
    }
}

impl std::fmt::Display for ServerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "server({}/{})", self.backend.id, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrontendKey {
    pub id: String,
}

impl FrontendKey {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl std::fmt::Display for FrontendKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "frontend({})", self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MiddlewareKey {
    pub frontend: FrontendKey,
    pub id: String,
}

impl MiddlewareKey {
    pub fn new(frontend: FrontendKey, id: impl Into<String>) -> Self {
        Self {
            frontend,
            id: id.into(),
        }
    }
}

impl std::fmt::Display for MiddlewareKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "middleware({}/{})", self.frontend.id, self.id)
    }
}

/// PEM-encoded certificate chain and private key for one host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPair {
    /// Certificate chain, PEM
    pub cert: String,
    /// Private key, PEM
    pub key: String,
}

/// OCSP options for one host; consumed by the stapler, carried opaquely
/// by the core.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OcspSettings {
    #[serde(default)]
    pub enabled: bool,
    /// Responder URL overrides; empty means use the certificate's AIA
    #[serde(default)]
    pub responders: Vec<String>,
    #[serde(default)]
    pub skip_signature_check: bool,
    /// Refresh period in seconds
    #[serde(default)]
    pub period_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSettings {
    #[serde(default)]
    pub key_pair: Option<KeyPair>,
    #[serde(default)]
    pub ocsp: OcspSettings,
}

/// Per-hostname settings, keyed by SNI name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub name: String,
    #[serde(default)]
    pub settings: HostSettings,
}

impl Host {
    pub fn key(&self) -> HostKey {
        HostKey::new(self.name.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Http => write!(f, "http"),
            Protocol::Https => write!(f, "https"),
        }
    }
}

/// TLS settings local to one listener.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerTlsSettings {
    /// Fallback key pair served when no host matches the client's SNI
    #[serde(default)]
    pub default_key_pair: Option<KeyPair>,
}

/// A network endpoint the proxy should bind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listener {
    pub id: String,
    pub protocol: Protocol,
    pub address: Address,
    #[serde(default)]
    pub tls: Option<ListenerTlsSettings>,
    /// Host predicate limiting which frontends apply on this listener
    #[serde(default)]
    pub scope: Option<String>,
}

impl Listener {
    pub fn key(&self) -> ListenerKey {
        ListenerKey::new(self.id.clone())
    }

    pub fn is_tls(&self) -> bool {
        self.protocol == Protocol::Https
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Http,
}

/// Transport timeouts; zero means "inherit the mux-wide default".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendTimeouts {
    /// Socket connect timeout, seconds
    #[serde(default)]
    pub dial_secs: u64,
    /// Overall per-request read deadline, seconds
    #[serde(default)]
    pub read_secs: u64,
    /// TLS handshake deadline for https upstreams, seconds
    #[serde(default)]
    pub tls_handshake_secs: u64,
    /// Time allowed for upstream response headers, seconds
    #[serde(default)]
    pub response_header_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendKeepAlive {
    /// Idle connection lifetime, seconds
    #[serde(default = "default_keepalive_period")]
    pub period_secs: u64,
    #[serde(default = "default_max_idle_per_host")]
    pub max_idle_conns_per_host: usize,
}

fn default_keepalive_period() -> u64 {
    90
}

fn default_max_idle_per_host() -> usize {
    10
}

impl Default for BackendKeepAlive {
    fn default() -> Self {
        Self {
            period_secs: default_keepalive_period(),
            max_idle_conns_per_host: default_max_idle_per_host(),
        }
    }
}

/// Settings for the transport shared by every frontend of a backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpBackendSettings {
    #[serde(default)]
    pub timeouts: BackendTimeouts,
    #[serde(default)]
    pub keep_alive: BackendKeepAlive,
    /// Force HTTP/2 towards the upstreams
    #[serde(default)]
    pub http2: bool,
}

/// A named pool of upstream servers with shared transport settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backend {
    pub id: String,
    #[serde(default)]
    pub kind: BackendKind,
    #[serde(default)]
    pub settings: HttpBackendSettings,
}

impl Backend {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: BackendKind::Http,
            settings: HttpBackendSettings::default(),
        }
    }

    pub fn key(&self) -> BackendKey {
        BackendKey::new(self.id.clone())
    }
}

/// One upstream server inside a backend pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub id: String,
    pub url: String,
}

impl Server {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
        }
    }

    /// Parse and validate the URL: absolute, with a host, http scheme.
    pub fn parse_url(&self) -> Result<hyper::Uri, MuxError> {
        let uri: hyper::Uri = self.url.parse().map_err(|e| {
            MuxError::invalid_argument(format!("failed to parse {}: {}", self.url, e))
        })?;
        match uri.scheme_str() {
            Some("http") => {}
            Some(other) => {
                return Err(MuxError::invalid_argument(format!(
                    "unsupported upstream scheme {} in {}",
                    other, self.url
                )))
            }
            None => {
                return Err(MuxError::invalid_argument(format!(
                    "{} is not an absolute URL",
                    self.url
                )))
            }
        }
        if uri.host().is_none() {
            return Err(MuxError::invalid_argument(format!(
                "{} has no host",
                self.url
            )));
        }
        Ok(uri)
    }
}

/// Whether a frontend buffers request bodies (enabling failover) or
/// streams them straight through.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyMode {
    #[default]
    Buffer,
    Stream,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrontendSettings {
    /// Forward the client's Host header instead of the upstream's
    #[serde(default)]
    pub pass_host_header: bool,
    /// Retry the next server on connect failure (buffer mode only)
    #[serde(default)]
    pub failover: bool,
    #[serde(default)]
    pub body_mode: BodyMode,
    /// Cap on buffered request bodies, bytes
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Per-request deadline override, seconds; zero inherits the backend
    #[serde(default)]
    pub request_timeout_secs: u64,
}

fn default_max_body_bytes() -> usize {
    32 * 1024 * 1024
}

impl Default for FrontendSettings {
    fn default() -> Self {
        Self {
            pass_host_header: false,
            failover: false,
            body_mode: BodyMode::Buffer,
            max_body_bytes: default_max_body_bytes(),
            request_timeout_secs: 0,
        }
    }
}

/// A route predicate bound to exactly one backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frontend {
    pub id: String,
    /// Route predicate DSL, e.g. `Host("api.example.com") && PathPrefix("/v1")`
    pub route: String,
    pub backend_id: String,
    #[serde(default)]
    pub settings: FrontendSettings,
}

impl Frontend {
    pub fn key(&self) -> FrontendKey {
        FrontendKey::new(self.id.clone())
    }

    pub fn backend_key(&self) -> BackendKey {
        BackendKey::new(self.backend_id.clone())
    }
}

/// A handler-transform on a frontend, instantiated from an opaque spec
/// by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Middleware {
    pub id: String,
    /// Registry key selecting the factory
    pub kind: String,
    /// Lower runs closer to the client
    #[serde(default)]
    pub priority: i32,
    /// Opaque to the core
    #[serde(default)]
    pub spec: serde_json::Value,
}

/// A backend together with its upstream servers, as carried by a
/// snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendSpec {
    pub backend: Option<Backend>,
    #[serde(default)]
    pub servers: Vec<Server>,
}

/// A frontend together with its middlewares, as carried by a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrontendSpec {
    pub frontend: Frontend,
    #[serde(default)]
    pub middlewares: Vec<Middleware>,
}

/// Complete configuration used by `Mux::init`, applied in dependency
/// order: hosts, backends with servers, listeners, frontends with
/// middlewares.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub hosts: Vec<Host>,
    #[serde(default)]
    pub backends: Vec<BackendSpec>,
    #[serde(default)]
    pub listeners: Vec<Listener>,
    #[serde(default)]
    pub frontends: Vec<FrontendSpec>,
}

pub(crate) fn secs(v: u64) -> Option<Duration> {
    (v > 0).then(|| Duration::from_secs(v))
}

/// Resolved transport settings after applying mux-wide defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportSettings {
    pub dial: Duration,
    pub read: Duration,
    /// Tighter deadline for upstream response headers, when configured
    pub response_header: Option<Duration>,
    pub keep_alive_period: Duration,
    pub max_idle_conns_per_host: usize,
    pub http2: bool,
}

impl HttpBackendSettings {
    /// Fill in mux-wide defaults where the record leaves timeouts unset.
    pub fn resolve(&self, default_dial: Duration, default_read: Duration) -> TransportSettings {
        TransportSettings {
            dial: secs(self.timeouts.dial_secs).unwrap_or(default_dial),
            read: secs(self.timeouts.read_secs).unwrap_or(default_read),
            response_header: secs(self.timeouts.response_header_secs),
            keep_alive_period: Duration::from_secs(self.keep_alive.period_secs),
            max_idle_conns_per_host: self.keep_alive.max_idle_conns_per_host,
            http2: self.http2,
        }
    }
}

/// Check a snapshot's internal references before anything is mutated.
pub fn validate_snapshot(snapshot: &Snapshot) -> Result<(), MuxError> {
    let mut addresses: HashMap<&Address, &str> = HashMap::new();
    for l in &snapshot.listeners {
        if let Some(existing) = addresses.insert(&l.address, &l.id) {
            return Err(MuxError::already_exists(format!(
                "listener {} conflicts with {} on {}",
                l.id, existing, l.address
            )));
        }
    }

    let backend_ids: Vec<&str> = snapshot
        .backends
        .iter()
        .filter_map(|bs| bs.backend.as_ref().map(|b| b.id.as_str()))
        .collect();
    for fs in &snapshot.frontends {
        if !backend_ids.contains(&fs.frontend.backend_id.as_str()) {
            return Err(MuxError::not_found(format!(
                "backend {} referenced by frontend {}",
                fs.frontend.backend_id, fs.frontend.id
            )));
        }
    }

    for bs in &snapshot.backends {
        for srv in &bs.servers {
            srv.parse_url()?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_url_validation() {
        assert!(Server::new("s1", "http://127.0.0.1:9001").parse_url().is_ok());
        assert!(Server::new("s1", "http://example.com/path").parse_url().is_ok());
        assert!(Server::new("s1", "not a url").parse_url().is_err());
        assert!(Server::new("s1", "/relative/only").parse_url().is_err());
        assert!(Server::new("s1", "ftp://example.com").parse_url().is_err());
    }

    #[test]
    fn test_address_equality_is_byte_for_byte() {
        let a = Address::new("tcp", "127.0.0.1:8080");
        let b = Address::new("tcp", "127.0.0.1:8080");
        let c = Address::new("tcp6", "127.0.0.1:8080");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_settings_resolution_inherits_defaults() {
        let settings = HttpBackendSettings::default();
        let resolved = settings.resolve(Duration::from_secs(5), Duration::from_secs(30));
        assert_eq!(resolved.dial, Duration::from_secs(5));
        assert_eq!(resolved.read, Duration::from_secs(30));

        let mut custom = HttpBackendSettings::default();
        custom.timeouts.dial_secs = 2;
        let resolved = custom.resolve(Duration::from_secs(5), Duration::from_secs(30));
        assert_eq!(resolved.dial, Duration::from_secs(2));
    }

    #[test]
    fn test_snapshot_validation_rejects_duplicate_addresses() {
        let snapshot = Snapshot {
            listeners: vec![
                Listener {
                    id: "l1".into(),
                    protocol: Protocol::Http,
                    address: Address::new("tcp", "0.0.0.0:8080"),
                    tls: None,
                    scope: None,
                },
                Listener {
                    id: "l2".into(),
                    protocol: Protocol::Http,
                    address: Address::new("tcp", "0.0.0.0:8080"),
                    tls: None,
                    scope: None,
                },
            ],
            ..Default::default()
        };
        assert!(validate_snapshot(&snapshot).is_err());
    }

    #[test]
    fn test_snapshot_validation_rejects_dangling_frontend() {
        let snapshot = Snapshot {
            frontends: vec![FrontendSpec {
                frontend: Frontend {
                    id: "f1".into(),
                    route: r#"Host("x")"#.into(),
                    backend_id: "missing".into(),
                    settings: FrontendSettings::default(),
                },
                middlewares: vec![],
            }],
            ..Default::default()
        };
        assert!(validate_snapshot(&snapshot).is_err());
    }

    #[test]
    fn test_records_roundtrip_toml() {
        let listener: Listener = toml::from_str(
            r#"
            id = "web"
            protocol = "https"
            scope = 'Host("api.example.com")'

            [address]
            address = "0.0.0.0:8443"
        "#,
        )
        .unwrap();
        assert_eq!(listener.protocol, Protocol::Https);
        assert_eq!(listener.address.network, "tcp");
        assert!(listener.tls.is_none());
    }
}
