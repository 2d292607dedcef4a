//! File configuration for the standalone binary: mux-wide options plus
//! an optional initial snapshot of the object graph. Deployments driven
//! by a configuration watcher typically supply only the options and
//! push the graph through the mutation API instead.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::graph::{Address, BackendSpec, FrontendSpec, Host, Listener, Protocol, Snapshot};
use crate::mux::Options;

/// Top-level TOML configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyOptions,

    /// Initial graph, applied through `Mux::init` before start
    #[serde(default)]
    pub hosts: Vec<Host>,
    #[serde(default)]
    pub listeners: Vec<Listener>,
    #[serde(default)]
    pub backends: Vec<BackendSpec>,
    #[serde(default)]
    pub frontends: Vec<FrontendSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyOptions {
    /// Default upstream connect timeout (seconds)
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,

    /// Default per-request read deadline (seconds)
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,

    /// Cap on buffered request head size
    #[serde(default = "default_max_header_bytes")]
    pub max_header_bytes: usize,

    /// Grace period for draining in-flight requests on shutdown (seconds)
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,

    /// Bind one plain-HTTP listener at construction
    #[serde(default)]
    pub default_listener: bool,

    /// Interface for the default listener
    #[serde(default = "default_interface")]
    pub interface: String,

    /// Port for the default listener
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_dial_timeout() -> u64 {
    5
}

fn default_read_timeout() -> u64 {
    60
}

fn default_max_header_bytes() -> usize {
    1 << 20
}

fn default_shutdown_grace() -> u64 {
    10
}

fn default_interface() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            dial_timeout_secs: default_dial_timeout(),
            read_timeout_secs: default_read_timeout(),
            max_header_bytes: default_max_header_bytes(),
            shutdown_grace_secs: default_shutdown_grace(),
            pid_file: None,
            default_listener: false,
            interface: default_interface(),
            port: default_port(),
        }
    }
}

impl ProxyOptions {
    /// Translate into mux construction options.
    pub fn to_mux_options(&self) -> Options {
        Options {
            dial_timeout: Duration::from_secs(self.dial_timeout_secs),
            read_timeout: Duration::from_secs(self.read_timeout_secs),
            max_header_bytes: self.max_header_bytes,
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
            default_listener: self.default_listener.then(|| Listener {
                id: "DefaultListener".to_string(),
                protocol: Protocol::Http,
                address: Address::new("tcp", format!("{}:{}", self.interface, self.port)),
                tls: None,
                scope: None,
            }),
            ..Options::default()
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// The initial graph carried by the file, if any.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            hosts: self.hosts.clone(),
            backends: self.backends.clone(),
            listeners: self.listeners.clone(),
            frontends: self.frontends.clone(),
        }
    }
}
