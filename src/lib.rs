//! routegate — a dynamic, hot-reconfigurable HTTP/HTTPS reverse proxy.
//!
//! The [`mux::Mux`] owns live listener sockets, a routing table, backend
//! pools and per-host TLS material, applies atomic configuration deltas
//! while traffic is flowing, and hands its listening sockets to a
//! successor process for zero-downtime upgrades.

pub mod backend;
pub mod config;
pub mod error;
pub mod frontend;
pub mod graph;
pub mod handoff;
pub mod metrics;
pub mod middleware;
pub mod mux;
pub mod router;
pub mod server;
pub mod stapler;

pub use error::{ErrorKind, MuxError};
pub use mux::{Mux, MuxState, Options};
