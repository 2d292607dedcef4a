//! OCSP staple integration.
//!
//! The fetcher itself is an external collaborator; the core only needs a
//! lookup by host key and a subscription for refresh events. The
//! in-memory implementation backs tests and standalone deployments where
//! staples are pushed by an operator or a sidecar.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::graph::HostKey;

/// A cached, time-bounded certificate status response for one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostStaple {
    /// DER-encoded OCSP response, attached verbatim to handshakes
    pub response: Vec<u8>,
}

/// Emitted by the stapler whenever a host's staple is refreshed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StapleUpdated {
    pub host_key: HostKey,
}

/// Lookup and subscription surface the mux consumes.
pub trait Stapler: Send + Sync {
    /// Current staple for a host; non-blocking, None when absent.
    fn staple(&self, host_key: &HostKey) -> Option<HostStaple>;

    /// Subscribe to refresh events. The subscription ends when the
    /// receiver is dropped, which the mux does when its stop channel
    /// closes.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<StapleUpdated>;

    /// Drop the cached staple for a host, typically after DeleteHost.
    fn delete_host(&self, host_key: &HostKey);
}

/// Staple cache fed by explicit `set_staple` calls.
#[derive(Default)]
pub struct MemoryStapler {
    staples: Mutex<HashMap<HostKey, HostStaple>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<StapleUpdated>>>,
}

impl MemoryStapler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Store a staple and fan the refresh event out to subscribers.
    pub fn set_staple(&self, host_key: HostKey, response: Vec<u8>) {
        self.staples
            .lock()
            .insert(host_key.clone(), HostStaple { response });
        let event = StapleUpdated { host_key };
        // Closed receivers are pruned on the way through.
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl Stapler for MemoryStapler {
    fn staple(&self, host_key: &HostKey) -> Option<HostStaple> {
        self.staples.lock().get(host_key).cloned()
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<StapleUpdated> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    fn delete_host(&self, host_key: &HostKey) {
        self.staples.lock().remove(host_key);
    }
}
