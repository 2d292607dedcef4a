//! Zero-downtime socket handoff between two muxes in one process: the
//! successor adopts the predecessor's bound descriptors, and the
//! address keeps accepting through the whole transition.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use routegate::graph::{BackendKey, ListenerKey};
use routegate::mux::{Mux, Options};
use routegate::stapler::MemoryStapler;

/// Pick a free concrete address; handoff matches descriptors to
/// listeners by their configured address, so both generations need the
/// same literal value.
fn free_loopback_addr() -> String {
    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    probe.local_addr().unwrap().to_string()
}

#[tokio::test]
async fn test_socket_handoff_keeps_address_bound() {
    let upstream = spawn_upstream("gen-a").await;
    let bind_addr = free_loopback_addr();

    let mux_a = Arc::new(Mux::new(1, MemoryStapler::new(), Options::default()).unwrap());
    mux_a.upsert_listener(http_listener("web", &bind_addr)).unwrap();
    mux_a.upsert_backend(backend("b1")).unwrap();
    mux_a.upsert_server(&BackendKey::new("b1"), server("s1", upstream)).unwrap();
    mux_a.upsert_frontend(frontend_for_host("f1", "api.example.com", "b1")).unwrap();
    mux_a.start().unwrap();

    let addr = mux_a.listener_addr(&ListenerKey::new("web")).unwrap();
    assert!(wait_for_port(addr, Duration::from_secs(2)).await);

    let response = http_get_with_host(addr, "/", "api.example.com").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);

    // Hand the bound socket to a successor configured for the same
    // concrete address.
    let files = mux_a.get_files().unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].address.address, bind_addr);

    let upstream_b = spawn_upstream("gen-b").await;
    let mux_b = Arc::new(Mux::new(2, MemoryStapler::new(), Options::default()).unwrap());
    mux_b.upsert_listener(http_listener("web", &bind_addr)).unwrap();
    mux_b.upsert_backend(backend("b1")).unwrap();
    mux_b.upsert_server(&BackendKey::new("b1"), server("s1", upstream_b)).unwrap();
    mux_b.upsert_frontend(frontend_for_host("f1", "api.example.com", "b1")).unwrap();

    mux_b.take_files(files).unwrap();
    // Start succeeds without rebinding: a fresh bind on the same
    // address would fail while A still holds it.
    mux_b.start().unwrap();

    // Both generations share the socket; every request is answered.
    for _ in 0..10 {
        let response = http_get_with_host(addr, "/", "api.example.com").await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);
    }

    mux_a.stop(true).await;

    // The old generation is gone; the address never unbound.
    for _ in 0..10 {
        let response = http_get_with_host(addr, "/", "api.example.com").await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);
        assert!(response.ends_with("gen-b"), "got: {}", response);
    }

    mux_b.stop(true).await;
}

#[tokio::test]
async fn test_take_files_requires_init_state() {
    let mux = Arc::new(Mux::new(3, MemoryStapler::new(), Options::default()).unwrap());
    mux.upsert_listener(http_listener("web", "127.0.0.1:0")).unwrap();
    mux.start().unwrap();

    let addr = mux.listener_addr(&ListenerKey::new("web")).unwrap();
    let files = mux.get_files().unwrap();
    assert_eq!(files.len(), 1);

    // A started server refuses to adopt a descriptor.
    assert_eq!(
        mux.take_files(files).unwrap_err().kind(),
        routegate::ErrorKind::Conflict
    );

    // Still serving on the original socket.
    assert!(wait_for_port(addr, Duration::from_secs(2)).await);
    mux.stop(true).await;
}

#[tokio::test]
async fn test_get_files_before_start_is_empty() {
    let mux = Arc::new(Mux::new(4, MemoryStapler::new(), Options::default()).unwrap());
    mux.upsert_listener(http_listener("web", "127.0.0.1:18099")).unwrap();
    // No socket exists before start.
    assert!(mux.get_files().unwrap().is_empty());
}
