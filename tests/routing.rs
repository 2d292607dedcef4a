//! End-to-end routing through a running mux: host dispatch, middleware
//! ordering, and live reconfiguration.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use routegate::graph::{BackendKey, FrontendKey, ListenerKey, Middleware};
use routegate::mux::{Mux, Options};
use routegate::stapler::MemoryStapler;
use serde_json::json;

async fn started_mux() -> Arc<Mux> {
    let mux = Arc::new(Mux::new(1, MemoryStapler::new(), Options::default()).unwrap());
    mux.upsert_listener(http_listener("l1", "127.0.0.1:0")).unwrap();
    mux.start().unwrap();
    mux
}

#[tokio::test]
async fn test_simple_host_routing() {
    let upstream = spawn_upstream("upstream-b1").await;
    let mux = started_mux().await;

    mux.upsert_backend(backend("b1")).unwrap();
    mux.upsert_server(&BackendKey::new("b1"), server("s1", upstream)).unwrap();
    mux.upsert_frontend(frontend_for_host("f1", "api.example.com", "b1")).unwrap();

    let addr = mux.listener_addr(&ListenerKey::new("l1")).unwrap();
    assert!(wait_for_port(addr, Duration::from_secs(2)).await);

    let response = http_get_with_host(addr, "/", "api.example.com").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);
    assert!(response.ends_with("upstream-b1"), "got: {}", response);

    let response = http_get_with_host(addr, "/", "other.example.com").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 404"), "got: {}", response);
    assert!(response.contains("application/json"), "got: {}", response);
    assert!(response.contains(r#"{"error":"not found"}"#), "got: {}", response);

    mux.stop(true).await;
}

#[tokio::test]
async fn test_middleware_priority_ordering() {
    let upstream = spawn_upstream("ok").await;
    let mux = started_mux().await;

    mux.upsert_backend(backend("b1")).unwrap();
    mux.upsert_server(&BackendKey::new("b1"), server("s1", upstream)).unwrap();
    mux.upsert_frontend(frontend_for_host("f1", "api.example.com", "b1")).unwrap();

    let fk = FrontendKey::new("f1");
    // Lower priority runs closer to the client, so "inner" tags the
    // request first and "outer" second; the upstream echoes the order.
    mux.upsert_middleware(
        &fk,
        Middleware {
            id: "a".into(),
            kind: "request-header".into(),
            priority: 2,
            spec: json!({"name": "x-mw", "value": "outer", "append": true}),
        },
    )
    .unwrap();
    mux.upsert_middleware(
        &fk,
        Middleware {
            id: "b".into(),
            kind: "request-header".into(),
            priority: 1,
            spec: json!({"name": "x-mw", "value": "inner", "append": true}),
        },
    )
    .unwrap();

    let addr = mux.listener_addr(&ListenerKey::new("l1")).unwrap();
    let response = http_get_with_host(addr, "/", "api.example.com").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);
    assert!(response.contains("x-chain: inner,outer"), "got: {}", response);

    // Dropping the inner middleware leaves only the outer tag.
    mux.delete_middleware(&routegate::graph::MiddlewareKey::new(fk, "b")).unwrap();
    let response = http_get_with_host(addr, "/", "api.example.com").await.unwrap();
    assert!(response.contains("x-chain: outer"), "got: {}", response);
    assert!(!response.contains("inner"), "got: {}", response);

    mux.stop(true).await;
}

#[tokio::test]
async fn test_backend_delete_guarded_end_to_end() {
    let upstream = spawn_upstream("ok").await;
    let mux = started_mux().await;

    mux.upsert_backend(backend("b1")).unwrap();
    mux.upsert_server(&BackendKey::new("b1"), server("s1", upstream)).unwrap();
    mux.upsert_frontend(frontend_for_host("f1", "api.example.com", "b1")).unwrap();

    let err = mux.delete_backend(&BackendKey::new("b1")).unwrap_err();
    assert_eq!(err.kind(), routegate::ErrorKind::Conflict);

    // The route keeps serving through the vetoed backend.
    let addr = mux.listener_addr(&ListenerKey::new("l1")).unwrap();
    let response = http_get_with_host(addr, "/", "api.example.com").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);

    mux.delete_frontend(&FrontendKey::new("f1")).unwrap();
    mux.delete_backend(&BackendKey::new("b1")).unwrap();

    let response = http_get_with_host(addr, "/", "api.example.com").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 404"), "got: {}", response);

    mux.stop(true).await;
}

#[tokio::test]
async fn test_frontend_route_change_replaces_old_route() {
    let upstream = spawn_upstream("ok").await;
    let mux = started_mux().await;

    mux.upsert_backend(backend("b1")).unwrap();
    mux.upsert_server(&BackendKey::new("b1"), server("s1", upstream)).unwrap();
    mux.upsert_frontend(frontend_for_host("f1", "old.example.com", "b1")).unwrap();

    let addr = mux.listener_addr(&ListenerKey::new("l1")).unwrap();
    let response = http_get_with_host(addr, "/", "old.example.com").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"));

    mux.upsert_frontend(frontend_for_host("f1", "new.example.com", "b1")).unwrap();

    let response = http_get_with_host(addr, "/", "old.example.com").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 404"), "old route must be gone");
    let response = http_get_with_host(addr, "/", "new.example.com").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"));

    mux.stop(true).await;
}

#[tokio::test]
async fn test_no_upstream_servers_is_503() {
    let mux = started_mux().await;
    mux.upsert_backend(backend("b1")).unwrap();
    mux.upsert_frontend(frontend_for_host("f1", "api.example.com", "b1")).unwrap();

    let addr = mux.listener_addr(&ListenerKey::new("l1")).unwrap();
    let response = http_get_with_host(addr, "/", "api.example.com").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 503"), "got: {}", response);
    assert!(response.contains("NO_SERVERS"), "got: {}", response);

    mux.stop(true).await;
}

#[tokio::test]
async fn test_listener_added_while_active_serves_immediately() {
    let upstream = spawn_upstream("ok").await;
    let mux = started_mux().await;

    mux.upsert_backend(backend("b1")).unwrap();
    mux.upsert_server(&BackendKey::new("b1"), server("s1", upstream)).unwrap();
    mux.upsert_frontend(frontend_for_host("f1", "api.example.com", "b1")).unwrap();

    // Listener addresses are compared byte-for-byte, so the second
    // listener needs a distinct loopback address.
    mux.upsert_listener(http_listener("l2", "127.0.0.2:0")).unwrap();
    let addr = mux.listener_addr(&ListenerKey::new("l2")).unwrap();
    assert!(wait_for_port(addr, Duration::from_secs(2)).await);

    let response = http_get_with_host(addr, "/", "api.example.com").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);

    mux.delete_listener(&ListenerKey::new("l2")).await.unwrap();
    assert!(
        tokio::net::TcpStream::connect(addr).await.is_err()
            || http_get_with_host(addr, "/", "api.example.com").await.is_err(),
        "deleted listener must stop accepting"
    );

    mux.stop(true).await;
}

#[tokio::test]
async fn test_failover_skips_dead_server() {
    let upstream = spawn_upstream("alive").await;
    let mux = started_mux().await;

    // A port that is bound and immediately released: connecting to it
    // is refused.
    let dead_addr = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap()
    };

    mux.upsert_backend(backend("b1")).unwrap();
    mux.upsert_server(&BackendKey::new("b1"), server("dead", dead_addr)).unwrap();
    mux.upsert_server(&BackendKey::new("b1"), server("live", upstream)).unwrap();

    let mut fe = frontend_for_host("f1", "api.example.com", "b1");
    fe.settings.failover = true;
    mux.upsert_frontend(fe).unwrap();

    let addr = mux.listener_addr(&ListenerKey::new("l1")).unwrap();
    // Every request lands on the live server, whichever the rotation
    // offers first.
    for _ in 0..4 {
        let response = http_get_with_host(addr, "/", "api.example.com").await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);
        assert!(response.ends_with("alive"), "got: {}", response);
    }

    mux.stop(true).await;
}

#[tokio::test]
async fn test_listener_scope_limits_frontends() {
    let upstream = spawn_upstream("ok").await;
    let mux = Arc::new(Mux::new(2, MemoryStapler::new(), Options::default()).unwrap());

    let mut scoped = http_listener("l1", "127.0.0.1:0");
    scoped.scope = Some(r#"Host("api.example.com")"#.into());
    mux.upsert_listener(scoped).unwrap();
    mux.start().unwrap();

    mux.upsert_backend(backend("b1")).unwrap();
    mux.upsert_server(&BackendKey::new("b1"), server("s1", upstream)).unwrap();
    mux.upsert_frontend(frontend_for_host("f1", "api.example.com", "b1")).unwrap();
    mux.upsert_frontend(frontend_for_host("f2", "other.example.com", "b1")).unwrap();

    let addr = mux.listener_addr(&ListenerKey::new("l1")).unwrap();
    let response = http_get_with_host(addr, "/", "api.example.com").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);

    // The second frontend exists in the router but is outside this
    // listener's scope.
    let response = http_get_with_host(addr, "/", "other.example.com").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 404"), "got: {}", response);

    mux.stop(true).await;
}
