//! Shared helpers for the integration suite: an in-process upstream and
//! raw-socket HTTP clients.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use routegate::graph::{
    Address, Backend, Frontend, FrontendSettings, Listener, Protocol, Server,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Spawn a minimal HTTP/1.1 upstream that answers 200 with `tag` as the
/// body and echoes any `x-mw` request headers back as one `x-chain`
/// response header.
pub async fn spawn_upstream(tag: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 16 * 1024];
                let mut read = 0;
                loop {
                    let Ok(n) = stream.read(&mut buf[read..]).await else {
                        return;
                    };
                    if n == 0 {
                        return;
                    }
                    read += n;
                    if buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                    if read == buf.len() {
                        return;
                    }
                }

                let head = String::from_utf8_lossy(&buf[..read]).to_string();
                let chain: Vec<String> = head
                    .lines()
                    .filter_map(|line| {
                        let lower = line.to_ascii_lowercase();
                        lower
                            .strip_prefix("x-mw:")
                            .map(|value| value.trim().to_string())
                    })
                    .collect();

                let mut response = String::from("HTTP/1.1 200 OK\r\n");
                if !chain.is_empty() {
                    response.push_str(&format!("x-chain: {}\r\n", chain.join(",")));
                }
                response.push_str(&format!(
                    "content-length: {}\r\nconnection: close\r\n\r\n{}",
                    tag.len(),
                    tag
                ));
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    });

    addr
}

/// Send a raw HTTP/1.1 GET with an explicit Host header and return the
/// whole response as text.
pub async fn http_get_with_host(addr: SocketAddr, path: &str, host: &str) -> std::io::Result<String> {
    let mut stream = TcpStream::connect(addr).await?;

    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, host
    );
    stream.write_all(request.as_bytes()).await?;

    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    Ok(response)
}

/// Wait until a port accepts connections.
pub async fn wait_for_port(addr: SocketAddr, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect(addr).await.is_ok() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

pub fn http_listener(id: &str, address: &str) -> Listener {
    Listener {
        id: id.into(),
        protocol: Protocol::Http,
        address: Address::new("tcp", address),
        tls: None,
        scope: None,
    }
}

pub fn https_listener(id: &str, address: &str) -> Listener {
    Listener {
        id: id.into(),
        protocol: Protocol::Https,
        address: Address::new("tcp", address),
        tls: None,
        scope: None,
    }
}

pub fn backend(id: &str) -> Backend {
    Backend::new(id)
}

pub fn server(id: &str, addr: SocketAddr) -> Server {
    Server::new(id, format!("http://{}", addr))
}

pub fn frontend_for_host(id: &str, host: &str, backend_id: &str) -> Frontend {
    Frontend {
        id: id.into(),
        route: format!(r#"Host("{}")"#, host),
        backend_id: backend_id.into(),
        settings: FrontendSettings::default(),
    }
}
