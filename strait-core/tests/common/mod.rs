//! Shared fixtures for the black-box proxy tests.

#![allow(dead_code)]

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use strait_core::config::{DialConfig, ServerConfig, Upstream};
use strait_core::inbound::http::HttpProxyServer;
use strait_core::inbound::socks5::Socks5Server;
use strait_core::outbound::build_dialer;

/// TCP echo server on an ephemeral port.
pub async fn spawn_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    match sock.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if sock.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// HTTP origin with `/hello` and `/echo`; responses carry `x-seen-xff` so
/// tests can assert the proxy did not forward `X-Forwarded-For`.
pub async fn spawn_http_origin() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((sock, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let service = service_fn(|req: Request<Incoming>| async move {
                    let seen_xff = req.headers().contains_key("x-forwarded-for");
                    let (status, body) = match req.uri().path() {
                        "/hello" => (200u16, Bytes::from_static(b"Hello, World!")),
                        "/echo" => {
                            let body = req.into_body().collect().await.unwrap().to_bytes();
                            (200, body)
                        }
                        _ => (404, Bytes::from_static(b"not found")),
                    };
                    Ok::<_, Infallible>(
                        Response::builder()
                            .status(status)
                            .header("x-seen-xff", if seen_xff { "yes" } else { "no" })
                            .body(Full::new(body))
                            .unwrap(),
                    )
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(sock), service)
                    .await;
            });
        }
    });
    addr
}

pub struct ProxyFixture {
    pub addr: SocketAddr,
    pub cancel: CancellationToken,
}

impl Drop for ProxyFixture {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn server_config(upstream: &str) -> ServerConfig {
    let upstream = Upstream::parse(upstream).unwrap();
    let dialer = build_dialer(&DialConfig::default(), &upstream).unwrap();
    ServerConfig::new(dialer)
}

/// Start a SOCKS5 listener on an ephemeral port with the given upstream URL.
pub async fn start_socks5(upstream: &str) -> ProxyFixture {
    let cfg = server_config(upstream);
    let listener = strait_core::inbound::listen("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let cancel = CancellationToken::new();
    let server = Socks5Server::new(cfg);
    let serve_cancel = cancel.clone();
    tokio::spawn(async move { server.serve(listener, serve_cancel).await });
    ProxyFixture { addr, cancel }
}

/// Start an HTTP proxy listener on an ephemeral port with the given upstream.
pub async fn start_http(upstream: &str) -> ProxyFixture {
    let cfg = server_config(upstream);
    start_http_with_config(cfg).await
}

pub async fn start_http_with_config(cfg: ServerConfig) -> ProxyFixture {
    let listener = strait_core::inbound::listen("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let cancel = CancellationToken::new();
    let server = HttpProxyServer::new(cfg, cancel.clone());
    let serve_cancel = cancel.clone();
    tokio::spawn(async move { server.serve(listener, serve_cancel).await });
    ProxyFixture { addr, cancel }
}

/// Issue a CONNECT to `proxy` for `target` and assert the literal reply
/// line. Returns the socket in tunnel mode.
pub async fn http_connect(proxy: SocketAddr, target: &str) -> TcpStream {
    let mut sock = TcpStream::connect(proxy).await.unwrap();
    sock.write_all(format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n").as_bytes())
        .await
        .unwrap();

    let reply = read_until_blank_line(&mut sock).await;
    assert!(
        reply.starts_with("HTTP/1.1 200 Connection Established"),
        "unexpected CONNECT reply: {reply:?}"
    );
    sock
}

/// Read an HTTP head (until CRLFCRLF) as text.
pub async fn read_until_blank_line(sock: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = sock.read(&mut byte).await.unwrap();
        if n == 0 {
            break;
        }
        head.push(byte[0]);
        assert!(head.len() < 64 * 1024, "head too large");
    }
    String::from_utf8_lossy(&head).into_owned()
}

/// Read until EOF as text.
pub async fn read_to_end_string(sock: &mut TcpStream) -> String {
    let mut out = Vec::new();
    sock.read_to_end(&mut out).await.unwrap();
    String::from_utf8_lossy(&out).into_owned()
}
