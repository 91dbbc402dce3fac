//! HTTP proxy inbound listener.
//!
//! The first request on every connection is sniffed from the raw socket.
//! CONNECT is answered there, with the literal `200 Connection Established`
//! reply written before the socket turns into a blind tunnel. Anything else
//! is replayed into a hyper http1 connection that forward-proxies requests
//! through a pooled outbound client wired into the configured dialer.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use http::uri::{Authority, PathAndQuery, Scheme};
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::client::legacy::Client as LegacyClient;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

use crate::address::{Address, Destination};
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::inbound::accept_loop;
use crate::outbound::http::shared_tls_config;
use crate::outbound::{BoxedStream, Dialer, HttpProxyInfo, Network};
use crate::relay::bridge;
use crate::stream::{read_head, PrefixedStream};

type ProxyBody = BoxBody<Bytes, std::io::Error>;

pub struct HttpProxyServer {
    cfg: ServerConfig,
    proxy_info: Option<HttpProxyInfo>,
    client: LegacyClient<OutboundConnector, Incoming>,
}

impl HttpProxyServer {
    /// `cancel` scopes the lifetime of pooled outbound connections; it is
    /// normally the process shutdown token.
    pub fn new(cfg: ServerConfig, cancel: CancellationToken) -> Arc<Self> {
        let proxy_info = cfg.dialer.http_proxy();

        let connector = OutboundConnector {
            dialer: Arc::clone(&cfg.dialer),
            proxy: proxy_info.clone(),
            tls: TlsConnector::from(shared_tls_config()),
            negotiation_timeout: cfg.negotiation_timeout,
            cancel,
        };

        let client = LegacyClient::builder(TokioExecutor::new())
            .pool_idle_timeout(cfg.http_idle_timeout)
            .pool_max_idle_per_host(cfg.http_max_idle_conns)
            .pool_timer(TokioTimer::new())
            .http1_preserve_header_case(true)
            .http1_title_case_headers(true)
            .build(connector);

        Arc::new(Self {
            cfg,
            proxy_info,
            client,
        })
    }

    pub async fn serve(self: &Arc<Self>, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        let this = Arc::clone(self);
        accept_loop(
            "http",
            listener,
            self.cfg.keepalive,
            cancel,
            move |stream, peer, cancel| {
                let this = Arc::clone(&this);
                async move { this.handle(stream, peer, cancel).await }
            },
        )
        .await
    }

    async fn handle(
        self: Arc<Self>,
        mut stream: TcpStream,
        peer: SocketAddr,
        cancel: CancellationToken,
    ) -> Result<()> {
        let sniffed = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Canceled),
            result = tokio::time::timeout(self.cfg.negotiation_timeout, read_head(&mut stream)) => result,
        };
        let (head, leftover) = match sniffed {
            Err(_) => return Err(Error::timeout(format!("reading request from {}", peer))),
            Ok(result) => result?,
        };

        let (method, target) = parse_request_line(&head).ok_or_else(|| {
            Error::protocol_with_info(format!("malformed request line from {}", peer), "http")
        })?;

        if method.eq_ignore_ascii_case("CONNECT") {
            self.handle_connect(stream, leftover, &target, cancel).await
        } else {
            // Replay the sniffed bytes into a full HTTP/1.1 connection;
            // keep-alive across requests is preserved.
            let mut replay = Vec::with_capacity(head.len() + leftover.len());
            replay.extend_from_slice(&head);
            replay.extend_from_slice(&leftover);
            let replay = PrefixedStream::new(Bytes::from(replay), stream);
            self.serve_http(replay, cancel).await
        }
    }

    /// The CONNECT fast path, on the raw socket exactly as hijacked servers
    /// do it: dial, then a literal reply line, then a blind tunnel.
    async fn handle_connect(
        &self,
        stream: TcpStream,
        leftover: Bytes,
        target: &str,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut client = PrefixedStream::new(leftover, stream);

        let dest = match Destination::parse_with_default_port(target, 443) {
            Ok(dest) => dest,
            Err(e) => {
                write_hijacked_error(&mut client, &e).await?;
                return Err(e);
            }
        };

        tracing::debug!("CONNECT {}", dest);

        let outbound = match self.cfg.dialer.connect(&cancel, Network::Tcp, &dest).await {
            Ok(out) => out,
            Err(e) => {
                write_hijacked_error(&mut client, &e).await?;
                return Err(e);
            }
        };

        client
            .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await?;

        bridge(client, outbound.stream, &cancel).await
    }

    async fn serve_http(
        self: &Arc<Self>,
        stream: PrefixedStream<TcpStream>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let this = Arc::clone(self);
        let svc_cancel = cancel.clone();
        let service = service_fn(move |req: Request<Incoming>| {
            let this = Arc::clone(&this);
            let cancel = svc_cancel.clone();
            async move { Ok::<_, Infallible>(this.route(req, cancel).await) }
        });

        let mut builder = http1::Builder::new();
        builder
            .preserve_header_case(true)
            .title_case_headers(true)
            .timer(TokioTimer::new())
            .header_read_timeout(self.cfg.negotiation_timeout);

        let conn = builder
            .serve_connection(TokioIo::new(stream), service)
            .with_upgrades();

        tokio::select! {
            _ = cancel.cancelled() => Ok(()),
            result = conn => result.map_err(|e| Error::network_with_source("http serve", e)),
        }
    }

    async fn route(
        self: Arc<Self>,
        req: Request<Incoming>,
        cancel: CancellationToken,
    ) -> Response<ProxyBody> {
        if req.method() == Method::CONNECT {
            // CONNECT mid keep-alive connection: tunnel via protocol upgrade.
            return self.connect_upgrade(req, cancel);
        }

        match self.forward(req).await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!("proxy round trip failed: {}", e);
                error_response(StatusCode::BAD_GATEWAY, &e)
            }
        }
    }

    /// Forward-proxy one request through the pooled outbound client.
    async fn forward(&self, req: Request<Incoming>) -> Result<Response<ProxyBody>> {
        let (mut parts, body) = req.into_parts();
        let mut uri = parts.uri.into_parts();

        // Scheme: explicit override header wins, then the request URI,
        // then plain http.
        let scheme = match parts.headers.remove("x-proxy-scheme") {
            Some(v) => {
                let s = v
                    .to_str()
                    .map_err(|_| Error::protocol_with_info("bad X-Proxy-Scheme value", "http"))?;
                Scheme::try_from(s)
                    .map_err(|_| Error::protocol_with_info("bad X-Proxy-Scheme value", "http"))?
            }
            None => uri.scheme.take().unwrap_or(Scheme::HTTP),
        };

        let authority = match uri.authority.take() {
            Some(a) => a,
            None => parts
                .headers
                .get(header::HOST)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<Authority>().ok())
                .ok_or_else(|| Error::protocol_with_info("proxy request missing host", "http"))?,
        };

        if uri.path_and_query.is_none() {
            uri.path_and_query = Some(PathAndQuery::from_static("/"));
        }
        let is_tls = scheme == Scheme::HTTPS;
        uri.scheme = Some(scheme);
        uri.authority = Some(authority.clone());
        parts.uri = Uri::from_parts(uri)
            .map_err(|e| Error::protocol_with_info(format!("bad request URI: {}", e), "http"))?;

        // The request Host always matches the URI host.
        parts.headers.insert(
            header::HOST,
            HeaderValue::from_str(authority.as_str())
                .map_err(|_| Error::protocol_with_info("bad authority", "http"))?,
        );

        // Disclose nothing about the inbound side.
        parts.headers.remove("x-forwarded-for");
        strip_hop_by_hop(&mut parts.headers);

        // Plain-http requests routed through an upstream HTTP proxy are sent
        // in absolute form; the proxy wants its credentials per request.
        if !is_tls {
            if let Some(info) = &self.proxy_info {
                if let Some(auth) = &info.auth_header {
                    parts.headers.insert(
                        header::PROXY_AUTHORIZATION,
                        HeaderValue::from_str(auth)
                            .map_err(|_| Error::config("bad proxy credentials"))?,
                    );
                }
            }
        }

        let response = self
            .client
            .request(Request::from_parts(parts, body))
            .await
            .map_err(|e| Error::network_with_source("upstream round trip", e))?;

        let (mut rparts, rbody) = response.into_parts();
        strip_hop_by_hop(&mut rparts.headers);
        Ok(Response::from_parts(
            rparts,
            rbody.map_err(std::io::Error::other).boxed(),
        ))
    }

    fn connect_upgrade(
        self: &Arc<Self>,
        req: Request<Incoming>,
        cancel: CancellationToken,
    ) -> Response<ProxyBody> {
        let target = req
            .uri()
            .authority()
            .map(|a| a.to_string())
            .or_else(|| {
                req.headers()
                    .get(header::HOST)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            });

        let dest = match target
            .as_deref()
            .map(|t| Destination::parse_with_default_port(t, 443))
        {
            Some(Ok(dest)) => dest,
            _ => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    &Error::protocol_with_info("invalid CONNECT target", "http"),
                )
            }
        };

        let this = Arc::clone(self);
        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    let io = TokioIo::new(upgraded);
                    match this.cfg.dialer.connect(&cancel, Network::Tcp, &dest).await {
                        Ok(out) => {
                            if let Err(e) = bridge(io, out.stream, &cancel).await {
                                tracing::debug!("CONNECT tunnel to {}: {}", dest, e);
                            }
                        }
                        Err(e) => tracing::debug!("CONNECT dial {} failed: {}", dest, e),
                    }
                }
                Err(e) => tracing::debug!("CONNECT upgrade failed: {}", e),
            }
        });

        Response::builder()
            .status(StatusCode::OK)
            .body(
                Empty::<Bytes>::new()
                    .map_err(|_| std::io::Error::other("empty body"))
                    .boxed(),
            )
            .unwrap()
    }
}

/// `HTTP/1.1 <status>` error written on the raw (hijacked) socket.
async fn write_hijacked_error<S>(stream: &mut S, err: &Error) -> Result<()>
where
    S: tokio::io::AsyncWrite + Unpin,
{
    let body = format!(
        "HTTP/1.1 502 Bad Gateway\r\nContent-Type: text/plain; charset=utf-8\r\nConnection: close\r\n\r\n{}\r\n",
        err
    );
    stream.write_all(body.as_bytes()).await?;
    stream.shutdown().await.ok();
    Ok(())
}

fn error_response(status: StatusCode, err: &Error) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(
            Full::new(Bytes::from(format!("{}\n", err)))
                .map_err(|_| std::io::Error::other("body"))
                .boxed(),
        )
        .unwrap()
}

/// Method and target of the first request line, if parseable.
fn parse_request_line(head: &[u8]) -> Option<(String, String)> {
    let line_end = head.windows(2).position(|w| w == b"\r\n")?;
    let line = std::str::from_utf8(&head[..line_end]).ok()?;
    let mut parts = line.split_whitespace();
    let method = parts.next()?;
    let target = parts.next()?;
    Some((method.to_string(), target.to_string()))
}

/// Drop hop-by-hop headers, including any named by `Connection`.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|t| HeaderName::from_bytes(t.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }

    headers.remove(header::CONNECTION);
    headers.remove(header::TE);
    headers.remove(header::TRAILER);
    headers.remove(header::UPGRADE);
    headers.remove(header::PROXY_AUTHENTICATE);
    headers.remove(header::PROXY_AUTHORIZATION);
    headers.remove(HeaderName::from_static("proxy-connection"));
    headers.remove(HeaderName::from_static("keep-alive"));
}

/// Connector for the outbound HTTP client: every connection establishment
/// goes through the configured dialer, with three shapes:
///
/// - `https` target: tunnel to the target via the dialer (CONNECT through an
///   upstream proxy when one is configured), then TLS to the target.
/// - `http` target with an upstream HTTP proxy: connect to the proxy itself
///   over the dialer's direct path and mark the connection proxied, so the
///   client sends absolute-form requests and keep-alive to the proxy is
///   preserved without a per-request CONNECT.
/// - `http` target otherwise: plain dialer connection to the target.
#[derive(Clone)]
struct OutboundConnector {
    dialer: Arc<dyn Dialer>,
    proxy: Option<HttpProxyInfo>,
    tls: TlsConnector,
    negotiation_timeout: Duration,
    cancel: CancellationToken,
}

impl OutboundConnector {
    async fn connect_uri(self, uri: Uri) -> Result<ConnStream> {
        let scheme = uri.scheme_str().unwrap_or("http");
        let is_tls = scheme.eq_ignore_ascii_case("https");
        let host = uri
            .host()
            .ok_or_else(|| Error::protocol_with_info("request URI missing host", "http"))?
            .trim_matches(|c| c == '[' || c == ']')
            .to_string();
        let port = uri.port_u16().unwrap_or(if is_tls { 443 } else { 80 });
        let dest = Destination::new(host_address(&host), port);

        if is_tls {
            let out = self.dialer.connect(&self.cancel, Network::Tcp, &dest).await?;
            let server_name = rustls::pki_types::ServerName::try_from(host)
                .map_err(|e| Error::tls_with_source("invalid server name", e))?;
            let tls = tokio::time::timeout(
                self.negotiation_timeout,
                self.tls.connect(server_name, out.stream),
            )
            .await
            .map_err(|_| Error::timeout(format!("TLS handshake with {}", dest)))?
            .map_err(|e| Error::tls_with_source(format!("TLS handshake with {}", dest), e))?;
            return Ok(ConnStream::new(Box::new(tls), false));
        }

        if let Some(info) = &self.proxy {
            let proxy_dest: Destination = info.endpoint.authority().parse()?;
            let tcp = info
                .direct
                .dial_tcp(&self.cancel, Network::Tcp, &proxy_dest)
                .await?;
            let stream: BoxedStream = if info.tls {
                let server_name = rustls::pki_types::ServerName::try_from(info.endpoint.host.clone())
                    .map_err(|e| Error::tls_with_source("invalid proxy server name", e))?;
                let tls = tokio::time::timeout(
                    self.negotiation_timeout,
                    self.tls.connect(server_name, tcp),
                )
                .await
                .map_err(|_| Error::timeout("proxy TLS handshake".to_string()))?
                .map_err(|e| Error::tls_with_source("proxy TLS handshake", e))?;
                Box::new(tls)
            } else {
                Box::new(tcp)
            };
            return Ok(ConnStream::new(stream, true));
        }

        let out = self.dialer.connect(&self.cancel, Network::Tcp, &dest).await?;
        Ok(ConnStream::new(out.stream, false))
    }
}

fn host_address(host: &str) -> Address {
    if let Ok(ip) = host.parse::<std::net::Ipv4Addr>() {
        Address::Ipv4(ip)
    } else if let Ok(ip) = host.parse::<std::net::Ipv6Addr>() {
        Address::Ipv6(ip)
    } else {
        Address::Domain(host.to_string())
    }
}

impl tower_service::Service<Uri> for OutboundConnector {
    type Response = ConnStream;
    type Error = Box<dyn std::error::Error + Send + Sync>;
    type Future = BoxFuture<'static, std::result::Result<ConnStream, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let this = self.clone();
        async move {
            this.connect_uri(uri)
                .await
                .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)
        }
        .boxed()
    }
}

/// A pooled outbound connection, tagged with whether it terminates at an
/// upstream proxy rather than the origin.
struct ConnStream {
    io: TokioIo<BoxedStream>,
    proxied: bool,
}

impl ConnStream {
    fn new(stream: BoxedStream, proxied: bool) -> Self {
        Self {
            io: TokioIo::new(stream),
            proxied,
        }
    }
}

impl Connection for ConnStream {
    fn connected(&self) -> Connected {
        if self.proxied {
            Connected::new().proxy(true)
        } else {
            Connected::new()
        }
    }
}

impl hyper::rt::Read for ConnStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: hyper::rt::ReadBufCursor<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl hyper::rt::Write for ConnStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}
