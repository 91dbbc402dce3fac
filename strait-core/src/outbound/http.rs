//! Outbound dialer that tunnels through an HTTP or HTTPS proxy via CONNECT.

use std::sync::Arc;

use base64::Engine;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

use crate::address::Destination;
use crate::config::{DialConfig, ProxyEndpoint};
use crate::error::{Error, Result};
use crate::outbound::direct::DirectDialer;
use crate::outbound::{Dialer, HttpProxyInfo, Network, Outbound};
use crate::stream::PrefixedStream;

pub struct HttpProxyDialer {
    cfg: DialConfig,
    endpoint: ProxyEndpoint,
    tls: bool,
    auth: Option<String>,
    direct: Arc<DirectDialer>,
    connector: TlsConnector,
}

impl HttpProxyDialer {
    pub fn new(cfg: DialConfig, endpoint: ProxyEndpoint, tls: bool) -> Result<Self> {
        if endpoint.host.is_empty() {
            return Err(Error::config("http proxy dialer: missing proxy host"));
        }

        let auth = if endpoint.username.is_empty() {
            None
        } else {
            let creds = format!("{}:{}", endpoint.username, endpoint.password);
            Some(format!(
                "Basic {}",
                base64::engine::general_purpose::STANDARD.encode(creds)
            ))
        };

        let direct = Arc::new(DirectDialer::new(cfg.clone()));
        Ok(Self {
            connector: TlsConnector::from(shared_tls_config()),
            cfg,
            endpoint,
            tls,
            auth,
            direct,
        })
    }

    /// Replace the TLS configuration used to reach the proxy, e.g. to trust
    /// a private CA.
    pub fn with_tls_config(mut self, config: Arc<rustls::ClientConfig>) -> Self {
        self.connector = TlsConnector::from(config);
        self
    }

    /// Establish the CONNECT tunnel over an already-connected proxy stream.
    async fn connect_over<S>(&self, mut stream: S, dest: &Destination) -> Result<PrefixedStream<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut request = format!("CONNECT {dest} HTTP/1.1\r\nHost: {dest}\r\n");
        if let Some(auth) = &self.auth {
            request.push_str(&format!("Proxy-Authorization: {}\r\n", auth));
        }
        request.push_str("\r\n");
        stream.write_all(request.as_bytes()).await?;

        let (head, leftover) = read_response_head(&mut stream).await?;
        let status = parse_status(&head)?;
        if !(200..300).contains(&status) {
            return Err(Error::network(format!(
                "proxy refused CONNECT to {}: status {}",
                dest, status
            )));
        }

        Ok(PrefixedStream::new(leftover, stream))
    }
}

#[async_trait::async_trait]
impl Dialer for HttpProxyDialer {
    async fn connect(
        &self,
        cancel: &CancellationToken,
        network: Network,
        dest: &Destination,
    ) -> Result<Outbound> {
        let proxy_dest: Destination = self.endpoint.authority().parse()?;
        let tcp = self.direct.dial_tcp(cancel, network, &proxy_dest).await?;
        let local_addr = tcp.local_addr().ok();

        // TLS (for https proxies) and the CONNECT exchange are both bounded
        // by the negotiation timeout; the caller's cancellation drops the
        // socket to unblock a stuck handshake.
        let negotiation = async {
            if self.tls {
                let server_name = rustls::pki_types::ServerName::try_from(
                    self.endpoint.host.clone(),
                )
                .map_err(|e| Error::tls_with_source("invalid proxy server name", e))?;
                let tls = self
                    .connector
                    .connect(server_name, tcp)
                    .await
                    .map_err(|e| Error::tls_with_source("proxy TLS handshake failed", e))?;
                let stream = self.connect_over(tls, dest).await?;
                Ok(Outbound::new(stream, local_addr))
            } else {
                let stream = self.connect_over(tcp, dest).await?;
                Ok(Outbound::new(stream, local_addr))
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Canceled),
            result = tokio::time::timeout(self.cfg.negotiation_timeout, negotiation) => {
                result.map_err(|_| Error::timeout(format!("CONNECT negotiation with {}", self.endpoint.authority())))?
            }
        }
    }

    fn http_proxy(&self) -> Option<HttpProxyInfo> {
        Some(HttpProxyInfo {
            endpoint: self.endpoint.clone(),
            tls: self.tls,
            auth_header: self.auth.clone(),
            direct: Arc::clone(&self.direct),
        })
    }
}

/// Shared outbound TLS configuration: webpki roots, TLS 1.2 minimum, and the
/// built-in session resumption cache shared across handshakes.
pub fn shared_tls_config() -> Arc<rustls::ClientConfig> {
    static CONFIG: std::sync::OnceLock<Arc<rustls::ClientConfig>> = std::sync::OnceLock::new();
    CONFIG
        .get_or_init(|| {
            let roots = rustls::RootCertStore {
                roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
            };
            Arc::new(
                rustls::ClientConfig::builder()
                    .with_root_certificates(roots)
                    .with_no_client_auth(),
            )
        })
        .clone()
}

/// Read one HTTP response head; surplus bytes past the blank line belong to
/// the tunnel.
pub async fn read_response_head<S>(stream: &mut S) -> Result<(Vec<u8>, Bytes)>
where
    S: AsyncRead + Unpin,
{
    crate::stream::read_head(stream)
        .await
        .map_err(|e| Error::protocol_with_info(format!("reading response head: {}", e), "http"))
}

/// Parse the status code out of an HTTP response head.
pub fn parse_status(head: &[u8]) -> Result<u16> {
    let line = head
        .split(|&b| b == b'\r')
        .next()
        .unwrap_or_default();
    let line = std::str::from_utf8(line)
        .map_err(|_| Error::protocol_with_info("response line is not UTF-8", "http"))?;

    let mut parts = line.split_whitespace();
    let version = parts
        .next()
        .ok_or_else(|| Error::protocol_with_info("empty response line", "http"))?;
    if !version.starts_with("HTTP/") {
        return Err(Error::protocol_with_info(
            format!("not an HTTP response: {:?}", line),
            "http",
        ));
    }
    parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::protocol_with_info(format!("bad status line: {:?}", line), "http"))
}
