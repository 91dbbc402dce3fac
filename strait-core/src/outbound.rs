//! Outbound dialers: one `connect` contract, four implementations.

pub mod direct;
pub mod http;
pub mod socks5;
pub mod ssh;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::address::Destination;
use crate::config::{DialConfig, ProxyEndpoint, Upstream};
use crate::error::Result;

/// Object-safe byte stream as produced by listeners and dialers.
pub trait ProxyStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ProxyStream for T {}

pub type BoxedStream = Box<dyn ProxyStream>;

/// Network selector for a dial: `tcp` (either family), `tcp4`, or `tcp6`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Tcp4,
    Tcp6,
}

impl Network {
    pub fn accepts(&self, ip: &IpAddr) -> bool {
        match self {
            Network::Tcp => true,
            Network::Tcp4 => ip.is_ipv4(),
            Network::Tcp6 => ip.is_ipv6(),
        }
    }
}

/// An established upstream connection.
pub struct Outbound {
    pub stream: BoxedStream,
    /// Local address of the upstream socket, when the dialer can name a
    /// meaningful one. SOCKS5 success replies fall back to the zero address
    /// otherwise.
    pub local_addr: Option<SocketAddr>,
}

impl std::fmt::Debug for Outbound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbound")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

impl Outbound {
    pub fn new<S: ProxyStream + 'static>(stream: S, local_addr: Option<SocketAddr>) -> Self {
        Self {
            stream: Box::new(stream),
            local_addr,
        }
    }
}

/// Details the HTTP handler needs to route plain-http requests through an
/// upstream HTTP proxy without a per-request CONNECT.
#[derive(Clone)]
pub struct HttpProxyInfo {
    pub endpoint: ProxyEndpoint,
    /// Whether the proxy itself is reached over TLS.
    pub tls: bool,
    /// `Basic <credentials>` value for Proxy-Authorization, if configured.
    pub auth_header: Option<String>,
    /// Dialer used to reach the proxy itself.
    pub direct: Arc<direct::DirectDialer>,
}

/// Outbound connection factory. One instance is shared by every listener.
#[async_trait::async_trait]
pub trait Dialer: Send + Sync {
    /// Establish a connection to `dest`, ready to carry tunnel bytes.
    /// All handshakes with intermediate proxies happen before this returns.
    async fn connect(
        &self,
        cancel: &CancellationToken,
        network: Network,
        dest: &Destination,
    ) -> Result<Outbound>;

    /// Capability probe: present when this dialer forwards through an
    /// upstream HTTP proxy, letting the HTTP handler reuse the proxy
    /// connection for plain requests.
    fn http_proxy(&self) -> Option<HttpProxyInfo> {
        None
    }
}

/// Construct the dialer for a parsed upstream URL.
pub fn build_dialer(cfg: &DialConfig, upstream: &Upstream) -> Result<Arc<dyn Dialer>> {
    Ok(match upstream {
        Upstream::Direct => Arc::new(direct::DirectDialer::new(cfg.clone())),
        Upstream::Http(ep) => Arc::new(http::HttpProxyDialer::new(cfg.clone(), ep.clone(), false)?),
        Upstream::Https(ep) => Arc::new(http::HttpProxyDialer::new(cfg.clone(), ep.clone(), true)?),
        Upstream::Socks5(ep) => Arc::new(socks5::Socks5ProxyDialer::new(cfg.clone(), ep.clone())),
        Upstream::Ssh(ep) => Arc::new(ssh::SshDialer::new(cfg.clone(), ep.clone())?),
    })
}
