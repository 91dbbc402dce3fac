//! Direct dialer: resolve and connect, no intermediaries.

use std::net::{IpAddr, SocketAddr};

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::address::{Address, Destination};
use crate::config::DialConfig;
use crate::error::{Error, Result};
use crate::outbound::{Dialer, Network, Outbound};

pub struct DirectDialer {
    cfg: DialConfig,
}

impl DirectDialer {
    pub fn new(cfg: DialConfig) -> Self {
        Self { cfg }
    }

    /// Resolve `dest` and connect, bounded by the configured dial timeout.
    /// Returns the raw TCP stream; used directly by the proxy dialers to
    /// reach their upstream before layering handshakes on top.
    pub async fn dial_tcp(
        &self,
        cancel: &CancellationToken,
        network: Network,
        dest: &Destination,
    ) -> Result<TcpStream> {
        let attempt = tokio::time::timeout(self.cfg.dial_timeout, self.resolve_and_connect(network, dest));

        let stream = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Canceled),
            result = attempt => result.map_err(|_| Error::timeout(format!("dial {}", dest)))??,
        };

        stream.set_nodelay(true).ok();
        if let Err(e) = self.cfg.keepalive.apply(&stream) {
            tracing::debug!("failed to apply keepalive to {}: {}", dest, e);
        }
        Ok(stream)
    }

    async fn resolve_and_connect(&self, network: Network, dest: &Destination) -> Result<TcpStream> {
        let addrs = self.resolve(network, dest).await?;

        let mut last_err: Option<std::io::Error> = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => last_err = Some(e),
            }
        }

        match last_err {
            Some(e) => Err(Error::network_with_source(
                format!("dial {} failed", dest),
                e,
            )),
            None => Err(Error::network(format!(
                "dial {}: no suitable addresses",
                dest
            ))),
        }
    }

    async fn resolve(&self, network: Network, dest: &Destination) -> Result<Vec<SocketAddr>> {
        let candidates: Vec<SocketAddr> = match &dest.addr {
            Address::Ipv4(ip) => vec![SocketAddr::new(IpAddr::V4(*ip), dest.port)],
            Address::Ipv6(ip) => vec![SocketAddr::new(IpAddr::V6(*ip), dest.port)],
            Address::Domain(name) => {
                // Treat the name as fully qualified so the resolver search
                // path is bypassed.
                let lookup = if name.ends_with('.') {
                    format!("{}:{}", name, dest.port)
                } else {
                    format!("{}.:{}", name, dest.port)
                };
                tokio::net::lookup_host(lookup)
                    .await
                    .map_err(|e| Error::network_with_source(format!("resolve {}", dest), e))?
                    .collect()
            }
        };

        let filtered: Vec<SocketAddr> = candidates
            .into_iter()
            .filter(|a| network.accepts(&a.ip()))
            .collect();

        if filtered.is_empty() {
            return Err(Error::network(format!(
                "dial {}: no addresses for requested family",
                dest
            )));
        }
        Ok(filtered)
    }
}

#[async_trait::async_trait]
impl Dialer for DirectDialer {
    async fn connect(
        &self,
        cancel: &CancellationToken,
        network: Network,
        dest: &Destination,
    ) -> Result<Outbound> {
        let stream = self.dial_tcp(cancel, network, dest).await?;
        let local_addr = stream.local_addr().ok();
        Ok(Outbound::new(stream, local_addr))
    }
}
