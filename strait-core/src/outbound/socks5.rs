//! Outbound dialer that forwards through an upstream SOCKS5 proxy.

use tokio_util::sync::CancellationToken;

use crate::address::Destination;
use crate::config::{DialConfig, ProxyEndpoint};
use crate::error::{Error, Result};
use crate::outbound::direct::DirectDialer;
use crate::outbound::{Dialer, Network, Outbound};
use crate::socks5;

pub struct Socks5ProxyDialer {
    cfg: DialConfig,
    endpoint: ProxyEndpoint,
    auth: socks5::Auth,
    direct: DirectDialer,
}

impl Socks5ProxyDialer {
    pub fn new(cfg: DialConfig, endpoint: ProxyEndpoint) -> Self {
        let auth = socks5::Auth {
            username: endpoint.username.clone(),
            password: endpoint.password.clone(),
        };
        Self {
            direct: DirectDialer::new(cfg.clone()),
            cfg,
            endpoint,
            auth,
        }
    }
}

#[async_trait::async_trait]
impl Dialer for Socks5ProxyDialer {
    async fn connect(
        &self,
        cancel: &CancellationToken,
        network: Network,
        dest: &Destination,
    ) -> Result<Outbound> {
        let proxy_dest: Destination = self.endpoint.authority().parse()?;
        let mut stream = self.direct.dial_tcp(cancel, network, &proxy_dest).await?;
        let local_addr = stream.local_addr().ok();

        // If the caller gives up mid-negotiation the select drops the
        // stream, which closes the proxy connection and unblocks the
        // handshake reads.
        let negotiation = socks5::client_dial(&mut stream, &self.auth, dest);
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Canceled),
            result = tokio::time::timeout(self.cfg.negotiation_timeout, negotiation) => {
                result
                    .map_err(|_| Error::timeout(format!("socks5 negotiation with {}", self.endpoint.authority())))?
                    .map_err(|e| Error::network_with_source(format!("socks5 proxy connect to {}", dest), e))?;
            }
        }

        Ok(Outbound::new(stream, local_addr))
    }
}
