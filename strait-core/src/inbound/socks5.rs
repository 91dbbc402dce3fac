//! SOCKS5 inbound listener.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::inbound::accept_loop;
use crate::outbound::Network;
use crate::relay::bridge;
use crate::socks5;

/// SOCKS5 server: no-auth negotiation, CONNECT only, then a blind tunnel.
pub struct Socks5Server {
    cfg: ServerConfig,
}

impl Socks5Server {
    pub fn new(cfg: ServerConfig) -> Arc<Self> {
        Arc::new(Self { cfg })
    }

    pub async fn serve(self: &Arc<Self>, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        let this = Arc::clone(self);
        accept_loop(
            "socks5",
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
        &self,
        mut stream: TcpStream,
        peer: SocketAddr,
        cancel: CancellationToken,
    ) -> Result<()> {
        let negotiation = async {
            socks5::server_negotiate(&mut stream, &socks5::Auth::default()).await?;
            socks5::read_request(&mut stream).await
        };

        let negotiation = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Canceled),
            result = tokio::time::timeout(self.cfg.negotiation_timeout, negotiation) => result,
        };

        let request = match negotiation {
            Err(_) => return Err(Error::timeout(format!("socks5 negotiation with {}", peer))),
            Ok(Err(e)) if socks5::is_atyp_error(&e) => {
                let _ = socks5::write_zero_reply(
                    &mut stream,
                    socks5::REP_ADDRESS_TYPE_NOT_SUPPORTED,
                    socks5::ATYP_IPV4,
                )
                .await;
                return Err(e);
            }
            Ok(Err(e)) => return Err(e),
            Ok(Ok(req)) => req,
        };

        if request.cmd != socks5::CMD_CONNECT {
            let _ = socks5::write_zero_reply(
                &mut stream,
                socks5::REP_COMMAND_NOT_SUPPORTED,
                request.atyp,
            )
            .await;
            return Err(Error::protocol_with_info(
                format!("unsupported command {:#04x} from {}", request.cmd, peer),
                "socks5",
            ));
        }

        tracing::debug!("socks5 CONNECT {} from {}", request.dest, peer);

        let outbound = match self
            .cfg
            .dialer
            .connect(&cancel, Network::Tcp, &request.dest)
            .await
        {
            Ok(out) => out,
            Err(e) => {
                let _ = socks5::write_zero_reply(
                    &mut stream,
                    socks5::REP_CONNECTION_REFUSED,
                    request.atyp,
                )
                .await;
                return Err(e);
            }
        };

        // The reply is the last SOCKS5-framed byte sequence on this socket;
        // everything after it belongs to the tunnel.
        socks5::write_success_reply(&mut stream, outbound.local_addr).await?;

        bridge(stream, outbound.stream, &cancel).await
    }
}
