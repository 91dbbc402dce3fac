//! Inbound listeners: bind helpers and the shared accept loop.

pub mod http;
pub mod redirect;
pub mod socks5;

use std::future::Future;
use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::config::KeepAlive;
use crate::error::{Error, Result};

/// Resolve `spec` and bind a TCP listener with `SO_REUSEADDR`.
pub async fn listen(spec: &str) -> Result<TcpListener> {
    let addr: SocketAddr = tokio::net::lookup_host(spec)
        .await
        .map_err(|e| Error::config_with_source(format!("invalid listen address {:?}", spec), e))?
        .next()
        .ok_or_else(|| Error::config(format!("listen address {:?} resolves to nothing", spec)))?;

    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )
    .map_err(|e| Error::network_with_source("creating listener socket", e))?;

    socket
        .set_reuse_address(true)
        .map_err(|e| Error::network_with_source("setting SO_REUSEADDR", e))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| Error::network_with_source("setting non-blocking", e))?;
    socket
        .bind(&addr.into())
        .map_err(|e| Error::network_with_source(format!("binding {}", addr), e))?;
    socket
        .listen(1024)
        .map_err(|e| Error::network_with_source(format!("listening on {}", addr), e))?;

    TcpListener::from_std(socket.into())
        .map_err(|e| Error::network_with_source("registering listener", e))
}

/// Accept connections until cancellation, applying the keepalive policy to
/// each accepted socket and servicing every connection on its own task.
///
/// An accept error is fatal for this listener and surfaces to the caller.
pub(crate) async fn accept_loop<H, Fut>(
    name: &'static str,
    listener: TcpListener,
    keepalive: KeepAlive,
    cancel: CancellationToken,
    handler: H,
) -> Result<()>
where
    H: Fn(TcpStream, SocketAddr, CancellationToken) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("{} listener shutting down", name);
                return Ok(());
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        if let Err(e) = keepalive.apply(&stream) {
                            tracing::debug!("{}: keepalive on {} failed: {}", name, peer, e);
                        }
                        let handler = handler.clone();
                        let cancel = cancel.clone();
                        tokio::spawn(async move {
                            if let Err(err) = handler(stream, peer, cancel).await {
                                tracing::debug!("{} connection from {}: {}", name, peer, err);
                            }
                        });
                    }
                    Err(e) => {
                        return Err(Error::network_with_source(format!("{} accept", name), e));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_listen_on_ephemeral_port() {
        let listener = listen("127.0.0.1:0").await.unwrap();
        assert_eq!(listener.local_addr().unwrap().ip().to_string(), "127.0.0.1");
    }

    #[tokio::test]
    async fn test_listen_rejects_garbage() {
        assert!(listen("not an address").await.is_err());
    }

    #[tokio::test]
    async fn test_accept_loop_spawns_per_connection_and_stops_on_cancel() {
        let listener = listen("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = Arc::clone(&seen);
        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();

        let served = tokio::spawn(async move {
            accept_loop("test", listener, KeepAlive::Off, loop_cancel, move |_s, _peer, _c| {
                let seen = Arc::clone(&seen2);
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await
        });

        for _ in 0..3 {
            let mut sock = TcpStream::connect(addr).await.unwrap();
            sock.shutdown().await.ok();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 3);

        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), served)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
