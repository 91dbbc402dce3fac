//! Outbound dialer that forwards connections through an SSH server.
//!
//! One SSH transport (key exchange + user auth) is shared per dialer and
//! every `connect` call opens a `direct-tcpip` channel over it, the same
//! multiplexing `ssh -D` uses. The transport is created lazily, guarded by a
//! single-flight so concurrent first dials trigger exactly one handshake,
//! and is replaced at most once per dial when it turns out to be dead.

pub mod known_hosts;

use std::borrow::Cow;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::future::{BoxFuture, FutureExt, Shared};
use russh::client::{self, AuthResult};
use russh::keys::agent::client::AgentClient;
use russh::keys::{Algorithm, EcdsaCurve, HashAlg, PrivateKey, PrivateKeyWithHashAlg, PublicKey};
use russh::{ChannelStream, Disconnect, Preferred};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::address::Destination;
use crate::config::{DialConfig, ProxyEndpoint, SshKeySource};
use crate::error::{Error, Result};
use crate::outbound::direct::DirectDialer;
use crate::outbound::{Dialer, Network, Outbound};

use known_hosts::KnownHosts;

pub struct SshDialer {
    params: Arc<ConnectParams>,
    pool: Arc<Mutex<Pool>>,
}

impl std::fmt::Debug for SshDialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshDialer").finish_non_exhaustive()
    }
}

/// Everything a transport connect attempt needs, detached from the dialer so
/// the single-flight future can be `'static`.
struct ConnectParams {
    cfg: DialConfig,
    endpoint: ProxyEndpoint,
    keys: Vec<Arc<PrivateKey>>,
    use_agent: bool,
    known_hosts: Option<Arc<KnownHosts>>,
    direct: Arc<DirectDialer>,
}

/// An authenticated SSH connection shared by all channel dials.
pub struct Transport {
    handle: client::Handle<TransportHandler>,
}

type SharedTransport = Arc<Transport>;
type ConnectResult = std::result::Result<SharedTransport, Arc<Error>>;
type ConnectFuture = Shared<BoxFuture<'static, ConnectResult>>;

#[derive(Default)]
struct Pool {
    cached: Option<SharedTransport>,
    inflight: Option<ConnectFuture>,
}

impl SshDialer {
    pub fn new(cfg: DialConfig, endpoint: ProxyEndpoint) -> Result<Self> {
        if endpoint.username.is_empty() {
            return Err(Error::config("ssh dialer: missing username"));
        }

        let mut keys = Vec::new();
        let mut use_agent = false;
        match &cfg.ssh_key {
            SshKeySource::None => {}
            SshKeySource::Agent => use_agent = true,
            SshKeySource::File(path) => {
                let key = russh::keys::load_secret_key(path, None).map_err(|e| {
                    Error::config_with_source(
                        format!("ssh dialer: reading key file {}", path.display()),
                        e,
                    )
                })?;
                keys.push(Arc::new(key));
            }
        }

        if endpoint.password.is_empty() && keys.is_empty() && !use_agent {
            return Err(Error::config("ssh dialer: missing password or key"));
        }

        let known_hosts = match &cfg.ssh_known_hosts {
            Some(path) => Some(Arc::new(KnownHosts::open(path)?)),
            None => None,
        };

        let direct = Arc::new(DirectDialer::new(cfg.clone()));
        Ok(Self {
            params: Arc::new(ConnectParams {
                cfg,
                endpoint,
                keys,
                use_agent,
                known_hosts,
                direct,
            }),
            pool: Arc::new(Mutex::new(Pool::default())),
        })
    }

    /// Get the shared transport, creating it if needed.
    ///
    /// Concurrent callers join one in-flight connect attempt. The attempt
    /// itself runs on a background task detached from any caller's
    /// cancellation, so a caller giving up does not abort the handshake the
    /// other waiters are depending on.
    async fn transport(&self, cancel: &CancellationToken) -> Result<SharedTransport> {
        let flight = {
            let mut pool = self.pool.lock().expect("ssh pool poisoned");
            if let Some(t) = &pool.cached {
                if t.handle.is_closed() {
                    pool.cached = None;
                } else {
                    return Ok(Arc::clone(t));
                }
            }
            match &pool.inflight {
                Some(f) => f.clone(),
                None => {
                    let f = spawn_connect(Arc::clone(&self.params), Arc::clone(&self.pool));
                    pool.inflight = Some(f.clone());
                    f
                }
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Canceled),
            result = flight => result.map_err(|e| Error::network(format!("ssh transport: {}", e))),
        }
    }

    /// Drop the cached transport (if it is still `stale`) and close it.
    fn invalidate(&self, stale: &SharedTransport) {
        let closed = {
            let mut pool = self.pool.lock().expect("ssh pool poisoned");
            let is_current = matches!(&pool.cached, Some(current) if Arc::ptr_eq(current, stale));
            if is_current {
                pool.cached.take()
            } else {
                None
            }
        };
        if let Some(transport) = closed {
            tokio::spawn(async move {
                let _ = transport
                    .handle
                    .disconnect(Disconnect::ByApplication, "", "")
                    .await;
            });
        }
    }

    async fn open_channel(
        &self,
        transport: &SharedTransport,
        dest: &Destination,
    ) -> Result<ChannelStream<client::Msg>> {
        let channel = transport
            .handle
            .channel_open_direct_tcpip(dest.host(), dest.port as u32, "127.0.0.1", 0)
            .await?;
        Ok(channel.into_stream())
    }
}

#[async_trait::async_trait]
impl Dialer for SshDialer {
    async fn connect(
        &self,
        cancel: &CancellationToken,
        _network: Network,
        dest: &Destination,
    ) -> Result<Outbound> {
        let transport = self.transport(cancel).await?;

        let stream = match self.open_channel(&transport, dest).await {
            Ok(stream) => stream,
            Err(Error::Ssh(russh::Error::ChannelOpenFailure(reason))) => {
                // The server answered: transport is healthy, destination is
                // not reachable. Leave the transport alone.
                return Err(Error::network(format!(
                    "ssh dial {}: channel open failed ({:?})",
                    dest, reason
                )));
            }
            Err(original) => {
                // The transport may be dead. Replace it exactly once and
                // retry; whether reconnecting or the retried open fails,
                // the original error is the one worth reporting.
                self.invalidate(&transport);
                let fresh = match self.transport(cancel).await {
                    Ok(t) => t,
                    Err(reconnect) => {
                        tracing::debug!("ssh dial {}: reconnect failed: {}", dest, reconnect);
                        return Err(Error::network(format!("ssh dial {}: {}", dest, original)));
                    }
                };
                match self.open_channel(&fresh, dest).await {
                    Ok(stream) => stream,
                    Err(retry) => {
                        tracing::debug!("ssh dial {}: retry failed: {}", dest, retry);
                        return Err(Error::network(format!("ssh dial {}: {}", dest, original)));
                    }
                }
            }
        };

        let conn = ChannelConn::new(stream, cancel.clone());
        Ok(Outbound::new(conn, None))
    }
}

fn spawn_connect(params: Arc<ConnectParams>, pool: Arc<Mutex<Pool>>) -> ConnectFuture {
    let task = tokio::spawn(async move {
        let result = connect_transport(&params).await.map(Arc::new).map_err(Arc::new);
        let mut pool = pool.lock().expect("ssh pool poisoned");
        if let Ok(transport) = &result {
            pool.cached = Some(Arc::clone(transport));
        }
        pool.inflight = None;
        result
    });

    async move {
        match task.await {
            Ok(result) => result,
            Err(join) => Err(Arc::new(Error::network(format!(
                "ssh connect task failed: {}",
                join
            )))),
        }
    }
    .boxed()
    .shared()
}

/// Dial TCP, run the SSH handshake, and authenticate. Bounded by the
/// negotiation timeout; runs under a background cancellation token on behalf
/// of all single-flight waiters.
async fn connect_transport(params: &ConnectParams) -> Result<Transport> {
    let server: Destination = params.endpoint.authority().parse()?;
    let background = CancellationToken::new();
    let tcp = params
        .direct
        .dial_tcp(&background, Network::Tcp, &server)
        .await?;

    let config = Arc::new(client::Config {
        preferred: Preferred {
            key: Cow::Owned(vec![
                Algorithm::Ed25519,
                Algorithm::Ecdsa {
                    curve: EcdsaCurve::NistP521,
                },
                Algorithm::Ecdsa {
                    curve: EcdsaCurve::NistP384,
                },
                Algorithm::Ecdsa {
                    curve: EcdsaCurve::NistP256,
                },
                Algorithm::Rsa {
                    hash: Some(HashAlg::Sha512),
                },
                Algorithm::Rsa {
                    hash: Some(HashAlg::Sha256),
                },
            ]),
            ..Preferred::default()
        },
        ..client::Config::default()
    });

    let handler = TransportHandler {
        host: params.endpoint.host.clone(),
        port: params.endpoint.port,
        known_hosts: params.known_hosts.clone(),
    };

    let negotiation = async {
        let mut handle = client::connect_stream(config, tcp, handler).await?;
        authenticate(&mut handle, params).await?;
        Ok::<_, Error>(handle)
    };

    let handle = tokio::time::timeout(params.cfg.negotiation_timeout, negotiation)
        .await
        .map_err(|_| Error::timeout(format!("ssh handshake with {}", server)))??;

    tracing::debug!("ssh transport to {} established", server);
    Ok(Transport { handle })
}

/// Offer public keys first (file and agent identities), then the password.
async fn authenticate(
    handle: &mut client::Handle<TransportHandler>,
    params: &ConnectParams,
) -> Result<()> {
    let user = params.endpoint.username.as_str();

    for key in &params.keys {
        let hash_alg = rsa_hash_for(handle, key.algorithm()).await;
        let result = handle
            .authenticate_publickey(user, PrivateKeyWithHashAlg::new(Arc::clone(key), hash_alg))
            .await?;
        if matches!(result, AuthResult::Success) {
            return Ok(());
        }
    }

    if params.use_agent {
        let mut agent = AgentClient::connect_env()
            .await
            .map_err(|e| Error::config_with_source("ssh agent unavailable", e))?;
        let identities = agent
            .request_identities()
            .await
            .map_err(|e| Error::config_with_source("listing ssh agent identities", e))?;
        for key in identities {
            let hash_alg = rsa_hash_for(handle, key.algorithm()).await;
            match handle
                .authenticate_publickey_with(user, key, hash_alg, &mut agent)
                .await
            {
                Ok(AuthResult::Success) => return Ok(()),
                Ok(_) => {}
                Err(e) => tracing::debug!("ssh agent identity rejected: {}", e),
            }
        }
    }

    if !params.endpoint.password.is_empty() {
        let result = handle
            .authenticate_password(user, params.endpoint.password.as_str())
            .await?;
        if matches!(result, AuthResult::Success) {
            return Ok(());
        }
    }

    Err(Error::auth(format!(
        "ssh authentication failed for {}@{}",
        user,
        params.endpoint.authority()
    )))
}

async fn rsa_hash_for(
    handle: &client::Handle<TransportHandler>,
    algorithm: Algorithm,
) -> Option<HashAlg> {
    match algorithm {
        Algorithm::Rsa { .. } => handle
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten(),
        _ => None,
    }
}

/// Client-side handler: the only event of interest is host key verification.
struct TransportHandler {
    host: String,
    port: u16,
    known_hosts: Option<Arc<KnownHosts>>,
}

impl client::Handler for TransportHandler {
    type Error = Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        match &self.known_hosts {
            // An empty known-hosts path disables verification.
            None => Ok(true),
            Some(kh) => {
                kh.verify(&self.host, self.port, server_public_key).await?;
                Ok(true)
            }
        }
    }
}

/// One `direct-tcpip` channel presented as a byte stream.
///
/// The caller's cancellation token doubles as the close hook: once it fires,
/// pending and future reads/writes fail immediately and dropping the stream
/// closes the channel. Dropping the stream also detaches the hook, leaving
/// the shared transport untouched.
pub struct ChannelConn {
    io: ChannelStream<client::Msg>,
    cancel: Pin<Box<WaitForCancellationFutureOwned>>,
    canceled: bool,
}

impl ChannelConn {
    fn new(io: ChannelStream<client::Msg>, cancel: CancellationToken) -> Self {
        Self {
            io,
            cancel: Box::pin(cancel.cancelled_owned()),
            canceled: false,
        }
    }

    fn check_canceled(&mut self, cx: &mut Context<'_>) -> Option<std::io::Error> {
        if !self.canceled {
            if self.cancel.as_mut().poll(cx).is_ready() {
                self.canceled = true;
            }
        }
        self.canceled.then(|| {
            std::io::Error::new(std::io::ErrorKind::ConnectionAborted, "ssh channel canceled")
        })
    }
}

impl AsyncRead for ChannelConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if let Some(err) = self.check_canceled(cx) {
            return Poll::Ready(Err(err));
        }
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for ChannelConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        if let Some(err) = self.check_canceled(cx) {
            return Poll::Ready(Err(err));
        }
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}
