//! Transparent (kernel-redirected) inbound listener.
//!
//! The kernel routes flows for arbitrary destinations to this listener and
//! the handler recovers where each connection was originally headed:
//!
//! - Linux (iptables TPROXY/REDIRECT): the socket is created with
//!   `IP_TRANSPARENT` and the original destination comes from a
//!   `SO_ORIGINAL_DST` getsockopt on the accepted socket.
//! - FreeBSD (IPFW fwd / PF rdr-to): the socket is created with
//!   `IP_BINDANY`/`IPV6_BINDANY`; the firewall preserves the original
//!   destination as the accepted socket's local address.
//! - OpenBSD (PF rdr-to): as FreeBSD, but with the socket-level
//!   `SO_BINDANY` option.
//!
//! Elsewhere the listener fails at construction. The matching firewall rules
//! are the operator's business on every platform.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::address::Destination;
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::inbound::accept_loop;
use crate::outbound::Network;
use crate::relay::bridge;

/// Whether transparent listening is available on this platform.
pub const SUPPORTED: bool = cfg!(any(
    target_os = "linux",
    target_os = "freebsd",
    target_os = "openbsd"
));

pub struct RedirectServer {
    cfg: ServerConfig,
}

impl RedirectServer {
    pub fn new(cfg: ServerConfig) -> Arc<Self> {
        Arc::new(Self { cfg })
    }

    pub async fn serve(self: &Arc<Self>, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        let this = Arc::clone(self);
        accept_loop(
            "tproxy",
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
        stream: TcpStream,
        peer: SocketAddr,
        cancel: CancellationToken,
    ) -> Result<()> {
        let dst = original_dst(&stream)?;
        let dest = Destination::from_socket_addr(dst);
        tracing::debug!("tproxy {} -> {}", peer, dest);

        // There is no in-band way to report a failure to the client; the
        // close itself is the reply.
        let outbound = self.cfg.dialer.connect(&cancel, Network::Tcp, &dest).await?;
        bridge(stream, outbound.stream, &cancel).await
    }
}

/// Bind a listener able to accept redirected connections.
#[cfg(any(target_os = "linux", target_os = "freebsd", target_os = "openbsd"))]
pub async fn listen_transparent(spec: &str) -> Result<TcpListener> {
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
    .map_err(|e| Error::network_with_source("creating tproxy socket", e))?;

    socket
        .set_reuse_address(true)
        .map_err(|e| Error::network_with_source("setting SO_REUSEADDR", e))?;

    enable_transparent(&socket, addr)?;

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
        .map_err(|e| Error::network_with_source("registering tproxy listener", e))
}

#[cfg(not(any(target_os = "linux", target_os = "freebsd", target_os = "openbsd")))]
pub async fn listen_transparent(_spec: &str) -> Result<TcpListener> {
    Err(Error::config(
        "transparent proxying is only supported on linux, freebsd and openbsd",
    ))
}

#[cfg(target_os = "linux")]
fn enable_transparent(socket: &socket2::Socket, addr: SocketAddr) -> Result<()> {
    use std::os::fd::AsRawFd;

    if addr.is_ipv4() {
        socket
            .set_ip_transparent(true)
            .map_err(|e| Error::network_with_source("setting IP_TRANSPARENT", e))
    } else {
        setsockopt_on(socket.as_raw_fd(), libc::SOL_IPV6, libc::IPV6_TRANSPARENT)
            .map_err(|e| Error::network_with_source("setting IPV6_TRANSPARENT", e))
    }
}

#[cfg(target_os = "freebsd")]
fn enable_transparent(socket: &socket2::Socket, addr: SocketAddr) -> Result<()> {
    use std::os::fd::AsRawFd;

    // Requires root or the PRIV_NETINET_BINDANY privilege.
    if addr.is_ipv4() {
        setsockopt_on(socket.as_raw_fd(), libc::IPPROTO_IP, libc::IP_BINDANY)
            .map_err(|e| Error::network_with_source("setting IP_BINDANY", e))
    } else {
        setsockopt_on(socket.as_raw_fd(), libc::IPPROTO_IPV6, libc::IPV6_BINDANY)
            .map_err(|e| Error::network_with_source("setting IPV6_BINDANY", e))
    }
}

#[cfg(target_os = "openbsd")]
fn enable_transparent(socket: &socket2::Socket, _addr: SocketAddr) -> Result<()> {
    use std::os::fd::AsRawFd;

    // OpenBSD takes the socket-level option, either address family.
    setsockopt_on(socket.as_raw_fd(), libc::SOL_SOCKET, libc::SO_BINDANY)
        .map_err(|e| Error::network_with_source("setting SO_BINDANY", e))
}

#[cfg(any(target_os = "linux", target_os = "freebsd", target_os = "openbsd"))]
fn setsockopt_on(fd: std::os::fd::RawFd, level: libc::c_int, optname: libc::c_int) -> std::io::Result<()> {
    let on: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            optname,
            &on as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Original destination of a redirected connection, from
/// `SO_ORIGINAL_DST` (IPv4) or its IPv6 equivalent. Port arrives in
/// network byte order.
#[cfg(target_os = "linux")]
pub fn original_dst(stream: &TcpStream) -> Result<SocketAddr> {
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
    use std::os::fd::AsRawFd;

    const SO_ORIGINAL_DST: libc::c_int = 80;

    let fd = stream.as_raw_fd();
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_IP,
            SO_ORIGINAL_DST,
            &mut storage as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    let rc = if rc == 0 {
        rc
    } else {
        len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_IPV6,
                SO_ORIGINAL_DST,
                &mut storage as *mut _ as *mut libc::c_void,
                &mut len,
            )
        }
    };
    if rc != 0 {
        return Err(Error::network_with_source(
            "original destination unavailable",
            std::io::Error::last_os_error(),
        ));
    }

    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sa = unsafe { &*(&storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr));
            Ok(SocketAddr::new(IpAddr::V4(ip), u16::from_be(sa.sin_port)))
        }
        libc::AF_INET6 => {
            let sa = unsafe { &*(&storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sa.sin6_addr.s6_addr);
            Ok(SocketAddr::new(IpAddr::V6(ip), u16::from_be(sa.sin6_port)))
        }
        other => Err(Error::network(format!(
            "original destination has unexpected family {}",
            other
        ))),
    }
}

/// Original destination of a redirected connection. IPFW fwd and PF rdr-to
/// preserve it as the accepted socket's local address.
#[cfg(any(target_os = "freebsd", target_os = "openbsd"))]
pub fn original_dst(stream: &TcpStream) -> Result<SocketAddr> {
    stream
        .local_addr()
        .map_err(|e| Error::network_with_source("original destination unavailable", e))
}

#[cfg(not(any(target_os = "linux", target_os = "freebsd", target_os = "openbsd")))]
pub fn original_dst(_stream: &TcpStream) -> Result<SocketAddr> {
    Err(Error::config(
        "transparent proxying is only supported on linux, freebsd and openbsd",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supported_matches_platform() {
        assert_eq!(
            SUPPORTED,
            cfg!(any(
                target_os = "linux",
                target_os = "freebsd",
                target_os = "openbsd"
            ))
        );
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_original_dst_fails_on_plain_connection() {
        // Without an iptables redirect there is no NAT entry to recover.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).await.unwrap();
        let (accepted, _) = listener.accept().await.unwrap();
        assert!(original_dst(&accepted).is_err());
    }

    #[cfg(any(target_os = "freebsd", target_os = "openbsd"))]
    #[tokio::test]
    async fn test_original_dst_is_local_address() {
        // Absent a PF/IPFW redirect the local address is just the listener
        // address, which is exactly what the firewall would have preserved.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).await.unwrap();
        let (accepted, _) = listener.accept().await.unwrap();
        assert_eq!(original_dst(&accepted).unwrap(), addr);
    }

    #[cfg(not(any(target_os = "linux", target_os = "freebsd", target_os = "openbsd")))]
    #[tokio::test]
    async fn test_listen_transparent_unsupported() {
        assert!(listen_transparent("127.0.0.1:0").await.is_err());
    }
}
