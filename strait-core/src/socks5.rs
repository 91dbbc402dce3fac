//! SOCKS5 framing and negotiation, both sides (RFC 1928, RFC 1929).
//!
//! Only the CONNECT command is supported; BIND and UDP ASSOCIATE are not.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::address::{Address, Destination};
use crate::error::{Error, Result};

pub const VERSION: u8 = 0x05;
pub const USERPASS_VERSION: u8 = 0x01;
pub const RESERVED: u8 = 0x00;

pub const METHOD_NONE: u8 = 0x00;
pub const METHOD_USERPASS: u8 = 0x02;
pub const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

pub const CMD_CONNECT: u8 = 0x01;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

pub const REP_SUCCEEDED: u8 = 0x00;
pub const REP_GENERAL_FAILURE: u8 = 0x01;
pub const REP_CONNECTION_REFUSED: u8 = 0x05;
pub const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const REP_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

/// Username/password credentials. An empty username means no-auth.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Auth {
    pub username: String,
    pub password: String,
}

impl Auth {
    pub fn is_configured(&self) -> bool {
        !self.username.is_empty()
    }
}

/// A parsed SOCKS5 request.
#[derive(Debug, Clone)]
pub struct Request {
    pub cmd: u8,
    pub atyp: u8,
    pub dest: Destination,
}

// --- server side ---

/// Perform the server side of SOCKS5 method negotiation.
///
/// With credentials configured, the client must offer username/password and
/// present matching credentials; otherwise the client must offer no-auth.
/// On any mismatch a negative selection or status is written before failing.
pub async fn server_negotiate<S>(stream: &mut S, auth: &Auth) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    if head[0] != VERSION {
        return Err(Error::protocol_with_info(
            format!("bad version {:#04x} in greeting", head[0]),
            "socks5",
        ));
    }

    let mut methods = vec![0u8; head[1] as usize];
    stream.read_exact(&mut methods).await?;

    if auth.is_configured() {
        if !methods.contains(&METHOD_USERPASS) {
            stream.write_all(&[VERSION, METHOD_NO_ACCEPTABLE]).await?;
            return Err(Error::auth("client does not offer username/password"));
        }
        stream.write_all(&[VERSION, METHOD_USERPASS]).await?;
        server_userpass(stream, auth).await
    } else {
        if !methods.contains(&METHOD_NONE) {
            stream.write_all(&[VERSION, METHOD_NO_ACCEPTABLE]).await?;
            return Err(Error::auth("client does not offer no-auth"));
        }
        stream.write_all(&[VERSION, METHOD_NONE]).await?;
        Ok(())
    }
}

async fn server_userpass<S>(stream: &mut S, auth: &Auth) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    if head[0] != USERPASS_VERSION {
        return Err(Error::protocol_with_info(
            "bad username/password sub-negotiation version",
            "socks5",
        ));
    }

    let mut username = vec![0u8; head[1] as usize];
    stream.read_exact(&mut username).await?;

    let mut plen = [0u8; 1];
    stream.read_exact(&mut plen).await?;
    let mut password = vec![0u8; plen[0] as usize];
    stream.read_exact(&mut password).await?;

    if username != auth.username.as_bytes() || password != auth.password.as_bytes() {
        stream.write_all(&[USERPASS_VERSION, 0x01]).await?;
        return Err(Error::auth("username/password mismatch"));
    }
    stream.write_all(&[USERPASS_VERSION, 0x00]).await?;
    Ok(())
}

/// Read and parse a SOCKS5 request frame.
pub async fn read_request<S>(stream: &mut S) -> Result<Request>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != VERSION {
        return Err(Error::protocol_with_info(
            format!("bad version {:#04x} in request", head[0]),
            "socks5",
        ));
    }

    let cmd = head[1];
    let atyp = head[3];

    let addr = read_address(stream, atyp).await?;
    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;

    Ok(Request {
        cmd,
        atyp,
        dest: Destination::new(addr, u16::from_be_bytes(port)),
    })
}

/// Write a success reply carrying the bound local address of the upstream
/// socket, or the IPv4 zero address when none is available.
pub async fn write_success_reply<S>(stream: &mut S, bind: Option<SocketAddr>) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let bind = bind.unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
    let mut frame = vec![VERSION, REP_SUCCEEDED, RESERVED];
    match bind.ip() {
        IpAddr::V4(ip) => {
            frame.push(ATYP_IPV4);
            frame.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            frame.push(ATYP_IPV6);
            frame.extend_from_slice(&ip.octets());
        }
    }
    frame.extend_from_slice(&bind.port().to_be_bytes());
    stream.write_all(&frame).await?;
    Ok(())
}

/// Write a non-success reply with a zero bound address. The address class
/// mirrors the request: IPv6 zero iff the request atyp was IPv6.
pub async fn write_zero_reply<S>(stream: &mut S, rep: u8, request_atyp: u8) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut frame = vec![VERSION, rep, RESERVED];
    if request_atyp == ATYP_IPV6 {
        frame.push(ATYP_IPV6);
        frame.extend_from_slice(&Ipv6Addr::UNSPECIFIED.octets());
    } else {
        frame.push(ATYP_IPV4);
        frame.extend_from_slice(&Ipv4Addr::UNSPECIFIED.octets());
    }
    frame.extend_from_slice(&0u16.to_be_bytes());
    stream.write_all(&frame).await?;
    Ok(())
}

// --- client side ---

/// Perform the client side of negotiation and issue a CONNECT for `dest`.
pub async fn client_dial<S>(stream: &mut S, auth: &Auth, dest: &Destination) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    client_negotiate(stream, auth).await?;
    client_connect(stream, dest).await
}

/// Offer no-auth (plus username/password when configured) and run the
/// selected method.
pub async fn client_negotiate<S>(stream: &mut S, auth: &Auth) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut greeting = vec![VERSION, 1, METHOD_NONE];
    if auth.is_configured() {
        greeting[1] = 2;
        greeting.push(METHOD_USERPASS);
    }
    stream.write_all(&greeting).await?;

    let mut selection = [0u8; 2];
    stream.read_exact(&mut selection).await?;
    if selection[0] != VERSION {
        return Err(Error::protocol_with_info(
            "bad version in method selection",
            "socks5",
        ));
    }

    match selection[1] {
        METHOD_NONE => Ok(()),
        METHOD_USERPASS => {
            if !auth.is_configured() {
                return Err(Error::auth("server requires username/password"));
            }
            client_userpass(stream, auth).await
        }
        other => Err(Error::protocol_with_info(
            format!("unsupported negotiation method {:#04x}", other),
            "socks5",
        )),
    }
}

async fn client_userpass<S>(stream: &mut S, auth: &Auth) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if auth.username.len() > u8::MAX as usize || auth.password.len() > u8::MAX as usize {
        return Err(Error::auth("username or password too long"));
    }

    let mut frame = vec![USERPASS_VERSION, auth.username.len() as u8];
    frame.extend_from_slice(auth.username.as_bytes());
    frame.push(auth.password.len() as u8);
    frame.extend_from_slice(auth.password.as_bytes());
    stream.write_all(&frame).await?;

    let mut status = [0u8; 2];
    stream.read_exact(&mut status).await?;
    if status[1] != 0x00 {
        return Err(Error::auth("proxy rejected username/password"));
    }
    Ok(())
}

/// Send a CONNECT request for `dest` and read the reply.
pub async fn client_connect<S>(stream: &mut S, dest: &Destination) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut frame = vec![VERSION, CMD_CONNECT, RESERVED];
    write_address(&mut frame, &dest.addr)?;
    frame.extend_from_slice(&dest.port.to_be_bytes());
    stream.write_all(&frame).await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != VERSION {
        return Err(Error::protocol_with_info("bad version in reply", "socks5"));
    }
    // Drain the bound address even on failure so the stream stays framed.
    let _ = read_address(stream, head[3]).await?;
    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;

    match head[1] {
        REP_SUCCEEDED => Ok(()),
        rep => Err(Error::network(format!(
            "proxy refused connection to {} ({})",
            dest,
            reply_text(rep)
        ))),
    }
}

// --- address wire form ---

/// Append `atyp`, address bytes (length-prefixed for domains) to `frame`.
pub fn write_address(frame: &mut Vec<u8>, addr: &Address) -> Result<()> {
    match addr {
        Address::Ipv4(ip) => {
            frame.push(ATYP_IPV4);
            frame.extend_from_slice(&ip.octets());
        }
        Address::Ipv6(ip) => {
            frame.push(ATYP_IPV6);
            frame.extend_from_slice(&ip.octets());
        }
        Address::Domain(name) => {
            if name.is_empty() || name.len() > u8::MAX as usize {
                return Err(Error::protocol_with_info(
                    format!("domain name length {} out of range", name.len()),
                    "socks5",
                ));
            }
            frame.push(ATYP_DOMAIN);
            frame.push(name.len() as u8);
            frame.extend_from_slice(name.as_bytes());
        }
    }
    Ok(())
}

/// Read an address of the given `atyp`. Domain bytes are returned without
/// their length prefix.
pub async fn read_address<S>(stream: &mut S, atyp: u8) -> Result<Address>
where
    S: AsyncRead + Unpin,
{
    match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            Ok(Address::Ipv4(Ipv4Addr::from(octets)))
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            Ok(Address::Ipv6(Ipv6Addr::from(octets)))
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name).await?;
            let name = String::from_utf8(name)
                .map_err(|_| Error::protocol_with_info("domain is not valid UTF-8", "socks5"))?;
            Ok(Address::Domain(name))
        }
        other => Err(Error::protocol_with_info(
            format!("unsupported address type {:#04x}", other),
            ATYP_PROTOCOL_TAG,
        )),
    }
}

/// Protocol tag carried by unsupported-atyp errors, so the server handler
/// can answer with the right reply code.
pub const ATYP_PROTOCOL_TAG: &str = "socks5/atyp";

/// Whether an error is an unsupported-address-type protocol error.
pub fn is_atyp_error(err: &Error) -> bool {
    matches!(err, Error::Protocol { protocol: Some(p), .. } if p == ATYP_PROTOCOL_TAG)
}

fn reply_text(rep: u8) -> &'static str {
    match rep {
        0x01 => "general failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown reply",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    async fn negotiated_pair(
        server_auth: Auth,
        client_auth: Auth,
    ) -> (
        tokio::task::JoinHandle<Result<()>>,
        tokio::io::DuplexStream,
        Result<()>,
    ) {
        let (mut client, mut server) = duplex(4096);
        let handle =
            tokio::spawn(async move { server_negotiate(&mut server, &server_auth).await });
        let res = client_negotiate(&mut client, &client_auth).await;
        (handle, client, res)
    }

    #[tokio::test]
    async fn test_no_auth_negotiation() {
        let (server, _client, res) = negotiated_pair(Auth::default(), Auth::default()).await;
        assert!(res.is_ok());
        assert!(server.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_userpass_negotiation_success() {
        let auth = Auth {
            username: "alice".into(),
            password: "wonder".into(),
        };
        let (server, _client, res) = negotiated_pair(auth.clone(), auth).await;
        assert!(res.is_ok());
        assert!(server.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_userpass_negotiation_wrong_password() {
        let server_auth = Auth {
            username: "alice".into(),
            password: "wonder".into(),
        };
        let client_auth = Auth {
            username: "alice".into(),
            password: "guess".into(),
        };
        let (server, _client, res) = negotiated_pair(server_auth, client_auth).await;
        assert!(res.is_err());
        assert!(server.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_server_rejects_missing_userpass_offer() {
        let (mut client, mut server) = duplex(4096);
        let handle = tokio::spawn(async move {
            let auth = Auth {
                username: "alice".into(),
                password: "pw".into(),
            };
            server_negotiate(&mut server, &auth).await
        });

        // Client only offers no-auth.
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut selection = [0u8; 2];
        client.read_exact(&mut selection).await.unwrap();
        assert_eq!(selection, [0x05, 0xFF]);
        assert!(handle.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_request_round_trip_domain() {
        let (mut client, mut server) = duplex(4096);
        let dest = Destination::domain("example.com", 443);
        let mut frame = vec![VERSION, CMD_CONNECT, RESERVED];
        write_address(&mut frame, &dest.addr).unwrap();
        frame.extend_from_slice(&dest.port.to_be_bytes());
        client.write_all(&frame).await.unwrap();

        let req = read_request(&mut server).await.unwrap();
        assert_eq!(req.cmd, CMD_CONNECT);
        assert_eq!(req.atyp, ATYP_DOMAIN);
        assert_eq!(req.dest, dest);
    }

    #[tokio::test]
    async fn test_request_round_trip_ipv6() {
        let (mut client, mut server) = duplex(4096);
        let dest: Destination = "[2001:db8::2]:8443".parse().unwrap();
        let mut frame = vec![VERSION, CMD_CONNECT, RESERVED];
        write_address(&mut frame, &dest.addr).unwrap();
        frame.extend_from_slice(&dest.port.to_be_bytes());
        client.write_all(&frame).await.unwrap();

        let req = read_request(&mut server).await.unwrap();
        assert_eq!(req.atyp, ATYP_IPV6);
        assert_eq!(req.dest, dest);
    }

    #[tokio::test]
    async fn test_success_reply_shape() {
        let mut buf = Vec::new();
        let bind: SocketAddr = "192.0.2.1:4242".parse().unwrap();
        write_success_reply(&mut buf, Some(bind)).await.unwrap();
        assert_eq!(&buf[..4], &[0x05, 0x00, 0x00, 0x01]);
        assert_eq!(&buf[4..8], &[192, 0, 2, 1]);
        assert_eq!(&buf[8..10], &4242u16.to_be_bytes());
    }

    #[tokio::test]
    async fn test_success_reply_defaults_to_zero_addr() {
        let mut buf = Vec::new();
        write_success_reply(&mut buf, None).await.unwrap();
        assert_eq!(buf, [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_zero_reply_mirrors_request_atyp() {
        let mut v4 = Vec::new();
        write_zero_reply(&mut v4, REP_CONNECTION_REFUSED, ATYP_DOMAIN)
            .await
            .unwrap();
        assert_eq!(v4[3], ATYP_IPV4);
        assert_eq!(v4.len(), 10);

        let mut v6 = Vec::new();
        write_zero_reply(&mut v6, REP_ADDRESS_TYPE_NOT_SUPPORTED, ATYP_IPV6)
            .await
            .unwrap();
        assert_eq!(v6[3], ATYP_IPV6);
        assert_eq!(v6.len(), 22);
    }

    #[tokio::test]
    async fn test_client_connect_failure_reply() {
        let (mut client, mut server) = duplex(4096);
        let dest = Destination::domain("example.org", 80);

        let handle = tokio::spawn(async move {
            let req = read_request(&mut server).await.unwrap();
            write_zero_reply(&mut server, REP_CONNECTION_REFUSED, req.atyp)
                .await
                .unwrap();
        });

        let err = client_connect(&mut client, &dest).await.unwrap_err();
        assert!(err.to_string().contains("connection refused"));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_client_offers_userpass_when_configured() {
        let (mut client, mut server) = duplex(4096);
        let auth = Auth {
            username: "u".into(),
            password: "p".into(),
        };
        let handle = tokio::spawn(async move {
            let mut head = [0u8; 2];
            server.read_exact(&mut head).await.unwrap();
            assert_eq!(head, [0x05, 0x02]);
            let mut methods = [0u8; 2];
            server.read_exact(&mut methods).await.unwrap();
            assert_eq!(methods, [METHOD_NONE, METHOD_USERPASS]);
            server.write_all(&[0x05, METHOD_NONE]).await.unwrap();
        });

        client_negotiate(&mut client, &auth).await.unwrap();
        handle.await.unwrap();
    }
}
