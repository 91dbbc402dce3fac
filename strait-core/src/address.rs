//! Destination addresses as they travel between listeners and dialers.
//!
//! A destination is `(host, port)` where the host is an IPv4 address, an IPv6
//! address, or a domain name that is passed through unresolved. The string
//! form is `host:port`, with IPv6 literals bracketed (`[::1]:443`).

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use crate::error::{Error, Result};

/// Host part of a destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Domain(String),
}

impl Address {
    pub fn is_ip(&self) -> bool {
        !matches!(self, Address::Domain(_))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ipv4(ip) => ip.fmt(f),
            Address::Ipv6(ip) => ip.fmt(f),
            Address::Domain(name) => name.fmt(f),
        }
    }
}

/// A `(host, port)` pair. Domain names are not pre-resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub addr: Address,
    pub port: u16,
}

impl Destination {
    pub fn new(addr: Address, port: u16) -> Self {
        Self { addr, port }
    }

    pub fn domain<S: Into<String>>(name: S, port: u16) -> Self {
        Self {
            addr: Address::Domain(name.into()),
            port,
        }
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        let host = match addr.ip() {
            IpAddr::V4(ip) => Address::Ipv4(ip),
            IpAddr::V6(ip) => Address::Ipv6(ip),
        };
        Self::new(host, addr.port())
    }

    /// Host without the port, unbracketed.
    pub fn host(&self) -> String {
        self.addr.to_string()
    }

    /// Parse `host[:port]`, supplying `default_port` when none is present.
    pub fn parse_with_default_port(s: &str, default_port: u16) -> Result<Self> {
        if let Ok(dest) = s.parse() {
            return Ok(dest);
        }
        let host = s.trim_matches(|c| c == '[' || c == ']');
        if host.contains(':') {
            format!("[{}]:{}", host, default_port).parse()
        } else {
            format!("{}:{}", host, default_port).parse()
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.addr {
            Address::Ipv6(ip) => write!(f, "[{}]:{}", ip, self.port),
            other => write!(f, "{}:{}", other, self.port),
        }
    }
}

impl FromStr for Destination {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = split_host_port(s)?;
        let port: u16 = port
            .parse()
            .map_err(|_| Error::protocol(format!("invalid port in address {:?}", s)))?;

        let addr = if let Ok(ip) = host.parse::<Ipv4Addr>() {
            Address::Ipv4(ip)
        } else if let Ok(ip) = host.parse::<Ipv6Addr>() {
            Address::Ipv6(ip)
        } else if host.is_empty() {
            return Err(Error::protocol(format!("missing host in address {:?}", s)));
        } else {
            Address::Domain(host.to_string())
        };

        Ok(Destination { addr, port })
    }
}

/// Split `host:port` or `[v6]:port` into host and port strings.
pub fn split_host_port(s: &str) -> Result<(&str, &str)> {
    if let Some(rest) = s.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| Error::protocol(format!("unbalanced bracket in address {:?}", s)))?;
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| Error::protocol(format!("missing port in address {:?}", s)))?;
        return Ok((host, port));
    }

    let (host, port) = s
        .rsplit_once(':')
        .ok_or_else(|| Error::protocol(format!("missing port in address {:?}", s)))?;
    if host.contains(':') {
        // Bare IPv6 without brackets is ambiguous.
        return Err(Error::protocol(format!(
            "IPv6 address must be bracketed: {:?}",
            s
        )));
    }
    Ok((host, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_ipv4() {
        let d: Destination = "10.1.2.3:80".parse().unwrap();
        assert_eq!(d.addr, Address::Ipv4(Ipv4Addr::new(10, 1, 2, 3)));
        assert_eq!(d.port, 80);
        assert_eq!(d.to_string(), "10.1.2.3:80");
    }

    #[test]
    fn test_parse_ipv6() {
        let d: Destination = "[2001:db8::1]:443".parse().unwrap();
        assert_eq!(d.addr, Address::Ipv6("2001:db8::1".parse().unwrap()));
        assert_eq!(d.to_string(), "[2001:db8::1]:443");
    }

    #[test]
    fn test_parse_domain() {
        let d: Destination = "example.com:8080".parse().unwrap();
        assert_eq!(d.addr, Address::Domain("example.com".to_string()));
        assert_eq!(d.to_string(), "example.com:8080");
    }

    #[test]
    fn test_parse_rejects_missing_port() {
        assert!("example.com".parse::<Destination>().is_err());
        assert!("[::1]".parse::<Destination>().is_err());
    }

    #[test]
    fn test_parse_rejects_unbracketed_ipv6() {
        assert!("2001:db8::1:443".parse::<Destination>().is_err());
    }

    #[test]
    fn test_parse_rejects_empty_host() {
        assert!(":80".parse::<Destination>().is_err());
    }

    #[test]
    fn test_parse_with_default_port() {
        assert_eq!(
            Destination::parse_with_default_port("example.com", 443)
                .unwrap()
                .to_string(),
            "example.com:443"
        );
        assert_eq!(
            Destination::parse_with_default_port("example.com:8443", 443)
                .unwrap()
                .to_string(),
            "example.com:8443"
        );
        assert_eq!(
            Destination::parse_with_default_port("[2001:db8::1]", 443)
                .unwrap()
                .to_string(),
            "[2001:db8::1]:443"
        );
        assert!(Destination::parse_with_default_port("", 443).is_err());
    }

    #[test]
    fn test_from_socket_addr() {
        let sa: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let d = Destination::from_socket_addr(sa);
        assert_eq!(d.to_string(), "127.0.0.1:9000");
    }

    fn destination_strategy() -> impl Strategy<Value = Destination> {
        let domain = ("[a-z]{1,12}", "[a-z]{2,6}").prop_map(|(name, tld)| format!("{}.{}", name, tld));
        prop_oneof![
            (any::<u32>(), any::<u16>())
                .prop_map(|(ip, port)| Destination::new(Address::Ipv4(Ipv4Addr::from(ip)), port)),
            (any::<u128>(), any::<u16>())
                .prop_map(|(ip, port)| Destination::new(Address::Ipv6(Ipv6Addr::from(ip)), port)),
            (domain, any::<u16>()).prop_map(|(name, port)| Destination::domain(name, port)),
        ]
    }

    proptest! {
        #[test]
        fn prop_string_round_trip(dest in destination_strategy()) {
            let parsed: Destination = dest.to_string().parse().unwrap();
            prop_assert_eq!(parsed, dest);
        }
    }
}
