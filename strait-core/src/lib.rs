//! strait: a protocol-converting TCP forward proxy.
//!
//! Inbound HTTP (with CONNECT), SOCKS5 and transparent-redirect listeners
//! forward every connection through one configurable outbound path: direct,
//! an HTTP/HTTPS CONNECT proxy, a SOCKS5 proxy, or multiplexed `direct-tcpip`
//! channels over SSH.

pub mod address;
pub mod config;
pub mod debug;
pub mod error;
pub mod inbound;
pub mod logging;
pub mod outbound;
pub mod relay;
pub mod socks5;
pub mod stream;

pub use address::{Address, Destination};
pub use config::{DialConfig, KeepAlive, ServerConfig, SshKeySource, Upstream};
pub use error::{Error, Result};
pub use outbound::{build_dialer, Dialer, Network};
