//! An HTTPS upstream proxy must be spoken to over TLS before CONNECT.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use strait_core::config::{DialConfig, ProxyEndpoint};
use strait_core::outbound::http::HttpProxyDialer;
use strait_core::outbound::{Dialer, Network};
use strait_core::stream::read_head;
use strait_core::Destination;

use common::*;

/// TLS-only CONNECT proxy: handshake first, then one CONNECT, then a pipe.
async fn spawn_https_connect_proxy(
    acceptor: TlsAcceptor,
    connects_seen: Arc<AtomicUsize>,
) -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((tcp, _)) = listener.accept().await else {
                return;
            };
            let acceptor = acceptor.clone();
            let connects_seen = Arc::clone(&connects_seen);
            tokio::spawn(async move {
                let Ok(mut tls) = acceptor.accept(tcp).await else {
                    return;
                };
                let Ok((head, _leftover)) = read_head(&mut tls).await else {
                    return;
                };
                let head = String::from_utf8_lossy(&head).into_owned();
                assert!(head.starts_with("CONNECT "), "not a CONNECT: {head:?}");
                connects_seen.fetch_add(1, Ordering::SeqCst);

                let target = head.split_whitespace().nth(1).unwrap().to_string();
                let Ok(mut upstream) = tokio::net::TcpStream::connect(target.as_str()).await else {
                    let _ = tls
                        .write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n")
                        .await;
                    return;
                };
                if tls
                    .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                    .await
                    .is_err()
                {
                    return;
                }
                let _ = tokio::io::copy_bidirectional(&mut tls, &mut upstream).await;
            });
        }
    });
    addr
}

#[tokio::test]
async fn https_proxy_tls_handshake_precedes_connect() {
    let echo = spawn_echo().await;

    // Self-signed certificate for 127.0.0.1; the dialer trusts exactly it.
    let certified = rcgen::generate_simple_self_signed(vec!["127.0.0.1".to_string()]).unwrap();
    let cert_der = certified.cert.der().clone();
    let key_der = rustls::pki_types::PrivateKeyDer::Pkcs8(
        rustls::pki_types::PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()),
    );

    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der.clone()], key_der)
        .unwrap();
    let acceptor = TlsAcceptor::from(Arc::new(server_config));

    let connects_seen = Arc::new(AtomicUsize::new(0));
    let proxy_addr = spawn_https_connect_proxy(acceptor, Arc::clone(&connects_seen)).await;

    let mut roots = rustls::RootCertStore::empty();
    roots.add(cert_der).unwrap();
    let client_config = Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    );

    let endpoint = ProxyEndpoint {
        host: proxy_addr.ip().to_string(),
        port: proxy_addr.port(),
        ..Default::default()
    };
    let dialer = HttpProxyDialer::new(DialConfig::default(), endpoint, true)
        .unwrap()
        .with_tls_config(client_config);

    let cancel = CancellationToken::new();
    let dest = Destination::from_socket_addr(echo);
    let out = dialer.connect(&cancel, Network::Tcp, &dest).await.unwrap();

    let mut stream = out.stream;
    stream.write_all(b"through-tls").await.unwrap();
    let mut buf = [0u8; 11];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"through-tls");

    // The proxy only ever saw the CONNECT inside the TLS session.
    assert_eq!(connects_seen.load(Ordering::SeqCst), 1);
}
