//! Debug HTTP listener: liveness and status probing.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

pub struct DebugServer {
    started: Instant,
    upstream: String,
}

impl DebugServer {
    pub fn new(upstream: String) -> Arc<Self> {
        Arc::new(Self {
            started: Instant::now(),
            upstream,
        })
    }

    /// Serve until cancellation. A cancel-driven stop is a clean shutdown,
    /// not an error.
    pub async fn serve(self: &Arc<Self>, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                result = listener.accept() => {
                    let (stream, _) = result
                        .map_err(|e| Error::network_with_source("debug accept", e))?;
                    let this = Arc::clone(self);
                    let conn_cancel = cancel.clone();
                    tokio::spawn(async move {
                        let service = service_fn(move |req| {
                            let this = Arc::clone(&this);
                            async move { this.respond(req) }
                        });
                        let conn = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service);
                        tokio::select! {
                            _ = conn_cancel.cancelled() => {}
                            result = conn => {
                                if let Err(e) = result {
                                    tracing::debug!("debug connection error: {}", e);
                                }
                            }
                        }
                    });
                }
            }
        }
    }

    fn respond(
        &self,
        req: Request<hyper::body::Incoming>,
    ) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
        let (status, body) = match req.uri().path() {
            "/debug/status" => (
                StatusCode::OK,
                format!(
                    "version: {}\nuptime_seconds: {}\nupstream: {}\n",
                    env!("CARGO_PKG_VERSION"),
                    self.started.elapsed().as_secs(),
                    self.upstream,
                ),
            ),
            "/healthz" => (StatusCode::OK, "ok\n".to_string()),
            _ => (StatusCode::NOT_FOUND, "not found\n".to_string()),
        };

        Ok(Response::builder()
            .status(status)
            .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(Full::new(Bytes::from(body)))
            .unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_status_endpoint() {
        let listener = crate::inbound::listen("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let server = DebugServer::new("direct://".to_string());
        let serve_cancel = cancel.clone();
        let handle = tokio::spawn(async move { server.serve(listener, serve_cancel).await });

        let mut sock = tokio::net::TcpStream::connect(addr).await.unwrap();
        sock.write_all(b"GET /debug/status HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        sock.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("upstream: direct://"));

        cancel.cancel();
        assert!(handle.await.unwrap().is_ok());
    }
}
