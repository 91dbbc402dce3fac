//! Full-duplex byte relay between an accepted connection and its upstream.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

const COPY_BUF_SIZE: usize = 32 * 1024;

/// Proxy bytes between `left` and `right` until both directions have hit EOF
/// or one of them fails, then return with both streams closed.
///
/// Each direction is an independent copy loop. When a direction finishes, the
/// destination's write side is shut down (TCP half-close) so the peer can
/// still drain the opposite direction. No deadlines are applied to the copy
/// itself; abandoned flows are reaped by TCP keepalive.
///
/// When `cancel` fires, both streams are dropped immediately to unblock any
/// pending read or write.
pub async fn bridge<L, R>(left: L, right: R, cancel: &CancellationToken) -> Result<()>
where
    L: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + AsyncWrite + Unpin,
{
    let (mut left_rd, mut left_wr) = tokio::io::split(left);
    let (mut right_rd, mut right_wr) = tokio::io::split(right);

    let upstream = copy_close(&mut left_rd, &mut right_wr);
    let downstream = copy_close(&mut right_rd, &mut left_wr);

    tokio::select! {
        _ = cancel.cancelled() => {
            // Dropping the halves closes both streams and unblocks the peer.
            Ok(())
        }
        (up, down) = futures::future::join(upstream, downstream) => {
            match (filter_benign(up), filter_benign(down)) {
                (Ok(_), Ok(_)) => Ok(()),
                (Err(e), _) | (_, Err(e)) => {
                    Err(Error::network_with_source("relay failed", e))
                }
            }
        }
    }
}

/// Copy `src` to `dst` until EOF or error, then shut down `dst`'s write side.
async fn copy_close<R, W>(src: &mut R, dst: &mut W) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut total = 0u64;

    let result = loop {
        match src.read(&mut buf).await {
            Ok(0) => break Ok(()),
            Ok(n) => {
                if let Err(e) = dst.write_all(&buf[..n]).await {
                    break Err(e);
                }
                total += n as u64;
            }
            Err(e) => break Err(e),
        }
    };

    // Half-close regardless of how the copy ended; the peer direction may
    // still be draining. A second shutdown on an already-closed stream is
    // harmless.
    let _ = dst.shutdown().await;

    result.map(|_| total)
}

/// Connection teardown races mean one direction routinely observes the
/// other's close; those are not relay failures.
fn filter_benign(res: std::io::Result<u64>) -> std::io::Result<u64> {
    match res {
        Err(e)
            if matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::ConnectionAborted
            ) =>
        {
            Ok(0)
        }
        other => other,
    }
}
