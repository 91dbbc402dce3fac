//! Stream adapters shared by the handlers and dialers.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// A stream with some already-read bytes put back in front of it.
///
/// Protocol sniffing and handshake parsing read ahead of the framing they
/// need; the surplus is replayed here before the inner stream is read again.
pub struct PrefixedStream<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub fn new(prefix: Bytes, inner: S) -> Self {
        Self { prefix, inner }
    }

    pub fn into_inner(self) -> (Bytes, S) {
        (self.prefix, self.inner)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            let chunk = self.prefix.split_to(n);
            buf.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Read one HTTP message head (start line + headers). Returns the head bytes
/// including the blank line, plus any surplus bytes that were read past it.
pub async fn read_head<S>(stream: &mut S) -> std::io::Result<(Vec<u8>, Bytes)>
where
    S: AsyncRead + Unpin,
{
    const MAX_HEAD: usize = 64 * 1024;
    let mut head = Vec::with_capacity(512);
    let mut chunk = [0u8; 512];

    loop {
        let n = tokio::io::AsyncReadExt::read(stream, &mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before message head",
            ));
        }
        head.extend_from_slice(&chunk[..n]);

        if let Some(end) = find_head_end(&head) {
            let leftover = Bytes::copy_from_slice(&head[end..]);
            head.truncate(end);
            return Ok((head, leftover));
        }
        if head.len() > MAX_HEAD {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "message head too large",
            ));
        }
    }
}

/// Position just past the `\r\n\r\n` terminator, if present.
pub fn find_head_end(data: &[u8]) -> Option<usize> {
    data.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|i| i + 4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_read_head_keeps_leftover() {
        let (mut far, mut near) = duplex(1024);
        far.write_all(b"HTTP/1.1 200 OK\r\n\r\nearly-data")
            .await
            .unwrap();

        let (head, leftover) = read_head(&mut near).await.unwrap();
        assert_eq!(head, b"HTTP/1.1 200 OK\r\n\r\n");
        assert_eq!(&leftover[..], b"early-data");
    }

    #[test]
    fn test_find_head_end() {
        assert_eq!(find_head_end(b"HTTP/1.1 200 OK\r\n\r\nrest"), Some(19));
        assert_eq!(find_head_end(b"HTTP/1.1 200 OK\r\n"), None);
    }

    #[tokio::test]
    async fn test_prefix_served_before_inner() {
        let (mut far, near) = duplex(64);
        far.write_all(b" world").await.unwrap();
        far.shutdown().await.unwrap();

        let mut stream = PrefixedStream::new(Bytes::from_static(b"hello"), near);
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world");
    }

    #[tokio::test]
    async fn test_small_reads_drain_prefix() {
        let (_far, near) = duplex(64);
        let mut stream = PrefixedStream::new(Bytes::from_static(b"abcd"), near);

        let mut buf = [0u8; 3];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abc");
        let mut buf = [0u8; 1];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"d");
    }

    #[tokio::test]
    async fn test_writes_pass_through() {
        let (mut far, near) = duplex(64);
        let mut stream = PrefixedStream::new(Bytes::new(), near);
        stream.write_all(b"ping").await.unwrap();

        let mut buf = [0u8; 4];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }
}
