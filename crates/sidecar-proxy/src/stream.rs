//! Byte-stream plumbing shared by the relay and tunnel paths.
//!
//! [`TunnelIo`] is the capability every socket handed to the tunnel needs:
//! async read/write plus the socket tuning applied once a connection turns
//! into a long-lived pipe. [`Rewind`] pushes already-buffered bytes back in
//! front of a stream so nothing read ahead while parsing a head is lost.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, BufReader, DuplexStream, ReadBuf};
use tokio::net::TcpStream;

/// A bidirectional byte stream that can be spliced into a tunnel.
pub trait TunnelIo: AsyncRead + AsyncWrite + Unpin + Send {
    /// Configure the socket for an indefinite tunnel: no write coalescing
    /// and periodic TCP keep-alive packets. No idle timer is armed.
    fn tune_for_tunnel(&self) -> io::Result<()> {
        Ok(())
    }
}

/// Type-erased outbound stream returned by connection pools.
pub type BoxedIo = Box<dyn TunnelIo>;

impl TunnelIo for TcpStream {
    fn tune_for_tunnel(&self) -> io::Result<()> {
        self.set_nodelay(true)?;
        socket2::SockRef::from(self).set_keepalive(true)
    }
}

impl<S: TunnelIo> TunnelIo for tokio_rustls::client::TlsStream<S> {
    fn tune_for_tunnel(&self) -> io::Result<()> {
        self.get_ref().0.tune_for_tunnel()
    }
}

impl TunnelIo for DuplexStream {}

impl TunnelIo for BoxedIo {
    fn tune_for_tunnel(&self) -> io::Result<()> {
        (**self).tune_for_tunnel()
    }
}

/// A stream with bytes pushed back in front of it.
#[derive(Debug)]
pub struct Rewind<S> {
    prefix: Vec<u8>,
    inner: S,
}

impl<S> Rewind<S> {
    pub fn new(inner: S, prefix: Vec<u8>) -> Self {
        Self { prefix, inner }
    }

    /// Number of pushed-back bytes not yet read.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.prefix.len()
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// The wrapped stream, discarding unread pushed-back bytes.
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewind<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() && buf.remaining() > 0 {
            let n = self.prefix.len().min(buf.remaining());
            buf.put_slice(&self.prefix[..n]);
            self.prefix.drain(..n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewind<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl<S: TunnelIo> TunnelIo for Rewind<S> {
    fn tune_for_tunnel(&self) -> io::Result<()> {
        self.inner.tune_for_tunnel()
    }
}

/// Inbound connections are read through a buffer that outlives each request
/// head, so reads past one head are served to the next consumer.
impl<S: TunnelIo> TunnelIo for BufReader<S> {
    fn tune_for_tunnel(&self) -> io::Result<()> {
        self.get_ref().tune_for_tunnel()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_rewind_yields_prefix_first() {
        let (a, mut b) = tokio::io::duplex(64);
        b.write_all(b" world").await.unwrap();
        drop(b);

        let mut stream = Rewind::new(a, b"hello".to_vec());
        assert_eq!(stream.pending(), 5);
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world");
        assert_eq!(stream.pending(), 0);
    }

    #[tokio::test]
    async fn test_rewind_partial_reads() {
        let (a, b) = tokio::io::duplex(64);
        drop(b);
        let mut stream = Rewind::new(a, b"abcdef".to_vec());
        let mut buf = [0u8; 4];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"abcd");
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ef");
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_buffered_stream_keeps_read_ahead() {
        let (a, mut b) = tokio::io::duplex(64);
        b.write_all(b"HEAD\r\nbody").await.unwrap();
        drop(b);

        let mut stream = BufReader::new(a);
        let mut line = String::new();
        tokio::io::AsyncBufReadExt::read_line(&mut stream, &mut line).await.unwrap();
        assert_eq!(line, "HEAD\r\n");
        stream.tune_for_tunnel().unwrap();

        let mut rest = String::new();
        stream.read_to_string(&mut rest).await.unwrap();
        assert_eq!(rest, "body");
    }

    #[tokio::test]
    async fn test_tcp_tuning() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        client.tune_for_tunnel().unwrap();
        assert!(client.nodelay().unwrap());
        assert!(socket2::SockRef::from(&client).keepalive().unwrap());
    }
}
