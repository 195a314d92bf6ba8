//! CONNECT tunnel over a single HTTP/2 stream
//!
//! A tunnel owns the two halves of the upgraded CONNECT stream: reads
//! consume the response body, writes feed the request body. Each half is
//! closable on its own so TCP half-close survives the trip through the
//! upstream proxy.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};

use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf,
};
use tracing::debug;

use crate::error::{MuxtunError, Result};

/// The IO type a CONNECT response upgrades into
pub type ConnectIo = TokioIo<Upgraded>;

/// In-flight upstream-to-downstream copy loops
pub static ACTIVE_DOWNLINKS: AtomicUsize = AtomicUsize::new(0);
/// In-flight downstream-to-upstream copy loops
pub static ACTIVE_UPLINKS: AtomicUsize = AtomicUsize::new(0);

/// Bidirectional byte stream over one HTTP/2 CONNECT stream
///
/// Generic over the underlying duplex IO so half-close behavior is testable
/// over an in-memory stream; production tunnels use [`ConnectIo`].
pub struct HttpTunnel<T = ConnectIo> {
    reader: TunnelReader<T>,
    writer: TunnelWriter<T>,
}

impl<T> std::fmt::Debug for HttpTunnel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTunnel").finish_non_exhaustive()
    }
}

impl<T: AsyncRead + AsyncWrite> HttpTunnel<T> {
    pub fn new(io: T) -> Self {
        let (read_half, write_half) = tokio::io::split(io);
        Self {
            reader: TunnelReader {
                inner: Some(read_half),
            },
            writer: TunnelWriter {
                inner: Some(write_half),
            },
        }
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf).await
    }

    pub async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.write(buf).await
    }

    /// Drain the response body to end, then release the read half.
    ///
    /// Draining lets the proxy observe clean end-of-stream instead of a
    /// stream reset. Further reads fail.
    pub async fn close_read(&mut self) -> io::Result<()> {
        self.reader.close().await
    }

    /// Close the request body, signalling end-of-stream upstream.
    ///
    /// The proxy half-closes its connection towards the target; further
    /// writes fail, reads keep working until the peer is done.
    pub async fn close_write(&mut self) -> io::Result<()> {
        self.writer.close().await
    }

    /// Close both halves: write first, then drain and release the reader.
    pub async fn close(&mut self) -> Result<()> {
        let write_result = self.close_write().await;
        let read_result = self.close_read().await;
        if write_result.is_ok() && read_result.is_ok() {
            return Ok(());
        }
        let combined = [write_result.err(), read_result.err()]
            .into_iter()
            .flatten()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join(" & ");
        Err(MuxtunError::TunnelClose(combined))
    }

    /// Split into independently owned halves for concurrent copy loops
    pub fn into_split(self) -> (TunnelReader<T>, TunnelWriter<T>) {
        (self.reader, self.writer)
    }
}

/// Read half of a tunnel; `close` drains before releasing
pub struct TunnelReader<T = ConnectIo> {
    inner: Option<ReadHalf<T>>,
}

impl<T: AsyncRead> TunnelReader<T> {
    /// Discard any remaining bytes, then release the half.
    ///
    /// Idempotent. Reports the first drain error while still releasing.
    pub async fn close(&mut self) -> io::Result<()> {
        let Some(mut half) = self.inner.take() else {
            return Ok(());
        };
        let mut scratch = [0u8; 8192];
        loop {
            match half.read(&mut scratch).await {
                Ok(0) => return Ok(()),
                Ok(_) => {}
                Err(e) => return Err(e),
            }
        }
    }
}

impl<T: AsyncRead> AsyncRead for TunnelReader<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut().inner.as_mut() {
            Some(half) => Pin::new(half).poll_read(cx, buf),
            None => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "tunnel read half closed",
            ))),
        }
    }
}

/// Write half of a tunnel; `close` sends end-of-stream
pub struct TunnelWriter<T = ConnectIo> {
    inner: Option<WriteHalf<T>>,
}

impl<T: AsyncWrite> TunnelWriter<T> {
    /// Shut the half down and release it. Idempotent.
    pub async fn close(&mut self) -> io::Result<()> {
        match self.inner.take() {
            Some(mut half) => half.shutdown().await,
            None => Ok(()),
        }
    }
}

impl<T: AsyncWrite> AsyncWrite for TunnelWriter<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut().inner.as_mut() {
            Some(half) => Pin::new(half).poll_write(cx, buf),
            None => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "tunnel write half closed",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().inner.as_mut() {
            Some(half) => Pin::new(half).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().inner.as_mut() {
            Some(half) => Pin::new(half).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

/// Splice a downstream connection with an established tunnel.
///
/// Runs one copy loop per direction with independent lifetimes: when one
/// side stops sending, the half-close is propagated to the other without
/// disturbing the opposite direction. Returns once both loops are done,
/// with the (upstream-bound, downstream-bound) byte counts.
pub async fn splice<D, T>(downstream: D, tunnel: HttpTunnel<T>) -> (u64, u64)
where
    D: AsyncRead + AsyncWrite,
    T: AsyncRead + AsyncWrite,
{
    let (mut down_read, mut down_write) = tokio::io::split(downstream);
    let (mut tun_read, mut tun_write) = tunnel.into_split();

    let downlink = async {
        ACTIVE_DOWNLINKS.fetch_add(1, Ordering::Relaxed);
        let n = tokio::io::copy(&mut tun_read, &mut down_write)
            .await
            .unwrap_or_else(|e| {
                debug!("downlink copy ended: {}", e);
                0
            });
        let _ = tun_read.close().await;
        let _ = down_write.shutdown().await;
        ACTIVE_DOWNLINKS.fetch_sub(1, Ordering::Relaxed);
        n
    };

    let uplink = async {
        ACTIVE_UPLINKS.fetch_add(1, Ordering::Relaxed);
        let n = tokio::io::copy(&mut down_read, &mut tun_write)
            .await
            .unwrap_or_else(|e| {
                debug!("uplink copy ended: {}", e);
                0
            });
        let _ = tun_write.close().await;
        ACTIVE_UPLINKS.fetch_sub(1, Ordering::Relaxed);
        n
    };

    let (bytes_down, bytes_up) = tokio::join!(downlink, uplink);

    debug!(
        bytes_up = bytes_up,
        bytes_down = bytes_down,
        "tunnel closed"
    );

    (bytes_up, bytes_down)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Duration;

    #[tokio::test]
    async fn test_write_fails_after_close_write_reads_survive() {
        let (io, mut peer) = tokio::io::duplex(1024);
        let mut tunnel = HttpTunnel::new(io);

        tunnel.close_write().await.unwrap();
        assert!(tunnel.write(b"late").await.is_err());

        // The peer observes EOF on its read side.
        let mut buf = [0u8; 8];
        assert_eq!(peer.read(&mut buf).await.unwrap(), 0);

        // The read direction is still open.
        peer.write_all(b"pong").await.unwrap();
        let n = tunnel.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pong");
    }

    #[tokio::test]
    async fn test_read_fails_after_close_read_writes_survive() {
        let (io, mut peer) = tokio::io::duplex(1024);
        let mut tunnel = HttpTunnel::new(io);

        // Bytes pending at close_read time are drained, not surfaced.
        peer.write_all(b"stale").await.unwrap();
        peer.shutdown().await.unwrap();
        tunnel.close_read().await.unwrap();

        let mut buf = [0u8; 8];
        let err = tunnel.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);

        tunnel.write(b"ping").await.unwrap();
        let n = peer.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
    }

    #[tokio::test]
    async fn test_close_closes_both_halves() {
        let (io, mut peer) = tokio::io::duplex(1024);
        let mut tunnel = HttpTunnel::new(io);

        peer.write_all(b"tail").await.unwrap();
        peer.shutdown().await.unwrap();

        tunnel.close().await.unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(peer.read(&mut buf).await.unwrap(), 0);
        assert!(tunnel.write(b"x").await.is_err());
        assert!(tunnel.read(&mut buf).await.is_err());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (io, mut peer) = tokio::io::duplex(64);
        let mut tunnel = HttpTunnel::new(io);
        peer.shutdown().await.unwrap();

        tunnel.close().await.unwrap();
        tunnel.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_splice_moves_bytes_and_propagates_half_close() {
        let (down_local, down_remote) = tokio::io::duplex(1024);
        let (tun_io, mut upstream) = tokio::io::duplex(1024);

        let splice_handle =
            tokio::spawn(async move { splice(down_remote, HttpTunnel::new(tun_io)).await });

        let (mut down_local_read, mut down_local_write) = tokio::io::split(down_local);

        // downstream -> upstream
        down_local_write.write_all(b"PING\n").await.unwrap();
        let mut buf = [0u8; 16];
        let n = upstream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"PING\n");

        // upstream -> downstream
        upstream.write_all(b"PONG\n").await.unwrap();
        let n = down_local_read.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"PONG\n");

        // Half-close from the downstream side reaches the upstream peer...
        down_local_write.shutdown().await.unwrap();
        assert_eq!(upstream.read(&mut buf).await.unwrap(), 0);

        // ...and the reverse direction still works until the peer is done.
        upstream.write_all(b"BYE\n").await.unwrap();
        upstream.shutdown().await.unwrap();
        let n = down_local_read.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"BYE\n");
        assert_eq!(down_local_read.read(&mut buf).await.unwrap(), 0);

        let (bytes_up, bytes_down) = tokio::time::timeout(Duration::from_secs(1), splice_handle)
            .await
            .expect("splice timed out")
            .unwrap();
        assert_eq!(bytes_up, 5);
        assert_eq!(bytes_down, 9);
    }
}
