//! Byte-stream abstraction under a [`Connection`](crate::websocket::Connection).
//!
//! The relay only needs readiness, non-blocking reads and peeks, buffered
//! writes and a write-half shutdown. [`TcpStream`] is the production
//! implementation; tests plug in an in-memory stream.

use async_trait::async_trait;
use futures::FutureExt;
use std::io;
use std::net::SocketAddr;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

/// Async byte stream a WebSocket connection runs over.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Wait until a read would not block (data or end of stream is pending).
    async fn readable(&self) -> io::Result<()>;

    /// Read whatever is available. `WouldBlock` means nothing yet; `Ok(0)` means end of stream.
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Like [`try_read`](Self::try_read) but leaves the bytes in the stream.
    fn try_peek(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write all of `data`.
    async fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// Shut down the write half.
    async fn shutdown(&mut self) -> io::Result<()>;

    fn peer_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl Transport for TcpStream {
    async fn readable(&self) -> io::Result<()> {
        TcpStream::readable(self).await
    }

    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        TcpStream::try_read(self, buf)
    }

    fn try_peek(&self, buf: &mut [u8]) -> io::Result<usize> {
        // A pending peek also clears stale readiness for the next readable().
        self.peek(buf)
            .now_or_never()
            .unwrap_or_else(|| Err(io::ErrorKind::WouldBlock.into()))
    }

    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        AsyncWriteExt::write_all(self, data).await
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        AsyncWriteExt::shutdown(self).await
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::peer_addr(self)
    }
}
