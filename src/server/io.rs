use std::{
    io,
    pin::Pin,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::Duration,
};

use bytes::Bytes;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};

/// How a connection is to be torn down once its handler has decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Disposition {
    Default,
    Close,
    Reset,
}

/// Shared, per-connection teardown state. The same control is visible at
/// every tunnel nesting level, so a reset chosen deep inside a tunnel
/// reaches the outermost socket.
#[derive(Debug, Default)]
pub(crate) struct ConnectionControl {
    disposition: AtomicU8,
}

impl ConnectionControl {
    pub(crate) fn request_close(&self) {
        self.disposition.store(1, Ordering::SeqCst);
    }

    pub(crate) fn request_reset(&self) {
        self.disposition.store(2, Ordering::SeqCst);
    }

    pub(crate) fn disposition(&self) -> Disposition {
        match self.disposition.load(Ordering::SeqCst) {
            1 => Disposition::Close,
            2 => Disposition::Reset,
            _ => Disposition::Default,
        }
    }
}

/// Wraps the accepted TCP stream and honors the connection disposition on
/// drop: `Reset` arms `SO_LINGER(0)` first, so dropping the socket emits a
/// TCP RST instead of an orderly FIN.
#[derive(Debug)]
pub(crate) struct GuardedStream {
    inner: TcpStream,
    control: Arc<ConnectionControl>,
}

impl GuardedStream {
    pub(crate) fn new(inner: TcpStream, control: Arc<ConnectionControl>) -> Self {
        Self { inner, control }
    }
}

impl Drop for GuardedStream {
    fn drop(&mut self) {
        if self.control.disposition() == Disposition::Reset {
            if let Err(err) = self.inner.set_linger(Some(Duration::ZERO)) {
                tracing::warn!("cannot arm linger for connection reset: {}", err);
            }
        }
    }
}

impl AsyncRead for GuardedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for GuardedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Re-injects already-consumed bytes at the head of a stream. Used by the
/// socket demultiplexer, which must decide on the first byte of streams
/// (tunnel interiors) that cannot be peeked at the socket level.
#[derive(Debug)]
pub(crate) struct PrefixedStream<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub(crate) fn new(prefix: Bytes, inner: S) -> Self {
        Self { prefix, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if !this.prefix.is_empty() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix.split_to(n));
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
