//! In-memory duplex pipe joining the bridge to a streaming RPC handler.
//!
//! Two linked endpoints, each readable and writable, with a small bounded
//! buffer per direction. A producer that outruns its consumer parks on the
//! pipe, so the HTTP client's read pressure throttles the internal snapshot
//! producer end to end.
//!
//! Closing is shared: [`CloseHandle::close`] (or [`PipeEndpoint::close`])
//! tears down both endpoints at once, failing pending and future operations
//! with a [`PipeClosed`] sentinel. Dropping an endpoint is the softer exit:
//! the peer drains whatever is buffered and then reads end-of-stream.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

/// Buffer bound per direction.
///
/// Small on purpose: the pipe is a backpressure device, not a queue. Anything
/// beyond one I/O chunk in flight just hides a slow consumer.
const PIPE_CAPACITY: usize = 8 * 1024;

/// Payload of the error returned by pipe operations after a close.
///
/// Matched by [`is_closed`]; callers must classify by this condition, never
/// by message text.
#[derive(Debug, thiserror::Error)]
#[error("pipe closed")]
pub struct PipeClosed;

/// Create a linked pair of pipe endpoints.
pub fn pipe() -> (PipeEndpoint, PipeEndpoint) {
    let (a, b) = tokio::io::duplex(PIPE_CAPACITY);
    let shutdown = CancellationToken::new();
    (
        PipeEndpoint::new(a, shutdown.clone()),
        PipeEndpoint::new(b, shutdown),
    )
}

/// One side of the pipe. Exclusively owned by a single worker for the
/// lifetime of one request.
pub struct PipeEndpoint {
    io: DuplexStream,
    shutdown: CancellationToken,
    closed: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl PipeEndpoint {
    fn new(io: DuplexStream, shutdown: CancellationToken) -> Self {
        let closed = Box::pin(shutdown.clone().cancelled_owned());
        Self {
            io,
            shutdown,
            closed,
        }
    }

    /// Close both endpoints. Pending reads and writes on either side wake
    /// with a [`PipeClosed`] error, as do all later operations. Idempotent.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Detached handle for closing the pipe without owning an endpoint.
    pub fn close_handle(&self) -> CloseHandle {
        CloseHandle(self.shutdown.clone())
    }

    /// Registers interest in the close signal and reports whether it fired.
    fn poll_closed(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        if self.shutdown.is_cancelled() {
            return Poll::Ready(());
        }
        self.closed.as_mut().poll(cx)
    }
}

/// Cheap clonable closer, held by the disconnect watcher.
#[derive(Clone)]
pub struct CloseHandle(CancellationToken);

impl CloseHandle {
    /// See [`PipeEndpoint::close`].
    pub fn close(&self) {
        self.0.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.0.is_cancelled()
    }
}

pub(crate) fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, PipeClosed)
}

/// True when `err` is the pipe's close sentinel.
pub fn is_closed(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::ConnectionAborted
        && err.get_ref().is_some_and(|inner| inner.is::<PipeClosed>())
}

impl AsyncRead for PipeEndpoint {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.poll_closed(cx).is_ready() {
            return Poll::Ready(Err(closed_error()));
        }
        Pin::new(&mut this.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for PipeEndpoint {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.poll_closed(cx).is_ready() {
            return Poll::Ready(Err(closed_error()));
        }
        Pin::new(&mut this.io).poll_write(cx, data)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.poll_closed(cx).is_ready() {
            return Poll::Ready(Err(closed_error()));
        }
        Pin::new(&mut this.io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.poll_closed(cx).is_ready() {
            return Poll::Ready(Err(closed_error()));
        }
        Pin::new(&mut this.io).poll_shutdown(cx)
    }
}
