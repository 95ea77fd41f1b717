//! Bridge between one HTTP request and one streaming snapshot RPC.
//!
//! The two sides never share a socket: they meet over an in-memory pipe,
//! with framed headers leading and the raw archive payload trailing.
//!
//! # Architecture
//!
//! - **protocol**: header types for the save exchange and the peer handshake
//! - **codec**: JSON framing codec for AsyncRead/AsyncWrite
//! - [`save_snapshot`]: coordinator tying a handler, a relay worker, and a
//!   disconnect watcher to one request

pub mod codec;
pub mod protocol;

use std::io;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, oneshot};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::pipe::{self, PipeEndpoint};
use crate::rpc::StreamingRpc;
use codec::{FrameCodec, Unframed};
use protocol::{SnapshotSaveRequest, SnapshotSaveResponse};

/// Relay read size. The pipe buffer is smaller, so this just has to not be
/// the bottleneck.
const STREAM_CHUNK: usize = 32 * 1024;

/// Chunks in flight between the relay worker and the HTTP response body.
const STREAM_DEPTH: usize = 8;

/// Operation failure plus the HTTP status class it maps to.
///
/// Application-level failures arrive from the producer with their own code;
/// transport failures are minted locally as 500s.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct CodedError {
    pub code: u16,
    pub message: String,
}

impl CodedError {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(500, message)
    }
}

/// A snapshot stream that has committed to success.
///
/// Handed to the transport at the moment the producer's ok header arrives,
/// before any payload byte, so the checksum can still travel as a response
/// header. An `Err` chunk on `body` means the stream broke mid-flight; the
/// consumer must abort its connection rather than end it cleanly.
pub struct SnapshotStream {
    pub checksum: String,
    pub body: mpsc::Receiver<io::Result<Bytes>>,
}

/// Run one snapshot save end to end.
///
/// Couples the resolved `handler` to a framed exchange over an in-memory
/// pipe and runs three concurrent activities:
///
/// - a watcher that closes the pipe when `shutdown` fires, unblocking
///   whichever side is parked on it;
/// - a relay worker that sends the request header, awaits the response
///   header, and on success streams the raw payload through `stream_tx`;
/// - the handler itself, driven inline so this call cannot return while the
///   producer still owns its endpoint.
///
/// Exactly one outcome comes back per call, after the handler has finished.
/// `stream_tx` fires only on the success path; on failure it is dropped
/// unfired and the returned error carries the whole story.
pub async fn save_snapshot(
    handler: Arc<dyn StreamingRpc>,
    request: SnapshotSaveRequest,
    shutdown: CancellationToken,
    stream_tx: oneshot::Sender<SnapshotStream>,
) -> Result<(), CodedError> {
    let (bridge_io, handler_io) = pipe::pipe();

    // The explicit cancel below guarantees this task terminates.
    let close = bridge_io.close_handle();
    let watch_shutdown = shutdown.clone();
    let watcher = tokio::spawn(async move {
        watch_shutdown.cancelled().await;
        close.close();
    });

    let (outcome_tx, outcome_rx) = oneshot::channel();
    let worker_shutdown = shutdown.clone();
    let worker = tokio::spawn(async move {
        // Worker exit, normal or panicked, releases whoever is parked on
        // the pipe.
        let _closer = worker_shutdown.drop_guard();
        let _ = outcome_tx.send(exchange(bridge_io, request, stream_tx).await);
    });

    handler.handle(Box::new(handler_io)).await;

    // The handler has dropped its endpoint, so the relay drains the pipe to
    // EOF on its own. The hard close comes only after the outcome; closing
    // earlier drops whatever is still buffered in the pipe.
    let outcome = outcome_rx
        .await
        .unwrap_or_else(|_| Err(CodedError::internal("snapshot exchange terminated abruptly")));
    shutdown.cancel();

    let _ = watcher.await;
    let _ = worker.await;

    match &outcome {
        Ok(()) => tracing::debug!("Snapshot stream complete"),
        Err(e) => tracing::warn!(code = e.code, error = %e, "Snapshot save failed"),
    }
    outcome
}

/// Drive the bridge side of the exchange: request out, response header in,
/// then relay the payload until it ends.
async fn exchange(
    io: PipeEndpoint,
    request: SnapshotSaveRequest,
    stream_tx: oneshot::Sender<SnapshotStream>,
) -> Result<(), CodedError> {
    let mut framed = Framed::new(
        io,
        FrameCodec::<SnapshotSaveRequest, SnapshotSaveResponse>::new(),
    );

    framed
        .send(request)
        .await
        .map_err(|e| CodedError::internal(format!("failed to send snapshot request: {e}")))?;

    let response = match framed.next().await {
        Some(Ok(response)) => response,
        Some(Err(e)) => {
            return Err(CodedError::internal(format!(
                "failed to read snapshot response: {e}"
            )));
        }
        None => {
            return Err(CodedError::internal(
                "snapshot stream ended before the response header",
            ));
        }
    };

    if response.is_error() {
        return Err(CodedError::new(response.error_code, response.error_msg));
    }

    let mut payload = Unframed::from_parts(framed.into_parts());
    let (body_tx, body_rx) = mpsc::channel(STREAM_DEPTH);
    if stream_tx
        .send(SnapshotStream {
            checksum: response.snapshot_checksum,
            body: body_rx,
        })
        .is_err()
    {
        tracing::debug!("Snapshot consumer went away before the stream started");
        return Ok(());
    }

    let mut buf = BytesMut::with_capacity(STREAM_CHUNK);
    loop {
        buf.reserve(STREAM_CHUNK);
        match payload.read_buf(&mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if body_tx.send(Ok(buf.split().freeze())).await.is_err() {
                    tracing::debug!("Snapshot consumer went away mid-stream");
                    break;
                }
            }
            // Disconnect while relaying is not an operation failure.
            Err(e) if pipe::is_closed(&e) => break,
            Err(e) => {
                let failure = CodedError::internal(format!("failed to relay snapshot: {e}"));
                let _ = body_tx.send(Err(e)).await;
                return Err(failure);
            }
        }
    }

    Ok(())
}
