//! Streaming RPC dispatch.
//!
//! A streaming RPC owns a raw duplex byte stream for its whole exchange:
//! framed headers first, then whatever the method defines, usually a raw
//! payload. Handlers implement [`StreamingRpc`] and are looked up by method
//! name in a [`StreamingRpcRegistry`].
//!
//! The registry also accepts connections from peer nodes: a fresh connection
//! starts with a header frame naming the method, the registry replies with an
//! ack, and on success the named handler takes over the rest of the stream.

pub mod forward;
pub mod operator;

pub use forward::{Dialer, ForwardRpc};
pub use operator::{SnapshotArchive, SnapshotError, SnapshotSaveRpc, SnapshotSource};

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use crate::bridge::codec::{FrameCodec, Unframed};
use crate::bridge::protocol::{StreamingRpcAck, StreamingRpcHeader};

/// Raw byte stream carrying one streaming RPC exchange.
pub trait RawIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> RawIo for T {}

/// A handler owning one end of a duplex stream for the duration of a call.
///
/// Failures are reported in-band, inside the method's own response header;
/// `handle` returning means only that the handler is finished with the
/// stream. Dropping `conn` is how a handler signals end-of-stream to its
/// peer.
#[async_trait::async_trait]
pub trait StreamingRpc: Send + Sync {
    async fn handle(&self, conn: Box<dyn RawIo>);
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("unknown rpc method: {0:?}")]
    UnknownMethod(String),
    /// Node has neither a local producer nor a forwarding route configured.
    #[error("misconfigured connection")]
    Misconfigured,
}

/// Routing table from method names to streaming handlers.
///
/// Built once at startup with [`with_handler`](Self::with_handler) and
/// immutable afterwards, so lookups need no locking.
#[derive(Default)]
pub struct StreamingRpcRegistry {
    handlers: HashMap<String, Arc<dyn StreamingRpc>>,
}

impl StreamingRpcRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handler(
        mut self,
        method: impl Into<String>,
        handler: Arc<dyn StreamingRpc>,
    ) -> Self {
        self.handlers.insert(method.into(), handler);
        self
    }

    pub fn resolve(&self, method: &str) -> Result<Arc<dyn StreamingRpc>, ResolveError> {
        self.handlers
            .get(method)
            .cloned()
            .ok_or_else(|| ResolveError::UnknownMethod(method.to_string()))
    }

    /// Serve one inbound streaming connection from a peer node.
    ///
    /// Reads the header frame, acks, and hands the remainder of the stream
    /// to the resolved handler. Unknown methods are nacked in-band; the
    /// connection itself still ends cleanly.
    pub async fn serve_conn(&self, conn: Box<dyn RawIo>) -> io::Result<()> {
        let mut framed =
            Framed::new(conn, FrameCodec::<StreamingRpcAck, StreamingRpcHeader>::new());

        let header = match framed.next().await {
            Some(Ok(header)) => header,
            Some(Err(e)) => return Err(e),
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before rpc header",
                ));
            }
        };

        match self.resolve(&header.method) {
            Ok(handler) => {
                framed.send(StreamingRpcAck::ok()).await?;
                tracing::debug!(method = %header.method, "Streaming rpc accepted");
                let rest: Box<dyn RawIo> = Box::new(Unframed::from_parts(framed.into_parts()));
                handler.handle(rest).await;
                Ok(())
            }
            Err(err) => {
                tracing::debug!(method = %header.method, error = %err, "Rejecting streaming rpc");
                framed.send(StreamingRpcAck::error(err.to_string())).await?;
                Ok(())
            }
        }
    }
}
