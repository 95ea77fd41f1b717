//! Forwarding route for nodes that hold no cluster state themselves.
//!
//! A [`ForwardRpc`] behaves like any other streaming handler, but instead of
//! producing bytes it dials a serving peer, performs the header/ack
//! handshake, and splices the two raw streams together. Failures before the
//! splice are reported in-band with the common error header shape, so the
//! requester sees a coded failure rather than a silent hangup.

use std::io;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio_util::codec::Framed;

use crate::bridge::codec::{FrameCodec, Unframed};
use crate::bridge::protocol::{
    SnapshotSaveRequest, SnapshotSaveResponse, StreamingRpcAck, StreamingRpcHeader,
};
use crate::rpc::{RawIo, StreamingRpc};

/// Opens raw streams to a node that can serve streaming RPCs.
///
/// Peer selection, transport security and retries all live behind this seam.
#[async_trait::async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self) -> io::Result<Box<dyn RawIo>>;
}

#[derive(Debug, thiserror::Error)]
enum HandshakeError {
    #[error("failed to open a stream to a serving peer: {0}")]
    Io(#[from] io::Error),
    #[error("serving peer rejected the stream: {0}")]
    Rejected(String),
}

/// Streaming handler that relays one method to a remote peer.
pub struct ForwardRpc {
    method: String,
    dialer: Arc<dyn Dialer>,
}

impl ForwardRpc {
    pub fn new(method: impl Into<String>, dialer: Arc<dyn Dialer>) -> Self {
        Self {
            method: method.into(),
            dialer,
        }
    }

    /// Dial and handshake; on success the returned stream is past the ack
    /// and carries the method's own traffic.
    async fn open_stream(&self) -> Result<Box<dyn RawIo>, HandshakeError> {
        let remote = self.dialer.dial().await?;
        let mut framed = Framed::new(
            remote,
            FrameCodec::<StreamingRpcHeader, StreamingRpcAck>::new(),
        );
        framed
            .send(StreamingRpcHeader {
                method: self.method.clone(),
            })
            .await?;

        let ack = match framed.next().await {
            Some(Ok(ack)) => ack,
            Some(Err(e)) => return Err(e.into()),
            None => {
                return Err(HandshakeError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer hung up during the rpc handshake",
                )));
            }
        };
        if ack.is_error() {
            return Err(HandshakeError::Rejected(ack.error));
        }

        Ok(Box::new(Unframed::from_parts(framed.into_parts())))
    }
}

#[async_trait::async_trait]
impl StreamingRpc for ForwardRpc {
    async fn handle(&self, conn: Box<dyn RawIo>) {
        let mut local = conn;

        let mut remote = match self.open_stream().await {
            Ok(remote) => remote,
            Err(e) => {
                tracing::warn!(method = %self.method, error = %e, "Streaming rpc forward failed");
                fail_in_band(local, e.to_string()).await;
                return;
            }
        };

        match tokio::io::copy_bidirectional(&mut local, &mut remote).await {
            Ok((to_remote, to_local)) => {
                tracing::debug!(
                    method = %self.method,
                    to_remote,
                    to_local,
                    "Forwarded stream complete"
                );
            }
            Err(e) => {
                // Either side going away mid-stream lands here; the
                // requester already has everything that made it across.
                tracing::debug!(
                    method = %self.method,
                    error = %e,
                    "Forwarded stream ended abruptly"
                );
            }
        }
    }
}

/// Report a pre-splice failure to the local requester as a 500-class
/// response header, the shape every exchange in this family understands.
async fn fail_in_band(conn: Box<dyn RawIo>, message: String) {
    let mut framed = Framed::new(
        conn,
        FrameCodec::<SnapshotSaveResponse, SnapshotSaveRequest>::new(),
    );
    if let Err(e) = framed.send(SnapshotSaveResponse::error(500, message)).await {
        tracing::debug!(error = %e, "Requester went away before the failure header");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::SNAPSHOT_SAVE_METHOD;
    use crate::rpc::StreamingRpcRegistry;
    use crate::rpc::operator::{SnapshotArchive, SnapshotError, SnapshotSaveRpc, SnapshotSource};
    use std::io::Cursor;
    use tokio::io::AsyncReadExt;

    struct FixedSource;

    #[async_trait::async_trait]
    impl SnapshotSource for FixedSource {
        async fn snapshot(
            &self,
            _request: &SnapshotSaveRequest,
        ) -> Result<SnapshotArchive, SnapshotError> {
            Ok(SnapshotArchive {
                checksum: "sha-256=abc123".into(),
                data: Box::new(Cursor::new(b"HELLO".to_vec())),
            })
        }
    }

    /// Dialer that lands every stream on an in-process registry.
    struct InMemoryDialer {
        registry: Arc<StreamingRpcRegistry>,
    }

    #[async_trait::async_trait]
    impl Dialer for InMemoryDialer {
        async fn dial(&self) -> io::Result<Box<dyn RawIo>> {
            let (server_io, client_io) = tokio::io::duplex(4096);
            let registry = Arc::clone(&self.registry);
            tokio::spawn(async move { registry.serve_conn(Box::new(server_io)).await });
            Ok(Box::new(client_io))
        }
    }

    struct RefusingDialer;

    #[async_trait::async_trait]
    impl Dialer for RefusingDialer {
        async fn dial(&self) -> io::Result<Box<dyn RawIo>> {
            Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "no known peers",
            ))
        }
    }

    fn serving_registry() -> Arc<StreamingRpcRegistry> {
        Arc::new(StreamingRpcRegistry::new().with_handler(
            SNAPSHOT_SAVE_METHOD,
            Arc::new(SnapshotSaveRpc::new(Arc::new(FixedSource))),
        ))
    }

    /// Run the forwarder as the bridge would and collect what came back.
    async fn exchange_through(
        forward: ForwardRpc,
    ) -> (Option<SnapshotSaveResponse>, Vec<u8>) {
        let (handler_io, bridge_io) = tokio::io::duplex(4096);
        let handler = tokio::spawn(async move { forward.handle(Box::new(handler_io)).await });

        let mut framed = Framed::new(
            bridge_io,
            FrameCodec::<SnapshotSaveRequest, SnapshotSaveResponse>::new(),
        );
        framed.send(SnapshotSaveRequest::default()).await.unwrap();
        let header = framed.next().await.map(|result| result.unwrap());

        // Hand the bridge side back before joining the forwarder: the splice
        // only finishes once this end signals end-of-stream.
        let mut payload = Vec::new();
        match header.as_ref() {
            Some(h) if !h.is_error() => {
                let mut raw = Unframed::from_parts(framed.into_parts());
                raw.read_to_end(&mut payload).await.unwrap();
            }
            _ => drop(framed),
        }

        handler.await.unwrap();
        (header, payload)
    }

    #[tokio::test]
    async fn forwards_a_stream_end_to_end() {
        let forward = ForwardRpc::new(
            SNAPSHOT_SAVE_METHOD,
            Arc::new(InMemoryDialer {
                registry: serving_registry(),
            }),
        );

        let (header, payload) = exchange_through(forward).await;

        let header = header.expect("response header should come back");
        assert!(!header.is_error());
        assert_eq!(header.snapshot_checksum, "sha-256=abc123");
        assert_eq!(payload, b"HELLO");
    }

    #[tokio::test]
    async fn dial_failure_reports_in_band() {
        let forward = ForwardRpc::new(SNAPSHOT_SAVE_METHOD, Arc::new(RefusingDialer));

        let (header, _) = exchange_through(forward).await;

        let header = header.expect("failure header should come back");
        assert_eq!(header.error_code, 500);
        assert!(header.error_msg.contains("no known peers"));
    }

    #[tokio::test]
    async fn peer_rejection_reports_in_band() {
        // Registry with nothing registered nacks the handshake.
        let forward = ForwardRpc::new(
            SNAPSHOT_SAVE_METHOD,
            Arc::new(InMemoryDialer {
                registry: Arc::new(StreamingRpcRegistry::new()),
            }),
        );

        let (header, _) = exchange_through(forward).await;

        let header = header.expect("failure header should come back");
        assert_eq!(header.error_code, 500);
        assert!(header.error_msg.contains("unknown rpc method"));
    }

    #[tokio::test]
    async fn peer_death_after_ack_surfaces_as_eof() {
        struct AckAndDie;

        #[async_trait::async_trait]
        impl Dialer for AckAndDie {
            async fn dial(&self) -> io::Result<Box<dyn RawIo>> {
                let (server_io, client_io) = tokio::io::duplex(4096);
                tokio::spawn(async move {
                    let mut framed = Framed::new(
                        server_io,
                        FrameCodec::<StreamingRpcAck, StreamingRpcHeader>::new(),
                    );
                    if framed.next().await.is_some() {
                        let _ = framed.send(StreamingRpcAck::ok()).await;
                    }
                });
                Ok(Box::new(client_io))
            }
        }

        let forward = ForwardRpc::new(SNAPSHOT_SAVE_METHOD, Arc::new(AckAndDie));
        let (header, _) = exchange_through(forward).await;

        // The requester sees end-of-stream before any response header and
        // classifies it; the forwarder itself must just not hang.
        assert!(header.is_none());
    }
}
