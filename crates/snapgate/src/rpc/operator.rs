//! Local producer side of `Operator.SnapshotSave`.
//!
//! Bridges a [`SnapshotSource`] (the cluster layer's archive maker) onto the
//! streaming RPC wire: one request header in, one response header out, then
//! the raw archive until it ends. The requester disappearing mid-exchange is
//! routine here and never worth more than a debug line.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::io::AsyncRead;
use tokio_util::codec::Framed;

use crate::bridge::codec::{FrameCodec, Unframed};
use crate::bridge::protocol::{SnapshotSaveRequest, SnapshotSaveResponse};
use crate::rpc::{RawIo, StreamingRpc};

/// Archive produced by a [`SnapshotSource`].
pub struct SnapshotArchive {
    /// Digest in header form, e.g. `sha-256=af8...`.
    pub checksum: String,
    pub data: Box<dyn AsyncRead + Send + Unpin>,
}

/// Application-level refusal from the source, with the status class the
/// requester should see.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct SnapshotError {
    pub code: u16,
    pub message: String,
}

impl SnapshotError {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Where snapshot archives come from.
///
/// Implemented by the cluster layer on nodes that hold the authoritative
/// state. Permission and staleness decisions belong to the implementation;
/// this module only moves their verdict across the wire.
#[async_trait::async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn snapshot(
        &self,
        request: &SnapshotSaveRequest,
    ) -> Result<SnapshotArchive, SnapshotError>;
}

/// Streaming handler serving `Operator.SnapshotSave` from a local source.
pub struct SnapshotSaveRpc {
    source: Arc<dyn SnapshotSource>,
}

impl SnapshotSaveRpc {
    pub fn new(source: Arc<dyn SnapshotSource>) -> Self {
        Self { source }
    }
}

#[async_trait::async_trait]
impl StreamingRpc for SnapshotSaveRpc {
    async fn handle(&self, conn: Box<dyn RawIo>) {
        let mut framed = Framed::new(
            conn,
            FrameCodec::<SnapshotSaveResponse, SnapshotSaveRequest>::new(),
        );

        let request = match framed.next().await {
            Some(Ok(request)) => request,
            Some(Err(e)) => {
                tracing::debug!(error = %e, "Dropping snapshot request with a bad header");
                return;
            }
            None => return,
        };

        let archive = match self.source.snapshot(&request).await {
            Ok(archive) => archive,
            Err(e) => {
                tracing::debug!(code = e.code, error = %e, "Snapshot source refused the request");
                let header = SnapshotSaveResponse::error(e.code, e.message);
                if let Err(e) = framed.send(header).await {
                    tracing::debug!(error = %e, "Requester went away before the failure header");
                }
                return;
            }
        };

        if let Err(e) = framed.send(SnapshotSaveResponse::ok(archive.checksum)).await {
            tracing::debug!(error = %e, "Requester went away before the stream started");
            return;
        }

        let mut data = archive.data;
        let mut out = Unframed::from_parts(framed.into_parts());
        match tokio::io::copy(&mut data, &mut out).await {
            Ok(bytes) => tracing::debug!(bytes, "Snapshot archive streamed"),
            Err(e) => tracing::debug!(error = %e, "Snapshot stream ended early"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::Mutex;
    use tokio::io::AsyncReadExt;

    struct FixedSource {
        checksum: String,
        bytes: Vec<u8>,
        request_seen: Arc<Mutex<Option<SnapshotSaveRequest>>>,
    }

    impl FixedSource {
        fn new(checksum: &str, bytes: &[u8]) -> Self {
            Self {
                checksum: checksum.into(),
                bytes: bytes.into(),
                request_seen: Arc::new(Mutex::new(None)),
            }
        }
    }

    #[async_trait::async_trait]
    impl SnapshotSource for FixedSource {
        async fn snapshot(
            &self,
            request: &SnapshotSaveRequest,
        ) -> Result<SnapshotArchive, SnapshotError> {
            *self.request_seen.lock().unwrap() = Some(request.clone());
            Ok(SnapshotArchive {
                checksum: self.checksum.clone(),
                data: Box::new(Cursor::new(self.bytes.clone())),
            })
        }
    }

    struct DenyingSource;

    #[async_trait::async_trait]
    impl SnapshotSource for DenyingSource {
        async fn snapshot(
            &self,
            _request: &SnapshotSaveRequest,
        ) -> Result<SnapshotArchive, SnapshotError> {
            Err(SnapshotError::new(403, "permission denied"))
        }
    }

    type RequesterCodec = FrameCodec<SnapshotSaveRequest, SnapshotSaveResponse>;

    fn spawn_handler(source: impl SnapshotSource + 'static) -> tokio::io::DuplexStream {
        let (server_io, client_io) = tokio::io::duplex(4096);
        let rpc = SnapshotSaveRpc::new(Arc::new(source));
        tokio::spawn(async move { rpc.handle(Box::new(server_io)).await });
        client_io
    }

    #[tokio::test]
    async fn serves_archive_behind_an_ok_header() {
        let client_io = spawn_handler(FixedSource::new("sha-256=abc123", b"HELLO"));

        let mut framed = Framed::new(client_io, RequesterCodec::new());
        framed.send(SnapshotSaveRequest::default()).await.unwrap();

        let header = framed.next().await.unwrap().unwrap();
        assert!(!header.is_error());
        assert_eq!(header.snapshot_checksum, "sha-256=abc123");

        let mut payload = Vec::new();
        let mut raw = Unframed::from_parts(framed.into_parts());
        raw.read_to_end(&mut payload).await.unwrap();
        assert_eq!(payload, b"HELLO");
    }

    #[tokio::test]
    async fn source_refusal_travels_in_band() {
        let client_io = spawn_handler(DenyingSource);

        let mut framed = Framed::new(client_io, RequesterCodec::new());
        framed.send(SnapshotSaveRequest::default()).await.unwrap();

        let header = framed.next().await.unwrap().unwrap();
        assert!(header.is_error());
        assert_eq!(header.error_code, 403);
        assert_eq!(header.error_msg, "permission denied");

        // Nothing follows a failure header.
        assert!(framed.next().await.is_none());
    }

    #[tokio::test]
    async fn request_options_reach_the_source() {
        let source = FixedSource::new("sha-256=abc", b"x");
        let request_seen = Arc::clone(&source.request_seen);
        let client_io = spawn_handler(source);

        let request = SnapshotSaveRequest {
            region: "euw1".into(),
            query_options: crate::bridge::protocol::QueryOptions {
                auth_token: Some("secret".into()),
                allow_stale: true,
            },
        };
        let mut framed = Framed::new(client_io, RequesterCodec::new());
        framed.send(request.clone()).await.unwrap();
        framed.next().await.unwrap().unwrap();

        assert_eq!(request_seen.lock().unwrap().as_ref(), Some(&request));
    }

    #[tokio::test]
    async fn requester_hangup_mid_stream_is_tolerated() {
        let (server_io, client_io) = tokio::io::duplex(4096);
        let rpc = SnapshotSaveRpc::new(Arc::new(FixedSource::new(
            "sha-256=big",
            &vec![3u8; 64 * 1024],
        )));
        let handler = tokio::spawn(async move { rpc.handle(Box::new(server_io)).await });

        let mut framed = Framed::new(client_io, RequesterCodec::new());
        framed.send(SnapshotSaveRequest::default()).await.unwrap();
        framed.next().await.unwrap().unwrap();
        drop(framed);

        // The handler must wind down cleanly, not panic on the broken pipe.
        handler.await.unwrap();
    }
}
