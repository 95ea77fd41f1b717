//! Framed codec for the snapshot header exchange.
//!
//! Uses LengthDelimitedCodec for framing + serde_json for serialization.
//! Works over any AsyncRead/AsyncWrite (pipes, sockets, etc). Headers are
//! framed; the archive payload that follows them is raw bytes, recovered
//! from the framing machinery with [`Unframed`].

use std::io;
use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde::{Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, FramedParts, LengthDelimitedCodec};

/// Codec that frames messages with a length prefix and serializes with JSON.
///
/// Asymmetric on purpose: `Tx` is what this side sends, `Rx` what it
/// receives. The producer side of a stream instantiates the mirror image of
/// the consumer side, so a mismatched pairing fails to type-check instead of
/// failing on the wire.
pub struct FrameCodec<Tx, Rx> {
    inner: LengthDelimitedCodec,
    _phantom: PhantomData<(Tx, Rx)>,
}

impl<Tx, Rx> Default for FrameCodec<Tx, Rx> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Tx, Rx> FrameCodec<Tx, Rx> {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .new_codec(),
            _phantom: PhantomData,
        }
    }
}

impl<Tx, Rx: DeserializeOwned> Decoder for FrameCodec<Tx, Rx> {
    type Item = Rx;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => {
                let item = serde_json::from_slice(&bytes)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }
}

impl<Tx: Serialize, Rx> Encoder<Tx> for FrameCodec<Tx, Rx> {
    type Error = io::Error;

    fn encode(&mut self, item: Tx, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(frame_bytes = json.len(), "Encoding frame");
        self.inner.encode(Bytes::from(json), dst)
    }
}

/// Reunites a dismantled `Framed` transport with its buffered read-ahead.
///
/// The decoder reads from the underlying stream eagerly, so by the time the
/// final header frame is parsed the read buffer may already hold the first
/// bytes of the raw payload. `Unframed` replays that residue before touching
/// the stream again. Callers must flush the framed sink before dismantling
/// it; buffered writes are not carried over.
pub struct Unframed<T> {
    residue: BytesMut,
    io: T,
}

impl<T> Unframed<T> {
    pub fn from_parts<U>(parts: FramedParts<T, U>) -> Self {
        debug_assert!(parts.write_buf.is_empty(), "unflushed frames discarded");
        Self {
            residue: parts.read_buf,
            io: parts.io,
        }
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for Unframed<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.residue.is_empty() {
            let n = this.residue.len().min(buf.remaining());
            buf.put_slice(&this.residue.split_to(n));
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.io).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Unframed<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write(cx, data)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{SnapshotSaveRequest, SnapshotSaveResponse};
    use futures::{SinkExt, StreamExt};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_util::codec::Framed;

    type ClientCodec = FrameCodec<SnapshotSaveRequest, SnapshotSaveResponse>;
    type ServerCodec = FrameCodec<SnapshotSaveResponse, SnapshotSaveRequest>;

    #[test]
    fn mirrored_codecs_roundtrip_a_request() {
        let mut client = ClientCodec::new();
        let mut server = ServerCodec::new();
        let mut buf = BytesMut::new();

        let req = SnapshotSaveRequest {
            region: "euw1".into(),
            ..Default::default()
        };
        client.encode(req.clone(), &mut buf).unwrap();
        let decoded = server.decode(&mut buf).unwrap().unwrap();

        assert_eq!(decoded, req);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_decodes_to_none() {
        let mut client = ClientCodec::new();
        let mut server = ServerCodec::new();
        let mut buf = BytesMut::new();

        client
            .encode(SnapshotSaveRequest::default(), &mut buf)
            .unwrap();
        buf.truncate(buf.len() - 1);

        assert!(server.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn malformed_frame_is_invalid_data() {
        let mut raw = LengthDelimitedCodec::builder()
            .length_field_length(4)
            .new_codec();
        let mut buf = BytesMut::new();
        raw.encode(Bytes::from_static(b"not json"), &mut buf).unwrap();

        let mut server = ServerCodec::new();
        let err = server.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn unframed_replays_read_ahead_before_the_stream() {
        let (near, mut far) = tokio::io::duplex(64 * 1024);

        // Header frame and raw payload written back to back, so the framed
        // reader's buffer swallows part of the payload.
        let mut producer = Framed::new(far, ServerCodec::new());
        producer
            .send(SnapshotSaveResponse::ok("sha-256=abc123"))
            .await
            .unwrap();
        far = producer.into_parts().io;
        far.write_all(b"ARCHIVE BYTES").await.unwrap();
        drop(far);

        let mut consumer = Framed::new(near, ClientCodec::new());
        let header = consumer.next().await.unwrap().unwrap();
        assert_eq!(header.snapshot_checksum, "sha-256=abc123");

        let mut rest = Unframed::from_parts(consumer.into_parts());
        let mut payload = Vec::new();
        rest.read_to_end(&mut payload).await.unwrap();
        assert_eq!(payload, b"ARCHIVE BYTES");
    }
}
