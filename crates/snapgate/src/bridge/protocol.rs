//! Wire types spoken over the bridge pipe and the forwarding transport.
//!
//! Every frame is a JSON document inside a length-delimited envelope (see
//! [`super::codec`]). Requests flow from the bridge to the snapshot producer;
//! a single response header flows back, followed by the raw archive bytes.

use serde::{Deserialize, Serialize};

/// Method name of the streaming RPC that produces a cluster snapshot.
pub const SNAPSHOT_SAVE_METHOD: &str = "Operator.SnapshotSave";

/// Read-side options carried on every snapshot request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryOptions {
    /// Credential checked by the producer. Absent means anonymous.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    /// Permit serving from a non-authoritative node.
    #[serde(default)]
    pub allow_stale: bool,
}

/// Request header opening a snapshot stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSaveRequest {
    /// Target region; empty selects the producer's local region.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub region: String,
    #[serde(default)]
    pub query_options: QueryOptions,
}

/// Response header preceding the archive bytes.
///
/// A non-empty `error_msg` marks the operation failed regardless of
/// `error_code`; producers that report an error without a code get the
/// transport's generic failure classification downstream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSaveResponse {
    #[serde(default)]
    pub error_code: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_msg: String,
    /// Archive digest, e.g. `sha-256=af8...`. Only set on success.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub snapshot_checksum: String,
}

impl SnapshotSaveResponse {
    pub fn ok(checksum: impl Into<String>) -> Self {
        Self {
            snapshot_checksum: checksum.into(),
            ..Self::default()
        }
    }

    pub fn error(code: u16, message: impl Into<String>) -> Self {
        Self {
            error_code: code,
            error_msg: message.into(),
            ..Self::default()
        }
    }

    pub fn is_error(&self) -> bool {
        !self.error_msg.is_empty()
    }
}

/// First frame on a fresh streaming connection: names the RPC to route to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamingRpcHeader {
    pub method: String,
}

/// Acceptor's reply to the header frame. An empty error means the stream is
/// live and the named handler owns the connection from here on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamingRpcAck {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl StreamingRpcAck {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }
}
