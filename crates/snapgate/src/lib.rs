//! snapgate: HTTP gateway for streaming cluster snapshot archives.

pub mod agent;
pub mod bridge;
pub mod pipe;
pub mod rpc;
pub mod trace;
pub mod transport;

pub use agent::{Agent, Role};

pub use bridge::{
    CodedError, SnapshotStream, save_snapshot,
    protocol::{
        QueryOptions, SNAPSHOT_SAVE_METHOD, SnapshotSaveRequest, SnapshotSaveResponse,
        StreamingRpcAck, StreamingRpcHeader,
    },
};

pub use rpc::{
    Dialer, ForwardRpc, RawIo, ResolveError, SnapshotArchive, SnapshotError, SnapshotSaveRpc,
    SnapshotSource, StreamingRpc, StreamingRpcRegistry,
};
pub use trace::init_tracing;
pub use transport::{ServerConfig, serve};
