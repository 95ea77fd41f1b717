//! Agent runtime state shared by every transport.
//!
//! An agent starts unconfigured (so the HTTP surface can come up first) and
//! is later given a role: serve snapshots from local cluster state, or
//! forward requests to a peer that can. The role decides which streaming
//! handler a snapshot request resolves to.

use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::bridge::protocol::SNAPSHOT_SAVE_METHOD;
use crate::rpc::forward::{Dialer, ForwardRpc};
use crate::rpc::operator::{SnapshotSaveRpc, SnapshotSource};
use crate::rpc::{ResolveError, StreamingRpc, StreamingRpcRegistry};

/// How this node answers snapshot requests.
pub enum Role {
    /// No producer and no route configured yet.
    Unconfigured,
    /// Node holds cluster state and serves snapshots itself.
    Server(Arc<StreamingRpcRegistry>),
    /// Node relays streaming rpcs to a serving peer over `Dialer`.
    Client(Arc<dyn Dialer>),
}

impl Role {
    fn name(&self) -> &'static str {
        match self {
            Role::Unconfigured => "unconfigured",
            Role::Server(_) => "server",
            Role::Client(_) => "client",
        }
    }
}

/// Created with [`new`](Self::new), then given a role once the cluster side
/// is up. Transports only ever borrow it through an `Arc`.
pub struct Agent {
    role: RwLock<Role>,
    shutdown: CancellationToken,
}

impl Default for Agent {
    fn default() -> Self {
        Self::new()
    }
}

impl Agent {
    pub fn new() -> Self {
        Self {
            role: RwLock::new(Role::Unconfigured),
            shutdown: CancellationToken::new(),
        }
    }

    /// Take the server role: snapshot requests are served from `source`.
    pub async fn set_server(&self, source: Arc<dyn SnapshotSource>) {
        let registry = Arc::new(StreamingRpcRegistry::new().with_handler(
            SNAPSHOT_SAVE_METHOD,
            Arc::new(SnapshotSaveRpc::new(source)),
        ));
        *self.role.write().await = Role::Server(registry);
        tracing::info!("Agent serving snapshots from local state");
    }

    /// Take the client role: snapshot requests are forwarded through `dialer`.
    pub async fn set_client(&self, dialer: Arc<dyn Dialer>) {
        *self.role.write().await = Role::Client(dialer);
        tracing::info!("Agent forwarding snapshots to a serving peer");
    }

    /// Resolve the handler that will serve one streaming rpc.
    ///
    /// Servers look the method up locally; clients mint a forwarder that
    /// carries the method to a serving peer. The role is snapshotted here and
    /// stays fixed for the rest of the request even if it is swapped out
    /// underneath.
    pub async fn streaming_rpc(&self, method: &str) -> Result<Arc<dyn StreamingRpc>, ResolveError> {
        match &*self.role.read().await {
            Role::Server(registry) => registry.resolve(method),
            Role::Client(dialer) => Ok(Arc::new(ForwardRpc::new(method, Arc::clone(dialer)))),
            Role::Unconfigured => Err(ResolveError::Misconfigured),
        }
    }

    /// Registry for inbound peer streams; `None` unless serving locally.
    pub async fn streaming_registry(&self) -> Option<Arc<StreamingRpcRegistry>> {
        match &*self.role.read().await {
            Role::Server(registry) => Some(Arc::clone(registry)),
            _ => None,
        }
    }

    pub async fn role_name(&self) -> &'static str {
        self.role.read().await.name()
    }

    /// Token that fires on shutdown. Request-scoped work hangs children off
    /// this so an exiting agent abandons in-flight streams.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn trigger_shutdown(&self) {
        self.shutdown.cancel();
    }
}
