//! HTTP route handlers.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::{
    Router,
    body::Body,
    extract::{Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Json, Response},
    routing::get,
};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_util::bytes::Bytes;
use tokio_util::sync::DropGuard;

use crate::agent::Agent;
use crate::bridge::protocol::{QueryOptions, SNAPSHOT_SAVE_METHOD, SnapshotSaveRequest};
use crate::bridge::{self, CodedError, SnapshotStream};

/// Response header carrying the archive digest, e.g. `sha-256=af8...`.
const DIGEST_HEADER: &str = "digest";

/// Query string accepted by the snapshot route.
#[derive(Debug, Default, Deserialize)]
pub struct SnapshotParams {
    #[serde(default)]
    region: Option<String>,
    /// Bare `?stale` means true, matching the usual consistency-flag idiom.
    #[serde(default)]
    stale: Option<String>,
    #[serde(default)]
    token: Option<String>,
}

fn stale_flag(raw: Option<&str>) -> bool {
    match raw {
        None => false,
        Some("") => true,
        Some(s) => s.parse().unwrap_or(false),
    }
}

#[derive(Debug, Serialize)]
struct HealthCheckResponse {
    ok: bool,
    role: &'static str,
}

async fn health_check(State(agent): State<Arc<Agent>>) -> Json<HealthCheckResponse> {
    Json(HealthCheckResponse {
        ok: true,
        role: agent.role_name().await,
    })
}

/// GET a cluster snapshot as a streamed archive.
///
/// The status line is decided by the bridge outcome when the operation fails
/// before any byte moves; once the stream opens, the response is committed
/// as a 200 with the digest header and failures can only surface as an
/// aborted body.
async fn save_snapshot(
    State(agent): State<Arc<Agent>>,
    Query(params): Query<SnapshotParams>,
) -> Response {
    let handler = match agent.streaming_rpc(SNAPSHOT_SAVE_METHOD).await {
        Ok(handler) => handler,
        Err(err) => return coded_response(&CodedError::internal(err.to_string())),
    };

    let request = SnapshotSaveRequest {
        region: params.region.unwrap_or_default(),
        query_options: QueryOptions {
            auth_token: params.token,
            allow_stale: stale_flag(params.stale.as_deref()),
        },
    };

    // Request-scoped disconnect signal. The guard travels into the response
    // body, so hyper dropping the body (client gone) or the agent shutting
    // down both tear the bridge pipe.
    let shutdown = agent.shutdown_token().child_token();
    let disconnect = shutdown.clone().drop_guard();

    let (stream_tx, stream_rx) = oneshot::channel();
    let bridge = tokio::spawn(bridge::save_snapshot(handler, request, shutdown, stream_tx));

    match stream_rx.await {
        Ok(stream) => snapshot_response(stream, disconnect),
        Err(_) => {
            // No stream opened, so the outcome tells the failure story.
            let outcome = match bridge.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(error = %e, "Snapshot bridge task died");
                    Err(CodedError::internal("snapshot bridge task died"))
                }
            };
            match outcome {
                Err(err) => coded_response(&err),
                Ok(()) => coded_response(&CodedError::internal("snapshot stream never opened")),
            }
        }
    }
}

fn coded_response(err: &CodedError) -> Response {
    let status = StatusCode::from_u16(err.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, err.message.clone()).into_response()
}

fn snapshot_response(stream: SnapshotStream, disconnect: DropGuard) -> Response {
    let SnapshotStream { checksum, body } = stream;
    let body = Body::from_stream(SnapshotBody {
        chunks: body,
        _disconnect: disconnect,
    });
    (
        StatusCode::OK,
        [
            (DIGEST_HEADER, checksum.as_str()),
            (header::CONTENT_TYPE.as_str(), "application/octet-stream"),
        ],
        body,
    )
        .into_response()
}

/// Response body fed by the bridge's relay worker.
///
/// An `Err` chunk makes hyper abort the connection mid-body, which is the
/// only honest signal left once the 200 is on the wire.
struct SnapshotBody {
    chunks: mpsc::Receiver<io::Result<Bytes>>,
    _disconnect: DropGuard,
}

impl Stream for SnapshotBody {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().chunks.poll_recv(cx)
    }
}

async fn invalid_method() -> Response {
    (StatusCode::METHOD_NOT_ALLOWED, "Invalid method").into_response()
}

pub fn routes(agent: Arc<Agent>) -> Router {
    Router::new()
        // axum folds HEAD into GET by default; the snapshot route allows GET
        // alone.
        .route("/v1/operator/snapshot", get(save_snapshot).head(invalid_method))
        .route("/v1/agent/health", get(health_check))
        .method_not_allowed_fallback(invalid_method)
        .with_state(agent)
}
