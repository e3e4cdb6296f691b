//! HTTP front-end for the key-value store.
//!
//! Writes are accepted only by the leader; other nodes redirect to it when
//! its HTTP address is known. Reads are served from the local store.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::error::{RaftError, Result};
use crate::kv::{KvCommand, KvStore};
use crate::raft::{NodeStatus, RaftNode};
use crate::transport::RpcStatsSnapshot;

#[derive(Clone)]
pub struct ApiState {
    pub raft_node: Arc<RaftNode>,
    pub store: Arc<KvStore>,
}

#[derive(Serialize)]
struct ValueResponse {
    key: String,
    value: String,
}

#[derive(Deserialize)]
struct PutParams {
    value: String,
}

#[derive(Serialize)]
struct AcceptedResponse {
    index: u64,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct ClusterStatusResponse {
    #[serde(flatten)]
    node: NodeStatus,
    rpc: RpcStatsSnapshot,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/key/:key", get(get_key).put(put_key).delete(delete_key))
        .route("/cluster/status", get(cluster_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the API on `addr` until `shutdown` fires.
pub async fn run_api(addr: SocketAddr, state: ApiState, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "HTTP API listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn get_key(State(state): State<ApiState>, Path(key): Path<String>) -> Response {
    match state.store.get(&key) {
        Some(value) => Json(ValueResponse { key, value }).into_response(),
        None => error(StatusCode::NOT_FOUND, format!("key {key} not found")),
    }
}

async fn put_key(
    State(state): State<ApiState>,
    Path(key): Path<String>,
    Query(params): Query<PutParams>,
    uri: Uri,
) -> Response {
    submit(&state, KvCommand::set(key, params.value), &uri).await
}

async fn delete_key(
    State(state): State<ApiState>,
    Path(key): Path<String>,
    uri: Uri,
) -> Response {
    submit(&state, KvCommand::delete(key), &uri).await
}

async fn cluster_status(State(state): State<ApiState>) -> Json<ClusterStatusResponse> {
    Json(ClusterStatusResponse {
        node: state.raft_node.status().await,
        rpc: state.raft_node.rpc_stats(),
    })
}

/// Propose a command. 202 once it is in the leader's log; it may not be
/// committed yet.
async fn submit(state: &ApiState, command: KvCommand, uri: &Uri) -> Response {
    let payload = match command.encode() {
        Ok(payload) => payload,
        Err(e) => return error(StatusCode::BAD_REQUEST, e.to_string()),
    };

    match state.raft_node.propose(payload).await {
        Ok(index) => (StatusCode::ACCEPTED, Json(AcceptedResponse { index })).into_response(),
        Err(RaftError::NotLeader(leader)) => redirect_to_leader(state, leader, uri),
        Err(RaftError::Shutdown) => error(StatusCode::SERVICE_UNAVAILABLE, "node is shutting down"),
        Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

fn redirect_to_leader(state: &ApiState, leader: Option<u64>, uri: &Uri) -> Response {
    let leader_http = leader.and_then(|id| {
        state
            .raft_node
            .config()
            .peer(id)
            .and_then(|peer| peer.http_addr.clone())
    });

    match leader_http {
        Some(addr) => {
            let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
            let location = format!("http://{addr}{path}");
            tracing::debug!(leader = ?leader, location = %location, "Redirecting write to leader");
            (StatusCode::TEMPORARY_REDIRECT, [(header::LOCATION, location)]).into_response()
        }
        None => error(
            StatusCode::SERVICE_UNAVAILABLE,
            match leader {
                Some(id) => format!("leader is node {id}, address unknown"),
                None => "no known leader".to_string(),
            },
        ),
    }
}

fn error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NodeConfig, PeerConfig};
    use crate::transport::LocalNetwork;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    fn api_state(config: NodeConfig) -> ApiState {
        let network = LocalNetwork::new();
        let store = Arc::new(KvStore::new());
        let raft_node = Arc::new(
            RaftNode::new(config.clone(), network.transport(config.node_id), store.clone()).unwrap(),
        );
        network.register(&raft_node);
        ApiState { raft_node, store }
    }

    async fn send(state: &ApiState, method: &str, uri: &str) -> Response {
        router(state.clone())
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn wait_until_leader(node: &RaftNode) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !node.is_leader().await {
            assert!(tokio::time::Instant::now() < deadline, "node never became leader");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_put_then_get_on_single_node() {
        let state = api_state(NodeConfig::default());
        state.raft_node.start();
        wait_until_leader(&state.raft_node).await;

        let response = send(&state, "PUT", "/key/color?value=blue").await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let index = json_body(response).await["index"].as_u64().unwrap();
        assert!(index >= 2, "index {index} should follow the leader no-op");

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while state.store.get("color").is_none() {
            assert!(tokio::time::Instant::now() < deadline, "write never applied");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let response = send(&state, "GET", "/key/color").await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["value"], "blue");

        let response = send(&state, "DELETE", "/key/color").await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        state.raft_node.stop().await;
    }

    #[tokio::test]
    async fn test_missing_key_is_404() {
        let state = api_state(NodeConfig::default());
        let response = send(&state, "GET", "/key/nothing").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_write_without_leader_is_503() {
        let config = NodeConfig::default().with_peer(2, "127.0.0.1:1".into());
        let state = api_state(config);
        let response = send(&state, "PUT", "/key/a?value=1").await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_write_on_follower_redirects_to_leader() {
        let mut config = NodeConfig::default();
        config.peers.push(PeerConfig {
            node_id: 2,
            addr: "127.0.0.1:9091".into(),
            http_addr: Some("127.0.0.1:8082".into()),
        });
        let state = api_state(config);
        state.raft_node.state.lock().await.leader_id = Some(2);

        let response = send(&state, "PUT", "/key/a?value=1").await;
        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(
            response.headers()[header::LOCATION],
            "http://127.0.0.1:8082/key/a?value=1"
        );
    }

    #[tokio::test]
    async fn test_cluster_status_reports_node_and_counters() {
        let state = api_state(NodeConfig::default());
        let response = send(&state, "GET", "/cluster/status").await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        assert_eq!(body["node_id"], 1);
        assert_eq!(body["role"], "follower");
        assert_eq!(body["current_term"], 0);
        assert_eq!(body["rpc"]["append_entries"]["requests"], 0);
    }
}
