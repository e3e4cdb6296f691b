use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::NodeConfig;
use crate::error::{RaftError, Result};
use crate::raft::message::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    RpcRequest, RpcResponse, VoteRequest, VoteResponse,
};
use crate::raft::RaftNode;
use crate::transport::Transport;

/// Upper bound on a single frame; snapshots travel in one frame.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Write one frame: a big-endian `u32` length followed by the bincode body.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = bincode::serialize(message)?;
    if bytes.len() > MAX_FRAME_LEN {
        return Err(RaftError::Codec(format!(
            "frame of {} bytes exceeds limit",
            bytes.len()
        )));
    }
    writer.write_u32(bytes.len() as u32).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. `None` means the peer closed the stream between frames.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_LEN {
        return Err(RaftError::Codec(format!("frame of {len} bytes exceeds limit")));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(bincode::deserialize(&buf)?))
}

/// Client side: one short-lived connection per request.
pub struct TcpTransport {
    peers: HashMap<u64, String>,
}

impl TcpTransport {
    pub fn new(peers: HashMap<u64, String>) -> Self {
        Self { peers }
    }

    pub fn from_config(config: &NodeConfig) -> Self {
        Self::new(
            config
                .peers
                .iter()
                .map(|p| (p.node_id, p.addr.clone()))
                .collect(),
        )
    }

    async fn call(&self, peer: u64, request: RpcRequest) -> Result<RpcResponse> {
        let addr = self.peers.get(&peer).ok_or(RaftError::Unreachable(peer))?;
        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(|e| RaftError::Transport(format!("connect to {addr}: {e}")))?;
        stream.set_nodelay(true)?;

        write_frame(&mut stream, &request).await?;
        read_frame(&mut stream)
            .await?
            .ok_or_else(|| RaftError::Transport(format!("{addr} closed the connection")))
    }
}

fn unexpected(peer: u64) -> RaftError {
    RaftError::Transport(format!("peer {peer} answered with the wrong response kind"))
}

#[async_trait]
impl Transport for TcpTransport {
    async fn request_vote(&self, peer: u64, req: VoteRequest) -> Result<VoteResponse> {
        match self.call(peer, RpcRequest::RequestVote(req)).await? {
            RpcResponse::RequestVote(resp) => Ok(resp),
            _ => Err(unexpected(peer)),
        }
    }

    async fn append_entries(
        &self,
        peer: u64,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        match self.call(peer, RpcRequest::AppendEntries(req)).await? {
            RpcResponse::AppendEntries(resp) => Ok(resp),
            _ => Err(unexpected(peer)),
        }
    }

    async fn install_snapshot(
        &self,
        peer: u64,
        req: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        match self.call(peer, RpcRequest::InstallSnapshot(req)).await? {
            RpcResponse::InstallSnapshot(resp) => Ok(resp),
            _ => Err(unexpected(peer)),
        }
    }
}

/// Route a decoded request to the node's handler.
pub async fn dispatch(node: &RaftNode, request: RpcRequest) -> RpcResponse {
    match request {
        RpcRequest::RequestVote(req) => RpcResponse::RequestVote(node.handle_request_vote(req).await),
        RpcRequest::AppendEntries(req) => {
            RpcResponse::AppendEntries(node.handle_append_entries(req).await)
        }
        RpcRequest::InstallSnapshot(req) => {
            RpcResponse::InstallSnapshot(node.handle_install_snapshot(req).await)
        }
    }
}

/// Accept peer connections until `shutdown` fires or the node stops, then
/// wait for every open connection to finish.
pub async fn serve_rpc(
    listener: TcpListener,
    node: Arc<RaftNode>,
    shutdown: CancellationToken,
) -> Result<()> {
    tracing::info!(
        node_id = node.id,
        addr = %listener.local_addr()?,
        "Raft RPC server listening"
    );

    let connections = TaskTracker::new();
    loop {
        let (stream, remote) = tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = node.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to accept RPC connection");
                    continue;
                }
            },
        };

        let node = Arc::clone(&node);
        let shutdown = shutdown.clone();
        connections.spawn(async move {
            if let Err(e) = serve_connection(stream, &node, shutdown).await {
                tracing::debug!(remote = %remote, error = %e, "RPC connection closed with error");
            }
        });
    }

    drop(listener);
    connections.close();
    connections.wait().await;
    tracing::info!(node_id = node.id, "Raft RPC server stopped");
    Ok(())
}

async fn serve_connection(
    mut stream: TcpStream,
    node: &RaftNode,
    shutdown: CancellationToken,
) -> Result<()> {
    stream.set_nodelay(true)?;
    loop {
        let request: RpcRequest = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = node.shutdown.cancelled() => return Ok(()),
            frame = read_frame(&mut stream) => match frame? {
                Some(request) => request,
                None => return Ok(()),
            },
        };
        // A stopped node answers nothing; the caller sees a closed stream
        if node.is_stopped() {
            return Ok(());
        }
        let response = dispatch(node, request).await;
        write_frame(&mut stream, &response).await?;
    }
}
