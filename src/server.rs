use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::api::{run_api, ApiState};
use crate::config::NodeConfig;
use crate::error::Result;
use crate::kv::KvStore;
use crate::raft::RaftNode;
use crate::transport::{serve_rpc, TcpTransport};

/// A full cluster member: Raft node, TCP RPC server and optional HTTP API.
pub struct Server {
    pub config: NodeConfig,
    pub raft_node: Arc<RaftNode>,
    pub store: Arc<KvStore>,
}

impl Server {
    pub fn new(config: NodeConfig) -> Result<Self> {
        let store = Arc::new(KvStore::new());
        let transport = Arc::new(TcpTransport::from_config(&config));
        let raft_node = Arc::new(RaftNode::new(config.clone(), transport, store.clone())?);

        Ok(Self {
            config,
            raft_node,
            store,
        })
    }

    /// Run every subsystem until `shutdown` fires:
    /// 1. Restores term, vote, the newest snapshot and the log tail (fatal if
    ///    unreadable)
    /// 2. Binds the RPC listener before the node starts talking to peers
    /// 3. Starts the Raft background tasks
    /// 4. Serves the HTTP API if an address is configured
    ///
    /// On shutdown both servers are drained first, so no RPC handler runs
    /// once the node is stopped.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        self.raft_node.recover().await?;

        let listener = TcpListener::bind(self.config.listen_addr).await?;
        self.raft_node.start();

        let rpc_server = tokio::spawn(serve_rpc(
            listener,
            self.raft_node.clone(),
            shutdown.clone(),
        ));

        let api_server = self.config.http_addr.map(|addr| {
            let state = ApiState {
                raft_node: self.raft_node.clone(),
                store: self.store.clone(),
            };
            tokio::spawn(run_api(addr, state, shutdown.clone()))
        });

        shutdown.cancelled().await;
        tracing::info!(node_id = self.config.node_id, "Shutting down");

        match rpc_server.await {
            Ok(Err(e)) => tracing::error!(error = %e, "RPC server failed"),
            Err(e) => tracing::error!(error = %e, "RPC server task panicked"),
            Ok(Ok(())) => {}
        }
        if let Some(api_server) = api_server {
            match api_server.await {
                Ok(Err(e)) => tracing::error!(error = %e, "HTTP API failed"),
                Err(e) => tracing::error!(error = %e, "HTTP API task panicked"),
                Ok(Ok(())) => {}
            }
        }
        self.raft_node.stop().await;
        Ok(())
    }
}
