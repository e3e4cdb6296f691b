pub mod api;
pub mod config;
pub mod error;
pub mod kv;
pub mod raft;
pub mod server;
pub mod shutdown;
pub mod snapshot;
pub mod state_machine;
pub mod transport;
