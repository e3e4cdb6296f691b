mod election;
pub mod log;
pub mod message;
pub mod node;
mod replication;
pub mod rpc;
pub mod state;
pub mod storage;
pub mod timer;

pub use log::{EntryKind, LogEntry, RaftLog};
pub use node::{NodeStatus, RaftNode};
pub use state::{RaftRole, RaftState};
pub use storage::{FileRaftStorage, HardState, MemoryRaftStorage, RaftStorage};
