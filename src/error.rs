use thiserror::Error;

#[derive(Error, Debug)]
pub enum RaftError {
    #[error("Not the leader, current leader is node {0:?}")]
    NotLeader(Option<u64>),

    #[error("Log inconsistency")]
    LogInconsistency,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("RPC timed out")]
    Timeout,

    #[error("Peer {0} is unreachable")]
    Unreachable(u64),

    #[error("Snapshot write failed: {0}")]
    SnapshotWrite(String),

    #[error("Snapshot load failed: {0}")]
    SnapshotLoad(String),

    #[error("Snapshot not found at index {0}")]
    SnapshotNotFound(u64),

    #[error("Snapshot index {index} is not newer than latest snapshot {latest}")]
    StaleSnapshot { index: u64, latest: u64 },

    #[error("State machine error: {0}")]
    StateMachine(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Node is shutting down")]
    Shutdown,
}

impl RaftError {
    /// Errors that a background task absorbs and retries on its next cycle.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RaftError::Transport(_) | RaftError::Timeout | RaftError::Unreachable(_)
        )
    }
}

impl From<bincode::Error> for RaftError {
    fn from(e: bincode::Error) -> Self {
        RaftError::Codec(e.to_string())
    }
}

impl From<serde_json::Error> for RaftError {
    fn from(e: serde_json::Error) -> Self {
        RaftError::Codec(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RaftError>;
