use crate::error::Result;

/// Application state driven by committed log entries.
///
/// `apply` is called from a single task, once per committed index, in
/// increasing index order. Commands are opaque bytes to the consensus layer.
pub trait StateMachine: Send + Sync {
    fn apply(&self, index: u64, command: &[u8]) -> Result<()>;

    /// Serialize the state reached by every `apply` so far.
    fn snapshot(&self) -> Result<Vec<u8>>;

    /// Replace the whole state with a blob produced by `snapshot`.
    fn restore(&self, data: &[u8]) -> Result<()>;
}
