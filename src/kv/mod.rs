//! Replicated key-value store built on the Raft log.

pub mod command;
pub mod store;

pub use command::KvCommand;
pub use store::KvStore;
