use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::error::{RaftError, Result};
use crate::kv::command::KvCommand;
use crate::state_machine::StateMachine;

#[derive(Debug, Default, Serialize, Deserialize)]
struct KvState {
    data: BTreeMap<String, String>,
    last_applied: u64,
}

/// In-memory key-value map mutated by committed [`KvCommand`]s.
#[derive(Debug, Default)]
pub struct KvStore {
    inner: Mutex<KvState>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, KvState> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.state().data.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.state().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().data.is_empty()
    }

    pub fn entries(&self) -> Vec<(String, String)> {
        self.state()
            .data
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Index of the last command applied or restored.
    pub fn last_applied(&self) -> u64 {
        self.state().last_applied
    }
}

impl StateMachine for KvStore {
    fn apply(&self, index: u64, command: &[u8]) -> Result<()> {
        let mut state = self.state();
        state.last_applied = index;

        // A command that does not decode is skipped, so every node skips it
        let command = match KvCommand::decode(command) {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!(index, error = %e, "Skipping malformed command");
                return Ok(());
            }
        };

        match command {
            KvCommand::Set { key, value } => {
                tracing::trace!(index, key = %key, "SET");
                state.data.insert(key, value);
            }
            KvCommand::Delete { key } => {
                tracing::trace!(index, key = %key, "DELETE");
                state.data.remove(&key);
            }
        }
        Ok(())
    }

    fn snapshot(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&*self.state())
            .map_err(|e| RaftError::StateMachine(format!("encode snapshot: {e}")))
    }

    fn restore(&self, data: &[u8]) -> Result<()> {
        let restored: KvState = serde_json::from_slice(data)
            .map_err(|e| RaftError::StateMachine(format!("decode snapshot: {e}")))?;
        *self.state() = restored;
        Ok(())
    }
}
