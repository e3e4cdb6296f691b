use serde::{Deserialize, Serialize};

use crate::error::{RaftError, Result};

/// Current command encoding version.
pub const COMMAND_VERSION: u32 = 1;

/// A mutation of the key-value map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum KvCommand {
    Set { key: String, value: String },
    Delete { key: String },
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    v: u32,
    #[serde(flatten)]
    command: KvCommand,
}

impl KvCommand {
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        KvCommand::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        KvCommand::Delete { key: key.into() }
    }

    /// Encode as a versioned JSON envelope, e.g.
    /// `{"v":1,"op":"set","key":"k","value":"v"}`.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&Envelope {
            v: COMMAND_VERSION,
            command: self.clone(),
        })?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let envelope: Envelope = serde_json::from_slice(bytes)?;
        if envelope.v != COMMAND_VERSION {
            return Err(RaftError::Codec(format!(
                "unsupported command version {}",
                envelope.v
            )));
        }
        Ok(envelope.command)
    }
}
