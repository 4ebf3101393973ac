//! Routing identity of an agent stream

use sha2::{Digest, Sha256};
use std::fmt;

/// Key addressing a reachable agent stream.
///
/// Single-connection agents are addressed by their raw agent ID. An agent in
/// multi-connection mode opens one stream per logical connection, so those
/// streams are addressed by a hash of the agent ID and the connection name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamAgentId(String);

impl StreamAgentId {
    pub fn new(agent_id: &str, connection_name: &str) -> Self {
        if connection_name.is_empty() {
            return Self(agent_id.to_string());
        }
        let digest = Sha256::digest(format!("{}:{}", agent_id, connection_name).as_bytes());
        let hex = digest.iter().map(|b| format!("{:02x}", b)).collect::<String>();
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamAgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
