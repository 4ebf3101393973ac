//! Agent configuration

use gatelink_proto::{keys::header, AgentMetadata, AgentMode, ORIGIN_AGENT, PROTOCOL_VERSION};
use gatelink_transport::StreamHeaders;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Configuration for the agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Gateway address (host:port)
    pub gateway_addr: SocketAddr,
    pub org_id: String,
    /// Unique identifier for this agent
    pub agent_id: String,
    pub agent_name: String,
    pub mode: AgentMode,
    /// Connection served by this stream in multi-connection mode
    pub connection_name: String,
    pub keep_alive_interval_secs: u64,
    /// Deadline for dialing a native target
    pub dial_timeout_secs: u64,
    pub initial_backoff_secs: u64,
    pub max_backoff_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            gateway_addr: SocketAddr::from(([127, 0, 0, 1], 8010)),
            org_id: String::new(),
            agent_id: format!("agent-{}", uuid::Uuid::new_v4()),
            agent_name: String::new(),
            mode: AgentMode::Standard,
            connection_name: String::new(),
            keep_alive_interval_secs: 10,
            dial_timeout_secs: 10,
            initial_backoff_secs: 1,
            max_backoff_secs: 60,
        }
    }
}

impl AgentConfig {
    pub fn new(gateway_addr: SocketAddr, org_id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        let agent_id = agent_id.into();
        Self {
            gateway_addr,
            org_id: org_id.into(),
            agent_name: agent_id.clone(),
            agent_id,
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.agent_name = name.into();
        self
    }

    /// Serve a single connection over this stream
    pub fn with_connection(mut self, connection_name: impl Into<String>) -> Self {
        self.mode = AgentMode::MultiConnection;
        self.connection_name = connection_name.into();
        self
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_secs(self.keep_alive_interval_secs.max(1))
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs.max(1))
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_secs(self.initial_backoff_secs.max(1))
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs.max(self.initial_backoff_secs).max(1))
    }

    /// Handshake headers identifying this agent to the gateway
    pub fn headers(&self, metadata: &AgentMetadata) -> StreamHeaders {
        let mut headers = StreamHeaders::new()
            .with(header::ORIGIN, ORIGIN_AGENT)
            .with(header::PROTOCOL_VERSION, PROTOCOL_VERSION.to_string())
            .with(header::ORG_ID, self.org_id.as_str())
            .with(header::AGENT_ID, self.agent_id.as_str())
            .with(header::AGENT_NAME, self.agent_name.as_str())
            .with(header::AGENT_MODE, self.mode.as_str());
        if !self.connection_name.is_empty() {
            headers.insert(header::CONNECTION_NAME, self.connection_name.as_str());
        }
        for (key, value) in metadata.to_headers() {
            headers.insert(key, value);
        }
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headers_carry_identity_and_metadata() {
        let config = AgentConfig::new("127.0.0.1:8010".parse().unwrap(), "org-1", "a-1")
            .with_connection("prod-db");
        let metadata = AgentMetadata {
            hostname: "db-host".into(),
            ..Default::default()
        };
        let headers = config.headers(&metadata);

        assert_eq!(headers.origin(), Some(ORIGIN_AGENT));
        assert_eq!(headers.get(header::AGENT_NAME), Some("a-1"));
        assert_eq!(headers.get(header::AGENT_MODE), Some("multi-connection"));
        assert_eq!(headers.get(header::CONNECTION_NAME), Some("prod-db"));
        assert_eq!(headers.get(header::HOSTNAME), Some("db-host"));
    }

    #[test]
    fn test_backoff_bounds() {
        let config = AgentConfig::default();
        assert_eq!(config.initial_backoff(), Duration::from_secs(1));
        assert_eq!(config.max_backoff(), Duration::from_secs(60));
    }
}
