//! Administrative collaborators consumed by the gateway
//!
//! The gateway does not own connection, policy or status persistence. It reads
//! and writes them through the traits in this module. [`InMemoryDirectory`]
//! implements all three and backs tests and config-file driven deployments.

use async_trait::async_trait;
use dashmap::DashMap;
use gatelink_proto::{AgentMetadata, AgentMode, ConnectionType, GuardrailRuleSet};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("directory backend error: {0}")]
    Backend(String),

    #[error("not found: {0}")]
    NotFound(String),
}

fn default_true() -> bool {
    true
}

/// A logical connection as configured by administrators
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub id: String,
    #[serde(default)]
    pub org_id: String,
    pub name: String,
    pub agent_id: String,
    #[serde(default)]
    pub agent_name: String,
    #[serde(default)]
    pub agent_mode: AgentMode,
    #[serde(rename = "type")]
    pub connection_type: String,
    #[serde(default)]
    pub subtype: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_true")]
    pub access_mode_connect: bool,
    #[serde(default = "default_true")]
    pub access_mode_exec: bool,
    #[serde(default)]
    pub guardrail_input_rules: Vec<GuardrailRuleSet>,
    #[serde(default)]
    pub guardrail_output_rules: Vec<GuardrailRuleSet>,
}

impl Default for ConnectionRecord {
    fn default() -> Self {
        Self {
            id: String::new(),
            org_id: String::new(),
            name: String::new(),
            agent_id: String::new(),
            agent_name: String::new(),
            agent_mode: AgentMode::default(),
            connection_type: String::new(),
            subtype: String::new(),
            command: Vec::new(),
            env_vars: HashMap::new(),
            tags: Vec::new(),
            access_mode_connect: true,
            access_mode_exec: true,
            guardrail_input_rules: Vec::new(),
            guardrail_output_rules: Vec::new(),
        }
    }
}

impl ConnectionRecord {
    pub fn effective_type(&self) -> ConnectionType {
        ConnectionType::from_type_subtype(&self.connection_type, &self.subtype)
    }
}

/// Configuration of one interception plugin for a set of connections
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Plugin name (`access_control`, `review`, `jit`, `dlp`, `audit`, `guardrails`)
    pub name: String,
    /// Connection names the plugin applies to
    #[serde(default)]
    pub connections: Vec<String>,
    /// Default plugin configuration
    #[serde(default)]
    pub config: Vec<String>,
    /// Per user-group configuration, preferred over `config` for members
    #[serde(default)]
    pub group_config: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LivenessStatus {
    Online,
    Offline,
}

/// Lookup of connections by name or ID
#[async_trait]
pub trait ConnectionDirectory: Send + Sync {
    async fn get_connection(
        &self,
        org_id: &str,
        name_or_id: &str,
    ) -> Result<Option<ConnectionRecord>, DirectoryError>;
}

/// Ordered plugin configuration per organization
#[async_trait]
pub trait PolicySource: Send + Sync {
    async fn policies(&self, org_id: &str) -> Result<Vec<PolicyConfig>, DirectoryError>;
}

/// Persistence of the online/offline status shown to administrators
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn update_agent_status(
        &self,
        org_id: &str,
        agent_id: &str,
        status: LivenessStatus,
        metadata: Option<&AgentMetadata>,
    ) -> Result<(), DirectoryError>;

    async fn update_connection_status(
        &self,
        org_id: &str,
        connection_name: &str,
        status: LivenessStatus,
    ) -> Result<(), DirectoryError>;

    /// Mark every agent and connection offline, returning how many changed
    async fn set_all_offline(&self) -> Result<usize, DirectoryError>;
}

/// Directory, policy source and status sink held in memory
#[derive(Clone, Default)]
pub struct InMemoryDirectory {
    connections: Arc<DashMap<(String, String), ConnectionRecord>>,
    policies: Arc<DashMap<String, Vec<PolicyConfig>>>,
    agent_status: Arc<DashMap<(String, String), LivenessStatus>>,
    connection_status: Arc<DashMap<(String, String), LivenessStatus>>,
    agent_metadata: Arc<DashMap<(String, String), AgentMetadata>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_connection(&self, connection: ConnectionRecord) {
        let key = (connection.org_id.clone(), connection.name.clone());
        self.connections.insert(key, connection);
    }

    pub fn set_policies(&self, org_id: &str, policies: Vec<PolicyConfig>) {
        self.policies.insert(org_id.to_string(), policies);
    }

    pub fn agent_status(&self, org_id: &str, agent_id: &str) -> Option<LivenessStatus> {
        self.agent_status
            .get(&(org_id.to_string(), agent_id.to_string()))
            .map(|s| *s)
    }

    pub fn connection_status(&self, org_id: &str, name: &str) -> Option<LivenessStatus> {
        self.connection_status
            .get(&(org_id.to_string(), name.to_string()))
            .map(|s| *s)
    }

    pub fn agent_metadata(&self, org_id: &str, agent_id: &str) -> Option<AgentMetadata> {
        self.agent_metadata
            .get(&(org_id.to_string(), agent_id.to_string()))
            .map(|m| m.clone())
    }
}

#[async_trait]
impl ConnectionDirectory for InMemoryDirectory {
    async fn get_connection(
        &self,
        org_id: &str,
        name_or_id: &str,
    ) -> Result<Option<ConnectionRecord>, DirectoryError> {
        if let Some(conn) = self
            .connections
            .get(&(org_id.to_string(), name_or_id.to_string()))
        {
            return Ok(Some(conn.clone()));
        }
        Ok(self
            .connections
            .iter()
            .find(|entry| entry.org_id == org_id && entry.id == name_or_id)
            .map(|entry| entry.value().clone()))
    }
}

#[async_trait]
impl PolicySource for InMemoryDirectory {
    async fn policies(&self, org_id: &str) -> Result<Vec<PolicyConfig>, DirectoryError> {
        Ok(self
            .policies
            .get(org_id)
            .map(|p| p.clone())
            .unwrap_or_default())
    }
}

#[async_trait]
impl StatusSink for InMemoryDirectory {
    async fn update_agent_status(
        &self,
        org_id: &str,
        agent_id: &str,
        status: LivenessStatus,
        metadata: Option<&AgentMetadata>,
    ) -> Result<(), DirectoryError> {
        let key = (org_id.to_string(), agent_id.to_string());
        if let Some(meta) = metadata {
            self.agent_metadata.insert(key.clone(), meta.clone());
        }
        debug!(org_id, agent_id, ?status, "Updated agent status");
        self.agent_status.insert(key, status);
        Ok(())
    }

    async fn update_connection_status(
        &self,
        org_id: &str,
        connection_name: &str,
        status: LivenessStatus,
    ) -> Result<(), DirectoryError> {
        debug!(org_id, connection_name, ?status, "Updated connection status");
        self.connection_status
            .insert((org_id.to_string(), connection_name.to_string()), status);
        Ok(())
    }

    async fn set_all_offline(&self) -> Result<usize, DirectoryError> {
        let mut changed = 0;
        for mut entry in self.agent_status.iter_mut() {
            if *entry != LivenessStatus::Offline {
                *entry = LivenessStatus::Offline;
                changed += 1;
            }
        }
        for mut entry in self.connection_status.iter_mut() {
            if *entry != LivenessStatus::Offline {
                *entry = LivenessStatus::Offline;
                changed += 1;
            }
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection(org: &str, id: &str, name: &str) -> ConnectionRecord {
        ConnectionRecord {
            id: id.into(),
            org_id: org.into(),
            name: name.into(),
            agent_id: "agent-1".into(),
            connection_type: "database".into(),
            subtype: "postgres".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_lookup_by_name_or_id() {
        let dir = InMemoryDirectory::new();
        dir.add_connection(connection("org-1", "c-1", "prod-db"));

        let by_name = dir.get_connection("org-1", "prod-db").await.unwrap();
        let by_id = dir.get_connection("org-1", "c-1").await.unwrap();
        assert_eq!(by_name, by_id);
        assert!(dir.get_connection("org-2", "prod-db").await.unwrap().is_none());
        assert_eq!(by_name.unwrap().effective_type(), ConnectionType::Postgres);
    }

    #[tokio::test]
    async fn test_set_all_offline() {
        let dir = InMemoryDirectory::new();
        dir.update_agent_status("org-1", "a-1", LivenessStatus::Online, None)
            .await
            .unwrap();
        dir.update_agent_status("org-1", "a-2", LivenessStatus::Offline, None)
            .await
            .unwrap();
        dir.update_connection_status("org-1", "prod-db", LivenessStatus::Online)
            .await
            .unwrap();

        assert_eq!(dir.set_all_offline().await.unwrap(), 2);
        assert_eq!(dir.agent_status("org-1", "a-1"), Some(LivenessStatus::Offline));
        assert_eq!(
            dir.connection_status("org-1", "prod-db"),
            Some(LivenessStatus::Offline)
        );
    }

    #[test]
    fn test_connection_record_yaml_defaults() {
        let raw = r#"{"id":"c-1","name":"shell","agent_id":"a-1","type":"custom"}"#;
        let conn: ConnectionRecord = serde_json::from_str(raw).unwrap();
        assert!(conn.access_mode_connect);
        assert!(conn.access_mode_exec);
        assert_eq!(conn.agent_mode, AgentMode::Standard);
        assert_eq!(conn.effective_type(), ConnectionType::CommandLine);
    }
}
