//! Gateway configuration

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::directory::{ConnectionRecord, InMemoryDirectory, PolicyConfig};
use crate::plugins::{
    AccessControlPlugin, AuditPlugin, AuditSink, DlpPlugin, GuardrailsPlugin, PluginRegistry,
    ReviewPlugin, ReviewStore,
};

/// Runtime settings of a gateway process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Address agents and clients connect to
    pub listen_addr: SocketAddr,
    /// Base URL used in review links sent to clients
    pub api_url: String,
    pub max_session_duration_secs: u64,
    pub session_sweep_interval_secs: u64,
    pub liveness_interval_secs: u64,
    pub liveness_grace_secs: u64,
    pub open_timeout_secs: u64,
    /// Access granted by a JIT review that does not ask for a duration
    pub default_jit_duration_secs: u64,
    pub directory: DirectoryConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8010)),
            api_url: "http://127.0.0.1:8009/api".to_string(),
            max_session_duration_secs: 48 * 60 * 60,
            session_sweep_interval_secs: 15 * 60,
            liveness_interval_secs: 5,
            liveness_grace_secs: 5,
            open_timeout_secs: 15,
            default_jit_duration_secs: 30 * 60,
            directory: DirectoryConfig::default(),
        }
    }
}

impl GatewayConfig {
    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    pub fn with_max_session_duration(mut self, duration: Duration) -> Self {
        self.max_session_duration_secs = duration.as_secs();
        self
    }

    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout_secs = timeout.as_secs();
        self
    }

    pub fn with_directory(mut self, directory: DirectoryConfig) -> Self {
        self.directory = directory;
        self
    }

    pub fn max_session_duration(&self) -> Duration {
        Duration::from_secs(self.max_session_duration_secs)
    }

    pub fn session_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.session_sweep_interval_secs.max(1))
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_secs(self.liveness_interval_secs.max(1))
    }

    pub fn liveness_grace(&self) -> Duration {
        Duration::from_secs(self.liveness_grace_secs)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.open_timeout_secs)
    }

    pub fn default_jit_duration(&self) -> Duration {
        Duration::from_secs(self.default_jit_duration_secs)
    }
}

/// Connections and policies loaded from the configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    pub connections: Vec<ConnectionRecord>,
    /// Ordered policies per organization ID
    pub policies: HashMap<String, Vec<PolicyConfig>>,
}

impl DirectoryConfig {
    pub fn into_directory(self) -> InMemoryDirectory {
        let directory = InMemoryDirectory::new();
        for connection in self.connections {
            directory.add_connection(connection);
        }
        for (org_id, policies) in self.policies {
            directory.set_policies(&org_id, policies);
        }
        directory
    }
}

/// Registry with every built-in plugin
pub fn default_plugins(
    config: &GatewayConfig,
    reviews: Arc<dyn ReviewStore>,
    audit: Arc<dyn AuditSink>,
) -> PluginRegistry {
    PluginRegistry::new()
        .with(Arc::new(AccessControlPlugin::new()))
        .with(Arc::new(ReviewPlugin::one_time(reviews.clone(), &config.api_url)))
        .with(Arc::new(ReviewPlugin::jit(
            reviews,
            &config.api_url,
            config.default_jit_duration(),
        )))
        .with(Arc::new(GuardrailsPlugin::new()))
        .with(Arc::new(DlpPlugin::new()))
        .with(Arc::new(AuditPlugin::new(audit)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::ConnectionDirectory;
    use crate::plugins::{InMemoryReviewStore, MemoryAuditLog, PLUGIN_JIT, PLUGIN_REVIEW};

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: GatewayConfig =
            serde_json::from_str(r#"{"listen_addr":"127.0.0.1:9000"}"#).unwrap();
        assert_eq!(config.listen_addr.port(), 9000);
        assert_eq!(config.max_session_duration(), Duration::from_secs(48 * 3600));
        assert_eq!(config.session_sweep_interval(), Duration::from_secs(900));
        assert_eq!(config.open_timeout(), Duration::from_secs(15));
    }

    #[tokio::test]
    async fn test_directory_config_loads_connections() {
        let config = DirectoryConfig {
            connections: vec![ConnectionRecord {
                id: "c-1".into(),
                org_id: "org-1".into(),
                name: "prod-db".into(),
                agent_id: "a-1".into(),
                connection_type: "database".into(),
                subtype: "postgres".into(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let directory = config.into_directory();
        assert!(directory
            .get_connection("org-1", "prod-db")
            .await
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_default_plugins_registered() {
        let registry = default_plugins(
            &GatewayConfig::default(),
            Arc::new(InMemoryReviewStore::new()),
            Arc::new(MemoryAuditLog::new()),
        );
        for name in ["access_control", PLUGIN_REVIEW, PLUGIN_JIT, "guardrails", "dlp", "audit"] {
            assert!(registry.get(name).is_some(), "missing plugin {}", name);
        }
    }
}
