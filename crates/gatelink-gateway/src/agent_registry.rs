//! Agent registry for tracking connected agent streams
//!
//! At most one live stream is held per [`StreamAgentId`]. A second agent
//! presenting the same identity is rejected instead of replacing the first, so
//! packets for a connection are never delivered to two agents. Removing an
//! agent closes every proxy session bound to it.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use gatelink_proto::keys::header;
use gatelink_proto::{AgentMetadata, AgentMode, StreamAgentId};
use gatelink_transport::{SharedStream, StreamHeaders};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::directory::{ConnectionDirectory, DirectoryError};
use crate::liveness::LivenessReconciler;
use crate::proxy_registry::ProxyRegistry;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid agent identity: {0}")]
    InvalidIdentity(String),

    #[error("connection {0} not found")]
    ConnectionNotFound(String),

    #[error("connection {connection} is not bound to agent {agent_id}")]
    ConnectionNotBound { connection: String, agent_id: String },

    #[error("agent already connected")]
    AlreadyConnected,

    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

/// Identity an agent declares in its stream headers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentIdentity {
    pub org_id: String,
    pub agent_id: String,
    pub agent_name: String,
    pub mode: AgentMode,
    /// Connection served by a multi-connection agent stream
    pub connection_name: String,
}

impl AgentIdentity {
    pub fn from_headers(headers: &StreamHeaders) -> Self {
        Self {
            org_id: headers.get_or_default(header::ORG_ID),
            agent_id: headers.get_or_default(header::AGENT_ID),
            agent_name: headers.get_or_default(header::AGENT_NAME),
            mode: AgentMode::parse(headers.get(header::AGENT_MODE).unwrap_or_default()),
            connection_name: headers.get_or_default(header::CONNECTION_NAME),
        }
    }

    pub fn validate(&self) -> Result<(), RegistryError> {
        if self.org_id.is_empty() || self.agent_id.is_empty() || self.agent_name.is_empty() {
            return Err(RegistryError::InvalidIdentity(format!(
                "org-id={:?} agent-id={:?} agent-name={:?}",
                self.org_id, self.agent_id, self.agent_name
            )));
        }
        if self.mode == AgentMode::MultiConnection && self.connection_name.is_empty() {
            return Err(RegistryError::InvalidIdentity(
                "multi-connection agent without connection name".to_string(),
            ));
        }
        Ok(())
    }

    pub fn stream_agent_id(&self) -> StreamAgentId {
        match self.bound_connection() {
            Some(name) => StreamAgentId::new(&self.agent_id, name),
            None => StreamAgentId::new(&self.agent_id, ""),
        }
    }

    /// Connection this stream is dedicated to, for multi-connection agents
    pub fn bound_connection(&self) -> Option<&str> {
        match self.mode {
            AgentMode::MultiConnection if !self.connection_name.is_empty() => {
                Some(&self.connection_name)
            }
            _ => None,
        }
    }
}

/// A registered agent stream
#[derive(Debug)]
pub struct AgentStream {
    pub identity: AgentIdentity,
    pub id: StreamAgentId,
    pub metadata: AgentMetadata,
    pub stream: SharedStream,
    pub connected_at: DateTime<Utc>,
    /// Distinguishes successive registrations of the same agent
    pub registration: u64,
}

#[derive(Clone)]
pub struct AgentRegistry {
    agents: Arc<DashMap<StreamAgentId, Arc<AgentStream>>>,
    directory: Arc<dyn ConnectionDirectory>,
    liveness: LivenessReconciler,
    registrations: Arc<AtomicU64>,
}

impl AgentRegistry {
    pub fn new(directory: Arc<dyn ConnectionDirectory>, liveness: LivenessReconciler) -> Self {
        Self {
            agents: Arc::new(DashMap::new()),
            directory,
            liveness,
            registrations: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn liveness(&self) -> &LivenessReconciler {
        &self.liveness
    }

    /// Register an agent stream
    ///
    /// # Errors
    ///
    /// Fails when the identity is incomplete, when a multi-connection agent
    /// claims a connection bound to another agent, or when a stream with the
    /// same [`StreamAgentId`] is already registered.
    pub async fn save(
        &self,
        identity: AgentIdentity,
        metadata: AgentMetadata,
        stream: SharedStream,
    ) -> Result<Arc<AgentStream>, RegistryError> {
        identity.validate()?;

        if let Some(name) = identity.bound_connection() {
            let connection = self
                .directory
                .get_connection(&identity.org_id, name)
                .await?
                .ok_or_else(|| RegistryError::ConnectionNotFound(name.to_string()))?;
            if connection.agent_id != identity.agent_id {
                warn!(
                    agent_id = %identity.agent_id,
                    connection = %name,
                    bound_agent_id = %connection.agent_id,
                    "Agent claimed a connection it is not bound to"
                );
                return Err(RegistryError::ConnectionNotBound {
                    connection: name.to_string(),
                    agent_id: identity.agent_id.clone(),
                });
            }
        }

        let id = identity.stream_agent_id();
        let agent = Arc::new(AgentStream {
            identity,
            id: id.clone(),
            metadata,
            stream,
            connected_at: Utc::now(),
            registration: self.registrations.fetch_add(1, Ordering::SeqCst),
        });

        match self.agents.entry(id.clone()) {
            Entry::Occupied(existing) => {
                warn!(
                    stream_agent_id = %id,
                    existing_since = %existing.get().connected_at,
                    "Rejected duplicate agent registration"
                );
                return Err(RegistryError::AlreadyConnected);
            }
            Entry::Vacant(slot) => {
                slot.insert(agent.clone());
            }
        }

        if let Err(e) = self
            .liveness
            .set_online(&agent.identity, &agent.metadata, agent.registration)
            .await
        {
            self.agents
                .remove_if(&id, |_, current| Arc::ptr_eq(current, &agent));
            return Err(e.into());
        }

        info!(
            stream_agent_id = %id,
            agent_id = %agent.identity.agent_id,
            agent_name = %agent.identity.agent_name,
            hostname = %agent.metadata.hostname,
            version = %agent.metadata.version,
            "Registered agent"
        );
        Ok(agent)
    }

    /// Remove an agent stream, mark it offline and close its sessions
    ///
    /// Only the exact registered stream is removed; returns false when it was
    /// already gone.
    pub async fn close(&self, agent: &Arc<AgentStream>, proxies: &ProxyRegistry) -> bool {
        let removed = self
            .agents
            .remove_if(&agent.id, |_, current| Arc::ptr_eq(current, agent))
            .is_some();
        if !removed {
            debug!(stream_agent_id = %agent.id, "Agent already unregistered");
            return false;
        }

        // A reconnect may already have registered a newer stream for this agent
        if let Err(e) = self
            .liveness
            .set_offline(&agent.identity, agent.registration)
            .await
        {
            warn!(stream_agent_id = %agent.id, "Failed marking agent offline: {}", e);
        }
        let closed = proxies.disconnect_by_agent(&agent.id).await;
        if let Err(e) = agent.stream.close().await {
            debug!(stream_agent_id = %agent.id, "Error closing agent stream: {}", e);
        }
        info!(stream_agent_id = %agent.id, sessions_closed = closed, "Unregistered agent");
        true
    }

    pub fn get(&self, id: &StreamAgentId) -> Option<Arc<AgentStream>> {
        self.agents.get(id).map(|a| a.value().clone())
    }

    pub fn is_online(&self, id: &StreamAgentId) -> bool {
        self.agents.contains_key(id)
    }

    pub fn list(&self) -> Vec<Arc<AgentStream>> {
        self.agents.iter().map(|a| a.value().clone()).collect()
    }

    pub fn count(&self) -> usize {
        self.agents.len()
    }
}
