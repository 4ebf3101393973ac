//! Liveness reconciler
//!
//! Keeps the online/offline status persisted through a [`StatusSink`] in line
//! with the agent streams actually registered on this gateway. Entries are
//! created when an agent is about to connect and confirmed once its stream is
//! registered. A periodic sweep flips entries that never got confirmed back to
//! offline.
//!
//! Confirmed entries remember the registration that created them. Status
//! changes run one at a time, and an agent stream can only take offline the
//! entry it registered itself, never the one of a stream that replaced it.

use dashmap::DashMap;
use gatelink_proto::{AgentMetadata, StreamAgentId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent_registry::AgentIdentity;
use crate::directory::{DirectoryError, LivenessStatus, StatusSink};

pub const DEFAULT_LIVENESS_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
struct LivenessEntry {
    identity: AgentIdentity,
    created_at: Instant,
    /// Registration that confirmed the entry; `None` while pre-connected
    registration: Option<u64>,
}

impl LivenessEntry {
    fn connected(&self) -> bool {
        self.registration.is_some()
    }
}

#[derive(Clone)]
pub struct LivenessReconciler {
    entries: Arc<DashMap<StreamAgentId, LivenessEntry>>,
    sink: Arc<dyn StatusSink>,
    grace: Duration,
    transitions: Arc<Mutex<()>>,
}

impl LivenessReconciler {
    pub fn new(sink: Arc<dyn StatusSink>) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            sink,
            grace: DEFAULT_GRACE_PERIOD,
            transitions: Arc::new(Mutex::new(())),
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Mark every known agent and connection offline.
    ///
    /// Called once at startup: whatever was online before a restart must
    /// register again before it reads back as online.
    pub async fn init(&self) -> Result<usize, DirectoryError> {
        let _transition = self.transitions.lock().await;
        self.entries.clear();
        let changed = self.sink.set_all_offline().await?;
        info!(changed, "Marked all agents and connections offline");
        Ok(changed)
    }

    /// Record an agent that is about to connect
    pub async fn set_online_pre_connect(
        &self,
        identity: &AgentIdentity,
    ) -> Result<(), DirectoryError> {
        let key = identity.stream_agent_id();
        let _transition = self.transitions.lock().await;
        if self.is_connected(&key) {
            return Ok(());
        }
        self.update_status(identity, LivenessStatus::Online, None)
            .await?;
        self.entries.insert(
            key,
            LivenessEntry {
                identity: identity.clone(),
                created_at: Instant::now(),
                registration: None,
            },
        );
        Ok(())
    }

    /// Confirm the agent stream registered as `registration`
    pub async fn set_online(
        &self,
        identity: &AgentIdentity,
        metadata: &AgentMetadata,
        registration: u64,
    ) -> Result<(), DirectoryError> {
        let _transition = self.transitions.lock().await;
        self.update_status(identity, LivenessStatus::Online, Some(metadata))
            .await?;
        self.entries.insert(
            identity.stream_agent_id(),
            LivenessEntry {
                identity: identity.clone(),
                created_at: Instant::now(),
                registration: Some(registration),
            },
        );
        Ok(())
    }

    /// Mark the agent offline if its entry still belongs to `registration`.
    ///
    /// Returns false when a newer stream owns the entry; its status is left alone.
    pub async fn set_offline(
        &self,
        identity: &AgentIdentity,
        registration: u64,
    ) -> Result<bool, DirectoryError> {
        let key = identity.stream_agent_id();
        let _transition = self.transitions.lock().await;
        let owned = match self.entries.get(&key) {
            Some(entry) => entry.registration == Some(registration),
            // nothing newer claimed the agent
            None => true,
        };
        if !owned {
            debug!(stream_agent_id = %key, registration, "Liveness entry owned by a newer stream");
            return Ok(false);
        }
        self.entries.remove(&key);
        self.update_status(identity, LivenessStatus::Offline, None)
            .await?;
        Ok(true)
    }

    pub fn is_connected(&self, id: &StreamAgentId) -> bool {
        self.entries.get(id).map(|e| e.connected()).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Flip unconfirmed entries older than the grace window to offline
    pub async fn sweep(&self) -> usize {
        let _transition = self.transitions.lock().await;
        let now = Instant::now();
        let stale: Vec<StreamAgentId> = self
            .entries
            .iter()
            .filter(|e| !e.connected() && now.duration_since(e.created_at) >= self.grace)
            .map(|e| e.key().clone())
            .collect();

        let mut swept = 0;
        for key in stale {
            let Some((_, entry)) = self.entries.remove_if(&key, |_, e| !e.connected()) else {
                continue;
            };
            debug!(stream_agent_id = %key, "Half-open agent connection expired");
            if let Err(e) = self
                .update_status(&entry.identity, LivenessStatus::Offline, None)
                .await
            {
                warn!(stream_agent_id = %key, "Failed marking agent offline: {}", e);
            }
            swept += 1;
        }
        swept
    }

    /// Run [`sweep`](Self::sweep) on `interval` until `shutdown` fires
    pub fn spawn(&self, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let reconciler = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let swept = reconciler.sweep().await;
                        if swept > 0 {
                            info!(swept, "Liveness sweep marked agents offline");
                        }
                    }
                }
            }
            debug!("Liveness reconciler stopped");
        })
    }

    async fn update_status(
        &self,
        identity: &AgentIdentity,
        status: LivenessStatus,
        metadata: Option<&AgentMetadata>,
    ) -> Result<(), DirectoryError> {
        match identity.bound_connection() {
            Some(name) => {
                self.sink
                    .update_connection_status(&identity.org_id, name, status)
                    .await
            }
            None => {
                self.sink
                    .update_agent_status(&identity.org_id, &identity.agent_id, status, metadata)
                    .await
            }
        }
    }
}
