//! Proxy session registry
//!
//! Owns every live client session on the gateway, keyed by session ID. Each
//! entry holds the session context, the client stream, the resolved plugin
//! pipeline and the session state. Closing a session removes the entry first,
//! so concurrent closers (client, agent teardown, sweeps) run the teardown at
//! most once.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use gatelink_proto::{keys, ClientVerb, Packet, PacketType, StreamAgentId, INTERNAL_ERROR_EXIT_CODE};
use gatelink_transport::{SharedStream, TransportError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent_registry::AgentRegistry;
use crate::directory::{DirectoryError, PolicySource};
use crate::plugins::{Pipeline, PluginError, PluginRegistry, PLUGIN_JIT, PLUGIN_REVIEW};
use crate::session::{SessionContext, SessionState};

/// Ceiling on the lifetime of a session
pub const DEFAULT_MAX_SESSION_DURATION: Duration = Duration::from_secs(48 * 60 * 60);

/// Interval of the expired session sweep
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid session: {0}")]
    InvalidContext(String),

    #[error("session {0} already exists")]
    AlreadyExists(String),

    /// Policy rejection
    #[error("{0}")]
    Precondition(String),

    #[error("agent is offline")]
    AgentOffline,

    #[error("session {0} not found")]
    NotFound(String),

    #[error("invalid session transition from {from} to {to}")]
    InvalidTransition { from: SessionState, to: SessionState },

    #[error("timeout {0}")]
    Timeout(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error(transparent)]
    Plugin(PluginError),
}

impl SessionError {
    /// Exit code the client should terminate with
    pub fn exit_code(&self) -> i32 {
        match self {
            SessionError::Plugin(e) => e.exit_code().unwrap_or(INTERNAL_ERROR_EXIT_CODE),
            _ => INTERNAL_ERROR_EXIT_CODE,
        }
    }
}

impl From<PluginError> for SessionError {
    fn from(err: PluginError) -> Self {
        match err {
            PluginError::Denied(reason) => SessionError::Precondition(reason),
            other => SessionError::Plugin(other),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct StateCell {
    state: SessionState,
    changed_at: Instant,
}

/// One live client session
pub struct ProxySession {
    ctx: SessionContext,
    client: SharedStream,
    pipeline: Pipeline,
    state: Mutex<StateCell>,
    cancel: CancellationToken,
    /// Set once any packet for this session reached the agent
    agent_notified: AtomicBool,
}

impl ProxySession {
    fn new(ctx: SessionContext, client: SharedStream, pipeline: Pipeline) -> Self {
        Self {
            ctx,
            client,
            pipeline,
            state: Mutex::new(StateCell {
                state: SessionState::Created,
                changed_at: Instant::now(),
            }),
            cancel: CancellationToken::new(),
            agent_notified: AtomicBool::new(false),
        }
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    pub fn sid(&self) -> &str {
        &self.ctx.sid
    }

    pub fn client(&self) -> &SharedStream {
        &self.client
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Cancelled when the session closes
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> SessionState {
        self.cell().state
    }

    /// Time since the last state change
    pub fn state_age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.cell().changed_at)
    }

    /// Move to `next`, returning the previous state
    pub fn transition(&self, next: SessionState) -> Result<SessionState, SessionError> {
        let mut cell = self.cell();
        let from = cell.state;
        if !from.can_transition_to(next) {
            return Err(SessionError::InvalidTransition { from, to: next });
        }
        if from != next {
            debug!(sid = %self.ctx.sid, %from, to = %next, "Session state changed");
            cell.state = next;
            cell.changed_at = Instant::now();
        }
        Ok(from)
    }

    fn set_closed(&self) {
        let mut cell = self.cell();
        cell.state = SessionState::Closed;
        cell.changed_at = Instant::now();
    }

    fn cell(&self) -> MutexGuard<'_, StateCell> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for ProxySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxySession")
            .field("sid", &self.ctx.sid)
            .field("connection", &self.ctx.connection.name)
            .field("state", &self.state())
            .field("plugins", &self.pipeline.names())
            .finish()
    }
}

#[derive(Clone)]
pub struct ProxyRegistry {
    sessions: Arc<DashMap<String, Arc<ProxySession>>>,
    agents: AgentRegistry,
    plugins: Arc<PluginRegistry>,
    policies: Arc<dyn PolicySource>,
    max_duration: Duration,
}

impl ProxyRegistry {
    pub fn new(
        agents: AgentRegistry,
        plugins: Arc<PluginRegistry>,
        policies: Arc<dyn PolicySource>,
    ) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            agents,
            plugins,
            policies,
            max_duration: DEFAULT_MAX_SESSION_DURATION,
        }
    }

    pub fn with_max_duration(mut self, max_duration: Duration) -> Self {
        self.max_duration = max_duration;
        self
    }

    pub fn agents(&self) -> &AgentRegistry {
        &self.agents
    }

    /// Create a session: resolve its plugins, gate the client verb and run
    /// every plugin's `on_connect`.
    pub async fn open(
        &self,
        ctx: SessionContext,
        client: SharedStream,
    ) -> Result<Arc<ProxySession>, SessionError> {
        ctx.validate().map_err(SessionError::InvalidContext)?;
        if self.sessions.contains_key(&ctx.sid) {
            return Err(SessionError::AlreadyExists(ctx.sid));
        }

        let policies = self.policies.policies(&ctx.org_id).await?;
        let pipeline = Pipeline::resolve(&self.plugins, &policies, &ctx);
        check_verb(&ctx, &pipeline)?;
        pipeline.on_connect(&ctx).await?;

        let session = Arc::new(ProxySession::new(ctx, client, pipeline));
        let sid = session.ctx.sid.clone();
        let inserted = match self.sessions.entry(sid.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(session.clone());
                true
            }
        };
        if !inserted {
            session
                .pipeline
                .on_disconnect(&session.ctx, Some("duplicated session"))
                .await;
            return Err(SessionError::AlreadyExists(sid));
        }

        info!(
            sid = %sid,
            connection = %session.ctx.connection.name,
            user_id = %session.ctx.user_id,
            verb = %session.ctx.client_verb,
            plugins = ?session.pipeline.names(),
            "Session created"
        );
        Ok(session)
    }

    pub fn get(&self, sid: &str) -> Option<Arc<ProxySession>> {
        self.sessions.get(sid).map(|s| s.value().clone())
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Forward a packet to the agent serving `session`
    pub async fn send_to_agent(
        &self,
        session: &ProxySession,
        packet: Packet,
    ) -> Result<(), SessionError> {
        let agent = self
            .agents
            .get(&session.ctx.stream_agent_id())
            .ok_or(SessionError::AgentOffline)?;
        session.agent_notified.store(true, Ordering::SeqCst);
        agent.stream.send(packet).await?;
        Ok(())
    }

    /// Close a session, reporting `error` to the client when present
    pub async fn close(&self, sid: &str, error: Option<String>) -> bool {
        self.close_with_code(sid, error, INTERNAL_ERROR_EXIT_CODE)
            .await
    }

    /// Close a session; idempotent, only the first call tears it down.
    ///
    /// Teardown marks the session closed, notifies the agent if it ever saw
    /// the session, runs every plugin's `on_disconnect`, sends the client a
    /// session close when `error` is set and cancels the session token.
    pub async fn close_with_code(&self, sid: &str, error: Option<String>, exit_code: i32) -> bool {
        let Some((_, session)) = self.sessions.remove(sid) else {
            return false;
        };
        session.set_closed();

        if session.agent_notified.load(Ordering::SeqCst) {
            if let Some(agent) = self.agents.get(&session.ctx.stream_agent_id()) {
                let mut close = Packet::new(PacketType::SessionClose).with_session_id(sid);
                if let Some(err) = &error {
                    close.payload = err.clone().into_bytes();
                }
                if let Err(e) = agent.stream.send(close).await {
                    warn!(sid = %sid, "Failed sending session close to agent: {}", e);
                }
            }
        }

        session.pipeline.on_disconnect(&session.ctx, error.as_deref()).await;

        if let Some(err) = &error {
            let close = Packet::new(PacketType::SessionClose)
                .with_session_id(sid)
                .with_spec(keys::CLIENT_EXIT_CODE, exit_code.to_string())
                .with_payload(err.clone());
            if let Err(e) = session.client.send(close).await {
                debug!(sid = %sid, "Failed sending session close to client: {}", e);
            }
        }

        session.cancel.cancel();
        info!(sid = %sid, error = ?error, "Session closed");
        true
    }

    /// Close every session served by the agent stream `id`
    pub async fn disconnect_by_agent(&self, id: &StreamAgentId) -> usize {
        let sids: Vec<String> = self
            .sessions
            .iter()
            .filter(|s| &s.ctx.stream_agent_id() == id)
            .map(|s| s.key().clone())
            .collect();
        let mut closed = 0;
        for sid in sids {
            if self.close(&sid, Some("agent disconnected".to_string())).await {
                closed += 1;
            }
        }
        closed
    }

    /// Close every session, used on shutdown
    pub async fn disconnect_all(&self, reason: &str) -> usize {
        let sids: Vec<String> = self.sessions.iter().map(|s| s.key().clone()).collect();
        let mut closed = 0;
        for sid in sids {
            if self.close(&sid, Some(reason.to_string())).await {
                closed += 1;
            }
        }
        closed
    }

    /// Close sessions whose state has not changed for longer than the ceiling
    pub async fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|s| s.state_age(now) >= self.max_duration)
            .map(|s| s.key().clone())
            .collect();
        let mut closed = 0;
        for sid in expired {
            let reason = format!(
                "session exceeded the maximum duration of {}h",
                self.max_duration.as_secs() / 3600
            );
            // a session may close concurrently; skip it then
            if self.close(&sid, Some(reason)).await {
                closed += 1;
            }
        }
        closed
    }

    /// Run [`sweep_expired`](Self::sweep_expired) on `interval` until `shutdown` fires
    pub fn spawn_cleanup(&self, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let closed = registry.sweep_expired().await;
                        if closed > 0 {
                            info!(closed, "Closed expired sessions");
                        }
                    }
                }
            }
        })
    }

    /// Close the session once `after` elapses
    pub fn arm_deadline(&self, session: &Arc<ProxySession>, after: Duration) -> JoinHandle<()> {
        let registry = self.clone();
        let sid = session.ctx.sid.clone();
        let cancel = session.cancellation();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(after) => {
                    info!(sid = %sid, "Session deadline reached");
                    registry
                        .close(&sid, Some("session access time has expired".to_string()))
                        .await;
                }
            }
        })
    }

    /// Time out a session the agent has not acknowledged within `after`
    pub fn arm_open_timeout(&self, session: &Arc<ProxySession>, after: Duration) -> JoinHandle<()> {
        let registry = self.clone();
        let session = session.clone();
        tokio::spawn(async move {
            let cancel = session.cancellation();
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(after) => {
                    if session.state() != SessionState::Open {
                        return;
                    }
                    warn!(sid = %session.ctx.sid, timeout = ?after, "Agent did not acknowledge session open");
                    let timeout = Packet::new(PacketType::SessionOpenTimeout)
                        .with_session_id(&session.ctx.sid)
                        .with_payload(format!("timeout ({:?}) waiting for agent", after));
                    if let Err(e) = session.client.send(timeout).await {
                        debug!(sid = %session.ctx.sid, "Failed sending open timeout: {}", e);
                    }
                    registry.close(&session.ctx.sid, None).await;
                }
            }
        })
    }
}

/// Reject verbs the connection's review configuration does not allow
fn check_verb(ctx: &SessionContext, pipeline: &Pipeline) -> Result<(), SessionError> {
    let has_review = pipeline.has(PLUGIN_REVIEW);
    let has_jit = pipeline.has(PLUGIN_JIT);
    let connection = &ctx.connection;
    match ctx.verb() {
        Some(ClientVerb::Connect) => {
            if has_review && !has_jit {
                return Err(SessionError::Precondition(
                    "this connection is subject to review, use the exec command".to_string(),
                ));
            }
            if !connection.access_mode_connect {
                return Err(SessionError::Precondition(format!(
                    "connect mode is disabled for connection {}",
                    connection.name
                )));
            }
        }
        Some(ClientVerb::Exec) => {
            if has_jit && !has_review {
                return Err(SessionError::Precondition(
                    "this connection requires jit access, use the connect command".to_string(),
                ));
            }
            if !connection.access_mode_exec {
                return Err(SessionError::Precondition(format!(
                    "exec mode is disabled for connection {}",
                    connection.name
                )));
            }
        }
        None => {
            return Err(SessionError::InvalidContext(format!(
                "unknown client verb {:?}",
                ctx.client_verb
            )))
        }
    }
    Ok(())
}
