//! Stream handler for agents and clients
//!
//! Every accepted stream is dispatched on the `origin` header of its
//! handshake. Agent streams are registered and then relayed back to the
//! sessions they serve. Client streams become proxy sessions whose packets run
//! through the session pipeline before reaching the agent.

use gatelink_proto::{
    keys, AgentConnectionParams, AgentMetadata, Packet, PacketType, ORIGIN_AGENT, ORIGIN_CLIENT,
};
use gatelink_transport::{SharedStream, StreamHeaders};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use crate::agent_registry::{AgentIdentity, AgentRegistry, AgentStream};
use crate::directory::ConnectionDirectory;
use crate::plugins::review::ACCESS_DENIED_MESSAGE;
use crate::plugins::ConnectResponse;
use crate::proxy_registry::{ProxyRegistry, ProxySession, SessionError};
use crate::session::{ClientIdentity, SessionContext, SessionState};
use crate::GatewayError;

/// How long an agent has to acknowledge a session open
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(15);

/// Agent packets queued per session before its client counts as stalled
pub const CLIENT_RELAY_CAPACITY: usize = 256;

const CLIENT_STALLED_MESSAGE: &str = "client is not reading session output";

#[derive(Clone)]
pub struct GatewayHandler {
    agents: AgentRegistry,
    proxies: ProxyRegistry,
    directory: Arc<dyn ConnectionDirectory>,
    open_timeout: Duration,
}

impl GatewayHandler {
    pub fn new(proxies: ProxyRegistry, directory: Arc<dyn ConnectionDirectory>) -> Self {
        Self {
            agents: proxies.agents().clone(),
            proxies,
            directory,
            open_timeout: DEFAULT_OPEN_TIMEOUT,
        }
    }

    pub fn with_open_timeout(mut self, open_timeout: Duration) -> Self {
        self.open_timeout = open_timeout;
        self
    }

    pub fn proxies(&self) -> &ProxyRegistry {
        &self.proxies
    }

    pub fn agents(&self) -> &AgentRegistry {
        &self.agents
    }

    /// Serve one accepted stream until it ends
    pub async fn handle_stream(
        &self,
        stream: SharedStream,
        headers: StreamHeaders,
    ) -> Result<(), GatewayError> {
        match headers.origin() {
            Some(ORIGIN_AGENT) => self.handle_agent(stream, headers).await,
            Some(ORIGIN_CLIENT) => self.handle_client(stream, headers).await,
            other => {
                let origin = other.unwrap_or_default().to_string();
                warn!(stream_id = stream.stream_id(), origin = %origin, "Unknown stream origin");
                let _ = stream.close().await;
                Err(GatewayError::UnknownOrigin(origin))
            }
        }
    }

    async fn handle_agent(
        &self,
        stream: SharedStream,
        headers: StreamHeaders,
    ) -> Result<(), GatewayError> {
        let identity = AgentIdentity::from_headers(&headers);
        let metadata = AgentMetadata::from_headers(headers.as_map());

        if identity.validate().is_ok() {
            if let Err(e) = self.agents.liveness().set_online_pre_connect(&identity).await {
                warn!(agent_id = %identity.agent_id, "Failed recording agent pre-connect: {}", e);
            }
        }

        let agent = match self.agents.save(identity, metadata, stream.clone()).await {
            Ok(agent) => agent,
            Err(e) => {
                warn!(stream_id = stream.stream_id(), "Rejected agent: {}", e);
                let _ = stream.close().await;
                return Err(e.into());
            }
        };

        let result = match stream.send(Packet::new(PacketType::GatewayConnectOk)).await {
            Ok(()) => self.agent_loop(&agent).await,
            Err(e) => Err(e.into()),
        };
        self.agents.close(&agent, &self.proxies).await;
        result
    }

    async fn agent_loop(&self, agent: &Arc<AgentStream>) -> Result<(), GatewayError> {
        let mut relays: HashMap<String, mpsc::Sender<Packet>> = HashMap::new();
        loop {
            let Some(packet) = agent.stream.recv().await? else {
                info!(stream_agent_id = %agent.id, "Agent stream ended");
                return Ok(());
            };
            let kind = packet.kind();
            if kind == PacketType::KeepAlive {
                continue;
            }
            let Some(sid) = packet.session_id().map(String::from) else {
                warn!(stream_agent_id = %agent.id, packet_type = %kind, "Agent packet without session id");
                continue;
            };
            let Some(session) = self.proxies.get(&sid) else {
                relays.remove(&sid);
                debug!(sid = %sid, packet_type = %kind, "Agent packet for unknown session");
                continue;
            };
            self.relay_to_client(&mut relays, session, packet);
        }
    }

    /// Queue an agent packet on the session's relay without waiting for the client
    fn relay_to_client(
        &self,
        relays: &mut HashMap<String, mpsc::Sender<Packet>>,
        session: Arc<ProxySession>,
        packet: Packet,
    ) {
        let sid = session.sid().to_string();
        let existing = relays.get(&sid).filter(|relay| !relay.is_closed()).cloned();
        let relay = match existing {
            Some(relay) => relay,
            None => {
                relays.retain(|_, relay| !relay.is_closed());
                let relay = self.spawn_client_relay(session.clone());
                relays.insert(sid.clone(), relay.clone());
                relay
            }
        };
        match relay.try_send(packet) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(sid = %sid, "Client relay is full, closing session");
                relays.remove(&sid);
                let proxies = self.proxies.clone();
                tokio::spawn(async move {
                    // nothing more can be delivered to a client that stopped reading
                    let _ = session.client().close().await;
                    proxies
                        .close(&sid, Some(CLIENT_STALLED_MESSAGE.to_string()))
                        .await;
                });
            }
            Err(TrySendError::Closed(_)) => {
                debug!(sid = %sid, "Client relay already finished");
            }
        }
    }

    /// Forward agent packets of one session in order until it closes
    fn spawn_client_relay(&self, session: Arc<ProxySession>) -> mpsc::Sender<Packet> {
        let (relay, mut queued) = mpsc::channel(CLIENT_RELAY_CAPACITY);
        let handler = self.clone();
        let closed = session.cancellation();
        tokio::spawn(async move {
            loop {
                let packet = tokio::select! {
                    _ = closed.cancelled() => break,
                    packet = queued.recv() => match packet {
                        Some(packet) => packet,
                        None => break,
                    },
                };
                handler.forward_to_client(&session, packet).await;
                if session.state() == SessionState::Closed {
                    break;
                }
            }
            debug!(sid = %session.sid(), "Client relay stopped");
        });
        relay
    }

    async fn forward_to_client(&self, session: &Arc<ProxySession>, mut packet: Packet) {
        let sid = session.sid().to_string();
        let kind = packet.kind();
        match kind {
            PacketType::SessionOpenOk => {
                if let Err(e) = session.transition(SessionState::Relaying) {
                    warn!(sid = %sid, "Ignoring session open ack: {}", e);
                    return;
                }
                let connection_type = session.context().connection_type();
                packet.spec.insert(
                    keys::CONNECTION_TYPE.to_string(),
                    connection_type.as_str().as_bytes().to_vec(),
                );
            }
            PacketType::SessionClose => {
                if let Err(e) = session.client().send(packet).await {
                    debug!(sid = %sid, "Failed relaying session close: {}", e);
                }
                self.proxies.close(&sid, None).await;
                return;
            }
            _ => match session
                .pipeline()
                .on_receive(session.context(), &mut packet)
                .await
            {
                Ok(Some(ConnectResponse {
                    client_packet: Some(reply),
                    ..
                })) => packet = reply,
                Ok(_) => {}
                Err(e) => {
                    info!(sid = %sid, packet_type = %kind, "Agent packet rejected: {}", e);
                    match packet.connection_id().map(String::from) {
                        Some(connection_id) => {
                            let close = close_connection(&sid, &connection_id, &e.to_string());
                            let _ = session.client().send(close.clone()).await;
                            let _ = self.proxies.send_to_agent(session, close).await;
                        }
                        None => {
                            let err = SessionError::from(e);
                            let code = err.exit_code();
                            self.proxies
                                .close_with_code(&sid, Some(err.to_string()), code)
                                .await;
                        }
                    }
                    return;
                }
            },
        }

        if let Err(e) = session.client().send(packet).await {
            warn!(sid = %sid, "Failed relaying to client: {}", e);
            self.proxies.close(&sid, None).await;
        }
    }

    async fn handle_client(
        &self,
        stream: SharedStream,
        headers: StreamHeaders,
    ) -> Result<(), GatewayError> {
        let identity = ClientIdentity::from_headers(&headers);
        let sid = identity
            .session_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let lookup = self
            .directory
            .get_connection(&identity.org_id, &identity.connection_name)
            .await;
        let connection = match lookup {
            Ok(Some(connection)) => connection,
            Ok(None) => {
                let err = GatewayError::ConnectionNotFound(identity.connection_name.clone());
                reject(&stream, &sid, &err.to_string(), gatelink_proto::INTERNAL_ERROR_EXIT_CODE)
                    .await;
                return Err(err);
            }
            Err(e) => {
                reject(&stream, &sid, &e.to_string(), gatelink_proto::INTERNAL_ERROR_EXIT_CODE)
                    .await;
                return Err(e.into());
            }
        };

        let ctx = SessionContext::new(sid.clone(), identity, connection);
        let session = match self.proxies.open(ctx, stream.clone()).await {
            Ok(session) => session,
            Err(e) => {
                info!(sid = %sid, "Session rejected: {}", e);
                reject(&stream, &sid, &e.to_string(), e.exit_code()).await;
                return Err(e.into());
            }
        };

        let result = self.client_loop(&session).await;
        let error = result.as_ref().err().map(|e| e.to_string());
        self.proxies.close(&sid, error).await;
        let _ = stream.close().await;
        result
    }

    async fn client_loop(&self, session: &Arc<ProxySession>) -> Result<(), GatewayError> {
        let cancel = session.cancellation();
        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                received = session.client().recv() => received?,
            };
            let Some(packet) = received else {
                debug!(sid = %session.sid(), "Client stream ended");
                return Ok(());
            };
            if !self.process_client_packet(session, packet).await? {
                return Ok(());
            }
        }
    }

    /// Handle one client packet; returns false once the session is over
    async fn process_client_packet(
        &self,
        session: &Arc<ProxySession>,
        mut packet: Packet,
    ) -> Result<bool, GatewayError> {
        let sid = session.sid().to_string();
        let kind = packet.kind();
        match kind {
            PacketType::KeepAlive => return Ok(true),
            PacketType::Unsupported(ref raw) => {
                warn!(sid = %sid, packet_type = %raw, "Ignoring unsupported client packet");
                return Ok(true);
            }
            PacketType::SessionClose => {
                info!(sid = %sid, "Client closed session");
                self.proxies.close(&sid, None).await;
                return Ok(false);
            }
            _ => {}
        }

        // Data only flows once the agent acknowledged the open
        let state = session.state();
        if kind != PacketType::SessionOpen && state != SessionState::Relaying {
            match (&kind, packet.connection_id()) {
                (PacketType::WriteServer(_), Some(connection_id)) => {
                    info!(sid = %sid, connection_id = %connection_id, %state, "Refusing native connection before relaying");
                    let reason = format!("session is not relaying (state={})", state);
                    let close = close_connection(&sid, connection_id, &reason);
                    session.client().send(close).await?;
                }
                _ => warn!(sid = %sid, packet_type = %kind, %state, "Dropping packet before relaying"),
            }
            return Ok(true);
        }

        for key in keys::GATEWAY_OWNED {
            packet.spec.remove(*key);
        }
        packet
            .spec
            .insert(keys::SESSION_ID.to_string(), sid.clone().into_bytes());
        if let Err(e) = packet.validate() {
            warn!(sid = %sid, "Dropping malformed client packet: {}", e);
            return Ok(true);
        }

        match session
            .pipeline()
            .on_receive(session.context(), &mut packet)
            .await
        {
            Ok(None) => {}
            Ok(Some(response)) => {
                if let Some(deadline) = response.deadline {
                    debug!(sid = %sid, ?deadline, "Session deadline armed");
                    self.proxies.arm_deadline(session, deadline);
                }
                if let Some(reply) = response.client_packet {
                    if reply.kind() == PacketType::SessionOpenWaitingApproval {
                        if let Err(e) = session.transition(SessionState::WaitingApproval) {
                            warn!(sid = %sid, "{}", e);
                        }
                    }
                    session.client().send(reply).await?;
                    return Ok(true);
                }
            }
            Err(e) => {
                info!(sid = %sid, packet_type = %kind, "Client packet rejected: {}", e);
                if let (PacketType::WriteServer(_), Some(connection_id)) =
                    (&kind, packet.connection_id())
                {
                    let close = close_connection(&sid, connection_id, &e.to_string());
                    session.client().send(close).await?;
                    return Ok(true);
                }
                let err = SessionError::from(e);
                let code = err.exit_code();
                self.proxies
                    .close_with_code(&sid, Some(err.to_string()), code)
                    .await;
                return Ok(false);
            }
        }

        if kind == PacketType::SessionOpen {
            self.open_session(session, packet).await?;
            return Ok(true);
        }

        match self.proxies.send_to_agent(session, packet).await {
            Ok(()) => Ok(true),
            Err(SessionError::AgentOffline) => {
                agent_offline(session).await?;
                Ok(true)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Forward a session open to the agent with the gateway-owned spec attached
    async fn open_session(
        &self,
        session: &Arc<ProxySession>,
        packet: Packet,
    ) -> Result<(), GatewayError> {
        let ctx = session.context();
        if !self.agents.is_online(&ctx.stream_agent_id()) {
            info!(sid = %ctx.sid, agent_id = %ctx.connection.agent_id, "Agent offline");
            agent_offline(session).await?;
            return Ok(());
        }
        if let Err(e) = session.transition(SessionState::Open) {
            warn!(sid = %ctx.sid, "Ignoring session open: {}", e);
            return Ok(());
        }

        let open = agent_session_open(ctx, packet);
        match self.proxies.send_to_agent(session, open).await {
            Ok(()) => {
                self.proxies.arm_open_timeout(session, self.open_timeout);
                Ok(())
            }
            Err(SessionError::AgentOffline) => agent_offline(session).await,
            Err(e) => Err(e.into()),
        }
    }

    /// Resume or close a session suspended on review
    pub async fn review_status_changed(
        &self,
        sid: &str,
        approved: bool,
    ) -> Result<(), GatewayError> {
        let session = self
            .proxies
            .get(sid)
            .ok_or_else(|| SessionError::NotFound(sid.to_string()))?;
        if !approved {
            info!(sid = %sid, "Review rejected");
            self.proxies
                .close(sid, Some(ACCESS_DENIED_MESSAGE.to_string()))
                .await;
            return Ok(());
        }
        info!(sid = %sid, "Review approved");
        session.client()
            .send(Packet::new(PacketType::SessionOpenApproveOk).with_session_id(sid))
            .await?;
        Ok(())
    }
}

/// Build the session open sent to the agent
///
/// Client spec keys are carried over; gateway-owned keys are set last so the
/// client can never supply them.
fn agent_session_open(ctx: &SessionContext, packet: Packet) -> Packet {
    let client_args = packet
        .spec_bytes(keys::CLIENT_EXEC_ARGS)
        .and_then(|raw| serde_json::from_slice::<Vec<String>>(raw).ok())
        .unwrap_or_else(|| ctx.client_args.clone());
    let dlp_info_types = packet
        .spec_str(keys::DLP_INFO_TYPES)
        .map(|types| types.split(',').map(String::from).collect())
        .unwrap_or_default();
    let connection = &ctx.connection;
    let connection_type = ctx.connection_type();
    let params = AgentConnectionParams {
        connection_name: connection.name.clone(),
        connection_type: connection_type.as_str().to_string(),
        env_vars: connection.env_vars.clone(),
        command: connection.command.clone(),
        client_args,
        client_verb: ctx.verb(),
        client_origin: ctx.client_origin.clone(),
        user_id: ctx.user_id.clone(),
        dlp_info_types,
        guardrail_input_rules: connection.guardrail_input_rules.clone(),
        guardrail_output_rules: connection.guardrail_output_rules.clone(),
    };

    let mut open = Packet::new(PacketType::SessionOpen).with_payload(packet.payload);
    open.spec = packet.spec;
    open.spec
        .insert(keys::SESSION_ID.to_string(), ctx.sid.clone().into_bytes());
    open.spec.insert(
        keys::CONNECTION_TYPE.to_string(),
        connection_type.as_str().as_bytes().to_vec(),
    );
    open.spec
        .insert(keys::AGENT_CONNECTION_PARAMS.to_string(), params.encode());
    open
}

fn close_connection(sid: &str, connection_id: &str, reason: &str) -> Packet {
    Packet::new(PacketType::CloseTcpConnection)
        .with_session_id(sid)
        .with_spec(keys::CLIENT_CONNECTION_ID, connection_id)
        .with_payload(reason)
}

async fn agent_offline(session: &ProxySession) -> Result<(), GatewayError> {
    let packet = Packet::new(PacketType::SessionOpenAgentOffline).with_session_id(session.sid());
    session.client().send(packet).await?;
    Ok(())
}

/// Report a session setup failure to the client and end its stream
async fn reject(stream: &SharedStream, sid: &str, message: &str, exit_code: i32) {
    let close = Packet::new(PacketType::SessionClose)
        .with_session_id(sid)
        .with_spec(keys::CLIENT_EXIT_CODE, exit_code.to_string())
        .with_payload(message);
    if let Err(e) = stream.send(close).await {
        debug!(sid = %sid, "Failed sending rejection: {}", e);
    }
    let _ = stream.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::ConnectionRecord;
    use gatelink_proto::{ClientVerb, GuardrailRuleSet};

    #[test]
    fn test_agent_open_keeps_client_spec_and_owns_gateway_keys() {
        let ctx = SessionContext {
            sid: "sid-1".into(),
            user_id: "user-1".into(),
            client_verb: "exec".into(),
            client_origin: "client".into(),
            connection: ConnectionRecord {
                name: "shell".into(),
                connection_type: "custom".into(),
                command: vec!["bash".into()],
                guardrail_input_rules: vec![GuardrailRuleSet::default()],
                ..Default::default()
            },
            ..Default::default()
        };
        let client_open = Packet::new(PacketType::SessionOpen)
            .with_payload("ls -l")
            .with_spec(keys::CLIENT_EXEC_ARGS, r#"["-c","ls"]"#)
            .with_spec(keys::DLP_INFO_TYPES, "EMAIL_ADDRESS,PHONE_NUMBER")
            .with_spec(keys::SESSION_ID, "forged");

        let open = agent_session_open(&ctx, client_open);
        assert_eq!(open.session_id(), Some("sid-1"));
        assert_eq!(open.payload, b"ls -l");
        assert_eq!(open.spec_str(keys::CONNECTION_TYPE), Some("command-line"));
        assert!(open.spec_str(keys::CLIENT_EXEC_ARGS).is_some());

        let params = AgentConnectionParams::decode(&open).unwrap();
        assert_eq!(params.client_args, vec!["-c".to_string(), "ls".to_string()]);
        assert_eq!(params.client_verb, Some(ClientVerb::Exec));
        assert_eq!(params.command, vec!["bash".to_string()]);
        assert_eq!(params.dlp_info_types.len(), 2);
        assert_eq!(params.guardrail_input_rules.len(), 1);
    }
}
