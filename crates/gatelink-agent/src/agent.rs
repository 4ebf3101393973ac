use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use gatelink_proto::{
    keys, AgentConnectionParams, AgentMetadata, ConnectionType, Packet, PacketType,
    INTERNAL_ERROR_EXIT_CODE,
};
use gatelink_transport::{start_keep_alive, FramedStream, SharedStream};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::AgentConfig;
use crate::forwarder::TcpForwarder;
use crate::process::{exit_packet, ProcessTable};
use crate::AgentError;

/// Serves gateway sessions: dials native targets and runs commands
#[derive(Clone)]
pub struct Agent {
    config: AgentConfig,
    metadata: AgentMetadata,
    sessions: Arc<DashMap<String, Arc<AgentConnectionParams>>>,
    /// Session opens still checking their target
    opening: Arc<DashMap<String, CancellationToken>>,
    forwarder: TcpForwarder,
    processes: ProcessTable,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        let forwarder = TcpForwarder::new(config.dial_timeout());
        Self {
            config,
            metadata: AgentMetadata::default(),
            sessions: Arc::new(DashMap::new()),
            opening: Arc::new(DashMap::new()),
            forwarder,
            processes: ProcessTable::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: AgentMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Number of sessions opened on this agent
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Keep a stream to the gateway open until shutdown, reconnecting with exponential backoff
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), AgentError> {
        let initial_backoff = self.config.initial_backoff();
        let max_backoff = self.config.max_backoff();
        let backoff_multiplier = 2.0;

        let mut current_backoff = initial_backoff;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            info!(
                "Connecting to gateway at {} with agent ID: {} (attempt {})",
                self.config.gateway_addr, self.config.agent_id, attempt
            );

            let headers = self.config.headers(&self.metadata);
            let connected = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                connected = FramedStream::connect(self.config.gateway_addr, &headers) => connected,
            };
            match connected {
                Ok(stream) => {
                    let stream: SharedStream = Arc::new(stream);
                    let result = tokio::select! {
                        _ = shutdown.cancelled() => {
                            self.shutdown(&stream).await;
                            return Ok(());
                        }
                        result = self.serve(stream.clone()) => result,
                    };
                    match result {
                        Ok(true) => {
                            // Reset backoff once the gateway accepted us
                            current_backoff = initial_backoff;
                            attempt = 0;
                            info!("Gateway stream ended");
                        }
                        Ok(false) => warn!("Gateway closed the stream before accepting the agent"),
                        Err(e) => error!("Agent error: {}", e),
                    }
                }
                Err(e) => error!("Failed to connect to gateway: {}", e),
            }

            info!(
                "Gateway connection ended, reconnecting in {}s (attempt {})...",
                current_backoff.as_secs(),
                attempt
            );
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(current_backoff) => {}
            }

            // Increase backoff for next attempt
            let next_backoff =
                Duration::from_secs_f64(current_backoff.as_secs_f64() * backoff_multiplier);
            current_backoff = next_backoff.min(max_backoff);
        }
    }

    async fn shutdown(&self, stream: &SharedStream) {
        self.release_all().await;
        let _ = stream.close().await;
    }

    async fn release_all(&self) {
        for entry in self.opening.iter() {
            entry.value().cancel();
        }
        self.opening.clear();
        self.forwarder.close_all();
        self.processes.kill_all();
        self.sessions.clear();
    }

    /// Process packets of one gateway stream until it ends.
    ///
    /// Returns whether the gateway acknowledged the agent.
    pub async fn serve(&self, stream: SharedStream) -> Result<bool, AgentError> {
        let keep_alive = start_keep_alive(stream.clone(), self.config.keep_alive_interval());
        let mut accepted = false;
        let result = loop {
            let packet = match stream.recv().await {
                Ok(Some(packet)) => packet,
                Ok(None) => break Ok(accepted),
                Err(e) => break Err(e.into()),
            };
            if packet.kind() == PacketType::GatewayConnectOk {
                info!(agent_id = %self.config.agent_id, "Gateway accepted agent");
                accepted = true;
                continue;
            }
            if let Err(e) = self.handle_packet(&stream, packet).await {
                warn!("Failed processing gateway packet: {}", e);
            }
        };
        keep_alive.abort();
        // Sessions do not survive the stream that carried them
        self.release_all().await;
        result
    }

    /// Dispatch a single packet from the gateway
    pub async fn handle_packet(&self, stream: &SharedStream, packet: Packet) -> Result<(), AgentError> {
        let kind = packet.kind();
        if kind == PacketType::KeepAlive {
            return Ok(());
        }
        let sid = packet.session_id().unwrap_or_default().to_string();
        if let Err(e) = packet.validate() {
            warn!(sid = %sid, "Invalid packet: {}", e);
            return self.reject(stream, &sid, &e.to_string()).await;
        }
        debug!(sid = %sid, packet_type = %kind, bytes = packet.payload.len(), "Received packet");

        match kind {
            PacketType::SessionOpen => {
                self.spawn_session_open(stream, &sid, packet);
                Ok(())
            }
            PacketType::WriteServer(protocol) => {
                let Some(params) = self.params(&sid) else {
                    return self.reject(stream, &sid, "session not found").await;
                };
                let connection_id = packet.connection_id().unwrap_or_default().to_string();
                let Some(address) = params.target_address() else {
                    return self
                        .reject(stream, &sid, "connection has no target host and port")
                        .await;
                };
                if let Err(e) =
                    self.forwarder
                        .write(stream, protocol, &sid, &connection_id, &address, packet.payload)
                {
                    warn!(sid = %sid, connection_id = %connection_id, "Forwarding failed: {}", e);
                    self.forwarder.close(&sid, &connection_id);
                    let close = Packet::new(PacketType::CloseTcpConnection)
                        .with_session_id(&sid)
                        .with_spec(keys::CLIENT_CONNECTION_ID, connection_id.as_str())
                        .with_payload(e.to_string());
                    stream.send(close).await?;
                }
                Ok(())
            }
            PacketType::CloseTcpConnection => {
                if let Some(connection_id) = packet.connection_id() {
                    self.forwarder.close(&sid, connection_id);
                }
                Ok(())
            }
            PacketType::SessionClose => {
                if let Some((_, opening)) = self.opening.remove(&sid) {
                    opening.cancel();
                }
                let closed = self.forwarder.close_session(&sid);
                let killed = self.processes.kill(&sid);
                self.sessions.remove(&sid);
                info!(sid = %sid, connections_closed = closed, process_killed = killed, "Session closed");
                Ok(())
            }
            PacketType::ExecWriteStdin => {
                let Some(params) = self.params(&sid) else {
                    return self.reject(stream, &sid, "session not found").await;
                };
                self.processes
                    .exec(stream.clone(), &sid, &params, packet.payload);
                Ok(())
            }
            PacketType::TerminalWriteStdin => {
                let Some(params) = self.params(&sid) else {
                    return self.reject(stream, &sid, "session not found").await;
                };
                if let Err(e) = self
                    .processes
                    .terminal_input(stream.clone(), &sid, &params, packet.payload)
                {
                    self.processes.kill(&sid);
                    return self.reject(stream, &sid, &e.to_string()).await;
                }
                Ok(())
            }
            PacketType::Unsupported(raw) => {
                self.reject(stream, &sid, &format!("unsupported packet type {}", raw))
                    .await
            }
            other => {
                self.reject(stream, &sid, &format!("unexpected packet type {}", other))
                    .await
            }
        }
    }

    fn params(&self, sid: &str) -> Option<Arc<AgentConnectionParams>> {
        self.sessions.get(sid).map(|p| p.clone())
    }

    /// Open a session in its own task so that checking a slow target does not
    /// hold up packets of other sessions
    fn spawn_session_open(&self, stream: &SharedStream, sid: &str, packet: Packet) {
        let cancel = CancellationToken::new();
        match self.opening.entry(sid.to_string()) {
            Entry::Occupied(_) => {
                warn!(sid = %sid, "Session is already opening");
                return;
            }
            Entry::Vacant(entry) => {
                entry.insert(cancel.clone());
            }
        }
        let agent = self.clone();
        let stream = stream.clone();
        let sid = sid.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => debug!(sid = %sid, "Session closed while opening"),
                opened = agent.session_open(&stream, &sid, &packet, &cancel) => {
                    if let Err(e) = opened {
                        warn!(sid = %sid, "Failed opening session: {}", e);
                    }
                    // A cancelled open no longer owns its entry
                    if !cancel.is_cancelled() {
                        agent.opening.remove(&sid);
                    }
                }
            }
        });
    }

    async fn session_open(
        &self,
        stream: &SharedStream,
        sid: &str,
        packet: &Packet,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError> {
        let params = match AgentConnectionParams::decode(packet) {
            Ok(params) => params,
            Err(e) => return self.reject(stream, sid, &e.to_string()).await,
        };
        let connection_type = packet
            .spec_str(keys::CONNECTION_TYPE)
            .map(ConnectionType::parse)
            .unwrap_or_else(|| ConnectionType::parse(&params.connection_type));

        // Dial native targets once so that a dead target fails the open instead of every query
        if connection_type.protocol().is_some() {
            let Some(address) = params.target_address() else {
                return self
                    .reject(stream, sid, "connection has no target host and port")
                    .await;
            };
            match self.forwarder.dial(&address).await {
                Ok(check) => drop(check),
                Err(e) => return self.reject(stream, sid, &e.to_string()).await,
            }
        }

        if cancel.is_cancelled() {
            return Ok(());
        }
        info!(
            sid = %sid,
            connection = %params.connection_name,
            connection_type = %connection_type,
            "Session opened"
        );
        self.sessions.insert(sid.to_string(), Arc::new(params));
        let ok = Packet::new(PacketType::SessionOpenOk)
            .with_session_id(sid)
            .with_spec(keys::CONNECTION_TYPE, connection_type.as_str());
        stream.send(ok).await?;
        Ok(())
    }

    /// End a session on the agent side and report why
    async fn reject(&self, stream: &SharedStream, sid: &str, message: &str) -> Result<(), AgentError> {
        if sid.is_empty() {
            warn!("Dropping packet without session: {}", message);
            return Ok(());
        }
        warn!(sid = %sid, "Closing session: {}", message);
        self.forwarder.close_session(sid);
        self.processes.kill(sid);
        self.sessions.remove(sid);
        stream
            .send(exit_packet(sid, INTERNAL_ERROR_EXIT_CODE, Some(message)))
            .await?;
        Ok(())
    }
}
