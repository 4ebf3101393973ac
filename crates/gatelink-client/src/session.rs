//! Client side of a gateway session
//!
//! A [`ClientSession`] opens one stream to the gateway, asks for the session
//! and then reacts to what comes back: approval prompts, the open
//! acknowledgement that starts the matching front-end, relayed output and
//! finally the session close carrying the exit code.

use gatelink_proto::{
    keys, ClientVerb, ConnectionType, Packet, PacketType, INTERNAL_ERROR_EXIT_CODE,
};
use gatelink_transport::{start_keep_alive, FramedStream, SharedStream};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::proxy::ProxyServer;
use crate::terminal::{send_exec_input, spawn_terminal_input, Terminal};
use crate::ClientError;

/// How a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    pub exit_code: i32,
    pub message: Option<String>,
}

impl SessionOutcome {
    fn internal(message: impl Into<String>) -> Self {
        Self {
            exit_code: INTERNAL_ERROR_EXIT_CODE,
            message: Some(message.into()),
        }
    }
}

type Input = Box<dyn AsyncRead + Unpin + Send>;

pub struct ClientSession<O, E> {
    config: ClientConfig,
    stream: SharedStream,
    sid: Option<String>,
    terminal: Terminal<O, E>,
    input: Option<Input>,
    listener: Option<TcpListener>,
    proxy: Option<ProxyServer>,
    tasks: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl<O, E> ClientSession<O, E>
where
    O: AsyncWrite + Unpin + Send,
    E: AsyncWrite + Unpin + Send,
{
    /// Dial the gateway named in `config`
    pub async fn connect(config: ClientConfig, stdout: O, stderr: E) -> Result<Self, ClientError> {
        let stream = FramedStream::connect(config.gateway_addr, &config.headers()).await?;
        info!(gateway = %config.gateway_addr, connection = %config.connection_name, "Connected to gateway");
        Ok(Self::new(config, Arc::new(stream), stdout, stderr))
    }

    /// Run a session over an already opened stream
    pub fn new(config: ClientConfig, stream: SharedStream, stdout: O, stderr: E) -> Self {
        Self {
            sid: config.session_id.clone(),
            config,
            stream,
            terminal: Terminal::new(stdout, stderr),
            input: None,
            listener: None,
            proxy: None,
            tasks: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Source of exec input or interactive keystrokes
    pub fn with_input<R>(mut self, input: R) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        self.input = Some(Box::new(input));
        self
    }

    /// Serve the native front-end on this listener instead of binding one
    pub fn with_listener(mut self, listener: TcpListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Token that ends the session from outside
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Drive the session until the gateway closes it
    pub async fn run(mut self) -> Result<SessionOutcome, ClientError> {
        let keep_alive = start_keep_alive(self.stream.clone(), self.config.keep_alive_interval());

        // Exec input doubles as the open payload so that it can be reviewed
        let exec_input = match (self.config.verb, self.input.take()) {
            (ClientVerb::Exec, Some(mut input)) => {
                let mut payload = Vec::new();
                input.read_to_end(&mut payload).await?;
                Some(payload)
            }
            (_, input) => {
                self.input = input;
                None
            }
        };
        let open = self.session_open(exec_input.as_deref().unwrap_or_default());
        self.stream.send(open.clone()).await?;

        let result = self.process(&open, exec_input.as_deref()).await;

        self.cancel.cancel();
        if let Some(proxy) = &self.proxy {
            proxy.close_all();
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        keep_alive.abort();
        let _ = self.stream.close().await;
        result
    }

    fn session_open(&self, payload: &[u8]) -> Packet {
        let mut open = Packet::new(PacketType::SessionOpen).with_payload(payload.to_vec());
        if let Some(sid) = &self.sid {
            open = open.with_session_id(sid);
        }
        if !self.config.client_args.is_empty() {
            let args = serde_json::to_vec(&self.config.client_args).unwrap_or_default();
            open = open.with_spec(keys::CLIENT_EXEC_ARGS, args);
        }
        open
    }

    async fn process(
        &mut self,
        open: &Packet,
        exec_input: Option<&[u8]>,
    ) -> Result<SessionOutcome, ClientError> {
        loop {
            let received = tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Ok(SessionOutcome::internal("session cancelled"));
                }
                received = self.stream.recv() => received?,
            };
            let Some(packet) = received else {
                return Ok(SessionOutcome::internal("gateway closed the session stream"));
            };
            if self.sid.is_none() {
                self.sid = packet.session_id().map(String::from);
            }

            let kind = packet.kind();
            match kind {
                PacketType::KeepAlive => {}
                PacketType::Unsupported(ref raw) => {
                    debug!(packet_type = %raw, "Ignoring unsupported packet");
                }
                PacketType::SessionOpenWaitingApproval => {
                    let url = packet.payload_str();
                    info!(review = %url, "Session waiting for approval");
                    self.terminal
                        .notice(&format!("waiting for approval, review at {}", url))
                        .await?;
                }
                PacketType::SessionOpenApproveOk => {
                    info!("Session approved, opening again");
                    let mut again = open.clone();
                    if let Some(sid) = &self.sid {
                        again = again.with_session_id(sid);
                    }
                    self.stream.send(again).await?;
                }
                PacketType::SessionOpenAgentOffline => {
                    return Ok(SessionOutcome::internal("agent is offline"));
                }
                PacketType::SessionOpenTimeout => {
                    return Ok(SessionOutcome::internal(
                        "timeout waiting for the agent to open the session",
                    ));
                }
                PacketType::SessionOpenOk => {
                    let connection_type = packet
                        .spec_str(keys::CONNECTION_TYPE)
                        .map(ConnectionType::parse)
                        .unwrap_or(ConnectionType::CommandLine);
                    self.start_frontend(&connection_type, exec_input).await?;
                }
                PacketType::WriteClient(_) | PacketType::CloseTcpConnection => {
                    match &self.proxy {
                        Some(proxy) => {
                            proxy.handle_packet(&packet);
                        }
                        None => debug!(packet_type = %kind, "No front-end for packet"),
                    }
                }
                PacketType::ExecWriteStdout
                | PacketType::ExecWriteStderr
                | PacketType::TerminalWriteStdout => {
                    self.terminal.write(&packet).await?;
                }
                PacketType::SessionClose | PacketType::TerminalClose => {
                    let message = Some(packet.payload_str()).filter(|m| !m.is_empty());
                    if let Some(message) = &message {
                        self.terminal.notice(message).await?;
                    }
                    let exit_code = packet.exit_code().unwrap_or(INTERNAL_ERROR_EXIT_CODE);
                    info!(sid = ?self.sid, exit_code, "Session closed");
                    return Ok(SessionOutcome { exit_code, message });
                }
                other => {
                    warn!(packet_type = %other, "Unexpected packet from gateway");
                }
            }
        }
    }

    async fn start_frontend(
        &mut self,
        connection_type: &ConnectionType,
        exec_input: Option<&[u8]>,
    ) -> Result<(), ClientError> {
        let sid = self.sid.clone().unwrap_or_default();
        if let Some(protocol) = connection_type.protocol() {
            if self.proxy.is_some() {
                return Ok(());
            }
            let listener = match self.listener.take() {
                Some(listener) => listener,
                None => TcpListener::bind(self.config.listen_addr(protocol)).await?,
            };
            let local_addr = listener.local_addr()?;
            let proxy = ProxyServer::new(protocol, sid, self.stream.clone());
            let server = proxy.clone();
            self.tasks.push(tokio::spawn(async move {
                if let Err(e) = server.serve(listener).await {
                    warn!("Front-end stopped: {}", e);
                }
            }));
            self.proxy = Some(proxy);
            self.terminal
                .notice(&format!(
                    "{} connection ready on {}",
                    connection_type, local_addr
                ))
                .await?;
            return Ok(());
        }

        match connection_type {
            ConnectionType::CommandLine => match exec_input {
                Some(payload) => send_exec_input(&self.stream, &sid, payload).await,
                None => {
                    if self.config.verb == ClientVerb::Exec {
                        return send_exec_input(&self.stream, &sid, tokio::io::empty()).await;
                    }
                    if let Some(input) = self.input.take() {
                        self.tasks.push(spawn_terminal_input(
                            self.stream.clone(),
                            sid,
                            input,
                            self.cancel.child_token(),
                        ));
                    }
                    Ok(())
                }
            },
            other => Err(ClientError::UnsupportedConnectionType(other.to_string())),
        }
    }
}
