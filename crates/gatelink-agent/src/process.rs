//! Command execution for exec and terminal sessions

use dashmap::DashMap;
use gatelink_proto::{keys, AgentConnectionParams, Packet, PacketType, INTERNAL_ERROR_EXIT_CODE};
use gatelink_transport::SharedStream;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::AgentError;

const OUTPUT_BUFFER_SIZE: usize = 16 * 1024;

/// Terminal input chunks queued before the command counts as stalled
pub const STDIN_QUEUE_CAPACITY: usize = 256;

/// Packet carrying the exit status of a session's command
pub fn exit_packet(sid: &str, exit_code: i32, message: Option<&str>) -> Packet {
    let packet = Packet::new(PacketType::SessionClose)
        .with_session_id(sid)
        .with_spec(keys::CLIENT_EXIT_CODE, exit_code.to_string());
    match message {
        Some(message) => packet.with_payload(message),
        None => packet,
    }
}

/// Build the command line of a session: the connection command followed by the client arguments
pub fn build_command(params: &AgentConnectionParams) -> Result<Command, AgentError> {
    let mut argv = params.command.iter().chain(params.client_args.iter());
    let program = argv
        .next()
        .ok_or_else(|| AgentError::InvalidCommand(params.connection_name.clone()))?;
    let mut command = Command::new(program);
    command
        .args(argv)
        .envs(&params.env_vars)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    Ok(command)
}

struct Running {
    stdin: Option<mpsc::Sender<Vec<u8>>>,
    cancel: CancellationToken,
}

/// Commands started for sessions, at most one per session
#[derive(Clone, Default)]
pub struct ProcessTable {
    running: Arc<DashMap<String, Running>>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self, sid: &str) -> bool {
        self.running.contains_key(sid)
    }

    pub fn count(&self) -> usize {
        self.running.len()
    }

    /// Run a one-shot command with `input` as its whole stdin.
    ///
    /// Stdout and stderr are streamed as they are produced; the exit code is
    /// sent in a session close once the command ends.
    pub fn exec(&self, stream: SharedStream, sid: &str, params: &AgentConnectionParams, input: Vec<u8>) {
        if self.is_running(sid) {
            warn!(sid = %sid, "Command already running for session");
            return;
        }
        let mut child = match build_command(params).and_then(|mut c| c.spawn().map_err(Into::into)) {
            Ok(child) => child,
            Err(e) => {
                let stream = stream.clone();
                let sid = sid.to_string();
                tokio::spawn(async move {
                    let _ = stream
                        .send(exit_packet(&sid, INTERNAL_ERROR_EXIT_CODE, Some(&e.to_string())))
                        .await;
                });
                return;
            }
        };
        let cancel = CancellationToken::new();
        self.running.insert(
            sid.to_string(),
            Running {
                stdin: None,
                cancel: cancel.clone(),
            },
        );
        info!(sid = %sid, pid = ?child.id(), "Started exec command");

        let stdin = child.stdin.take();
        let table = self.clone();
        let sid = sid.to_string();
        tokio::spawn(async move {
            if let Some(mut stdin) = stdin {
                if let Err(e) = stdin.write_all(&input).await {
                    debug!(sid = %sid, "Command closed stdin early: {}", e);
                }
                // Dropping stdin signals EOF
            }
            let exit_code = table
                .wait(&stream, &sid, child, PacketType::ExecWriteStdout, PacketType::ExecWriteStderr, cancel)
                .await;
            // A killed command belongs to a session that is already closed
            if table.running.remove(&sid).is_some() {
                let _ = stream.send(exit_packet(&sid, exit_code, None)).await;
            }
        });
    }

    /// Queue interactive input for the session's command, starting it on first use
    pub fn terminal_input(
        &self,
        stream: SharedStream,
        sid: &str,
        params: &AgentConnectionParams,
        input: Vec<u8>,
    ) -> Result<(), AgentError> {
        let stdin = self.running.get(sid).and_then(|r| r.stdin.clone());
        let stdin = match stdin {
            Some(stdin) => stdin,
            None => self.start_terminal(stream, sid, params)?,
        };
        if input.is_empty() {
            return Ok(());
        }
        stdin.try_send(input).map_err(|e| match e {
            TrySendError::Full(_) => AgentError::InputStalled(sid.to_string()),
            TrySendError::Closed(_) => std::io::Error::other("command stdin is closed").into(),
        })
    }

    fn start_terminal(
        &self,
        stream: SharedStream,
        sid: &str,
        params: &AgentConnectionParams,
    ) -> Result<mpsc::Sender<Vec<u8>>, AgentError> {
        let mut child = build_command(params)?.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| std::io::Error::other("command stdin is not available"))?;
        let (queue, queued) = mpsc::channel(STDIN_QUEUE_CAPACITY);
        let cancel = CancellationToken::new();
        self.running.insert(
            sid.to_string(),
            Running {
                stdin: Some(queue.clone()),
                cancel: cancel.clone(),
            },
        );
        info!(sid = %sid, pid = ?child.id(), "Started terminal command");
        tokio::spawn(write_input(sid.to_string(), stdin, queued, cancel.clone()));

        let table = self.clone();
        let sid = sid.to_string();
        tokio::spawn(async move {
            let exit_code = table
                .wait(
                    &stream,
                    &sid,
                    child,
                    PacketType::TerminalWriteStdout,
                    PacketType::TerminalWriteStdout,
                    cancel,
                )
                .await;
            // A killed command belongs to a session that is already closed
            if table.running.remove(&sid).is_some() {
                let _ = stream.send(exit_packet(&sid, exit_code, None)).await;
            }
        });
        Ok(queue)
    }

    /// Stream output of `child` until it exits or the session is killed
    async fn wait(
        &self,
        stream: &SharedStream,
        sid: &str,
        mut child: Child,
        stdout_type: PacketType,
        stderr_type: PacketType,
        cancel: CancellationToken,
    ) -> i32 {
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let relay_out = relay_output(stream, sid, stdout, stdout_type);
        let relay_err = relay_output(stream, sid, stderr, stderr_type);

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                debug!(sid = %sid, "Command killed");
                return INTERNAL_ERROR_EXIT_CODE;
            }
            (_, _, status) = async { tokio::join!(relay_out, relay_err, child.wait()) } => status,
        };
        match status {
            Ok(status) => {
                let code = status.code().unwrap_or(INTERNAL_ERROR_EXIT_CODE);
                info!(sid = %sid, exit_code = code, "Command finished");
                code
            }
            Err(e) => {
                warn!(sid = %sid, "Failed waiting for command: {}", e);
                INTERNAL_ERROR_EXIT_CODE
            }
        }
    }

    /// Kill the command of a session, if any
    pub fn kill(&self, sid: &str) -> bool {
        match self.running.remove(sid) {
            Some((_, running)) => {
                running.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn kill_all(&self) {
        for entry in self.running.iter() {
            entry.value().cancel.cancel();
        }
        self.running.clear();
    }
}

/// Write queued terminal input to the command until the session ends
async fn write_input(
    sid: String,
    mut stdin: ChildStdin,
    mut queued: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
) {
    loop {
        let input = tokio::select! {
            _ = cancel.cancelled() => break,
            input = queued.recv() => match input {
                Some(input) => input,
                None => break,
            },
        };
        let written = tokio::select! {
            _ = cancel.cancelled() => break,
            written = stdin.write_all(&input) => written,
        };
        if let Err(e) = written {
            debug!(sid = %sid, "Command closed stdin: {}", e);
            break;
        }
    }
}

async fn relay_output<R>(stream: &SharedStream, sid: &str, output: Option<R>, packet_type: PacketType)
where
    R: AsyncRead + Unpin,
{
    let Some(mut output) = output else {
        return;
    };
    let mut buffer = vec![0u8; OUTPUT_BUFFER_SIZE];
    loop {
        match output.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => {
                let packet = Packet::new(packet_type.clone())
                    .with_session_id(sid)
                    .with_payload(buffer[..n].to_vec());
                if let Err(e) = stream.send(packet).await {
                    debug!(sid = %sid, "Stopped relaying output: {}", e);
                    break;
                }
            }
            Err(e) => {
                debug!(sid = %sid, "Output read failed: {}", e);
                break;
            }
        }
    }
}
