//! Exec and interactive terminal front-end

use gatelink_proto::{Packet, PacketType};
use gatelink_transport::SharedStream;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::ClientError;

const INPUT_BUFFER_SIZE: usize = 4096;

/// Writes command output received from the agent to local sinks
pub struct Terminal<O, E> {
    stdout: O,
    stderr: E,
}

impl<O, E> Terminal<O, E>
where
    O: AsyncWrite + Unpin + Send,
    E: AsyncWrite + Unpin + Send,
{
    pub fn new(stdout: O, stderr: E) -> Self {
        Self { stdout, stderr }
    }

    /// Write an output packet; returns false for packets that carry no output
    pub async fn write(&mut self, packet: &Packet) -> std::io::Result<bool> {
        match packet.kind() {
            PacketType::ExecWriteStdout | PacketType::TerminalWriteStdout => {
                self.stdout.write_all(&packet.payload).await?;
                self.stdout.flush().await?;
            }
            PacketType::ExecWriteStderr => {
                self.stderr.write_all(&packet.payload).await?;
                self.stderr.flush().await?;
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    /// Write a message for the user to the error sink
    pub async fn notice(&mut self, message: &str) -> std::io::Result<()> {
        self.stderr.write_all(message.as_bytes()).await?;
        if !message.ends_with('\n') {
            self.stderr.write_all(b"\n").await?;
        }
        self.stderr.flush().await
    }

    pub fn into_inner(self) -> (O, E) {
        (self.stdout, self.stderr)
    }
}

/// Read `input` to the end and send it as the stdin of an exec session
pub async fn send_exec_input<R>(
    stream: &SharedStream,
    sid: &str,
    mut input: R,
) -> Result<(), ClientError>
where
    R: AsyncRead + Unpin,
{
    let mut payload = Vec::new();
    input.read_to_end(&mut payload).await?;
    debug!(sid = %sid, bytes = payload.len(), "Sending exec input");
    stream
        .send(
            Packet::new(PacketType::ExecWriteStdin)
                .with_session_id(sid)
                .with_payload(payload),
        )
        .await?;
    Ok(())
}

/// Forward interactive input chunk by chunk until EOF or cancellation
pub fn spawn_terminal_input<R>(
    stream: SharedStream,
    sid: String,
    mut input: R,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buffer = vec![0u8; INPUT_BUFFER_SIZE];
        loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => break,
                read = input.read(&mut buffer) => read,
            };
            let n = match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    warn!(sid = %sid, "Failed reading terminal input: {}", e);
                    break;
                }
            };
            let packet = Packet::new(PacketType::TerminalWriteStdin)
                .with_session_id(&sid)
                .with_payload(buffer[..n].to_vec());
            if let Err(e) = stream.send(packet).await {
                debug!(sid = %sid, "Terminal input stopped: {}", e);
                break;
            }
        }
        debug!(sid = %sid, "Terminal input ended");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatelink_transport::{memory, PacketStream};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_output_routed_by_packet_type() {
        let mut terminal = Terminal::new(Vec::new(), Vec::new());

        let out = Packet::new(PacketType::ExecWriteStdout).with_payload("hello\n");
        let err = Packet::new(PacketType::ExecWriteStderr).with_payload("oops\n");
        let tty = Packet::new(PacketType::TerminalWriteStdout).with_payload("$ ");
        assert!(terminal.write(&out).await.unwrap());
        assert!(terminal.write(&err).await.unwrap());
        assert!(terminal.write(&tty).await.unwrap());
        assert!(!terminal
            .write(&Packet::new(PacketType::KeepAlive))
            .await
            .unwrap());

        let (stdout, stderr) = terminal.into_inner();
        assert_eq!(stdout, b"hello\n$ ");
        assert_eq!(stderr, b"oops\n");
    }

    #[tokio::test]
    async fn test_exec_input_sent_in_one_packet() {
        let (local, remote) = memory::pair();
        let local: SharedStream = Arc::new(local);

        send_exec_input(&local, "sid-1", &b"select 1;\nselect 2;\n"[..])
            .await
            .unwrap();

        let pkt = remote.recv().await.unwrap().unwrap();
        assert_eq!(pkt.kind(), PacketType::ExecWriteStdin);
        assert_eq!(pkt.session_id(), Some("sid-1"));
        assert_eq!(pkt.payload, b"select 1;\nselect 2;\n");
    }

    #[tokio::test]
    async fn test_terminal_input_streams_until_eof() {
        let (local, remote) = memory::pair();
        let (mut keyboard, input) = tokio::io::duplex(64);

        let handle = spawn_terminal_input(
            Arc::new(local),
            "sid-1".into(),
            input,
            CancellationToken::new(),
        );
        keyboard.write_all(b"ls\n").await.unwrap();
        let pkt = remote.recv().await.unwrap().unwrap();
        assert_eq!(pkt.kind(), PacketType::TerminalWriteStdin);
        assert_eq!(pkt.payload, b"ls\n");

        drop(keyboard);
        handle.await.unwrap();
    }
}
