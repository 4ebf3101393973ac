//! Native protocol front-ends
//!
//! A [`ProxyServer`] accepts native connections on a local listener and
//! multiplexes all of them over the single session stream. Each accepted
//! socket gets a connection ID; bytes read from it travel upstream as
//! `*::WriteServer` packets and `*::WriteClient` packets addressed to the same
//! ID are written back to it.

pub mod framing;
pub mod postgres;

use dashmap::DashMap;
use gatelink_proto::{keys, Packet, PacketType, Protocol};
use gatelink_transport::{SharedStream, TransportError};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use framing::{framer_for, Framer, LengthFramer, RawFramer};
pub use postgres::{PgFramer, MAX_QUERY_SIZE};

const READ_BUFFER_SIZE: usize = 32 * 1024;

/// Payloads queued per native connection before the client counts as stalled
pub const WRITE_QUEUE_CAPACITY: usize = 256;

/// Front-end errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("the query is too big (> 1MB), size={size}")]
    QueryTooBig { size: usize },

    #[error("extended query protocol is not supported")]
    ExtendedQueryUnsupported,

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Mints connection IDs for native connections of one session
#[derive(Debug, Clone)]
pub struct ConnectionIdGenerator {
    next: Arc<AtomicU64>,
}

impl ConnectionIdGenerator {
    pub fn new() -> Self {
        Self {
            next: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn generate(&self) -> String {
        self.next.fetch_add(1, Ordering::SeqCst).to_string()
    }
}

impl Default for ConnectionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

struct NativeConnection {
    queue: mpsc::Sender<Vec<u8>>,
    /// Stops reading from the native client
    cancel: CancellationToken,
    /// Stops writing to the native client, dropping whatever is queued
    abort: CancellationToken,
}

/// Local listener for one native protocol of one session
#[derive(Clone)]
pub struct ProxyServer {
    protocol: Protocol,
    sid: String,
    stream: SharedStream,
    connections: Arc<DashMap<String, NativeConnection>>,
    ids: ConnectionIdGenerator,
    shutdown: CancellationToken,
}

impl ProxyServer {
    pub fn new(protocol: Protocol, sid: impl Into<String>, stream: SharedStream) -> Self {
        Self {
            protocol,
            sid: sid.into(),
            stream,
            connections: Arc::new(DashMap::new()),
            ids: ConnectionIdGenerator::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Number of live native connections
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Accept native connections until [`ProxyServer::close_all`] is called
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ProxyError> {
        let local_addr = listener.local_addr()?;
        info!(sid = %self.sid, protocol = %self.protocol, "Listening for native connections on {}", local_addr);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer_addr)) => {
                        let server = self.clone();
                        tokio::spawn(async move {
                            server.serve_conn(socket, peer_addr).await;
                        });
                    }
                    Err(e) => {
                        warn!(sid = %self.sid, "Failed to accept native connection: {}", e);
                    }
                },
            }
        }
        debug!(sid = %self.sid, protocol = %self.protocol, "Front-end stopped");
        Ok(())
    }

    /// Relay one native connection until it closes on either side
    pub async fn serve_conn(&self, socket: TcpStream, peer_addr: SocketAddr) {
        let _ = socket.set_nodelay(true);
        let connection_id = self.ids.generate();
        let (mut reader, writer) = socket.into_split();
        let cancel = self.shutdown.child_token();
        let abort = self.shutdown.child_token();
        let (queue, queued) = mpsc::channel(WRITE_QUEUE_CAPACITY);
        self.connections.insert(
            connection_id.clone(),
            NativeConnection {
                queue,
                cancel: cancel.clone(),
                abort: abort.clone(),
            },
        );
        tokio::spawn(self.clone().write_native(
            connection_id.clone(),
            writer,
            queued,
            cancel.clone(),
            abort,
        ));
        info!(sid = %self.sid, connection_id = %connection_id, %peer_addr, "Native client connected");

        if self.protocol.server_speaks_first() {
            let connect = self
                .write_server(&connection_id, Vec::new())
                .with_spec(keys::TCP_SERVER_CONNECT, "1");
            if let Err(e) = self.stream.send(connect).await {
                warn!(sid = %self.sid, connection_id = %connection_id, "Failed to announce connection: {}", e);
            }
        }

        let mut framer = framer_for(self.protocol);
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];
        loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => break,
                read = reader.read(&mut buffer) => read,
            };
            let n = match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!(sid = %self.sid, connection_id = %connection_id, "Native read failed: {}", e);
                    break;
                }
            };
            let chunks = match framer.push(&buffer[..n]) {
                Ok(chunks) => chunks,
                Err(e) => {
                    warn!(sid = %self.sid, connection_id = %connection_id, "Closing native connection: {}", e);
                    break;
                }
            };
            let mut sent = true;
            for chunk in chunks {
                if let Err(e) = self.stream.send(self.write_server(&connection_id, chunk)).await {
                    warn!(sid = %self.sid, connection_id = %connection_id, "Failed sending upstream: {}", e);
                    sent = false;
                    break;
                }
            }
            if !sent {
                break;
            }
        }

        // Whoever removes the entry owns the cleanup; a remote close has already done it
        if self.connections.remove(&connection_id).is_some() {
            let close = Packet::new(PacketType::CloseTcpConnection)
                .with_session_id(&self.sid)
                .with_spec(keys::CLIENT_CONNECTION_ID, connection_id.as_str());
            if let Err(e) = self.stream.send(close).await {
                debug!(sid = %self.sid, connection_id = %connection_id, "Failed sending connection close: {}", e);
            }
        }
        info!(sid = %self.sid, connection_id = %connection_id, "Native client disconnected");
    }

    fn write_server(&self, connection_id: &str, payload: Vec<u8>) -> Packet {
        Packet::new(self.protocol.write_server())
            .with_session_id(&self.sid)
            .with_spec(keys::CLIENT_CONNECTION_ID, connection_id)
            .with_payload(payload)
    }

    /// Write queued payloads to the native client in order until the queue is
    /// dropped or the connection is aborted
    async fn write_native(
        self,
        connection_id: String,
        mut writer: OwnedWriteHalf,
        mut queued: mpsc::Receiver<Vec<u8>>,
        cancel: CancellationToken,
        abort: CancellationToken,
    ) {
        loop {
            let payload = tokio::select! {
                _ = abort.cancelled() => break,
                payload = queued.recv() => match payload {
                    Some(payload) => payload,
                    None => break,
                },
            };
            let written = tokio::select! {
                _ = abort.cancelled() => break,
                written = writer.write_all(&payload) => written,
            };
            if let Err(e) = written {
                warn!(sid = %self.sid, connection_id = %connection_id, "Native write failed: {}", e);
                // The read loop notices and reports the close upstream
                cancel.cancel();
                break;
            }
        }
        let _ = writer.shutdown().await;
    }

    /// Queue `payload` for the native connection `connection_id`.
    ///
    /// Packets for connections that are already gone are dropped. A client
    /// that lets its queue fill up is disconnected.
    pub fn write_client(&self, connection_id: &str, payload: Vec<u8>) {
        let Some(queue) = self
            .connections
            .get(connection_id)
            .map(|conn| conn.queue.clone())
        else {
            debug!(sid = %self.sid, connection_id = %connection_id, "Discarding packet for unknown connection");
            return;
        };
        match queue.try_send(payload) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(sid = %self.sid, connection_id = %connection_id, "Native client is not reading, disconnecting");
                if let Some(conn) = self.connections.get(connection_id) {
                    conn.abort.cancel();
                    conn.cancel.cancel();
                }
            }
            Err(TrySendError::Closed(_)) => {
                debug!(sid = %self.sid, connection_id = %connection_id, "Native writer already finished");
            }
        }
    }

    /// Close a native connection on request of the remote side.
    ///
    /// Payloads already queued are still written before the socket is shut down.
    pub fn close_connection(&self, connection_id: &str) {
        let Some((_, conn)) = self.connections.remove(connection_id) else {
            return;
        };
        conn.cancel.cancel();
        debug!(sid = %self.sid, connection_id = %connection_id, "Closed native connection");
    }

    /// Stop accepting and close every native connection
    pub fn close_all(&self) {
        self.shutdown.cancel();
        let ids: Vec<String> = self.connections.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.close_connection(&id);
        }
    }

    /// Apply a packet addressed to this front-end; returns false when the packet is not for it
    pub fn handle_packet(&self, packet: &Packet) -> bool {
        match packet.kind() {
            PacketType::WriteClient(protocol) if protocol == self.protocol => {
                if let Some(connection_id) = packet.connection_id() {
                    self.write_client(connection_id, packet.payload.clone());
                }
                true
            }
            PacketType::CloseTcpConnection => {
                if let Some(connection_id) = packet.connection_id() {
                    self.close_connection(connection_id);
                }
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatelink_transport::{memory, PacketStream};

    #[test]
    fn test_connection_ids_increment_from_one() {
        let ids = ConnectionIdGenerator::new();
        let cloned = ids.clone();
        assert_eq!(ids.generate(), "1");
        assert_eq!(cloned.generate(), "2");
        assert_eq!(ids.generate(), "3");
    }

    #[tokio::test]
    async fn test_unknown_connection_is_ignored() {
        let (local, remote) = memory::pair();
        let server = ProxyServer::new(Protocol::Postgres, "sid-1", Arc::new(local));

        server.write_client("42", b"late".to_vec());
        server.close_connection("42");
        assert!(server.handle_packet(
            &Packet::new(PacketType::CloseTcpConnection)
                .with_session_id("sid-1")
                .with_spec(keys::CLIENT_CONNECTION_ID, "42"),
        ));
        assert_eq!(server.connection_count(), 0);
        assert!(!remote.is_closed());
    }

    #[tokio::test]
    async fn test_other_protocol_packets_are_not_handled() {
        let (local, _remote) = memory::pair();
        let server = ProxyServer::new(Protocol::Postgres, "sid-1", Arc::new(local));
        let packet = Packet::new(PacketType::WriteClient(Protocol::MySql))
            .with_session_id("sid-1")
            .with_spec(keys::CLIENT_CONNECTION_ID, "1");
        assert!(!server.handle_packet(&packet));
    }
}
