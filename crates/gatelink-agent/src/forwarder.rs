use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use gatelink_proto::{keys, Packet, PacketType, Protocol};
use gatelink_transport::{SharedStream, TransportError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

/// Payloads queued per sub-connection before the target counts as stalled
pub const WRITE_QUEUE_CAPACITY: usize = 256;

/// Errors that can occur while relaying to a native target
#[derive(Error, Debug)]
pub enum ForwarderError {
    #[error("Failed to connect to remote address {address}: {source}")]
    ConnectionFailed {
        address: String,
        source: std::io::Error,
    },

    #[error("Timed out connecting to remote address {0}")]
    ConnectTimeout(String),

    #[error("target {0} is not reading")]
    TargetStalled(String),

    #[error("connection {0} is already closed")]
    ConnectionClosed(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("IO error during forwarding: {0}")]
    Io(#[from] std::io::Error),
}

type ConnectionKey = (String, String);

struct TargetConnection {
    queue: mpsc::Sender<Vec<u8>>,
    /// Stops reading from the target; queued writes still drain
    reader: CancellationToken,
    /// Stops the connection outright
    abort: CancellationToken,
}

/// Relays native sub-connections between the gateway stream and their targets.
///
/// Each `(session ID, connection ID)` pair owns one TCP connection to the
/// target, dialed when its first `*::WriteServer` packet arrives. Writes go
/// through a bounded queue served by the connection's own task, so a slow
/// target never holds up the gateway stream.
#[derive(Clone)]
pub struct TcpForwarder {
    connections: Arc<DashMap<ConnectionKey, TargetConnection>>,
    dial_timeout: Duration,
}

impl TcpForwarder {
    pub fn new(dial_timeout: Duration) -> Self {
        Self {
            connections: Arc::new(DashMap::new()),
            dial_timeout,
        }
    }

    /// Number of open target connections
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    pub fn contains(&self, sid: &str, connection_id: &str) -> bool {
        self.connections
            .contains_key(&(sid.to_string(), connection_id.to_string()))
    }

    /// Dial `address` and give up after the dial timeout
    pub async fn dial(&self, address: &str) -> Result<TcpStream, ForwarderError> {
        let socket = tokio::time::timeout(self.dial_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| ForwarderError::ConnectTimeout(address.to_string()))?
            .map_err(|e| ForwarderError::ConnectionFailed {
                address: address.to_string(),
                source: e,
            })?;
        let _ = socket.set_nodelay(true);
        Ok(socket)
    }

    /// Queue `payload` for the target of a sub-connection, starting the
    /// connection if it does not exist yet.
    ///
    /// Fails with [`ForwarderError::TargetStalled`] once the queue is full.
    pub fn write(
        &self,
        stream: &SharedStream,
        protocol: Protocol,
        sid: &str,
        connection_id: &str,
        address: &str,
        payload: Vec<u8>,
    ) -> Result<(), ForwarderError> {
        let key = (sid.to_string(), connection_id.to_string());
        let (queue, started) = match self.connections.entry(key.clone()) {
            Entry::Occupied(entry) => (entry.get().queue.clone(), None),
            Entry::Vacant(entry) => {
                let (queue, queued) = mpsc::channel(WRITE_QUEUE_CAPACITY);
                let reader = CancellationToken::new();
                let abort = CancellationToken::new();
                entry.insert(TargetConnection {
                    queue: queue.clone(),
                    reader: reader.clone(),
                    abort: abort.clone(),
                });
                (queue, Some((queued, reader, abort)))
            }
        };
        if let Some((queued, reader, abort)) = started {
            tokio::spawn(self.clone().run_connection(
                stream.clone(),
                protocol,
                key,
                address.to_string(),
                queued,
                reader,
                abort,
            ));
        }

        if payload.is_empty() {
            return Ok(());
        }
        match queue.try_send(payload) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(ForwarderError::TargetStalled(address.to_string())),
            Err(TrySendError::Closed(_)) => {
                Err(ForwarderError::ConnectionClosed(connection_id.to_string()))
            }
        }
    }

    /// Dial the target, then write queued payloads in order until the queue
    /// is dropped or the connection is aborted
    #[allow(clippy::too_many_arguments)]
    async fn run_connection(
        self,
        stream: SharedStream,
        protocol: Protocol,
        key: ConnectionKey,
        address: String,
        mut queued: mpsc::Receiver<Vec<u8>>,
        reader: CancellationToken,
        abort: CancellationToken,
    ) {
        let (sid, connection_id) = &key;
        let dialed = tokio::select! {
            _ = abort.cancelled() => return,
            dialed = self.dial(&address) => dialed,
        };
        let socket = match dialed {
            Ok(socket) => socket,
            Err(e) => {
                tracing::warn!(sid = %sid, connection_id = %connection_id, "Forwarding failed: {}", e);
                self.finish(&stream, &key, Some(e.to_string())).await;
                return;
            }
        };
        tracing::info!(
            sid = %sid,
            connection_id = %connection_id,
            remote_address = %address,
            "Connected to target"
        );

        let (read_half, mut writer) = socket.into_split();
        tokio::spawn(self.clone().copy_to_gateway(
            stream.clone(),
            protocol,
            key.clone(),
            read_half,
            reader.clone(),
            abort.clone(),
        ));

        let mut total_bytes = 0u64;
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
                tracing::warn!(sid = %sid, connection_id = %connection_id, "Error writing to target: {}", e);
                reader.cancel();
                self.finish(&stream, &key, Some(e.to_string())).await;
                break;
            }
            total_bytes += payload.len() as u64;
        }
        let _ = writer.shutdown().await;
        tracing::debug!(
            sid = %sid,
            connection_id = %connection_id,
            bytes_to_target = total_bytes,
            "Target writer finished"
        );
    }

    /// Read from the target and send everything back as `*::WriteClient` packets
    async fn copy_to_gateway(
        self,
        stream: SharedStream,
        protocol: Protocol,
        key: ConnectionKey,
        mut read_half: OwnedReadHalf,
        reader: CancellationToken,
        abort: CancellationToken,
    ) {
        let (sid, connection_id) = &key;
        let mut total_bytes = 0u64;
        let mut buffer = vec![0u8; 16384]; // 16KB buffer

        let cancelled = loop {
            let read = tokio::select! {
                _ = reader.cancelled() => break true,
                read = read_half.read(&mut buffer) => read,
            };
            match read {
                Ok(0) => {
                    tracing::debug!(sid = %sid, connection_id = %connection_id, "Target closed the connection");
                    break false;
                }
                Ok(n) => {
                    let packet = Packet::new(protocol.write_client())
                        .with_session_id(sid)
                        .with_spec(keys::CLIENT_CONNECTION_ID, connection_id.as_str())
                        .with_payload(buffer[..n].to_vec());
                    if let Err(e) = stream.send(packet).await {
                        tracing::warn!(sid = %sid, "Failed relaying target bytes: {}", e);
                        break false;
                    }
                    total_bytes += n as u64;
                }
                Err(e) => {
                    tracing::error!(sid = %sid, connection_id = %connection_id, "Error reading from target: {}", e);
                    break false;
                }
            }
        };

        if !cancelled {
            abort.cancel();
            self.finish(&stream, &key, None).await;
        }

        tracing::info!(
            sid = %sid,
            connection_id = %connection_id,
            bytes_to_gateway = total_bytes,
            "Target connection finished"
        );
    }

    /// Drop a connection that ended on the agent side and tell the gateway.
    ///
    /// A close requested by the gateway has already removed the entry.
    async fn finish(&self, stream: &SharedStream, key: &ConnectionKey, reason: Option<String>) {
        if self.connections.remove(key).is_none() {
            return;
        }
        let (sid, connection_id) = key;
        let mut close = Packet::new(PacketType::CloseTcpConnection)
            .with_session_id(sid)
            .with_spec(keys::CLIENT_CONNECTION_ID, connection_id.as_str());
        if let Some(reason) = reason {
            close = close.with_payload(reason);
        }
        let _ = stream.send(close).await;
    }

    /// Close one sub-connection; unknown connections are ignored.
    ///
    /// Payloads already queued are still written before the target sees EOF.
    pub fn close(&self, sid: &str, connection_id: &str) -> bool {
        let key = (sid.to_string(), connection_id.to_string());
        let Some((_, conn)) = self.connections.remove(&key) else {
            return false;
        };
        conn.reader.cancel();
        true
    }

    /// Close every sub-connection of a session
    pub fn close_session(&self, sid: &str) -> usize {
        let ids: Vec<String> = self
            .connections
            .iter()
            .filter(|e| e.key().0 == sid)
            .map(|e| e.key().1.clone())
            .collect();
        ids.iter()
            .filter(|connection_id| self.close(sid, connection_id))
            .count()
    }

    /// Abort every sub-connection without draining queued writes
    pub fn close_all(&self) {
        let keys: Vec<ConnectionKey> = self.connections.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, conn)) = self.connections.remove(&key) {
                conn.reader.cancel();
                conn.abort.cancel();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatelink_transport::{memory, PacketStream};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_dial_failure_reports_address() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let forwarder = TcpForwarder::new(Duration::from_secs(1));
        let err = forwarder.dial(&addr).await.unwrap_err();
        assert!(err.to_string().contains(&addr));
    }

    #[tokio::test]
    async fn test_target_eof_reports_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"hello").await.unwrap();
        });

        let (local, gateway) = memory::pair();
        let local: SharedStream = Arc::new(local);
        let forwarder = TcpForwarder::new(Duration::from_secs(1));
        forwarder
            .write(&local, Protocol::Tcp, "sid-1", "1", &addr, Vec::new())
            .unwrap();

        let data = gateway.recv().await.unwrap().unwrap();
        assert_eq!(data.kind(), PacketType::WriteClient(Protocol::Tcp));
        assert_eq!(data.payload, b"hello");
        let close = gateway.recv().await.unwrap().unwrap();
        assert_eq!(close.kind(), PacketType::CloseTcpConnection);
        assert_eq!(close.connection_id(), Some("1"));
        assert_eq!(forwarder.count(), 0);
    }

    #[tokio::test]
    async fn test_close_unknown_connection_is_noop() {
        let forwarder = TcpForwarder::new(Duration::from_secs(1));
        assert!(!forwarder.close("sid-1", "9"));
        assert_eq!(forwarder.close_session("sid-1"), 0);
    }

    #[tokio::test]
    async fn test_unreachable_target_reports_close_with_reason() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let (local, gateway) = memory::pair();
        let local: SharedStream = Arc::new(local);
        let forwarder = TcpForwarder::new(Duration::from_secs(1));
        forwarder
            .write(&local, Protocol::Tcp, "sid-1", "1", &addr, b"SELECT 1".to_vec())
            .unwrap();

        let close = gateway.recv().await.unwrap().unwrap();
        assert_eq!(close.kind(), PacketType::CloseTcpConnection);
        assert_eq!(close.connection_id(), Some("1"));
        assert!(close.payload_str().contains(&addr));
        assert_eq!(forwarder.count(), 0);
    }

    #[tokio::test]
    async fn test_write_fails_fast_when_target_stops_reading() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let (local, _gateway) = memory::pair();
        let local: SharedStream = Arc::new(local);
        let forwarder = TcpForwarder::new(Duration::from_secs(1));
        let chunk = vec![0u8; 64 * 1024];
        let mut stalled = None;
        for _ in 0..8192 {
            match forwarder.write(&local, Protocol::Tcp, "sid-1", "1", &addr, chunk.clone()) {
                Ok(()) => tokio::task::yield_now().await,
                Err(e) => {
                    stalled = Some(e);
                    break;
                }
            }
        }
        assert!(matches!(stalled, Some(ForwarderError::TargetStalled(_))));

        // The rest of the session is unaffected
        assert!(forwarder.close("sid-1", "1"));
        assert_eq!(forwarder.count(), 0);
    }
}
