//! Stream transport for gateway sessions
//!
//! Every client session and every agent talks to the gateway over a single
//! bidirectional, ordered, reliable stream of [`Packet`]s. This crate provides
//! the transport-agnostic [`PacketStream`] trait used by the rest of the system,
//! a length-prefixed implementation over any async byte stream
//! ([`FramedStream`]), an in-memory pair for tests and in-process wiring, and the
//! keep-alive task.
//!
//! # Concurrency contract
//!
//! - `send` may be called concurrently; writes are serialized internally.
//! - `recv` is meant for a single consumer task per stream. Concurrent callers
//!   are serialized too, but the order in which they observe packets is not
//!   meaningful.
//! - `close` is idempotent and wakes a pending `recv`.

use async_trait::async_trait;
use gatelink_proto::{keys::header, CodecError, Packet, PacketType};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use thiserror::Error;

pub mod framed;
pub mod keepalive;
pub mod memory;

pub use framed::FramedStream;
pub use keepalive::{start_keep_alive, DEFAULT_KEEP_ALIVE_INTERVAL};

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Stream closed")]
    StreamClosed,

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Timeout")]
    Timeout,

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// A bidirectional packet stream
#[async_trait]
pub trait PacketStream: Send + Sync + Debug {
    /// Send a packet on this stream
    async fn send(&self, packet: Packet) -> TransportResult<()>;

    /// Receive the next packet
    ///
    /// Returns `None` once the stream has been closed by either side.
    async fn recv(&self) -> TransportResult<Option<Packet>>;

    /// Close the stream and the underlying connection
    async fn close(&self) -> TransportResult<()>;

    /// Check if the stream is closed
    fn is_closed(&self) -> bool;

    /// Process-unique identifier, used for logging
    fn stream_id(&self) -> u64;
}

/// Shared handle to a packet stream
pub type SharedStream = Arc<dyn PacketStream>;

/// Headers exchanged in the handshake packet that opens every stream
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamHeaders(HashMap<String, String>);

impl StreamHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        self.0.insert(key.to_string(), value.into());
    }

    /// Header value; empty values read as absent
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    pub fn get_or_default(&self, key: &str) -> String {
        self.get(key).unwrap_or_default().to_string()
    }

    pub fn origin(&self) -> Option<&str> {
        self.get(header::ORIGIN)
    }

    pub fn as_map(&self) -> &HashMap<String, String> {
        &self.0
    }

    pub fn to_packet(&self) -> Packet {
        let mut packet = Packet::new(PacketType::Handshake);
        for (key, value) in &self.0 {
            packet.spec.insert(key.clone(), value.clone().into_bytes());
        }
        packet
    }

    pub fn from_packet(packet: &Packet) -> TransportResult<Self> {
        if packet.kind() != PacketType::Handshake {
            return Err(TransportError::ProtocolError(format!(
                "expected handshake, got {}",
                packet.packet_type
            )));
        }
        let headers = packet
            .spec
            .iter()
            .map(|(k, v)| (k.clone(), String::from_utf8_lossy(v).into_owned()))
            .collect();
        Ok(Self(headers))
    }
}
