//! Packet stream over any async byte stream

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use gatelink_proto::{Packet, PacketCodec};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{PacketStream, StreamHeaders, TransportError, TransportResult};

/// Deadline for dialing and for the handshake exchange
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// How long a close waits for buffered packets to reach the peer
pub const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// Length-prefixed packet stream over `T`
pub struct FramedStream<T> {
    id: u64,
    reader: Mutex<FramedRead<ReadHalf<T>, PacketCodec>>,
    writer: Mutex<FramedWrite<WriteHalf<T>, PacketCodec>>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl<T> FramedStream<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(io: T) -> Self {
        let (read, write) = tokio::io::split(io);
        Self {
            id: NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed),
            reader: Mutex::new(FramedRead::new(read, PacketCodec)),
            writer: Mutex::new(FramedWrite::new(write, PacketCodec)),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    /// Wrap `io` and send the opening handshake
    pub async fn open(io: T, headers: &StreamHeaders) -> TransportResult<Self> {
        let stream = Self::new(io);
        stream.send(headers.to_packet()).await?;
        Ok(stream)
    }

    /// Wrap `io` and wait for the peer's handshake
    pub async fn accept(io: T) -> TransportResult<(Self, StreamHeaders)> {
        let stream = Self::new(io);
        let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, stream.recv())
            .await
            .map_err(|_| TransportError::Timeout)??;
        let packet = first.ok_or(TransportError::StreamClosed)?;
        let headers = StreamHeaders::from_packet(&packet)?;
        debug!(stream_id = stream.id, origin = ?headers.origin(), "Accepted stream handshake");
        Ok((stream, headers))
    }

    /// Token cancelled when the stream is closed
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

impl FramedStream<TcpStream> {
    /// Dial `addr` and send the opening handshake
    pub async fn connect(addr: SocketAddr, headers: &StreamHeaders) -> TransportResult<Self> {
        let socket = tokio::time::timeout(HANDSHAKE_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::ConnectionError(format!("{}: {}", addr, e)))?;
        socket.set_nodelay(true)?;
        Self::open(socket, headers).await
    }
}

#[async_trait]
impl<T> PacketStream for FramedStream<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn send(&self, packet: Packet) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::StreamClosed);
        }
        // A peer that stopped reading must not hold senders past a close
        let mut writer = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(TransportError::StreamClosed),
            writer = self.writer.lock() => writer,
        };
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(TransportError::StreamClosed),
            sent = writer.send(packet) => Ok(sent?),
        }
    }

    async fn recv(&self) -> TransportResult<Option<Packet>> {
        if self.is_closed() {
            return Ok(None);
        }
        let mut reader = self.reader.lock().await;
        tokio::select! {
            _ = self.shutdown.cancelled() => Ok(None),
            next = reader.next() => match next {
                Some(Ok(packet)) => Ok(Some(packet)),
                Some(Err(e)) => Err(e.into()),
                None => Ok(None),
            },
        }
    }

    async fn close(&self) -> TransportResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.cancel();
        let mut writer = self.writer.lock().await;
        let Ok(closed) = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, writer.close()).await else {
            debug!(stream_id = self.id, "Peer did not drain the stream before close");
            return Ok(());
        };
        match closed {
            Ok(()) => Ok(()),
            // The peer may already be gone; closing is still complete locally
            Err(gatelink_proto::CodecError::Io(e))
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::BrokenPipe
                        | std::io::ErrorKind::NotConnected
                        | std::io::ErrorKind::ConnectionReset
                ) =>
            {
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn stream_id(&self) -> u64 {
        self.id
    }
}

impl<T> fmt::Debug for FramedStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramedStream")
            .field("id", &self.id)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}
