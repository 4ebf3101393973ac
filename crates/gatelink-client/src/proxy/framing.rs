//! Splitting native byte streams into the chunks sent upstream

use bytes::BytesMut;
use gatelink_proto::Protocol;

use super::postgres::PgFramer;
use super::ProxyError;

/// Turns bytes read from a native socket into payloads for `*::WriteServer` packets.
///
/// A framer may hold bytes back until a protocol message is complete. An error
/// ends the native connection it belongs to.
pub trait Framer: Send {
    fn push(&mut self, data: &[u8]) -> Result<Vec<Vec<u8>>, ProxyError>;
}

/// Framer for the native protocol of a front-end
pub fn framer_for(protocol: Protocol) -> Box<dyn Framer> {
    match protocol {
        Protocol::Postgres => Box::new(PgFramer::new()),
        Protocol::Mssql => Box::new(LengthFramer::tds()),
        Protocol::MongoDb => Box::new(LengthFramer::mongodb()),
        Protocol::MySql | Protocol::Tcp => Box::new(RawFramer),
    }
}

/// Forwards every read as-is
pub struct RawFramer;

impl Framer for RawFramer {
    fn push(&mut self, data: &[u8]) -> Result<Vec<Vec<u8>>, ProxyError> {
        Ok(vec![data.to_vec()])
    }
}

/// Forwards whole messages of a protocol whose header carries the total message length
pub struct LengthFramer {
    name: &'static str,
    buf: BytesMut,
    header_len: usize,
    max_len: usize,
    length_of: fn(&[u8]) -> usize,
}

impl LengthFramer {
    /// TDS packets: 8-byte header, big-endian total length at offset 2
    pub fn tds() -> Self {
        Self {
            name: "TDS",
            buf: BytesMut::new(),
            header_len: 8,
            max_len: u16::MAX as usize,
            length_of: |h| u16::from_be_bytes([h[2], h[3]]) as usize,
        }
    }

    /// MongoDB wire messages: 16-byte header, little-endian total length at offset 0
    pub fn mongodb() -> Self {
        Self {
            name: "MongoDB",
            buf: BytesMut::new(),
            header_len: 16,
            max_len: 48 * 1024 * 1024,
            length_of: |h| i32::from_le_bytes([h[0], h[1], h[2], h[3]]).max(0) as usize,
        }
    }
}

impl Framer for LengthFramer {
    fn push(&mut self, data: &[u8]) -> Result<Vec<Vec<u8>>, ProxyError> {
        self.buf.extend_from_slice(data);
        let mut messages = Vec::new();
        while self.buf.len() >= self.header_len {
            let len = (self.length_of)(&self.buf[..self.header_len]);
            if len < self.header_len || len > self.max_len {
                return Err(ProxyError::InvalidFrame(format!(
                    "{} message length {} out of range",
                    self.name, len
                )));
            }
            if self.buf.len() < len {
                break;
            }
            messages.push(self.buf.split_to(len).to_vec());
        }
        Ok(messages)
    }
}
