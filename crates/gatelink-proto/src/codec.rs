//! Length-prefixed framing of packets on a byte stream

use crate::packet::Packet;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Packet too large: {0} bytes")]
    PacketTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Packet codec
///
/// Format: `[length: u32 BE][bincode serialized Packet]`
#[derive(Debug, Default, Clone, Copy)]
pub struct PacketCodec;

impl PacketCodec {
    /// Maximum encoded packet size (16MB)
    pub const MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;

    const HEADER_LEN: usize = 4;

    /// Encode a packet to bytes
    pub fn encode(packet: &Packet) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::new();
        Self::encode_into(packet, &mut buf)?;
        Ok(buf.freeze())
    }

    fn encode_into(packet: &Packet, buf: &mut BytesMut) -> Result<(), CodecError> {
        let body = bincode::serialize(packet)?;
        if body.len() > Self::MAX_PACKET_SIZE {
            return Err(CodecError::PacketTooLarge(body.len()));
        }
        buf.reserve(Self::HEADER_LEN + body.len());
        buf.put_u32(body.len() as u32);
        buf.extend_from_slice(&body);
        Ok(())
    }

    /// Decode one packet from the front of `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed; consumed bytes are
    /// removed from the buffer only once a whole packet is available.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Packet>, CodecError> {
        if buf.len() < Self::HEADER_LEN {
            return Ok(None);
        }

        let mut header = [0u8; 4];
        header.copy_from_slice(&buf[..Self::HEADER_LEN]);
        let length = u32::from_be_bytes(header) as usize;

        if length > Self::MAX_PACKET_SIZE {
            return Err(CodecError::PacketTooLarge(length));
        }

        if buf.len() < Self::HEADER_LEN + length {
            buf.reserve(Self::HEADER_LEN + length - buf.len());
            return Ok(None);
        }

        buf.advance(Self::HEADER_LEN);
        let body = buf.split_to(length);
        Ok(Some(bincode::deserialize(&body)?))
    }

    /// Decode every complete packet currently in `buf`
    pub fn decode_all(buf: &mut BytesMut) -> Result<Vec<Packet>, CodecError> {
        let mut packets = Vec::new();
        while let Some(packet) = Self::decode(buf)? {
            packets.push(packet);
        }
        Ok(packets)
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, CodecError> {
        PacketCodec::decode(src)
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), CodecError> {
        PacketCodec::encode_into(&item, dst)
    }
}
