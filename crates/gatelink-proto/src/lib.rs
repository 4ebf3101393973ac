//! Gatelink Protocol Definitions
//!
//! This crate defines the wire unit exchanged on every gateway stream (the
//! [`Packet`]), the closed set of packet types, the header ("spec") vocabulary,
//! and the length-prefixed codec used to frame packets on a byte stream.

pub mod codec;
pub mod connection;
pub mod keys;
pub mod metadata;
pub mod packet;
pub mod params;
pub mod stream_id;
pub mod types;

pub use codec::{CodecError, PacketCodec};
pub use connection::{AgentMode, ClientVerb, ConnectionType};
pub use metadata::AgentMetadata;
pub use packet::{Packet, ProtoError};
pub use params::{AgentConnectionParams, GuardrailRule, GuardrailRuleSet};
pub use stream_id::StreamAgentId;
pub use types::{PacketType, Protocol};

/// Protocol version advertised in the stream handshake
pub const PROTOCOL_VERSION: u32 = 1;

/// Exit code reported to clients when no native exit code is available
pub const INTERNAL_ERROR_EXIT_CODE: i32 = 254;

/// Origin header value for agent streams
pub const ORIGIN_AGENT: &str = "agent";

/// Origin header value for client streams
pub const ORIGIN_CLIENT: &str = "client";
