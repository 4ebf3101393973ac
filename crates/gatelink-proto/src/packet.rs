//! The packet, the atomic transport unit

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::keys;
use crate::types::PacketType;

/// Protocol-level errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtoError {
    #[error("packet {packet_type} is missing required spec key {key}")]
    MissingSpec { packet_type: String, key: String },

    #[error("unsupported packet type {0}")]
    Unsupported(String),

    #[error("invalid spec value for {key}: {reason}")]
    InvalidSpec { key: String, reason: String },
}

/// A typed, headered, binary-payload frame.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Packet {
    #[serde(rename = "type")]
    pub packet_type: String,
    pub payload: Vec<u8>,
    pub spec: HashMap<String, Vec<u8>>,
}

impl Packet {
    pub fn new(packet_type: PacketType) -> Self {
        Self {
            packet_type: packet_type.as_wire(),
            payload: Vec::new(),
            spec: HashMap::new(),
        }
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn with_spec(mut self, key: &str, value: impl Into<Vec<u8>>) -> Self {
        self.spec.insert(key.to_string(), value.into());
        self
    }

    pub fn with_session_id(self, session_id: &str) -> Self {
        self.with_spec(keys::SESSION_ID, session_id)
    }

    /// Parsed packet type
    pub fn kind(&self) -> PacketType {
        PacketType::from_wire(&self.packet_type)
    }

    pub fn spec_bytes(&self, key: &str) -> Option<&[u8]> {
        self.spec.get(key).map(Vec::as_slice)
    }

    /// Spec value as UTF-8; non UTF-8 or empty values read as absent
    pub fn spec_str(&self, key: &str) -> Option<&str> {
        self.spec
            .get(key)
            .and_then(|v| std::str::from_utf8(v).ok())
            .filter(|v| !v.is_empty())
    }

    /// Spec value that must be present
    pub fn require_spec(&self, key: &str) -> Result<&str, ProtoError> {
        self.spec_str(key).ok_or_else(|| ProtoError::MissingSpec {
            packet_type: self.packet_type.clone(),
            key: key.to_string(),
        })
    }

    pub fn session_id(&self) -> Option<&str> {
        self.spec_str(keys::SESSION_ID)
    }

    pub fn connection_id(&self) -> Option<&str> {
        self.spec_str(keys::CLIENT_CONNECTION_ID)
    }

    /// Exit code carried by a session close, if any
    pub fn exit_code(&self) -> Option<i32> {
        self.spec_str(keys::CLIENT_EXIT_CODE)
            .and_then(|v| v.trim().parse().ok())
    }

    /// Check that every spec key required by the packet type is present
    pub fn validate(&self) -> Result<PacketType, ProtoError> {
        let kind = self.kind();
        for key in kind.required_spec_keys() {
            self.require_spec(key)?;
        }
        Ok(kind)
    }

    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Protocol;

    #[test]
    fn test_validate_requires_session_id() {
        let pkt = Packet::new(PacketType::SessionOpen);
        let err = pkt.validate().unwrap_err();
        assert_eq!(
            err,
            ProtoError::MissingSpec {
                packet_type: "SessionOpen".into(),
                key: keys::SESSION_ID.into(),
            }
        );

        let pkt = pkt.with_session_id("sid-1");
        assert_eq!(pkt.validate().unwrap(), PacketType::SessionOpen);
    }

    #[test]
    fn test_validate_requires_connection_id_for_writes() {
        let pkt = Packet::new(Protocol::Postgres.write_server()).with_session_id("sid-1");
        assert!(matches!(
            pkt.validate(),
            Err(ProtoError::MissingSpec { ref key, .. }) if key == keys::CLIENT_CONNECTION_ID
        ));

        let pkt = pkt.with_spec(keys::CLIENT_CONNECTION_ID, "1");
        assert!(pkt.validate().is_ok());
    }

    #[test]
    fn test_empty_spec_value_is_missing() {
        let pkt = Packet::new(PacketType::SessionClose).with_session_id("");
        assert!(pkt.session_id().is_none());
        assert!(pkt.validate().is_err());
    }

    #[test]
    fn test_exit_code() {
        let pkt = Packet::new(PacketType::SessionClose).with_spec(keys::CLIENT_EXIT_CODE, "3");
        assert_eq!(pkt.exit_code(), Some(3));

        let pkt = Packet::new(PacketType::SessionClose).with_spec(keys::CLIENT_EXIT_CODE, "x");
        assert_eq!(pkt.exit_code(), None);
    }

    #[test]
    fn test_unknown_type_round_trips_as_string() {
        let pkt = Packet {
            packet_type: "Future::Thing".into(),
            ..Default::default()
        };
        assert!(pkt.kind().is_unsupported());
        assert_eq!(pkt.validate().unwrap(), PacketType::Unsupported("Future::Thing".into()));
    }
}
