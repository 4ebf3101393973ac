//! Parameters the gateway hands to an agent when opening a session

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::packet::{Packet, ProtoError};
use crate::{keys, ClientVerb};

/// A single guardrail rule
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GuardrailRule {
    /// `deny_words_list` or `pattern_match`
    #[serde(rename = "type")]
    pub rule_type: String,
    #[serde(default)]
    pub words: Vec<String>,
    #[serde(default)]
    pub pattern_regex: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GuardrailRuleSet {
    #[serde(default)]
    pub rules: Vec<GuardrailRule>,
}

/// Everything an agent needs to reach the target of one session
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AgentConnectionParams {
    pub connection_name: String,
    pub connection_type: String,
    /// Target settings (`host`, `port`, `user`, ...)
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
    /// Command line for command-line connections
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub client_args: Vec<String>,
    pub client_verb: Option<ClientVerb>,
    #[serde(default)]
    pub client_origin: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub dlp_info_types: Vec<String>,
    #[serde(default)]
    pub guardrail_input_rules: Vec<GuardrailRuleSet>,
    #[serde(default)]
    pub guardrail_output_rules: Vec<GuardrailRuleSet>,
}

impl AgentConnectionParams {
    /// `host:port` of the native target, when both are configured
    pub fn target_address(&self) -> Option<String> {
        let host = self.env_vars.get("host").filter(|h| !h.is_empty())?;
        let port = self.env_vars.get("port").filter(|p| !p.is_empty())?;
        Some(format!("{}:{}", host, port))
    }

    pub fn encode(&self) -> Vec<u8> {
        // Serializing plain strings and maps into JSON cannot fail
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn decode(packet: &Packet) -> Result<Self, ProtoError> {
        let raw = packet
            .spec_bytes(keys::AGENT_CONNECTION_PARAMS)
            .ok_or_else(|| ProtoError::MissingSpec {
                packet_type: packet.packet_type.clone(),
                key: keys::AGENT_CONNECTION_PARAMS.to_string(),
            })?;
        serde_json::from_slice(raw).map_err(|e| ProtoError::InvalidSpec {
            key: keys::AGENT_CONNECTION_PARAMS.to_string(),
            reason: e.to_string(),
        })
    }
}
