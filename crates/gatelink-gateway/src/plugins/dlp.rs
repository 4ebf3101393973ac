//! Data masking of command and terminal output

use async_trait::async_trait;
use gatelink_proto::{keys, Packet, PacketType};
use regex_lite::Regex;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use super::{ConnectResponse, Plugin, PluginContext, PluginError, PLUGIN_DLP};

const MASK: char = '*';

/// Info types this plugin knows how to detect
const INFO_TYPE_PATTERNS: &[(&str, &str)] = &[
    ("EMAIL_ADDRESS", r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}"),
    ("CREDIT_CARD_NUMBER", r"\b\d{4}[ -]?\d{4}[ -]?\d{4}[ -]?\d{1,4}\b"),
    ("IP_ADDRESS", r"\b(?:\d{1,3}\.){3}\d{1,3}\b"),
    ("PHONE_NUMBER", r"\+?\d{1,3}?[-. ]?\(?\d{3}\)?[-. ]\d{3}[-. ]\d{4}\b"),
];

/// Masks configured info types in output sent to the client and records a
/// per-packet summary under `dlp.transformation_summary`.
pub struct DlpPlugin {
    detectors: Vec<(&'static str, Regex)>,
}

impl DlpPlugin {
    pub fn new() -> Self {
        let detectors = INFO_TYPE_PATTERNS
            .iter()
            .filter_map(|(name, pattern)| match Regex::new(pattern) {
                Ok(re) => Some((*name, re)),
                Err(e) => {
                    warn!(info_type = name, "Failed compiling detector: {}", e);
                    None
                }
            })
            .collect();
        Self { detectors }
    }

    /// Mask every enabled info type in `text`, returning the masked text and
    /// the number of findings per info type
    pub fn mask(&self, text: &str, enabled: &[String]) -> (String, BTreeMap<String, usize>) {
        let mut output = text.to_string();
        let mut summary = BTreeMap::new();
        for (name, regex) in &self.detectors {
            if !enabled.iter().any(|e| e == name) {
                continue;
            }
            let mut count = 0;
            output = regex
                .replace_all(&output, |caps: &regex_lite::Captures<'_>| {
                    count += 1;
                    MASK.to_string().repeat(caps[0].chars().count())
                })
                .into_owned();
            if count > 0 {
                summary.insert(name.to_string(), count);
            }
        }
        (output, summary)
    }
}

impl Default for DlpPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Plugin for DlpPlugin {
    fn name(&self) -> &'static str {
        PLUGIN_DLP
    }

    async fn on_connect(&self, _ctx: PluginContext<'_>) -> Result<(), PluginError> {
        Ok(())
    }

    async fn on_receive(
        &self,
        ctx: PluginContext<'_>,
        packet: &mut Packet,
    ) -> Result<Option<ConnectResponse>, PluginError> {
        if ctx.config.is_empty() {
            return Ok(None);
        }
        let kind = packet.kind();
        if kind == PacketType::SessionOpen {
            packet
                .spec
                .insert(keys::DLP_INFO_TYPES.to_string(), ctx.config.join(",").into_bytes());
            return Ok(None);
        }
        if !kind.is_output() || packet.payload.is_empty() {
            return Ok(None);
        }

        let text = String::from_utf8_lossy(&packet.payload).into_owned();
        let (masked, summary) = self.mask(&text, ctx.config);
        if summary.is_empty() {
            return Ok(None);
        }
        debug!(sid = %ctx.session.sid, ?summary, "Masked output");
        packet.payload = masked.into_bytes();
        let encoded = serde_json::to_vec(&summary)
            .map_err(|e| PluginError::Internal(format!("failed encoding dlp summary: {}", e)))?;
        packet
            .spec
            .insert(keys::DLP_TRANSFORMATION_SUMMARY.to_string(), encoded);
        Ok(None)
    }

    async fn on_disconnect(
        &self,
        _ctx: PluginContext<'_>,
        _error: Option<&str>,
    ) -> Result<(), PluginError> {
        Ok(())
    }
}
