//! Guardrails: deny-word and pattern rules on session input and output

use async_trait::async_trait;
use gatelink_proto::{GuardrailRule, GuardrailRuleSet, Packet, PacketType};
use regex_lite::Regex;
use tracing::info;

use super::{ConnectResponse, Plugin, PluginContext, PluginError, PLUGIN_GUARDRAILS};

const DENY_WORDS_LIST: &str = "deny_words_list";
const PATTERN_MATCH: &str = "pattern_match";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::Input => "input",
            Direction::Output => "output",
        }
    }
}

fn rule_error(rule: &GuardrailRule, direction: Direction) -> PluginError {
    if rule.name.is_empty() {
        PluginError::Denied(format!(
            "validation error, match guard rails {} rule",
            direction.as_str()
        ))
    } else {
        PluginError::Denied(format!(
            "validation error, match guard rails {} rule, name={}",
            direction.as_str(),
            rule.name
        ))
    }
}

fn check_rule(rule: &GuardrailRule, direction: Direction, data: &str) -> Result<(), PluginError> {
    match rule.rule_type.as_str() {
        DENY_WORDS_LIST => {
            if rule.words.iter().any(|w| !w.is_empty() && data.contains(w.as_str())) {
                return Err(rule_error(rule, direction));
            }
        }
        PATTERN_MATCH => {
            let regex = Regex::new(&rule.pattern_regex).map_err(|e| {
                PluginError::Internal(format!("failed parsing guard rails regex, reason={}", e))
            })?;
            if regex.is_match(data) {
                return Err(rule_error(rule, direction));
            }
        }
        other => {
            return Err(PluginError::Internal(format!(
                "unknown guard rails rule type {:?}",
                other
            )))
        }
    }
    Ok(())
}

/// Validate `data` against every rule of every rule set
pub fn validate(
    rule_sets: &[GuardrailRuleSet],
    direction: Direction,
    data: &[u8],
) -> Result<(), PluginError> {
    if rule_sets.is_empty() || data.is_empty() {
        return Ok(());
    }
    let text = String::from_utf8_lossy(data);
    for rule in rule_sets.iter().flat_map(|set| set.rules.iter()) {
        check_rule(rule, direction, &text)?;
    }
    Ok(())
}

/// Applies the connection's guardrail rules at the gateway, before any
/// matching input reaches the agent.
#[derive(Debug, Default)]
pub struct GuardrailsPlugin;

impl GuardrailsPlugin {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Plugin for GuardrailsPlugin {
    fn name(&self) -> &'static str {
        PLUGIN_GUARDRAILS
    }

    async fn on_connect(&self, _ctx: PluginContext<'_>) -> Result<(), PluginError> {
        Ok(())
    }

    async fn on_receive(
        &self,
        ctx: PluginContext<'_>,
        packet: &mut Packet,
    ) -> Result<Option<ConnectResponse>, PluginError> {
        let connection = &ctx.session.connection;
        let kind = packet.kind();
        let result = match kind {
            PacketType::SessionOpen | PacketType::ExecWriteStdin | PacketType::TerminalWriteStdin => {
                validate(&connection.guardrail_input_rules, Direction::Input, &packet.payload)
            }
            ref k if k.is_output() => {
                validate(&connection.guardrail_output_rules, Direction::Output, &packet.payload)
            }
            _ => Ok(()),
        };
        if let Err(ref e) = result {
            info!(sid = %ctx.session.sid, packet_type = %kind, "Guardrails blocked packet: {}", e);
        }
        result.map(|_| None)
    }

    async fn on_disconnect(
        &self,
        _ctx: PluginContext<'_>,
        _error: Option<&str>,
    ) -> Result<(), PluginError> {
        Ok(())
    }
}
