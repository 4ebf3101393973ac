//! Interception pipeline
//!
//! Every session carries an ordered list of plugins. They are invoked when the
//! session is set up (`on_connect`), for every packet in either direction
//! (`on_receive`) and when the session ends (`on_disconnect`). A plugin may veto
//! setup, fail a single packet exchange, or answer the client directly by
//! returning a [`ConnectResponse`] with a client packet.

use async_trait::async_trait;
use gatelink_proto::Packet;
use std::time::Duration;
use thiserror::Error;

use crate::session::SessionContext;

pub mod access_control;
pub mod audit;
pub mod dlp;
pub mod guardrails;
pub mod pipeline;
pub mod review;

pub use access_control::AccessControlPlugin;
pub use audit::{AuditPlugin, AuditRecord, AuditSink, MemoryAuditLog};
pub use dlp::DlpPlugin;
pub use guardrails::GuardrailsPlugin;
pub use pipeline::{Pipeline, PluginRegistry};
pub use review::{InMemoryReviewStore, Review, ReviewKind, ReviewPlugin, ReviewStatus, ReviewStore};

pub const PLUGIN_ACCESS_CONTROL: &str = "access_control";
pub const PLUGIN_AUDIT: &str = "audit";
pub const PLUGIN_DLP: &str = "dlp";
pub const PLUGIN_GUARDRAILS: &str = "guardrails";
pub const PLUGIN_JIT: &str = "jit";
pub const PLUGIN_REVIEW: &str = "review";

/// Plugin failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PluginError {
    /// Policy rejection, reported to the client as a failed precondition
    #[error("{0}")]
    Denied(String),

    #[error("internal error, {0}")]
    Internal(String),

    /// Failure carrying the exit code the client should terminate with
    #[error("{message}")]
    Exit { message: String, exit_code: i32 },
}

impl PluginError {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            PluginError::Exit { exit_code, .. } => Some(*exit_code),
            _ => None,
        }
    }
}

/// What a plugin sees of a session
#[derive(Debug, Clone, Copy)]
pub struct PluginContext<'a> {
    pub session: &'a SessionContext,
    /// Configuration entries resolved for this plugin and this session
    pub config: &'a [String],
}

/// Non-default outcome of `on_receive`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectResponse {
    /// Bound the remaining lifetime of the session
    pub deadline: Option<Duration>,
    /// Packet sent to the client instead of forwarding the current one
    pub client_packet: Option<Packet>,
}

#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &'static str;

    async fn on_startup(&self, _ctx: PluginContext<'_>) -> Result<(), PluginError> {
        Ok(())
    }

    async fn on_connect(&self, ctx: PluginContext<'_>) -> Result<(), PluginError>;

    async fn on_receive(
        &self,
        ctx: PluginContext<'_>,
        packet: &mut Packet,
    ) -> Result<Option<ConnectResponse>, PluginError>;

    async fn on_disconnect(
        &self,
        ctx: PluginContext<'_>,
        error: Option<&str>,
    ) -> Result<(), PluginError>;
}
