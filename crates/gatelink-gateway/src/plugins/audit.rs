//! Session audit trail

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gatelink_proto::{Packet, PacketType};
use std::sync::{Arc, Mutex};
use tracing::debug;

use super::{ConnectResponse, Plugin, PluginContext, PluginError, PLUGIN_AUDIT};
use crate::directory::DirectoryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditEventKind {
    Open,
    Input,
    Output,
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRecord {
    pub session_id: String,
    pub org_id: String,
    pub kind: AuditEventKind,
    pub payload: Vec<u8>,
    pub at: DateTime<Utc>,
}

/// Where audit records are written
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn write(&self, record: AuditRecord) -> Result<(), DirectoryError>;
}

/// Audit sink keeping records in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryAuditLog {
    records: Arc<Mutex<Vec<AuditRecord>>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self, session_id: &str) -> Vec<AuditRecord> {
        self.records
            .lock()
            .map(|records| {
                records
                    .iter()
                    .filter(|r| r.session_id == session_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditLog {
    async fn write(&self, record: AuditRecord) -> Result<(), DirectoryError> {
        self.records
            .lock()
            .map_err(|_| DirectoryError::Backend("audit log lock poisoned".into()))?
            .push(record);
        Ok(())
    }
}

/// Writes session open, input, output and close events to an [`AuditSink`]
pub struct AuditPlugin {
    sink: Arc<dyn AuditSink>,
}

impl AuditPlugin {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink }
    }

    async fn record(
        &self,
        ctx: PluginContext<'_>,
        kind: AuditEventKind,
        payload: Vec<u8>,
    ) -> Result<(), PluginError> {
        let record = AuditRecord {
            session_id: ctx.session.sid.clone(),
            org_id: ctx.session.org_id.clone(),
            kind,
            payload,
            at: Utc::now(),
        };
        self.sink
            .write(record)
            .await
            .map_err(|e| PluginError::Internal(format!("failed writing audit record: {}", e)))
    }
}

#[async_trait]
impl Plugin for AuditPlugin {
    fn name(&self) -> &'static str {
        PLUGIN_AUDIT
    }

    async fn on_connect(&self, ctx: PluginContext<'_>) -> Result<(), PluginError> {
        let summary = format!(
            "user={} connection={} type={} verb={}",
            ctx.session.user_id,
            ctx.session.connection.name,
            ctx.session.connection_type(),
            ctx.session.client_verb
        );
        self.record(ctx, AuditEventKind::Open, summary.into_bytes()).await
    }

    async fn on_receive(
        &self,
        ctx: PluginContext<'_>,
        packet: &mut Packet,
    ) -> Result<Option<ConnectResponse>, PluginError> {
        let kind = packet.kind();
        let event = if kind.is_input() {
            AuditEventKind::Input
        } else if kind.is_output() || matches!(kind, PacketType::WriteClient(_)) {
            AuditEventKind::Output
        } else {
            return Ok(None);
        };
        debug!(sid = %ctx.session.sid, packet_type = %kind, size = packet.payload.len(), "Audit");
        self.record(ctx, event, packet.payload.clone()).await?;
        Ok(None)
    }

    async fn on_disconnect(
        &self,
        ctx: PluginContext<'_>,
        error: Option<&str>,
    ) -> Result<(), PluginError> {
        let payload = error.unwrap_or_default().as_bytes().to_vec();
        self.record(ctx, AuditEventKind::Close, payload).await
    }
}
