use async_trait::async_trait;
use gatelink_proto::Packet;
use tracing::info;

use super::{ConnectResponse, Plugin, PluginContext, PluginError, PLUGIN_ACCESS_CONTROL};

/// Members of this group pass every access-control check
pub const ADMIN_GROUP: &str = "admin";

/// Allows a session only when the user belongs to one of the configured groups
#[derive(Debug, Default)]
pub struct AccessControlPlugin;

impl AccessControlPlugin {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Plugin for AccessControlPlugin {
    fn name(&self) -> &'static str {
        PLUGIN_ACCESS_CONTROL
    }

    async fn on_connect(&self, ctx: PluginContext<'_>) -> Result<(), PluginError> {
        let groups = &ctx.session.user_groups;
        if groups.iter().any(|g| g == ADMIN_GROUP) {
            return Ok(());
        }
        if groups.iter().any(|g| ctx.config.contains(g)) {
            return Ok(());
        }
        info!(
            sid = %ctx.session.sid,
            user_id = %ctx.session.user_id,
            connection = %ctx.session.connection.name,
            "Access denied by access control"
        );
        Err(PluginError::Denied(format!(
            "user {} has no access to connection {}",
            ctx.session.user_id, ctx.session.connection.name
        )))
    }

    async fn on_receive(
        &self,
        _ctx: PluginContext<'_>,
        _packet: &mut Packet,
    ) -> Result<Option<ConnectResponse>, PluginError> {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionContext;

    fn session(groups: &[&str]) -> SessionContext {
        SessionContext {
            user_id: "user-1".into(),
            user_groups: groups.iter().map(|g| g.to_string()).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_group_membership() {
        let plugin = AccessControlPlugin::new();
        let config = vec!["sre".to_string()];

        let member = session(&["dev", "sre"]);
        assert!(plugin
            .on_connect(PluginContext { session: &member, config: &config })
            .await
            .is_ok());

        let outsider = session(&["dev"]);
        let err = plugin
            .on_connect(PluginContext { session: &outsider, config: &config })
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::Denied(_)));

        let admin = session(&[ADMIN_GROUP]);
        assert!(plugin
            .on_connect(PluginContext { session: &admin, config: &[] })
            .await
            .is_ok());
    }
}
