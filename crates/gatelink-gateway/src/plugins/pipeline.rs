//! Plugin registry and per-session pipeline

use futures::FutureExt;
use gatelink_proto::Packet;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, warn};

use super::{ConnectResponse, Plugin, PluginContext, PluginError};
use crate::directory::PolicyConfig;
use crate::session::SessionContext;

/// Every plugin implementation known to the gateway, by name
#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: HashMap<&'static str, Arc<dyn Plugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        self.plugins.insert(plugin.name(), plugin);
    }

    pub fn with(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.register(plugin);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.get(name).cloned()
    }
}

struct LoadedPlugin {
    plugin: Arc<dyn Plugin>,
    config: Vec<String>,
}

/// Ordered plugins attached to one session
#[derive(Default)]
pub struct Pipeline {
    plugins: Vec<LoadedPlugin>,
}

impl Pipeline {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Select the plugins whose policy names this session's connection.
    ///
    /// Policies keep their configured order. A plugin named by several
    /// policies is loaded once, from the first one.
    pub fn resolve(
        registry: &PluginRegistry,
        policies: &[PolicyConfig],
        ctx: &SessionContext,
    ) -> Self {
        let mut seen = HashSet::new();
        let mut plugins = Vec::new();
        for policy in policies {
            if !policy.connections.iter().any(|c| c == &ctx.connection.name) {
                continue;
            }
            if !seen.insert(policy.name.as_str()) {
                continue;
            }
            let Some(plugin) = registry.get(&policy.name) else {
                warn!(plugin = %policy.name, sid = %ctx.sid, "Policy references unknown plugin");
                continue;
            };
            plugins.push(LoadedPlugin {
                plugin,
                config: resolve_config(policy, &ctx.user_groups),
            });
        }
        debug!(
            sid = %ctx.sid,
            plugins = ?plugins.iter().map(|p| p.plugin.name()).collect::<Vec<_>>(),
            "Resolved session plugins"
        );
        Self { plugins }
    }

    pub fn has(&self, name: &str) -> bool {
        self.plugins.iter().any(|p| p.plugin.name() == name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.plugins.iter().map(|p| p.plugin.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Run `on_startup` then `on_connect` for every plugin; the first failure aborts
    pub async fn on_connect(&self, session: &SessionContext) -> Result<(), PluginError> {
        for loaded in &self.plugins {
            let ctx = PluginContext {
                session,
                config: &loaded.config,
            };
            let name = loaded.plugin.name();
            guarded(name, loaded.plugin.on_startup(ctx)).await?;
            if let Err(e) = guarded(name, loaded.plugin.on_connect(ctx)).await {
                warn!(sid = %session.sid, plugin = name, "Plugin rejected session: {}", e);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Run `on_receive` for every plugin.
    ///
    /// The first response returned is the one honored; when it carries a
    /// client packet the remaining plugins are skipped.
    pub async fn on_receive(
        &self,
        session: &SessionContext,
        packet: &mut Packet,
    ) -> Result<Option<ConnectResponse>, PluginError> {
        let mut honored: Option<ConnectResponse> = None;
        for loaded in &self.plugins {
            let ctx = PluginContext {
                session,
                config: &loaded.config,
            };
            let response = guarded(loaded.plugin.name(), loaded.plugin.on_receive(ctx, packet)).await?;
            if honored.is_some() {
                continue;
            }
            if let Some(response) = response {
                let stop = response.client_packet.is_some();
                honored = Some(response);
                if stop {
                    break;
                }
            }
        }
        Ok(honored)
    }

    /// Run `on_disconnect` for every plugin; failures are logged
    pub async fn on_disconnect(&self, session: &SessionContext, error: Option<&str>) {
        for loaded in &self.plugins {
            let ctx = PluginContext {
                session,
                config: &loaded.config,
            };
            let name = loaded.plugin.name();
            if let Err(e) = guarded(name, loaded.plugin.on_disconnect(ctx, error)).await {
                warn!(sid = %session.sid, plugin = name, "Plugin disconnect failed: {}", e);
            }
        }
    }
}

fn resolve_config(policy: &PolicyConfig, user_groups: &[String]) -> Vec<String> {
    let mut config: Vec<String> = user_groups
        .iter()
        .filter_map(|group| policy.group_config.get(group))
        .flatten()
        .cloned()
        .collect();
    if config.is_empty() {
        config = policy.config.clone();
    }
    let mut seen = HashSet::new();
    config.retain(|entry| seen.insert(entry.clone()));
    config
}

/// Await a plugin callback, turning a panic into an internal error
async fn guarded<T, F>(name: &str, fut: F) -> Result<T, PluginError>
where
    F: Future<Output = Result<T, PluginError>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(_) => {
            error!(plugin = name, "Plugin panicked");
            Err(PluginError::Internal(format!("plugin {} failed", name)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::ConnectionRecord;
    use async_trait::async_trait;
    use gatelink_proto::PacketType;
    use std::sync::Mutex;

    /// Records calls and answers according to its mode
    struct RecordingPlugin {
        name: &'static str,
        calls: Arc<Mutex<Vec<String>>>,
        respond: Option<ConnectResponse>,
        fail_connect: bool,
        panic_receive: bool,
    }

    impl RecordingPlugin {
        fn new(name: &'static str, calls: Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name,
                calls,
                respond: None,
                fail_connect: false,
                panic_receive: false,
            }
        }

        fn log(&self, event: &str) {
            self.calls.lock().unwrap().push(format!("{}:{}", self.name, event));
        }
    }

    #[async_trait]
    impl Plugin for RecordingPlugin {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn on_connect(&self, ctx: PluginContext<'_>) -> Result<(), PluginError> {
            self.log(&format!("connect{:?}", ctx.config));
            if self.fail_connect {
                return Err(PluginError::Denied("nope".into()));
            }
            Ok(())
        }

        async fn on_receive(
            &self,
            _ctx: PluginContext<'_>,
            _packet: &mut Packet,
        ) -> Result<Option<ConnectResponse>, PluginError> {
            self.log("receive");
            if self.panic_receive {
                panic!("boom");
            }
            Ok(self.respond.clone())
        }

        async fn on_disconnect(
            &self,
            _ctx: PluginContext<'_>,
            _error: Option<&str>,
        ) -> Result<(), PluginError> {
            self.log("disconnect");
            Err(PluginError::Internal("ignored".into()))
        }
    }

    fn session(groups: &[&str]) -> SessionContext {
        SessionContext {
            sid: "sid-1".into(),
            user_groups: groups.iter().map(|g| g.to_string()).collect(),
            connection: ConnectionRecord {
                name: "prod-db".into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn policy(name: &str, connections: &[&str], config: &[&str]) -> PolicyConfig {
        PolicyConfig {
            name: name.into(),
            connections: connections.iter().map(|c| c.to_string()).collect(),
            config: config.iter().map(|c| c.to_string()).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_resolve_filters_orders_and_dedupes() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let registry = PluginRegistry::new()
            .with(Arc::new(RecordingPlugin::new("audit", calls.clone())))
            .with(Arc::new(RecordingPlugin::new("dlp", calls.clone())))
            .with(Arc::new(RecordingPlugin::new("review", calls.clone())));

        let policies = vec![
            policy("dlp", &["prod-db"], &["EMAIL_ADDRESS"]),
            policy("review", &["stage-db"], &[]),
            policy("audit", &["prod-db"], &[]),
            policy("dlp", &["prod-db"], &["PHONE_NUMBER"]),
            policy("unknown", &["prod-db"], &[]),
        ];
        let ctx = session(&[]);
        let pipeline = Pipeline::resolve(&registry, &policies, &ctx);
        assert_eq!(pipeline.names(), vec!["dlp", "audit"]);

        pipeline.on_connect(&ctx).await.unwrap();
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["dlp:connect[\"EMAIL_ADDRESS\"]".to_string(), "audit:connect[]".to_string()]
        );
    }

    #[test]
    fn test_group_config_preferred() {
        let mut p = policy("review", &["prod-db"], &["default-approvers"]);
        p.group_config
            .insert("sre".into(), vec!["sre-leads".into(), "sre-leads".into()]);
        assert_eq!(resolve_config(&p, &["sre".into()]), vec!["sre-leads".to_string()]);
        assert_eq!(
            resolve_config(&p, &["dev".into()]),
            vec!["default-approvers".to_string()]
        );
    }

    #[tokio::test]
    async fn test_on_connect_stops_at_first_failure() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut denier = RecordingPlugin::new("access_control", calls.clone());
        denier.fail_connect = true;
        let registry = PluginRegistry::new()
            .with(Arc::new(denier))
            .with(Arc::new(RecordingPlugin::new("audit", calls.clone())));
        let policies = vec![
            policy("access_control", &["prod-db"], &[]),
            policy("audit", &["prod-db"], &[]),
        ];
        let ctx = session(&[]);
        let pipeline = Pipeline::resolve(&registry, &policies, &ctx);
        let err = pipeline.on_connect(&ctx).await.unwrap_err();
        assert_eq!(err, PluginError::Denied("nope".into()));
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_first_client_packet_short_circuits() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut first = RecordingPlugin::new("review", calls.clone());
        first.respond = Some(ConnectResponse {
            deadline: None,
            client_packet: Some(Packet::new(PacketType::SessionOpenWaitingApproval)),
        });
        let registry = PluginRegistry::new()
            .with(Arc::new(first))
            .with(Arc::new(RecordingPlugin::new("audit", calls.clone())));
        let policies = vec![
            policy("review", &["prod-db"], &[]),
            policy("audit", &["prod-db"], &[]),
        ];
        let ctx = session(&[]);
        let pipeline = Pipeline::resolve(&registry, &policies, &ctx);
        let mut pkt = Packet::new(PacketType::SessionOpen);
        let response = pipeline.on_receive(&ctx, &mut pkt).await.unwrap().unwrap();
        assert_eq!(
            response.client_packet.unwrap().kind(),
            PacketType::SessionOpenWaitingApproval
        );
        assert_eq!(*calls.lock().unwrap(), vec!["review:receive".to_string()]);
    }

    #[tokio::test]
    async fn test_deadline_response_keeps_running_plugins() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut jit = RecordingPlugin::new("jit", calls.clone());
        jit.respond = Some(ConnectResponse {
            deadline: Some(std::time::Duration::from_secs(60)),
            client_packet: None,
        });
        let registry = PluginRegistry::new()
            .with(Arc::new(jit))
            .with(Arc::new(RecordingPlugin::new("audit", calls.clone())));
        let policies = vec![policy("jit", &["prod-db"], &[]), policy("audit", &["prod-db"], &[])];
        let ctx = session(&[]);
        let pipeline = Pipeline::resolve(&registry, &policies, &ctx);
        let mut pkt = Packet::new(PacketType::SessionOpen);
        let response = pipeline.on_receive(&ctx, &mut pkt).await.unwrap().unwrap();
        assert_eq!(response.deadline, Some(std::time::Duration::from_secs(60)));
        assert_eq!(calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_panicking_plugin_becomes_internal_error() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut bad = RecordingPlugin::new("dlp", calls.clone());
        bad.panic_receive = true;
        let registry = PluginRegistry::new().with(Arc::new(bad));
        let ctx = session(&[]);
        let pipeline = Pipeline::resolve(&registry, &[policy("dlp", &["prod-db"], &[])], &ctx);
        let mut pkt = Packet::new(PacketType::SessionOpen);
        let err = pipeline.on_receive(&ctx, &mut pkt).await.unwrap_err();
        assert!(matches!(err, PluginError::Internal(_)));

        // disconnect errors are swallowed
        pipeline.on_disconnect(&ctx, None).await;
    }
}
