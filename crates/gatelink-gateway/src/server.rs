//! Gateway TCP server

use gatelink_transport::{FramedStream, SharedStream};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent_registry::AgentRegistry;
use crate::config::{default_plugins, GatewayConfig};
use crate::directory::{ConnectionDirectory, InMemoryDirectory, PolicySource, StatusSink};
use crate::handler::GatewayHandler;
use crate::liveness::LivenessReconciler;
use crate::plugins::{AuditSink, InMemoryReviewStore, MemoryAuditLog, ReviewStore};
use crate::proxy_registry::ProxyRegistry;
use crate::GatewayError;

/// External systems the gateway reads from and writes to
#[derive(Clone)]
pub struct Collaborators {
    pub directory: Arc<dyn ConnectionDirectory>,
    pub policies: Arc<dyn PolicySource>,
    pub status: Arc<dyn StatusSink>,
    pub reviews: Arc<dyn ReviewStore>,
    pub audit: Arc<dyn AuditSink>,
}

impl Collaborators {
    /// Back every collaborator with in-memory state
    pub fn in_memory(directory: InMemoryDirectory) -> Self {
        let directory = Arc::new(directory);
        Self {
            directory: directory.clone(),
            policies: directory.clone(),
            status: directory,
            reviews: Arc::new(InMemoryReviewStore::new()),
            audit: Arc::new(MemoryAuditLog::new()),
        }
    }
}

pub struct GatewayServer {
    config: GatewayConfig,
    handler: GatewayHandler,
    liveness: LivenessReconciler,
    shutdown: CancellationToken,
}

impl GatewayServer {
    pub fn new(config: GatewayConfig, collaborators: Collaborators) -> Self {
        let liveness =
            LivenessReconciler::new(collaborators.status.clone()).with_grace(config.liveness_grace());
        let agents = AgentRegistry::new(collaborators.directory.clone(), liveness.clone());
        let plugins = default_plugins(&config, collaborators.reviews, collaborators.audit);
        let proxies = ProxyRegistry::new(agents, Arc::new(plugins), collaborators.policies)
            .with_max_duration(config.max_session_duration());
        let handler = GatewayHandler::new(proxies, collaborators.directory)
            .with_open_timeout(config.open_timeout());
        Self {
            config,
            handler,
            liveness,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn handler(&self) -> &GatewayHandler {
        &self.handler
    }

    /// Cancel to stop accepting streams and close every session
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self) -> Result<(), GatewayError> {
        let listener = self.bind_with_retry().await?;
        self.serve(listener).await
    }

    async fn bind_with_retry(&self) -> Result<TcpListener, GatewayError> {
        let addr = self.config.listen_addr;
        for attempt in 1..=3 {
            match TcpListener::bind(addr).await {
                Ok(listener) => {
                    if attempt > 1 {
                        info!("Bound to {} on attempt {}/3", addr, attempt);
                    }
                    return Ok(listener);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse && attempt < 3 => {
                    warn!(
                        "Address {} is in use (attempt {}/3), retrying in 1 second",
                        addr, attempt
                    );
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
                Err(e) => {
                    return Err(GatewayError::Bind {
                        addr,
                        reason: e.to_string(),
                    })
                }
            }
        }
        Err(GatewayError::Bind {
            addr,
            reason: "address in use after 3 attempts".to_string(),
        })
    }

    /// Serve streams accepted on `listener` until shutdown
    pub async fn serve(&self, listener: TcpListener) -> Result<(), GatewayError> {
        self.liveness.init().await?;

        let local_addr = listener.local_addr()?;
        info!("Gateway listening on {}", local_addr);

        let sweep = self
            .handler
            .proxies()
            .spawn_cleanup(self.config.session_sweep_interval(), self.shutdown.child_token());
        let reconcile = self
            .liveness
            .spawn(self.config.liveness_interval(), self.shutdown.child_token());

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer_addr)) => {
                        let handler = self.handler.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(handler, socket, peer_addr).await {
                                debug!(%peer_addr, "Stream ended with error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                },
            }
        }

        let closed = self
            .handler
            .proxies()
            .disconnect_all("gateway is shutting down")
            .await;
        sweep.abort();
        reconcile.abort();
        info!(sessions_closed = closed, "Gateway stopped");
        Ok(())
    }
}

async fn handle_connection(
    handler: GatewayHandler,
    socket: TcpStream,
    peer_addr: SocketAddr,
) -> Result<(), GatewayError> {
    let _ = socket.set_nodelay(true);
    let (stream, headers) = FramedStream::accept(socket).await?;
    debug!(
        %peer_addr,
        stream_id = gatelink_transport::PacketStream::stream_id(&stream),
        origin = ?headers.origin(),
        "Accepted stream"
    );
    let stream: SharedStream = Arc::new(stream);
    handler.handle_stream(stream, headers).await
}
