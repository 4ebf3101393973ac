//! Gatelink gateway
//!
//! The gateway accepts one stream per agent and one stream per client session,
//! and relays packets between them:
//!
//! - [`AgentRegistry`] holds at most one live stream per [`StreamAgentId`](gatelink_proto::StreamAgentId)
//! - [`ProxyRegistry`] owns client sessions and their state machine
//! - [`plugins`] is the interception pipeline run on every session
//! - [`LivenessReconciler`] keeps persisted online/offline status honest
//! - [`GatewayHandler`] and [`GatewayServer`] tie them to the transport

pub mod agent_registry;
pub mod config;
pub mod directory;
pub mod handler;
pub mod liveness;
pub mod plugins;
pub mod proxy_registry;
pub mod server;
pub mod session;

pub use agent_registry::{AgentIdentity, AgentRegistry, AgentStream, RegistryError};
pub use config::{default_plugins, DirectoryConfig, GatewayConfig};
pub use directory::{
    ConnectionDirectory, ConnectionRecord, DirectoryError, InMemoryDirectory, LivenessStatus,
    PolicyConfig, PolicySource, StatusSink,
};
pub use handler::GatewayHandler;
pub use liveness::LivenessReconciler;
pub use proxy_registry::{ProxyRegistry, ProxySession, SessionError};
pub use server::{Collaborators, GatewayServer};
pub use session::{ClientIdentity, SessionContext, SessionState};

use gatelink_transport::TransportError;
use std::net::SocketAddr;
use thiserror::Error;

/// Gateway errors
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("unknown stream origin {0:?}")]
    UnknownOrigin(String),

    #[error("connection {0} not found")]
    ConnectionNotFound(String),

    #[error("failed to bind {addr}: {reason}")]
    Bind { addr: SocketAddr, reason: String },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
