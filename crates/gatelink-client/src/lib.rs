//! Gatelink client
//!
//! Opens a session through the gateway and exposes it locally, either as a
//! native protocol listener (Postgres, MySQL, MSSQL, MongoDB, raw TCP) that
//! multiplexes every local connection over the session stream, or as an
//! exec/terminal front-end bound to the process's standard streams.

pub mod config;
pub mod proxy;
pub mod session;
pub mod terminal;

pub use config::ClientConfig;
pub use proxy::{ConnectionIdGenerator, ProxyError, ProxyServer};
pub use session::{ClientSession, SessionOutcome};
pub use terminal::Terminal;

use gatelink_transport::TransportError;
use thiserror::Error;

/// Client errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection type {0} has no local front-end")]
    UnsupportedConnectionType(String),

    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
