//! Gatelink agent
//!
//! The agent runs next to the resources it exposes. It keeps one stream open
//! to the gateway and, for every session the gateway opens on it, dials the
//! native target per client sub-connection or runs the connection's command.

pub mod agent;
pub mod config;
pub mod forwarder;
pub mod process;

pub use agent::Agent;
pub use config::AgentConfig;
pub use forwarder::{ForwarderError, TcpForwarder};
pub use process::ProcessTable;

use gatelink_transport::TransportError;
use thiserror::Error;

/// Errors that can occur in the agent
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("connection {0} has no command to run")]
    InvalidCommand(String),

    #[error("command of session {0} is not reading its input")]
    InputStalled(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Forwarding error: {0}")]
    Forwarder(#[from] ForwarderError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
