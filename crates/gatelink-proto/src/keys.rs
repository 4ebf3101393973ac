//! Spec (packet header) key vocabulary
//!
//! Spec keys carry out-of-band addressing and metadata. They are a small fixed
//! vocabulary and never hold user-chosen key names.

pub const SESSION_ID: &str = "gateway.session_id";
pub const CONNECTION_TYPE: &str = "gateway.connection_type";
pub const CLIENT_CONNECTION_ID: &str = "client.connection_id";
pub const CLIENT_EXIT_CODE: &str = "terminal.exit_code";
pub const CLIENT_EXEC_ARGS: &str = "terminal.args";
pub const AGENT_CONNECTION_PARAMS: &str = "agent.connection_params";
pub const TCP_SERVER_CONNECT: &str = "tcp.server_connect";
pub const REVIEW_DATA: &str = "review.data";
pub const REVIEW_ID: &str = "review.id";
pub const JIT_TIMEOUT: &str = "jit.timeout";
pub const DLP_TRANSFORMATION_SUMMARY: &str = "dlp.transformation_summary";
pub const DLP_INFO_TYPES: &str = "dlp.info_types";

/// Keys the gateway owns; values sent by clients under these keys are never propagated.
pub const GATEWAY_OWNED: &[&str] = &[
    SESSION_ID,
    CONNECTION_TYPE,
    AGENT_CONNECTION_PARAMS,
    DLP_INFO_TYPES,
];

/// Stream handshake header keys.
pub mod header {
    pub const ORIGIN: &str = "origin";
    pub const PROTOCOL_VERSION: &str = "protocol-version";
    pub const ORG_ID: &str = "org-id";
    pub const AGENT_ID: &str = "agent-id";
    pub const AGENT_NAME: &str = "agent-name";
    pub const AGENT_MODE: &str = "agent-mode";
    pub const CONNECTION_NAME: &str = "connection-name";
    pub const USER_ID: &str = "user-id";
    pub const USER_EMAIL: &str = "user-email";
    pub const USER_GROUPS: &str = "user-groups";
    pub const CLIENT_VERB: &str = "verb";
    pub const CLIENT_ORIGIN: &str = "client-origin";
    pub const SESSION_ID: &str = "session-id";
    pub const HOSTNAME: &str = "hostname";
    pub const PLATFORM: &str = "platform";
    pub const MACHINE_ID: &str = "machine-id";
    pub const KERNEL_VERSION: &str = "kernel-version";
    pub const VERSION: &str = "version";
    pub const COMPILER: &str = "compiler";
}
