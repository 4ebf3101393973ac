//! Client configuration

use gatelink_proto::{keys::header, ClientVerb, Protocol, ORIGIN_CLIENT, PROTOCOL_VERSION};
use gatelink_transport::StreamHeaders;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Settings of one client session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub gateway_addr: SocketAddr,
    pub org_id: String,
    pub user_id: String,
    pub user_email: String,
    pub user_groups: Vec<String>,
    pub connection_name: String,
    pub verb: ClientVerb,
    /// Free-form label of the calling tool
    pub origin: String,
    /// Reuse a session ID minted by a trusted caller
    pub session_id: Option<String>,
    /// Arguments appended to the connection command
    pub client_args: Vec<String>,
    /// Host native front-ends listen on
    pub listen_host: IpAddr,
    /// Port native front-ends listen on; `None` picks the protocol default
    pub listen_port: Option<u16>,
    pub keep_alive_interval_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            gateway_addr: SocketAddr::from(([127, 0, 0, 1], 8010)),
            org_id: String::new(),
            user_id: String::new(),
            user_email: String::new(),
            user_groups: Vec::new(),
            connection_name: String::new(),
            verb: ClientVerb::Connect,
            origin: "client".to_string(),
            session_id: None,
            client_args: Vec::new(),
            listen_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            listen_port: None,
            keep_alive_interval_secs: 10,
        }
    }
}

impl ClientConfig {
    pub fn new(gateway_addr: SocketAddr, connection_name: impl Into<String>) -> Self {
        Self {
            gateway_addr,
            connection_name: connection_name.into(),
            ..Default::default()
        }
    }

    pub fn with_verb(mut self, verb: ClientVerb) -> Self {
        self.verb = verb;
        self
    }

    pub fn with_user(
        mut self,
        org_id: impl Into<String>,
        user_id: impl Into<String>,
        user_email: impl Into<String>,
    ) -> Self {
        self.org_id = org_id.into();
        self.user_id = user_id.into();
        self.user_email = user_email.into();
        self
    }

    pub fn with_groups(mut self, groups: Vec<String>) -> Self {
        self.user_groups = groups;
        self
    }

    pub fn with_session_id(mut self, sid: impl Into<String>) -> Self {
        self.session_id = Some(sid.into());
        self
    }

    pub fn with_client_args(mut self, args: Vec<String>) -> Self {
        self.client_args = args;
        self
    }

    pub fn with_listen_port(mut self, port: u16) -> Self {
        self.listen_port = Some(port);
        self
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_secs(self.keep_alive_interval_secs.max(1))
    }

    /// Address the front-end for `protocol` listens on
    pub fn listen_addr(&self, protocol: Protocol) -> SocketAddr {
        let port = self.listen_port.unwrap_or_else(|| default_port(protocol));
        SocketAddr::new(self.listen_host, port)
    }

    /// Handshake headers identifying this client to the gateway
    pub fn headers(&self) -> StreamHeaders {
        let mut headers = StreamHeaders::new()
            .with(header::ORIGIN, ORIGIN_CLIENT)
            .with(header::PROTOCOL_VERSION, PROTOCOL_VERSION.to_string())
            .with(header::ORG_ID, self.org_id.as_str())
            .with(header::USER_ID, self.user_id.as_str())
            .with(header::USER_EMAIL, self.user_email.as_str())
            .with(header::USER_GROUPS, self.user_groups.join(","))
            .with(header::CONNECTION_NAME, self.connection_name.as_str())
            .with(header::CLIENT_VERB, self.verb.as_str())
            .with(header::CLIENT_ORIGIN, self.origin.as_str());
        if let Some(sid) = &self.session_id {
            headers.insert(header::SESSION_ID, sid.as_str());
        }
        headers
    }
}

/// Local port a front-end binds when none is configured
pub fn default_port(protocol: Protocol) -> u16 {
    match protocol {
        Protocol::Postgres => 5433,
        Protocol::MySql => 3307,
        Protocol::Mssql => 1444,
        Protocol::MongoDb => 27018,
        Protocol::Tcp => 8999,
    }
}
