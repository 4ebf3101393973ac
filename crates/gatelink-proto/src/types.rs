//! Packet type taxonomy
//!
//! Packet types travel as strings on the wire so that peers running newer
//! versions can introduce types without breaking older ones. Locally they are
//! parsed into the closed [`PacketType`] enum; anything unrecognized becomes
//! [`PacketType::Unsupported`].

use std::fmt;

use crate::keys;

/// Native wire protocols that are multiplexed by connection ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Postgres,
    MySql,
    Mssql,
    MongoDb,
    Tcp,
}

impl Protocol {
    pub const ALL: [Protocol; 5] = [
        Protocol::Postgres,
        Protocol::MySql,
        Protocol::Mssql,
        Protocol::MongoDb,
        Protocol::Tcp,
    ];

    /// Packet type used for bytes flowing from the native client towards the target
    pub fn write_server(self) -> PacketType {
        PacketType::WriteServer(self)
    }

    /// Packet type used for bytes flowing from the target back to the native client
    pub fn write_client(self) -> PacketType {
        PacketType::WriteClient(self)
    }

    fn prefix(self) -> &'static str {
        match self {
            Protocol::Postgres => "PG",
            Protocol::MySql => "MySQL",
            Protocol::Mssql => "MSSQL",
            Protocol::MongoDb => "MongoDB",
            Protocol::Tcp => "TCP",
        }
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.prefix() == prefix)
    }

    /// Whether the target server sends the first bytes of the conversation
    pub fn server_speaks_first(self) -> bool {
        matches!(self, Protocol::MySql | Protocol::Tcp)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Semantic purpose of a packet
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PacketType {
    /// First packet of every stream; spec carries the stream headers
    Handshake,
    /// Gateway accepted an agent stream
    GatewayConnectOk,
    KeepAlive,

    SessionOpen,
    SessionOpenOk,
    SessionOpenWaitingApproval,
    SessionOpenApproveOk,
    SessionOpenAgentOffline,
    SessionOpenTimeout,
    SessionClose,

    WriteServer(Protocol),
    WriteClient(Protocol),
    /// Close a single native sub-connection
    CloseTcpConnection,

    ExecWriteStdin,
    ExecWriteStdout,
    ExecWriteStderr,

    TerminalWriteStdin,
    TerminalWriteStdout,
    TerminalClose,

    /// A type this build does not know about
    Unsupported(String),
}

impl PacketType {
    /// Parse a wire type string
    pub fn from_wire(value: &str) -> Self {
        match value {
            "Gateway::Handshake" => Self::Handshake,
            "Gateway::ConnectOK" => Self::GatewayConnectOk,
            "KeepAlive" => Self::KeepAlive,
            "SessionOpen" => Self::SessionOpen,
            "SessionOpenOK" => Self::SessionOpenOk,
            "SessionOpenWaitingApproval" => Self::SessionOpenWaitingApproval,
            "SessionOpenApproveOK" => Self::SessionOpenApproveOk,
            "SessionOpenAgentOffline" => Self::SessionOpenAgentOffline,
            "SessionOpenTimeout" => Self::SessionOpenTimeout,
            "SessionClose" => Self::SessionClose,
            "CloseTCPConnection" => Self::CloseTcpConnection,
            "Exec::WriteStdin" => Self::ExecWriteStdin,
            "Exec::WriteStdout" => Self::ExecWriteStdout,
            "Exec::WriteStderr" => Self::ExecWriteStderr,
            "Terminal::WriteStdin" => Self::TerminalWriteStdin,
            "Terminal::WriteStdout" => Self::TerminalWriteStdout,
            "Terminal::Close" => Self::TerminalClose,
            other => match other.split_once("::") {
                Some((prefix, "WriteServer")) => Protocol::from_prefix(prefix)
                    .map(Self::WriteServer)
                    .unwrap_or_else(|| Self::Unsupported(other.to_string())),
                Some((prefix, "WriteClient")) => Protocol::from_prefix(prefix)
                    .map(Self::WriteClient)
                    .unwrap_or_else(|| Self::Unsupported(other.to_string())),
                _ => Self::Unsupported(other.to_string()),
            },
        }
    }

    /// Wire representation
    pub fn as_wire(&self) -> String {
        match self {
            Self::Handshake => "Gateway::Handshake".into(),
            Self::GatewayConnectOk => "Gateway::ConnectOK".into(),
            Self::KeepAlive => "KeepAlive".into(),
            Self::SessionOpen => "SessionOpen".into(),
            Self::SessionOpenOk => "SessionOpenOK".into(),
            Self::SessionOpenWaitingApproval => "SessionOpenWaitingApproval".into(),
            Self::SessionOpenApproveOk => "SessionOpenApproveOK".into(),
            Self::SessionOpenAgentOffline => "SessionOpenAgentOffline".into(),
            Self::SessionOpenTimeout => "SessionOpenTimeout".into(),
            Self::SessionClose => "SessionClose".into(),
            Self::WriteServer(p) => format!("{}::WriteServer", p.prefix()),
            Self::WriteClient(p) => format!("{}::WriteClient", p.prefix()),
            Self::CloseTcpConnection => "CloseTCPConnection".into(),
            Self::ExecWriteStdin => "Exec::WriteStdin".into(),
            Self::ExecWriteStdout => "Exec::WriteStdout".into(),
            Self::ExecWriteStderr => "Exec::WriteStderr".into(),
            Self::TerminalWriteStdin => "Terminal::WriteStdin".into(),
            Self::TerminalWriteStdout => "Terminal::WriteStdout".into(),
            Self::TerminalClose => "Terminal::Close".into(),
            Self::Unsupported(raw) => raw.clone(),
        }
    }

    /// Spec keys that must be present for a packet of this type to be valid
    pub fn required_spec_keys(&self) -> &'static [&'static str] {
        const SESSION: &[&str] = &[keys::SESSION_ID];
        const SUB_CONNECTION: &[&str] = &[keys::SESSION_ID, keys::CLIENT_CONNECTION_ID];
        match self {
            Self::Handshake | Self::GatewayConnectOk | Self::KeepAlive | Self::Unsupported(_) => {
                &[]
            }
            Self::WriteServer(_) | Self::WriteClient(_) | Self::CloseTcpConnection => {
                SUB_CONNECTION
            }
            _ => SESSION,
        }
    }

    /// Native protocol carried by this packet, if it is a protocol write
    pub fn protocol(&self) -> Option<Protocol> {
        match self {
            Self::WriteServer(p) | Self::WriteClient(p) => Some(*p),
            _ => None,
        }
    }

    /// Packets carrying command or terminal output towards the client
    pub fn is_output(&self) -> bool {
        matches!(
            self,
            Self::ExecWriteStdout | Self::ExecWriteStderr | Self::TerminalWriteStdout
        )
    }

    /// Packets carrying user input towards the agent
    pub fn is_input(&self) -> bool {
        matches!(
            self,
            Self::SessionOpen | Self::ExecWriteStdin | Self::TerminalWriteStdin
        ) || matches!(self, Self::WriteServer(_))
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported(_))
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_wire())
    }
}

impl From<&str> for PacketType {
    fn from(value: &str) -> Self {
        Self::from_wire(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_write_types_parse() {
        for protocol in Protocol::ALL {
            let server = protocol.write_server().as_wire();
            let client = protocol.write_client().as_wire();
            assert_eq!(PacketType::from_wire(&server), PacketType::WriteServer(protocol));
            assert_eq!(PacketType::from_wire(&client), PacketType::WriteClient(protocol));
        }
        assert_eq!(Protocol::Postgres.write_server().as_wire(), "PG::WriteServer");
    }

    #[test]
    fn test_unknown_type_is_unsupported() {
        let parsed = PacketType::from_wire("Plugin::SomethingNew");
        assert_eq!(parsed, PacketType::Unsupported("Plugin::SomethingNew".into()));
        assert_eq!(parsed.as_wire(), "Plugin::SomethingNew");

        let unknown_protocol = PacketType::from_wire("Redis::WriteServer");
        assert!(unknown_protocol.is_unsupported());
    }

    #[test]
    fn test_required_keys() {
        assert!(PacketType::KeepAlive.required_spec_keys().is_empty());
        assert_eq!(
            PacketType::SessionOpen.required_spec_keys(),
            &[keys::SESSION_ID]
        );
        assert!(PacketType::CloseTcpConnection
            .required_spec_keys()
            .contains(&keys::CLIENT_CONNECTION_ID));
    }

    #[test]
    fn test_server_speaks_first() {
        assert!(Protocol::MySql.server_speaks_first());
        assert!(Protocol::Tcp.server_speaks_first());
        assert!(!Protocol::Postgres.server_speaks_first());
    }
}
