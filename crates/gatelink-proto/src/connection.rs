//! Connection classification shared by gateway, client and agent

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::Protocol;

/// Effective connection type used to pick a front-end and an agent handler
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConnectionType {
    CommandLine,
    Postgres,
    MySql,
    Mssql,
    MongoDb,
    Tcp,
    /// A type this build has no front-end for; carried verbatim
    Other(String),
}

impl ConnectionType {
    /// Resolve the effective type from the administrative `(type, subtype)` pair.
    ///
    /// Applications are command-line unless their subtype is `tcp`, custom
    /// connections are always command-line, and databases resolve to their
    /// engine. Anything else keeps the raw type.
    pub fn from_type_subtype(connection_type: &str, subtype: &str) -> Self {
        match (connection_type, subtype) {
            ("application", "tcp") => Self::Tcp,
            ("application", _) | ("custom", _) => Self::CommandLine,
            ("database", "postgres") => Self::Postgres,
            ("database", "mysql") => Self::MySql,
            ("database", "mssql") => Self::Mssql,
            ("database", "mongodb") => Self::MongoDb,
            (raw, _) => Self::parse(raw),
        }
    }

    /// Parse the string form produced by [`ConnectionType::as_str`]
    pub fn parse(value: &str) -> Self {
        match value {
            "command-line" => Self::CommandLine,
            "postgres" => Self::Postgres,
            "mysql" => Self::MySql,
            "mssql" => Self::Mssql,
            "mongodb" => Self::MongoDb,
            "tcp" => Self::Tcp,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::CommandLine => "command-line",
            Self::Postgres => "postgres",
            Self::MySql => "mysql",
            Self::Mssql => "mssql",
            Self::MongoDb => "mongodb",
            Self::Tcp => "tcp",
            Self::Other(raw) => raw,
        }
    }

    /// Native protocol multiplexed for this connection type
    pub fn protocol(&self) -> Option<Protocol> {
        match self {
            Self::Postgres => Some(Protocol::Postgres),
            Self::MySql => Some(Protocol::MySql),
            Self::Mssql => Some(Protocol::Mssql),
            Self::MongoDb => Some(Protocol::MongoDb),
            Self::Tcp => Some(Protocol::Tcp),
            Self::CommandLine | Self::Other(_) => None,
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the client asked to do with a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientVerb {
    /// Long-lived interactive or native-protocol session
    Connect,
    /// One-shot command execution
    Exec,
}

impl ClientVerb {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "connect" => Some(Self::Connect),
            "exec" => Some(Self::Exec),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Exec => "exec",
        }
    }
}

/// How an agent process serves connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentMode {
    /// One stream serves every connection bound to the agent
    #[default]
    Standard,
    /// One stream per logical connection
    MultiConnection,
}

impl AgentMode {
    pub fn parse(value: &str) -> Self {
        match value {
            "multi-connection" => Self::MultiConnection,
            _ => Self::Standard,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::MultiConnection => "multi-connection",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_type_subtype() {
        assert_eq!(ConnectionType::from_type_subtype("application", "tcp"), ConnectionType::Tcp);
        assert_eq!(
            ConnectionType::from_type_subtype("application", "ruby-on-rails"),
            ConnectionType::CommandLine
        );
        assert_eq!(
            ConnectionType::from_type_subtype("custom", "postgres"),
            ConnectionType::CommandLine
        );
        assert_eq!(
            ConnectionType::from_type_subtype("database", "postgres"),
            ConnectionType::Postgres
        );
        assert_eq!(ConnectionType::from_type_subtype("database", "mssql"), ConnectionType::Mssql);
        assert_eq!(
            ConnectionType::from_type_subtype("database", "mongodb"),
            ConnectionType::MongoDb
        );
        assert_eq!(
            ConnectionType::from_type_subtype("httpproxy", ""),
            ConnectionType::Other("httpproxy".into())
        );
        assert_eq!(ConnectionType::from_type_subtype("mysql", ""), ConnectionType::MySql);
    }

    #[test]
    fn test_protocol_mapping() {
        assert_eq!(ConnectionType::Postgres.protocol(), Some(Protocol::Postgres));
        assert_eq!(ConnectionType::CommandLine.protocol(), None);
    }

    #[test]
    fn test_verb_and_mode_parse() {
        assert_eq!(ClientVerb::parse("exec"), Some(ClientVerb::Exec));
        assert_eq!(ClientVerb::parse("run"), None);
        assert_eq!(AgentMode::parse("multi-connection"), AgentMode::MultiConnection);
        assert_eq!(AgentMode::parse(""), AgentMode::Standard);
    }
}
