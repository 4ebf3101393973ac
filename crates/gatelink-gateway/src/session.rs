//! Session identity and state machine

use gatelink_proto::keys::header;
use gatelink_proto::{AgentMode, ClientVerb, ConnectionType, StreamAgentId};
use gatelink_transport::StreamHeaders;
use std::fmt;

use crate::directory::ConnectionRecord;

/// Lifecycle states of a proxy session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Session exists, nothing sent to the agent yet
    Created,
    /// Suspended until an external approval arrives
    WaitingApproval,
    /// Session open forwarded to the agent
    Open,
    /// Agent acknowledged; data flows both ways
    Relaying,
    Closed,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Created, WaitingApproval | Open) => true,
            (WaitingApproval, Open | WaitingApproval) => true,
            // a client may re-send its session open
            (Open, Open | Relaying) => true,
            (Relaying, Relaying) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Created => "created",
            SessionState::WaitingApproval => "waiting_approval",
            SessionState::Open => "open",
            SessionState::Relaying => "relaying",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Who is asking, as declared in the client stream headers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientIdentity {
    pub org_id: String,
    pub user_id: String,
    pub user_email: String,
    pub user_groups: Vec<String>,
    pub connection_name: String,
    pub verb: String,
    pub origin: String,
    /// Session ID propagated by a trusted upstream caller
    pub session_id: Option<String>,
}

impl ClientIdentity {
    pub fn from_headers(headers: &StreamHeaders) -> Self {
        let groups = headers
            .get(header::USER_GROUPS)
            .map(|g| {
                g.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        Self {
            org_id: headers.get_or_default(header::ORG_ID),
            user_id: headers.get_or_default(header::USER_ID),
            user_email: headers.get_or_default(header::USER_EMAIL),
            user_groups: groups,
            connection_name: headers.get_or_default(header::CONNECTION_NAME),
            verb: headers.get_or_default(header::CLIENT_VERB),
            origin: headers.get_or_default(header::CLIENT_ORIGIN),
            session_id: headers.get(header::SESSION_ID).map(String::from),
        }
    }
}

/// Everything known about a session, threaded explicitly through every call
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    pub sid: String,
    pub org_id: String,
    pub user_id: String,
    pub user_email: String,
    pub user_groups: Vec<String>,
    pub client_verb: String,
    pub client_origin: String,
    pub client_args: Vec<String>,
    pub connection: ConnectionRecord,
}

impl SessionContext {
    pub fn new(sid: String, identity: ClientIdentity, connection: ConnectionRecord) -> Self {
        Self {
            sid,
            org_id: identity.org_id,
            user_id: identity.user_id,
            user_email: identity.user_email,
            user_groups: identity.user_groups,
            client_verb: identity.verb,
            client_origin: identity.origin,
            client_args: Vec::new(),
            connection,
        }
    }

    /// Ensure every field the session relies on is present
    pub fn validate(&self) -> Result<(), String> {
        let required = [
            ("sid", self.sid.as_str()),
            ("connection-id", self.connection.id.as_str()),
            ("connection-name", self.connection.name.as_str()),
            ("connection-type", self.connection.connection_type.as_str()),
            ("agent-id", self.connection.agent_id.as_str()),
            ("org-id", self.org_id.as_str()),
            ("user-id", self.user_id.as_str()),
            ("client-verb", self.client_verb.as_str()),
            ("client-origin", self.client_origin.as_str()),
        ];
        let missing: Vec<&str> = required
            .iter()
            .filter(|(_, value)| value.is_empty())
            .map(|(name, _)| *name)
            .collect();
        if !missing.is_empty() {
            return Err(format!("missing required session attributes: {}", missing.join(", ")));
        }
        if ClientVerb::parse(&self.client_verb).is_none() {
            return Err(format!("unknown client verb {:?}", self.client_verb));
        }
        Ok(())
    }

    pub fn verb(&self) -> Option<ClientVerb> {
        ClientVerb::parse(&self.client_verb)
    }

    pub fn connection_type(&self) -> ConnectionType {
        self.connection.effective_type()
    }

    /// Registry key of the agent stream that serves this session
    pub fn stream_agent_id(&self) -> StreamAgentId {
        match self.connection.agent_mode {
            AgentMode::MultiConnection => {
                StreamAgentId::new(&self.connection.agent_id, &self.connection.name)
            }
            AgentMode::Standard => StreamAgentId::new(&self.connection.agent_id, ""),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> SessionContext {
        SessionContext {
            sid: "sid-1".into(),
            org_id: "org-1".into(),
            user_id: "user-1".into(),
            client_verb: "connect".into(),
            client_origin: "client".into(),
            connection: ConnectionRecord {
                id: "c-1".into(),
                name: "prod-db".into(),
                agent_id: "agent-1".into(),
                connection_type: "database".into(),
                subtype: "postgres".into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_validate_reports_missing_fields() {
        assert!(context().validate().is_ok());

        let mut ctx = context();
        ctx.user_id.clear();
        ctx.connection.agent_id.clear();
        let err = ctx.validate().unwrap_err();
        assert!(err.contains("agent-id"));
        assert!(err.contains("user-id"));

        let mut ctx = context();
        ctx.client_verb = "run".into();
        assert!(ctx.validate().is_err());
    }

    #[test]
    fn test_stream_agent_id_by_mode() {
        let mut ctx = context();
        assert_eq!(ctx.stream_agent_id(), StreamAgentId::new("agent-1", ""));

        ctx.connection.agent_mode = AgentMode::MultiConnection;
        assert_eq!(ctx.stream_agent_id(), StreamAgentId::new("agent-1", "prod-db"));
    }

    #[test]
    fn test_state_transitions() {
        use SessionState::*;
        assert!(Created.can_transition_to(WaitingApproval));
        assert!(Created.can_transition_to(Open));
        assert!(WaitingApproval.can_transition_to(Open));
        assert!(Open.can_transition_to(Relaying));
        assert!(Relaying.can_transition_to(Closed));
        assert!(!Created.can_transition_to(Relaying));
        assert!(!Relaying.can_transition_to(WaitingApproval));
        assert!(!Closed.can_transition_to(Open));
        assert!(!Closed.can_transition_to(Closed));
    }

    #[test]
    fn test_identity_from_headers() {
        let headers = StreamHeaders::new()
            .with(header::ORG_ID, "org-1")
            .with(header::USER_GROUPS, "admin, sre,")
            .with(header::SESSION_ID, "upstream-sid");
        let identity = ClientIdentity::from_headers(&headers);
        assert_eq!(identity.user_groups, vec!["admin".to_string(), "sre".to_string()]);
        assert_eq!(identity.session_id.as_deref(), Some("upstream-sid"));
        assert!(identity.user_id.is_empty());
    }
}
