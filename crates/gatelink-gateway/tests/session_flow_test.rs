//! Integration tests for the gateway session flow
//!
//! Agents and clients are wired to the handler over in-memory stream pairs;
//! one test goes through the TCP server.

use gatelink_gateway::directory::{ConnectionRecord, InMemoryDirectory, LivenessStatus, PolicyConfig};
use gatelink_gateway::plugins::{InMemoryReviewStore, MemoryAuditLog, ReviewStatus, ReviewStore};
use gatelink_gateway::{Collaborators, GatewayConfig, GatewayError, GatewayHandler, GatewayServer, RegistryError};
use gatelink_proto::keys::{self, header};
use gatelink_proto::{
    AgentConnectionParams, GuardrailRule, GuardrailRuleSet, Packet, PacketType, Protocol,
    INTERNAL_ERROR_EXIT_CODE, ORIGIN_AGENT, ORIGIN_CLIENT,
};
use gatelink_transport::{memory, FramedStream, PacketStream, StreamHeaders};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;

type Side = FramedStream<DuplexStream>;

const ORG: &str = "org-1";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn shell_connection() -> ConnectionRecord {
    ConnectionRecord {
        id: "c-shell".into(),
        org_id: ORG.into(),
        name: "shell".into(),
        agent_id: "a-1".into(),
        connection_type: "custom".into(),
        command: vec!["bash".into()],
        ..Default::default()
    }
}

fn prod_db() -> ConnectionRecord {
    ConnectionRecord {
        id: "c-db".into(),
        org_id: ORG.into(),
        name: "prod-db".into(),
        agent_id: "a-1".into(),
        connection_type: "database".into(),
        subtype: "postgres".into(),
        guardrail_input_rules: vec![GuardrailRuleSet {
            rules: vec![GuardrailRule {
                rule_type: "deny_words_list".into(),
                words: vec!["DROP TABLE".into()],
                name: "no-drop".into(),
                ..Default::default()
            }],
        }],
        ..Default::default()
    }
}

struct Harness {
    directory: InMemoryDirectory,
    reviews: InMemoryReviewStore,
    handler: GatewayHandler,
}

fn harness(config: GatewayConfig) -> Harness {
    init_tracing();
    let directory = InMemoryDirectory::new();
    directory.add_connection(shell_connection());
    directory.add_connection(prod_db());
    let reviews = InMemoryReviewStore::new();
    let mut collaborators = Collaborators::in_memory(directory.clone());
    collaborators.reviews = Arc::new(reviews.clone());
    collaborators.audit = Arc::new(MemoryAuditLog::new());
    let server = GatewayServer::new(config, collaborators);
    Harness {
        directory,
        reviews,
        handler: server.handler().clone(),
    }
}

fn agent_headers(agent_id: &str) -> StreamHeaders {
    StreamHeaders::new()
        .with(header::ORIGIN, ORIGIN_AGENT)
        .with(header::ORG_ID, ORG)
        .with(header::AGENT_ID, agent_id)
        .with(header::AGENT_NAME, "edge")
        .with(header::HOSTNAME, "edge-host")
}

fn client_headers(connection: &str, verb: &str) -> StreamHeaders {
    StreamHeaders::new()
        .with(header::ORIGIN, ORIGIN_CLIENT)
        .with(header::ORG_ID, ORG)
        .with(header::USER_ID, "user-1")
        .with(header::USER_GROUPS, "dev")
        .with(header::CONNECTION_NAME, connection)
        .with(header::CLIENT_VERB, verb)
        .with(header::CLIENT_ORIGIN, "client")
}

fn attach(
    handler: &GatewayHandler,
    headers: StreamHeaders,
) -> (Side, JoinHandle<Result<(), GatewayError>>) {
    let (gateway_side, remote_side) = memory::pair();
    let handler = handler.clone();
    let task = tokio::spawn(async move { handler.handle_stream(Arc::new(gateway_side), headers).await });
    (remote_side, task)
}

async fn connect_agent(handler: &GatewayHandler) -> (Side, JoinHandle<Result<(), GatewayError>>) {
    let (agent, task) = attach(handler, agent_headers("a-1"));
    let ok = next(&agent).await;
    assert_eq!(ok.kind(), PacketType::GatewayConnectOk);
    (agent, task)
}

async fn next(stream: &Side) -> Packet {
    timeout(Duration::from_secs(5), stream.recv())
        .await
        .expect("timed out waiting for packet")
        .expect("stream error")
        .expect("stream closed")
}

async fn assert_silent(stream: &Side) {
    let received = timeout(Duration::from_millis(200), stream.recv()).await;
    assert!(received.is_err(), "unexpected packet: {:?}", received);
}

#[tokio::test]
async fn test_exec_session_relays_both_directions() {
    let h = harness(GatewayConfig::default());
    let (agent, _agent_task) = connect_agent(&h.handler).await;
    let (client, client_task) = attach(&h.handler, client_headers("shell", "exec"));

    client
        .send(Packet::new(PacketType::SessionOpen).with_payload("uname -a"))
        .await
        .unwrap();

    let open = next(&agent).await;
    assert_eq!(open.kind(), PacketType::SessionOpen);
    let sid = open.session_id().unwrap().to_string();
    assert_eq!(open.spec_str(keys::CONNECTION_TYPE), Some("command-line"));
    let params = AgentConnectionParams::decode(&open).unwrap();
    assert_eq!(params.command, vec!["bash".to_string()]);
    assert_eq!(params.user_id, "user-1");

    agent
        .send(Packet::new(PacketType::SessionOpenOk).with_session_id(&sid))
        .await
        .unwrap();
    let ok = next(&client).await;
    assert_eq!(ok.kind(), PacketType::SessionOpenOk);
    assert_eq!(ok.spec_str(keys::CONNECTION_TYPE), Some("command-line"));

    client
        .send(Packet::new(PacketType::ExecWriteStdin).with_payload("ls"))
        .await
        .unwrap();
    let stdin = next(&agent).await;
    assert_eq!(stdin.kind(), PacketType::ExecWriteStdin);
    assert_eq!(stdin.session_id(), Some(sid.as_str()));
    assert_eq!(stdin.payload, b"ls");

    agent
        .send(
            Packet::new(PacketType::ExecWriteStdout)
                .with_session_id(&sid)
                .with_payload("Linux"),
        )
        .await
        .unwrap();
    assert_eq!(next(&client).await.payload, b"Linux");

    agent
        .send(
            Packet::new(PacketType::SessionClose)
                .with_session_id(&sid)
                .with_spec(keys::CLIENT_EXIT_CODE, "0"),
        )
        .await
        .unwrap();
    let close = next(&client).await;
    assert_eq!(close.kind(), PacketType::SessionClose);
    assert_eq!(close.exit_code(), Some(0));

    timeout(Duration::from_secs(5), client_task).await.unwrap().unwrap().unwrap();
    assert_eq!(h.handler.proxies().count(), 0);
}

#[tokio::test]
async fn test_guardrail_veto_forwards_nothing_to_agent() {
    let h = harness(GatewayConfig::default());
    h.directory.set_policies(
        ORG,
        vec![PolicyConfig {
            name: "guardrails".into(),
            connections: vec!["prod-db".into()],
            ..Default::default()
        }],
    );
    let (agent, _agent_task) = connect_agent(&h.handler).await;
    let (client, _client_task) = attach(&h.handler, client_headers("prod-db", "exec"));

    client
        .send(Packet::new(PacketType::SessionOpen).with_payload("DROP TABLE users;"))
        .await
        .unwrap();

    let close = next(&client).await;
    assert_eq!(close.kind(), PacketType::SessionClose);
    assert_eq!(
        close.payload_str(),
        "validation error, match guard rails input rule, name=no-drop"
    );
    assert_eq!(close.exit_code(), Some(INTERNAL_ERROR_EXIT_CODE));
    assert_silent(&agent).await;
}

#[tokio::test]
async fn test_client_spec_cannot_override_session_id() {
    let h = harness(GatewayConfig::default());
    let (agent, _agent_task) = connect_agent(&h.handler).await;
    let (client, _client_task) = attach(&h.handler, client_headers("shell", "exec"));

    client
        .send(Packet::new(PacketType::SessionOpen).with_session_id("forged"))
        .await
        .unwrap();
    let open = next(&agent).await;
    assert_ne!(open.session_id(), Some("forged"));
    assert!(h.handler.proxies().get(open.session_id().unwrap()).is_some());
}

#[tokio::test]
async fn test_agent_offline_is_reported() {
    let h = harness(GatewayConfig::default());
    let (client, _client_task) = attach(&h.handler, client_headers("shell", "exec"));
    client.send(Packet::new(PacketType::SessionOpen)).await.unwrap();
    assert_eq!(next(&client).await.kind(), PacketType::SessionOpenAgentOffline);
}

#[tokio::test]
async fn test_unknown_connection_rejected() {
    let h = harness(GatewayConfig::default());
    let (client, task) = attach(&h.handler, client_headers("nope", "exec"));
    let close = next(&client).await;
    assert_eq!(close.kind(), PacketType::SessionClose);
    assert_eq!(close.payload_str(), "connection nope not found");
    assert!(matches!(
        task.await.unwrap(),
        Err(GatewayError::ConnectionNotFound(_))
    ));
}

#[tokio::test]
async fn test_duplicate_agent_rejected() {
    let h = harness(GatewayConfig::default());
    let (_agent, _agent_task) = connect_agent(&h.handler).await;
    let (_second, second_task) = attach(&h.handler, agent_headers("a-1"));
    let result = timeout(Duration::from_secs(5), second_task).await.unwrap().unwrap();
    assert!(matches!(
        result,
        Err(GatewayError::Registry(RegistryError::AlreadyConnected))
    ));
    assert_eq!(h.handler.agents().count(), 1);
    assert_eq!(h.directory.agent_status(ORG, "a-1"), Some(LivenessStatus::Online));
}

#[tokio::test]
async fn test_agent_disconnect_closes_its_sessions() {
    let h = harness(GatewayConfig::default());
    let (agent, agent_task) = connect_agent(&h.handler).await;
    let (client, _client_task) = attach(&h.handler, client_headers("shell", "exec"));
    client.send(Packet::new(PacketType::SessionOpen)).await.unwrap();
    let _open = next(&agent).await;
    assert_eq!(h.handler.proxies().count(), 1);

    agent.close().await.unwrap();
    timeout(Duration::from_secs(5), agent_task).await.unwrap().unwrap().unwrap();

    let close = next(&client).await;
    assert_eq!(close.kind(), PacketType::SessionClose);
    assert_eq!(close.payload_str(), "agent disconnected");
    assert_eq!(h.handler.proxies().count(), 0);
    assert_eq!(h.handler.agents().count(), 0);
    assert_eq!(h.directory.agent_status(ORG, "a-1"), Some(LivenessStatus::Offline));
}

#[tokio::test]
async fn test_review_approval_resumes_session() {
    let h = harness(GatewayConfig::default().with_api_url("https://gw.example/api"));
    h.directory.set_policies(
        ORG,
        vec![PolicyConfig {
            name: "review".into(),
            connections: vec!["shell".into()],
            config: vec!["approvers".into()],
            ..Default::default()
        }],
    );
    let (agent, _agent_task) = connect_agent(&h.handler).await;
    let (client, _client_task) = attach(&h.handler, client_headers("shell", "exec"));

    client
        .send(Packet::new(PacketType::SessionOpen).with_payload("rm -rf /tmp/cache"))
        .await
        .unwrap();
    let waiting = next(&client).await;
    assert_eq!(waiting.kind(), PacketType::SessionOpenWaitingApproval);
    let sid = waiting.session_id().unwrap().to_string();
    let review_id = waiting.spec_str(keys::REVIEW_ID).unwrap().to_string();
    assert_eq!(
        waiting.payload_str(),
        format!("https://gw.example/api/reviews/{}", review_id)
    );
    assert_silent(&agent).await;

    h.reviews
        .update_status(ORG, &review_id, ReviewStatus::Approved)
        .await
        .unwrap();
    h.handler.review_status_changed(&sid, true).await.unwrap();
    assert_eq!(next(&client).await.kind(), PacketType::SessionOpenApproveOk);

    client
        .send(Packet::new(PacketType::SessionOpen).with_payload("rm -rf /tmp/cache"))
        .await
        .unwrap();
    let open = next(&agent).await;
    assert_eq!(open.kind(), PacketType::SessionOpen);
    assert_eq!(open.session_id(), Some(sid.as_str()));
    assert_eq!(h.reviews.get(&review_id).unwrap().status, ReviewStatus::Processing);
}

#[tokio::test]
async fn test_stdin_while_waiting_approval_never_reaches_agent() {
    let h = harness(GatewayConfig::default());
    h.directory.set_policies(
        ORG,
        vec![PolicyConfig {
            name: "review".into(),
            connections: vec!["shell".into()],
            ..Default::default()
        }],
    );
    let (agent, _agent_task) = connect_agent(&h.handler).await;
    let (client, _client_task) = attach(&h.handler, client_headers("shell", "exec"));

    client.send(Packet::new(PacketType::SessionOpen)).await.unwrap();
    let waiting = next(&client).await;
    assert_eq!(waiting.kind(), PacketType::SessionOpenWaitingApproval);

    client
        .send(Packet::new(PacketType::ExecWriteStdin).with_payload("rm -rf /"))
        .await
        .unwrap();
    assert_silent(&agent).await;
    assert_silent(&client).await;
}

#[tokio::test]
async fn test_native_write_before_open_ack_is_refused() {
    let h = harness(GatewayConfig::default());
    let (agent, _agent_task) = connect_agent(&h.handler).await;
    let (client, _client_task) = attach(&h.handler, client_headers("prod-db", "connect"));

    client.send(Packet::new(PacketType::SessionOpen)).await.unwrap();
    let open = next(&agent).await;
    assert_eq!(open.kind(), PacketType::SessionOpen);
    let sid = open.session_id().unwrap().to_string();

    client
        .send(
            Packet::new(PacketType::WriteServer(Protocol::Postgres))
                .with_spec(keys::CLIENT_CONNECTION_ID, "1")
                .with_payload("SELECT 1"),
        )
        .await
        .unwrap();
    let close = next(&client).await;
    assert_eq!(close.kind(), PacketType::CloseTcpConnection);
    assert_eq!(close.session_id(), Some(sid.as_str()));
    assert_eq!(close.connection_id(), Some("1"));
    assert_silent(&agent).await;
}

#[tokio::test]
async fn test_client_that_stops_reading_does_not_stall_other_sessions() {
    let h = harness(GatewayConfig::default());
    let (agent, _agent_task) = connect_agent(&h.handler).await;

    let mut sids = Vec::new();
    let mut clients = Vec::new();
    for _ in 0..2 {
        let (client, task) = attach(&h.handler, client_headers("shell", "exec"));
        client.send(Packet::new(PacketType::SessionOpen)).await.unwrap();
        let sid = next(&agent).await.session_id().unwrap().to_string();
        agent
            .send(Packet::new(PacketType::SessionOpenOk).with_session_id(&sid))
            .await
            .unwrap();
        assert_eq!(next(&client).await.kind(), PacketType::SessionOpenOk);
        sids.push(sid);
        clients.push((client, task));
    }

    // The first client never reads again
    let chunk = vec![b'x'; 1024 * 1024];
    for _ in 0..64 {
        agent
            .send(
                Packet::new(PacketType::ExecWriteStdout)
                    .with_session_id(&sids[0])
                    .with_payload(chunk.clone()),
            )
            .await
            .unwrap();
    }
    agent
        .send(
            Packet::new(PacketType::ExecWriteStdout)
                .with_session_id(&sids[1])
                .with_payload("still flowing"),
        )
        .await
        .unwrap();

    let (active, _) = &clients[1];
    let out = timeout(Duration::from_secs(3), active.recv())
        .await
        .expect("second session was held up by the stalled client")
        .unwrap()
        .unwrap();
    assert_eq!(out.kind(), PacketType::ExecWriteStdout);
    assert_eq!(out.payload, b"still flowing");
}

#[tokio::test]
async fn test_review_rejection_closes_session() {
    let h = harness(GatewayConfig::default());
    h.directory.set_policies(
        ORG,
        vec![PolicyConfig {
            name: "review".into(),
            connections: vec!["shell".into()],
            ..Default::default()
        }],
    );
    let (client, _client_task) = attach(&h.handler, client_headers("shell", "exec"));
    client.send(Packet::new(PacketType::SessionOpen)).await.unwrap();
    let sid = next(&client).await.session_id().unwrap().to_string();

    h.handler.review_status_changed(&sid, false).await.unwrap();
    let close = next(&client).await;
    assert_eq!(close.kind(), PacketType::SessionClose);
    assert_eq!(close.payload_str(), "access to connection has been denied");
}

#[tokio::test(start_paused = true)]
async fn test_open_timeout_when_agent_never_answers() {
    let h = harness(GatewayConfig::default().with_open_timeout(Duration::from_secs(15)));
    let (agent, _agent_task) = connect_agent(&h.handler).await;
    let (client, _client_task) = attach(&h.handler, client_headers("shell", "exec"));

    client.send(Packet::new(PacketType::SessionOpen)).await.unwrap();
    let _open = next(&agent).await;

    tokio::time::advance(Duration::from_secs(16)).await;
    assert_eq!(next(&client).await.kind(), PacketType::SessionOpenTimeout);
    let close = next(&agent).await;
    assert_eq!(close.kind(), PacketType::SessionClose);
    assert_eq!(h.handler.proxies().count(), 0);
}

#[tokio::test]
async fn test_server_restart_marks_agents_offline_until_they_register() {
    init_tracing();
    let directory = InMemoryDirectory::new();
    directory.add_connection(shell_connection());
    for id in ["a-1", "a-2"] {
        use gatelink_gateway::StatusSink;
        directory
            .update_agent_status(ORG, id, LivenessStatus::Online, None)
            .await
            .unwrap();
    }

    let server = Arc::new(GatewayServer::new(
        GatewayConfig::default(),
        Collaborators::in_memory(directory.clone()),
    ));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serving = {
        let server = server.clone();
        tokio::spawn(async move { server.serve(listener).await })
    };

    let agent = FramedStream::connect(addr, &agent_headers("a-1")).await.unwrap();
    let ok = timeout(Duration::from_secs(5), agent.recv()).await.unwrap().unwrap().unwrap();
    assert_eq!(ok.kind(), PacketType::GatewayConnectOk);
    assert_eq!(directory.agent_status(ORG, "a-1"), Some(LivenessStatus::Online));
    assert_eq!(directory.agent_status(ORG, "a-2"), Some(LivenessStatus::Offline));

    server.shutdown_token().cancel();
    timeout(Duration::from_secs(5), serving).await.unwrap().unwrap().unwrap();
}
