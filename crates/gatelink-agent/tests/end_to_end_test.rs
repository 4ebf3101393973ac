//! Gateway, agent and client wired together over real TCP sockets

use gatelink_agent::{Agent, AgentConfig};
use gatelink_client::{ClientConfig, ClientSession};
use gatelink_gateway::directory::{ConnectionRecord, InMemoryDirectory};
use gatelink_gateway::{Collaborators, GatewayConfig, GatewayServer};
use gatelink_proto::{ClientVerb, StreamAgentId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const ORG: &str = "org-1";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

async fn echo_target() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                while let Ok(n) = socket.read(&mut buf).await {
                    if n == 0 || socket.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

fn connections(target: SocketAddr) -> InMemoryDirectory {
    let directory = InMemoryDirectory::new();
    directory.add_connection(ConnectionRecord {
        id: "c-db".into(),
        org_id: ORG.into(),
        name: "echo-db".into(),
        agent_id: "a-1".into(),
        connection_type: "database".into(),
        subtype: "postgres".into(),
        env_vars: HashMap::from([
            ("host".to_string(), target.ip().to_string()),
            ("port".to_string(), target.port().to_string()),
        ]),
        ..Default::default()
    });
    directory.add_connection(ConnectionRecord {
        id: "c-shell".into(),
        org_id: ORG.into(),
        name: "shell".into(),
        agent_id: "a-1".into(),
        connection_type: "custom".into(),
        command: vec!["sh".into(), "-c".into()],
        ..Default::default()
    });
    directory
}

struct Deployment {
    gateway_addr: SocketAddr,
    shutdown: CancellationToken,
}

async fn deploy() -> Deployment {
    init_tracing();
    let target = echo_target().await;
    let server = GatewayServer::new(
        GatewayConfig::default(),
        Collaborators::in_memory(connections(target)),
    );
    let agents = server.handler().agents().clone();
    let shutdown = server.shutdown_token();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let gateway_addr = listener.local_addr().unwrap();
    tokio::spawn(async move { server.serve(listener).await });

    let agent = Agent::new(AgentConfig::new(gateway_addr, ORG, "a-1"));
    let agent_shutdown = shutdown.child_token();
    tokio::spawn(async move { agent.run(agent_shutdown).await });

    let id = StreamAgentId::new("a-1", "");
    timeout(Duration::from_secs(5), async {
        while !agents.is_online(&id) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("agent never came online");

    Deployment {
        gateway_addr,
        shutdown,
    }
}

fn pg_query(sql: &str) -> Vec<u8> {
    let mut msg = vec![b'Q'];
    msg.extend_from_slice(&((sql.len() + 5) as u32).to_be_bytes());
    msg.extend_from_slice(sql.as_bytes());
    msg.push(0);
    msg
}

#[tokio::test]
async fn test_native_queries_reach_target_through_gateway() {
    let deployment = deploy().await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local_addr = listener.local_addr().unwrap();
    let config = ClientConfig::new(deployment.gateway_addr, "echo-db")
        .with_user(ORG, "user-1", "user@example.com");
    let session = ClientSession::connect(config, Vec::new(), Vec::new())
        .await
        .unwrap()
        .with_listener(listener);
    let cancel = session.cancellation();
    let client = tokio::spawn(session.run());

    let mut first = TcpStream::connect(local_addr).await.unwrap();
    let mut second = TcpStream::connect(local_addr).await.unwrap();
    first.write_all(&pg_query("SELECT 1")).await.unwrap();
    second.write_all(&pg_query("SELECT 2")).await.unwrap();

    for (socket, sql) in [(&mut first, "SELECT 1"), (&mut second, "SELECT 2")] {
        let expected = pg_query(sql);
        let mut echoed = vec![0u8; expected.len()];
        timeout(Duration::from_secs(5), socket.read_exact(&mut echoed))
            .await
            .expect("no reply from target")
            .unwrap();
        assert_eq!(echoed, expected);
    }

    cancel.cancel();
    timeout(Duration::from_secs(5), client).await.unwrap().unwrap().unwrap();
    deployment.shutdown.cancel();
}

#[tokio::test]
async fn test_exec_returns_command_exit_code() {
    let deployment = deploy().await;

    let config = ClientConfig::new(deployment.gateway_addr, "shell")
        .with_user(ORG, "user-1", "user@example.com")
        .with_verb(ClientVerb::Exec)
        .with_client_args(vec!["cat; exit 7".into()]);
    let session = ClientSession::connect(config, Vec::new(), Vec::new())
        .await
        .unwrap()
        .with_input(&b"hello from stdin"[..]);

    let outcome = timeout(Duration::from_secs(10), session.run())
        .await
        .expect("exec never finished")
        .unwrap();
    assert_eq!(outcome.exit_code, 7);
    deployment.shutdown.cancel();
}
