//! Gatelink CLI - gateway, agent and client in one binary
//!
//! Run a gateway, attach agents to it and open sessions to the connections
//! the agents serve.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use gatelink_agent::{Agent, AgentConfig};
use gatelink_client::{ClientConfig, ClientSession, SessionOutcome};
use gatelink_gateway::{Collaborators, GatewayConfig, GatewayServer};
use gatelink_proto::ClientVerb;
use serde::de::DeserializeOwned;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Gatelink - audited access to databases and servers through a gateway
#[derive(Parser, Debug)]
#[command(name = "gatelink")]
#[command(about = "Gatelink - audited access to databases and servers through a gateway")]
#[command(version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info", env = "GATELINK_LOG_LEVEL")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the gateway
    #[command(long_about = r#"
Run the gateway that agents and clients connect to.

EXAMPLES:
  # Start a gateway with connections and policies from a file
  gatelink gateway --config gateway.yaml

  # Override the listen address
  gatelink gateway --config gateway.yaml --listen 0.0.0.0:9010
"#)]
    Gateway {
        /// Configuration file (YAML)
        #[arg(long, short = 'c', env = "GATELINK_GATEWAY_CONFIG")]
        config: Option<PathBuf>,

        /// Address to listen on (e.g., 0.0.0.0:8010)
        #[arg(long, env = "GATELINK_LISTEN")]
        listen: Option<SocketAddr>,

        /// Base URL used in review links
        #[arg(long, env = "GATELINK_API_URL")]
        api_url: Option<String>,
    },

    /// Run an agent next to the resources it serves
    Agent {
        /// Configuration file (YAML)
        #[arg(long, short = 'c', env = "GATELINK_AGENT_CONFIG")]
        config: Option<PathBuf>,

        /// Gateway address (e.g., 127.0.0.1:8010)
        #[arg(long, env = "GATELINK_GATEWAY")]
        gateway: Option<SocketAddr>,

        /// Organization ID
        #[arg(long, env = "GATELINK_ORG_ID")]
        org_id: Option<String>,

        /// Agent ID (auto-generated if not specified)
        #[arg(long, env = "GATELINK_AGENT_ID")]
        agent_id: Option<String>,

        /// Agent name (defaults to the agent ID)
        #[arg(long, env = "GATELINK_AGENT_NAME")]
        agent_name: Option<String>,

        /// Serve only this connection (multi-connection mode)
        #[arg(long, env = "GATELINK_CONNECTION")]
        connection: Option<String>,
    },

    /// Open a long-lived session and expose it locally
    Connect {
        #[command(flatten)]
        session: SessionArgs,

        /// Local port for native protocol connections
        #[arg(long, short = 'p', env = "GATELINK_PROXY_PORT")]
        port: Option<u16>,
    },

    /// Run a one-shot command; stdin is sent as its input
    Exec {
        #[command(flatten)]
        session: SessionArgs,
    },
}

#[derive(Args, Debug)]
struct SessionArgs {
    /// Connection name
    connection: String,

    /// Gateway address
    #[arg(long, env = "GATELINK_GATEWAY", default_value = "127.0.0.1:8010")]
    gateway: SocketAddr,

    #[arg(long, env = "GATELINK_ORG_ID")]
    org_id: String,

    #[arg(long, env = "GATELINK_USER_ID")]
    user_id: String,

    #[arg(long, env = "GATELINK_USER_EMAIL", default_value = "")]
    user_email: String,

    /// Comma separated user groups
    #[arg(long, env = "GATELINK_USER_GROUPS", value_delimiter = ',')]
    groups: Vec<String>,

    /// Arguments appended to the connection command
    #[arg(last = true)]
    args: Vec<String>,
}

impl SessionArgs {
    fn into_config(self, verb: ClientVerb) -> ClientConfig {
        ClientConfig::new(self.gateway, self.connection)
            .with_user(self.org_id, self.user_id, self.user_email)
            .with_groups(self.groups)
            .with_client_args(self.args)
            .with_verb(verb)
    }
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false).with_writer(std::io::stderr))
        .with(filter)
        .init();

    Ok(())
}

/// Load configuration from YAML file
fn load_config_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: T = serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

async fn run_gateway(
    config: Option<PathBuf>,
    listen: Option<SocketAddr>,
    api_url: Option<String>,
) -> Result<()> {
    let mut config: GatewayConfig = match &config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            load_config_file(path)?
        }
        None => GatewayConfig::default(),
    };
    // CLI args override config file
    if let Some(listen) = listen {
        config = config.with_listen_addr(listen);
    }
    if let Some(api_url) = api_url {
        config = config.with_api_url(api_url);
    }

    info!(
        "Loaded {} connections for {} organizations",
        config.directory.connections.len(),
        config.directory.policies.len()
    );
    let directory = config.directory.clone().into_directory();
    let server = GatewayServer::new(config, Collaborators::in_memory(directory));
    let shutdown = server.shutdown_token();

    let run = server.run();
    tokio::pin!(run);
    tokio::select! {
        result = &mut run => return result.context("Gateway failed"),
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            shutdown.cancel();
        }
    }
    // Let the server close every session before exiting
    run.await.context("Gateway failed")
}

fn build_agent_config(
    config: Option<PathBuf>,
    gateway: Option<SocketAddr>,
    org_id: Option<String>,
    agent_id: Option<String>,
    agent_name: Option<String>,
    connection: Option<String>,
) -> Result<AgentConfig> {
    let mut config: AgentConfig = match &config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            load_config_file(path)?
        }
        None => AgentConfig::default(),
    };

    if let Some(gateway) = gateway {
        config.gateway_addr = gateway;
    }
    if let Some(org_id) = org_id {
        config.org_id = org_id;
    }
    if let Some(agent_id) = agent_id {
        config.agent_id = agent_id;
    }
    if let Some(agent_name) = agent_name {
        config = config.with_name(agent_name);
    }
    if let Some(connection) = connection {
        config = config.with_connection(connection);
    }
    if config.agent_name.is_empty() {
        config.agent_name = config.agent_id.clone();
    }

    if config.org_id.is_empty() {
        anyhow::bail!("Organization ID is required (use --org-id or config file)");
    }
    Ok(config)
}

async fn run_agent(config: AgentConfig) -> Result<()> {
    info!("Agent ID: {}", config.agent_id);
    info!("Gateway: {}", config.gateway_addr);

    let agent = Agent::new(config);
    let shutdown = CancellationToken::new();
    let agent_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { agent.run(shutdown).await })
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            shutdown.cancel();
        }
        result = agent_task => {
            match result {
                Ok(Ok(())) => info!("Agent stopped normally"),
                Ok(Err(e)) => {
                    error!("Agent error: {:#}", e);
                    return Err(e.into());
                }
                Err(e) => {
                    error!("Agent task panicked: {}", e);
                    return Err(e.into());
                }
            }
        }
    }
    info!("Agent stopped");
    Ok(())
}

async fn run_session(config: ClientConfig) -> Result<SessionOutcome> {
    let session = ClientSession::connect(config, tokio::io::stdout(), tokio::io::stderr())
        .await
        .context("Failed to connect to gateway")?
        .with_input(tokio::io::stdin());
    let cancel = session.cancellation();

    tokio::select! {
        outcome = session.run() => outcome.context("Session failed"),
        _ = tokio::signal::ctrl_c() => {
            cancel.cancel();
            Ok(SessionOutcome { exit_code: 130, message: None })
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli.log_level)?;

    match cli.command {
        Commands::Gateway {
            config,
            listen,
            api_url,
        } => run_gateway(config, listen, api_url).await,
        Commands::Agent {
            config,
            gateway,
            org_id,
            agent_id,
            agent_name,
            connection,
        } => {
            let config =
                build_agent_config(config, gateway, org_id, agent_id, agent_name, connection)
                    .context("Failed to build agent configuration")?;
            run_agent(config).await
        }
        Commands::Connect { session, port } => {
            let mut config = session.into_config(ClientVerb::Connect);
            if let Some(port) = port {
                config = config.with_listen_port(port);
            }
            let outcome = run_session(config).await?;
            std::process::exit(outcome.exit_code);
        }
        Commands::Exec { session } => {
            let outcome = run_session(session.into_config(ClientVerb::Exec)).await?;
            std::process::exit(outcome.exit_code);
        }
    }
}
