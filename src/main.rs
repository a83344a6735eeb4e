//! icelink - Trickle-ICE ping-pong between two endpoints
//!
//! Run the listening side first, then the initiating side:
//!   icelink --server
//!   icelink --controlling --peer 203.0.113.7:9001

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use icelink::network::{
    AgentSettings, CandidatePolicy, ConnectivityEngine, ExchangeConfig, IceAgent, MessageLoop,
    MessageLoopConfig, Orchestrator, OrchestratorConfig, Role, DEFAULT_SIGNALING_PORT,
    DEFAULT_STUN_SERVERS,
};

#[derive(Parser)]
#[command(name = "icelink")]
#[command(about = "Establish an ICE session through an HTTP signaling exchange")]
#[command(version)]
struct Cli {
    /// Act as the ICE controlling agent (dial instead of accept)
    #[arg(long)]
    controlling: bool,

    /// Act as the signaling server (listen instead of initiate)
    #[arg(long)]
    server: bool,

    /// Signaling peer address (IP:PORT), used by the signaling client
    #[arg(long, default_value_t = format!("127.0.0.1:{}", DEFAULT_SIGNALING_PORT))]
    peer: String,

    /// Port the signaling server listens on
    #[arg(short, long, default_value_t = DEFAULT_SIGNALING_PORT)]
    port: u16,

    /// Public IP announced in place of host addresses (1:1 NAT), repeatable
    #[arg(long = "nat-ip")]
    nat_ips: Vec<String>,

    /// Gather server-reflexive candidates through public STUN servers
    #[arg(long)]
    stun: bool,

    /// Local candidates to relay before dial/accept starts (0 = start immediately)
    #[arg(long, default_value = "0")]
    min_candidates: usize,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

fn orchestrator_config(cli: &Cli) -> OrchestratorConfig {
    let peer_url = if cli.peer.starts_with("http://") || cli.peer.starts_with("https://") {
        cli.peer.clone()
    } else {
        format!("http://{}", cli.peer)
    };

    let candidate_policy = match cli.min_candidates {
        0 => CandidatePolicy::Immediate,
        n => CandidatePolicy::AtLeast(n),
    };

    OrchestratorConfig {
        role: Role::new(cli.controlling, cli.server),
        exchange: ExchangeConfig {
            peer_url,
            listen_addr: SocketAddr::from(([0, 0, 0, 0], cli.port)),
            ..Default::default()
        },
        candidate_policy,
        ..Default::default()
    }
}

fn agent_settings(cli: &Cli) -> AgentSettings {
    let stun_urls = if cli.stun {
        DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect()
    } else {
        Vec::new()
    };

    AgentSettings {
        nat_1to1_ips: cli.nat_ips.clone(),
        stun_urls,
        ..Default::default()
    }
}

async fn run(cli: Cli, cancel: CancellationToken) -> Result<()> {
    let config = orchestrator_config(&cli);

    let (agent, events) = IceAgent::new(&agent_settings(&cli), config.event_capacity)
        .await
        .context("Failed to create ICE agent")?;
    let agent = Arc::new(agent);

    let mut orchestrator = Orchestrator::new(config, agent.clone(), events);
    let result = async {
        let established = orchestrator.run(cancel.clone()).await?;
        info!(
            "Session established with remote ufrag {}",
            established.remote_credential.ufrag
        );

        let message_loop =
            MessageLoop::new(established.session.clone(), MessageLoopConfig::default());
        let loop_result = message_loop.run(cancel.clone()).await;
        established.shutdown().await;
        loop_result
    }
    .await;

    if let Err(e) = agent.close().await {
        warn!("{}", e);
    }
    Ok(result?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutting down...");
                cancel.cancel();
            }
        }
    });

    run(cli, cancel).await
}
