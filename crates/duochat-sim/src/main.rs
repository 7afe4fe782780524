//! duochat pairing simulator
//!
//! Usage:
//!   duochat-sim [--clients 4] [--duration-secs 30] [--skip-after-secs 5]
//!   duochat-sim --relay wss://relay.damus.io --relay wss://nos.lol
//!   duochat-sim --nostr
//!
//! Every client gets an in-memory session provider and capture device. The
//! lobby is an in-memory broker unless relays are given, in which case
//! beacons go over Nostr. `--nostr` uses the relays from the config file.
//! When `[ice] credentials_url` is set, every client fetches its relay
//! credentials from it at identity init.

use anyhow::{bail, Context, Result};
use clap::Parser;
use duochat::mock::{MockBroker, MockCaptureDevice, MockNetwork, MockProvider};
use duochat::{
    Collaborators, Controller, ControllerConfig, ControllerHandle, CredentialSource,
    HttpCredentialSource, LifecycleState, LobbyTransport, NostrLobbyTransport,
};
use duochat_config::{Config, IceConfig, LobbyConfig};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::info;

#[derive(Parser)]
#[command(name = "duochat-sim")]
#[command(about = "Pair simulated clients through a shared lobby", long_about = None)]
struct Cli {
    /// Number of clients to run
    #[arg(long, default_value_t = 4)]
    clients: usize,

    /// How long to run before shutting everyone down
    #[arg(long, default_value_t = 30)]
    duration_secs: u64,

    /// Nostr relay for the lobby (repeatable); in-memory broker when absent
    #[arg(long = "relay")]
    relays: Vec<String>,

    /// Use the configured Nostr relays when no --relay is given
    #[arg(long)]
    nostr: bool,

    /// Lobby topic, overriding the configured one
    #[arg(long)]
    topic: Option<String>,

    /// Skip to the next peer after roughly this many seconds connected
    #[arg(long, default_value_t = 5)]
    skip_after_secs: u64,
}

/// Relays the lobby should use; empty means the in-memory broker
fn lobby_relays(cli: &Cli, lobby: &LobbyConfig) -> Vec<String> {
    if !cli.relays.is_empty() {
        cli.relays.clone()
    } else if cli.nostr {
        lobby.relays.clone()
    } else {
        Vec::new()
    }
}

fn credential_source(ice: &IceConfig) -> Result<Option<Arc<dyn CredentialSource>>> {
    let Some(url) = &ice.credentials_url else {
        return Ok(None);
    };
    let timeout = Duration::from_millis(ice.credentials_timeout_ms);
    let source = HttpCredentialSource::new(url.clone(), timeout)
        .with_context(|| format!("Failed to build credential client for {}", url))?;
    Ok(Some(Arc::new(source) as Arc<dyn CredentialSource>))
}

struct Stats {
    id: String,
    pairings: usize,
    peers: Vec<String>,
    latency_ms: Option<u64>,
}

/// Drive one client: skip each peer after a jittered delay, record who it met
async fn drive(handle: ControllerHandle, skip_after: Duration) -> Stats {
    let mut rx = handle.subscribe();
    let mut stats = Stats {
        id: String::new(),
        pairings: 0,
        peers: Vec::new(),
        latency_ms: None,
    };
    let mut current: Option<String> = None;

    handle.start_search();
    loop {
        let snapshot = rx.borrow_and_update().clone();
        if let Some(id) = &snapshot.local_id {
            stats.id = id.clone();
        }
        if snapshot.latency_ms.is_some() {
            stats.latency_ms = snapshot.latency_ms;
        }

        match (snapshot.state, snapshot.remote_peer) {
            (LifecycleState::Connected, Some(peer)) if current.as_ref() != Some(&peer) => {
                stats.pairings += 1;
                stats.peers.push(peer.clone());
                info!(client = %stats.id, peer = %peer, "paired");
                current = Some(peer);

                let jitter = rand::thread_rng().gen_range(0..=skip_after.as_millis() as u64 / 2);
                let skip = handle.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(skip_after + Duration::from_millis(jitter)).await;
                    skip.send_chat("bye");
                    skip.skip_to_next();
                });
            }
            (LifecycleState::Connected, _) => {}
            (LifecycleState::Error, _) => {
                // errors clear on a new search
                current = None;
                tokio::time::sleep(Duration::from_secs(1)).await;
                handle.start_search();
            }
            (LifecycleState::Idle, _) => {
                current = None;
                handle.start_search();
            }
            _ => current = None,
        }

        if rx.changed().await.is_err() {
            return stats;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("duochat=info,duochat_sim=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if cli.clients < 2 {
        bail!("need at least two clients to pair");
    }

    let mut config = Config::load_or_default();
    if let Some(topic) = &cli.topic {
        config.lobby.topic = topic.clone();
    }
    let controller_config = ControllerConfig::from(&config);
    let relays = lobby_relays(&cli, &config.lobby);
    if cli.nostr && relays.is_empty() {
        bail!("--nostr given but no relays are configured");
    }
    let credentials = credential_source(&config.ice)?;

    let network = MockNetwork::new();
    let broker = MockBroker::new();
    info!(
        clients = cli.clients,
        relays = relays.len(),
        topic = %config.lobby.topic,
        credentials = credentials.is_some(),
        "starting simulation"
    );

    let mut handles = Vec::with_capacity(cli.clients);
    for _ in 0..cli.clients {
        let lobby: Arc<dyn LobbyTransport> = if relays.is_empty() {
            Arc::new(broker.transport())
        } else {
            Arc::new(NostrLobbyTransport::new(relays.clone()))
        };
        handles.push(Controller::spawn(
            controller_config.clone(),
            Collaborators {
                provider: Arc::new(MockProvider::new(&network)),
                lobby,
                capture: Arc::new(MockCaptureDevice::new()),
                credentials: credentials.clone(),
            },
        ));
    }

    let skip_after = Duration::from_secs(cli.skip_after_secs);
    let mut drivers = JoinSet::new();
    for handle in &handles {
        drivers.spawn(drive(handle.clone(), skip_after));
    }

    tokio::time::sleep(Duration::from_secs(cli.duration_secs)).await;
    info!("duration elapsed, shutting down");
    let mut finals = HashMap::new();
    for handle in &handles {
        let snapshot = handle.snapshot();
        if let Some(id) = snapshot.local_id {
            finals.insert(id, snapshot.state);
        }
    }
    for handle in &handles {
        handle.shutdown().await;
    }
    drop(handles);

    let mut total = 0;
    while let Some(result) = drivers.join_next().await {
        let stats = result?;
        total += stats.pairings;
        let state = finals
            .get(&stats.id)
            .map(|s| s.to_string())
            .unwrap_or_else(|| "UNKNOWN".to_string());
        let latency = stats
            .latency_ms
            .map(|ms| format!("{ms}ms"))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}: {} at end, {} pairings, last latency {} {:?}",
            stats.id, state, stats.pairings, latency, stats.peers
        );
    }
    // each pairing is counted by both sides
    println!("total sessions: {}", total / 2);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_lobby_relays() {
        let lobby = LobbyConfig {
            relays: vec!["wss://configured.example".to_string()],
            ..LobbyConfig::default()
        };

        let cli = Cli::parse_from(["duochat-sim"]);
        assert!(lobby_relays(&cli, &lobby).is_empty());

        let cli = Cli::parse_from(["duochat-sim", "--nostr"]);
        assert_eq!(lobby_relays(&cli, &lobby), vec!["wss://configured.example"]);

        // explicit relays win over the config
        let cli = Cli::parse_from(["duochat-sim", "--nostr", "--relay", "wss://cli.example"]);
        assert_eq!(lobby_relays(&cli, &lobby), vec!["wss://cli.example"]);
    }

    #[tokio::test]
    async fn test_credential_source_follows_config() {
        let mut ice = IceConfig::default();
        assert!(credential_source(&ice).unwrap().is_none());

        ice.credentials_url = Some("https://turn.example/credentials".to_string());
        assert!(credential_source(&ice).unwrap().is_some());
    }
}
