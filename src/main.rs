use anyhow::Context;
use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use dist_lobby::lobby::{Lobby, LobbyEvent, TimerConfig};
use dist_lobby::net::TcpTransport;
use dist_lobby::player::connector::PlayerConnector;
use dist_lobby::player::PlaylistPlayer;

#[derive(Parser, Debug)]
struct Args {
    #[clap(long, default_value = "config.toml")]
    config: String,

    /// Override the configured display name.
    #[clap(long)]
    name: Option<String>,

    /// Join an existing lobby at ip:port instead of creating one.
    #[clap(long)]
    join: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
struct Config {
    name: String,
    listen_ip: String,
    listen_port: u16,
    join: Option<String>,
    #[serde(default = "default_health_interval_secs")]
    health_interval_secs: u64,
    #[serde(default = "default_leader_timeout_secs")]
    leader_timeout_secs: u64,
    #[serde(default = "default_election_timeout_secs")]
    election_timeout_secs: u64,
    #[serde(default)]
    playlist: Vec<String>,
}

fn default_health_interval_secs() -> u64 {
    5
}

fn default_leader_timeout_secs() -> u64 {
    8
}

fn default_election_timeout_secs() -> u64 {
    5
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let cfg_text = fs::read_to_string(&args.config).context("read config")?;
    let mut cfg: Config = toml::from_str(&cfg_text).context("parse config")?;
    if let Some(name) = args.name {
        cfg.name = name;
    }
    if let Some(join) = args.join {
        cfg.join = Some(join);
    }
    anyhow::ensure!(
        cfg.leader_timeout_secs > cfg.health_interval_secs,
        "leader_timeout_secs must be greater than health_interval_secs"
    );

    let listen = format!("{}:{}", cfg.listen_ip, cfg.listen_port);
    let transport = Arc::new(
        TcpTransport::bind(&listen)
            .await
            .with_context(|| format!("bind {listen}"))?,
    );
    let lobby = Lobby::new(
        transport,
        TimerConfig {
            health_interval: Duration::from_secs(cfg.health_interval_secs),
            leader_timeout: Duration::from_secs(cfg.leader_timeout_secs),
            election_timeout: Duration::from_secs(cfg.election_timeout_secs),
        },
    );
    lobby.start();

    match &cfg.join {
        Some(addr) => {
            let (lobby_ip, lobby_port) = addr
                .rsplit_once(':')
                .context("join address must be ip:port")?;
            let lobby_port: u16 = lobby_port.parse().context("parse join port")?;
            let sent = lobby
                .join_lobby(
                    &cfg.name,
                    &cfg.listen_ip,
                    cfg.listen_port,
                    lobby_ip,
                    lobby_port,
                )
                .await;
            anyhow::ensure!(sent, "could not reach the lobby at {addr}");
        }
        None => {
            lobby
                .create_lobby(&cfg.listen_ip, cfg.listen_port, &cfg.name)
                .await;
        }
    }

    let player = Arc::new(PlaylistPlayer::new(cfg.playlist.clone()));
    let connector = PlayerConnector::new(player.clone(), Some(lobby.clone()));

    let mut member_events = lobby.subscribe();
    tokio::spawn(async move {
        loop {
            match member_events.recv().await {
                Ok(LobbyEvent::MembersChanged {
                    members, leader, ..
                }) => {
                    let mut roster: Vec<String> = members
                        .values()
                        .map(|peer| {
                            if peer.is_leader {
                                format!("{}*", peer.name)
                            } else {
                                peer.name.clone()
                            }
                        })
                        .collect();
                    roster.sort();
                    info!("members: [{}] (leader {leader})", roster.join(", "));
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let mut player_events = player.subscribe();
    tokio::spawn(async move {
        loop {
            match player_events.recv().await {
                Ok(event) => info!("player: {event:?}"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    info!("commands: pause | resume | skip | seek <seconds> | quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let mut words = line.split_whitespace();
        match words.next() {
            Some("pause") => connector.request_pause().await,
            Some("resume") => connector.request_resume().await,
            Some("skip") => connector.request_skip().await,
            Some("seek") => match words.next().and_then(|s| s.parse::<u64>().ok()) {
                Some(seconds) => connector.request_skip_to_timestamp(seconds * 1000).await,
                None => warn!("usage: seek <seconds>"),
            },
            Some("quit") | Some("leave") => break,
            None => {}
            Some(other) => warn!("unknown command {other}"),
        }
    }

    lobby.leave_lobby().await;
    lobby.shutdown().await;
    Ok(())
}
