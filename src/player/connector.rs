//! Bridges a media player and a lobby.
//!
//! UI requests become application messages routed through the leader (or
//! applied directly when there is no lobby); delivered messages drive the
//! player; a leader ships its current state to every joiner.

use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use super::MediaPlayer;
use crate::lobby::{Lobby, LobbyEvent};
use crate::messages::{ApplicationMessage, Message};

pub struct PlayerConnector {
    player: Arc<dyn MediaPlayer>,
    lobby: Option<Lobby>,
}

impl PlayerConnector {
    /// Wire the player to the lobby and start the delivery tasks. With
    /// `None` the connector runs solo and applies every request locally.
    pub fn new(player: Arc<dyn MediaPlayer>, lobby: Option<Lobby>) -> Arc<Self> {
        let connector = Arc::new(Self {
            player,
            lobby: lobby.clone(),
        });
        if let Some(lobby) = lobby {
            connector.clone().spawn_command_task(&lobby);
            connector.clone().spawn_event_task(&lobby);
        }
        connector
    }

    /// Apply commands in the order the leader sequenced them.
    fn spawn_command_task(self: Arc<Self>, lobby: &Lobby) {
        let Some(mut commands) = lobby.take_application_receiver() else {
            warn!("application stream already taken, playback will not follow the lobby");
            return;
        };
        let mut shutdown = lobby.shutdown_signal();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    command = commands.recv() => match command {
                        Some(command) => self.apply(command),
                        None => break,
                    },
                }
            }
        });
    }

    /// On the leader, ship the current playback state to every admitted
    /// member so it starts in sync.
    fn spawn_event_task(self: Arc<Self>, lobby: &Lobby) {
        let mut events = lobby.subscribe();
        let mut shutdown = lobby.shutdown_signal();
        let lobby = lobby.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.changed() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(LobbyEvent::NewMember { address }) => {
                        if lobby.is_leader().await {
                            let state = self.player.get_state();
                            debug!("shipping playback state to {address}");
                            lobby
                                .send_to(
                                    &address,
                                    Message::Application(ApplicationMessage::State(state)),
                                )
                                .await;
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("lagged behind {skipped} lobby events");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    pub async fn request_pause(&self) {
        self.route(ApplicationMessage::Stop).await;
    }

    pub async fn request_resume(&self) {
        self.route(ApplicationMessage::Resume).await;
    }

    /// Skip to the next track, wrapping at the end of the playlist.
    pub async fn request_skip(&self) {
        let count = self.player.track_count();
        if count == 0 {
            return;
        }
        let next = (self.player.get_state().index + 1) % count;
        self.route(ApplicationMessage::Set { index: next }).await;
    }

    pub async fn request_skip_to_timestamp(&self, destination_ms: u64) {
        self.route(ApplicationMessage::JumpToTimestamp {
            destination_timestamp: destination_ms,
        })
        .await;
    }

    async fn route(&self, msg: ApplicationMessage) {
        match &self.lobby {
            Some(lobby) => lobby.submit_application(msg).await,
            None => self.apply(msg),
        }
    }

    /// Apply one delivered command. Pause and resume only act when they
    /// change something; every member reaches the same decision, so the
    /// lobby-wide outcome stays identical.
    fn apply(&self, msg: ApplicationMessage) {
        match msg {
            ApplicationMessage::Stop => {
                if self.player.get_state().playing {
                    self.player.pause();
                }
            }
            ApplicationMessage::Resume => {
                if !self.player.get_state().playing {
                    self.player.play();
                }
            }
            ApplicationMessage::Set { index } => self.player.set_song(index),
            ApplicationMessage::JumpToTimestamp {
                destination_timestamp,
            } => self.player.seek(destination_timestamp),
            ApplicationMessage::State(state) => self.player.set_state(state),
        }
    }
}
