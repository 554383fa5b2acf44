//! Media-engine seam and a demo playlist player.
//!
//! The lobby never interprets playback commands; it only orders them.
//! Everything that actually plays music sits behind [`MediaPlayer`].

pub mod connector;

use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Instant;
use tokio::sync::broadcast;

/// Snapshot of the media engine. Shipped to joiners so they start in sync,
/// and carried by the wire `State` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerState {
    /// Playlist index of the current track.
    pub index: usize,
    /// Playback position in milliseconds.
    pub timestamp: u64,
    pub playing: bool,
}

/// Player happenings, surfaced unchanged to the UI layer.
#[derive(Debug, Clone)]
pub enum PlayerEvent {
    TrackChanged { index: usize, name: String },
    Paused,
    Started,
    TimestampChanged { timestamp: u64 },
}

/// The media engine as the coordination layer sees it.
pub trait MediaPlayer: Send + Sync {
    fn get_state(&self) -> PlayerState;
    /// Jump to a track, position and play/pause state in one step.
    fn set_state(&self, state: PlayerState);
    fn pause(&self);
    fn play(&self);
    fn set_song(&self, index: usize);
    fn seek(&self, position_ms: u64);
    fn track_count(&self) -> usize;
}

/// Demo player over a named playlist. Playback position is simulated from
/// the time of the last state change; no audio is produced.
pub struct PlaylistPlayer {
    playlist: Vec<String>,
    position: Mutex<Playback>,
    events: broadcast::Sender<PlayerEvent>,
}

struct Playback {
    index: usize,
    playing: bool,
    /// Position when `updated` was taken; advances only while playing.
    position_ms: u64,
    updated: Instant,
}

impl Playback {
    fn current_ms(&self) -> u64 {
        if self.playing {
            self.position_ms + self.updated.elapsed().as_millis() as u64
        } else {
            self.position_ms
        }
    }
}

impl PlaylistPlayer {
    pub fn new(playlist: Vec<String>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            playlist,
            position: Mutex::new(Playback {
                index: 0,
                playing: false,
                position_ms: 0,
                updated: Instant::now(),
            }),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.events.subscribe()
    }

    pub fn track_name(&self, index: usize) -> Option<&str> {
        self.playlist.get(index).map(String::as_str)
    }

    fn wrap(&self, index: usize) -> usize {
        if self.playlist.is_empty() {
            0
        } else {
            index % self.playlist.len()
        }
    }

    fn emit(&self, event: PlayerEvent) {
        let _ = self.events.send(event);
    }
}

impl MediaPlayer for PlaylistPlayer {
    fn get_state(&self) -> PlayerState {
        let playback = self.position.lock().unwrap();
        PlayerState {
            index: playback.index,
            timestamp: playback.current_ms(),
            playing: playback.playing,
        }
    }

    fn set_state(&self, state: PlayerState) {
        let index = self.wrap(state.index);
        {
            let mut playback = self.position.lock().unwrap();
            playback.index = index;
            playback.position_ms = state.timestamp;
            playback.playing = state.playing;
            playback.updated = Instant::now();
        }
        self.emit(PlayerEvent::TrackChanged {
            index,
            name: self.track_name(index).unwrap_or_default().to_string(),
        });
        if state.playing {
            self.emit(PlayerEvent::Started);
        } else {
            self.emit(PlayerEvent::Paused);
        }
    }

    fn pause(&self) {
        {
            let mut playback = self.position.lock().unwrap();
            if !playback.playing {
                return;
            }
            playback.position_ms = playback.current_ms();
            playback.playing = false;
            playback.updated = Instant::now();
        }
        self.emit(PlayerEvent::Paused);
    }

    fn play(&self) {
        {
            let mut playback = self.position.lock().unwrap();
            if playback.playing {
                return;
            }
            playback.playing = true;
            playback.updated = Instant::now();
        }
        self.emit(PlayerEvent::Started);
    }

    fn set_song(&self, index: usize) {
        let index = self.wrap(index);
        {
            let mut playback = self.position.lock().unwrap();
            playback.index = index;
            playback.position_ms = 0;
            playback.updated = Instant::now();
        }
        self.emit(PlayerEvent::TrackChanged {
            index,
            name: self.track_name(index).unwrap_or_default().to_string(),
        });
    }

    fn seek(&self, position_ms: u64) {
        {
            let mut playback = self.position.lock().unwrap();
            playback.position_ms = position_ms;
            playback.updated = Instant::now();
        }
        self.emit(PlayerEvent::TimestampChanged {
            timestamp: position_ms,
        });
    }

    fn track_count(&self) -> usize {
        self.playlist.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn demo_player() -> PlaylistPlayer {
        PlaylistPlayer::new(vec![
            "first".to_string(),
            "second".to_string(),
            "third".to_string(),
        ])
    }

    #[test]
    fn pause_freezes_the_position() {
        let player = demo_player();
        player.play();
        player.seek(10_000);
        player.pause();
        let state = player.get_state();
        assert!(!state.playing);
        assert_eq!(state.timestamp, 10_000);
    }

    #[test]
    fn set_song_wraps_and_rewinds() {
        let player = demo_player();
        player.seek(5_000);
        player.set_song(4);
        let state = player.get_state();
        assert_eq!(state.index, 1);
        assert_eq!(state.timestamp, 0);
    }

    #[test]
    fn set_state_applies_everything_at_once() {
        let player = demo_player();
        player.set_state(PlayerState {
            index: 2,
            timestamp: 42_000,
            playing: false,
        });
        let state = player.get_state();
        assert_eq!(state.index, 2);
        assert_eq!(state.timestamp, 42_000);
        assert!(!state.playing);
    }

    #[test]
    fn events_reach_subscribers() {
        let player = demo_player();
        let mut events = player.subscribe();
        player.play();
        assert!(matches!(events.try_recv(), Ok(PlayerEvent::Started)));
        player.pause();
        assert!(matches!(events.try_recv(), Ok(PlayerEvent::Paused)));
    }
}
