//! Peer-to-peer coordination layer for synchronized group media playback.
//!
//! Every node runs the same lobby; one elected leader sequences all
//! application commands (play/pause/seek/song-select) so members stay in
//! sync. Membership, Bully leader election and heartbeat failure detection
//! live in [`lobby`], the wire codec in [`messages`], the transport in
//! [`net`], and the media-player integration in [`player`].

pub mod lobby;
pub mod messages;
pub mod net;
pub mod player;

pub use lobby::{Lobby, LobbyEvent, Peer, TimerConfig};
pub use messages::{ApplicationMessage, ElectionMessage, Envelope, LobbyMessage, Message};
pub use net::{IpAddress, TcpTransport, Transport};
pub use player::{MediaPlayer, PlayerState, PlaylistPlayer};
