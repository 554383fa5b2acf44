//! Wire messages exchanged between lobby members.

pub mod codec;
pub mod error;

pub use error::CodecError;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::lobby::Peer;
use crate::net::IpAddress;
use crate::player::PlayerState;

/// Outer frame for every message on the wire. The `to_leader` flag carries
/// the sender's routing assumption; a receiver that is not the leader drops
/// flagged frames instead of acting on stale leadership.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub to_leader: bool,
    pub message: Message,
}

/// The four message families, numeric `type` tags 1..4 on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Lobby(LobbyMessage),
    HealthCheck { sender: IpAddress },
    Election(ElectionMessage),
    Application(ApplicationMessage),
}

/// Membership traffic, numeric `lobby_type` tags 1..6.
#[derive(Debug, Clone, PartialEq)]
pub enum LobbyMessage {
    /// A node outside the lobby asks `target` (any member) to be admitted.
    RequestJoin {
        sender: IpAddress,
        target: IpAddress,
        name: String,
    },
    /// A member forwards a join request to the leader.
    RequestNewMember {
        sender: IpAddress,
        name: String,
        new_member_address: IpAddress,
    },
    /// Leader announces an admitted member, with its allocated id.
    NewMember {
        sender: IpAddress,
        name: String,
        new_member_address: IpAddress,
        new_member_id: i32,
    },
    /// Leader's direct reply to the joiner, carrying the full member table.
    MemberAccept {
        sender: IpAddress,
        members: HashMap<IpAddress, Peer>,
    },
    Leave {
        sender: IpAddress,
    },
    /// Leader tells the lobby that a member is gone.
    MemberLeft {
        sender: IpAddress,
        member_address: IpAddress,
    },
}

/// Bully election traffic, numeric `election_type` tags 1..3.
#[derive(Debug, Clone, PartialEq)]
pub enum ElectionMessage {
    Start { sender: IpAddress },
    Ok { sender: IpAddress },
    IAmLeader { sender: IpAddress },
}

/// Playback commands, opaque to the lobby core, numeric `command_type`
/// tags 1..5. The leader orders them; members apply them in that order.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplicationMessage {
    Stop,
    Resume,
    JumpToTimestamp { destination_timestamp: u64 },
    Set { index: usize },
    State(PlayerState),
}

