//! Numeric-tagged JSON wire form for [`Message`].
//!
//! Tags are protocol constants and must match on every peer: `type` 1..4
//! selects the family, `lobby_type` 1..6, `election_type` 1..3 and
//! `command_type` 1..5 select the variant inside composite families.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};
use std::collections::HashMap;

use super::{ApplicationMessage, CodecError, ElectionMessage, Envelope, LobbyMessage, Message};
use crate::lobby::Peer;
use crate::player::PlayerState;

const TYPE_LOBBY: i64 = 1;
const TYPE_HEALTH_CHECK: i64 = 2;
const TYPE_ELECTION: i64 = 3;
const TYPE_APPLICATION: i64 = 4;

const LOBBY_REQUEST_JOIN: i64 = 1;
const LOBBY_REQUEST_NEW_MEMBER: i64 = 2;
const LOBBY_NEW_MEMBER: i64 = 3;
const LOBBY_MEMBER_ACCEPT: i64 = 4;
const LOBBY_LEAVE: i64 = 5;
const LOBBY_MEMBER_LEFT: i64 = 6;

const ELECTION_START: i64 = 1;
const ELECTION_OK: i64 = 2;
const ELECTION_I_AM_LEADER: i64 = 3;

const COMMAND_STOP: i64 = 1;
const COMMAND_RESUME: i64 = 2;
const COMMAND_JUMP_TO_TIMESTAMP: i64 = 3;
const COMMAND_SET: i64 = 4;
const COMMAND_STATE: i64 = 5;

/// Encode one outgoing frame.
pub fn encode(envelope: &Envelope) -> Result<String, CodecError> {
    Ok(serde_json::to_string(envelope)?)
}

/// Decode one received frame.
pub fn decode(data: &str) -> Result<Envelope, CodecError> {
    let value: Value = serde_json::from_str(data)?;
    let to_leader = value
        .get("to_leader")
        .ok_or(CodecError::MissingField("to_leader"))?
        .as_bool()
        .ok_or(CodecError::BadField("to_leader"))?;
    let message = value
        .get("message")
        .ok_or(CodecError::MissingField("message"))?;
    Ok(Envelope {
        to_leader,
        message: Message::from_value(message)?,
    })
}

impl Message {
    fn to_value(&self) -> Value {
        match self {
            Message::Lobby(m) => m.to_value(),
            Message::HealthCheck { sender } => json!({
                "type": TYPE_HEALTH_CHECK,
                "sender": sender,
            }),
            Message::Election(m) => m.to_value(),
            Message::Application(m) => m.to_value(),
        }
    }

    fn from_value(value: &Value) -> Result<Self, CodecError> {
        match i64_field(value, "type")? {
            TYPE_LOBBY => Ok(Message::Lobby(LobbyMessage::from_value(value)?)),
            TYPE_HEALTH_CHECK => Ok(Message::HealthCheck {
                sender: str_field(value, "sender")?,
            }),
            TYPE_ELECTION => Ok(Message::Election(ElectionMessage::from_value(value)?)),
            TYPE_APPLICATION => Ok(Message::Application(ApplicationMessage::from_value(value)?)),
            other => Err(CodecError::UnknownTag {
                family: "type",
                value: other,
            }),
        }
    }
}

impl LobbyMessage {
    fn to_value(&self) -> Value {
        match self {
            LobbyMessage::RequestJoin {
                sender,
                target,
                name,
            } => json!({
                "type": TYPE_LOBBY,
                "lobby_type": LOBBY_REQUEST_JOIN,
                "sender": sender,
                "target": target,
                "name": name,
            }),
            LobbyMessage::RequestNewMember {
                sender,
                name,
                new_member_address,
            } => json!({
                "type": TYPE_LOBBY,
                "lobby_type": LOBBY_REQUEST_NEW_MEMBER,
                "sender": sender,
                "name": name,
                "new_member_address": new_member_address,
            }),
            LobbyMessage::NewMember {
                sender,
                name,
                new_member_address,
                new_member_id,
            } => json!({
                "type": TYPE_LOBBY,
                "lobby_type": LOBBY_NEW_MEMBER,
                "sender": sender,
                "name": name,
                "new_member_address": new_member_address,
                "new_member_id": new_member_id,
            }),
            LobbyMessage::MemberAccept { sender, members } => {
                let members: serde_json::Map<String, Value> = members
                    .iter()
                    .map(|(addr, peer)| (addr.clone(), peer_to_value(peer)))
                    .collect();
                json!({
                    "type": TYPE_LOBBY,
                    "lobby_type": LOBBY_MEMBER_ACCEPT,
                    "sender": sender,
                    "members": members,
                })
            }
            LobbyMessage::Leave { sender } => json!({
                "type": TYPE_LOBBY,
                "lobby_type": LOBBY_LEAVE,
                "sender": sender,
            }),
            LobbyMessage::MemberLeft {
                sender,
                member_address,
            } => json!({
                "type": TYPE_LOBBY,
                "lobby_type": LOBBY_MEMBER_LEFT,
                "sender": sender,
                "member_address": member_address,
            }),
        }
    }

    fn from_value(value: &Value) -> Result<Self, CodecError> {
        let sender = str_field(value, "sender")?;
        match i64_field(value, "lobby_type")? {
            LOBBY_REQUEST_JOIN => Ok(LobbyMessage::RequestJoin {
                sender,
                target: str_field(value, "target")?,
                name: str_field(value, "name")?,
            }),
            LOBBY_REQUEST_NEW_MEMBER => Ok(LobbyMessage::RequestNewMember {
                sender,
                name: str_field(value, "name")?,
                new_member_address: str_field(value, "new_member_address")?,
            }),
            LOBBY_NEW_MEMBER => Ok(LobbyMessage::NewMember {
                sender,
                name: str_field(value, "name")?,
                new_member_address: str_field(value, "new_member_address")?,
                new_member_id: i64_field(value, "new_member_id")?
                    .try_into()
                    .map_err(|_| CodecError::BadField("new_member_id"))?,
            }),
            LOBBY_MEMBER_ACCEPT => {
                let members = value
                    .get("members")
                    .ok_or(CodecError::MissingField("members"))?;
                let members: HashMap<String, Peer> = serde_json::from_value(members.clone())?;
                Ok(LobbyMessage::MemberAccept { sender, members })
            }
            LOBBY_LEAVE => Ok(LobbyMessage::Leave { sender }),
            LOBBY_MEMBER_LEFT => Ok(LobbyMessage::MemberLeft {
                sender,
                member_address: str_field(value, "member_address")?,
            }),
            other => Err(CodecError::UnknownTag {
                family: "lobby_type",
                value: other,
            }),
        }
    }
}

impl ElectionMessage {
    fn to_value(&self) -> Value {
        let (tag, sender) = match self {
            ElectionMessage::Start { sender } => (ELECTION_START, sender),
            ElectionMessage::Ok { sender } => (ELECTION_OK, sender),
            ElectionMessage::IAmLeader { sender } => (ELECTION_I_AM_LEADER, sender),
        };
        json!({
            "type": TYPE_ELECTION,
            "election_type": tag,
            "sender": sender,
        })
    }

    fn from_value(value: &Value) -> Result<Self, CodecError> {
        let sender = str_field(value, "sender")?;
        match i64_field(value, "election_type")? {
            ELECTION_START => Ok(ElectionMessage::Start { sender }),
            ELECTION_OK => Ok(ElectionMessage::Ok { sender }),
            ELECTION_I_AM_LEADER => Ok(ElectionMessage::IAmLeader { sender }),
            other => Err(CodecError::UnknownTag {
                family: "election_type",
                value: other,
            }),
        }
    }
}

impl ApplicationMessage {
    fn to_value(&self) -> Value {
        match self {
            ApplicationMessage::Stop => json!({
                "type": TYPE_APPLICATION,
                "command_type": COMMAND_STOP,
            }),
            ApplicationMessage::Resume => json!({
                "type": TYPE_APPLICATION,
                "command_type": COMMAND_RESUME,
            }),
            ApplicationMessage::JumpToTimestamp {
                destination_timestamp,
            } => json!({
                "type": TYPE_APPLICATION,
                "command_type": COMMAND_JUMP_TO_TIMESTAMP,
                "destination_timestamp": destination_timestamp,
            }),
            ApplicationMessage::Set { index } => json!({
                "type": TYPE_APPLICATION,
                "command_type": COMMAND_SET,
                "index": index,
            }),
            ApplicationMessage::State(state) => json!({
                "type": TYPE_APPLICATION,
                "command_type": COMMAND_STATE,
                "state": {
                    "index": state.index,
                    "timestamp": state.timestamp,
                    "playing": state.playing,
                },
            }),
        }
    }

    fn from_value(value: &Value) -> Result<Self, CodecError> {
        match i64_field(value, "command_type")? {
            COMMAND_STOP => Ok(ApplicationMessage::Stop),
            COMMAND_RESUME => Ok(ApplicationMessage::Resume),
            COMMAND_JUMP_TO_TIMESTAMP => Ok(ApplicationMessage::JumpToTimestamp {
                destination_timestamp: u64_field(value, "destination_timestamp")?,
            }),
            COMMAND_SET => Ok(ApplicationMessage::Set {
                index: u64_field(value, "index")? as usize,
            }),
            COMMAND_STATE => {
                let state = value.get("state").ok_or(CodecError::MissingField("state"))?;
                let state: PlayerState = serde_json::from_value(state.clone())?;
                Ok(ApplicationMessage::State(state))
            }
            other => Err(CodecError::UnknownTag {
                family: "command_type",
                value: other,
            }),
        }
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Message::from_value(&value).map_err(D::Error::custom)
    }
}

fn peer_to_value(peer: &Peer) -> Value {
    json!({
        "ip": peer.ip,
        "port": peer.port,
        "name": peer.name,
        "id": peer.id,
        "is_leader": peer.is_leader,
        "is_alive": peer.is_alive,
    })
}

fn i64_field(value: &Value, key: &'static str) -> Result<i64, CodecError> {
    value
        .get(key)
        .ok_or(CodecError::MissingField(key))?
        .as_i64()
        .ok_or(CodecError::BadField(key))
}

fn u64_field(value: &Value, key: &'static str) -> Result<u64, CodecError> {
    value
        .get(key)
        .ok_or(CodecError::MissingField(key))?
        .as_u64()
        .ok_or(CodecError::BadField(key))
}

fn str_field(value: &Value, key: &'static str) -> Result<String, CodecError> {
    Ok(value
        .get(key)
        .ok_or(CodecError::MissingField(key))?
        .as_str()
        .ok_or(CodecError::BadField(key))?
        .to_string())
}
