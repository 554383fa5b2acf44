//! Lobby member record.

use serde::{Deserialize, Serialize};

use crate::net::IpAddress;

/// One member of the lobby. The listening address `ip:port` is the
/// identity key; `id` is allocated by the leader at admission and is the
/// sole input to election priority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub ip: String,
    pub port: u16,
    pub name: String,
    pub id: i32,
    pub is_leader: bool,
    pub is_alive: bool,
}

impl Peer {
    pub fn address(&self) -> IpAddress {
        format!("{}:{}", self.ip, self.port)
    }
}

/// Split an `ip:port` string into its parts.
pub(crate) fn split_address(address: &str) -> Option<(String, u16)> {
    let (ip, port) = address.rsplit_once(':')?;
    Some((ip.to_string(), port.parse().ok()?))
}
