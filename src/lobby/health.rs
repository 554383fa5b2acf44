//! Heartbeat failure detection.
//!
//! The leader probes every member each `health_interval` and reaps the
//! ones that did not ack by the next tick. Members expect a probe from
//! the leader within `leader_timeout` and start an election when it does
//! not come. The detector idles while an election is in progress, and an
//! in-flight cycle is discarded whenever the role changes (tracked by
//! `health_epoch`).

use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::Lobby;
use crate::messages::{LobbyMessage, Message};
use crate::net::IpAddress;

const ELECTION_PAUSE_POLL: Duration = Duration::from_millis(250);

impl Lobby {
    pub(crate) fn spawn_health_loop(&self) {
        let lobby = self.clone();
        tokio::spawn(async move { lobby.health_loop().await });
    }

    async fn health_loop(self) {
        let mut shutdown = self.inner.shutdown_tx.subscribe();
        debug!("health check loop started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let (leading, electing, epoch) = {
                let st = self.inner.state.read().await;
                if st.exiting {
                    break;
                }
                (st.is_leader(), st.election_in_progress, st.health_epoch)
            };
            if electing {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = sleep(ELECTION_PAUSE_POLL) => {}
                }
                continue;
            }
            if leading {
                self.leader_health_cycle(&mut shutdown, epoch).await;
            } else {
                self.member_health_cycle(&mut shutdown, epoch).await;
            }
        }
        debug!("health check loop stopped");
    }

    /// Mark every member unconfirmed, probe them all, and reap whoever is
    /// still unconfirmed when the timer fires.
    async fn leader_health_cycle(&self, shutdown: &mut watch::Receiver<bool>, epoch: u64) {
        let sender = {
            let mut st = self.inner.state.write().await;
            let identity = st.identity.clone();
            for (address, peer) in st.members.iter_mut() {
                if *address != identity {
                    peer.is_alive = false;
                }
            }
            identity
        };
        debug!("broadcasting health check");
        self.broadcast(Message::HealthCheck { sender }).await;

        tokio::select! {
            _ = shutdown.changed() => return,
            _ = sleep(self.inner.timers.health_interval) => {}
        }

        {
            let st = self.inner.state.read().await;
            if st.health_epoch != epoch || st.election_in_progress || !st.is_leader() {
                return;
            }
        }
        self.reap_dead_members().await;
    }

    async fn reap_dead_members(&self) {
        let (identity, dead) = {
            let mut st = self.inner.state.write().await;
            let identity = st.identity.clone();
            let dead: Vec<IpAddress> = st
                .members
                .iter()
                .filter(|(address, peer)| **address != identity && !peer.is_alive)
                .map(|(address, _)| address.clone())
                .collect();
            for address in &dead {
                st.members.remove(address);
                warn!("member {address} missed its health check");
            }
            if !dead.is_empty() {
                self.emit_members_changed(&st);
            }
            (identity, dead)
        };
        for address in dead {
            self.broadcast(Message::Lobby(LobbyMessage::MemberLeft {
                sender: identity.clone(),
                member_address: address,
            }))
            .await;
        }
    }

    /// Expect a probe from the leader before the timer fires; otherwise
    /// the leader is presumed dead and an election begins.
    async fn member_health_cycle(&self, shutdown: &mut watch::Receiver<bool>, epoch: u64) {
        {
            let mut st = self.inner.state.write().await;
            let leader = st.leader.clone();
            if let Some(peer) = st.members.get_mut(&leader) {
                peer.is_alive = false;
            }
        }

        tokio::select! {
            _ = shutdown.changed() => return,
            _ = sleep(self.inner.timers.leader_timeout) => {}
        }

        let leader_dead = {
            let st = self.inner.state.read().await;
            if st.health_epoch != epoch
                || st.election_in_progress
                || st.is_leader()
                || st.exiting
            {
                return;
            }
            match st.members.get(&st.leader) {
                Some(peer) => !peer.is_alive,
                // No leader in the table at all; elect one.
                None => true,
            }
        };
        if leader_dead {
            info!("leader missed its heartbeat window");
            self.start_election().await;
        }
    }

    /// A probe (on members, answered immediately) or an ack (on the
    /// leader). Either way the sender is alive.
    pub(crate) async fn handle_health_check(&self, sender: IpAddress) {
        let reply_from = {
            let mut st = self.inner.state.write().await;
            let is_leader = st.is_leader();
            let from_leader = st.leader == sender;
            let Some(peer) = st.members.get_mut(&sender) else {
                debug!("health check from unknown peer {sender}");
                return;
            };
            peer.is_alive = true;
            if !is_leader && from_leader {
                debug!("health check from leader {sender}");
                Some(st.identity.clone())
            } else {
                debug!("health check ack from {sender}");
                None
            }
        };
        if let Some(identity) = reply_from {
            self.send_to_leader(Message::HealthCheck { sender: identity })
                .await;
        }
    }
}
