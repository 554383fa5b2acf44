//! Bully leader election.
//!
//! The peer with the highest admission id wins. A node that suspects the
//! leader challenges every higher-id peer with `ElectionStart`; any
//! `ElectionOk` means a higher peer is alive and will take over, so the
//! challenger waits for its `IAmLeader`. If nobody answers within
//! `election_timeout` the challenger promotes itself.

use std::future::Future;
use std::pin::Pin;

use tracing::{debug, info, warn};

use super::Lobby;
use crate::messages::{ElectionMessage, Message};
use crate::net::IpAddress;

impl Lobby {
    /// Begin an election unless one is already running. The failure
    /// detector pauses for the duration; the suspected leader is dropped
    /// from the table up front.
    ///
    /// Boxed rather than `async fn`: this and `handle_leave`/`dispatch`
    /// call each other (via the promotion task below), and an `async fn`
    /// here makes that call cycle an unprovable recursive `Send` bound.
    pub(crate) fn start_election(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
        let (targets, epoch) = {
            let mut st = self.inner.state.write().await;
            if st.election_in_progress || st.exiting {
                return;
            }
            st.election_in_progress = true;
            st.ok_received = false;
            st.election_epoch += 1;
            st.health_epoch += 1;
            let old_leader = st.leader.clone();
            st.members.remove(&old_leader);
            let my_id = st.my_id();
            let identity = st.identity.clone();
            let targets: Vec<IpAddress> = st
                .members
                .iter()
                .filter(|(address, peer)| **address != identity && peer.id > my_id)
                .map(|(address, _)| address.clone())
                .collect();
            info!(
                "starting a leader election (my id {my_id}, {} higher peers)",
                targets.len()
            );
            (targets, st.election_epoch)
        };

        if targets.is_empty() {
            self.promote_to_leader().await;
            return;
        }

        let identity = self.identity().await;
        for target in &targets {
            self.send_to(
                target,
                Message::Election(ElectionMessage::Start {
                    sender: identity.clone(),
                }),
            )
            .await;
        }

        // Promote when the timer fires with no ElectionOk seen, unless a
        // later event (ok, victory, shutdown) moved the epoch on.
        let lobby = self.clone();
        let wait = self.inner.timers.election_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            let promote = {
                let st = lobby.inner.state.read().await;
                st.election_epoch == epoch
                    && st.election_in_progress
                    && !st.ok_received
                    && !st.exiting
            };
            if promote {
                info!("no higher peer answered the election");
                lobby.promote_to_leader().await;
            }
        });
        })
    }

    /// Take leadership: point the table at ourselves, announce it, and
    /// process whatever was queued for the previous leader.
    pub(crate) async fn promote_to_leader(&self) {
        let (identity, pending) = {
            let mut st = self.inner.state.write().await;
            st.leader = st.identity.clone();
            let identity = st.identity.clone();
            for (address, peer) in st.members.iter_mut() {
                peer.is_leader = *address == identity;
            }
            if let Some(me) = st.members.get_mut(&identity) {
                me.is_alive = true;
            }
            st.election_in_progress = false;
            st.election_epoch += 1;
            st.health_epoch += 1;
            (identity, std::mem::take(&mut st.pending_leader_msgs))
        };
        info!("promoted to leader");
        self.broadcast(Message::Election(ElectionMessage::IAmLeader {
            sender: identity,
        }))
        .await;
        // Queued leader-bound messages are ours to process now.
        for msg in pending {
            self.dispatch(msg).await;
        }
        let st = self.inner.state.read().await;
        self.emit_members_changed(&st);
    }

    /// A lower-id peer is challenging. Answer Ok (we outrank it) and run
    /// our own election; yield silently if the challenger outranks us.
    pub(crate) async fn handle_election_start(&self, sender: IpAddress) {
        let answer = {
            let st = self.inner.state.read().await;
            let Some(challenger) = st.members.get(&sender) else {
                debug!("election start from unknown peer {sender}");
                return;
            };
            if st.is_leader() {
                Some((st.identity.clone(), false))
            } else if st.my_id() > challenger.id {
                Some((st.identity.clone(), !st.election_in_progress))
            } else {
                None
            }
        };
        match answer {
            Some((identity, elect)) => {
                self.send_to(
                    &sender,
                    Message::Election(ElectionMessage::Ok { sender: identity }),
                )
                .await;
                if elect {
                    self.start_election().await;
                }
            }
            None => debug!("yielding to higher-id challenger {sender}"),
        }
    }

    /// A higher peer answered our challenge; it will announce itself.
    pub(crate) async fn handle_election_ok(&self, sender: IpAddress) {
        let mut st = self.inner.state.write().await;
        if !st.election_in_progress {
            debug!("stale election ok from {sender}");
            return;
        }
        debug!("higher peer {sender} took over the election");
        st.ok_received = true;
        // Disarm our promotion timer; the winner's IAmLeader ends things.
        st.election_epoch += 1;
    }

    /// A peer claims victory. Accept it unless it is already our leader,
    /// unknown, or outranked by us while we lead.
    pub(crate) async fn handle_i_am_leader(&self, sender: IpAddress) {
        {
            let mut st = self.inner.state.write().await;
            if st.leader == sender {
                debug!("duplicate leader announcement from {sender}");
                return;
            }
            let Some(claimant) = st.members.get(&sender) else {
                debug!("leader claim from unknown peer {sender}");
                return;
            };
            let claimant_id = claimant.id;
            if st.is_leader() {
                if claimant_id > st.my_id() {
                    info!("ceding leadership to {sender} (id {claimant_id})");
                } else {
                    // Ids are unique at admission, so this is a stale claim
                    // from an interrupted election.
                    warn!(
                        "ignoring leader claim from {sender}: id {claimant_id} is lower than ours"
                    );
                    return;
                }
            } else {
                // The previous leader may still sit in the table dead.
                let old_leader = st.leader.clone();
                if !old_leader.is_empty() && old_leader != st.identity {
                    let stale = st
                        .members
                        .get(&old_leader)
                        .map(|peer| !peer.is_alive || !st.election_in_progress)
                        .unwrap_or(false);
                    if stale {
                        st.members.remove(&old_leader);
                    }
                }
            }
            st.leader = sender.clone();
            for (address, peer) in st.members.iter_mut() {
                peer.is_leader = *address == sender;
            }
            if let Some(leader) = st.members.get_mut(&sender) {
                leader.is_alive = true;
            }
            st.election_in_progress = false;
            st.election_epoch += 1;
            st.health_epoch += 1;
            info!("accepted {sender} as the new leader");
        }
        self.flush_pending_to_leader().await;
        let st = self.inner.state.read().await;
        self.emit_members_changed(&st);
    }
}
