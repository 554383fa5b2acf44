//! Self-organizing lobby: peer table, join/leave flows, message dispatch.
//!
//! Every node runs the same lobby. One member is the leader; it admits
//! joiners, sequences application commands and health-checks the rest.
//! Leader failure is repaired by a Bully election ([`election`]), driven
//! by the heartbeat detector ([`health`]).

pub mod election;
pub mod health;
pub mod peer;

#[cfg(test)]
mod tests;

pub use peer::Peer;

use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::messages::{codec, ApplicationMessage, ElectionMessage, Envelope, LobbyMessage, Message};
use crate::net::{IpAddress, Transport};

/// Id of a joiner that has not been admitted yet.
pub const PROVISIONAL_ID: i32 = -1;

/// Protocol timers. `leader_timeout` must stay strictly greater than
/// `health_interval` so ordinary heartbeat jitter never trips an election.
#[derive(Debug, Clone, Copy)]
pub struct TimerConfig {
    /// Leader-side heartbeat period, and how long the leader waits for acks.
    pub health_interval: Duration,
    /// Member-side wait for a leader heartbeat before electing.
    pub leader_timeout: Duration,
    /// Wait for an `ElectionOk` from a higher peer before self-promotion.
    pub election_timeout: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            health_interval: Duration::from_secs(5),
            leader_timeout: Duration::from_secs(8),
            election_timeout: Duration::from_secs(5),
        }
    }
}

/// Events surfaced to the application layer.
#[derive(Debug, Clone)]
pub enum LobbyEvent {
    /// The member table changed: somebody joined, left, was removed, or the
    /// leadership moved. Raised once per logically distinct change.
    MembersChanged {
        members: HashMap<IpAddress, Peer>,
        identity: IpAddress,
        leader: IpAddress,
    },
    /// Leader-only: a member was just admitted. The application layer ships
    /// the current playback state to it.
    NewMember { address: IpAddress },
}

pub(crate) struct LobbyState {
    pub(crate) identity: IpAddress,
    pub(crate) leader: IpAddress,
    pub(crate) members: HashMap<IpAddress, Peer>,
    /// Messages that failed to reach a leader later declared dead; drained
    /// once a new leader is announced.
    pub(crate) pending_leader_msgs: Vec<Message>,
    pub(crate) election_in_progress: bool,
    pub(crate) ok_received: bool,
    /// Invalidates an armed election timer when bumped.
    pub(crate) election_epoch: u64,
    /// Invalidates an in-flight health cycle when the role changes.
    pub(crate) health_epoch: u64,
    pub(crate) health_started: bool,
    pub(crate) exiting: bool,
}

impl LobbyState {
    pub(crate) fn is_leader(&self) -> bool {
        !self.identity.is_empty() && self.identity == self.leader
    }

    pub(crate) fn me(&self) -> Option<&Peer> {
        self.members.get(&self.identity)
    }

    pub(crate) fn my_id(&self) -> i32 {
        self.me().map(|p| p.id).unwrap_or(PROVISIONAL_ID)
    }

    /// The joiner addressed us by our public address; adopt its ip part and
    /// re-key our own entry under the new identity.
    fn adopt_own_ip(&mut self, ip: &str) {
        let Some(mut me) = self.members.remove(&self.identity) else {
            return;
        };
        let was_leader = self.identity == self.leader;
        me.ip = ip.to_string();
        self.identity = me.address();
        if was_leader {
            self.leader = self.identity.clone();
        }
        self.members.insert(self.identity.clone(), me);
    }
}

struct LobbyInner {
    state: RwLock<LobbyState>,
    transport: Arc<dyn Transport>,
    timers: TimerConfig,
    events: broadcast::Sender<LobbyEvent>,
    app_tx: mpsc::UnboundedSender<ApplicationMessage>,
    app_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<ApplicationMessage>>>,
    /// Serializes enqueue and drain of the pending-to-leader queue so a
    /// flush cannot interleave with freshly submitted leader-bound traffic.
    leader_gate: Mutex<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// Handle to one lobby node. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Lobby {
    inner: Arc<LobbyInner>,
}

impl Lobby {
    pub fn new(transport: Arc<dyn Transport>, timers: TimerConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        let (app_tx, app_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(LobbyInner {
                state: RwLock::new(LobbyState {
                    identity: String::new(),
                    leader: String::new(),
                    members: HashMap::new(),
                    pending_leader_msgs: Vec::new(),
                    election_in_progress: false,
                    ok_received: false,
                    election_epoch: 0,
                    health_epoch: 0,
                    health_started: false,
                    exiting: false,
                }),
                transport,
                timers,
                events,
                app_tx,
                app_rx: std::sync::Mutex::new(Some(app_rx)),
                leader_gate: Mutex::new(()),
                shutdown_tx,
            }),
        }
    }

    /// Subscribe to membership events.
    pub fn subscribe(&self) -> broadcast::Receiver<LobbyEvent> {
        self.inner.events.subscribe()
    }

    /// The stream of application commands to apply locally, in the order
    /// the leader sequenced them. Can be taken once.
    pub fn take_application_receiver(
        &self,
    ) -> Option<mpsc::UnboundedReceiver<ApplicationMessage>> {
        self.inner.app_rx.lock().unwrap().take()
    }

    /// Observe shutdown; flips to true once `shutdown` runs.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.inner.shutdown_tx.subscribe()
    }

    /// Start the receive/dispatch loop.
    pub fn start(&self) {
        let lobby = self.clone();
        tokio::spawn(async move { lobby.run().await });
    }

    /// Become a one-member lobby with self as leader and start the failure
    /// detector.
    pub async fn create_lobby(&self, ip: &str, port: u16, name: &str) {
        {
            let mut st = self.inner.state.write().await;
            let id = random_id(&st.members);
            let me = Peer {
                ip: ip.to_string(),
                port,
                name: name.to_string(),
                id,
                is_leader: true,
                is_alive: true,
            };
            st.identity = me.address();
            st.leader = me.address();
            st.members.insert(me.address(), me);
            st.health_started = true;
            info!("created lobby as {} (id {id})", st.identity);
            self.emit_members_changed(&st);
        }
        self.spawn_health_loop();
    }

    /// Ask a lobby member to admit us. Returns whether the request left
    /// this node; admission is confirmed later by `MemberAccept`.
    pub async fn join_lobby(
        &self,
        my_name: &str,
        my_ip: &str,
        my_port: u16,
        lobby_ip: &str,
        lobby_port: u16,
    ) -> bool {
        let bootstrap = format!("{lobby_ip}:{lobby_port}");
        let identity = {
            let mut st = self.inner.state.write().await;
            let me = Peer {
                ip: my_ip.to_string(),
                port: my_port,
                name: my_name.to_string(),
                id: PROVISIONAL_ID,
                is_leader: false,
                is_alive: true,
            };
            st.identity = me.address();
            st.members.insert(me.address(), me);
            st.identity.clone()
        };
        info!("joining a lobby at {bootstrap}");
        self.send_to(
            &bootstrap,
            Message::Lobby(LobbyMessage::RequestJoin {
                sender: identity,
                target: bootstrap.clone(),
                name: my_name.to_string(),
            }),
        )
        .await
    }

    /// Leave gracefully. A leaving leader tells every remaining member so
    /// that one unreachable peer cannot stall the handoff election; a
    /// member just notifies the leader.
    pub async fn leave_lobby(&self) {
        let (identity, targets) = {
            let mut st = self.inner.state.write().await;
            let identity = st.identity.clone();
            if st.is_leader() {
                if st.members.len() <= 1 {
                    return;
                }
                st.members.remove(&identity);
                (identity, st.members.keys().cloned().collect::<Vec<_>>())
            } else {
                let leader = st.leader.clone();
                (identity, vec![leader])
            }
        };
        info!("leaving the lobby");
        for target in targets {
            self.send_to(
                &target,
                Message::Lobby(LobbyMessage::Leave {
                    sender: identity.clone(),
                }),
            )
            .await;
        }
    }

    /// Leader-only fan-out to every member except self. Members that
    /// cannot be reached are dropped from the table silently, with a single
    /// `MembersChanged` at the end.
    pub async fn broadcast(&self, msg: Message) {
        let targets = {
            let st = self.inner.state.read().await;
            if !st.is_leader() {
                error!("broadcast refused: this node is not the leader");
                return;
            }
            st.members
                .keys()
                .filter(|addr| **addr != st.identity)
                .cloned()
                .collect::<Vec<_>>()
        };
        let frame = match codec::encode(&Envelope {
            to_leader: false,
            message: msg,
        }) {
            Ok(frame) => frame,
            Err(e) => {
                error!("failed to encode broadcast: {e}");
                return;
            }
        };
        let mut unreachable = Vec::new();
        for target in targets {
            if !self.inner.transport.send(&target, &frame).await {
                unreachable.push(target);
            }
        }
        if !unreachable.is_empty() {
            let mut st = self.inner.state.write().await;
            let mut removed = false;
            for addr in &unreachable {
                if st.members.remove(addr).is_some() {
                    warn!("dropping unreachable member {addr}");
                    removed = true;
                }
            }
            if removed {
                self.emit_members_changed(&st);
            }
        }
    }

    /// Send one message. The envelope's `to_leader` flag reflects whether
    /// the target is the current leader; leader-bound sends that fail are
    /// queued and trigger an election.
    pub async fn send_to(&self, target: &str, msg: Message) -> bool {
        let to_leader = {
            let st = self.inner.state.read().await;
            !st.leader.is_empty() && st.leader == target
        };
        if to_leader {
            return self.send_leaderward(target.to_string(), msg).await;
        }
        let frame = match codec::encode(&Envelope {
            to_leader: false,
            message: msg,
        }) {
            Ok(frame) => frame,
            Err(e) => {
                error!("failed to encode message: {e}");
                return false;
            }
        };
        self.inner.transport.send(target, &frame).await
    }

    pub async fn send_to_leader(&self, msg: Message) -> bool {
        let leader = {
            let st = self.inner.state.read().await;
            st.leader.clone()
        };
        if leader.is_empty() {
            // No leader known yet; hold the message until one is announced.
            let _gate = self.inner.leader_gate.lock().await;
            let mut st = self.inner.state.write().await;
            st.pending_leader_msgs.push(msg);
            return false;
        }
        self.send_leaderward(leader, msg).await
    }

    async fn send_leaderward(&self, leader: IpAddress, msg: Message) -> bool {
        let sent = {
            let _gate = self.inner.leader_gate.lock().await;
            let frame = match codec::encode(&Envelope {
                to_leader: true,
                message: msg.clone(),
            }) {
                Ok(frame) => frame,
                Err(e) => {
                    error!("failed to encode message: {e}");
                    return false;
                }
            };
            let sent = self.inner.transport.send(&leader, &frame).await;
            if !sent {
                warn!("leader {leader} unreachable, queueing message");
                let mut st = self.inner.state.write().await;
                st.pending_leader_msgs.push(msg);
            }
            sent
        };
        if !sent {
            self.start_election().await;
        }
        sent
    }

    /// Re-send queued leader-bound messages to the newly announced leader.
    /// Failures re-queue for the next one.
    pub(crate) async fn flush_pending_to_leader(&self) {
        let _gate = self.inner.leader_gate.lock().await;
        let (leader, pending) = {
            let mut st = self.inner.state.write().await;
            (st.leader.clone(), std::mem::take(&mut st.pending_leader_msgs))
        };
        if leader.is_empty() {
            let mut st = self.inner.state.write().await;
            st.pending_leader_msgs = pending;
            return;
        }
        for msg in pending {
            let frame = match codec::encode(&Envelope {
                to_leader: true,
                message: msg.clone(),
            }) {
                Ok(frame) => frame,
                Err(e) => {
                    error!("failed to encode queued message: {e}");
                    continue;
                }
            };
            if !self.inner.transport.send(&leader, &frame).await {
                let mut st = self.inner.state.write().await;
                st.pending_leader_msgs.push(msg);
            }
        }
    }

    /// Route a locally produced playback command: the leader orders and
    /// fans it out, a member hands it to the leader.
    pub async fn submit_application(&self, msg: ApplicationMessage) {
        if self.is_leader().await {
            self.broadcast(Message::Application(msg.clone())).await;
            self.deliver_application(msg);
        } else {
            self.send_to_leader(Message::Application(msg)).await;
        }
    }

    pub async fn is_leader(&self) -> bool {
        self.inner.state.read().await.is_leader()
    }

    pub async fn identity(&self) -> IpAddress {
        self.inner.state.read().await.identity.clone()
    }

    pub async fn leader(&self) -> IpAddress {
        self.inner.state.read().await.leader.clone()
    }

    pub async fn members(&self) -> HashMap<IpAddress, Peer> {
        self.inner.state.read().await.members.clone()
    }

    /// Stop the dispatcher and both timer loops and release the transport.
    /// Idempotent; in-flight handlers run to completion.
    pub async fn shutdown(&self) {
        {
            let mut st = self.inner.state.write().await;
            st.exiting = true;
        }
        let _ = self.inner.shutdown_tx.send(true);
        self.inner.transport.shutdown().await;
        info!("lobby shut down");
    }

    async fn run(self) {
        let mut shutdown = self.inner.shutdown_tx.subscribe();
        debug!("message loop started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let received = tokio::select! {
                _ = shutdown.changed() => break,
                received = self.inner.transport.receive() => received,
            };
            let Some((source, frame)) = received else {
                continue;
            };
            let envelope = match codec::decode(&frame) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!("dropping malformed frame from {source}: {e}");
                    continue;
                }
            };
            // A frame routed to "the leader" is only valid if we still are.
            if envelope.to_leader && !self.is_leader().await {
                warn!("dropping leader-bound message: this node is not the leader");
                continue;
            }
            self.dispatch(envelope.message).await;
        }
        debug!("message loop stopped");
    }

    pub(crate) async fn dispatch(&self, message: Message) {
        match message {
            Message::Lobby(msg) => match msg {
                LobbyMessage::RequestJoin {
                    sender,
                    target,
                    name,
                } => self.handle_request_join(sender, target, name).await,
                LobbyMessage::RequestNewMember {
                    name,
                    new_member_address,
                    ..
                } => self.handle_request_new_member(name, new_member_address).await,
                LobbyMessage::NewMember {
                    name,
                    new_member_address,
                    new_member_id,
                    ..
                } => {
                    self.handle_new_member(name, new_member_address, new_member_id)
                        .await
                }
                LobbyMessage::MemberAccept { members, .. } => {
                    self.handle_member_accept(members).await
                }
                LobbyMessage::Leave { sender } => self.handle_leave(sender).await,
                LobbyMessage::MemberLeft { member_address, .. } => {
                    self.handle_member_left(member_address).await
                }
            },
            Message::HealthCheck { sender } => self.handle_health_check(sender).await,
            Message::Election(msg) => match msg {
                ElectionMessage::Start { sender } => self.handle_election_start(sender).await,
                ElectionMessage::Ok { sender } => self.handle_election_ok(sender).await,
                ElectionMessage::IAmLeader { sender } => self.handle_i_am_leader(sender).await,
            },
            Message::Application(msg) => self.handle_application(msg).await,
        }
    }

    /// A node wants in. The leader admits it directly; everybody else
    /// forwards the request.
    async fn handle_request_join(&self, sender: IpAddress, target: IpAddress, name: String) {
        let forward_from = {
            let mut st = self.inner.state.write().await;
            if st.is_leader() {
                if st.me().map(|p| p.ip.is_empty()).unwrap_or(false) {
                    // The joiner knows our public address better than we do.
                    if let Some((ip, _)) = peer::split_address(&target) {
                        st.adopt_own_ip(&ip);
                    }
                }
                None
            } else {
                Some(st.identity.clone())
            }
        };
        match forward_from {
            None => self.admit_member(name, sender).await,
            Some(identity) => {
                debug!("forwarding join request from {sender} to the leader");
                self.send_to_leader(Message::Lobby(LobbyMessage::RequestNewMember {
                    sender: identity,
                    name,
                    new_member_address: sender,
                }))
                .await;
            }
        }
    }

    async fn handle_request_new_member(&self, name: String, new_member_address: IpAddress) {
        if !self.is_leader().await {
            warn!("ignoring member request: this node is not the leader");
            return;
        }
        self.admit_member(name, new_member_address).await;
    }

    /// Leader path: allocate an id, announce the member to the lobby, then
    /// hand the joiner the complete table.
    async fn admit_member(&self, name: String, address: IpAddress) {
        let Some((ip, port)) = peer::split_address(&address) else {
            warn!("ignoring join with malformed address {address}");
            return;
        };
        let (announce, id) = {
            let mut st = self.inner.state.write().await;
            if !st.is_leader() {
                return;
            }
            // A known address re-joining gets a fresh entry; this is how an
            // id-collision retry converges.
            st.members.remove(&address);
            let id = random_id(&st.members);
            info!("admitting {name}/{address} with id {id}");
            let announce = Message::Lobby(LobbyMessage::NewMember {
                sender: st.identity.clone(),
                name: name.clone(),
                new_member_address: address.clone(),
                new_member_id: id,
            });
            (announce, id)
        };
        // Announce before inserting so the joiner is not a broadcast target.
        self.broadcast(announce).await;

        let accept = {
            let mut st = self.inner.state.write().await;
            st.members.insert(
                address.clone(),
                Peer {
                    ip,
                    port,
                    name,
                    id,
                    is_leader: false,
                    is_alive: true,
                },
            );
            Message::Lobby(LobbyMessage::MemberAccept {
                sender: st.identity.clone(),
                members: st.members.clone(),
            })
        };
        self.send_to(&address, accept).await;

        self.emit_new_member(address);
        let st = self.inner.state.read().await;
        self.emit_members_changed(&st);
    }

    /// Leader announced a member we did not admit ourselves.
    async fn handle_new_member(&self, name: String, address: IpAddress, id: i32) {
        let Some((ip, port)) = peer::split_address(&address) else {
            warn!("ignoring new member with malformed address {address}");
            return;
        };
        let mut st = self.inner.state.write().await;
        if st.members.contains_key(&address) {
            warn!("new member {address} is already in the table");
            return;
        }
        info!("new lobby member {name}/{address}");
        st.members.insert(
            address,
            Peer {
                ip,
                port,
                name,
                id,
                is_leader: false,
                is_alive: true,
            },
        );
        self.emit_members_changed(&st);
    }

    /// The leader's reply to our join request: learn every peer, our own
    /// admitted id and who leads, then start the failure detector.
    async fn handle_member_accept(&self, members: HashMap<IpAddress, Peer>) {
        let (collision, leader, start_health) = {
            let mut st = self.inner.state.write().await;
            for (address, peer) in members {
                if address == st.identity {
                    if let Some(me) = st.members.get_mut(&address) {
                        me.id = peer.id;
                    }
                } else {
                    if peer.is_leader {
                        st.leader = address.clone();
                    }
                    st.members.insert(address, peer);
                }
            }
            let my_id = st.my_id();
            let collision = st
                .members
                .iter()
                .any(|(address, peer)| *address != st.identity && peer.id == my_id);
            let start_health = !st.health_started;
            st.health_started = true;
            info!(
                "joined lobby as {} with id {my_id} (leader {})",
                st.identity, st.leader
            );
            self.emit_members_changed(&st);
            (collision, st.leader.clone(), start_health)
        };
        if start_health {
            self.spawn_health_loop();
        }
        if collision {
            // Admitted concurrently with a peer that got the same id; ask
            // the leader to re-admit us under a fresh one.
            warn!("admitted id collides with another member, requesting re-admission");
            let (identity, name) = {
                let st = self.inner.state.read().await;
                (
                    st.identity.clone(),
                    st.me().map(|p| p.name.clone()).unwrap_or_default(),
                )
            };
            self.send_to(
                &leader,
                Message::Lobby(LobbyMessage::RequestJoin {
                    sender: identity,
                    target: leader.clone(),
                    name,
                }),
            )
            .await;
        }
    }

    /// Somebody is leaving. The leader removes them and tells the lobby; a
    /// member that sees its leader leave starts an election.
    async fn handle_leave(&self, sender: IpAddress) {
        enum Action {
            Broadcast(Message),
            Elect,
            Nothing,
        }
        let action = {
            let mut st = self.inner.state.write().await;
            if !st.members.contains_key(&sender) {
                debug!("stale leave from {sender}");
                return;
            }
            if st.is_leader() {
                st.members.remove(&sender);
                info!("{sender} has left the lobby");
                self.emit_members_changed(&st);
                Action::Broadcast(Message::Lobby(LobbyMessage::MemberLeft {
                    sender: st.identity.clone(),
                    member_address: sender,
                }))
            } else if st.leader == sender {
                info!("leader {sender} is leaving");
                Action::Elect
            } else {
                Action::Nothing
            }
        };
        match action {
            Action::Broadcast(msg) => self.broadcast(msg).await,
            Action::Elect => self.start_election().await,
            Action::Nothing => {}
        }
    }

    async fn handle_member_left(&self, address: IpAddress) {
        let mut st = self.inner.state.write().await;
        if st.members.remove(&address).is_some() {
            info!("member {address} left the lobby");
            self.emit_members_changed(&st);
        } else {
            debug!("stale member-left for {address}");
        }
    }

    /// Playback command. The leader sequences it (fan out, then local
    /// delivery); members apply in arrival order. Payloads stay opaque.
    async fn handle_application(&self, msg: ApplicationMessage) {
        if self.is_leader().await {
            self.broadcast(Message::Application(msg.clone())).await;
        }
        self.deliver_application(msg);
    }

    fn deliver_application(&self, msg: ApplicationMessage) {
        if self.inner.app_tx.send(msg).is_err() {
            debug!("no application consumer attached");
        }
    }

    fn emit_members_changed(&self, st: &LobbyState) {
        let _ = self.inner.events.send(LobbyEvent::MembersChanged {
            members: st.members.clone(),
            identity: st.identity.clone(),
            leader: st.leader.clone(),
        });
    }

    fn emit_new_member(&self, address: IpAddress) {
        let _ = self.inner.events.send(LobbyEvent::NewMember { address });
    }
}

/// Roll an id no current member holds.
fn random_id(members: &HashMap<IpAddress, Peer>) -> i32 {
    let mut rng = rand::thread_rng();
    loop {
        let id = rng.gen::<i32>();
        if !members.values().any(|peer| peer.id == id) {
            return id;
        }
    }
}
