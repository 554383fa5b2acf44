//! Multi-node scenarios on the in-memory transport. Time is paused, so
//! every heartbeat and election timer fires deterministically.

use super::*;
use crate::messages::{ApplicationMessage, ElectionMessage};
use crate::net::memory::MemoryHub;
use std::time::Duration;
use tokio::time::sleep;

const A: &str = "10.0.0.1:5000";
const B: &str = "10.0.0.2:5000";
const C: &str = "10.0.0.3:5000";

fn node(hub: &Arc<MemoryHub>, addr: &str) -> Lobby {
    let lobby = Lobby::new(Arc::new(hub.open(addr)), TimerConfig::default());
    lobby.start();
    lobby
}

/// Let queued messages drain without reaching any protocol timer.
async fn settle() {
    sleep(Duration::from_millis(100)).await;
}

async fn two_node_lobby(hub: &Arc<MemoryHub>) -> (Lobby, Lobby) {
    let a = node(hub, A);
    a.create_lobby("10.0.0.1", 5000, "A").await;
    let b = node(hub, B);
    assert!(b.join_lobby("B", "10.0.0.2", 5000, "10.0.0.1", 5000).await);
    settle().await;
    (a, b)
}

async fn three_node_lobby(hub: &Arc<MemoryHub>) -> (Lobby, Lobby, Lobby) {
    let (a, b) = two_node_lobby(hub).await;
    let c = node(hub, C);
    assert!(c.join_lobby("C", "10.0.0.3", 5000, "10.0.0.1", 5000).await);
    settle().await;
    (a, b, c)
}

/// Stop a node's loops while leaving its endpoint registered: sends to it
/// keep succeeding but it never reacts, like a hung process.
async fn silence(lobby: &Lobby) {
    let _ = lobby.inner.shutdown_tx.send(true);
    settle().await;
}

fn assert_single_leader(members: &HashMap<IpAddress, Peer>) {
    assert_eq!(
        members.values().filter(|peer| peer.is_leader).count(),
        1,
        "expected exactly one leader in {members:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn two_node_admission() {
    let hub = MemoryHub::new();
    let a = node(&hub, A);
    a.create_lobby("10.0.0.1", 5000, "A").await;

    let b = node(&hub, B);
    let mut b_events = b.subscribe();
    assert!(b.join_lobby("B", "10.0.0.2", 5000, "10.0.0.1", 5000).await);
    settle().await;

    let a_members = a.members().await;
    let b_members = b.members().await;
    assert_eq!(a_members.len(), 2);
    assert_eq!(b_members.len(), 2);
    assert!(a.is_leader().await);
    assert_eq!(b.leader().await, A);

    // The admitted id replaced the provisional one and is unique.
    assert_ne!(b_members[B].id, PROVISIONAL_ID);
    assert_ne!(b_members[B].id, b_members[A].id);
    assert_eq!(a_members[B].id, b_members[B].id);

    let mut reported = None;
    while let Ok(event) = b_events.try_recv() {
        if let LobbyEvent::MembersChanged {
            members, leader, ..
        } = event
        {
            reported = Some((members, leader));
        }
    }
    let (members, leader) = reported.expect("join raised a members change");
    assert_eq!(leader, A);
    assert_eq!(members.len(), 2);
    assert!(members[A].is_leader);
    assert!(!members[B].is_leader);
}

#[tokio::test(start_paused = true)]
async fn join_via_member_is_forwarded_to_the_leader() {
    let hub = MemoryHub::new();
    let (a, b) = two_node_lobby(&hub).await;

    // C bootstraps off B, a non-leader; B forwards to A.
    let c = node(&hub, C);
    assert!(c.join_lobby("C", "10.0.0.3", 5000, "10.0.0.2", 5000).await);
    settle().await;

    for lobby in [&a, &b, &c] {
        let members = lobby.members().await;
        assert_eq!(members.len(), 3, "{members:?}");
        assert_single_leader(&members);
    }
    assert_eq!(c.leader().await, A);
}

#[tokio::test(start_paused = true)]
async fn application_commands_arrive_everywhere_in_leader_order() {
    let hub = MemoryHub::new();
    let (a, b, c) = three_node_lobby(&hub).await;
    let mut a_rx = a.take_application_receiver().unwrap();
    let mut b_rx = b.take_application_receiver().unwrap();
    let mut c_rx = c.take_application_receiver().unwrap();

    // A non-leader issues pause then skip; everybody must see that order.
    c.submit_application(ApplicationMessage::Stop).await;
    c.submit_application(ApplicationMessage::Set { index: 1 }).await;
    settle().await;

    for rx in [&mut a_rx, &mut b_rx, &mut c_rx] {
        assert_eq!(rx.try_recv().unwrap(), ApplicationMessage::Stop);
        assert_eq!(
            rx.try_recv().unwrap(),
            ApplicationMessage::Set { index: 1 }
        );
        assert!(rx.try_recv().is_err());
    }
}

#[tokio::test(start_paused = true)]
async fn leader_failure_promotes_the_highest_id_survivor() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let hub = MemoryHub::new();
    let (a, b, c) = three_node_lobby(&hub).await;

    let members = a.members().await;
    let expected_leader = if members[B].id > members[C].id { B } else { C };

    hub.kill(A);
    // Member timeout, election timeout and the victory broadcast.
    sleep(Duration::from_secs(20)).await;

    for lobby in [&b, &c] {
        let members = lobby.members().await;
        assert!(!members.contains_key(A), "{members:?}");
        assert_eq!(lobby.leader().await, expected_leader);
        assert_single_leader(&members);
    }
}

#[tokio::test(start_paused = true)]
async fn health_acks_keep_members_alive_and_silence_removes_them() {
    let hub = MemoryHub::new();
    let (a, b, c) = three_node_lobby(&hub).await;

    // One full probe/ack cycle: everyone acked, nobody was reaped.
    sleep(Duration::from_secs(6)).await;
    let members = a.members().await;
    assert_eq!(members.len(), 3);
    assert!(members.values().all(|peer| peer.is_alive), "{members:?}");

    // C hangs: probes still reach it, acks never come back.
    silence(&c).await;
    sleep(Duration::from_secs(12)).await;

    let a_members = a.members().await;
    let b_members = b.members().await;
    assert!(!a_members.contains_key(C), "{a_members:?}");
    assert!(!b_members.contains_key(C), "{b_members:?}");
    assert_eq!(b.leader().await, A);
}

#[tokio::test(start_paused = true)]
async fn graceful_leader_leave_hands_over_to_the_highest_id() {
    let hub = MemoryHub::new();
    let (a, b, c) = three_node_lobby(&hub).await;

    let members = a.members().await;
    let expected_leader = if members[B].id > members[C].id { B } else { C };

    a.leave_lobby().await;
    sleep(Duration::from_secs(15)).await;

    for lobby in [&b, &c] {
        let members = lobby.members().await;
        assert_eq!(members.len(), 2, "{members:?}");
        assert!(!members.contains_key(A));
        assert_eq!(lobby.leader().await, expected_leader);
        assert_single_leader(&members);
    }
}

#[tokio::test(start_paused = true)]
async fn last_member_leaving_leaves_a_quiet_solo_leader() {
    let hub = MemoryHub::new();
    let (a, b) = two_node_lobby(&hub).await;

    b.leave_lobby().await;
    sleep(Duration::from_secs(12)).await;

    let members = a.members().await;
    assert_eq!(members.len(), 1);
    assert!(a.is_leader().await);
    // No stray election ever started.
    let st = a.inner.state.read().await;
    assert!(!st.election_in_progress);
    assert_eq!(st.election_epoch, 0);
}

#[tokio::test(start_paused = true)]
async fn joining_an_empty_bootstrap_fails_without_wedging() {
    let hub = MemoryHub::new();
    let b = node(&hub, B);

    assert!(!b.join_lobby("B", "10.0.0.2", 5000, "10.0.0.1", 5000).await);

    let st = b.inner.state.read().await;
    assert!(!st.election_in_progress);
    drop(st);
    b.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn heartbeat_jitter_never_trips_an_election() {
    let hub = MemoryHub::new();
    let (a, b) = two_node_lobby(&hub).await;

    // Probes every 5 s against an 8 s member timeout, over many cycles.
    sleep(Duration::from_secs(30)).await;

    assert_eq!(b.leader().await, A);
    assert!(a.is_leader().await);
    let st = b.inner.state.read().await;
    assert_eq!(st.election_epoch, 0);
}

#[tokio::test(start_paused = true)]
async fn broadcast_drops_unreachable_members_silently() {
    let hub = MemoryHub::new();
    let (a, _b, c) = three_node_lobby(&hub).await;

    hub.kill(B);
    let sender = a.identity().await;
    a.broadcast(Message::HealthCheck { sender }).await;

    let members = a.members().await;
    assert!(!members.contains_key(B), "{members:?}");
    assert!(members.contains_key(C));
    drop(c);
}

#[tokio::test(start_paused = true)]
async fn stale_leader_claim_from_a_lower_id_is_ignored() {
    let hub = MemoryHub::new();
    let (a, _b, _c) = three_node_lobby(&hub).await;

    {
        let mut st = a.inner.state.write().await;
        let identity = st.identity.clone();
        if let Some(me) = st.members.get_mut(&identity) {
            me.id = 1;
        }
        if let Some(claimant) = st.members.get_mut(B) {
            claimant.id = 0;
        }
    }
    a.dispatch(Message::Election(ElectionMessage::IAmLeader {
        sender: B.to_string(),
    }))
    .await;

    assert!(a.is_leader().await);
    assert_eq!(a.leader().await, A);
}

#[tokio::test(start_paused = true)]
async fn a_leader_cedes_to_a_higher_id_claim() {
    let hub = MemoryHub::new();
    let (a, b, _c) = three_node_lobby(&hub).await;

    {
        let mut st = a.inner.state.write().await;
        let identity = st.identity.clone();
        if let Some(me) = st.members.get_mut(&identity) {
            me.id = 0;
        }
        if let Some(claimant) = st.members.get_mut(B) {
            claimant.id = 1;
        }
    }
    a.dispatch(Message::Election(ElectionMessage::IAmLeader {
        sender: B.to_string(),
    }))
    .await;

    assert!(!a.is_leader().await);
    assert_eq!(a.leader().await, B);
    assert_single_leader(&a.members().await);
    drop(b);
}

#[tokio::test(start_paused = true)]
async fn messages_queued_while_leaderless_are_replayed_after_promotion() {
    let hub = MemoryHub::new();
    let (a, b) = two_node_lobby(&hub).await;
    let mut b_rx = b.take_application_receiver().unwrap();

    hub.kill(A);
    // The failed send queues the command and triggers the election; B has
    // no higher peer left, so it promotes and replays the queue locally.
    b.submit_application(ApplicationMessage::Stop).await;
    settle().await;

    assert!(b.is_leader().await);
    assert_eq!(b_rx.try_recv().unwrap(), ApplicationMessage::Stop);
    let st = b.inner.state.read().await;
    assert!(st.pending_leader_msgs.is_empty());
    drop(a);
}

#[tokio::test(start_paused = true)]
async fn create_then_leave_then_shutdown_quiesces() {
    let hub = MemoryHub::new();
    let a = node(&hub, A);
    a.create_lobby("10.0.0.1", 5000, "A").await;

    a.leave_lobby().await;
    a.shutdown().await;
    // Shutdown is idempotent and later operations are no-ops.
    a.shutdown().await;
    a.leave_lobby().await;

    let st = a.inner.state.read().await;
    assert!(st.exiting);
    assert!(!st.election_in_progress);
}
