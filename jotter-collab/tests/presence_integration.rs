//! End-to-end presence tests: two peers on one note, observed through the
//! projected collaborator list.

mod support;

use std::sync::Arc;
use std::time::Duration;

use jotter_collab::{
    ActivityBroadcaster, ConnectionState, IdentityProvider, PresenceProjector, PresenceView,
    StaticIdentity, UserIdentity,
};
use support::{hub_supervisor, wait_for_state, wait_until, CollabHub};
use tokio::sync::watch;
use uuid::Uuid;

fn identity(name: &str) -> Arc<StaticIdentity> {
    Arc::new(StaticIdentity::signed_in(
        UserIdentity::new(name).with_token(format!("{name}-token")),
    ))
}

async fn wait_for_view<F: Fn(&PresenceView) -> bool>(rx: &watch::Receiver<PresenceView>, pred: F) {
    for _ in 0..200 {
        if pred(&rx.borrow()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("presence view never matched; last: {:?}", *rx.borrow());
}

#[tokio::test]
async fn test_peer_appears_with_profile() {
    let hub = CollabHub::new();
    let note = Uuid::new_v4();
    let alice = identity("Alice");
    let mut sup_a = hub_supervisor(&hub, note, alice.clone());
    let mut sup_b = hub_supervisor(&hub, note, identity("Bob"));

    let (projector, rx) = sup_b.presence_projector();
    let _task = projector.spawn();

    sup_a.connect().unwrap();
    sup_b.connect().unwrap();
    assert!(wait_for_state(&sup_a, ConnectionState::Synced).await);
    assert!(wait_for_state(&sup_b, ConnectionState::Synced).await);

    wait_for_view(&rx, |v| v.count == 1 && v.peers[0].name == "Alice").await;
    let view = rx.borrow().clone();
    let expected_color = alice.current().map(|u| u.color);
    assert_eq!(Some(view.peers[0].color.clone()), expected_color);
    assert!(view.peers[0].is_active, "fresh join reads as active");
}

#[tokio::test]
async fn test_each_side_sees_only_the_other() {
    let hub = CollabHub::new();
    let note = Uuid::new_v4();
    let mut sup_a = hub_supervisor(&hub, note, identity("Alice"));
    let mut sup_b = hub_supervisor(&hub, note, identity("Bob"));

    let (projector_a, rx_a) = PresenceProjector::new(sup_a.awareness());
    let (projector_b, rx_b) = PresenceProjector::new(sup_b.awareness());
    let _task_a = projector_a.spawn();
    let _task_b = projector_b.spawn();

    sup_a.connect().unwrap();
    sup_b.connect().unwrap();
    assert!(wait_for_state(&sup_a, ConnectionState::Synced).await);
    assert!(wait_for_state(&sup_b, ConnectionState::Synced).await);

    wait_for_view(&rx_a, |v| v.count == 1 && v.peers[0].name == "Bob").await;
    wait_for_view(&rx_b, |v| v.count == 1 && v.peers[0].name == "Alice").await;
}

#[tokio::test]
async fn test_peer_goes_idle_without_any_traffic() {
    let hub = CollabHub::new();
    let note = Uuid::new_v4();
    let mut sup_a = hub_supervisor(&hub, note, identity("Alice"));
    let mut sup_b = hub_supervisor(&hub, note, identity("Bob"));

    // Tight idle timeout so the flip happens inside the test.
    let (projector, rx) = PresenceProjector::with_timing(
        sup_b.awareness(),
        Duration::from_millis(300),
        Duration::from_millis(50),
    );
    let _task = projector.spawn();

    sup_a.connect().unwrap();
    sup_b.connect().unwrap();
    assert!(wait_for_state(&sup_a, ConnectionState::Synced).await);
    assert!(wait_for_state(&sup_b, ConnectionState::Synced).await);

    wait_for_view(&rx, |v| v.count == 1 && v.peers[0].is_active).await;

    let writes_before = hub.awareness_write_count();
    wait_for_view(&rx, |v| v.count == 1 && !v.peers[0].is_active).await;
    // The flip came from the recheck tick, not from a new slot write.
    assert_eq!(hub.awareness_write_count(), writes_before);
}

#[tokio::test]
async fn test_activity_refreshes_peer_to_active() {
    let hub = CollabHub::new();
    let note = Uuid::new_v4();
    let alice = identity("Alice");
    let mut sup_a = hub_supervisor(&hub, note, alice.clone());
    let mut sup_b = hub_supervisor(&hub, note, identity("Bob"));

    let (projector, rx) = PresenceProjector::with_timing(
        sup_b.awareness(),
        Duration::from_millis(300),
        Duration::from_millis(50),
    );
    let _task = projector.spawn();

    sup_a.connect().unwrap();
    sup_b.connect().unwrap();
    assert!(wait_for_state(&sup_a, ConnectionState::Synced).await);
    assert!(wait_for_state(&sup_b, ConnectionState::Synced).await);

    wait_for_view(&rx, |v| v.count == 1 && !v.peers[0].is_active).await;

    // A keystroke on Alice's side refreshes her timestamp for Bob.
    let mut broadcaster =
        ActivityBroadcaster::with_interval(sup_a.awareness(), alice, Duration::from_millis(10));
    broadcaster.record_activity();

    wait_for_view(&rx, |v| v.count == 1 && v.peers[0].is_active).await;
}

#[tokio::test]
async fn test_activity_bursts_are_throttled_on_the_wire() {
    let hub = CollabHub::new();
    let note = Uuid::new_v4();
    let alice = identity("Alice");
    let mut sup_a = hub_supervisor(&hub, note, alice.clone());

    sup_a.connect().unwrap();
    assert!(wait_for_state(&sup_a, ConnectionState::Synced).await);
    let hub2 = hub.clone();
    assert!(wait_until(move || hub2.awareness_write_count() == 1).await);

    // A burst of interactions inside one throttle window.
    let mut broadcaster = ActivityBroadcaster::new(sup_a.awareness(), alice);
    for _ in 0..10 {
        broadcaster.record_activity();
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    // Join announcement plus exactly one throttled activity write.
    assert_eq!(hub.awareness_write_count(), 2);
}

#[tokio::test]
async fn test_disconnect_clears_peer_on_both_sides() {
    let hub = CollabHub::new();
    let note = Uuid::new_v4();
    let mut sup_a = hub_supervisor(&hub, note, identity("Alice"));
    let mut sup_b = hub_supervisor(&hub, note, identity("Bob"));

    let (projector_a, rx_a) = sup_a.presence_projector();
    let (projector_b, rx_b) = PresenceProjector::new(sup_b.awareness());
    let _task_a = projector_a.spawn();
    let _task_b = projector_b.spawn();

    sup_a.connect().unwrap();
    sup_b.connect().unwrap();
    assert!(wait_for_state(&sup_a, ConnectionState::Synced).await);
    assert!(wait_for_state(&sup_b, ConnectionState::Synced).await);
    wait_for_view(&rx_a, |v| v.count == 1).await;
    wait_for_view(&rx_b, |v| v.count == 1).await;

    // Alice leaves; her own channel and published view empty synchronously,
    // and Bob's view drains once the hub fans out the clear.
    sup_a.disconnect();
    assert!(sup_a.awareness().snapshot().1.is_empty());
    assert_eq!(rx_a.borrow().count, 0);
    wait_for_view(&rx_b, |v| v.count == 0).await;
}
