//! Friend and LPN runtimes talking to each other over a lossless air
//! interface in virtual time.

mod common;

use ble_mesh::context::FriendshipEvent;
use ble_mesh::message::OutboundBody;
use ble_mesh::{ControlPdu, LpnState};
use common::{reading, Air, FRIEND, GROUP, LPN};
use std::time::Duration;

#[test]
fn test_handshake_establishes_both_sides() {
    let mut air = Air::new();
    air.establish();

    let status = air.lpn.lpn_status();
    assert_eq!(status.friend, Some(FRIEND));
    assert_eq!(status.state, LpnState::Established);

    let friendships = air.friend.friendships();
    assert_eq!(friendships.len(), 1);
    assert_eq!(friendships[0].lpn, LPN);
    assert!(friendships[0].established);

    assert!(air
        .events
        .iter()
        .any(|e| matches!(e, FriendshipEvent::LpnEstablished { friend: FRIEND, .. })));
    assert!(air
        .events
        .iter()
        .any(|e| matches!(e, FriendshipEvent::FriendEstablished { lpn: LPN, .. })));

    // The Offer went out with master credentials, everything after with
    // the friendship's.
    let offer = air
        .sent
        .iter()
        .find(|(_, pdu)| matches!(pdu.control(), Some(ControlPdu::Offer(_))))
        .unwrap();
    assert!(!offer.1.uses_friend_credentials());
    let poll = air
        .sent
        .iter()
        .find(|(_, pdu)| matches!(pdu.control(), Some(ControlPdu::Poll(_))))
        .unwrap();
    assert!(poll.1.uses_friend_credentials());
}

#[test]
fn test_buffered_message_reaches_lpn() {
    let mut air = Air::new();
    air.establish();

    let now = air.now;
    assert_eq!(air.friend.submit_for_lpn(now, 0, &reading(1, LPN)), 1);
    assert_eq!(air.friend.queued(0, LPN).len(), 1);

    air.run_for(Duration::from_secs(40));
    let relayed = air.relayed_to_lpn();
    assert_eq!(relayed.len(), 1);
    assert_eq!(relayed[0].dst, LPN);
    assert!(relayed[0].uses_friend_credentials());
    assert!(air.friend.queued(0, LPN).is_empty());
    assert!(air.lpn.lpn_status().established);
}

#[test]
fn test_friendship_survives_quiet_periods() {
    let mut air = Air::new();
    air.establish();
    air.run_for(Duration::from_secs(300));

    assert!(air.lpn.lpn_status().established);
    assert_eq!(air.friend.friendships().len(), 1);
    assert!(!air
        .events
        .iter()
        .any(|e| matches!(e, FriendshipEvent::FriendTerminated { .. })));
}

#[test]
fn test_group_subscription_round_trip() {
    let mut air = Air::new();
    air.establish();

    let now = air.now;
    air.lpn.lpn_group_add(now, GROUP).unwrap();
    air.run_for(Duration::from_secs(2));
    assert!(air.friend.friend_match(0, GROUP));
    assert!(air.lpn.lpn_match(FRIEND));
    assert_eq!(air.lpn.lpn_status().groups, vec![GROUP]);

    // Group traffic is now buffered for the LPN.
    let now = air.now;
    assert_eq!(air.friend.submit_for_lpn(now, 0, &reading(2, GROUP)), 1);

    let now = air.now;
    air.lpn.lpn_group_remove(now, GROUP).unwrap();
    air.run_for(Duration::from_secs(40));
    assert!(!air.friend.friend_match(0, GROUP));
    assert!(air.lpn.lpn_status().groups.is_empty());
}

#[test]
fn test_lost_response_resent_byte_identical() {
    let mut air = Air::new();
    air.establish();
    let now = air.now;
    air.friend.submit_for_lpn(now, 0, &reading(3, LPN));

    // The first relayed copy never reaches the LPN.
    let mut dropped = false;
    air.drop_rule = Some(Box::new(move |from, pdu| {
        if from == FRIEND && matches!(pdu.body, OutboundBody::Relayed { .. }) && !dropped {
            dropped = true;
            return true;
        }
        false
    }));
    air.run_for(Duration::from_secs(40));

    let relayed = air.relayed_to_lpn();
    assert_eq!(relayed.len(), 2);
    assert_eq!(relayed[0], relayed[1]);
    assert!(air.friend.queued(0, LPN).is_empty());
}

#[test]
fn test_lpn_disable_clears_friend() {
    let mut air = Air::new();
    air.establish();

    let now = air.now;
    air.lpn.lpn_set(now, false).unwrap();
    air.run_for(Duration::from_secs(5));

    assert_eq!(air.lpn.lpn_status().state, LpnState::Disabled);
    assert!(air.friend.friendships().is_empty());
    assert!(air
        .sent
        .iter()
        .any(|(from, pdu)| *from == FRIEND && matches!(pdu.control(), Some(ControlPdu::ClearConfirm(_)))));
}

#[test]
fn test_silent_friend_ends_friendship_on_both_sides() {
    let mut air = Air::new();
    air.establish();
    air.drop_rule = Some(Box::new(|_, _| true));
    air.run_for(Duration::from_secs(120));

    assert!(!air.lpn.lpn_status().established);
    assert!(air.friend.friendships().is_empty());
    assert!(air
        .events
        .iter()
        .any(|e| matches!(e, FriendshipEvent::LpnTerminated { friend: FRIEND, .. })));
    assert!(air
        .events
        .iter()
        .any(|e| matches!(e, FriendshipEvent::FriendTerminated { lpn: LPN, .. })));
}

#[test]
fn test_backpressure_and_poll_timeout_queries() {
    let mut air = Air::new();
    // No friendship matches yet, so nothing holds a segmented send back.
    assert!(air.friend.queue_has_space(0, 0x0042, LPN, 5, 40));
    air.establish();

    assert!(air.friend.queue_has_space(0, 0x0042, LPN, 5, 16));
    assert!(!air.friend.queue_has_space(0, 0x0042, LPN, 5, 17));
    let now = air.now;
    let remaining = air.friend.lpn_poll_timeout(now, LPN);
    assert!(remaining > 0 && remaining <= 300);
    assert_eq!(air.friend.lpn_poll_timeout(now, 0x0200), 0);
}
