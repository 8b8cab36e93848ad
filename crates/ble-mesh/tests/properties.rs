//! Property tests for Friend Queue admission and LPN group tracking

mod common;

use ble_mesh::friend::queue::QueuedPdu;
use ble_mesh::lpn::groups::{GroupSubscriptions, SubBatch, SubOp};
use ble_mesh::{NetworkMessage, SegmentInfo};
use common::{Air, LPN};
use proptest::prelude::*;
use shared::config::FriendConfig;
use shared::models::Address;
use std::collections::BTreeSet;

/// One segment of context `ctx`; the payload tags the context it came from.
fn segment(ctx: u8, index: u8, total: u8) -> NetworkMessage {
    let seq_zero = ctx as u16 * 7;
    NetworkMessage {
        src: 0x0200 + ctx as Address,
        dst: LPN,
        ttl: 5,
        seq: seq_zero as u32 + index as u32,
        iv_index: 0,
        payload: vec![ctx, index],
        segment: Some(SegmentInfo {
            seq_zero,
            seg_index: index,
            seg_total: total,
        }),
    }
}

fn single(seq: u32) -> NetworkMessage {
    NetworkMessage {
        src: 0x0300,
        dst: LPN,
        ttl: 5,
        seq: 1000 + seq,
        iv_index: 0,
        payload: vec![0xff, seq as u8],
        segment: None,
    }
}

/// Up to four segmented messages of 1..=4 segments plus a few unsegmented
/// ones, in an arbitrary arrival order.
fn arrivals() -> impl Strategy<Value = Vec<NetworkMessage>> {
    (prop::collection::vec(1u8..=4, 1..=4), 0u32..8)
        .prop_map(|(totals, singles)| {
            let mut all: Vec<NetworkMessage> = totals
                .iter()
                .enumerate()
                .flat_map(|(ctx, &total)| (0..total).map(move |i| segment(ctx as u8, i, total)))
                .collect();
            all.extend((0..singles).map(single));
            all
        })
        .prop_shuffle()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_queue_stays_bounded_and_sets_stay_whole(messages in arrivals()) {
        let capacity = FriendConfig::default().queue_size;
        let mut air = Air::new();
        air.establish();

        for msg in &messages {
            let now = air.now;
            air.friend.submit_for_lpn(now, 0, msg);
            prop_assert!(air.friend.queued(0, LPN).len() <= capacity);
        }

        // Segments sit in the queue as whole sets, in order, and never mix
        // contexts.
        let queued: Vec<NetworkMessage> = air
            .friend
            .queued(0, LPN)
            .into_iter()
            .filter_map(|pdu| match pdu {
                QueuedPdu::Message(msg) => Some(msg),
                QueuedPdu::Update(_) => None,
            })
            .collect();
        let mut i = 0;
        while i < queued.len() {
            let Some(seg) = queued[i].segment else {
                i += 1;
                continue;
            };
            prop_assert_eq!(seg.seg_index, 0);
            let total = seg.seg_total as usize;
            prop_assert!(i + total <= queued.len());
            for (offset, msg) in queued[i..i + total].iter().enumerate() {
                prop_assert_eq!(msg.src, queued[i].src);
                prop_assert_eq!(msg.payload[0], queued[i].payload[0]);
                prop_assert_eq!(msg.segment.map(|s| s.seg_index as usize), Some(offset));
            }
            i += total;
        }
    }

    #[test]
    fn prop_group_list_settles_to_last_request(
        ops in prop::collection::vec((0u8..4, 0u8..3), 1..40)
    ) {
        let mut groups = GroupSubscriptions::new(16);
        let mut friend: BTreeSet<Address> = BTreeSet::new();
        let mut wanted: BTreeSet<Address> = BTreeSet::new();
        let mut xact = 0u8;

        fn apply(friend: &mut BTreeSet<Address>, batch: &SubBatch) {
            for addr in &batch.addresses {
                match batch.op {
                    SubOp::Add => friend.insert(*addr),
                    SubOp::Remove => friend.remove(addr),
                };
            }
        }

        // Sends the next batch, or confirms the one in flight.
        fn step(groups: &mut GroupSubscriptions, friend: &mut BTreeSet<Address>, xact: &mut u8) {
            if let Some(confirmed) = groups.in_flight().map(|batch| batch.xact) {
                groups.confirm(confirmed).unwrap();
            } else if let Some((op, addresses)) = groups.next_batch(16) {
                let batch = SubBatch { op, xact: *xact, addresses };
                *xact = xact.wrapping_add(1);
                apply(friend, &batch);
                groups.begin(batch);
            }
        }

        for (group, op) in ops {
            let addr = 0xc000 + group as Address;
            match op {
                0 => {
                    groups.add(addr).unwrap();
                    wanted.insert(addr);
                }
                1 => {
                    groups.remove(addr);
                    wanted.remove(&addr);
                }
                _ => step(&mut groups, &mut friend, &mut xact),
            }
        }
        for _ in 0..32 {
            if groups.is_settled() {
                break;
            }
            step(&mut groups, &mut friend, &mut xact);
        }

        prop_assert!(groups.is_settled());
        prop_assert_eq!(groups.added(), &wanted);
        prop_assert_eq!(&friend, &wanted);
    }
}
