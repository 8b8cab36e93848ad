//! Friend Queue and the shared segment reassembly pool
//!
//! Each LPN gets a bounded queue of PDUs ready to be handed out one per
//! Poll. Segmented messages are collected in a node-wide pool of contexts
//! first and move into the queue only once every segment has arrived, so a
//! queue never holds a partial set.

use crate::error::{MeshError, MeshResult};
use crate::message::NetworkMessage;
use crate::wire::FriendUpdate;
use shared::models::Address;
use std::collections::VecDeque;
use tracing::{debug, warn};

/// Segment bitmap width; a transport set has at most 32 segments.
const MAX_SEGMENTS: u8 = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueuedPdu {
    Message(NetworkMessage),
    Update(FriendUpdate),
}

#[derive(Debug, Clone)]
struct QueueEntry {
    pdu: QueuedPdu,
    /// Further members of the same segment set follow this entry
    more_in_set: bool,
}

/// Bounded per-LPN queue
#[derive(Debug)]
pub struct FriendQueue {
    entries: VecDeque<QueueEntry>,
    capacity: usize,
}

impl FriendQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops the oldest entry, together with the rest of its segment set.
    /// Returns the number of entries removed.
    fn evict_head(&mut self) -> usize {
        let mut removed = 0;
        while let Some(entry) = self.entries.pop_front() {
            removed += 1;
            if !entry.more_in_set {
                break;
            }
        }
        removed
    }

    /// Evicts from the head until `needed` more entries fit next to the
    /// `reserved` slots held by incomplete segment sets.
    pub fn make_room(&mut self, needed: usize, reserved: usize) -> bool {
        let mut evicted = 0;
        while self.entries.len() + reserved + needed > self.capacity {
            match self.evict_head() {
                0 => return false,
                n => evicted += n,
            }
        }
        if evicted > 0 {
            debug!("Evicted {} queued PDUs to make room", evicted);
        }
        true
    }

    /// Appends a single PDU. The caller must have made room.
    pub fn push(&mut self, pdu: QueuedPdu) {
        self.entries.push_back(QueueEntry {
            pdu,
            more_in_set: false,
        });
    }

    /// Appends a complete segment set. Room for it was reserved when its
    /// first segment arrived.
    pub fn push_set(&mut self, segments: Vec<NetworkMessage>) {
        let last = segments.len().saturating_sub(1);
        for (i, msg) in segments.into_iter().enumerate() {
            self.entries.push_back(QueueEntry {
                pdu: QueuedPdu::Message(msg),
                more_in_set: i < last,
            });
        }
    }

    pub fn pop(&mut self) -> Option<QueuedPdu> {
        self.entries.pop_front().map(|entry| entry.pdu)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueuedPdu> {
        self.entries.iter().map(|entry| &entry.pdu)
    }
}

#[derive(Debug)]
struct SegContext {
    owner: u64,
    src: Address,
    seq_zero: u16,
    seg_total: u8,
    received: u32,
    segments: Vec<Option<NetworkMessage>>,
}

impl SegContext {
    fn complete(&self) -> bool {
        let all = if self.seg_total >= MAX_SEGMENTS {
            u32::MAX
        } else {
            (1u32 << self.seg_total) - 1
        };
        self.received == all
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum SegmentOutcome {
    Stored,
    Duplicate,
    /// Every segment arrived; the set in segment order
    Complete(Vec<NetworkMessage>),
}

/// Fixed pool of reassembly contexts shared by all friendships.
///
/// A context belongs to one friendship (identified by its generation) and
/// one (source, SeqZero) pair.
#[derive(Debug)]
pub struct SegmentPool {
    slots: Vec<Option<SegContext>>,
}

impl SegmentPool {
    pub fn new(size: usize) -> Self {
        Self {
            slots: (0..size).map(|_| None).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn free(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_none()).count()
    }

    fn find(&self, owner: u64, src: Address, seq_zero: u16) -> Option<usize> {
        self.slots.iter().position(|slot| {
            matches!(slot, Some(ctx) if ctx.owner == owner && ctx.src == src && ctx.seq_zero == seq_zero)
        })
    }

    pub fn has_context(&self, owner: u64, src: Address, seq_zero: u16) -> bool {
        self.find(owner, src, seq_zero).is_some()
    }

    pub fn has_any_context(&self, src: Address, seq_zero: u16) -> bool {
        self.slots
            .iter()
            .flatten()
            .any(|ctx| ctx.src == src && ctx.seq_zero == seq_zero)
    }

    /// Queue slots reserved by the owner's incomplete sets
    pub fn in_flight(&self, owner: u64) -> usize {
        self.slots
            .iter()
            .flatten()
            .filter(|ctx| ctx.owner == owner)
            .map(|ctx| ctx.seg_total as usize)
            .sum()
    }

    /// Drops incomplete sets from `src` that a newer SeqZero superseded.
    pub fn release_stale(&mut self, owner: u64, src: Address, seq_zero: u16) {
        for slot in self.slots.iter_mut() {
            if matches!(slot, Some(ctx) if ctx.owner == owner && ctx.src == src && ctx.seq_zero != seq_zero)
            {
                debug!("Dropping incomplete segment set from 0x{:04x}", src);
                *slot = None;
            }
        }
    }

    pub fn release_owner(&mut self, owner: u64) {
        for slot in self.slots.iter_mut() {
            if matches!(slot, Some(ctx) if ctx.owner == owner) {
                *slot = None;
            }
        }
    }

    pub fn allocate(
        &mut self,
        owner: u64,
        src: Address,
        seq_zero: u16,
        seg_total: u8,
    ) -> MeshResult<()> {
        if seg_total == 0 || seg_total > MAX_SEGMENTS {
            return Err(MeshError::ProtocolViolation(format!(
                "segment count {} out of range",
                seg_total
            )));
        }
        let slot = self
            .slots
            .iter_mut()
            .find(|slot| slot.is_none())
            .ok_or_else(|| {
                warn!("No free segment context for 0x{:04x}", src);
                MeshError::ResourceExhaustion("segment pool exhausted".to_string())
            })?;
        *slot = Some(SegContext {
            owner,
            src,
            seq_zero,
            seg_total,
            received: 0,
            segments: vec![None; seg_total as usize],
        });
        Ok(())
    }

    /// Stores one segment in the owner's context for its set. On completion
    /// the context is released and the set handed back.
    pub fn store(&mut self, owner: u64, msg: NetworkMessage) -> MeshResult<SegmentOutcome> {
        let seg = msg.segment.ok_or_else(|| {
            MeshError::StateMismatch("unsegmented message offered to segment pool".to_string())
        })?;
        let idx = self
            .find(owner, msg.src, seg.seq_zero)
            .ok_or_else(|| MeshError::StateMismatch("no segment context".to_string()))?;

        let done = {
            let Some(ctx) = self.slots[idx].as_mut() else {
                return Err(MeshError::StateMismatch("no segment context".to_string()));
            };
            if seg.seg_total != ctx.seg_total {
                return Err(MeshError::ProtocolViolation(format!(
                    "segment count changed from {} to {}",
                    ctx.seg_total, seg.seg_total
                )));
            }
            if seg.seg_index >= ctx.seg_total {
                return Err(MeshError::ProtocolViolation(format!(
                    "segment index {} beyond {}",
                    seg.seg_index, ctx.seg_total
                )));
            }
            let bit = 1u32 << seg.seg_index;
            if ctx.received & bit != 0 {
                return Ok(SegmentOutcome::Duplicate);
            }
            ctx.received |= bit;
            ctx.segments[seg.seg_index as usize] = Some(msg);
            ctx.complete()
        };

        if !done {
            return Ok(SegmentOutcome::Stored);
        }
        let ctx = self.slots[idx]
            .take()
            .ok_or_else(|| MeshError::StateMismatch("no segment context".to_string()))?;
        Ok(SegmentOutcome::Complete(
            ctx.segments.into_iter().flatten().collect(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::SegmentInfo;

    fn msg(src: Address, seq: u32) -> NetworkMessage {
        NetworkMessage {
            src,
            dst: 0x0002,
            ttl: 5,
            seq,
            iv_index: 0,
            payload: vec![seq as u8],
            segment: None,
        }
    }

    fn seg(src: Address, seq_zero: u16, index: u8, total: u8) -> NetworkMessage {
        NetworkMessage {
            segment: Some(SegmentInfo {
                seq_zero,
                seg_index: index,
                seg_total: total,
            }),
            ..msg(src, seq_zero as u32 + index as u32)
        }
    }

    #[test]
    fn test_eviction_removes_whole_sets() {
        let mut queue = FriendQueue::new(4);
        queue.push_set(vec![seg(1, 0, 0, 2), seg(1, 0, 1, 2)]);
        queue.push(QueuedPdu::Message(msg(2, 10)));

        assert!(queue.make_room(2, 0));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop(), Some(QueuedPdu::Message(msg(2, 10))));
    }

    #[test]
    fn test_make_room_fails_when_reserved() {
        let mut queue = FriendQueue::new(2);
        assert!(!queue.make_room(1, 2));
        assert!(queue.make_room(1, 1));
    }

    #[test]
    fn test_pool_reassembly_out_of_order() {
        let mut pool = SegmentPool::new(2);
        pool.allocate(7, 0x0010, 5, 3).unwrap();
        assert_eq!(pool.in_flight(7), 3);

        assert_eq!(pool.store(7, seg(0x0010, 5, 2, 3)).unwrap(), SegmentOutcome::Stored);
        assert_eq!(pool.store(7, seg(0x0010, 5, 2, 3)).unwrap(), SegmentOutcome::Duplicate);
        assert_eq!(pool.store(7, seg(0x0010, 5, 0, 3)).unwrap(), SegmentOutcome::Stored);
        match pool.store(7, seg(0x0010, 5, 1, 3)).unwrap() {
            SegmentOutcome::Complete(set) => {
                let idx: Vec<u8> = set.iter().map(|m| m.segment.unwrap().seg_index).collect();
                assert_eq!(idx, vec![0, 1, 2]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(pool.free(), 2);
        assert_eq!(pool.in_flight(7), 0);
    }

    #[test]
    fn test_pool_rejects_bad_index_and_exhaustion() {
        let mut pool = SegmentPool::new(1);
        pool.allocate(1, 0x0010, 0, 2).unwrap();
        assert!(matches!(
            pool.store(1, seg(0x0010, 0, 2, 2)),
            Err(MeshError::ProtocolViolation(_))
        ));
        assert!(matches!(
            pool.allocate(1, 0x0011, 0, 2),
            Err(MeshError::ResourceExhaustion(_))
        ));
        pool.release_owner(1);
        assert_eq!(pool.free(), 1);
    }

    #[test]
    fn test_contexts_are_per_owner() {
        let mut pool = SegmentPool::new(2);
        pool.allocate(1, 0x0010, 0, 2).unwrap();
        pool.allocate(2, 0x0010, 0, 2).unwrap();
        assert_eq!(pool.store(1, seg(0x0010, 0, 0, 2)).unwrap(), SegmentOutcome::Stored);
        assert_eq!(pool.store(2, seg(0x0010, 0, 1, 2)).unwrap(), SegmentOutcome::Stored);
        assert!(pool.has_context(1, 0x0010, 0));
        assert!(!pool.has_context(3, 0x0010, 0));
        assert!(pool.has_any_context(0x0010, 0));
    }
}
