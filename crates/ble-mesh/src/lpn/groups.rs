//! Group addresses the LPN wants its Friend to buffer for it
//!
//! Every address lives in exactly one of three sets: confirmed by the
//! Friend, waiting to be added, or waiting to be removed. At most one
//! Subscription List Add/Remove is outstanding at a time.

use crate::error::{MeshError, MeshResult};
use crate::wire::SUB_LIST_MAX;
use shared::models::Address;
use std::collections::BTreeSet;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubOp {
    Add,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubBatch {
    pub op: SubOp,
    pub xact: u8,
    pub addresses: Vec<Address>,
}

#[derive(Debug, Default)]
pub struct GroupSubscriptions {
    capacity: usize,
    added: BTreeSet<Address>,
    pending_add: BTreeSet<Address>,
    pending_remove: BTreeSet<Address>,
    in_flight: Option<SubBatch>,
}

impl GroupSubscriptions {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }

    fn total(&self) -> usize {
        // Adds cancelled in flight come back as pending removals.
        let cancelled = match &self.in_flight {
            Some(b) if b.op == SubOp::Add => b
                .addresses
                .iter()
                .filter(|a| !self.pending_add.contains(a))
                .count(),
            _ => 0,
        };
        self.added.len() + self.pending_add.len() + self.pending_remove.len() + cancelled
    }

    fn in_flight_has(&self, op: SubOp, addr: Address) -> bool {
        matches!(&self.in_flight, Some(b) if b.op == op && b.addresses.contains(&addr))
    }

    pub fn add(&mut self, addr: Address) -> MeshResult<()> {
        if self.added.contains(&addr) || self.pending_add.contains(&addr) {
            return Ok(());
        }
        if self.pending_remove.remove(&addr) {
            // Still on the Friend unless a removal is already under way.
            if self.in_flight_has(SubOp::Remove, addr) {
                self.pending_add.insert(addr);
            } else {
                self.added.insert(addr);
            }
            return Ok(());
        }
        if self.total() >= self.capacity {
            warn!("Group list full, dropping 0x{:04x}", addr);
            return Err(MeshError::ResourceExhaustion(format!(
                "no room for group 0x{:04x}",
                addr
            )));
        }
        self.pending_add.insert(addr);
        Ok(())
    }

    pub fn remove(&mut self, addr: Address) {
        if self.added.remove(&addr) {
            self.pending_remove.insert(addr);
        } else {
            self.pending_add.remove(&addr);
        }
    }

    /// Next batch to send, preferring additions. Additions stop short of
    /// the Friend's queue size.
    pub fn next_batch(&self, queue_size: usize) -> Option<(SubOp, Vec<Address>)> {
        if self.in_flight.is_some() {
            return None;
        }

        let mut adds = Vec::new();
        for &addr in &self.pending_add {
            if self.added.len() + adds.len() >= queue_size {
                warn!("Friend Queue Size exceeded");
                break;
            }
            adds.push(addr);
            if adds.len() == SUB_LIST_MAX {
                break;
            }
        }
        if !adds.is_empty() {
            return Some((SubOp::Add, adds));
        }

        let removes: Vec<Address> = self.pending_remove.iter().copied().take(SUB_LIST_MAX).collect();
        if removes.is_empty() {
            None
        } else {
            Some((SubOp::Remove, removes))
        }
    }

    pub fn begin(&mut self, batch: SubBatch) {
        self.in_flight = Some(batch);
    }

    pub fn in_flight(&self) -> Option<&SubBatch> {
        self.in_flight.as_ref()
    }

    /// Applies the outstanding batch once the Friend confirmed `xact`.
    pub fn confirm(&mut self, xact: u8) -> MeshResult<SubOp> {
        let batch = match self.in_flight.take() {
            None => {
                return Err(MeshError::StateMismatch(
                    "no pending subscription list message".to_string(),
                ))
            }
            Some(batch) if batch.xact != xact => {
                let expected = batch.xact;
                self.in_flight = Some(batch);
                return Err(MeshError::StateMismatch(format!(
                    "transaction mismatch (0x{:02x} != 0x{:02x})",
                    xact, expected
                )));
            }
            Some(batch) => batch,
        };

        for addr in &batch.addresses {
            match batch.op {
                SubOp::Add => {
                    if self.pending_add.remove(addr) {
                        self.added.insert(*addr);
                    } else {
                        // Removed while the add was on its way.
                        self.pending_remove.insert(*addr);
                    }
                }
                SubOp::Remove => {
                    self.pending_remove.remove(addr);
                }
            }
        }
        debug!(
            "Friend confirmed {:?} of {} groups",
            batch.op,
            batch.addresses.len()
        );
        Ok(batch.op)
    }

    /// A new Friend knows nothing of our groups: everything still wanted
    /// must be added again and nothing needs removing.
    pub fn reset_for_new_friendship(&mut self) {
        self.in_flight = None;
        let added = std::mem::take(&mut self.added);
        self.pending_add.extend(added);
        self.pending_remove.clear();
    }

    pub fn added(&self) -> &BTreeSet<Address> {
        &self.added
    }

    pub fn pending_add(&self) -> &BTreeSet<Address> {
        &self.pending_add
    }

    pub fn pending_remove(&self) -> &BTreeSet<Address> {
        &self.pending_remove
    }

    /// Whether the LPN wants traffic for `addr`.
    pub fn is_subscribed(&self, addr: Address) -> bool {
        self.added.contains(&addr) || self.pending_add.contains(&addr)
    }

    pub fn is_settled(&self) -> bool {
        self.in_flight.is_none() && self.pending_add.is_empty() && self.pending_remove.is_empty()
    }
}
