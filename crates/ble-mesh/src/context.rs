//! Execution context shared by the Friend and LPN state machines
//!
//! Handlers never perform I/O. They receive an [`Env`] carrying the current
//! time and node state, and push [`Action`]s into the [`Outbox`] for the
//! driver to carry out.

use crate::credentials::CredentialManager;
use crate::error::{MeshError, MeshResult};
use crate::message::OutboundPdu;
use crate::subnet::{IvIndex, Subnet};
use shared::config::NodeConfig;
use shared::models::{Address, NetIdx};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

/// Identifies one outstanding transmission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SendToken(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FriendSend {
    /// Friend Offer or Subscription List Confirm
    Reply,
    /// Answer to a Poll
    Response,
    Clear,
    ClearConfirm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LpnSend {
    Request,
    Poll,
    SubList,
    Clear,
}

/// Who is notified about the progress of a send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOwner {
    Friend { generation: u64, kind: FriendSend },
    Lpn { generation: u64, kind: LpnSend },
    Untracked,
}

/// Progress reported by the bearer for a send
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendEvent {
    Started,
    Sent(Result<(), MeshError>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FriendshipEvent {
    FriendEstablished {
        net_idx: NetIdx,
        lpn: Address,
        recv_delay: Duration,
        poll_timeout: Duration,
    },
    FriendTerminated {
        net_idx: NetIdx,
        lpn: Address,
    },
    FriendPolled {
        net_idx: NetIdx,
        lpn: Address,
        is_retry: bool,
    },
    LpnEstablished {
        net_idx: NetIdx,
        friend: Address,
        queue_size: u8,
        recv_win: Duration,
    },
    LpnTerminated {
        net_idx: NetIdx,
        friend: Address,
    },
    LpnPolled {
        net_idx: NetIdx,
        friend: Address,
        is_retry: bool,
    },
    /// Key refresh / IV update state learned from a Friend Update
    SecurityUpdate {
        net_idx: NetIdx,
        key_refresh: bool,
        iv_update: bool,
        iv_index: u32,
    },
}

pub trait FriendshipObserver: Send + Sync {
    fn on_event(&self, event: &FriendshipEvent);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Send { token: SendToken, pdu: OutboundPdu },
    Scan(bool),
    Event(FriendshipEvent),
}

#[derive(Debug, Default)]
pub struct Outbox {
    next_token: u64,
    owners: HashMap<SendToken, SendOwner>,
    actions: Vec<Action>,
}

impl Outbox {
    pub fn send(&mut self, owner: SendOwner, pdu: OutboundPdu) -> SendToken {
        self.next_token += 1;
        let token = SendToken(self.next_token);
        self.owners.insert(token, owner);
        self.actions.push(Action::Send { token, pdu });
        token
    }

    pub fn scan(&mut self, enabled: bool) {
        self.actions.push(Action::Scan(enabled));
    }

    pub fn emit(&mut self, event: FriendshipEvent) {
        self.actions.push(Action::Event(event));
    }

    pub fn owner(&self, token: SendToken) -> Option<SendOwner> {
        self.owners.get(&token).copied()
    }

    /// Forgets the token once its send has ended.
    pub fn complete(&mut self, token: SendToken) -> Option<SendOwner> {
        self.owners.remove(&token)
    }

    pub fn drain(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.actions)
    }
}

/// Everything a handler may look at or touch while processing one input.
pub struct Env<'a> {
    pub now: Instant,
    pub node: &'a NodeConfig,
    pub subnets: &'a BTreeMap<NetIdx, Subnet>,
    pub iv: IvIndex,
    pub credentials: &'a dyn CredentialManager,
    pub out: &'a mut Outbox,
}

impl<'a> Env<'a> {
    pub fn subnet(&self, net_idx: NetIdx) -> MeshResult<&'a Subnet> {
        self.subnets
            .get(&net_idx)
            .ok_or(MeshError::UnknownSubnet(net_idx))
    }

    pub fn primary_addr(&self) -> Address {
        self.node.primary_addr
    }

    pub fn is_own_element(&self, addr: Address) -> bool {
        let first = self.node.primary_addr as u32;
        let addr = addr as u32;
        addr >= first && addr < first + self.node.element_count as u32
    }
}
