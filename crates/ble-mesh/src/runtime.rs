//! Per-node context owning both friendship roles
//!
//! [`MeshNodeRuntime`] is the single object the rest of the stack talks to.
//! It holds the subnets and IV index, routes inbound control PDUs to the
//! Friend or LPN side, and exposes all timers as one deadline.

use crate::context::{Action, Env, Outbox, SendEvent, SendOwner, SendToken};
use crate::credentials::CredentialManager;
use crate::error::{MeshError, MeshResult};
use crate::friend::queue::QueuedPdu;
use crate::friend::{FriendshipInfo, FriendshipServer};
use crate::lpn::{LpnClient, LpnState, LpnStatus, OfferPolicy};
use crate::message::{NetworkMessage, RxContext};
use crate::subnet::{IvIndex, NetKey, Subnet, SubnetEvent};
use crate::timer::earliest;
use crate::wire::ControlPdu;
use shared::config::{Config, NodeConfig};
use shared::models::{Address, NetIdx};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Friend and LPN roles of one node, driven without any I/O
///
/// Inputs come in through the `handle_*`, `on_send_event` and command
/// methods, each stamped with the current time. Outputs collect as
/// [`Action`]s until [`MeshNodeRuntime::drain_actions`] takes them.
pub struct MeshNodeRuntime {
    node: NodeConfig,
    subnets: BTreeMap<NetIdx, Subnet>,
    iv: IvIndex,
    credentials: Box<dyn CredentialManager>,
    out: Outbox,
    friend: FriendshipServer,
    lpn: LpnClient,
}

impl MeshNodeRuntime {
    /// Create a node with no subnets
    ///
    /// # Arguments
    /// * `config` - Node addresses plus the Friend and LPN settings
    /// * `credentials` - Derives friendship credentials from network keys
    pub fn new(config: &Config, credentials: Box<dyn CredentialManager>) -> Self {
        info!(
            "Initializing mesh node 0x{:04x} with {} elements",
            config.node.primary_addr, config.node.element_count
        );
        Self {
            node: config.node.clone(),
            subnets: BTreeMap::new(),
            iv: IvIndex::default(),
            credentials,
            out: Outbox::default(),
            friend: FriendshipServer::new(config.friend.clone()),
            lpn: LpnClient::new(config.lpn.clone()),
        }
    }

    /// Replaces the LPN's Friend Offer selection.
    pub fn with_offer_policy(mut self, config: &Config, policy: Box<dyn OfferPolicy>) -> Self {
        self.lpn = LpnClient::with_policy(config.lpn.clone(), policy);
        self
    }

    fn parts(&mut self, now: Instant) -> (Env<'_>, &mut FriendshipServer, &mut LpnClient) {
        let Self {
            node,
            subnets,
            iv,
            credentials,
            out,
            friend,
            lpn,
        } = self;
        let env = Env {
            now,
            node,
            subnets,
            iv: *iv,
            credentials: &**credentials,
            out,
        };
        (env, friend, lpn)
    }

    pub fn primary_addr(&self) -> Address {
        self.node.primary_addr
    }

    pub fn iv_index(&self) -> IvIndex {
        self.iv
    }

    /// Arms the LPN auto-start timer, if configured.
    pub fn start(&mut self, now: Instant) {
        self.lpn.start(now);
    }

    pub fn subnet_event(&mut self, now: Instant, event: SubnetEvent) {
        debug!("Subnet event {:?}", event);
        let (mut env, friend, lpn) = self.parts(now);
        match event {
            SubnetEvent::Added(_) => {}
            SubnetEvent::Deleted(net_idx) => {
                friend.clear_net_idx(&mut env, net_idx);
                lpn.on_subnet_deleted(&mut env, net_idx);
            }
            SubnetEvent::KeyRefresh(net_idx, _) => {
                friend.sec_update(&env, Some(net_idx));
                if let Err(e) = lpn.on_key_refresh(&env, net_idx) {
                    warn!("LPN credential refresh failed: {}", e);
                }
            }
            SubnetEvent::IvUpdate(_) => friend.sec_update(&env, None),
        }
    }

    pub fn add_subnet(&mut self, now: Instant, net_idx: NetIdx, net_key: NetKey) {
        self.subnets.insert(net_idx, Subnet::new(net_idx, net_key));
        self.subnet_event(now, SubnetEvent::Added(net_idx));
    }

    pub fn delete_subnet(&mut self, now: Instant, net_idx: NetIdx) -> MeshResult<()> {
        if !self.subnets.contains_key(&net_idx) {
            return Err(MeshError::UnknownSubnet(net_idx));
        }
        self.subnet_event(now, SubnetEvent::Deleted(net_idx));
        self.subnets.remove(&net_idx);
        Ok(())
    }

    pub fn start_key_refresh(
        &mut self,
        now: Instant,
        net_idx: NetIdx,
        new_key: NetKey,
    ) -> MeshResult<()> {
        let subnet = self
            .subnets
            .get_mut(&net_idx)
            .ok_or(MeshError::UnknownSubnet(net_idx))?;
        subnet.start_key_refresh(new_key);
        let phase = subnet.kr_phase;
        self.subnet_event(now, SubnetEvent::KeyRefresh(net_idx, phase));
        Ok(())
    }

    pub fn advance_key_refresh(&mut self, now: Instant, net_idx: NetIdx) -> MeshResult<()> {
        let subnet = self
            .subnets
            .get_mut(&net_idx)
            .ok_or(MeshError::UnknownSubnet(net_idx))?;
        subnet.advance_key_refresh();
        let phase = subnet.kr_phase;
        self.subnet_event(now, SubnetEvent::KeyRefresh(net_idx, phase));
        Ok(())
    }

    pub fn set_iv_index(&mut self, now: Instant, iv: IvIndex) {
        if self.iv == iv {
            return;
        }
        self.iv = iv;
        self.subnet_event(now, SubnetEvent::IvUpdate(iv));
    }

    /// Handle a transport control PDU
    ///
    /// Offers, Updates, Subscription List Confirms and our own Clear Confirm
    /// go to the LPN side; everything else goes to the Friend side unless
    /// this node is an established LPN. Failures are logged and the PDU is
    /// dropped.
    ///
    /// # Arguments
    /// * `now` - Arrival time
    /// * `rx` - Network layer context of the PDU
    /// * `opcode` - Transport control opcode
    /// * `params` - Undecoded parameters
    ///
    /// # Returns
    /// * `Ok(())` when the PDU was handled
    /// * `Err(MeshError)` describing why it was dropped
    pub fn handle_control(
        &mut self,
        now: Instant,
        rx: &RxContext,
        opcode: u8,
        params: &[u8],
    ) -> MeshResult<()> {
        let result = ControlPdu::decode(opcode, params)
            .map_err(MeshError::from)
            .and_then(|pdu| self.dispatch_control(now, rx, &pdu));
        if let Err(e) = &result {
            if e.is_silent_drop() {
                debug!("Dropping control 0x{:02x} from 0x{:04x}: {}", opcode, rx.src, e);
            } else {
                warn!("Control 0x{:02x} from 0x{:04x} failed: {}", opcode, rx.src, e);
            }
        }
        result
    }

    fn from_friend(lpn: &LpnClient, rx: &RxContext) -> MeshResult<()> {
        if lpn.friend() != Some(rx.src) {
            return Err(MeshError::StateMismatch(format!(
                "0x{:04x} is not our Friend",
                rx.src
            )));
        }
        if !rx.friend_credentials {
            return Err(MeshError::ProtocolViolation(
                "Friend did not use friend credentials".to_string(),
            ));
        }
        Ok(())
    }

    fn dispatch_control(&mut self, now: Instant, rx: &RxContext, pdu: &ControlPdu) -> MeshResult<()> {
        debug!("{} from 0x{:04x}", pdu.name(), rx.src);
        self.lpn.on_network_activity(now);
        let (mut env, friend, lpn) = self.parts(now);

        match pdu {
            ControlPdu::Offer(offer) => lpn.handle_offer(&mut env, rx, offer),
            ControlPdu::Update(update) => {
                Self::from_friend(lpn, rx)?;
                lpn.handle_update(&mut env, rx, update)
            }
            ControlPdu::SubConfirm { xact } => {
                Self::from_friend(lpn, rx)?;
                lpn.handle_sub_confirm(&mut env, *xact)
            }
            ControlPdu::ClearConfirm(cfm)
                if lpn.state() == LpnState::Clear && lpn.friend() == Some(rx.src) =>
            {
                lpn.handle_clear_confirm(&mut env, rx, cfm)
            }
            _ if lpn.is_established() => Err(MeshError::StateMismatch(
                "Friend messages are ignored while acting as LPN".to_string(),
            )),
            ControlPdu::Request(req) => friend.handle_friend_request(&mut env, rx, req),
            ControlPdu::Poll(poll) => friend.handle_poll(&mut env, rx, poll),
            ControlPdu::Clear(clear) => friend.handle_friend_clear(&mut env, rx, clear),
            ControlPdu::ClearConfirm(cfm) => friend.handle_clear_confirm(rx, cfm),
            ControlPdu::SubAdd(list) => friend.handle_sub_list(&mut env, rx, list, true),
            ControlPdu::SubRemove(list) => friend.handle_sub_list(&mut env, rx, list, false),
        }
    }

    /// Offers network traffic to the Friend Queues. Returns how many LPNs
    /// took it.
    pub fn submit_for_lpn(&mut self, now: Instant, net_idx: NetIdx, msg: &NetworkMessage) -> usize {
        self.lpn.on_network_activity(now);
        let (env, friend, _) = self.parts(now);
        friend.enqueue(&env, net_idx, msg)
    }

    /// A relayed message delivered by our Friend in answer to a Poll.
    pub fn handle_friend_data(&mut self, now: Instant, rx: &RxContext) -> MeshResult<()> {
        let (mut env, _, lpn) = self.parts(now);
        if !rx.friend_credentials || lpn.friend().is_none() {
            lpn.on_network_activity(now);
            return Ok(());
        }
        let result = lpn.handle_friend_message(&mut env);
        if let Err(e) = &result {
            debug!("Dropping message from Friend: {}", e);
        }
        result
    }

    /// Routes bearer progress to whoever sent the PDU.
    pub fn on_send_event(&mut self, now: Instant, token: SendToken, event: SendEvent) {
        let owner = match event {
            SendEvent::Started => self.out.owner(token),
            SendEvent::Sent(_) => self.out.complete(token),
        };
        let Some(owner) = owner else {
            debug!("Send progress for unknown token {:?}", token);
            return;
        };
        let (mut env, friend, lpn) = self.parts(now);
        match owner {
            SendOwner::Friend { generation, kind } => {
                friend.on_send_event(&mut env, generation, kind, event)
            }
            SendOwner::Lpn { generation, kind } => lpn.on_send_event(&mut env, generation, kind, event),
            SendOwner::Untracked => {}
        }
    }

    /// Earliest instant at which [`MeshNodeRuntime::poll_timers`] has work.
    pub fn next_deadline(&self) -> Option<Instant> {
        earliest([self.friend.next_deadline(), self.lpn.next_deadline()])
    }

    pub fn poll_timers(&mut self, now: Instant) {
        let (mut env, friend, lpn) = self.parts(now);
        friend.poll_timers(&mut env);
        lpn.poll_timers(&mut env);
    }

    pub fn drain_actions(&mut self) -> Vec<Action> {
        self.out.drain()
    }

    pub fn friend_set(&mut self, now: Instant, enabled: bool) {
        let (mut env, friend, _) = self.parts(now);
        friend.set_enabled(&mut env, enabled);
    }

    pub fn lpn_set(&mut self, now: Instant, enabled: bool) -> MeshResult<()> {
        let (mut env, _, lpn) = self.parts(now);
        lpn.set_enabled(&mut env, enabled)
    }

    pub fn lpn_poll(&mut self, now: Instant) -> MeshResult<()> {
        let (mut env, _, lpn) = self.parts(now);
        lpn.poll(&mut env)
    }

    pub fn lpn_group_add(&mut self, now: Instant, addr: Address) -> MeshResult<()> {
        let (mut env, _, lpn) = self.parts(now);
        lpn.group_add(&mut env, addr)
    }

    pub fn lpn_group_remove(&mut self, now: Instant, addr: Address) -> MeshResult<()> {
        let (mut env, _, lpn) = self.parts(now);
        lpn.group_remove(&mut env, addr)
    }

    /// Tells the LPN a segmented transmission is waiting for its acks.
    pub fn set_segmented_tx(&mut self, active: bool) {
        self.lpn.set_segmented_tx(active);
    }

    pub fn queue_has_space(
        &self,
        net_idx: NetIdx,
        src: Address,
        dst: Address,
        seq_zero: u16,
        seg_count: usize,
    ) -> bool {
        self.friend
            .queue_has_space(net_idx, src, dst, seq_zero, seg_count)
    }

    pub fn friend_match(&self, net_idx: NetIdx, addr: Address) -> bool {
        self.friend.friend_match(net_idx, addr)
    }

    pub fn lpn_match(&self, addr: Address) -> bool {
        self.lpn.lpn_match(addr)
    }

    pub fn lpn_poll_timeout(&self, now: Instant, lpn: Address) -> u32 {
        self.friend.lpn_poll_timeout(now, lpn)
    }

    pub fn lpn_status(&self) -> LpnStatus {
        self.lpn.status()
    }

    pub fn friendships(&self) -> Vec<FriendshipInfo> {
        self.friend.friendships()
    }

    pub fn queued(&self, net_idx: NetIdx, lpn: Address) -> Vec<QueuedPdu> {
        self.friend.queued(net_idx, lpn)
    }
}
