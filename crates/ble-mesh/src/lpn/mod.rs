//! Low Power Node role
//!
//! The LPN finds a Friend, polls it for buffered traffic and keeps its
//! radio off between receive windows. All timing runs off one single-shot
//! timer whose meaning depends on the current [`LpnState`].

pub mod groups;

use crate::context::{Env, FriendshipEvent, LpnSend, SendEvent, SendOwner};
use crate::credentials::{CredentialSlots, FriendshipParams};
use crate::error::{MeshError, MeshResult};
use crate::message::{OutboundBody, OutboundPdu, RxContext, Security};
use crate::timer::Timer;
use crate::wire::{
    ControlPdu, FriendClear, FriendCriteria, FriendOffer, FriendPoll, FriendRequest,
    FriendSubList, FriendUpdate,
};
use groups::{GroupSubscriptions, SubBatch, SubOp};
use serde::Serialize;
use shared::config::LpnConfig;
use shared::models::{Address, NetIdx, Transmit, ADDR_ALL_FRIENDS, ADDR_UNASSIGNED};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Scanning stays off this long after a Friend Request
const REQ_WAIT: Duration = Duration::from_millis(100);
/// Scan time for Friend Offers
const REQ_SCAN: Duration = Duration::from_secs(1);
const REQ_TIMEOUT: Duration = Duration::from_millis(1100);
const POLL_RETRY_TIMEOUT: Duration = Duration::from_millis(100);
const FIRST_POLL_ATTEMPTS: u8 = 6;
const CLEAR_ATTEMPTS: u8 = 3;
/// Poll interval while a segmented transmission waits for acks
const SEG_TX_POLL: Duration = Duration::from_secs(1);

const LPN_XMIT: Transmit = Transmit::new(1, 20);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LpnState {
    Disabled,
    /// Friend Clear in progress
    Clear,
    /// Waiting to start looking for a Friend automatically
    Timer,
    Enabled,
    ReqWait,
    WaitOffer,
    Established,
    RecvDelay,
    WaitUpdate,
}

/// A Friend Offer under consideration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfferInfo {
    pub friend: Address,
    pub net_idx: NetIdx,
    pub rssi: i8,
    pub offer: FriendOffer,
}

/// Decides which Friend Offer the LPN takes.
pub trait OfferPolicy: Send {
    fn accept(&mut self, offer: &OfferInfo) -> bool;
}

/// Takes the first offer with a usable receive window.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptFirst;

impl OfferPolicy for AcceptFirst {
    fn accept(&mut self, offer: &OfferInfo) -> bool {
        offer.offer.recv_win != 0
    }
}

#[derive(Debug, Clone, Copy)]
struct ClearState {
    attempts: u8,
    start: Instant,
    delay: Duration,
    success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LpnStatus {
    pub state: LpnState,
    pub established: bool,
    pub friend: Option<Address>,
    pub net_idx: NetIdx,
    pub poll_timeout: Duration,
    pub groups: Vec<Address>,
}

/// Low Power Node state machine
///
/// Looks for a Friend on the first known subnet, keeps the friendship alive
/// with Polls and tracks which groups the Friend buffers for us. Every
/// entry point takes an [`Env`] and leaves sends, scan switches and events
/// in its outbox.
pub struct LpnClient {
    cfg: LpnConfig,
    state: LpnState,
    timer: Timer,
    net_idx: NetIdx,
    friend: Address,
    old_friend: Address,
    recv_win: Duration,
    queue_size: u8,
    friend_counter: u16,
    /// LPN Counter of the latest Friend Request
    req_counter: u16,
    counter: u16,
    credentials: CredentialSlots,
    poll_timeout: Duration,
    req_attempts: u8,
    fsn: bool,
    sent_req: Option<LpnSend>,
    pending_poll: bool,
    tx_started: Option<Instant>,
    adv_duration: Duration,
    established: bool,
    disable: bool,
    clear: Option<ClearState>,
    groups: GroupSubscriptions,
    xact_next: u8,
    generation: u64,
    segmented_tx: bool,
    last_security: Option<(u8, u32)>,
    policy: Box<dyn OfferPolicy>,
}

impl LpnClient {
    /// Create a disabled LPN that takes the first usable Friend Offer
    ///
    /// # Arguments
    /// * `cfg` - Timing and criteria the LPN requests from Friends
    pub fn new(cfg: LpnConfig) -> Self {
        Self::with_policy(cfg, Box::new(AcceptFirst))
    }

    /// Create a disabled LPN with its own Friend Offer selection
    ///
    /// # Arguments
    /// * `cfg` - Timing and criteria the LPN requests from Friends
    /// * `policy` - Decides which Friend Offer is taken
    pub fn with_policy(cfg: LpnConfig, policy: Box<dyn OfferPolicy>) -> Self {
        info!(
            "Initializing LPN with ReceiveDelay {:?}, PollTimeout {:?}",
            cfg.recv_delay(),
            cfg.poll_timeout()
        );
        Self {
            groups: GroupSubscriptions::new(cfg.group_list_size),
            poll_timeout: cfg.init_poll_timeout(),
            cfg,
            state: LpnState::Disabled,
            timer: Timer::default(),
            net_idx: 0,
            friend: ADDR_UNASSIGNED,
            old_friend: ADDR_UNASSIGNED,
            recv_win: Duration::ZERO,
            queue_size: 0,
            friend_counter: 0,
            req_counter: 0,
            counter: 0,
            credentials: CredentialSlots::default(),
            req_attempts: 0,
            fsn: false,
            sent_req: None,
            pending_poll: false,
            tx_started: None,
            adv_duration: Duration::ZERO,
            established: false,
            disable: false,
            clear: None,
            xact_next: 0,
            generation: 1,
            segmented_tx: false,
            last_security: None,
            policy,
        }
    }

    /// Arms the automatic start when configured.
    pub fn start(&mut self, now: Instant) {
        if let Some(secs) = self.cfg.auto_start_secs {
            if self.state == LpnState::Disabled {
                debug!("Looking for a Friend after {} quiet seconds", secs);
                self.state = LpnState::Timer;
                self.timer.schedule(now, Duration::from_secs(secs));
            }
        }
    }

    pub fn state(&self) -> LpnState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.established
    }

    pub fn friend(&self) -> Option<Address> {
        (self.friend != ADDR_UNASSIGNED).then_some(self.friend)
    }

    pub fn net_idx(&self) -> NetIdx {
        self.net_idx
    }

    /// Whether `addr` is our established Friend.
    pub fn lpn_match(&self, addr: Address) -> bool {
        self.established && addr == self.friend
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timer.deadline()
    }

    pub fn groups(&self) -> &GroupSubscriptions {
        &self.groups
    }

    pub fn status(&self) -> LpnStatus {
        LpnStatus {
            state: self.state,
            established: self.established,
            friend: self.friend(),
            net_idx: self.net_idx,
            poll_timeout: self.poll_timeout,
            groups: self
                .groups
                .added()
                .iter()
                .chain(self.groups.pending_add())
                .copied()
                .collect(),
        }
    }

    fn owner(&self, kind: LpnSend) -> SendOwner {
        SendOwner::Lpn {
            generation: self.generation,
            kind,
        }
    }

    fn retry_duration(&self) -> Duration {
        self.cfg.recv_delay() + self.adv_duration + self.recv_win + POLL_RETRY_TIMEOUT
    }

    fn poll_timeout_max(&self) -> Duration {
        self.cfg.poll_timeout().saturating_sub(self.retry_duration())
    }

    /// Unanswered requests tolerated once established. Always at least one,
    /// so every poll timeout sees a Poll even when a single retry does not fit.
    fn req_attempts_budget(&self) -> u8 {
        let retry = self.retry_duration().as_millis().max(1);
        let fits = self.poll_timeout_max().as_millis() / retry;
        fits.clamp(1, FIRST_POLL_ATTEMPTS as u128) as u8
    }

    fn next_poll_timeout(&mut self) -> Duration {
        let max = self.poll_timeout_max();
        if self.segmented_tx {
            return max.min(SEG_TX_POLL);
        }
        if self.poll_timeout < max {
            self.poll_timeout = (self.poll_timeout * 2).min(max);
        }
        self.poll_timeout
    }

    /// Enable or disable low power operation
    ///
    /// Enabling sends a Friend Request on the first known subnet. Disabling
    /// an established friendship sends Friend Clear first and finishes once
    /// it is confirmed or the Clear attempts run out.
    ///
    /// # Arguments
    /// * `env` - Current time, subnets and the outbox
    /// * `enable` - Whether the node should operate as an LPN
    ///
    /// # Returns
    /// * `Ok(())` when the request was queued or nothing had to change
    /// * `Err(MeshError::StateMismatch)` when enabling with no subnet
    pub fn set_enabled(&mut self, env: &mut Env<'_>, enable: bool) -> MeshResult<()> {
        if enable {
            if !matches!(self.state, LpnState::Disabled | LpnState::Timer) {
                return Ok(());
            }
            let net_idx = *env
                .subnets
                .keys()
                .next()
                .ok_or_else(|| MeshError::StateMismatch("no subnet to look for a Friend on".to_string()))?;
            self.net_idx = net_idx;
            self.timer.cancel();
            info!("Low Power Node enabled on subnet 0x{:03x}", net_idx);
            if self.cfg.establishment {
                env.out.scan(false);
            }
            self.state = LpnState::Enabled;
            return self.send_friend_request(env);
        }

        match self.state {
            LpnState::Disabled => {}
            LpnState::Timer => {
                self.timer.cancel();
                self.state = LpnState::Disabled;
            }
            LpnState::Clear => self.disable = true,
            _ => self.clear_friendship(env, false, true),
        }
        Ok(())
    }

    fn send_friend_request(&mut self, env: &mut Env<'_>) -> MeshResult<()> {
        env.subnet(self.net_idx)?;
        let req = FriendRequest {
            criteria: FriendCriteria::from_byte(self.cfg.criteria())?,
            recv_delay: self.cfg.recv_delay_ms,
            poll_timeout: self.cfg.poll_timeout,
            prev_friend: self.old_friend,
            num_elements: env.node.element_count,
            lpn_counter: self.counter,
        };
        self.req_counter = self.counter;
        self.counter = self.counter.wrapping_add(1);

        let pdu = OutboundPdu {
            net_idx: self.net_idx,
            src: env.primary_addr(),
            dst: ADDR_ALL_FRIENDS,
            ttl: 0,
            security: Security::Master,
            transmit: LPN_XMIT,
            body: OutboundBody::Control(ControlPdu::Request(req)),
        };
        debug!("Sending Friend Request with LPN Counter {}", self.req_counter);
        self.sent_req = Some(LpnSend::Request);
        self.tx_started = None;
        env.out.send(self.owner(LpnSend::Request), pdu);
        Ok(())
    }

    fn to_friend(&self, env: &Env<'_>, pdu: ControlPdu) -> MeshResult<OutboundPdu> {
        let subnet = env.subnet(self.net_idx)?;
        let (credentials, new_key) = self
            .credentials
            .for_tx(subnet)
            .ok_or_else(|| MeshError::Credentials("no friendship credentials".to_string()))?;
        Ok(OutboundPdu {
            net_idx: self.net_idx,
            src: env.primary_addr(),
            dst: self.friend,
            ttl: 0,
            security: Security::Friend {
                credentials,
                new_key,
            },
            transmit: LPN_XMIT,
            body: OutboundBody::Control(pdu),
        })
    }

    fn send_friend_poll(&mut self, env: &mut Env<'_>) -> MeshResult<()> {
        if let Some(req) = self.sent_req {
            if req != LpnSend::Poll {
                self.pending_poll = true;
            }
            return Ok(());
        }
        let pdu = self.to_friend(env, ControlPdu::Poll(FriendPoll { fsn: self.fsn }))?;
        self.sent_req = Some(LpnSend::Poll);
        self.pending_poll = false;
        self.tx_started = None;
        env.out.emit(FriendshipEvent::LpnPolled {
            net_idx: self.net_idx,
            friend: self.friend,
            is_retry: self.req_attempts > 0,
        });
        env.out.send(self.owner(LpnSend::Poll), pdu);
        Ok(())
    }

    /// Poll the Friend now instead of waiting for the poll timer
    ///
    /// # Returns
    /// * `Ok(())` when the Poll was sent or queued behind the outstanding request
    /// * `Err(MeshError::StateMismatch)` without an established friendship
    pub fn poll(&mut self, env: &mut Env<'_>) -> MeshResult<()> {
        if !self.established {
            return Err(MeshError::StateMismatch("no established friendship".to_string()));
        }
        self.send_friend_poll(env)
    }

    fn send_sub_batch(&mut self, env: &mut Env<'_>, batch: SubBatch) -> MeshResult<()> {
        let list = FriendSubList {
            xact: batch.xact,
            addresses: batch.addresses.clone(),
        };
        let pdu = match batch.op {
            SubOp::Add => ControlPdu::SubAdd(list),
            SubOp::Remove => ControlPdu::SubRemove(list),
        };
        let pdu = self.to_friend(env, pdu)?;
        debug!(
            "Sending Friend Subscription List {:?} of {} groups",
            batch.op,
            batch.addresses.len()
        );
        self.groups.begin(batch);
        self.sent_req = Some(LpnSend::SubList);
        self.tx_started = None;
        env.out.send(self.owner(LpnSend::SubList), pdu);
        Ok(())
    }

    fn send_group_update(&mut self, env: &mut Env<'_>) -> MeshResult<()> {
        if !self.established || self.sent_req.is_some() {
            return Ok(());
        }
        let Some((op, addresses)) = self.groups.next_batch(self.queue_size as usize) else {
            return Ok(());
        };
        let xact = self.xact_next;
        self.xact_next = self.xact_next.wrapping_add(1);
        self.send_sub_batch(env, SubBatch { op, xact, addresses })
    }

    fn idle_after_response(&mut self, env: &mut Env<'_>) {
        if self.sent_req.is_none() {
            let timeout = self.next_poll_timeout();
            self.timer.schedule(env.now, timeout);
        }
    }

    /// Ask the Friend to buffer traffic for group `addr`
    ///
    /// The address is tracked locally right away and sent in the next
    /// Subscription List Add once the friendship is idle.
    ///
    /// # Returns
    /// * `Err(MeshError::ResourceExhaustion)` when the group list is full
    pub fn group_add(&mut self, env: &mut Env<'_>, addr: Address) -> MeshResult<()> {
        self.groups.add(addr)?;
        if self.state == LpnState::Established {
            self.send_group_update(env)?;
        }
        Ok(())
    }

    /// Stop tracking group `addr` and tell the Friend when idle.
    pub fn group_remove(&mut self, env: &mut Env<'_>, addr: Address) -> MeshResult<()> {
        self.groups.remove(addr);
        if self.state == LpnState::Established {
            self.send_group_update(env)?;
        }
        Ok(())
    }

    /// Common bookkeeping for every answer from the Friend.
    fn response_received(&mut self, env: &mut Env<'_>) {
        if self.sent_req == Some(LpnSend::Poll) {
            self.fsn = !self.fsn;
        }
        self.timer.cancel();
        env.out.scan(false);
        self.state = LpnState::Established;
        self.req_attempts = 0;
        self.sent_req = None;
    }

    /// Handle a Friend Offer received while waiting for offers
    ///
    /// An accepted offer derives the friendship credentials and sends the
    /// first Poll.
    ///
    /// # Arguments
    /// * `env` - Current time, subnets and the outbox
    /// * `rx` - Where the offer came from
    /// * `offer` - The decoded Friend Offer
    ///
    /// # Returns
    /// * `Err(MeshError::StateMismatch)` when no offer was expected
    /// * `Err(MeshError::ProtocolViolation)` when the offer policy refused it
    pub fn handle_offer(
        &mut self,
        env: &mut Env<'_>,
        rx: &RxContext,
        offer: &FriendOffer,
    ) -> MeshResult<()> {
        if self.state != LpnState::WaitOffer || self.sent_req == Some(LpnSend::Poll) {
            return Err(MeshError::StateMismatch(format!(
                "ignoring unexpected Friend Offer from 0x{:04x}",
                rx.src
            )));
        }
        if rx.net_idx != self.net_idx {
            return Err(MeshError::StateMismatch("Friend Offer on another subnet".to_string()));
        }
        let info = OfferInfo {
            friend: rx.src,
            net_idx: rx.net_idx,
            rssi: rx.rssi,
            offer: *offer,
        };
        if !self.policy.accept(&info) {
            return Err(MeshError::ProtocolViolation(format!(
                "Friend Offer from 0x{:04x} not acceptable",
                rx.src
            )));
        }

        let subnet = env.subnet(self.net_idx)?;
        let params = FriendshipParams {
            lpn_addr: env.primary_addr(),
            friend_addr: rx.src,
            lpn_counter: self.req_counter,
            friend_counter: offer.friend_counter,
        };
        self.credentials = CredentialSlots::derive(env.credentials, subnet, &params)?;
        self.timer.cancel();
        self.friend = rx.src;
        self.recv_win = Duration::from_millis(offer.recv_win as u64);
        self.queue_size = offer.queue_size;
        self.friend_counter = offer.friend_counter;
        self.fsn = false;
        self.req_attempts = 0;
        self.sent_req = None;
        info!(
            "Accepted Friend Offer from 0x{:04x} (RecvWin {:?}, queue {})",
            rx.src, self.recv_win, offer.queue_size
        );
        if self.cfg.establishment {
            env.out.scan(false);
        }

        if let Err(e) = self.send_friend_poll(env) {
            self.credentials.clear();
            self.friend = ADDR_UNASSIGNED;
            self.recv_win = Duration::ZERO;
            self.queue_size = 0;
            return Err(e);
        }
        Ok(())
    }

    /// Handle a Friend Update answering our Poll
    ///
    /// The first Update establishes the friendship. Security changes are
    /// reported as events; `md` triggers another Poll right away.
    pub fn handle_update(
        &mut self,
        env: &mut Env<'_>,
        rx: &RxContext,
        update: &FriendUpdate,
    ) -> MeshResult<()> {
        if self.sent_req != Some(LpnSend::Poll) {
            return Err(MeshError::StateMismatch(
                "unexpected Friend Update".to_string(),
            ));
        }

        if !self.established {
            self.established = true;
            info!("Friendship established with 0x{:04x}", self.friend);
            env.out.emit(FriendshipEvent::LpnEstablished {
                net_idx: self.net_idx,
                friend: self.friend,
                queue_size: self.queue_size,
                recv_win: self.recv_win,
            });
            self.poll_timeout = self.poll_timeout_max().min(self.cfg.init_poll_timeout());
        }
        self.response_received(env);

        let security = (update.flags, update.iv_index);
        if self.last_security != Some(security) {
            self.last_security = Some(security);
            env.out.emit(FriendshipEvent::SecurityUpdate {
                net_idx: rx.net_idx,
                key_refresh: update.key_refresh(),
                iv_update: update.iv_update(),
                iv_index: update.iv_index,
            });
        }

        self.send_group_update(env)?;
        if update.md {
            debug!("Friend has more data, polling again");
            self.send_friend_poll(env)?;
        }
        self.idle_after_response(env);
        Ok(())
    }

    /// A relayed message from the Friend answers the outstanding Poll.
    pub fn handle_friend_message(&mut self, env: &mut Env<'_>) -> MeshResult<()> {
        if self.state == LpnState::Timer {
            self.on_network_activity(env.now);
            return Ok(());
        }
        if self.sent_req != Some(LpnSend::Poll) {
            return Err(MeshError::StateMismatch(
                "message from Friend without a preceding Poll".to_string(),
            ));
        }
        self.response_received(env);
        debug!("Requesting more messages from Friend");
        self.send_friend_poll(env)
    }

    pub fn handle_sub_confirm(&mut self, env: &mut Env<'_>, xact: u8) -> MeshResult<()> {
        if self.sent_req != Some(LpnSend::SubList) {
            return Err(MeshError::StateMismatch(
                "no pending subscription list message".to_string(),
            ));
        }
        self.groups.confirm(xact)?;
        self.response_received(env);

        self.send_group_update(env)?;
        if self.pending_poll {
            self.send_friend_poll(env)?;
        }
        self.idle_after_response(env);
        Ok(())
    }

    pub fn handle_clear_confirm(
        &mut self,
        env: &mut Env<'_>,
        rx: &RxContext,
        cfm: &FriendClear,
    ) -> MeshResult<()> {
        let Some(clear) = self.clear.as_mut() else {
            return Err(MeshError::StateMismatch("no Friend Clear pending".to_string()));
        };
        if rx.src != self.friend
            || cfm.lpn_addr != env.primary_addr()
            || cfm.lpn_counter != self.req_counter
        {
            return Err(MeshError::StateMismatch(format!(
                "invalid Friend Clear Confirm 0x{:04x}/{}",
                cfm.lpn_addr, cfm.lpn_counter
            )));
        }
        clear.success = true;
        debug!("Friend Clear confirmed by 0x{:04x}", rx.src);
        self.finish_teardown(env);
        Ok(())
    }

    /// Restarts the automatic start countdown on received traffic.
    pub fn on_network_activity(&mut self, now: Instant) {
        if let (LpnState::Timer, Some(secs)) = (self.state, self.cfg.auto_start_secs) {
            self.timer.schedule(now, Duration::from_secs(secs));
        }
    }

    pub fn set_segmented_tx(&mut self, active: bool) {
        self.segmented_tx = active;
    }

    pub fn on_subnet_deleted(&mut self, env: &mut Env<'_>, net_idx: NetIdx) {
        if self.state != LpnState::Disabled && self.net_idx == net_idx {
            warn!("Friendship subnet 0x{:03x} deleted", net_idx);
            self.clear_friendship(env, true, true);
        }
    }

    /// Derives credentials for a refreshed key of the friendship subnet.
    pub fn on_key_refresh(&mut self, env: &Env<'_>, net_idx: NetIdx) -> MeshResult<()> {
        if self.friend == ADDR_UNASSIGNED || net_idx != self.net_idx {
            return Ok(());
        }
        let subnet = env.subnet(net_idx)?;
        let params = FriendshipParams {
            lpn_addr: env.primary_addr(),
            friend_addr: self.friend,
            lpn_counter: self.req_counter,
            friend_counter: self.friend_counter,
        };
        self.credentials = CredentialSlots::derive(env.credentials, subnet, &params)?;
        Ok(())
    }

    fn send_friend_clear(&mut self, env: &mut Env<'_>) {
        let pdu = OutboundPdu {
            net_idx: self.net_idx,
            src: env.primary_addr(),
            dst: self.friend,
            ttl: 0,
            security: Security::Master,
            transmit: LPN_XMIT,
            body: OutboundBody::Control(ControlPdu::Clear(FriendClear {
                lpn_addr: env.primary_addr(),
                lpn_counter: self.req_counter,
            })),
        };
        debug!("Sending Friend Clear to 0x{:04x}", self.friend);
        self.sent_req = Some(LpnSend::Clear);
        env.out.send(self.owner(LpnSend::Clear), pdu);
    }

    /// Ends the friendship, trying a Friend Clear first unless `force`.
    fn clear_friendship(&mut self, env: &mut Env<'_>, force: bool, disable: bool) {
        self.disable = disable;
        if self.established && !force {
            let now = env.now;
            let clear = self.clear.get_or_insert(ClearState {
                attempts: 0,
                start: now,
                delay: REQ_TIMEOUT,
                success: false,
            });
            let in_time = now.saturating_duration_since(clear.start) < self.cfg.poll_timeout() * 2;
            if !clear.success && clear.attempts < CLEAR_ATTEMPTS && in_time {
                self.state = LpnState::Clear;
                self.timer.cancel();
                self.send_friend_clear(env);
                return;
            }
        }
        self.finish_teardown(env);
    }

    fn finish_teardown(&mut self, env: &mut Env<'_>) {
        let cleared = self.clear.map_or(false, |c| c.success);
        self.timer.cancel();
        self.credentials.clear();
        self.old_friend = if cleared { ADDR_UNASSIGNED } else { self.friend };

        if self.established {
            info!("Friendship with 0x{:04x} terminated", self.friend);
            env.out.emit(FriendshipEvent::LpnTerminated {
                net_idx: self.net_idx,
                friend: self.friend,
            });
        }

        self.friend = ADDR_UNASSIGNED;
        self.fsn = false;
        self.req_attempts = 0;
        self.recv_win = Duration::ZERO;
        self.queue_size = 0;
        self.sent_req = None;
        self.pending_poll = false;
        self.established = false;
        self.clear = None;
        self.last_security = None;
        self.poll_timeout = self.cfg.init_poll_timeout();
        self.groups.reset_for_new_friendship();
        self.generation += 1;
        env.out.scan(true);

        if std::mem::take(&mut self.disable) {
            info!("Low Power Node disabled");
            self.state = LpnState::Disabled;
        } else {
            self.state = LpnState::Enabled;
            self.timer.schedule(env.now, self.cfg.retry_timeout());
        }
    }

    pub fn on_send_event(
        &mut self,
        env: &mut Env<'_>,
        generation: u64,
        kind: LpnSend,
        event: SendEvent,
    ) {
        if generation != self.generation {
            debug!("Ignoring send progress from an earlier friendship");
            return;
        }
        let result = match event {
            SendEvent::Started => {
                self.tx_started = Some(env.now);
                return;
            }
            SendEvent::Sent(result) => result,
        };
        if let Some(started) = self.tx_started {
            self.adv_duration = env.now.saturating_duration_since(started);
        }

        match kind {
            LpnSend::Request => self.friend_req_sent(env, result),
            LpnSend::Poll | LpnSend::SubList => self.req_sent(env, result),
            LpnSend::Clear => self.clear_sent(env),
        }
    }

    fn friend_req_sent(&mut self, env: &mut Env<'_>, result: MeshResult<()>) {
        if self.state != LpnState::Enabled {
            return;
        }
        self.sent_req = None;
        if let Err(e) = result {
            warn!("Sending Friend Request failed: {}", e);
            self.timer.schedule(env.now, self.cfg.retry_timeout());
            return;
        }
        if self.cfg.establishment {
            self.state = LpnState::ReqWait;
            self.timer.schedule(env.now, REQ_WAIT);
        } else {
            self.state = LpnState::WaitOffer;
            self.timer.schedule(env.now, REQ_TIMEOUT);
        }
    }

    fn req_sent(&mut self, env: &mut Env<'_>, result: MeshResult<()>) {
        self.req_attempts = self.req_attempts.saturating_add(1);
        if let Err(e) = result {
            warn!("Sending request to Friend failed: {}", e);
            self.sent_req = None;
            self.timer.schedule(env.now, POLL_RETRY_TIMEOUT);
            return;
        }

        let spent = self
            .tx_started
            .map(|t| env.now.saturating_duration_since(t))
            .unwrap_or_default();
        let delay = self
            .cfg
            .recv_delay()
            .saturating_sub(self.cfg.scan_latency() + spent);
        self.state = LpnState::RecvDelay;
        self.timer.schedule(env.now, delay);
    }

    fn clear_sent(&mut self, env: &mut Env<'_>) {
        // Leaving low power behavior; listen for the Confirm.
        env.out.scan(true);
        self.sent_req = None;
        if let Some(clear) = self.clear.as_mut() {
            clear.attempts += 1;
            self.state = LpnState::Clear;
            self.timer.schedule(env.now, clear.delay);
            clear.delay *= 2;
        }
    }

    fn update_timeout(&mut self, env: &mut Env<'_>) -> MeshResult<()> {
        if self.established {
            warn!("No response from Friend during ReceiveWindow");
            env.out.scan(false);
            self.state = LpnState::Established;
            self.timer.schedule(env.now, POLL_RETRY_TIMEOUT);
            return Ok(());
        }

        if self.cfg.establishment {
            env.out.scan(false);
        }
        if self.req_attempts < FIRST_POLL_ATTEMPTS {
            warn!("Retrying first Friend Poll");
            self.sent_req = None;
            match self.send_friend_poll(env) {
                Ok(()) => return Ok(()),
                Err(e) => warn!("First Friend Poll failed: {}", e),
            }
        }
        let friend = self.friend;
        self.clear_friendship(env, false, false);
        Err(MeshError::Timeout(format!(
            "no Friend Update from 0x{:04x} after the first Poll",
            friend
        )))
    }

    fn on_timeout(&mut self, env: &mut Env<'_>) -> MeshResult<()> {
        match self.state {
            LpnState::Disabled => {}
            LpnState::Timer => {
                debug!("Starting to look for Friend nodes");
                self.state = LpnState::Disabled;
                self.set_enabled(env, true)?;
            }
            LpnState::Enabled => self.send_friend_request(env)?,
            LpnState::ReqWait => {
                env.out.scan(true);
                self.state = LpnState::WaitOffer;
                self.timer.schedule(env.now, self.adv_duration + REQ_SCAN);
            }
            LpnState::WaitOffer => {
                warn!("No acceptable Friend Offers received");
                if self.cfg.establishment {
                    env.out.scan(false);
                }
                self.credentials.clear();
                self.friend = ADDR_UNASSIGNED;
                self.sent_req = None;
                self.state = LpnState::Enabled;
                self.timer.schedule(env.now, self.cfg.retry_timeout());
            }
            LpnState::Established => {
                if self.req_attempts < self.req_attempts_budget() {
                    let req = self.sent_req.take();
                    match (req, self.groups.in_flight().cloned()) {
                        (Some(LpnSend::SubList), Some(batch)) => self.send_sub_batch(env, batch)?,
                        _ => self.send_friend_poll(env)?,
                    }
                    return Ok(());
                }
                let (friend, attempts) = (self.friend, self.req_attempts);
                self.req_attempts = 0;
                self.clear_friendship(env, true, false);
                return Err(MeshError::Timeout(format!(
                    "Friend 0x{:04x} silent for {} requests",
                    friend, attempts
                )));
            }
            LpnState::RecvDelay => {
                self.state = LpnState::WaitUpdate;
                self.timer
                    .schedule(env.now, self.cfg.scan_latency() + self.recv_win);
                env.out.scan(true);
            }
            LpnState::WaitUpdate => self.update_timeout(env)?,
            LpnState::Clear => {
                let disable = self.disable;
                self.clear_friendship(env, false, disable);
            }
        }
        Ok(())
    }

    /// Runs the state timer if it is due.
    pub fn poll_timers(&mut self, env: &mut Env<'_>) {
        if self.timer.fire_if_due(env.now) {
            let state = self.state;
            match self.on_timeout(env) {
                Err(e @ MeshError::Timeout(_)) => error!("Giving up on Friend: {}", e),
                Err(e) => warn!("LPN timer in {:?} failed: {}", state, e),
                Ok(()) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Action, Outbox, SendToken};
    use crate::credentials::Sha256CredentialManager;
    use crate::subnet::{IvIndex, Subnet};
    use shared::config::NodeConfig;
    use std::collections::BTreeMap;

    const FRIEND: Address = 0x0001;

    struct Harness {
        node: NodeConfig,
        subnets: BTreeMap<NetIdx, Subnet>,
        out: Outbox,
        creds: Sha256CredentialManager,
        now: Instant,
    }

    impl Harness {
        fn new() -> Self {
            let mut subnets = BTreeMap::new();
            subnets.insert(0, Subnet::new(0, [0x11; 16]));
            Self {
                node: NodeConfig {
                    primary_addr: 0x0100,
                    element_count: 1,
                },
                subnets,
                out: Outbox::default(),
                creds: Sha256CredentialManager,
                now: Instant::now(),
            }
        }

        fn env(&mut self) -> Env<'_> {
            Env {
                now: self.now,
                node: &self.node,
                subnets: &self.subnets,
                iv: IvIndex::default(),
                credentials: &self.creds,
                out: &mut self.out,
            }
        }

        fn advance(&mut self, lpn: &mut LpnClient, by: Duration) {
            self.now += by;
            lpn.poll_timers(&mut self.env());
        }

        fn sends(&mut self) -> Vec<(SendToken, OutboundPdu)> {
            self.out
                .drain()
                .into_iter()
                .filter_map(|a| match a {
                    Action::Send { token, pdu } => Some((token, pdu)),
                    _ => None,
                })
                .collect()
        }

        /// Reports the send as started and finished at the current time.
        fn transmit(&mut self, lpn: &mut LpnClient, token: SendToken) {
            if let Some(SendOwner::Lpn { generation, kind }) = self.out.complete(token) {
                lpn.on_send_event(&mut self.env(), generation, kind, SendEvent::Started);
                lpn.on_send_event(&mut self.env(), generation, kind, SendEvent::Sent(Ok(())));
            }
        }

        fn send_one(&mut self, lpn: &mut LpnClient) -> OutboundPdu {
            let mut sends = self.sends();
            assert_eq!(sends.len(), 1, "expected exactly one send");
            let (token, pdu) = sends.remove(0);
            self.transmit(lpn, token);
            pdu
        }
    }

    fn rx(friend_credentials: bool) -> RxContext {
        RxContext {
            net_idx: 0,
            src: FRIEND,
            dst: 0x0100,
            ttl: 0,
            rssi: -50,
            friend_credentials,
            new_key: false,
        }
    }

    fn offer() -> FriendOffer {
        FriendOffer {
            recv_win: 100,
            queue_size: 4,
            sub_list_size: 3,
            rssi: -50,
            friend_counter: 9,
        }
    }

    fn update(md: bool) -> FriendUpdate {
        FriendUpdate {
            flags: 0,
            iv_index: 0,
            md,
        }
    }

    fn establish(h: &mut Harness, lpn: &mut LpnClient) {
        establish_with(h, lpn, offer());
    }

    fn establish_with(h: &mut Harness, lpn: &mut LpnClient, offer: FriendOffer) {
        lpn.set_enabled(&mut h.env(), true).unwrap();
        let req = h.send_one(lpn);
        assert!(matches!(req.control(), Some(ControlPdu::Request(_))));
        assert_eq!(req.dst, ADDR_ALL_FRIENDS);
        assert_eq!(lpn.state(), LpnState::WaitOffer);

        lpn.handle_offer(&mut h.env(), &rx(false), &offer).unwrap();
        let poll = h.send_one(lpn);
        assert_eq!(poll.control(), Some(&ControlPdu::Poll(FriendPoll { fsn: false })));
        assert!(poll.uses_friend_credentials());
        assert_eq!(lpn.state(), LpnState::RecvDelay);

        lpn.handle_update(&mut h.env(), &rx(true), &update(false)).unwrap();
        assert!(lpn.is_established());
        assert_eq!(lpn.state(), LpnState::Established);
    }

    #[test]
    fn test_establishment_and_next_fsn() {
        let mut h = Harness::new();
        let mut lpn = LpnClient::new(LpnConfig::default());
        establish(&mut h, &mut lpn);
        let actions = h.out.drain();
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::Event(FriendshipEvent::LpnEstablished { friend: FRIEND, .. })
        )));

        // Next Poll carries the toggled FSN.
        let wait = lpn.next_deadline().unwrap() - h.now;
        h.advance(&mut lpn, wait);
        let poll = h.send_one(&mut lpn);
        assert_eq!(poll.control(), Some(&ControlPdu::Poll(FriendPoll { fsn: true })));
    }

    #[test]
    fn test_no_offer_retries_later() {
        let mut h = Harness::new();
        let mut lpn = LpnClient::new(LpnConfig::default());
        lpn.set_enabled(&mut h.env(), true).unwrap();
        h.send_one(&mut lpn);

        h.advance(&mut lpn, REQ_TIMEOUT);
        assert_eq!(lpn.state(), LpnState::Enabled);
        h.advance(&mut lpn, Duration::from_secs(8));
        let req = h.send_one(&mut lpn);
        match req.control() {
            Some(ControlPdu::Request(req)) => assert_eq!(req.lpn_counter, 1),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_scan_gated_establishment() {
        let mut h = Harness::new();
        let mut lpn = LpnClient::new(LpnConfig {
            establishment: true,
            ..LpnConfig::default()
        });
        lpn.set_enabled(&mut h.env(), true).unwrap();
        h.send_one(&mut lpn);
        assert_eq!(lpn.state(), LpnState::ReqWait);
        h.advance(&mut lpn, REQ_WAIT);
        assert_eq!(lpn.state(), LpnState::WaitOffer);
        assert!(h.out.drain().contains(&Action::Scan(true)));
    }

    #[test]
    fn test_first_poll_gives_up_after_six_attempts() {
        let mut h = Harness::new();
        let mut lpn = LpnClient::new(LpnConfig::default());
        lpn.set_enabled(&mut h.env(), true).unwrap();
        h.send_one(&mut lpn);
        lpn.handle_offer(&mut h.env(), &rx(false), &offer()).unwrap();

        for _ in 0..FIRST_POLL_ATTEMPTS {
            h.send_one(&mut lpn);
            // Receive delay then the receive window
            h.advance(&mut lpn, Duration::from_millis(90));
            h.advance(&mut lpn, Duration::from_millis(110));
        }
        assert_eq!(lpn.state(), LpnState::Enabled);
        assert!(lpn.friend().is_none());
        assert_eq!(lpn.old_friend, FRIEND);
    }

    #[test]
    fn test_lost_friend_forces_teardown() {
        let mut h = Harness::new();
        let mut lpn = LpnClient::new(LpnConfig::default());
        establish(&mut h, &mut lpn);
        h.out.drain();

        let budget = lpn.req_attempts_budget();
        assert_eq!(budget, 6);
        let wait = lpn.next_deadline().unwrap() - h.now;
        h.advance(&mut lpn, wait);
        for _ in 0..budget {
            h.send_one(&mut lpn);
            h.advance(&mut lpn, Duration::from_millis(90));
            h.advance(&mut lpn, Duration::from_millis(110));
            h.advance(&mut lpn, POLL_RETRY_TIMEOUT);
        }
        assert!(!lpn.is_established());
        assert_eq!(lpn.state(), LpnState::Enabled);
        let actions = h.out.drain();
        assert!(actions.contains(&Action::Event(FriendshipEvent::LpnTerminated {
            net_idx: 0,
            friend: FRIEND,
        })));
        // Forced teardown skips Friend Clear.
        assert!(!actions.iter().any(|a| matches!(
            a,
            Action::Send { pdu, .. } if matches!(pdu.control(), Some(ControlPdu::Clear(_)))
        )));
    }

    #[test]
    fn test_disable_sends_clear_and_confirm_ends_it() {
        let mut h = Harness::new();
        let mut lpn = LpnClient::new(LpnConfig::default());
        establish(&mut h, &mut lpn);
        h.out.drain();

        lpn.set_enabled(&mut h.env(), false).unwrap();
        let clear = h.send_one(&mut lpn);
        assert_eq!(
            clear.control(),
            Some(&ControlPdu::Clear(FriendClear {
                lpn_addr: 0x0100,
                lpn_counter: 0,
            }))
        );
        assert_eq!(lpn.state(), LpnState::Clear);

        let wrong = FriendClear {
            lpn_addr: 0x0100,
            lpn_counter: 1,
        };
        assert!(lpn.handle_clear_confirm(&mut h.env(), &rx(false), &wrong).is_err());
        assert_eq!(lpn.state(), LpnState::Clear);

        let right = FriendClear {
            lpn_addr: 0x0100,
            lpn_counter: 0,
        };
        lpn.handle_clear_confirm(&mut h.env(), &rx(false), &right).unwrap();
        assert_eq!(lpn.state(), LpnState::Disabled);
        assert_eq!(lpn.old_friend, ADDR_UNASSIGNED);
    }

    #[test]
    fn test_clear_attempts_exhausted_frees_state() {
        let mut h = Harness::new();
        let mut lpn = LpnClient::new(LpnConfig::default());
        establish(&mut h, &mut lpn);
        h.out.drain();

        lpn.set_enabled(&mut h.env(), false).unwrap();
        let mut delay = REQ_TIMEOUT;
        for _ in 0..CLEAR_ATTEMPTS {
            let pdu = h.send_one(&mut lpn);
            assert!(matches!(pdu.control(), Some(ControlPdu::Clear(_))));
            h.advance(&mut lpn, delay);
            delay *= 2;
        }
        assert_eq!(lpn.state(), LpnState::Disabled);
        assert_eq!(lpn.old_friend, FRIEND);
        assert!(h.sends().is_empty());
    }

    #[test]
    fn test_message_from_friend_polls_again() {
        let mut h = Harness::new();
        let mut lpn = LpnClient::new(LpnConfig::default());
        establish(&mut h, &mut lpn);
        h.out.drain();

        lpn.poll(&mut h.env()).unwrap();
        h.send_one(&mut lpn);
        lpn.handle_friend_message(&mut h.env()).unwrap();
        let poll = h.send_one(&mut lpn);
        assert_eq!(poll.control(), Some(&ControlPdu::Poll(FriendPoll { fsn: false })));
        assert!(lpn.handle_friend_message(&mut h.env()).is_ok());
    }

    #[test]
    fn test_group_add_confirm_cycle() {
        let mut h = Harness::new();
        let mut lpn = LpnClient::new(LpnConfig::default());
        establish(&mut h, &mut lpn);
        h.out.drain();

        lpn.group_add(&mut h.env(), 0xc000).unwrap();
        let add = h.send_one(&mut lpn);
        let xact = match add.control() {
            Some(ControlPdu::SubAdd(list)) => {
                assert_eq!(list.addresses, vec![0xc000]);
                list.xact
            }
            other => panic!("unexpected {:?}", other),
        };
        assert!(lpn.handle_sub_confirm(&mut h.env(), xact.wrapping_add(1)).is_err());
        lpn.handle_sub_confirm(&mut h.env(), xact).unwrap();
        assert!(lpn.groups().added().contains(&0xc000));
        assert!(lpn.next_deadline().is_some());
    }

    #[test]
    fn test_update_with_more_data_polls_again() {
        let mut h = Harness::new();
        let mut lpn = LpnClient::new(LpnConfig::default());
        establish(&mut h, &mut lpn);
        h.out.drain();

        lpn.poll(&mut h.env()).unwrap();
        h.send_one(&mut lpn);
        lpn.handle_update(&mut h.env(), &rx(true), &update(true)).unwrap();
        let poll = h.send_one(&mut lpn);
        assert!(matches!(poll.control(), Some(ControlPdu::Poll(_))));
    }

    #[test]
    fn test_poll_interval_doubles_and_caps() {
        let mut lpn = LpnClient::new(LpnConfig {
            poll_timeout: 100,
            init_poll_timeout: 10,
            ..LpnConfig::default()
        });
        lpn.recv_win = Duration::from_millis(100);
        let max = lpn.poll_timeout_max();
        assert_eq!(max, Duration::from_millis(10_000 - 300));
        assert_eq!(lpn.next_poll_timeout(), Duration::from_secs(2));
        for _ in 0..10 {
            lpn.next_poll_timeout();
        }
        assert_eq!(lpn.poll_timeout, max);

        lpn.set_segmented_tx(true);
        assert_eq!(lpn.next_poll_timeout(), SEG_TX_POLL);
    }

    #[test]
    fn test_auto_start() {
        let mut h = Harness::new();
        let mut lpn = LpnClient::new(LpnConfig {
            auto_start_secs: Some(5),
            ..LpnConfig::default()
        });
        lpn.start(h.now);
        assert_eq!(lpn.state(), LpnState::Timer);

        h.advance(&mut lpn, Duration::from_secs(3));
        lpn.on_network_activity(h.now);
        h.advance(&mut lpn, Duration::from_secs(3));
        assert_eq!(lpn.state(), LpnState::Timer);
        h.advance(&mut lpn, Duration::from_secs(2));
        assert_eq!(lpn.state(), LpnState::Enabled);
        assert_eq!(h.sends().len(), 1);
    }

    #[test]
    fn test_subnet_deletion_forces_disable() {
        let mut h = Harness::new();
        let mut lpn = LpnClient::new(LpnConfig::default());
        establish(&mut h, &mut lpn);
        h.out.drain();
        lpn.on_subnet_deleted(&mut h.env(), 0);
        assert_eq!(lpn.state(), LpnState::Disabled);
        assert!(h.sends().is_empty());
    }

    #[test]
    fn test_short_poll_timeout_still_polls_once() {
        let mut h = Harness::new();
        let mut lpn = LpnClient::new(LpnConfig {
            recv_delay_ms: 255,
            poll_timeout: 10,
            init_poll_timeout: 10,
            ..LpnConfig::default()
        });
        establish_with(
            &mut h,
            &mut lpn,
            FriendOffer {
                recv_win: 255,
                ..offer()
            },
        );
        h.out.drain();
        // One retry (255 + 255 + 100 ms) does not fit into the 390 ms left.
        assert_eq!(lpn.poll_timeout_max(), Duration::from_millis(390));
        assert_eq!(lpn.req_attempts_budget(), 1);

        let wait = lpn.next_deadline().unwrap() - h.now;
        h.advance(&mut lpn, wait);
        let poll = h.send_one(&mut lpn);
        assert_eq!(poll.control(), Some(&ControlPdu::Poll(FriendPoll { fsn: true })));
        assert!(lpn.is_established());

        // Receive delay, then an empty receive window.
        for _ in 0..2 {
            let wait = lpn.next_deadline().unwrap() - h.now;
            h.advance(&mut lpn, wait);
        }
        assert_eq!(lpn.state(), LpnState::Established);
        assert!(lpn.is_established());

        h.now = lpn.next_deadline().unwrap();
        assert!(lpn.timer.fire_if_due(h.now));
        assert!(matches!(lpn.on_timeout(&mut h.env()), Err(MeshError::Timeout(_))));
        assert!(!lpn.is_established());
        assert_eq!(lpn.state(), LpnState::Enabled);
        assert!(h.out.drain().contains(&Action::Event(FriendshipEvent::LpnTerminated {
            net_idx: 0,
            friend: FRIEND,
        })));
    }

    #[test]
    fn test_clear_stops_after_twice_poll_timeout() {
        let mut h = Harness::new();
        let mut lpn = LpnClient::new(LpnConfig {
            poll_timeout: 10,
            init_poll_timeout: 10,
            ..LpnConfig::default()
        });
        establish(&mut h, &mut lpn);
        h.out.drain();

        lpn.set_enabled(&mut h.env(), false).unwrap();
        let first = h.send_one(&mut lpn);
        assert!(matches!(first.control(), Some(ControlPdu::Clear(_))));
        h.advance(&mut lpn, REQ_TIMEOUT);
        let second = h.send_one(&mut lpn);
        assert!(matches!(second.control(), Some(ControlPdu::Clear(_))));

        // The third attempt would start 3.3 s in, past the 2 s ceiling.
        h.advance(&mut lpn, REQ_TIMEOUT * 2);
        assert!(h.sends().is_empty());
        assert_eq!(lpn.state(), LpnState::Disabled);
        assert_eq!(lpn.old_friend, FRIEND);
        assert!(lpn.next_deadline().is_none());
    }

    #[test]
    fn test_send_progress_from_earlier_friendship_ignored() {
        let mut h = Harness::new();
        let mut lpn = LpnClient::new(LpnConfig::default());
        establish(&mut h, &mut lpn);
        h.out.drain();

        lpn.poll(&mut h.env()).unwrap();
        let (token, _) = h.sends().remove(0);
        let Some(SendOwner::Lpn { generation, kind }) = h.out.complete(token) else {
            panic!("Poll without an LPN owner");
        };

        lpn.on_subnet_deleted(&mut h.env(), 0);
        establish(&mut h, &mut lpn);
        h.out.drain();
        let deadline = lpn.next_deadline();

        lpn.on_send_event(&mut h.env(), generation, kind, SendEvent::Started);
        lpn.on_send_event(&mut h.env(), generation, kind, SendEvent::Sent(Ok(())));
        assert_eq!(lpn.state(), LpnState::Established);
        assert_eq!(lpn.next_deadline(), deadline);
        assert!(h.out.drain().is_empty());
    }
}
