//! Friend role: buffers traffic for Low Power Nodes and hands it out on Poll

pub mod queue;

use crate::context::{Env, FriendSend, FriendshipEvent, SendEvent, SendOwner};
use crate::credentials::{CredentialSlots, FriendshipParams};
use crate::error::{MeshError, MeshResult};
use crate::message::{
    NetworkMessage, OutboundBody, OutboundPdu, RxContext, Security, DEFAULT_TTL,
};
use crate::timer::{earliest, Timer};
use crate::wire::{
    ControlPdu, FriendClear, FriendCriteria, FriendOffer, FriendPoll, FriendRequest,
    FriendSubList, FriendUpdate,
};
use queue::{FriendQueue, QueuedPdu, SegmentOutcome, SegmentPool};
use serde::Serialize;
use shared::config::FriendConfig;
use shared::models::{is_unicast, unicast_range_valid, Address, NetIdx, Transmit, ADDR_UNASSIGNED};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Wait for the first Poll after the Offer went out
const OFFER_POLL_WAIT: Duration = Duration::from_secs(1);

/// First retransmission interval of Friend Clear
const CLEAR_FIRST_DELAY: Duration = Duration::from_secs(1);

const MIN_OFFER_DELAY: Duration = Duration::from_millis(100);

const FRIEND_XMIT: Transmit = Transmit::new(1, 20);

/// Delay before the Offer, from the LPN's criteria and the request RSSI.
pub fn offer_delay(recv_win_ms: u8, rssi: i8, criteria: FriendCriteria) -> Duration {
    let mut delay = criteria.recv_win_scale() * recv_win_ms as i32;
    delay -= criteria.rssi_scale() * rssi as i32;
    delay /= 10;

    if delay < MIN_OFFER_DELAY.as_millis() as i32 {
        MIN_OFFER_DELAY
    } else {
        Duration::from_millis(delay as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    /// Send the one-shot reply slot
    Reply,
    /// Answer a Poll, repeating the last response when `resend` is set
    Poll { resend: bool },
}

/// Friend Clear sent to the LPN's previous Friend
#[derive(Debug)]
struct ClearProcedure {
    friend: Address,
    start: Instant,
    delay: Duration,
    timer: Timer,
}

/// One served LPN
#[derive(Debug)]
pub struct Friendship {
    lpn: Address,
    num_elements: u8,
    net_idx: NetIdx,
    recv_delay: Duration,
    poll_timeout: Duration,
    lpn_counter: u16,
    counter: u16,
    established: bool,
    fsn: bool,
    credentials: CredentialSlots,
    sub_list: Vec<Address>,
    sub_list_size: usize,
    queue: FriendQueue,
    last: Option<OutboundPdu>,
    reply: Option<OutboundPdu>,
    pending: Option<Pending>,
    timer: Timer,
    clear: Option<ClearProcedure>,
    generation: u64,
}

impl Friendship {
    fn is_lpn_element(&self, addr: Address) -> bool {
        let first = self.lpn as u32;
        let addr = addr as u32;
        addr >= first && addr < first + self.num_elements as u32
    }

    fn lpn_matches(&self, net_idx: NetIdx, addr: Address) -> bool {
        self.established
            && self.net_idx == net_idx
            && (self.is_lpn_element(addr) || self.sub_list.contains(&addr))
    }

    fn next_deadline(&self) -> Option<Instant> {
        earliest([
            self.timer.deadline(),
            self.clear.as_ref().and_then(|c| c.timer.deadline()),
        ])
    }

    fn security(&self, env: &Env<'_>) -> MeshResult<Security> {
        let subnet = env.subnet(self.net_idx)?;
        let (credentials, new_key) = self.credentials.for_tx(subnet).ok_or_else(|| {
            MeshError::Credentials(format!("no credentials for LPN 0x{:04x}", self.lpn))
        })?;
        Ok(Security::Friend {
            credentials,
            new_key,
        })
    }

    fn control_to_lpn(&self, env: &Env<'_>, pdu: ControlPdu) -> MeshResult<OutboundPdu> {
        Ok(OutboundPdu {
            net_idx: self.net_idx,
            src: env.primary_addr(),
            dst: self.lpn,
            ttl: 0,
            security: self.security(env)?,
            transmit: FRIEND_XMIT,
            body: OutboundBody::Control(pdu),
        })
    }

    /// Builds the answer to a fresh Poll from the head of the queue.
    fn next_response(&mut self, env: &Env<'_>) -> MeshResult<OutboundPdu> {
        let security = self.security(env)?;
        let subnet = env.subnet(self.net_idx)?;

        let pdu = match self.queue.pop() {
            Some(QueuedPdu::Message(message)) => OutboundPdu {
                net_idx: self.net_idx,
                src: message.src,
                dst: message.dst,
                ttl: message.ttl,
                security,
                transmit: FRIEND_XMIT,
                body: OutboundBody::Relayed {
                    more_data: !self.queue.is_empty(),
                    message,
                },
            },
            Some(QueuedPdu::Update(mut update)) => {
                update.md = !self.queue.is_empty();
                self.control_to_lpn(env, ControlPdu::Update(update))?
            }
            None => self.control_to_lpn(
                env,
                ControlPdu::Update(FriendUpdate {
                    flags: subnet.flags(env.iv),
                    iv_index: env.iv.index,
                    md: false,
                }),
            )?,
        };
        Ok(pdu)
    }

    fn send_clear(&self, env: &mut Env<'_>) {
        let Some(clear) = &self.clear else {
            return;
        };
        debug!(
            "Sending Friend Clear for LPN 0x{:04x} to 0x{:04x}",
            self.lpn, clear.friend
        );
        let pdu = OutboundPdu {
            net_idx: self.net_idx,
            src: env.primary_addr(),
            dst: clear.friend,
            ttl: DEFAULT_TTL,
            security: Security::Master,
            transmit: FRIEND_XMIT,
            body: OutboundBody::Control(ControlPdu::Clear(FriendClear {
                lpn_addr: self.lpn,
                lpn_counter: self.lpn_counter,
            })),
        };
        env.out.send(
            SendOwner::Friend {
                generation: self.generation,
                kind: FriendSend::Clear,
            },
            pdu,
        );
    }

    fn derive_credentials(&mut self, env: &Env<'_>) -> MeshResult<()> {
        let subnet = env.subnet(self.net_idx)?;
        let params = FriendshipParams {
            lpn_addr: self.lpn,
            friend_addr: env.primary_addr(),
            lpn_counter: self.lpn_counter,
            friend_counter: self.counter,
        };
        self.credentials = CredentialSlots::derive(env.credentials, subnet, &params)?;
        Ok(())
    }
}

/// Status of one friendship for configuration reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FriendshipInfo {
    pub lpn: Address,
    pub net_idx: NetIdx,
    pub established: bool,
    pub queue_len: usize,
    pub sub_list: Vec<Address>,
    pub poll_timeout: Duration,
}

/// Admits one message into a friendship's queue, reassembling segments in
/// the shared pool first.
fn admit(frnd: &mut Friendship, pool: &mut SegmentPool, msg: NetworkMessage) -> MeshResult<()> {
    let owner = frnd.generation;
    let Some(seg) = msg.segment else {
        let reserved = pool.in_flight(owner);
        if !frnd.queue.make_room(1, reserved) {
            return Err(MeshError::ResourceExhaustion(format!(
                "Friend Queue of 0x{:04x} is reserved for segments",
                frnd.lpn
            )));
        }
        frnd.queue.push(QueuedPdu::Message(msg));
        return Ok(());
    };

    if seg.seg_index >= seg.seg_total {
        return Err(MeshError::ProtocolViolation(format!(
            "segment {} of {}",
            seg.seg_index, seg.seg_total
        )));
    }

    if !pool.has_context(owner, msg.src, seg.seq_zero) {
        pool.release_stale(owner, msg.src, seg.seq_zero);
        let reserved = pool.in_flight(owner) + seg.seg_total as usize;
        if reserved > frnd.queue.capacity() {
            return Err(MeshError::ResourceExhaustion(format!(
                "no room for {} segments for 0x{:04x}",
                seg.seg_total, frnd.lpn
            )));
        }
        pool.allocate(owner, msg.src, seg.seq_zero, seg.seg_total)?;
        frnd.queue.make_room(0, reserved);
    }

    match pool.store(owner, msg)? {
        SegmentOutcome::Complete(set) => {
            debug!(
                "Segment set of {} complete for LPN 0x{:04x}",
                set.len(),
                frnd.lpn
            );
            frnd.queue.push_set(set);
        }
        SegmentOutcome::Duplicate => debug!("Ignoring duplicate segment"),
        SegmentOutcome::Stored => {}
    }
    Ok(())
}

/// All friendships of this node plus the shared segment pool
///
/// The Friend answers Friend Requests with an Offer, buffers traffic for
/// every established LPN and hands it out one PDU per Poll. Friendships
/// end on Friend Clear, on a missed poll timeout or when the feature is
/// disabled.
pub struct FriendshipServer {
    cfg: FriendConfig,
    enabled: bool,
    friendships: Vec<Friendship>,
    pool: SegmentPool,
    next_counter: u16,
    next_generation: u64,
}

impl FriendshipServer {
    /// Create a Friend with no friendships
    ///
    /// # Arguments
    /// * `cfg` - Slot count, queue and subscription list sizes, receive window
    pub fn new(cfg: FriendConfig) -> Self {
        info!(
            "Initializing Friend with {} slots, queue size {}, {} segment contexts",
            cfg.max_friendships, cfg.queue_size, cfg.seg_rx_contexts
        );
        Self {
            enabled: cfg.enabled,
            pool: SegmentPool::new(cfg.seg_rx_contexts),
            friendships: Vec::with_capacity(cfg.max_friendships),
            next_counter: 0,
            next_generation: 1,
            cfg,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn find(&self, net_idx: NetIdx, lpn: Address) -> Option<usize> {
        self.friendships
            .iter()
            .position(|f| f.net_idx == net_idx && f.lpn == lpn)
    }

    fn find_established(&self, rx: &RxContext) -> MeshResult<usize> {
        let idx = self
            .find(rx.net_idx, rx.src)
            .filter(|&idx| self.friendships[idx].established)
            .ok_or_else(|| {
                MeshError::StateMismatch(format!("no friendship with 0x{:04x}", rx.src))
            })?;
        if !rx.friend_credentials {
            return Err(MeshError::ProtocolViolation(format!(
                "0x{:04x} did not use friend credentials",
                rx.src
            )));
        }
        Ok(idx)
    }

    fn position(&self, generation: u64) -> Option<usize> {
        self.friendships
            .iter()
            .position(|f| f.generation == generation)
    }

    /// Enables or disables the Friend feature. Disabling ends every friendship.
    pub fn set_enabled(&mut self, env: &mut Env<'_>, enabled: bool) {
        if self.enabled == enabled {
            return;
        }
        info!("Friend feature {}", if enabled { "enabled" } else { "disabled" });
        self.enabled = enabled;
        if !enabled {
            while !self.friendships.is_empty() {
                self.clear_at(env, 0);
            }
        }
    }

    /// Handle a Friend Request from a prospective LPN
    ///
    /// A valid request gets a friendship record and an Offer after the
    /// criteria-dependent delay. A request naming a previous Friend also
    /// starts a Friend Clear towards it.
    ///
    /// # Arguments
    /// * `env` - Current time, subnets and the outbox
    /// * `rx` - Sender and subnet of the request
    /// * `req` - The decoded Friend Request
    ///
    /// # Returns
    /// * `Err(MeshError::ProtocolViolation)` for prohibited field values
    /// * `Err(MeshError::AddressConflict)` when the LPN's elements leave the unicast range
    /// * `Err(MeshError::ResourceExhaustion)` when the queue is too small or all slots are taken
    pub fn handle_friend_request(
        &mut self,
        env: &mut Env<'_>,
        rx: &RxContext,
        req: &FriendRequest,
    ) -> MeshResult<()> {
        if !self.enabled {
            return Err(MeshError::StateMismatch("Friend feature disabled".to_string()));
        }
        let min_queue = req.criteria.min_queue_size().ok_or_else(|| {
            MeshError::ProtocolViolation("prohibited MinQueueSizeLog 0".to_string())
        })?;
        if req.recv_delay < 0x0a {
            return Err(MeshError::ProtocolViolation(format!(
                "prohibited ReceiveDelay {}",
                req.recv_delay
            )));
        }
        if !(0x00000a..=0x34bbff).contains(&req.poll_timeout) {
            return Err(MeshError::ProtocolViolation(format!(
                "prohibited PollTimeout 0x{:06x}",
                req.poll_timeout
            )));
        }
        if req.num_elements == 0 {
            return Err(MeshError::ProtocolViolation(
                "prohibited NumElements 0".to_string(),
            ));
        }
        if !unicast_range_valid(rx.src, req.num_elements) {
            return Err(MeshError::AddressConflict {
                first: rx.src,
                count: req.num_elements,
            });
        }
        if min_queue > self.cfg.queue_size {
            return Err(MeshError::ResourceExhaustion(format!(
                "LPN 0x{:04x} needs a queue of {}, ours holds {}",
                rx.src, min_queue, self.cfg.queue_size
            )));
        }
        env.subnet(rx.net_idx)?;

        if let Some(idx) = self.find(rx.net_idx, rx.src) {
            debug!("Existing LPN 0x{:04x} re-requesting Friendship", rx.src);
            self.clear_at(env, idx);
        }
        if self.friendships.len() >= self.cfg.max_friendships {
            return Err(MeshError::ResourceExhaustion(
                "no free Friend contexts".to_string(),
            ));
        }

        let generation = self.next_generation;
        let mut frnd = Friendship {
            lpn: rx.src,
            num_elements: req.num_elements,
            net_idx: rx.net_idx,
            recv_delay: Duration::from_millis(req.recv_delay as u64),
            poll_timeout: Duration::from_millis(req.poll_timeout as u64 * 100),
            lpn_counter: req.lpn_counter,
            counter: self.next_counter,
            established: false,
            fsn: false,
            credentials: CredentialSlots::default(),
            sub_list: Vec::with_capacity(self.cfg.sub_list_size),
            sub_list_size: self.cfg.sub_list_size,
            queue: FriendQueue::new(self.cfg.queue_size),
            last: None,
            reply: None,
            pending: None,
            timer: Timer::default(),
            clear: None,
            generation,
        };
        frnd.derive_credentials(env)?;
        self.next_generation += 1;
        self.next_counter = self.next_counter.wrapping_add(1);

        frnd.reply = Some(OutboundPdu {
            net_idx: rx.net_idx,
            src: env.primary_addr(),
            dst: rx.src,
            ttl: 0,
            security: Security::Master,
            transmit: FRIEND_XMIT,
            body: OutboundBody::Control(ControlPdu::Offer(FriendOffer {
                recv_win: self.cfg.recv_win_ms,
                queue_size: self.cfg.queue_size as u8,
                sub_list_size: self.cfg.sub_list_size as u8,
                rssi: rx.rssi,
                friend_counter: frnd.counter,
            })),
        });
        frnd.pending = Some(Pending::Reply);
        let delay = offer_delay(self.cfg.recv_win_ms, rx.rssi, req.criteria);
        frnd.timer.schedule(env.now, delay);
        debug!("Offering friendship to LPN 0x{:04x} in {:?}", rx.src, delay);

        if is_unicast(req.prev_friend) && !env.is_own_element(req.prev_friend) {
            frnd.clear = Some(ClearProcedure {
                friend: req.prev_friend,
                start: env.now,
                delay: CLEAR_FIRST_DELAY,
                timer: Timer::default(),
            });
            frnd.send_clear(env);
        }

        self.friendships.push(frnd);
        Ok(())
    }

    /// Handle a Friend Poll
    ///
    /// The first Poll establishes the friendship. The answer goes out after
    /// the LPN's receive delay: the last PDU again when the FSN repeats,
    /// otherwise the next queued PDU or a Friend Update.
    ///
    /// # Returns
    /// * `Err(MeshError::StateMismatch)` for an unknown LPN or while an answer is pending
    /// * `Err(MeshError::ProtocolViolation)` without friendship credentials
    pub fn handle_poll(
        &mut self,
        env: &mut Env<'_>,
        rx: &RxContext,
        poll: &FriendPoll,
    ) -> MeshResult<()> {
        let idx = self.find(rx.net_idx, rx.src).ok_or_else(|| {
            MeshError::StateMismatch(format!("Poll from unknown LPN 0x{:04x}", rx.src))
        })?;
        if !rx.friend_credentials {
            return Err(MeshError::ProtocolViolation(
                "Friend Poll without friend credentials".to_string(),
            ));
        }
        let frnd = &mut self.friendships[idx];
        if frnd.pending.is_some() {
            return Err(MeshError::StateMismatch(
                "previous buffer not yet sent".to_string(),
            ));
        }

        if !frnd.established {
            frnd.established = true;
            info!("Friendship established with LPN 0x{:04x}", frnd.lpn);
            env.out.emit(FriendshipEvent::FriendEstablished {
                net_idx: frnd.net_idx,
                lpn: frnd.lpn,
                recv_delay: frnd.recv_delay,
                poll_timeout: frnd.poll_timeout,
            });
        }

        let resend = poll.fsn == frnd.fsn && frnd.last.is_some();
        if resend {
            debug!("Re-sending last PDU to 0x{:04x}", frnd.lpn);
        } else {
            frnd.last = None;
            frnd.fsn = poll.fsn;
        }
        frnd.pending = Some(Pending::Poll { resend });
        frnd.timer.schedule(env.now, frnd.recv_delay);

        env.out.emit(FriendshipEvent::FriendPolled {
            net_idx: frnd.net_idx,
            lpn: frnd.lpn,
            is_retry: resend,
        });
        Ok(())
    }

    /// Handle a Friend Clear for one of our LPNs, confirming it and ending
    /// the friendship when its LPN Counter is within range.
    pub fn handle_friend_clear(
        &mut self,
        env: &mut Env<'_>,
        rx: &RxContext,
        clear: &FriendClear,
    ) -> MeshResult<()> {
        let idx = self.find(rx.net_idx, clear.lpn_addr).ok_or_else(|| {
            MeshError::StateMismatch(format!(
                "Friend Clear for unknown LPN 0x{:04x}",
                clear.lpn_addr
            ))
        })?;
        let frnd = &self.friendships[idx];
        let diff = clear.lpn_counter.wrapping_sub(frnd.lpn_counter);
        if diff > 255 {
            return Err(MeshError::ProtocolViolation(format!(
                "LPN Counter out of range (old {} new {})",
                frnd.lpn_counter, clear.lpn_counter
            )));
        }

        let cfm = OutboundPdu {
            net_idx: rx.net_idx,
            src: env.primary_addr(),
            dst: rx.src,
            ttl: DEFAULT_TTL,
            security: Security::Master,
            transmit: FRIEND_XMIT,
            body: OutboundBody::Control(ControlPdu::ClearConfirm(*clear)),
        };
        env.out.send(SendOwner::Untracked, cfm);
        self.clear_at(env, idx);
        Ok(())
    }

    pub fn handle_clear_confirm(
        &mut self,
        rx: &RxContext,
        cfm: &FriendClear,
    ) -> MeshResult<()> {
        let frnd = self
            .friendships
            .iter_mut()
            .find(|f| {
                f.net_idx == rx.net_idx
                    && f.lpn == cfm.lpn_addr
                    && f.lpn_counter == cfm.lpn_counter
                    && matches!(&f.clear, Some(c) if c.friend == rx.src)
            })
            .ok_or_else(|| {
                MeshError::StateMismatch(format!(
                    "no Friend Clear pending towards 0x{:04x} for 0x{:04x}/{}",
                    rx.src, cfm.lpn_addr, cfm.lpn_counter
                ))
            })?;
        info!(
            "Friend Clear for LPN 0x{:04x} confirmed by 0x{:04x}",
            frnd.lpn, rx.src
        );
        frnd.clear = None;
        Ok(())
    }

    pub fn handle_sub_list(
        &mut self,
        env: &mut Env<'_>,
        rx: &RxContext,
        list: &FriendSubList,
        add: bool,
    ) -> MeshResult<()> {
        let idx = self.find_established(rx)?;
        let frnd = &mut self.friendships[idx];
        if frnd.pending.is_some() {
            return Err(MeshError::StateMismatch(
                "previous buffer not yet sent".to_string(),
            ));
        }

        for &addr in &list.addresses {
            if addr == ADDR_UNASSIGNED {
                continue;
            }
            if add {
                if frnd.sub_list.contains(&addr) {
                    continue;
                }
                if frnd.sub_list.len() >= frnd.sub_list_size {
                    warn!("No space in friend subscription list for 0x{:04x}", addr);
                    continue;
                }
                frnd.sub_list.push(addr);
            } else {
                frnd.sub_list.retain(|&a| a != addr);
            }
        }

        let cfm = frnd.control_to_lpn(env, ControlPdu::SubConfirm { xact: list.xact })?;
        frnd.reply = Some(cfm);
        frnd.pending = Some(Pending::Reply);
        frnd.timer.schedule(env.now, frnd.recv_delay);
        Ok(())
    }

    /// Offers a network message to every friendship it is addressed to.
    /// Returns how many friendships took it.
    pub fn enqueue(&mut self, env: &Env<'_>, net_idx: NetIdx, msg: &NetworkMessage) -> usize {
        if !self.enabled {
            return 0;
        }
        let local = env.is_own_element(msg.src);
        if msg.ttl <= 1 && !local {
            return 0;
        }
        let mut relayed = msg.clone();
        if !local {
            relayed.ttl -= 1;
        }

        let mut accepted = 0;
        let Self {
            friendships, pool, ..
        } = self;
        for frnd in friendships.iter_mut() {
            if !frnd.lpn_matches(net_idx, msg.dst) {
                continue;
            }
            match admit(frnd, pool, relayed.clone()) {
                Ok(()) => accepted += 1,
                Err(e) => debug!("Not queueing for LPN 0x{:04x}: {}", frnd.lpn, e),
            }
        }
        accepted
    }

    /// Whether a segmented message of `seg_count` segments could be buffered.
    pub fn queue_has_space(
        &self,
        net_idx: NetIdx,
        src: Address,
        dst: Address,
        seq_zero: u16,
        seg_count: usize,
    ) -> bool {
        let mut matched = false;
        for frnd in &self.friendships {
            if !frnd.lpn_matches(net_idx, dst) {
                continue;
            }
            matched = true;
            if self.pool.has_context(frnd.generation, src, seq_zero) {
                return true;
            }
            let free = frnd
                .queue
                .capacity()
                .saturating_sub(self.pool.in_flight(frnd.generation));
            if free >= seg_count {
                return true;
            }
        }
        !matched
    }

    /// Whether some established LPN is addressed by `addr`.
    pub fn friend_match(&self, net_idx: NetIdx, addr: Address) -> bool {
        self.friendships
            .iter()
            .any(|f| f.lpn_matches(net_idx, addr))
    }

    /// Remaining poll timeout of an LPN in 100 ms steps, 0 when unknown.
    pub fn lpn_poll_timeout(&self, now: Instant, lpn: Address) -> u32 {
        self.friendships
            .iter()
            .find(|f| f.established && f.lpn == lpn)
            .and_then(|f| f.timer.remaining(now))
            .map(|rem| (rem.as_millis() / 100) as u32)
            .unwrap_or(0)
    }

    /// Refreshes credentials after a key refresh or IV update and tells the
    /// affected LPNs with a Friend Update. `None` covers every subnet.
    pub fn sec_update(&mut self, env: &Env<'_>, net_idx: Option<NetIdx>) {
        let Self {
            friendships, pool, ..
        } = self;
        for frnd in friendships.iter_mut() {
            if net_idx.is_some_and(|idx| idx != frnd.net_idx) {
                continue;
            }
            if let Err(e) = frnd.derive_credentials(env) {
                warn!("Failed to refresh credentials for 0x{:04x}: {}", frnd.lpn, e);
                continue;
            }
            if !frnd.established {
                continue;
            }
            let Ok(subnet) = env.subnet(frnd.net_idx) else {
                continue;
            };
            let update = FriendUpdate {
                flags: subnet.flags(env.iv),
                iv_index: env.iv.index,
                md: false,
            };
            if frnd.queue.make_room(1, pool.in_flight(frnd.generation)) {
                frnd.queue.push(QueuedPdu::Update(update));
                debug!("Queued Friend Update for LPN 0x{:04x}", frnd.lpn);
            }
        }
    }

    /// Ends every friendship on a deleted subnet.
    pub fn clear_net_idx(&mut self, env: &mut Env<'_>, net_idx: NetIdx) {
        while let Some(idx) = self.friendships.iter().position(|f| f.net_idx == net_idx) {
            self.clear_at(env, idx);
        }
    }

    fn clear_at(&mut self, env: &mut Env<'_>, idx: usize) {
        let frnd = self.friendships.remove(idx);
        self.pool.release_owner(frnd.generation);
        if frnd.established {
            info!("Friendship with LPN 0x{:04x} terminated", frnd.lpn);
            env.out.emit(FriendshipEvent::FriendTerminated {
                net_idx: frnd.net_idx,
                lpn: frnd.lpn,
            });
        } else {
            debug!("Dropping friendship candidate 0x{:04x}", frnd.lpn);
        }
    }

    pub fn on_send_event(
        &mut self,
        env: &mut Env<'_>,
        generation: u64,
        kind: FriendSend,
        event: SendEvent,
    ) {
        let Some(idx) = self.position(generation) else {
            debug!("Ignoring send progress of a cleared friendship");
            return;
        };
        let SendEvent::Sent(result) = event else {
            return;
        };
        let frnd = &mut self.friendships[idx];
        if let Err(e) = &result {
            warn!("Send to 0x{:04x} failed: {}", frnd.lpn, e);
        }

        match kind {
            FriendSend::Reply | FriendSend::Response => {
                if frnd.pending.is_some() {
                    return;
                }
                if frnd.established {
                    frnd.timer.schedule(env.now, frnd.poll_timeout);
                } else {
                    frnd.timer.schedule(env.now, OFFER_POLL_WAIT);
                }
            }
            FriendSend::Clear => {
                if let Some(clear) = frnd.clear.as_mut() {
                    clear.timer.schedule(env.now, clear.delay);
                    clear.delay *= 2;
                }
            }
            FriendSend::ClearConfirm => {}
        }
    }

    fn fire_timer(&mut self, env: &mut Env<'_>, idx: usize) -> MeshResult<()> {
        let frnd = &mut self.friendships[idx];
        let owner = SendOwner::Friend {
            generation: frnd.generation,
            kind: FriendSend::Response,
        };

        match frnd.pending.take() {
            Some(Pending::Reply) => {
                if let Some(pdu) = frnd.reply.take() {
                    env.out.send(
                        SendOwner::Friend {
                            generation: frnd.generation,
                            kind: FriendSend::Reply,
                        },
                        pdu,
                    );
                }
            }
            Some(Pending::Poll { resend }) => {
                if !resend || frnd.last.is_none() {
                    match frnd.next_response(env) {
                        Ok(pdu) => frnd.last = Some(pdu),
                        Err(e) => {
                            // Unanswered, but the LPN must still poll in time.
                            frnd.timer.schedule(env.now, frnd.poll_timeout);
                            return Err(e);
                        }
                    }
                }
                if let Some(pdu) = frnd.last.clone() {
                    env.out.send(owner, pdu);
                }
            }
            None => {
                let (lpn, established, poll_timeout) =
                    (frnd.lpn, frnd.established, frnd.poll_timeout);
                self.clear_at(env, idx);
                if established {
                    return Err(MeshError::Timeout(format!(
                        "no Poll from LPN 0x{:04x} within {:?}",
                        lpn, poll_timeout
                    )));
                }
            }
        }
        Ok(())
    }

    fn fire_clear_timer(&mut self, env: &mut Env<'_>, idx: usize) -> MeshResult<()> {
        let frnd = &mut self.friendships[idx];
        let Some(clear) = &frnd.clear else {
            return Ok(());
        };
        if env.now.saturating_duration_since(clear.start) >= frnd.poll_timeout * 2 {
            let friend = clear.friend;
            frnd.clear = None;
            return Err(MeshError::Timeout(format!(
                "Friend Clear towards 0x{:04x} unconfirmed for LPN 0x{:04x}",
                friend, frnd.lpn
            )));
        }
        frnd.send_clear(env);
        Ok(())
    }

    /// Runs every friendship timer that is due at `env.now`
    ///
    /// Answers pending Polls, repeats Friend Clear and ends friendships
    /// whose LPN stopped polling.
    pub fn poll_timers(&mut self, env: &mut Env<'_>) {
        let generations: Vec<u64> = self.friendships.iter().map(|f| f.generation).collect();
        for generation in generations {
            if let Some(idx) = self.position(generation) {
                let due = match self.friendships[idx].clear.as_mut() {
                    Some(clear) => clear.timer.fire_if_due(env.now),
                    None => false,
                };
                if due {
                    if let Err(e) = self.fire_clear_timer(env, idx) {
                        info!("{}", e);
                    }
                }
            }
            if let Some(idx) = self.position(generation) {
                if self.friendships[idx].timer.fire_if_due(env.now) {
                    match self.fire_timer(env, idx) {
                        Err(e @ MeshError::Timeout(_)) => info!("Friendship lost: {}", e),
                        Err(e) => warn!("Unable to answer LPN: {}", e),
                        Ok(()) => {}
                    }
                }
            }
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        earliest(self.friendships.iter().map(|f| f.next_deadline()))
    }

    pub fn friendships(&self) -> Vec<FriendshipInfo> {
        self.friendships
            .iter()
            .map(|f| FriendshipInfo {
                lpn: f.lpn,
                net_idx: f.net_idx,
                established: f.established,
                queue_len: f.queue.len(),
                sub_list: f.sub_list.clone(),
                poll_timeout: f.poll_timeout,
            })
            .collect()
    }

    /// Queued PDUs of one LPN, oldest first
    pub fn queued(&self, net_idx: NetIdx, lpn: Address) -> Vec<QueuedPdu> {
        self.find(net_idx, lpn)
            .map(|idx| self.friendships[idx].queue.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn free_segment_contexts(&self) -> usize {
        self.pool.free()
    }
}
