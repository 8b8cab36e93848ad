//! Lossless air interface between a Friend and an LPN runtime, stepped in
//! virtual time.
#![allow(dead_code)]

use ble_mesh::context::{Action, FriendshipEvent, SendEvent};
use ble_mesh::message::{OutboundBody, OutboundPdu};
use ble_mesh::{MeshNodeRuntime, NetworkMessage, RxContext, Sha256CredentialManager};
use shared::config::{Config, NodeConfig};
use shared::models::{is_group, Address};
use std::time::{Duration, Instant};

pub const FRIEND: Address = 0x0001;
pub const LPN: Address = 0x0100;
pub const REMOTE: Address = 0x0042;
pub const GROUP: Address = 0xc000;

pub fn runtime(addr: Address, friend_enabled: bool, now: Instant) -> MeshNodeRuntime {
    let mut config = Config {
        node: NodeConfig {
            primary_addr: addr,
            element_count: 1,
        },
        ..Config::default()
    };
    config.friend.enabled = friend_enabled;
    let mut rt = MeshNodeRuntime::new(&config, Box::new(Sha256CredentialManager));
    rt.add_subnet(now, 0, [0x5a; 16]);
    rt
}

pub type DropRule = Box<dyn FnMut(Address, &OutboundPdu) -> bool>;

pub struct Air {
    pub now: Instant,
    pub friend: MeshNodeRuntime,
    pub lpn: MeshNodeRuntime,
    pub lpn_scanning: bool,
    /// Every PDU put on air, with its sender
    pub sent: Vec<(Address, OutboundPdu)>,
    pub events: Vec<FriendshipEvent>,
    pub drop_rule: Option<DropRule>,
}

impl Air {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            now,
            friend: runtime(FRIEND, true, now),
            lpn: runtime(LPN, false, now),
            lpn_scanning: true,
            sent: Vec::new(),
            events: Vec::new(),
            drop_rule: None,
        }
    }

    pub fn node(&mut self, addr: Address) -> &mut MeshNodeRuntime {
        if addr == FRIEND {
            &mut self.friend
        } else {
            &mut self.lpn
        }
    }

    pub fn deliver(&mut self, from: Address, pdu: &OutboundPdu) {
        let to = if from == FRIEND { LPN } else { FRIEND };
        if pdu.dst != to && !is_group(pdu.dst) {
            return;
        }
        if to == LPN && !self.lpn_scanning {
            return;
        }
        if let Some(rule) = self.drop_rule.as_mut() {
            if rule(from, pdu) {
                return;
            }
        }

        let now = self.now;
        let mut rx = RxContext {
            net_idx: pdu.net_idx,
            src: pdu.src,
            dst: pdu.dst,
            ttl: pdu.ttl,
            rssi: -40,
            friend_credentials: pdu.uses_friend_credentials(),
            new_key: false,
        };
        match &pdu.body {
            OutboundBody::Control(control) => {
                let _ = self
                    .node(to)
                    .handle_control(now, &rx, control.opcode(), &control.encode());
            }
            OutboundBody::Relayed { message, .. } => {
                rx.src = message.src;
                rx.dst = message.dst;
                let _ = self.node(to).handle_friend_data(now, &rx);
            }
        }
    }

    /// Carries out every pending action until both nodes are idle.
    pub fn settle(&mut self) {
        loop {
            let mut busy = false;
            for addr in [FRIEND, LPN] {
                let now = self.now;
                for action in self.node(addr).drain_actions() {
                    busy = true;
                    match action {
                        Action::Send { token, pdu } => {
                            self.node(addr).on_send_event(now, token, SendEvent::Started);
                            self.deliver(addr, &pdu);
                            self.sent.push((addr, pdu));
                            self.node(addr)
                                .on_send_event(now, token, SendEvent::Sent(Ok(())));
                        }
                        Action::Scan(enabled) => {
                            if addr == LPN {
                                self.lpn_scanning = enabled;
                            }
                        }
                        Action::Event(event) => self.events.push(event),
                    }
                }
            }
            if !busy {
                return;
            }
        }
    }

    pub fn run_for(&mut self, duration: Duration) {
        let end = self.now + duration;
        self.settle();
        loop {
            let next = [self.friend.next_deadline(), self.lpn.next_deadline()]
                .into_iter()
                .flatten()
                .min();
            match next {
                Some(deadline) if deadline <= end => {
                    self.now = deadline.max(self.now);
                    let now = self.now;
                    self.friend.poll_timers(now);
                    self.lpn.poll_timers(now);
                    self.settle();
                }
                _ => break,
            }
        }
        self.now = end;
    }

    pub fn establish(&mut self) {
        self.lpn.lpn_set(self.now, true).unwrap();
        self.run_for(Duration::from_secs(3));
        assert!(self.lpn.lpn_status().established);
    }

    pub fn relayed_to_lpn(&self) -> Vec<&OutboundPdu> {
        self.sent
            .iter()
            .filter(|(from, pdu)| *from == FRIEND && matches!(pdu.body, OutboundBody::Relayed { .. }))
            .map(|(_, pdu)| pdu)
            .collect()
    }
}

pub fn reading(seq: u32, dst: Address) -> NetworkMessage {
    NetworkMessage {
        src: REMOTE,
        dst,
        ttl: 5,
        seq,
        iv_index: 0,
        payload: vec![0xa0, seq as u8],
        segment: None,
    }
}
