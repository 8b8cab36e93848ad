//! Reliable segmented transactions of the advertising provisioning bearer
//!
//! A provisioning PDU is split into one Transaction Start and up to 63
//! Transaction Continuation segments. The receiver acknowledges a complete,
//! FCS-checked transaction; the sender repeats the whole batch every 500 ms
//! until acknowledged or until the transaction times out after 30 s.

use crate::error::{MeshError, MeshResult};
use crate::timer::Timer;
use crate::wire::WireError;
use shared::models::Transmit;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const START_PAYLOAD_MAX: usize = 20;
pub const CONT_PAYLOAD_MAX: usize = 23;
/// Highest segment index a Start can announce
pub const LAST_SEG_MAX: u8 = 0x3f;

pub const RETRANSMIT_INTERVAL: Duration = Duration::from_millis(500);
pub const TRANSACTION_TIMEOUT: Duration = Duration::from_secs(30);

pub const RELIABLE_XMIT: Transmit = Transmit::new(1, 20);
/// Acks and Link Close are not acknowledged, so they go out three times.
pub const UNRELIABLE_XMIT: Transmit = Transmit::new(3, 20);

const GPC_START: u8 = 0x00;
const GPC_ACK: u8 = 0x01;
const GPC_CONT: u8 = 0x02;
const GPC_CTL: u8 = 0x03;

pub const LINK_OPEN: u8 = 0x00;
pub const LINK_ACK: u8 = 0x01;
pub const LINK_CLOSE: u8 = 0x02;

/// Frame check sequence: CRC-8 of 3GPP TS 27.010 (polynomial 0x07, reflected).
pub fn fcs(data: &[u8]) -> u8 {
    let mut crc: u8 = 0xff;
    for byte in data {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x01 != 0 { (crc >> 1) ^ 0xe0 } else { crc >> 1 };
        }
    }
    0xff - crc
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Gpc {
    Start {
        last_seg: u8,
        total_len: u16,
        fcs: u8,
        data: Vec<u8>,
    },
    Ack,
    Continuation {
        seg_index: u8,
        data: Vec<u8>,
    },
    Control {
        op: u8,
        params: Vec<u8>,
    },
}

/// Generic Provisioning PDU inside a PB-ADV advertisement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenericPdu {
    pub link_id: u32,
    pub xact: u8,
    pub gpc: Gpc,
}

impl GenericPdu {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = self.link_id.to_be_bytes().to_vec();
        buf.push(self.xact);
        match &self.gpc {
            Gpc::Start {
                last_seg,
                total_len,
                fcs,
                data,
            } => {
                buf.push((last_seg << 2) | GPC_START);
                buf.extend_from_slice(&total_len.to_be_bytes());
                buf.push(*fcs);
                buf.extend_from_slice(data);
            }
            Gpc::Ack => buf.push(GPC_ACK),
            Gpc::Continuation { seg_index, data } => {
                buf.push((seg_index << 2) | GPC_CONT);
                buf.extend_from_slice(data);
            }
            Gpc::Control { op, params } => {
                buf.push((op << 2) | GPC_CTL);
                buf.extend_from_slice(params);
            }
        }
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        if data.len() < 6 {
            return Err(WireError::TooShort {
                pdu: "Generic Provisioning PDU",
                expected: 6,
                actual: data.len(),
            });
        }
        let link_id = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let xact = data[4];
        let gpc_byte = data[5];
        let rest = &data[6..];

        let gpc = match gpc_byte & 0x03 {
            GPC_START => {
                if rest.len() < 3 {
                    return Err(WireError::TooShort {
                        pdu: "Transaction Start",
                        expected: 9,
                        actual: data.len(),
                    });
                }
                Gpc::Start {
                    last_seg: gpc_byte >> 2,
                    total_len: u16::from_be_bytes([rest[0], rest[1]]),
                    fcs: rest[2],
                    data: rest[3..].to_vec(),
                }
            }
            GPC_ACK => {
                if gpc_byte >> 2 != 0 {
                    return Err(WireError::ReservedBits {
                        pdu: "Transaction Ack",
                        value: gpc_byte,
                    });
                }
                Gpc::Ack
            }
            GPC_CONT => Gpc::Continuation {
                seg_index: gpc_byte >> 2,
                data: rest.to_vec(),
            },
            _ => Gpc::Control {
                op: gpc_byte >> 2,
                params: rest.to_vec(),
            },
        };
        Ok(Self { link_id, xact, gpc })
    }
}

/// Why a link was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Success,
    Timeout,
    Fail,
    Unknown(u8),
}

impl CloseReason {
    pub fn from_byte(value: u8) -> Self {
        match value {
            0x00 => Self::Success,
            0x01 => Self::Timeout,
            0x02 => Self::Fail,
            other => Self::Unknown(other),
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            Self::Success => 0x00,
            Self::Timeout => 0x01,
            Self::Fail => 0x02,
            Self::Unknown(other) => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A complete provisioning PDU arrived
    Received(Vec<u8>),
    /// The peer acknowledged our transaction
    Acked { xact: u8 },
    /// Our transaction was never acknowledged
    Failed { xact: u8 },
    Closed(CloseReason),
    /// Bearer control other than Link Close, for the link establishment layer
    Control { op: u8, params: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkAction {
    Transmit {
        pdus: Vec<GenericPdu>,
        transmit: Transmit,
        reliable: bool,
    },
    Event(LinkEvent),
}

/// Next transaction number; bit 7 tells which side the number belongs to.
fn next_xact(xact: u8) -> u8 {
    (xact & 0x80) | (xact.wrapping_add(1) & 0x7f)
}

/// Number of segments needed for `total_len` bytes.
fn segment_count(total_len: usize) -> usize {
    if total_len <= START_PAYLOAD_MAX {
        1
    } else {
        1 + (total_len - START_PAYLOAD_MAX).div_ceil(CONT_PAYLOAD_MAX)
    }
}

/// Expected payload length of segment `index` of a `total_len` transaction.
fn segment_len(total_len: usize, index: usize) -> usize {
    if index == 0 {
        return total_len.min(START_PAYLOAD_MAX);
    }
    let before = START_PAYLOAD_MAX + (index - 1) * CONT_PAYLOAD_MAX;
    total_len.saturating_sub(before).min(CONT_PAYLOAD_MAX)
}

struct TxState {
    xact: u8,
    pdus: Vec<GenericPdu>,
    started: Instant,
    retransmit: Timer,
}

#[derive(Default)]
struct RxState {
    xact: Option<u8>,
    /// Announced by the Start once it arrived
    start: Option<(u8, u16, u8)>,
    received: u64,
    segments: Vec<Option<Vec<u8>>>,
}

impl RxState {
    fn reset(&mut self, xact: u8) {
        *self = RxState {
            xact: Some(xact),
            segments: vec![None; LAST_SEG_MAX as usize + 1],
            ..RxState::default()
        };
    }
}

/// One PB-ADV link with a single transaction in flight per direction.
pub struct TransactionSegmenter {
    link_id: u32,
    max_len: usize,
    tx_xact: u8,
    tx: Option<TxState>,
    rx: RxState,
    /// Last transaction delivered; only its successor is accepted as new
    rx_last: Option<u8>,
    actions: Vec<LinkAction>,
}

impl TransactionSegmenter {
    /// # Arguments
    ///
    /// * `link_id` - Link ID both sides agreed on at Link Open
    /// * `initiator` - The provisioner numbers its transactions from 0x00,
    ///   the device from 0x80
    /// * `max_len` - Largest provisioning PDU accepted in either direction
    pub fn new(link_id: u32, initiator: bool, max_len: usize) -> Self {
        let max_len = max_len.min(segment_capacity());
        Self {
            link_id,
            max_len,
            tx_xact: if initiator { 0x00 } else { 0x80 },
            tx: None,
            rx: RxState::default(),
            rx_last: None,
            actions: Vec::new(),
        }
    }

    pub fn link_id(&self) -> u32 {
        self.link_id
    }

    pub fn is_busy(&self) -> bool {
        self.tx.is_some()
    }

    pub fn drain(&mut self) -> Vec<LinkAction> {
        std::mem::take(&mut self.actions)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        let tx = self.tx.as_ref()?;
        let timeout = tx.started + TRANSACTION_TIMEOUT;
        Some(match tx.retransmit.deadline() {
            Some(retransmit) => retransmit.min(timeout),
            None => timeout,
        })
    }

    fn pdu(&self, xact: u8, gpc: Gpc) -> GenericPdu {
        GenericPdu {
            link_id: self.link_id,
            xact,
            gpc,
        }
    }

    fn transmit_unreliable(&mut self, pdu: GenericPdu) {
        self.actions.push(LinkAction::Transmit {
            pdus: vec![pdu],
            transmit: UNRELIABLE_XMIT,
            reliable: false,
        });
    }

    /// Segments `payload` into a new transaction.
    pub fn send(&mut self, now: Instant, payload: &[u8]) -> MeshResult<u8> {
        if self.tx.is_some() {
            return Err(MeshError::StateMismatch(
                "a transaction is already in flight".to_string(),
            ));
        }
        if payload.is_empty() || payload.len() > self.max_len {
            return Err(MeshError::ProtocolViolation(format!(
                "provisioning PDU of {} bytes outside 1..={}",
                payload.len(),
                self.max_len
            )));
        }

        let xact = self.tx_xact;
        let (first, rest) = payload.split_at(payload.len().min(START_PAYLOAD_MAX));
        let chunks: Vec<&[u8]> = rest.chunks(CONT_PAYLOAD_MAX).collect();
        let mut pdus = Vec::with_capacity(chunks.len() + 1);
        pdus.push(self.pdu(
            xact,
            Gpc::Start {
                last_seg: chunks.len() as u8,
                total_len: payload.len() as u16,
                fcs: fcs(payload),
                data: first.to_vec(),
            },
        ));
        for (i, chunk) in chunks.iter().enumerate() {
            pdus.push(self.pdu(
                xact,
                Gpc::Continuation {
                    seg_index: i as u8 + 1,
                    data: chunk.to_vec(),
                },
            ));
        }

        debug!(
            "Link 0x{:08x}: sending transaction 0x{:02x} in {} segments",
            self.link_id,
            xact,
            pdus.len()
        );
        self.actions.push(LinkAction::Transmit {
            pdus: pdus.clone(),
            transmit: RELIABLE_XMIT,
            reliable: true,
        });
        self.tx = Some(TxState {
            xact,
            pdus,
            started: now,
            retransmit: Timer::default(),
        });
        Ok(xact)
    }

    /// The bearer finished putting the reliable batch on air.
    pub fn on_transmit_complete(&mut self, now: Instant) {
        if let Some(tx) = self.tx.as_mut() {
            tx.retransmit.schedule(now, RETRANSMIT_INTERVAL);
        }
    }

    /// Closes the link, telling the peer why.
    pub fn close(&mut self, reason: CloseReason) {
        info!("Closing link 0x{:08x}: {:?}", self.link_id, reason);
        let pdu = self.pdu(
            0x00,
            Gpc::Control {
                op: LINK_CLOSE,
                params: vec![reason.to_byte()],
            },
        );
        self.transmit_unreliable(pdu);
        self.tx = None;
        self.rx = RxState::default();
        self.rx_last = None;
        self.actions.push(LinkAction::Event(LinkEvent::Closed(reason)));
    }

    pub fn poll_timers(&mut self, now: Instant) {
        let Some(tx) = self.tx.as_mut() else {
            return;
        };
        if now.saturating_duration_since(tx.started) >= TRANSACTION_TIMEOUT {
            let xact = tx.xact;
            warn!(
                "Link 0x{:08x}: transaction 0x{:02x} timed out",
                self.link_id, xact
            );
            self.actions.push(LinkAction::Event(LinkEvent::Failed { xact }));
            self.close(CloseReason::Timeout);
            return;
        }
        if tx.retransmit.fire_if_due(now) {
            debug!(
                "Link 0x{:08x}: retransmitting transaction 0x{:02x}",
                self.link_id, tx.xact
            );
            let pdus = tx.pdus.clone();
            self.actions.push(LinkAction::Transmit {
                pdus,
                transmit: RELIABLE_XMIT,
                reliable: true,
            });
        }
    }

    pub fn handle_pdu(&mut self, pdu: &GenericPdu) -> MeshResult<()> {
        if pdu.link_id != self.link_id {
            return Err(MeshError::StateMismatch(format!(
                "PDU for link 0x{:08x}",
                pdu.link_id
            )));
        }
        match &pdu.gpc {
            Gpc::Ack => self.handle_ack(pdu.xact),
            Gpc::Start {
                last_seg,
                total_len,
                fcs,
                data,
            } => self.handle_start(pdu.xact, *last_seg, *total_len, *fcs, data),
            Gpc::Continuation { seg_index, data } => {
                self.handle_continuation(pdu.xact, *seg_index, data)
            }
            Gpc::Control { op: LINK_CLOSE, params } => {
                let reason = params
                    .first()
                    .map(|b| CloseReason::from_byte(*b))
                    .ok_or(WireError::TooShort {
                        pdu: "Link Close",
                        expected: 7,
                        actual: 6,
                    })?;
                info!("Link 0x{:08x} closed by peer: {:?}", self.link_id, reason);
                self.tx = None;
                self.rx = RxState::default();
                self.rx_last = None;
                self.actions.push(LinkAction::Event(LinkEvent::Closed(reason)));
                Ok(())
            }
            Gpc::Control { op, params } => {
                self.actions.push(LinkAction::Event(LinkEvent::Control {
                    op: *op,
                    params: params.clone(),
                }));
                Ok(())
            }
        }
    }

    fn handle_ack(&mut self, xact: u8) -> MeshResult<()> {
        match &self.tx {
            Some(tx) if tx.xact == xact => {
                debug!("Link 0x{:08x}: transaction 0x{:02x} acked", self.link_id, xact);
                self.tx = None;
                self.tx_xact = next_xact(xact);
                self.actions.push(LinkAction::Event(LinkEvent::Acked { xact }));
                Ok(())
            }
            _ => Err(MeshError::StateMismatch(format!(
                "unexpected ack for transaction 0x{:02x}",
                xact
            ))),
        }
    }

    /// Returns false when the segment must not be reassembled: a repeat of
    /// the delivered transaction only gets a fresh ack, anything older or
    /// further ahead is dropped.
    fn rx_prepare(&mut self, xact: u8) -> bool {
        if let Some(last) = self.rx_last {
            if xact == last {
                debug!("Link 0x{:08x}: repeating ack for 0x{:02x}", self.link_id, xact);
                let ack = self.pdu(xact, Gpc::Ack);
                self.transmit_unreliable(ack);
                return false;
            }
            if xact != next_xact(last) {
                debug!(
                    "Link 0x{:08x}: ignoring transaction 0x{:02x} after 0x{:02x}",
                    self.link_id, xact, last
                );
                return false;
            }
        }
        if self.rx.xact != Some(xact) {
            self.rx.reset(xact);
        }
        true
    }

    fn handle_start(
        &mut self,
        xact: u8,
        last_seg: u8,
        total_len: u16,
        fcs: u8,
        data: &[u8],
    ) -> MeshResult<()> {
        if !self.rx_prepare(xact) {
            return Ok(());
        }
        if self.rx.start.is_some() {
            return Ok(());
        }

        let len = total_len as usize;
        if len == 0 || len > self.max_len {
            self.rx = RxState::default();
            return Err(MeshError::ProtocolViolation(format!(
                "transaction length {} outside 1..={}",
                len, self.max_len
            )));
        }
        if segment_count(len) != last_seg as usize + 1 {
            self.rx = RxState::default();
            return Err(MeshError::ProtocolViolation(format!(
                "{} bytes cannot span {} segments",
                len,
                last_seg as usize + 1
            )));
        }
        if data.len() != segment_len(len, 0) {
            self.rx = RxState::default();
            return Err(WireError::BadLength {
                pdu: "Transaction Start",
                actual: data.len(),
            }
            .into());
        }
        // Continuations that arrived early must fit the announced layout.
        let misfit = self
            .rx
            .segments
            .iter()
            .enumerate()
            .skip(1)
            .find_map(|(index, seg)| {
                let seg = seg.as_ref()?;
                (index > last_seg as usize || seg.len() != segment_len(len, index))
                    .then_some(seg.len())
            });
        if let Some(actual) = misfit {
            self.rx = RxState::default();
            return Err(WireError::BadLength {
                pdu: "Transaction Continuation",
                actual,
            }
            .into());
        }

        self.rx.start = Some((last_seg, total_len, fcs));
        self.rx.segments[0] = Some(data.to_vec());
        self.rx.received |= 1;
        self.try_complete()
    }

    fn handle_continuation(&mut self, xact: u8, seg_index: u8, data: &[u8]) -> MeshResult<()> {
        if seg_index == 0 {
            return Err(MeshError::ProtocolViolation(
                "continuation with segment index 0".to_string(),
            ));
        }
        if !self.rx_prepare(xact) {
            return Ok(());
        }
        if self.rx.received & (1 << seg_index) != 0 {
            return Ok(());
        }
        if data.is_empty() || data.len() > CONT_PAYLOAD_MAX {
            return Err(WireError::BadLength {
                pdu: "Transaction Continuation",
                actual: data.len(),
            }
            .into());
        }
        if let Some((last_seg, total_len, _)) = self.rx.start {
            if seg_index > last_seg {
                return Err(MeshError::ProtocolViolation(format!(
                    "segment {} beyond last segment {}",
                    seg_index, last_seg
                )));
            }
            let expected = segment_len(total_len as usize, seg_index as usize);
            if data.len() != expected {
                return Err(WireError::BadLength {
                    pdu: "Transaction Continuation",
                    actual: data.len(),
                }
                .into());
            }
        }

        self.rx.segments[seg_index as usize] = Some(data.to_vec());
        self.rx.received |= 1 << seg_index;
        self.try_complete()
    }

    fn try_complete(&mut self) -> MeshResult<()> {
        let Some((last_seg, total_len, expected_fcs)) = self.rx.start else {
            return Ok(());
        };
        let all = if last_seg == 63 {
            u64::MAX
        } else {
            (1u64 << (last_seg + 1)) - 1
        };
        if self.rx.received & all != all {
            return Ok(());
        }

        let mut payload = Vec::with_capacity(total_len as usize);
        for seg in self.rx.segments.iter().take(last_seg as usize + 1).flatten() {
            payload.extend_from_slice(seg);
        }
        let Some(xact) = self.rx.xact else {
            return Ok(());
        };
        if fcs(&payload) != expected_fcs {
            self.rx = RxState::default();
            return Err(MeshError::ProtocolViolation(format!(
                "FCS mismatch in transaction 0x{:02x}",
                xact
            )));
        }

        debug!(
            "Link 0x{:08x}: received transaction 0x{:02x} ({} bytes)",
            self.link_id,
            xact,
            payload.len()
        );
        self.rx = RxState::default();
        self.rx_last = Some(xact);
        let ack = self.pdu(xact, Gpc::Ack);
        self.transmit_unreliable(ack);
        self.actions.push(LinkAction::Event(LinkEvent::Received(payload)));
        Ok(())
    }
}

/// Bytes a transaction of LAST_SEG_MAX + 1 segments can carry.
fn segment_capacity() -> usize {
    START_PAYLOAD_MAX + LAST_SEG_MAX as usize * CONT_PAYLOAD_MAX
}
