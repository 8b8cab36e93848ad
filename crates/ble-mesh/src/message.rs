//! Network-layer message shapes exchanged with the surrounding stack

use crate::credentials::FriendCredentials;
use crate::wire::ControlPdu;
use shared::models::{Address, NetIdx, Transmit};

/// TTL used for Friend Clear and Friend Clear Confirm
pub const DEFAULT_TTL: u8 = 7;

/// Position of a transport segment inside its set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentInfo {
    pub seq_zero: u16,
    pub seg_index: u8,
    /// Number of segments in the set (SegN + 1)
    pub seg_total: u8,
}

/// A network PDU the Friend may buffer for an LPN
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkMessage {
    pub src: Address,
    pub dst: Address,
    pub ttl: u8,
    pub seq: u32,
    pub iv_index: u32,
    pub payload: Vec<u8>,
    pub segment: Option<SegmentInfo>,
}

/// Reception metadata of an inbound network PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxContext {
    pub net_idx: NetIdx,
    pub src: Address,
    pub dst: Address,
    pub ttl: u8,
    pub rssi: i8,
    /// Decrypted with friendship credentials rather than the master ones
    pub friend_credentials: bool,
    /// Decrypted with the refreshed key of a key refresh procedure
    pub new_key: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Security {
    Master,
    Friend {
        credentials: FriendCredentials,
        new_key: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundBody {
    Control(ControlPdu),
    Relayed { message: NetworkMessage, more_data: bool },
}

/// Fully addressed PDU handed to the bearer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundPdu {
    pub net_idx: NetIdx,
    pub src: Address,
    pub dst: Address,
    pub ttl: u8,
    pub security: Security,
    pub transmit: Transmit,
    pub body: OutboundBody,
}

impl OutboundPdu {
    pub fn control(&self) -> Option<&ControlPdu> {
        match &self.body {
            OutboundBody::Control(pdu) => Some(pdu),
            OutboundBody::Relayed { .. } => None,
        }
    }

    pub fn uses_friend_credentials(&self) -> bool {
        matches!(self.security, Security::Friend { .. })
    }

    /// Control opcode followed by the encoded parameters, or the relayed payload.
    pub fn encode_body(&self) -> Vec<u8> {
        match &self.body {
            OutboundBody::Control(pdu) => {
                let mut buf = vec![pdu.opcode()];
                buf.extend(pdu.encode());
                buf
            }
            OutboundBody::Relayed { message, .. } => message.payload.clone(),
        }
    }
}
