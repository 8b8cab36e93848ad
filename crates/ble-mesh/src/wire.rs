//! Transport control PDUs of the friendship protocol
//!
//! Every PDU is encoded field by field into a byte buffer; nothing depends on
//! host struct layout. Multi-byte fields are big-endian.

use shared::models::Address;
use thiserror::Error;

pub const OP_FRIEND_POLL: u8 = 0x01;
pub const OP_FRIEND_UPDATE: u8 = 0x02;
pub const OP_FRIEND_REQUEST: u8 = 0x03;
pub const OP_FRIEND_OFFER: u8 = 0x04;
pub const OP_FRIEND_CLEAR: u8 = 0x05;
pub const OP_FRIEND_CLEAR_CFM: u8 = 0x06;
pub const OP_FRIEND_SUB_ADD: u8 = 0x07;
pub const OP_FRIEND_SUB_REM: u8 = 0x08;
pub const OP_FRIEND_SUB_CFM: u8 = 0x09;

/// Addresses carried by one Subscription List Add/Remove
pub const SUB_LIST_MAX: usize = 5;

/// Update flag: key refresh phase 2 in progress
pub const UPDATE_FLAG_KEY_REFRESH: u8 = 0x01;
/// Update flag: IV update in progress
pub const UPDATE_FLAG_IV_UPDATE: u8 = 0x02;

/// Decoding failures; a PDU that fails to decode is dropped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("{pdu} too short: {actual} bytes, need {expected}")]
    TooShort {
        pdu: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("{pdu} has wrong length {actual}")]
    BadLength { pdu: &'static str, actual: usize },

    #[error("Reserved bits set in {pdu}: 0x{value:02x}")]
    ReservedBits { pdu: &'static str, value: u8 },

    #[error("Unknown control opcode 0x{0:02x}")]
    UnknownOpcode(u8),
}

fn expect_len(pdu: &'static str, data: &[u8], len: usize) -> Result<(), WireError> {
    if data.len() < len {
        return Err(WireError::TooShort {
            pdu,
            expected: len,
            actual: data.len(),
        });
    }
    if data.len() > len {
        return Err(WireError::BadLength {
            pdu,
            actual: data.len(),
        });
    }
    Ok(())
}

fn be16(data: &[u8]) -> u16 {
    u16::from_be_bytes([data[0], data[1]])
}

/// Offer delay scale factors in tenths: 1.0, 1.5, 2.0 and 2.5.
const SCALE_FACTORS: [i32; 4] = [10, 15, 20, 25];

/// Criteria byte of a Friend Request.
///
/// Bits 0-2 hold MinQueueSizeLog, bits 3-4 the RSSI factor, bits 5-6 the
/// receive window factor. Bit 7 is reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FriendCriteria {
    pub min_queue_size_log: u8,
    pub rssi_factor: u8,
    pub recv_win_factor: u8,
}

impl FriendCriteria {
    pub fn from_byte(value: u8) -> Result<Self, WireError> {
        if value & 0x80 != 0 {
            return Err(WireError::ReservedBits {
                pdu: "Friend Request criteria",
                value,
            });
        }
        Ok(Self {
            min_queue_size_log: value & 0x07,
            rssi_factor: (value >> 3) & 0x03,
            recv_win_factor: (value >> 5) & 0x03,
        })
    }

    pub fn to_byte(self) -> u8 {
        (self.min_queue_size_log & 0x07)
            | ((self.rssi_factor & 0x03) << 3)
            | ((self.recv_win_factor & 0x03) << 5)
    }

    /// Smallest Friend Queue the LPN accepts; `None` for the prohibited 0.
    pub fn min_queue_size(self) -> Option<usize> {
        match self.min_queue_size_log {
            0 => None,
            log => Some(1usize << log),
        }
    }

    pub fn rssi_scale(self) -> i32 {
        SCALE_FACTORS[self.rssi_factor as usize & 0x03]
    }

    pub fn recv_win_scale(self) -> i32 {
        SCALE_FACTORS[self.recv_win_factor as usize & 0x03]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FriendPoll {
    pub fsn: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FriendUpdate {
    pub flags: u8,
    pub iv_index: u32,
    pub md: bool,
}

impl FriendUpdate {
    pub fn key_refresh(&self) -> bool {
        self.flags & UPDATE_FLAG_KEY_REFRESH != 0
    }

    pub fn iv_update(&self) -> bool {
        self.flags & UPDATE_FLAG_IV_UPDATE != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FriendRequest {
    pub criteria: FriendCriteria,
    pub recv_delay: u8,
    /// Poll timeout in 100 ms steps (24 bits on the wire)
    pub poll_timeout: u32,
    pub prev_friend: Address,
    pub num_elements: u8,
    pub lpn_counter: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FriendOffer {
    pub recv_win: u8,
    pub queue_size: u8,
    pub sub_list_size: u8,
    pub rssi: i8,
    pub friend_counter: u16,
}

/// Body of both Friend Clear and Friend Clear Confirm
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FriendClear {
    pub lpn_addr: Address,
    pub lpn_counter: u16,
}

/// Body of Friend Subscription List Add and Remove
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FriendSubList {
    pub xact: u8,
    pub addresses: Vec<Address>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlPdu {
    Poll(FriendPoll),
    Update(FriendUpdate),
    Request(FriendRequest),
    Offer(FriendOffer),
    Clear(FriendClear),
    ClearConfirm(FriendClear),
    SubAdd(FriendSubList),
    SubRemove(FriendSubList),
    SubConfirm { xact: u8 },
}

impl ControlPdu {
    pub fn opcode(&self) -> u8 {
        match self {
            ControlPdu::Poll(_) => OP_FRIEND_POLL,
            ControlPdu::Update(_) => OP_FRIEND_UPDATE,
            ControlPdu::Request(_) => OP_FRIEND_REQUEST,
            ControlPdu::Offer(_) => OP_FRIEND_OFFER,
            ControlPdu::Clear(_) => OP_FRIEND_CLEAR,
            ControlPdu::ClearConfirm(_) => OP_FRIEND_CLEAR_CFM,
            ControlPdu::SubAdd(_) => OP_FRIEND_SUB_ADD,
            ControlPdu::SubRemove(_) => OP_FRIEND_SUB_REM,
            ControlPdu::SubConfirm { .. } => OP_FRIEND_SUB_CFM,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ControlPdu::Poll(_) => "Friend Poll",
            ControlPdu::Update(_) => "Friend Update",
            ControlPdu::Request(_) => "Friend Request",
            ControlPdu::Offer(_) => "Friend Offer",
            ControlPdu::Clear(_) => "Friend Clear",
            ControlPdu::ClearConfirm(_) => "Friend Clear Confirm",
            ControlPdu::SubAdd(_) => "Friend Subscription List Add",
            ControlPdu::SubRemove(_) => "Friend Subscription List Remove",
            ControlPdu::SubConfirm { .. } => "Friend Subscription List Confirm",
        }
    }

    /// Encodes the parameters (everything after the opcode).
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(11);
        match self {
            ControlPdu::Poll(poll) => buf.push(poll.fsn as u8),
            ControlPdu::Update(upd) => {
                buf.push(upd.flags);
                buf.extend_from_slice(&upd.iv_index.to_be_bytes());
                buf.push(upd.md as u8);
            }
            ControlPdu::Request(req) => {
                buf.push(req.criteria.to_byte());
                buf.push(req.recv_delay);
                buf.extend_from_slice(&req.poll_timeout.to_be_bytes()[1..]);
                buf.extend_from_slice(&req.prev_friend.to_be_bytes());
                buf.push(req.num_elements);
                buf.extend_from_slice(&req.lpn_counter.to_be_bytes());
            }
            ControlPdu::Offer(off) => {
                buf.push(off.recv_win);
                buf.push(off.queue_size);
                buf.push(off.sub_list_size);
                buf.push(off.rssi as u8);
                buf.extend_from_slice(&off.friend_counter.to_be_bytes());
            }
            ControlPdu::Clear(clear) | ControlPdu::ClearConfirm(clear) => {
                buf.extend_from_slice(&clear.lpn_addr.to_be_bytes());
                buf.extend_from_slice(&clear.lpn_counter.to_be_bytes());
            }
            ControlPdu::SubAdd(list) | ControlPdu::SubRemove(list) => {
                buf.push(list.xact);
                for addr in &list.addresses {
                    buf.extend_from_slice(&addr.to_be_bytes());
                }
            }
            ControlPdu::SubConfirm { xact } => buf.push(*xact),
        }
        buf
    }

    pub fn decode(opcode: u8, data: &[u8]) -> Result<Self, WireError> {
        match opcode {
            OP_FRIEND_POLL => {
                expect_len("Friend Poll", data, 1)?;
                if data[0] & !0x01 != 0 {
                    return Err(WireError::ReservedBits {
                        pdu: "Friend Poll",
                        value: data[0],
                    });
                }
                Ok(ControlPdu::Poll(FriendPoll { fsn: data[0] == 1 }))
            }
            OP_FRIEND_UPDATE => {
                expect_len("Friend Update", data, 6)?;
                Ok(ControlPdu::Update(FriendUpdate {
                    flags: data[0],
                    iv_index: u32::from_be_bytes([data[1], data[2], data[3], data[4]]),
                    md: data[5] != 0,
                }))
            }
            OP_FRIEND_REQUEST => {
                expect_len("Friend Request", data, 10)?;
                Ok(ControlPdu::Request(FriendRequest {
                    criteria: FriendCriteria::from_byte(data[0])?,
                    recv_delay: data[1],
                    poll_timeout: u32::from_be_bytes([0, data[2], data[3], data[4]]),
                    prev_friend: be16(&data[5..7]),
                    num_elements: data[7],
                    lpn_counter: be16(&data[8..10]),
                }))
            }
            OP_FRIEND_OFFER => {
                expect_len("Friend Offer", data, 6)?;
                Ok(ControlPdu::Offer(FriendOffer {
                    recv_win: data[0],
                    queue_size: data[1],
                    sub_list_size: data[2],
                    rssi: data[3] as i8,
                    friend_counter: be16(&data[4..6]),
                }))
            }
            OP_FRIEND_CLEAR | OP_FRIEND_CLEAR_CFM => {
                let name = if opcode == OP_FRIEND_CLEAR {
                    "Friend Clear"
                } else {
                    "Friend Clear Confirm"
                };
                expect_len(name, data, 4)?;
                let clear = FriendClear {
                    lpn_addr: be16(&data[0..2]),
                    lpn_counter: be16(&data[2..4]),
                };
                if opcode == OP_FRIEND_CLEAR {
                    Ok(ControlPdu::Clear(clear))
                } else {
                    Ok(ControlPdu::ClearConfirm(clear))
                }
            }
            OP_FRIEND_SUB_ADD | OP_FRIEND_SUB_REM => {
                let name = "Friend Subscription List";
                if data.len() < 3 {
                    return Err(WireError::TooShort {
                        pdu: name,
                        expected: 3,
                        actual: data.len(),
                    });
                }
                if data.len() % 2 == 0 || data.len() > 1 + 2 * SUB_LIST_MAX {
                    return Err(WireError::BadLength {
                        pdu: name,
                        actual: data.len(),
                    });
                }
                let list = FriendSubList {
                    xact: data[0],
                    addresses: data[1..].chunks_exact(2).map(be16).collect(),
                };
                if opcode == OP_FRIEND_SUB_ADD {
                    Ok(ControlPdu::SubAdd(list))
                } else {
                    Ok(ControlPdu::SubRemove(list))
                }
            }
            OP_FRIEND_SUB_CFM => {
                expect_len("Friend Subscription List Confirm", data, 1)?;
                Ok(ControlPdu::SubConfirm { xact: data[0] })
            }
            other => Err(WireError::UnknownOpcode(other)),
        }
    }
}
