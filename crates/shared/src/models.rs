use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 16-bit mesh address
pub type Address = u16;

/// Network key index
pub type NetIdx = u16;

/// Unassigned address
pub const ADDR_UNASSIGNED: Address = 0x0000;

/// All-friends fixed group address
pub const ADDR_ALL_FRIENDS: Address = 0xfffd;

pub fn is_unicast(addr: Address) -> bool {
    addr != ADDR_UNASSIGNED && addr < 0x8000
}

pub fn is_virtual(addr: Address) -> bool {
    (0x8000..0xc000).contains(&addr)
}

pub fn is_group(addr: Address) -> bool {
    addr >= 0xc000
}

/// Checks that `count` consecutive element addresses starting at `first`
/// all stay inside the unicast range.
pub fn unicast_range_valid(first: Address, count: u8) -> bool {
    if count == 0 || !is_unicast(first) {
        return false;
    }
    let last = first as u32 + count as u32 - 1;
    last < 0x8000
}

/// Radio transmission parameters: how many times a PDU is put on air and
/// the gap between the copies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transmit {
    pub count: u8,
    pub interval: Duration,
}

impl Transmit {
    pub const fn new(count: u8, interval_ms: u64) -> Self {
        Self {
            count,
            interval: Duration::from_millis(interval_ms),
        }
    }

    /// Total time the copies occupy, ignoring per-copy air time.
    pub fn span(&self) -> Duration {
        self.interval * self.count.saturating_sub(1) as u32
    }
}
