//! Subnet key material and network-wide security state

use crate::wire::{UPDATE_FLAG_IV_UPDATE, UPDATE_FLAG_KEY_REFRESH};
use shared::models::NetIdx;

/// 128-bit network key
pub type NetKey = [u8; 16];

/// Key refresh procedure phase of a subnet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyRefreshPhase {
    #[default]
    Normal,
    /// New key distributed, old key still used for sending
    Phase1,
    /// New key used for sending, both accepted
    Phase2,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subnet {
    pub net_idx: NetIdx,
    pub net_key: NetKey,
    pub updated_key: Option<NetKey>,
    pub kr_phase: KeyRefreshPhase,
}

impl Subnet {
    pub fn new(net_idx: NetIdx, net_key: NetKey) -> Self {
        Self {
            net_idx,
            net_key,
            updated_key: None,
            kr_phase: KeyRefreshPhase::Normal,
        }
    }

    /// Key used for outgoing traffic and whether it is the refreshed one.
    pub fn tx_key(&self) -> (&NetKey, bool) {
        match (self.kr_phase, &self.updated_key) {
            (KeyRefreshPhase::Phase2, Some(key)) => (key, true),
            _ => (&self.net_key, false),
        }
    }

    /// Flags byte carried in Friend Update and secure beacons.
    pub fn flags(&self, iv: IvIndex) -> u8 {
        let mut flags = 0;
        if self.kr_phase == KeyRefreshPhase::Phase2 {
            flags |= UPDATE_FLAG_KEY_REFRESH;
        }
        if iv.update_in_progress {
            flags |= UPDATE_FLAG_IV_UPDATE;
        }
        flags
    }

    pub fn start_key_refresh(&mut self, new_key: NetKey) {
        self.updated_key = Some(new_key);
        self.kr_phase = KeyRefreshPhase::Phase1;
    }

    /// Moves to the next phase. Leaving phase 2 promotes the new key.
    pub fn advance_key_refresh(&mut self) {
        self.kr_phase = match self.kr_phase {
            KeyRefreshPhase::Normal => KeyRefreshPhase::Normal,
            KeyRefreshPhase::Phase1 => KeyRefreshPhase::Phase2,
            KeyRefreshPhase::Phase2 => {
                if let Some(key) = self.updated_key.take() {
                    self.net_key = key;
                }
                KeyRefreshPhase::Normal
            }
        };
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IvIndex {
    pub index: u32,
    pub update_in_progress: bool,
}

/// Subnet changes the friendship roles react to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubnetEvent {
    Added(NetIdx),
    Deleted(NetIdx),
    KeyRefresh(NetIdx, KeyRefreshPhase),
    IvUpdate(IvIndex),
}
