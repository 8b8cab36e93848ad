use crate::error::{Error, Result};
use crate::models::{unicast_range_valid, Address};
use serde::Deserialize;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    pub friend: FriendConfig,
    pub lpn: LpnConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Address of the primary element
    pub primary_addr: Address,
    /// Number of elements; they occupy consecutive unicast addresses
    pub element_count: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FriendConfig {
    /// Whether the Friend feature starts enabled (default: true)
    pub enabled: bool,
    /// Number of LPNs that can be served at once (default: 2)
    pub max_friendships: usize,
    /// Friend Queue capacity per LPN, in PDUs (default: 16)
    pub queue_size: usize,
    /// Subscription list entries per LPN (default: 3)
    pub sub_list_size: usize,
    /// Segment reassembly contexts shared by all friendships (default: 4)
    pub seg_rx_contexts: usize,
    /// Receive window offered to LPNs in milliseconds (default: 255)
    pub recv_win_ms: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LpnConfig {
    /// Receive delay requested from the Friend in milliseconds (default: 100)
    pub recv_delay_ms: u8,
    /// Poll timeout requested from the Friend, in 100 ms steps (default: 300)
    pub poll_timeout: u32,
    /// Poll interval right after establishment, in 100 ms steps (default: 300)
    pub init_poll_timeout: u32,
    /// Scanning is started this early before the receive window (default: 10)
    pub scan_latency_ms: u8,
    /// Wait between failed establishment attempts in seconds (default: 8)
    pub retry_timeout_secs: u64,
    /// Minimum Friend Queue size the LPN asks for, as log2 (default: 1)
    pub min_queue_size_log: u8,
    /// RSSI factor index 0..=3 advertised in the Friend Request (default: 0)
    pub rssi_factor: u8,
    /// Receive window factor index 0..=3 advertised in the Friend Request (default: 0)
    pub recv_win_factor: u8,
    /// Group addresses the LPN can track (default: 8)
    pub group_list_size: usize,
    /// Keep scanning off while waiting for Friend Offers (default: false)
    pub establishment: bool,
    /// Start looking for a Friend automatically after this many quiet seconds
    pub auto_start_secs: Option<u64>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            primary_addr: 0x0001,
            element_count: 1,
        }
    }
}

impl Default for FriendConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_friendships: 2,
            queue_size: 16,
            sub_list_size: 3,
            seg_rx_contexts: 4,
            recv_win_ms: 255,
        }
    }
}

impl Default for LpnConfig {
    fn default() -> Self {
        Self {
            recv_delay_ms: 100,
            poll_timeout: 300,
            init_poll_timeout: 300,
            scan_latency_ms: 10,
            retry_timeout_secs: 8,
            min_queue_size_log: 1,
            rssi_factor: 0,
            recv_win_factor: 0,
            group_list_size: 8,
            establishment: false,
            auto_start_secs: None,
        }
    }
}

impl LpnConfig {
    pub fn recv_delay(&self) -> Duration {
        Duration::from_millis(self.recv_delay_ms as u64)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout as u64 * 100)
    }

    pub fn init_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.init_poll_timeout as u64 * 100)
    }

    pub fn scan_latency(&self) -> Duration {
        // Scanning can never start before the request went out.
        Duration::from_millis(self.scan_latency_ms.min(self.recv_delay_ms) as u64)
    }

    pub fn retry_timeout(&self) -> Duration {
        Duration::from_secs(self.retry_timeout_secs)
    }

    /// Criteria byte of the Friend Request
    pub fn criteria(&self) -> u8 {
        (self.min_queue_size_log & 0x07)
            | ((self.rssi_factor & 0x03) << 3)
            | ((self.recv_win_factor & 0x03) << 5)
    }
}

/// Parses decimal or `0x`-prefixed hexadecimal addresses.
fn parse_address(value: &str) -> anyhow::Result<Address> {
    let value = value.trim();
    let addr = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16)?,
        None => value.parse()?,
    };
    Ok(addr)
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let config = Config {
            node: NodeConfig {
                primary_addr: parse_address(
                    &env::var("MESH_PRIMARY_ADDR").unwrap_or_else(|_| "0x0001".to_string()),
                )?,
                element_count: env::var("MESH_ELEMENT_COUNT")
                    .unwrap_or_else(|_| "1".to_string())
                    .parse()?,
            },
            friend: FriendConfig {
                enabled: env::var("MESH_FRIEND_ENABLED")
                    .unwrap_or_else(|_| "true".to_string())
                    .parse()?,
                max_friendships: env::var("MESH_FRIEND_LPN_COUNT")
                    .unwrap_or_else(|_| "2".to_string())
                    .parse()?,
                queue_size: env::var("MESH_FRIEND_QUEUE_SIZE")
                    .unwrap_or_else(|_| "16".to_string())
                    .parse()?,
                sub_list_size: env::var("MESH_FRIEND_SUB_LIST_SIZE")
                    .unwrap_or_else(|_| "3".to_string())
                    .parse()?,
                seg_rx_contexts: env::var("MESH_FRIEND_SEG_RX")
                    .unwrap_or_else(|_| "4".to_string())
                    .parse()?,
                recv_win_ms: env::var("MESH_FRIEND_RECV_WIN_MS")
                    .unwrap_or_else(|_| "255".to_string())
                    .parse()?,
            },
            lpn: LpnConfig {
                recv_delay_ms: env::var("MESH_LPN_RECV_DELAY_MS")
                    .unwrap_or_else(|_| "100".to_string())
                    .parse()?,
                poll_timeout: env::var("MESH_LPN_POLL_TIMEOUT")
                    .unwrap_or_else(|_| "300".to_string())
                    .parse()?,
                init_poll_timeout: env::var("MESH_LPN_INIT_POLL_TIMEOUT")
                    .unwrap_or_else(|_| "300".to_string())
                    .parse()?,
                scan_latency_ms: env::var("MESH_LPN_SCAN_LATENCY_MS")
                    .unwrap_or_else(|_| "10".to_string())
                    .parse()?,
                retry_timeout_secs: env::var("MESH_LPN_RETRY_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "8".to_string())
                    .parse()?,
                min_queue_size_log: env::var("MESH_LPN_MIN_QUEUE_SIZE_LOG")
                    .unwrap_or_else(|_| "1".to_string())
                    .parse()?,
                rssi_factor: env::var("MESH_LPN_RSSI_FACTOR")
                    .unwrap_or_else(|_| "0".to_string())
                    .parse()?,
                recv_win_factor: env::var("MESH_LPN_RECV_WIN_FACTOR")
                    .unwrap_or_else(|_| "0".to_string())
                    .parse()?,
                group_list_size: env::var("MESH_LPN_GROUPS")
                    .unwrap_or_else(|_| "8".to_string())
                    .parse()?,
                establishment: env::var("MESH_LPN_ESTABLISHMENT")
                    .unwrap_or_else(|_| "false".to_string())
                    .parse()?,
                auto_start_secs: env::var("MESH_LPN_AUTO_TIMEOUT_SECS")
                    .ok()
                    .map(|v| v.parse())
                    .transpose()?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !unicast_range_valid(self.node.primary_addr, self.node.element_count) {
            return Err(Error::InvalidConfig {
                key: "MESH_PRIMARY_ADDR",
                reason: format!(
                    "0x{:04x} with {} elements leaves the unicast range",
                    self.node.primary_addr, self.node.element_count
                ),
            });
        }

        let friend = &self.friend;
        if friend.queue_size < 2 || friend.queue_size > u8::MAX as usize {
            return Err(Error::InvalidConfig {
                key: "MESH_FRIEND_QUEUE_SIZE",
                reason: format!("{} outside 2..=255", friend.queue_size),
            });
        }
        if friend.sub_list_size == 0 || friend.sub_list_size > u8::MAX as usize {
            return Err(Error::InvalidConfig {
                key: "MESH_FRIEND_SUB_LIST_SIZE",
                reason: format!("{} outside 1..=255", friend.sub_list_size),
            });
        }
        if friend.recv_win_ms == 0 {
            return Err(Error::InvalidConfig {
                key: "MESH_FRIEND_RECV_WIN_MS",
                reason: "receive window must be non-zero".to_string(),
            });
        }
        if friend.max_friendships == 0 || friend.seg_rx_contexts == 0 {
            return Err(Error::Validation(
                "Friend needs at least one friendship slot and one segment context".to_string(),
            ));
        }

        let lpn = &self.lpn;
        if lpn.recv_delay_ms < 0x0a {
            return Err(Error::InvalidConfig {
                key: "MESH_LPN_RECV_DELAY_MS",
                reason: format!("{} below the 10 ms minimum", lpn.recv_delay_ms),
            });
        }
        if !(0x00000a..=0x34bbff).contains(&lpn.poll_timeout) {
            return Err(Error::InvalidConfig {
                key: "MESH_LPN_POLL_TIMEOUT",
                reason: format!("0x{:06x} outside 0x00000a..=0x34bbff", lpn.poll_timeout),
            });
        }
        if lpn.init_poll_timeout == 0 || lpn.init_poll_timeout > lpn.poll_timeout {
            return Err(Error::InvalidConfig {
                key: "MESH_LPN_INIT_POLL_TIMEOUT",
                reason: "must be non-zero and not larger than the poll timeout".to_string(),
            });
        }
        if lpn.min_queue_size_log == 0 || lpn.min_queue_size_log > 7 {
            return Err(Error::InvalidConfig {
                key: "MESH_LPN_MIN_QUEUE_SIZE_LOG",
                reason: format!("{} outside 1..=7", lpn.min_queue_size_log),
            });
        }
        if lpn.rssi_factor > 3 || lpn.recv_win_factor > 3 {
            return Err(Error::Validation(
                "RSSI and receive window factors must be in 0..=3".to_string(),
            ));
        }
        if lpn.group_list_size == 0 {
            return Err(Error::InvalidConfig {
                key: "MESH_LPN_GROUPS",
                reason: "at least one group entry is needed".to_string(),
            });
        }

        Ok(())
    }
}
